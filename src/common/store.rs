//! Values this node is responsible for.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::common::Id;

#[derive(Debug, Default)]
/// Thread safe key/value store, shared between request handlers and local queries.
///
/// Guarded by a single lock independent from the [crate::common::RoutingTable] buckets.
/// Concurrent writes to the same key are last-write-wins.
pub struct LocalStore {
    values: RwLock<HashMap<Id, Id>>,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &Id) -> Option<Id> {
        self.values.read().get(key).copied()
    }

    /// Insert or overwrite the value for `key`.
    pub fn put(&self, key: Id, value: Id) {
        self.values.write().insert(key, value);
    }

    pub fn contains_key(&self, key: &Id) -> bool {
        self.values.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn put_get() {
        let store = LocalStore::new();

        assert_eq!(store.get(&Id(6)), None);

        store.put(Id(6), Id(99));
        assert_eq!(store.get(&Id(6)), Some(Id(99)));

        store.put(Id(6), Id(100));
        assert_eq!(store.get(&Id(6)), Some(Id(100)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn put_is_idempotent() {
        let store = LocalStore::new();

        store.put(Id(1), Id(2));
        store.put(Id(1), Id(2));

        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&Id(1)), Some(Id(2)));
    }

    #[test]
    fn concurrent_writers() {
        let store = Arc::new(LocalStore::new());

        let handles: Vec<_> = (0..4_u64)
            .map(|t| {
                let store = store.clone();
                thread::spawn(move || {
                    for i in 0..250 {
                        store.put(Id(t * 1000 + i), Id(i));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.len(), 1000);
        assert!(store.contains_key(&Id(3249)));
    }
}
