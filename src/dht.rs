//! Dht node.

use std::{
    net::SocketAddrV4,
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::{
    common::{Id, Message, Node, RoutingTable},
    rpc::{Config, Info, JoinError, LookupStrategy, PutError, Rpc},
};

#[derive(Debug, Clone)]
/// Kademlia Dht node.
///
/// Cloning is cheap, all clones share the same node. The node shuts down when
/// [Dht::shutdown] is called, or when the last clone is dropped.
pub struct Dht(Arc<Inner>);

#[derive(Debug)]
struct Inner {
    rpc: Arc<Rpc>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Debug, Default, Clone)]
/// A builder for the [Dht] node.
pub struct DhtBuilder(Config);

impl DhtBuilder {
    /// Set this node's Id, otherwise a random one is used.
    pub fn id(mut self, id: Id) -> Self {
        self.0.id = Some(id);

        self
    }

    /// Set the address to bind the UDP socket to.
    pub fn address(mut self, address: SocketAddrV4) -> Self {
        self.0.address = address;

        self
    }

    /// Set the bucket capacity `k`.
    pub fn k(mut self, k: usize) -> Self {
        self.0.k = k;

        self
    }

    /// Set the timeout of outgoing requests.
    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.0.request_timeout = request_timeout;

        self
    }

    /// Set the number of threads handling incoming requests.
    pub fn workers(mut self, workers: usize) -> Self {
        self.0.workers = workers;

        self
    }

    /// Set the candidate selection policy of [Dht::get].
    pub fn lookup(mut self, lookup: LookupStrategy) -> Self {
        self.0.lookup = lookup;

        self
    }

    /// Set the nodes to join when the node starts.
    pub fn bootstrap(mut self, bootstrap: &[SocketAddrV4]) -> Self {
        self.0.bootstrap = bootstrap.to_vec();

        self
    }

    /// Create a Dht node, and join the bootstrap nodes if any.
    pub fn build(self) -> Result<Dht, BuildError> {
        Dht::new(self.0)
    }
}

impl Dht {
    /// Create a new Dht node with the given [Config].
    ///
    /// Spawns a listener thread and [Config::workers] request handling threads,
    /// then joins [Config::bootstrap] if it is not empty.
    pub fn new(config: Config) -> Result<Self, BuildError> {
        let rpc = Arc::new(Rpc::new(&config)?);

        let (sender, receiver) = flume::unbounded::<(Message, SocketAddrV4)>();

        let mut handles = Vec::with_capacity(config.workers + 1);

        for index in 0..config.workers.max(1) {
            let rpc = rpc.clone();
            let receiver = receiver.clone();

            handles.push(
                thread::Builder::new()
                    .name(format!("kadht-worker-{index}"))
                    .spawn(move || {
                        while let Ok((message, from)) = receiver.recv() {
                            rpc.handle_request(message, from);
                        }
                    })?,
            );
        }

        let listener_rpc = rpc.clone();
        handles.push(
            thread::Builder::new()
                .name("kadht-listener".to_string())
                .spawn(move || run(listener_rpc, sender))?,
        );

        info!(id = ?rpc.id(), local_addr = ?rpc.local_addr(), "Dht node started");

        let dht = Dht(Arc::new(Inner {
            rpc,
            handles: Mutex::new(handles),
        }));

        if !config.bootstrap.is_empty() {
            dht.0.rpc.join_all(&config.bootstrap)?;
        }

        Ok(dht)
    }

    /// Returns a builder to edit settings before creating a Dht node.
    pub fn builder() -> DhtBuilder {
        DhtBuilder::default()
    }

    // === Getters ===

    /// Information and statistics about this node.
    pub fn info(&self) -> Info {
        self.0.rpc.info()
    }

    pub fn id(&self) -> Id {
        *self.0.rpc.id()
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.0.rpc.local_addr()
    }

    /// This node's own [Node] record.
    pub fn node(&self) -> Node {
        self.0.rpc.local_node()
    }

    /// The routing table, shared with the threads handling incoming requests.
    pub fn routing_table(&self) -> &RoutingTable {
        self.0.rpc.routing_table()
    }

    // === Public Methods ===

    /// Seed the routing table from the node at `bootstrap`.
    pub fn join(&self, bootstrap: SocketAddrV4) -> Result<(), JoinError> {
        self.0.rpc.join(bootstrap)
    }

    /// Get the value stored for `key`, or None if no reachable node has it.
    pub fn get(&self, key: Id) -> Option<Id> {
        self.0.rpc.get(key)
    }

    /// Store `value` for `key` at the closest node known to this node,
    /// returning the node that stored it.
    pub fn put(&self, key: Id, value: Id) -> Result<Node, PutError> {
        self.0.rpc.put(key, value)
    }

    /// Announce this node's departure to every node in its routing table,
    /// returning the number of acknowledgements.
    ///
    /// The node keeps running until [Dht::shutdown], values it stored are not
    /// handed over to other nodes.
    pub fn leave(&self) -> usize {
        self.0.rpc.leave()
    }

    /// Stop the listener and request handling threads, and wait for them to exit.
    ///
    /// Requests made after shutdown fail with [crate::rpc::RequestError::Shutdown].
    pub fn shutdown(&self) {
        self.0.shutdown();
    }
}

impl Inner {
    fn shutdown(&self) {
        if self.rpc.is_shutdown() {
            return;
        }

        self.rpc.shutdown();

        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }

        info!(id = ?self.rpc.id(), "Dht node shutdown");
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(rpc: Arc<Rpc>, sender: flume::Sender<(Message, SocketAddrV4)>) {
    while !rpc.is_shutdown() {
        if let Some((message, from)) = rpc.recv_request() {
            if sender.send((message, from)).is_err() {
                break;
            }
        }
    }

    debug!(id = ?rpc.id(), "Listener stopped");
}

#[derive(thiserror::Error, Debug)]
/// Failure to create a [Dht] node.
pub enum BuildError {
    /// Failed to bind the socket or spawn threads.
    #[error(transparent)]
    IO(#[from] std::io::Error),

    /// None of the bootstrap nodes could be joined.
    #[error(transparent)]
    Join(#[from] JoinError),
}

/// Create a testnet of Dht nodes on the loopback interface, to run tests
/// and examples without the need for an existing network.
#[derive(Debug)]
pub struct Testnet {
    pub bootstrap: Vec<SocketAddrV4>,
    pub nodes: Vec<Dht>,
}

impl Testnet {
    /// Create `count` nodes with random ids, all of them joining the first node.
    pub fn new(count: usize) -> Result<Testnet, BuildError> {
        let ids: Vec<Id> = (0..count).map(|_| Id::random()).collect();

        Testnet::builder().build(&ids)
    }

    pub fn builder() -> TestnetBuilder {
        TestnetBuilder::default()
    }
}

#[derive(Debug, Clone)]
/// Settings shared by every node of a [Testnet].
pub struct TestnetBuilder(DhtBuilder);

impl Default for TestnetBuilder {
    fn default() -> Self {
        Self(Dht::builder().address(SocketAddrV4::new([127, 0, 0, 1].into(), 0)))
    }
}

impl TestnetBuilder {
    pub fn k(self, k: usize) -> Self {
        Self(self.0.k(k))
    }

    pub fn request_timeout(self, request_timeout: Duration) -> Self {
        Self(self.0.request_timeout(request_timeout))
    }

    pub fn lookup(self, lookup: LookupStrategy) -> Self {
        Self(self.0.lookup(lookup))
    }

    /// Create one node per id, in order, every node after the first joining the first one.
    pub fn build(self, ids: &[Id]) -> Result<Testnet, BuildError> {
        let mut nodes: Vec<Dht> = Vec::with_capacity(ids.len());
        let mut bootstrap = vec![];

        for id in ids {
            let node = self.0.clone().id(*id).bootstrap(&bootstrap).build()?;

            if bootstrap.is_empty() {
                bootstrap.push(node.local_addr());
            }

            nodes.push(node);
        }

        Ok(Testnet { bootstrap, nodes })
    }
}

#[cfg(test)]
mod test {
    use crate::rpc::RequestError;

    use super::*;

    #[test]
    fn shutdown() {
        let dht = Dht::builder()
            .address(SocketAddrV4::new([127, 0, 0, 1].into(), 0))
            .build()
            .unwrap();

        let clone = dht.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));

            clone.shutdown();
        });

        handle.join().unwrap();

        assert!(dht.0.handles.lock().is_empty());
        assert!(matches!(
            dht.0.rpc.find_node(dht.local_addr(), Id::random()),
            Err(RequestError::Shutdown)
        ));
    }

    #[test]
    fn bind_to_address() {
        let dht = Dht::builder()
            .address(SocketAddrV4::new([127, 0, 0, 1].into(), 0))
            .k(3)
            .build()
            .unwrap();

        let info = dht.info();

        assert_eq!(info.local_addr().ip(), &std::net::Ipv4Addr::LOCALHOST);
        assert_ne!(info.local_addr().port(), 0);
        assert_eq!(info.k(), 3);
        assert_eq!(info.routing_table_size(), 0);
    }

    #[test]
    fn bootstrap_failure() {
        let unreachable = Dht::builder()
            .address(SocketAddrV4::new([127, 0, 0, 1].into(), 0))
            .build()
            .unwrap();
        let address = unreachable.local_addr();
        unreachable.shutdown();

        let result = Dht::builder()
            .address(SocketAddrV4::new([127, 0, 0, 1].into(), 0))
            .request_timeout(Duration::from_millis(100))
            .bootstrap(&[address])
            .build();

        assert!(matches!(
            result,
            Err(BuildError::Join(JoinError::Request(RequestError::Timeout)))
        ));
    }

    #[test]
    fn testnet_join() {
        let testnet = Testnet::new(5).unwrap();

        let first = &testnet.nodes[0];

        assert_eq!(testnet.bootstrap, vec![first.local_addr()]);
        // Random ids may share buckets, so some of them could have been evicted.
        let size = first.info().routing_table_size();
        assert!((1..=4).contains(&size));

        for node in &testnet.nodes[1..] {
            assert!(node.routing_table().contains(&first.id()));
        }
    }
}
