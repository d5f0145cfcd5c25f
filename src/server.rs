//! Handlers for incoming requests.

use std::{net::SocketAddrV4, sync::Arc};

use tracing::debug;

use crate::common::{
    AckResponseArguments, FindNodeRequestArguments, FindNodeResponseArguments,
    FindValueRequestArguments, FindValueResponseArguments, Id, LeaveRequestArguments, LocalStore,
    MessageType, Node, RequestSpecific, RequestTypeSpecific, ResponseSpecific, RoutingTable,
    StoreRequestArguments,
};

#[derive(Debug, Clone)]
/// Dht server answering `find_node`, `find_value`, `store` and `leave` requests.
///
/// Shares the routing table and the local store with the client side of the node,
/// and can be called from many threads at once.
pub struct Server {
    routing_table: Arc<RoutingTable>,
    store: Arc<LocalStore>,
}

impl Server {
    pub fn new(routing_table: Arc<RoutingTable>, store: Arc<LocalStore>) -> Self {
        Self {
            routing_table,
            store,
        }
    }

    /// Handle an incoming request, returning the [MessageType::Response] to send back.
    ///
    /// `from` is the UDP source of the request, which is also the address the
    /// requester listens on, so the requester is refreshed in the routing table
    /// once the request is handled. A node announcing its own departure is
    /// not added back.
    pub fn handle_request(&self, from: SocketAddrV4, request: RequestSpecific) -> MessageType {
        let requester_id = request.requester_id;

        let response = match request.request_type {
            RequestTypeSpecific::FindNode(FindNodeRequestArguments { target }) => {
                ResponseSpecific::FindNode(self.find_node(target))
            }
            RequestTypeSpecific::FindValue(FindValueRequestArguments { target }) => {
                self.find_value(target)
            }
            RequestTypeSpecific::Store(StoreRequestArguments { key, value }) => {
                ResponseSpecific::Ack(self.store(key, value))
            }
            RequestTypeSpecific::Leave(LeaveRequestArguments { target }) => {
                let ack = self.leave(target);

                if target == requester_id {
                    return MessageType::Response(ResponseSpecific::Ack(ack));
                }

                ResponseSpecific::Ack(ack)
            }
        };

        self.routing_table.refresh(Node::new(requester_id, from));

        MessageType::Response(response)
    }

    /// Up to `k` known nodes closest to the `target`.
    pub fn find_node(&self, target: Id) -> FindNodeResponseArguments {
        FindNodeResponseArguments {
            responder_id: *self.routing_table.id(),
            nodes: self
                .routing_table
                .k_closest_known(&target, self.routing_table.k()),
        }
    }

    /// The stored value if any, otherwise the same as [Self::find_node].
    pub fn find_value(&self, key: Id) -> ResponseSpecific {
        match self.store.get(&key) {
            Some(value) => ResponseSpecific::FindValue(FindValueResponseArguments {
                responder_id: *self.routing_table.id(),
                value,
            }),
            None => ResponseSpecific::FindNode(self.find_node(key)),
        }
    }

    pub fn store(&self, key: Id, value: Id) -> AckResponseArguments {
        self.store.put(key, value);

        AckResponseArguments {
            responder_id: *self.routing_table.id(),
        }
    }

    pub fn leave(&self, departing: Id) -> AckResponseArguments {
        if self.routing_table.remove(&departing) {
            debug!(?departing, "Removed departing node");
        }

        AckResponseArguments {
            responder_id: *self.routing_table.id(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn server(id: u64) -> Server {
        Server::new(
            Arc::new(RoutingTable::new(Id(id), 2)),
            Arc::new(LocalStore::new()),
        )
    }

    fn request(requester: u64, request_type: RequestTypeSpecific) -> RequestSpecific {
        RequestSpecific {
            requester_id: Id(requester),
            request_type,
        }
    }

    #[test]
    fn find_node_refreshes_requester() {
        let server = server(1);
        let from = Node::with_id(3).address;

        let response = server.handle_request(
            from,
            request(
                3,
                RequestTypeSpecific::FindNode(FindNodeRequestArguments { target: Id(3) }),
            ),
        );

        // Requester is only added after the response is computed.
        assert_eq!(
            response,
            MessageType::Response(ResponseSpecific::FindNode(FindNodeResponseArguments {
                responder_id: Id(1),
                nodes: vec![]
            }))
        );
        assert!(server.routing_table.contains(&Id(3)));
        assert_eq!(server.routing_table.bucket(1)[0].address, from);
    }

    #[test]
    fn find_value_miss_returns_k_closest_sorted() {
        let server = server(1);

        for id in [3, 5, 7] {
            server.routing_table.refresh(Node::with_id(id));
        }

        let response = server.find_value(Id(6));

        assert_eq!(
            response,
            ResponseSpecific::FindNode(FindNodeResponseArguments {
                responder_id: Id(1),
                nodes: vec![Node::with_id(7), Node::with_id(5)],
            })
        );
    }

    #[test]
    fn store_then_find_value() {
        let server = server(7);

        let ack = server.handle_request(
            Node::with_id(3).address,
            request(
                3,
                RequestTypeSpecific::Store(StoreRequestArguments {
                    key: Id(6),
                    value: Id(99),
                }),
            ),
        );

        assert_eq!(
            ack,
            MessageType::Response(ResponseSpecific::Ack(AckResponseArguments {
                responder_id: Id(7)
            }))
        );

        assert_eq!(
            server.find_value(Id(6)),
            ResponseSpecific::FindValue(FindValueResponseArguments {
                responder_id: Id(7),
                value: Id(99),
            })
        );
    }

    #[test]
    fn store_is_idempotent() {
        let server = server(7);

        server.store(Id(6), Id(99));
        server.store(Id(6), Id(99));

        assert_eq!(server.store.len(), 1);
        assert_eq!(server.store.get(&Id(6)), Some(Id(99)));
    }

    #[test]
    fn leave_removes_departing_node() {
        let server = server(1);

        for id in [3, 5] {
            server.routing_table.refresh(Node::with_id(id));
        }

        server.handle_request(
            Node::with_id(3).address,
            request(
                3,
                RequestTypeSpecific::Leave(LeaveRequestArguments { target: Id(3) }),
            ),
        );

        assert!(!server.routing_table.contains(&Id(3)));
        assert!(server.routing_table.contains(&Id(5)));
    }

    #[test]
    fn leave_on_behalf_of_another_node() {
        let server = server(1);

        server.routing_table.refresh(Node::with_id(5));

        server.handle_request(
            Node::with_id(3).address,
            request(
                3,
                RequestTypeSpecific::Leave(LeaveRequestArguments { target: Id(5) }),
            ),
        );

        assert!(!server.routing_table.contains(&Id(5)));
        assert!(server.routing_table.contains(&Id(3)));
    }
}
