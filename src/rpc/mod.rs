//! K-RPC implementation: outgoing queries and the node state they share with the [Server].

mod config;
mod info;
mod socket;

use std::collections::HashSet;
use std::net::SocketAddrV4;
use std::sync::Arc;

use tracing::{debug, info};

use crate::common::{
    FindNodeRequestArguments, FindValueRequestArguments, Id, LeaveRequestArguments, LocalStore,
    Message, MessageType, Node, RequestSpecific, RequestTypeSpecific, ResponseSpecific,
    RoutingTable, StoreRequestArguments,
};
use crate::server::Server;

pub use config::{Config, LookupStrategy, DEFAULT_WORKERS};
pub use info::Info;
pub use socket::{KrpcSocket, RequestError, DEFAULT_REQUEST_TIMEOUT, READ_TIMEOUT};

#[derive(Debug)]
/// Internal Rpc called in the Dht listener and worker threads, and by [crate::Dht] methods.
pub struct Rpc {
    local: Node,
    routing_table: Arc<RoutingTable>,
    store: Arc<LocalStore>,
    server: Server,
    socket: KrpcSocket,
    lookup: LookupStrategy,
}

impl Rpc {
    /// Create a new Rpc and bind its UDP socket.
    pub fn new(config: &Config) -> Result<Self, std::io::Error> {
        let id = config.id.unwrap_or_else(Id::random);

        let socket = KrpcSocket::new(config.address, config.request_timeout)?;
        let local = Node::new(id, socket.local_addr());

        let routing_table = Arc::new(RoutingTable::new(id, config.k.max(1)));
        let store = Arc::new(LocalStore::new());

        Ok(Rpc {
            local,
            server: Server::new(routing_table.clone(), store.clone()),
            routing_table,
            store,
            socket,
            lookup: config.lookup,
        })
    }

    // === Getters ===

    /// Returns the node's Id
    pub fn id(&self) -> &Id {
        &self.local.id
    }

    /// Returns the address the server is listening to.
    #[inline]
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local.address
    }

    /// This node's own [Node] record.
    pub fn local_node(&self) -> Node {
        self.local
    }

    /// Returns a reference to the routing table.
    pub fn routing_table(&self) -> &RoutingTable {
        &self.routing_table
    }

    /// Returns a reference to the values this node is responsible for.
    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn info(&self) -> Info {
        Info::from(self)
    }

    // === Incoming requests ===

    /// Receive a single message from the socket, returning it if it is a request
    /// that should be passed to [Self::handle_request].
    pub fn recv_request(&self) -> Option<(Message, SocketAddrV4)> {
        self.socket.recv_from()
    }

    /// Answer an incoming request using the [Server].
    pub fn handle_request(&self, message: Message, from: SocketAddrV4) {
        let MessageType::Request(request) = message.message_type else {
            return;
        };

        match self.server.handle_request(from, request) {
            MessageType::Response(response) => {
                self.socket.response(from, message.transaction_id, response)
            }
            MessageType::Error(error) => self.socket.error(from, message.transaction_id, error),
            MessageType::Request(_) => {}
        }
    }

    // === Client operations ===

    /// Seed the routing table from a known node, by asking it for the nodes closest to
    /// this node's own Id.
    pub fn join(&self, bootstrap: SocketAddrV4) -> Result<(), JoinError> {
        if is_own_address(&self.local.address, &bootstrap) {
            return Err(JoinError::SelfBootstrap);
        }

        let (responder_id, nodes) = self.find_node(bootstrap, self.local.id)?;

        if responder_id == self.local.id {
            return Err(JoinError::SelfBootstrap);
        }

        info!(
            id = ?self.local.id,
            ?bootstrap,
            learned = nodes.len(),
            "Joined the network"
        );

        Ok(())
    }

    /// [Self::join] every bootstrap address, succeeding if at least one of them responded.
    pub fn join_all(&self, bootstrap: &[SocketAddrV4]) -> Result<(), JoinError> {
        let mut last_error = None;
        let mut joined = false;

        for address in bootstrap {
            match self.join(*address) {
                Ok(()) => joined = true,
                Err(error) => {
                    debug!(?address, ?error, "Failed to join bootstrap node");
                    last_error = Some(error);
                }
            }
        }

        match last_error {
            Some(error) if !joined => Err(error),
            _ => Ok(()),
        }
    }

    /// Look up the value stored for `key`, first locally, then iteratively querying
    /// nodes from the routing table with `find_value` until one of them has it,
    /// or no unvisited node is left.
    pub fn get(&self, key: Id) -> Option<Id> {
        if let Some(value) = self.store.get(&key) {
            return Some(value);
        }

        let mut visited = HashSet::new();

        while let Some(candidate) = self.next_candidate(&key, &visited) {
            visited.insert(candidate.id);

            match self.find_value(candidate.address, key) {
                Ok(FindValueResponse::Value(value)) => {
                    debug!(?key, from = ?candidate.id, visited = visited.len(), "Found value");
                    return Some(value);
                }
                Ok(FindValueResponse::Nodes(_)) => {}
                Err(error) => {
                    debug!(node = ?candidate.id, ?error, "Skipping unreachable node");
                }
            }
        }

        debug!(?key, visited = visited.len(), "Value not found");

        None
    }

    /// Store `value` at the node closest to `key` among this node and all nodes
    /// in its routing table.
    ///
    /// If the closest node is unreachable, the next closest one is tried, up to `k`
    /// failures. Returns the node that stored the value.
    pub fn put(&self, key: Id, value: Id) -> Result<Node, PutError> {
        let candidates = self
            .routing_table
            .closest_including_self(&key, self.local);

        let mut attempts = 0;

        for candidate in candidates {
            if candidate.id == self.local.id {
                self.store.put(key, value);
                debug!(?key, "Stored value locally");

                return Ok(self.local);
            }

            match self.store_at(candidate.address, key, value) {
                Ok(_) => {
                    debug!(?key, at = ?candidate.id, "Stored value remotely");

                    return Ok(candidate);
                }
                Err(error) => {
                    debug!(?key, node = ?candidate.id, ?error, "Failed to store value");
                    attempts += 1;

                    if attempts >= self.routing_table.k() {
                        break;
                    }
                }
            }
        }

        Err(PutError::Unreachable { attempts })
    }

    /// Notify every node in the routing table that this node is leaving,
    /// returning the number of nodes that acknowledged.
    pub fn leave(&self) -> usize {
        // Snapshot first, no bucket lock is held while sending requests.
        let nodes = self.routing_table.to_owned_nodes();

        let acks = nodes
            .iter()
            .filter(|node| match self.notify_leave(node.address) {
                Ok(_) => true,
                Err(error) => {
                    debug!(node = ?node.id, ?error, "Leave notification failed");
                    false
                }
            })
            .count();

        info!(id = ?self.local.id, notified = nodes.len(), acks, "Left the network");

        acks
    }

    pub fn shutdown(&self) {
        self.socket.shutdown();
    }

    pub fn is_shutdown(&self) -> bool {
        self.socket.is_shutdown()
    }

    // === Outgoing requests ===

    /// Send a `find_node` request, returning the responder's Id and the nodes it returned.
    pub fn find_node(
        &self,
        address: SocketAddrV4,
        target: Id,
    ) -> Result<(Id, Vec<Node>), RequestError> {
        match self.request(
            address,
            RequestTypeSpecific::FindNode(FindNodeRequestArguments { target }),
        )? {
            ResponseSpecific::FindNode(arguments) => {
                self.learn(&arguments.nodes);

                Ok((arguments.responder_id, arguments.nodes))
            }
            _ => Err(RequestError::UnexpectedResponse),
        }
    }

    /// Send a `find_value` request.
    pub fn find_value(
        &self,
        address: SocketAddrV4,
        key: Id,
    ) -> Result<FindValueResponse, RequestError> {
        match self.request(
            address,
            RequestTypeSpecific::FindValue(FindValueRequestArguments { target: key }),
        )? {
            ResponseSpecific::FindValue(arguments) => Ok(FindValueResponse::Value(arguments.value)),
            ResponseSpecific::FindNode(arguments) => {
                self.learn(&arguments.nodes);

                Ok(FindValueResponse::Nodes(arguments.nodes))
            }
            ResponseSpecific::Ack(_) => Err(RequestError::UnexpectedResponse),
        }
    }

    /// Send a `store` request, returning the responder's Id.
    pub fn store_at(&self, address: SocketAddrV4, key: Id, value: Id) -> Result<Id, RequestError> {
        match self.request(
            address,
            RequestTypeSpecific::Store(StoreRequestArguments { key, value }),
        )? {
            ResponseSpecific::Ack(arguments) => Ok(arguments.responder_id),
            _ => Err(RequestError::UnexpectedResponse),
        }
    }

    /// Send a `leave` request announcing this node's departure, returning the responder's Id.
    pub fn notify_leave(&self, address: SocketAddrV4) -> Result<Id, RequestError> {
        match self.request(
            address,
            RequestTypeSpecific::Leave(LeaveRequestArguments {
                target: self.local.id,
            }),
        )? {
            ResponseSpecific::Ack(arguments) => Ok(arguments.responder_id),
            _ => Err(RequestError::UnexpectedResponse),
        }
    }

    // === Private Methods ===

    /// Send a request and refresh the routing table with the responder.
    fn request(
        &self,
        address: SocketAddrV4,
        request_type: RequestTypeSpecific,
    ) -> Result<ResponseSpecific, RequestError> {
        let response = self.socket.request(
            address,
            RequestSpecific {
                requester_id: self.local.id,
                request_type,
            },
        )?;

        let responder_id = match &response {
            ResponseSpecific::FindNode(arguments) => arguments.responder_id,
            ResponseSpecific::FindValue(arguments) => arguments.responder_id,
            ResponseSpecific::Ack(arguments) => arguments.responder_id,
        };

        self.routing_table.refresh(Node::new(responder_id, address));

        Ok(response)
    }

    fn learn(&self, nodes: &[Node]) {
        for node in nodes {
            self.routing_table.refresh(*node);
        }
    }

    fn next_candidate(&self, key: &Id, visited: &HashSet<Id>) -> Option<Node> {
        let known = match self.lookup {
            LookupStrategy::Nearest => self.routing_table.k_closest_known(key, usize::MAX),
            LookupStrategy::Cached => self.routing_table.some_known(self.routing_table.k()),
        };

        known.into_iter().find(|node| !visited.contains(&node.id))
    }
}

#[derive(Debug, Clone, PartialEq)]
/// Response to a `find_value` request.
pub enum FindValueResponse {
    /// The responder holds the value.
    Value(Id),
    /// The responder doesn't hold the value, and returned the closest nodes it knows.
    Nodes(Vec<Node>),
}

#[derive(thiserror::Error, Debug)]
/// Put errors
pub enum PutError {
    /// Every candidate node tried failed to store the value.
    #[error("Failed to store the value after {attempts} unreachable nodes")]
    Unreachable { attempts: usize },
}

#[derive(thiserror::Error, Debug)]
/// Join errors
pub enum JoinError {
    /// The bootstrap node is this node.
    #[error("Can not bootstrap from this node's own address")]
    SelfBootstrap,

    /// The bootstrap node did not respond properly.
    #[error(transparent)]
    Request(#[from] RequestError),
}

// An unspecified local ip matches any ip on the same port.
fn is_own_address(local: &SocketAddrV4, address: &SocketAddrV4) -> bool {
    local.port() == address.port()
        && (local.ip() == address.ip()
            || (local.ip().is_unspecified()
                && (address.ip().is_loopback() || address.ip().is_unspecified())))
}
