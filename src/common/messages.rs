//! Serialize and deserialize Krpc messages.

mod internal;

use std::net::{Ipv4Addr, SocketAddrV4};

use crate::common::{Id, Node, ID_SIZE};
use crate::{Error, Result};

/// Size of a node in the compact node info format: id, ipv4 and port.
pub const COMPACT_NODE_SIZE: usize = ID_SIZE + 6;

/// Malformed packet, invalid arguments or bad identifier sizes.
pub const PROTOCOL_ERROR: i32 = 203;
/// Method unknown.
pub const METHOD_UNKNOWN: i32 = 204;

#[derive(Debug, PartialEq, Clone)]
pub struct Message {
    pub transaction_id: u16,

    /// The version of the requester or responder.
    pub version: Option<Vec<u8>>,

    pub message_type: MessageType,
}

#[derive(Debug, PartialEq, Clone)]
pub enum MessageType {
    Request(RequestSpecific),

    Response(ResponseSpecific),

    Error(ErrorSpecific),
}

#[derive(Debug, PartialEq, Clone)]
pub struct ErrorSpecific {
    pub code: i32,
    pub description: String,
}

#[derive(Debug, PartialEq, Clone)]
pub struct RequestSpecific {
    pub requester_id: Id,
    pub request_type: RequestTypeSpecific,
}

#[derive(Debug, PartialEq, Clone)]
pub enum RequestTypeSpecific {
    FindNode(FindNodeRequestArguments),
    FindValue(FindValueRequestArguments),
    Store(StoreRequestArguments),
    Leave(LeaveRequestArguments),
}

#[derive(Debug, PartialEq, Clone)]
pub enum ResponseSpecific {
    FindNode(FindNodeResponseArguments),
    FindValue(FindValueResponseArguments),
    Ack(AckResponseArguments),
}

// === FIND_NODE ===

#[derive(Debug, PartialEq, Clone)]
pub struct FindNodeRequestArguments {
    pub target: Id,
}

/// Also sent in response to [FindValueRequestArguments] if the value is not found.
#[derive(Debug, PartialEq, Clone)]
pub struct FindNodeResponseArguments {
    pub responder_id: Id,
    pub nodes: Vec<Node>,
}

// === FIND_VALUE ===

#[derive(Debug, PartialEq, Clone)]
pub struct FindValueRequestArguments {
    pub target: Id,
}

#[derive(Debug, PartialEq, Clone)]
pub struct FindValueResponseArguments {
    pub responder_id: Id,
    pub value: Id,
}

// === STORE ===

#[derive(Debug, PartialEq, Clone)]
pub struct StoreRequestArguments {
    pub key: Id,
    pub value: Id,
}

// === LEAVE ===

#[derive(Debug, PartialEq, Clone)]
pub struct LeaveRequestArguments {
    /// The departing node.
    pub target: Id,
}

// === ACK ===

/// Acknowledges a [StoreRequestArguments] or a [LeaveRequestArguments].
#[derive(Debug, PartialEq, Clone)]
pub struct AckResponseArguments {
    pub responder_id: Id,
}

impl ErrorSpecific {
    pub fn protocol_error(description: impl Into<String>) -> Self {
        Self {
            code: PROTOCOL_ERROR,
            description: description.into(),
        }
    }

    pub fn method_unknown() -> Self {
        Self {
            code: METHOD_UNKNOWN,
            description: "Method Unknown".to_string(),
        }
    }
}

impl Message {
    fn into_serde_message(self) -> internal::DHTMessage {
        internal::DHTMessage {
            transaction_id: self.transaction_id.to_be_bytes().to_vec(),
            version: self.version,
            variant: match self.message_type {
                MessageType::Request(RequestSpecific {
                    requester_id,
                    request_type,
                }) => internal::DHTMessageVariant::Request(match request_type {
                    RequestTypeSpecific::FindNode(find_node_args) => {
                        internal::DHTRequestSpecific::FindNode {
                            arguments: internal::DHTFindNodeRequestArguments {
                                id: requester_id.to_vec(),
                                target: find_node_args.target.to_vec(),
                            },
                        }
                    }
                    RequestTypeSpecific::FindValue(find_value_args) => {
                        internal::DHTRequestSpecific::FindValue {
                            arguments: internal::DHTFindValueRequestArguments {
                                id: requester_id.to_vec(),
                                target: find_value_args.target.to_vec(),
                            },
                        }
                    }
                    RequestTypeSpecific::Store(store_args) => internal::DHTRequestSpecific::Store {
                        arguments: internal::DHTStoreRequestArguments {
                            id: requester_id.to_vec(),
                            key: store_args.key.to_vec(),
                            v: store_args.value.to_vec(),
                        },
                    },
                    RequestTypeSpecific::Leave(leave_args) => internal::DHTRequestSpecific::Leave {
                        arguments: internal::DHTLeaveRequestArguments {
                            id: requester_id.to_vec(),
                            target: leave_args.target.to_vec(),
                        },
                    },
                }),

                MessageType::Response(res) => internal::DHTMessageVariant::Response(match res {
                    ResponseSpecific::FindNode(find_node_args) => {
                        internal::DHTResponseSpecific::FindNode {
                            arguments: internal::DHTFindNodeResponseArguments {
                                id: find_node_args.responder_id.to_vec(),
                                nodes: nodes4_to_bytes(&find_node_args.nodes),
                            },
                        }
                    }
                    ResponseSpecific::FindValue(find_value_args) => {
                        internal::DHTResponseSpecific::FindValue {
                            arguments: internal::DHTFindValueResponseArguments {
                                id: find_value_args.responder_id.to_vec(),
                                v: find_value_args.value.to_vec(),
                            },
                        }
                    }
                    ResponseSpecific::Ack(ack_args) => internal::DHTResponseSpecific::Ack {
                        arguments: internal::DHTAckResponseArguments {
                            id: ack_args.responder_id.to_vec(),
                        },
                    },
                }),

                MessageType::Error(err) => {
                    internal::DHTMessageVariant::Error(internal::DHTErrorSpecific {
                        error_info: (err.code, err.description),
                    })
                }
            },
        }
    }

    fn from_serde_message(msg: internal::DHTMessage) -> Result<Message> {
        Ok(Message {
            transaction_id: transaction_id(msg.transaction_id)?,
            version: msg.version,
            message_type: match msg.variant {
                internal::DHTMessageVariant::Request(req_variant) => {
                    MessageType::Request(match req_variant {
                        internal::DHTRequestSpecific::FindNode { arguments } => RequestSpecific {
                            requester_id: Id::from_bytes(arguments.id)?,
                            request_type: RequestTypeSpecific::FindNode(FindNodeRequestArguments {
                                target: Id::from_bytes(arguments.target)?,
                            }),
                        },
                        internal::DHTRequestSpecific::FindValue { arguments } => RequestSpecific {
                            requester_id: Id::from_bytes(arguments.id)?,
                            request_type: RequestTypeSpecific::FindValue(
                                FindValueRequestArguments {
                                    target: Id::from_bytes(arguments.target)?,
                                },
                            ),
                        },
                        internal::DHTRequestSpecific::Store { arguments } => RequestSpecific {
                            requester_id: Id::from_bytes(arguments.id)?,
                            request_type: RequestTypeSpecific::Store(StoreRequestArguments {
                                key: Id::from_bytes(arguments.key)?,
                                value: Id::from_bytes(arguments.v)?,
                            }),
                        },
                        internal::DHTRequestSpecific::Leave { arguments } => RequestSpecific {
                            requester_id: Id::from_bytes(arguments.id)?,
                            request_type: RequestTypeSpecific::Leave(LeaveRequestArguments {
                                target: Id::from_bytes(arguments.target)?,
                            }),
                        },
                    })
                }

                internal::DHTMessageVariant::Response(res_variant) => {
                    MessageType::Response(match res_variant {
                        internal::DHTResponseSpecific::FindNode { arguments } => {
                            ResponseSpecific::FindNode(FindNodeResponseArguments {
                                responder_id: Id::from_bytes(arguments.id)?,
                                nodes: bytes_to_nodes4(&arguments.nodes)?,
                            })
                        }
                        internal::DHTResponseSpecific::FindValue { arguments } => {
                            ResponseSpecific::FindValue(FindValueResponseArguments {
                                responder_id: Id::from_bytes(arguments.id)?,
                                value: Id::from_bytes(arguments.v)?,
                            })
                        }
                        internal::DHTResponseSpecific::Ack { arguments } => {
                            ResponseSpecific::Ack(AckResponseArguments {
                                responder_id: Id::from_bytes(arguments.id)?,
                            })
                        }
                    })
                }

                internal::DHTMessageVariant::Error(err) => MessageType::Error(ErrorSpecific {
                    code: err.error_info.0,
                    description: err.error_info.1,
                }),
            },
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.clone().into_serde_message().to_bytes()?)
    }

    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Message> {
        Message::from_serde_message(internal::DHTMessage::from_bytes(bytes.as_ref())?)
    }
}

/// Inspect bytes that failed to decode as a [Message], and if they look like a request,
/// return its transaction_id and the error to reply with.
///
/// Responses and errors that fail to decode are dropped silently.
pub fn reject_malformed(bytes: &[u8], error: &Error) -> Option<(u16, ErrorSpecific)> {
    let header = internal::DHTMessageHeader::from_bytes(bytes).ok()?;

    if header.message_type != "q" {
        return None;
    }

    let tid = transaction_id(header.transaction_id).ok()?;

    let known_method = header
        .method
        .as_deref()
        .map(|method| internal::METHODS.contains(&method))
        .unwrap_or(false);

    if known_method {
        Some((tid, ErrorSpecific::protocol_error(error.to_string())))
    } else {
        Some((tid, ErrorSpecific::method_unknown()))
    }
}

// Return the transaction Id as a u16
pub fn transaction_id(bytes: Vec<u8>) -> Result<u16> {
    if bytes.len() == 2 {
        return Ok(((bytes[0] as u16) << 8) | (bytes[1] as u16));
    } else if bytes.len() == 1 {
        return Ok(bytes[0] as u16);
    }

    Err(Error::InvalidTransactionId(bytes))
}

fn bytes_to_sockaddr<T: AsRef<[u8]>>(bytes: T) -> Result<SocketAddrV4> {
    let bytes = bytes.as_ref();

    let [a, b, c, d, port_hi, port_lo] = bytes else {
        return Err(Error::Static("Wrong number of bytes for sockaddr"));
    };

    Ok(SocketAddrV4::new(
        Ipv4Addr::new(*a, *b, *c, *d),
        u16::from_be_bytes([*port_hi, *port_lo]),
    ))
}

pub fn sockaddr_to_bytes(sockaddr: &SocketAddrV4) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(6);

    bytes.extend(sockaddr.ip().octets());
    bytes.extend(sockaddr.port().to_be_bytes());

    bytes
}

fn nodes4_to_bytes(nodes: &[Node]) -> Vec<u8> {
    let mut vec = Vec::with_capacity(COMPACT_NODE_SIZE * nodes.len());

    for node in nodes {
        vec.extend(node.id.to_bytes());
        vec.append(&mut sockaddr_to_bytes(&node.address));
    }

    vec
}

fn bytes_to_nodes4<T: AsRef<[u8]>>(bytes: T) -> Result<Vec<Node>> {
    let bytes = bytes.as_ref();

    if bytes.len() % COMPACT_NODE_SIZE != 0 {
        return Err(Error::InvalidNodesSize(bytes.len()));
    }

    bytes
        .chunks_exact(COMPACT_NODE_SIZE)
        .map(|chunk| {
            let id = Id::from_bytes(&chunk[..ID_SIZE])?;
            let address = bytes_to_sockaddr(&chunk[ID_SIZE..])?;

            Ok(Node::new(id, address))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(original_msg: &Message) -> Message {
        let bytes = original_msg.to_bytes().unwrap();

        Message::from_bytes(bytes).unwrap()
    }

    #[test]
    fn test_transaction_id() {
        assert_eq!(transaction_id(vec![255]).unwrap(), 255);
        assert_eq!(transaction_id(vec![1, 2]).unwrap(), 258);
        assert!(transaction_id(vec![]).is_err());
    }

    #[test]
    fn test_find_node_request() {
        let original_msg = Message {
            transaction_id: 258,
            version: Some(vec![0x4b, 0x44, 0, 1]),
            message_type: MessageType::Request(RequestSpecific {
                requester_id: Id::random(),
                request_type: RequestTypeSpecific::FindNode(FindNodeRequestArguments {
                    target: Id::random(),
                }),
            }),
        };

        assert_eq!(round_trip(&original_msg), original_msg);
    }

    #[test]
    fn test_find_node_response() {
        let original_msg = Message {
            transaction_id: 258,
            version: None,
            message_type: MessageType::Response(ResponseSpecific::FindNode(
                FindNodeResponseArguments {
                    responder_id: Id::random(),
                    nodes: vec![
                        Node::new(Id::random(), "49.50.52.52:5354".parse().unwrap()),
                        Node::new(Id::random(), "127.0.0.1:6900".parse().unwrap()),
                    ],
                },
            )),
        };

        let parsed_msg = round_trip(&original_msg);

        assert_eq!(parsed_msg, original_msg);

        // Node equality ignores addresses.
        let MessageType::Response(ResponseSpecific::FindNode(arguments)) = parsed_msg.message_type
        else {
            panic!("expected a find_node response");
        };
        assert_eq!(
            arguments.nodes[0].address,
            "49.50.52.52:5354".parse().unwrap()
        );
    }

    #[test]
    fn test_find_node_response_without_nodes() {
        let original_msg = Message {
            transaction_id: 1,
            version: None,
            message_type: MessageType::Response(ResponseSpecific::FindNode(
                FindNodeResponseArguments {
                    responder_id: Id::random(),
                    nodes: vec![],
                },
            )),
        };

        assert_eq!(round_trip(&original_msg), original_msg);
    }

    #[test]
    fn test_find_value_response() {
        let original_msg = Message {
            transaction_id: 3,
            version: None,
            message_type: MessageType::Response(ResponseSpecific::FindValue(
                FindValueResponseArguments {
                    responder_id: Id(7),
                    value: Id(99),
                },
            )),
        };

        assert_eq!(round_trip(&original_msg), original_msg);
    }

    #[test]
    fn test_store_request_and_ack() {
        let request = Message {
            transaction_id: 4,
            version: None,
            message_type: MessageType::Request(RequestSpecific {
                requester_id: Id(3),
                request_type: RequestTypeSpecific::Store(StoreRequestArguments {
                    key: Id(6),
                    value: Id(99),
                }),
            }),
        };
        let ack = Message {
            transaction_id: 4,
            version: None,
            message_type: MessageType::Response(ResponseSpecific::Ack(AckResponseArguments {
                responder_id: Id(7),
            })),
        };

        assert_eq!(round_trip(&request), request);
        assert_eq!(round_trip(&ack), ack);
    }

    #[test]
    fn test_leave_request() {
        let original_msg = Message {
            transaction_id: 5,
            version: None,
            message_type: MessageType::Request(RequestSpecific {
                requester_id: Id(3),
                request_type: RequestTypeSpecific::Leave(LeaveRequestArguments { target: Id(3) }),
            }),
        };

        assert_eq!(round_trip(&original_msg), original_msg);
    }

    #[test]
    fn test_error() {
        let original_msg = Message {
            transaction_id: 6,
            version: None,
            message_type: MessageType::Error(ErrorSpecific::method_unknown()),
        };

        assert_eq!(round_trip(&original_msg), original_msg);
    }

    #[test]
    fn reject_short_identifier() {
        // find_node with a 3 bytes target
        let bytes = b"d1:ad2:id8:\x00\x00\x00\x00\x00\x00\x00\x016:target3:abce1:q9:find_node1:t2:\x00\x071:y1:qe";

        let error = Message::from_bytes(bytes).unwrap_err();
        assert!(matches!(error, Error::InvalidIdSize(3)));

        let (tid, rejection) = reject_malformed(bytes, &error).unwrap();
        assert_eq!(tid, 7);
        assert_eq!(rejection.code, PROTOCOL_ERROR);
    }

    #[test]
    fn reject_oversized_value() {
        let bytes = b"d1:ad2:id8:\x00\x00\x00\x00\x00\x00\x00\x013:key8:\x00\x00\x00\x00\x00\x00\x00\x061:v9:123456789e1:q5:store1:t2:\x00\x081:y1:qe";

        let error = Message::from_bytes(bytes).unwrap_err();
        assert!(matches!(error, Error::InvalidIdSize(9)));

        let (tid, rejection) = reject_malformed(bytes, &error).unwrap();
        assert_eq!(tid, 8);
        assert_eq!(rejection.code, PROTOCOL_ERROR);
    }

    #[test]
    fn reject_unknown_method() {
        let bytes = b"d1:ad2:id8:\x00\x00\x00\x00\x00\x00\x00\x01e1:q4:ping1:t2:\x00\x091:y1:qe";

        let error = Message::from_bytes(bytes).unwrap_err();

        let (tid, rejection) = reject_malformed(bytes, &error).unwrap();
        assert_eq!(tid, 9);
        assert_eq!(rejection.code, METHOD_UNKNOWN);
    }

    #[test]
    fn ignore_malformed_response() {
        let bytes = b"d1:rd2:id3:abce1:t2:\x00\x091:y1:re";

        let error = Message::from_bytes(bytes).unwrap_err();

        assert!(reject_malformed(bytes, &error).is_none());
    }

    #[test]
    fn reject_truncated_nodes() {
        assert!(matches!(
            bytes_to_nodes4([0_u8; COMPACT_NODE_SIZE + 1]),
            Err(Error::InvalidNodesSize(15))
        ));
    }
}
