#![doc = include_str!("../README.md")]

// Public modules
mod common;

mod dht;
mod error;
pub mod rpc;
pub mod server;

pub use common::{
    ClosestNodes, Id, KBucket, LocalStore, Node, RoutingTable, DEFAULT_K, ID_BITS, ID_SIZE,
};
pub use dht::{BuildError, Dht, DhtBuilder, Testnet, TestnetBuilder};
pub use error::{Error, Result};

/// Wire messages, exposed for custom tooling and tests.
pub mod messages {
    pub use crate::common::messages::*;
}

pub mod errors {
    //! Exported errors
    pub use super::dht::BuildError;
    pub use super::error::Error;
    pub use super::rpc::{JoinError, PutError, RequestError};
}
