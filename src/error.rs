//! Main Crate Error

#[derive(thiserror::Error, Debug)]
/// Kadht crate error enum.
pub enum Error {
    /// Malformed message that doesn't warrant its own variant.
    #[error("Static error: {0}")]
    Static(&'static str),

    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),

    #[error("Failed to parse packet bytes: {0}")]
    /// Errors related to parsing DHT messages.
    BencodeError(#[from] serde_bencode::Error),

    /// An identifier field (id, target, key or value) is not exactly
    /// [ID_SIZE](crate::common::ID_SIZE) bytes.
    #[error("Invalid Id size, expected 8, got {0}")]
    InvalidIdSize(usize),

    /// Indicates that the message transaction_id is not two bytes.
    #[error("Invalid transaction_id: {0:?}")]
    InvalidTransactionId(Vec<u8>),

    /// Compact nodes info is not a multiple of the compact node size.
    #[error("Wrong number of bytes for nodes message ({0})")]
    InvalidNodesSize(usize),
}

pub type Result<T, E = Error> = core::result::Result<T, E>;
