//! Kademlia node Id or a lookup target
use rand::Rng;
use sha1_smol::Sha1;
use std::{
    fmt::{self, Debug, Display, Formatter},
    str::FromStr,
};

use crate::{Error, Result};

/// The size of node IDs in bits.
///
/// Fixed at compile time: [Id] is a `u64`, and every identifier on the wire is `ID_BITS / 8` bytes.
pub const ID_BITS: usize = 64;
/// The size of node IDs in bytes, and of every identifier field on the wire.
pub const ID_SIZE: usize = ID_BITS / 8;

#[derive(Clone, Copy, PartialEq, Ord, PartialOrd, Eq, Hash, Default)]
/// Kademlia node Id or a lookup target.
///
/// Nodes and keys share the same address space.
pub struct Id(pub u64);

impl Id {
    pub fn random() -> Id {
        let mut rng = rand::thread_rng();

        Id(rng.gen())
    }

    /// Create a new Id from some big-endian bytes. Returns Err if `bytes` is not of length
    /// [ID_SIZE].
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id> {
        let bytes = bytes.as_ref();

        let array: [u8; ID_SIZE] = bytes
            .try_into()
            .map_err(|_| Error::InvalidIdSize(bytes.len()))?;

        Ok(Id(u64::from_be_bytes(array)))
    }

    /// Derive an Id from arbitrary data, by truncating its SHA1 hash.
    pub fn digest<T: AsRef<[u8]>>(data: T) -> Id {
        let mut hasher = Sha1::new();
        hasher.update(data.as_ref());
        let digest = hasher.digest().bytes();

        let mut bytes = [0_u8; ID_SIZE];
        bytes.copy_from_slice(&digest[..ID_SIZE]);

        Id(u64::from_be_bytes(bytes))
    }

    /// XOR distance between this Id and a target Id.
    pub fn xor(&self, other: &Id) -> Id {
        Id(self.0 ^ other.0)
    }

    /// Index of the routing table bucket that `other` falls into relative to `self`.
    ///
    /// That is the position (from the least significant bit) of the most significant
    /// set bit of the XOR distance, in `0..ID_BITS`.
    ///
    /// Returns `None` if both ids are equal.
    pub fn bucket_index(&self, other: &Id) -> Option<usize> {
        self.xor(other).highest_bit()
    }

    /// Position of the most significant set bit, `None` for zero.
    pub fn highest_bit(&self) -> Option<usize> {
        if self.0 == 0 {
            return None;
        }

        Some(ID_BITS - 1 - self.0.leading_zeros() as usize)
    }

    pub fn to_bytes(&self) -> [u8; ID_SIZE] {
        self.0.to_be_bytes()
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.to_bytes().to_vec()
    }
}

impl From<u64> for Id {
    fn from(value: u64) -> Self {
        Id(value)
    }
}

impl From<Id> for u64 {
    fn from(id: Id) -> Self {
        id.0
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({:#018x})", self.0)
    }
}

impl FromStr for Id {
    type Err = Error;

    /// Parse a decimal Id, or a hexadecimal one prefixed with `0x`.
    fn from_str(s: &str) -> Result<Id> {
        let parsed = match s.strip_prefix("0x") {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => s.parse::<u64>(),
        };

        parsed
            .map(Id)
            .map_err(|_| Error::Static("Invalid Id string"))
    }
}
