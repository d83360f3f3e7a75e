//! Shared primitive types — group ids, node ids, addresses and hashes.

use std::{fmt, str::FromStr};

use sha3::{Digest, Keccak256};

/// Identifier of one independently operated ledger group.
///
/// Groups are numbered `1..=N`; zero is never a valid id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupId(u16);

impl GroupId {
    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u16 {
        self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error returned when parsing a fixed-size hex value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("expected {expected} hex characters, got {got:?}")]
pub struct ParseHexError {
    pub expected: usize,
    pub got: String,
}

macro_rules! fixed_bytes {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name([u8; $len]);

        impl $name {
            pub const LEN: usize = $len;

            pub const fn from_bytes(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            pub fn zero() -> Self {
                Self([0u8; $len])
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), hex::encode(self.0))
            }
        }

        impl FromStr for $name {
            type Err = ParseHexError;

            /// Accepts plain or `0x`-prefixed hex of exactly the right width.
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let trimmed = s.trim();
                let digits = trimmed.strip_prefix("0x").unwrap_or(trimmed);
                let mut out = [0u8; $len];
                hex::decode_to_slice(digits, &mut out).map_err(|_| ParseHexError {
                    expected: $len * 2,
                    got: s.to_string(),
                })?;
                Ok(Self(out))
            }
        }
    };
}

fixed_bytes!(
    /// Network identity of a node: the 64-byte uncompressed secp256k1 public
    /// key without its `0x04` prefix.
    NodeId,
    64
);

fixed_bytes!(
    /// 20-byte account / contract address.
    Address,
    20
);

fixed_bytes!(
    /// 32-byte keccak digest.
    H256,
    32
);

impl NodeId {
    /// Account address of this node: last 20 bytes of `keccak256(node_id)`.
    pub fn address(&self) -> Address {
        let digest = keccak256(&self.0);
        let mut out = [0u8; 20];
        out.copy_from_slice(&digest.as_bytes()[12..]);
        Address(out)
    }
}

pub fn keccak256(data: &[u8]) -> H256 {
    H256(Keccak256::digest(data).into())
}
