//! Node identity — secp256k1 key pair loaded from the node secret file.
//!
//! The secret file lives at `data_dir/node.private` unless configured
//! otherwise and holds a hex string. Only the first 64 characters are used;
//! they decode to the 32-byte big-endian secret scalar. Anything shorter is a
//! fatal misconfiguration: a node without an identity must never join
//! consensus.
//!
//! `fingerprint` is the first 8 hex characters of `SHA256(node_id)`.

use std::{fmt, fs, io, path::Path};

use secp256k1::{PublicKey, SECP256K1, SecretKey};
use sha2::{Digest, Sha256};

use crate::{
    error::AppError,
    types::{Address, NodeId},
};

/// Hex characters consumed from the secret file.
pub const SECRET_HEX_LEN: usize = 64;

/// Loaded node identity. Immutable for the process lifetime.
#[derive(Clone)]
pub struct NodeIdentity {
    secret: SecretKey,
    node_id: NodeId,
    /// First 8 hex chars of `SHA256(node_id)`.
    pub fingerprint: String,
}

impl NodeIdentity {
    /// Derive the key pair from a raw 32-byte secret scalar.
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Result<Self, AppError> {
        let secret = SecretKey::from_slice(bytes)
            .map_err(|e| AppError::Identity(format!("invalid secret scalar: {e}")))?;
        let public = PublicKey::from_secret_key(SECP256K1, &secret);
        let node_id = node_id_from_public(&public);
        Ok(Self {
            secret,
            fingerprint: compute_fingerprint(&node_id),
            node_id,
        })
    }

    /// Apply the secret-file rule to raw file content.
    pub fn from_content(content: &[u8]) -> Result<Self, AppError> {
        if content.len() < SECRET_HEX_LEN {
            return Err(AppError::Identity(format!(
                "node secret must hold at least {SECRET_HEX_LEN} hex characters, found {}",
                content.len()
            )));
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(&content[..SECRET_HEX_LEN], &mut bytes)
            .map_err(|e| AppError::Identity(format!("node secret is not valid hex: {e}")))?;
        Self::from_secret_bytes(&bytes)
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Account address derived from the public key.
    pub fn address(&self) -> Address {
        self.node_id.address()
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.secret_bytes()
    }

    pub(crate) fn secret_key(&self) -> &SecretKey {
        &self.secret
    }
}

impl fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("node_id", &self.node_id)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

/// Load the node identity from `path`.
///
/// A missing file is reported the same way as a short one.
pub fn load(path: &Path) -> Result<NodeIdentity, AppError> {
    let content = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
        Err(e) => {
            return Err(AppError::Identity(format!(
                "cannot read {}: {e}",
                path.display()
            )));
        }
    };
    NodeIdentity::from_content(&content).map_err(|e| match e {
        AppError::Identity(msg) => {
            AppError::Identity(format!("{msg} (check {})", path.display()))
        }
        other => other,
    })
}

/// 64-byte node id: uncompressed public key without the `0x04` tag.
pub fn node_id_from_public(public: &PublicKey) -> NodeId {
    let uncompressed = public.serialize_uncompressed();
    let mut out = [0u8; 64];
    out.copy_from_slice(&uncompressed[1..]);
    NodeId::from_bytes(out)
}

/// Derive the log fingerprint: first 8 hex chars of `SHA256(node_id)`.
pub fn compute_fingerprint(node_id: &NodeId) -> String {
    let digest = Sha256::digest(node_id.as_bytes());
    hex::encode(digest)[..8].to_string()
}

// ── tests ─────────────────────────────────────────────────────────────────────
