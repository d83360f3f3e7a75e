//! Transactions — RLP wire format, content hashing and recoverable signatures.
//!
//! Wire layout (RLP list):
//!
//! ```text
//! [nonce, gas_price, gas, to, value, data, v, r, s, block_limit]
//! ```
//!
//! The content hash signed by the sender is `keccak256` over the RLP list
//! `[nonce, gas_price, gas, block_limit, to, value, data]`, i.e. everything
//! except the signature. Integers are minimal big-endian byte strings and an
//! empty `to` marks contract creation.

use ethnum::U256;
use rlp::{DecoderError, Rlp, RlpStream};
use secp256k1::{
    Message, SECP256K1,
    ecdsa::{RecoverableSignature, RecoveryId},
};
use thiserror::Error;

use crate::{
    bootstrap::identity::{NodeIdentity, node_id_from_public},
    types::{Address, H256, keccak256},
};

/// Offset added to the recovery id when stored in `v`.
const V_OFFSET: u8 = 27;
const FIELD_COUNT: usize = 10;

#[derive(Debug, Error)]
pub enum TxError {
    #[error("rlp: {0}")]
    Rlp(#[from] DecoderError),

    #[error("field `{field}`: {reason}")]
    BadField { field: &'static str, reason: String },

    #[error("transaction is not signed")]
    Unsigned,

    #[error("invalid signature: {0}")]
    InvalidSignature(String),
}

/// Recoverable ECDSA signature as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    pub v: u8,
    pub r: H256,
    pub s: H256,
}

impl Signature {
    fn to_recoverable(self) -> Result<RecoverableSignature, TxError> {
        let recid = self
            .v
            .checked_sub(V_OFFSET)
            .ok_or_else(|| TxError::InvalidSignature(format!("v = {}", self.v)))?;
        let recid = RecoveryId::from_i32(i32::from(recid))
            .map_err(|e| TxError::InvalidSignature(e.to_string()))?;
        let mut compact = [0u8; 64];
        compact[..32].copy_from_slice(self.r.as_bytes());
        compact[32..].copy_from_slice(self.s.as_bytes());
        RecoverableSignature::from_compact(&compact, recid)
            .map_err(|e| TxError::InvalidSignature(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub nonce: U256,
    pub gas_price: U256,
    pub gas: U256,
    /// `None` for contract creation.
    pub receive_address: Option<Address>,
    pub value: U256,
    pub data: Vec<u8>,
    /// Valid only while the chain height is below this value.
    pub block_limit: U256,
    signature: Option<Signature>,
}

impl Transaction {
    pub fn new(
        nonce: U256,
        gas_price: U256,
        gas: U256,
        receive_address: Option<Address>,
        value: U256,
        data: Vec<u8>,
        block_limit: U256,
    ) -> Self {
        Self {
            nonce,
            gas_price,
            gas,
            receive_address,
            value,
            data,
            block_limit,
            signature: None,
        }
    }

    pub fn signature(&self) -> Option<&Signature> {
        self.signature.as_ref()
    }

    /// Replace the signature. Any field change after signing invalidates it,
    /// so callers re-sign after every mutation.
    pub fn update_signature(&mut self, signature: Signature) {
        self.signature = Some(signature);
    }

    /// Content hash, excluding the signature.
    pub fn hash_without_signature(&self) -> H256 {
        let mut s = RlpStream::new_list(7);
        append_uint(&mut s, &self.nonce);
        append_uint(&mut s, &self.gas_price);
        append_uint(&mut s, &self.gas);
        append_uint(&mut s, &self.block_limit);
        append_address(&mut s, self.receive_address.as_ref());
        append_uint(&mut s, &self.value);
        s.append(&self.data);
        keccak256(&s.out())
    }

    /// Hash of the full wire encoding.
    pub fn hash(&self) -> H256 {
        keccak256(&self.rlp_bytes())
    }

    /// Sign the content hash with the node secret and attach the signature.
    pub fn sign(&mut self, identity: &NodeIdentity) {
        let signature = sign_hash(identity, &self.hash_without_signature());
        self.update_signature(signature);
    }

    /// Recover the sender address from the signature.
    pub fn sender(&self) -> Result<Address, TxError> {
        let signature = self.signature.ok_or(TxError::Unsigned)?;
        let message = Message::from_digest(*self.hash_without_signature().as_bytes());
        let public = SECP256K1
            .recover_ecdsa(&message, &signature.to_recoverable()?)
            .map_err(|e| TxError::InvalidSignature(e.to_string()))?;
        Ok(node_id_from_public(&public).address())
    }

    pub fn rlp_bytes(&self) -> Vec<u8> {
        let mut s = RlpStream::new_list(FIELD_COUNT);
        append_uint(&mut s, &self.nonce);
        append_uint(&mut s, &self.gas_price);
        append_uint(&mut s, &self.gas);
        append_address(&mut s, self.receive_address.as_ref());
        append_uint(&mut s, &self.value);
        s.append(&self.data);
        match &self.signature {
            Some(sig) => {
                s.append(&sig.v);
                s.append(&sig.r.as_bytes().to_vec());
                s.append(&sig.s.as_bytes().to_vec());
            }
            None => {
                s.append(&0u8);
                s.append(&Vec::<u8>::new());
                s.append(&Vec::<u8>::new());
            }
        }
        append_uint(&mut s, &self.block_limit);
        s.out().to_vec()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TxError> {
        let rlp = Rlp::new(bytes);
        if !rlp.is_list() {
            return Err(DecoderError::RlpExpectedToBeList.into());
        }
        if rlp.item_count()? != FIELD_COUNT {
            return Err(DecoderError::RlpIncorrectListLen.into());
        }

        let field = |idx: usize| field_at(&rlp, idx);

        let receive_address = match field(3)? {
            [] => None,
            raw => Some(Address::from_bytes(raw.try_into().map_err(|_| TxError::BadField {
                field: "to",
                reason: format!("expected 20 bytes, got {}", raw.len()),
            })?)),
        };

        let v = match field(6)? {
            [] => 0,
            [v] => *v,
            raw => {
                return Err(TxError::BadField {
                    field: "v",
                    reason: format!("expected 1 byte, got {}", raw.len()),
                });
            }
        };
        let r = field(7)?;
        let s = field(8)?;
        let signature = if v == 0 && r.is_empty() && s.is_empty() {
            None
        } else {
            Some(Signature {
                v,
                r: H256::from_bytes(decode_uint(r, "r")?.to_be_bytes()),
                s: H256::from_bytes(decode_uint(s, "s")?.to_be_bytes()),
            })
        };

        Ok(Self {
            nonce: decode_uint(field(0)?, "nonce")?,
            gas_price: decode_uint(field(1)?, "gas_price")?,
            gas: decode_uint(field(2)?, "gas")?,
            receive_address,
            value: decode_uint(field(4)?, "value")?,
            data: field(5)?.to_vec(),
            block_limit: decode_uint(field(9)?, "block_limit")?,
            signature,
        })
    }
}

/// Deterministic (RFC 6979) recoverable signature over `hash`.
pub fn sign_hash(identity: &NodeIdentity, hash: &H256) -> Signature {
    let message = Message::from_digest(*hash.as_bytes());
    let (recid, compact) = SECP256K1
        .sign_ecdsa_recoverable(&message, identity.secret_key())
        .serialize_compact();
    let mut r = [0u8; 32];
    let mut s = [0u8; 32];
    r.copy_from_slice(&compact[..32]);
    s.copy_from_slice(&compact[32..]);
    Signature {
        // Recovery ids are 0..=3.
        v: V_OFFSET + recid.to_i32() as u8,
        r: H256::from_bytes(r),
        s: H256::from_bytes(s),
    }
}

fn append_uint(s: &mut RlpStream, value: &U256) {
    let bytes = value.to_be_bytes();
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    s.append(&bytes[first..].to_vec());
}

fn append_address(s: &mut RlpStream, address: Option<&Address>) {
    match address {
        Some(a) => s.append(&a.as_bytes().to_vec()),
        None => s.append(&Vec::<u8>::new()),
    };
}

fn field_at<'a>(rlp: &Rlp<'a>, idx: usize) -> Result<&'a [u8], TxError> {
    Ok(rlp.at(idx)?.data()?)
}

fn decode_uint(raw: &[u8], field: &'static str) -> Result<U256, TxError> {
    if raw.len() > 32 {
        return Err(TxError::BadField {
            field,
            reason: format!("{} bytes exceeds 256 bits", raw.len()),
        });
    }
    let mut buf = [0u8; 32];
    buf[32 - raw.len()..].copy_from_slice(raw);
    Ok(U256::from_be_bytes(buf))
}
