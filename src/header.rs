//! Block header type, RLP seal hash, and chain access traits.

use crate::EXTRA_SEAL;
use alloy_primitives::{keccak256, Address, Bloom, Bytes, B256, B64, U256};
use alloy_rlp::Encodable;
use serde::{Deserialize, Serialize};

use crate::PoiError;

/// Block header processed by the PoI engine.
///
/// The trailing [`EXTRA_SEAL`] bytes of `extra` hold the secp256k1 seal
/// signature (r, s, v) over [`seal_hash`]; everything before them is an
/// opaque prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Hash of the parent block.
    pub parent_hash: B256,
    /// Hash of the (empty) uncle list.
    pub uncle_hash: B256,
    /// Address credited with producing this block.
    pub coinbase: Address,
    /// State trie root after executing the block.
    pub state_root: B256,
    /// Transaction trie root.
    pub tx_root: B256,
    /// Receipt trie root.
    pub receipt_root: B256,
    /// Log bloom filter.
    pub bloom: Bloom,
    /// Block difficulty, always 1 under PoI.
    pub difficulty: U256,
    /// Block number.
    pub number: u64,
    /// Gas limit.
    pub gas_limit: u64,
    /// Gas used.
    pub gas_used: u64,
    /// Unix timestamp in seconds.
    pub time: u64,
    /// Opaque prefix followed by the 65 byte seal signature.
    pub extra: Bytes,
    /// Mix digest, zero under PoI.
    pub mix_digest: B256,
    /// Nonce, zero under PoI.
    pub nonce: B64,
    /// Base fee per gas, when the fee market is active.
    pub base_fee: Option<u64>,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            parent_hash: B256::ZERO,
            uncle_hash: B256::ZERO,
            coinbase: Address::ZERO,
            state_root: B256::ZERO,
            tx_root: B256::ZERO,
            receipt_root: B256::ZERO,
            bloom: Bloom::ZERO,
            difficulty: U256::from(1),
            number: 0,
            gas_limit: 0,
            gas_used: 0,
            time: 0,
            extra: Bytes::new(),
            mix_digest: B256::ZERO,
            nonce: B64::ZERO,
            base_fee: None,
        }
    }
}

impl Header {
    /// Hash of the full header, including the seal signature and base fee.
    pub fn hash(&self) -> B256 {
        let mut out = Vec::new();
        self.encode_fields(&self.extra[..], self.base_fee, &mut out);
        keccak256(&out)
    }

    /// The seal signature suffix of the extra-data.
    pub fn seal_signature(&self) -> Result<&[u8], PoiError> {
        if self.extra.len() < EXTRA_SEAL {
            return Err(PoiError::MissingSignature);
        }
        Ok(&self.extra[self.extra.len() - EXTRA_SEAL..])
    }

    /// RLP-encode the header fields as a list, with the given extra-data
    /// slice and optional trailing base fee.
    fn encode_fields(&self, extra: &[u8], base_fee: Option<u64>, out: &mut Vec<u8>) {
        let mut payload = Vec::new();
        self.parent_hash.encode(&mut payload);
        self.uncle_hash.encode(&mut payload);
        self.coinbase.encode(&mut payload);
        self.state_root.encode(&mut payload);
        self.tx_root.encode(&mut payload);
        self.receipt_root.encode(&mut payload);
        self.bloom.encode(&mut payload);
        self.difficulty.encode(&mut payload);
        self.number.encode(&mut payload);
        self.gas_limit.encode(&mut payload);
        self.gas_used.encode(&mut payload);
        self.time.encode(&mut payload);
        extra.encode(&mut payload);
        self.mix_digest.encode(&mut payload);
        self.nonce.encode(&mut payload);
        if let Some(fee) = base_fee {
            fee.encode(&mut payload);
        }
        alloy_rlp::Header { list: true, payload_length: payload.len() }.encode(out);
        out.extend_from_slice(&payload);
    }
}

/// Hash of a header with its seal signature stripped.
///
/// This is the message the validator signs: the keccak256 digest of the
/// RLP list of all header fields, with `extra` truncated by the trailing
/// [`EXTRA_SEAL`] bytes and the base fee omitted.
pub fn seal_hash(header: &Header) -> B256 {
    let trimmed = header.extra.len().saturating_sub(EXTRA_SEAL);
    let mut out = Vec::new();
    header.encode_fields(&header.extra[..trimmed], None, &mut out);
    keccak256(&out)
}

/// A block as seen by the consensus engine: a header plus opaque content the
/// engine never inspects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    header: Header,
}

impl Block {
    /// Create a block around the given header.
    pub fn new(header: Header) -> Self {
        Self { header }
    }

    /// The block header.
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Rebuild the block with a sealed header.
    pub fn with_seal(&self, header: Header) -> Block {
        Block { header }
    }
}

/// Chain header reader for accessing blockchain headers.
pub trait ChainHeaderReader: Send + Sync {
    /// Get the current chain head.
    fn current_header(&self) -> Option<Header>;

    /// Get header by hash and number.
    fn get_header(&self, hash: B256, number: u64) -> Option<Header>;

    /// Get header by number.
    fn get_header_by_number(&self, number: u64) -> Option<Header>;

    /// Get header by hash.
    fn get_header_by_hash(&self, hash: B256) -> Option<Header>;
}
