//! PoI consensus errors.

use alloy_primitives::Address;
use thiserror::Error;

/// Errors surfaced by the PoI consensus engine.
///
/// Validation errors and policy refusals carry stable message strings so RPC
/// callers can match on them; environment errors wrap the collaborator's
/// message unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoiError {
    /// The referenced block is not part of the local chain.
    #[error("unknown block")]
    UnknownBlock,

    /// A header references an ancestor that cannot be resolved.
    #[error("unknown ancestor")]
    UnknownAncestor,

    /// The zero address was used where a validator identity is required.
    #[error("invalid validator address")]
    InvalidAddress,

    /// The validator is not tracked by the engine.
    #[error("validator {validator} not found")]
    ValidatorNotFound { validator: Address },

    /// Header timestamp is zero or violates the configured period.
    #[error("invalid timestamp")]
    InvalidTimestamp,

    /// The extra-data section is too short to hold a seal signature.
    #[error("extra-data 65 byte signature suffix missing")]
    MissingSignature,

    /// The seal signature is malformed or does not match the coinbase.
    #[error("invalid signature")]
    InvalidSignature,

    /// A header was authored by an address outside the validator set.
    #[error("unauthorized validator {validator}")]
    Unauthorized { validator: Address },

    /// The validator is serving a cooldown window.
    #[error("validator {validator} is in cooldown until block {until}")]
    ValidatorInCooldown { validator: Address, until: u64 },

    /// No validator satisfies the election constraints at this height.
    #[error("no eligible validator")]
    NoEligibleValidator,

    /// A header run is not a contiguous extension of the snapshot.
    #[error("invalid chain")]
    InvalidChain,

    /// The signer authored a block inside the recent-author window.
    #[error("signer {signer} recently signed at block {recent_block}")]
    RecentlySigned { signer: Address, recent_block: u64 },

    /// The configured signer does not match the header coinbase.
    #[error("signer {signer} not allowed to seal block for coinbase {coinbase}")]
    SignerMismatch { signer: Address, coinbase: Address },

    /// No signer has been configured.
    #[error("no signer configured")]
    NoSigner,

    /// No signing function has been configured.
    #[error("signing function not set")]
    NoSignFn,

    /// Storage backend failure.
    #[error("database error: {message}")]
    Database { message: String },

    /// Snapshot encoding or decoding failure.
    #[error("snapshot serialization error: {message}")]
    Serialization { message: String },
}
