//! Error types for the PSRP core
//!
//! This module contains all error types used throughout the core, split by
//! subsystem (CLIXML codec, fragmenter, protocol state machines, session
//! crypto) and unified under the main [`PsrpError`] type.

use uuid::Uuid;

// ----------------------------------------------------------------------------
// CLIXML codec errors
// ----------------------------------------------------------------------------

/// Errors raised while encoding or decoding CLIXML.
#[derive(Debug, thiserror::Error)]
pub enum SerializationError {
    /// The input is not well-formed XML.
    #[error("malformed CLIXML: {reason}")]
    MalformedXml { reason: String },

    /// The XML is well formed but an element appeared in a position the
    /// CLIXML dialect does not allow.
    #[error("unexpected CLIXML element <{tag}>")]
    UnexpectedTag { tag: String },

    /// A SecureString was encountered but no session key has been
    /// established.
    #[error("cannot (de)serialize a secure string without an exchanged session key")]
    CryptoUnavailable,
}

impl From<quick_xml::Error> for SerializationError {
    fn from(err: quick_xml::Error) -> Self {
        SerializationError::MalformedXml {
            reason: err.to_string(),
        }
    }
}

impl From<quick_xml::events::attributes::AttrError> for SerializationError {
    fn from(err: quick_xml::events::attributes::AttrError) -> Self {
        SerializationError::MalformedXml {
            reason: err.to_string(),
        }
    }
}

impl SerializationError {
    /// Create a malformed XML error with a reason.
    pub fn malformed<T: Into<String>>(reason: T) -> Self {
        SerializationError::MalformedXml {
            reason: reason.into(),
        }
    }

    /// Create an unexpected tag error.
    pub fn unexpected_tag<T: Into<String>>(tag: T) -> Self {
        SerializationError::UnexpectedTag { tag: tag.into() }
    }
}

// ----------------------------------------------------------------------------
// Session crypto errors
// ----------------------------------------------------------------------------

/// Errors raised by the session ciphers and the key exchange helpers.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("key generation failed: {reason}")]
    KeyGeneration { reason: String },

    #[error("encryption failed: {reason}")]
    EncryptionFailed { reason: String },

    #[error("decryption failed: {reason}")]
    DecryptionFailed { reason: String },

    #[error("invalid key blob: {reason}")]
    InvalidKeyBlob { reason: String },

    #[error("session key must be {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },
}

// ----------------------------------------------------------------------------
// Fragmenter errors
// ----------------------------------------------------------------------------

/// Errors raised while reassembling inbound fragments.
#[derive(Debug, thiserror::Error)]
pub enum FragmentError {
    /// The first fragment seen for an object did not carry the start flag
    /// with fragment id 0.
    #[error("object {object_id} started mid-stream (fragment id {fragment_id})")]
    MissingStart { object_id: u64, fragment_id: u64 },

    /// A follow-up fragment arrived out of sequence.
    #[error("object {object_id} expected fragment {expected}, got {actual}")]
    OutOfOrder {
        object_id: u64,
        expected: u64,
        actual: u64,
    },

    /// Too many objects are being reassembled at once.
    #[error("too many objects in flight (limit {limit})")]
    TooManyInFlight { limit: usize },
}

// ----------------------------------------------------------------------------
// Protocol errors
// ----------------------------------------------------------------------------

/// Errors raised by the runspace pool and pipeline state machines.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The peer sent a message type this implementation does not know.
    /// Dispatch surfaces these as events instead; this variant only
    /// appears when a typed parse is explicitly requested.
    #[error("unknown PSRP message type 0x{value:08X}")]
    UnknownMessageType { value: u32 },

    /// A message arrived that is not legal in the current state, or its
    /// body did not have the required shape.
    #[error("protocol violation: {reason}")]
    ProtocolViolation { reason: String },

    /// A pipeline-scoped message referenced a pipeline this pool does not
    /// know about.
    #[error("unknown pipeline {pipeline_id}")]
    UnknownPipeline { pipeline_id: Uuid },

    /// A host response referenced a call id that was never issued.
    #[error("unknown host call {call_id}")]
    UnknownHostCall { call_id: i64 },

    /// The peer declared a protocol version this implementation cannot
    /// interoperate with, or an operation requires a newer peer.
    #[error("peer protocol version {actual} does not satisfy {required}")]
    CapabilityMismatch { required: String, actual: String },

    /// The caller asked for an operation that is illegal in the current
    /// state.
    #[error("cannot {action} while in state {state}")]
    InvalidTransition { action: String, state: String },
}

impl ProtocolError {
    /// Create a protocol violation with a reason.
    pub fn violation<T: Into<String>>(reason: T) -> Self {
        ProtocolError::ProtocolViolation {
            reason: reason.into(),
        }
    }

    /// Create an invalid transition error for a caller-requested action.
    pub fn invalid_transition<A: Into<String>, S: std::fmt::Display>(action: A, state: S) -> Self {
        ProtocolError::InvalidTransition {
            action: action.into(),
            state: state.to_string(),
        }
    }
}

// ----------------------------------------------------------------------------
// Unified error type
// ----------------------------------------------------------------------------

/// Core error type for the PSRP protocol.
#[derive(Debug, thiserror::Error)]
pub enum PsrpError {
    #[error("serialization error: {0}")]
    Serialization(#[from] SerializationError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("fragment error: {0}")]
    Fragment(#[from] FragmentError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl PsrpError {
    /// Create a protocol violation error with a message.
    pub fn violation<T: Into<String>>(reason: T) -> Self {
        PsrpError::Protocol(ProtocolError::violation(reason))
    }

    /// Create a malformed CLIXML error with a message.
    pub fn malformed<T: Into<String>>(reason: T) -> Self {
        PsrpError::Serialization(SerializationError::malformed(reason))
    }

    /// Create an invalid transition error.
    pub fn invalid_transition<A: Into<String>, S: std::fmt::Display>(action: A, state: S) -> Self {
        PsrpError::Protocol(ProtocolError::invalid_transition(action, state))
    }

    /// Create an unknown pipeline error.
    pub fn unknown_pipeline(pipeline_id: Uuid) -> Self {
        PsrpError::Protocol(ProtocolError::UnknownPipeline { pipeline_id })
    }

    /// Whether this error is a SecureString-without-session-key failure.
    pub fn is_crypto_unavailable(&self) -> bool {
        matches!(
            self,
            PsrpError::Serialization(SerializationError::CryptoUnavailable)
        )
    }
}

// ----------------------------------------------------------------------------
// Type aliases
// ----------------------------------------------------------------------------

pub type Result<T> = std::result::Result<T, PsrpError>;
