//! Error types for card transport, identity decoding, secure sessions and SAM pooling

use thiserror::Error;

use crate::session::CommandKind;
use crate::stored_value::SvOperation;

/// Transport-level failures reported by a [`crate::reader::Reader`]
#[derive(Debug, Clone, Error)]
pub enum ReaderError {
    #[error("PC/SC error: {0}")]
    Pcsc(#[from] pcsc::Error),

    #[error("no card present in reader")]
    CardAbsent,

    #[error("response too short: {0} bytes, status word missing")]
    ResponseTooShort(usize),
}

/// Failures while decoding the card's self-description
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("malformed card response: {0}")]
    MalformedCardResponse(String),

    #[error("unexpected ATR length: {0} bytes (legacy ATR is 20 bytes)")]
    UnexpectedAtrLength(usize),
}

/// Failures of the secure session engine
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("illegal session state: {0}")]
    IllegalState(&'static str),

    #[error("unauthorized KVC {kvc:#04X}")]
    UnauthorizedKvc { kvc: u8 },

    #[error("file address out of range: SFI {sfi:#04X}, record {record_number}")]
    InvalidFileAddress { sfi: u8, record_number: u8 },

    #[error("modification buffer overflow: {required} needed, {remaining} left")]
    ModificationBufferOverflow { required: usize, remaining: usize },

    #[error("{command:?} rejected by card with status {status_word:04X}")]
    CardCommandRejected { command: CommandKind, status_word: u16 },

    #[error("session MAC verification failed")]
    SessionMacVerificationFailed,

    #[error("close secure session rejected with status {0:04X}")]
    CloseRejected(u16),

    #[error("no SV Get result available for {0:?}")]
    SvOrdering(SvOperation),

    #[error("SV amount {amount} out of range {min}..={max}")]
    SvAmountOutOfRange { amount: i32, min: i32, max: i32 },

    #[error("SV balance would fall to {balance}, below the allowed floor {floor}")]
    SvNegativeBalance { balance: i32, floor: i32 },

    #[error("SV signature rejected by SAM")]
    SvSignatureRejected,

    #[error("SAM rejected {command} with status {status_word:04X}")]
    SamRejected { command: &'static str, status_word: u16 },

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error(transparent)]
    Reader(#[from] ReaderError),
}

/// SAM pool allocation and release failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("no SAM resource available for group {0:?}")]
    NoResourceAvailable(String),

    #[error("SAM allocation timed out after {0:?}")]
    AllocationTimeout(std::time::Duration),

    #[error("SAM allocation cancelled")]
    Cancelled,

    #[error("SAM resource {0:?} is not allocated by this pool")]
    NotAllocated(String),
}
