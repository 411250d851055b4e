//! Calypso Card - Secure transactions with Calypso cards (PO) and SAMs
//!
//! This crate decodes the card's self-description, runs secure sessions
//! whose integrity is checked by a SAM, and shares SAMs between concurrent
//! callers through a resource pool.

pub mod reader;
pub mod apdu;
pub mod error;
pub mod identity;
pub mod budget;
pub mod sam;
pub mod stored_value;
pub mod session;
pub mod pool;

pub use reader::{CardReader, PcscReader, Reader};
pub use apdu::{ApduCommand, ApduResponse};
pub use error::{IdentityError, PoolError, ReaderError, SessionError};
pub use identity::{CardIdentity, PoRevision, SelectionResponse};
pub use budget::{BudgetUnit, ModificationBudget};
pub use sam::{CalypsoSam, SamSession};
pub use session::{
    CommandResult, PoCommand, RatificationPolicy, RejectionPolicy, SecureSession, SessionOutcome,
    SessionPhase, TransactionSettings,
};
pub use pool::{
    AllocationMode, SamIdentifier, SamProvider, SamResource, SamResourcePool, StaticSamProvider,
};

/// Re-export commonly used types
pub use calypso_keys::{AccessLevel, KvcPolicy};
pub use pcsc::Error as PcscError;
