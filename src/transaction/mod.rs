//! Transaction Records
//!
//! Every transfer leaves a transaction record. Records settled elsewhere
//! (an external chain) start `pending` and are finalized exactly once.
//!
//! # State Machine
//!
//! ```text
//! PENDING → CONFIRMED
//!    ↓
//!  FAILED
//! ```

pub mod machine;
pub mod state;
pub mod types;

pub use machine::TransactionStateMachine;
pub use state::{TransactionKind, TransactionStatus};
pub use types::{Confirmation, Transaction, fields, new_tx_hash};
