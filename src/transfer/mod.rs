//! Balance Transfer
//!
//! Moves value between two accounts stored as separate documents, without
//! multi-document transactions.
//!
//! # Safety Invariants
//!
//! 1. **Fail Closed**: the deduct re-checks `balance >= amount` at write time
//! 2. **Compensate Synchronously**: a credit that did not land is refunded
//!    before the call returns
//! 3. **Financial Writes Only**: every balance and record write uses the
//!    financial durability level

pub mod account;
pub mod coordinator;
pub mod types;

pub use account::{Account, AccountReader, ActivityLog};
pub use coordinator::TransferCoordinator;
pub use types::TransferResult;
