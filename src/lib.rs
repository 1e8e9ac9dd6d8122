//! Monthly token allowances with rollover, idempotent usage charging and
//! credit views.
//!
//! [`ledger::Ledger`] is the entry point. It wires the allowance manager, the
//! usage ledger and the status reader to a [`ledger::LedgerStore`], whose
//! uniqueness and conditional-update guarantees carry all concurrency
//! correctness.

mod error;
pub mod ledger;

pub use error::{InsufficientBalance, LedgerError, Result};
pub use ledger::{
    AllowanceManager, AllowanceSnapshot, ChargeRequest, ChargeResult, Ledger, LedgerConfig,
    StatusReader, UsageLedger,
};
