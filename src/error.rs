//! Errors raised by the simulated core.
//!
//! Structural stalls (a full queue, an empty free list) are not errors; they
//! are retried every cycle. What ends up here is either an architectural
//! fault that reached commit, or a broken internal invariant.

use thiserror::Error;

use crate::instructions::instructions::{RegisterType, WordType};

/// An architectural fault. It is recorded against the reorder buffer entry
/// of the faulting instruction and only raised once that entry commits, so a
/// fault on a squashed path never surfaces.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Error)]
pub enum Fault {
    #[error("divide by zero")]
    DivideByZero,

    #[error("data address {0} out of bounds")]
    AddressOutOfBounds(WordType),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CpuError {
    #[error("instruction at pc {pc} faulted: {fault}")]
    Fault { pc: WordType, fault: Fault },

    #[error("physical register P{0} was read before its producer completed")]
    InvalidRegisterRead(RegisterType),

    #[error("internal consistency violation: {0}")]
    Inconsistent(String),

    #[error("no HALT committed within {0} cycles")]
    CycleLimitExceeded(u64),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
