//! Execution back-ends: in-process (§4.4) and traced-child (§4.5).
//!
//! Both back-ends answer the same question for a single encoding — did it
//! raise a signal, and if so which one — through the same [`Executor`]
//! trait, so the driver doesn't need to know which back-end is active.

#[cfg(any(target_arch = "arm", target_arch = "aarch64"))]
pub mod inprocess;
pub mod traced;

use crate::error::Result;
use crate::types::ExecResult;

/// Runs one encoding and reports what happened.
pub trait Executor {
    /// Short identifier used in logs (`"inprocess"` or `"traced"`).
    fn name(&self) -> &'static str;

    /// Execute `insn` and return the outcome. Implementations must leave the
    /// process (or child) in a state where the next call to `execute` is
    /// valid, respawning internally if necessary.
    fn execute(&mut self, insn: u32) -> Result<ExecResult>;
}
