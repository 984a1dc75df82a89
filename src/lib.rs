//! armshake - hidden-instruction fuzzer for 32-bit ARM (A32/Thumb) and AArch64
//!
//! Enumerates a range of 32-bit encodings, asks two independent reference
//! disassemblers whether each encoding is undefined, and — for encodings
//! both disassemblers reject — actually executes the encoding on the host
//! CPU. Any encoding that runs to completion without raising an
//! illegal-instruction trap is a hidden instruction: silicon behavior the
//! architecture reference doesn't document. Disagreements between the two
//! disassemblers are themselves logged, since they are likely disassembler
//! bugs rather than anything interesting about the silicon.
//!
//! # Architecture
//!
//! - [`iterator`]: the masked-increment encoding enumerator.
//! - [`filter`]: the SBO/SBZ and unpredictable-encoding pre-execution gate.
//! - [`oracle`]: the two disassembler oracles and their arbitration.
//! - [`exec`]: the in-process and traced-child execution back-ends.
//! - [`driver`]: ties the above into a single sequential run.
//! - [`config`] / [`cli`]: validated run configuration and its CLI surface.
//! - [`status`] / [`log`]: where search progress and hidden-instruction
//!   candidates are published.
//!
//! This crate only executes on the architecture it runs on — it has no
//! cross-architecture emulation and does not attempt to prove an encoding is
//! truly undocumented, only that it escapes these two oracles on this CPU.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

pub mod cli;
pub mod config;
pub mod driver;
pub mod error;
pub mod exec;
pub mod filter;
pub mod iterator;
pub mod log;
pub mod oracle;
pub mod status;
pub mod types;

pub use config::{Backend, RunConfig};
pub use driver::Driver;
pub use error::{FuzzError, Result};
pub use types::InstructionSet;
