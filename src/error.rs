//! Error types for the hidden-instruction fuzzer.
//!
//! Every error the core can surface maps to one of the classes from the
//! error-handling design: configuration, resource, oracle, execution
//! anomaly, or child death. The driver decides what to do with each; the
//! in-process signal handler never constructs or touches one of these.

use thiserror::Error;

/// Primary error type for the fuzzer.
#[derive(Debug, Error)]
pub enum FuzzError {
    /// IO error (file creation, log writes, directory creation).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Bad CLI input: malformed hex, inverted range, unsupported feature
    /// combination (e.g. Thumb on AArch64, Thumb without ptrace).
    #[error("configuration error: {message}")]
    Config { message: String },

    /// `mmap` of the trampoline page failed.
    #[error("failed to map executable trampoline page: errno {errno}")]
    MmapFailed { errno: i32 },

    /// `mprotect`/cache maintenance on the trampoline page failed.
    #[error("failed to prepare trampoline page: {message}")]
    TrampolineSetup { message: String },

    /// Forking or attaching to the traced child failed.
    #[error("failed to start traced child: {message}")]
    TraceSetup { message: String },

    /// A `data/` directory or log/status file could not be created.
    #[error("failed to prepare persistent state directory: {message}")]
    StateDir { message: String },

    /// A disassembler oracle itself failed (not "undefined" — a genuine
    /// internal failure). The run cannot be trusted past this point.
    #[error("oracle {oracle} failed on encoding 0x{insn:08x}: {message}")]
    Oracle {
        oracle: &'static str,
        insn: u32,
        message: String,
    },

    /// A signal fired outside the executor's test window.
    #[error("signal {signal} raised outside test window at encoding 0x{insn:08x}")]
    UnexpectedSignal { signal: i32, insn: u32 },

    /// The traced child terminated and could not be used for this encoding.
    #[error("traced child died while testing encoding 0x{insn:08x}")]
    ChildDied { insn: u32 },
}

/// Result type alias for fuzzer operations.
pub type Result<T> = std::result::Result<T, FuzzError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_carries_message() {
        let err = FuzzError::Config {
            message: "start > end".into(),
        };
        assert!(err.to_string().contains("start > end"));
    }

    #[test]
    fn oracle_error_displays_insn_in_hex() {
        let err = FuzzError::Oracle {
            oracle: "cs",
            insn: 0xDEAD_BEEF,
            message: "internal failure".into(),
        };
        assert!(err.to_string().contains("deadbeef"));
    }

    #[test]
    fn child_died_displays_insn() {
        let err = FuzzError::ChildDied { insn: 0x1234 };
        assert!(err.to_string().contains("1234"));
    }
}
