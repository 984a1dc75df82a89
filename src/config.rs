//! Run configuration (§6, §7): the validated, internal counterpart to the
//! CLI's raw [`crate::cli::Cli`] struct.
//!
//! Modeled on the teacher's `ClassifierOptions` builder (`new`/`fast`/
//! `thorough`): one plain struct the rest of the crate depends on, built from
//! user input and validated once up front rather than re-checked at every
//! call site.

use crate::error::{FuzzError, Result};
use crate::types::InstructionSet;

/// Which execution back-end the driver should use for each encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// In-process trampoline + signal handlers (§4.4).
    InProcess,
    /// Forked, `ptrace`d child (§4.5).
    Traced,
}

/// Validated configuration for one fuzzing run, built from [`crate::cli::Cli`].
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub start: u32,
    pub end: u32,
    pub mask: u32,
    pub isa: InstructionSet,
    pub backend: Backend,
    pub no_exec: bool,
    pub exec_all: bool,
    pub filter: bool,
    pub discreps: bool,
    pub print_regs: bool,
    pub quiet: bool,
    pub log_suffix: String,
}

impl RunConfig {
    /// Builds a [`RunConfig`] from parsed CLI arguments, applying `--single-exec`
    /// (`end := start`) before validation.
    pub fn from_cli(cli: &crate::cli::Cli) -> Result<Self> {
        let isa = if cli.thumb {
            InstructionSet::Thumb
        } else if cfg!(target_arch = "aarch64") {
            InstructionSet::A64
        } else {
            InstructionSet::A32
        };

        let backend = if cli.ptrace {
            Backend::Traced
        } else {
            Backend::InProcess
        };

        let end = if cli.single_exec { cli.start } else { cli.end };

        let config = RunConfig {
            start: cli.start,
            end,
            mask: cli.mask,
            isa,
            backend,
            no_exec: cli.no_exec,
            exec_all: cli.exec_all,
            filter: cli.filter,
            discreps: cli.discreps,
            print_regs: cli.print_regs,
            quiet: cli.quiet,
            log_suffix: cli.log_suffix.clone().unwrap_or_default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// A single-encoding run, equivalent to `--single-exec --start insn`.
    pub fn single(insn: u32, isa: InstructionSet, backend: Backend) -> Result<Self> {
        let config = RunConfig {
            start: insn,
            end: insn,
            mask: 0xFFFF_FFFF,
            isa,
            backend,
            no_exec: false,
            exec_all: false,
            filter: false,
            discreps: false,
            print_regs: false,
            quiet: true,
            log_suffix: String::new(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Applies the configuration errors from the error-handling design: bad
    /// combinations are rejected before the driver (and any `mmap`/`fork`) runs.
    pub fn validate(&self) -> Result<()> {
        if self.start > self.end {
            return Err(FuzzError::Config {
                message: format!(
                    "start (0x{:08x}) must not be greater than end (0x{:08x})",
                    self.start, self.end
                ),
            });
        }

        if self.isa == InstructionSet::Thumb && cfg!(target_arch = "aarch64") {
            return Err(FuzzError::Config {
                message: "Thumb has no meaning on an AArch64 host".into(),
            });
        }

        if self.isa == InstructionSet::Thumb && self.backend == Backend::InProcess {
            // The in-process trampoline's Thumb interworking is exercised far
            // less than the traced path upstream; the reference tool only
            // ever ran Thumb under ptrace.
            return Err(FuzzError::Config {
                message: "Thumb requires the traced-child executor (-p/--ptrace)".into(),
            });
        }

        if self.print_regs && self.backend != Backend::Traced {
            return Err(FuzzError::Config {
                message: "--print-regs only applies to the traced-child executor".into(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Cli;

    fn base_cli() -> Cli {
        Cli {
            start: 0,
            end: 0xFFFF_FFFF,
            no_exec: false,
            log_suffix: None,
            quiet: false,
            discreps: false,
            ptrace: false,
            exec_all: false,
            print_regs: false,
            single_exec: false,
            filter: false,
            mask: 0xFFFF_FFFF,
            thumb: false,
        }
    }

    #[test]
    fn single_exec_pins_end_to_start() {
        let mut cli = base_cli();
        cli.start = 0xdead_beef;
        cli.single_exec = true;
        let config = RunConfig::from_cli(&cli).unwrap();
        assert_eq!(config.end, 0xdead_beef);
    }

    #[test]
    fn inverted_range_is_a_config_error() {
        let mut cli = base_cli();
        cli.start = 10;
        cli.end = 5;
        assert!(RunConfig::from_cli(&cli).is_err());
    }

    #[test]
    fn print_regs_without_ptrace_is_a_config_error() {
        let mut cli = base_cli();
        cli.print_regs = true;
        cli.ptrace = false;
        assert!(RunConfig::from_cli(&cli).is_err());
    }

    #[test]
    fn thumb_without_ptrace_is_a_config_error() {
        let mut cli = base_cli();
        cli.thumb = true;
        cli.ptrace = false;
        if cfg!(target_arch = "aarch64") {
            assert!(RunConfig::from_cli(&cli).is_err());
        } else {
            assert!(RunConfig::from_cli(&cli).is_err());
        }
    }
}
