//! The driver (§4.6): orchestrates the encoding iterator, the filter, the
//! oracle pair, and the selected executor into a single sequential run.
//!
//! Generalizes the teacher's `main.rs` top-level flow (parse input, run one
//! analysis, report) into a long-running loop over every encoding in range,
//! publishing a status snapshot every [`STATUS_UPDATE_RATE`] encodings.

use crate::config::RunConfig;
use crate::error::Result;
use crate::exec::Executor;
use crate::filter::filter_instruction;
use crate::iterator::EncodingIterator;
use crate::log::LogSink;
use crate::oracle::{arbitrate, Oracle};
use crate::status::StatusSink;
use crate::types::{Counters, SearchStatus};

/// How often (in encodings visited) the driver publishes a status snapshot.
/// Matches the reference tool's fixed update cadence.
pub const STATUS_UPDATE_RATE: u64 = 10_000;

/// Ties together the components a single run needs: oracles, an executor,
/// and the sinks status/log records are published to.
pub struct Driver<'a> {
    config: RunConfig,
    cs: &'a mut dyn Oracle,
    libopc: &'a mut dyn Oracle,
    executor: &'a mut dyn Executor,
    status_sink: &'a mut dyn StatusSink,
    log_sink: &'a mut dyn LogSink,
}

impl<'a> Driver<'a> {
    pub fn new(
        config: RunConfig,
        cs: &'a mut dyn Oracle,
        libopc: &'a mut dyn Oracle,
        executor: &'a mut dyn Executor,
        status_sink: &'a mut dyn StatusSink,
        log_sink: &'a mut dyn LogSink,
    ) -> Self {
        Driver {
            config,
            cs,
            libopc,
            executor,
            status_sink,
            log_sink,
        }
    }

    /// Runs the configured range to completion, returning the final counters.
    pub fn run(&mut self) -> Result<Counters> {
        let mut counters = Counters::default();
        let started = std::time::Instant::now();
        let thumb = self.config.isa.is_thumb();
        let iter = EncodingIterator::new(self.config.start, self.config.end, self.config.mask, thumb);

        let mut last_cs_text = String::new();
        let mut last_libopc_text = String::new();
        let mut since_status = 0u64;

        for insn in iter {
            tracing::trace!(insn = format_args!("{insn:08x}"), "visiting encoding");

            let arbitration = arbitrate(self.cs, self.libopc, insn, self.config.isa)?;
            last_cs_text = arbitration.cs.text.clone();
            last_libopc_text = arbitration.libopc.text.clone();

            if self.config.discreps && arbitration.discrepant() {
                counters.discrepancies += 1;
                self.log_sink
                    .discrepancy(insn, &arbitration.cs, &arbitration.libopc)?;
            }

            if !arbitration.both_undefined() && !self.config.exec_all {
                counters.skipped += 1;
                since_status += 1;
                self.maybe_publish_status(
                    &mut since_status,
                    insn,
                    &last_cs_text,
                    &last_libopc_text,
                    &counters,
                    started,
                )?;
                continue;
            }

            if self.config.no_exec {
                counters.checked += 1;
                since_status += 1;
                self.maybe_publish_status(
                    &mut since_status,
                    insn,
                    &last_cs_text,
                    &last_libopc_text,
                    &counters,
                    started,
                )?;
                continue;
            }

            if self.config.filter && !self.config.exec_all && filter_instruction(insn, self.config.isa)
            {
                counters.filtered += 1;
                since_status += 1;
                self.maybe_publish_status(
                    &mut since_status,
                    insn,
                    &last_cs_text,
                    &last_libopc_text,
                    &counters,
                    started,
                )?;
                continue;
            }

            let result = self.executor.execute(insn)?;
            counters.checked += 1;

            if result.is_hidden_candidate(libc::SIGILL) {
                counters.hidden_found += 1;
                tracing::debug!(insn = format_args!("{insn:08x}"), signal = result.signal, "hidden instruction candidate");
                self.log_sink.candidate(&result, self.config.print_regs)?;
            }

            since_status += 1;
            self.maybe_publish_status(
                &mut since_status,
                insn,
                &last_cs_text,
                &last_libopc_text,
                &counters,
                started,
            )?;
        }

        Ok(counters)
    }

    fn maybe_publish_status(
        &mut self,
        since_status: &mut u64,
        insn: u32,
        cs_text: &str,
        libopc_text: &str,
        counters: &Counters,
        started: std::time::Instant,
    ) -> Result<()> {
        if *since_status < STATUS_UPDATE_RATE {
            return Ok(());
        }
        *since_status = 0;
        let elapsed = started.elapsed().as_secs_f64().max(f64::EPSILON);
        let status = SearchStatus {
            current_insn: insn,
            cs_text: cs_text.to_string(),
            libopc_text: libopc_text.to_string(),
            counters: counters.clone(),
            insns_per_sec: counters.visited() as f64 / elapsed,
        };
        self.status_sink.publish(&status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Backend;
    use crate::error::Result as FzResult;
    use crate::types::{ExecResult, InstructionSet, OracleVerdict};

    struct StubOracle {
        undefined: bool,
    }

    impl Oracle for StubOracle {
        fn name(&self) -> &'static str {
            "stub"
        }
        fn disassemble(&mut self, _insn: u32, _isa: InstructionSet) -> FzResult<OracleVerdict> {
            Ok(OracleVerdict {
                undefined: self.undefined,
                text: if self.undefined { String::new() } else { "nop".into() },
            })
        }
    }

    struct StubExecutor {
        signal: i32,
        calls: usize,
    }

    impl Executor for StubExecutor {
        fn name(&self) -> &'static str {
            "stub"
        }
        fn execute(&mut self, insn: u32) -> FzResult<ExecResult> {
            self.calls += 1;
            Ok(ExecResult {
                insn,
                signal: self.signal,
                died: false,
                regs_before: None,
                regs_after: None,
            })
        }
    }

    struct NullStatusSink;
    impl StatusSink for NullStatusSink {
        fn publish(&mut self, _status: &SearchStatus) -> FzResult<()> {
            Ok(())
        }
    }

    struct CollectingLogSink {
        candidates: usize,
        discrepancies: usize,
    }
    impl LogSink for CollectingLogSink {
        fn discrepancy(
            &mut self,
            _insn: u32,
            _cs: &OracleVerdict,
            _libopc: &OracleVerdict,
        ) -> FzResult<()> {
            self.discrepancies += 1;
            Ok(())
        }
        fn candidate(&mut self, _result: &ExecResult, _print_regs: bool) -> FzResult<()> {
            self.candidates += 1;
            Ok(())
        }
    }

    fn small_range_config(exec_all: bool) -> RunConfig {
        RunConfig {
            start: 0,
            end: 3,
            mask: 0xFFFF_FFFF,
            isa: InstructionSet::A32,
            backend: Backend::InProcess,
            no_exec: false,
            exec_all,
            filter: false,
            discreps: true,
            print_regs: false,
            quiet: true,
            log_suffix: String::new(),
        }
    }

    #[test]
    fn both_undefined_gates_execution() {
        let mut cs = StubOracle { undefined: true };
        let mut libopc = StubOracle { undefined: true };
        let mut executor = StubExecutor { signal: 11, calls: 0 };
        let mut status = NullStatusSink;
        let mut log = CollectingLogSink {
            candidates: 0,
            discrepancies: 0,
        };
        let config = small_range_config(false);
        let mut driver = Driver::new(config, &mut cs, &mut libopc, &mut executor, &mut status, &mut log);
        let counters = driver.run().unwrap();

        assert_eq!(executor.calls, 4);
        assert_eq!(counters.checked, 4);
        assert_eq!(counters.hidden_found, 4);
        assert_eq!(log.candidates, 4);
    }

    #[test]
    fn discrepancy_without_agreement_skips_and_never_executes() {
        let mut cs = StubOracle { undefined: true };
        let mut libopc = StubOracle { undefined: false };
        let mut executor = StubExecutor { signal: 11, calls: 0 };
        let mut status = NullStatusSink;
        let mut log = CollectingLogSink {
            candidates: 0,
            discrepancies: 0,
        };
        let config = small_range_config(false);
        let mut driver = Driver::new(config, &mut cs, &mut libopc, &mut executor, &mut status, &mut log);
        let counters = driver.run().unwrap();

        assert_eq!(executor.calls, 0);
        assert_eq!(counters.skipped, 4);
        assert_eq!(counters.discrepancies, 4);
        assert_eq!(log.discrepancies, 4);
    }

    #[test]
    fn exec_all_bypasses_oracle_disagreement() {
        let mut cs = StubOracle { undefined: true };
        let mut libopc = StubOracle { undefined: false };
        let mut executor = StubExecutor { signal: 11, calls: 0 };
        let mut status = NullStatusSink;
        let mut log = CollectingLogSink {
            candidates: 0,
            discrepancies: 0,
        };
        let config = small_range_config(true);
        let mut driver = Driver::new(config, &mut cs, &mut libopc, &mut executor, &mut status, &mut log);
        let counters = driver.run().unwrap();

        assert_eq!(executor.calls, 4);
        assert_eq!(counters.checked, 4);
    }

    #[test]
    fn no_exec_counts_as_checked_without_running_executor() {
        let mut cs = StubOracle { undefined: true };
        let mut libopc = StubOracle { undefined: true };
        let mut executor = StubExecutor { signal: 11, calls: 0 };
        let mut status = NullStatusSink;
        let mut log = CollectingLogSink {
            candidates: 0,
            discrepancies: 0,
        };
        let mut config = small_range_config(false);
        config.no_exec = true;
        let mut driver = Driver::new(config, &mut cs, &mut libopc, &mut executor, &mut status, &mut log);
        let counters = driver.run().unwrap();

        assert_eq!(executor.calls, 0);
        assert_eq!(counters.checked, 4);
    }

    #[test]
    fn sigill_result_is_not_a_hidden_candidate() {
        let mut cs = StubOracle { undefined: true };
        let mut libopc = StubOracle { undefined: true };
        let mut executor = StubExecutor {
            signal: libc::SIGILL,
            calls: 0,
        };
        let mut status = NullStatusSink;
        let mut log = CollectingLogSink {
            candidates: 0,
            discrepancies: 0,
        };
        let config = small_range_config(false);
        let mut driver = Driver::new(config, &mut cs, &mut libopc, &mut executor, &mut status, &mut log);
        let counters = driver.run().unwrap();

        assert_eq!(counters.hidden_found, 0);
        assert_eq!(log.candidates, 0);
    }
}
