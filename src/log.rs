//! Log records (§6): append-only, one open/write/close per record, never
//! held open across encodings.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use crate::error::Result;
use crate::status::ensure_data_dir;
use crate::types::{ExecResult, OracleVerdict};

/// Records one fuzzing event. Implementations must not buffer writes across
/// calls: a crash mid-run should lose at most the in-flight record.
pub trait LogSink {
    /// A disassembler discrepancy: the two oracles disagreed.
    fn discrepancy(&mut self, insn: u32, cs: &OracleVerdict, libopc: &OracleVerdict) -> Result<()>;

    /// A hidden-instruction candidate: execution didn't raise the expected
    /// illegal-instruction signal.
    fn candidate(&mut self, result: &ExecResult, print_regs: bool) -> Result<()>;
}

/// Appends one CSV-ish line per record to `data/log[suffix]`.
pub struct FileLogSink {
    path: PathBuf,
}

impl FileLogSink {
    /// Truncates any existing `data/log[suffix]` so a rerun never appends to
    /// a previous run's records; subsequent writes are append-only.
    pub fn new(data_dir: &std::path::Path, suffix: &str) -> Result<Self> {
        ensure_data_dir(data_dir)?;
        let path = data_dir.join(format!("log{suffix}"));
        OpenOptions::new().create(true).write(true).truncate(true).open(&path)?;
        Ok(FileLogSink { path })
    }

    fn append(&self, line: &str) -> Result<()> {
        let mut f = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(f, "{line}")?;
        Ok(())
    }
}

impl LogSink for FileLogSink {
    fn discrepancy(&mut self, insn: u32, cs: &OracleVerdict, libopc: &OracleVerdict) -> Result<()> {
        self.append(&format!(
            "{:08X},discrepancy,\"{}\",\"{}\"",
            insn, cs.text, libopc.text
        ))
    }

    fn candidate(&mut self, result: &ExecResult, print_regs: bool) -> Result<()> {
        let mut line = format!("{:08X},signal={}", result.insn, result.signal);
        if print_regs {
            if let Some(before) = &result.regs_before {
                line.push_str(&format!(",regs_before={before}"));
            }
            if let Some(after) = &result.regs_after {
                line.push_str(&format!(",regs_after={after}"));
            }
        }
        self.append(&line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RegisterSnapshot;

    #[test]
    fn discrepancy_line_matches_spec_format() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("data");
        let mut sink = FileLogSink::new(&data_dir, "").unwrap();
        sink.discrepancy(
            0xdead_beef,
            &OracleVerdict {
                undefined: true,
                text: "undefined".into(),
            },
            &OracleVerdict {
                undefined: false,
                text: "nop".into(),
            },
        )
        .unwrap();

        let contents = std::fs::read_to_string(data_dir.join("log")).unwrap();
        assert_eq!(contents, "DEADBEEF,discrepancy,\"undefined\",\"nop\"\n");
    }

    #[test]
    fn candidate_line_includes_regs_only_when_requested() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("data");
        let mut sink = FileLogSink::new(&data_dir, "").unwrap();
        let result = ExecResult {
            insn: 0x1234,
            signal: 11,
            died: false,
            regs_before: Some(RegisterSnapshot {
                gprs: vec![1, 2],
                pc: 0x8000,
                flags: 0,
            }),
            regs_after: Some(RegisterSnapshot {
                gprs: vec![1, 2],
                pc: 0x8004,
                flags: 0,
            }),
        };

        sink.candidate(&result, false).unwrap();
        let without_regs = std::fs::read_to_string(data_dir.join("log")).unwrap();
        assert_eq!(without_regs, "00001234,signal=11\n");

        sink.candidate(&result, true).unwrap();
        let with_regs = std::fs::read_to_string(data_dir.join("log")).unwrap();
        assert!(with_regs.lines().nth(1).unwrap().contains("regs_before="));
        assert!(with_regs.lines().nth(1).unwrap().contains("regs_after="));
    }

    #[test]
    fn appends_across_multiple_records_without_truncating() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("data");
        let mut sink = FileLogSink::new(&data_dir, "").unwrap();
        let result = ExecResult {
            insn: 1,
            signal: 5,
            died: false,
            regs_before: None,
            regs_after: None,
        };
        sink.candidate(&result, false).unwrap();
        sink.candidate(&result, false).unwrap();
        let contents = std::fs::read_to_string(data_dir.join("log")).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }
}
