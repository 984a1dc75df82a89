//! Status publication (§6): a periodic, textual snapshot of search progress.
//!
//! Content is out of scope beyond the fields already in
//! [`crate::types::SearchStatus`]; the interface the driver depends on is in
//! scope. Mirrors the teacher's `formatter.rs` split — one trait, several
//! renderers — so the driver never needs to know whether status goes to a
//! file, stdout, or nowhere at all.

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use crate::error::Result;
use crate::types::SearchStatus;

/// Publishes [`SearchStatus`] snapshots somewhere. Implementations must be
/// safe to call every `STATUS_UPDATE_RATE` encodings without noticeable cost.
pub trait StatusSink {
    fn publish(&mut self, status: &SearchStatus) -> Result<()>;
}

/// Overwrites `data/status[suffix]` atomically on every publish, via a
/// write-to-temp-then-rename so readers never see a half-written file.
pub struct FileStatusSink {
    path: PathBuf,
    tmp_path: PathBuf,
}

impl FileStatusSink {
    /// `data_dir` is created (mode `0755`) if absent.
    pub fn new(data_dir: &std::path::Path, suffix: &str) -> Result<Self> {
        ensure_data_dir(data_dir)?;
        let path = data_dir.join(format!("status{suffix}"));
        let tmp_path = data_dir.join(format!(".status{suffix}.tmp"));
        Ok(FileStatusSink { path, tmp_path })
    }
}

impl StatusSink for FileStatusSink {
    fn publish(&mut self, status: &SearchStatus) -> Result<()> {
        let text = render_status(status);
        fs::write(&self.tmp_path, text)?;
        fs::rename(&self.tmp_path, &self.path)?;
        Ok(())
    }
}

/// Prints a single, overwritten status line to stdout (via `\r`), unless
/// `--quiet` was given — the teacher's `quiet` formatter toggle, applied to
/// status rather than classification output.
pub struct StdoutStatusSink {
    quiet: bool,
}

impl StdoutStatusSink {
    pub fn new(quiet: bool) -> Self {
        StdoutStatusSink { quiet }
    }
}

impl StatusSink for StdoutStatusSink {
    fn publish(&mut self, status: &SearchStatus) -> Result<()> {
        if self.quiet {
            return Ok(());
        }
        let remaining = u64::from(u32::MAX).saturating_sub(u64::from(status.current_insn));
        print!(
            "\r0x{:08x} checked={} skipped={} filtered={} hidden={} eta={:.0}s   ",
            status.current_insn,
            status.counters.checked,
            status.counters.skipped,
            status.counters.filtered,
            status.counters.hidden_found,
            status.eta_seconds(remaining),
        );
        std::io::stdout().flush()?;
        Ok(())
    }
}

fn render_status(status: &SearchStatus) -> String {
    format!(
        "current_insn=0x{:08x}\ncs_text={}\nlibopc_text={}\nchecked={}\nskipped={}\nfiltered={}\ndiscrepancies={}\nhidden_found={}\ninsns_per_sec={:.1}\n",
        status.current_insn,
        status.cs_text,
        status.libopc_text,
        status.counters.checked,
        status.counters.skipped,
        status.counters.filtered,
        status.counters.discrepancies,
        status.counters.hidden_found,
        status.insns_per_sec,
    )
}

pub(crate) fn ensure_data_dir(data_dir: &std::path::Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(data_dir, fs::Permissions::from_mode(0o755))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Counters;

    fn sample_status() -> SearchStatus {
        SearchStatus {
            current_insn: 0x1234_5678,
            cs_text: "nop".into(),
            libopc_text: "nop".into(),
            counters: Counters {
                checked: 10,
                skipped: 2,
                filtered: 1,
                discrepancies: 0,
                hidden_found: 0,
            },
            insns_per_sec: 1000.0,
        }
    }

    #[test]
    fn file_status_sink_creates_data_dir_and_writes_status() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("data");
        let mut sink = FileStatusSink::new(&data_dir, "").unwrap();
        sink.publish(&sample_status()).unwrap();

        let contents = fs::read_to_string(data_dir.join("status")).unwrap();
        assert!(contents.contains("12345678"));
        assert!(contents.contains("checked=10"));
    }

    #[test]
    fn log_suffix_is_appended_to_status_filename() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("data");
        let mut sink = FileStatusSink::new(&data_dir, "-run2").unwrap();
        sink.publish(&sample_status()).unwrap();
        assert!(data_dir.join("status-run2").exists());
    }

    #[test]
    fn stdout_sink_is_silent_when_quiet() {
        let mut sink = StdoutStatusSink::new(true);
        assert!(sink.publish(&sample_status()).is_ok());
    }
}
