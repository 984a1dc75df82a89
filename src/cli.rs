//! Command-line surface, modeled on the teacher's `clap::Parser`-derived
//! `Args` struct: one struct mapping 1:1 to the flag table, parsed once in
//! `main` and converted into a [`crate::config::RunConfig`].

use clap::Parser;

/// Hidden-instruction fuzzer for 32-bit ARM (A32/Thumb) and AArch64.
#[derive(Parser, Debug, Clone)]
#[command(name = "armshake")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Start of encoding range (inclusive)
    #[arg(short = 's', long, value_parser = parse_hex, default_value = "0x00000000")]
    pub start: u32,

    /// End of encoding range (inclusive)
    #[arg(short = 'e', long, value_parser = parse_hex, default_value = "0xFFFFFFFF")]
    pub end: u32,

    /// Count only, do not execute
    #[arg(short = 'n', long)]
    pub no_exec: bool,

    /// Append S to data/log and data/status path names
    #[arg(short = 'l', long = "log-suffix", value_name = "S")]
    pub log_suffix: Option<String>,

    /// Suppress status-line rendering to stdout
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Log disassembler discrepancies
    #[arg(short = 'c', long)]
    pub discreps: bool,

    /// Use the traced-child executor
    #[arg(short = 'p', long)]
    pub ptrace: bool,

    /// Bypass oracle and filter gates
    #[arg(short = 'x', long = "exec-all")]
    pub exec_all: bool,

    /// Print reg diff (traced-child back-end only)
    #[arg(short = 'r', long = "print-regs")]
    pub print_regs: bool,

    /// `end := start`
    #[arg(short = 'i', long = "single-exec")]
    pub single_exec: bool,

    /// Enable the encoding filter
    #[arg(short = 'f', long)]
    pub filter: bool,

    /// Iteration mask (low 32 bits)
    #[arg(short = 'm', long, value_parser = parse_hex, default_value = "0xFFFFFFFF")]
    pub mask: u32,

    /// Thumb instruction set (A32 only)
    #[arg(short = 't', long)]
    pub thumb: bool,

    /// Raise logging to debug (ambient addition, not part of the byte-level
    /// interface table)
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

/// Accepts both `0x`/`0X`-prefixed and bare hex, per the `HEX` argument
/// convention used throughout the flag table.
fn parse_hex(s: &str) -> Result<u32, String> {
    let trimmed = s.trim();
    let (digits, radix) = match trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X"))
    {
        Some(hex) => (hex, 16),
        None => (trimmed, 16),
    };
    u32::from_str_radix(digits, radix).map_err(|e| format!("invalid hex value {s:?}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_defaults() {
        let cli = Cli::try_parse_from(["armshake"]).unwrap();
        assert_eq!(cli.start, 0x0000_0000);
        assert_eq!(cli.end, 0xFFFF_FFFF);
        assert!(!cli.no_exec);
    }

    #[test]
    fn parses_0x_prefixed_hex() {
        let cli = Cli::try_parse_from(["armshake", "-s", "0xdeadbeef", "-e", "0xdeadbeef"])
            .unwrap();
        assert_eq!(cli.start, 0xdead_beef);
        assert_eq!(cli.end, 0xdead_beef);
    }

    #[test]
    fn parses_bare_hex_without_prefix() {
        let cli = Cli::try_parse_from(["armshake", "-m", "ff"]).unwrap();
        assert_eq!(cli.mask, 0xff);
    }

    #[test]
    fn short_flags_set_gates() {
        let cli = Cli::try_parse_from(["armshake", "-x", "-f", "-p", "-c", "-r", "-i"]).unwrap();
        assert!(cli.exec_all);
        assert!(cli.filter);
        assert!(cli.ptrace);
        assert!(cli.discreps);
        assert!(cli.print_regs);
        assert!(cli.single_exec);
    }

    #[test]
    fn rejects_malformed_hex() {
        assert!(Cli::try_parse_from(["armshake", "-s", "not-hex"]).is_err());
    }
}
