//! Disassembler oracles and their arbitration (§4.3).
//!
//! An encoding only becomes an execution candidate once both the `cs`
//! (capstone) and `libopc` (objdump/libopcodes) oracles agree it is
//! undefined. Disagreement between the two is itself interesting and gets
//! logged as a discrepancy rather than silently resolved either way.

mod capstone_oracle;
mod libopc_oracle;

pub use capstone_oracle::CapstoneOracle;
pub use libopc_oracle::LibopcOracle;

use crate::error::Result;
use crate::types::{InstructionSet, OracleVerdict};

/// A black-box disassembler: given a raw encoding, says whether it is
/// undefined and what text (if any) it produced.
pub trait Oracle {
    /// Short identifier used in error messages and discrepancy logs.
    fn name(&self) -> &'static str;

    /// Disassemble a single encoding for the given instruction set.
    fn disassemble(&mut self, insn: u32, isa: InstructionSet) -> Result<OracleVerdict>;
}

/// The verdicts of both oracles for one encoding, plus whether they agree.
pub struct Arbitration {
    pub cs: OracleVerdict,
    pub libopc: OracleVerdict,
}

impl Arbitration {
    /// True iff both oracles agree the encoding is undefined. Only
    /// encodings satisfying this gate are passed to an executor.
    pub fn both_undefined(&self) -> bool {
        self.cs.undefined && self.libopc.undefined
    }

    /// True iff the two oracles disagree on whether the encoding is
    /// undefined, regardless of which way. Worth logging even when the
    /// encoding isn't executed.
    pub fn discrepant(&self) -> bool {
        self.cs.undefined != self.libopc.undefined
    }
}

/// Runs both oracles over `insn` and returns their paired verdict.
pub fn arbitrate(
    cs: &mut dyn Oracle,
    libopc: &mut dyn Oracle,
    insn: u32,
    isa: InstructionSet,
) -> Result<Arbitration> {
    let cs_verdict = cs.disassemble(insn, isa)?;
    let libopc_verdict = libopc.disassemble(insn, isa)?;
    Ok(Arbitration {
        cs: cs_verdict,
        libopc: libopc_verdict,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_undefined_requires_both_oracles_to_agree() {
        let a = Arbitration {
            cs: OracleVerdict {
                undefined: true,
                text: String::new(),
            },
            libopc: OracleVerdict {
                undefined: true,
                text: String::new(),
            },
        };
        assert!(a.both_undefined());
        assert!(!a.discrepant());
    }

    #[test]
    fn discrepant_when_oracles_disagree() {
        let a = Arbitration {
            cs: OracleVerdict {
                undefined: true,
                text: String::new(),
            },
            libopc: OracleVerdict {
                undefined: false,
                text: "nop".into(),
            },
        };
        assert!(!a.both_undefined());
        assert!(a.discrepant());
    }
}
