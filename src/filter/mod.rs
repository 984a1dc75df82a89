//! Pre-execution filtering: should-be-one/should-be-zero bit checks, the
//! AArch64 unpredictable-LDPSW check, and the AArch32 kernel UDF breakpoint
//! trap check (§4.2).
//!
//! These exist because the disassembler oracles themselves misclassify
//! certain legal-but-constrained encodings as undefined. Filtering them out
//! before execution keeps them from being reported as hidden instructions.

mod tables;

use crate::iterator::is_thumb32;
use crate::types::{InstructionSet, OpcodeEntry};

/// Walks `opcodes` looking for the first entry whose masked bits match
/// `insn`, ignoring the entry's SBO/SBZ bits. If found, returns whether the
/// *unmasked* match fails — i.e. `insn` hits this entry's encoding class but
/// sets its should-be bits incorrectly.
///
/// In Thumb-16 mode the table entries are encoded in the lower half-word and
/// must be shifted into the upper half-word to compare against `insn`, which
/// packs a 16-bit Thumb instruction in its upper 16 bits.
fn has_incorrect_sb_bits(insn: u32, opcodes: &[OpcodeEntry], thumb16: bool) -> bool {
    for entry in opcodes {
        let (op_value, op_mask, sb_mask) = if thumb16 {
            (
                entry.op_value << 16,
                entry.op_mask << 16,
                entry.sb_mask << 16,
            )
        } else {
            (entry.op_value, entry.op_mask, entry.sb_mask)
        };

        let masked_insn = insn & op_mask;
        let sb_masked_insn = masked_insn & !sb_mask;
        let sb_masked_value = op_value & !sb_mask;

        if sb_masked_insn == sb_masked_value {
            return masked_insn != op_value;
        }
    }
    false
}

/// AArch64: detects LDPSW encodings the manual marks constrained
/// unpredictable, which some oracles report as undefined.
fn is_unpredictable_ldpsw(insn: u32) -> bool {
    let is_ldpsw = (insn & 0xfec0_0000) == 0x68c0_0000 || (insn & 0xffc0_0000) == 0x6940_0000;
    if !is_ldpsw {
        return false;
    }

    let t = insn & 0x1f;
    let n = (insn >> 5) & 0x1f;
    let t2 = (insn >> 10) & 0x1f;

    if (insn >> 23) & 1 != 0 {
        // Writeback variant.
        if (t == n || t2 == n) && n != 31 {
            return true;
        }
    }

    if (insn >> 22) & 1 != 0 {
        // Load variant.
        if t == t2 {
            return true;
        }
    }

    false
}

/// AArch32: `udf #16` with any condition prefix. Linux hooks this exact
/// encoding (ignoring the condition bits) and raises SIGTRAP instead of
/// SIGILL, which would otherwise look like a hidden instruction.
fn is_undef_breakpoint(insn: u32) -> bool {
    (insn & 0x0fff_ffff) == 0x07f0_01f0
}

/// Top-level filter gate: true iff `insn` should be skipped rather than
/// executed, for the given instruction set.
pub fn filter_instruction(insn: u32, isa: InstructionSet) -> bool {
    if isa == InstructionSet::A64 && is_unpredictable_ldpsw(insn) {
        return true;
    }

    if isa != InstructionSet::A64 && is_undef_breakpoint(insn) {
        return true;
    }

    match isa {
        InstructionSet::A64 => false,
        InstructionSet::Thumb => {
            if is_thumb32(insn) {
                has_incorrect_sb_bits(insn, tables::THUMB32_OPCODES, false)
            } else {
                has_incorrect_sb_bits(insn, tables::THUMB16_OPCODES, true)
            }
        }
        InstructionSet::A32 => {
            has_incorrect_sb_bits(insn, tables::BASE_OPCODES, false)
                || has_incorrect_sb_bits(insn, tables::COPROC_OPCODES, false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mov_r0_r0_is_filtered_by_exact_match() {
        // e1a00000 matches the nop table entry exactly (sb_mask 0), so it
        // isn't an SBO/SBZ violation and shouldn't be filtered by this gate.
        assert!(!filter_instruction(0xe1a0_0000, InstructionSet::A32));
    }

    #[test]
    fn bx_with_wrong_sbo_bits_is_filtered() {
        // bx matches op_mask 0x0ffffff0 / op_value 0x012fff10 with
        // sb_mask 0x000fff00 covering bits [19:8]. Setting those bits to
        // something other than the SBO pattern (all-ones) while keeping the
        // rest of the encoding intact should trip the filter.
        let insn = 0x012f_ff10 ^ 0x0004_0000;
        assert!(filter_instruction(insn, InstructionSet::A32));
    }

    #[test]
    fn undef_breakpoint_filtered_for_any_condition() {
        assert!(is_undef_breakpoint(0xe7f0_01f0));
        assert!(is_undef_breakpoint(0x07f0_01f0));
        assert!(filter_instruction(0xe7f0_01f0, InstructionSet::A32));
    }

    #[test]
    fn thumb16_bkpt_not_filtered() {
        // bkpt #0, packed into the upper half-word as Thumb16 expects.
        assert!(!filter_instruction(0xbe00_0000, InstructionSet::Thumb));
    }

    #[test]
    fn a64_has_no_sbo_filtering() {
        assert!(!filter_instruction(0xd65f_03c0, InstructionSet::A64));
    }

    #[test]
    fn ldpsw_writeback_with_t_equal_n_is_unpredictable() {
        // LDPSW post-index variant: bits [31:22] = 0b0110100011,
        // writeback bit 23 set; choose t == n (t=n=1, n != 31).
        let insn = 0x68c0_0000 | (1 << 0) | (1 << 5);
        assert!(is_unpredictable_ldpsw(insn));
        assert!(filter_instruction(insn, InstructionSet::A64));
    }
}
