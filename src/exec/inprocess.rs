//! The in-process executor (§4.4): runs a single candidate encoding inline
//! in this process, on a small RWX trampoline page, and recovers from the
//! resulting signal without the cost of a fork.
//!
//! Generalizes the reference fuzzer's single-architecture, SIGILL-only
//! trampoline (`original_source/src/fuzzer.c`) to both architectures and to
//! SIGSEGV/SIGTRAP, since hidden instructions are not guaranteed to raise
//! SIGILL specifically.

use std::os::raw::c_int;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

use crate::error::{FuzzError, Result};
use crate::types::{ExecResult, InstructionSet};

use super::Executor;

/// Signal handlers communicate with the driver exclusively through these
/// statics: no allocation, no locking, nothing a signal handler can't do
/// safely. `TRAMPOLINE_RETURN` is the address execution resumes at once a
/// signal has been recorded, skipping whatever the candidate instruction
/// would otherwise have done.
static TRAMPOLINE_RETURN: AtomicUsize = AtomicUsize::new(0);
static CAUGHT_SIGNAL: AtomicI32 = AtomicI32::new(0);
static HANDLERS_INSTALLED: AtomicI32 = AtomicI32::new(0);
/// Set for the duration of the candidate call only. A signal arriving while
/// this is 0 did not come from the instruction under test and means the
/// fuzzer itself is broken; the handler has no safe way to recover from that
/// case, so it reports and aborts instead of rewriting `pc`.
static EXECUTING: AtomicI32 = AtomicI32::new(0);

/// Upper bound on the trampoline's total size (prologue + slot + epilogue),
/// used only to size the icache flush range; the real boundary per
/// architecture is computed by `slot_offset`/`epilogue_offset` below.
const TRAMPOLINE_LEN: usize = 512;

/// Executes candidate encodings on a dedicated RWX page in this process.
pub struct InProcessExecutor {
    page: *mut u8,
    page_len: usize,
    isa: InstructionSet,
}

// The page is only ever touched from the thread that owns this executor,
// one encoding at a time; nothing here is shared across threads.
unsafe impl Send for InProcessExecutor {}

impl InProcessExecutor {
    /// Maps the trampoline page and installs the signal handlers, once per
    /// process. Safe to construct more than once; later instances reuse the
    /// already-installed handlers and only map a fresh page.
    ///
    /// `isa` must match the host architecture (`Thumb`/`A32` on `arm`,
    /// `A64` on `aarch64`); the caller (config validation) enforces this.
    pub fn new(isa: InstructionSet) -> Result<Self> {
        let page_len = page_size();
        let page = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                page_len,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if page == libc::MAP_FAILED {
            return Err(FuzzError::MmapFailed {
                errno: unsafe { *libc::__errno_location() },
            });
        }
        let page = page as *mut u8;

        write_trampoline(page, isa);
        TRAMPOLINE_RETURN.store(page as usize + epilogue_offset(isa), Ordering::SeqCst);

        if HANDLERS_INSTALLED.swap(1, Ordering::SeqCst) == 0 {
            install_handlers()?;
        }

        Ok(InProcessExecutor {
            page,
            page_len,
            isa,
        })
    }
}

impl Drop for InProcessExecutor {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.page as *mut libc::c_void, self.page_len);
        }
    }
}

impl Executor for InProcessExecutor {
    fn name(&self) -> &'static str {
        "inprocess"
    }

    fn execute(&mut self, insn: u32) -> Result<ExecResult> {
        CAUGHT_SIGNAL.store(0, Ordering::SeqCst);

        unsafe {
            let slot = self.page.add(slot_offset(self.isa));
            std::ptr::write_volatile(slot as *mut u32, insn.to_le());
            flush_icache_range(self.page, TRAMPOLINE_LEN);
            // Interworking into Thumb state requires the low bit of the
            // branch target to be set; AArch64 has no such bit. Entry is
            // always the trampoline's prologue (offset 0), which falls
            // through into the slot and then the epilogue.
            let entry_addr = if self.isa.is_thumb() {
                self.page as usize | 1
            } else {
                self.page as usize
            };
            let entry: extern "C" fn() = std::mem::transmute(entry_addr);
            EXECUTING.store(1, Ordering::SeqCst);
            entry();
            EXECUTING.store(0, Ordering::SeqCst);
        }

        let signal = CAUGHT_SIGNAL.load(Ordering::SeqCst);
        Ok(ExecResult {
            insn,
            signal,
            died: false,
            regs_before: None,
            regs_after: None,
        })
    }
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Offset of the candidate instruction slot within the page: right after the
/// prologue. AArch64 and A32 both have a real register-save-and-zero
/// prologue (below); Thumb keeps the slot at offset 0 (unreachable in
/// practice — `RunConfig::validate` requires the traced-child executor for
/// Thumb).
#[cfg(target_arch = "aarch64")]
fn slot_offset(_isa: InstructionSet) -> usize {
    AARCH64_PROLOGUE_LEN
}

#[cfg(target_arch = "arm")]
fn slot_offset(isa: InstructionSet) -> usize {
    if isa.is_thumb() {
        0
    } else {
        ARM32_PROLOGUE_LEN
    }
}

/// Offset of the trampoline's epilogue: the candidate always occupies a
/// full 32-bit slot, even for 16-bit Thumb encodings (packed in the upper
/// half-word, per the encoding iterator's convention).
fn epilogue_offset(isa: InstructionSet) -> usize {
    slot_offset(isa) + 4
}

/// Writes the full trampoline (prologue, if any, plus the epilogue) around
/// the candidate slot. The slot itself is left untouched — `execute` writes
/// it fresh every call.
fn write_trampoline(page: *mut u8, isa: InstructionSet) {
    write_prologue(page, isa);
    write_epilogue(page, isa);
}

/// Number of general-purpose registers (`x0`-`x30`) saved and zeroed by the
/// AArch64 prologue.
#[cfg(target_arch = "aarch64")]
const AARCH64_GPR_COUNT: u32 = 31;

/// `x0..=x30` pushed as 16 register pairs (the last pair is `x30`/`xzr`,
/// padding to keep 16-byte stack alignment), 64 bytes of code, plus one
/// `movz xN, #0` per register, 124 bytes of code: 188 bytes total.
#[cfg(target_arch = "aarch64")]
const AARCH64_PROLOGUE_LEN: usize = 16 * 4 + AARCH64_GPR_COUNT as usize * 4;

#[cfg(target_arch = "aarch64")]
const XZR: u32 = 31;
#[cfg(target_arch = "aarch64")]
const SP_REG: u32 = 31;

/// `STP <Xt>, <Xt2>, [SP, #imm]!` (pre-indexed, 64-bit GP registers).
#[cfg(target_arch = "aarch64")]
fn stp_pre_sp(rt: u32, rt2: u32, imm: i32) -> u32 {
    let imm7 = ((imm / 8) & 0x7f) as u32;
    0xA980_0000 | (imm7 << 15) | (rt2 << 10) | (SP_REG << 5) | rt
}

/// `LDP <Xt>, <Xt2>, [SP], #imm` (post-indexed, 64-bit GP registers).
#[cfg(target_arch = "aarch64")]
fn ldp_post_sp(rt: u32, rt2: u32, imm: i32) -> u32 {
    let imm7 = ((imm / 8) & 0x7f) as u32;
    0xA8C0_0000 | (imm7 << 15) | (rt2 << 10) | (SP_REG << 5) | rt
}

/// `MOVZ Xd, #0` (alias `mov xd, #0`).
#[cfg(target_arch = "aarch64")]
fn movz_zero(rd: u32) -> u32 {
    0xD280_0000 | rd
}

/// Saves `x0`-`x30` to the stack, then zeroes them, so the candidate can't
/// observe or leak any state from the caller and so a register it clobbers
/// is restored by the matching epilogue.
#[cfg(target_arch = "aarch64")]
fn write_prologue(page: *mut u8, _isa: InstructionSet) {
    let mut words = Vec::with_capacity(AARCH64_PROLOGUE_LEN / 4);
    let mut r = 0u32;
    while r < 30 {
        words.push(stp_pre_sp(r, r + 1, -16));
        r += 2;
    }
    words.push(stp_pre_sp(30, XZR, -16));
    for r in 0..AARCH64_GPR_COUNT {
        words.push(movz_zero(r));
    }
    debug_assert_eq!(words.len() * 4, AARCH64_PROLOGUE_LEN);
    unsafe {
        for (i, word) in words.iter().enumerate() {
            std::ptr::write_unaligned(page.add(i * 4) as *mut u32, word.to_le());
        }
    }
}

/// Restores `x0`-`x30` from the stack (mirroring the prologue's push order
/// in reverse) and returns.
#[cfg(target_arch = "aarch64")]
fn write_epilogue(page: *mut u8, isa: InstructionSet) {
    const RET: u32 = 0xd65f_03c0; // ret
    let mut words = Vec::new();
    words.push(ldp_post_sp(30, XZR, 16));
    let mut r = 28i32;
    while r >= 0 {
        words.push(ldp_post_sp(r as u32, r as u32 + 1, 16));
        r -= 2;
    }
    words.push(RET);
    let base = epilogue_offset(isa);
    unsafe {
        for (i, word) in words.iter().enumerate() {
            std::ptr::write_unaligned(page.add(base + i * 4) as *mut u32, word.to_le());
        }
    }
}

/// `r0`-`r12` plus `lr`: the registers A32's `push`/`pop` multiple-register
/// form can save in one instruction (14 registers, matching the AArch64
/// prologue's GPR coverage minus the dedicated `sp`).
#[cfg(target_arch = "arm")]
const ARM32_SAVED_REGS: u32 = 0x5fff; // bit i set for r0..=r12 and r14 (lr)

/// `push {r0-r12,lr}` (4 bytes) plus one `mov rN, #0` per saved register (14
/// registers, 56 bytes): 60 bytes total.
#[cfg(target_arch = "arm")]
const ARM32_PROLOGUE_LEN: usize = 4 + 14 * 4;

/// Thumb in-process execution has no register-save prologue: the slot sits
/// at offset 0 and the candidate runs with whatever register state the
/// driver's own call left behind. `RunConfig::validate` rejects Thumb
/// in-process runs, so this branch is unreachable outside tests that
/// construct the trampoline directly.
#[cfg(target_arch = "arm")]
fn write_prologue(page: *mut u8, isa: InstructionSet) {
    if isa.is_thumb() {
        return;
    }
    const PUSH: u32 = 0xe92d_0000 | ARM32_SAVED_REGS; // push {r0-r12, lr}
    let mut words = Vec::with_capacity(ARM32_PROLOGUE_LEN / 4);
    words.push(PUSH);
    for r in 0..13u32 {
        words.push(0xe3a0_0000 | (r << 12)); // mov rN, #0
    }
    words.push(0xe3a0_e000); // mov lr, #0
    debug_assert_eq!(words.len() * 4, ARM32_PROLOGUE_LEN);
    unsafe {
        for (i, word) in words.iter().enumerate() {
            std::ptr::write_unaligned(page.add(i * 4) as *mut u32, word.to_le());
        }
    }
}

/// Writes the trampoline's return instruction right after the candidate
/// instruction slot. A32 first restores `r0`-`r12`/`lr` (mirroring
/// `write_prologue`) and then returns; Thumb has no prologue to unwind and
/// just returns.
#[cfg(target_arch = "arm")]
fn write_epilogue(page: *mut u8, isa: InstructionSet) {
    const BX_LR_A32: u32 = 0xe12f_ff1e; // bx lr (A32, unconditional)
    const BX_LR_THUMB: u16 = 0x4770; // bx lr (Thumb-16)
    let base = epilogue_offset(isa);
    unsafe {
        if isa.is_thumb() {
            std::ptr::write_unaligned(page.add(base) as *mut u16, BX_LR_THUMB.to_le());
        } else {
            const POP: u32 = 0xe8bd_0000 | ARM32_SAVED_REGS; // pop {r0-r12, lr}
            std::ptr::write_unaligned(page.add(base) as *mut u32, POP.to_le());
            std::ptr::write_unaligned(page.add(base + 4) as *mut u32, BX_LR_A32.to_le());
        }
    }
}

#[cfg(target_arch = "aarch64")]
unsafe fn flush_icache_range(start: *mut u8, len: usize) {
    // Self-modifying code on AArch64 needs explicit cache maintenance: clean
    // each data cache line to unification, then invalidate the matching
    // instruction cache line, then synchronize.
    let mut addr = start as usize & !63;
    let end = start as usize + len;
    while addr < end {
        std::arch::asm!("dc cvau, {0}", in(reg) addr);
        addr += 64;
    }
    std::arch::asm!("dsb ish");
    let mut addr = start as usize & !63;
    while addr < end {
        std::arch::asm!("ic ivau, {0}", in(reg) addr);
        addr += 64;
    }
    std::arch::asm!("dsb ish");
    std::arch::asm!("isb");
}

#[cfg(target_arch = "arm")]
unsafe fn flush_icache_range(start: *mut u8, len: usize) {
    // ARM Linux's cacheflush syscall has no libc wrapper and no stable
    // SYS_* constant across targets; 0xf0002 is its fixed ARM EABI number.
    const SYS_CACHEFLUSH: libc::c_long = 0xf0002;
    libc::syscall(SYS_CACHEFLUSH, start as usize, start as usize + len, 0);
}

fn install_handlers() -> Result<()> {
    unsafe {
        for sig in [libc::SIGILL, libc::SIGSEGV, libc::SIGTRAP] {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = handle_signal as usize;
            action.sa_flags = libc::SA_SIGINFO;
            libc::sigemptyset(&mut action.sa_mask);
            if libc::sigaction(sig, &action, std::ptr::null_mut()) != 0 {
                return Err(FuzzError::TrampolineSetup {
                    message: format!("sigaction failed for signal {sig}"),
                });
            }
        }
    }
    Ok(())
}

extern "C" fn handle_signal(sig: c_int, _info: *mut libc::siginfo_t, ctx: *mut libc::c_void) {
    if EXECUTING.load(Ordering::SeqCst) == 0 {
        // This signal did not come from the candidate instruction under
        // test; the fuzzer has a bug outside the test window. Nothing here
        // is safe to fix up, so report and die loudly rather than silently
        // resuming into a corrupted state.
        // No `format!`: that allocates, which is not async-signal-safe. Write
        // a fixed, pre-built byte string instead.
        let msg: &[u8] = match sig {
            libc::SIGILL => b"armshake: caught SIGILL outside the test window, aborting\n",
            libc::SIGSEGV => b"armshake: caught SIGSEGV outside the test window, aborting\n",
            libc::SIGTRAP => b"armshake: caught SIGTRAP outside the test window, aborting\n",
            _ => b"armshake: caught an unexpected signal outside the test window, aborting\n",
        };
        unsafe {
            libc::write(libc::STDERR_FILENO, msg.as_ptr() as *const libc::c_void, msg.len());
        }
        unsafe { libc::abort() };
    }

    CAUGHT_SIGNAL.store(sig, Ordering::SeqCst);
    let return_addr = TRAMPOLINE_RETURN.load(Ordering::SeqCst);

    #[cfg(target_arch = "aarch64")]
    unsafe {
        let ctx = ctx as *mut libc::ucontext_t;
        (*ctx).uc_mcontext.pc = return_addr as u64;
    }

    #[cfg(target_arch = "arm")]
    unsafe {
        let ctx = ctx as *mut libc::ucontext_t;
        (*ctx).uc_mcontext.arm_pc = return_addr as libc::c_ulong;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epilogue_offset_follows_slot_offset() {
        assert_eq!(
            epilogue_offset(InstructionSet::A32),
            slot_offset(InstructionSet::A32) + 4
        );
    }

    #[cfg(target_arch = "aarch64")]
    #[test]
    fn aarch64_prologue_emits_one_movz_per_gpr_and_full_push_pop_pairs() {
        // 16 stp + 31 movz.
        assert_eq!(AARCH64_PROLOGUE_LEN, (16 + 31) * 4);
        assert_eq!(slot_offset(InstructionSet::A64), AARCH64_PROLOGUE_LEN);
    }

    #[cfg(target_arch = "arm")]
    #[test]
    fn a32_prologue_pushes_and_zeroes_every_saved_register_thumb_has_none() {
        // push + 14 mov-immediates (r0-r12, lr).
        assert_eq!(ARM32_PROLOGUE_LEN, 4 + 14 * 4);
        assert_eq!(slot_offset(InstructionSet::A32), ARM32_PROLOGUE_LEN);
        assert_eq!(slot_offset(InstructionSet::Thumb), 0);
    }
}
