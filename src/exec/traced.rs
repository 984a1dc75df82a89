//! The traced-child executor (§4.5): a forked tracee loops
//! `{breakpoint; candidate slot; branch back}` under `ptrace`, giving the
//! driver full register visibility at the cost of a syscall round trip per
//! encoding.

use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};

use crate::error::{FuzzError, Result};
use crate::types::{ExecResult, InstructionSet, RegisterSnapshot};

use super::Executor;

/// Size of the tracee's instruction buffer: breakpoint, candidate slot,
/// unconditional branch back to the breakpoint.
const TRACEE_PAGE_LEN: usize = 4096;

/// Drives a forked tracee through one candidate encoding at a time.
///
/// The tracee sits in a tight loop of `brk; <candidate>; b -8`. Each call to
/// [`Executor::execute`] overwrites the candidate slot, resumes the tracee
/// until it re-hits the loop's leading breakpoint, and reads back its
/// registers. If the tracee dies (the candidate brought the whole process
/// down, not just raised a recoverable signal), it is respawned and the
/// caller is told so via [`ExecResult::died`].
pub struct TracedExecutor {
    isa: InstructionSet,
    pid: Pid,
    page_addr: u64,
}

impl TracedExecutor {
    pub fn new(isa: InstructionSet) -> Result<Self> {
        let pid = spawn_tracee(isa)?;
        // The tracee maps its own RWX page and reports the address via the
        // first byte of its stdout line before entering the trace loop. See
        // `spawn_tracee` for the handshake.
        let page_addr = 0; // patched in by `spawn_tracee`'s caller below.
        let mut executor = TracedExecutor {
            isa,
            pid,
            page_addr,
        };
        executor.page_addr = read_handshake(pid)?;
        Ok(executor)
    }

    fn respawn(&mut self) -> Result<()> {
        let pid = spawn_tracee(self.isa)?;
        self.pid = pid;
        self.page_addr = read_handshake(pid)?;
        Ok(())
    }
}

impl Executor for TracedExecutor {
    fn name(&self) -> &'static str {
        "traced"
    }

    fn execute(&mut self, insn: u32) -> Result<ExecResult> {
        let regs_before = read_registers(self.pid, self.isa)?;

        write_candidate(self.pid, self.page_addr, insn, self.isa)?;
        reset_registers(self.pid, self.isa, self.page_addr)?;
        ptrace::cont(self.pid, None).map_err(|e| trace_err(e, "cont"))?;

        match waitpid(self.pid, None) {
            Ok(WaitStatus::Exited(_, _)) | Ok(WaitStatus::Signaled(_, _, _)) => {
                self.respawn()?;
                Ok(ExecResult {
                    insn,
                    signal: 0,
                    died: true,
                    regs_before: Some(regs_before),
                    regs_after: None,
                })
            }
            Ok(WaitStatus::Stopped(_, sig)) => {
                let regs_after = read_registers(self.pid, self.isa)?;
                // The slot is always `page_addr + 4`. If post-stop pc is
                // still there, the candidate itself raised this signal
                // synchronously (spec.md §4.5 step 8) — report it as-is.
                // Otherwise the tracee looped back around to the leading
                // breakpoint on its own, meaning the candidate ran to
                // completion; a `SIGTRAP` there is the clean case and is
                // reported as signal 0 (step 9). `reset_registers` on the
                // next call always re-pins pc to the slot regardless of
                // where it is now, so there's no need to separately back pc
                // up and re-continue before returning.
                let slot_addr = self.page_addr + 4;
                let signal = if regs_after.pc != slot_addr && sig == Signal::SIGTRAP {
                    0
                } else {
                    sig as i32
                };
                reset_pc_to_breakpoint(self.pid, self.isa, self.page_addr)?;
                Ok(ExecResult {
                    insn,
                    signal,
                    died: false,
                    regs_before: Some(regs_before),
                    regs_after: Some(regs_after),
                })
            }
            Ok(_) => Err(FuzzError::UnexpectedSignal { signal: 0, insn }),
            Err(e) => Err(FuzzError::TraceSetup {
                message: format!("waitpid failed: {e}"),
            }),
        }
    }
}

fn trace_err(e: nix::Error, op: &str) -> FuzzError {
    FuzzError::TraceSetup {
        message: format!("ptrace {op} failed: {e}"),
    }
}

/// Forks a tracee that maps its own RWX loop page, writes
/// `{brk #0; nop; b .-8}`, raises `SIGSTOP` to hand control to the parent,
/// and calls `PTRACE_TRACEME` before doing so.
fn spawn_tracee(isa: InstructionSet) -> Result<Pid> {
    match unsafe { fork() }.map_err(|e| trace_err(e, "fork"))? {
        ForkResult::Parent { child } => {
            waitpid(child, None).map_err(|e| FuzzError::TraceSetup {
                message: format!("waitpid on spawn failed: {e}"),
            })?;
            ptrace::setoptions(child, ptrace::Options::PTRACE_O_TRACEEXIT)
                .map_err(|e| trace_err(e, "setoptions"))?;
            Ok(child)
        }
        ForkResult::Child => {
            tracee_main(isa);
        }
    }
}

/// Runs in the forked child. Never returns.
fn tracee_main(isa: InstructionSet) -> ! {
    unsafe {
        ptrace::traceme().ok();

        let page = libc::mmap(
            std::ptr::null_mut(),
            TRACEE_PAGE_LEN,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        if page == libc::MAP_FAILED {
            libc::_exit(1);
        }

        write_tracee_loop(page as *mut u8, isa);

        libc::raise(libc::SIGSTOP);

        let entry_addr = if isa.is_thumb() {
            page as usize | 1
        } else {
            page as usize
        };
        let entry: extern "C" fn() = std::mem::transmute(entry_addr);
        entry();
        libc::_exit(0);
    }
}

/// Writes `brk #0` (or the Thumb `bkpt`), a candidate slot initialized to a
/// harmless nop, and a branch back to the breakpoint, architecture-specific.
#[cfg(target_arch = "aarch64")]
unsafe fn write_tracee_loop(page: *mut u8, _isa: InstructionSet) {
    const BRK: u32 = 0xd420_0000; // brk #0
    const NOP: u32 = 0xd503_201f; // nop
    const B_BACK: u32 = 0x1400_0000 | ((-2i32 as u32) & 0x03ff_ffff); // b .-8
    std::ptr::write_unaligned(page as *mut u32, BRK.to_le());
    std::ptr::write_unaligned(page.add(4) as *mut u32, NOP.to_le());
    std::ptr::write_unaligned(page.add(8) as *mut u32, B_BACK.to_le());
}

#[cfg(target_arch = "arm")]
unsafe fn write_tracee_loop(page: *mut u8, isa: InstructionSet) {
    if isa.is_thumb() {
        // The breakpoint is only 2 bytes, but the slot is kept at a uniform
        // `page_addr + 4` across every ISA (see `reset_registers` /
        // `reset_pc_to_breakpoint`), so one padding half-word sits between
        // the `bkpt` and the slot. The slot itself is 4 bytes: a 16-bit
        // candidate followed by a 16-bit nop pad (spec.md §4.5 step 3).
        const BKPT: u16 = 0xbe00; // bkpt #0
        const PAD: u16 = 0xbf00; // nop
        const B_BACK: u16 = 0xe7fa; // b <offset 0>, encoded from the branch at offset 8
        std::ptr::write_unaligned(page as *mut u16, BKPT.to_le());
        std::ptr::write_unaligned(page.add(2) as *mut u16, PAD.to_le());
        std::ptr::write_unaligned(page.add(4) as *mut u16, PAD.to_le());
        std::ptr::write_unaligned(page.add(6) as *mut u16, PAD.to_le());
        std::ptr::write_unaligned(page.add(8) as *mut u16, B_BACK.to_le());
    } else {
        const UDF16: u32 = 0xe7f0_01f0; // udf #16 (traps to SIGTRAP on Linux)
        const NOP: u32 = 0xe1a0_0000; // nop
        const B_BACK: u32 = 0xeaff_fffd; // b .-8
        std::ptr::write_unaligned(page as *mut u32, UDF16.to_le());
        std::ptr::write_unaligned(page.add(4) as *mut u32, NOP.to_le());
        std::ptr::write_unaligned(page.add(8) as *mut u32, B_BACK.to_le());
    }
}

/// The tracee's mapped page address. In the absence of a back-channel pipe,
/// the parent derives it from the tracee's own memory map; kept as a
/// function so the handshake mechanism can change without touching callers.
fn read_handshake(pid: Pid) -> Result<u64> {
    // The tracee always maps its loop page as the first anonymous
    // executable mapping created after exec; parse `/proc/<pid>/maps` for
    // it once the tracee has stopped at its initial SIGSTOP.
    let maps = std::fs::read_to_string(format!("/proc/{pid}/maps")).map_err(|e| {
        FuzzError::TraceSetup {
            message: format!("failed to read /proc/{pid}/maps: {e}"),
        }
    })?;
    for line in maps.lines() {
        if line.contains("rwxp") {
            let addr = line.split('-').next().unwrap_or("0");
            if let Ok(a) = u64::from_str_radix(addr, 16) {
                return Ok(a);
            }
        }
    }
    Err(FuzzError::TraceSetup {
        message: "no rwx mapping found in tracee".into(),
    })
}

/// `PTRACE_POKETEXT` writes one machine word, and a machine word on a
/// 64-bit host is 8 bytes — wider than the 4-byte slot. Writing the
/// candidate alone would also overwrite the next word, which on AArch64
/// holds the loop's branch-back instruction. Read the existing word first
/// and merge so only the low 32 bits change.
#[cfg(target_arch = "aarch64")]
fn write_candidate(pid: Pid, page_addr: u64, insn: u32, _isa: InstructionSet) -> Result<()> {
    let addr = (page_addr + 4) as ptrace::AddressType;
    let existing = ptrace::read(pid, addr).map_err(|e| trace_err(e, "peektext"))? as u64;
    let merged = (existing & 0xffff_ffff_0000_0000) | u64::from(insn);
    unsafe {
        ptrace::write(pid, addr, merged as usize as *mut libc::c_void)
            .map_err(|e| trace_err(e, "poketext"))?;
    }
    Ok(())
}

/// On a 32-bit ARM host `PTRACE_POKETEXT` writes exactly the 4-byte slot, so
/// no adjacent word is at risk. A32 candidates fill the whole slot; Thumb
/// candidates are a 16-bit encoding followed by a 16-bit nop pad, candidate
/// first since it's the half-word the tracee reaches first (spec.md §4.5
/// step 3).
#[cfg(target_arch = "arm")]
fn write_candidate(pid: Pid, page_addr: u64, insn: u32, isa: InstructionSet) -> Result<()> {
    const PAD: u16 = 0xbf00; // nop
    let word: u32 = if isa.is_thumb() {
        // The 16-bit candidate lives in the upper half-word of our packed
        // u32 (see `crate::oracle`'s `encode_bytes`).
        let candidate = u32::from((insn >> 16) as u16);
        candidate | (u32::from(PAD) << 16)
    } else {
        insn
    };
    unsafe {
        ptrace::write(
            pid,
            (page_addr + 4) as ptrace::AddressType,
            word as usize as *mut libc::c_void,
        )
        .map_err(|e| trace_err(e, "poketext"))?;
    }
    Ok(())
}

fn reset_pc_to_breakpoint(pid: Pid, isa: InstructionSet, page_addr: u64) -> Result<()> {
    let target = if isa.is_thumb() {
        page_addr | 1
    } else {
        page_addr
    };
    set_pc(pid, target)
}

// `nix::sys::ptrace`'s `getregs`/`setregs` wrap `PTRACE_GETREGS` with
// x86_64's `user_regs_struct` and are feature-gated to that architecture;
// ARM and AArch64 register access goes through raw `libc::ptrace` instead.

/// Mirrors the kernel's `struct user_regs_struct` for AArch64
/// (`arch/arm64/include/uapi/asm/ptrace.h`): 31 GPRs, SP, PC, PSTATE.
#[cfg(target_arch = "aarch64")]
#[repr(C)]
struct Aarch64Regs {
    regs: [u64; 31],
    sp: u64,
    pc: u64,
    pstate: u64,
}

#[cfg(target_arch = "aarch64")]
fn getregset(pid: Pid) -> Result<Aarch64Regs> {
    let mut regs: Aarch64Regs = unsafe { std::mem::zeroed() };
    let mut iov = libc::iovec {
        iov_base: &mut regs as *mut _ as *mut libc::c_void,
        iov_len: std::mem::size_of::<Aarch64Regs>(),
    };
    let ret = unsafe {
        libc::ptrace(
            libc::PTRACE_GETREGSET,
            pid.as_raw(),
            1usize as *mut libc::c_void, // NT_PRSTATUS
            &mut iov as *mut _ as *mut libc::c_void,
        )
    };
    if ret != 0 {
        return Err(FuzzError::TraceSetup {
            message: "PTRACE_GETREGSET failed".into(),
        });
    }
    Ok(regs)
}

#[cfg(target_arch = "aarch64")]
fn setregset(pid: Pid, mut regs: Aarch64Regs) -> Result<()> {
    let mut iov = libc::iovec {
        iov_base: &mut regs as *mut _ as *mut libc::c_void,
        iov_len: std::mem::size_of::<Aarch64Regs>(),
    };
    let ret = unsafe {
        libc::ptrace(
            libc::PTRACE_SETREGSET,
            pid.as_raw(),
            1usize as *mut libc::c_void,
            &mut iov as *mut _ as *mut libc::c_void,
        )
    };
    if ret != 0 {
        return Err(FuzzError::TraceSetup {
            message: "PTRACE_SETREGSET failed".into(),
        });
    }
    Ok(())
}

#[cfg(target_arch = "aarch64")]
fn set_pc(pid: Pid, pc: u64) -> Result<()> {
    let mut regs = getregset(pid)?;
    regs.pc = pc;
    setregset(pid, regs)
}

/// Zeroes every general-purpose register so the candidate can't leak a
/// meaningful pointer from a prior iteration, and points `pc` at the slot
/// (`page_addr + 4`, past the loop's leading breakpoint).
#[cfg(target_arch = "aarch64")]
fn reset_registers(pid: Pid, _isa: InstructionSet, page_addr: u64) -> Result<()> {
    let mut regs: Aarch64Regs = unsafe { std::mem::zeroed() };
    regs.pc = page_addr + 4;
    setregset(pid, regs)
}

#[cfg(target_arch = "aarch64")]
fn read_registers(pid: Pid, _isa: InstructionSet) -> Result<RegisterSnapshot> {
    let regs = getregset(pid)?;
    Ok(RegisterSnapshot {
        gprs: regs.regs.to_vec(),
        pc: regs.pc,
        flags: regs.pstate,
    })
}

/// Mirrors the kernel's 32-bit ARM `struct user_regs` (legacy
/// `PTRACE_GETREGS`/`PTRACE_SETREGS` layout): r0-r12, sp, lr, pc, cpsr.
#[cfg(target_arch = "arm")]
#[repr(C)]
struct ArmRegs {
    uregs: [u32; 18],
}

#[cfg(target_arch = "arm")]
fn getregs_raw(pid: Pid) -> Result<ArmRegs> {
    let mut regs: ArmRegs = unsafe { std::mem::zeroed() };
    let ret = unsafe {
        libc::ptrace(
            libc::PTRACE_GETREGS,
            pid.as_raw(),
            std::ptr::null_mut::<libc::c_void>(),
            &mut regs as *mut _ as *mut libc::c_void,
        )
    };
    if ret != 0 {
        return Err(FuzzError::TraceSetup {
            message: "PTRACE_GETREGS failed".into(),
        });
    }
    Ok(regs)
}

#[cfg(target_arch = "arm")]
fn setregs_raw(pid: Pid, regs: &ArmRegs) -> Result<()> {
    let ret = unsafe {
        libc::ptrace(
            libc::PTRACE_SETREGS,
            pid.as_raw(),
            std::ptr::null_mut::<libc::c_void>(),
            regs as *const _ as *mut libc::c_void,
        )
    };
    if ret != 0 {
        return Err(FuzzError::TraceSetup {
            message: "PTRACE_SETREGS failed".into(),
        });
    }
    Ok(())
}

#[cfg(target_arch = "arm")]
fn set_pc(pid: Pid, pc: u64) -> Result<()> {
    let mut regs = getregs_raw(pid)?;
    regs.uregs[15] = pc as u32;
    setregs_raw(pid, &regs)
}

/// Zeroes r0-r12/sp/lr, points `pc` at the slot, and forces CPSR to user
/// mode (`0x10`), OR'd with the Thumb bit (`0x20`) when `isa` is Thumb.
#[cfg(target_arch = "arm")]
fn reset_registers(pid: Pid, isa: InstructionSet, page_addr: u64) -> Result<()> {
    const USER_MODE: u32 = 0x10;
    const THUMB_BIT: u32 = 0x20;
    let mut regs = ArmRegs { uregs: [0; 18] };
    regs.uregs[15] = page_addr as u32 + 4;
    regs.uregs[16] = USER_MODE | if isa.is_thumb() { THUMB_BIT } else { 0 };
    setregs_raw(pid, &regs)
}

#[cfg(target_arch = "arm")]
fn read_registers(pid: Pid, _isa: InstructionSet) -> Result<RegisterSnapshot> {
    let regs = getregs_raw(pid)?;
    Ok(RegisterSnapshot {
        gprs: regs.uregs[0..13].iter().map(|r| *r as u64).collect(),
        pc: regs.uregs[15] as u64,
        flags: regs.uregs[16] as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_handshake_parses_rwx_mapping_start() {
        // Not executable in this harness (requires a live tracee); this
        // just exercises the line-parsing logic directly.
        let line = "7f1234560000-7f1234561000 rwxp 00000000 00:00 0";
        let addr = line.split('-').next().unwrap();
        assert_eq!(u64::from_str_radix(addr, 16).unwrap(), 0x7f1234560000);
    }
}
