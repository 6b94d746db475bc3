//! # Cortex-M33 Port Layer
//!
//! Hardware-specific code for the ARMv8-M Mainline core of the RP2350.
//! Context switching via PendSV, first-task entry via SVC, the SysTick tick
//! source and BASEPRI-based kernel locking.
//!
//! ## Context Switch Mechanism
//!
//! Tasks run in Thread mode on the process stack (PSP); the kernel and
//! interrupt handlers run on the main stack (MSP). On exception entry the
//! hardware stacks r0–r3, r12, lr, pc and xPSR, plus s0–s15 and FPSCR when
//! the task used the FPU. PendSV adds the rest:
//!
//! ```text
//! high   ┌──────────────────────┐
//!        │ hardware frame       │  xPSR pc lr r12 r3..r0 (s0-s15 FPSCR)
//!        ├──────────────────────┤
//!        │ s16–s31              │  only for an extended frame
//!        ├──────────────────────┤
//!        │ r4–r11               │
//!        │ EXC_RETURN           │
//! low    │ PSPLIM               │  ◄── saved stack pointer
//!        └──────────────────────┘
//! ```
//!
//! A new task's stack is laid out the same way by `task::init_stack`, so
//! the first switch into it is an ordinary restore.
//!
//! ## Interrupt Priorities
//!
//! - SysTick and PendSV: 0xFF (lowest), so a switch never preempts an ISR.
//! - Kernel lock: BASEPRI = `MAX_SYSCALL_INTERRUPT_PRIORITY`. Interrupts
//!   more urgent than that stay live and must not call the kernel.

use core::arch::{asm, global_asm};

use cortex_m::peripheral::scb::SystemHandler;
use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::{SCB, SYST};
use cortex_m::register::{basepri, basepri_max};

use crate::api::with_kernel;
use crate::config::{
    ENABLE_FPU, ENABLE_MPU, ENABLE_TRUSTZONE, MAX_SYSCALL_INTERRUPT_PRIORITY, SYSTEM_CLOCK_HZ,
    TICK_RATE_HZ,
};
use crate::error::{fatal, Violation};

// Tasks share one security state and one unprotected address space.
const _: () = assert!(!ENABLE_TRUSTZONE, "secure-side task contexts are not supported");
const _: () = assert!(!ENABLE_MPU, "MPU regions are not supported");
const _: () = assert!(MAX_SYSCALL_INTERRUPT_PRIORITY != 0, "BASEPRI 0 masks nothing");

// ---------------------------------------------------------------------------
// SysTick configuration
// ---------------------------------------------------------------------------

/// Configure SysTick to fire at `TICK_RATE_HZ` from the processor clock.
pub fn configure_systick(syst: &mut SYST) {
    let reload = SYSTEM_CLOCK_HZ / TICK_RATE_HZ - 1;
    syst.set_reload(reload);
    syst.clear_current();
    syst.set_clock_source(SystClkSource::Core);
    syst.enable_counter();
    syst.enable_interrupt();
}

// ---------------------------------------------------------------------------
// Interrupt priorities and the kernel lock
// ---------------------------------------------------------------------------

/// Put PendSV and SysTick at the lowest priority.
pub fn set_interrupt_priorities(scb: &mut SCB) {
    // Safety: changing the priority of the kernel's own exceptions cannot
    // break a priority-based critical section, none is active yet.
    unsafe {
        scb.set_priority(SystemHandler::PendSV, 0xFF);
        scb.set_priority(SystemHandler::SysTick, 0xFF);
    }
}

/// Have the core stack s16–s31 lazily, only for tasks that touched the FPU.
pub fn enable_lazy_fp_stacking() {
    if !ENABLE_FPU {
        return;
    }
    // FPCCR: ASPEN (bit 31) and LSPEN (bit 30)
    const FPCCR: *mut u32 = 0xE000_EF34 as *mut u32;
    unsafe {
        let val = core::ptr::read_volatile(FPCCR);
        core::ptr::write_volatile(FPCCR, val | (0b11 << 30));
    }
}

/// Mask every interrupt that may call the kernel. Returns the previous
/// BASEPRI for [`restore_basepri`].
#[inline]
pub fn raise_basepri() -> u8 {
    let previous = basepri::read();
    basepri_max::write(MAX_SYSCALL_INTERRUPT_PRIORITY);
    cortex_m::asm::dsb();
    cortex_m::asm::isb();
    previous
}

#[inline]
pub fn restore_basepri(previous: u8) {
    unsafe { basepri::write(previous) };
    cortex_m::asm::isb();
}

/// Pend a context switch. It runs once nothing more urgent is active.
#[inline]
pub fn trigger_pendsv() {
    SCB::set_pendsv();
    cortex_m::asm::dsb();
    cortex_m::asm::isb();
}

// ---------------------------------------------------------------------------
// First task launch
// ---------------------------------------------------------------------------

/// Enter the task the kernel selected at start through `SVC 0`.
///
/// Interrupts must be enabled (BASEPRI may be raised; the SVC handler
/// clears it). Never returns.
pub fn start_first_task() -> ! {
    unsafe {
        asm!(
            "cpsie i",
            "cpsie f",
            "dsb",
            "isb",
            "svc 0",
            options(noreturn)
        );
    }
}

// ---------------------------------------------------------------------------
// Exception handlers
// ---------------------------------------------------------------------------

global_asm!(
    ".syntax unified",
    ".fpu fpv5-sp-d16",
    ".section .text.PendSV,\"ax\",%progbits",
    ".global PendSV",
    ".type PendSV,%function",
    ".thumb_func",
    "PendSV:",
    // Save the outgoing task
    "    mrs r0, psp",
    "    isb",
    "    tst lr, #0x10",
    "    it eq",
    "    vstmdbeq r0!, {{s16-s31}}",
    "    mrs r2, psplim",
    "    mov r3, lr",
    "    stmdb r0!, {{r2-r11}}",
    // r0: outgoing sp in, incoming sp out
    "    bl {switch}",
    // Restore the incoming task
    "    ldmia r0!, {{r2-r11}}",
    "    mov lr, r3",
    "    tst lr, #0x10",
    "    it eq",
    "    vldmiaeq r0!, {{s16-s31}}",
    "    msr psplim, r2",
    "    msr psp, r0",
    "    isb",
    "    bx lr",
    ".size PendSV, . - PendSV",
    "",
    ".section .text.SVCall,\"ax\",%progbits",
    ".global SVCall",
    ".type SVCall,%function",
    ".thumb_func",
    "SVCall:",
    "    bl {first}",
    "    ldmia r0!, {{r2-r11}}",
    "    mov lr, r3",
    "    msr psplim, r2",
    "    msr psp, r0",
    "    movs r1, #0",
    "    msr basepri, r1",
    "    isb",
    "    bx lr",
    ".size SVCall, . - SVCall",
    switch = sym switch_context,
    first = sym first_task_stack,
);

/// PendSV body: record the outgoing stack pointer, run the scheduler and
/// hand back the stack pointer to resume.
extern "C" fn switch_context(sp: usize) -> usize {
    with_kernel(|kernel| {
        kernel.save_stack_pointer(sp);
        kernel.context_switch();
        kernel.current_stack_pointer()
    })
    .unwrap_or_else(|| fatal(Violation::NoRunnableTask))
}

extern "C" fn first_task_stack() -> usize {
    with_kernel(|kernel| kernel.current_stack_pointer())
        .unwrap_or_else(|| fatal(Violation::NoRunnableTask))
}

/// SysTick exception handler: advance the tick. `with_kernel` pends
/// PendSV if the tick made a switch necessary.
#[no_mangle]
pub unsafe extern "C" fn SysTick() {
    with_kernel(|kernel| kernel.tick());
}
