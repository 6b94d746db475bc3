//! # rtkernel
//!
//! A preemptive, priority-based real-time kernel for ARMv8-M (Cortex-M33)
//! microcontrollers such as the RP2350.
//!
//! ## Overview
//!
//! - **Tasks** with fixed priorities `0..MAX_PRIORITIES`; the highest ready
//!   priority always runs, equal priorities share the CPU round-robin on
//!   every tick.
//! - **Mutexes** with priority inheritance, so a low-priority holder can't
//!   be starved by medium-priority work while an urgent task waits.
//! - **Counting and binary semaphores**, usable from interrupts.
//! - **Software timers** (one-shot and periodic) and deferred function
//!   calls, serviced by a dedicated task.
//! - **Time**: delays, fixed-rate `delay_until`, and timeouts on every
//!   blocking call, all correct across tick-counter wrap.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                    Application Tasks                   │
//! ├────────────────────────────────────────────────────────┤
//! │          Task-Facing API (api.rs, target only)         │
//! │      with_kernel · blocking wrappers · system tasks    │
//! ├──────────────┬──────────────────┬──────────────────────┤
//! │  Kernel      │  Sync            │  Timers              │
//! │  kernel.rs   │  sync/mutex.rs   │  timer.rs            │
//! │  ─ tick()    │  sync/semaphore  │  ─ service step      │
//! │  ─ switch    │                  │  ─ command queue     │
//! ├──────────────┴──────────────────┴──────────────────────┤
//! │  Scheduler (scheduler.rs) · ReadyLists / WaitQueue     │
//! │  Tasks (task.rs) · TickList (time.rs) · Heap (heap.rs) │
//! ├────────────────────────────────────────────────────────┤
//! │          Arch Port (arch/cortex_m33.rs)                │
//! │     PendSV · SVC · SysTick · BASEPRI kernel lock       │
//! ├────────────────────────────────────────────────────────┤
//! │        ARM Cortex-M33 Hardware (ARMv8-M Mainline)      │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything above the port is ordinary Rust operating on one [`Kernel`]
//! value, and is tested on the host.
//!
//! ## Memory Model
//!
//! - **No `alloc`**: task stacks and control blocks come from a fixed
//!   kernel heap inside the `Kernel`; lists and queues are `heapless`.
//! - **Handles, not pointers**: tasks and objects are addressed through
//!   generation-checked handles, so a stale handle is an error, not a
//!   dangling reference.

#![cfg_attr(not(test), no_std)]

pub mod config;
pub mod error;
pub mod heap;
pub mod kernel;
pub mod list;
pub mod scheduler;
pub mod sync;
pub mod table;
pub mod task;
pub mod time;
pub mod timer;

pub mod arch;

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod api;

pub use error::KernelError;
pub use kernel::{Acquire, Kernel};
pub use sync::{MutexId, SemaphoreId};
pub use task::{Callback, Priority, TaskConfig, TaskId, TaskState};
pub use time::{Tick, Timeout};
pub use timer::{Sent, TimerId};
