#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

//! Thread scheduling and synchronization core for a single-address-space
//! kernel.
//!
//! The crate schedules its own threads directly on the machine's logical
//! CPUs. Everything machine-specific (context switching, interrupt masking,
//! CPU identity, the clock, inter-processor interrupts) sits behind the
//! [`Arch`] trait; the rest is portable `no_std` + `alloc` code.
//!
//! # Features
//!
//! - `std-shim`: host-backed [`Arch`] implementation
//!   ([`arch::host::HostArch`]) that runs kernel threads on OS threads, for
//!   testing on a development machine
//!
//! # Quick Start
//!
//! ```ignore
//! use kthread_core::{Kernel, KernelConfig, Semaphore};
//!
//! static KERNEL: spin::Lazy<Kernel<MyArch>> = spin::Lazy::new(|| {
//!     Kernel::new(KernelConfig::default().with_cpus(2)).expect("bad config")
//! });
//! static ITEMS: Semaphore = Semaphore::new(0);
//!
//! fn boot_cpu0() -> ! {
//!     KERNEL.boot_cpu(0);
//!     KERNEL.spawn(|| loop {
//!         ITEMS.down(&KERNEL);
//!         /* consume */
//!     }).expect("spawn failed");
//!     KERNEL.idle_loop()
//! }
//!
//! fn timer_irq() {
//!     KERNEL.timer_interrupt();
//!     KERNEL.preempt_if_needed();
//! }
//! ```
//!
//! # Architecture
//!
//! - [`thread`]: the thread object, its state machine and intrusive links
//! - [`sched`]: the scheduler plugin contract plus round-robin and priority
//!   policies
//! - [`kernel`]: the runtime context that dispatches, blocks and wakes
//! - [`sync`]: wait queues, semaphores, mutexes, reader-writer locks and RCU
//! - [`timer`]: deadline-ordered sleep timers

#[cfg(any(test, feature = "std-shim"))]
extern crate std;

extern crate alloc;

pub mod arch;
pub mod config;
pub mod errors;
pub mod kernel;
pub mod percpu;
pub mod sched;
pub mod sync;
pub mod thread;
pub mod time;
pub mod timer;

#[cfg(test)]
mod tests;

// ============================================================================
// Public API
// ============================================================================

// Architecture abstraction
pub use arch::{Arch, ContextHandle, CpuId, IrqFlags};

// Configuration
pub use config::{KernelConfig, RcuWaitPolicy, SchedPolicy};

// Kernel
pub use kernel::{IrqGuard, IsrGuard, Kernel, PreemptGuard};
pub use percpu::{CpuStats, PerCpu};

// Scheduler
pub use sched::{priority, PriorityScheduler, RoundRobinScheduler, SchedStats, Scheduler};

// Threads
pub use thread::{JoinHandle, Thread, ThreadBuilder, ThreadId, ThreadRef, ThreadState};

// Synchronization
pub use sync::{Mutex, RcuCell, RcuReadGuard, RwLock, Semaphore, WaitQueue, WaitQueueGuard};

// Time
pub use time::{Duration, Instant};

// Errors
pub use errors::{ConfigError, KernelError, KernelResult, SpawnError};
