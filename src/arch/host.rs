//! Host-backed architecture for running the scheduling core under a hosted OS.
//!
//! Every execution context is backed by a host thread. A context switch hands
//! a baton (the logical CPU index) to the next context and parks the previous
//! one until somebody hands the baton back, so at most one backing thread
//! executes per logical CPU at any time.
//!
//! Interrupt masking is simulated per backing thread. [`HostArch::raise_interrupt`]
//! delivers a handler immediately when interrupts are enabled and holds it
//! until the next [`Arch::enable_interrupts`] otherwise, which is exactly the
//! discipline a spinlock taken with interrupts disabled relies on.

use super::{Arch, ContextHandle, CpuId, EntryFn};
use crate::errors::SpawnError;
use crate::time::Instant;

use std::boxed::Box;
use std::cell::{Cell, RefCell};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Condvar, Mutex, OnceLock, PoisonError};
use std::vec::Vec;

/// Smallest stack handed to a backing host thread.
const MIN_HOST_STACK: usize = 256 * 1024;

type IrqHandler = Box<dyn FnOnce()>;

std::thread_local! {
    static CPU: Cell<CpuId> = const { Cell::new(0) };
    static IRQ_ENABLED: Cell<bool> = const { Cell::new(true) };
    static PENDING: RefCell<Vec<IrqHandler>> = const { RefCell::new(Vec::new()) };
    static SELF_CTX: RefCell<Option<Arc<HostContext>>> = const { RefCell::new(None) };
}

static CLOCK_BASE: OnceLock<std::time::Instant> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Baton {
    Parked,
    Run(CpuId),
    /// The context was destroyed; its backing thread should end.
    Retire,
}

/// Unwind payload that ends the backing thread of a destroyed context.
struct Retired;

struct HostContext {
    baton: Mutex<Baton>,
    resumed: Condvar,
}

impl HostContext {
    fn new() -> Self {
        Self {
            baton: Mutex::new(Baton::Parked),
            resumed: Condvar::new(),
        }
    }

    fn hand(&self, next: Baton) {
        let mut baton = self.baton.lock().unwrap_or_else(PoisonError::into_inner);
        *baton = next;
        self.resumed.notify_one();
    }

    fn give(&self, cpu: CpuId) {
        self.hand(Baton::Run(cpu));
    }

    /// Park until handed a CPU; `None` once the context is destroyed.
    fn take(&self) -> Option<CpuId> {
        let mut baton = self.baton.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            match *baton {
                Baton::Run(cpu) => {
                    *baton = Baton::Parked;
                    return Some(cpu);
                }
                Baton::Retire => return None,
                Baton::Parked => {
                    baton = self
                        .resumed
                        .wait(baton)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    fn into_handle(ctx: Arc<Self>) -> ContextHandle {
        let raw = Arc::into_raw(ctx) as usize;
        match ContextHandle::from_raw(raw) {
            Some(handle) => handle,
            None => unreachable!("Arc::into_raw returned null"),
        }
    }

    /// # Safety
    ///
    /// `handle` must come from [`HostContext::into_handle`] and not have been
    /// destroyed.
    unsafe fn from_handle<'a>(handle: ContextHandle) -> &'a Self {
        unsafe { &*(handle.as_raw() as *const Self) }
    }
}

/// Host implementation of [`Arch`].
pub struct HostArch;

impl HostArch {
    /// Deliver `handler` as an interrupt on the calling backing thread.
    ///
    /// Runs it right away, with interrupts masked, if interrupts are enabled;
    /// otherwise it stays pending until they are re-enabled.
    pub fn raise_interrupt<F: FnOnce() + 'static>(handler: F) {
        if Self::interrupts_enabled() {
            Self::deliver(Box::new(handler));
        } else {
            PENDING.with(|pending| pending.borrow_mut().push(Box::new(handler)));
        }
    }

    /// Number of interrupts waiting for the calling thread to unmask.
    pub fn pending_interrupts() -> usize {
        PENDING.with(|pending| pending.borrow().len())
    }

    fn deliver(handler: IrqHandler) {
        IRQ_ENABLED.with(|enabled| enabled.set(false));
        handler();
        IRQ_ENABLED.with(|enabled| enabled.set(true));
    }

    fn remember_self(ctx: &Arc<HostContext>) {
        SELF_CTX.with(|slot| *slot.borrow_mut() = Some(ctx.clone()));
    }

    /// End the calling backing thread, whose context was destroyed while
    /// it sat switched out.
    fn retire() -> ! {
        SELF_CTX.with(|slot| slot.borrow_mut().take());
        if cfg!(panic = "unwind") {
            // Nothing on the switched-out kernel stack owns anything, so
            // unwinding to the thread's entry frame is clean.
            std::panic::resume_unwind(Box::new(Retired));
        }
        loop {
            std::thread::park();
        }
    }
}

impl Arch for HostArch {
    fn create_context(
        entry: EntryFn,
        arg: usize,
        stack_size: usize,
    ) -> Result<ContextHandle, SpawnError> {
        let ctx = Arc::new(HostContext::new());
        let own = ctx.clone();

        std::thread::Builder::new()
            .name(std::format!("kthread-{arg:#x}"))
            .stack_size(stack_size.max(MIN_HOST_STACK))
            .spawn(move || {
                Self::remember_self(&own);
                let Some(cpu) = own.take() else {
                    return;
                };
                drop(own);
                CPU.with(|c| c.set(cpu));
                // Resumed from inside a switch: interrupts are masked.
                IRQ_ENABLED.with(|enabled| enabled.set(false));
                if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(|| entry(arg))) {
                    if !payload.is::<Retired>() {
                        std::panic::resume_unwind(payload);
                    }
                }
            })
            .map_err(|_| SpawnError::OutOfMemory)?;

        Ok(HostContext::into_handle(ctx))
    }

    fn current_context() -> ContextHandle {
        let ctx = Arc::new(HostContext::new());
        Self::remember_self(&ctx);
        HostContext::into_handle(ctx)
    }

    unsafe fn destroy_context(ctx: ContextHandle) {
        let ctx = unsafe { Arc::from_raw(ctx.as_raw() as *const HostContext) };
        ctx.hand(Baton::Retire);
    }

    unsafe fn context_switch(prev: ContextHandle, next: ContextHandle) {
        let cpu = Self::cpu_id();
        let (prev, next) = unsafe { (HostContext::from_handle(prev), HostContext::from_handle(next)) };
        next.give(cpu);
        let Some(cpu) = prev.take() else {
            Self::retire();
        };
        CPU.with(|c| c.set(cpu));
    }

    fn enable_interrupts() {
        IRQ_ENABLED.with(|enabled| enabled.set(true));
        loop {
            let next = PENDING.with(|pending| {
                let mut pending = pending.borrow_mut();
                if pending.is_empty() {
                    None
                } else {
                    Some(pending.remove(0))
                }
            });
            match next {
                Some(handler) => Self::deliver(handler),
                None => break,
            }
        }
    }

    fn disable_interrupts() {
        IRQ_ENABLED.with(|enabled| enabled.set(false));
    }

    fn interrupts_enabled() -> bool {
        IRQ_ENABLED.with(|enabled| enabled.get())
    }

    fn cpu_id() -> CpuId {
        CPU.with(|c| c.get())
    }

    fn init_cpu(cpu: CpuId) {
        CPU.with(|c| c.set(cpu));
    }

    fn send_reschedule_ipi(_cpu: CpuId) {
        // Host idle loops poll their need-resched flag.
    }

    fn now() -> Instant {
        let base = CLOCK_BASE.get_or_init(std::time::Instant::now);
        Instant::from_nanos(base.elapsed().as_nanos() as u64)
    }

    fn wait_for_interrupt() {
        std::thread::yield_now();
    }
}
