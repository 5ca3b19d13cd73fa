//! Architecture abstraction layer for context switching and interrupt handling.
//!
//! Everything the scheduling core needs from the machine goes through the
//! [`Arch`] trait: creating and switching execution contexts, masking local
//! interrupts, identifying the current CPU, reading the clock and poking
//! other CPUs with a reschedule interrupt. The core never looks inside a
//! context; it only passes [`ContextHandle`]s around.

use crate::errors::SpawnError;
use crate::time::Instant;
use core::num::NonZeroUsize;

#[cfg(any(test, feature = "std-shim"))]
pub mod host;

/// Logical CPU index, dense from zero.
pub type CpuId = usize;

/// Entry point of a freshly created execution context.
///
/// The argument is the opaque word handed to [`Arch::create_context`].
pub type EntryFn = fn(usize);

/// Saved local interrupt state returned by [`Arch::irq_save`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqFlags(bool);

impl IrqFlags {
    /// State with interrupts enabled.
    pub const ENABLED: Self = Self(true);
    /// State with interrupts disabled.
    pub const DISABLED: Self = Self(false);

    /// Build flags from an "interrupts enabled" bit.
    pub const fn from_enabled(enabled: bool) -> Self {
        Self(enabled)
    }

    /// Whether interrupts were enabled when the flags were captured.
    pub const fn were_enabled(self) -> bool {
        self.0
    }
}

/// Opaque reference to an execution context owned by the [`Arch`] layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextHandle(NonZeroUsize);

impl ContextHandle {
    /// Wrap a raw, non-null context word.
    pub const fn new(raw: NonZeroUsize) -> Self {
        Self(raw)
    }

    /// Build a handle from a raw word, `None` if it is zero.
    pub fn from_raw(raw: usize) -> Option<Self> {
        NonZeroUsize::new(raw).map(Self)
    }

    /// The raw context word.
    pub fn as_raw(self) -> usize {
        self.0.get()
    }
}

/// Architecture abstraction trait.
///
/// This trait must be implemented for each supported CPU architecture to
/// provide context management, interrupt masking and CPU identification.
///
/// # Safety
///
/// Implementations involve direct hardware manipulation. All methods marked
/// as unsafe have specific preconditions that must be upheld by the caller.
pub trait Arch: Sized + 'static {
    /// Create a new execution context that starts in `entry(arg)`.
    ///
    /// Fails with [`SpawnError::OutOfMemory`] when no stack or context
    /// storage can be obtained.
    fn create_context(entry: EntryFn, arg: usize, stack_size: usize)
        -> Result<ContextHandle, SpawnError>;

    /// Adopt the currently executing flow (boot or secondary-CPU entry) as a
    /// context so it can be switched away from and back to.
    fn current_context() -> ContextHandle;

    /// Release a context created by [`Arch::create_context`].
    ///
    /// # Safety
    ///
    /// The context must not be running on any CPU and must never be switched
    /// to again.
    unsafe fn destroy_context(ctx: ContextHandle);

    /// Save the running state into `prev` and resume `next`.
    ///
    /// Returns when some CPU switches back to `prev`.
    ///
    /// # Safety
    ///
    /// - `prev` must be the context executing on this CPU
    /// - `next` must be a live context that is not executing anywhere
    /// - Must be called with interrupts disabled
    unsafe fn context_switch(prev: ContextHandle, next: ContextHandle);

    /// Enable interrupts on the current CPU.
    fn enable_interrupts();

    /// Disable interrupts on the current CPU.
    fn disable_interrupts();

    /// Check if interrupts are currently enabled.
    fn interrupts_enabled() -> bool;

    /// Disable local interrupts and return the previous state.
    fn irq_save() -> IrqFlags {
        let flags = IrqFlags::from_enabled(Self::interrupts_enabled());
        Self::disable_interrupts();
        flags
    }

    /// Restore a state captured by [`Arch::irq_save`].
    fn irq_restore(flags: IrqFlags) {
        if flags.were_enabled() {
            Self::enable_interrupts();
        }
    }

    /// Index of the CPU executing the caller.
    fn cpu_id() -> CpuId;

    /// Called on a CPU as it is brought online, before it dispatches.
    fn init_cpu(cpu: CpuId) {
        let _ = cpu;
    }

    /// Ask `cpu` to re-evaluate its ready set.
    fn send_reschedule_ipi(cpu: CpuId);

    /// Monotonic time.
    fn now() -> Instant;

    /// Idle until something interesting may have happened.
    fn wait_for_interrupt() {
        core::hint::spin_loop();
    }
}
