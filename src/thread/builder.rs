use super::JoinHandle;
use crate::arch::{Arch, CpuId};
use crate::errors::KernelResult;
use crate::kernel::Kernel;

extern crate alloc;
use alloc::string::String;

/// Thread attributes; unset ones come from the kernel configuration.
#[derive(Debug, Clone, Default)]
pub struct ThreadBuilder {
    pub(crate) name: Option<String>,
    pub(crate) priority: Option<u8>,
    pub(crate) stack_size: Option<usize>,
    pub(crate) affinity: Option<CpuId>,
}

impl ThreadBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name<T: Into<String>>(mut self, name: T) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Stack size in bytes.
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    /// Pin the thread to `cpu`.
    pub fn affinity(mut self, cpu: CpuId) -> Self {
        self.affinity = Some(cpu);
        self
    }

    pub fn spawn<A, F>(self, kernel: &'static Kernel<A>, f: F) -> KernelResult<JoinHandle>
    where
        A: Arch,
        F: FnOnce() + Send + 'static,
    {
        kernel.spawn_with(self, f)
    }
}
