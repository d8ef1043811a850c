//! # Synchronisation
//!
//! Tessel only ever *polls* fences. It never waits on them, since waiting would block a worker of the task system.
//!
//! ## HostFence
//!
//! A fence that is signaled from the CPU. Useful whenever work that is not executed on the GPU should take part in
//! deferred execution, for instance an upload thread that copies data into a mapped buffer. It is also the fence used
//! by the headless demo and the tests.

use crate::gpu::Fence;
use std::fmt::Debug;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

///Fence that is signaled by the host.
#[derive(Default)]
pub struct HostFence {
    signaled: AtomicBool,
}

impl HostFence {
    pub fn new() -> Arc<Self> {
        Arc::new(HostFence::default())
    }

    pub fn signal(&self) {
        self.signaled.store(true, Ordering::Release);
    }

    ///Resets the fence into the unsignaled state. Only valid if nothing is waiting on the fence anymore.
    pub fn reset(&self) {
        self.signaled.store(false, Ordering::Release);
    }
}

impl Fence for HostFence {
    fn is_signaled(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }
}

impl Debug for HostFence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HostFence(signaled: {})", self.is_signaled())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    #[test]
    fn impl_send_sync() {
        assert_impl_all!(HostFence: Send, Sync);
    }

    #[test]
    fn host_fence_signal_reset() {
        let fence = HostFence::new();
        assert!(!fence.is_signaled());
        fence.signal();
        assert!(fence.is_signaled());
        fence.reset();
        assert!(!fence.is_signaled());
    }
}
