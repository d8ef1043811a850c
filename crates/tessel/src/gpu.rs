//! # GPU interfaces
//!
//! Tessel never records commands or creates Vulkan objects. Everything it needs from the GPU layer is
//!
//! - a [Fence] that can be polled for completion,
//! - a [SubmitBatch] that describes one `vkQueueSubmit2` worth of work,
//! - a [GpuDevice] that submits batches and can notify once queues received their submissions.
//!
//! Handles are plain [ash] handles. They are only ever compared or forwarded, never dereferenced.

use ash::vk;
use smallvec::SmallVec;
use std::sync::Arc;

///GPU to host completion signal. Usually a wrapped `VkFence` or a timeline semaphore + target value.
pub trait Fence: Send + Sync {
    ///Returns true once the GPU passed the fence. Must not block.
    fn is_signaled(&self) -> bool;
}

pub type SharedFence = Arc<dyn Fence>;

///A single semaphore wait or signal operation of a [SubmitBatch].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemaphoreOp {
    pub semaphore: vk::Semaphore,
    ///Timeline value. Ignored by the driver for binary semaphores.
    pub value: u64,
    pub stage: vk::PipelineStageFlags2,
}

impl SemaphoreOp {
    pub fn new(semaphore: vk::Semaphore, value: u64, stage: vk::PipelineStageFlags2) -> Self {
        SemaphoreOp {
            semaphore,
            value,
            stage,
        }
    }

    ///Binary semaphore operation on all commands.
    pub fn binary(semaphore: vk::Semaphore) -> Self {
        SemaphoreOp {
            semaphore,
            value: 0,
            stage: vk::PipelineStageFlags2::ALL_COMMANDS,
        }
    }

    pub fn as_submit_info(&self) -> vk::SemaphoreSubmitInfo<'static> {
        vk::SemaphoreSubmitInfo::default()
            .semaphore(self.semaphore)
            .value(self.value)
            .stage_mask(self.stage)
    }
}

///Submission record. Command buffers plus the semaphores they wait on / signal, bound to one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitBatch {
    pub queue: vk::Queue,
    pub command_buffers: SmallVec<[vk::CommandBuffer; 4]>,
    pub waits: SmallVec<[SemaphoreOp; 2]>,
    pub signals: SmallVec<[SemaphoreOp; 2]>,
}

impl SubmitBatch {
    pub fn new(queue: vk::Queue) -> Self {
        SubmitBatch {
            queue,
            command_buffers: SmallVec::new(),
            waits: SmallVec::new(),
            signals: SmallVec::new(),
        }
    }

    pub fn with_command_buffer(mut self, command_buffer: vk::CommandBuffer) -> Self {
        self.command_buffers.push(command_buffer);
        self
    }

    pub fn with_wait(mut self, wait: SemaphoreOp) -> Self {
        self.waits.push(wait);
        self
    }

    pub fn with_signal(mut self, signal: SemaphoreOp) -> Self {
        self.signals.push(signal);
        self
    }

    ///True if submitting this batch would be a no-op.
    pub fn is_empty(&self) -> bool {
        self.command_buffers.is_empty() && self.waits.is_empty() && self.signals.is_empty()
    }

    ///Appends `other` to this batch. Waits of `other` are waited for before any command of the merged batch
    /// executes, signals are signaled after all of them.
    ///
    /// Returns `other` unchanged if it targets another queue.
    pub fn merge(&mut self, other: SubmitBatch) -> Result<(), SubmitBatch> {
        if other.queue != self.queue {
            return Err(other);
        }

        self.command_buffers.extend(other.command_buffers);
        self.waits.extend(other.waits);
        self.signals.extend(other.signals);
        Ok(())
    }
}

///The part of a device Tessel needs.
pub trait GpuDevice: Send + Sync {
    ///Submits all `batches`. Batches must be handed to their queues in the order given.
    fn submit(&self, batches: &[SubmitBatch]) -> Result<(), vk::Result>;

    ///Calls `callback` once every queue in `queues` received all submissions of the current frame. Implementations
    /// may call `callback` immediately if that is already the case.
    fn after_submissions(&self, queues: &[vk::Queue], callback: Box<dyn FnOnce() + Send>);
}
