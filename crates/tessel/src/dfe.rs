//! # Deferred fence execution (DFE)
//!
//! GPU resources can't be destroyed while a submission that uses them is still executing. DFE keeps a FIFO of
//! *frame allocations*. Each allocation collects the calls deferred while the frame was recorded. Once the frame is
//! sealed via [set_end_frame_fences](DeferredFenceExecution::set_end_frame_fences) the allocation knows which queues
//! were used and which fence signals each queue's completion of the frame.
//!
//! A deferred call carries a [QueueMask]. It is executed by [poll](DeferredFenceExecution::poll) as soon as every queue in
//! that mask completed the frame. Queues that were not used by the frame count as completed immediately.
//!
//! Frames are processed oldest first. Polling stops at the first frame whose submission was not yet confirmed by the
//! device, since its fences are not going to be signaled before the submission happened.

mod frame;

use crate::{
    DfeError,
    gpu::{GpuDevice, SharedFence},
    queue::{QueueIndex, QueueMask, QueueRegistry},
};
use ash::vk;
use frame::{DeferredEntry, DeferredFn, FenceEntry, FrameAllocation, QueueFences};
use futures::task::{Spawn, SpawnExt};
use parking_lot::RwLock;
use smallvec::SmallVec;
use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

///Configuration of a [DeferredFenceExecution].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DfeConfig {
    ///Maximum number of queues that can be registered. Clamped to [MAX_QUEUES](crate::queue::MAX_QUEUES).
    pub max_queues: usize,
    ///Alive frame allocations above which a warning is logged. Usually a sign of a stalled queue or a frame that
    /// is never sealed.
    pub max_alive_frames: usize,
    ///Number of ready calls executed per task when polling on a task system. At least 1.
    pub batch_size: usize,
}

impl Default for DfeConfig {
    fn default() -> Self {
        DfeConfig {
            max_queues: 8,
            max_alive_frames: 10,
            batch_size: 32,
        }
    }
}

impl DfeConfig {
    pub fn with_max_queues(mut self, max_queues: usize) -> Self {
        self.max_queues = max_queues;
        self
    }

    pub fn with_max_alive_frames(mut self, max_alive_frames: usize) -> Self {
        self.max_alive_frames = max_alive_frames;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

type FrameList = SmallVec<[Arc<FrameAllocation>; 8]>;

pub struct DeferredFenceExecution {
    config: DfeConfig,
    queues: QueueRegistry,
    device: Arc<dyn GpuDevice>,
    ///Frame allocations, oldest first. The last one is the *current* frame as long as it is not sealed.
    frames: RwLock<VecDeque<Arc<FrameAllocation>>>,
    next_frame_id: AtomicU64,
}

impl DeferredFenceExecution {
    pub fn new(device: Arc<dyn GpuDevice>, mut config: DfeConfig) -> Self {
        config.batch_size = config.batch_size.max(1);
        DeferredFenceExecution {
            queues: QueueRegistry::new(config.max_queues),
            config,
            device,
            frames: RwLock::new(VecDeque::with_capacity(config.max_alive_frames)),
            next_frame_id: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &DfeConfig {
        &self.config
    }

    pub fn queues(&self) -> &QueueRegistry {
        &self.queues
    }

    ///Returns the dense index of `queue`. Registers the queue on first use.
    pub fn queue_index(&self, queue: vk::Queue) -> Result<QueueIndex, DfeError> {
        self.queues.index_of(queue)
    }

    ///Returns the frame allocation entries are currently deferred into. Allocates a new one if the newest frame
    /// is already sealed.
    fn current_frame(&self) -> Arc<FrameAllocation> {
        if let Some(frame) = self.frames.read().back() {
            if !frame.is_sealed() {
                return frame.clone();
            }
        }

        let mut frames = self.frames.write();
        if let Some(frame) = frames.back() {
            if !frame.is_sealed() {
                return frame.clone();
            }
        }

        let frame = Arc::new(FrameAllocation::new(
            self.next_frame_id.fetch_add(1, Ordering::Relaxed),
        ));
        frames.push_back(frame.clone());

        #[cfg(feature = "logging")]
        {
            log::trace!("Allocated DFE frame {}", frame.id);
            if frames.len() > self.config.max_alive_frames {
                log::warn!(
                    "{} frame allocations alive, is a queue stalled or are frames never sealed?",
                    frames.len()
                );
            }
        }

        frame
    }

    ///Mask of already registered `queues`. Fails if any of them was never registered.
    pub fn queue_mask(&self, queues: &[vk::Queue]) -> Result<QueueMask, DfeError> {
        queues.iter().try_fold(QueueMask::EMPTY, |mask, q| {
            Ok(mask.with(self.queues.known_index(*q)?))
        })
    }

    ///Defers `call` until every queue in `mask` finished the current frame.
    pub fn defer(&self, mask: QueueMask, call: impl FnOnce() + Send + 'static) {
        let mut entry = DeferredEntry {
            mask,
            call: Box::new(call),
        };
        //the frame might get sealed between picking and pushing. In that case the entry belongs to the next one.
        loop {
            match self.current_frame().push_deferred(entry) {
                Ok(()) => return,
                Err(rejected) => entry = rejected,
            }
        }
    }

    ///Keeps `objects` alive until every queue in `mask` finished the current frame, then drops them.
    ///
    /// Multiple objects can be passed as a tuple.
    pub fn defer_destruction<T: Send + 'static>(&self, mask: QueueMask, objects: T) {
        self.defer(mask, move || drop(objects));
    }

    ///Calls `call` once `fence` is signaled. Unlike [defer](Self::defer) this does not depend on the frame's
    /// queues. Use it for one-off waits outside of the per-frame flow.
    pub fn call_on_fence_completion(
        &self,
        fence: SharedFence,
        call: impl FnOnce() + Send + 'static,
    ) {
        let mut entry = FenceEntry {
            fence,
            call: Box::new(call),
        };
        loop {
            match self.current_frame().push_fence_entry(entry) {
                Ok(()) => return,
                Err(rejected) => entry = rejected,
            }
        }
    }

    ///Seals the current frame. `queue_fences` lists each queue the frame was submitted to, and the fence that is
    /// signaled once that queue finished the frame. Any queue not listed is considered done with this frame.
    ///
    /// The frame is only polled after the device reported (via [GpuDevice::after_submissions]) that all listed queues
    /// received their submissions.
    pub fn set_end_frame_fences(
        &self,
        queue_fences: &[(vk::Queue, SharedFence)],
    ) -> Result<(), DfeError> {
        let mut used = QueueMask::EMPTY;
        let mut fences = QueueFences::new();
        for (queue, fence) in queue_fences.iter() {
            let idx = self.queues.index_of(*queue)?;
            used |= QueueMask::from_index(idx);
            fences.push((idx, fence.clone()));
        }
        let completed = QueueMask(!used.0);

        let frame = loop {
            let frame = self.current_frame();
            match frame.seal(completed, fences) {
                Ok(()) => break frame,
                Err(rejected) => fences = rejected,
            }
        };

        #[cfg(feature = "logging")]
        log::trace!("Sealed DFE frame {} with {}", frame.id, used);

        if queue_fences.is_empty() {
            frame.mark_submitted();
        } else {
            let queues = queue_fences.iter().map(|(q, _)| *q).collect::<Vec<_>>();
            self.device
                .after_submissions(&queues, Box::new(move || frame.mark_submitted()));
        }

        Ok(())
    }

    ///Collects all ready calls. If `blocking` is false, frames that are locked by someone else are skipped.
    fn collect_ready(&self, blocking: bool) -> Vec<DeferredFn> {
        let frames: FrameList = self.frames.read().iter().cloned().collect();
        let mut ready = Vec::new();
        let mut blocked = false;

        for frame in frames.iter() {
            //Frame order is only relevant for queue bound calls. Fence calls do not depend on the frame.
            if !blocked && !frame.is_submitted() {
                blocked = true;
            }

            let mut entries = if blocking {
                frame.entries.lock()
            } else {
                match frame.entries.try_lock() {
                    Some(entries) => entries,
                    None => continue,
                }
            };

            if !blocked {
                entries.drain_ready_deferred(&mut ready);
            }
            entries.drain_ready_fence_entries(&mut ready);
        }

        ready
    }

    ///Pops all drained frames from the front.
    fn collect_garbage(&self, blocking: bool) {
        let is_poppable = |frame: &FrameAllocation| {
            if !frame.is_submitted() {
                return false;
            }
            if blocking {
                frame.entries.lock().remaining() == 0
            } else {
                frame
                    .entries
                    .try_lock()
                    .map(|e| e.remaining() == 0)
                    .unwrap_or(false)
            }
        };

        //Only take the exclusive lock if there is something to pop
        let front_poppable = self
            .frames
            .read()
            .front()
            .map(|f| is_poppable(f.as_ref()))
            .unwrap_or(false);
        if !front_poppable {
            return;
        }

        let mut frames = self.frames.write();
        while let Some(front) = frames.front() {
            if !is_poppable(front.as_ref()) {
                break;
            }
            #[cfg(feature = "logging")]
            log::trace!("Freeing DFE frame {}", front.id);
            frames.pop_front();
        }
    }

    ///Executes every deferred call that is ready. Calls are executed in batches of
    /// [batch_size](DfeConfig::batch_size) as tasks on `spawner`. Returns the number of calls that were scheduled.
    ///
    /// Frames that are currently locked by another poll are skipped and picked up by the next poll.
    pub fn poll<S: Spawn + ?Sized>(&self, spawner: &S) -> usize {
        let ready = self.collect_ready(false);
        let count = ready.len();

        let mut ready = ready.into_iter().peekable();
        while ready.peek().is_some() {
            let batch = ready
                .by_ref()
                .take(self.config.batch_size)
                .collect::<Vec<_>>();

            if spawner.status().is_err() {
                #[cfg(feature = "logging")]
                log::warn!("Task system is shut down, executing deferred calls inline");
                for call in batch {
                    call();
                }
                continue;
            }

            if let Err(_e) = spawner.spawn(async move {
                for call in batch {
                    call();
                }
            }) {
                //The batch is dropped with the task, which still drops captured resources.
                #[cfg(feature = "logging")]
                log::error!("Failed to spawn deferred batch: {}", _e);
            }
        }

        self.collect_garbage(false);
        count
    }

    ///Like [poll](Self::poll), but executes all ready calls on the calling thread and waits for frame locks.
    pub fn poll_single_threaded(&self) -> usize {
        let ready = self.collect_ready(true);
        let count = ready.len();
        for call in ready {
            call();
        }
        self.collect_garbage(true);
        count
    }

    ///Emergency path, usually used at shutdown. Seals the current frame without fences, treats every frame as
    /// completed and executes *all* deferred calls immediately.
    ///
    /// Only call this if the device is idle (for instance after `vkDeviceWaitIdle`).
    pub fn assume_device_idle(&self) -> usize {
        let frames: FrameList = self.frames.read().iter().cloned().collect();
        let mut ready = Vec::new();
        for frame in frames.iter() {
            frame.force_complete();
            frame.entries.lock().drain_all(&mut ready);
        }

        let count = ready.len();

        #[cfg(feature = "logging")]
        log::trace!(
            "Assuming idle device, executing {} deferred calls of {} frames",
            count,
            frames.len()
        );

        for call in ready {
            call();
        }
        self.collect_garbage(true);
        count
    }

    ///Number of frame allocations that are currently alive.
    pub fn alive_frames(&self) -> usize {
        self.frames.read().len()
    }

    ///Number of calls that were not executed yet.
    pub fn pending_entries(&self) -> usize {
        self.frames
            .read()
            .iter()
            .map(|f| f.entries.lock().remaining())
            .sum()
    }
}

impl Drop for DeferredFenceExecution {
    fn drop(&mut self) {
        let _pending = self.pending_entries();
        #[cfg(feature = "logging")]
        if _pending > 0 {
            log::warn!(
                "Dropping DFE with {} pending calls. They are dropped without being called",
                _pending
            );
        }
    }
}
