use crate::{
    gpu::SharedFence,
    queue::{QueueIndex, QueueMask},
};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicBool, Ordering};

pub(crate) type DeferredFn = Box<dyn FnOnce() + Send>;

///Call that waits for a set of queues to finish the frame it was deferred in.
pub(crate) struct DeferredEntry {
    pub(crate) mask: QueueMask,
    pub(crate) call: DeferredFn,
}

///Call that waits for a single fence, independent of the frame's queues.
pub(crate) struct FenceEntry {
    pub(crate) fence: SharedFence,
    pub(crate) call: DeferredFn,
}

pub(crate) type QueueFences = SmallVec<[(QueueIndex, SharedFence); 4]>;

pub(crate) struct FrameEntries {
    ///True once the end-of-frame fences are known. No entries are added after that.
    sealed: bool,
    completed: QueueMask,
    queue_fences: QueueFences,
    deferred: Vec<DeferredEntry>,
    fence_entries: Vec<FenceEntry>,
}

impl FrameEntries {
    ///Folds every newly signaled queue into the completed mask and returns it.
    fn update_completed(&mut self) -> QueueMask {
        for (idx, fence) in self.queue_fences.iter() {
            if !self.completed.contains(*idx) && fence.is_signaled() {
                self.completed |= QueueMask::from_index(*idx);
            }
        }
        self.completed
    }

    ///Moves all deferred calls whose queues completed into `ready`.
    pub(crate) fn drain_ready_deferred(&mut self, ready: &mut Vec<DeferredFn>) {
        if self.deferred.is_empty() {
            return;
        }
        let completed = self.update_completed();
        let (done, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.deferred)
            .into_iter()
            .partition(|entry| entry.mask.is_satisfied_by(completed));
        self.deferred = waiting;
        ready.extend(done.into_iter().map(|entry| entry.call));
    }

    ///Moves all fence calls whose fence signaled into `ready`.
    pub(crate) fn drain_ready_fence_entries(&mut self, ready: &mut Vec<DeferredFn>) {
        if self.fence_entries.is_empty() {
            return;
        }
        let (done, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.fence_entries)
            .into_iter()
            .partition(|entry| entry.fence.is_signaled());
        self.fence_entries = waiting;
        ready.extend(done.into_iter().map(|entry| entry.call));
    }

    ///Moves every call into `ready`, regardless of any fence.
    pub(crate) fn drain_all(&mut self, ready: &mut Vec<DeferredFn>) {
        ready.extend(self.deferred.drain(..).map(|entry| entry.call));
        ready.extend(self.fence_entries.drain(..).map(|entry| entry.call));
    }

    pub(crate) fn remaining(&self) -> usize {
        self.deferred.len() + self.fence_entries.len()
    }

    #[cfg(test)]
    pub(crate) fn completed(&self) -> QueueMask {
        self.completed
    }
}

///Bookkeeping of one frame in flight.
pub(crate) struct FrameAllocation {
    pub(crate) id: u64,
    ///Set once every queue of this frame received its submissions on the device.
    is_submit: AtomicBool,
    pub(crate) entries: Mutex<FrameEntries>,
}

impl FrameAllocation {
    pub(crate) fn new(id: u64) -> Self {
        FrameAllocation {
            id,
            is_submit: AtomicBool::new(false),
            entries: Mutex::new(FrameEntries {
                sealed: false,
                completed: QueueMask::EMPTY,
                queue_fences: SmallVec::new(),
                deferred: Vec::new(),
                fence_entries: Vec::new(),
            }),
        }
    }

    pub(crate) fn is_submitted(&self) -> bool {
        self.is_submit.load(Ordering::Acquire)
    }

    pub(crate) fn mark_submitted(&self) {
        self.is_submit.store(true, Ordering::Release);
    }

    pub(crate) fn is_sealed(&self) -> bool {
        self.entries.lock().sealed
    }

    ///Adds `entry`, or hands it back if the frame was sealed in the meantime.
    pub(crate) fn push_deferred(&self, entry: DeferredEntry) -> Result<(), DeferredEntry> {
        let mut entries = self.entries.lock();
        if entries.sealed {
            return Err(entry);
        }
        entries.deferred.push(entry);
        Ok(())
    }

    pub(crate) fn push_fence_entry(&self, entry: FenceEntry) -> Result<(), FenceEntry> {
        let mut entries = self.entries.lock();
        if entries.sealed {
            return Err(entry);
        }
        entries.fence_entries.push(entry);
        Ok(())
    }

    ///Seals the frame with the queues that were used and their end-of-frame fences. Queues that are not part of
    /// `queue_fences` must already be set in `completed`.
    pub(crate) fn seal(
        &self,
        completed: QueueMask,
        queue_fences: QueueFences,
    ) -> Result<(), QueueFences> {
        let mut entries = self.entries.lock();
        if entries.sealed {
            return Err(queue_fences);
        }
        entries.sealed = true;
        entries.completed = completed;
        entries.queue_fences = queue_fences;
        Ok(())
    }

    ///Treats the frame as sealed, submitted and completed on all queues.
    pub(crate) fn force_complete(&self) {
        {
            let mut entries = self.entries.lock();
            entries.sealed = true;
            entries.completed = QueueMask::ALL;
            entries.queue_fences.clear();
        }
        self.mark_submitted();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{gpu::SharedFence, sync::HostFence};

    fn entry(mask: u32) -> DeferredEntry {
        DeferredEntry {
            mask: QueueMask(mask),
            call: Box::new(|| {}),
        }
    }

    #[test]
    fn sealed_frame_rejects_entries() {
        let frame = FrameAllocation::new(0);
        assert!(frame.push_deferred(entry(1)).is_ok());
        assert!(frame.seal(QueueMask::EMPTY, SmallVec::new()).is_ok());
        assert!(frame.push_deferred(entry(1)).is_err());
        assert!(frame.seal(QueueMask::EMPTY, SmallVec::new()).is_err());
        assert_eq!(frame.entries.lock().remaining(), 1);
    }

    #[test]
    fn partition_by_completed_queues() {
        let frame = FrameAllocation::new(0);
        let q0 = HostFence::new();
        let q1 = HostFence::new();
        frame.push_deferred(entry(0b01)).ok().unwrap();
        frame.push_deferred(entry(0b11)).ok().unwrap();

        let mut fences = QueueFences::new();
        fences.push((QueueIndex(0), q0.clone() as SharedFence));
        fences.push((QueueIndex(1), q1.clone() as SharedFence));
        //everything but queue 0 and 1 is treated as done
        frame.seal(QueueMask(!0b11), fences).ok().unwrap();

        let mut ready = Vec::new();
        frame.entries.lock().drain_ready_deferred(&mut ready);
        assert!(ready.is_empty());

        q0.signal();
        frame.entries.lock().drain_ready_deferred(&mut ready);
        assert_eq!(ready.len(), 1);

        q1.signal();
        frame.entries.lock().drain_ready_deferred(&mut ready);
        assert_eq!(ready.len(), 2);
        assert_eq!(frame.entries.lock().remaining(), 0);
        assert_eq!(frame.entries.lock().completed(), QueueMask::ALL);
    }
}
