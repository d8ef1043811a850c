use crate::GraphError;
use futures::{
    channel::oneshot,
    future::BoxFuture,
    task::{Spawn, SpawnExt},
};
use parking_lot::Mutex;
use std::{
    future::Future,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    task::{Context, Poll},
};
use tessel::{
    ash::vk,
    gpu::{GpuDevice, SubmitBatch},
};

///Resolves to all submissions of one pass, usually a root of a [ProducerTree](crate::ProducerTree).
pub type PassData = BoxFuture<'static, Vec<SubmitBatch>>;

///Collects the pass data of a frame and submits it in registration order, regardless of the order in which
/// passes finish.
#[derive(Default)]
pub struct GpuTaskOrder {
    fifo: Vec<PassData>,
    in_flight: Arc<AtomicBool>,
}

impl GpuTaskOrder {
    pub fn new() -> Self {
        Self::default()
    }

    ///Registers `pass`. Its submissions are placed after every pass registered before.
    pub fn push_pass_data(&mut self, pass: PassData) -> Result<(), GraphError> {
        if self.is_in_flight() {
            return Err(GraphError::SubmissionInFlight);
        }
        self.fifo.push(pass);
        Ok(())
    }

    ///Number of passes registered for the next submission.
    pub fn pending(&self) -> usize {
        self.fifo.len()
    }

    ///True while a submission started by [prepare_submissions](Self::prepare_submissions) has not reached the device.
    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    ///Drives every registered pass on `spawner`. Once the last pass resolved, all batches are submitted to `device`
    /// in registration order.
    ///
    /// The returned future resolves to the number of submitted batches. Without any registered pass nothing is
    /// submitted and the future is ready immediately.
    pub fn prepare_submissions<S: Spawn + ?Sized>(
        &mut self,
        device: Arc<dyn GpuDevice>,
        spawner: &S,
    ) -> Result<SubmissionDone, GraphError> {
        let (sender, receiver) = oneshot::channel();
        if self.fifo.is_empty() {
            let _ = sender.send(Ok(0));
            return Ok(SubmissionDone { receiver });
        }
        if self.is_in_flight() {
            return Err(GraphError::SubmissionInFlight);
        }
        spawner.status()?;

        let passes = std::mem::take(&mut self.fifo);
        self.in_flight.store(true, Ordering::Release);

        let state = Arc::new(OrderState {
            results: Mutex::new((0..passes.len()).map(|_| None).collect()),
            remaining: AtomicUsize::new(passes.len()),
            device,
            done: Mutex::new(Some(sender)),
            in_flight: self.in_flight.clone(),
        });

        #[cfg(feature = "logging")]
        log::trace!("Waiting for {} passes", passes.len());

        for (idx, pass) in passes.into_iter().enumerate() {
            let task_state = state.clone();
            if let Err(_e) = spawner.spawn(async move {
                let batches = pass.await;
                task_state.complete(idx, batches);
            }) {
                #[cfg(feature = "logging")]
                log::error!("Failed to spawn pass {}, its submissions are lost: {}", idx, _e);
                state.complete(idx, Vec::new());
            }
        }

        Ok(SubmissionDone { receiver })
    }
}

struct OrderState {
    results: Mutex<Vec<Option<Vec<SubmitBatch>>>>,
    remaining: AtomicUsize,
    device: Arc<dyn GpuDevice>,
    done: Mutex<Option<oneshot::Sender<Result<usize, vk::Result>>>>,
    in_flight: Arc<AtomicBool>,
}

impl OrderState {
    fn complete(&self, idx: usize, batches: Vec<SubmitBatch>) {
        if let Some(slot) = self.results.lock().get_mut(idx) {
            *slot = Some(batches);
        }

        if self.remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }

        //last one, submit in registration order
        let batches = std::mem::take(&mut *self.results.lock())
            .into_iter()
            .flatten()
            .flatten()
            .filter(|b| !b.is_empty())
            .collect::<Vec<_>>();

        let result = if batches.is_empty() {
            Ok(0)
        } else {
            self.device.submit(&batches).map(|_| batches.len())
        };

        #[cfg(feature = "logging")]
        match &result {
            Ok(count) => log::trace!("Submitted {} batches", count),
            Err(e) => log::error!("Failed to submit {} batches: {}", batches.len(), e),
        }

        self.in_flight.store(false, Ordering::Release);
        if let Some(sender) = self.done.lock().take() {
            let _ = sender.send(result);
        }
    }
}

///Resolves once the submission of [GpuTaskOrder::prepare_submissions] reached the device.
pub struct SubmissionDone {
    receiver: oneshot::Receiver<Result<usize, vk::Result>>,
}

impl Future for SubmissionDone {
    type Output = Result<usize, vk::Result>;
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            //all pass tasks were dropped without completing
            Poll::Ready(Err(_canceled)) => Poll::Ready(Err(vk::Result::ERROR_UNKNOWN)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{FutureExt, executor::LocalPool};
    use static_assertions::assert_impl_all;
    use tessel::ash::vk::Handle;

    #[derive(Default)]
    struct RecordingDevice {
        submitted: Mutex<Vec<SubmitBatch>>,
    }

    impl GpuDevice for RecordingDevice {
        fn submit(&self, batches: &[SubmitBatch]) -> Result<(), vk::Result> {
            self.submitted.lock().extend_from_slice(batches);
            Ok(())
        }

        fn after_submissions(&self, _queues: &[vk::Queue], callback: Box<dyn FnOnce() + Send>) {
            callback();
        }
    }

    fn batch(queue: u64) -> SubmitBatch {
        SubmitBatch::new(vk::Queue::from_raw(queue))
            .with_command_buffer(vk::CommandBuffer::from_raw(queue))
    }

    #[test]
    fn impl_send_sync() {
        assert_impl_all!(GpuTaskOrder: Send);
        assert_impl_all!(SubmissionDone: Send, Unpin);
    }

    #[test]
    fn submits_in_registration_order() {
        let device = Arc::new(RecordingDevice::default());
        let mut pool = LocalPool::new();
        let mut order = GpuTaskOrder::new();

        let mut senders = Vec::new();
        for _ in 0..3 {
            let (tx, rx) = oneshot::channel::<Vec<SubmitBatch>>();
            senders.push(tx);
            order
                .push_pass_data(async move { rx.await.unwrap_or_default() }.boxed())
                .unwrap();
        }
        assert_eq!(order.pending(), 3);

        let mut done = order
            .prepare_submissions(device.clone(), &pool.spawner())
            .unwrap();
        assert!(order.is_in_flight());
        assert!(matches!(
            order.push_pass_data(async { Vec::new() }.boxed()),
            Err(GraphError::SubmissionInFlight)
        ));

        let mut senders = senders.into_iter().map(Some).collect::<Vec<_>>();
        //resolve C, A, B
        for idx in [2usize, 0, 1] {
            if let Some(tx) = senders[idx].take() {
                tx.send(vec![batch(idx as u64 + 1)]).unwrap();
            }
            pool.run_until_stalled();
            if idx != 1 {
                assert!(device.submitted.lock().is_empty());
                assert!((&mut done).now_or_never().is_none());
            }
        }

        assert_eq!(pool.run_until(done), Ok(3));
        let queues = device
            .submitted
            .lock()
            .iter()
            .map(|b| b.queue.as_raw())
            .collect::<Vec<_>>();
        assert_eq!(queues, vec![1, 2, 3]);
        assert!(!order.is_in_flight());
        assert_eq!(order.pending(), 0);
    }

    #[test]
    fn empty_order_is_noop() {
        let device = Arc::new(RecordingDevice::default());
        let mut pool = LocalPool::new();
        let mut order = GpuTaskOrder::new();

        let done = order
            .prepare_submissions(device.clone(), &pool.spawner())
            .unwrap();
        assert!(!order.is_in_flight());
        assert_eq!(pool.run_until(done), Ok(0));
        assert!(device.submitted.lock().is_empty());
    }

    #[test]
    fn empty_batches_are_dropped() {
        let device = Arc::new(RecordingDevice::default());
        let mut pool = LocalPool::new();
        let mut order = GpuTaskOrder::new();

        order
            .push_pass_data(async { vec![SubmitBatch::new(vk::Queue::from_raw(1)), batch(2)] }.boxed())
            .unwrap();
        let done = order
            .prepare_submissions(device.clone(), &pool.spawner())
            .unwrap();
        assert_eq!(pool.run_until(done), Ok(1));
        assert_eq!(device.submitted.lock().len(), 1);
    }
}
