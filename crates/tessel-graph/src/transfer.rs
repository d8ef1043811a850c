use tessel::gpu::SubmitBatch;

///CPU to GPU transfers requested while preparing one root's subtree.
///
/// The transfer submission is built by its own task and precedes every producer submission of the subtree.
#[derive(Default)]
pub struct TransferRequests {
    requests: Vec<SubmitBatch>,
}

impl TransferRequests {
    pub fn push(&mut self, batch: SubmitBatch) {
        self.requests.push(batch);
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    ///Merges all requests that target the same queue, keeping the request order within each queue. Queues are
    /// ordered by their first request. Empty requests are dropped.
    pub fn build(self) -> Vec<SubmitBatch> {
        let mut batches: Vec<SubmitBatch> = Vec::new();
        for request in self.requests {
            if request.is_empty() {
                continue;
            }

            match batches.iter_mut().find(|b| b.queue == request.queue) {
                Some(batch) => {
                    //same queue, can't fail
                    let _ = batch.merge(request);
                }
                None => batches.push(request),
            }
        }

        #[cfg(feature = "logging")]
        log::trace!("Built {} transfer batches", batches.len());

        batches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessel::ash::vk::{self, Handle};

    fn request(queue: u64, cb: u64) -> SubmitBatch {
        SubmitBatch::new(vk::Queue::from_raw(queue))
            .with_command_buffer(vk::CommandBuffer::from_raw(cb))
    }

    #[test]
    fn merges_per_queue() {
        let mut requests = TransferRequests::default();
        requests.push(request(1, 10));
        requests.push(request(2, 20));
        requests.push(SubmitBatch::new(vk::Queue::from_raw(3)));
        requests.push(request(1, 11));
        assert_eq!(requests.len(), 4);

        let batches = requests.build();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].queue, vk::Queue::from_raw(1));
        assert_eq!(
            batches[0].command_buffers.as_slice(),
            &[vk::CommandBuffer::from_raw(10), vk::CommandBuffer::from_raw(11)]
        );
        assert_eq!(batches[1].queue, vk::Queue::from_raw(2));
    }

    #[test]
    fn empty_builds_nothing() {
        assert!(TransferRequests::default().build().is_empty());
    }
}
