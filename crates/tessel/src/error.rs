use ash::vk;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DfeError {
    #[error("Can't register more than {max} queues")]
    TooManyQueues { max: usize },
    #[error("Queue {0:?} was never registered")]
    UnknownQueue(vk::Queue),
}

#[cfg(test)]
mod test {
    use static_assertions::assert_impl_all;

    use crate::DfeError;

    #[test]
    fn assure_send_sync() {
        assert_impl_all!(DfeError: Send, Sync);
    }
}
