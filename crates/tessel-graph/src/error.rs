use crate::ResourceId;
use futures::task::SpawnError;
use tessel::DfeError;
use thiserror::Error;

///Contract violations of the export/import protocol.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    #[error("Resource {0} was already exported as constant this frame")]
    ConstantReexport(ResourceId),
    #[error("Can't export versioned resource {0}, it is already exported as constant")]
    VersionedOverConstant(ResourceId),
    #[error("Can't export constant resource {0}, it is already exported as versioned")]
    ConstantOverVersioned(ResourceId),
    #[error("Resource {0} was not exported")]
    NoSuchResource(ResourceId),
    #[error("Resource {id} has no version {version}")]
    NoSuchVersion { id: ResourceId, version: u32 },
    #[error("Resource {id} is not a {expected}")]
    TypeMismatch { id: ResourceId, expected: &'static str },
}

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("Deferred fence execution error: {0}")]
    Dfe(#[from] DfeError),

    #[error("Failed to spawn task: {0}")]
    Spawn(#[from] SpawnError),

    #[error("Viewport was already set for this scope")]
    ViewportAlreadySet,

    #[error("There is no producer for that key")]
    NoSuchProducer,

    #[error("Cleanup of the last frame did not finish yet")]
    FrameInFlight,

    #[error("Submission is in flight, can't register more pass data")]
    SubmissionInFlight,
}

#[cfg(test)]
mod test {
    use static_assertions::assert_impl_all;

    use crate::{ExchangeError, GraphError};

    #[test]
    fn assure_send_sync() {
        assert_impl_all!(ExchangeError: Send, Sync);
        assert_impl_all!(GraphError: Send, Sync);
    }
}
