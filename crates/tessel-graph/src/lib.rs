//! # Tessel graph
//!
//! The frame graph of Tessel. The user (you) implements [GpuTaskProducer]s and inserts them into a [ProducerTree].
//! Each frame the tree runs the producers' lifecycle:
//!
//! 1. **setup**, whenever a producer needs (re-)setup,
//! 2. **prepare**, synchronously in hierarchy order. Producers exchange resources with their siblings and ancestors
//!    via versioned exports and imports,
//! 3. **submit**, in parallel. One task per producer plus a transfer task per root,
//! 4. **cleanup**, once every submission of a root's subtree is known.
//!
//! The submissions of all roots are re-serialized by the [GpuTaskOrder] and handed to the device in registration
//! order. Per-frame resources that might still be in use on the GPU are destroyed through Tessel's
//! [DeferredFenceExecution](tessel::dfe::DeferredFenceExecution).
//!
//! Within one level of the hierarchy, [Prologue](OrderMode::Prologue) producers are always prepared before
//! [Standard](OrderMode::Standard) producers, which are prepared before [Epilogue](OrderMode::Epilogue) producers.

mod error;
pub use error::{ExchangeError, GraphError};

///Per-scope table of exported images and buffers.
pub mod exchange;
pub use exchange::{
    ExportMode, ExportedBuffer, ExportedImage, ExportedResource, ImageState, ResourceExchange,
    ResourceId, Version,
};

mod viewport;
pub use viewport::Viewport;

mod context;
pub use context::FrameResources;

mod producer;
pub use producer::{
    CleanupContext, GpuTaskProducer, OrderMode, PrepareContext, SetupContext, SubmitContext,
};

mod slot;

mod tree;
pub use tree::{FrameSummary, ProducerKey, ProducerTree};

mod transfer;
pub use transfer::TransferRequests;

mod order;
pub use order::{GpuTaskOrder, PassData, SubmissionDone};

pub use tessel;
