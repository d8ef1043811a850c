//! # Tessel
//!
//! Low level execution primitives of the Tessel frame graph. Tessel does not talk to Vulkan itself. Instead it
//! works on top of a small set of interfaces ([Fence](gpu::Fence), [GpuDevice](gpu::GpuDevice)) that are implemented
//! by whatever Vulkan wrapper the application uses.
//!
//! # Usage
//!
//! The main type is [DeferredFenceExecution](dfe::DeferredFenceExecution). It lets you defer function calls (usually
//! the destruction of GPU resources) until every queue that might still use a resource has finished the frame in which
//! the call was deferred.
//!
//! ```ignore
//! let dfe = DeferredFenceExecution::new(device.clone(), DfeConfig::default());
//! let graphics = dfe.queue_index(graphics_queue)?;
//!
//! //keep the old vertex buffer alive until the graphics queue finished this frame.
//! dfe.defer_destruction(QueueMask::from_index(graphics), old_vertex_buffer);
//!
//! //after submitting the frame
//! dfe.set_end_frame_fences(&[(graphics_queue, frame_fence)])?;
//!
//! //once per frame, or whenever there is time
//! dfe.poll(&spawner);
//! ```

pub use ash;

///Interfaces to the GPU layer. Fences, submission records and the device that submits them.
pub mod gpu;

///CPU side synchronisation primitives.
pub mod sync;

///Queue to dense index mapping used for queue masks.
pub mod queue;

///Deferred fence execution. Defers calls until GPU queues signaled completion of a frame.
pub mod dfe;

mod error;
pub use error::DfeError;
