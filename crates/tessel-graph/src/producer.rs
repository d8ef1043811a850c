use crate::{FrameResources, GraphError};
use std::ops::{Deref, DerefMut};
use tessel::{dfe::DeferredFenceExecution, gpu::SubmitBatch, queue::QueueMask};

///Position of a producer within its siblings. Prologue producers are handled first, epilogue producers last.
#[derive(Hash, PartialEq, Eq, PartialOrd, Ord, Debug, Clone, Copy)]
pub enum OrderMode {
    Prologue,
    Standard,
    Epilogue,
}

impl OrderMode {
    pub const fn rank(self) -> usize {
        match self {
            OrderMode::Prologue => 0,
            OrderMode::Standard => 1,
            OrderMode::Epilogue => 2,
        }
    }
}

///A node of the frame graph that produces GPU work.
///
/// The lifecycle of a producer per frame is
///
/// 1. [setup](Self::setup) if the producer was just inserted, invalidated or [needs_setup](Self::needs_setup) returns true,
/// 2. [is_enabled](Self::is_enabled) and [should_skip](Self::should_skip) are re-evaluated,
/// 3. [prepare](Self::prepare), in hierarchy order,
/// 4. [submit](Self::submit), in parallel to all other producers,
/// 5. [cleanup](Self::cleanup), once all submissions of the root's subtree are known.
pub trait GpuTaskProducer: Send + 'static {
    ///State that persists across frames until the producer is set up again.
    type SetupState: Send + 'static;
    ///State created by prepare. Lives until the frame's cleanup.
    type PrepareState: Send + 'static;

    const ORDER: OrderMode = OrderMode::Standard;

    ///Can be implemented to make debugging easier. Queried once when the producer is inserted.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    ///If false, this producer and all its children are not executed this frame.
    fn is_enabled(&self) -> bool {
        true
    }

    ///If true, nothing of this producer's root subtree is executed this frame.
    fn should_skip(&self) -> bool {
        false
    }

    ///Requests setup to be run again before the next prepare.
    fn needs_setup(&self) -> bool {
        false
    }

    fn setup(&mut self, _ctx: &SetupContext) -> Result<Option<Self::SetupState>, GraphError> {
        Ok(None)
    }

    ///Exports and imports resources, allocates per-frame data and requests transfers.
    fn prepare(
        &mut self,
        ctx: &mut PrepareContext<'_, '_, Self>,
    ) -> Result<Option<Self::PrepareState>, GraphError>;

    ///Pushes this frame's submissions to `batches`.
    fn submit(&self, ctx: &SubmitContext<'_, Self>, batches: &mut Vec<SubmitBatch>);

    ///Destroys the prepare state. By default the state is kept alive until the frame finished on all queues.
    fn cleanup(&mut self, state: Option<Self::PrepareState>, ctx: &CleanupContext) {
        if let Some(state) = state {
            ctx.dfe().defer_destruction(QueueMask::ALL, state);
        }
    }
}

pub struct SetupContext<'a> {
    pub(crate) frame: u64,
    pub(crate) dfe: &'a DeferredFenceExecution,
}

impl<'a> SetupContext<'a> {
    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn dfe(&self) -> &DeferredFenceExecution {
        self.dfe
    }
}

///Context of [GpuTaskProducer::prepare]. Dereferences to the frame's [FrameResources].
pub struct PrepareContext<'a, 's, P: GpuTaskProducer + ?Sized> {
    pub(crate) name: &'a str,
    pub(crate) setup: Option<&'a P::SetupState>,
    pub(crate) resources: &'a mut FrameResources<'s>,
}

impl<'a, 's, P: GpuTaskProducer + ?Sized> PrepareContext<'a, 's, P> {
    ///Returns the setup state.
    ///
    /// # Panics
    ///
    /// If setup did not produce a state.
    pub fn setup_state(&self) -> &'a P::SetupState {
        match self.setup {
            Some(state) => state,
            None => panic!(
                "Producer \"{}\" accessed its setup state, but setup did not produce one",
                self.name
            ),
        }
    }

    pub fn try_setup_state(&self) -> Option<&'a P::SetupState> {
        self.setup
    }
}

impl<'a, 's, P: GpuTaskProducer + ?Sized> Deref for PrepareContext<'a, 's, P> {
    type Target = FrameResources<'s>;
    fn deref(&self) -> &Self::Target {
        self.resources
    }
}

impl<'a, 's, P: GpuTaskProducer + ?Sized> DerefMut for PrepareContext<'a, 's, P> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.resources
    }
}

pub struct SubmitContext<'a, P: GpuTaskProducer + ?Sized> {
    pub(crate) frame: u64,
    pub(crate) name: &'a str,
    pub(crate) setup: Option<&'a P::SetupState>,
    pub(crate) prepare: Option<&'a P::PrepareState>,
}

impl<'a, P: GpuTaskProducer + ?Sized> SubmitContext<'a, P> {
    pub fn frame(&self) -> u64 {
        self.frame
    }

    ///# Panics
    ///
    /// If setup did not produce a state.
    pub fn setup_state(&self) -> &'a P::SetupState {
        match self.setup {
            Some(state) => state,
            None => panic!(
                "Producer \"{}\" accessed its setup state, but setup did not produce one",
                self.name
            ),
        }
    }

    ///# Panics
    ///
    /// If prepare did not produce a state this frame.
    pub fn prepare_state(&self) -> &'a P::PrepareState {
        match self.prepare {
            Some(state) => state,
            None => panic!(
                "Producer \"{}\" accessed its prepare state, but prepare did not produce one in frame {}",
                self.name, self.frame
            ),
        }
    }

    pub fn try_prepare_state(&self) -> Option<&'a P::PrepareState> {
        self.prepare
    }
}

pub struct CleanupContext<'a> {
    pub(crate) frame: u64,
    pub(crate) dfe: &'a DeferredFenceExecution,
}

impl<'a> CleanupContext<'a> {
    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn dfe(&self) -> &DeferredFenceExecution {
        self.dfe
    }
}
