use crate::{
    CleanupContext, FrameResources, GpuTaskProducer, GraphError, PrepareContext,
    SetupContext, SubmitContext,
};
use tessel::{dfe::DeferredFenceExecution, gpu::SubmitBatch, queue::QueueMask};

///Object safe view of a [GpuTaskProducer] together with its states.
pub(crate) trait ErasedProducer: Send {
    fn name(&self) -> &str;
    fn needs_setup(&self) -> bool;
    fn invalidate_setup(&mut self);
    fn setup(&mut self, frame: u64, dfe: &DeferredFenceExecution) -> Result<(), GraphError>;
    fn is_enabled(&self) -> bool;
    fn should_skip(&self) -> bool;
    fn prepare(&mut self, resources: &mut FrameResources<'_>) -> Result<(), GraphError>;
    fn submit(&self, frame: u64, batches: &mut Vec<SubmitBatch>);
    fn cleanup(&mut self, frame: u64, dfe: &DeferredFenceExecution);
    ///Drops the prepare state of a frame that failed.
    fn discard(&mut self, dfe: &DeferredFenceExecution);
}

pub(crate) struct ProducerSlot<P: GpuTaskProducer> {
    name: String,
    producer: P,
    need_setup: bool,
    setup: Option<P::SetupState>,
    prepare: Option<P::PrepareState>,
    ///Frame `prepare` was created in.
    prepared_frame: Option<u64>,
}

impl<P: GpuTaskProducer> ProducerSlot<P> {
    pub(crate) fn new(producer: P) -> Self {
        ProducerSlot {
            name: producer.name().to_owned(),
            producer,
            need_setup: true,
            setup: None,
            prepare: None,
            prepared_frame: None,
        }
    }
}

impl<P: GpuTaskProducer> ErasedProducer for ProducerSlot<P> {
    fn name(&self) -> &str {
        &self.name
    }

    fn needs_setup(&self) -> bool {
        self.need_setup || self.producer.needs_setup()
    }

    fn invalidate_setup(&mut self) {
        self.need_setup = true;
    }

    fn setup(&mut self, frame: u64, dfe: &DeferredFenceExecution) -> Result<(), GraphError> {
        //The GPU might still use the old state
        if let Some(old) = self.setup.take() {
            #[cfg(feature = "logging")]
            log::trace!("Deferring destruction of {}'s old setup state", self.name);
            dfe.defer_destruction(QueueMask::ALL, old);
        }

        self.setup = self.producer.setup(&SetupContext { frame, dfe })?;
        self.need_setup = false;
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.producer.is_enabled()
    }

    fn should_skip(&self) -> bool {
        self.producer.should_skip()
    }

    fn prepare(&mut self, resources: &mut FrameResources<'_>) -> Result<(), GraphError> {
        let frame = resources.frame();
        if let Some(stale) = self.prepare.take() {
            #[cfg(feature = "logging")]
            log::warn!(
                "{} still had a prepare state of frame {:?}",
                self.name,
                self.prepared_frame
            );
            resources.dfe().defer_destruction(QueueMask::ALL, stale);
        }
        self.prepared_frame = None;

        let mut ctx = PrepareContext::<P> {
            name: &self.name,
            setup: self.setup.as_ref(),
            resources,
        };
        let state = self.producer.prepare(&mut ctx)?;

        self.prepare = state;
        self.prepared_frame = Some(frame);
        Ok(())
    }

    fn submit(&self, frame: u64, batches: &mut Vec<SubmitBatch>) {
        let prepare = if self.prepared_frame == Some(frame) {
            self.prepare.as_ref()
        } else {
            None
        };
        let ctx = SubmitContext::<P> {
            frame,
            name: &self.name,
            setup: self.setup.as_ref(),
            prepare,
        };
        self.producer.submit(&ctx, batches);
    }

    fn cleanup(&mut self, frame: u64, dfe: &DeferredFenceExecution) {
        let state = match (self.prepare.take(), self.prepared_frame.take()) {
            (Some(state), Some(prepared)) if prepared == frame => Some(state),
            (Some(stale), _prepared) => {
                #[cfg(feature = "logging")]
                log::warn!(
                    "{}'s prepare state is of frame {:?}, not {}",
                    self.name,
                    _prepared,
                    frame
                );
                dfe.defer_destruction(QueueMask::ALL, stale);
                None
            }
            (None, _) => None,
        };

        self.producer.cleanup(state, &CleanupContext { frame, dfe });
    }

    fn discard(&mut self, dfe: &DeferredFenceExecution) {
        self.prepared_frame = None;
        if let Some(state) = self.prepare.take() {
            dfe.defer_destruction(QueueMask::ALL, state);
        }
    }
}
