use crate::{
    ExportMode, ExportedBuffer, ExportedImage, ExportedResource, GraphError, ImageState,
    ResourceExchange, ResourceId, TransferRequests, Version, Viewport,
};
use parking_lot::MutexGuard;
use smallvec::SmallVec;
use tessel::{ash::vk, dfe::DeferredFenceExecution, gpu::SubmitBatch};

///Per-node, per-frame data: the exports of the node's children and the viewport the node set.
#[derive(Default)]
pub(crate) struct Scope {
    pub(crate) exchange: ResourceExchange,
    pub(crate) viewport: Option<Viewport>,
}

impl Scope {
    pub(crate) fn clear(&mut self) {
        self.exchange.clear();
        self.viewport = None;
    }
}

///Everything a producer can touch while preparing a frame.
///
/// Exports land in the table of the producer's parent, so siblings and the parent's later children can import them.
/// A root exports into its own table. Imports search the parent first, then further ancestors, nearest first.
pub struct FrameResources<'s> {
    frame: u64,
    dfe: &'s DeferredFenceExecution,
    ///The producer's own scope, followed by its ancestors' scopes.
    scopes: SmallVec<[MutexGuard<'s, Scope>; 4]>,
    transfers: &'s mut TransferRequests,
}

impl<'s> FrameResources<'s> {
    pub(crate) fn new(
        frame: u64,
        dfe: &'s DeferredFenceExecution,
        scopes: SmallVec<[MutexGuard<'s, Scope>; 4]>,
        transfers: &'s mut TransferRequests,
    ) -> Self {
        FrameResources {
            frame,
            dfe,
            scopes,
            transfers,
        }
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn dfe(&self) -> &DeferredFenceExecution {
        self.dfe
    }

    ///Index of the first scope used for exchange. The parent's, or the own one for roots.
    fn exchange_start(&self) -> usize {
        if self.scopes.len() > 1 { 1 } else { 0 }
    }

    fn exchange_of(&mut self, id: ResourceId) -> Option<&mut ResourceExchange> {
        let start = self.exchange_start();
        self.scopes
            .iter_mut()
            .skip(start)
            .map(|scope| &mut scope.exchange)
            .find(|ex| ex.can_import(id))
    }

    pub fn export(
        &mut self,
        id: ResourceId,
        resource: impl Into<ExportedResource>,
        mode: ExportMode,
    ) -> Result<u32, GraphError> {
        let start = self.exchange_start();
        let Some(scope) = self.scopes.get_mut(start) else {
            return Err(GraphError::NoSuchProducer);
        };
        Ok(scope.exchange.export(id, resource, mode)?)
    }

    pub fn can_import(&self, id: ResourceId) -> bool {
        self.scopes
            .iter()
            .skip(self.exchange_start())
            .any(|scope| scope.exchange.can_import(id))
    }

    ///Latest importable version of `id` in the nearest scope that exported it.
    pub fn importable_version(&self, id: ResourceId) -> Option<u32> {
        self.scopes
            .iter()
            .skip(self.exchange_start())
            .find_map(|scope| scope.exchange.importable_version(id))
    }

    pub fn import_image(
        &mut self,
        id: ResourceId,
        version: Version,
        final_state: ImageState,
    ) -> Result<ExportedImage, GraphError> {
        let exchange = self
            .exchange_of(id)
            .ok_or(crate::ExchangeError::NoSuchResource(id))?;
        Ok(exchange.import_image(id, version, final_state)?)
    }

    pub fn import_buffer(
        &mut self,
        id: ResourceId,
        version: Version,
        final_access: vk::AccessFlags2,
        final_stage: vk::PipelineStageFlags2,
    ) -> Result<ExportedBuffer, GraphError> {
        let exchange = self
            .exchange_of(id)
            .ok_or(crate::ExchangeError::NoSuchResource(id))?;
        Ok(exchange.import_buffer(id, version, final_access, final_stage)?)
    }

    ///Sets the viewport of this producer's subtree. Can be set once per frame.
    pub fn set_viewport(&mut self, viewport: Viewport) -> Result<(), GraphError> {
        let Some(own) = self.scopes.first_mut() else {
            return Err(GraphError::NoSuchProducer);
        };
        if own.viewport.is_some() {
            return Err(GraphError::ViewportAlreadySet);
        }
        own.viewport = Some(viewport);
        Ok(())
    }

    ///Viewport of the nearest scope (including the own one) that set one.
    pub fn viewport(&self) -> Option<Viewport> {
        self.scopes.iter().find_map(|scope| scope.viewport)
    }

    ///Requests a CPU to GPU transfer. It is submitted before any producer of this root's subtree.
    pub fn request_transfer(&mut self, batch: SubmitBatch) {
        self.transfers.push(batch);
    }
}
