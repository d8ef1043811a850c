use crate::{
    GpuTaskOrder, GpuTaskProducer, GraphError, OrderMode, PassData, TransferRequests,
    context::{FrameResources, Scope},
    slot::{ErasedProducer, ProducerSlot},
};
use futures::{
    FutureExt,
    future::join_all,
    task::{Spawn, SpawnExt},
};
use parking_lot::Mutex;
use slotmap::SlotMap;
use smallvec::SmallVec;
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use tessel::{dfe::DeferredFenceExecution, gpu::SubmitBatch, queue::QueueMask};

slotmap::new_key_type!(
    ///Key of a producer within a [ProducerTree].
    pub struct ProducerKey;
);

type SharedProducer = Arc<Mutex<Box<dyn ErasedProducer>>>;

struct ProducerNode {
    name: String,
    order: OrderMode,
    parent: Option<ProducerKey>,
    ///Children, bucketed by [OrderMode::rank].
    children: [Vec<ProducerKey>; 3],
    ///Set by the user, independent of the producer's own opinion.
    enabled: bool,
    producer: SharedProducer,
    scope: Arc<Mutex<Scope>>,
}

///Outcome of [ProducerTree::begin_frame].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameSummary {
    pub frame: u64,
    ///True if any producer is enabled, including producers of skipped roots.
    pub any_enabled: bool,
    ///Number of producers that were prepared.
    pub prepared: usize,
    ///Number of roots that were skipped because a producer of their subtree requested it.
    pub skipped_roots: usize,
}

struct PreparedRoot {
    root: ProducerKey,
    ///Prepared producers in hierarchy order.
    nodes: Vec<ProducerKey>,
    transfers: TransferRequests,
}

struct PreparedFrame {
    frame: u64,
    roots: Vec<PreparedRoot>,
}

///Decrements the in-flight counter when the frame's cleanup is done, or its pass data was dropped.
struct InFlightGuard(Arc<AtomicUsize>);

impl InFlightGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        InFlightGuard(counter.clone())
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

///Hierarchy of [GpuTaskProducer]s.
///
/// Each frame is driven by [begin_frame](Self::begin_frame), which runs setup and prepare, followed by
/// [submit](Self::submit), which hands one pass per root to a [GpuTaskOrder].
pub struct ProducerTree {
    nodes: SlotMap<ProducerKey, ProducerNode>,
    roots: [Vec<ProducerKey>; 3],
    dfe: Arc<DeferredFenceExecution>,
    frame: u64,
    prepared: Option<PreparedFrame>,
    in_flight: Arc<AtomicUsize>,
}

impl ProducerTree {
    pub fn new(dfe: Arc<DeferredFenceExecution>) -> Self {
        ProducerTree {
            nodes: SlotMap::with_key(),
            roots: Default::default(),
            dfe,
            frame: 0,
            prepared: None,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn dfe(&self) -> &Arc<DeferredFenceExecution> {
        &self.dfe
    }

    fn new_node<P: GpuTaskProducer>(producer: P, parent: Option<ProducerKey>) -> ProducerNode {
        let slot: Box<dyn ErasedProducer> = Box::new(ProducerSlot::new(producer));
        ProducerNode {
            name: slot.name().to_owned(),
            order: P::ORDER,
            parent,
            children: Default::default(),
            enabled: true,
            producer: Arc::new(Mutex::new(slot)),
            scope: Arc::new(Mutex::new(Scope::default())),
        }
    }

    pub fn insert_root<P: GpuTaskProducer>(&mut self, producer: P) -> ProducerKey {
        let key = self.nodes.insert(Self::new_node(producer, None));
        self.roots[P::ORDER.rank()].push(key);
        key
    }

    pub fn insert_child<P: GpuTaskProducer>(
        &mut self,
        parent: ProducerKey,
        producer: P,
    ) -> Result<ProducerKey, GraphError> {
        if !self.nodes.contains_key(parent) {
            return Err(GraphError::NoSuchProducer);
        }
        let key = self.nodes.insert(Self::new_node(producer, Some(parent)));
        if let Some(parent) = self.nodes.get_mut(parent) {
            parent.children[P::ORDER.rank()].push(key);
        }
        Ok(key)
    }

    ///Removes `key` and its whole subtree. The producers (and their states) are destroyed once the current frame
    /// finished on all queues.
    pub fn remove(&mut self, key: ProducerKey) -> Result<(), GraphError> {
        let node = self.nodes.get(key).ok_or(GraphError::NoSuchProducer)?;
        let (parent, rank) = (node.parent, node.order.rank());
        match parent.and_then(|p| self.nodes.get_mut(p)) {
            Some(parent) => parent.children[rank].retain(|c| *c != key),
            None => self.roots[rank].retain(|c| *c != key),
        }

        let mut stack = vec![key];
        while let Some(key) = stack.pop() {
            if let Some(node) = self.nodes.remove(key) {
                stack.extend(node.children.iter().flatten().copied());

                #[cfg(feature = "logging")]
                log::trace!("Removing producer {}", node.name);

                self.dfe
                    .defer_destruction(QueueMask::ALL, (node.producer, node.scope));
            }
        }
        Ok(())
    }

    ///Forces setup of `key` to run again before its next prepare.
    pub fn invalidate_setup(&mut self, key: ProducerKey) -> Result<(), GraphError> {
        let node = self.nodes.get(key).ok_or(GraphError::NoSuchProducer)?;
        node.producer.lock().invalidate_setup();
        Ok(())
    }

    ///Enables or disables `key` and its subtree.
    pub fn set_enabled(&mut self, key: ProducerKey, enabled: bool) -> Result<(), GraphError> {
        let node = self.nodes.get_mut(key).ok_or(GraphError::NoSuchProducer)?;
        node.enabled = enabled;
        Ok(())
    }

    pub fn name(&self, key: ProducerKey) -> Option<&str> {
        self.nodes.get(key).map(|n| n.name.as_str())
    }

    pub fn contains(&self, key: ProducerKey) -> bool {
        self.nodes.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    ///Index of the last frame that was started.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    ///True while the cleanup of a submitted frame did not run yet.
    pub fn is_frame_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire) > 0
    }

    fn roots(&self) -> impl Iterator<Item = ProducerKey> + '_ {
        self.roots.iter().flatten().copied()
    }

    ///Every node of `key`'s subtree in hierarchy order.
    fn collect_subtree(&self, key: ProducerKey, out: &mut Vec<ProducerKey>) {
        let Some(node) = self.nodes.get(key) else {
            return;
        };
        out.push(key);
        for child in node.children.iter().flatten() {
            self.collect_subtree(*child, out);
        }
    }

    ///Enabled nodes of `key`'s subtree in hierarchy order. A disabled node disables its whole subtree.
    fn collect_active(&self, key: ProducerKey, out: &mut Vec<ProducerKey>) {
        let Some(node) = self.nodes.get(key) else {
            return;
        };
        if !node.enabled || !node.producer.lock().is_enabled() {
            return;
        }
        out.push(key);
        for child in node.children.iter().flatten() {
            self.collect_active(*child, out);
        }
    }

    fn prepare_node(
        &self,
        key: ProducerKey,
        frame: u64,
        transfers: &mut TransferRequests,
    ) -> Result<(), GraphError> {
        let node = self.nodes.get(key).ok_or(GraphError::NoSuchProducer)?;

        let mut scopes = SmallVec::new();
        let mut cursor = Some(key);
        while let Some(current) = cursor.and_then(|k| self.nodes.get(k)) {
            scopes.push(current.scope.lock());
            cursor = current.parent;
        }

        let mut resources = FrameResources::new(frame, &self.dfe, scopes, transfers);
        node.producer.lock().prepare(&mut resources)
    }

    ///Drops all per-frame state of `prepared`.
    fn discard(&self, prepared: &PreparedFrame) {
        #[cfg(feature = "logging")]
        log::warn!("Discarding frame {}", prepared.frame);

        for key in prepared.roots.iter().flat_map(|r| r.nodes.iter()) {
            if let Some(node) = self.nodes.get(*key) {
                node.producer.lock().discard(&self.dfe);
            }
        }
        for node in self.nodes.values() {
            node.scope.lock().clear();
        }
    }

    ///Starts a new frame. Runs setup where needed, re-evaluates which producers are enabled or skipped and prepares
    /// all producers that take part in this frame.
    ///
    /// If anything fails, every per-frame state (prepare states, exports, viewports) of this frame is dropped.
    pub fn begin_frame(&mut self) -> Result<FrameSummary, GraphError> {
        if self.is_frame_in_flight() {
            return Err(GraphError::FrameInFlight);
        }
        if let Some(stale) = self.prepared.take() {
            self.discard(&stale);
        }

        self.frame += 1;
        let frame = self.frame;

        let mut all = Vec::with_capacity(self.nodes.len());
        for root in self.roots() {
            self.collect_subtree(root, &mut all);
        }
        for key in all {
            let Some(node) = self.nodes.get(key) else {
                continue;
            };
            let mut producer = node.producer.lock();
            if producer.needs_setup() {
                #[cfg(feature = "logging")]
                log::trace!("Setup {}", node.name);
                producer.setup(frame, &self.dfe)?;
            }
        }

        let mut summary = FrameSummary {
            frame,
            ..Default::default()
        };
        let mut prepared = PreparedFrame {
            frame,
            roots: Vec::new(),
        };

        let roots = self.roots().collect::<Vec<_>>();
        for root in roots {
            let mut active = Vec::new();
            self.collect_active(root, &mut active);
            if active.is_empty() {
                continue;
            }
            summary.any_enabled = true;

            let skip = active.iter().any(|k| {
                self.nodes
                    .get(*k)
                    .map(|n| n.producer.lock().should_skip())
                    .unwrap_or(false)
            });
            if skip {
                #[cfg(feature = "logging")]
                log::trace!("Skipping root {:?} in frame {}", self.name(root), frame);
                summary.skipped_roots += 1;
                continue;
            }

            let mut transfers = TransferRequests::default();
            let mut failed = None;
            for key in active.iter() {
                if let Err(e) = self.prepare_node(*key, frame, &mut transfers) {
                    failed = Some(e);
                    break;
                }
            }

            summary.prepared += active.len();
            prepared.roots.push(PreparedRoot {
                root,
                nodes: active,
                transfers,
            });

            if let Some(e) = failed {
                self.discard(&prepared);
                return Err(e);
            }
        }

        #[cfg(feature = "logging")]
        log::trace!("Prepared frame {}: {:?}", frame, summary);

        self.prepared = Some(prepared);
        Ok(summary)
    }

    fn spawn_root<S: Spawn + ?Sized>(
        &self,
        frame: u64,
        root: &mut PreparedRoot,
        spawner: &S,
    ) -> Result<PassData, GraphError> {
        let transfers = std::mem::take(&mut root.transfers);
        let transfer = spawner.spawn_with_handle(async move { transfers.build() })?;

        let mut producers = Vec::with_capacity(root.nodes.len());
        let mut submits = Vec::with_capacity(root.nodes.len());
        for key in root.nodes.iter() {
            let Some(node) = self.nodes.get(*key) else {
                continue;
            };
            let producer = node.producer.clone();
            producers.push(node.producer.clone());
            submits.push(spawner.spawn_with_handle(async move { submit_node(&producer, frame) })?);
        }

        let mut subtree = Vec::new();
        self.collect_subtree(root.root, &mut subtree);
        let scopes = subtree
            .into_iter()
            .filter_map(|k| self.nodes.get(k).map(|n| n.scope.clone()))
            .collect::<Vec<_>>();

        let dfe = self.dfe.clone();
        let guard = InFlightGuard::enter(&self.in_flight);
        Ok(async move {
            let mut batches = transfer.await;
            for node_batches in join_all(submits).await {
                batches.extend(node_batches);
            }

            for producer in producers.iter() {
                producer.lock().cleanup(frame, &dfe);
            }
            for scope in scopes.iter() {
                scope.lock().clear();
            }
            drop(guard);
            batches
        }
        .boxed())
    }

    ///Submits the frame started by [begin_frame](Self::begin_frame). Spawns one submit task per prepared producer
    /// and one transfer task per root on `spawner` and registers one pass per root at `order`. Cleanup runs once
    /// the pass resolved.
    ///
    /// Returns the number of registered passes.
    pub fn submit<S: Spawn + ?Sized>(
        &mut self,
        order: &mut GpuTaskOrder,
        spawner: &S,
    ) -> Result<usize, GraphError> {
        let Some(mut prepared) = self.prepared.take() else {
            return Ok(0);
        };
        if order.is_in_flight() {
            self.prepared = Some(prepared);
            return Err(GraphError::SubmissionInFlight);
        }
        if let Err(e) = spawner.status() {
            self.prepared = Some(prepared);
            return Err(e.into());
        }

        let frame = prepared.frame;
        let mut passes = Vec::with_capacity(prepared.roots.len());
        for root in prepared.roots.iter_mut() {
            match self.spawn_root(frame, root, spawner) {
                Ok(pass) => passes.push(pass),
                Err(e) => {
                    drop(passes);
                    self.discard(&prepared);
                    return Err(e);
                }
            }
        }

        let count = passes.len();
        for pass in passes {
            order.push_pass_data(pass)?;
        }
        Ok(count)
    }
}

fn submit_node(producer: &SharedProducer, frame: u64) -> Vec<SubmitBatch> {
    let mut batches = Vec::new();
    producer.lock().submit(frame, &mut batches);
    batches
}
