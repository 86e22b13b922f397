// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! The runtime: the scheduling window, library registration, fusion
//! driving, and ownership of every manager.
//!
//! Libraries author [`Operation`]s and submit them here. Submissions
//! buffer in a bounded window; draining the window runs the fusion
//! checker and dispatches each resulting operation through its
//! [`Strategy`] into the engine. All iteration that can influence
//! dispatched operations is insertion-ordered, because every shard of a
//! replicated program runs an identical copy of this code and must emit
//! the identical call sequence.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use lattice_common::{
    ElementType, LatticeError, Result, RuntimeConfig, ScalarValue, Shape,
};
use log::{debug, warn};
use parking_lot::Mutex;

use crate::attachment::{AttachmentManager, Detachment, ExternalAllocation};
use crate::engine::{
    Engine, FieldId, FieldSpace, FutureHandle, IndexSpace, LocalTaskId, ProjectionId,
    ReductionOpId, Region, ShardingId,
};
use crate::fusion::{
    FusionChecker, FusionDecision, IdenticalLaunchShapes, IdenticalProjection,
    IsolateScalarOutputs, ValidProducerConsumer, ValidTaskKinds,
};
use crate::launcher::{CopyLauncher, ScalarArg, TaskLauncher};
use crate::operation::{FusionMetadata, Operation};
use crate::region::{
    Field, FieldLedger, FieldManager, FieldMatch, RegionField, RegionManager,
};
use crate::solver::Partitioner;
use crate::store::{Store, StoreId, StoreRef, Transform};

/// Name under which the runtime registers its own library.
pub const CORE_LIBRARY_NAME: &str = "lattice.core";

/// Task extracting one scalar out of a packed future.
pub const EXTRACT_SCALAR_TASK_ID: LocalTaskId = LocalTaskId(1);

/// First projection/sharding functor id handed to dynamic registration;
/// ids below this belong to built-in functors.
const FIRST_DYNAMIC_FUNCTOR_ID: u32 = 1024;

/// What a library tells the runtime about fusion: the id of its fused
/// task and which of its task kinds are legal inside a fused group.
#[derive(Debug, Clone)]
pub struct FusionSpec {
    pub fused_task_id: LocalTaskId,
    pub fusable: IndexSet<LocalTaskId>,
    /// Kinds that may only close a fused group.
    pub terminals: IndexSet<LocalTaskId>,
}

/// A library pluggable into the runtime. The shared-object fields are
/// forwarded to the engine, which owns dynamic loading.
pub trait Library: Send {
    fn name(&self) -> &str;

    fn shared_library(&self) -> Option<&str> {
        None
    }

    fn c_header(&self) -> Option<&str> {
        None
    }

    fn registration_callback(&self) -> Option<&str> {
        None
    }

    /// Number of task ids the library reserves in the global id space.
    fn max_task_id(&self) -> u64 {
        1 << 10
    }

    fn fusion_spec(&self) -> Option<FusionSpec> {
        None
    }

    /// Called once when the library is registered.
    fn initialize(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called at shutdown, in reverse registration order.
    fn destroy(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A library's view of the runtime: its name, its global task id block,
/// and its fusion spec.
#[derive(Debug, Clone)]
pub struct Context {
    name: String,
    task_id_base: u64,
    fusion: Option<FusionSpec>,
}

impl Context {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get_task_id(&self, task_id: LocalTaskId) -> crate::engine::GlobalTaskId {
        crate::engine::GlobalTaskId(self.task_id_base + task_id.0)
    }

    pub fn fusion_spec(&self) -> Option<&FusionSpec> {
        self.fusion.as_ref()
    }
}

#[derive(Debug, Default)]
struct CoreLibrary;

impl Library for CoreLibrary {
    fn name(&self) -> &str {
        CORE_LIBRARY_NAME
    }

    fn max_task_id(&self) -> u64 {
        16
    }
}

/// The client-side runtime of the framework. One instance per shard;
/// every shard constructs it with the identical configuration.
pub struct Runtime {
    engine: Arc<dyn Engine>,
    config: RuntimeConfig,
    partition_manager: crate::partition::PartitionManager,
    attachment_manager: AttachmentManager,
    field_ledger: Arc<FieldLedger>,

    libraries: Mutex<Vec<Box<dyn Library>>>,
    contexts: Mutex<IndexMap<String, Context>>,
    next_task_id_base: AtomicU64,

    window: Mutex<Vec<Operation>>,
    clearing_pipe: AtomicBool,

    index_spaces: Mutex<IndexMap<Shape, IndexSpace>>,
    region_managers: Mutex<IndexMap<Shape, RegionManager>>,
    field_managers: Mutex<IndexMap<(Shape, ElementType), FieldManager>>,

    next_store_id: AtomicU64,
    next_projection_id: AtomicU32,
    next_sharding_id: AtomicU32,
    registered_projections: Mutex<IndexMap<(u32, Vec<i32>), ProjectionId>>,
    registered_shardings: Mutex<IndexMap<(u32, Vec<i32>), ShardingId>>,

    destroyed: AtomicBool,
    finalize_tasks: bool,
}

impl Runtime {
    /// Build a runtime over `engine`. Reads every tunable exactly once
    /// and registers the core library.
    pub fn try_new(engine: Arc<dyn Engine>, config: RuntimeConfig) -> Result<Self> {
        config.validate()?;
        let partition_manager = crate::partition::PartitionManager::try_new(&config)?;
        let finalize_tasks = engine.in_top_level_task();
        if finalize_tasks {
            engine.task_preamble();
        }
        let runtime = Self {
            engine,
            config,
            partition_manager,
            attachment_manager: AttachmentManager::new(),
            field_ledger: Arc::new(FieldLedger::default()),
            libraries: Mutex::new(vec![]),
            contexts: Mutex::new(IndexMap::new()),
            next_task_id_base: AtomicU64::new(0),
            window: Mutex::new(vec![]),
            clearing_pipe: AtomicBool::new(false),
            index_spaces: Mutex::new(IndexMap::new()),
            region_managers: Mutex::new(IndexMap::new()),
            field_managers: Mutex::new(IndexMap::new()),
            next_store_id: AtomicU64::new(0),
            next_projection_id: AtomicU32::new(FIRST_DYNAMIC_FUNCTOR_ID),
            next_sharding_id: AtomicU32::new(FIRST_DYNAMIC_FUNCTOR_ID),
            registered_projections: Mutex::new(IndexMap::new()),
            registered_shardings: Mutex::new(IndexMap::new()),
            destroyed: AtomicBool::new(false),
            finalize_tasks,
        };
        runtime.register_library(Box::new(CoreLibrary))?;
        Ok(runtime)
    }

    pub fn engine(&self) -> &dyn Engine {
        &*self.engine
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn partition_manager(&self) -> &crate::partition::PartitionManager {
        &self.partition_manager
    }

    pub fn attachment_manager(&self) -> &AttachmentManager {
        &self.attachment_manager
    }

    // ---------------------------------------------------------------
    // Libraries
    // ---------------------------------------------------------------

    /// Register `library`: load its shared object through the engine,
    /// run its `initialize` hook, and hand it a [`Context`].
    pub fn register_library(&self, mut library: Box<dyn Library>) -> Result<Context> {
        let name = library.name().to_string();
        if self.contexts.lock().contains_key(&name) {
            return Err(LatticeError::DuplicateLibrary(name));
        }
        if let Some(path) = library.shared_library() {
            let callback = library.registration_callback().ok_or_else(|| {
                LatticeError::Internal(format!(
                    "library {name} names a shared object but no registration \
                     callback"
                ))
            })?;
            self.engine.load_library(path, callback)?;
        }
        library.initialize()?;
        let task_id_base = self
            .next_task_id_base
            .fetch_add(library.max_task_id(), Ordering::SeqCst);
        let context = Context {
            name: name.clone(),
            task_id_base,
            fusion: library.fusion_spec(),
        };
        debug!("registered library {name} at task id base {task_id_base}");
        self.contexts.lock().insert(name, context.clone());
        self.libraries.lock().push(library);
        Ok(context)
    }

    pub fn context(&self, name: &str) -> Option<Context> {
        self.contexts.lock().get(name).cloned()
    }

    /// The first registered context that can host fused tasks.
    fn fusion_context(&self) -> Option<(Context, FusionSpec)> {
        let contexts = self.contexts.lock();
        contexts.values().find_map(|context| {
            context
                .fusion_spec()
                .cloned()
                .map(|spec| (context.clone(), spec))
        })
    }

    // ---------------------------------------------------------------
    // Stores
    // ---------------------------------------------------------------

    fn next_store_id(&self) -> StoreId {
        StoreId(self.next_store_id.fetch_add(1, Ordering::SeqCst))
    }

    pub fn create_store(&self, dtype: ElementType, shape: Shape) -> StoreRef {
        Arc::new(Store::new(self.next_store_id(), dtype, Some(shape), false))
    }

    /// A store with fixed per-dimension partitioning restrictions, e.g.
    /// one whose layout pins a dimension to a single shard.
    pub fn create_restricted_store(
        &self,
        dtype: ElementType,
        shape: Shape,
        restrictions: Vec<crate::partition::Restriction>,
    ) -> StoreRef {
        let mut store = Store::new(self.next_store_id(), dtype, Some(shape), false);
        store.set_restrictions(restrictions);
        Arc::new(store)
    }

    /// A zero-dimensional store backed by a future value.
    pub fn create_scalar_store(&self, dtype: ElementType) -> StoreRef {
        Arc::new(Store::new(
            self.next_store_id(),
            dtype,
            Some(Shape::empty()),
            true,
        ))
    }

    /// A store whose extents are only known once its producer ran.
    pub fn create_unbound_store(&self, dtype: ElementType) -> StoreRef {
        Arc::new(Store::new(self.next_store_id(), dtype, None, false))
    }

    /// A view of `parent` reached through `transform`.
    pub fn create_view(
        &self,
        parent: &StoreRef,
        shape: Shape,
        transform: Transform,
    ) -> StoreRef {
        Arc::new(Store::new_view(
            self.next_store_id(),
            Arc::clone(parent),
            shape,
            transform,
        ))
    }

    // ---------------------------------------------------------------
    // Window
    // ---------------------------------------------------------------

    /// Accept one operation. Operations produced by fusion are passed
    /// straight through to scheduling; everything else buffers in the
    /// window until it fills up.
    pub fn submit(&self, op: Operation) -> Result<()> {
        if self.clearing_pipe.load(Ordering::Acquire) {
            return self.schedule(vec![op], false);
        }
        let drained = {
            let mut window = self.window.lock();
            window.push(op);
            if window.len() >= self.config.window_size as usize {
                Some(std::mem::take(&mut *window))
            } else {
                None
            }
        };
        match drained {
            Some(ops) => self.schedule(ops, false),
            None => Ok(()),
        }
    }

    /// Drain the window unconditionally.
    pub fn flush(&self) -> Result<()> {
        let ops = std::mem::take(&mut *self.window.lock());
        if ops.is_empty() {
            return Ok(());
        }
        self.schedule(ops, false)
    }

    /// Number of operations buffered in the window.
    pub fn outstanding_ops(&self) -> usize {
        self.window.lock().len()
    }

    fn schedule(&self, mut ops: Vec<Operation>, force_eval: bool) -> Result<()> {
        if ops.len() >= 2 && !force_eval {
            debug!("scheduling {} ops through the fusion pipeline", ops.len());
            let fused = self.build_fused_op(ops)?;
            self.clearing_pipe.store(true, Ordering::Release);
            let result = (|| {
                for op in fused {
                    op.execute(self)?;
                }
                Ok(())
            })();
            self.clearing_pipe.store(false, Ordering::Release);
            result
        } else if ops.len() == 1 && self.clearing_pipe.load(Ordering::Acquire) {
            // The op already waited in the window once and carries the
            // strategy the legality check computed for it.
            let mut op = ops.pop().ok_or_else(|| {
                LatticeError::Internal("scheduling an empty batch".to_string())
            })?;
            let strategy = op.take_strategy().ok_or_else(|| {
                LatticeError::Internal(
                    "an operation reached the pipe without a strategy".to_string(),
                )
            })?;
            op.launch(&strategy, self)
        } else {
            for op in &ops {
                let partitioner =
                    Partitioner::new(std::slice::from_ref(op), op.has_scalar_output());
                let strategy = partitioner.partition_stores(self)?;
                op.launch(&strategy, self)?;
            }
            Ok(())
        }
    }

    /// Run the fusion checker over `ops` and rebuild the window as a
    /// list of pass-through operations and fused tasks, each with its
    /// strategy attached.
    fn build_fused_op(&self, ops: Vec<Operation>) -> Result<Vec<Operation>> {
        let Some((context, spec)) = self.fusion_context() else {
            debug!("no registered library hosts fused tasks; dispatching one by one");
            let mut passthrough = Vec::with_capacity(ops.len());
            for mut op in ops {
                let partitioner =
                    Partitioner::new(std::slice::from_ref(&op), op.has_scalar_output());
                let strategy = partitioner.partition_stores(self)?;
                op.set_strategy(strategy);
                passthrough.push(op);
            }
            return Ok(passthrough);
        };

        let mut checker =
            FusionChecker::new(&ops, self.config.fusion_threshold as usize);
        checker.register_rule(Box::new(ValidTaskKinds::new(
            spec.fusable.clone(),
            spec.terminals.clone(),
        )));
        checker.register_rule(Box::new(IdenticalLaunchShapes));
        checker.register_rule(Box::new(IdenticalProjection));
        checker.register_rule(Box::new(ValidProducerConsumer));
        checker.register_rule(Box::new(IsolateScalarOutputs));
        let FusionDecision {
            fusable,
            intervals,
            strategies,
        } = checker.check(self)?;
        debug!(
            "fusion over {} ops: fusable={fusable}, {} intervals",
            ops.len(),
            intervals.len()
        );

        let mut slots: Vec<Option<Operation>> = ops.into_iter().map(Some).collect();
        let mut strategies: Vec<Option<_>> = strategies.into_iter().map(Some).collect();
        let mut rebuilt = vec![];
        for interval in intervals {
            if interval.len() == 1 {
                let index = interval.start;
                let mut op = take_slot(&mut slots, index)?;
                let strategy = strategies[index].take().ok_or_else(|| {
                    LatticeError::Internal(
                        "per-op strategy consumed twice".to_string(),
                    )
                })?;
                op.set_strategy(strategy);
                rebuilt.push(op);
            } else {
                let mut fused = {
                    let mut subs = Vec::with_capacity(interval.len());
                    for index in interval.clone() {
                        subs.push(slots[index].as_ref().ok_or_else(|| {
                            LatticeError::Internal(
                                "window operation consumed twice".to_string(),
                            )
                        })?);
                    }
                    self.make_fused_task(&context, &spec, &subs)?
                };
                for index in interval {
                    slots[index] = None;
                }
                let partitioner = Partitioner::new(
                    std::slice::from_ref(&fused),
                    fused.has_scalar_output(),
                );
                let strategy = partitioner.partition_stores(self)?;
                fused.set_strategy(strategy);
                rebuilt.push(fused);
            }
        }
        Ok(rebuilt)
    }

    /// Concatenate the sub-ops' arguments into one fused task and attach
    /// the header describing each sub-op's slice.
    fn make_fused_task(
        &self,
        context: &Context,
        spec: &FusionSpec,
        subs: &[&Operation],
    ) -> Result<Operation> {
        let mut fused = Operation::new_task(context.name(), spec.fused_task_id, 0);
        let metadata = build_fusion_metadata(context, subs)?;
        for op in subs {
            for arg in op.scalar_args() {
                fused.add_scalar_arg(arg.clone())?;
            }
            for (store, redop) in op.reductions() {
                fused.add_reduction(store.clone(), *redop)?;
            }
            for store in op.inputs() {
                fused.add_input(store.clone());
            }
            for store in op.outputs() {
                fused.add_output(store.clone())?;
            }
            for future in op.futures() {
                fused.add_future(*future)?;
            }
            fused.union_constraints(op.constraints());
        }
        fused.set_fusion_metadata(metadata)?;
        Ok(fused)
    }

    // ---------------------------------------------------------------
    // Fields and regions
    // ---------------------------------------------------------------

    /// Allocate a field of `shape` and `dtype`, reusing reclaimed fields
    /// where every shard agrees.
    pub fn allocate_field(
        &self,
        shape: Shape,
        dtype: ElementType,
    ) -> Result<Arc<RegionField>> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(LatticeError::Internal(
                "cannot allocate a field on a destroyed runtime".to_string(),
            ));
        }
        self.drain_field_ledger();
        let (region, field_id) = {
            let mut managers = self.field_managers.lock();
            let manager = managers
                .entry((shape.clone(), dtype))
                .or_insert_with(|| {
                    FieldManager::new(
                        shape.clone(),
                        dtype,
                        self.config.field_reuse_size,
                        self.config.field_reuse_frequency,
                    )
                });
            manager.allocate_field(self)?
        };
        let field = Field::new(
            Arc::clone(&self.field_ledger),
            region,
            field_id,
            dtype,
            shape,
            true,
        );
        Ok(Arc::new(RegionField::new(field)))
    }

    /// Fall-through path of the field managers: a brand-new field from
    /// the per-shape region pool.
    pub(crate) fn allocate_new_field(
        &self,
        shape: &Shape,
        dtype: ElementType,
    ) -> Result<(Region, FieldId)> {
        let index_space = self.find_or_create_index_space(shape);
        let mut region_managers = self.region_managers.lock();
        let manager = region_managers
            .entry(shape.clone())
            .or_insert_with(|| RegionManager::new(shape.clone()));
        Ok(manager.allocate_field(self.engine(), index_space, dtype.size()))
    }

    /// Allocate a field directly in `field_space`; used for unbound
    /// outputs whose field space was picked by the solver.
    pub fn allocate_field_in_space(
        &self,
        field_space: FieldSpace,
        dtype: ElementType,
    ) -> FieldId {
        self.engine.allocate_field(field_space, dtype.size())
    }

    /// Adopt a region produced by the engine for an unbound output.
    pub fn import_output_region(
        &self,
        region: Region,
        shape: Shape,
        field_id: FieldId,
        dtype: ElementType,
    ) -> Result<Arc<RegionField>> {
        self.region_managers
            .lock()
            .entry(shape.clone())
            .or_insert_with(|| RegionManager::new(shape.clone()))
            .import_region(region);
        self.field_managers
            .lock()
            .entry((shape.clone(), dtype))
            .or_insert_with(|| {
                FieldManager::new(
                    shape.clone(),
                    dtype,
                    self.config.field_reuse_size,
                    self.config.field_reuse_frequency,
                )
            });
        let field = Field::new(
            Arc::clone(&self.field_ledger),
            region,
            field_id,
            dtype,
            shape,
            true,
        );
        Ok(Arc::new(RegionField::new(field)))
    }

    /// Route fields returned by dropped handles back to their managers.
    fn drain_field_ledger(&self) {
        for returned in self.field_ledger.drain() {
            let mut managers = self.field_managers.lock();
            let manager = managers
                .entry((returned.shape.clone(), returned.dtype))
                .or_insert_with(|| {
                    FieldManager::new(
                        returned.shape.clone(),
                        returned.dtype,
                        self.config.field_reuse_size,
                        self.config.field_reuse_frequency,
                    )
                });
            manager.free_field(returned.region, returned.field_id, false);
        }
    }

    // ---------------------------------------------------------------
    // Dispatch
    // ---------------------------------------------------------------

    /// Housekeeping that precedes every engine dispatch: parked
    /// detachments go out and resolved ones are pruned.
    fn dispatch_housekeeping(&self) -> Result<()> {
        self.attachment_manager.perform_detachments(self.engine())?;
        self.attachment_manager.prune_detachments(self.engine());
        Ok(())
    }

    /// Dispatch a task launch, single-point or over `launch_domain`.
    pub fn dispatch_task(
        &self,
        launcher: TaskLauncher,
        launch_domain: Option<&Shape>,
        redop: Option<ReductionOpId>,
    ) -> Result<FutureHandle> {
        self.dispatch_housekeeping()?;
        Ok(match launch_domain {
            None => launcher.execute_single(self.engine()),
            Some(domain) => launcher.execute(self.engine(), domain, redop),
        })
    }

    /// Dispatch a copy launch.
    pub fn dispatch_copy(
        &self,
        launcher: CopyLauncher,
        launch_domain: Option<&Shape>,
    ) -> Result<()> {
        self.dispatch_housekeeping()?;
        launcher.execute(self.engine(), launch_domain);
        Ok(())
    }

    /// Dispatch a consensus match.
    pub fn dispatch_field_match(
        &self,
        field_match: &mut FieldMatch,
    ) -> Result<FutureHandle> {
        self.dispatch_housekeeping()?;
        field_match.launch(self.engine())
    }

    pub fn find_or_create_index_space(&self, shape: &Shape) -> IndexSpace {
        let mut index_spaces = self.index_spaces.lock();
        if let Some(index_space) = index_spaces.get(shape) {
            return *index_space;
        }
        let index_space = self.engine.create_index_space(shape);
        index_spaces.insert(shape.clone(), index_space);
        index_space
    }

    pub fn create_field_space(&self) -> FieldSpace {
        self.engine.create_field_space()
    }

    pub fn create_future(&self, data: &[u8]) -> FutureHandle {
        self.engine.create_future(data)
    }

    // ---------------------------------------------------------------
    // Attachments
    // ---------------------------------------------------------------

    pub fn has_attachment(&self, buffer: &crate::attachment::ExternalBuffer) -> bool {
        self.attachment_manager.has_attachment(buffer)
    }

    pub fn reuse_existing_attachment(
        &self,
        buffer: &crate::attachment::ExternalBuffer,
    ) -> Option<Arc<RegionField>> {
        self.attachment_manager.reuse_existing_attachment(buffer)
    }

    pub fn attach_external_allocation(
        &self,
        alloc: &ExternalAllocation,
        region_field: &Arc<RegionField>,
    ) -> Result<()> {
        self.attachment_manager
            .attach_external_allocation(alloc, region_field)
    }

    pub fn detach_external_allocation(
        &self,
        alloc: ExternalAllocation,
        detach: Detachment,
        defer: bool,
    ) -> Result<()> {
        // A deferred detachment is only parked; the housekeeping runs
        // when a detach actually goes out to the engine.
        if !defer {
            self.dispatch_housekeeping()?;
        }
        self.attachment_manager.detach_external_allocation(
            self.engine(),
            alloc,
            detach,
            defer,
            false,
        )
    }

    pub fn register_detachment(&self, detach: Detachment) -> u32 {
        self.attachment_manager.register_detachment(detach)
    }

    pub fn remove_detachment(&self, key: u32) -> Result<Detachment> {
        self.attachment_manager.remove_detachment(key)
    }

    pub fn progress_unordered_operations(&self) {
        self.engine.progress_unordered_operations();
    }

    // ---------------------------------------------------------------
    // Projections
    // ---------------------------------------------------------------

    /// The projection functor mapping a `src_ndim`-dimensional launch
    /// point onto `dims`. Registration is memoized; a miss allocates the
    /// next projection and sharding id and registers both.
    pub fn get_projection(&self, src_ndim: u32, dims: &[i32]) -> ProjectionId {
        let key = (src_ndim, dims.to_vec());
        if let Some(projection) = self.registered_projections.lock().get(&key) {
            return *projection;
        }
        let projection =
            ProjectionId(self.next_projection_id.fetch_add(1, Ordering::SeqCst));
        self.registered_projections
            .lock()
            .insert(key.clone(), projection);
        self.engine.register_projection(src_ndim, dims, projection);

        let sharding = ShardingId(self.next_sharding_id.fetch_add(1, Ordering::SeqCst));
        self.registered_shardings.lock().insert(key, sharding);
        self.engine.register_sharding(sharding, projection);
        projection
    }

    // ---------------------------------------------------------------
    // Scalars
    // ---------------------------------------------------------------

    /// Launch the core task that extracts the `idx`-th scalar out of a
    /// packed future.
    pub fn extract_scalar(
        &self,
        future: FutureHandle,
        idx: i32,
        launch_domain: Option<&Shape>,
    ) -> Result<FutureHandle> {
        let context = self.context(CORE_LIBRARY_NAME).ok_or_else(|| {
            LatticeError::Internal("the core library is not registered".to_string())
        })?;
        let mut launcher =
            TaskLauncher::new(context.get_task_id(EXTRACT_SCALAR_TASK_ID), 0);
        launcher.add_future(future);
        launcher.add_scalar_arg(ScalarArg {
            value: ScalarValue::Int32(idx),
            dtype: ElementType::Int32,
        });
        self.dispatch_task(launcher, launch_domain, None)
    }

    pub fn reduce_future_map(
        &self,
        future_map: FutureHandle,
        redop: ReductionOpId,
    ) -> FutureHandle {
        self.engine.reduce_future_map(future_map, redop)
    }

    // ---------------------------------------------------------------
    // Shutdown
    // ---------------------------------------------------------------

    /// Tear the runtime down: flush the window, destroy libraries in
    /// reverse registration order, drain all detachments, and drop the
    /// region, field, and index-space caches.
    pub fn destroy(&self) -> Result<()> {
        if self.destroyed.load(Ordering::Acquire) {
            return Ok(());
        }
        self.flush()?;

        let mut libraries = std::mem::take(&mut *self.libraries.lock());
        for library in libraries.iter_mut().rev() {
            if let Err(error) = library.destroy() {
                warn!("library {} failed to destroy: {error}", library.name());
            }
        }
        self.contexts.lock().clear();

        self.attachment_manager.destroy(self.engine());
        self.field_ledger.destroy();
        {
            let mut field_managers = self.field_managers.lock();
            for (_, manager) in field_managers.iter_mut() {
                manager.destroy();
            }
            field_managers.clear();
        }
        {
            let mut region_managers = self.region_managers.lock();
            for (_, manager) in region_managers.iter_mut() {
                manager.destroy(self.engine());
            }
            region_managers.clear();
        }
        self.index_spaces.lock().clear();
        self.partition_manager.clear();

        if self.finalize_tasks {
            self.engine.task_postamble();
        }
        self.destroyed.store(true, Ordering::Release);
        Ok(())
    }
}

fn take_slot(slots: &mut [Option<Operation>], index: usize) -> Result<Operation> {
    slots[index].take().ok_or_else(|| {
        LatticeError::Internal("window operation consumed twice".to_string())
    })
}

/// Build the header describing each sub-op's slice of the fused task's
/// concatenated argument arrays.
fn build_fusion_metadata(
    context: &Context,
    subs: &[&Operation],
) -> Result<FusionMetadata> {
    let mut metadata = FusionMetadata::default();
    let mut input_start = 0u32;
    let mut output_start = 0u32;
    let mut offset_start = 0u32;
    let mut reduction_start = 0u32;
    let mut scalar_start = 0u32;
    let mut future_start = 0u32;

    for op in subs {
        metadata.input_starts.push(input_start);
        metadata.output_starts.push(output_start);
        metadata.offset_starts.push(offset_start);
        metadata.reduction_starts.push(reduction_start);
        metadata.scalar_starts.push(scalar_start);
        metadata.future_starts.push(future_start);

        for (index, _) in op.inputs().iter().enumerate() {
            metadata.offsets.push(index as i32 + 1);
        }
        for (index, _) in op.outputs().iter().enumerate() {
            metadata.offsets.push(-(index as i32 + 1));
        }
        for (index, _) in op.reductions().iter().enumerate() {
            metadata.offsets.push(-(index as i32 + 1));
        }

        let task_id = op.task_id().ok_or_else(|| {
            LatticeError::Internal("only tasks can join a fused group".to_string())
        })?;
        metadata.op_ids.push(context.get_task_id(task_id).0);

        input_start += op.inputs().len() as u32;
        output_start += op.outputs().len() as u32;
        offset_start +=
            (op.inputs().len() + op.outputs().len() + op.reductions().len()) as u32;
        reduction_start += op.reductions().len() as u32;
        scalar_start += op.scalar_args().len() as u32;
        future_start += op.futures().len() as u32;
    }

    metadata.input_starts.push(input_start);
    metadata.output_starts.push(output_start);
    metadata.offset_starts.push(offset_start);
    metadata.reduction_starts.push(reduction_start);
    metadata.scalar_starts.push(scalar_start);
    metadata.future_starts.push(future_start);
    Ok(metadata)
}
