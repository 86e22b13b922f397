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

//! Value objects describing one submitted operation, plus the metadata
//! header that lets the execution side of a fused task recover each
//! sub-operation's slice of the concatenated argument arrays.

use std::ops::Range;

use indexmap::IndexSet;
use lattice_common::{LatticeError, Result, Shape};

use crate::engine::{FutureHandle, LocalTaskId, ReductionOpId};
use crate::launcher::{CopyLauncher, ScalarArg, TaskLauncher};
use crate::runtime::Runtime;
use crate::solver::{EquivalenceClasses, Strategy};
use crate::store::{StoreId, StoreRef};

/// Arguments specific to a task.
#[derive(Debug)]
pub struct TaskArgs {
    pub task_id: LocalTaskId,
    pub scalar_args: Vec<ScalarArg>,
    pub futures: Vec<FutureHandle>,
    pub fusion_metadata: Option<FusionMetadata>,
}

impl TaskArgs {
    fn new(task_id: LocalTaskId) -> Self {
        Self {
            task_id,
            scalar_args: vec![],
            futures: vec![],
            fusion_metadata: None,
        }
    }
}

/// Arguments specific to a copy.
#[derive(Debug, Default)]
pub struct CopyArgs {
    pub source_indirects: Vec<StoreRef>,
    pub target_indirects: Vec<StoreRef>,
}

#[derive(Debug)]
pub enum OpKind {
    Task(TaskArgs),
    Copy(CopyArgs),
}

/// One submitted operation: ordered store argument lists, alignment
/// constraints, and either task or copy specifics.
#[derive(Debug)]
pub struct Operation {
    context: String,
    mapper_id: u32,
    no_accesses: Vec<StoreRef>,
    inputs: Vec<StoreRef>,
    outputs: Vec<StoreRef>,
    reductions: Vec<(StoreRef, ReductionOpId)>,
    scalar_output: Option<StoreRef>,
    scalar_reduction: Option<(StoreRef, ReductionOpId)>,
    constraints: EquivalenceClasses,
    broadcasts: IndexSet<StoreId>,
    kind: OpKind,
    strategy: Option<Strategy>,
}

impl Operation {
    pub fn new_task(
        context: impl Into<String>,
        task_id: LocalTaskId,
        mapper_id: u32,
    ) -> Self {
        Self::new(context, mapper_id, OpKind::Task(TaskArgs::new(task_id)))
    }

    pub fn new_copy(context: impl Into<String>, mapper_id: u32) -> Self {
        Self::new(context, mapper_id, OpKind::Copy(CopyArgs::default()))
    }

    fn new(context: impl Into<String>, mapper_id: u32, kind: OpKind) -> Self {
        Self {
            context: context.into(),
            mapper_id,
            no_accesses: vec![],
            inputs: vec![],
            outputs: vec![],
            reductions: vec![],
            scalar_output: None,
            scalar_reduction: None,
            constraints: EquivalenceClasses::default(),
            broadcasts: IndexSet::new(),
            kind,
            strategy: None,
        }
    }

    pub fn context_name(&self) -> &str {
        &self.context
    }

    pub fn mapper_id(&self) -> u32 {
        self.mapper_id
    }

    pub fn kind(&self) -> &OpKind {
        &self.kind
    }

    pub fn task_id(&self) -> Option<LocalTaskId> {
        match &self.kind {
            OpKind::Task(args) => Some(args.task_id),
            OpKind::Copy(_) => None,
        }
    }

    pub fn no_accesses(&self) -> &[StoreRef] {
        &self.no_accesses
    }

    pub fn inputs(&self) -> &[StoreRef] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[StoreRef] {
        &self.outputs
    }

    pub fn reductions(&self) -> &[(StoreRef, ReductionOpId)] {
        &self.reductions
    }

    pub fn scalar_args(&self) -> &[ScalarArg] {
        match &self.kind {
            OpKind::Task(args) => &args.scalar_args,
            OpKind::Copy(_) => &[],
        }
    }

    pub fn futures(&self) -> &[FutureHandle] {
        match &self.kind {
            OpKind::Task(args) => &args.futures,
            OpKind::Copy(_) => &[],
        }
    }

    pub fn constraints(&self) -> &EquivalenceClasses {
        &self.constraints
    }

    pub fn broadcasts(&self) -> &IndexSet<StoreId> {
        &self.broadcasts
    }

    pub fn has_scalar_output(&self) -> bool {
        self.scalar_output.is_some() || self.scalar_reduction.is_some()
    }

    /// Every store this operation touches, in argument order. Copies
    /// also consume their indirection stores.
    pub fn all_stores(&self) -> Vec<StoreRef> {
        let mut stores: Vec<StoreRef> = vec![];
        stores.extend(self.no_accesses.iter().cloned());
        stores.extend(self.inputs.iter().cloned());
        if let OpKind::Copy(args) = &self.kind {
            stores.extend(args.source_indirects.iter().cloned());
            stores.extend(args.target_indirects.iter().cloned());
        }
        stores.extend(self.outputs.iter().cloned());
        stores.extend(self.reductions.iter().map(|(store, _)| store.clone()));
        stores
    }

    pub fn add_no_access(&mut self, store: StoreRef) {
        self.no_accesses.push(store);
    }

    pub fn add_input(&mut self, store: StoreRef) {
        self.inputs.push(store);
    }

    /// Add an output store; a scalar store occupies the single scalar
    /// output slot instead of the output list.
    pub fn add_output(&mut self, store: StoreRef) -> Result<()> {
        if store.scalar() {
            self.check_scalar_output()?;
            self.scalar_output = Some(store);
        } else {
            self.outputs.push(store);
        }
        Ok(())
    }

    pub fn add_reduction(&mut self, store: StoreRef, redop: ReductionOpId) -> Result<()> {
        if store.scalar() {
            self.check_scalar_output()?;
            self.scalar_reduction = Some((store, redop));
        } else {
            self.reductions.push((store, redop));
        }
        Ok(())
    }

    fn check_scalar_output(&self) -> Result<()> {
        if self.has_scalar_output() {
            return Err(LatticeError::MultipleScalarOutputs);
        }
        Ok(())
    }

    /// Require two stores to be partitioned identically.
    pub fn add_alignment(&mut self, store1: &StoreRef, store2: &StoreRef) -> Result<()> {
        if store1.shape() != store2.shape() {
            return Err(LatticeError::ShapeMismatch(
                store1.shape().cloned().unwrap_or_else(Shape::empty),
                store2.shape().cloned().unwrap_or_else(Shape::empty),
            ));
        }
        self.constraints.record(store1.id(), store2.id());
        Ok(())
    }

    pub fn add_broadcast(&mut self, store: &StoreRef) {
        self.broadcasts.insert(store.id());
    }

    pub fn add_scalar_arg(&mut self, arg: ScalarArg) -> Result<()> {
        match &mut self.kind {
            OpKind::Task(args) => {
                args.scalar_args.push(arg);
                Ok(())
            }
            OpKind::Copy(_) => Err(LatticeError::Internal(
                "scalar arguments are only valid on tasks".to_string(),
            )),
        }
    }

    pub fn add_future(&mut self, future: FutureHandle) -> Result<()> {
        match &mut self.kind {
            OpKind::Task(args) => {
                args.futures.push(future);
                Ok(())
            }
            OpKind::Copy(_) => Err(LatticeError::Internal(
                "futures are only valid on tasks".to_string(),
            )),
        }
    }

    pub fn add_source_indirect(&mut self, store: StoreRef) -> Result<()> {
        match &mut self.kind {
            OpKind::Copy(args) => {
                args.source_indirects.push(store);
                Ok(())
            }
            OpKind::Task(_) => Err(LatticeError::Internal(
                "indirections are only valid on copies".to_string(),
            )),
        }
    }

    pub fn add_target_indirect(&mut self, store: StoreRef) -> Result<()> {
        match &mut self.kind {
            OpKind::Copy(args) => {
                args.target_indirects.push(store);
                Ok(())
            }
            OpKind::Task(_) => Err(LatticeError::Internal(
                "indirections are only valid on copies".to_string(),
            )),
        }
    }

    pub(crate) fn union_constraints(&mut self, other: &EquivalenceClasses) {
        self.constraints.union(other);
    }

    pub(crate) fn set_fusion_metadata(&mut self, metadata: FusionMetadata) -> Result<()> {
        match &mut self.kind {
            OpKind::Task(args) => {
                args.fusion_metadata = Some(metadata);
                Ok(())
            }
            OpKind::Copy(_) => Err(LatticeError::Internal(
                "fusion metadata is only valid on tasks".to_string(),
            )),
        }
    }

    pub fn fusion_metadata(&self) -> Option<&FusionMetadata> {
        match &self.kind {
            OpKind::Task(args) => args.fusion_metadata.as_ref(),
            OpKind::Copy(_) => None,
        }
    }

    pub fn strategy(&self) -> Option<&Strategy> {
        self.strategy.as_ref()
    }

    pub(crate) fn set_strategy(&mut self, strategy: Strategy) {
        self.strategy = Some(strategy);
    }

    pub(crate) fn take_strategy(&mut self) -> Option<Strategy> {
        self.strategy.take()
    }

    /// Submit this operation to the runtime's scheduling window.
    pub fn execute(self, runtime: &Runtime) -> Result<()> {
        runtime.submit(self)
    }

    /// Push every argument into a launcher under `strategy` and hand the
    /// launch to the engine.
    pub fn launch(&self, strategy: &Strategy, runtime: &Runtime) -> Result<()> {
        match &self.kind {
            OpKind::Task(args) => self.launch_task(args, strategy, runtime),
            OpKind::Copy(args) => self.launch_copy(args, strategy, runtime),
        }
    }

    fn launch_task(
        &self,
        args: &TaskArgs,
        strategy: &Strategy,
        runtime: &Runtime,
    ) -> Result<()> {
        let context = runtime.context(&self.context).ok_or_else(|| {
            LatticeError::Internal(format!(
                "operation belongs to unregistered library {}",
                self.context
            ))
        })?;
        let mut launcher =
            TaskLauncher::new(context.get_task_id(args.task_id), self.mapper_id);

        for store in &self.no_accesses {
            launcher.add_no_access(strategy.get_requirement(store, runtime)?);
        }
        for store in &self.inputs {
            launcher.add_input(strategy.get_requirement(store, runtime)?);
        }
        for store in &self.outputs {
            if !store.unbound() {
                launcher.add_output(strategy.get_requirement(store, runtime)?);
            }
        }
        for (store, redop) in &self.reductions {
            launcher.add_reduction(strategy.get_requirement(store, runtime)?, *redop);
        }
        for store in &self.outputs {
            if !store.unbound() {
                continue;
            }
            let field_space = strategy.get_field_space(store)?;
            let field_id = runtime.allocate_field_in_space(field_space, store.dtype());
            launcher.add_unbound_output(store.id(), field_space, field_id);
        }

        for arg in &args.scalar_args {
            launcher.add_scalar_arg(arg.clone());
        }
        for future in &args.futures {
            launcher.add_future(*future);
        }
        if let Some(metadata) = &args.fusion_metadata {
            launcher.set_fusion_metadata(metadata.clone());
        }

        if let Some(output) = &self.scalar_output {
            strategy.launch(launcher, runtime, Some(output), None)
        } else if let Some((store, redop)) = &self.scalar_reduction {
            strategy.launch(launcher, runtime, Some(store), Some(*redop))
        } else {
            strategy.launch(launcher, runtime, None, None)
        }
    }

    fn launch_copy(
        &self,
        args: &CopyArgs,
        strategy: &Strategy,
        runtime: &Runtime,
    ) -> Result<()> {
        if !self.no_accesses.is_empty() {
            return Err(LatticeError::Internal(
                "copies do not take no-access stores".to_string(),
            ));
        }
        if self.inputs.len() != self.outputs.len()
            && self.inputs.len() != self.reductions.len()
        {
            return Err(LatticeError::Internal(format!(
                "copy argument counts do not line up: {} inputs, {} outputs, {} \
                 reductions",
                self.inputs.len(),
                self.outputs.len(),
                self.reductions.len()
            )));
        }
        if !args.source_indirects.is_empty()
            && args.source_indirects.len() != self.inputs.len()
        {
            return Err(LatticeError::Internal(
                "source indirections must match inputs one to one".to_string(),
            ));
        }
        if !args.target_indirects.is_empty()
            && args.target_indirects.len() != self.outputs.len()
        {
            return Err(LatticeError::Internal(
                "target indirections must match outputs one to one".to_string(),
            ));
        }

        let mut launcher = CopyLauncher::new(self.mapper_id);
        for store in &self.inputs {
            launcher.add_input(strategy.get_requirement(store, runtime)?);
        }
        for store in &self.outputs {
            if store.unbound() {
                return Err(LatticeError::Internal(
                    "copies cannot write unbound stores".to_string(),
                ));
            }
            launcher.add_output(strategy.get_requirement(store, runtime)?);
        }
        for store in &args.source_indirects {
            launcher.add_source_indirect(strategy.get_requirement(store, runtime)?);
        }
        for store in &args.target_indirects {
            launcher.add_target_indirect(strategy.get_requirement(store, runtime)?);
        }
        for (store, redop) in &self.reductions {
            launcher.add_reduction(strategy.get_requirement(store, runtime)?, *redop);
        }

        runtime.dispatch_copy(launcher, strategy.launch_shape())
    }
}

/// The header attached to a fused task. Each `*_starts` array has one
/// entry per sub-operation plus a terminator, so sub-op `i` owns the
/// half-open slice `starts[i]..starts[i + 1]` of the corresponding
/// concatenated argument array.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FusionMetadata {
    pub input_starts: Vec<u32>,
    pub output_starts: Vec<u32>,
    pub offset_starts: Vec<u32>,
    /// Positive entry `i` marks the `i`-th input of a sub-op; negative
    /// entry `-i` marks its `i`-th output or reduction.
    pub offsets: Vec<i32>,
    pub reduction_starts: Vec<u32>,
    pub scalar_starts: Vec<u32>,
    pub future_starts: Vec<u32>,
    pub op_ids: Vec<u64>,
}

impl FusionMetadata {
    pub fn num_subops(&self) -> usize {
        self.op_ids.len()
    }

    pub fn input_range(&self, subop: usize) -> Range<usize> {
        range_of(&self.input_starts, subop)
    }

    pub fn output_range(&self, subop: usize) -> Range<usize> {
        range_of(&self.output_starts, subop)
    }

    pub fn offset_range(&self, subop: usize) -> Range<usize> {
        range_of(&self.offset_starts, subop)
    }

    pub fn reduction_range(&self, subop: usize) -> Range<usize> {
        range_of(&self.reduction_starts, subop)
    }

    pub fn scalar_range(&self, subop: usize) -> Range<usize> {
        range_of(&self.scalar_starts, subop)
    }

    pub fn future_range(&self, subop: usize) -> Range<usize> {
        range_of(&self.future_starts, subop)
    }
}

fn range_of(starts: &[u32], subop: usize) -> Range<usize> {
    starts[subop] as usize..starts[subop + 1] as usize
}
