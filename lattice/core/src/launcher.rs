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

//! Builders that accumulate the engine-level description of one task or
//! copy launch and then hand it to the engine.

use lattice_common::{ElementType, ScalarValue, Shape};

use crate::engine::{
    Engine, FieldId, FieldSpace, FutureHandle, GlobalTaskId, PartitionHandle,
    ProjectionId, ReductionOpId,
};
use crate::operation::FusionMetadata;
use crate::store::StoreId;

/// How a launch accesses one region requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    NoAccess,
    Read,
    Write,
    Reduce,
}

/// One region requirement of a launch. A requirement without a partition
/// broadcasts the whole store to every point of the launch domain.
#[derive(Debug, Clone, PartialEq)]
pub struct Requirement {
    pub store: StoreId,
    pub partition: Option<PartitionHandle>,
    pub color_shape: Option<Shape>,
    /// Projection functor delinearizing the launch domain onto the
    /// partition's color space when their ranks differ.
    pub projection: Option<ProjectionId>,
    pub access: AccessKind,
    pub redop: Option<ReductionOpId>,
}

/// An output whose extents are decided by the task itself; the field is
/// allocated in the strategy-supplied field space right before launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnboundOutput {
    pub store: StoreId,
    pub field_space: FieldSpace,
    pub field_id: FieldId,
}

/// A scalar argument as `(value, dtype)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalarArg {
    pub value: ScalarValue,
    pub dtype: ElementType,
}

/// The complete engine-level description of one task launch.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskLaunch {
    pub task_id: GlobalTaskId,
    pub mapper_id: u32,
    pub requirements: Vec<Requirement>,
    pub unbound_outputs: Vec<UnboundOutput>,
    pub scalar_args: Vec<ScalarArg>,
    pub futures: Vec<FutureHandle>,
    pub fusion_metadata: Option<FusionMetadata>,
    /// `None` launches a single point.
    pub launch_domain: Option<Shape>,
    pub redop: Option<ReductionOpId>,
}

/// Accumulates the pieces of a [`TaskLaunch`] in submission order.
#[derive(Debug)]
pub struct TaskLauncher {
    task_id: GlobalTaskId,
    mapper_id: u32,
    requirements: Vec<Requirement>,
    unbound_outputs: Vec<UnboundOutput>,
    scalar_args: Vec<ScalarArg>,
    futures: Vec<FutureHandle>,
    fusion_metadata: Option<FusionMetadata>,
}

impl TaskLauncher {
    pub fn new(task_id: GlobalTaskId, mapper_id: u32) -> Self {
        Self {
            task_id,
            mapper_id,
            requirements: vec![],
            unbound_outputs: vec![],
            scalar_args: vec![],
            futures: vec![],
            fusion_metadata: None,
        }
    }

    pub fn add_no_access(&mut self, mut requirement: Requirement) {
        requirement.access = AccessKind::NoAccess;
        self.requirements.push(requirement);
    }

    pub fn add_input(&mut self, mut requirement: Requirement) {
        requirement.access = AccessKind::Read;
        self.requirements.push(requirement);
    }

    pub fn add_output(&mut self, mut requirement: Requirement) {
        requirement.access = AccessKind::Write;
        self.requirements.push(requirement);
    }

    pub fn add_reduction(&mut self, mut requirement: Requirement, redop: ReductionOpId) {
        requirement.access = AccessKind::Reduce;
        requirement.redop = Some(redop);
        self.requirements.push(requirement);
    }

    pub fn add_unbound_output(
        &mut self,
        store: StoreId,
        field_space: FieldSpace,
        field_id: FieldId,
    ) {
        self.unbound_outputs.push(UnboundOutput {
            store,
            field_space,
            field_id,
        });
    }

    pub fn add_scalar_arg(&mut self, arg: ScalarArg) {
        self.scalar_args.push(arg);
    }

    pub fn add_future(&mut self, future: FutureHandle) {
        self.futures.push(future);
    }

    pub fn set_fusion_metadata(&mut self, metadata: FusionMetadata) {
        self.fusion_metadata = Some(metadata);
    }

    pub fn execute_single(self, engine: &dyn Engine) -> FutureHandle {
        engine.dispatch_task(self.into_launch(None, None))
    }

    pub fn execute(
        self,
        engine: &dyn Engine,
        launch_domain: &Shape,
        redop: Option<ReductionOpId>,
    ) -> FutureHandle {
        engine.dispatch_task(self.into_launch(Some(launch_domain.clone()), redop))
    }

    fn into_launch(
        self,
        launch_domain: Option<Shape>,
        redop: Option<ReductionOpId>,
    ) -> TaskLaunch {
        TaskLaunch {
            task_id: self.task_id,
            mapper_id: self.mapper_id,
            requirements: self.requirements,
            unbound_outputs: self.unbound_outputs,
            scalar_args: self.scalar_args,
            futures: self.futures,
            fusion_metadata: self.fusion_metadata,
            launch_domain,
            redop,
        }
    }
}

/// The complete engine-level description of one copy launch.
#[derive(Debug, Clone, PartialEq)]
pub struct CopyLaunch {
    pub mapper_id: u32,
    pub inputs: Vec<Requirement>,
    pub outputs: Vec<Requirement>,
    pub source_indirects: Vec<Requirement>,
    pub target_indirects: Vec<Requirement>,
    pub reductions: Vec<Requirement>,
    pub launch_domain: Option<Shape>,
}

/// Accumulates the pieces of a [`CopyLaunch`].
#[derive(Debug)]
pub struct CopyLauncher {
    mapper_id: u32,
    inputs: Vec<Requirement>,
    outputs: Vec<Requirement>,
    source_indirects: Vec<Requirement>,
    target_indirects: Vec<Requirement>,
    reductions: Vec<Requirement>,
}

impl CopyLauncher {
    pub fn new(mapper_id: u32) -> Self {
        Self {
            mapper_id,
            inputs: vec![],
            outputs: vec![],
            source_indirects: vec![],
            target_indirects: vec![],
            reductions: vec![],
        }
    }

    pub fn add_input(&mut self, mut requirement: Requirement) {
        requirement.access = AccessKind::Read;
        self.inputs.push(requirement);
    }

    pub fn add_output(&mut self, mut requirement: Requirement) {
        requirement.access = AccessKind::Write;
        self.outputs.push(requirement);
    }

    pub fn add_source_indirect(&mut self, mut requirement: Requirement) {
        requirement.access = AccessKind::Read;
        self.source_indirects.push(requirement);
    }

    pub fn add_target_indirect(&mut self, mut requirement: Requirement) {
        requirement.access = AccessKind::Read;
        self.target_indirects.push(requirement);
    }

    pub fn add_reduction(&mut self, mut requirement: Requirement, redop: ReductionOpId) {
        requirement.access = AccessKind::Reduce;
        requirement.redop = Some(redop);
        self.reductions.push(requirement);
    }

    pub fn execute(self, engine: &dyn Engine, launch_domain: Option<&Shape>) {
        engine.dispatch_copy(CopyLaunch {
            mapper_id: self.mapper_id,
            inputs: self.inputs,
            outputs: self.outputs,
            source_indirects: self.source_indirects,
            target_indirects: self.target_indirects,
            reductions: self.reductions,
            launch_domain: launch_domain.cloned(),
        });
    }
}
