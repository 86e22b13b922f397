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

//! Collection of testing utilities: a recording engine that answers
//! every call deterministically, a library fixture with a fusion spec,
//! and builders for the common operation shapes.

use std::collections::VecDeque;
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use lattice_common::{ElementType, Result, RuntimeConfig, Shape};
use parking_lot::Mutex;

use crate::engine::{
    Engine, FieldId, FieldSpace, FutureHandle, IndexSpace, LocalTaskId,
    PartitionHandle, ProjectionId, ReductionOpId, Region, ShardingId,
};
use crate::launcher::{CopyLaunch, TaskLaunch};
use crate::operation::Operation;
use crate::runtime::{FusionSpec, Library, Runtime};
use crate::store::StoreRef;

pub const BINARY_OP: LocalTaskId = LocalTaskId(2);
pub const FILL_OP: LocalTaskId = LocalTaskId(10);
pub const UNARY_OP: LocalTaskId = LocalTaskId(21);
pub const TERMINAL_OP: LocalTaskId = LocalTaskId(30);
pub const REDUCTION_OP: LocalTaskId = LocalTaskId(40);
pub const FUSED_OP: LocalTaskId = LocalTaskId(100);

pub const TEST_LIBRARY_NAME: &str = "test.array";

/// Every call the mock engine observed, in order. Comparing two runs'
/// call logs is how the determinism contract is asserted.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    CreateIndexSpace {
        bounds: Shape,
    },
    CreateFieldSpace {
        field_space: FieldSpace,
    },
    AllocateField {
        field_space: FieldSpace,
        field_size: u64,
        field_id: FieldId,
    },
    DeallocateField {
        field_space: FieldSpace,
        field_id: FieldId,
    },
    CreateRegion {
        region: Region,
    },
    DestroyRegion {
        region: Region,
    },
    CreatePartition {
        index_space: IndexSpace,
        color_shape: Shape,
        tile_shape: Shape,
        complete: bool,
    },
    ConsensusMatch {
        entries: Vec<(i32, i32)>,
    },
    Task(TaskLaunch),
    Copy(CopyLaunch),
    Detach {
        region: Region,
        field_id: FieldId,
        unordered: bool,
    },
    RegisterProjection {
        src_ndim: u32,
        dims: Vec<i32>,
        projection: ProjectionId,
    },
    RegisterSharding {
        sharding: ShardingId,
        projection: ProjectionId,
    },
    ReduceFutureMap {
        future_map: FutureHandle,
        redop: ReductionOpId,
    },
    Progress,
    TaskPreamble,
    TaskPostamble,
    LoadLibrary {
        path: String,
        callback: String,
    },
}

#[derive(Debug)]
struct MockFuture {
    ready: bool,
    buffer: Vec<u8>,
}

#[derive(Debug, Default)]
struct MockState {
    next_handle: u64,
    next_future: u64,
    futures: IndexMap<u64, MockFuture>,
    queued_matches: VecDeque<Vec<(i32, i32)>>,
    field_counters: IndexMap<u64, u32>,
    calls: Vec<EngineCall>,
}

/// An engine double that hands out handles deterministically and records
/// every call. Consensus matches accept every offered entry unless a
/// result was queued with [`MockEngine::queue_match_result`].
#[derive(Debug)]
pub struct MockEngine {
    state: Mutex<MockState>,
    top_level: bool,
    detach_futures_ready: bool,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            top_level: false,
            detach_futures_ready: true,
        }
    }

    /// An engine that reports running inside a top-level task, so the
    /// runtime owes it a preamble/postamble pair.
    pub fn in_top_level() -> Self {
        Self {
            top_level: true,
            ..Self::new()
        }
    }

    /// An engine whose detach futures only resolve once waited on,
    /// forcing detachments through the pending path.
    pub fn with_slow_detach() -> Self {
        Self {
            detach_futures_ready: false,
            ..Self::new()
        }
    }

    /// Queue the accepted set of the next consensus match.
    pub fn queue_match_result(&self, accepted: Vec<(i32, i32)>) {
        self.state.lock().queued_matches.push_back(accepted);
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn task_launches(&self) -> Vec<TaskLaunch> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                EngineCall::Task(launch) => Some(launch.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn copy_launches(&self) -> Vec<CopyLaunch> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                EngineCall::Copy(launch) => Some(launch.clone()),
                _ => None,
            })
            .collect()
    }

    fn next_handle(&self) -> u64 {
        let mut state = self.state.lock();
        state.next_handle += 1;
        state.next_handle
    }

    fn fresh_future(&self, ready: bool, buffer: Vec<u8>) -> FutureHandle {
        let mut state = self.state.lock();
        state.next_future += 1;
        let handle = state.next_future;
        state.futures.insert(handle, MockFuture { ready, buffer });
        FutureHandle(handle)
    }

    fn record(&self, call: EngineCall) {
        self.state.lock().calls.push(call);
    }
}

impl Engine for MockEngine {
    fn create_index_space(&self, bounds: &Shape) -> IndexSpace {
        let index_space = IndexSpace(self.next_handle());
        self.record(EngineCall::CreateIndexSpace {
            bounds: bounds.clone(),
        });
        index_space
    }

    fn create_field_space(&self) -> FieldSpace {
        let field_space = FieldSpace(self.next_handle());
        self.record(EngineCall::CreateFieldSpace { field_space });
        field_space
    }

    fn allocate_field(&self, field_space: FieldSpace, field_size: u64) -> FieldId {
        let field_id = {
            let mut state = self.state.lock();
            let counter = state.field_counters.entry(field_space.0).or_insert(0);
            let field_id = FieldId(*counter);
            *counter += 1;
            field_id
        };
        self.record(EngineCall::AllocateField {
            field_space,
            field_size,
            field_id,
        });
        field_id
    }

    fn deallocate_field(&self, field_space: FieldSpace, field_id: FieldId) {
        self.record(EngineCall::DeallocateField {
            field_space,
            field_id,
        });
    }

    fn create_region(&self, index_space: IndexSpace, field_space: FieldSpace) -> Region {
        let handle = self.next_handle();
        let region = Region {
            handle,
            tree_id: handle as i32,
            index_space,
            field_space,
        };
        self.record(EngineCall::CreateRegion { region });
        region
    }

    fn destroy_region(&self, region: Region) {
        self.record(EngineCall::DestroyRegion { region });
    }

    fn create_partition(
        &self,
        index_space: IndexSpace,
        color_shape: &Shape,
        tile_shape: &Shape,
        complete: bool,
    ) -> PartitionHandle {
        let partition = PartitionHandle(self.next_handle());
        self.record(EngineCall::CreatePartition {
            index_space,
            color_shape: color_shape.clone(),
            tile_shape: tile_shape.clone(),
            complete,
        });
        partition
    }

    fn consensus_match(
        &self,
        input: &[i32],
        num_entries: usize,
        entry_size: usize,
    ) -> FutureHandle {
        debug_assert_eq!(entry_size, 2 * std::mem::size_of::<i32>());
        let offered: Vec<(i32, i32)> = (0..num_entries)
            .map(|idx| (input[2 * idx], input[2 * idx + 1]))
            .collect();
        let accepted = self
            .state
            .lock()
            .queued_matches
            .pop_front()
            .unwrap_or_else(|| offered.clone());
        let mut buffer = accepted.len().to_ne_bytes().to_vec();
        for (tree_id, field_id) in &accepted {
            buffer.extend_from_slice(&tree_id.to_ne_bytes());
            buffer.extend_from_slice(&field_id.to_ne_bytes());
        }
        self.record(EngineCall::ConsensusMatch { entries: offered });
        self.fresh_future(true, buffer)
    }

    fn dispatch_task(&self, launch: TaskLaunch) -> FutureHandle {
        self.record(EngineCall::Task(launch));
        self.fresh_future(true, vec![])
    }

    fn dispatch_copy(&self, launch: CopyLaunch) {
        self.record(EngineCall::Copy(launch));
    }

    fn dispatch_detach(
        &self,
        region: Region,
        field_id: FieldId,
        unordered: bool,
    ) -> FutureHandle {
        self.record(EngineCall::Detach {
            region,
            field_id,
            unordered,
        });
        self.fresh_future(self.detach_futures_ready, vec![])
    }

    fn register_projection(&self, src_ndim: u32, dims: &[i32], projection: ProjectionId) {
        self.record(EngineCall::RegisterProjection {
            src_ndim,
            dims: dims.to_vec(),
            projection,
        });
    }

    fn register_sharding(&self, sharding: ShardingId, projection: ProjectionId) {
        self.record(EngineCall::RegisterSharding {
            sharding,
            projection,
        });
    }

    fn progress_unordered_operations(&self) {
        self.record(EngineCall::Progress);
    }

    fn in_top_level_task(&self) -> bool {
        self.top_level
    }

    fn task_preamble(&self) {
        self.record(EngineCall::TaskPreamble);
    }

    fn task_postamble(&self) {
        self.record(EngineCall::TaskPostamble);
    }

    fn create_future(&self, data: &[u8]) -> FutureHandle {
        self.fresh_future(true, data.to_vec())
    }

    fn future_is_ready(&self, future: FutureHandle) -> bool {
        self.state
            .lock()
            .futures
            .get(&future.0)
            .map(|entry| entry.ready)
            .unwrap_or(false)
    }

    fn future_wait(&self, future: FutureHandle) {
        if let Some(entry) = self.state.lock().futures.get_mut(&future.0) {
            entry.ready = true;
        }
    }

    fn future_buffer(&self, future: FutureHandle) -> Vec<u8> {
        self.state
            .lock()
            .futures
            .get(&future.0)
            .map(|entry| entry.buffer.clone())
            .unwrap_or_default()
    }

    fn reduce_future_map(
        &self,
        future_map: FutureHandle,
        redop: ReductionOpId,
    ) -> FutureHandle {
        self.record(EngineCall::ReduceFutureMap { future_map, redop });
        self.fresh_future(true, vec![])
    }

    fn load_library(&self, path: &str, registration_callback: &str) -> Result<()> {
        self.record(EngineCall::LoadLibrary {
            path: path.to_string(),
            callback: registration_callback.to_string(),
        });
        Ok(())
    }
}

/// A library fixture whose fusion spec allows fills, unary and binary
/// ops, with one terminal kind that may only close a group.
#[derive(Debug, Default)]
pub struct TestLibrary;

impl Library for TestLibrary {
    fn name(&self) -> &str {
        TEST_LIBRARY_NAME
    }

    fn max_task_id(&self) -> u64 {
        256
    }

    fn fusion_spec(&self) -> Option<FusionSpec> {
        Some(FusionSpec {
            fused_task_id: FUSED_OP,
            fusable: IndexSet::from([BINARY_OP, FILL_OP, UNARY_OP]),
            terminals: IndexSet::from([TERMINAL_OP]),
        })
    }
}

/// A runtime over a fresh [`MockEngine`] with [`TestLibrary`] loaded.
pub fn test_runtime(config: RuntimeConfig) -> (Arc<MockEngine>, Runtime) {
    test_runtime_on(Arc::new(MockEngine::new()), config)
}

pub fn test_runtime_on(
    engine: Arc<MockEngine>,
    config: RuntimeConfig,
) -> (Arc<MockEngine>, Runtime) {
    let runtime = Runtime::try_new(Arc::clone(&engine) as Arc<dyn Engine>, config)
        .expect("runtime construction");
    runtime
        .register_library(Box::new(TestLibrary))
        .expect("library registration");
    (engine, runtime)
}

pub fn array_store(runtime: &Runtime, extents: Vec<u64>) -> StoreRef {
    runtime.create_store(ElementType::Float64, Shape::new(extents))
}

/// `fill(out)`.
pub fn fill_op(out: &StoreRef) -> Operation {
    let mut op = Operation::new_task(TEST_LIBRARY_NAME, FILL_OP, 0);
    op.add_output(out.clone()).expect("fill output");
    op
}

/// `out = f(input)` with the two stores aligned.
pub fn unary_op(input: &StoreRef, out: &StoreRef) -> Operation {
    let mut op = Operation::new_task(TEST_LIBRARY_NAME, UNARY_OP, 0);
    op.add_input(input.clone());
    op.add_output(out.clone()).expect("unary output");
    op.add_alignment(input, out).expect("unary alignment");
    op
}

/// `out = f(lhs, rhs)` with all three stores aligned.
pub fn binary_op(lhs: &StoreRef, rhs: &StoreRef, out: &StoreRef) -> Operation {
    let mut op = Operation::new_task(TEST_LIBRARY_NAME, BINARY_OP, 0);
    op.add_input(lhs.clone());
    op.add_input(rhs.clone());
    op.add_output(out.clone()).expect("binary output");
    op.add_alignment(lhs, out).expect("binary alignment");
    op.add_alignment(rhs, out).expect("binary alignment");
    op
}
