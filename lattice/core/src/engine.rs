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

//! The interface the runtime consumes from the lower execution engine.
//!
//! The engine owns task execution, data movement, and the actual storage
//! behind regions and fields; the runtime only ever sees the opaque
//! handles defined here. Every call is asynchronous and returns a handle,
//! with the exception of [`Engine::future_wait`], which the runtime
//! invokes in exactly two places: field reclamation and shutdown.

use std::fmt::Debug;

use lattice_common::{Result, Shape};

use crate::launcher::{CopyLaunch, TaskLaunch};

/// Handle to an engine index space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndexSpace(pub u64);

/// Handle to an engine field space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldSpace(pub u64);

/// Identifier of one field within a field space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldId(pub u32);

/// Handle to an index partition created by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PartitionHandle(pub u64);

/// Handle to a deferred engine value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FutureHandle(pub u64);

/// Identifier of a registered projection functor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProjectionId(pub u32);

/// Identifier of a registered sharding functor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShardingId(pub u32);

/// Identifier of a reduction operator known to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReductionOpId(pub u32);

/// Task identifier local to one library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalTaskId(pub u64);

/// Task identifier resolved against a library's global id block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlobalTaskId(pub u64);

/// A top-level logical region: an index space paired with a field space.
/// The `tree_id` identifies the region tree on the reclamation wire
/// format, where field handles travel as `(tree_id, field_id)` pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Region {
    pub handle: u64,
    pub tree_id: i32,
    pub index_space: IndexSpace,
    pub field_space: FieldSpace,
}

/// The execution engine the runtime dispatches into.
///
/// Implementations must hand out handles deterministically with respect
/// to the call sequence: every shard replays the identical sequence of
/// calls and relies on getting identical handles back.
pub trait Engine: Debug + Send + Sync {
    /// Create an index space covering `bounds`.
    fn create_index_space(&self, bounds: &Shape) -> IndexSpace;

    fn create_field_space(&self) -> FieldSpace;

    /// Allocate a field of `field_size` bytes per element in `field_space`.
    fn allocate_field(&self, field_space: FieldSpace, field_size: u64) -> FieldId;

    fn deallocate_field(&self, field_space: FieldSpace, field_id: FieldId);

    fn create_region(&self, index_space: IndexSpace, field_space: FieldSpace) -> Region;

    fn destroy_region(&self, region: Region);

    /// Create an index partition of `index_space` into `color_shape`
    /// tiles of `tile_shape` elements. `complete` promises the engine
    /// that the tiles cover the space exactly once.
    fn create_partition(
        &self,
        index_space: IndexSpace,
        color_shape: &Shape,
        tile_shape: &Shape,
        complete: bool,
    ) -> PartitionHandle;

    /// Run a consensus match over a packed buffer of `num_entries`
    /// entries of `entry_size` bytes each. The returned future resolves
    /// to a native-width length prefix followed by the accepted entries
    /// in an order identical on every shard.
    fn consensus_match(
        &self,
        input: &[i32],
        num_entries: usize,
        entry_size: usize,
    ) -> FutureHandle;

    /// Dispatch a task launch, single-point or over its launch domain.
    fn dispatch_task(&self, launch: TaskLaunch) -> FutureHandle;

    fn dispatch_copy(&self, launch: CopyLaunch);

    /// Detach an external allocation from `(region, field_id)`.
    fn dispatch_detach(
        &self,
        region: Region,
        field_id: FieldId,
        unordered: bool,
    ) -> FutureHandle;

    fn register_projection(&self, src_ndim: u32, dims: &[i32], projection: ProjectionId);

    fn register_sharding(&self, sharding: ShardingId, projection: ProjectionId);

    /// Give the engine a chance to retire unordered operations.
    fn progress_unordered_operations(&self);

    /// Whether the calling code is running inside a top-level engine task
    /// and therefore owes the engine a preamble/postamble pair.
    fn in_top_level_task(&self) -> bool;

    fn task_preamble(&self);

    fn task_postamble(&self);

    fn create_future(&self, data: &[u8]) -> FutureHandle;

    fn future_is_ready(&self, future: FutureHandle) -> bool;

    /// Block until `future` is ready. One of the two synchronous waits
    /// in the runtime.
    fn future_wait(&self, future: FutureHandle);

    fn future_buffer(&self, future: FutureHandle) -> Vec<u8>;

    /// Collapse the future map of an indexed launch into a single future
    /// using `redop`.
    fn reduce_future_map(
        &self,
        future_map: FutureHandle,
        redop: ReductionOpId,
    ) -> FutureHandle;

    /// Load a library's shared object and run its registration callback.
    fn load_library(&self, path: &str, registration_callback: &str) -> Result<()>;
}
