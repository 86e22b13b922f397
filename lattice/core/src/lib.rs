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

//! Client-side runtime of the Lattice task-based distributed array
//! framework.
//!
//! Libraries author data-parallel [`operation::Operation`]s against
//! logical [`store::Store`]s and submit them to the [`runtime::Runtime`].
//! The runtime buffers submissions in a bounded window, partitions each
//! store for parallel execution, opportunistically fuses adjacent
//! compatible operations into a single task, and dispatches the result
//! to a lower-level execution [`engine::Engine`].
//!
//! Every shard of a replicated program runs an identical copy of this
//! crate over identical inputs; correctness depends on the runtime
//! emitting the identical engine call sequence on all of them.

pub mod attachment;
pub mod engine;
pub mod fusion;
pub mod launcher;
pub mod operation;
pub mod partition;
pub mod region;
pub mod runtime;
pub mod solver;
pub mod store;
pub mod test_utils;

pub use lattice_common::{
    ElementType, LatticeError, Result, RuntimeConfig, ScalarValue, Shape,
};
pub use runtime::{Context, FusionSpec, Library, Runtime};
pub use store::{Store, StoreId, StoreRef};
