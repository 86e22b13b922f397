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

//! The partitioning solver: alignment classes over stores, the
//! [`Partitioner`] that assigns each store a partition, and the
//! resulting [`Strategy`] consumed at launch.

use std::collections::VecDeque;

use indexmap::{IndexMap, IndexSet};
use lattice_common::{LatticeError, Result, Shape};

use crate::engine::{FieldSpace, ReductionOpId};
use crate::launcher::{Requirement, TaskLauncher};
use crate::operation::Operation;
use crate::partition::PartitionDesc;
use crate::runtime::Runtime;
use crate::store::{Store, StoreId, StoreRef};

/// A disjoint set of stores recording alignment constraints: all members
/// of a class must be partitioned identically.
#[derive(Debug, Clone, Default)]
pub struct EquivalenceClasses {
    /// Maps a store to its class id.
    class_ids: IndexMap<StoreId, usize>,
    /// Maps a class id to its members.
    classes: IndexMap<usize, IndexSet<StoreId>>,
    next_class_id: usize,
}

impl EquivalenceClasses {
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Record an equivalence relation between two stores, merging their
    /// classes when both already belong to one.
    pub fn record(&mut self, store1: StoreId, store2: StoreId) {
        let found1 = self.class_ids.get(&store1).copied();
        let found2 = self.class_ids.get(&store2).copied();
        match (found1, found2) {
            (None, None) => {
                let class_id = self.next_class_id;
                self.next_class_id += 1;
                let mut class = IndexSet::new();
                class.insert(store1);
                class.insert(store2);
                self.classes.insert(class_id, class);
                self.class_ids.insert(store1, class_id);
                self.class_ids.insert(store2, class_id);
            }
            (Some(class_id), None) => {
                self.insert_member(class_id, store2);
            }
            (None, Some(class_id)) => {
                self.insert_member(class_id, store1);
            }
            (Some(class_id1), Some(class_id2)) if class_id1 != class_id2 => {
                let merged = self
                    .classes
                    .shift_remove(&class_id2)
                    .unwrap_or_default();
                for member in &merged {
                    self.class_ids.insert(*member, class_id1);
                }
                if let Some(class) = self.classes.get_mut(&class_id1) {
                    class.extend(merged);
                }
            }
            _ => {}
        }
    }

    fn insert_member(&mut self, class_id: usize, store: StoreId) {
        if let Some(class) = self.classes.get_mut(&class_id) {
            class.insert(store);
        }
        self.class_ids.insert(store, class_id);
    }

    /// Merge another set of classes into this one.
    pub fn union(&mut self, other: &EquivalenceClasses) {
        if self.is_empty() {
            *self = other.clone();
            return;
        }
        for class in other.classes.values() {
            let mut members = class.iter();
            if let Some(first) = members.next() {
                for member in members {
                    self.record(*first, *member);
                }
            }
        }
    }

    /// The equivalence class of a store, or the singleton `{store}` when
    /// it was never recorded.
    pub fn find(&self, store: StoreId) -> Vec<StoreId> {
        match self.class_ids.get(&store) {
            Some(class_id) => self.classes[class_id].iter().copied().collect(),
            None => vec![store],
        }
    }
}

/// The solver's decision for one batch of operations: a launch shape,
/// per-store partitions, field spaces for unbound outputs, and the set
/// of stores whose partition is the key partition. Immutable after
/// construction.
#[derive(Debug, Clone)]
pub struct Strategy {
    launch_shape: Option<Shape>,
    partitions: IndexMap<StoreId, PartitionDesc>,
    field_spaces: IndexMap<StoreId, FieldSpace>,
    key_parts: IndexSet<StoreId>,
}

impl Strategy {
    fn new(
        launch_shape: Option<Shape>,
        partitions: IndexMap<StoreId, PartitionDesc>,
        field_spaces: IndexMap<StoreId, FieldSpace>,
        key_parts: IndexSet<StoreId>,
    ) -> Self {
        Self {
            launch_shape,
            partitions,
            field_spaces,
            key_parts,
        }
    }

    pub fn launch_shape(&self) -> Option<&Shape> {
        self.launch_shape.as_ref()
    }

    pub fn partition(&self, store: &Store) -> Result<&PartitionDesc> {
        self.partitions
            .get(&store.id())
            .ok_or(LatticeError::NoStrategy(store.id().0))
    }

    /// The engine-level requirement for a bound store.
    pub fn get_requirement(
        &self,
        store: &Store,
        runtime: &Runtime,
    ) -> Result<Requirement> {
        if store.unbound() {
            return Err(LatticeError::Internal(
                "unbound stores take a field space, not a requirement".to_string(),
            ));
        }
        let partition = self.partition(store)?;
        partition.get_requirement(self.launch_shape.as_ref(), store, runtime)
    }

    /// The field space an unbound output allocates its field from.
    pub fn get_field_space(&self, store: &Store) -> Result<FieldSpace> {
        if !store.unbound() {
            return Err(LatticeError::Internal(
                "only unbound stores carry a field space".to_string(),
            ));
        }
        self.field_spaces
            .get(&store.id())
            .copied()
            .ok_or(LatticeError::NoStrategy(store.id().0))
    }

    pub fn is_key_partition(&self, store: StoreId) -> bool {
        self.key_parts.contains(&store)
    }

    /// Drive the launcher's single or indexed execute through the
    /// runtime's dispatch path; a scalar output or scalar reduction
    /// receives the resulting future.
    pub fn launch(
        &self,
        launcher: TaskLauncher,
        runtime: &Runtime,
        output: Option<&StoreRef>,
        redop: Option<ReductionOpId>,
    ) -> Result<()> {
        match output {
            None => {
                runtime.dispatch_task(launcher, self.launch_shape.as_ref(), None)?;
            }
            Some(output) => {
                let result = match &self.launch_shape {
                    None => runtime.dispatch_task(launcher, None, None)?,
                    Some(launch_shape) => {
                        let redop = redop.ok_or_else(|| {
                            LatticeError::Internal(
                                "a scalar result of an indexed launch requires a \
                                 reduction operator"
                                    .to_string(),
                            )
                        })?;
                        let future_map = runtime.dispatch_task(
                            launcher,
                            Some(launch_shape),
                            Some(redop),
                        )?;
                        runtime.engine().reduce_future_map(future_map, redop)
                    }
                };
                output.set_future(result);
            }
        }
        Ok(())
    }
}

/// Assigns every store of a batch of operations a partition.
pub struct Partitioner<'a> {
    ops: &'a [Operation],
    must_be_single: bool,
}

impl<'a> Partitioner<'a> {
    pub fn new(ops: &'a [Operation], must_be_single: bool) -> Self {
        Self {
            ops,
            must_be_single,
        }
    }

    pub fn partition_stores(&self, runtime: &Runtime) -> Result<Strategy> {
        let mut stores: IndexMap<StoreId, StoreRef> = IndexMap::new();
        let mut constraints = EquivalenceClasses::default();
        let mut broadcasts: IndexSet<StoreId> = IndexSet::new();
        for op in self.ops {
            for store in op.all_stores() {
                stores.entry(store.id()).or_insert(store);
            }
            constraints.union(op.constraints());
            broadcasts.extend(op.broadcasts().iter().copied());
        }

        let mut partitions: IndexMap<StoreId, PartitionDesc> = IndexMap::new();
        let mut field_spaces: IndexMap<StoreId, FieldSpace> = IndexMap::new();
        let mut key_parts: IndexSet<StoreId> = IndexSet::new();

        if self.must_be_single || stores.is_empty() {
            for (id, store) in &stores {
                partitions.insert(*id, PartitionDesc::NoPartition);
                if store.unbound() {
                    let field_space =
                        self.unbound_field_space(runtime, &stores, &constraints, *id)?;
                    for (member, space) in field_space {
                        field_spaces.insert(member, space);
                    }
                }
            }
            return Ok(Strategy::new(None, partitions, field_spaces, key_parts));
        }

        let must_be_1d_launch = stores.values().any(|store| store.unbound());

        let mut worklist: VecDeque<StoreId> = stores.keys().copied().collect();
        let mut prev_part: Option<PartitionDesc> = None;
        while let Some(id) = worklist.pop_front() {
            if partitions.contains_key(&id) {
                continue;
            }
            let store = &stores[&id];
            if store.scalar() || broadcasts.contains(&id) {
                partitions.insert(id, PartitionDesc::NoPartition);
                continue;
            }
            if store.unbound() {
                let field_space =
                    self.unbound_field_space(runtime, &stores, &constraints, id)?;
                for (member, space) in field_space {
                    partitions.insert(member, PartitionDesc::NoPartition);
                    field_spaces.insert(member, space);
                }
                continue;
            }

            let partition = match &prev_part {
                Some(PartitionDesc::NoPartition) => PartitionDesc::NoPartition,
                _ => {
                    key_parts.insert(id);
                    store.find_key_partition(runtime.partition_manager())?
                }
            };

            for member in constraints.find(id) {
                let member_store = stores.get(&member).ok_or_else(|| {
                    LatticeError::Internal(format!(
                        "aligned store {member:?} does not belong to any operation \
                         in the batch"
                    ))
                })?;
                if member_store.scalar() {
                    partitions.insert(member, PartitionDesc::NoPartition);
                } else {
                    partitions.insert(member, partition.clone());
                }
            }
            prev_part = Some(partition);
        }

        let mut launch_shape = prev_part.and_then(|part| part.color_shape().cloned());
        if must_be_1d_launch {
            if let Some(shape) = &launch_shape {
                launch_shape = Some(Shape::new(vec![shape.volume()]));
            }
        }

        Ok(Strategy::new(
            launch_shape,
            partitions,
            field_spaces,
            key_parts,
        ))
    }

    /// Allocate one fresh field space shared by the whole alignment
    /// class of an unbound store; every member must be unbound too.
    fn unbound_field_space(
        &self,
        runtime: &Runtime,
        stores: &IndexMap<StoreId, StoreRef>,
        constraints: &EquivalenceClasses,
        store: StoreId,
    ) -> Result<Vec<(StoreId, FieldSpace)>> {
        let class = constraints.find(store);
        for member in &class {
            let member_store = stores.get(member).ok_or_else(|| {
                LatticeError::Internal(format!(
                    "aligned store {member:?} does not belong to any operation in \
                     the batch"
                ))
            })?;
            if !member_store.unbound() {
                return Err(LatticeError::Internal(
                    "an unbound store can only be aligned with unbound stores"
                        .to_string(),
                ));
            }
        }
        let field_space = runtime.create_field_space();
        Ok(class.into_iter().map(|member| (member, field_space)).collect())
    }
}
