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

//! Region and field lifecycle: per-shape pools of top-level regions,
//! per-`(shape, dtype)` free lists of fields, and the cross-shard
//! reclamation protocol.
//!
//! Every shard runs an identical replica of this code, so a field may
//! only be reused once all shards agree it is free. Freed fields start
//! out on a per-shard unordered list and graduate to the shared ordered
//! free list through a consensus match whose output order is identical
//! on every shard.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use lattice_common::{ElementType, LatticeError, Result, Shape};
use log::debug;
use parking_lot::Mutex;

use crate::engine::{Engine, FieldId, FutureHandle, IndexSpace, Region};
use crate::runtime::Runtime;

/// Fields allocatable in one field space before a fresh region is
/// created; mirrors the engine's per-field-space field limit.
pub const FIELD_SPACE_CAPACITY: usize = 512;

/// A reference to one field in a region tree. Dropping the last owning
/// handle returns the field to its manager through the ledger.
#[derive(Debug)]
pub struct Field {
    ledger: Arc<FieldLedger>,
    region: Region,
    field_id: FieldId,
    dtype: ElementType,
    shape: Shape,
    own: bool,
}

impl Field {
    pub(crate) fn new(
        ledger: Arc<FieldLedger>,
        region: Region,
        field_id: FieldId,
        dtype: ElementType,
        shape: Shape,
        own: bool,
    ) -> Self {
        Self {
            ledger,
            region,
            field_id,
            dtype,
            shape,
            own,
        }
    }

    pub fn region(&self) -> Region {
        self.region
    }

    pub fn field_id(&self) -> FieldId {
        self.field_id
    }

    pub fn dtype(&self) -> ElementType {
        self.dtype
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn same_handle(&self, other: &Field) -> bool {
        self.field_id == other.field_id
    }
}

impl Drop for Field {
    fn drop(&mut self) {
        if self.own {
            self.ledger.return_field(
                self.shape.clone(),
                self.dtype,
                self.region,
                self.field_id,
            );
        }
    }
}

/// A field bound to the region it lives in. Shared via `Arc` so that
/// attachments can hold weak references to it.
#[derive(Debug)]
pub struct RegionField {
    field: Field,
}

impl RegionField {
    pub(crate) fn new(field: Field) -> Self {
        Self { field }
    }

    pub fn region(&self) -> Region {
        self.field.region()
    }

    pub fn field_id(&self) -> FieldId {
        self.field.field_id()
    }

    pub fn dtype(&self) -> ElementType {
        self.field.dtype()
    }

    pub fn shape(&self) -> &Shape {
        self.field.shape()
    }
}

/// A field returned by a dropped [`Field`] handle, waiting to be routed
/// back to its manager.
#[derive(Debug)]
pub struct ReturnedField {
    pub shape: Shape,
    pub dtype: ElementType,
    pub region: Region,
    pub field_id: FieldId,
}

/// Central drop target for field handles. Handles push here instead of
/// re-entering the runtime, and the runtime drains the ledger at its
/// next allocation; after teardown the ledger goes inert so late drops
/// are no-ops.
#[derive(Debug, Default)]
pub struct FieldLedger {
    destroyed: AtomicBool,
    returned: Mutex<Vec<ReturnedField>>,
}

impl FieldLedger {
    pub fn return_field(
        &self,
        shape: Shape,
        dtype: ElementType,
        region: Region,
        field_id: FieldId,
    ) {
        if self.destroyed.load(Ordering::Relaxed) {
            return;
        }
        self.returned.lock().push(ReturnedField {
            shape,
            dtype,
            region,
            field_id,
        });
    }

    pub fn drain(&self) -> Vec<ReturnedField> {
        std::mem::take(&mut *self.returned.lock())
    }

    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::Relaxed);
        self.returned.lock().clear();
    }
}

/// Manages all top-level regions of one shape. Only the most recently
/// created region may still have unallocated field slots.
#[derive(Debug)]
pub struct RegionManager {
    shape: Shape,
    top_regions: Vec<Region>,
    region_set: IndexSet<u64>,
    field_counts: IndexMap<u64, usize>,
}

impl RegionManager {
    pub fn new(shape: Shape) -> Self {
        Self {
            shape,
            top_regions: vec![],
            region_set: IndexSet::new(),
            field_counts: IndexMap::new(),
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn active_region(&self) -> Option<&Region> {
        self.top_regions.last()
    }

    pub fn has_space(&self) -> bool {
        self.active_region()
            .map(|region| {
                self.field_counts
                    .get(&region.field_space.0)
                    .copied()
                    .unwrap_or(0)
                    < FIELD_SPACE_CAPACITY
            })
            .unwrap_or(false)
    }

    /// Track a region produced elsewhere (e.g. an unbound output); the
    /// same region imported twice is tracked once.
    pub fn import_region(&mut self, region: Region) {
        if self.region_set.insert(region.handle) {
            self.top_regions.push(region);
            self.field_counts.entry(region.field_space.0).or_insert(1);
        }
    }

    fn create_region(&mut self, engine: &dyn Engine, index_space: IndexSpace) -> Region {
        // Fresh regions need no de-duplication.
        let field_space = engine.create_field_space();
        let region = engine.create_region(index_space, field_space);
        self.top_regions.push(region);
        self.region_set.insert(region.handle);
        self.field_counts.insert(field_space.0, 0);
        region
    }

    pub fn allocate_field(
        &mut self,
        engine: &dyn Engine,
        index_space: IndexSpace,
        field_size: u64,
    ) -> (Region, FieldId) {
        let region = match self.top_regions.last().copied() {
            Some(region) if self.has_space() => region,
            _ => self.create_region(engine, index_space),
        };
        let field_id = engine.allocate_field(region.field_space, field_size);
        *self.field_counts.entry(region.field_space.0).or_insert(0) += 1;
        (region, field_id)
    }

    pub fn destroy(&mut self, engine: &dyn Engine) {
        while let Some(region) = self.top_regions.pop() {
            engine.destroy_region(region);
        }
        self.region_set.clear();
        self.field_counts.clear();
    }
}

/// A consensus match in flight: the shard's offered fields and the
/// engine future carrying the globally accepted subset.
#[derive(Debug)]
pub struct FieldMatch {
    fields: Vec<(Region, FieldId)>,
    input: Vec<i32>,
    future: Option<FutureHandle>,
}

impl FieldMatch {
    pub fn new(fields: Vec<(Region, FieldId)>) -> Self {
        // Two ints per entry: (tree_id, field_id).
        let mut input = Vec::with_capacity(2 * fields.len());
        for (region, field_id) in &fields {
            input.push(region.tree_id);
            input.push(field_id.0 as i32);
        }
        Self {
            fields,
            input,
            future: None,
        }
    }

    pub fn launch(&mut self, engine: &dyn Engine) -> Result<FutureHandle> {
        if self.future.is_some() {
            return Err(LatticeError::Internal(
                "a field match can only be launched once".to_string(),
            ));
        }
        let future = engine.consensus_match(
            &self.input,
            self.fields.len(),
            2 * std::mem::size_of::<i32>(),
        );
        self.future = Some(future);
        Ok(future)
    }

    /// Wait for the match result and hand every accepted field to the
    /// manager in the match's canonical order; fields not accepted
    /// globally go back to the unordered list for a later match.
    pub fn update_free_fields(
        &self,
        engine: &dyn Engine,
        manager: &mut FieldManager,
    ) -> Result<()> {
        if self.fields.is_empty() {
            return Ok(());
        }
        let future = self.future.ok_or_else(|| {
            LatticeError::Internal(
                "a field match must be launched before its result is read".to_string(),
            )
        })?;
        if !engine.future_is_ready(future) {
            engine.future_wait(future);
        }

        let buffer = engine.future_buffer(future);
        let prefix = std::mem::size_of::<usize>();
        let entry = 2 * std::mem::size_of::<i32>();
        let header = buffer.get(..prefix).ok_or_else(|| {
            LatticeError::Internal("truncated consensus match result".to_string())
        })?;
        let num_fields = usize::from_ne_bytes(header.try_into().map_err(|_| {
            LatticeError::Internal("truncated consensus match result".to_string())
        })?);
        if num_fields > self.fields.len() {
            return Err(LatticeError::Internal(format!(
                "consensus match accepted {num_fields} fields but only {} were \
                 offered",
                self.fields.len()
            )));
        }

        let mut accepted = Vec::with_capacity(num_fields);
        for idx in 0..num_fields {
            let base = prefix + idx * entry;
            let bytes = buffer.get(base..base + entry).ok_or_else(|| {
                LatticeError::Internal("truncated consensus match result".to_string())
            })?;
            let tree_id = i32::from_ne_bytes(bytes[..4].try_into().map_err(|_| {
                LatticeError::Internal("truncated consensus match result".to_string())
            })?);
            let field_id = i32::from_ne_bytes(bytes[4..].try_into().map_err(|_| {
                LatticeError::Internal("truncated consensus match result".to_string())
            })?);
            accepted.push((tree_id, field_id));
        }

        // Any local field the match did not accept goes back to the
        // unordered queue; accepted ones are replayed in match order,
        // which is identical on every shard.
        let mut ordered: Vec<Option<(Region, FieldId)>> = vec![None; num_fields];
        for (region, field_id) in &self.fields {
            let mut found = false;
            for (idx, (tree_id, accepted_field)) in accepted.iter().enumerate() {
                if *tree_id != region.tree_id || *accepted_field != field_id.0 as i32 {
                    continue;
                }
                if ordered[idx].is_some() {
                    return Err(LatticeError::Internal(
                        "duplicate entry in consensus match result".to_string(),
                    ));
                }
                ordered[idx] = Some((*region, *field_id));
                found = true;
                break;
            }
            if !found {
                manager.free_field(*region, *field_id, false);
            }
        }
        for slot in ordered {
            let (region, field_id) = slot.ok_or_else(|| {
                LatticeError::Internal(
                    "consensus match accepted a field that was never offered"
                        .to_string(),
                )
            })?;
            manager.free_field(region, field_id, true);
        }
        Ok(())
    }
}

/// Allocates and reuses fields of one `(shape, dtype)` pair.
#[derive(Debug)]
pub struct FieldManager {
    shape: Shape,
    dtype: ElementType,
    /// Reclaimed fields ordered identically across all shards.
    free_fields: VecDeque<(Region, FieldId)>,
    /// Freed fields not yet agreed on across shards.
    freed_fields: Vec<(Region, FieldId)>,
    matches: VecDeque<FieldMatch>,
    match_counter: u32,
    match_frequency: u32,
    destroyed: bool,
}

impl FieldManager {
    pub fn new(
        shape: Shape,
        dtype: ElementType,
        max_reuse_size: u64,
        max_reuse_frequency: u32,
    ) -> Self {
        // Large fields are worth exchanging more often, proportionally
        // to how far they exceed the reuse size.
        let size = shape.volume() * dtype.size();
        let match_frequency = if size > max_reuse_size {
            let max_reuse_size = max_reuse_size.max(1);
            let ratio = (size + max_reuse_size - 1) / max_reuse_size;
            (((max_reuse_frequency as u64) + ratio - 1) / ratio).max(1) as u32
        } else {
            max_reuse_frequency
        };
        Self {
            shape,
            dtype,
            free_fields: VecDeque::new(),
            freed_fields: vec![],
            matches: VecDeque::new(),
            match_counter: 0,
            match_frequency,
            destroyed: false,
        }
    }

    pub fn match_frequency(&self) -> u32 {
        self.match_frequency
    }

    /// The shard-agreed free list, in reclamation order.
    pub fn free_fields(&self) -> &VecDeque<(Region, FieldId)> {
        &self.free_fields
    }

    /// Freed fields still awaiting shard agreement.
    pub fn freed_fields(&self) -> &[(Region, FieldId)] {
        &self.freed_fields
    }

    /// Allocate a field, preferring reclaimed fields every shard has
    /// agreed on, then outstanding match results, and only then brand
    /// new fields from the region manager.
    pub fn allocate_field(&mut self, runtime: &Runtime) -> Result<(Region, FieldId)> {
        self.match_counter += 1;
        if self.match_counter == self.match_frequency {
            // This collective must run on every shard no matter whether
            // this shard has fields to offer.
            let local_freed = std::mem::take(&mut self.freed_fields);
            debug!(
                "issuing field match over {} freed fields for {} x {}",
                local_freed.len(),
                self.shape,
                self.dtype
            );
            let mut field_match = FieldMatch::new(local_freed);
            runtime.dispatch_field_match(&mut field_match)?;
            self.matches.push_back(field_match);
            self.match_counter = 0;
        }

        if let Some(field) = self.free_fields.pop_front() {
            return Ok(field);
        }
        while let Some(field_match) = self.matches.pop_front() {
            field_match.update_free_fields(runtime.engine(), self)?;
            if let Some(field) = self.free_fields.pop_front() {
                return Ok(field);
            }
        }

        runtime.allocate_new_field(&self.shape, self.dtype)
    }

    pub fn free_field(&mut self, region: Region, field_id: FieldId, ordered: bool) {
        if self.destroyed {
            return;
        }
        if ordered {
            self.free_fields.push_back((region, field_id));
        } else {
            self.freed_fields.push((region, field_id));
        }
    }

    pub fn destroy(&mut self) {
        self.free_fields.clear();
        self.freed_fields.clear();
        self.matches.clear();
        self.destroyed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockEngine;

    fn region(tree_id: i32) -> Region {
        Region {
            handle: tree_id as u64,
            tree_id,
            index_space: IndexSpace(0),
            field_space: crate::engine::FieldSpace(0),
        }
    }

    #[test]
    fn ledger_collects_dropped_fields() {
        let ledger = Arc::new(FieldLedger::default());
        let shape = Shape::new(vec![8]);
        let field = Field::new(
            Arc::clone(&ledger),
            region(1),
            FieldId(3),
            ElementType::Int32,
            shape.clone(),
            true,
        );
        drop(field);
        let returned = ledger.drain();
        assert_eq!(returned.len(), 1);
        assert_eq!(returned[0].field_id, FieldId(3));
        assert_eq!(returned[0].shape, shape);
    }

    #[test]
    fn unowned_fields_do_not_return() {
        let ledger = Arc::new(FieldLedger::default());
        let field = Field::new(
            Arc::clone(&ledger),
            region(1),
            FieldId(3),
            ElementType::Int32,
            Shape::new(vec![8]),
            false,
        );
        drop(field);
        assert!(ledger.drain().is_empty());
    }

    #[test]
    fn destroyed_ledger_ignores_returns() {
        let ledger = Arc::new(FieldLedger::default());
        ledger.destroy();
        let field = Field::new(
            Arc::clone(&ledger),
            region(1),
            FieldId(3),
            ElementType::Int32,
            Shape::new(vec![8]),
            true,
        );
        drop(field);
        assert!(ledger.drain().is_empty());
    }

    #[test]
    fn match_frequency_scales_down_for_large_fields() {
        // 1024 elements x 8 bytes = 8 KiB against a 1 KiB reuse size.
        let manager =
            FieldManager::new(Shape::new(vec![1024]), ElementType::Float64, 1024, 32);
        assert_eq!(manager.match_frequency(), 4);
        // Small fields keep the configured frequency.
        let manager =
            FieldManager::new(Shape::new(vec![4]), ElementType::Float64, 1024, 32);
        assert_eq!(manager.match_frequency(), 32);
        // The frequency never drops below one.
        let manager =
            FieldManager::new(Shape::new(vec![1 << 20]), ElementType::Float64, 1, 2);
        assert_eq!(manager.match_frequency(), 1);
    }

    #[test]
    fn match_replays_accepted_fields_in_canonical_order() {
        let engine = MockEngine::new();
        let mut manager =
            FieldManager::new(Shape::new(vec![8]), ElementType::Int32, 1 << 20, 32);
        let fields = vec![
            (region(1), FieldId(1)),
            (region(1), FieldId(2)),
            (region(1), FieldId(3)),
        ];
        engine.queue_match_result(vec![(1, 2)]);
        let mut field_match = FieldMatch::new(fields);
        field_match.launch(&engine).unwrap();
        field_match
            .update_free_fields(&engine, &mut manager)
            .unwrap();

        let free: Vec<FieldId> =
            manager.free_fields().iter().map(|(_, id)| *id).collect();
        assert_eq!(free, vec![FieldId(2)]);
        let freed: Vec<FieldId> =
            manager.freed_fields().iter().map(|(_, id)| *id).collect();
        assert_eq!(freed, vec![FieldId(1), FieldId(3)]);
    }

    #[test]
    fn empty_match_accepts_nothing() {
        let engine = MockEngine::new();
        let mut manager =
            FieldManager::new(Shape::new(vec![8]), ElementType::Int32, 1 << 20, 32);
        let fields = vec![(region(1), FieldId(1)), (region(1), FieldId(2))];
        engine.queue_match_result(vec![]);
        let mut field_match = FieldMatch::new(fields);
        field_match.launch(&engine).unwrap();
        field_match
            .update_free_fields(&engine, &mut manager)
            .unwrap();
        assert!(manager.free_fields().is_empty());
        assert_eq!(manager.freed_fields().len(), 2);
    }

    #[test]
    fn region_manager_rolls_over_when_saturated() {
        let engine = MockEngine::new();
        let mut manager = RegionManager::new(Shape::new(vec![16]));
        assert!(!manager.has_space());
        let (first, _) = manager.allocate_field(&engine, IndexSpace(7), 4);
        for _ in 1..FIELD_SPACE_CAPACITY {
            let (region, _) = manager.allocate_field(&engine, IndexSpace(7), 4);
            assert_eq!(region.handle, first.handle);
        }
        // The next allocation no longer fits in the first field space.
        let (rolled, _) = manager.allocate_field(&engine, IndexSpace(7), 4);
        assert_ne!(rolled.handle, first.handle);
        assert_eq!(manager.active_region().map(|r| r.handle), Some(rolled.handle));
    }

    #[test]
    fn imported_regions_are_deduplicated() {
        let mut manager = RegionManager::new(Shape::new(vec![16]));
        let imported = region(5);
        manager.import_region(imported);
        manager.import_region(imported);
        assert_eq!(manager.active_region().map(|r| r.handle), Some(5));
        assert!(manager.has_space());
    }
}
