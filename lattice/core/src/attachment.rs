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

//! Bookkeeping that links external host buffers to the region fields
//! backing them.
//!
//! An attachment holds only a weak reference to its region field, so
//! collection of the field is observable here. The buffers themselves
//! are never owned; the caller must keep them alive until their
//! detachment has completed.

use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use lattice_common::{LatticeError, Result};
use log::warn;
use parking_lot::Mutex;

use crate::engine::{Engine, FutureHandle};
use crate::region::RegionField;

/// An external host buffer described by its base address and byte length.
/// The runtime never dereferences the address; it only keys and overlap-
/// checks attachments with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExternalBuffer {
    pub ptr: usize,
    pub len: usize,
}

/// An external allocation: a single buffer, or one buffer per
/// shard-local piece of an index attachment.
#[derive(Debug, Clone)]
pub enum ExternalAllocation {
    Buffer(ExternalBuffer),
    ShardLocal(Vec<ExternalBuffer>),
}

/// A detach operation. It holds a strong reference to its region field
/// so the field cannot be recycled before the detach is done.
#[derive(Debug)]
pub struct Detachment {
    pub region_field: Arc<RegionField>,
    pub unordered: bool,
}

impl Detachment {
    pub fn new(region_field: Arc<RegionField>, unordered: bool) -> Self {
        Self {
            region_field,
            unordered,
        }
    }

    fn launch(&self, engine: &dyn Engine) -> FutureHandle {
        engine.dispatch_detach(
            self.region_field.region(),
            self.region_field.field_id(),
            self.unordered,
        )
    }
}

#[derive(Debug)]
struct Attachment {
    ptr: usize,
    extent: usize,
    end: usize,
    /// A buffer that was part of a shard-local attachment only covers a
    /// piece of its region field and must not be handed back whole.
    shareable: bool,
    region_field: Weak<RegionField>,
}

impl Attachment {
    fn new(
        ptr: usize,
        extent: usize,
        shareable: bool,
        region_field: &Arc<RegionField>,
    ) -> Self {
        debug_assert!(extent > 0);
        Self {
            ptr,
            extent,
            end: ptr + extent - 1,
            shareable,
            region_field: Arc::downgrade(region_field),
        }
    }

    fn overlaps(&self, other: &Attachment) -> bool {
        !(self.end < other.ptr || other.end < self.ptr)
    }
}

#[derive(Debug, Default)]
struct AttachmentState {
    attachments: IndexMap<(usize, usize), Attachment>,
    next_detachment_key: u32,
    registered_detachments: IndexMap<u32, Detachment>,
    deferred_detachments: Vec<(ExternalAllocation, Detachment)>,
    pending_detachments: Vec<(FutureHandle, Arc<RegionField>)>,
}

/// Maps external buffers to their backing region fields, rejects aliased
/// attachments, and sequences deferred detachments.
#[derive(Debug, Default)]
pub struct AttachmentManager {
    state: Mutex<AttachmentState>,
}

impl AttachmentManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(buffer: &ExternalBuffer) -> (usize, usize) {
        (buffer.ptr, buffer.len)
    }

    /// Whether `buffer` is attached to a still-live region field.
    pub fn has_attachment(&self, buffer: &ExternalBuffer) -> bool {
        let state = self.state.lock();
        state
            .attachments
            .get(&Self::key(buffer))
            .map(|attachment| attachment.region_field.upgrade().is_some())
            .unwrap_or(false)
    }

    /// Return the live region field already attached to `buffer`, if it
    /// may be shared. Stale keys whose field was collected are dropped.
    pub fn reuse_existing_attachment(
        &self,
        buffer: &ExternalBuffer,
    ) -> Option<Arc<RegionField>> {
        let mut state = self.state.lock();
        let key = Self::key(buffer);
        let attachment = state.attachments.get(&key)?;
        match attachment.region_field.upgrade() {
            Some(region_field) => attachment.shareable.then_some(region_field),
            None => {
                state.attachments.shift_remove(&key);
                None
            }
        }
    }

    /// Bind `region_field` to every buffer of `alloc`. A plain buffer
    /// attaches shareable; shard-local buffers do not.
    pub fn attach_external_allocation(
        &self,
        alloc: &ExternalAllocation,
        region_field: &Arc<RegionField>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        match alloc {
            ExternalAllocation::Buffer(buffer) => {
                add_attachment(&mut state, buffer, true, region_field)
            }
            ExternalAllocation::ShardLocal(buffers) => {
                for buffer in buffers {
                    add_attachment(&mut state, buffer, false, region_field)?;
                }
                Ok(())
            }
        }
    }

    /// Remove the attachment(s) of `alloc` and dispatch the detach. A
    /// deferred detachment is parked until [`Self::perform_detachments`];
    /// otherwise the detach is dispatched now and tracked until its
    /// future resolves.
    pub fn detach_external_allocation(
        &self,
        engine: &dyn Engine,
        alloc: ExternalAllocation,
        detach: Detachment,
        defer: bool,
        previously_deferred: bool,
    ) -> Result<()> {
        if !previously_deferred {
            self.remove_allocation(&alloc)?;
        }
        if defer {
            self.state.lock().deferred_detachments.push((alloc, detach));
            return Ok(());
        }
        let future = detach.launch(engine);
        if !engine.future_is_ready(future) {
            self.state
                .lock()
                .pending_detachments
                .push((future, detach.region_field));
        }
        Ok(())
    }

    fn remove_allocation(&self, alloc: &ExternalAllocation) -> Result<()> {
        let mut state = self.state.lock();
        match alloc {
            ExternalAllocation::Buffer(buffer) => {
                remove_attachment(&mut state, buffer)
            }
            ExternalAllocation::ShardLocal(buffers) => {
                for buffer in buffers {
                    remove_attachment(&mut state, buffer)?;
                }
                Ok(())
            }
        }
    }

    /// Park a detachment created externally and hand back an opaque key.
    pub fn register_detachment(&self, detach: Detachment) -> u32 {
        let mut state = self.state.lock();
        let key = state.next_detachment_key;
        state.next_detachment_key += 1;
        state.registered_detachments.insert(key, detach);
        key
    }

    pub fn remove_detachment(&self, key: u32) -> Result<Detachment> {
        self.state
            .lock()
            .registered_detachments
            .shift_remove(&key)
            .ok_or_else(|| {
                LatticeError::Internal(format!("unknown detachment key {key}"))
            })
    }

    /// Dispatch every deferred detachment collected so far.
    pub fn perform_detachments(&self, engine: &dyn Engine) -> Result<()> {
        let deferred = std::mem::take(&mut self.state.lock().deferred_detachments);
        for (alloc, detach) in deferred {
            self.detach_external_allocation(engine, alloc, detach, false, true)?;
        }
        Ok(())
    }

    /// Forget pending detachments whose futures have resolved, dropping
    /// the strong field references they held.
    pub fn prune_detachments(&self, engine: &dyn Engine) {
        let resolved = {
            let mut state = self.state.lock();
            let mut resolved = vec![];
            let mut index = 0;
            while index < state.pending_detachments.len() {
                if engine.future_is_ready(state.pending_detachments[index].0) {
                    resolved.push(state.pending_detachments.swap_remove(index));
                } else {
                    index += 1;
                }
            }
            resolved
        };
        // Field references drop outside the lock.
        drop(resolved);
    }

    /// Drain deferred detachments, letting the engine progress unordered
    /// operations between rounds, then wait out everything pending.
    pub fn destroy(&self, engine: &dyn Engine) {
        loop {
            if self.state.lock().deferred_detachments.is_empty() {
                break;
            }
            if let Err(error) = self.perform_detachments(engine) {
                warn!("dropping deferred detachment at shutdown: {error}");
            }
            engine.progress_unordered_operations();
        }
        let pending = std::mem::take(&mut self.state.lock().pending_detachments);
        for (future, region_field) in pending {
            engine.future_wait(future);
            drop(region_field);
        }
        self.state.lock().attachments.clear();
    }
}

fn add_attachment(
    state: &mut AttachmentState,
    buffer: &ExternalBuffer,
    shareable: bool,
    region_field: &Arc<RegionField>,
) -> Result<()> {
    let key = AttachmentManager::key(buffer);
    if let Some(existing) = state.attachments.get(&key) {
        if existing.region_field.upgrade().is_some() {
            return Err(LatticeError::DuplicateAttachment);
        }
        // The old field is gone; the stale key no longer matters for
        // de-duplication.
        state.attachments.shift_remove(&key);
    }
    let attachment = Attachment::new(buffer.ptr, buffer.len, shareable, region_field);
    for other in state.attachments.values() {
        if other.overlaps(&attachment) {
            return Err(LatticeError::AliasedAttachment);
        }
    }
    state.attachments.insert(key, attachment);
    Ok(())
}

fn remove_attachment(state: &mut AttachmentState, buffer: &ExternalBuffer) -> Result<()> {
    let key = AttachmentManager::key(buffer);
    if state.attachments.shift_remove(&key).is_none() {
        return Err(LatticeError::MissingAttachment);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{FieldId, FieldSpace, IndexSpace, Region};
    use crate::region::{Field, FieldLedger, RegionField};
    use lattice_common::{ElementType, Shape};

    fn region_field() -> Arc<RegionField> {
        let ledger = Arc::new(FieldLedger::default());
        let region = Region {
            handle: 1,
            tree_id: 1,
            index_space: IndexSpace(1),
            field_space: FieldSpace(1),
        };
        Arc::new(RegionField::new(Field::new(
            ledger,
            region,
            FieldId(0),
            ElementType::Int32,
            Shape::new(vec![16]),
            false,
        )))
    }

    fn buffer(ptr: usize, len: usize) -> ExternalBuffer {
        ExternalBuffer { ptr, len }
    }

    #[test]
    fn duplicate_attachment_is_rejected() {
        let manager = AttachmentManager::new();
        let rf = region_field();
        let alloc = ExternalAllocation::Buffer(buffer(0x1000, 64));
        manager.attach_external_allocation(&alloc, &rf).unwrap();
        let err = manager
            .attach_external_allocation(&alloc, &region_field())
            .unwrap_err();
        assert!(matches!(err, LatticeError::DuplicateAttachment));
    }

    #[test]
    fn overlapping_attachment_is_rejected() {
        let manager = AttachmentManager::new();
        let rf = region_field();
        manager
            .attach_external_allocation(
                &ExternalAllocation::Buffer(buffer(0x1000, 64)),
                &rf,
            )
            .unwrap();
        // Same range, different key via a different length.
        let err = manager
            .attach_external_allocation(
                &ExternalAllocation::Buffer(buffer(0x1020, 64)),
                &region_field(),
            )
            .unwrap_err();
        assert!(matches!(err, LatticeError::AliasedAttachment));
        // Disjoint ranges attach fine.
        manager
            .attach_external_allocation(
                &ExternalAllocation::Buffer(buffer(0x2000, 64)),
                &region_field(),
            )
            .unwrap();
    }

    #[test]
    fn reuse_honors_shareability() {
        let manager = AttachmentManager::new();
        let shared = region_field();
        manager
            .attach_external_allocation(
                &ExternalAllocation::Buffer(buffer(0x1000, 64)),
                &shared,
            )
            .unwrap();
        assert!(manager.reuse_existing_attachment(&buffer(0x1000, 64)).is_some());

        let unshared = region_field();
        manager
            .attach_external_allocation(
                &ExternalAllocation::ShardLocal(vec![buffer(0x3000, 32)]),
                &unshared,
            )
            .unwrap();
        assert!(manager.reuse_existing_attachment(&buffer(0x3000, 32)).is_none());
        assert!(manager.has_attachment(&buffer(0x3000, 32)));
    }

    #[test]
    fn collected_attachment_is_garbage_collected() {
        let manager = AttachmentManager::new();
        let rf = region_field();
        manager
            .attach_external_allocation(
                &ExternalAllocation::Buffer(buffer(0x1000, 64)),
                &rf,
            )
            .unwrap();
        drop(rf);
        assert!(!manager.has_attachment(&buffer(0x1000, 64)));
        assert!(manager.reuse_existing_attachment(&buffer(0x1000, 64)).is_none());
        // The slot is free again after collection.
        manager
            .attach_external_allocation(
                &ExternalAllocation::Buffer(buffer(0x1000, 64)),
                &region_field(),
            )
            .unwrap();
    }

    #[test]
    fn detaching_unknown_buffer_is_an_error() {
        let manager = AttachmentManager::new();
        let engine = crate::test_utils::MockEngine::new();
        let err = manager
            .detach_external_allocation(
                &engine,
                ExternalAllocation::Buffer(buffer(0x9000, 8)),
                Detachment::new(region_field(), false),
                false,
                false,
            )
            .unwrap_err();
        assert!(matches!(err, LatticeError::MissingAttachment));
    }

    #[test]
    fn registered_detachments_round_trip() {
        let manager = AttachmentManager::new();
        let key = manager.register_detachment(Detachment::new(region_field(), true));
        let detach = manager.remove_detachment(key).unwrap();
        assert!(detach.unordered);
        assert!(manager.remove_detachment(key).is_err());
    }
}
