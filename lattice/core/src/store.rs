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

//! The surface of a logical array ("store") that the operation pipeline
//! reads: shape, element type, scalar and unbound flags, the parent
//! chain of derived views, and the cached key partition.

use std::sync::Arc;

use lattice_common::{ElementType, LatticeError, Result, Shape};
use parking_lot::Mutex;

use crate::engine::FutureHandle;
use crate::partition::{PartitionDesc, PartitionManager, Restriction};
use crate::region::RegionField;

/// Identity of a store. Stores are compared and hashed by id, never by
/// contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StoreId(pub u64);

pub type StoreRef = Arc<Store>;

/// An affine view transform, kept root-relative so two views of the same
/// root can be compared without walking the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transform {
    rows: usize,
    cols: usize,
    matrix: Vec<i64>,
}

impl Transform {
    pub fn new(rows: usize, cols: usize, matrix: Vec<i64>) -> Self {
        debug_assert_eq!(rows * cols, matrix.len());
        Self { rows, cols, matrix }
    }

    pub fn identity(ndim: usize) -> Self {
        let mut matrix = vec![0; ndim * ndim];
        for dim in 0..ndim {
            matrix[dim * ndim + dim] = 1;
        }
        Self {
            rows: ndim,
            cols: ndim,
            matrix,
        }
    }
}

/// Where a store's data lives, if it has been materialized at all.
#[derive(Debug, Clone)]
pub enum Storage {
    /// A scalar result held in an engine future.
    Future(FutureHandle),
    /// A region field owned by the runtime's managers.
    RegionField(Arc<RegionField>),
}

#[derive(Debug)]
pub struct Store {
    id: StoreId,
    dtype: ElementType,
    /// `None` while the store is unbound.
    shape: Option<Shape>,
    scalar: bool,
    unbound: bool,
    parent: Option<StoreRef>,
    transform: Option<Transform>,
    restrictions: Option<Vec<Restriction>>,
    key_partition: Mutex<Option<PartitionDesc>>,
    storage: Mutex<Option<Storage>>,
}

impl Store {
    pub(crate) fn new(
        id: StoreId,
        dtype: ElementType,
        shape: Option<Shape>,
        scalar: bool,
    ) -> Self {
        let unbound = shape.is_none();
        Self {
            id,
            dtype,
            shape,
            scalar,
            unbound,
            parent: None,
            transform: None,
            restrictions: None,
            key_partition: Mutex::new(None),
            storage: Mutex::new(None),
        }
    }

    pub(crate) fn new_view(
        id: StoreId,
        parent: StoreRef,
        shape: Shape,
        transform: Transform,
    ) -> Self {
        Self {
            id,
            dtype: parent.dtype,
            shape: Some(shape),
            scalar: false,
            unbound: false,
            parent: Some(parent),
            transform: Some(transform),
            restrictions: None,
            key_partition: Mutex::new(None),
            storage: Mutex::new(None),
        }
    }

    pub fn id(&self) -> StoreId {
        self.id
    }

    pub fn dtype(&self) -> ElementType {
        self.dtype
    }

    pub fn shape(&self) -> Option<&Shape> {
        self.shape.as_ref()
    }

    pub fn ndim(&self) -> usize {
        self.shape.as_ref().map(Shape::ndim).unwrap_or(0)
    }

    pub fn scalar(&self) -> bool {
        self.scalar
    }

    pub fn unbound(&self) -> bool {
        self.unbound
    }

    pub fn parent(&self) -> Option<&StoreRef> {
        self.parent.as_ref()
    }

    /// The root of the view chain; a store with no parent is its own root.
    pub fn root(&self) -> &Store {
        let mut store = self;
        while let Some(parent) = store.parent.as_deref() {
            store = parent;
        }
        store
    }

    /// The root-relative view transform, if this store is a derived view.
    pub fn root_transform(&self) -> Option<&Transform> {
        self.transform.as_ref()
    }

    pub(crate) fn set_restrictions(&mut self, restrictions: Vec<Restriction>) {
        self.restrictions = Some(restrictions);
    }

    pub fn key_partition(&self) -> Option<PartitionDesc> {
        self.key_partition.lock().clone()
    }

    pub fn set_key_partition(&self, partition: PartitionDesc) {
        *self.key_partition.lock() = Some(partition);
    }

    pub fn reset_key_partition(&self) {
        *self.key_partition.lock() = None;
    }

    /// The partition this store prefers. Reuses the cached key partition
    /// when one was chosen before, otherwise derives one from the launch
    /// shape heuristic and caches it.
    pub fn find_key_partition(
        &self,
        partitions: &PartitionManager,
    ) -> Result<PartitionDesc> {
        if let Some(partition) = self.key_partition() {
            return Ok(partition);
        }
        let shape = self.shape.as_ref().ok_or_else(|| {
            LatticeError::Internal(
                "an unbound store cannot have a key partition".to_string(),
            )
        })?;
        let restrictions = match &self.restrictions {
            Some(restrictions) => restrictions.clone(),
            None => vec![Restriction::Allowed; shape.ndim()],
        };
        let partition = match partitions.compute_launch_shape(self, &restrictions)? {
            Some(launch_shape) => {
                let tile_shape = partitions.compute_tile_shape(shape, &launch_shape);
                PartitionDesc::new_tiling(tile_shape, launch_shape)
            }
            None => PartitionDesc::NoPartition,
        };
        self.set_key_partition(partition.clone());
        Ok(partition)
    }

    pub fn storage(&self) -> Option<Storage> {
        self.storage.lock().clone()
    }

    /// Bind a scalar result future to this store.
    pub fn set_future(&self, future: FutureHandle) {
        *self.storage.lock() = Some(Storage::Future(future));
    }

    pub fn set_region_field(&self, region_field: Arc<RegionField>) {
        *self.storage.lock() = Some(Storage::RegionField(region_field));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_walks_parent_chain() {
        let root = Arc::new(Store::new(
            StoreId(1),
            ElementType::Float64,
            Some(Shape::new(vec![10, 10])),
            false,
        ));
        let view = Arc::new(Store::new_view(
            StoreId(2),
            Arc::clone(&root),
            Shape::new(vec![10, 10]),
            Transform::identity(2),
        ));
        let leaf = Arc::new(Store::new_view(
            StoreId(3),
            Arc::clone(&view),
            Shape::new(vec![10, 10]),
            Transform::identity(2),
        ));
        assert_eq!(leaf.root().id(), StoreId(1));
        assert_eq!(root.root().id(), StoreId(1));
    }

    #[test]
    fn unbound_store_has_no_shape() {
        let store = Store::new(StoreId(7), ElementType::Int32, None, false);
        assert!(store.unbound());
        assert!(store.shape().is_none());
    }
}
