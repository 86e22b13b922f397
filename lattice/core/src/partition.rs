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

//! Partition descriptors and the launch shape heuristic.
//!
//! [`PartitionManager::compute_launch_shape`] turns an array shape and a
//! set of per-dimension restrictions into the index space over which a
//! task is launched in parallel. Results are memoized per filtered
//! extent tuple, and index partitions created for a tiling are cached by
//! `(index space, tiling)` so repeated launches reuse engine state.

use indexmap::IndexMap;
use lattice_common::{LatticeError, Result, RuntimeConfig, Shape};
use log::debug;
use parking_lot::Mutex;

use crate::engine::{IndexSpace, PartitionHandle};
use crate::launcher::{AccessKind, Requirement};
use crate::runtime::Runtime;
use crate::store::Store;

/// Keep the trailing dimension of a tile at least this wide; narrower
/// tiles hurt memory coalescing on accelerators.
pub const MIN_LAST_DIM_TILE: u64 = 32;

/// Tilings that would produce more than this many tiles are not marked
/// complete unless the piece count justifies them.
pub const COMPLETE_TILING_MAX_TILES: u64 = 256;

/// Multiplier of the piece count above which a tiling is considered too
/// fine to mark complete.
pub const COMPLETE_TILING_PIECES_FACTOR: u64 = 16;

/// How one dimension of a store may participate in partitioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Restriction {
    /// Partitioning this dimension is legal but discouraged.
    Avoided,
    /// Partitioning this dimension is legal.
    Allowed,
    /// This dimension must not be split; its launch extent is 1.
    Restricted,
}

/// A tiling of an index space into `color_shape` tiles of `tile_shape`
/// elements each.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tiling {
    pub tile_shape: Shape,
    pub color_shape: Shape,
}

/// The partition assigned to one store by the solver.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PartitionDesc {
    /// The store is replicated to every point of the launch.
    NoPartition,
    Tiling(Tiling),
}

impl PartitionDesc {
    pub fn new_tiling(tile_shape: Shape, color_shape: Shape) -> Self {
        PartitionDesc::Tiling(Tiling {
            tile_shape,
            color_shape,
        })
    }

    pub fn color_shape(&self) -> Option<&Shape> {
        match self {
            PartitionDesc::NoPartition => None,
            PartitionDesc::Tiling(tiling) => Some(&tiling.color_shape),
        }
    }

    /// Produce the engine-level region requirement for `store` under this
    /// partition, creating and caching the index partition on first use.
    pub fn get_requirement(
        &self,
        launch_shape: Option<&Shape>,
        store: &Store,
        runtime: &Runtime,
    ) -> Result<Requirement> {
        let tiling = match self {
            PartitionDesc::NoPartition => {
                return Ok(Requirement {
                    store: store.id(),
                    partition: None,
                    color_shape: None,
                    projection: None,
                    access: AccessKind::Read,
                    redop: None,
                })
            }
            PartitionDesc::Tiling(tiling) => tiling,
        };
        let shape = store.shape().ok_or_else(|| {
            LatticeError::Internal("cannot tile an unbound store".to_string())
        })?;
        let index_space = runtime.find_or_create_index_space(shape);
        let partitions = runtime.partition_manager();
        let handle = match partitions.find_partition(index_space, tiling) {
            Some(handle) => handle,
            None => {
                let complete = partitions.use_complete_tiling(shape, &tiling.tile_shape);
                let handle = runtime.engine().create_partition(
                    index_space,
                    &tiling.color_shape,
                    &tiling.tile_shape,
                    complete,
                );
                partitions.record_partition(index_space, tiling.clone(), handle)?;
                handle
            }
        };
        // A 1-d launch over an n-d color space needs a delinearizing
        // projection between the two.
        let projection = match launch_shape {
            Some(launch) if launch.ndim() != tiling.color_shape.ndim() => {
                let dims: Vec<i32> = (0..tiling.color_shape.ndim() as i32).collect();
                Some(runtime.get_projection(tiling.color_shape.ndim() as u32, &dims))
            }
            _ => None,
        };
        Ok(Requirement {
            store: store.id(),
            partition: Some(handle),
            color_shape: Some(tiling.color_shape.clone()),
            projection,
            access: AccessKind::Read,
            redop: None,
        })
    }
}

/// Computes launch shapes and caches index partitions.
#[derive(Debug)]
pub struct PartitionManager {
    num_pieces: u64,
    min_shard_volume: u64,
    /// Prime factors of `num_pieces`, largest first.
    piece_factors: Vec<u64>,
    launch_spaces: Mutex<IndexMap<Vec<u64>, Option<Vec<u64>>>>,
    index_partitions: Mutex<IndexMap<(IndexSpace, Tiling), PartitionHandle>>,
}

impl PartitionManager {
    pub fn try_new(config: &RuntimeConfig) -> Result<Self> {
        if config.num_pieces < 1 {
            return Err(LatticeError::Configuration(
                "num_pieces must be at least 1".to_string(),
            ));
        }
        let mut factors = vec![];
        let mut pieces = config.num_pieces as u64;
        for prime in [2u64, 3, 5, 7, 11] {
            while pieces % prime == 0 {
                factors.push(prime);
                pieces /= prime;
            }
        }
        if pieces > 1 {
            return Err(LatticeError::UnsupportedProcessorCount(config.num_pieces));
        }
        factors.reverse();
        Ok(Self {
            num_pieces: config.num_pieces as u64,
            min_shard_volume: config.min_shard_volume,
            piece_factors: factors,
            launch_spaces: Mutex::new(IndexMap::new()),
            index_partitions: Mutex::new(IndexMap::new()),
        })
    }

    pub fn num_pieces(&self) -> u64 {
        self.num_pieces
    }

    /// Compute the shape of the parallel launch for `store`, or `None`
    /// when a single-point launch is preferable. Restricted dimensions
    /// always map to extent 1.
    pub fn compute_launch_shape(
        &self,
        store: &Store,
        restrictions: &[Restriction],
    ) -> Result<Option<Shape>> {
        let shape = store.shape().ok_or_else(|| {
            LatticeError::Internal(
                "cannot compute a launch shape for an unbound store".to_string(),
            )
        })?;
        if restrictions.len() != shape.ndim() {
            return Err(LatticeError::Internal(format!(
                "expected {} restrictions for shape {shape}, got {}",
                shape.ndim(),
                restrictions.len()
            )));
        }

        let to_partition: Vec<u64> = shape
            .iter()
            .zip(restrictions.iter())
            .filter(|(_, restriction)| **restriction != Restriction::Restricted)
            .map(|(extent, _)| *extent)
            .collect();

        let Some(launch) = self.compute_launch_space(&to_partition)? else {
            return Ok(None);
        };

        let mut result = Vec::with_capacity(shape.ndim());
        let mut next = 0;
        for restriction in restrictions {
            if *restriction != Restriction::Restricted {
                result.push(launch[next]);
                next += 1;
            } else {
                result.push(1);
            }
        }
        Ok(Some(Shape::new(result)))
    }

    fn compute_launch_space(&self, shape: &[u64]) -> Result<Option<Vec<u64>>> {
        // One piece means no parallel launch at all, and neither does a
        // degenerate shape.
        if self.num_pieces == 1 {
            return Ok(None);
        }
        if shape.iter().all(|extent| *extent <= 1) {
            return Ok(None);
        }
        if let Some(cached) = self.launch_spaces.lock().get(shape) {
            return Ok(cached.clone());
        }

        // Prune out any dimensions of extent 1.
        let mut temp_shape = vec![];
        let mut temp_dims = vec![];
        let mut volume = 1u64;
        for (dim, &extent) in shape.iter().enumerate() {
            if extent == 0 {
                return Err(LatticeError::Internal(format!(
                    "stores must have positive extents, got 0 in dimension {dim}"
                )));
            }
            if extent == 1 {
                continue;
            }
            temp_shape.push(extent);
            temp_dims.push(dim);
            volume *= extent;
        }

        let max_pieces = (volume + self.min_shard_volume - 1) / self.min_shard_volume;
        if max_pieces == 1 {
            self.launch_spaces.lock().insert(shape.to_vec(), None);
            return Ok(None);
        }
        // If the array is big enough for at least two shards, use every
        // piece we have.
        let max_pieces = self.num_pieces;

        let dims = temp_shape.len();
        let temp_result = match dims {
            0 => return Ok(Some(vec![1; shape.len()])),
            1 => vec![temp_shape[0].min(max_pieces)],
            2 => launch_space_2d(&temp_shape, volume, max_pieces),
            _ => self.launch_space_nd(&temp_shape, max_pieces),
        };

        // Project back onto the unpruned rank.
        let mut result = vec![1u64; shape.len()];
        for (pos, dim) in temp_dims.iter().enumerate() {
            result[*dim] = temp_result[pos];
        }
        debug!(
            "launch space for {shape:?} with {} pieces: {result:?}",
            self.num_pieces
        );
        self.launch_spaces
            .lock()
            .insert(shape.to_vec(), Some(result.clone()));
        Ok(Some(result))
    }

    /// Round-robin the prime factors of the piece count onto the largest
    /// remaining dimensions, keeping the last dimension's tiles at least
    /// [`MIN_LAST_DIM_TILE`] wide. A factor no dimension can absorb ends
    /// the distribution.
    fn launch_space_nd(&self, shape: &[u64], max_pieces: u64) -> Vec<u64> {
        let dims = shape.len();
        let mut result = vec![1u64; dims];
        let mut factor_prod = 1u64;
        for &factor in &self.piece_factors {
            if factor * factor_prod > max_pieces {
                break;
            }
            let remaining: Vec<u64> = shape
                .iter()
                .zip(result.iter())
                .map(|(extent, pieces)| (extent + pieces - 1) / pieces)
                .collect();
            let big_dim = argmax(&remaining);
            let placement = if big_dim < dims - 1 {
                Some(big_dim)
            } else if remaining[big_dim] / factor >= MIN_LAST_DIM_TILE {
                Some(big_dim)
            } else {
                let next_dim = argmax(&remaining[..dims - 1]);
                (remaining[next_dim] / factor > 0).then_some(next_dim)
            };
            match placement {
                Some(dim) => {
                    result[dim] *= factor;
                    factor_prod *= factor;
                }
                None => break,
            }
        }
        for (pieces, extent) in result.iter_mut().zip(shape.iter()) {
            *pieces = (*pieces).min(*extent);
        }
        result
    }

    /// Over-approximate the tiles so that only the trailing ones may be
    /// small.
    pub fn compute_tile_shape(&self, shape: &Shape, launch_space: &Shape) -> Shape {
        debug_assert_eq!(shape.ndim(), launch_space.ndim());
        shape.ceil_div(launch_space)
    }

    /// Whether the engine should be told the tiling is complete. Very
    /// fine tilings are left incomplete to bound engine bookkeeping.
    pub fn use_complete_tiling(&self, shape: &Shape, tile_shape: &Shape) -> bool {
        let num_tiles = shape.ceil_div(tile_shape).volume();
        !(num_tiles > COMPLETE_TILING_MAX_TILES
            && num_tiles > COMPLETE_TILING_PIECES_FACTOR * self.num_pieces)
    }

    pub fn find_partition(
        &self,
        index_space: IndexSpace,
        tiling: &Tiling,
    ) -> Option<PartitionHandle> {
        self.index_partitions
            .lock()
            .get(&(index_space, tiling.clone()))
            .copied()
    }

    pub fn record_partition(
        &self,
        index_space: IndexSpace,
        tiling: Tiling,
        partition: PartitionHandle,
    ) -> Result<()> {
        let mut index_partitions = self.index_partitions.lock();
        let key = (index_space, tiling);
        if index_partitions.contains_key(&key) {
            return Err(LatticeError::Internal(format!(
                "index partition for {key:?} has already been recorded"
            )));
        }
        index_partitions.insert(key, partition);
        Ok(())
    }

    /// Drop every cached launch space and index partition.
    pub fn clear(&self) {
        self.launch_spaces.lock().clear();
        self.index_partitions.lock().clear();
    }
}

fn launch_space_2d(shape: &[u64], volume: u64, max_pieces: u64) -> Vec<u64> {
    if volume < max_pieces {
        return shape.to_vec();
    }
    // Use the square root to make the pieces as square as possible,
    // since these shapes mostly feed matrix operations.
    let swap = shape[0] > shape[1];
    let (nx, ny) = if swap {
        (shape[1], shape[0])
    } else {
        (shape[0], shape[1])
    };
    let n = ((max_pieces * nx) as f64 / ny as f64).sqrt();
    // Constrain n to an integer dividing max_pieces, trying both
    // rounding directions and keeping whichever yields the shortest
    // long side.
    let mut n1 = ((n + 1e-12).floor() as u64).max(1);
    while max_pieces % n1 != 0 {
        n1 -= 1;
    }
    let mut n2 = ((n - 1e-12).ceil() as u64).max(1);
    while max_pieces % n2 != 0 {
        n2 += 1;
    }
    let side1 = (nx / n1).max(ny / (max_pieces / n1));
    let side2 = (nx / n2).max(ny / (max_pieces / n2));
    let px = if side1 <= side2 { n1 } else { n2 };
    let py = max_pieces / px;
    // Trim the launch space where it outgrows the array itself.
    if swap {
        vec![py.min(shape[0]), px.min(shape[1])]
    } else {
        vec![px.min(shape[0]), py.min(shape[1])]
    }
}

fn argmax(values: &[u64]) -> usize {
    let mut best = 0;
    for (idx, value) in values.iter().enumerate() {
        if *value > values[best] {
            best = idx;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreId;
    use lattice_common::ElementType;

    fn manager(num_pieces: u32, min_shard_volume: u64) -> PartitionManager {
        let config = RuntimeConfig::default()
            .with_num_pieces(num_pieces)
            .with_min_shard_volume(min_shard_volume);
        PartitionManager::try_new(&config).unwrap()
    }

    fn store(extents: Vec<u64>) -> Store {
        Store::new(
            StoreId(1),
            ElementType::Float64,
            Some(Shape::new(extents)),
            false,
        )
    }

    fn allowed(ndim: usize) -> Vec<Restriction> {
        vec![Restriction::Allowed; ndim]
    }

    #[test]
    fn square_matrix_splits_square() {
        let manager = manager(4, 1);
        let launch = manager
            .compute_launch_shape(&store(vec![100, 100]), &allowed(2))
            .unwrap();
        assert_eq!(launch, Some(Shape::new(vec![2, 2])));
    }

    #[test]
    fn three_dims_keep_piece_product() {
        let manager = manager(4, 1);
        let launch = manager
            .compute_launch_shape(&store(vec![10, 10, 10]), &allowed(3))
            .unwrap()
            .unwrap();
        assert_eq!(launch.volume(), 4);
        assert!(launch.iter().all(|extent| *extent >= 1));
        // Memoized: a second call observes the identical result.
        let again = manager
            .compute_launch_shape(&store(vec![10, 10, 10]), &allowed(3))
            .unwrap()
            .unwrap();
        assert_eq!(launch, again);
    }

    #[test]
    fn single_piece_never_launches_parallel() {
        let manager = manager(1, 1);
        let launch = manager
            .compute_launch_shape(&store(vec![1000, 1000]), &allowed(2))
            .unwrap();
        assert_eq!(launch, None);
    }

    #[test]
    fn small_volume_stays_single() {
        let manager = manager(4, 1_000_000);
        let launch = manager
            .compute_launch_shape(&store(vec![100, 100]), &allowed(2))
            .unwrap();
        assert_eq!(launch, None);
    }

    #[test]
    fn restricted_dims_are_forced_to_one() {
        let manager = manager(4, 1);
        let launch = manager
            .compute_launch_shape(
                &store(vec![100, 100]),
                &[Restriction::Restricted, Restriction::Allowed],
            )
            .unwrap()
            .unwrap();
        assert_eq!(launch[0], 1);
        assert_eq!(launch.volume(), 4);
    }

    #[test]
    fn launch_shape_bounded_by_extents() {
        let manager = manager(16, 1);
        let shape = vec![2u64, 3, 64];
        let launch = manager
            .compute_launch_shape(&store(shape.clone()), &allowed(3))
            .unwrap()
            .unwrap();
        for (dim, extent) in shape.iter().enumerate() {
            assert!(launch[dim] >= 1);
            assert!(launch[dim] <= *extent);
        }
        assert!(launch.volume() <= 16);
    }

    #[test]
    fn degenerate_extents_stay_single() {
        let manager = manager(4, 1);
        let launch = manager
            .compute_launch_shape(&store(vec![1, 1]), &allowed(2))
            .unwrap();
        assert_eq!(launch, None);
    }

    #[test]
    fn one_dim_clamps_to_extent() {
        let manager = manager(8, 1);
        let launch = manager
            .compute_launch_shape(&store(vec![5]), &allowed(1))
            .unwrap();
        assert_eq!(launch, Some(Shape::new(vec![5])));
    }

    #[test]
    fn large_prime_factor_is_rejected() {
        let config = RuntimeConfig::default().with_num_pieces(13);
        let err = PartitionManager::try_new(&config).unwrap_err();
        assert!(matches!(err, LatticeError::UnsupportedProcessorCount(13)));
    }

    #[test]
    fn complete_tiling_heuristic() {
        let manager = manager(2, 1);
        let shape = Shape::new(vec![100, 100]);
        let coarse = Shape::new(vec![50, 50]);
        assert!(manager.use_complete_tiling(&shape, &coarse));
        // 10_000 tiles of a single element each is both above the tile
        // cap and above 16x the piece count.
        let fine = Shape::new(vec![1, 1]);
        assert!(!manager.use_complete_tiling(&shape, &fine));
    }

    #[test]
    fn duplicate_partition_record_is_an_error() {
        let manager = manager(4, 1);
        let tiling = Tiling {
            tile_shape: Shape::new(vec![50, 50]),
            color_shape: Shape::new(vec![2, 2]),
        };
        manager
            .record_partition(IndexSpace(1), tiling.clone(), PartitionHandle(7))
            .unwrap();
        assert_eq!(
            manager.find_partition(IndexSpace(1), &tiling),
            Some(PartitionHandle(7))
        );
        assert!(manager
            .record_partition(IndexSpace(1), tiling, PartitionHandle(8))
            .is_err());
    }
}
