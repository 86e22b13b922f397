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

//! Runtime tunables, read once at runtime construction.

use crate::error::{LatticeError, Result};

/// Tunable knobs of the runtime. All values are read exactly once when
/// the runtime is constructed; changing a config after that has no
/// effect on a live runtime.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Number of pieces a parallel launch is split into. Must be at
    /// least 1 and must not have prime factors greater than 11.
    pub num_pieces: u32,
    /// Minimum number of elements a single shard should own before a
    /// parallel launch is considered worthwhile.
    pub min_shard_volume: u64,
    /// Maximum number of operations buffered in the scheduling window
    /// before it is drained.
    pub window_size: u32,
    /// Fields larger than this many bytes exchange reclamation matches
    /// proportionally more often.
    pub field_reuse_size: u64,
    /// Number of field allocations between two consensus matches.
    pub field_reuse_frequency: u32,
    /// Minimum run length that is actually emitted as a fused operation;
    /// shorter runs pass through as singletons.
    pub fusion_threshold: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            num_pieces: 1,
            min_shard_volume: 1,
            window_size: 50,
            field_reuse_size: 32 << 20,
            field_reuse_frequency: 32,
            fusion_threshold: 2,
        }
    }
}

impl RuntimeConfig {
    pub fn with_num_pieces(mut self, num_pieces: u32) -> Self {
        self.num_pieces = num_pieces;
        self
    }

    pub fn with_min_shard_volume(mut self, min_shard_volume: u64) -> Self {
        self.min_shard_volume = min_shard_volume;
        self
    }

    pub fn with_window_size(mut self, window_size: u32) -> Self {
        self.window_size = window_size;
        self
    }

    pub fn with_field_reuse_size(mut self, field_reuse_size: u64) -> Self {
        self.field_reuse_size = field_reuse_size;
        self
    }

    pub fn with_field_reuse_frequency(mut self, field_reuse_frequency: u32) -> Self {
        self.field_reuse_frequency = field_reuse_frequency;
        self
    }

    pub fn with_fusion_threshold(mut self, fusion_threshold: u32) -> Self {
        self.fusion_threshold = fusion_threshold;
        self
    }

    /// Check the value ranges that do not require factorization. The
    /// prime-factor limit on `num_pieces` is enforced where the factors
    /// are actually computed.
    pub fn validate(&self) -> Result<()> {
        if self.num_pieces < 1 {
            return Err(LatticeError::Configuration(
                "num_pieces must be at least 1".to_string(),
            ));
        }
        if self.min_shard_volume < 1 {
            return Err(LatticeError::Configuration(
                "min_shard_volume must be at least 1".to_string(),
            ));
        }
        if self.window_size < 1 {
            return Err(LatticeError::Configuration(
                "window_size must be at least 1".to_string(),
            ));
        }
        if self.field_reuse_frequency < 1 {
            return Err(LatticeError::Configuration(
                "field_reuse_frequency must be at least 1".to_string(),
            ));
        }
        if self.fusion_threshold < 2 {
            return Err(LatticeError::Configuration(
                "fusion_threshold must be at least 2".to_string(),
            ));
        }
        Ok(())
    }
}
