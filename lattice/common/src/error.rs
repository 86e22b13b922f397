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

//! Error type for the Lattice runtime.

use crate::shape::Shape;

use thiserror::Error;

/// Result type for operations that could result in a [`LatticeError`]
pub type Result<T> = std::result::Result<T, LatticeError>;

/// Error type for the runtime. Invariant violations are fatal and surface
/// to the caller without attempted recovery; fusion legality failures are
/// not errors and never appear here.
#[derive(Debug, Error)]
pub enum LatticeError {
    /// Two stores were aligned but their shapes differ
    #[error("stores must have the same shape to be aligned, but got {0} and {1}")]
    ShapeMismatch(Shape, Shape),

    /// More than one scalar store was used as an output of the same operation
    #[error("only one scalar store can be used for an output")]
    MultipleScalarOutputs,

    /// The configured processor count cannot be factored for tiling
    #[error(
        "processor counts with prime factors greater than 11 are not supported, got {0}"
    )]
    UnsupportedProcessorCount(u32),

    /// A strategy was queried for a store it does not cover
    #[error("no strategy found for store {0}")]
    NoStrategy(u64),

    /// Two libraries were registered under the same name
    #[error("library {0} has already been registered")]
    DuplicateLibrary(String),

    /// Two live region fields were bound to the same external buffer
    #[error("cannot attach two different region fields to the same buffer")]
    DuplicateAttachment,

    /// A new attachment's byte range overlaps an existing one
    #[error("aliased attachments are not supported")]
    AliasedAttachment,

    /// A detachment referenced a buffer that was never attached
    #[error("unable to find attachment to remove")]
    MissingAttachment,

    /// Invalid runtime configuration
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A failure surfaced by the execution engine
    #[error("engine error: {0}")]
    Engine(String),

    /// An internal invariant was broken
    #[error(
        "internal error: {0}. This was likely caused by a bug in the runtime; \
         please open a bug report"
    )]
    Internal(String),
}
