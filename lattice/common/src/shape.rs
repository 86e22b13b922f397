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

//! [`Shape`] describes the extents of a logical array.

use std::fmt;
use std::ops::Index;

/// An ordered tuple of non-negative extents. A zero-dimensional shape is
/// valid and describes a scalar with a volume of one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Shape {
    extents: Vec<u64>,
}

impl Shape {
    pub fn new(extents: Vec<u64>) -> Self {
        Self { extents }
    }

    /// The zero-dimensional shape backing scalar stores.
    pub fn empty() -> Self {
        Self { extents: vec![] }
    }

    pub fn ndim(&self) -> usize {
        self.extents.len()
    }

    pub fn extents(&self) -> &[u64] {
        &self.extents
    }

    /// The number of elements; the empty product is one.
    pub fn volume(&self) -> u64 {
        self.extents.iter().product()
    }

    /// Element-wise ceiling division, used to over-approximate tile extents
    /// so that only the trailing tiles may be small.
    pub fn ceil_div(&self, other: &Shape) -> Shape {
        debug_assert_eq!(self.ndim(), other.ndim());
        Shape {
            extents: self
                .extents
                .iter()
                .zip(other.extents.iter())
                .map(|(x, y)| (x + y - 1) / y)
                .collect(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &u64> {
        self.extents.iter()
    }
}

impl Index<usize> for Shape {
    type Output = u64;

    fn index(&self, dim: usize) -> &u64 {
        &self.extents[dim]
    }
}

impl From<Vec<u64>> for Shape {
    fn from(extents: Vec<u64>) -> Self {
        Self { extents }
    }
}

impl From<&[u64]> for Shape {
    fn from(extents: &[u64]) -> Self {
        Self {
            extents: extents.to_vec(),
        }
    }
}

impl FromIterator<u64> for Shape {
    fn from_iter<I: IntoIterator<Item = u64>>(iter: I) -> Self {
        Self {
            extents: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (idx, ext) in self.extents.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{ext}")?;
        }
        write!(f, ")")
    }
}
