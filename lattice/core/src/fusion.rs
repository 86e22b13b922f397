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

//! The fusion legality analyzer.
//!
//! [`FusionChecker`] partitions every operation of the window on its
//! own, then applies an ordered chain of [`FusionRule`]s. Each rule
//! refines a list of half-open intervals over the window; operations
//! that share an interval after the whole chain ran may be collapsed
//! into one fused task. Rules must be pure functions of their inputs so
//! that every shard derives the identical interval list.

use std::ops::Range;

use indexmap::{IndexMap, IndexSet};
use itertools::Itertools;
use lattice_common::Result;
use log::debug;

use crate::engine::LocalTaskId;
use crate::operation::Operation;
use crate::partition::PartitionDesc;
use crate::runtime::Runtime;
use crate::solver::{Partitioner, Strategy};
use crate::store::{StoreId, Transform};

/// A half-open interval of window indices.
pub type Interval = Range<usize>;

/// Everything a rule may look at.
pub struct FusionContext<'a> {
    pub ops: &'a [Operation],
    pub strategies: &'a [Strategy],
}

/// One legality rule of the fusion chain. Rules see the whole window
/// and the per-op strategies and return a refined interval list; they
/// must neither reorder nor drop indices.
pub trait FusionRule {
    fn name(&self) -> &str;

    fn apply(&self, cx: &FusionContext<'_>, intervals: Vec<Interval>) -> Vec<Interval>;
}

/// The outcome of a legality check: whether anything is worth fusing,
/// the final interval list, and the per-op strategies computed on the
/// way.
pub struct FusionDecision {
    pub fusable: bool,
    pub intervals: Vec<Interval>,
    pub strategies: Vec<Strategy>,
}

/// Runs the per-op partitioner and the registered rule chain.
pub struct FusionChecker<'a> {
    ops: &'a [Operation],
    rules: Vec<Box<dyn FusionRule>>,
    fusion_threshold: usize,
}

impl<'a> FusionChecker<'a> {
    pub fn new(ops: &'a [Operation], fusion_threshold: usize) -> Self {
        Self {
            ops,
            rules: vec![],
            fusion_threshold,
        }
    }

    pub fn register_rule(&mut self, rule: Box<dyn FusionRule>) {
        self.rules.push(rule);
    }

    pub fn check(&self, runtime: &Runtime) -> Result<FusionDecision> {
        let mut strategies = Vec::with_capacity(self.ops.len());
        for op in self.ops {
            let partitioner =
                Partitioner::new(std::slice::from_ref(op), op.has_scalar_output());
            strategies.push(partitioner.partition_stores(runtime)?);
        }

        let mut intervals = vec![0..self.ops.len()];
        let cx = FusionContext {
            ops: self.ops,
            strategies: &strategies,
        };
        for rule in &self.rules {
            intervals = rule.apply(&cx, intervals);
            debug!(
                "fusion rule {} refined the window to [{}]",
                rule.name(),
                intervals
                    .iter()
                    .map(|interval| format!("{}..{}", interval.start, interval.end))
                    .join(", ")
            );
        }

        let (fusable, intervals) =
            suppress_small_fusions(intervals, self.fusion_threshold);
        Ok(FusionDecision {
            fusable,
            intervals,
            strategies,
        })
    }
}

/// Expand every interval shorter than `threshold` into singletons.
///
/// Note the asymmetry inherited from the original protocol: the returned
/// flag is `true` as soon as *any* interval meets the threshold, even
/// though the returned list still contains singletons for short runs.
pub fn suppress_small_fusions(
    intervals: Vec<Interval>,
    threshold: usize,
) -> (bool, Vec<Interval>) {
    let mut fusable = false;
    let mut final_set = vec![];
    for interval in intervals {
        if interval.len() >= threshold {
            final_set.push(interval);
            fusable = true;
        } else {
            for index in interval {
                final_set.push(index..index + 1);
            }
        }
    }
    (fusable, final_set)
}

/// Only an allowlist of task kinds may fuse at all; a terminal kind may
/// join a group only as its last operation. Copies never fuse.
pub struct ValidTaskKinds {
    valid: IndexSet<LocalTaskId>,
    terminals: IndexSet<LocalTaskId>,
}

impl ValidTaskKinds {
    pub fn new(valid: IndexSet<LocalTaskId>, terminals: IndexSet<LocalTaskId>) -> Self {
        Self { valid, terminals }
    }

    fn is_valid(&self, op: &Operation) -> bool {
        op.task_id()
            .map(|task_id| self.valid.contains(&task_id))
            .unwrap_or(false)
    }

    fn is_terminal(&self, op: &Operation) -> bool {
        op.task_id()
            .map(|task_id| self.terminals.contains(&task_id))
            .unwrap_or(false)
    }
}

impl FusionRule for ValidTaskKinds {
    fn name(&self) -> &str {
        "ValidTaskKinds"
    }

    fn apply(&self, cx: &FusionContext<'_>, intervals: Vec<Interval>) -> Vec<Interval> {
        let mut result = vec![];
        for interval in intervals {
            let mut start = interval.start;
            let mut end = interval.start;
            while end < interval.end {
                let op = &cx.ops[end];
                if self.is_valid(op) && !self.is_terminal(op) {
                    end += 1;
                } else if start < end {
                    if self.is_terminal(op) {
                        // A terminal may close the run it follows.
                        result.push(start..end + 1);
                        start = end + 1;
                    } else {
                        result.push(start..end);
                        start = end;
                    }
                    end = start;
                } else {
                    result.push(start..start + 1);
                    start += 1;
                    end = start;
                }
            }
            if start < end {
                result.push(start..end);
            }
        }
        result
    }
}

/// Consecutive operations must launch over the same shape; a single
/// point launch never fuses with an indexed one.
pub struct IdenticalLaunchShapes;

impl FusionRule for IdenticalLaunchShapes {
    fn name(&self) -> &str {
        "IdenticalLaunchShapes"
    }

    fn apply(&self, cx: &FusionContext<'_>, intervals: Vec<Interval>) -> Vec<Interval> {
        let mut result = vec![];
        for interval in intervals {
            let mut start = interval.start;
            for index in interval.start + 1..interval.end {
                if cx.strategies[index].launch_shape()
                    != cx.strategies[index - 1].launch_shape()
                {
                    result.push(start..index);
                    start = index;
                }
            }
            if start < interval.end {
                result.push(start..interval.end);
            }
        }
        result
    }
}

/// A store partitioned more than once across an interval must be viewed
/// through the same transform every time.
pub struct IdenticalProjection;

impl IdenticalProjection {
    /// The transforms of every store this op accesses through a tiled
    /// partition, inputs before outputs.
    fn op_transforms(
        cx: &FusionContext<'_>,
        index: usize,
    ) -> IndexMap<StoreId, Transform> {
        let op = &cx.ops[index];
        let strategy = &cx.strategies[index];
        let mut transforms = IndexMap::new();
        let stores = op.inputs().iter().chain(op.outputs().iter());
        for store in stores {
            if transforms.contains_key(&store.id()) {
                continue;
            }
            if let Ok(PartitionDesc::Tiling(_)) = strategy.partition(store) {
                let transform = store
                    .root_transform()
                    .cloned()
                    .unwrap_or_else(|| Transform::identity(store.ndim()));
                transforms.insert(store.id(), transform);
            }
        }
        transforms
    }
}

impl FusionRule for IdenticalProjection {
    fn name(&self) -> &str {
        "IdenticalProjection"
    }

    fn apply(&self, cx: &FusionContext<'_>, intervals: Vec<Interval>) -> Vec<Interval> {
        let mut result = vec![];
        for interval in intervals {
            let mut start = interval.start;
            let mut recorded: IndexMap<StoreId, Transform> = IndexMap::new();
            for index in interval.clone() {
                let transforms = Self::op_transforms(cx, index);
                let conflict = transforms.iter().any(|(store, transform)| {
                    recorded
                        .get(store)
                        .map(|seen| seen != transform)
                        .unwrap_or(false)
                });
                if conflict {
                    result.push(start..index);
                    start = index;
                    recorded.clear();
                }
                for (store, transform) in transforms {
                    recorded.entry(store).or_insert(transform);
                }
            }
            if start < interval.end {
                result.push(start..interval.end);
            }
        }
        result
    }
}

/// Once an interval wrote a root store through some view, every later
/// consumer of that root must read it through exactly that view.
pub struct ValidProducerConsumer;

impl FusionRule for ValidProducerConsumer {
    fn name(&self) -> &str {
        "ValidProducerConsumer"
    }

    fn apply(&self, cx: &FusionContext<'_>, intervals: Vec<Interval>) -> Vec<Interval> {
        let mut result = vec![];
        for interval in intervals {
            let mut start = interval.start;
            // Maps a root store to the producing view registered so far.
            let mut producers: IndexMap<StoreId, StoreId> = IndexMap::new();
            for index in interval.clone() {
                let op = &cx.ops[index];
                let conflict = op.inputs().iter().any(|input| {
                    producers
                        .get(&input.root().id())
                        .map(|view| *view != input.id())
                        .unwrap_or(false)
                });
                if conflict {
                    result.push(start..index);
                    start = index;
                    producers.clear();
                }
                for output in op.outputs() {
                    producers.entry(output.root().id()).or_insert(output.id());
                }
            }
            if start < interval.end {
                result.push(start..interval.end);
            }
        }
        result
    }
}

/// An operation with a scalar output or scalar reduction stands alone;
/// concatenating it into a fused task would lose the scalar result.
pub struct IsolateScalarOutputs;

impl FusionRule for IsolateScalarOutputs {
    fn name(&self) -> &str {
        "IsolateScalarOutputs"
    }

    fn apply(&self, cx: &FusionContext<'_>, intervals: Vec<Interval>) -> Vec<Interval> {
        let mut result = vec![];
        for interval in intervals {
            let mut start = interval.start;
            for index in interval.clone() {
                if cx.ops[index].has_scalar_output() {
                    if start < index {
                        result.push(start..index);
                    }
                    result.push(index..index + 1);
                    start = index + 1;
                }
            }
            if start < interval.end {
                result.push(start..interval.end);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suppress_small_fusions_expands_short_runs() {
        let (fusable, intervals) = suppress_small_fusions(vec![0..4, 4..5], 2);
        assert!(fusable);
        assert_eq!(intervals, vec![0..4, 4..5]);

        let (fusable, intervals) = suppress_small_fusions(vec![0..1, 1..2], 2);
        assert!(!fusable);
        assert_eq!(intervals, vec![0..1, 1..2]);

        // Any qualifying interval flips the flag even though short runs
        // are still returned as singletons.
        let (fusable, intervals) = suppress_small_fusions(vec![0..1, 1..4], 2);
        assert!(fusable);
        assert_eq!(intervals, vec![0..1, 1..4]);
    }
}
