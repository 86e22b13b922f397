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

//! End-to-end tests of the operation pipeline against the recording
//! engine: window management, fusion, field reclamation, attachments,
//! and the cross-shard determinism contract.

use std::sync::Arc;

use lattice::attachment::{Detachment, ExternalAllocation, ExternalBuffer};
use lattice::engine::ReductionOpId;
use lattice::fusion::{
    FusionContext, FusionRule, IsolateScalarOutputs, ValidProducerConsumer,
    ValidTaskKinds,
};
use lattice::operation::Operation;
use lattice::partition::{PartitionDesc, Restriction};
use lattice::solver::{Partitioner, Strategy};
use lattice::store::{Storage, Transform};
use lattice::test_utils::{
    array_store, binary_op, fill_op, test_runtime, test_runtime_on, unary_op,
    EngineCall, MockEngine, BINARY_OP, FILL_OP, TERMINAL_OP, UNARY_OP,
};
use lattice::{ElementType, Runtime, RuntimeConfig, Shape};

#[ctor::ctor]
fn init() {
    let _ = env_logger::try_init();
}

fn four_pieces() -> RuntimeConfig {
    RuntimeConfig::default().with_num_pieces(4)
}

fn per_op_strategies(runtime: &Runtime, ops: &[Operation]) -> Vec<Strategy> {
    ops.iter()
        .map(|op| {
            Partitioner::new(std::slice::from_ref(op), op.has_scalar_output())
                .partition_stores(runtime)
                .unwrap()
        })
        .collect()
}

#[test]
fn window_drains_when_full() {
    let (engine, runtime) = test_runtime(four_pieces().with_window_size(4));
    let a = array_store(&runtime, vec![100, 100]);
    let b = array_store(&runtime, vec![100, 100]);
    let c = array_store(&runtime, vec![100, 100]);

    fill_op(&a).execute(&runtime).unwrap();
    unary_op(&a, &b).execute(&runtime).unwrap();
    fill_op(&c).execute(&runtime).unwrap();
    assert_eq!(runtime.outstanding_ops(), 3);
    assert!(engine.task_launches().is_empty());

    binary_op(&b, &c, &a).execute(&runtime).unwrap();
    assert_eq!(runtime.outstanding_ops(), 0);
    assert!(!engine.task_launches().is_empty());
}

#[test]
fn homogeneous_window_fuses_into_one_task() {
    let (engine, runtime) = test_runtime(four_pieces());
    let a = array_store(&runtime, vec![100, 100]);
    let b = array_store(&runtime, vec![100, 100]);
    let c = array_store(&runtime, vec![100, 100]);
    let d = array_store(&runtime, vec![100, 100]);
    let e = array_store(&runtime, vec![100, 100]);

    fill_op(&a).execute(&runtime).unwrap();
    binary_op(&a, &b, &c).execute(&runtime).unwrap();
    fill_op(&d).execute(&runtime).unwrap();
    binary_op(&c, &d, &e).execute(&runtime).unwrap();
    runtime.flush().unwrap();

    let launches = engine.task_launches();
    assert_eq!(launches.len(), 1);
    let fused = &launches[0];
    let metadata = fused.fusion_metadata.as_ref().expect("fusion header");
    assert_eq!(metadata.num_subops(), 4);
    assert_eq!(fused.launch_domain, Some(Shape::new(vec![2, 2])));
}

#[test]
fn mismatched_launch_shapes_do_not_fuse() {
    let (engine, runtime) = test_runtime(four_pieces());
    let a = array_store(&runtime, vec![100, 100]);
    let b = array_store(&runtime, vec![100, 100]);
    let c = array_store(&runtime, vec![100, 100]);
    let d = array_store(&runtime, vec![50]);
    let e = array_store(&runtime, vec![50]);

    binary_op(&a, &b, &c).execute(&runtime).unwrap();
    unary_op(&d, &e).execute(&runtime).unwrap();
    runtime.flush().unwrap();

    let launches = engine.task_launches();
    assert_eq!(launches.len(), 2);
    assert!(launches.iter().all(|launch| launch.fusion_metadata.is_none()));
    assert_eq!(launches[0].launch_domain, Some(Shape::new(vec![2, 2])));
    assert_eq!(launches[1].launch_domain, Some(Shape::new(vec![4])));
}

#[test]
fn fused_header_recovers_sub_op_slices() {
    let (engine, runtime) = test_runtime(four_pieces());
    let a = array_store(&runtime, vec![100, 100]);
    let b = array_store(&runtime, vec![100, 100]);

    fill_op(&a).execute(&runtime).unwrap();
    unary_op(&a, &b).execute(&runtime).unwrap();
    runtime.flush().unwrap();

    let launches = engine.task_launches();
    assert_eq!(launches.len(), 1);
    let metadata = launches[0].fusion_metadata.as_ref().expect("fusion header");

    assert_eq!(metadata.num_subops(), 2);
    // fill has no inputs and one output; the unary op reads what the
    // fill wrote and writes one output of its own.
    assert_eq!(metadata.input_starts, vec![0, 0, 1]);
    assert_eq!(metadata.output_starts, vec![0, 1, 2]);
    assert_eq!(metadata.offset_starts, vec![0, 1, 3]);
    assert_eq!(metadata.offsets, vec![-1, 1, -1]);
    assert_eq!(metadata.reduction_starts, vec![0, 0, 0]);
    assert_eq!(metadata.scalar_starts, vec![0, 0, 0]);
    assert_eq!(metadata.future_starts, vec![0, 0, 0]);

    assert_eq!(metadata.input_range(0), 0..0);
    assert_eq!(metadata.input_range(1), 0..1);
    assert_eq!(metadata.output_range(0), 0..1);
    assert_eq!(metadata.output_range(1), 1..2);
}

#[test]
fn terminal_task_kind_closes_a_group() {
    let (_, runtime) = test_runtime(four_pieces());
    let a = array_store(&runtime, vec![100, 100]);
    let b = array_store(&runtime, vec![100, 100]);
    let ops = vec![
        fill_op(&a),
        unary_op(&a, &b),
        Operation::new_task(lattice::test_utils::TEST_LIBRARY_NAME, TERMINAL_OP, 0),
        unary_op(&b, &a),
    ];
    let strategies = per_op_strategies(&runtime, &ops);
    let cx = FusionContext {
        ops: &ops,
        strategies: &strategies,
    };
    let rule = ValidTaskKinds::new(
        [BINARY_OP, FILL_OP, UNARY_OP].into_iter().collect(),
        [TERMINAL_OP].into_iter().collect(),
    );
    let intervals = rule.apply(&cx, vec![0..4]);
    assert_eq!(intervals, vec![0..3, 3..4]);
}

#[test]
fn consumer_of_a_different_view_splits_the_window() {
    let (_, runtime) = test_runtime(four_pieces());
    let root = array_store(&runtime, vec![100, 100]);
    let view1 = runtime.create_view(
        &root,
        Shape::new(vec![100, 100]),
        Transform::identity(2),
    );
    let view2 = runtime.create_view(
        &root,
        Shape::new(vec![100, 100]),
        Transform::new(2, 2, vec![0, 1, 1, 0]),
    );
    let out = array_store(&runtime, vec![100, 100]);

    let ops = vec![fill_op(&view1), unary_op(&view2, &out)];
    let strategies = per_op_strategies(&runtime, &ops);
    let cx = FusionContext {
        ops: &ops,
        strategies: &strategies,
    };
    let intervals = ValidProducerConsumer.apply(&cx, vec![0..2]);
    assert_eq!(intervals, vec![0..1, 1..2]);

    // Reading the producer's own view keeps the window whole.
    let ops = vec![fill_op(&view1), unary_op(&view1, &out)];
    let strategies = per_op_strategies(&runtime, &ops);
    let cx = FusionContext {
        ops: &ops,
        strategies: &strategies,
    };
    let intervals = ValidProducerConsumer.apply(&cx, vec![0..2]);
    assert_eq!(intervals, vec![0..2]);
}

#[test]
fn scalar_outputs_are_isolated() {
    let (_, runtime) = test_runtime(RuntimeConfig::default());
    let a = array_store(&runtime, vec![100, 100]);
    let b = array_store(&runtime, vec![100, 100]);
    let s = runtime.create_scalar_store(ElementType::Float64);

    let mut reduction = Operation::new_task(
        lattice::test_utils::TEST_LIBRARY_NAME,
        UNARY_OP,
        0,
    );
    reduction.add_input(a.clone());
    reduction.add_output(s).unwrap();

    let ops = vec![unary_op(&a, &b), reduction, unary_op(&b, &a)];
    let strategies = per_op_strategies(&runtime, &ops);
    let cx = FusionContext {
        ops: &ops,
        strategies: &strategies,
    };
    let intervals = IsolateScalarOutputs.apply(&cx, vec![0..3]);
    assert_eq!(intervals, vec![0..1, 1..2, 2..3]);
}

#[test]
fn fusion_intervals_cover_the_window() {
    let (engine, runtime) = test_runtime(four_pieces());
    let a = array_store(&runtime, vec![100, 100]);
    let b = array_store(&runtime, vec![100, 100]);
    let c = array_store(&runtime, vec![30]);
    let d = array_store(&runtime, vec![30]);

    // A window that fuses in the middle and passes through both ends.
    let mut copy = Operation::new_copy(lattice::test_utils::TEST_LIBRARY_NAME, 0);
    copy.add_input(c.clone());
    copy.add_output(d.clone()).unwrap();
    copy.execute(&runtime).unwrap();
    fill_op(&a).execute(&runtime).unwrap();
    unary_op(&a, &b).execute(&runtime).unwrap();
    unary_op(&c, &d).execute(&runtime).unwrap();
    runtime.flush().unwrap();

    // Every submitted operation is accounted for: one copy, one fused
    // task covering the two middle ops, and the trailing unary op.
    assert_eq!(engine.copy_launches().len(), 1);
    let tasks = engine.task_launches();
    assert_eq!(tasks.len(), 2);
    assert!(tasks[0].fusion_metadata.is_some());
    assert!(tasks[1].fusion_metadata.is_none());
}

#[test]
fn aligned_stores_share_a_partition() {
    let (_, runtime) = test_runtime(four_pieces());
    let a = array_store(&runtime, vec![100, 100]);
    let b = array_store(&runtime, vec![100, 100]);
    let c = array_store(&runtime, vec![100, 100]);
    let op = binary_op(&a, &b, &c);

    let strategy = Partitioner::new(std::slice::from_ref(&op), false)
        .partition_stores(&runtime)
        .unwrap();
    let of_a = strategy.partition(&a).unwrap().clone();
    let of_b = strategy.partition(&b).unwrap().clone();
    let of_c = strategy.partition(&c).unwrap().clone();
    assert_eq!(of_a, of_b);
    assert_eq!(of_b, of_c);
    assert!(matches!(of_a, PartitionDesc::Tiling(_)));
    assert_eq!(strategy.launch_shape(), Some(&Shape::new(vec![2, 2])));
}

#[test]
fn scalar_and_broadcast_stores_get_no_partition() {
    let (_, runtime) = test_runtime(four_pieces());
    let a = array_store(&runtime, vec![100, 100]);
    let b = array_store(&runtime, vec![100, 100]);
    let s = runtime.create_scalar_store(ElementType::Float64);

    let mut op = Operation::new_task(
        lattice::test_utils::TEST_LIBRARY_NAME,
        BINARY_OP,
        0,
    );
    op.add_input(a.clone());
    op.add_input(s.clone());
    op.add_output(b.clone()).unwrap();
    op.add_broadcast(&a);

    let strategy = Partitioner::new(std::slice::from_ref(&op), false)
        .partition_stores(&runtime)
        .unwrap();
    assert_eq!(
        strategy.partition(&a).unwrap(),
        &PartitionDesc::NoPartition
    );
    assert_eq!(
        strategy.partition(&s).unwrap(),
        &PartitionDesc::NoPartition
    );
    assert!(matches!(
        strategy.partition(&b).unwrap(),
        PartitionDesc::Tiling(_)
    ));
}

#[test]
fn unbound_outputs_collapse_the_launch_to_one_dim() {
    let (_, runtime) = test_runtime(four_pieces());
    let input = array_store(&runtime, vec![100, 100]);
    let unbound = runtime.create_unbound_store(ElementType::Float64);

    let mut op = Operation::new_task(
        lattice::test_utils::TEST_LIBRARY_NAME,
        UNARY_OP,
        0,
    );
    op.add_input(input.clone());
    op.add_output(unbound.clone()).unwrap();

    let strategy = Partitioner::new(std::slice::from_ref(&op), false)
        .partition_stores(&runtime)
        .unwrap();
    assert_eq!(strategy.launch_shape(), Some(&Shape::new(vec![4])));
    assert_eq!(
        strategy.partition(&unbound).unwrap(),
        &PartitionDesc::NoPartition
    );
    strategy.get_field_space(&unbound).unwrap();
}

#[test]
fn restricted_store_dimensions_stay_whole() {
    let (_, runtime) = test_runtime(four_pieces());
    let store = runtime.create_restricted_store(
        ElementType::Float64,
        Shape::new(vec![100, 100]),
        vec![Restriction::Restricted, Restriction::Allowed],
    );
    let op = fill_op(&store);
    let strategy = Partitioner::new(std::slice::from_ref(&op), false)
        .partition_stores(&runtime)
        .unwrap();
    match strategy.partition(&store).unwrap() {
        PartitionDesc::Tiling(tiling) => {
            assert_eq!(tiling.color_shape, Shape::new(vec![1, 4]));
            assert_eq!(tiling.tile_shape, Shape::new(vec![100, 25]));
        }
        PartitionDesc::NoPartition => panic!("expected a tiling"),
    }
}

#[test]
fn scalar_output_receives_the_result_future() {
    let (engine, runtime) = test_runtime(RuntimeConfig::default());
    let a = array_store(&runtime, vec![100, 100]);
    let s = runtime.create_scalar_store(ElementType::Float64);

    let mut op = Operation::new_task(
        lattice::test_utils::TEST_LIBRARY_NAME,
        UNARY_OP,
        0,
    );
    op.add_input(a.clone());
    op.add_output(s.clone()).unwrap();
    op.execute(&runtime).unwrap();
    runtime.flush().unwrap();

    assert_eq!(engine.task_launches().len(), 1);
    assert!(matches!(s.storage(), Some(Storage::Future(_))));
}

#[test]
fn copy_argument_counts_are_enforced() {
    let (_, runtime) = test_runtime(RuntimeConfig::default());
    let a = array_store(&runtime, vec![10]);
    let b = array_store(&runtime, vec![10]);

    let mut copy = Operation::new_copy(lattice::test_utils::TEST_LIBRARY_NAME, 0);
    copy.add_input(a.clone());
    copy.add_input(b.clone());
    copy.add_output(a.clone()).unwrap();
    copy.execute(&runtime).unwrap();
    assert!(runtime.flush().is_err());
}

#[test]
fn freed_fields_are_reused_after_a_match() {
    let config = RuntimeConfig::default().with_field_reuse_frequency(2);
    let (engine, runtime) = test_runtime(config);
    let shape = Shape::new(vec![64]);

    let first = runtime
        .allocate_field(shape.clone(), ElementType::Int32)
        .unwrap();
    let key = (first.region(), first.field_id());
    drop(first);

    // The second allocation trips the match; the mock accepts every
    // offered field, so the freed field comes back ordered and is
    // handed out again.
    let second = runtime
        .allocate_field(shape.clone(), ElementType::Int32)
        .unwrap();
    assert_eq!((second.region(), second.field_id()), key);
    assert!(engine
        .calls()
        .iter()
        .any(|call| matches!(call, EngineCall::ConsensusMatch { entries } if !entries.is_empty())));
}

#[test]
fn unmatched_fields_stay_out_of_circulation() {
    let config = RuntimeConfig::default().with_field_reuse_frequency(2);
    let (engine, runtime) = test_runtime(config);
    let shape = Shape::new(vec![64]);

    let first = runtime
        .allocate_field(shape.clone(), ElementType::Int32)
        .unwrap();
    let key = (first.region(), first.field_id());
    drop(first);

    // No shard agreement on the freed field: the allocation must not
    // reuse it.
    engine.queue_match_result(vec![]);
    let second = runtime
        .allocate_field(shape.clone(), ElementType::Int32)
        .unwrap();
    assert_ne!((second.region(), second.field_id()), key);
}

#[test]
fn deferred_detachments_drain_at_destroy() {
    let (engine, runtime) = test_runtime(RuntimeConfig::default());
    let shape = Shape::new(vec![64]);
    let region_field = runtime
        .allocate_field(shape.clone(), ElementType::Int32)
        .unwrap();
    let buffer = ExternalBuffer {
        ptr: 0x4000,
        len: 256,
    };
    runtime
        .attach_external_allocation(
            &ExternalAllocation::Buffer(buffer),
            &region_field,
        )
        .unwrap();

    let detach = Detachment::new(Arc::clone(&region_field), true);
    runtime
        .detach_external_allocation(ExternalAllocation::Buffer(buffer), detach, true)
        .unwrap();
    assert!(!engine
        .calls()
        .iter()
        .any(|call| matches!(call, EngineCall::Detach { .. })));

    runtime.destroy().unwrap();
    assert!(engine
        .calls()
        .iter()
        .any(|call| matches!(call, EngineCall::Detach { unordered: true, .. })));
}

#[test]
fn deferred_detachments_drain_at_the_next_dispatch() {
    let (engine, runtime) = test_runtime(four_pieces());
    let region_field = runtime
        .allocate_field(Shape::new(vec![64]), ElementType::Int32)
        .unwrap();
    let buffer = ExternalBuffer {
        ptr: 0x6000,
        len: 256,
    };
    runtime
        .attach_external_allocation(
            &ExternalAllocation::Buffer(buffer),
            &region_field,
        )
        .unwrap();
    let detach = Detachment::new(Arc::clone(&region_field), true);
    runtime
        .detach_external_allocation(ExternalAllocation::Buffer(buffer), detach, true)
        .unwrap();
    assert!(!engine
        .calls()
        .iter()
        .any(|call| matches!(call, EngineCall::Detach { .. })));

    // The next task dispatch flushes the parked detachment first.
    let a = array_store(&runtime, vec![100, 100]);
    fill_op(&a).execute(&runtime).unwrap();
    runtime.flush().unwrap();

    let calls = engine.calls();
    let detach_at = calls
        .iter()
        .position(|call| matches!(call, EngineCall::Detach { .. }))
        .expect("detach dispatched");
    let task_at = calls
        .iter()
        .position(|call| matches!(call, EngineCall::Task(_)))
        .expect("task dispatched");
    assert!(detach_at < task_at);
}

#[test]
fn pending_detachments_are_awaited_at_destroy() {
    let engine = Arc::new(MockEngine::with_slow_detach());
    let (engine, runtime) = test_runtime_on(engine, RuntimeConfig::default());
    let shape = Shape::new(vec![64]);
    let region_field = runtime
        .allocate_field(shape.clone(), ElementType::Int32)
        .unwrap();
    let buffer = ExternalBuffer {
        ptr: 0x8000,
        len: 128,
    };
    runtime
        .attach_external_allocation(
            &ExternalAllocation::Buffer(buffer),
            &region_field,
        )
        .unwrap();

    let detach = Detachment::new(Arc::clone(&region_field), false);
    drop(region_field);
    runtime
        .detach_external_allocation(ExternalAllocation::Buffer(buffer), detach, false)
        .unwrap();
    assert!(engine
        .calls()
        .iter()
        .any(|call| matches!(call, EngineCall::Detach { .. })));

    // The detachment holds the last strong reference; destroy waits for
    // the future and only then lets the field go.
    runtime.destroy().unwrap();
}

#[test]
fn projections_are_memoized() {
    let (engine, runtime) = test_runtime(RuntimeConfig::default());
    let first = runtime.get_projection(2, &[0, 1]);
    let second = runtime.get_projection(2, &[0, 1]);
    assert_eq!(first, second);
    let other = runtime.get_projection(1, &[0]);
    assert_ne!(first, other);

    let registrations = engine
        .calls()
        .iter()
        .filter(|call| matches!(call, EngineCall::RegisterProjection { .. }))
        .count();
    assert_eq!(registrations, 2);
    let shardings = engine
        .calls()
        .iter()
        .filter(|call| matches!(call, EngineCall::RegisterSharding { .. }))
        .count();
    assert_eq!(shardings, 2);
}

#[test]
fn duplicate_library_names_are_rejected() {
    let (_, runtime) = test_runtime(RuntimeConfig::default());
    let err = runtime
        .register_library(Box::new(lattice::test_utils::TestLibrary))
        .unwrap_err();
    assert!(matches!(err, lattice::LatticeError::DuplicateLibrary(_)));
}

#[test]
fn top_level_runtime_runs_the_postamble() {
    let engine = Arc::new(MockEngine::in_top_level());
    let (engine, runtime) = test_runtime_on(engine, RuntimeConfig::default());
    assert!(engine
        .calls()
        .iter()
        .any(|call| matches!(call, EngineCall::TaskPreamble)));
    runtime.destroy().unwrap();
    assert!(engine
        .calls()
        .iter()
        .any(|call| matches!(call, EngineCall::TaskPostamble)));
}

#[test]
fn destroy_flushes_the_window() {
    let (engine, runtime) = test_runtime(four_pieces());
    let a = array_store(&runtime, vec![100, 100]);
    let b = array_store(&runtime, vec![100, 100]);
    fill_op(&a).execute(&runtime).unwrap();
    unary_op(&a, &b).execute(&runtime).unwrap();
    assert!(engine.task_launches().is_empty());
    runtime.destroy().unwrap();
    assert!(!engine.task_launches().is_empty());
    assert_eq!(runtime.outstanding_ops(), 0);
}

fn run_reference_program(runtime: &Runtime) {
    let a = array_store(runtime, vec![100, 100]);
    let b = array_store(runtime, vec![100, 100]);
    let c = array_store(runtime, vec![100, 100]);
    let d = array_store(runtime, vec![50]);
    let e = array_store(runtime, vec![50]);

    let field = runtime
        .allocate_field(Shape::new(vec![64]), ElementType::Int32)
        .unwrap();
    drop(field);

    fill_op(&a).execute(runtime).unwrap();
    binary_op(&a, &b, &c).execute(runtime).unwrap();
    unary_op(&d, &e).execute(runtime).unwrap();
    fill_op(&b).execute(runtime).unwrap();
    runtime.flush().unwrap();

    let mut reduction = Operation::new_task(
        lattice::test_utils::TEST_LIBRARY_NAME,
        UNARY_OP,
        0,
    );
    reduction.add_input(c);
    reduction
        .add_reduction(
            runtime.create_scalar_store(ElementType::Float64),
            ReductionOpId(0),
        )
        .unwrap();
    reduction.execute(runtime).unwrap();
    runtime.flush().unwrap();
    runtime.destroy().unwrap();
}

/// Two shards replaying the identical program must produce the
/// identical engine call sequence.
#[test]
fn replicated_shards_dispatch_identically() {
    let (engine_one, runtime_one) = test_runtime(four_pieces());
    run_reference_program(&runtime_one);

    let (engine_two, runtime_two) = test_runtime(four_pieces());
    run_reference_program(&runtime_two);

    assert_eq!(engine_one.calls(), engine_two.calls());
}

/// Two ops touching a common store either fuse or dispatch in
/// submission order.
#[test]
fn common_store_ops_dispatch_in_order() {
    let (engine, runtime) = test_runtime(four_pieces());
    let a = array_store(&runtime, vec![100, 100]);
    let b = array_store(&runtime, vec![100, 100]);
    let c = array_store(&runtime, vec![30]);

    // The middle op breaks the fusion run, so the first two ops and the
    // last op launch separately but in order.
    unary_op(&a, &b).execute(&runtime).unwrap();
    unary_op(&c, &c).execute(&runtime).unwrap();
    unary_op(&b, &a).execute(&runtime).unwrap();
    runtime.flush().unwrap();

    let launches = engine.task_launches();
    assert_eq!(launches.len(), 3);
    let first_stores: Vec<_> =
        launches[0].requirements.iter().map(|r| r.store).collect();
    let last_stores: Vec<_> =
        launches[2].requirements.iter().map(|r| r.store).collect();
    assert_eq!(first_stores, vec![a.id(), b.id()]);
    assert_eq!(last_stores, vec![b.id(), a.id()]);
}
