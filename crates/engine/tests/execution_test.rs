//! End-to-end process execution on a worker pool
//!
//! Run with: cargo test -p flownode-engine --test execution_test

mod common;

use std::sync::Arc;

use common::{definition, Harness};
use flownode_engine::model::{BusinessDataRef, DataContainer, FlowNodeKind, ProcessState};
use flownode_engine::state::{state_ids, Breakpoint, InMemoryBreakpoints};
use flownode_engine::{Advance, EngineError, ProcessInputs};
use serde_json::json;
use uuid::Uuid;

fn parallel_split_join() -> serde_json::Value {
    json!({
        "name": "fulfilment",
        "flow_nodes": [
            {"name": "start", "type": "start_event"},
            {"name": "fork", "type": "gateway", "gateway_type": "parallel"},
            {"name": "pack", "type": "automatic_task"},
            {"name": "bill", "type": "automatic_task"},
            {"name": "join", "type": "gateway", "gateway_type": "parallel"},
            {"name": "end", "type": "end_event"}
        ],
        "transitions": [
            {"name": "to_fork", "source": "start", "target": "fork"},
            {"name": "to_pack", "source": "fork", "target": "pack"},
            {"name": "to_bill", "source": "fork", "target": "bill"},
            {"name": "pack_done", "source": "pack", "target": "join"},
            {"name": "bill_done", "source": "bill", "target": "join"},
            {"name": "to_end", "source": "join", "target": "end"}
        ]
    })
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_parallel_gateway_joins_two_branches() {
    let harness = Harness::running(4);
    let definition_id = harness.executor.deploy(definition(parallel_split_join())).unwrap();

    let process_id = harness
        .executor
        .create_and_start_process_instance(definition_id, ProcessInputs::new())
        .await
        .unwrap();
    harness.idle().await;

    let join = harness.node(process_id, "join");
    assert_eq!(join.state_id, state_ids::COMPLETED);
    let gateway = join.gateway().unwrap();
    assert!(gateway.finished);
    assert!(gateway.is_hit_by("pack_done"));
    assert!(gateway.is_hit_by("bill_done"));

    assert_eq!(harness.nodes_named(process_id, "end").len(), 1);
    let process = harness.executor.process_instance(process_id).await.unwrap();
    assert_eq!(process.state, ProcessState::Completed);
    assert!(process.ended_at.is_some());
    assert_eq!(harness.pool.stats().failed, 0);
}

#[test_log::test(tokio::test)]
async fn test_exclusive_gateway_takes_first_matching_transition() {
    let harness = Harness::running(2);
    let definition_id = harness
        .executor
        .deploy(definition(json!({
            "name": "routing",
            "flow_nodes": [
                {"name": "start", "type": "start_event"},
                {"name": "decide", "type": "gateway", "gateway_type": "exclusive"},
                {"name": "manual_review", "type": "automatic_task"},
                {"name": "auto_approve", "type": "automatic_task"},
                {"name": "end", "type": "end_event"}
            ],
            "transitions": [
                {"name": "t0", "source": "start", "target": "decide"},
                {"name": "high", "source": "decide", "target": "manual_review",
                    "condition": "amount > 100"},
                {"name": "low", "source": "decide", "target": "auto_approve", "default": true},
                {"name": "t1", "source": "manual_review", "target": "end"},
                {"name": "t2", "source": "auto_approve", "target": "end"}
            ],
            "data": [{"name": "amount"}]
        })))
        .unwrap();

    let high = harness
        .executor
        .create_and_start_process_instance(definition_id, ProcessInputs::new().with_data("amount", json!(500)))
        .await
        .unwrap();
    let low = harness
        .executor
        .create_and_start_process_instance(definition_id, ProcessInputs::new().with_data("amount", json!(5)))
        .await
        .unwrap();
    harness.idle().await;

    assert_eq!(harness.nodes_named(high, "manual_review").len(), 1);
    assert!(harness.nodes_named(high, "auto_approve").is_empty());
    assert_eq!(harness.nodes_named(low, "auto_approve").len(), 1);
    assert!(harness.nodes_named(low, "manual_review").is_empty());
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_multi_instance_cardinality_three() {
    let harness = Harness::running(4);
    let definition_id = harness
        .executor
        .deploy(definition(json!({
            "name": "notify",
            "flow_nodes": [
                {"name": "start", "type": "start_event"},
                {"name": "send", "type": "automatic_task",
                    "loop_characteristics": {"type": "multi_instance", "loop_cardinality": "3"}},
                {"name": "end", "type": "end_event"}
            ],
            "transitions": [
                {"name": "t1", "source": "start", "target": "send"},
                {"name": "t2", "source": "send", "target": "end"}
            ]
        })))
        .unwrap();

    let process_id = harness
        .executor
        .create_and_start_process_instance(definition_id, ProcessInputs::new())
        .await
        .unwrap();
    harness.idle().await;

    let nodes = harness.nodes_named(process_id, "send");
    let parent = nodes
        .iter()
        .find(|n| matches!(n.kind, FlowNodeKind::MultiInstance(_)))
        .unwrap();
    let payload = parent.multi_instance().unwrap();
    assert_eq!(parent.state_id, state_ids::COMPLETED);
    assert_eq!(payload.loop_cardinality, Some(3));
    assert_eq!(payload.number_of_active_instances, 0);
    assert_eq!(payload.number_of_completed_instances, 3);
    assert_eq!(payload.number_of_terminated_instances, 0);

    let mut counters: Vec<u32> = nodes
        .iter()
        .filter(|n| n.is_child())
        .map(|n| n.loop_counter.unwrap())
        .collect();
    counters.sort_unstable();
    assert_eq!(counters, vec![0, 1, 2]);

    assert_eq!(harness.nodes_named(process_id, "end").len(), 1);
    assert_eq!(
        harness.executor.process_instance(process_id).await.unwrap().state,
        ProcessState::Completed
    );
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_multi_instance_collects_business_output() {
    let harness = Harness::running(4);
    let definition_id = harness
        .executor
        .deploy(definition(json!({
            "name": "invoicing",
            "flow_nodes": [
                {"name": "start", "type": "start_event"},
                {"name": "pay", "type": "automatic_task",
                    "operations": [{"target": "receipt", "expression": "invoice * 10"}],
                    "loop_characteristics": {
                        "type": "multi_instance",
                        "loop_data_input": "invoices",
                        "data_input_item": "invoice",
                        "loop_data_output": "receipts",
                        "data_output_item": "receipt"
                    }},
                {"name": "end", "type": "end_event"}
            ],
            "transitions": [
                {"name": "t1", "source": "start", "target": "pay"},
                {"name": "t2", "source": "pay", "target": "end"}
            ],
            "data": [
                {"name": "invoices", "business": true, "multiple": true, "default_value": [1, 2, 3]},
                {"name": "receipts", "business": true, "multiple": true}
            ]
        })))
        .unwrap();

    let process_id = harness
        .executor
        .create_and_start_process_instance(definition_id, ProcessInputs::new())
        .await
        .unwrap();
    harness.idle().await;

    let Some(BusinessDataRef::Multiple(mut receipts)) = harness
        .store
        .business_data(DataContainer::Process(process_id), "receipts")
    else {
        panic!("receipts should be a reference list");
    };
    receipts.sort_unstable();
    assert_eq!(receipts, vec![10, 20, 30]);
}

#[test_log::test(tokio::test)]
async fn test_standard_loop_repeats_while_condition_holds() {
    let harness = Harness::running(2);
    let definition_id = harness
        .executor
        .deploy(definition(json!({
            "name": "polling",
            "flow_nodes": [
                {"name": "start", "type": "start_event"},
                {"name": "poll", "type": "automatic_task",
                    "operations": [{"target": "attempts", "expression": "attempts + 1"}],
                    "loop_characteristics": {"type": "standard", "loop_condition": "loopCounter < 3"}},
                {"name": "end", "type": "end_event"}
            ],
            "transitions": [
                {"name": "t1", "source": "start", "target": "poll"},
                {"name": "t2", "source": "poll", "target": "end"}
            ],
            "data": [{"name": "attempts", "default_value": 0}]
        })))
        .unwrap();

    let process_id = harness
        .executor
        .create_and_start_process_instance(definition_id, ProcessInputs::new())
        .await
        .unwrap();
    harness.idle().await;

    assert_eq!(
        harness.store.data(DataContainer::Process(process_id), "attempts"),
        Some(json!(3))
    );
    let parent = harness
        .nodes_named(process_id, "poll")
        .into_iter()
        .find(|n| !n.is_child())
        .unwrap();
    assert_eq!(parent.loop_payload().unwrap().loop_count, 3);
    assert_eq!(
        harness.executor.process_instance(process_id).await.unwrap().state,
        ProcessState::Completed
    );
}

fn signal_wait() -> serde_json::Value {
    json!({
        "name": "release",
        "flow_nodes": [
            {"name": "start", "type": "start_event"},
            {"name": "wait_go", "type": "intermediate_catch_event",
                "trigger": {"kind": "signal", "signal_name": "go"}},
            {"name": "end", "type": "end_event"}
        ],
        "transitions": [
            {"name": "t1", "source": "start", "target": "wait_go"},
            {"name": "t2", "source": "wait_go", "target": "end"}
        ]
    })
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn test_signal_releases_every_waiter() {
    let harness = Harness::running(2);
    let definition_id = harness.executor.deploy(definition(signal_wait())).unwrap();

    let mut processes = Vec::new();
    for _ in 0..2 {
        processes.push(
            harness
                .executor
                .create_and_start_process_instance(definition_id, ProcessInputs::new())
                .await
                .unwrap(),
        );
    }
    harness.idle().await;
    for process_id in &processes {
        assert_eq!(harness.node(*process_id, "wait_go").state_id, state_ids::WAITING);
    }

    assert_eq!(harness.executor.throw_signal("go").await.unwrap(), 2);
    harness.idle().await;
    for process_id in &processes {
        assert_eq!(
            harness.executor.process_instance(*process_id).await.unwrap().state,
            ProcessState::Completed
        );
    }

    assert_eq!(harness.executor.throw_signal("go").await.unwrap(), 0);
}

#[test_log::test(tokio::test)]
async fn test_abort_preempts_waiting_nodes() {
    let harness = Harness::running(2);
    let definition_id = harness
        .executor
        .deploy(definition(json!({
            "name": "approval",
            "flow_nodes": [
                {"name": "start", "type": "start_event"},
                {"name": "fork", "type": "gateway", "gateway_type": "parallel"},
                {"name": "review", "type": "human_task"},
                {"name": "wait_go", "type": "intermediate_catch_event",
                    "trigger": {"kind": "signal", "signal_name": "go"}},
                {"name": "end", "type": "end_event"}
            ],
            "transitions": [
                {"name": "t0", "source": "start", "target": "fork"},
                {"name": "t1", "source": "fork", "target": "review"},
                {"name": "t2", "source": "fork", "target": "wait_go"},
                {"name": "t3", "source": "review", "target": "end"},
                {"name": "t4", "source": "wait_go", "target": "end"}
            ]
        })))
        .unwrap();

    let process_id = harness
        .executor
        .create_and_start_process_instance(definition_id, ProcessInputs::new())
        .await
        .unwrap();
    harness.idle().await;
    assert_eq!(harness.node(process_id, "review").state_id, state_ids::READY);
    assert_eq!(harness.store.waiting_events().len(), 1);

    let interrupted = harness.executor.abort_process_instance(process_id).await.unwrap();
    assert_eq!(interrupted, 2);
    harness.idle().await;

    let review = harness.node(process_id, "review");
    assert_eq!(review.state_id, state_ids::ABORTED);
    assert_eq!(harness.node(process_id, "wait_go").state_id, state_ids::ABORTED);
    assert!(harness.nodes_named(process_id, "end").is_empty());
    assert!(harness.store.waiting_events().is_empty());
    assert_eq!(
        harness.executor.process_instance(process_id).await.unwrap().state,
        ProcessState::Aborted
    );

    // Late work for an aborted node is a no-op
    assert_eq!(
        harness.executor.advance_flow_node(review.id).await.unwrap(),
        Advance::Skipped
    );
    assert_eq!(harness.executor.throw_signal("go").await.unwrap(), 0);

    // Aborting again is a no-op; cancelling an aborted process is not allowed
    assert_eq!(harness.executor.abort_process_instance(process_id).await.unwrap(), 0);
    let err = harness
        .executor
        .cancel_process_instance(process_id)
        .await
        .unwrap_err();
    assert!(matches!(err.root_cause(), EngineError::Consistency(_)));
}

#[test_log::test(tokio::test)]
async fn test_terminate_end_event_aborts_remaining_branches() {
    let harness = Harness::running(2);
    let definition_id = harness
        .executor
        .deploy(definition(json!({
            "name": "race",
            "flow_nodes": [
                {"name": "start", "type": "start_event"},
                {"name": "fork", "type": "gateway", "gateway_type": "parallel"},
                {"name": "review", "type": "human_task"},
                {"name": "stop", "type": "end_event", "terminate": true},
                {"name": "end", "type": "end_event"}
            ],
            "transitions": [
                {"name": "t0", "source": "start", "target": "fork"},
                {"name": "t1", "source": "fork", "target": "review"},
                {"name": "t2", "source": "fork", "target": "stop"},
                {"name": "t3", "source": "review", "target": "end"}
            ]
        })))
        .unwrap();

    let process_id = harness
        .executor
        .create_and_start_process_instance(definition_id, ProcessInputs::new())
        .await
        .unwrap();
    harness.idle().await;

    assert_eq!(harness.node(process_id, "stop").state_id, state_ids::COMPLETED);
    assert_eq!(harness.node(process_id, "review").state_id, state_ids::ABORTED);
    assert_eq!(
        harness.executor.process_instance(process_id).await.unwrap().state,
        ProcessState::Completed
    );
}

#[test_log::test(tokio::test)]
async fn test_breakpoint_parks_node_until_resumed() {
    let breakpoints = Arc::new(InMemoryBreakpoints::new());
    let harness = Harness::with(2, |executor| executor.with_breakpoints(breakpoints.clone()));
    harness.pool.start().unwrap();

    let process_definition = definition(json!({
        "name": "debugged",
        "flow_nodes": [
            {"name": "start", "type": "start_event"},
            {"name": "compute", "type": "automatic_task",
                "operations": [{"target": "result", "expression": "6 * 7"}]},
            {"name": "end", "type": "end_event"}
        ],
        "transitions": [
            {"name": "t1", "source": "start", "target": "compute"},
            {"name": "t2", "source": "compute", "target": "end"}
        ],
        "data": [{"name": "result"}]
    }));
    breakpoints.add(Breakpoint {
        id: Uuid::now_v7(),
        process_definition_id: process_definition.id,
        root_process_instance_id: None,
        flow_node_name: "compute".into(),
        state_id: state_ids::EXECUTING,
        interrupted_state_id: state_ids::INTERRUPTED,
    });
    let definition_id = harness.executor.deploy(process_definition).unwrap();

    let process_id = harness
        .executor
        .create_and_start_process_instance(definition_id, ProcessInputs::new())
        .await
        .unwrap();
    harness.idle().await;

    let compute = harness.node(process_id, "compute");
    assert_eq!(compute.state_id, state_ids::INTERRUPTED);
    assert_eq!(
        harness.store.data(DataContainer::Process(process_id), "result"),
        Some(json!(null))
    );

    let advance = harness.executor.advance_flow_node(compute.id).await.unwrap();
    assert_eq!(
        advance,
        Advance::Transitioned {
            from: state_ids::INTERRUPTED,
            to: state_ids::EXECUTING
        }
    );
    harness.idle().await;

    assert_eq!(
        harness.store.data(DataContainer::Process(process_id), "result"),
        Some(json!(42))
    );
    assert_eq!(
        harness.executor.process_instance(process_id).await.unwrap().state,
        ProcessState::Completed
    );
}

#[test_log::test(tokio::test)]
async fn test_finished_process_can_be_deleted() {
    let harness = Harness::running(2);
    let definition_id = harness.executor.deploy(definition(parallel_split_join())).unwrap();
    let process_id = harness
        .executor
        .create_and_start_process_instance(definition_id, ProcessInputs::new())
        .await
        .unwrap();
    harness.idle().await;

    harness.executor.delete_process_instance(process_id).await.unwrap();
    assert!(harness.store.process_instance(process_id).is_none());
    assert!(harness.store.flow_nodes_of(process_id).is_empty());
    assert!(harness.executor.process_instance(process_id).await.is_err());
}
