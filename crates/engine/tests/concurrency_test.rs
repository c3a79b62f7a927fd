//! Properties that must hold while many workers race on the same process
//!
//! Run with: cargo test -p flownode-engine --test concurrency_test

mod common;

use std::sync::Arc;

use common::{definition, Harness};
use flownode_engine::error::context_keys;
use flownode_engine::events::CorrelationOutcome;
use flownode_engine::model::{MessageKey, ProcessState};
use flownode_engine::state::state_ids;
use flownode_engine::{
    EngineConfig, EngineError, InMemoryFlowNodeStore, ProcessExecutor, ProcessInputs, RetryPolicy,
    WorkQueue,
};
use futures::future::join_all;
use serde_json::json;
use std::time::Duration;

const BRANCHES: usize = 8;

fn wide_join() -> serde_json::Value {
    let mut flow_nodes = vec![
        json!({"name": "start", "type": "start_event"}),
        json!({"name": "fork", "type": "gateway", "gateway_type": "parallel"}),
        json!({"name": "join", "type": "gateway", "gateway_type": "parallel"}),
        json!({"name": "end", "type": "end_event"}),
    ];
    let mut transitions = vec![
        json!({"name": "to_fork", "source": "start", "target": "fork"}),
        json!({"name": "to_end", "source": "join", "target": "end"}),
    ];
    for i in 0..BRANCHES {
        flow_nodes.push(json!({"name": format!("step_{i}"), "type": "automatic_task"}));
        transitions.push(json!({
            "name": format!("out_{i}"),
            "source": "fork",
            "target": format!("step_{i}")
        }));
        transitions.push(json!({
            "name": format!("in_{i}"),
            "source": format!("step_{i}"),
            "target": "join"
        }));
    }
    json!({"name": "fan", "flow_nodes": flow_nodes, "transitions": transitions})
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 8))]
async fn test_gateway_fires_once_under_concurrent_arrivals() {
    let harness = Harness::running(BRANCHES);
    let definition_id = harness.executor.deploy(definition(wide_join())).unwrap();

    let mut processes = Vec::new();
    for _ in 0..4 {
        processes.push(
            harness
                .executor
                .create_and_start_process_instance(definition_id, ProcessInputs::new())
                .await
                .unwrap(),
        );
    }
    harness.idle().await;

    for process_id in processes {
        let join = harness.node(process_id, "join");
        let gateway = join.gateway().unwrap();
        assert!(gateway.finished);
        assert_eq!(gateway.hit_bys.len(), BRANCHES);
        assert_eq!(join.state_id, state_ids::COMPLETED);
        assert_eq!(harness.nodes_named(process_id, "end").len(), 1);
        assert_eq!(
            harness.executor.process_instance(process_id).await.unwrap().state,
            ProcessState::Completed
        );
    }
    assert_eq!(harness.pool.stats().failed, 0);
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_message_is_delivered_at_most_once() {
    let harness = Harness::running(2);
    let definition_id = harness
        .executor
        .deploy(definition(json!({
            "name": "orders",
            "flow_nodes": [
                {"name": "start", "type": "start_event"},
                {"name": "await_payment", "type": "intermediate_catch_event",
                    "trigger": {"kind": "message", "message_name": "paid",
                        "correlations": [{"key": "order", "expression": "order_id"}]}},
                {"name": "end", "type": "end_event"}
            ],
            "transitions": [
                {"name": "t1", "source": "start", "target": "await_payment"},
                {"name": "t2", "source": "await_payment", "target": "end"}
            ],
            "data": [{"name": "order_id"}]
        })))
        .unwrap();

    let process_id = harness
        .executor
        .create_and_start_process_instance(definition_id, ProcessInputs::new().with_data("order_id", json!(7)))
        .await
        .unwrap();
    harness.idle().await;
    assert_eq!(harness.store.waiting_events().len(), 1);

    let key = MessageKey::new("paid", "orders").with_correlation("order", json!(7));
    let sends = (0..8).map(|_| {
        let executor = Arc::clone(&harness.executor);
        let key = key.clone();
        tokio::spawn(async move { executor.send_message(key).await })
    });
    let outcomes: Vec<CorrelationOutcome> = join_all(sends)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    let delivered = outcomes
        .iter()
        .filter(|o| matches!(o, CorrelationOutcome::Delivered { .. }))
        .count();
    assert_eq!(delivered, 1);
    assert_eq!(outcomes.len() - delivered, 7);

    harness.idle().await;
    assert_eq!(
        harness.executor.process_instance(process_id).await.unwrap().state,
        ProcessState::Completed
    );

    let stranger = MessageKey::new("paid", "orders").with_correlation("order", json!(8));
    assert_eq!(
        harness.executor.send_message(stranger).await.unwrap(),
        CorrelationOutcome::NotFound
    );
}

#[test_log::test(tokio::test)]
async fn test_unavailable_store_requeues_work() {
    let harness = Harness::new(1);
    let definition_id = harness
        .executor
        .deploy(definition(json!({
            "name": "simple",
            "flow_nodes": [
                {"name": "start", "type": "start_event"},
                {"name": "end", "type": "end_event"}
            ],
            "transitions": [{"name": "t1", "source": "start", "target": "end"}]
        })))
        .unwrap();
    let process_id = harness
        .executor
        .create_and_start_process_instance(definition_id, ProcessInputs::new())
        .await
        .unwrap();

    harness.store.inject_unavailable(1);
    harness.pool.start().unwrap();
    harness.idle().await;

    let stats = harness.pool.stats();
    assert_eq!(stats.requeued, 1);
    assert_eq!(stats.failed, 0);
    assert_eq!(
        harness.executor.process_instance(process_id).await.unwrap().state,
        ProcessState::Completed
    );
    harness.pool.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_conflicts_retry_then_give_up_with_context() {
    let store = InMemoryFlowNodeStore::new();
    let (queue, _receiver) = WorkQueue::new();
    let executor = ProcessExecutor::new(
        Arc::new(store.clone()),
        Arc::new(queue),
        EngineConfig::default()
            .with_tenant("acme")
            .with_retry(RetryPolicy::new(2, Duration::from_millis(1), 2.0)),
    );
    let definition_id = executor
        .deploy(definition(json!({
            "name": "simple",
            "flow_nodes": [{"name": "start", "type": "start_event"}]
        })))
        .unwrap();

    // Two conflicts fit within two retries
    store.inject_conflicts(2);
    executor
        .create_and_start_process_instance(definition_id, ProcessInputs::new())
        .await
        .unwrap();
    assert_eq!(store.process_instance_count(), 1);

    store.inject_conflicts(3);
    let err = executor
        .create_and_start_process_instance(definition_id, ProcessInputs::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err.root_cause(),
        EngineError::Store(e) if e.is_conflict()
    ));
    let context = err.context().unwrap();
    assert_eq!(context.get(context_keys::TENANT), Some("acme"));
    assert!(context.get(context_keys::HOSTNAME).is_some());
    assert!(context.get(context_keys::DESCRIPTION).is_some());
    assert_eq!(store.process_instance_count(), 1);
}
