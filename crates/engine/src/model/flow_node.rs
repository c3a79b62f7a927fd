//! Flow node instance record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::{state_ids, FlowNodeState, NodeCategory, StateId};

/// Whether a node follows its normal chain or an interrupting one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateCategory {
    Normal,
    Aborting,
    Cancelling,
}

impl std::fmt::Display for StateCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Aborting => write!(f, "aborting"),
            Self::Cancelling => write!(f, "cancelling"),
        }
    }
}

/// Gateway join/split behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayType {
    Exclusive,
    Inclusive,
    Parallel,
    Complex,
}

/// Event flavour of an event node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Start,
    End,
    IntermediateCatch,
    IntermediateThrow,
}

/// Join state of a converging gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayPayload {
    pub gateway_type: GatewayType,

    /// Incoming transition names that delivered a token, in arrival order
    #[serde(default)]
    pub hit_bys: Vec<String>,

    /// Set together with the firing decision
    #[serde(default)]
    pub finished: bool,
}

impl GatewayPayload {
    pub fn new(gateway_type: GatewayType) -> Self {
        Self {
            gateway_type,
            hit_bys: Vec::new(),
            finished: false,
        }
    }

    pub fn is_hit_by(&self, transition: &str) -> bool {
        self.hit_bys.iter().any(|t| t == transition)
    }

    pub fn hit(&mut self, transition: impl Into<String>) {
        self.hit_bys.push(transition.into());
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

/// Fan-out/fan-in counters of a multi-instance activity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiInstancePayload {
    pub sequential: bool,

    /// Resolved cardinality when it was given statically
    pub loop_cardinality: Option<u32>,

    pub number_of_active_instances: u32,
    pub number_of_completed_instances: u32,
    pub number_of_terminated_instances: u32,
}

impl MultiInstancePayload {
    pub fn new(sequential: bool) -> Self {
        Self {
            sequential,
            loop_cardinality: None,
            number_of_active_instances: 0,
            number_of_completed_instances: 0,
            number_of_terminated_instances: 0,
        }
    }

    /// Children created so far
    pub fn created(&self) -> u32 {
        self.number_of_active_instances
            + self.number_of_completed_instances
            + self.number_of_terminated_instances
    }
}

/// Iteration state of a standard loop activity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopPayload {
    /// Iterations started
    pub loop_count: u32,
    pub loop_max: Option<u32>,
    pub number_of_active_instances: u32,

    /// No further iteration will be started
    pub exhausted: bool,
}

impl LoopPayload {
    pub fn new(loop_max: Option<u32>) -> Self {
        Self {
            loop_count: 0,
            loop_max,
            number_of_active_instances: 0,
            exhausted: false,
        }
    }

    pub fn below_max(&self) -> bool {
        self.loop_max.map_or(true, |max| self.loop_count < max)
    }
}

/// Kind-specific part of a flow node instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowNodeKind {
    AutomaticTask,
    HumanTask,
    CallActivity,
    Event { event_type: EventType },
    Gateway(GatewayPayload),
    MultiInstance(MultiInstancePayload),
    Loop(LoopPayload),
}

impl FlowNodeKind {
    pub fn category(&self) -> NodeCategory {
        match self {
            Self::AutomaticTask => NodeCategory::AutomaticTask,
            Self::HumanTask => NodeCategory::HumanTask,
            Self::CallActivity => NodeCategory::CallActivity,
            Self::Event { .. } => NodeCategory::Event,
            Self::Gateway(_) => NodeCategory::Gateway,
            Self::MultiInstance(_) => NodeCategory::MultiInstance,
            Self::Loop(_) => NodeCategory::Loop,
        }
    }

    /// States of the category chain this kind passes over
    pub fn skips_state(&self, state: StateId) -> bool {
        match self {
            Self::Event { event_type } => {
                state == state_ids::WAITING
                    && matches!(
                        event_type,
                        EventType::Start | EventType::End | EventType::IntermediateThrow
                    )
            }
            _ => false,
        }
    }

    /// Whether an abort/cancel of the process must schedule this node.
    ///
    /// Unstable nodes already have pending work that will observe the new
    /// category. Gateways are always scheduled because a blocked gateway has
    /// no pending work. Multi-instance and loop parents are advanced by their
    /// last terminating child instead.
    pub fn must_execute_on_abort_or_cancel(&self, stable: bool) -> bool {
        match self {
            Self::Gateway(_) => true,
            Self::MultiInstance(_) | Self::Loop(_) => false,
            _ => stable,
        }
    }
}

/// Runtime instance of one flow node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowNodeInstance {
    pub id: Uuid,
    pub process_definition_id: Uuid,

    /// Name of the node in the process definition
    pub name: String,

    pub root_process_instance_id: Uuid,
    pub parent_process_instance_id: Uuid,

    /// Owning multi-instance or loop activity, for child instances
    pub parent_activity_instance_id: Option<Uuid>,

    pub kind: FlowNodeKind,

    pub state_id: StateId,
    pub state_name: String,
    pub previous_state_id: Option<StateId>,
    pub stable: bool,
    pub terminal: bool,
    pub state_category: StateCategory,

    pub token_count: u32,

    /// Index of a multi-instance or loop child
    pub loop_counter: Option<u32>,

    pub reached_state_at: DateTime<Utc>,
    pub last_update_at: DateTime<Utc>,

    pub executed_by: Option<String>,
    pub executed_by_substitute: Option<String>,
}

impl FlowNodeInstance {
    /// Create an instance sitting in `initial`
    pub fn new(
        process_definition_id: Uuid,
        name: impl Into<String>,
        root_process_instance_id: Uuid,
        parent_process_instance_id: Uuid,
        kind: FlowNodeKind,
        initial: &FlowNodeState,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            process_definition_id,
            name: name.into(),
            root_process_instance_id,
            parent_process_instance_id,
            parent_activity_instance_id: None,
            kind,
            state_id: initial.id,
            state_name: initial.name.to_string(),
            previous_state_id: None,
            stable: initial.stable,
            terminal: initial.terminal,
            state_category: StateCategory::Normal,
            token_count: 1,
            loop_counter: None,
            reached_state_at: now,
            last_update_at: now,
            executed_by: None,
            executed_by_substitute: None,
        }
    }

    /// Attach the instance to a multi-instance or loop parent
    pub fn with_parent_activity(mut self, parent: Uuid, loop_counter: u32) -> Self {
        self.parent_activity_instance_id = Some(parent);
        self.loop_counter = Some(loop_counter);
        self
    }

    /// Move to `state`, remembering where the node came from
    pub fn set_state(&mut self, state: &FlowNodeState) {
        let now = Utc::now();
        self.previous_state_id = Some(self.state_id);
        self.state_id = state.id;
        self.state_name = state.name.to_string();
        self.stable = state.stable;
        self.terminal = state.terminal;
        self.reached_state_at = now;
        self.last_update_at = now;
    }

    /// Switch to an interrupting category; a no-op when already interrupted
    pub fn interrupt(&mut self, category: StateCategory) -> bool {
        if self.terminal || self.state_category != StateCategory::Normal {
            return false;
        }
        self.state_category = category;
        self.last_update_at = Utc::now();
        true
    }

    pub fn is_child(&self) -> bool {
        self.parent_activity_instance_id.is_some()
    }

    pub fn gateway(&self) -> Option<&GatewayPayload> {
        match &self.kind {
            FlowNodeKind::Gateway(payload) => Some(payload),
            _ => None,
        }
    }

    pub fn gateway_mut(&mut self) -> Option<&mut GatewayPayload> {
        match &mut self.kind {
            FlowNodeKind::Gateway(payload) => Some(payload),
            _ => None,
        }
    }

    pub fn multi_instance(&self) -> Option<&MultiInstancePayload> {
        match &self.kind {
            FlowNodeKind::MultiInstance(payload) => Some(payload),
            _ => None,
        }
    }

    pub fn multi_instance_mut(&mut self) -> Option<&mut MultiInstancePayload> {
        match &mut self.kind {
            FlowNodeKind::MultiInstance(payload) => Some(payload),
            _ => None,
        }
    }

    pub fn loop_payload(&self) -> Option<&LoopPayload> {
        match &self.kind {
            FlowNodeKind::Loop(payload) => Some(payload),
            _ => None,
        }
    }

    pub fn loop_payload_mut(&mut self) -> Option<&mut LoopPayload> {
        match &mut self.kind {
            FlowNodeKind::Loop(payload) => Some(payload),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateRegistry;

    fn node(kind: FlowNodeKind) -> FlowNodeInstance {
        let registry = StateRegistry::standard();
        let initial = registry.initial_state(kind.category()).unwrap().clone();
        let process = Uuid::now_v7();
        FlowNodeInstance::new(Uuid::now_v7(), "step", process, process, kind, &initial)
    }

    #[test]
    fn test_abort_policy_per_kind() {
        let gateway = FlowNodeKind::Gateway(GatewayPayload::new(GatewayType::Parallel));
        assert!(gateway.must_execute_on_abort_or_cancel(false));
        assert!(gateway.must_execute_on_abort_or_cancel(true));

        let multi = FlowNodeKind::MultiInstance(MultiInstancePayload::new(false));
        assert!(!multi.must_execute_on_abort_or_cancel(true));
        assert!(!FlowNodeKind::Loop(LoopPayload::new(None)).must_execute_on_abort_or_cancel(true));

        assert!(FlowNodeKind::HumanTask.must_execute_on_abort_or_cancel(true));
        assert!(!FlowNodeKind::AutomaticTask.must_execute_on_abort_or_cancel(false));
    }

    #[test]
    fn test_throw_events_skip_waiting() {
        let end = FlowNodeKind::Event {
            event_type: EventType::End,
        };
        let catch = FlowNodeKind::Event {
            event_type: EventType::IntermediateCatch,
        };
        assert!(end.skips_state(state_ids::WAITING));
        assert!(!catch.skips_state(state_ids::WAITING));
        assert!(!end.skips_state(state_ids::EXECUTING));
    }

    #[test]
    fn test_set_state_tracks_previous() {
        let registry = StateRegistry::standard();
        let mut task = node(FlowNodeKind::AutomaticTask);
        assert_eq!(task.state_id, state_ids::INITIALIZING);

        task.set_state(registry.state(state_ids::EXECUTING).unwrap());
        assert_eq!(task.previous_state_id, Some(state_ids::INITIALIZING));
        assert_eq!(task.state_name, "executing");
        assert!(!task.stable);

        task.set_state(registry.state(state_ids::COMPLETED).unwrap());
        assert!(task.terminal);
    }

    #[test]
    fn test_interrupt_only_once() {
        let mut task = node(FlowNodeKind::HumanTask);
        assert!(task.interrupt(StateCategory::Aborting));
        assert!(!task.interrupt(StateCategory::Cancelling));
        assert_eq!(task.state_category, StateCategory::Aborting);
    }

    #[test]
    fn test_multi_instance_created() {
        let mut payload = MultiInstancePayload::new(true);
        payload.number_of_active_instances = 1;
        payload.number_of_completed_instances = 2;
        payload.number_of_terminated_instances = 1;
        assert_eq!(payload.created(), 4);
    }

    #[test]
    fn test_kind_serde_shape() {
        let kind = FlowNodeKind::Gateway(GatewayPayload::new(GatewayType::Inclusive));
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["type"], "gateway");
        assert_eq!(json["gateway_type"], "inclusive");
        let back: FlowNodeKind = serde_json::from_value(json).unwrap();
        assert_eq!(back, kind);
    }
}
