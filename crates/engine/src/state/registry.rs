//! Catalogue of flow node execution states
//!
//! The registry is an immutable table built once at startup and shared
//! through an `Arc`. It maps every [`NodeCategory`] to its ordered state
//! chains (normal, aborting, cancelling).

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a flow node state
pub type StateId = u32;

/// Well-known state identifiers
pub mod state_ids {
    use super::StateId;

    pub const INITIALIZING: StateId = 0;
    pub const READY: StateId = 1;
    pub const EXECUTING: StateId = 2;
    pub const WAITING: StateId = 3;
    pub const GATEWAY_WAITING: StateId = 4;
    pub const EXECUTING_CHILDREN: StateId = 5;
    pub const COMPLETING: StateId = 6;
    pub const COMPLETED: StateId = 7;
    pub const ABORTING: StateId = 8;
    pub const ABORTED: StateId = 9;
    pub const CANCELLING: StateId = 10;
    pub const CANCELLED: StateId = 11;
    pub const INTERRUPTED: StateId = 12;
}

use state_ids::*;

/// A named execution state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowNodeState {
    pub id: StateId,
    pub name: &'static str,

    /// Nothing advances a stable node except an external call
    pub stable: bool,

    /// Terminal nodes never transition again
    pub terminal: bool,

    /// Part of an abort/cancel/breakpoint path
    pub interrupting: bool,
}

impl FlowNodeState {
    const fn new(
        id: StateId,
        name: &'static str,
        stable: bool,
        terminal: bool,
        interrupting: bool,
    ) -> Self {
        Self {
            id,
            name,
            stable,
            terminal,
            interrupting,
        }
    }
}

impl fmt::Display for FlowNodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.id)
    }
}

const STATES: [FlowNodeState; 13] = [
    FlowNodeState::new(INITIALIZING, "initializing", false, false, false),
    FlowNodeState::new(READY, "ready", true, false, false),
    FlowNodeState::new(EXECUTING, "executing", false, false, false),
    FlowNodeState::new(WAITING, "waiting", true, false, false),
    FlowNodeState::new(GATEWAY_WAITING, "gateway_waiting", false, false, false),
    FlowNodeState::new(EXECUTING_CHILDREN, "executing_children", true, false, false),
    FlowNodeState::new(COMPLETING, "completing", false, false, false),
    FlowNodeState::new(COMPLETED, "completed", true, true, false),
    FlowNodeState::new(ABORTING, "aborting", false, false, true),
    FlowNodeState::new(ABORTED, "aborted", true, true, true),
    FlowNodeState::new(CANCELLING, "cancelling", false, false, true),
    FlowNodeState::new(CANCELLED, "cancelled", true, true, true),
    FlowNodeState::new(INTERRUPTED, "interrupted", true, false, true),
];

/// Node categories that own a state chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeCategory {
    AutomaticTask,
    HumanTask,
    CallActivity,
    Gateway,
    Event,
    MultiInstance,
    Loop,
}

impl NodeCategory {
    pub const ALL: [NodeCategory; 7] = [
        NodeCategory::AutomaticTask,
        NodeCategory::HumanTask,
        NodeCategory::CallActivity,
        NodeCategory::Gateway,
        NodeCategory::Event,
        NodeCategory::MultiInstance,
        NodeCategory::Loop,
    ];
}

impl fmt::Display for NodeCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AutomaticTask => "automatic_task",
            Self::HumanTask => "human_task",
            Self::CallActivity => "call_activity",
            Self::Gateway => "gateway",
            Self::Event => "event",
            Self::MultiInstance => "multi_instance",
            Self::Loop => "loop",
        };
        f.write_str(name)
    }
}

/// Ordered state sequences of one category
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChain {
    pub normal: Vec<StateId>,
    pub aborting: Vec<StateId>,
    pub cancelling: Vec<StateId>,
}

impl StateChain {
    fn new(normal: &[StateId]) -> Self {
        Self {
            normal: normal.to_vec(),
            aborting: vec![ABORTING, ABORTED],
            cancelling: vec![CANCELLING, CANCELLED],
        }
    }

    /// State following `current` in `sequence`
    pub fn after(sequence: &[StateId], current: StateId) -> Option<StateId> {
        let position = sequence.iter().position(|id| *id == current)?;
        sequence.get(position + 1).copied()
    }

    /// First state of the normal chain
    pub fn initial(&self) -> StateId {
        self.normal.first().copied().unwrap_or(INITIALIZING)
    }
}

/// Immutable lookup table of states and per-category chains
#[derive(Debug, Clone)]
pub struct StateRegistry {
    states: HashMap<StateId, FlowNodeState>,
    chains: HashMap<NodeCategory, StateChain>,
}

impl Default for StateRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl StateRegistry {
    /// Build the standard catalogue
    pub fn standard() -> Self {
        let states = STATES.iter().map(|s| (s.id, s.clone())).collect();

        let task = [INITIALIZING, EXECUTING, COMPLETING, COMPLETED];
        let mut chains = HashMap::new();
        chains.insert(NodeCategory::AutomaticTask, StateChain::new(&task));
        chains.insert(NodeCategory::CallActivity, StateChain::new(&task));
        chains.insert(
            NodeCategory::HumanTask,
            StateChain::new(&[INITIALIZING, READY, EXECUTING, COMPLETING, COMPLETED]),
        );
        chains.insert(
            NodeCategory::Gateway,
            StateChain::new(&[INITIALIZING, GATEWAY_WAITING, COMPLETED]),
        );
        chains.insert(
            NodeCategory::Event,
            StateChain::new(&[INITIALIZING, WAITING, EXECUTING, COMPLETED]),
        );
        let children = [INITIALIZING, EXECUTING_CHILDREN, COMPLETING, COMPLETED];
        chains.insert(NodeCategory::MultiInstance, StateChain::new(&children));
        chains.insert(NodeCategory::Loop, StateChain::new(&children));

        Self { states, chains }
    }

    /// Look up a state by id
    pub fn state(&self, id: StateId) -> Option<&FlowNodeState> {
        self.states.get(&id)
    }

    /// Look up the chains of a category
    pub fn chain(&self, category: NodeCategory) -> Option<&StateChain> {
        self.chains.get(&category)
    }

    /// Entry state for newly created instances of a category
    pub fn initial_state(&self, category: NodeCategory) -> Option<&FlowNodeState> {
        self.chain(category).and_then(|c| self.state(c.initial()))
    }
}
