//! Process definition model
//!
//! Definitions are produced by an external parser/modeler and handed to the
//! engine as serde values. The engine only reads them.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::flow_node::{EventType, GatewayType};
use crate::error::EngineError;

/// A deployable process graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessDefinition {
    #[serde(default = "Uuid::now_v7")]
    pub id: Uuid,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub flow_nodes: Vec<FlowNodeDefinition>,
    #[serde(default)]
    pub transitions: Vec<TransitionDefinition>,
    #[serde(default)]
    pub data: Vec<DataDefinition>,
}

fn default_version() -> String {
    "1.0".to_string()
}

/// One node of the graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowNodeDefinition {
    pub name: String,
    #[serde(flatten)]
    pub kind: FlowNodeDefinitionKind,
    #[serde(default)]
    pub loop_characteristics: Option<LoopCharacteristics>,

    /// Data assignments run when the node executes
    #[serde(default)]
    pub operations: Vec<DataOperation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowNodeDefinitionKind {
    StartEvent,
    EndEvent {
        #[serde(default)]
        terminate: bool,
    },
    AutomaticTask,
    HumanTask,
    CallActivity,
    Gateway {
        gateway_type: GatewayType,
        /// Firing rule of a complex gateway
        #[serde(default)]
        activation_condition: Option<String>,
    },
    IntermediateCatchEvent {
        trigger: EventTrigger,
    },
    IntermediateThrowEvent {
        trigger: EventTrigger,
    },
}

impl FlowNodeDefinitionKind {
    pub fn event_type(&self) -> Option<EventType> {
        match self {
            Self::StartEvent => Some(EventType::Start),
            Self::EndEvent { .. } => Some(EventType::End),
            Self::IntermediateCatchEvent { .. } => Some(EventType::IntermediateCatch),
            Self::IntermediateThrowEvent { .. } => Some(EventType::IntermediateThrow),
            _ => None,
        }
    }

    pub fn gateway_type(&self) -> Option<GatewayType> {
        match self {
            Self::Gateway { gateway_type, .. } => Some(*gateway_type),
            _ => None,
        }
    }
}

/// What a catch event waits for or a throw event emits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventTrigger {
    Message(MessageTrigger),
    Signal { signal_name: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageTrigger {
    pub message_name: String,

    /// Receiving process name; required on throw events
    #[serde(default)]
    pub target_process: Option<String>,

    /// Receiving node name; any catching node when absent
    #[serde(default)]
    pub target_flow_node: Option<String>,

    #[serde(default)]
    pub correlations: Vec<CorrelationDefinition>,
}

/// A correlation key whose value is computed from the node scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationDefinition {
    pub key: String,
    pub expression: String,
}

/// Sequence flow between two nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionDefinition {
    pub name: String,
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub default: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoopCharacteristics {
    Standard(StandardLoop),
    MultiInstance(MultiInstanceLoop),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardLoop {
    /// Iterate while this holds; `loopCounter` is in scope
    pub loop_condition: String,
    #[serde(default)]
    pub loop_max: Option<u32>,
    #[serde(default)]
    pub test_before: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiInstanceLoop {
    #[serde(default)]
    pub sequential: bool,
    #[serde(default)]
    pub loop_cardinality: Option<String>,
    #[serde(default)]
    pub loop_data_input: Option<String>,
    #[serde(default)]
    pub data_input_item: Option<String>,
    #[serde(default)]
    pub loop_data_output: Option<String>,
    #[serde(default)]
    pub data_output_item: Option<String>,
    #[serde(default)]
    pub completion_condition: Option<String>,
}

/// Process-level variable declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataDefinition {
    pub name: String,

    /// Holds references to business objects rather than a plain value
    #[serde(default)]
    pub business: bool,
    #[serde(default)]
    pub multiple: bool,
    #[serde(default)]
    pub default_value: Option<serde_json::Value>,
}

/// `target = expression`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataOperation {
    pub target: String,
    pub expression: String,
}

impl ProcessDefinition {
    pub fn node(&self, name: &str) -> Option<&FlowNodeDefinition> {
        self.flow_nodes.iter().find(|n| n.name == name)
    }

    pub fn require_node(&self, name: &str) -> Result<&FlowNodeDefinition, EngineError> {
        self.node(name).ok_or_else(|| {
            EngineError::Definition(format!(
                "process '{}' has no flow node named '{}'",
                self.name, name
            ))
        })
    }

    pub fn incoming<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a TransitionDefinition> {
        self.transitions.iter().filter(move |t| t.target == name)
    }

    pub fn outgoing<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a TransitionDefinition> {
        self.transitions.iter().filter(move |t| t.source == name)
    }

    pub fn data_definition(&self, name: &str) -> Option<&DataDefinition> {
        self.data.iter().find(|d| d.name == name)
    }

    /// Nodes a new instance starts from: start events, else nodes without
    /// incoming transitions
    pub fn start_nodes(&self) -> Vec<&FlowNodeDefinition> {
        let starts: Vec<_> = self
            .flow_nodes
            .iter()
            .filter(|n| matches!(n.kind, FlowNodeDefinitionKind::StartEvent))
            .collect();
        if !starts.is_empty() {
            return starts;
        }
        self.flow_nodes
            .iter()
            .filter(|n| self.incoming(&n.name).next().is_none())
            .collect()
    }

    /// Check structural consistency before deployment
    pub fn validate(&self) -> Result<(), EngineError> {
        let invalid = |msg: String| Err(EngineError::Definition(format!("{}: {}", self.name, msg)));

        if self.flow_nodes.is_empty() {
            return invalid("no flow nodes".into());
        }

        let mut names = HashSet::new();
        for node in &self.flow_nodes {
            if !names.insert(node.name.as_str()) {
                return invalid(format!("duplicate flow node '{}'", node.name));
            }
        }

        let mut transition_names = HashSet::new();
        for transition in &self.transitions {
            if !transition_names.insert(transition.name.as_str()) {
                return invalid(format!("duplicate transition '{}'", transition.name));
            }
            for end in [&transition.source, &transition.target] {
                if !names.contains(end.as_str()) {
                    return invalid(format!(
                        "transition '{}' references unknown node '{}'",
                        transition.name, end
                    ));
                }
            }
        }

        for node in &self.flow_nodes {
            if self.outgoing(&node.name).filter(|t| t.default).count() > 1 {
                return invalid(format!("'{}' has more than one default transition", node.name));
            }

            match &node.kind {
                FlowNodeDefinitionKind::Gateway {
                    gateway_type,
                    activation_condition,
                } => {
                    if node.loop_characteristics.is_some() {
                        return invalid(format!("gateway '{}' cannot loop", node.name));
                    }
                    if activation_condition.is_some() && *gateway_type != GatewayType::Complex {
                        return invalid(format!(
                            "only complex gateways take an activation condition ('{}')",
                            node.name
                        ));
                    }
                }
                FlowNodeDefinitionKind::IntermediateThrowEvent {
                    trigger: EventTrigger::Message(message),
                } if message.target_process.is_none() => {
                    return invalid(format!("message thrown by '{}' has no target process", node.name));
                }
                _ => {}
            }

            if let Some(LoopCharacteristics::MultiInstance(multi)) = &node.loop_characteristics {
                if multi.loop_cardinality.is_none() && multi.loop_data_input.is_none() {
                    return invalid(format!(
                        "multi-instance '{}' needs a cardinality or an input collection",
                        node.name
                    ));
                }
            }
        }

        Ok(())
    }
}
