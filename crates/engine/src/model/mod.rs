//! Records the engine reads and writes

mod data;
mod definition;
mod event;
mod flow_node;
mod process;

pub use data::{BusinessDataRef, DataContainer};
pub use definition::{
    CorrelationDefinition, DataDefinition, DataOperation, EventTrigger, FlowNodeDefinition,
    FlowNodeDefinitionKind, LoopCharacteristics, MessageTrigger, MultiInstanceLoop,
    ProcessDefinition, StandardLoop, TransitionDefinition,
};
pub use event::{MessageKey, WaitingEvent, WaitingEventKind};
pub use flow_node::{
    EventType, FlowNodeInstance, FlowNodeKind, GatewayPayload, GatewayType, LoopPayload,
    MultiInstancePayload, StateCategory,
};
pub use process::{ProcessInstance, ProcessState};
