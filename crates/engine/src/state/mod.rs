//! Flow node state machine
//!
//! - [`StateRegistry`] - immutable catalogue of states and per-category chains
//! - [`TransitionResolver`] - next state of a node, honouring abort/cancel and breakpoints
//! - [`BreakpointService`] - hook that parks a node in `interrupted`

mod breakpoint;
mod registry;
mod resolver;

pub use breakpoint::{Breakpoint, BreakpointService, InMemoryBreakpoints, NoBreakpoints};
pub use registry::{state_ids, FlowNodeState, NodeCategory, StateChain, StateId, StateRegistry};
pub use resolver::TransitionResolver;
