//! Process execution engine
//!
//! The engine module provides the `ProcessExecutor` which drives process
//! instances through their definitions, one committed unit of work at a time.

mod core;
mod dispatch;
mod executor;
mod factory;
mod registry;
pub(crate) mod scope;
mod work;

pub use self::core::{Advance, ExecutionCore};
pub use dispatch::{WorkDescriptor, WorkScheduler};
pub use executor::ProcessExecutor;
pub use factory::FlowNodeFactory;
pub use registry::DefinitionRegistry;
pub use scope::LOOP_COUNTER;
pub use work::ProcessInputs;
