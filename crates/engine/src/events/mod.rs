//! Waiting event registration and trigger correlation

mod correlation;

pub use correlation::{CorrelationOutcome, EventCorrelationEngine};
