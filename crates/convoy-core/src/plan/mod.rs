//! Plan handling: validation, topological ordering, planner wire format.

pub mod graph;
pub mod json_format;
pub mod validate;

pub use graph::{DependentsIndex, topological_order};
pub use json_format::{PlanJson, TaskJson, parse_plan_json};
pub use validate::{PlanError, validate};
