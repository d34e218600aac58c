//! Universal Flag Configuration: data model and rule evaluation.
mod assignment;
mod models;
mod rules;

pub use assignment::AssignmentValue;
pub use models::*;
pub use rules::find_matching_rule;
