//! Flag and bandit evaluation over a configuration snapshot. Functions here are pure: they
//! return events instead of logging them.
mod eval_assignment;
mod eval_bandits;

pub use eval_assignment::{get_assignment, Assignment, FlagEvaluation};
pub use eval_bandits::{get_bandit_action, BanditResult};
