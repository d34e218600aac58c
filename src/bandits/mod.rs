//! Contextual bandits: model wire types, FALCON action selection, and the flag variation index.
mod eval;
mod index;
mod models;

pub use eval::{weigh_actions, BanditEvaluation};
pub use index::{BanditVariationIndex, PersistedBanditIndex};
pub use models::*;
