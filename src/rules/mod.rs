//! Stop rule evaluation
//!
//! Decides after every iteration whether a loop keeps running. Evaluation is
//! a pure function over the configured rules and a finished command result.

mod engine;

pub use engine::{MatcherResults, evaluate, evaluate_with, rule_matches};
