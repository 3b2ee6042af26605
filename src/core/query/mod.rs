// SPDX-License-Identifier: MIT OR Apache-2.0

//! Continuous query evaluation.

pub mod condition;
pub mod continuous_query;
pub mod query_service;

pub use condition::{predicate_fn, CompareOp, Condition, FnPredicate, Predicate, PredicateResult};
pub use continuous_query::{ContinuousQuery, CqResults, CqState, CqStatistics, Evaluation};
pub use query_service::{QueryEvaluation, QueryService, QueryServiceStatistics};
