pub mod action;
pub mod approval;
pub mod evaluation;
pub mod plan;
pub mod policy;
pub mod rollout;
