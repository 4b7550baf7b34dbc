pub mod audit;
pub mod eligibility;
pub mod receipt;
pub mod results;
pub mod vote;
