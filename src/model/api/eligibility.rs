use serde::{Deserialize, Serialize};

use crate::engine::Eligibility;
use crate::model::common::VoterId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EligibilityResponse {
    pub voter_id: VoterId,
    pub eligibility: Eligibility,
}
