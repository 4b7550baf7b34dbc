use serde::{Deserialize, Serialize};

use crate::error::Rejection;
use crate::model::db::Voter;

/// Whether a voter may cast a ballot right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Eligibility {
    Eligible,
    AlreadyVoted,
    VoterNotFound,
}

impl Eligibility {
    /// Decide eligibility from a voter lookup. This is the only place the
    /// decision is made, both for the read-only check and inside a cast.
    pub fn of(voter: Option<&Voter>) -> Self {
        match voter {
            None => Self::VoterNotFound,
            Some(voter) if voter.has_voted => Self::AlreadyVoted,
            Some(_) => Self::Eligible,
        }
    }

    /// Turn an ineligible outcome into the matching rejection.
    pub fn into_result(self) -> Result<(), Rejection> {
        match self {
            Self::Eligible => Ok(()),
            Self::AlreadyVoted => Err(Rejection::AlreadyVoted),
            Self::VoterNotFound => Err(Rejection::VoterNotFound),
        }
    }
}
