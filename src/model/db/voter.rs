use std::ops::{Deref, DerefMut};

use serde::{Deserialize, Serialize};

use crate::model::common::VoterId;

/// Core voter data, as stored in the database.
///
/// Registration owns these records; this service only reads them and flips
/// `has_voted`. Any extra fields registration stores (credentials etc.) are
/// ignored on read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoterCore {
    /// Unique login handle.
    pub username: String,
    /// Unique contact address.
    pub email: String,
    /// Set exactly once, when the voter's ballot is committed. Never reset.
    #[serde(default)]
    pub has_voted: bool,
}

impl VoterCore {
    pub fn new(username: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            email: email.into(),
            has_voted: false,
        }
    }
}

/// A voter from the database, with its unique ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Voter {
    #[serde(rename = "_id")]
    pub id: VoterId,
    #[serde(flatten)]
    pub voter: VoterCore,
}

impl Deref for Voter {
    type Target = VoterCore;

    fn deref(&self) -> &Self::Target {
        &self.voter
    }
}

impl DerefMut for Voter {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.voter
    }
}

/// Example data for tests.
#[cfg(test)]
mod examples {
    use super::*;

    impl Voter {
        pub fn example(id: VoterId) -> Self {
            Self {
                id,
                voter: VoterCore::new(format!("voter{id}"), format!("voter{id}@example.com")),
            }
        }
    }
}
