use std::fmt;

use mongodb::bson::{doc, oid::ObjectId, Document};
use serde::{Deserialize, Serialize};

/// A database-generated identifier, used for ballots.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id(ObjectId);

impl Id {
    /// Generate a fresh, unique ID.
    pub fn new() -> Self {
        Self(ObjectId::new())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_hex())
    }
}

/// Get a filter document matching an integer ID.
pub fn u32_id_filter(id: u32) -> Document {
    doc! { "_id": id }
}

#[cfg(test)]
mod tests {
    use mongodb::bson::Bson;

    use super::*;

    #[test]
    fn displays_as_hex() {
        let id = Id::new();
        let hex = id.to_string();
        assert_eq!(hex.len(), 24);
        assert_eq!(hex.parse::<ObjectId>().unwrap(), id.0);
        assert_ne!(hex, Id::new().to_string());
    }

    #[test]
    fn filters() {
        assert_eq!(u32_id_filter(7).get("_id"), Some(&Bson::from(7u32)));
    }
}
