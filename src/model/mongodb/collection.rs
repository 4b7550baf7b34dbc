use std::ops::Deref;

use log::debug;
use mongodb::{
    bson::doc, error::Error as DbError, options::IndexOptions, Collection, Database, IndexModel,
};

use crate::model::db::{Ballot, Candidate, Voter};

/// A type that can be directly inserted/read to/from the database.
pub trait MongoCollection {
    /// The name of the collection.
    const NAME: &'static str;
}

/// A database collection of the given type.
pub struct Coll<T>(Collection<T>);

impl<T> Coll<T>
where
    T: MongoCollection,
{
    /// Get a handle on this collection in the given database.
    pub fn from_db(db: &Database) -> Self {
        Self(db.collection(T::NAME))
    }
}

// `Derive(Clone)` would only derive if `T: Clone`, but we don't need that bound.
impl<T> Clone for Coll<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> Deref for Coll<T> {
    type Target = Collection<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

const VOTERS: &str = "voters";
impl MongoCollection for Voter {
    const NAME: &'static str = VOTERS;
}

const CANDIDATES: &str = "candidates";
impl MongoCollection for Candidate {
    const NAME: &'static str = CANDIDATES;
}

const BALLOTS: &str = "ballots";
impl MongoCollection for Ballot {
    const NAME: &'static str = BALLOTS;
}

/// Ensure that all the required indexes exist on the given database.
///
/// This operation is idempotent.
pub async fn ensure_indexes_exist(db: &Database) -> Result<(), DbError> {
    debug!("Ensuring collection indexes exist");

    let unique = IndexOptions::builder().unique(true).build();

    // Voter collection.
    let voters = Coll::<Voter>::from_db(db);
    for key in ["username", "email"] {
        let index = IndexModel::builder()
            .keys(doc! { key: 1 })
            .options(unique.clone())
            .build();
        voters.create_index(index, None).await?;
    }

    // Candidate collection: serves the ranked tallies read.
    let tally_index = IndexModel::builder()
        .keys(doc! { "vote_count": -1, "_id": 1 })
        .build();
    Coll::<Candidate>::from_db(db)
        .create_index(tally_index, None)
        .await?;

    // Ballot collection. The unique voter index is the ledger's last line of
    // defence against a second ballot for the same voter.
    let ballots = Coll::<Ballot>::from_db(db);
    let voter_index = IndexModel::builder()
        .keys(doc! { "voter_id": 1 })
        .options(unique)
        .build();
    ballots.create_index(voter_index, None).await?;
    let candidate_index = IndexModel::builder()
        .keys(doc! { "candidate_id": 1 })
        .build();
    ballots.create_index(candidate_index, None).await?;

    Ok(())
}
