use std::collections::BTreeSet;

use log::warn;
use mongodb::{
    bson::doc,
    options::{
        Acknowledgment, FindOptions, ReadConcern, SessionOptions, TransactionOptions,
        WriteConcern,
    },
    Client, ClientSession, Database,
};
use rocket::futures::TryStreamExt;

use crate::error::{Error, Rejection, Result};
use crate::model::{
    common::{CandidateId, VoterId},
    db::{Ballot, Candidate, Voter},
    mongodb::{
        errors::{is_duplicate_key_error, is_unknown_commit_result},
        u32_id_filter, Coll,
    },
};

use super::{Ledger, LedgerSnapshot, UnitOfWork};

/// How many times to retry a commit whose outcome the server could not
/// report. Retrying the commit alone is safe; it never re-applies writes.
const COMMIT_RETRIES: u32 = 3;

/// A ledger backed by MongoDB multi-document transactions.
///
/// Requires a replica set (or sharded cluster) so that transactions and
/// snapshot sessions are available.
#[derive(Clone)]
pub struct MongoLedger {
    client: Client,
    voters: Coll<Voter>,
    candidates: Coll<Candidate>,
    ballots: Coll<Ballot>,
}

impl MongoLedger {
    pub fn new(client: Client, db: &Database) -> Self {
        Self {
            client,
            voters: Coll::from_db(db),
            candidates: Coll::from_db(db),
            ballots: Coll::from_db(db),
        }
    }
}

fn transaction_options() -> TransactionOptions {
    TransactionOptions::builder()
        .read_concern(ReadConcern::snapshot())
        .write_concern(WriteConcern::builder().w(Acknowledgment::Majority).build())
        .build()
}

#[rocket::async_trait]
impl Ledger for MongoLedger {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork + '_>> {
        let mut session = self.client.start_session(None).await?;
        session.start_transaction(transaction_options()).await?;
        Ok(Box::new(MongoUnitOfWork {
            session,
            ledger: self,
        }))
    }

    async fn voter(&self, id: VoterId) -> Result<Option<Voter>> {
        Ok(self.voters.find_one(u32_id_filter(id), None).await?)
    }

    async fn candidate(&self, id: CandidateId) -> Result<Option<Candidate>> {
        Ok(self.candidates.find_one(u32_id_filter(id), None).await?)
    }

    async fn tallies(&self, election_id: Option<&str>) -> Result<Vec<Candidate>> {
        let filter = election_id.map(|id| doc! { "election_id": id });
        let options = FindOptions::builder()
            .sort(doc! { "vote_count": -1, "_id": 1 })
            .build();
        let candidates = self
            .candidates
            .find(filter, options)
            .await?
            .try_collect()
            .await?;
        Ok(candidates)
    }

    async fn ballot_for_voter(&self, id: VoterId) -> Result<Option<Ballot>> {
        Ok(self.ballots.find_one(doc! { "voter_id": id }, None).await?)
    }

    async fn snapshot(&self) -> Result<LedgerSnapshot> {
        let session_options = SessionOptions::builder().snapshot(true).build();
        let mut session = self.client.start_session(Some(session_options)).await?;

        let mut snapshot = LedgerSnapshot::default();

        let options = FindOptions::builder().sort(doc! { "_id": 1 }).build();
        let mut candidates = self
            .candidates
            .find_with_session(None, options, &mut session)
            .await?;
        while let Some(candidate) = candidates.next(&mut session).await {
            snapshot.candidates.push(candidate?);
        }

        let mut ballots = self
            .ballots
            .find_with_session(None, None, &mut session)
            .await?;
        while let Some(ballot) = ballots.next(&mut session).await {
            snapshot.ballots.push(ballot?);
        }

        let mut voted = BTreeSet::new();
        let mut voters = self
            .voters
            .find_with_session(doc! { "has_voted": true }, None, &mut session)
            .await?;
        while let Some(voter) = voters.next(&mut session).await {
            voted.insert(voter?.id);
        }
        snapshot.voted = voted;

        Ok(snapshot)
    }
}

/// A unit of work running inside a MongoDB transaction.
///
/// Concurrency control is optimistic: reads see the transaction's snapshot,
/// and if another transaction commits a write to a document this one also
/// writes, the server aborts with a `TransientTransactionError`. The engine
/// then retries from the top and re-reads the committed state.
struct MongoUnitOfWork<'a> {
    session: ClientSession,
    ledger: &'a MongoLedger,
}

#[rocket::async_trait]
impl<'a> UnitOfWork for MongoUnitOfWork<'a> {
    async fn lock_voter(&mut self, id: VoterId) -> Result<Option<Voter>> {
        let voter = self
            .ledger
            .voters
            .find_one_with_session(u32_id_filter(id), None, &mut self.session)
            .await?;
        Ok(voter)
    }

    async fn mark_voted(&mut self, id: VoterId) -> Result<bool> {
        let mut filter = u32_id_filter(id);
        filter.insert("has_voted", doc! { "$ne": true });
        let update = doc! {
            "$set": { "has_voted": true }
        };
        let result = self
            .ledger
            .voters
            .update_one_with_session(filter, update, None, &mut self.session)
            .await?;
        Ok(result.modified_count == 1)
    }

    async fn insert_ballot(&mut self, ballot: &Ballot) -> Result<()> {
        match self
            .ledger
            .ballots
            .insert_one_with_session(ballot, None, &mut self.session)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_duplicate_key_error(&e) => Err(Error::Rejected(Rejection::AlreadyVoted)),
            Err(e) => Err(e.into()),
        }
    }

    async fn increment_vote_count(&mut self, id: CandidateId) -> Result<bool> {
        let update = doc! {
            "$inc": { "vote_count": 1 }
        };
        let result = self
            .ledger
            .candidates
            .update_one_with_session(u32_id_filter(id), update, None, &mut self.session)
            .await?;
        Ok(result.matched_count == 1)
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        let mut retries = 0;
        loop {
            match self.session.commit_transaction().await {
                Ok(()) => return Ok(()),
                Err(e) if is_unknown_commit_result(&e) && retries < COMMIT_RETRIES => {
                    retries += 1;
                    warn!("Commit outcome unknown, retrying commit ({retries}/{COMMIT_RETRIES}): {e}");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        self.session.abort_transaction().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use rocket::futures::future::join_all;
    use rocket::tokio;

    use crate::engine::{audit_snapshot, BallotBox, RetryPolicy};

    use super::*;

    async fn seed(voters: &Coll<Voter>, candidates: &Coll<Candidate>, voter_count: u32) {
        let seeded = (1..=voter_count).map(Voter::example).collect::<Vec<_>>();
        voters.insert_many(seeded, None).await.unwrap();
        candidates
            .insert_many([Candidate::example(1, "Alice"), Candidate::example(2, "Bob")], None)
            .await
            .unwrap();
    }

    #[backend_test]
    async fn rollback_discards_writes(
        ledger: MongoLedger,
        voters: Coll<Voter>,
        candidates: Coll<Candidate>,
    ) {
        seed(&voters, &candidates, 1).await;

        let mut work = ledger.begin().await.unwrap();
        assert!(work.lock_voter(1).await.unwrap().is_some());
        assert!(work.mark_voted(1).await.unwrap());
        assert!(!work.mark_voted(1).await.unwrap());
        work.insert_ballot(&Ballot::new(1, 1, Utc::now()))
            .await
            .unwrap();
        assert!(work.increment_vote_count(1).await.unwrap());
        assert!(!work.increment_vote_count(9).await.unwrap());

        // Uncommitted writes are invisible outside the transaction.
        assert!(!ledger.voter(1).await.unwrap().unwrap().has_voted);
        work.rollback().await.unwrap();

        assert!(!ledger.voter(1).await.unwrap().unwrap().has_voted);
        assert!(ledger.ballot_for_voter(1).await.unwrap().is_none());
        assert_eq!(ledger.candidate(1).await.unwrap().unwrap().vote_count, 0);
    }

    #[backend_test]
    async fn duplicate_ballot_is_rejected(
        ledger: MongoLedger,
        voters: Coll<Voter>,
        candidates: Coll<Candidate>,
    ) {
        seed(&voters, &candidates, 1).await;

        let mut work = ledger.begin().await.unwrap();
        work.insert_ballot(&Ballot::new(1, 1, Utc::now()))
            .await
            .unwrap();
        work.commit().await.unwrap();

        let mut work = ledger.begin().await.unwrap();
        let err = work
            .insert_ballot(&Ballot::new(1, 2, Utc::now()))
            .await
            .unwrap_err();
        assert_eq!(err.rejection(), Some(Rejection::AlreadyVoted));
        work.rollback().await.unwrap();
    }

    #[backend_test]
    async fn racing_casts_commit_once(
        ledger: MongoLedger,
        voters: Coll<Voter>,
        candidates: Coll<Candidate>,
    ) {
        seed(&voters, &candidates, 1).await;
        let ballot_box = Arc::new(BallotBox::new(
            Arc::new(ledger.clone()),
            RetryPolicy {
                max_attempts: 10,
                ..RetryPolicy::default()
            },
        ));

        let handles = (0..4)
            .map(|i| {
                let ballot_box = ballot_box.clone();
                tokio::spawn(async move { ballot_box.cast_vote(1, 1 + i % 2).await })
            })
            .collect::<Vec<_>>();
        let outcomes = join_all(handles)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect::<Vec<_>>();

        assert_eq!(outcomes.iter().filter(|o| o.is_ok()).count(), 1);
        for err in outcomes.iter().filter_map(|o| o.as_ref().err()) {
            assert_eq!(err.rejection(), Some(Rejection::AlreadyVoted));
        }

        let snapshot = ledger.snapshot().await.unwrap();
        assert_eq!(snapshot.ballots.len(), 1);
        assert!(audit_snapshot(&snapshot).consistent);
    }

    #[backend_test]
    async fn concurrent_votes_are_all_counted(
        ledger: MongoLedger,
        voters: Coll<Voter>,
        candidates: Coll<Candidate>,
    ) {
        const VOTERS: u32 = 20;
        seed(&voters, &candidates, VOTERS).await;
        let ballot_box = Arc::new(BallotBox::new(
            Arc::new(ledger.clone()),
            RetryPolicy {
                max_attempts: 50,
                ..RetryPolicy::default()
            },
        ));

        let handles = (1..=VOTERS)
            .map(|voter_id| {
                let ballot_box = ballot_box.clone();
                tokio::spawn(async move { ballot_box.cast_vote(voter_id, 2).await })
            })
            .collect::<Vec<_>>();
        for joined in join_all(handles).await {
            joined.unwrap().unwrap();
        }

        let tallies = ledger.tallies(None).await.unwrap();
        assert_eq!(tallies[0].id, 2);
        assert_eq!(tallies[0].vote_count, u64::from(VOTERS));
        assert_eq!(tallies[1].vote_count, 0);
        assert!(audit_snapshot(&ledger.snapshot().await.unwrap()).consistent);
    }
}
