//! The ballot casting engine.
//!
//! [`BallotBox`] turns a vote into one atomic unit of work against a
//! [`Ledger`], retrying the whole unit when storage reports a transient
//! failure. [`TallyReader`] serves the read-only views.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use rand::Rng;
use rocket::tokio::time::sleep;

use crate::error::{Error, Rejection, Result};
use crate::ledger::{Ledger, UnitOfWork};
use crate::model::{
    api::receipt::Receipt,
    common::{CandidateId, VoterId},
    db::Ballot,
    mongodb::Id,
};

mod eligibility;
mod tally;

pub use eligibility::Eligibility;
pub use tally::{audit_snapshot, rank, TallyReader};

/// How hard to try before giving up on a transient storage failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero behaves like one.
    pub max_attempts: u32,
    /// Delay before the second attempt; grows linearly after that, plus up
    /// to one more `backoff` of random jitter.
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Never retry.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::ZERO,
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        self.backoff * attempt + self.backoff.mul_f64(rand::thread_rng().gen::<f64>())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::from_millis(20),
        }
    }
}

pub struct BallotBox {
    ledger: Arc<dyn Ledger>,
    retry: RetryPolicy,
}

impl BallotBox {
    pub fn new(ledger: Arc<dyn Ledger>, retry: RetryPolicy) -> Self {
        Self { ledger, retry }
    }

    /// Read-only eligibility check. The answer may be stale by the time a
    /// ballot is cast; [`BallotBox::cast_vote`] decides again under lock.
    pub async fn check_eligible(&self, voter_id: VoterId) -> Result<Eligibility> {
        let voter = self.ledger.voter(voter_id).await?;
        Ok(Eligibility::of(voter.as_ref()))
    }

    /// Cast a single ballot: mark the voter as having voted, record the
    /// ballot, and add one to the candidate's tally, all or nothing.
    ///
    /// This is not idempotent. Once a call has succeeded, every later call
    /// for the same voter is rejected with `already_voted`. Dropping the
    /// returned future after the commit has gone through does not undo the
    /// vote, so a caller that times out must not assume the ballot was lost.
    ///
    /// A commit that fails transiently may still have landed. If a retry then
    /// finds the voter has already voted, the stored ballot is checked, and if
    /// it is one this call wrote, the call succeeds with its receipt.
    pub async fn cast_vote(&self, voter_id: VoterId, candidate_id: CandidateId) -> Result<Receipt> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut unconfirmed = Vec::new();
        let mut attempt = 1;
        loop {
            debug!("Casting ballot: voter {voter_id}, candidate {candidate_id}, attempt {attempt}/{max_attempts}");
            let outcome = self.try_cast(voter_id, candidate_id, &mut unconfirmed).await;
            let outcome = match outcome {
                Err(Error::Rejected(Rejection::AlreadyVoted)) if !unconfirmed.is_empty() => {
                    self.confirm(voter_id, &unconfirmed).await
                }
                outcome => outcome,
            };
            match outcome {
                Ok(ballot) => {
                    info!(
                        "Committed ballot {} for voter {voter_id}, candidate {candidate_id}",
                        ballot.id
                    );
                    return Ok(ballot.into());
                }
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    warn!("Transient failure casting ballot for voter {voter_id}, retrying: {err}");
                    sleep(self.retry.delay(attempt)).await;
                    attempt += 1;
                }
                Err(err) => {
                    match &err {
                        Error::Rejected(rejection) => {
                            debug!("Ballot for voter {voter_id} rejected: {rejection}")
                        }
                        Error::TransientStorage(_) => warn!(
                            "Giving up on ballot for voter {voter_id} after {attempt} attempts: {err}"
                        ),
                        Error::FatalStorage(_) => {
                            error!("Failed to cast ballot for voter {voter_id}: {err}")
                        }
                    }
                    return Err(err);
                }
            }
        }
    }

    /// One attempt at the whole unit of work. If the commit fails
    /// transiently, the ballot's ID is added to `unconfirmed`.
    async fn try_cast(
        &self,
        voter_id: VoterId,
        candidate_id: CandidateId,
        unconfirmed: &mut Vec<Id>,
    ) -> Result<Ballot> {
        let mut work = self.ledger.begin().await?;
        match apply(&mut work, voter_id, candidate_id).await {
            Ok(ballot) => match work.commit().await {
                Ok(()) => Ok(ballot),
                Err(err) => {
                    if err.is_transient() {
                        unconfirmed.push(ballot.id);
                    }
                    Err(err)
                }
            },
            Err(err) => {
                if let Err(rollback_err) = work.rollback().await {
                    warn!("Rollback for voter {voter_id} failed: {rollback_err}");
                }
                Err(err)
            }
        }
    }

    /// The voter has a ballot. Succeed if it is one whose commit we could
    /// not confirm, otherwise reject as `already_voted`.
    async fn confirm(&self, voter_id: VoterId, unconfirmed: &[Id]) -> Result<Ballot> {
        match self.ledger.ballot_for_voter(voter_id).await? {
            Some(ballot) if unconfirmed.contains(&ballot.id) => {
                info!("Unconfirmed commit of ballot {} did land", ballot.id);
                Ok(ballot)
            }
            _ => Err(Rejection::AlreadyVoted.into()),
        }
    }
}

async fn apply(
    work: &mut Box<dyn UnitOfWork + '_>,
    voter_id: VoterId,
    candidate_id: CandidateId,
) -> Result<Ballot> {
    let voter = work.lock_voter(voter_id).await?;
    Eligibility::of(voter.as_ref()).into_result()?;

    if !work.mark_voted(voter_id).await? {
        return Err(Rejection::AlreadyVoted.into());
    }

    let ballot = Ballot::new(voter_id, candidate_id, Utc::now());
    work.insert_ballot(&ballot).await?;

    if !work.increment_vote_count(candidate_id).await? {
        return Err(Rejection::CandidateNotFound.into());
    }

    Ok(ballot)
}
