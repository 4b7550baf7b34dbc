use log::debug;
use rocket::{serde::json::Json, Route, State};

use crate::engine::BallotBox;
use crate::error::Result;
use crate::logging::RequestId;
use crate::model::{
    api::{eligibility::EligibilityResponse, receipt::Receipt, vote::VoteRequest},
    common::VoterId,
};

pub fn routes() -> Vec<Route> {
    routes![cast_vote, eligibility]
}

/// Cast a ballot. Not idempotent: replaying a successful request is
/// rejected with `already_voted`.
#[post("/vote", data = "<vote>", format = "json")]
async fn cast_vote(
    vote: Json<VoteRequest>,
    ballot_box: &State<BallotBox>,
    request_id: &RequestId,
) -> Result<Json<Receipt>> {
    debug!(
        "{request_id} voter {} requests a ballot for candidate {}",
        vote.voter_id, vote.candidate_id
    );
    let receipt = ballot_box
        .cast_vote(vote.voter_id, vote.candidate_id)
        .await?;
    Ok(Json(receipt))
}

#[get("/voters/<voter_id>/eligibility")]
async fn eligibility(
    voter_id: VoterId,
    ballot_box: &State<BallotBox>,
) -> Result<Json<EligibilityResponse>> {
    let eligibility = ballot_box.check_eligible(voter_id).await?;
    Ok(Json(EligibilityResponse {
        voter_id,
        eligibility,
    }))
}
