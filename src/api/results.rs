use rocket::{serde::json::Json, Route, State};

use crate::engine::TallyReader;
use crate::error::Result;
use crate::model::api::{
    audit::TallyAudit,
    results::{ResultsSummary, TallyEntry},
};

pub fn routes() -> Vec<Route> {
    routes![results, summary, audit]
}

/// Current tallies, most votes first, optionally for a single election.
#[get("/results?<election_id>")]
async fn results(
    reader: &State<TallyReader>,
    election_id: Option<&str>,
) -> Result<Json<Vec<TallyEntry>>> {
    Ok(Json(reader.read_results(election_id).await?))
}

#[get("/results/summary?<election_id>")]
async fn summary(
    reader: &State<TallyReader>,
    election_id: Option<&str>,
) -> Result<Json<ResultsSummary>> {
    Ok(Json(reader.summary(election_id).await?))
}

#[get("/results/audit")]
async fn audit(reader: &State<TallyReader>) -> Result<Json<TallyAudit>> {
    Ok(Json(reader.audit().await?))
}

#[cfg(test)]
mod tests {
    use std::fmt::Display;
    use std::sync::Arc;

    use mongodb::bson::doc;
    use rocket::{
        http::{uri::Origin, ContentType, Status},
        local::asynchronous::Client,
        serde::json::{json, serde_json},
    };
    use serde::de::DeserializeOwned;

    use crate::ledger::{Ledger, MemoryLedger, MongoLedger};
    use crate::model::{
        db::{Candidate, Voter},
        mongodb::{u32_id_filter, Coll},
    };

    use super::*;

    async fn vote(client: &Client, voter_id: u32, candidate_id: u32) {
        let response = client
            .post("/vote")
            .header(ContentType::JSON)
            .body(json!({ "voter_id": voter_id, "candidate_id": candidate_id }).to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
    }

    async fn get_json<T, U>(client: &Client, uri: U) -> T
    where
        T: DeserializeOwned,
        U: TryInto<Origin<'static>> + Display,
    {
        let response = client.get(uri).dispatch().await;
        assert_eq!(response.status(), Status::Ok);
        assert!(response.body().is_some());
        let raw_response = response.into_string().await.unwrap();
        serde_json::from_str::<T>(&raw_response).unwrap()
    }

    #[rocket::async_test]
    async fn results_summary_and_audit() {
        let ledger = Arc::new(MemoryLedger::default());
        for id in 1..=6 {
            ledger.add_voter(Voter::example(id)).await.unwrap();
        }
        for (id, name) in [(1, "Alice"), (2, "Bob"), (3, "Carol")] {
            ledger
                .add_candidate(Candidate::example(id, name))
                .await
                .unwrap();
        }
        let client = crate::memory_client(ledger).await;

        // Before any votes, everyone is on zero in creation order.
        let ranked: Vec<TallyEntry> = get_json(&client, "/results").await;
        let ids = ranked.iter().map(|e| e.candidate_id).collect::<Vec<_>>();
        assert_eq!(ids, vec![1, 2, 3]);

        for (voter_id, candidate_id) in [(1, 3), (2, 3), (3, 2), (4, 3), (5, 2), (6, 1)] {
            vote(&client, voter_id, candidate_id).await;
        }

        let ranked: Vec<TallyEntry> = get_json(&client, "/results").await;
        let order = ranked
            .iter()
            .map(|e| (e.name.as_str(), e.vote_count))
            .collect::<Vec<_>>();
        assert_eq!(order, vec![("Carol", 3), ("Bob", 2), ("Alice", 1)]);

        let headline: ResultsSummary = get_json(&client, "/results/summary").await;
        assert_eq!(headline.total_votes, 6);
        assert_eq!(headline.candidates, ranked);

        let report: TallyAudit = get_json(&client, uri!(audit)).await;
        assert!(report.consistent);
        assert_eq!(report.total_ballots, 6);
        assert_eq!(report.total_votes, 6);
    }

    #[rocket::async_test]
    async fn results_for_one_election() {
        let ledger = Arc::new(MemoryLedger::default());
        for id in 1..=3 {
            ledger.add_voter(Voter::example(id)).await.unwrap();
        }
        for (id, name, election) in [
            (1, "Alice", "council"),
            (2, "Bob", "mayor"),
            (3, "Carol", "council"),
        ] {
            let mut candidate = Candidate::example(id, name);
            candidate.election_id = Some(election.to_string());
            ledger.add_candidate(candidate).await.unwrap();
        }
        let client = crate::memory_client(ledger).await;
        for (voter_id, candidate_id) in [(1, 1), (2, 2), (3, 1)] {
            vote(&client, voter_id, candidate_id).await;
        }

        let ranked: Vec<TallyEntry> =
            get_json(&client, "/results?election_id=council").await;
        let order = ranked
            .iter()
            .map(|e| (e.name.as_str(), e.vote_count))
            .collect::<Vec<_>>();
        assert_eq!(order, vec![("Alice", 2), ("Carol", 0)]);

        let headline: ResultsSummary =
            get_json(&client, "/results/summary?election_id=council").await;
        assert_eq!(headline.election_id.as_deref(), Some("council"));
        assert_eq!(headline.total_votes, 2);
        assert_eq!(headline.candidates, ranked);

        let response = client
            .get("/results/summary")
            .dispatch()
            .await
            .into_json::<serde_json::Value>()
            .await
            .unwrap();
        assert_eq!(response["total_votes"], 3);
        assert!(response.get("election_id").is_none());
    }

    #[backend_test]
    async fn audit_on_mongodb(
        client: Client,
        ledger: MongoLedger,
        voters: Coll<Voter>,
        candidates: Coll<Candidate>,
    ) {
        for id in 1..=4 {
            voters.insert_one(Voter::example(id), None).await.unwrap();
        }
        candidates
            .insert_many([Candidate::example(1, "Alice"), Candidate::example(2, "Bob")], None)
            .await
            .unwrap();

        for (voter_id, candidate_id) in [(1, 2), (2, 2), (3, 1)] {
            vote(&client, voter_id, candidate_id).await;
        }

        let ranked: Vec<TallyEntry> = get_json(&client, "/results").await;
        let order = ranked
            .iter()
            .map(|e| (e.candidate_id, e.vote_count))
            .collect::<Vec<_>>();
        assert_eq!(order, vec![(2, 2), (1, 1)]);

        let report: TallyAudit = get_json(&client, uri!(audit)).await;
        assert!(report.consistent);
        assert_eq!(report.total_ballots, 3);

        // Tamper with a tally behind the engine's back.
        candidates
            .update_one(
                u32_id_filter(1),
                doc! { "$inc": { "vote_count": 5 } },
                None,
            )
            .await
            .unwrap();
        let snapshot = ledger.snapshot().await.unwrap();
        let report = crate::engine::audit_snapshot(&snapshot);
        assert!(!report.consistent);
        assert_eq!(report.mismatched_tallies.len(), 1);
        assert_eq!(report.mismatched_tallies[0].recorded, 6);
        assert_eq!(report.mismatched_tallies[0].counted, 1);
    }
}
