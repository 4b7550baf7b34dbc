use std::fmt::{self, Display, Formatter};

use log::error;
use mongodb::error::Error as DbError;
use rocket::{
    http::{Status, StatusClass},
    response::{self, Responder},
    serde::json::Json,
    Request,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::mongodb::errors::is_transient_error;

pub type Result<T> = std::result::Result<T, Error>;

/// Why a ballot was refused. Rejections are permanent for the request that
/// caused them and are never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rejection {
    AlreadyVoted,
    VoterNotFound,
    CandidateNotFound,
}

impl Rejection {
    /// The stable, machine-readable reason string.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::AlreadyVoted => "already_voted",
            Self::VoterNotFound => "voter_not_found",
            Self::CandidateNotFound => "candidate_not_found",
        }
    }
}

impl Display for Rejection {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason())
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Ballot rejected: {0}")]
    Rejected(Rejection),
    /// Lock timeout, lost connection, write conflict. Nothing was committed,
    /// so the whole unit of work may be attempted again.
    #[error("Transient storage failure: {0}")]
    TransientStorage(String),
    /// Integrity or schema violation. Nothing was committed, but retrying
    /// will not help.
    #[error("Fatal storage failure: {0}")]
    FatalStorage(String),
}

impl Error {
    /// Is it safe and worthwhile to retry the operation that produced this?
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientStorage(_))
    }

    /// The rejection carried by this error, if any.
    pub fn rejection(&self) -> Option<Rejection> {
        match self {
            Self::Rejected(rejection) => Some(*rejection),
            _ => None,
        }
    }

    pub fn status(&self) -> Status {
        match self {
            Self::Rejected(Rejection::AlreadyVoted) => Status::Conflict,
            Self::Rejected(Rejection::VoterNotFound | Rejection::CandidateNotFound) => {
                Status::NotFound
            }
            Self::TransientStorage(_) => Status::ServiceUnavailable,
            Self::FatalStorage(_) => Status::InternalServerError,
        }
    }
}

impl From<Rejection> for Error {
    fn from(rejection: Rejection) -> Self {
        Self::Rejected(rejection)
    }
}

impl From<DbError> for Error {
    fn from(err: DbError) -> Self {
        if is_transient_error(&err) {
            Self::TransientStorage(err.to_string())
        } else {
            Self::FatalStorage(err.to_string())
        }
    }
}

/// Body of every error response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl<'r, 'o: 'r> Responder<'r, 'o> for Error {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'o> {
        let status = self.status();
        if status.class() == StatusClass::ServerError {
            error!("{self}");
        }
        // Storage details stay in the log.
        let error = match self {
            Self::Rejected(rejection) => rejection.reason(),
            Self::TransientStorage(_) => "storage_unavailable",
            Self::FatalStorage(_) => "storage_failure",
        }
        .to_string();
        (status, Json(ErrorBody { error })).respond_to(req)
    }
}
