//! Engine error taxonomy.
//!
//! Eligibility and race outcomes are returned as typed errors so callers
//! (admin UI, sweep scheduler, drain loop) can tell "retry later" apart from
//! "terminal" without string matching. Per-bet transfer failures are carried
//! as data inside `SettlementResult`, not raised here.

use axum::{http::StatusCode, response::IntoResponse, response::Response, Json};
use serde::Serialize;
use thiserror::Error;

use crate::models::FeedKind;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed request. Not retried.
    #[error("invalid request: {0}")]
    Validation(String),

    /// An active subscription already exists for (market, feed kind).
    #[error("active {feed_kind:?} subscription already exists for market {market_id}")]
    DuplicateSubscription {
        market_id: String,
        feed_kind: FeedKind,
    },

    /// Eligibility failed. The caller may re-invoke later; never auto-retried.
    #[error("market not resolvable: {0}")]
    NotResolvable(String),

    /// Lost the resolution race. Terminal, not an operational fault.
    #[error("market {0} is already resolved")]
    AlreadyResolved(String),

    /// Oracle trigger without usable data. Surfaced to the trigger scheduler.
    #[error("stale or missing oracle data: {0}")]
    StaleOracleData(String),

    #[error("store error: {0}")]
    Store(#[source] anyhow::Error),

    #[error("oracle error: {0}")]
    Oracle(#[source] anyhow::Error),
}

impl EngineError {
    /// Benign resolution outcomes: the drain loop treats these as processed,
    /// not as handler failures worth a retry.
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            EngineError::Validation(_)
                | EngineError::NotResolvable(_)
                | EngineError::AlreadyResolved(_)
                | EngineError::StaleOracleData(_)
        )
    }

    fn status(&self) -> StatusCode {
        match self {
            EngineError::Validation(_) => StatusCode::BAD_REQUEST,
            EngineError::DuplicateSubscription { .. } => StatusCode::CONFLICT,
            EngineError::NotResolvable(_) => StatusCode::CONFLICT,
            EngineError::AlreadyResolved(_) => StatusCode::CONFLICT,
            EngineError::StaleOracleData(_) => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::Store(_) | EngineError::Oracle(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation_error",
            EngineError::DuplicateSubscription { .. } => "duplicate_subscription",
            EngineError::NotResolvable(_) => "not_resolvable",
            EngineError::AlreadyResolved(_) => "already_resolved",
            EngineError::StaleOracleData(_) => "stale_oracle_data",
            EngineError::Store(_) => "store_error",
            EngineError::Oracle(_) => "oracle_error",
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.code(),
            message: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}
