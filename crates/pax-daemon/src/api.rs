//! HTTP API.
//!
//! Every engine operation is a JSON endpoint returning the engine's outcome
//! envelope. The HTTP status mirrors the envelope's error kind so plain HTTP
//! clients can branch without parsing the body.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use pax_core::ErrorKind;
use pax_core::OperationOutcome;
use pax_core::bidding::OpenRound;
use pax_core::bounty::{DepositRequest, TransactionAttributes};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::state::SharedState;

/// Maps an error kind onto an HTTP status.
#[must_use]
pub const fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::StateConflict | ErrorKind::ConcurrencyLost => StatusCode::CONFLICT,
        ErrorKind::ExternalUnavailable => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn respond<T: Serialize>(outcome: OperationOutcome<T>) -> Response {
    let status = outcome
        .error
        .as_ref()
        .map_or(StatusCode::OK, |error| status_for(error.kind));
    (status, Json(outcome)).into_response()
}

// =============================================================================
// Request bodies
// =============================================================================

/// Body of `POST /priority/resolve`.
#[derive(Debug, Deserialize)]
pub struct ResolvePriorityRequest {
    /// Vertical to resolve.
    pub vertical: String,
    /// Actor asking; absent means anonymous.
    #[serde(default)]
    pub actor: Option<String>,
    /// Round nonce for the window length.
    #[serde(default)]
    pub nonce: Option<String>,
}

/// Body of `POST /auctions/{id}/bids`.
#[derive(Debug, Deserialize)]
pub struct PlaceBidRequest {
    /// Bidder wallet.
    pub bidder: String,
    /// Raw bid amount.
    pub amount: Decimal,
}

/// Body of `POST /bounties/match`.
#[derive(Debug, Deserialize)]
pub struct MatchBountiesRequest {
    /// The completed transaction.
    pub transaction: TransactionAttributes,
    /// Price the cap is computed from; falls back to the ask price.
    #[serde(default)]
    pub winning_price: Option<Decimal>,
}

/// Body of amount-only requests.
#[derive(Debug, Deserialize)]
pub struct AmountRequest {
    /// Amount to move.
    pub amount: Decimal,
}

/// Body of `POST /leases/{vertical}/renew`.
#[derive(Debug, Deserialize)]
pub struct RenewLeaseRequest {
    /// The actor renewing; must be the holder.
    pub actor: String,
}

/// Body of `POST /leases/{vertical}/award`.
#[derive(Debug, Deserialize)]
pub struct AwardLeaseRequest {
    /// The new holder.
    pub holder: String,
}

/// Body of `POST /consent`.
#[derive(Debug, Deserialize)]
pub struct ConsentRequest {
    /// The actor.
    pub actor: String,
    /// Whether the actor accepts notifications.
    pub consented: bool,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    shutting_down: bool,
}

// =============================================================================
// Router
// =============================================================================

/// Builds the API router.
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/priority/resolve", post(resolve_priority))
        .route("/auctions", post(open_auction))
        .route("/auctions/{id}", get(auction))
        .route("/auctions/{id}/bids", post(place_bid).get(ranked_bids))
        .route("/auctions/{id}/settle", post(settle_auction))
        .route("/auctions/{id}/cancel", post(cancel_auction))
        .route("/bounties", post(deposit_bounty))
        .route("/bounties/match", post(match_bounties))
        .route("/bounties/{id}", get(bounty_pool))
        .route("/bounties/{id}/top-up", post(top_up_bounty))
        .route("/bounties/{id}/release", post(release_allocation))
        .route("/leases/sweep", post(sweep_leases))
        .route("/leases/{vertical}", get(lease_status))
        .route("/leases/{vertical}/renew", post(renew_lease))
        .route("/leases/{vertical}/expire", post(expire_lease))
        .route("/leases/{vertical}/award", post(award_lease))
        .route("/consent", post(set_consent))
        .with_state(state)
}

async fn health(State(state): State<SharedState>) -> Response {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.uptime_secs(),
        shutting_down: state.is_shutdown_requested(),
    })
    .into_response()
}

async fn resolve_priority(
    State(state): State<SharedState>,
    Json(body): Json<ResolvePriorityRequest>,
) -> Response {
    respond(
        state
            .engine()
            .resolve_priority(&body.vertical, body.actor.as_deref(), body.nonce.as_deref())
            .await,
    )
}

async fn open_auction(State(state): State<SharedState>, Json(body): Json<OpenRound>) -> Response {
    respond(state.engine().open_auction(body).await)
}

async fn auction(State(state): State<SharedState>, Path(id): Path<String>) -> Response {
    respond(state.engine().auction(&id))
}

async fn ranked_bids(State(state): State<SharedState>, Path(id): Path<String>) -> Response {
    respond(state.engine().ranked_bids(&id))
}

async fn place_bid(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(body): Json<PlaceBidRequest>,
) -> Response {
    respond(state.engine().place_bid(&id, &body.bidder, body.amount).await)
}

async fn settle_auction(State(state): State<SharedState>, Path(id): Path<String>) -> Response {
    respond(state.engine().settle_auction(&id).await)
}

async fn cancel_auction(State(state): State<SharedState>, Path(id): Path<String>) -> Response {
    respond(state.engine().cancel_auction(&id))
}

async fn deposit_bounty(
    State(state): State<SharedState>,
    Json(body): Json<DepositRequest>,
) -> Response {
    respond(state.engine().deposit_bounty(body))
}

async fn match_bounties(
    State(state): State<SharedState>,
    Json(body): Json<MatchBountiesRequest>,
) -> Response {
    respond(
        state
            .engine()
            .match_bounties(&body.transaction, body.winning_price)
            .await,
    )
}

async fn bounty_pool(State(state): State<SharedState>, Path(id): Path<String>) -> Response {
    respond(state.engine().bounty_pool(&id))
}

async fn top_up_bounty(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(body): Json<AmountRequest>,
) -> Response {
    respond(state.engine().top_up_bounty(&id, body.amount))
}

async fn release_allocation(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(body): Json<AmountRequest>,
) -> Response {
    respond(state.engine().release_allocation(&id, body.amount))
}

async fn lease_status(State(state): State<SharedState>, Path(vertical): Path<String>) -> Response {
    respond(state.engine().lease_status(&vertical).await)
}

async fn renew_lease(
    State(state): State<SharedState>,
    Path(vertical): Path<String>,
    Json(body): Json<RenewLeaseRequest>,
) -> Response {
    respond(state.engine().renew_lease(&vertical, &body.actor).await)
}

async fn expire_lease(State(state): State<SharedState>, Path(vertical): Path<String>) -> Response {
    respond(state.engine().expire_lease(&vertical).await)
}

async fn award_lease(
    State(state): State<SharedState>,
    Path(vertical): Path<String>,
    Json(body): Json<AwardLeaseRequest>,
) -> Response {
    respond(state.engine().award_lease(&vertical, &body.holder).await)
}

async fn sweep_leases(State(state): State<SharedState>) -> Response {
    respond(OperationOutcome::ok(state.engine().sweep_leases().await))
}

async fn set_consent(
    State(state): State<SharedState>,
    Json(body): Json<ConsentRequest>,
) -> Response {
    let actor = body.actor.trim();
    if actor.is_empty() {
        return (StatusCode::BAD_REQUEST, "actor must not be empty").into_response();
    }
    state.notifications().set_consent(actor, body.consented);
    StatusCode::NO_CONTENT.into_response()
}
