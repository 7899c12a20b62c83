//! HTTP API
//!
//! ```text
//! POST /api/reconcile                 reconcile an owner (aliases below)
//! POST /api/fix-deposits
//! POST /api/clean-database
//! GET  /api/deposits/:owner           list deposit rows
//! GET  /api/deposits/:owner/summary   active-deposit analysis
//! GET  /api/deposits/:owner/history   applied reconciliations
//! GET  /health
//! GET  /metrics                       Prometheus text format
//! ```
//!
//! Every JSON body carries `success` and a `message`; errors map to status
//! codes by kind.

use crate::{
    service::{Change, ReconcileOutcome, ReconcileRequest, ReconciliationService},
    Error,
};
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use deposit_ledger::{LedgerRow, LedgerSummary, OwnerKey, ReconciliationRecord};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

type AppState = Arc<ReconciliationService>;

/// Build the router
pub fn router(service: Arc<ReconciliationService>) -> Router {
    Router::new()
        .route("/api/reconcile", post(reconcile).fallback(method_not_allowed))
        .route("/api/fix-deposits", post(reconcile).fallback(method_not_allowed))
        .route("/api/clean-database", post(reconcile).fallback(method_not_allowed))
        .route("/api/deposits/:owner", get(list_deposits))
        .route("/api/deposits/:owner/summary", get(deposit_summary))
        .route("/api/deposits/:owner/history", get(reconciliation_history))
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

/// Reconcile request body
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileBody {
    /// Owner (wallet address)
    #[serde(alias = "userAddress")]
    pub owner_key: String,

    /// Target to use instead of the oracle balance
    #[serde(default, alias = "targetBalance", with = "rust_decimal::serde::float_option")]
    pub target_balance_override: Option<Decimal>,

    /// Compute only
    #[serde(default)]
    pub dry_run: bool,
}

/// Envelope shared by JSON responses
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    success: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
}

impl<T> ApiResponse<T> {
    fn ok(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
        }
    }
}

/// Reconciliation result
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileData {
    outcome: &'static str,
    #[serde(with = "rust_decimal::serde::float")]
    old_total: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    new_total: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    target: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    difference: Decimal,
    in_sync: bool,
    dry_run: bool,
    updates_applied: usize,
    changes: Vec<ChangeDto>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChangeDto {
    deposit_id: Uuid,
    #[serde(with = "rust_decimal::serde::float")]
    old_balance: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    new_balance: Decimal,
    tx_hash: String,
}

impl From<Change> for ChangeDto {
    fn from(change: Change) -> Self {
        Self {
            deposit_id: change.deposit_id,
            old_balance: change.old_balance,
            new_balance: change.new_balance,
            tx_hash: change.tx_hash,
        }
    }
}

impl From<ReconcileOutcome> for ReconcileData {
    fn from(outcome: ReconcileOutcome) -> Self {
        Self {
            outcome: outcome.outcome.as_str(),
            old_total: outcome.old_total,
            new_total: outcome.new_total,
            target: outcome.target,
            difference: outcome.difference,
            in_sync: outcome.in_sync,
            dry_run: outcome.dry_run,
            updates_applied: outcome.updates_applied,
            changes: outcome.changes.into_iter().map(ChangeDto::from).collect(),
        }
    }
}

#[derive(Debug, Serialize)]
struct DepositsResponse {
    success: bool,
    deposits: Vec<DepositDto>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DepositDto {
    id: Uuid,
    #[serde(with = "rust_decimal::serde::float")]
    principal: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    current_balance: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    accumulated_yield: Decimal,
    tx_hash: String,
    chain_id: u64,
    created_at: DateTime<Utc>,
    last_reconciled_at: Option<DateTime<Utc>>,
}

impl From<LedgerRow> for DepositDto {
    fn from(row: LedgerRow) -> Self {
        Self {
            id: row.id,
            principal: row.principal,
            current_balance: row.current_balance,
            accumulated_yield: row.accumulated_yield,
            tx_hash: row.tx_hash,
            chain_id: row.chain_id,
            created_at: DateTime::from_timestamp_nanos(row.sequence_key),
            last_reconciled_at: row.last_reconciled_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SummaryDto {
    total_deposits: usize,
    active_deposits: usize,
    #[serde(with = "rust_decimal::serde::float")]
    total_principal: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    total_current_balance: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    total_redeemed: Decimal,
}

impl From<LedgerSummary> for SummaryDto {
    fn from(summary: LedgerSummary) -> Self {
        Self {
            total_deposits: summary.total_deposits,
            active_deposits: summary.active_deposits,
            total_principal: summary.total_principal,
            total_current_balance: summary.total_current_balance,
            total_redeemed: summary.total_redeemed,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RecordDto {
    record_id: Uuid,
    #[serde(with = "rust_decimal::serde::float")]
    target: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    old_total: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    new_total: Decimal,
    rows_updated: u32,
    applied_at: DateTime<Utc>,
}

impl From<ReconciliationRecord> for RecordDto {
    fn from(record: ReconciliationRecord) -> Self {
        Self {
            record_id: record.record_id,
            target: record.target,
            old_total: record.old_total,
            new_total: record.new_total,
            rows_updated: record.rows_updated,
            applied_at: record.applied_at,
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    total_rows: u64,
    total_reconciliations: u64,
}

/// Error response
#[derive(Debug)]
pub enum ApiError {
    /// Request could not be parsed
    BadRequest(String),
    /// Service error
    Service(Error),
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError::Service(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "invalid_input", msg),
            ApiError::Service(err) => {
                let status = match &err {
                    Error::Ledger(deposit_ledger::Error::InvalidInput(_)) => StatusCode::BAD_REQUEST,
                    Error::Ledger(deposit_ledger::Error::RowNotFound(_)) | Error::NoDeposits(_) => {
                        StatusCode::NOT_FOUND
                    }
                    Error::Ledger(deposit_ledger::Error::RemainderOutOfTolerance { .. }) => {
                        StatusCode::CONFLICT
                    }
                    Error::Oracle(_) => StatusCode::BAD_GATEWAY,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, err.kind(), err.to_string())
            }
        };

        (
            status,
            Json(serde_json::json!({
                "success": false,
                "message": message,
                "error": kind,
            })),
        )
            .into_response()
    }
}

fn owner_from(raw: &str) -> Result<OwnerKey, ApiError> {
    let owner = OwnerKey::new(raw);
    if owner.is_empty() {
        return Err(ApiError::BadRequest("ownerKey is required".to_string()));
    }
    Ok(owner)
}

async fn reconcile(
    State(service): State<AppState>,
    body: Result<Json<ReconcileBody>, JsonRejection>,
) -> Result<Json<ApiResponse<ReconcileData>>, ApiError> {
    let Json(body) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let owner = owner_from(&body.owner_key)?;

    if let Some(target) = body.target_balance_override {
        if target < Decimal::ZERO {
            return Err(ApiError::BadRequest(format!(
                "targetBalanceOverride must be non-negative, got {}",
                target
            )));
        }
    }

    let outcome = service
        .reconcile(ReconcileRequest {
            owner,
            target_override: body.target_balance_override,
            dry_run: body.dry_run,
        })
        .await?;

    let message = outcome.message();
    Ok(Json(ApiResponse::ok(message, outcome.into())))
}

async fn method_not_allowed() -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        Json(serde_json::json!({
            "success": false,
            "message": "Method not allowed",
        })),
    )
        .into_response()
}

async fn list_deposits(
    State(service): State<AppState>,
    Path(owner): Path<String>,
) -> Result<Json<DepositsResponse>, ApiError> {
    let owner = owner_from(&owner)?;
    let deposits = service.deposits(&owner)?;

    Ok(Json(DepositsResponse {
        success: true,
        deposits: deposits.into_iter().map(DepositDto::from).collect(),
    }))
}

async fn deposit_summary(
    State(service): State<AppState>,
    Path(owner): Path<String>,
) -> Result<Json<ApiResponse<SummaryDto>>, ApiError> {
    let owner = owner_from(&owner)?;
    let summary = service.ledger().summary(&owner).map_err(Error::from)?;

    Ok(Json(ApiResponse::ok(
        format!("{} active of {} deposits", summary.active_deposits, summary.total_deposits),
        summary.into(),
    )))
}

async fn reconciliation_history(
    State(service): State<AppState>,
    Path(owner): Path<String>,
) -> Result<Json<ApiResponse<Vec<RecordDto>>>, ApiError> {
    let owner = owner_from(&owner)?;
    let records = service.history(&owner)?;

    Ok(Json(ApiResponse::ok(
        format!("{} reconciliation(s)", records.len()),
        records.into_iter().map(RecordDto::from).collect(),
    )))
}

async fn health_check(State(service): State<AppState>) -> Result<Json<HealthResponse>, ApiError> {
    let stats = service.ledger().stats().map_err(Error::from)?;

    Ok(Json(HealthResponse {
        status: "healthy",
        service: "deposit-reconciler",
        version: env!("CARGO_PKG_VERSION"),
        total_rows: stats.total_rows,
        total_reconciliations: stats.total_reconciliations,
    }))
}

async fn metrics_handler(State(service): State<AppState>) -> Result<String, ApiError> {
    Ok(service.metrics().export()?)
}
