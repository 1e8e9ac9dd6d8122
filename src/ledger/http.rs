//! HTTP surface over a [`Ledger`].

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use super::allowance::{AdminAdjustment, BatchInitReport};
use super::observability::MetricsSnapshot;
use super::settings::{CreditSettings, SettingKey};
use super::status::AllowanceSnapshot;
use super::store_types::{AllowancePeriodRecord, UsageEventRecord};
use super::usage::{ChargeRequest, ChargeResult, DEFAULT_EVENT_LIMIT};
use super::Ledger;
use crate::error::{InsufficientBalance, LedgerError};

#[derive(Clone)]
pub struct LedgerHttpState {
    ledger: Ledger,
    admin_token: Option<String>,
}

impl LedgerHttpState {
    pub fn new(ledger: Ledger) -> Self {
        Self {
            ledger,
            admin_token: None,
        }
    }

    /// Enables the `/admin` routes, guarded by this bearer token.
    pub fn with_admin_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.admin_token = (!token.trim().is_empty()).then_some(token);
        self
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance: Option<InsufficientBalance>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

type HttpError = (StatusCode, Json<ErrorResponse>);

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LowBalanceWarning {
    pub warning: Option<AllowanceSnapshot>,
}

#[derive(Debug, Deserialize)]
struct AdjustmentBody {
    tokens_granted: u64,
    tokens_used: u64,
    actor: String,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SettingBody {
    value: u64,
}

pub fn router(state: LedgerHttpState) -> Router {
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/v1/charge", post(charge))
        .route("/v1/accounts/:account_id/status", get(status))
        .route("/v1/accounts/:account_id/allowance", get(current_allowance))
        .route("/v1/accounts/:account_id/events", get(list_events))
        .route(
            "/v1/accounts/:account_id/low-balance-warning",
            post(take_low_balance_warning),
        );

    if state.admin_token.is_some() {
        router = router
            .route(
                "/admin/accounts/:account_id/allowance",
                put(apply_admin_adjustment),
            )
            .route("/admin/accounts/:account_id/reconcile", post(reconcile))
            .route("/admin/initialize", post(initialize_all_accounts))
            .route("/admin/settings", get(get_settings))
            .route("/admin/settings/:key", put(set_setting));
    }

    router.with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn metrics(State(state): State<LedgerHttpState>) -> Json<MetricsSnapshot> {
    Json(state.ledger.metrics())
}

async fn charge(
    State(state): State<LedgerHttpState>,
    body: Result<Json<ChargeRequest>, JsonRejection>,
) -> Result<Json<ChargeResult>, HttpError> {
    let request = json_body(body)?;
    let result = state.ledger.usage().charge(request).await.map_err(map_ledger_error)?;
    Ok(Json(result))
}

async fn status(
    State(state): State<LedgerHttpState>,
    Path(account_id): Path<String>,
) -> Result<Json<AllowanceSnapshot>, HttpError> {
    let snapshot = state
        .ledger
        .status()
        .status(&account_id)
        .await
        .map_err(map_ledger_error)?;
    Ok(Json(snapshot))
}

async fn current_allowance(
    State(state): State<LedgerHttpState>,
    Path(account_id): Path<String>,
) -> Result<Json<AllowancePeriodRecord>, HttpError> {
    let period = state
        .ledger
        .allowances()
        .ensure_current_allowance(&account_id)
        .await
        .map_err(map_ledger_error)?;
    Ok(Json(period))
}

async fn list_events(
    State(state): State<LedgerHttpState>,
    Path(account_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Vec<UsageEventRecord>>, HttpError> {
    let limit = query.limit.unwrap_or(DEFAULT_EVENT_LIMIT);
    let events = state
        .ledger
        .usage()
        .list_events(&account_id, limit)
        .await
        .map_err(map_ledger_error)?;
    Ok(Json(events))
}

async fn take_low_balance_warning(
    State(state): State<LedgerHttpState>,
    Path(account_id): Path<String>,
) -> Result<Json<LowBalanceWarning>, HttpError> {
    let warning = state
        .ledger
        .status()
        .take_low_balance_warning(&account_id)
        .await
        .map_err(map_ledger_error)?;
    Ok(Json(LowBalanceWarning { warning }))
}

async fn apply_admin_adjustment(
    State(state): State<LedgerHttpState>,
    headers: HeaderMap,
    Path(account_id): Path<String>,
    body: Result<Json<AdjustmentBody>, JsonRejection>,
) -> Result<Json<AllowancePeriodRecord>, HttpError> {
    ensure_admin(&state, &headers)?;
    let body = json_body(body)?;
    let period = state
        .ledger
        .allowances()
        .apply_admin_adjustment(AdminAdjustment {
            account_id,
            tokens_granted: body.tokens_granted,
            tokens_used: body.tokens_used,
            actor: body.actor,
            reason: body.reason,
        })
        .await
        .map_err(map_ledger_error)?;
    Ok(Json(period))
}

async fn reconcile(
    State(state): State<LedgerHttpState>,
    headers: HeaderMap,
    Path(account_id): Path<String>,
) -> Result<Json<AllowancePeriodRecord>, HttpError> {
    ensure_admin(&state, &headers)?;
    let period = state
        .ledger
        .usage()
        .reconcile(&account_id)
        .await
        .map_err(map_ledger_error)?;
    Ok(Json(period))
}

async fn initialize_all_accounts(
    State(state): State<LedgerHttpState>,
    headers: HeaderMap,
) -> Result<Json<BatchInitReport>, HttpError> {
    ensure_admin(&state, &headers)?;
    let report = state
        .ledger
        .allowances()
        .initialize_all_accounts()
        .await
        .map_err(map_ledger_error)?;
    Ok(Json(report))
}

async fn get_settings(
    State(state): State<LedgerHttpState>,
    headers: HeaderMap,
) -> Result<Json<CreditSettings>, HttpError> {
    ensure_admin(&state, &headers)?;
    let settings = state
        .ledger
        .credit_settings()
        .await
        .map_err(map_ledger_error)?;
    Ok(Json(settings))
}

async fn set_setting(
    State(state): State<LedgerHttpState>,
    headers: HeaderMap,
    Path(key): Path<String>,
    body: Result<Json<SettingBody>, JsonRejection>,
) -> Result<Json<CreditSettings>, HttpError> {
    ensure_admin(&state, &headers)?;
    let body = json_body(body)?;
    let key: SettingKey = key
        .parse()
        .map_err(|err: String| error_response(StatusCode::NOT_FOUND, "unknown_setting", err))?;
    state
        .ledger
        .set_setting(key, body.value)
        .await
        .map_err(map_ledger_error)?;
    let settings = state
        .ledger
        .credit_settings()
        .await
        .map_err(map_ledger_error)?;
    Ok(Json(settings))
}

fn ensure_admin(state: &LedgerHttpState, headers: &HeaderMap) -> Result<(), HttpError> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Err(error_response(
            StatusCode::NOT_FOUND,
            "not_configured",
            "admin auth not configured",
        ));
    };
    let provided = extract_bearer(headers)
        .or_else(|| extract_header(headers, "x-admin-token"))
        .unwrap_or_default();
    if provided == expected {
        return Ok(());
    }
    Err(error_response(
        StatusCode::UNAUTHORIZED,
        "unauthorized",
        "invalid admin token",
    ))
}

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let auth = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())?
        .trim()
        .to_string();
    let rest = auth
        .strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))?;
    let token = rest.trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn extract_header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn map_ledger_error(err: LedgerError) -> HttpError {
    match err {
        LedgerError::InvalidInput { reason } => {
            error_response(StatusCode::BAD_REQUEST, "invalid_input", reason)
        }
        LedgerError::InsufficientBalance(balance) => {
            let message = format!("insufficient balance: {balance}");
            (
                StatusCode::PAYMENT_REQUIRED,
                Json(ErrorResponse {
                    error: ErrorDetail {
                        code: "insufficient_balance".to_string(),
                        message,
                        balance: Some(*balance),
                    },
                }),
            )
        }
        LedgerError::AccountNotFound { account_id } => error_response(
            StatusCode::NOT_FOUND,
            "account_not_found",
            format!("account not found: {account_id}"),
        ),
        LedgerError::Unauthorized { actor } => error_response(
            StatusCode::FORBIDDEN,
            "forbidden",
            format!("actor may not adjust allowances: {actor}"),
        ),
        LedgerError::Storage(err) => {
            tracing::warn!(error = %err, "ledger storage failure");
            error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "storage_unavailable",
                err.to_string(),
            )
        }
    }
}

/// A body the extractor cannot decode is reported as `invalid_input`.
fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, HttpError> {
    body.map(|Json(value)| value).map_err(|rejection| {
        error_response(
            StatusCode::BAD_REQUEST,
            "invalid_input",
            rejection.body_text(),
        )
    })
}

fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> HttpError {
    (
        status,
        Json(ErrorResponse {
            error: ErrorDetail {
                code: code.to_string(),
                message: message.into(),
                balance: None,
            },
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::StoreError;
    use crate::ledger::testing::harness;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::util::ServiceExt;

    #[test]
    fn ledger_errors_map_to_distinct_statuses() {
        let cases = [
            (LedgerError::invalid("bad"), StatusCode::BAD_REQUEST),
            (
                LedgerError::AccountNotFound {
                    account_id: "g".to_string(),
                },
                StatusCode::NOT_FOUND,
            ),
            (
                LedgerError::Unauthorized {
                    actor: "a".to_string(),
                },
                StatusCode::FORBIDDEN,
            ),
            (
                LedgerError::Storage(StoreError::Unavailable {
                    message: "down".to_string(),
                }),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];
        for (err, expected) in cases {
            let (status, _) = map_ledger_error(err);
            assert_eq!(status, expected);
        }
    }

    #[test]
    fn admin_auth_accepts_bearer_or_header() {
        let state = LedgerHttpState::new(harness().ledger).with_admin_token("secret");
        let mut headers = HeaderMap::new();
        let (status, _) = ensure_admin(&state, &headers).unwrap_err();
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        headers.insert("authorization", "Bearer secret".parse().unwrap());
        assert!(ensure_admin(&state, &headers).is_ok());

        let mut headers = HeaderMap::new();
        headers.insert("x-admin-token", "secret".parse().unwrap());
        assert!(ensure_admin(&state, &headers).is_ok());
    }

    #[test]
    fn blank_admin_token_leaves_admin_disabled() {
        let state = LedgerHttpState::new(harness().ledger).with_admin_token("  ");
        let (status, Json(body)) = ensure_admin(&state, &HeaderMap::new()).unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body.error.code, "not_configured");
    }

    #[tokio::test]
    async fn exhausted_charge_is_payment_required_with_balance() {
        let h = harness();
        let app = router(LedgerHttpState::new(h.ledger.clone()));
        h.ledger
            .usage()
            .charge(ChargeRequest::new("guild-free", 60_000, 0, "chat"))
            .await
            .expect("fill");

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/charge")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"account_id":"guild-free","prompt_tokens":1,"completion_tokens":0,"feature":"chat"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: ErrorResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body.error.code, "insufficient_balance");
        let balance = body.error.balance.expect("balance");
        assert_eq!(balance.tokens_remaining, 0);
        assert_eq!(balance.requested_tokens, 1);
    }

    #[tokio::test]
    async fn admin_routes_are_absent_without_token() {
        let app = router(LedgerHttpState::new(harness().ledger));
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/admin/initialize")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
