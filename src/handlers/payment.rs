//! HTTP edge of the payment engine.

use axum::{
    extract::{Path, State},
    Json,
};
use uuid::Uuid;

use crate::error::PaymentError;
use crate::models::{
    ApiKeyStatus, CompletePaymentRequest, CompletePaymentResponse, InitiatePaymentRequest,
    InitiatePaymentResponse, KeyStatusResponse, PlanView, SessionStatusResponse,
};
use crate::store;
use crate::AppState;

/// POST /api/payment/initiate
pub async fn initiate_payment(
    State(state): State<AppState>,
    Json(req): Json<InitiatePaymentRequest>,
) -> Result<Json<InitiatePaymentResponse>, PaymentError> {
    let initiated = state
        .engine
        .initiate_payment(req.api_key.as_deref(), req.target_plan_id)
        .await?;

    Ok(Json(InitiatePaymentResponse {
        session_id: initiated.session_id,
        payment_address: initiated.payment_address,
        amount_required: initiated.amount_required.to_string(),
        expires_at: initiated.expires_at,
    }))
}

/// POST /api/payment/complete
pub async fn complete_payment(
    State(state): State<AppState>,
    Json(req): Json<CompletePaymentRequest>,
) -> Result<Json<CompletePaymentResponse>, PaymentError> {
    let outcome = state
        .engine
        .complete_payment(
            req.session_id,
            &req.salt,
            &req.transfer_commitment_json,
            &req.source_token_json,
        )
        .await?;

    Ok(Json(CompletePaymentResponse {
        success: outcome.success,
        message: outcome.message,
        target_plan_id: outcome.target_plan_id,
        api_key: outcome.api_key,
    }))
}

/// GET /api/payment/plans
///
/// Displayed prices are clamped up to the minimum payment amount, matching
/// what initiate will actually charge.
pub async fn list_plans(
    State(state): State<AppState>,
) -> Result<Json<Vec<PlanView>>, PaymentError> {
    let plans = store::plans::list(&state.db).await?;
    let minimum = state.config.minimum_payment_amount;

    Ok(Json(
        plans
            .into_iter()
            .map(|plan| PlanView {
                id: plan.id,
                name: plan.name,
                requests_per_second: plan.requests_per_second,
                requests_per_day: plan.requests_per_day,
                price: plan.price.max(minimum).to_string(),
            })
            .collect(),
    ))
}

/// GET /api/payment/key/{apiKey}
///
/// Revoked keys answer 404, same as unknown ones.
pub async fn key_status(
    State(state): State<AppState>,
    Path(api_key): Path<String>,
) -> Result<Json<KeyStatusResponse>, PaymentError> {
    let record = store::keys::find_by_key(&state.db, &api_key)
        .await?
        .filter(|record| record.status != ApiKeyStatus::Revoked)
        .ok_or(PaymentError::NotFound("API key"))?;

    let plan_name = match record.pricing_plan_id {
        Some(plan_id) => store::plans::find(&state.db, plan_id)
            .await?
            .map(|plan| plan.name),
        None => None,
    };

    let active = record.is_effective(state.time.now());
    Ok(Json(KeyStatusResponse {
        status: record.status,
        pricing_plan_id: record.pricing_plan_id,
        plan_name,
        active_until: record.active_until,
        active,
    }))
}

/// GET /api/payment/session/{sessionId}
pub async fn session_status(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<SessionStatusResponse>, PaymentError> {
    let session = store::payments::find_by_id(&state.db, session_id)
        .await?
        .ok_or(PaymentError::NotFound("Payment session"))?;

    Ok(Json(SessionStatusResponse {
        session_id: session.id,
        status: session.status,
        amount_required: session.amount_required.to_string(),
        payment_address: session.payment_address,
        expires_at: session.expires_at,
    }))
}
