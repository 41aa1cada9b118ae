//! Payment state machine.
//!
//! Two public operations drive a `PaymentSession` from `pending` to a
//! terminal status. `initiate_payment` creates the session atomically with
//! a pro-rated refund; `complete_payment` records the completion request
//! idempotently, then processes it under row locks. Every path locks
//! api_keys before payment_sessions, so contention shows up as a fast 409
//! instead of a deadlock.

pub mod address;
pub mod sdk;

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::cache::KeyCache;
use crate::error::{ConflictKind, PaymentError};
use crate::models::{ApiKeyStatus, PaymentSessionStatus};
use crate::store;
use crate::store::payments::{NewSession, PENDING_PER_KEY_CONSTRAINT, REQUEST_ID_CONSTRAINT};
use crate::time_source::TimeSource;
use address::{derive_predicate, generate_nonce, payment_address};
use sdk::{SubmitStatus, TokenSdk, TransferCommitment, TrustBase, VerificationResult};

/// Key activations run this long from the moment of completion.
pub const PAYMENT_VALIDITY_DAYS: i64 = 30;
/// A session must be paid within this window.
pub const SESSION_TTL_MINUTES: i64 = 15;

const VALIDITY_MILLIS: u128 = PAYMENT_VALIDITY_DAYS as u128 * 86_400_000;

pub struct PaymentSettings {
    pub server_secret: Vec<u8>,
    pub token_type: Vec<u8>,
    /// Lowercase hex; the only asset accepted as payment
    pub accepted_coin_id: String,
    pub minimum_payment_amount: u128,
    pub trust_base: Option<TrustBase>,
}

pub struct PaymentEngine {
    db: PgPool,
    sdk: Arc<dyn TokenSdk>,
    cache: Arc<KeyCache>,
    time: Arc<dyn TimeSource>,
    settings: PaymentSettings,
}

#[derive(Debug, Clone)]
pub struct InitiatedPayment {
    pub session_id: Uuid,
    pub payment_address: String,
    pub amount_required: u128,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CompletionOutcome {
    pub success: bool,
    pub message: String,
    pub target_plan_id: i64,
    pub api_key: Option<String>,
}

impl PaymentEngine {
    pub fn new(
        db: PgPool,
        sdk: Arc<dyn TokenSdk>,
        cache: Arc<KeyCache>,
        time: Arc<dyn TimeSource>,
        settings: PaymentSettings,
    ) -> Self {
        Self {
            db,
            sdk,
            cache,
            time,
            settings,
        }
    }

    /// Create a pending session for acquiring (no key) or upgrading (key
    /// given) a subscription.
    pub async fn initiate_payment(
        &self,
        api_key: Option<&str>,
        target_plan_id: i64,
    ) -> Result<InitiatedPayment, PaymentError> {
        let now = self.time.now();
        let mut tx = self.db.begin().await?;

        let existing_key = match api_key {
            Some(key) => {
                let record = store::keys::lock_for_update(&mut tx, key)
                    .await
                    .map_err(|e| classify_lock(e, ConflictKind::KeyLockBusy))?
                    .ok_or_else(|| {
                        PaymentError::Validation("Unknown API key".to_string())
                    })?;
                if record.status == ApiKeyStatus::Revoked {
                    return Err(PaymentError::Validation(
                        "API key is revoked".to_string(),
                    ));
                }
                Some(record)
            }
            None => None,
        };

        let plan = store::plans::find(&mut *tx, target_plan_id)
            .await?
            .ok_or_else(|| {
                PaymentError::Validation(format!("Unknown pricing plan {}", target_plan_id))
            })?;

        if let Some(key) = api_key {
            let cancelled = store::payments::cancel_pending_for_key(&mut *tx, key, now).await?;
            if cancelled > 0 {
                debug!(cancelled, "Cancelled stale pending sessions before initiate");
            }
        }

        let nonce = generate_nonce();
        let predicate =
            derive_predicate(&self.settings.server_secret, &nonce, &self.settings.token_type);
        let payment_address = payment_address(&predicate);
        let nonce_hex = hex::encode(nonce);

        let expires_at = now + chrono::Duration::minutes(SESSION_TTL_MINUTES);

        let refund = match &existing_key {
            Some(record) => {
                let current_price = match record.pricing_plan_id {
                    Some(plan_id) => store::plans::find(&mut *tx, plan_id)
                        .await?
                        .map(|p| p.price)
                        .unwrap_or(0),
                    None => 0,
                };
                pro_rated_refund(current_price, record.active_until, expires_at)
            }
            None => 0,
        };

        let amount_required = plan
            .price
            .saturating_sub(refund)
            .max(self.settings.minimum_payment_amount);

        let session_id = Uuid::new_v4();
        let session = NewSession {
            id: session_id,
            api_key,
            payment_address: &payment_address,
            receiver_nonce: &nonce_hex,
            target_plan_id,
            amount_required,
            refund_amount: refund,
            should_create_key: api_key.is_none(),
            created_at: now,
            expires_at,
        };

        store::payments::insert_session(&mut *tx, &session)
            .await
            .map_err(|e| {
                if store::is_unique_violation(&e, PENDING_PER_KEY_CONSTRAINT) {
                    PaymentError::Conflict(ConflictKind::PendingSessionExists)
                } else {
                    e.into()
                }
            })?;

        tx.commit().await?;

        info!(
            session_id = %session_id,
            target_plan_id,
            amount_required = %amount_required,
            new_key = api_key.is_none(),
            "Payment session initiated"
        );

        Ok(InitiatedPayment {
            session_id,
            payment_address,
            amount_required,
            expires_at,
        })
    }

    /// Complete a session by submitting the client's transfer to the
    /// blockchain, validating the received token, and activating the key.
    pub async fn complete_payment(
        &self,
        session_id: Uuid,
        salt: &str,
        transfer_commitment_json: &str,
        source_token_json: &str,
    ) -> Result<CompletionOutcome, PaymentError> {
        let commitment = TransferCommitment::parse(transfer_commitment_json)
            .map_err(PaymentError::Validation)?;
        let source_token: Value = serde_json::from_str(source_token_json)
            .map_err(|e| PaymentError::Validation(format!("Source token is not valid JSON: {}", e)))?;

        // Phase 1: record the completion request in its own short
        // transaction. The conditional update plus the global request_id
        // index make retries idempotent and double-spends a 409.
        let rows = store::payments::record_completion_request(
            &self.db,
            session_id,
            commitment.request_id(),
            transfer_commitment_json,
            self.time.now(),
        )
        .await
        .map_err(|e| {
            if store::is_unique_violation(&e, REQUEST_ID_CONSTRAINT) {
                PaymentError::Conflict(ConflictKind::TokenAlreadyUsed)
            } else {
                e.into()
            }
        })?;

        if rows == 0 {
            return match store::payments::find_by_id(&self.db, session_id).await? {
                Some(_) => Err(PaymentError::Conflict(ConflictKind::DifferentCompletionStored)),
                None => Err(PaymentError::NotFound("Payment session")),
            };
        }

        // Phase 2: process under row locks, api_keys strictly first.
        let mut tx = self.db.begin().await?;

        let snapshot = store::payments::find_by_id(&mut *tx, session_id)
            .await?
            .ok_or(PaymentError::NotFound("Payment session"))?;
        if let Some(key) = &snapshot.api_key {
            store::keys::lock_for_update(&mut tx, key)
                .await
                .map_err(|e| classify_lock(e, ConflictKind::KeyLockBusy))?;
        }

        let session = store::payments::find_by_id_for_update(&mut tx, session_id)
            .await
            .map_err(|e| classify_lock(e, ConflictKind::SessionLockBusy))?
            .ok_or(PaymentError::NotFound("Payment session"))?;

        let now = self.time.now();

        if session.status != PaymentSessionStatus::Pending {
            // A verbatim retry of a finished completion replays its result.
            if session.status == PaymentSessionStatus::Completed
                && session.request_id.as_deref() == Some(commitment.request_id())
            {
                return Ok(CompletionOutcome {
                    success: true,
                    message: "Payment already completed".to_string(),
                    target_plan_id: session.target_plan_id,
                    api_key: session.api_key,
                });
            }
            return Err(PaymentError::Rejected {
                message: "Session is not pending".to_string(),
            });
        }

        if now > session.expires_at {
            store::payments::mark_expired(&mut *tx, session_id).await?;
            tx.commit().await?;
            return Err(PaymentError::Rejected {
                message: "Session has expired".to_string(),
            });
        }

        // The SDK calls run while the locks are held: a concurrent
        // completion of the same session hits NOWAIT instead of submitting
        // the transfer twice.
        match self.sdk.submit_commitment(&commitment).await {
            Ok(SubmitStatus::Success) => {}
            Ok(SubmitStatus::Failed(status)) => {
                return self
                    .fail(
                        tx,
                        session_id,
                        PaymentError::Upstream(format!(
                            "Aggregator rejected commitment: {}",
                            status
                        )),
                    )
                    .await;
            }
            Err(e) => {
                return self
                    .fail(tx, session_id, PaymentError::Upstream(e.to_string()))
                    .await;
            }
        }

        let proof = match self.sdk.wait_inclusion_proof(&commitment).await {
            Ok(proof) => proof,
            Err(e) => {
                return self
                    .fail(tx, session_id, PaymentError::Upstream(e.to_string()))
                    .await;
            }
        };

        let nonce = decode_nonce(&session.receiver_nonce)?;
        let predicate =
            derive_predicate(&self.settings.server_secret, &nonce, &self.settings.token_type);

        let token = match self
            .sdk
            .finalize_transaction(&source_token, &commitment, &proof, &predicate, salt)
            .await
        {
            Ok(token) => token,
            Err(e) => {
                return self
                    .fail(
                        tx,
                        session_id,
                        PaymentError::Rejected {
                            message: format!("Failed to finalize transfer: {}", e),
                        },
                    )
                    .await;
            }
        };

        if let VerificationResult::Failure(reason) =
            self.sdk.verify(&token, self.settings.trust_base.as_ref())
        {
            return self
                .fail(
                    tx,
                    session_id,
                    PaymentError::Rejected {
                        message: format!("Token verification failed: {}", reason),
                    },
                )
                .await;
        }

        let coins = match token.coins() {
            Ok(coins) => coins,
            Err(reason) => {
                return self
                    .fail(
                        tx,
                        session_id,
                        PaymentError::Rejected {
                            message: format!("Token coin data rejected: {}", reason),
                        },
                    )
                    .await;
            }
        };

        if let Err(message) = check_received_amount(
            &coins,
            &self.settings.accepted_coin_id,
            session.amount_required,
        ) {
            return self
                .fail(tx, session_id, PaymentError::Rejected { message })
                .await;
        }

        // Activation: the expiry is set absolutely, never extended. The
        // pro-rated refund at initiation covered the shortened old term.
        let new_expiry = now + chrono::Duration::days(PAYMENT_VALIDITY_DAYS);
        let final_key = if session.should_create_key {
            let key = generate_api_key();
            store::keys::insert(
                &mut *tx,
                &key,
                Some("Created by payment"),
                Some(session.target_plan_id),
                Some(new_expiry),
                now,
            )
            .await?;
            store::payments::set_session_key(&mut *tx, session_id, &key).await?;
            key
        } else {
            let key = session.api_key.clone().ok_or_else(|| {
                PaymentError::Internal("session has no API key to activate".to_string())
            })?;
            store::keys::activate(&mut *tx, &key, session.target_plan_id, new_expiry).await?;
            key
        };

        store::payments::mark_completed(&mut *tx, session_id, &token.serialize(), now).await?;
        tx.commit().await?;

        // The key's budget may have changed; force the next lookup to the
        // database.
        self.cache.invalidate(&final_key).await;

        info!(
            session_id = %session_id,
            target_plan_id = session.target_plan_id,
            "Payment completed, key activated until {}",
            new_expiry
        );

        Ok(CompletionOutcome {
            success: true,
            message: "Payment completed".to_string(),
            target_plan_id: session.target_plan_id,
            api_key: Some(final_key),
        })
    }

    /// Persist the failed status before surfacing the error so retries
    /// observe the same outcome.
    async fn fail(
        &self,
        mut tx: Transaction<'_, Postgres>,
        session_id: Uuid,
        err: PaymentError,
    ) -> Result<CompletionOutcome, PaymentError> {
        store::payments::mark_failed(&mut *tx, session_id).await?;
        tx.commit().await?;
        debug!(session_id = %session_id, "Payment session marked failed: {}", err);
        Err(err)
    }
}

fn classify_lock(err: sqlx::Error, kind: ConflictKind) -> PaymentError {
    if store::is_lock_unavailable(&err) {
        PaymentError::Conflict(kind)
    } else {
        err.into()
    }
}

fn decode_nonce(nonce_hex: &str) -> Result<[u8; 32], PaymentError> {
    let bytes = hex::decode(nonce_hex)
        .map_err(|e| PaymentError::Internal(format!("stored nonce is not hex: {}", e)))?;
    bytes
        .try_into()
        .map_err(|_| PaymentError::Internal("stored nonce is not 32 bytes".to_string()))
}

/// Unused value of the current plan, scaled to the new 30-day term:
/// `price × remaining_ms / validity_ms` with the remainder measured from
/// the new session's end.
pub fn pro_rated_refund(
    current_plan_price: u128,
    active_until: Option<DateTime<Utc>>,
    session_end: DateTime<Utc>,
) -> u128 {
    let Some(active_until) = active_until else {
        return 0;
    };
    let remaining_ms = (active_until - session_end).num_milliseconds().max(0) as u128;
    current_plan_price.saturating_mul(remaining_ms) / VALIDITY_MILLIS
}

/// The received token must carry only the accepted coin and sum to exactly
/// the required amount. No silent overpay.
pub fn check_received_amount(
    coins: &[(String, u128)],
    accepted_coin_id: &str,
    required: u128,
) -> Result<u128, String> {
    if coins.is_empty() {
        return Err("Token contains no coins".to_string());
    }
    if let Some((foreign, _)) = coins
        .iter()
        .find(|(id, _)| !id.eq_ignore_ascii_case(accepted_coin_id))
    {
        return Err(format!("Token contains unsupported coin type {}", foreign));
    }

    let received = coins
        .iter()
        .fold(0u128, |acc, (_, value)| acc.saturating_add(*value));

    if received < required {
        return Err(format!(
            "Insufficient payment: received {}, required {}",
            received, required
        ));
    }
    if received > required {
        return Err("Overpayment not accepted. Please send the exact amount".to_string());
    }
    Ok(received)
}

/// Fresh key string: `sk_` + 32 hex chars of cryptographic randomness.
pub fn generate_api_key() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("sk_{}", hex::encode(bytes))
}
