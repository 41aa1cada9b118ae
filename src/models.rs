use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// API key lifecycle status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApiKeyStatus {
    Active,
    Revoked,
}

impl ApiKeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiKeyStatus::Active => "active",
            ApiKeyStatus::Revoked => "revoked",
        }
    }
}

impl std::str::FromStr for ApiKeyStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ApiKeyStatus::Active),
            "revoked" => Ok(ApiKeyStatus::Revoked),
            _ => Err(format!("Invalid API key status: {}", s)),
        }
    }
}

/// API key record from database
#[allow(dead_code)]
#[derive(Debug, Clone)]
pub struct ApiKeyRecord {
    pub id: i64,
    pub api_key: String,
    pub description: Option<String>,
    pub status: ApiKeyStatus,
    pub pricing_plan_id: Option<i64>,
    pub active_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ApiKeyRecord {
    /// A key authorizes proxied requests only while it is active, carries a
    /// plan, and has not run past its activation window.
    pub fn is_effective(&self, now: DateTime<Utc>) -> bool {
        self.status == ApiKeyStatus::Active
            && self.pricing_plan_id.is_some()
            && self.active_until.map(|t| t > now).unwrap_or(false)
    }
}

/// Request budget attached to a pricing plan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyLimits {
    pub requests_per_second: u32,
    pub requests_per_day: u32,
}

#[derive(Debug, Clone)]
pub struct PricingPlan {
    pub id: i64,
    pub name: String,
    pub requests_per_second: i32,
    pub requests_per_day: i32,
    /// Minimal currency units
    pub price: u128,
}

/// Payment session status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentSessionStatus {
    Pending,
    Completed,
    Failed,
    Expired,
    Cancelled,
}

impl PaymentSessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentSessionStatus::Pending => "pending",
            PaymentSessionStatus::Completed => "completed",
            PaymentSessionStatus::Failed => "failed",
            PaymentSessionStatus::Expired => "expired",
            PaymentSessionStatus::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for PaymentSessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PaymentSessionStatus::Pending),
            "completed" => Ok(PaymentSessionStatus::Completed),
            "failed" => Ok(PaymentSessionStatus::Failed),
            "expired" => Ok(PaymentSessionStatus::Expired),
            "cancelled" => Ok(PaymentSessionStatus::Cancelled),
            _ => Err(format!("Invalid payment session status: {}", s)),
        }
    }
}

#[allow(dead_code)]
#[derive(Debug, Clone)]
pub struct PaymentSession {
    pub id: Uuid,
    pub api_key: Option<String>,
    pub payment_address: String,
    /// 32 random bytes, hex encoded
    pub receiver_nonce: String,
    pub status: PaymentSessionStatus,
    pub target_plan_id: i64,
    pub amount_required: u128,
    pub refund_amount: u128,
    pub token_received: Option<String>,
    pub should_create_key: bool,
    pub request_id: Option<String>,
    pub completion_request_json: Option<String>,
    pub completion_request_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

/// One backend aggregator in a shard configuration document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShardInfo {
    pub id: u32,
    pub url: String,
}

/// Shard configuration document; the latest stored row wins
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShardConfig {
    pub version: i64,
    pub shards: Vec<ShardInfo>,
}

// ============================================================================
// API request/response types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiatePaymentRequest {
    #[serde(default)]
    pub api_key: Option<String>,
    pub target_plan_id: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiatePaymentResponse {
    pub session_id: Uuid,
    pub payment_address: String,
    /// Decimal string, minimal currency units
    pub amount_required: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletePaymentRequest {
    pub session_id: Uuid,
    pub salt: String,
    pub transfer_commitment_json: String,
    pub source_token_json: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletePaymentResponse {
    pub success: bool,
    pub message: String,
    pub target_plan_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanView {
    pub id: i64,
    pub name: String,
    pub requests_per_second: i32,
    pub requests_per_day: i32,
    /// Decimal string, clamped up to the minimum payment amount
    pub price: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyStatusResponse {
    pub status: ApiKeyStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pricing_plan_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_until: Option<DateTime<Utc>>,
    /// Whether the key currently authorizes proxied requests
    pub active: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusResponse {
    pub session_id: Uuid,
    pub status: PaymentSessionStatus,
    pub amount_required: String,
    pub payment_address: String,
    pub expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn api_key_status_round_trip() {
        for status in [ApiKeyStatus::Active, ApiKeyStatus::Revoked] {
            assert_eq!(ApiKeyStatus::from_str(status.as_str()), Ok(status));
        }
        assert!(ApiKeyStatus::from_str("suspended").is_err());
    }

    #[test]
    fn session_status_round_trip() {
        for status in [
            PaymentSessionStatus::Pending,
            PaymentSessionStatus::Completed,
            PaymentSessionStatus::Failed,
            PaymentSessionStatus::Expired,
            PaymentSessionStatus::Cancelled,
        ] {
            assert_eq!(
                PaymentSessionStatus::from_str(status.as_str()),
                Ok(status)
            );
        }
    }

    #[test]
    fn effective_requires_plan_and_future_expiry() {
        let now = Utc::now();
        let mut key = ApiKeyRecord {
            id: 1,
            api_key: "sk_test".to_string(),
            description: None,
            status: ApiKeyStatus::Active,
            pricing_plan_id: Some(3),
            active_until: Some(now + chrono::Duration::days(1)),
            created_at: now,
        };
        assert!(key.is_effective(now));

        key.pricing_plan_id = None;
        assert!(!key.is_effective(now));

        key.pricing_plan_id = Some(3);
        key.active_until = Some(now - chrono::Duration::seconds(1));
        assert!(!key.is_effective(now));

        key.active_until = Some(now + chrono::Duration::days(1));
        key.status = ApiKeyStatus::Revoked;
        assert!(!key.is_effective(now));
    }

    #[test]
    fn initiate_request_allows_missing_key() {
        let req: InitiatePaymentRequest =
            serde_json::from_str(r#"{"targetPlanId": 3}"#).unwrap();
        assert!(req.api_key.is_none());
        assert_eq!(req.target_plan_id, 3);
    }

    #[test]
    fn shard_config_deserializes() {
        let config: ShardConfig = serde_json::from_str(
            r#"{"version":1,"shards":[{"id":2,"url":"http://a:3000"},{"id":3,"url":"http://b:3000"}]}"#,
        )
        .unwrap();
        assert_eq!(config.shards.len(), 2);
        assert_eq!(config.shards[0].id, 2);
    }
}
