//! Token SDK contract and the aggregator-backed client.
//!
//! Commitments, inclusion proofs and tokens are opaque JSON documents as
//! far as this service is concerned; the trait pins down the four calls
//! the payment engine needs and their deadlines. The client talks plain
//! JSON-RPC to the aggregator fleet through the live shard router.

use async_trait::async_trait;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use super::address::ReceiverPredicate;
use crate::routing::RouterHandle;

pub const SUBMIT_DEADLINE: Duration = Duration::from_secs(30);
pub const INCLUSION_DEADLINE: Duration = Duration::from_secs(60);
const INCLUSION_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum SdkError {
    #[error("{0} deadline exceeded")]
    Timeout(&'static str),
    #[error("aggregator call failed: {0}")]
    Rpc(String),
    #[error("{0}")]
    Protocol(String),
}

/// A transfer commitment as submitted by the client: an opaque document
/// with a well-defined blockchain request id.
#[derive(Debug, Clone)]
pub struct TransferCommitment {
    raw: Value,
    request_id: String,
}

impl TransferCommitment {
    pub fn parse(json_str: &str) -> Result<Self, String> {
        let raw: Value = serde_json::from_str(json_str)
            .map_err(|e| format!("transfer commitment is not valid JSON: {}", e))?;
        let request_id = raw
            .get("requestId")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or("transfer commitment has no requestId")?
            .to_lowercase();
        Ok(Self { raw, request_id })
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }
}

#[derive(Debug, Clone)]
pub struct InclusionProof {
    pub raw: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitStatus {
    Success,
    Failed(String),
}

/// Token obtained by finalizing a transfer into the receiver predicate.
#[derive(Debug, Clone)]
pub struct ReceivedToken {
    raw: Value,
}

impl ReceivedToken {
    pub fn new(raw: Value) -> Self {
        Self { raw }
    }

    /// Coin entries as `(coin id, value)`. Fails closed: every entry in the
    /// coin map must carry a decimal-string value, so no coin id can vanish
    /// from the list before the coin-type and amount checks run.
    pub fn coins(&self) -> Result<Vec<(String, u128)>, String> {
        let Some(coins) = self.raw.get("coins") else {
            return Ok(Vec::new());
        };
        let Some(coins) = coins.as_object() else {
            return Err("coin data is not an object".to_string());
        };
        coins
            .iter()
            .map(|(coin_id, value)| {
                let amount = value
                    .as_str()
                    .and_then(|s| s.parse::<u128>().ok())
                    .ok_or_else(|| format!("coin {} has an unparseable value", coin_id))?;
                Ok((coin_id.to_lowercase(), amount))
            })
            .collect()
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    pub fn serialize(&self) -> String {
        self.raw.to_string()
    }
}

/// Root-validator document handed to `verify`; loaded once at startup.
#[derive(Debug, Clone)]
pub struct TrustBase {
    raw: Value,
}

impl TrustBase {
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let raw: Value = serde_json::from_str(&contents)?;
        Ok(Self { raw })
    }

    pub fn has_validators(&self) -> bool {
        self.raw
            .get("validators")
            .or_else(|| self.raw.get("roots"))
            .and_then(|v| v.as_array())
            .map(|v| !v.is_empty())
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationResult {
    Ok,
    Failure(String),
}

#[async_trait]
pub trait TokenSdk: Send + Sync {
    async fn submit_commitment(
        &self,
        commitment: &TransferCommitment,
    ) -> Result<SubmitStatus, SdkError>;

    async fn wait_inclusion_proof(
        &self,
        commitment: &TransferCommitment,
    ) -> Result<InclusionProof, SdkError>;

    async fn finalize_transaction(
        &self,
        source_token: &Value,
        commitment: &TransferCommitment,
        proof: &InclusionProof,
        recipient: &ReceiverPredicate,
        salt: &str,
    ) -> Result<ReceivedToken, SdkError>;

    fn verify(&self, token: &ReceivedToken, trust_base: Option<&TrustBase>)
        -> VerificationResult;
}

/// Production SDK backed by the aggregator fleet. Commitment traffic is
/// routed by the commitment's own request id, like any other proxied call.
pub struct AggregatorTokenSdk {
    client: reqwest::Client,
    router: RouterHandle,
}

impl AggregatorTokenSdk {
    pub fn new(client: reqwest::Client, router: RouterHandle) -> Self {
        Self { client, router }
    }

    async fn target_for(&self, commitment: &TransferCommitment) -> Result<String, SdkError> {
        let router = self.router.load().await;
        router
            .route_by_request_id(commitment.request_id())
            .map(|u| u.to_string())
            .map_err(|e| SdkError::Rpc(format!("cannot route commitment: {}", e)))
    }

    async fn call(
        &self,
        target: &str,
        method: &str,
        params: Value,
    ) -> Result<Value, SdkError> {
        let response = self
            .client
            .post(target)
            .json(&json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": method,
                "params": params,
            }))
            .send()
            .await
            .map_err(|e| SdkError::Rpc(format!("{} failed: {}", method, e)))?;

        let body: Value = response
            .json()
            .await
            .map_err(|e| SdkError::Rpc(format!("{} returned invalid JSON: {}", method, e)))?;

        if let Some(error) = body.get("error").filter(|e| !e.is_null()) {
            return Err(SdkError::Rpc(format!("{} error: {}", method, error)));
        }

        Ok(body.get("result").cloned().unwrap_or(Value::Null))
    }
}

#[async_trait]
impl TokenSdk for AggregatorTokenSdk {
    async fn submit_commitment(
        &self,
        commitment: &TransferCommitment,
    ) -> Result<SubmitStatus, SdkError> {
        let target = self.target_for(commitment).await?;
        debug!(request_id = %commitment.request_id(), target = %target, "Submitting transfer commitment");

        let result = tokio::time::timeout(
            SUBMIT_DEADLINE,
            self.call(&target, "submit_commitment", commitment.raw().clone()),
        )
        .await
        .map_err(|_| SdkError::Timeout("submit_commitment"))??;

        match result.get("status").and_then(|s| s.as_str()) {
            Some("SUCCESS") => Ok(SubmitStatus::Success),
            Some(other) => Ok(SubmitStatus::Failed(other.to_string())),
            None => Err(SdkError::Protocol(
                "submit_commitment response has no status".to_string(),
            )),
        }
    }

    async fn wait_inclusion_proof(
        &self,
        commitment: &TransferCommitment,
    ) -> Result<InclusionProof, SdkError> {
        let target = self.target_for(commitment).await?;
        let params = json!({ "requestId": commitment.request_id() });

        let poll = async {
            loop {
                match self.call(&target, "get_inclusion_proof", params.clone()).await {
                    Ok(Value::Null) => {}
                    Ok(proof) => return Ok(InclusionProof { raw: proof }),
                    Err(e) => debug!("Inclusion proof poll failed, retrying: {}", e),
                }
                tokio::time::sleep(INCLUSION_POLL_INTERVAL).await;
            }
        };

        tokio::time::timeout(INCLUSION_DEADLINE, poll)
            .await
            .map_err(|_| SdkError::Timeout("inclusion proof"))?
    }

    async fn finalize_transaction(
        &self,
        source_token: &Value,
        commitment: &TransferCommitment,
        proof: &InclusionProof,
        recipient: &ReceiverPredicate,
        salt: &str,
    ) -> Result<ReceivedToken, SdkError> {
        if !source_token.is_object() {
            return Err(SdkError::Protocol(
                "source token must be a JSON object".to_string(),
            ));
        }

        let mut token = source_token.clone();
        let object = token
            .as_object_mut()
            .ok_or_else(|| SdkError::Protocol("source token must be a JSON object".to_string()))?;
        object.insert(
            "state".to_string(),
            json!({
                "predicate": hex::encode(recipient.reference),
                "salt": salt,
            }),
        );
        object.insert(
            "transfer".to_string(),
            json!({
                "commitment": commitment.raw(),
                "inclusionProof": proof.raw,
                // Proves the service could reconstruct the receiver's signer
                "receiverAuthenticator": {
                    "signerDigest": hex::encode(Sha256::digest(recipient.signing_secret)),
                },
            }),
        );

        Ok(ReceivedToken::new(token))
    }

    fn verify(
        &self,
        token: &ReceivedToken,
        trust_base: Option<&TrustBase>,
    ) -> VerificationResult {
        let proof = token
            .raw()
            .pointer("/transfer/inclusionProof")
            .filter(|p| !p.is_null());
        let Some(proof) = proof else {
            return VerificationResult::Failure("token has no inclusion proof".to_string());
        };
        if proof.get("authenticator").map(|a| a.is_null()).unwrap_or(true) {
            return VerificationResult::Failure(
                "inclusion proof has no authenticator".to_string(),
            );
        }
        if let Some(trust_base) = trust_base {
            if !trust_base.has_validators() {
                return VerificationResult::Failure(
                    "trust base has no validators".to_string(),
                );
            }
        }
        VerificationResult::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commitment_requires_request_id() {
        let ok = TransferCommitment::parse(
            r#"{"requestId":"0xABCD","authenticator":{"sig":"aa"}}"#,
        )
        .unwrap();
        assert_eq!(ok.request_id(), "0xabcd");

        assert!(TransferCommitment::parse(r#"{"authenticator":{}}"#).is_err());
        assert!(TransferCommitment::parse("not json").is_err());
        assert!(TransferCommitment::parse(r#"{"requestId":""}"#).is_err());
    }

    #[test]
    fn coins_parse_decimal_string_values() {
        let token = ReceivedToken::new(serde_json::json!({
            "coins": {
                "AB": "100",
                "cd": "900",
            }
        }));
        let mut coins = token.coins().unwrap();
        coins.sort();
        assert_eq!(
            coins,
            vec![("ab".to_string(), 100), ("cd".to_string(), 900)]
        );
    }

    #[test]
    fn coins_fail_closed_on_garbage_values() {
        // A non-numeric value must reject the token, not drop the entry:
        // otherwise a foreign coin id could vanish before the type check.
        let garbage = ReceivedToken::new(serde_json::json!({
            "coins": { "ab": "100", "cd": {"x": 1} }
        }));
        assert!(garbage.coins().unwrap_err().contains("cd"));

        let not_a_number = ReceivedToken::new(serde_json::json!({
            "coins": { "ab": "not-a-number" }
        }));
        assert!(not_a_number.coins().unwrap_err().contains("ab"));

        let not_an_object = ReceivedToken::new(serde_json::json!({"coins": "zz"}));
        assert!(not_an_object.coins().is_err());
    }

    #[test]
    fn token_without_coins_is_empty() {
        let token = ReceivedToken::new(serde_json::json!({"id": "t1"}));
        assert!(token.coins().unwrap().is_empty());
    }

    #[tokio::test]
    async fn finalize_attaches_state_and_transfer() {
        let sdk = AggregatorTokenSdk::new(
            reqwest::Client::new(),
            RouterHandle::new(crate::routing::ShardRouter::failsafe()),
        );
        let commitment =
            TransferCommitment::parse(r#"{"requestId":"01","authenticator":{"s":1}}"#)
                .unwrap();
        let proof = InclusionProof {
            raw: serde_json::json!({"authenticator": {"sig": "aa"}}),
        };
        let predicate = crate::payment::address::derive_predicate(b"secret", &[1; 32], b"tok");
        let source = serde_json::json!({"id": "t1", "coins": {"ab": "5"}});

        let token = sdk
            .finalize_transaction(&source, &commitment, &proof, &predicate, "salt1")
            .await
            .unwrap();

        assert_eq!(token.raw()["id"], "t1");
        assert_eq!(
            token.raw()["state"]["predicate"],
            hex::encode(predicate.reference)
        );
        assert_eq!(token.raw()["state"]["salt"], "salt1");
        assert!(token.raw()["transfer"]["receiverAuthenticator"]["signerDigest"].is_string());
        assert_eq!(sdk.verify(&token, None), VerificationResult::Ok);
    }

    #[tokio::test]
    async fn verify_rejects_missing_proof() {
        let sdk = AggregatorTokenSdk::new(
            reqwest::Client::new(),
            RouterHandle::new(crate::routing::ShardRouter::failsafe()),
        );
        let token = ReceivedToken::new(serde_json::json!({"id": "t1"}));
        assert!(matches!(
            sdk.verify(&token, None),
            VerificationResult::Failure(_)
        ));
    }
}
