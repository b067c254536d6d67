use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult, GatewayError};
use crate::ledger::models::BankAccount;

/// One disbursement to one seller bank account; `amount` in minor units
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisbursementRequest {
    pub payout_id: Uuid,
    pub seller_id: String,
    pub amount: i64,
    pub currency: String,
    pub recipient_name: String,
    pub account_number: String,
    pub bank_code: String,
}

impl DisbursementRequest {
    pub fn new(payout_id: Uuid, amount: i64, currency: &str, account: &BankAccount) -> Self {
        Self {
            payout_id,
            seller_id: account.seller_id.clone(),
            amount,
            currency: currency.to_string(),
            recipient_name: account.account_holder_name.clone(),
            account_number: account.account_number_encrypted.clone(),
            bank_code: account.bank_code.clone(),
        }
    }

    pub fn description(&self) -> String {
        format!("Seller payout {}", self.payout_id)
    }
}

/// External money-transfer provider.
///
/// Implementations never retry: a failed disbursement is retried by the
/// next scheduler run against a fresh payout row.
#[async_trait]
pub trait DisbursementGateway: Send + Sync {
    /// Returns the provider reference of the accepted disbursement
    async fn disburse(&self, request: &DisbursementRequest) -> Result<String, GatewayError>;

    /// Provider name recorded on payout rows
    fn provider(&self) -> &str;
}

#[derive(Debug, Serialize)]
struct DisbursementBody<'a> {
    data: DisbursementData<'a>,
}

#[derive(Debug, Serialize)]
struct DisbursementData<'a> {
    attributes: DisbursementAttributes<'a>,
}

#[derive(Debug, Serialize)]
struct DisbursementAttributes<'a> {
    amount: i64,
    currency: &'a str,
    recipient_name: &'a str,
    account_number: &'a str,
    bank_code: &'a str,
    description: String,
}

#[derive(Debug, Deserialize)]
struct DisbursementResponse {
    data: DisbursementResource,
}

#[derive(Debug, Deserialize)]
struct DisbursementResource {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ProviderErrors {
    #[serde(default)]
    errors: Vec<ProviderErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ProviderErrorDetail {
    #[serde(default)]
    detail: Option<String>,
}

const FALLBACK_FAILURE: &str = "Failed disbursement request";

/// PayMongo disbursements API client
pub struct PayMongoGateway {
    base_url: String,
    secret_key: String,
    client: reqwest::Client,
}

impl PayMongoGateway {
    pub fn new(base_url: &str, secret_key: &str, timeout: Duration) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            secret_key: secret_key.to_string(),
            client,
        })
    }

    fn authorization(&self) -> String {
        format!("Basic {}", STANDARD.encode(format!("{}:", self.secret_key)))
    }

    fn failure_detail(body: &str) -> String {
        serde_json::from_str::<ProviderErrors>(body)
            .ok()
            .and_then(|e| e.errors.into_iter().find_map(|d| d.detail))
            .unwrap_or_else(|| FALLBACK_FAILURE.to_string())
    }
}

fn transport_error(e: reqwest::Error) -> GatewayError {
    if e.is_timeout() {
        GatewayError::Timeout
    } else {
        GatewayError::Transport(e.to_string())
    }
}

#[async_trait]
impl DisbursementGateway for PayMongoGateway {
    async fn disburse(&self, request: &DisbursementRequest) -> Result<String, GatewayError> {
        let body = DisbursementBody {
            data: DisbursementData {
                attributes: DisbursementAttributes {
                    amount: request.amount,
                    currency: &request.currency,
                    recipient_name: &request.recipient_name,
                    account_number: &request.account_number,
                    bank_code: &request.bank_code,
                    description: request.description(),
                },
            },
        };

        let response = self
            .client
            .post(format!("{}/disbursements", self.base_url))
            .header("Authorization", self.authorization())
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let text = response.text().await.map_err(transport_error)?;

        if !status.is_success() {
            let detail = Self::failure_detail(&text);
            warn!(
                payout_id = %request.payout_id,
                status = status.as_u16(),
                detail = %detail,
                "Disbursement rejected by provider"
            );
            return Err(GatewayError::Rejected(detail));
        }

        let accepted: DisbursementResponse = serde_json::from_str(&text)
            .map_err(|e| GatewayError::Transport(format!("unreadable provider response: {}", e)))?;

        info!(
            payout_id = %request.payout_id,
            disbursement_id = %accepted.data.id,
            amount = request.amount,
            "Disbursement accepted"
        );
        Ok(accepted.data.id)
    }

    fn provider(&self) -> &str {
        "paymongo"
    }
}

/// Canned gateway behaviour for one seller
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    Accept,
    Reject(String),
    Fail(GatewayError),
    /// Never answers; exercises the caller's timeout
    Hang,
}

/// In-process gateway that answers from a per-seller script. Used by the
/// memory storage backend and by tests.
#[derive(Default)]
pub struct ScriptedGateway {
    outcomes: Mutex<HashMap<String, ScriptedOutcome>>,
    calls: Mutex<Vec<DisbursementRequest>>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, seller_id: &str, outcome: ScriptedOutcome) {
        self.outcomes.lock().insert(seller_id.to_string(), outcome);
    }

    pub fn calls(&self) -> Vec<DisbursementRequest> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl DisbursementGateway for ScriptedGateway {
    async fn disburse(&self, request: &DisbursementRequest) -> Result<String, GatewayError> {
        self.calls.lock().push(request.clone());
        let outcome = self
            .outcomes
            .lock()
            .get(&request.seller_id)
            .cloned()
            .unwrap_or(ScriptedOutcome::Accept);

        match outcome {
            ScriptedOutcome::Accept => Ok(format!("disb_{}", request.payout_id.simple())),
            ScriptedOutcome::Reject(detail) => Err(GatewayError::Rejected(detail)),
            ScriptedOutcome::Fail(error) => Err(error),
            ScriptedOutcome::Hang => {
                std::future::pending::<()>().await;
                Err(GatewayError::Timeout)
            }
        }
    }

    fn provider(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::models::BankAccountStatus;

    fn account() -> BankAccount {
        BankAccount {
            id: Uuid::new_v4(),
            seller_id: "seller-a".into(),
            account_holder_name: "Maria Santos".into(),
            bank_code: "BPI".into(),
            account_number_encrypted: "enc:1234".into(),
            is_default: true,
            status: BankAccountStatus::Active,
        }
    }

    #[test]
    fn test_basic_auth_header() {
        let gateway =
            PayMongoGateway::new("https://api.example.test/v1/", "sk_test", Duration::from_secs(1))
                .unwrap();
        assert_eq!(gateway.authorization(), "Basic c2tfdGVzdDo=");
        assert_eq!(gateway.base_url, "https://api.example.test/v1");
    }

    #[test]
    fn test_failure_detail_extraction() {
        let body = r#"{"errors":[{"code":"resource_failed","detail":"Insufficient funds"}]}"#;
        assert_eq!(PayMongoGateway::failure_detail(body), "Insufficient funds");
        assert_eq!(PayMongoGateway::failure_detail("<html>"), FALLBACK_FAILURE);
        assert_eq!(PayMongoGateway::failure_detail(r#"{"errors":[]}"#), FALLBACK_FAILURE);
    }

    #[test]
    fn test_request_body_shape() {
        let request = DisbursementRequest::new(Uuid::nil(), 12_500, "PHP", &account());
        let body = DisbursementBody {
            data: DisbursementData {
                attributes: DisbursementAttributes {
                    amount: request.amount,
                    currency: &request.currency,
                    recipient_name: &request.recipient_name,
                    account_number: &request.account_number,
                    bank_code: &request.bank_code,
                    description: request.description(),
                },
            },
        };

        let json = serde_json::to_value(&body).unwrap();
        let attributes = &json["data"]["attributes"];
        assert_eq!(attributes["amount"], 12_500);
        assert_eq!(attributes["bank_code"], "BPI");
        assert_eq!(
            attributes["description"],
            format!("Seller payout {}", Uuid::nil())
        );
    }

    #[tokio::test]
    async fn test_scripted_gateway_records_calls() {
        let gateway = ScriptedGateway::new();
        gateway.script("seller-a", ScriptedOutcome::Reject("Account closed".into()));

        let request = DisbursementRequest::new(Uuid::new_v4(), 100, "PHP", &account());
        let result = gateway.disburse(&request).await;

        assert_eq!(result, Err(GatewayError::Rejected("Account closed".into())));
        assert_eq!(gateway.calls().len(), 1);
    }
}
