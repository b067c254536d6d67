use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ledger::models::{LedgerEntry, Order, Payout, PayoutItem};
use crate::settlement::SettlementReport;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub storage: String,
    pub timestamp: DateTime<Utc>,
}

/// Acknowledgement for a provider webhook delivery
#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settlement: Option<SettlementReport>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    /// Most recent N rows; everything when absent
    pub limit: Option<usize>,
}

impl HistoryQuery {
    /// Keep the newest `limit` rows of an oldest-first list
    pub fn tail<T>(&self, mut rows: Vec<T>) -> Vec<T> {
        if let Some(limit) = self.limit {
            let skip = rows.len().saturating_sub(limit);
            rows.drain(..skip);
        }
        rows
    }
}

#[derive(Debug, Serialize)]
pub struct LedgerResponse {
    pub seller_id: String,
    pub entries: Vec<LedgerEntry>,
}

#[derive(Debug, Serialize)]
pub struct OrdersResponse {
    pub seller_id: String,
    pub orders: Vec<Order>,
}

#[derive(Debug, Serialize)]
pub struct PayoutWithItems {
    #[serde(flatten)]
    pub payout: Payout,
    pub items: Vec<PayoutItem>,
}

#[derive(Debug, Serialize)]
pub struct PayoutsResponse {
    pub seller_id: String,
    pub payouts: Vec<PayoutWithItems>,
}

#[derive(Debug, Serialize)]
pub struct StalePayoutsResponse {
    pub older_than_minutes: i64,
    pub payouts: Vec<Payout>,
}
