use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, types::Json, Type};
use std::fmt;
use uuid::Uuid;

use crate::error::LedgerError;

/// Seller payout lifecycle of an order: pending -> ready -> paid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "payout_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PayoutStatus {
    Pending,
    Ready,
    Paid,
}

impl PayoutStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayoutStatus::Pending => "pending",
            PayoutStatus::Ready => "ready",
            PayoutStatus::Paid => "paid",
        }
    }

    /// Only forward moves are allowed
    pub fn can_transition_to(&self, next: PayoutStatus) -> bool {
        matches!(
            (self, next),
            (PayoutStatus::Pending, PayoutStatus::Ready) | (PayoutStatus::Ready, PayoutStatus::Paid)
        )
    }
}

impl fmt::Display for PayoutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "order_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Completed,
}

/// Status of one disbursement attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "payout_run_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PayoutRunStatus {
    Processing,
    Succeeded,
    Failed,
}

impl PayoutRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayoutRunStatus::Processing => "processing",
            PayoutRunStatus::Succeeded => "succeeded",
            PayoutRunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PayoutRunStatus::Processing)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "ledger_entry_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LedgerEntryType {
    CreditPending,
    ReleaseAvailable,
    PayoutDebit,
}

impl LedgerEntryType {
    /// Signed effect of an entry of `amount` on the balance fields
    pub fn delta(&self, seller_id: &str, amount: i64) -> BalanceDelta {
        match self {
            LedgerEntryType::CreditPending => BalanceDelta::credit_pending(seller_id, amount),
            LedgerEntryType::ReleaseAvailable => BalanceDelta::release(seller_id, amount),
            LedgerEntryType::PayoutDebit => BalanceDelta::payout(seller_id, amount),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "bank_account_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BankAccountStatus {
    Active,
    Inactive,
}

/// Materialized per-seller balance; amounts in minor units
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct SellerBalance {
    pub seller_id: String,
    pub pending_amount: i64,
    pub available_amount: i64,
    pub lifetime_earned: i64,
    pub lifetime_paid: i64,
    pub updated_at: DateTime<Utc>,
}

impl SellerBalance {
    pub fn zero(seller_id: impl Into<String>) -> Self {
        Self {
            seller_id: seller_id.into(),
            pending_amount: 0,
            available_amount: 0,
            lifetime_earned: 0,
            lifetime_paid: 0,
            updated_at: Utc::now(),
        }
    }

    /// lifetime_earned == lifetime_paid + available + pending
    pub fn is_consistent(&self) -> bool {
        self.lifetime_earned == self.lifetime_paid + self.available_amount + self.pending_amount
    }

    /// Apply all four deltas or none of them
    pub fn apply(&self, delta: &BalanceDelta) -> Result<SellerBalance, LedgerError> {
        let violation = |field: &'static str, current: i64, delta: i64| LedgerError::InvariantViolation {
            seller_id: self.seller_id.clone(),
            field,
            current,
            delta,
        };

        let pending = self
            .pending_amount
            .checked_add(delta.pending)
            .filter(|v| *v >= 0)
            .ok_or_else(|| violation("pending_amount", self.pending_amount, delta.pending))?;
        let available = self
            .available_amount
            .checked_add(delta.available)
            .filter(|v| *v >= 0)
            .ok_or_else(|| violation("available_amount", self.available_amount, delta.available))?;
        let earned = self
            .lifetime_earned
            .checked_add(delta.earned)
            .filter(|v| *v >= 0)
            .ok_or_else(|| violation("lifetime_earned", self.lifetime_earned, delta.earned))?;
        let paid = self
            .lifetime_paid
            .checked_add(delta.paid)
            .filter(|v| *v >= 0)
            .ok_or_else(|| violation("lifetime_paid", self.lifetime_paid, delta.paid))?;

        Ok(SellerBalance {
            seller_id: self.seller_id.clone(),
            pending_amount: pending,
            available_amount: available,
            lifetime_earned: earned,
            lifetime_paid: paid,
            updated_at: Utc::now(),
        })
    }
}

/// Checked sum of order amounts for one seller
pub fn total_amount<I>(seller_id: &str, amounts: I) -> Result<i64, LedgerError>
where
    I: IntoIterator<Item = i64>,
{
    amounts
        .into_iter()
        .try_fold(0_i64, i64::checked_add)
        .ok_or_else(|| LedgerError::AmountOverflow {
            seller_id: seller_id.to_string(),
        })
}

/// Four-field balance mutation, applied atomically
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BalanceDelta {
    pub seller_id: String,
    pub pending: i64,
    pub available: i64,
    pub earned: i64,
    pub paid: i64,
}

impl BalanceDelta {
    pub fn credit_pending(seller_id: &str, amount: i64) -> Self {
        Self {
            seller_id: seller_id.to_string(),
            pending: amount,
            available: 0,
            earned: amount,
            paid: 0,
        }
    }

    pub fn release(seller_id: &str, amount: i64) -> Self {
        Self {
            seller_id: seller_id.to_string(),
            pending: -amount,
            available: amount,
            earned: 0,
            paid: 0,
        }
    }

    pub fn payout(seller_id: &str, amount: i64) -> Self {
        Self {
            seller_id: seller_id.to_string(),
            pending: 0,
            available: -amount,
            earned: 0,
            paid: amount,
        }
    }
}

/// Snapshot of one purchased product, stored on the order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItemSnapshot {
    pub product_id: String,
    pub name: Option<String>,
    /// Unit price in minor units of the payout currency
    pub unit_price: i64,
    pub quantity: i64,
}

/// One order per seller per checkout session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Order {
    pub id: Uuid,
    pub payment_reference: String,
    pub seller_id: String,
    pub buyer_id: String,
    pub buyer_display_name: Option<String>,
    pub gross_amount: i64,
    pub platform_fee_amount: i64,
    pub seller_net_amount: i64,
    pub line_items: Json<Vec<LineItemSnapshot>>,
    pub status: OrderStatus,
    pub payout_status: PayoutStatus,
    pub payout_eligible_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Order insert payload
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub payment_reference: String,
    pub seller_id: String,
    pub buyer_id: String,
    pub buyer_display_name: Option<String>,
    pub gross_amount: i64,
    pub platform_fee_amount: i64,
    pub seller_net_amount: i64,
    pub line_items: Vec<LineItemSnapshot>,
    pub payout_eligible_at: DateTime<Utc>,
    pub currency: String,
}

impl NewOrder {
    pub fn into_order(self, created_at: DateTime<Utc>) -> Order {
        Order {
            id: Uuid::new_v4(),
            payment_reference: self.payment_reference,
            seller_id: self.seller_id,
            buyer_id: self.buyer_id,
            buyer_display_name: self.buyer_display_name,
            gross_amount: self.gross_amount,
            platform_fee_amount: self.platform_fee_amount,
            seller_net_amount: self.seller_net_amount,
            line_items: Json(self.line_items),
            status: OrderStatus::Completed,
            payout_status: PayoutStatus::Pending,
            payout_eligible_at: self.payout_eligible_at,
            created_at,
        }
    }
}

/// Immutable audit record of one balance-affecting event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct LedgerEntry {
    pub id: Uuid,
    /// Write order; replay follows it, timestamps may tie
    pub seq: i64,
    pub seller_id: String,
    pub order_id: Option<Uuid>,
    pub payout_id: Option<Uuid>,
    pub entry_type: LedgerEntryType,
    /// Always positive; the sign comes from `entry_type`
    pub amount: i64,
    pub currency: String,
    pub description: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewLedgerEntry {
    pub seller_id: String,
    pub order_id: Option<Uuid>,
    pub payout_id: Option<Uuid>,
    pub entry_type: LedgerEntryType,
    pub amount: i64,
    pub currency: String,
    pub description: String,
    pub metadata: serde_json::Value,
}

impl NewLedgerEntry {
    pub fn credit_pending(order: &Order, currency: &str) -> Self {
        Self {
            seller_id: order.seller_id.clone(),
            order_id: Some(order.id),
            payout_id: None,
            entry_type: LedgerEntryType::CreditPending,
            amount: order.seller_net_amount,
            currency: currency.to_string(),
            description: format!("Sale credited to pending balance for order {}", order.id),
            metadata: serde_json::json!({
                "payment_reference": order.payment_reference,
                "gross_amount": order.gross_amount,
                "platform_fee_amount": order.platform_fee_amount,
                "payout_eligible_at": order.payout_eligible_at,
            }),
        }
    }

    pub fn release(seller_id: &str, amount: i64, order_ids: &[Uuid], currency: &str) -> Self {
        Self {
            seller_id: seller_id.to_string(),
            order_id: None,
            payout_id: None,
            entry_type: LedgerEntryType::ReleaseAvailable,
            amount,
            currency: currency.to_string(),
            description: "Hold period released to available balance".to_string(),
            metadata: serde_json::json!({ "order_ids": order_ids }),
        }
    }

    pub fn payout_debit(completion: &PayoutCompletion) -> Self {
        let order_ids: Vec<Uuid> = completion.orders.iter().map(|(id, _)| *id).collect();
        Self {
            seller_id: completion.seller_id.clone(),
            order_id: None,
            payout_id: Some(completion.payout_id),
            entry_type: LedgerEntryType::PayoutDebit,
            amount: completion.amount,
            currency: completion.currency.clone(),
            description: format!("Payout sent to bank for {}", completion.payout_id),
            metadata: serde_json::json!({
                "disbursement_id": completion.provider_reference,
                "order_ids": order_ids,
            }),
        }
    }

    pub fn into_entry(self, seq: i64, created_at: DateTime<Utc>) -> LedgerEntry {
        LedgerEntry {
            id: Uuid::new_v4(),
            seq,
            seller_id: self.seller_id,
            order_id: self.order_id,
            payout_id: self.payout_id,
            entry_type: self.entry_type,
            amount: self.amount,
            currency: self.currency,
            description: self.description,
            metadata: self.metadata,
            created_at,
        }
    }
}

/// One disbursement attempt for one seller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Payout {
    pub id: Uuid,
    pub seller_id: String,
    pub bank_account_id: Uuid,
    pub amount: i64,
    pub currency: String,
    pub provider: String,
    pub status: PayoutRunStatus,
    pub provider_reference: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewPayout {
    pub seller_id: String,
    pub bank_account_id: Uuid,
    pub amount: i64,
    pub currency: String,
    pub provider: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct PayoutItem {
    pub id: Uuid,
    pub payout_id: Uuid,
    pub order_id: Uuid,
    pub amount: i64,
}

/// Everything written when a disbursement is confirmed
#[derive(Debug, Clone)]
pub struct PayoutCompletion {
    pub payout_id: Uuid,
    pub seller_id: String,
    pub provider_reference: String,
    pub amount: i64,
    pub currency: String,
    /// (order id, contributed amount), oldest first
    pub orders: Vec<(Uuid, i64)>,
    pub processed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct BankAccount {
    pub id: Uuid,
    pub seller_id: String,
    pub account_holder_name: String,
    pub bank_code: String,
    /// Stored encrypted; passed through to the provider as-is
    pub account_number_encrypted: String,
    pub is_default: bool,
    pub status: BankAccountStatus,
}

/// Result of settling one seller group
#[derive(Debug, Clone)]
pub struct SettledOrder {
    pub order: Order,
    pub balance: SellerBalance,
    pub entry: LedgerEntry,
}

/// Result of releasing one seller's matured orders
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Release {
    pub seller_id: String,
    pub amount: i64,
    pub order_ids: Vec<Uuid>,
    pub balance: SellerBalance,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payout_status_is_monotonic() {
        assert!(PayoutStatus::Pending.can_transition_to(PayoutStatus::Ready));
        assert!(PayoutStatus::Ready.can_transition_to(PayoutStatus::Paid));
        assert!(!PayoutStatus::Pending.can_transition_to(PayoutStatus::Paid));
        assert!(!PayoutStatus::Paid.can_transition_to(PayoutStatus::Ready));
        assert!(!PayoutStatus::Ready.can_transition_to(PayoutStatus::Pending));
    }

    #[test]
    fn test_apply_delta_keeps_invariant() {
        let balance = SellerBalance::zero("seller-a");
        let credited = balance.apply(&BalanceDelta::credit_pending("seller-a", 1350)).unwrap();
        assert_eq!(credited.pending_amount, 1350);
        assert_eq!(credited.lifetime_earned, 1350);
        assert!(credited.is_consistent());

        let released = credited.apply(&BalanceDelta::release("seller-a", 1350)).unwrap();
        assert_eq!(released.pending_amount, 0);
        assert_eq!(released.available_amount, 1350);
        assert!(released.is_consistent());

        let paid = released.apply(&BalanceDelta::payout("seller-a", 1350)).unwrap();
        assert_eq!(paid.available_amount, 0);
        assert_eq!(paid.lifetime_paid, 1350);
        assert!(paid.is_consistent());
    }

    #[test]
    fn test_apply_delta_rejects_negative_available() {
        let balance = SellerBalance::zero("seller-a")
            .apply(&BalanceDelta::credit_pending("seller-a", 100))
            .unwrap();

        let err = balance.apply(&BalanceDelta::payout("seller-a", 50)).unwrap_err();
        match err {
            LedgerError::InvariantViolation { field, current, delta, .. } => {
                assert_eq!(field, "available_amount");
                assert_eq!(current, 0);
                assert_eq!(delta, -50);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_apply_delta_is_all_or_nothing() {
        let balance = SellerBalance::zero("seller-a");
        // pending would go negative even though available is fine
        let delta = BalanceDelta::release("seller-a", 10);
        assert!(balance.apply(&delta).is_err());
        assert_eq!(balance.pending_amount, 0);
        assert_eq!(balance.available_amount, 0);
    }

    #[test]
    fn test_total_amount_is_checked() {
        assert_eq!(total_amount("seller-a", [900, 450]).unwrap(), 1350);
        assert!(matches!(
            total_amount("seller-a", [i64::MAX, 1]),
            Err(LedgerError::AmountOverflow { .. })
        ));
    }
}
