use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::models::*;
use crate::error::LedgerError;

/// Durable balances, orders, payouts and the append-only ledger.
///
/// Every method that touches more than one record is a single unit of work:
/// implementations either commit all of it or none of it. Balance mutations
/// are serialized per seller and never leave `pending_amount` or
/// `available_amount` negative.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Atomically apply all four deltas, creating a zero row if absent.
    async fn apply_delta(&self, delta: &BalanceDelta) -> Result<SellerBalance, LedgerError>;

    /// Insert one immutable ledger row.
    async fn append_entry(&self, entry: NewLedgerEntry) -> Result<LedgerEntry, LedgerError>;

    async fn get_balance(&self, seller_id: &str) -> Result<Option<SellerBalance>, LedgerError>;

    /// Ledger rows for a seller, oldest first.
    async fn entries_for_seller(&self, seller_id: &str) -> Result<Vec<LedgerEntry>, LedgerError>;

    async fn orders_by_payment_reference(
        &self,
        payment_reference: &str,
    ) -> Result<Vec<Order>, LedgerError>;

    async fn orders_for_seller(&self, seller_id: &str) -> Result<Vec<Order>, LedgerError>;

    /// Insert the order, credit pending/earned by its net amount and append
    /// the `credit_pending` entry. Fails with `DuplicateOrder` when the
    /// (payment_reference, seller_id) pair already exists.
    async fn settle_order(&self, order: NewOrder) -> Result<SettledOrder, LedgerError>;

    /// Sellers owning at least one pending order with `payout_eligible_at <= now`.
    async fn sellers_with_matured_orders(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, LedgerError>;

    /// Move the seller's matured pending orders to ready, shift their net sum
    /// from pending to available and append one `release_available` entry.
    /// Orders are selected and flipped inside the same unit of work as the
    /// balance delta, so a re-run finds nothing left to release.
    async fn release_matured(
        &self,
        seller_id: &str,
        now: DateTime<Utc>,
        currency: &str,
    ) -> Result<Option<Release>, LedgerError>;

    async fn sellers_with_available_at_least(
        &self,
        threshold: i64,
    ) -> Result<Vec<SellerBalance>, LedgerError>;

    /// Ready orders for a seller, oldest first.
    async fn ready_orders(&self, seller_id: &str) -> Result<Vec<Order>, LedgerError>;

    /// Insert a payout row in `processing`.
    async fn create_payout(&self, payout: NewPayout) -> Result<Payout, LedgerError>;

    /// processing -> failed. Balances and orders are untouched.
    async fn fail_payout(
        &self,
        payout_id: Uuid,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<Payout, LedgerError>;

    /// processing -> succeeded, payout items, orders ready -> paid, balance
    /// debit and the `payout_debit` entry, all in one unit of work.
    async fn complete_payout(&self, completion: PayoutCompletion) -> Result<Payout, LedgerError>;

    async fn processing_payouts_for_seller(
        &self,
        seller_id: &str,
    ) -> Result<Vec<Payout>, LedgerError>;

    /// Processing payouts created before `older_than`.
    async fn stale_processing_payouts(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Payout>, LedgerError>;

    async fn payouts_for_seller(&self, seller_id: &str) -> Result<Vec<Payout>, LedgerError>;

    async fn payout_items(&self, payout_id: Uuid) -> Result<Vec<PayoutItem>, LedgerError>;
}

/// Read-only view of seller payout destinations
#[async_trait]
pub trait BankDirectory: Send + Sync {
    /// The seller's active default account, if any.
    async fn default_bank_account(
        &self,
        seller_id: &str,
    ) -> Result<Option<BankAccount>, LedgerError>;
}
