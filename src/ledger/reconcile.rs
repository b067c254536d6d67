// Ledger replay - the ledger is the source of truth, balances are a cache of it
use serde::Serialize;
use tracing::{error, info};

use super::models::{LedgerEntry, SellerBalance};
use super::store::LedgerStore;
use crate::error::LedgerError;

#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationReport {
    pub seller_id: String,
    pub cached: Option<SellerBalance>,
    pub replayed: SellerBalance,
    pub entry_count: usize,
    pub consistent: bool,
}

/// Rebuild a seller balance from its ledger entries in write (`seq`) order.
///
/// Replaying never clamps: an entry sequence that would drive a field
/// negative surfaces as an `InvariantViolation`.
pub fn replay(seller_id: &str, entries: &[LedgerEntry]) -> Result<SellerBalance, LedgerError> {
    let mut ordered: Vec<&LedgerEntry> = entries.iter().filter(|e| e.seller_id == seller_id).collect();
    ordered.sort_by_key(|e| e.seq);

    ordered
        .into_iter()
        .try_fold(SellerBalance::zero(seller_id), |balance, entry| {
            balance.apply(&entry.entry_type.delta(seller_id, entry.amount))
        })
}

fn same_amounts(a: &SellerBalance, b: &SellerBalance) -> bool {
    a.pending_amount == b.pending_amount
        && a.available_amount == b.available_amount
        && a.lifetime_earned == b.lifetime_earned
        && a.lifetime_paid == b.lifetime_paid
}

/// Compare the cached balance with a ledger replay
pub async fn reconcile_seller(
    store: &dyn LedgerStore,
    seller_id: &str,
) -> Result<ReconciliationReport, LedgerError> {
    let entries = store.entries_for_seller(seller_id).await?;
    let replayed = replay(seller_id, &entries)?;
    let cached = store.get_balance(seller_id).await?;

    let consistent = match &cached {
        Some(balance) => same_amounts(balance, &replayed) && balance.is_consistent(),
        // a seller with no row must also have no ledger history
        None => entries.is_empty(),
    };

    if consistent {
        info!(seller_id, entries = entries.len(), "Ledger reconciles with balance");
    } else {
        error!(
            seller_id,
            entries = entries.len(),
            cached = ?cached,
            replayed = ?replayed,
            "Balance drifted from ledger - manual reconciliation required"
        );
    }

    Ok(ReconciliationReport {
        seller_id: seller_id.to_string(),
        cached,
        replayed,
        entry_count: entries.len(),
        consistent,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::memory::InMemoryLedgerStore;
    use crate::ledger::models::{BalanceDelta, LedgerEntryType, NewLedgerEntry};
    use chrono::{DateTime, Duration, Utc};

    fn entry(entry_type: LedgerEntryType, amount: i64) -> LedgerEntry {
        entry_at(entry_type, amount, 0, Utc::now())
    }

    fn entry_at(
        entry_type: LedgerEntryType,
        amount: i64,
        seq: i64,
        created_at: DateTime<Utc>,
    ) -> LedgerEntry {
        NewLedgerEntry {
            seller_id: "seller-a".into(),
            order_id: None,
            payout_id: None,
            entry_type,
            amount,
            currency: "PHP".into(),
            description: String::new(),
            metadata: serde_json::json!({}),
        }
        .into_entry(seq, created_at)
    }

    #[test]
    fn test_replay_full_lifecycle() {
        let entries = vec![
            entry(LedgerEntryType::CreditPending, 900),
            entry(LedgerEntryType::CreditPending, 450),
            entry(LedgerEntryType::ReleaseAvailable, 1350),
            entry(LedgerEntryType::PayoutDebit, 1000),
        ];

        let balance = replay("seller-a", &entries).unwrap();
        assert_eq!(balance.pending_amount, 0);
        assert_eq!(balance.available_amount, 350);
        assert_eq!(balance.lifetime_earned, 1350);
        assert_eq!(balance.lifetime_paid, 1000);
        assert!(balance.is_consistent());
    }

    #[test]
    fn test_replay_follows_write_order_when_timestamps_tie() {
        // release and debit written in the same run share a timestamp
        let sold_at = Utc::now() - Duration::days(4);
        let run_at = Utc::now();
        let credit = entry_at(LedgerEntryType::CreditPending, 900, 1, sold_at);
        let release = entry_at(LedgerEntryType::ReleaseAvailable, 900, 2, run_at);
        let debit = entry_at(LedgerEntryType::PayoutDebit, 900, 3, run_at);

        let mut tied = vec![credit, release, debit];
        tied.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        tied.reverse();

        let balance = replay("seller-a", &tied).unwrap();
        assert_eq!(balance.available_amount, 0);
        assert_eq!(balance.lifetime_paid, 900);
        assert!(balance.is_consistent());
    }

    #[test]
    fn test_replay_rejects_overdraw() {
        let entries = vec![
            entry(LedgerEntryType::CreditPending, 100),
            entry(LedgerEntryType::PayoutDebit, 100),
        ];
        assert!(matches!(
            replay("seller-a", &entries),
            Err(LedgerError::InvariantViolation { .. })
        ));
    }

    #[tokio::test]
    async fn test_reconcile_detects_drift() {
        let store = InMemoryLedgerStore::new();
        store
            .append_entry(NewLedgerEntry::release("seller-a", 0, &[], "PHP"))
            .await
            .unwrap();
        // balance mutated without a matching ledger entry
        store
            .apply_delta(&BalanceDelta::credit_pending("seller-a", 500))
            .await
            .unwrap();

        let report = reconcile_seller(&store, "seller-a").await.unwrap();
        assert!(!report.consistent);
        assert_eq!(report.replayed.pending_amount, 0);
    }

    #[tokio::test]
    async fn test_reconcile_unknown_seller_is_consistent() {
        let store = InMemoryLedgerStore::new();
        let report = reconcile_seller(&store, "nobody").await.unwrap();
        assert!(report.consistent);
        assert_eq!(report.entry_count, 0);
    }
}
