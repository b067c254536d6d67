use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::event::{EventLineItem, PaymentConfirmedEvent};
use super::pricing::{LineAmounts, PriceBreakdown};
use crate::config::PayoutConfig;
use crate::error::{AppResult, LedgerError, SettlementError};
use crate::ledger::models::{LineItemSnapshot, NewOrder, Order};
use crate::ledger::store::LedgerStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementStatus {
    Processed,
    AlreadyProcessed,
    /// At least one seller group failed; redelivery settles the rest
    Partial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SellerSettlementStatus {
    Settled,
    AlreadySettled,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct SellerSettlement {
    pub seller_id: String,
    pub status: SellerSettlementStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub net_amount: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SellerSettlement {
    fn from_order(order: &Order, status: SellerSettlementStatus) -> Self {
        Self {
            seller_id: order.seller_id.clone(),
            status,
            order_id: Some(order.id),
            net_amount: Some(order.seller_net_amount),
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SettlementReport {
    pub payment_reference: String,
    pub status: SettlementStatus,
    pub sellers: Vec<SellerSettlement>,
}

impl SettlementReport {
    pub fn is_complete(&self) -> bool {
        self.status != SettlementStatus::Partial
    }
}

/// Converts a confirmed payment into one order per seller and credits
/// each seller's pending balance.
///
/// INVARIANTS:
/// - At most one order per (payment_reference, seller_id)
/// - Each seller group commits its order, balance delta and ledger entry together
/// - A malformed event writes nothing
pub struct SettlementProcessor {
    store: Arc<dyn LedgerStore>,
    pricing: Arc<dyn PriceBreakdown>,
    hold_period: chrono::Duration,
    currency: String,
}

impl SettlementProcessor {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        pricing: Arc<dyn PriceBreakdown>,
        config: &PayoutConfig,
    ) -> Self {
        Self {
            store,
            pricing,
            hold_period: config.hold_period(),
            currency: config.currency.clone(),
        }
    }

    pub async fn process(&self, event: PaymentConfirmedEvent) -> AppResult<SettlementReport> {
        self.process_at(event, Utc::now()).await
    }

    #[instrument(skip(self, event), fields(payment_reference = %event.payment_reference))]
    pub async fn process_at(
        &self,
        event: PaymentConfirmedEvent,
        now: DateTime<Utc>,
    ) -> AppResult<SettlementReport> {
        event.check()?;

        // price every line up front so a bad line rejects the whole event
        let mut groups: BTreeMap<String, Vec<(&EventLineItem, LineAmounts)>> = BTreeMap::new();
        for line in &event.line_items {
            let amounts = self.pricing.breakdown(line)?;
            groups
                .entry(line.seller_id.clone())
                .or_default()
                .push((line, amounts));
        }

        let existing: HashMap<String, Order> = self
            .store
            .orders_by_payment_reference(&event.payment_reference)
            .await?
            .into_iter()
            .map(|order| (order.seller_id.clone(), order))
            .collect();

        if groups.keys().all(|seller| existing.contains_key(seller)) {
            info!(
                sellers = groups.len(),
                "Payment already settled, ignoring redelivery"
            );
            return Ok(SettlementReport {
                payment_reference: event.payment_reference.clone(),
                status: SettlementStatus::AlreadyProcessed,
                sellers: groups
                    .keys()
                    .filter_map(|seller| existing.get(seller))
                    .map(|order| {
                        SellerSettlement::from_order(order, SellerSettlementStatus::AlreadySettled)
                    })
                    .collect(),
            });
        }

        let eligible_at = now + self.hold_period;
        let mut sellers = Vec::with_capacity(groups.len());
        let mut pending = Vec::new();

        for (seller_id, lines) in &groups {
            match existing.get(seller_id) {
                Some(order) => sellers.push(SellerSettlement::from_order(
                    order,
                    SellerSettlementStatus::AlreadySettled,
                )),
                None => pending.push(self.new_order(&event, seller_id, lines, eligible_at)?),
            }
        }

        let outcomes = join_all(pending.into_iter().map(|order| self.settle_group(order))).await;
        sellers.extend(outcomes);
        sellers.sort_by(|a, b| a.seller_id.cmp(&b.seller_id));

        let status = if sellers
            .iter()
            .any(|s| s.status == SellerSettlementStatus::Failed)
        {
            SettlementStatus::Partial
        } else {
            SettlementStatus::Processed
        };

        info!(sellers = sellers.len(), status = ?status, "Payment settled");

        Ok(SettlementReport {
            payment_reference: event.payment_reference,
            status,
            sellers,
        })
    }

    fn new_order(
        &self,
        event: &PaymentConfirmedEvent,
        seller_id: &str,
        lines: &[(&EventLineItem, LineAmounts)],
        eligible_at: DateTime<Utc>,
    ) -> Result<NewOrder, SettlementError> {
        Ok(NewOrder {
            payment_reference: event.payment_reference.clone(),
            seller_id: seller_id.to_string(),
            buyer_id: event.buyer_id.clone(),
            buyer_display_name: event.buyer_display_name.clone(),
            gross_amount: group_total(seller_id, lines, |a| a.gross)?,
            platform_fee_amount: group_total(seller_id, lines, |a| a.fee)?,
            seller_net_amount: group_total(seller_id, lines, |a| a.net)?,
            line_items: lines
                .iter()
                .map(|(line, amounts)| LineItemSnapshot {
                    product_id: line.product_id.clone(),
                    name: line.name.clone(),
                    unit_price: amounts.unit_price,
                    quantity: line.quantity,
                })
                .collect(),
            payout_eligible_at: eligible_at,
            currency: self.currency.clone(),
        })
    }

    async fn settle_group(&self, order: NewOrder) -> SellerSettlement {
        let seller_id = order.seller_id.clone();
        let payment_reference = order.payment_reference.clone();
        let net = order.seller_net_amount;

        match self.store.settle_order(order).await {
            Ok(settled) => {
                SellerSettlement::from_order(&settled.order, SellerSettlementStatus::Settled)
            }
            // lost a race with a concurrent delivery of the same payment
            Err(LedgerError::DuplicateOrder { .. }) => {
                warn!(%seller_id, %payment_reference, "Seller group settled concurrently");
                let order = self
                    .store
                    .orders_by_payment_reference(&payment_reference)
                    .await
                    .ok()
                    .and_then(|orders| orders.into_iter().find(|o| o.seller_id == seller_id));
                SellerSettlement {
                    seller_id,
                    status: SellerSettlementStatus::AlreadySettled,
                    order_id: order.as_ref().map(|o| o.id),
                    net_amount: order.as_ref().map(|o| o.seller_net_amount),
                    error: None,
                }
            }
            Err(e) => {
                error!(
                    %seller_id,
                    %payment_reference,
                    net,
                    error = %e,
                    "Failed to settle seller group"
                );
                SellerSettlement {
                    seller_id,
                    status: SellerSettlementStatus::Failed,
                    order_id: None,
                    net_amount: Some(net),
                    error: Some(e.to_string()),
                }
            }
        }
    }
}

fn group_total(
    seller_id: &str,
    lines: &[(&EventLineItem, LineAmounts)],
    column: fn(&LineAmounts) -> i64,
) -> Result<i64, SettlementError> {
    lines
        .iter()
        .try_fold(0_i64, |sum, (_, amounts)| sum.checked_add(column(amounts)))
        .ok_or_else(|| {
            SettlementError::Validation(format!("order total for seller {} is out of range", seller_id))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AppError, SettlementError};
    use crate::ledger::memory::{FaultPoint, InMemoryLedgerStore};
    use crate::ledger::models::{LedgerEntryType, PayoutStatus};
    use crate::settlement::pricing::UpstreamBreakdown;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn line(product: &str, seller: &str, gross: Decimal) -> EventLineItem {
        let fee = gross * dec!(0.10);
        EventLineItem {
            product_id: product.into(),
            name: Some(format!("Product {}", product)),
            seller_id: seller.into(),
            quantity: 1,
            unit_price_usd: dec!(0.18),
            unit_price_local: gross,
            gross_local: gross,
            platform_fee_local: fee,
            seller_net_local: gross - fee,
        }
    }

    fn event(reference: &str, lines: Vec<EventLineItem>) -> PaymentConfirmedEvent {
        PaymentConfirmedEvent {
            payment_reference: reference.into(),
            buyer_id: "buyer-1".into(),
            buyer_display_name: Some("Buyer".into()),
            line_items: lines,
        }
    }

    fn processor(store: Arc<InMemoryLedgerStore>) -> SettlementProcessor {
        SettlementProcessor::new(store, Arc::new(UpstreamBreakdown), &PayoutConfig::default())
    }

    #[tokio::test]
    async fn test_two_lines_one_seller_become_one_order() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let processor = processor(store.clone());

        let report = processor
            .process(event(
                "cs_1",
                vec![line("p-1", "seller-a", dec!(10.00)), line("p-2", "seller-a", dec!(5.00))],
            ))
            .await
            .unwrap();

        assert_eq!(report.status, SettlementStatus::Processed);
        assert_eq!(report.sellers.len(), 1);
        assert_eq!(report.sellers[0].net_amount, Some(1350));

        let orders = store.orders_by_payment_reference("cs_1").await.unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].gross_amount, 1500);
        assert_eq!(orders[0].platform_fee_amount, 150);
        assert_eq!(orders[0].seller_net_amount, 1350);
        assert_eq!(orders[0].line_items.0.len(), 2);
        assert_eq!(orders[0].payout_status, PayoutStatus::Pending);

        let balance = store.get_balance("seller-a").await.unwrap().unwrap();
        assert_eq!(balance.pending_amount, 1350);
        assert_eq!(balance.lifetime_earned, 1350);
        assert_eq!(balance.available_amount, 0);

        let entries = store.entries_for_seller("seller-a").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entry_type, LedgerEntryType::CreditPending);
        assert_eq!(entries[0].amount, 1350);
    }

    #[tokio::test]
    async fn test_redelivery_is_a_no_op() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let processor = processor(store.clone());
        let payment = event(
            "cs_2",
            vec![line("p-1", "seller-a", dec!(10.00)), line("p-2", "seller-b", dec!(20.00))],
        );

        processor.process(payment.clone()).await.unwrap();
        let second = processor.process(payment).await.unwrap();

        assert_eq!(second.status, SettlementStatus::AlreadyProcessed);
        assert!(second
            .sellers
            .iter()
            .all(|s| s.status == SellerSettlementStatus::AlreadySettled));
        assert_eq!(store.orders_by_payment_reference("cs_2").await.unwrap().len(), 2);

        let balance = store.get_balance("seller-a").await.unwrap().unwrap();
        assert_eq!(balance.pending_amount, 900);
        assert_eq!(store.entries_for_seller("seller-a").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_partial_failure_then_redelivery_settles_the_rest() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let processor = processor(store.clone());
        let payment = event(
            "cs_3",
            vec![line("p-1", "seller-a", dec!(10.00)), line("p-2", "seller-b", dec!(20.00))],
        );

        store.inject_fault(FaultPoint::SettleOrder, "seller-b");
        let first = processor.process(payment.clone()).await.unwrap();
        assert_eq!(first.status, SettlementStatus::Partial);
        assert!(!first.is_complete());
        assert!(store.get_balance("seller-b").await.unwrap().is_none());

        store.clear_faults();
        let second = processor.process(payment).await.unwrap();
        assert_eq!(second.status, SettlementStatus::Processed);

        let statuses: Vec<_> = second.sellers.iter().map(|s| s.status).collect();
        assert_eq!(
            statuses,
            vec![SellerSettlementStatus::AlreadySettled, SellerSettlementStatus::Settled]
        );
        assert_eq!(
            store.get_balance("seller-a").await.unwrap().unwrap().pending_amount,
            900
        );
        assert_eq!(
            store.get_balance("seller-b").await.unwrap().unwrap().pending_amount,
            1800
        );
    }

    #[tokio::test]
    async fn test_invalid_line_writes_nothing() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let processor = processor(store.clone());
        let mut bad = line("p-2", "seller-b", dec!(20.00));
        bad.seller_net_local = dec!(1.00);

        let result = processor
            .process(event("cs_4", vec![line("p-1", "seller-a", dec!(10.00)), bad]))
            .await;

        assert!(matches!(
            result,
            Err(AppError::Settlement(SettlementError::InvalidLine { .. }))
        ));
        assert!(store.orders_by_payment_reference("cs_4").await.unwrap().is_empty());
        assert!(store.all_entries().is_empty());
    }

    #[tokio::test]
    async fn test_order_total_overflow_is_rejected_without_writes() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let processor = processor(store.clone());
        // each line fits in i64 minor units, their sum does not
        let big = Decimal::from(50_000_000_000_000_000_i64);

        let result = processor
            .process(event(
                "cs_6",
                vec![line("p-1", "seller-a", big), line("p-2", "seller-a", big)],
            ))
            .await;

        assert!(matches!(
            result,
            Err(AppError::Settlement(SettlementError::Validation(_)))
        ));
        assert!(store.orders_for_seller("seller-a").await.unwrap().is_empty());
        assert!(store.all_entries().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_line_is_a_validation_error() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let processor = processor(store.clone());
        let mut huge = line("p-1", "seller-a", dec!(10.00));
        huge.gross_local = Decimal::from_i128_with_scale(7 * 10_i128.pow(27), 0);

        let result = processor.process(event("cs_7", vec![huge])).await;

        assert!(matches!(
            result,
            Err(AppError::Settlement(SettlementError::InvalidLine { .. }))
        ));
        assert!(store.all_entries().is_empty());
    }

    #[tokio::test]
    async fn test_hold_period_sets_eligibility() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let processor = processor(store.clone());
        let now = Utc::now();

        processor
            .process_at(event("cs_5", vec![line("p-1", "seller-a", dec!(10.00))]), now)
            .await
            .unwrap();

        let orders = store.orders_for_seller("seller-a").await.unwrap();
        assert_eq!(orders[0].payout_eligible_at, now + chrono::Duration::days(3));
    }
}
