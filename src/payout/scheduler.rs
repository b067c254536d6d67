// Payout Scheduler - two-phase batch job
//
// Phase A (maturation): pending -> available for orders past their hold period
// Phase B (disbursement): available -> paid through the disbursement gateway
//
// Both phases re-read current state on every run, so a re-run after a crash
// or an overlapping trigger only repeats no-op work.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::gateway::{DisbursementGateway, DisbursementRequest};
use crate::config::PayoutConfig;
use crate::error::{AppError, AppResult, GatewayError};
use crate::ledger::models::{total_amount, NewPayout, Payout, PayoutCompletion, SellerBalance};
use crate::ledger::store::{BankDirectory, LedgerStore};

/// Per-seller outcome of Phase B
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutOutcome {
    Paid,
    SkippedNoBank,
    SkippedNoReadyOrders,
    SkippedInFlight,
    /// Ledger store or bank directory unreachable; retried next run
    FailedLookup,
    FailedCreatePayout,
    FailedDisbursement,
    FailedInvariant,
    FailedLedgerUpdate,
}

#[derive(Debug, Clone, Serialize)]
pub struct SellerPayoutResult {
    pub seller_id: String,
    pub status: PayoutOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payout_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl SellerPayoutResult {
    fn new(seller_id: &str, status: PayoutOutcome) -> Self {
        Self {
            seller_id: seller_id.to_string(),
            status,
            payout_id: None,
            amount: None,
            reason: None,
        }
    }

    fn payout(mut self, payout_id: Uuid, amount: i64) -> Self {
        self.payout_id = Some(payout_id);
        self.amount = Some(amount);
        self
    }

    fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Funds moved from pending to available for one seller
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReleasedFunds {
    pub seller_id: String,
    pub amount: i64,
    pub orders: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MaturationSummary {
    pub released: Vec<ReleasedFunds>,
    /// Sellers whose release failed and will be retried next run
    pub failed: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PayoutRunReport {
    pub ok: bool,
    pub released: Vec<ReleasedFunds>,
    pub results: Vec<SellerPayoutResult>,
    /// Shutdown was requested before every seller was visited
    pub interrupted: bool,
}

/// Periodic payout batch job
pub struct PayoutScheduler {
    store: Arc<dyn LedgerStore>,
    banks: Arc<dyn BankDirectory>,
    gateway: Arc<dyn DisbursementGateway>,
    min_payout_amount: i64,
    currency: String,
    gateway_timeout: Duration,
    stale_after: chrono::Duration,
    run_lock: Mutex<()>,
    shutdown: watch::Sender<bool>,
}

impl PayoutScheduler {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        banks: Arc<dyn BankDirectory>,
        gateway: Arc<dyn DisbursementGateway>,
        config: &PayoutConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            store,
            banks,
            gateway,
            min_payout_amount: config.min_payout_amount,
            currency: config.currency.clone(),
            gateway_timeout: config.gateway_timeout(),
            stale_after: config.stale_payout_after(),
            run_lock: Mutex::new(()),
            shutdown,
        }
    }

    pub fn with_gateway_timeout(mut self, timeout: Duration) -> Self {
        self.gateway_timeout = timeout;
        self
    }

    /// Start the periodic loop (runs in background until `shutdown`)
    pub fn start(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        let mut stop = self.shutdown.subscribe();
        let every = every.max(Duration::from_secs(1));

        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval_secs = every.as_secs(), "Payout scheduler started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stop.changed() => {}
                }
                if *stop.borrow() {
                    break;
                }

                match scheduler.run(Utc::now()).await {
                    Ok(report) => info!(
                        released = report.released.len(),
                        sellers = report.results.len(),
                        "Scheduled payout run completed"
                    ),
                    Err(AppError::RunInProgress) => {
                        warn!("Skipping scheduled payout run, previous run still active")
                    }
                    Err(e) => error!(error = %e, "Scheduled payout run failed"),
                }
            }

            info!("Payout scheduler stopped");
        })
    }

    /// Ask the loop and any active run to stop after the current seller
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// `run` on its own task: dropping the caller (a disconnected HTTP
    /// client) cannot cancel a disbursement call halfway.
    pub async fn run_detached(self: &Arc<Self>, now: DateTime<Utc>) -> AppResult<PayoutRunReport> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move { scheduler.run(now).await })
            .await
            .map_err(|e| AppError::Internal(format!("Payout run task failed: {}", e)))?
    }

    /// Run both phases; rejected while another run holds the lock
    pub async fn run(&self, now: DateTime<Utc>) -> AppResult<PayoutRunReport> {
        let _guard = self.run_lock.try_lock().map_err(|_| AppError::RunInProgress)?;

        let maturation = self.mature(now).await?;
        let (results, interrupted) = self.disburse(now).await?;

        for payout in self.stale_payouts(now).await? {
            warn!(
                payout_id = %payout.id,
                seller_id = %payout.seller_id,
                amount = payout.amount,
                created_at = %payout.created_at,
                "Payout stuck in processing, verify outcome with provider"
            );
        }

        Ok(PayoutRunReport {
            ok: maturation.failed.is_empty(),
            released: maturation.released,
            results,
            interrupted,
        })
    }

    /// Phase A: release every matured pending order
    #[instrument(skip(self))]
    pub async fn mature(&self, now: DateTime<Utc>) -> AppResult<MaturationSummary> {
        let sellers = self.store.sellers_with_matured_orders(now).await?;
        let mut summary = MaturationSummary::default();

        for seller_id in sellers {
            if self.stopping() {
                break;
            }

            match self.store.release_matured(&seller_id, now, &self.currency).await {
                Ok(Some(release)) => {
                    info!(
                        seller_id = %seller_id,
                        amount = release.amount,
                        orders = release.order_ids.len(),
                        "Released matured earnings"
                    );
                    summary.released.push(ReleasedFunds {
                        seller_id,
                        amount: release.amount,
                        orders: release.order_ids.len(),
                    });
                }
                // consumed by a concurrent run
                Ok(None) => {}
                Err(e) => {
                    error!(seller_id = %seller_id, error = %e, "Failed to release matured earnings");
                    summary.failed.push(seller_id);
                }
            }
        }

        Ok(summary)
    }

    /// Phase B: pay out every seller at or above the threshold.
    /// Returns the per-seller results and whether shutdown cut the batch short.
    #[instrument(skip(self))]
    pub async fn disburse(&self, now: DateTime<Utc>) -> AppResult<(Vec<SellerPayoutResult>, bool)> {
        let balances = self
            .store
            .sellers_with_available_at_least(self.min_payout_amount)
            .await?;
        let mut results = Vec::with_capacity(balances.len());

        for balance in &balances {
            if self.stopping() {
                warn!(remaining = balances.len() - results.len(), "Payout run interrupted by shutdown");
                return Ok((results, true));
            }
            results.push(self.pay_seller(balance).await);
        }

        Ok((results, false))
    }

    async fn pay_seller(&self, balance: &SellerBalance) -> SellerPayoutResult {
        let seller_id = balance.seller_id.as_str();

        match self.store.processing_payouts_for_seller(seller_id).await {
            Ok(in_flight) if !in_flight.is_empty() => {
                let oldest = &in_flight[0];
                return SellerPayoutResult::new(seller_id, PayoutOutcome::SkippedInFlight)
                    .payout(oldest.id, oldest.amount)
                    .reason("payout already processing");
            }
            Ok(_) => {}
            Err(e) => {
                warn!(seller_id, error = %e, "In-flight payout lookup failed");
                return SellerPayoutResult::new(seller_id, PayoutOutcome::FailedLookup)
                    .reason(format!("in-flight payouts: {}", e));
            }
        }

        let account = match self.banks.default_bank_account(seller_id).await {
            Ok(Some(account)) => account,
            Ok(None) => return SellerPayoutResult::new(seller_id, PayoutOutcome::SkippedNoBank),
            Err(e) => {
                warn!(seller_id, error = %e, "Bank directory lookup failed");
                return SellerPayoutResult::new(seller_id, PayoutOutcome::FailedLookup)
                    .reason(format!("bank directory: {}", e));
            }
        };

        let ready = match self.store.ready_orders(seller_id).await {
            Ok(orders) if !orders.is_empty() => orders,
            Ok(_) => {
                return SellerPayoutResult::new(seller_id, PayoutOutcome::SkippedNoReadyOrders)
            }
            Err(e) => {
                warn!(seller_id, error = %e, "Ready order lookup failed");
                return SellerPayoutResult::new(seller_id, PayoutOutcome::FailedLookup)
                    .reason(format!("ready orders: {}", e));
            }
        };

        let orders: Vec<(Uuid, i64)> = ready.iter().map(|o| (o.id, o.seller_net_amount)).collect();
        let amount = match total_amount(seller_id, orders.iter().map(|(_, net)| *net)) {
            Ok(amount) => amount,
            Err(e) => {
                error!(seller_id, error = %e, "Ready orders overflow - manual reconciliation required");
                return SellerPayoutResult::new(seller_id, PayoutOutcome::FailedInvariant)
                    .reason(e.to_string());
            }
        };

        if amount <= 0 || amount > balance.available_amount {
            error!(
                seller_id,
                ready_sum = amount,
                available = balance.available_amount,
                order_ids = ?orders.iter().map(|(id, _)| id).collect::<Vec<_>>(),
                "Ready orders do not match available balance - manual reconciliation required"
            );
            return SellerPayoutResult::new(seller_id, PayoutOutcome::FailedInvariant)
                .reason(format!(
                    "ready orders total {} but available is {}",
                    amount, balance.available_amount
                ));
        }

        let payout = match self
            .store
            .create_payout(NewPayout {
                seller_id: seller_id.to_string(),
                bank_account_id: account.id,
                amount,
                currency: self.currency.clone(),
                provider: self.gateway.provider().to_string(),
            })
            .await
        {
            Ok(payout) => payout,
            Err(e) => {
                error!(seller_id, amount, error = %e, "Failed to create payout row");
                return SellerPayoutResult::new(seller_id, PayoutOutcome::FailedCreatePayout)
                    .reason(e.to_string());
            }
        };

        let request = DisbursementRequest::new(payout.id, amount, &self.currency, &account);
        let outcome = tokio::time::timeout(self.gateway_timeout, self.gateway.disburse(&request))
            .await
            .unwrap_or(Err(GatewayError::Timeout));

        let provider_reference = match outcome {
            Ok(reference) => reference,
            Err(gateway_error) => {
                let reason = gateway_error.failure_reason();
                warn!(
                    seller_id,
                    payout_id = %payout.id,
                    reason = %reason,
                    "Disbursement failed, funds stay available for the next run"
                );
                if let Err(e) = self.store.fail_payout(payout.id, &reason, Utc::now()).await {
                    error!(
                        payout_id = %payout.id,
                        error = %e,
                        "Failed to mark payout as failed; row left processing"
                    );
                }
                return SellerPayoutResult::new(seller_id, PayoutOutcome::FailedDisbursement)
                    .payout(payout.id, amount)
                    .reason(reason);
            }
        };

        let completion = PayoutCompletion {
            payout_id: payout.id,
            seller_id: seller_id.to_string(),
            provider_reference: provider_reference.clone(),
            amount,
            currency: self.currency.clone(),
            orders,
            processed_at: Utc::now(),
        };

        match self.store.complete_payout(completion).await {
            Ok(_) => {
                info!(seller_id, payout_id = %payout.id, amount, "Seller paid");
                SellerPayoutResult::new(seller_id, PayoutOutcome::Paid).payout(payout.id, amount)
            }
            Err(e) => {
                // money has left the platform but the ledger does not show it
                error!(
                    seller_id,
                    payout_id = %payout.id,
                    provider_reference = %provider_reference,
                    order_ids = ?ready.iter().map(|o| o.id).collect::<Vec<_>>(),
                    attempted_available_delta = -amount,
                    attempted_paid_delta = amount,
                    error = %e,
                    "Disbursement succeeded but recording it failed - manual reconciliation required"
                );
                SellerPayoutResult::new(seller_id, PayoutOutcome::FailedLedgerUpdate)
                    .payout(payout.id, amount)
                    .reason(e.to_string())
            }
        }
    }

    /// Processing payouts older than the stale threshold
    pub async fn stale_payouts(&self, now: DateTime<Utc>) -> AppResult<Vec<Payout>> {
        Ok(self
            .store
            .stale_processing_payouts(now - self.stale_after)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::memory::{FaultPoint, InMemoryLedgerStore};
    use crate::ledger::models::{
        BankAccount, BankAccountStatus, LedgerEntryType, NewOrder, PayoutRunStatus, PayoutStatus,
    };
    use crate::ledger::reconcile::reconcile_seller;
    use crate::payout::gateway::{ScriptedGateway, ScriptedOutcome};

    struct Harness {
        store: Arc<InMemoryLedgerStore>,
        gateway: Arc<ScriptedGateway>,
        scheduler: PayoutScheduler,
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemoryLedgerStore::new());
        let gateway = Arc::new(ScriptedGateway::new());
        let config = PayoutConfig {
            min_payout_amount: 100,
            ..PayoutConfig::default()
        };
        let scheduler = PayoutScheduler::new(store.clone(), store.clone(), gateway.clone(), &config)
            .with_gateway_timeout(Duration::from_millis(50));
        Harness {
            store,
            gateway,
            scheduler,
        }
    }

    fn bank(store: &InMemoryLedgerStore, seller: &str) {
        store.upsert_bank_account(BankAccount {
            id: Uuid::new_v4(),
            seller_id: seller.into(),
            account_holder_name: "Maria Santos".into(),
            bank_code: "BPI".into(),
            account_number_encrypted: "enc:0001".into(),
            is_default: true,
            status: BankAccountStatus::Active,
        });
    }

    async fn settle(store: &InMemoryLedgerStore, reference: &str, seller: &str, net: i64, eligible_at: DateTime<Utc>) {
        store
            .settle_order(NewOrder {
                payment_reference: reference.into(),
                seller_id: seller.into(),
                buyer_id: "buyer-1".into(),
                buyer_display_name: None,
                gross_amount: net + net / 9,
                platform_fee_amount: net / 9,
                seller_net_amount: net,
                line_items: vec![],
                payout_eligible_at: eligible_at,
                currency: "PHP".into(),
            })
            .await
            .unwrap();
    }

    /// Seller with 900 + 450 net whose hold period has elapsed
    async fn matured_seller(h: &Harness, seller: &str) -> DateTime<Utc> {
        let now = Utc::now();
        let eligible = now - chrono::Duration::minutes(1);
        settle(&h.store, &format!("cs_{}_1", seller), seller, 900, eligible).await;
        settle(&h.store, &format!("cs_{}_2", seller), seller, 450, eligible).await;
        now
    }

    #[tokio::test]
    async fn test_maturation_moves_pending_to_available() {
        let h = harness();
        let now = matured_seller(&h, "seller-a").await;

        let summary = h.scheduler.mature(now).await.unwrap();
        assert_eq!(summary.released.len(), 1);
        assert_eq!(summary.released[0].amount, 1350);
        assert_eq!(summary.released[0].orders, 2);

        let balance = h.store.get_balance("seller-a").await.unwrap().unwrap();
        assert_eq!(balance.pending_amount, 0);
        assert_eq!(balance.available_amount, 1350);
        assert!(h
            .store
            .orders_for_seller("seller-a")
            .await
            .unwrap()
            .iter()
            .all(|o| o.payout_status == PayoutStatus::Ready));

        // second pass has nothing left to release
        let again = h.scheduler.mature(now).await.unwrap();
        assert!(again.released.is_empty());
        let after = h.store.get_balance("seller-a").await.unwrap().unwrap();
        assert_eq!(after, balance);
    }

    #[tokio::test]
    async fn test_orders_inside_hold_period_stay_pending() {
        let h = harness();
        let now = Utc::now();
        settle(&h.store, "cs_1", "seller-a", 900, now + chrono::Duration::days(3)).await;

        let summary = h.scheduler.mature(now).await.unwrap();
        assert!(summary.released.is_empty());
        let balance = h.store.get_balance("seller-a").await.unwrap().unwrap();
        assert_eq!(balance.pending_amount, 900);
    }

    #[tokio::test]
    async fn test_successful_disbursement_pays_seller() {
        let h = harness();
        bank(&h.store, "seller-a");
        let now = matured_seller(&h, "seller-a").await;

        let report = h.scheduler.run(now).await.unwrap();
        assert!(report.ok);
        assert_eq!(report.results.len(), 1);
        let result = &report.results[0];
        assert_eq!(result.status, PayoutOutcome::Paid);
        assert_eq!(result.amount, Some(1350));

        let balance = h.store.get_balance("seller-a").await.unwrap().unwrap();
        assert_eq!(balance.available_amount, 0);
        assert_eq!(balance.lifetime_paid, 1350);
        assert!(balance.is_consistent());

        let payouts = h.store.payouts_for_seller("seller-a").await.unwrap();
        assert_eq!(payouts.len(), 1);
        assert_eq!(payouts[0].status, PayoutRunStatus::Succeeded);
        assert!(payouts[0].provider_reference.is_some());
        assert_eq!(h.store.payout_items(payouts[0].id).await.unwrap().len(), 2);

        assert!(h
            .store
            .orders_for_seller("seller-a")
            .await
            .unwrap()
            .iter()
            .all(|o| o.payout_status == PayoutStatus::Paid));

        let entries = h.store.entries_for_seller("seller-a").await.unwrap();
        assert_eq!(entries.last().map(|e| e.entry_type), Some(LedgerEntryType::PayoutDebit));
        assert!(reconcile_seller(h.store.as_ref(), "seller-a").await.unwrap().consistent);
    }

    #[tokio::test]
    async fn test_rejected_disbursement_leaves_funds_available() {
        let h = harness();
        bank(&h.store, "seller-a");
        h.gateway
            .script("seller-a", ScriptedOutcome::Reject("Insufficient funds".into()));
        let now = matured_seller(&h, "seller-a").await;

        let report = h.scheduler.run(now).await.unwrap();
        let result = &report.results[0];
        assert_eq!(result.status, PayoutOutcome::FailedDisbursement);
        assert_eq!(result.reason.as_deref(), Some("Insufficient funds"));

        let balance = h.store.get_balance("seller-a").await.unwrap().unwrap();
        assert_eq!(balance.available_amount, 1350);
        assert_eq!(balance.lifetime_paid, 0);

        let payouts = h.store.payouts_for_seller("seller-a").await.unwrap();
        assert_eq!(payouts[0].status, PayoutRunStatus::Failed);
        assert_eq!(payouts[0].failure_reason.as_deref(), Some("Insufficient funds"));
        assert!(h
            .store
            .orders_for_seller("seller-a")
            .await
            .unwrap()
            .iter()
            .all(|o| o.payout_status == PayoutStatus::Ready));

        // the next run retries with a fresh payout row
        h.gateway.script("seller-a", ScriptedOutcome::Accept);
        let retry = h.scheduler.run(now).await.unwrap();
        assert_eq!(retry.results[0].status, PayoutOutcome::Paid);
        assert_eq!(h.store.payouts_for_seller("seller-a").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_gateway_timeout_fails_payout() {
        let h = harness();
        bank(&h.store, "seller-a");
        h.gateway.script("seller-a", ScriptedOutcome::Hang);
        let now = matured_seller(&h, "seller-a").await;

        let report = h.scheduler.run(now).await.unwrap();
        assert_eq!(report.results[0].status, PayoutOutcome::FailedDisbursement);
        assert_eq!(report.results[0].reason.as_deref(), Some("timeout"));
        assert_eq!(
            h.store.get_balance("seller-a").await.unwrap().unwrap().available_amount,
            1350
        );
    }

    #[tokio::test]
    async fn test_seller_without_bank_is_skipped() {
        let h = harness();
        let now = matured_seller(&h, "seller-a").await;
        h.scheduler.mature(now).await.unwrap();
        let before = h.store.get_balance("seller-a").await.unwrap().unwrap();

        let (results, _) = h.scheduler.disburse(now).await.unwrap();
        assert_eq!(results[0].status, PayoutOutcome::SkippedNoBank);
        assert!(h.gateway.calls().is_empty());
        assert!(h.store.payouts_for_seller("seller-a").await.unwrap().is_empty());
        assert_eq!(h.store.get_balance("seller-a").await.unwrap().unwrap(), before);
    }

    #[tokio::test]
    async fn test_below_threshold_is_not_visited() {
        let h = harness();
        bank(&h.store, "seller-a");
        let now = Utc::now();
        settle(&h.store, "cs_1", "seller-a", 50, now - chrono::Duration::minutes(1)).await;

        let report = h.scheduler.run(now).await.unwrap();
        assert_eq!(report.released.len(), 1);
        assert!(report.results.is_empty());
    }

    #[tokio::test]
    async fn test_one_failing_seller_does_not_block_others() {
        let h = harness();
        bank(&h.store, "seller-a");
        bank(&h.store, "seller-b");
        h.store.inject_fault(FaultPoint::CreatePayout, "seller-a");
        matured_seller(&h, "seller-a").await;
        let now = matured_seller(&h, "seller-b").await;

        let report = h.scheduler.run(now).await.unwrap();
        let statuses: Vec<_> = report.results.iter().map(|r| (r.seller_id.as_str(), r.status)).collect();
        assert_eq!(
            statuses,
            vec![
                ("seller-a", PayoutOutcome::FailedCreatePayout),
                ("seller-b", PayoutOutcome::Paid)
            ]
        );
        assert_eq!(
            h.store.get_balance("seller-a").await.unwrap().unwrap().available_amount,
            1350
        );
    }

    #[tokio::test]
    async fn test_ledger_failure_after_disbursement_keeps_row_processing() {
        let h = harness();
        bank(&h.store, "seller-a");
        h.store.inject_fault(FaultPoint::CompletePayout, "seller-a");
        let now = matured_seller(&h, "seller-a").await;

        let report = h.scheduler.run(now).await.unwrap();
        assert_eq!(report.results[0].status, PayoutOutcome::FailedLedgerUpdate);

        let payouts = h.store.payouts_for_seller("seller-a").await.unwrap();
        assert_eq!(payouts[0].status, PayoutRunStatus::Processing);

        // nothing is re-submitted while that row is unresolved
        h.store.clear_faults();
        let next = h.scheduler.run(now).await.unwrap();
        assert_eq!(next.results[0].status, PayoutOutcome::SkippedInFlight);
        assert_eq!(h.gateway.calls().len(), 1);

        let stale = h
            .scheduler
            .stale_payouts(Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, payouts[0].id);
    }

    #[tokio::test]
    async fn test_overlapping_run_is_rejected() {
        let h = harness();
        let _held = h.scheduler.run_lock.lock().await;

        let result = h.scheduler.run(Utc::now()).await;
        assert!(matches!(result, Err(AppError::RunInProgress)));
    }

    #[tokio::test]
    async fn test_shutdown_stops_between_sellers() {
        let h = harness();
        bank(&h.store, "seller-a");
        let now = matured_seller(&h, "seller-a").await;
        h.scheduler.mature(now).await.unwrap();

        h.scheduler.shutdown();
        let (results, interrupted) = h.scheduler.disburse(now).await.unwrap();
        assert!(interrupted);
        assert!(results.is_empty());
        assert!(h.gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn test_bank_directory_outage_is_a_lookup_failure() {
        let h = harness();
        bank(&h.store, "seller-a");
        let now = matured_seller(&h, "seller-a").await;
        h.store.inject_fault(FaultPoint::BankLookup, "seller-a");

        let report = h.scheduler.run(now).await.unwrap();
        let result = &report.results[0];
        assert_eq!(result.status, PayoutOutcome::FailedLookup);
        assert!(result.reason.as_deref().unwrap_or_default().starts_with("bank directory"));
        assert!(h.gateway.calls().is_empty());

        let balance = h.store.get_balance("seller-a").await.unwrap().unwrap();
        assert_eq!(balance.available_amount, 1350);
    }

    #[tokio::test]
    async fn test_dropped_trigger_does_not_cancel_disbursement() {
        let Harness {
            store,
            gateway,
            scheduler,
        } = harness();
        bank(&store, "seller-a");
        gateway.script("seller-a", ScriptedOutcome::Hang);
        settle(&store, "cs_1", "seller-a", 900, Utc::now() - chrono::Duration::minutes(1)).await;
        let scheduler = Arc::new(scheduler);

        // caller gives up while the gateway call is outstanding
        let dropped =
            tokio::time::timeout(Duration::from_millis(10), scheduler.run_detached(Utc::now())).await;
        assert!(dropped.is_err());

        tokio::time::sleep(Duration::from_millis(300)).await;

        let payouts = store.payouts_for_seller("seller-a").await.unwrap();
        assert_eq!(payouts.len(), 1);
        assert_eq!(payouts[0].status, PayoutRunStatus::Failed);
        assert_eq!(payouts[0].failure_reason.as_deref(), Some("timeout"));
        assert!(payouts[0].processed_at.is_some());
        assert!(scheduler.run_lock.try_lock().is_ok());
    }

    #[tokio::test]
    async fn test_detached_run_reports_like_run() {
        let Harness { store, scheduler, .. } = harness();
        bank(&store, "seller-a");
        settle(&store, "cs_1", "seller-a", 900, Utc::now() - chrono::Duration::minutes(1)).await;
        let scheduler = Arc::new(scheduler);

        let report = scheduler.run_detached(Utc::now()).await.unwrap();
        assert!(report.ok);
        assert_eq!(report.results[0].status, PayoutOutcome::Paid);
        assert!(reconcile_seller(store.as_ref(), "seller-a").await.unwrap().consistent);
    }
}
