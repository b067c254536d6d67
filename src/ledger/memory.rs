use std::collections::{BTreeSet, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::models::*;
use super::store::{BankDirectory, LedgerStore};
use crate::error::LedgerError;

/// Calls that can be made to fail, for exercising partial-failure handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    BankLookup,
    SettleOrder,
    CreatePayout,
    CompletePayout,
}

#[derive(Default)]
struct MemoryState {
    balances: HashMap<String, SellerBalance>,
    entries: Vec<LedgerEntry>,
    orders: Vec<Order>,
    payouts: Vec<Payout>,
    payout_items: Vec<PayoutItem>,
    bank_accounts: Vec<BankAccount>,
    faults: HashSet<(FaultPoint, String)>,
}

impl MemoryState {
    fn check_fault(&self, point: FaultPoint, seller_id: &str) -> Result<(), LedgerError> {
        if self.faults.contains(&(point, seller_id.to_string())) {
            return Err(LedgerError::Storage(sqlx::Error::Protocol(format!(
                "injected {:?} fault for seller {}",
                point, seller_id
            ))));
        }
        Ok(())
    }

    /// Validate a delta against the current row without writing it
    fn preview(&self, delta: &BalanceDelta) -> Result<SellerBalance, LedgerError> {
        self.balances
            .get(&delta.seller_id)
            .cloned()
            .unwrap_or_else(|| SellerBalance::zero(delta.seller_id.clone()))
            .apply(delta)
    }

    fn push_entry(&mut self, entry: NewLedgerEntry) -> LedgerEntry {
        let seq = self.entries.len() as i64 + 1;
        let entry = entry.into_entry(seq, Utc::now());
        self.entries.push(entry.clone());
        entry
    }
}

/// Single-process store guarded by one mutex; every trait call is atomic.
#[derive(Default)]
pub struct InMemoryLedgerStore {
    state: Mutex<MemoryState>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a seller bank account.
    pub fn upsert_bank_account(&self, account: BankAccount) {
        let mut state = self.state.lock();
        if account.is_default && account.status == BankAccountStatus::Active {
            for existing in state
                .bank_accounts
                .iter_mut()
                .filter(|a| a.seller_id == account.seller_id)
            {
                existing.is_default = false;
            }
        }
        state.bank_accounts.retain(|a| a.id != account.id);
        state.bank_accounts.push(account);
    }

    pub fn inject_fault(&self, point: FaultPoint, seller_id: &str) {
        self.state.lock().faults.insert((point, seller_id.to_string()));
    }

    pub fn clear_faults(&self) {
        self.state.lock().faults.clear();
    }

    pub fn all_entries(&self) -> Vec<LedgerEntry> {
        self.state.lock().entries.clone()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn apply_delta(&self, delta: &BalanceDelta) -> Result<SellerBalance, LedgerError> {
        let mut state = self.state.lock();
        let updated = state.preview(delta)?;
        state.balances.insert(delta.seller_id.clone(), updated.clone());
        Ok(updated)
    }

    async fn append_entry(&self, entry: NewLedgerEntry) -> Result<LedgerEntry, LedgerError> {
        let mut state = self.state.lock();
        Ok(state.push_entry(entry))
    }

    async fn get_balance(&self, seller_id: &str) -> Result<Option<SellerBalance>, LedgerError> {
        Ok(self.state.lock().balances.get(seller_id).cloned())
    }

    async fn entries_for_seller(&self, seller_id: &str) -> Result<Vec<LedgerEntry>, LedgerError> {
        Ok(self
            .state
            .lock()
            .entries
            .iter()
            .filter(|e| e.seller_id == seller_id)
            .cloned()
            .collect())
    }

    async fn orders_by_payment_reference(
        &self,
        payment_reference: &str,
    ) -> Result<Vec<Order>, LedgerError> {
        Ok(self
            .state
            .lock()
            .orders
            .iter()
            .filter(|o| o.payment_reference == payment_reference)
            .cloned()
            .collect())
    }

    async fn orders_for_seller(&self, seller_id: &str) -> Result<Vec<Order>, LedgerError> {
        Ok(self
            .state
            .lock()
            .orders
            .iter()
            .filter(|o| o.seller_id == seller_id)
            .cloned()
            .collect())
    }

    async fn settle_order(&self, order: NewOrder) -> Result<SettledOrder, LedgerError> {
        let mut state = self.state.lock();
        state.check_fault(FaultPoint::SettleOrder, &order.seller_id)?;

        let duplicate = state.orders.iter().any(|o| {
            o.payment_reference == order.payment_reference && o.seller_id == order.seller_id
        });
        if duplicate {
            return Err(LedgerError::DuplicateOrder {
                payment_reference: order.payment_reference,
                seller_id: order.seller_id,
            });
        }

        let now = Utc::now();
        let currency = order.currency.clone();
        let order = order.into_order(now);
        let balance =
            state.preview(&BalanceDelta::credit_pending(&order.seller_id, order.seller_net_amount))?;

        state.orders.push(order.clone());
        state.balances.insert(order.seller_id.clone(), balance.clone());
        let entry = state.push_entry(NewLedgerEntry::credit_pending(&order, &currency));

        Ok(SettledOrder { order, balance, entry })
    }

    async fn sellers_with_matured_orders(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, LedgerError> {
        let sellers: BTreeSet<String> = self
            .state
            .lock()
            .orders
            .iter()
            .filter(|o| o.payout_status == PayoutStatus::Pending && o.payout_eligible_at <= now)
            .map(|o| o.seller_id.clone())
            .collect();
        Ok(sellers.into_iter().collect())
    }

    async fn release_matured(
        &self,
        seller_id: &str,
        now: DateTime<Utc>,
        currency: &str,
    ) -> Result<Option<Release>, LedgerError> {
        let mut state = self.state.lock();

        let matured: Vec<(Uuid, i64)> = state
            .orders
            .iter()
            .filter(|o| {
                o.seller_id == seller_id
                    && o.payout_status.can_transition_to(PayoutStatus::Ready)
                    && o.payout_eligible_at <= now
            })
            .map(|o| (o.id, o.seller_net_amount))
            .collect();

        if matured.is_empty() {
            return Ok(None);
        }
        let amount = total_amount(seller_id, matured.iter().map(|(_, net)| *net))?;

        let order_ids: Vec<Uuid> = matured.iter().map(|(id, _)| *id).collect();
        let balance = state.preview(&BalanceDelta::release(seller_id, amount))?;

        for order in state.orders.iter_mut().filter(|o| order_ids.contains(&o.id)) {
            order.payout_status = PayoutStatus::Ready;
        }
        state.balances.insert(seller_id.to_string(), balance.clone());
        state.push_entry(NewLedgerEntry::release(seller_id, amount, &order_ids, currency));

        debug!(seller_id, amount, orders = order_ids.len(), "Released matured orders in memory store");

        Ok(Some(Release {
            seller_id: seller_id.to_string(),
            amount,
            order_ids,
            balance,
        }))
    }

    async fn sellers_with_available_at_least(
        &self,
        threshold: i64,
    ) -> Result<Vec<SellerBalance>, LedgerError> {
        let mut balances: Vec<SellerBalance> = self
            .state
            .lock()
            .balances
            .values()
            .filter(|b| b.available_amount >= threshold)
            .cloned()
            .collect();
        balances.sort_by(|a, b| a.seller_id.cmp(&b.seller_id));
        Ok(balances)
    }

    async fn ready_orders(&self, seller_id: &str) -> Result<Vec<Order>, LedgerError> {
        let mut orders: Vec<Order> = self
            .state
            .lock()
            .orders
            .iter()
            .filter(|o| o.seller_id == seller_id && o.payout_status == PayoutStatus::Ready)
            .cloned()
            .collect();
        orders.sort_by_key(|o| o.created_at);
        Ok(orders)
    }

    async fn create_payout(&self, payout: NewPayout) -> Result<Payout, LedgerError> {
        let mut state = self.state.lock();
        state.check_fault(FaultPoint::CreatePayout, &payout.seller_id)?;

        let payout = Payout {
            id: Uuid::new_v4(),
            seller_id: payout.seller_id,
            bank_account_id: payout.bank_account_id,
            amount: payout.amount,
            currency: payout.currency,
            provider: payout.provider,
            status: PayoutRunStatus::Processing,
            provider_reference: None,
            failure_reason: None,
            created_at: Utc::now(),
            processed_at: None,
        };
        state.payouts.push(payout.clone());
        Ok(payout)
    }

    async fn fail_payout(
        &self,
        payout_id: Uuid,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<Payout, LedgerError> {
        let mut state = self.state.lock();
        let payout = state
            .payouts
            .iter_mut()
            .find(|p| p.id == payout_id)
            .ok_or(LedgerError::PayoutNotFound(payout_id))?;

        if payout.status.is_terminal() {
            return Err(LedgerError::PayoutNotProcessing {
                payout_id,
                current: payout.status.as_str().to_string(),
            });
        }

        payout.status = PayoutRunStatus::Failed;
        payout.failure_reason = Some(reason.to_string());
        payout.processed_at = Some(at);
        Ok(payout.clone())
    }

    async fn complete_payout(&self, completion: PayoutCompletion) -> Result<Payout, LedgerError> {
        let mut state = self.state.lock();
        state.check_fault(FaultPoint::CompletePayout, &completion.seller_id)?;

        let payout_idx = state
            .payouts
            .iter()
            .position(|p| p.id == completion.payout_id)
            .ok_or(LedgerError::PayoutNotFound(completion.payout_id))?;
        let current = state.payouts[payout_idx].status;
        if current.is_terminal() {
            return Err(LedgerError::PayoutNotProcessing {
                payout_id: completion.payout_id,
                current: current.as_str().to_string(),
            });
        }

        let order_ids: Vec<Uuid> = completion.orders.iter().map(|(id, _)| *id).collect();
        let still_ready = state
            .orders
            .iter()
            .filter(|o| {
                order_ids.contains(&o.id)
                    && o.seller_id == completion.seller_id
                    && o.payout_status.can_transition_to(PayoutStatus::Paid)
            })
            .count();
        if still_ready != order_ids.len() {
            return Err(LedgerError::OrderStateConflict {
                payout_id: completion.payout_id,
                expected: order_ids.len(),
                actual: still_ready,
            });
        }

        let balance =
            state.preview(&BalanceDelta::payout(&completion.seller_id, completion.amount))?;

        let payout = &mut state.payouts[payout_idx];
        payout.status = PayoutRunStatus::Succeeded;
        payout.provider_reference = Some(completion.provider_reference.clone());
        payout.processed_at = Some(completion.processed_at);
        let payout = payout.clone();

        for (order_id, amount) in &completion.orders {
            state.payout_items.push(PayoutItem {
                id: Uuid::new_v4(),
                payout_id: completion.payout_id,
                order_id: *order_id,
                amount: *amount,
            });
        }
        for order in state.orders.iter_mut().filter(|o| order_ids.contains(&o.id)) {
            order.payout_status = PayoutStatus::Paid;
        }
        state.balances.insert(completion.seller_id.clone(), balance);
        state.push_entry(NewLedgerEntry::payout_debit(&completion));

        Ok(payout)
    }

    async fn processing_payouts_for_seller(
        &self,
        seller_id: &str,
    ) -> Result<Vec<Payout>, LedgerError> {
        Ok(self
            .state
            .lock()
            .payouts
            .iter()
            .filter(|p| p.seller_id == seller_id && p.status == PayoutRunStatus::Processing)
            .cloned()
            .collect())
    }

    async fn stale_processing_payouts(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Payout>, LedgerError> {
        Ok(self
            .state
            .lock()
            .payouts
            .iter()
            .filter(|p| p.status == PayoutRunStatus::Processing && p.created_at < older_than)
            .cloned()
            .collect())
    }

    async fn payouts_for_seller(&self, seller_id: &str) -> Result<Vec<Payout>, LedgerError> {
        Ok(self
            .state
            .lock()
            .payouts
            .iter()
            .rev()
            .filter(|p| p.seller_id == seller_id)
            .cloned()
            .collect())
    }

    async fn payout_items(&self, payout_id: Uuid) -> Result<Vec<PayoutItem>, LedgerError> {
        Ok(self
            .state
            .lock()
            .payout_items
            .iter()
            .filter(|i| i.payout_id == payout_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl BankDirectory for InMemoryLedgerStore {
    async fn default_bank_account(
        &self,
        seller_id: &str,
    ) -> Result<Option<BankAccount>, LedgerError> {
        let state = self.state.lock();
        state.check_fault(FaultPoint::BankLookup, seller_id)?;
        Ok(state
            .bank_accounts
            .iter()
            .find(|a| {
                a.seller_id == seller_id && a.is_default && a.status == BankAccountStatus::Active
            })
            .cloned())
    }
}
