use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{types::Json, PgExecutor, PgPool, Postgres, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use super::models::*;
use super::store::{BankDirectory, LedgerStore};
use crate::error::LedgerError;

const BALANCE_COLUMNS: &str =
    "seller_id, pending_amount, available_amount, lifetime_earned, lifetime_paid, updated_at";

const ORDER_COLUMNS: &str = "id, payment_reference, seller_id, buyer_id, buyer_display_name, \
     gross_amount, platform_fee_amount, seller_net_amount, line_items, status, payout_status, \
     payout_eligible_at, created_at";

const ENTRY_COLUMNS: &str = "id, seq, seller_id, order_id, payout_id, entry_type, amount, currency, \
     description, metadata, created_at";

const PAYOUT_COLUMNS: &str = "id, seller_id, bank_account_id, amount, currency, provider, status, \
     provider_reference, failure_reason, created_at, processed_at";

/// Postgres ledger repository - the source of truth for balances and payouts
pub struct LedgerRepository {
    pub pool: PgPool,
}

impl LedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn begin_tx(&self) -> Result<Transaction<'_, Postgres>, LedgerError> {
        Ok(self.pool.begin().await?)
    }

    /// Conditional in-place update; the row lock taken by UPDATE serializes
    /// concurrent deltas for the same seller.
    async fn apply_delta_tx(
        tx: &mut Transaction<'_, Postgres>,
        delta: &BalanceDelta,
    ) -> Result<SellerBalance, LedgerError> {
        sqlx::query(
            "INSERT INTO seller_balances (seller_id) VALUES ($1) ON CONFLICT (seller_id) DO NOTHING",
        )
        .bind(&delta.seller_id)
        .execute(&mut **tx)
        .await?;

        let updated = sqlx::query_as::<_, SellerBalance>(&format!(
            r#"
            UPDATE seller_balances
            SET pending_amount = pending_amount + $2,
                available_amount = available_amount + $3,
                lifetime_earned = lifetime_earned + $4,
                lifetime_paid = lifetime_paid + $5,
                updated_at = NOW()
            WHERE seller_id = $1
              AND pending_amount + $2 >= 0
              AND available_amount + $3 >= 0
              AND lifetime_earned + $4 >= 0
              AND lifetime_paid + $5 >= 0
            RETURNING {}
            "#,
            BALANCE_COLUMNS
        ))
        .bind(&delta.seller_id)
        .bind(delta.pending)
        .bind(delta.available)
        .bind(delta.earned)
        .bind(delta.paid)
        .fetch_optional(&mut **tx)
        .await?;

        if let Some(balance) = updated {
            return Ok(balance);
        }

        let current = sqlx::query_as::<_, SellerBalance>(&format!(
            "SELECT {} FROM seller_balances WHERE seller_id = $1",
            BALANCE_COLUMNS
        ))
        .bind(&delta.seller_id)
        .fetch_one(&mut **tx)
        .await?;

        Err(match current.apply(delta) {
            Err(violation) => violation,
            Ok(_) => LedgerError::InvariantViolation {
                seller_id: delta.seller_id.clone(),
                field: "balance",
                current: current.available_amount,
                delta: delta.available,
            },
        })
    }

    async fn insert_entry<'e, E: PgExecutor<'e>>(
        executor: E,
        entry: NewLedgerEntry,
    ) -> Result<LedgerEntry, LedgerError> {
        let entry = sqlx::query_as::<_, LedgerEntry>(&format!(
            r#"
            INSERT INTO wallet_ledger (
                id, seller_id, order_id, payout_id, entry_type, amount, currency,
                description, metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {}
            "#,
            ENTRY_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(&entry.seller_id)
        .bind(entry.order_id)
        .bind(entry.payout_id)
        .bind(entry.entry_type)
        .bind(entry.amount)
        .bind(&entry.currency)
        .bind(&entry.description)
        .bind(&entry.metadata)
        .fetch_one(executor)
        .await?;

        Ok(entry)
    }

    /// Distinguish "missing" from "already terminal" after a guarded update matched nothing
    async fn payout_transition_error(
        tx: &mut Transaction<'_, Postgres>,
        payout_id: Uuid,
    ) -> Result<LedgerError, LedgerError> {
        let current = sqlx::query_scalar::<_, PayoutRunStatus>(
            "SELECT status FROM payouts WHERE id = $1",
        )
        .bind(payout_id)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(match current {
            None => LedgerError::PayoutNotFound(payout_id),
            Some(status) => LedgerError::PayoutNotProcessing {
                payout_id,
                current: status.as_str().to_string(),
            },
        })
    }
}

#[async_trait]
impl LedgerStore for LedgerRepository {
    async fn apply_delta(&self, delta: &BalanceDelta) -> Result<SellerBalance, LedgerError> {
        let mut tx = self.begin_tx().await?;
        let balance = Self::apply_delta_tx(&mut tx, delta).await?;
        tx.commit().await?;
        Ok(balance)
    }

    async fn append_entry(&self, entry: NewLedgerEntry) -> Result<LedgerEntry, LedgerError> {
        Self::insert_entry(&self.pool, entry).await
    }

    async fn get_balance(&self, seller_id: &str) -> Result<Option<SellerBalance>, LedgerError> {
        let balance = sqlx::query_as::<_, SellerBalance>(&format!(
            "SELECT {} FROM seller_balances WHERE seller_id = $1",
            BALANCE_COLUMNS
        ))
        .bind(seller_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(balance)
    }

    async fn entries_for_seller(&self, seller_id: &str) -> Result<Vec<LedgerEntry>, LedgerError> {
        let entries = sqlx::query_as::<_, LedgerEntry>(&format!(
            "SELECT {} FROM wallet_ledger WHERE seller_id = $1 ORDER BY seq ASC",
            ENTRY_COLUMNS
        ))
        .bind(seller_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }

    async fn orders_by_payment_reference(
        &self,
        payment_reference: &str,
    ) -> Result<Vec<Order>, LedgerError> {
        let orders = sqlx::query_as::<_, Order>(&format!(
            "SELECT {} FROM orders WHERE payment_reference = $1 ORDER BY created_at ASC",
            ORDER_COLUMNS
        ))
        .bind(payment_reference)
        .fetch_all(&self.pool)
        .await?;

        Ok(orders)
    }

    async fn orders_for_seller(&self, seller_id: &str) -> Result<Vec<Order>, LedgerError> {
        let orders = sqlx::query_as::<_, Order>(&format!(
            "SELECT {} FROM orders WHERE seller_id = $1 ORDER BY created_at ASC",
            ORDER_COLUMNS
        ))
        .bind(seller_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(orders)
    }

    async fn settle_order(&self, order: NewOrder) -> Result<SettledOrder, LedgerError> {
        let mut tx = self.begin_tx().await?;
        let now = Utc::now();
        let currency = order.currency.clone();

        let inserted = sqlx::query_as::<_, Order>(&format!(
            r#"
            INSERT INTO orders (
                id, payment_reference, seller_id, buyer_id, buyer_display_name,
                gross_amount, platform_fee_amount, seller_net_amount, line_items,
                status, payout_status, payout_eligible_at, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (payment_reference, seller_id) DO NOTHING
            RETURNING {}
            "#,
            ORDER_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(&order.payment_reference)
        .bind(&order.seller_id)
        .bind(&order.buyer_id)
        .bind(&order.buyer_display_name)
        .bind(order.gross_amount)
        .bind(order.platform_fee_amount)
        .bind(order.seller_net_amount)
        .bind(Json(&order.line_items))
        .bind(OrderStatus::Completed)
        .bind(PayoutStatus::Pending)
        .bind(order.payout_eligible_at)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(inserted) = inserted else {
            return Err(LedgerError::DuplicateOrder {
                payment_reference: order.payment_reference,
                seller_id: order.seller_id,
            });
        };

        let balance = Self::apply_delta_tx(
            &mut tx,
            &BalanceDelta::credit_pending(&inserted.seller_id, inserted.seller_net_amount),
        )
        .await?;
        let entry =
            Self::insert_entry(&mut *tx, NewLedgerEntry::credit_pending(&inserted, &currency)).await?;

        tx.commit().await?;

        debug!(
            order_id = %inserted.id,
            seller_id = %inserted.seller_id,
            net = inserted.seller_net_amount,
            "Order settled"
        );

        Ok(SettledOrder {
            order: inserted,
            balance,
            entry,
        })
    }

    async fn sellers_with_matured_orders(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, LedgerError> {
        let sellers = sqlx::query_scalar::<_, String>(
            r#"
            SELECT DISTINCT seller_id
            FROM orders
            WHERE payout_status = $1 AND payout_eligible_at <= $2
            ORDER BY seller_id
            "#,
        )
        .bind(PayoutStatus::Pending)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(sellers)
    }

    async fn release_matured(
        &self,
        seller_id: &str,
        now: DateTime<Utc>,
        currency: &str,
    ) -> Result<Option<Release>, LedgerError> {
        let mut tx = self.begin_tx().await?;

        // FOR UPDATE: a concurrent run blocks here, then re-reads the rows as ready
        let matured = sqlx::query_as::<_, (Uuid, i64)>(
            r#"
            SELECT id, seller_net_amount
            FROM orders
            WHERE seller_id = $1 AND payout_status = $2 AND payout_eligible_at <= $3
            ORDER BY created_at ASC
            FOR UPDATE
            "#,
        )
        .bind(seller_id)
        .bind(PayoutStatus::Pending)
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        if matured.is_empty() {
            tx.rollback().await?;
            return Ok(None);
        }

        let order_ids: Vec<Uuid> = matured.iter().map(|(id, _)| *id).collect();
        let amount = total_amount(seller_id, matured.iter().map(|(_, net)| *net))?;

        sqlx::query("UPDATE orders SET payout_status = $2 WHERE id = ANY($1) AND payout_status = $3")
            .bind(&order_ids[..])
            .bind(PayoutStatus::Ready)
            .bind(PayoutStatus::Pending)
            .execute(&mut *tx)
            .await?;

        let balance = Self::apply_delta_tx(&mut tx, &BalanceDelta::release(seller_id, amount)).await?;
        Self::insert_entry(&mut *tx, NewLedgerEntry::release(seller_id, amount, &order_ids, currency))
            .await?;

        tx.commit().await?;

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
        let balances = sqlx::query_as::<_, SellerBalance>(&format!(
            "SELECT {} FROM seller_balances WHERE available_amount >= $1 ORDER BY seller_id",
            BALANCE_COLUMNS
        ))
        .bind(threshold)
        .fetch_all(&self.pool)
        .await?;

        Ok(balances)
    }

    async fn ready_orders(&self, seller_id: &str) -> Result<Vec<Order>, LedgerError> {
        let orders = sqlx::query_as::<_, Order>(&format!(
            "SELECT {} FROM orders WHERE seller_id = $1 AND payout_status = $2 ORDER BY created_at ASC",
            ORDER_COLUMNS
        ))
        .bind(seller_id)
        .bind(PayoutStatus::Ready)
        .fetch_all(&self.pool)
        .await?;

        Ok(orders)
    }

    async fn create_payout(&self, payout: NewPayout) -> Result<Payout, LedgerError> {
        let payout = sqlx::query_as::<_, Payout>(&format!(
            r#"
            INSERT INTO payouts (id, seller_id, bank_account_id, amount, currency, provider, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {}
            "#,
            PAYOUT_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(&payout.seller_id)
        .bind(payout.bank_account_id)
        .bind(payout.amount)
        .bind(&payout.currency)
        .bind(&payout.provider)
        .bind(PayoutRunStatus::Processing)
        .fetch_one(&self.pool)
        .await?;

        info!(payout_id = %payout.id, seller_id = %payout.seller_id, amount = payout.amount, "Payout row created");
        Ok(payout)
    }

    async fn fail_payout(
        &self,
        payout_id: Uuid,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<Payout, LedgerError> {
        let mut tx = self.begin_tx().await?;

        let updated = sqlx::query_as::<_, Payout>(&format!(
            r#"
            UPDATE payouts
            SET status = $2, failure_reason = $3, processed_at = $4
            WHERE id = $1 AND status = $5
            RETURNING {}
            "#,
            PAYOUT_COLUMNS
        ))
        .bind(payout_id)
        .bind(PayoutRunStatus::Failed)
        .bind(reason)
        .bind(at)
        .bind(PayoutRunStatus::Processing)
        .fetch_optional(&mut *tx)
        .await?;

        match updated {
            Some(payout) => {
                tx.commit().await?;
                Ok(payout)
            }
            None => Err(Self::payout_transition_error(&mut tx, payout_id).await?),
        }
    }

    async fn complete_payout(&self, completion: PayoutCompletion) -> Result<Payout, LedgerError> {
        let mut tx = self.begin_tx().await?;

        let updated = sqlx::query_as::<_, Payout>(&format!(
            r#"
            UPDATE payouts
            SET status = $2, provider_reference = $3, processed_at = $4
            WHERE id = $1 AND status = $5
            RETURNING {}
            "#,
            PAYOUT_COLUMNS
        ))
        .bind(completion.payout_id)
        .bind(PayoutRunStatus::Succeeded)
        .bind(&completion.provider_reference)
        .bind(completion.processed_at)
        .bind(PayoutRunStatus::Processing)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(payout) = updated else {
            return Err(Self::payout_transition_error(&mut tx, completion.payout_id).await?);
        };

        let order_ids: Vec<Uuid> = completion.orders.iter().map(|(id, _)| *id).collect();
        let flipped = sqlx::query(
            r#"
            UPDATE orders SET payout_status = $3
            WHERE id = ANY($1) AND seller_id = $2 AND payout_status = $4
            "#,
        )
        .bind(&order_ids[..])
        .bind(&completion.seller_id)
        .bind(PayoutStatus::Paid)
        .bind(PayoutStatus::Ready)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if flipped as usize != order_ids.len() {
            return Err(LedgerError::OrderStateConflict {
                payout_id: completion.payout_id,
                expected: order_ids.len(),
                actual: flipped as usize,
            });
        }

        for (order_id, amount) in &completion.orders {
            sqlx::query(
                "INSERT INTO payout_items (id, payout_id, order_id, amount) VALUES ($1, $2, $3, $4)",
            )
            .bind(Uuid::new_v4())
            .bind(completion.payout_id)
            .bind(order_id)
            .bind(amount)
            .execute(&mut *tx)
            .await?;
        }

        Self::apply_delta_tx(
            &mut tx,
            &BalanceDelta::payout(&completion.seller_id, completion.amount),
        )
        .await?;
        Self::insert_entry(&mut *tx, NewLedgerEntry::payout_debit(&completion)).await?;

        tx.commit().await?;
        Ok(payout)
    }

    async fn processing_payouts_for_seller(
        &self,
        seller_id: &str,
    ) -> Result<Vec<Payout>, LedgerError> {
        let payouts = sqlx::query_as::<_, Payout>(&format!(
            "SELECT {} FROM payouts WHERE seller_id = $1 AND status = $2 ORDER BY created_at ASC",
            PAYOUT_COLUMNS
        ))
        .bind(seller_id)
        .bind(PayoutRunStatus::Processing)
        .fetch_all(&self.pool)
        .await?;

        Ok(payouts)
    }

    async fn stale_processing_payouts(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Payout>, LedgerError> {
        let payouts = sqlx::query_as::<_, Payout>(&format!(
            "SELECT {} FROM payouts WHERE status = $1 AND created_at < $2 ORDER BY created_at ASC",
            PAYOUT_COLUMNS
        ))
        .bind(PayoutRunStatus::Processing)
        .bind(older_than)
        .fetch_all(&self.pool)
        .await?;

        Ok(payouts)
    }

    async fn payouts_for_seller(&self, seller_id: &str) -> Result<Vec<Payout>, LedgerError> {
        let payouts = sqlx::query_as::<_, Payout>(&format!(
            "SELECT {} FROM payouts WHERE seller_id = $1 ORDER BY created_at DESC",
            PAYOUT_COLUMNS
        ))
        .bind(seller_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(payouts)
    }

    async fn payout_items(&self, payout_id: Uuid) -> Result<Vec<PayoutItem>, LedgerError> {
        let items = sqlx::query_as::<_, PayoutItem>(
            "SELECT id, payout_id, order_id, amount FROM payout_items WHERE payout_id = $1",
        )
        .bind(payout_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(items)
    }
}

#[async_trait]
impl BankDirectory for LedgerRepository {
    async fn default_bank_account(
        &self,
        seller_id: &str,
    ) -> Result<Option<BankAccount>, LedgerError> {
        let account = sqlx::query_as::<_, BankAccount>(
            r#"
            SELECT id, seller_id, account_holder_name, bank_code, account_number_encrypted,
                   is_default, status
            FROM seller_bank_accounts
            WHERE seller_id = $1 AND is_default = TRUE AND status = $2
            "#,
        )
        .bind(seller_id)
        .bind(BankAccountStatus::Active)
        .fetch_optional(&self.pool)
        .await?;

        Ok(account)
    }
}
