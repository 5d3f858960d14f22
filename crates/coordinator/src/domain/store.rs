use sqlx::{sqlite::SqliteRow, Row};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::{
    domain::{
        order::{FundingSnapshot, Order, OutputType, Outputs},
        state_machine::OrderState,
    },
    errors::AppError,
    infra::db::{parse_required_datetime, DBConnection},
};

/// Durable, single-table persistence for orders. Wraps the shared read/write `DBConnection`.
#[derive(Clone)]
pub struct OrderStore {
    db: DBConnection,
}

fn json_col<T: serde::Serialize>(value: &T) -> Result<String, AppError> {
    serde_json::to_string(value)
        .map_err(|e| AppError::Unavailable(format!("failed to encode json column: {e}")))
}

fn parse_json_col<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, AppError> {
    serde_json::from_str(raw)
        .map_err(|e| AppError::Unavailable(format!("failed to decode json column: {e}")))
}

fn order_from_row(row: &SqliteRow) -> Result<Order, AppError> {
    let state: String = row.get("state");
    let output_type: Option<String> = row.get("output_type");
    let rbf_state: Option<String> = row.get("rbf_state");
    let outputs_raw: Option<String> = row.get("outputs");
    let partials_raw: String = row.get("partials");
    let rbf_partials_raw: String = row.get("rbf_partials");

    Ok(Order {
        order_id: row.get("order_id"),
        descriptor: row.get("descriptor"),
        index: row.get("idx"),
        label: row.get("label"),
        min_conf: row.get("min_conf"),
        amount_sat: row.get("amount_sat"),
        fee_est_sat: row.get("fee_est_sat"),
        state: state.parse()?,
        funding_txid: row.get("funding_txid"),
        vout: row.get("vout"),
        confirmations: row.get("confirmations"),
        partials: parse_json_col(&partials_raw)?,
        outputs: outputs_raw.as_deref().map(parse_json_col).transpose()?,
        output_type: output_type.map(|s| s.parse()).transpose()?,
        payout_txid: row.get("payout_txid"),
        deadline_ts: row.get("deadline_ts"),
        rbf_psbt: row.get("rbf_psbt"),
        rbf_partials: parse_json_col(&rbf_partials_raw)?,
        rbf_state: rbf_state.map(|s| s.parse()).transpose()?,
        last_webhook_ts: row.get("last_webhook_ts"),
        created_at: parse_required_datetime(row, "created_at")
            .map_err(|e| AppError::Unavailable(e.to_string()))?,
    })
}

impl OrderStore {
    pub fn new(db: DBConnection) -> Self {
        Self { db }
    }

    /// Assigns `max(idx)+1` (0 if empty) across all orders.
    pub async fn next_index(&self) -> Result<i64, AppError> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(idx) FROM orders")
            .fetch_one(self.db.read())
            .await?;
        Ok(max.map(|m| m + 1).unwrap_or(0))
    }

    /// Idempotent on `order_id`: an existing row with the same id is left untouched.
    pub async fn upsert_order(&self, order: &Order) -> Result<Order, AppError> {
        if let Some(existing) = self.get_order(&order.order_id).await? {
            return Ok(existing);
        }
        let created_at = order
            .created_at
            .format(&Rfc3339)
            .map_err(|e| AppError::Unavailable(e.to_string()))?;
        sqlx::query(
            "INSERT INTO orders (order_id, descriptor, idx, label, min_conf, amount_sat, \
             fee_est_sat, state, partials, rbf_partials, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&order.order_id)
        .bind(&order.descriptor)
        .bind(order.index)
        .bind(&order.label)
        .bind(order.min_conf)
        .bind(order.amount_sat)
        .bind(order.fee_est_sat)
        .bind(order.state.to_string())
        .bind(json_col(&order.partials)?)
        .bind(json_col(&order.rbf_partials)?)
        .bind(created_at)
        .execute(self.db.write())
        .await?;
        Ok(order.clone())
    }

    pub async fn get_order(&self, order_id: &str) -> Result<Option<Order>, AppError> {
        let row = sqlx::query("SELECT * FROM orders WHERE order_id = ?")
            .bind(order_id)
            .fetch_optional(self.db.read())
            .await?;
        row.as_ref().map(order_from_row).transpose()
    }

    async fn require_order(&self, order_id: &str) -> Result<Order, AppError> {
        self.get_order(order_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("order {order_id} not found")))
    }

    /// Conditional `UPDATE ... WHERE order_id=? AND state=?`. Zero rows affected means a
    /// concurrent writer already moved the order; the caller sees `InvalidTransition`.
    pub async fn update_state(
        &self,
        order_id: &str,
        to: OrderState,
        confirmations: Option<i64>,
        deadline_ts: Option<i64>,
    ) -> Result<Order, AppError> {
        let current = self.require_order(order_id).await?;
        if !crate::domain::state_machine::allowed(current.state, to) {
            return Err(AppError::InvalidTransition(format!(
                "{} -> {} is not allowed",
                current.state, to
            )));
        }
        let now = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .map_err(|e| AppError::Unavailable(e.to_string()))?;

        let result = sqlx::query(
            "UPDATE orders SET state = ?, confirmations = COALESCE(?, confirmations), \
             deadline_ts = COALESCE(?, deadline_ts), created_at = ? \
             WHERE order_id = ? AND state = ?",
        )
        .bind(to.to_string())
        .bind(confirmations)
        .bind(deadline_ts)
        .bind(now)
        .bind(order_id)
        .bind(current.state.to_string())
        .execute(self.db.write())
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::InvalidTransition(format!(
                "concurrent writer already advanced order {order_id}"
            )));
        }
        self.require_order(order_id).await
    }

    /// Appends `new_partials`, deduplicated against what is already stored.
    pub async fn save_partials(
        &self,
        order_id: &str,
        new_partials: &[String],
    ) -> Result<Vec<String>, AppError> {
        let mut order = self.require_order(order_id).await?;
        for p in new_partials {
            if !order.partials.contains(p) {
                order.partials.push(p.clone());
            }
        }
        sqlx::query("UPDATE orders SET partials = ? WHERE order_id = ?")
            .bind(json_col(&order.partials)?)
            .bind(order_id)
            .execute(self.db.write())
            .await?;
        Ok(order.partials)
    }

    pub async fn get_partials(&self, order_id: &str) -> Result<Vec<String>, AppError> {
        Ok(self.require_order(order_id).await?.partials)
    }

    pub async fn set_outputs(
        &self,
        order_id: &str,
        outputs: &Outputs,
        output_type: OutputType,
    ) -> Result<(), AppError> {
        sqlx::query("UPDATE orders SET outputs = ?, output_type = ? WHERE order_id = ?")
            .bind(json_col(outputs)?)
            .bind(output_type.to_string())
            .bind(order_id)
            .execute(self.db.write())
            .await?;
        Ok(())
    }

    pub async fn get_outputs(&self, order_id: &str) -> Result<Option<Outputs>, AppError> {
        Ok(self.require_order(order_id).await?.outputs)
    }

    pub async fn update_funding(
        &self,
        order_id: &str,
        snapshot: &FundingSnapshot,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE orders SET funding_txid = ?, vout = ?, confirmations = ? WHERE order_id = ?",
        )
        .bind(&snapshot.funding_txid)
        .bind(snapshot.vout)
        .bind(snapshot.confirmations)
        .bind(order_id)
        .execute(self.db.write())
        .await?;
        Ok(())
    }

    pub async fn set_payout_txid(&self, order_id: &str, txid: &str) -> Result<(), AppError> {
        sqlx::query("UPDATE orders SET payout_txid = ? WHERE order_id = ?")
            .bind(txid)
            .bind(order_id)
            .execute(self.db.write())
            .await?;
        Ok(())
    }

    pub async fn set_last_webhook_ts(&self, order_id: &str, ts: i64) -> Result<(), AppError> {
        sqlx::query("UPDATE orders SET last_webhook_ts = ? WHERE order_id = ?")
            .bind(ts)
            .bind(order_id)
            .execute(self.db.write())
            .await?;
        Ok(())
    }

    /// Transitions to `rbf_signing`, stashing the prior state so `clear_rbf` can restore it.
    pub async fn start_rbf(&self, order_id: &str, rbf_psbt: &str) -> Result<(), AppError> {
        let order = self.require_order(order_id).await?;
        sqlx::query(
            "UPDATE orders SET state = ?, rbf_psbt = ?, rbf_partials = '[]', rbf_state = ? \
             WHERE order_id = ?",
        )
        .bind(OrderState::RbfSigning.to_string())
        .bind(rbf_psbt)
        .bind(order.state.to_string())
        .bind(order_id)
        .execute(self.db.write())
        .await?;
        Ok(())
    }

    pub async fn get_rbf_psbt(&self, order_id: &str) -> Result<Option<String>, AppError> {
        Ok(self.require_order(order_id).await?.rbf_psbt)
    }

    /// Restores the state saved by `start_rbf` and clears the RBF staging columns.
    pub async fn clear_rbf(&self, order_id: &str) -> Result<(), AppError> {
        let order = self.require_order(order_id).await?;
        let restore_to = order
            .rbf_state
            .ok_or_else(|| AppError::Unavailable("no rbf_state to restore".to_string()))?;
        sqlx::query(
            "UPDATE orders SET state = ?, rbf_psbt = NULL, rbf_partials = '[]', rbf_state = NULL \
             WHERE order_id = ?",
        )
        .bind(restore_to.to_string())
        .bind(order_id)
        .execute(self.db.write())
        .await?;
        Ok(())
    }

    /// `sum(max(0, 2 - len(partials)))` across orders in `signing` — an observability gauge.
    pub async fn count_pending_signatures(&self) -> Result<i64, AppError> {
        let rows = sqlx::query("SELECT partials FROM orders WHERE state = ?")
            .bind(OrderState::Signing.to_string())
            .fetch_all(self.db.read())
            .await?;
        let mut total = 0i64;
        for row in rows {
            let raw: String = row.get("partials");
            let partials: Vec<String> = parse_json_col(&raw)?;
            total += (2 - partials.len() as i64).max(0);
        }
        Ok(total)
    }

    pub async fn list_orders_by_states(
        &self,
        states: &[OrderState],
    ) -> Result<Vec<Order>, AppError> {
        let placeholders = states.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let sql = format!("SELECT * FROM orders WHERE state IN ({placeholders})");
        let mut query = sqlx::query(&sql);
        for state in states {
            query = query.bind(state.to_string());
        }
        let rows = query.fetch_all(self.db.read()).await?;
        rows.iter().map(order_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::db::DatabaseType;

    async fn memory_store() -> OrderStore {
        let db = DBConnection::new(
            ".",
            "orders_test",
            crate::infra::db::DatabasePoolConfig::testing(),
            DatabaseType::Orders,
        )
        .await
        .expect("in-memory db should init");
        OrderStore::new(db)
    }

    fn sample(order_id: &str) -> Order {
        Order {
            order_id: order_id.to_string(),
            descriptor: "wsh(sortedmulti(2,...))".into(),
            index: 0,
            label: Order::label_for(order_id),
            min_conf: 2,
            amount_sat: 60_000,
            fee_est_sat: 1_500,
            state: OrderState::AwaitingDeposit,
            funding_txid: None,
            vout: None,
            confirmations: None,
            partials: vec![],
            outputs: None,
            output_type: None,
            payout_txid: None,
            deadline_ts: None,
            rbf_psbt: None,
            rbf_partials: vec![],
            rbf_state: None,
            last_webhook_ts: None,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[tokio::test]
    async fn upsert_then_get_round_trips() {
        let store = memory_store().await;
        let order = sample("order1");
        store.upsert_order(&order).await.unwrap();
        let fetched = store.get_order("order1").await.unwrap().unwrap();
        assert_eq!(fetched.order_id, "order1");
        assert_eq!(fetched.state, OrderState::AwaitingDeposit);
    }

    #[tokio::test]
    async fn upsert_is_idempotent_on_order_id() {
        let store = memory_store().await;
        let mut order = sample("order1");
        store.upsert_order(&order).await.unwrap();
        order.amount_sat = 999;
        let result = store.upsert_order(&order).await.unwrap();
        assert_eq!(result.amount_sat, 60_000);
    }

    #[tokio::test]
    async fn update_state_rejects_disallowed_transition() {
        let store = memory_store().await;
        let order = sample("order1");
        store.upsert_order(&order).await.unwrap();
        let err = store
            .update_state("order1", OrderState::Completed, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn update_state_allows_legal_transition() {
        let store = memory_store().await;
        let order = sample("order1");
        store.upsert_order(&order).await.unwrap();
        let updated = store
            .update_state("order1", OrderState::EscrowFunded, Some(2), Some(123))
            .await
            .unwrap();
        assert_eq!(updated.state, OrderState::EscrowFunded);
        assert_eq!(updated.confirmations, Some(2));
        assert_eq!(updated.deadline_ts, Some(123));
    }

    #[tokio::test]
    async fn update_state_preserves_deadline_when_not_given() {
        let store = memory_store().await;
        let order = sample("order1");
        store.upsert_order(&order).await.unwrap();
        store
            .update_state("order1", OrderState::EscrowFunded, None, Some(123))
            .await
            .unwrap();
        let updated = store
            .update_state("order1", OrderState::Signing, None, None)
            .await
            .unwrap();
        assert_eq!(updated.deadline_ts, Some(123));
    }

    #[tokio::test]
    async fn next_index_increments_from_max() {
        let store = memory_store().await;
        assert_eq!(store.next_index().await.unwrap(), 0);
        let mut order = sample("order1");
        order.index = 5;
        store.upsert_order(&order).await.unwrap();
        assert_eq!(store.next_index().await.unwrap(), 6);
    }

    #[tokio::test]
    async fn save_partials_deduplicates() {
        let store = memory_store().await;
        store.upsert_order(&sample("order1")).await.unwrap();
        store
            .save_partials("order1", &["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        let partials = store
            .save_partials("order1", &["b".to_string(), "c".to_string()])
            .await
            .unwrap();
        assert_eq!(partials, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn count_pending_signatures_sums_shortfall() {
        let store = memory_store().await;
        let mut o1 = sample("order1");
        o1.state = OrderState::Signing;
        store.upsert_order(&o1).await.unwrap();
        store
            .save_partials("order1", &["a".to_string()])
            .await
            .unwrap();
        let mut o2 = sample("order2");
        o2.state = OrderState::Signing;
        store.upsert_order(&o2).await.unwrap();
        assert_eq!(store.count_pending_signatures().await.unwrap(), 1 + 2);
    }
}
