//! Points ledger: the ground truth for all balance movements.
//!
//! Entries are append-only; a running `balance_after` is snapshotted onto
//! each row at insertion, so for a fixed user
//! `balance_after[i] = balance_after[i-1] + delta[i]` and replaying the
//! deltas reproduces every balance. Every caller supplies an idempotency
//! key; appending under a key that already exists returns the existing entry
//! with no side effects, which is what makes settlement reruns and retried
//! compensations safe.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::CoreError;
use crate::store::GameStore;

/// One immutable balance movement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub user_id: i64,
    pub delta: i64,
    pub balance_after: i64,
    pub reason: String,
    pub idempotency_key: String,
    /// The logical trading day the movement belongs to.
    pub occurred_on: NaiveDate,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct Ledger {
    store: Arc<GameStore>,
}

impl Ledger {
    pub fn new(store: Arc<GameStore>) -> Self {
        Self { store }
    }

    /// Append a movement. Idempotent on `idempotency_key`: a replay returns
    /// the original entry untouched. Balances may go negative; the chain law
    /// is balance-agnostic.
    pub async fn append(
        &self,
        user_id: i64,
        delta: i64,
        reason: &str,
        idempotency_key: &str,
        occurred_on: NaiveDate,
    ) -> Result<LedgerEntry, CoreError> {
        let (entry, inserted) = self
            .store
            .append_ledger(user_id, delta, reason, idempotency_key, occurred_on)
            .await?;
        if inserted {
            debug!(
                user_id,
                delta,
                balance = entry.balance_after,
                key = idempotency_key,
                reason,
                "ledger entry appended"
            );
        } else {
            debug!(key = idempotency_key, "ledger key replayed, no-op");
        }
        Ok(entry)
    }

    pub async fn credit(
        &self,
        user_id: i64,
        amount: i64,
        reason: &str,
        idempotency_key: &str,
        occurred_on: NaiveDate,
    ) -> Result<LedgerEntry, CoreError> {
        self.append(user_id, amount, reason, idempotency_key, occurred_on)
            .await
    }

    pub async fn debit(
        &self,
        user_id: i64,
        amount: i64,
        reason: &str,
        idempotency_key: &str,
        occurred_on: NaiveDate,
    ) -> Result<LedgerEntry, CoreError> {
        self.append(user_id, -amount, reason, idempotency_key, occurred_on)
            .await
    }

    /// Manual adjustment path for admin tooling. Same append semantics.
    pub async fn adjust(
        &self,
        user_id: i64,
        delta: i64,
        reason: &str,
        idempotency_key: &str,
        occurred_on: NaiveDate,
    ) -> Result<LedgerEntry, CoreError> {
        self.append(user_id, delta, reason, idempotency_key, occurred_on)
            .await
    }

    /// Latest `balance_after`, zero for a user with no entries.
    pub async fn balance(&self, user_id: i64) -> Result<i64, CoreError> {
        self.store.latest_balance(user_id).await
    }

    /// Newest-first history page.
    pub async fn history(&self, user_id: i64, limit: usize) -> Result<Vec<LedgerEntry>, CoreError> {
        self.store.ledger_history(user_id, limit).await
    }

    /// Replay all entries in id order and check the chain law. Exposed for
    /// audits and the `verify` subcommand of the settle driver.
    pub async fn verify_user_chain(&self, user_id: i64) -> Result<(), CoreError> {
        let entries = self.store.ledger_chain(user_id).await?;
        let mut running = 0i64;
        for entry in &entries {
            running += entry.delta;
            if entry.balance_after != running {
                return Err(CoreError::InvariantViolation {
                    detail: format!(
                        "ledger chain broken for user {user_id} at entry {}: \
                         balance_after {} but replayed sum {running}",
                        entry.id, entry.balance_after
                    ),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, 5).unwrap()
    }

    fn ledger() -> Ledger {
        Ledger::new(Arc::new(GameStore::open_in_memory().unwrap()))
    }

    #[tokio::test]
    async fn balances_chain_across_appends() {
        let ledger = ledger();
        ledger.debit(1, 10, "fee", "f:a:fee", day()).await.unwrap();
        ledger
            .credit(1, 100, "award", "f:a:award", day())
            .await
            .unwrap();
        ledger.debit(1, 10, "fee", "f:b:fee", day()).await.unwrap();

        assert_eq!(ledger.balance(1).await.unwrap(), 80);
        ledger.verify_user_chain(1).await.unwrap();

        let history = ledger.history(1, 10).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].balance_after, 80);
    }

    #[tokio::test]
    async fn key_replay_has_no_effect() {
        let ledger = ledger();
        let first = ledger
            .credit(1, 100, "award", "f:a:award", day())
            .await
            .unwrap();
        let replay = ledger
            .credit(1, 100, "award", "f:a:award", day())
            .await
            .unwrap();
        assert_eq!(first, replay);
        assert_eq!(ledger.balance(1).await.unwrap(), 100);
    }

    #[tokio::test]
    async fn negative_balances_are_allowed() {
        let ledger = ledger();
        ledger
            .debit(1, 10, "fee", "f:a:fee", day())
            .await
            .unwrap();
        assert_eq!(ledger.balance(1).await.unwrap(), -10);
        ledger.verify_user_chain(1).await.unwrap();
    }

    #[tokio::test]
    async fn users_do_not_share_balances() {
        let ledger = ledger();
        ledger.credit(1, 100, "a", "k1", day()).await.unwrap();
        ledger.credit(2, 40, "b", "k2", day()).await.unwrap();
        assert_eq!(ledger.balance(1).await.unwrap(), 100);
        assert_eq!(ledger.balance(2).await.unwrap(), 40);
        ledger.verify_user_chain(1).await.unwrap();
        ledger.verify_user_chain(2).await.unwrap();
    }
}
