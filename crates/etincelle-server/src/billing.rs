//! Token ("diamond") ledger collaborator contract.
//!
//! The relay treats the ledger as atomic: `debit` either applies fully or
//! reports the current balance untouched. The in-memory implementation
//! serializes per-account debits with a per-user mutex, so two concurrent
//! sends from the same sender can never both pass a balance check that only
//! one can afford.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use etincelle_shared::UserId;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("insufficient funds: balance {balance}")]
pub struct InsufficientFunds {
    pub balance: u64,
}

#[async_trait]
pub trait TokenLedger: Send + Sync {
    async fn balance(&self, user: &UserId) -> u64;

    /// Returns the new balance.
    async fn credit(&self, user: &UserId, amount: u64) -> u64;

    /// Atomic check-and-debit. On success returns the new balance; on
    /// failure nothing changes and the current balance is reported.
    async fn debit(&self, user: &UserId, amount: u64) -> Result<u64, InsufficientFunds>;
}

/// In-memory ledger. Accounts are created with `starting_balance` the first
/// time they are touched (development convenience; the production billing
/// module replaces this implementation wholesale).
pub struct MemoryLedger {
    accounts: DashMap<UserId, Arc<Mutex<u64>>>,
    starting_balance: u64,
}

impl MemoryLedger {
    pub fn new(starting_balance: u64) -> Self {
        Self {
            accounts: DashMap::new(),
            starting_balance,
        }
    }

    fn account(&self, user: &UserId) -> Arc<Mutex<u64>> {
        self.accounts
            .entry(user.clone())
            .or_insert_with(|| Arc::new(Mutex::new(self.starting_balance)))
            .clone()
    }

    /// Test/bootstrap helper: overwrite an account balance.
    pub async fn set_balance(&self, user: &UserId, amount: u64) {
        let account = self.account(user);
        *account.lock().await = amount;
    }
}

#[async_trait]
impl TokenLedger for MemoryLedger {
    async fn balance(&self, user: &UserId) -> u64 {
        *self.account(user).lock().await
    }

    async fn credit(&self, user: &UserId, amount: u64) -> u64 {
        let account = self.account(user);
        let mut balance = account.lock().await;
        *balance = balance.saturating_add(amount);
        debug!(user = %user, amount, balance = *balance, "Credit applied");
        *balance
    }

    async fn debit(&self, user: &UserId, amount: u64) -> Result<u64, InsufficientFunds> {
        let account = self.account(user);
        let mut balance = account.lock().await;
        if *balance < amount {
            return Err(InsufficientFunds { balance: *balance });
        }
        *balance -= amount;
        debug!(user = %user, amount, balance = *balance, "Debit applied");
        Ok(*balance)
    }
}
