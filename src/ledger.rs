//! Ledger transfer seam.
//!
//! Settlement moves funds through this capability and trusts its result; the
//! actual chain contract call lives behind the trait. The paper ledger keeps
//! an in-process record of every transfer, which is all tests and dry runs
//! need.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct TransferReceipt {
    pub tx_id: String,
}

#[async_trait]
pub trait LedgerTransfer: Send + Sync {
    /// Move `amount` (smallest currency unit) to `to`. A returned error means
    /// the transfer did not happen; settlement records it per bet and moves on.
    async fn transfer(&self, to: &str, amount: u64, memo: &str) -> Result<TransferReceipt>;
}

#[derive(Debug, Clone)]
pub struct PaperTransfer {
    pub tx_id: String,
    pub to: String,
    pub amount: u64,
    pub memo: String,
    pub at: DateTime<Utc>,
}

/// In-process ledger that records transfers instead of executing them.
pub struct PaperLedger {
    entries: Mutex<Vec<PaperTransfer>>,
}

impl PaperLedger {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn entries(&self) -> Vec<PaperTransfer> {
        self.entries.lock().clone()
    }

    pub fn total_transferred(&self) -> u64 {
        self.entries.lock().iter().map(|e| e.amount).sum()
    }
}

impl Default for PaperLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerTransfer for PaperLedger {
    async fn transfer(&self, to: &str, amount: u64, memo: &str) -> Result<TransferReceipt> {
        let entry = PaperTransfer {
            tx_id: Uuid::new_v4().to_string(),
            to: to.to_string(),
            amount,
            memo: memo.to_string(),
            at: Utc::now(),
        };
        let receipt = TransferReceipt {
            tx_id: entry.tx_id.clone(),
        };
        self.entries.lock().push(entry);

        info!(to, amount, "💸 Paper transfer recorded");
        Ok(receipt)
    }
}
