//! Brokerage clients, one per sub-account.
//!
//! The execution stage only sees the `BrokerClient` capability. The
//! paper broker simulates submission latency and a configurable
//! rejection rate; real brokers live behind the same trait. Callers do
//! not retry accepted orders, so `place_bracket` only needs to be
//! idempotent on the caller's retry after an error.

use crate::models::{AccountId, Order};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::{sleep, Duration};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct BrokerAck {
    pub order_id: String,
    pub accepted_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("order rejected: {0}")]
    Rejected(String),
}

#[async_trait::async_trait]
pub trait BrokerClient: Send + Sync {
    async fn place_bracket(&self, order: &Order) -> Result<BrokerAck, BrokerError>;
}

// ---------------------------------------------------------------------------
// Paper broker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PaperBrokerConfig {
    pub base_latency_ms: u64,
    pub latency_jitter_ms: u64,
    /// Probability of a simulated rejection (0.0 to 1.0).
    pub reject_prob: f64,
    /// Fixed seed makes a run reproducible; None draws from entropy.
    pub seed: Option<u64>,
}

impl Default for PaperBrokerConfig {
    fn default() -> Self {
        Self {
            base_latency_ms: 120,
            latency_jitter_ms: 180,
            reject_prob: 0.0,
            seed: None,
        }
    }
}

impl PaperBrokerConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(v) = std::env::var("PAPER_BASE_LATENCY_MS") {
            if let Ok(ms) = v.parse() {
                config.base_latency_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("PAPER_LATENCY_JITTER_MS") {
            if let Ok(ms) = v.parse() {
                config.latency_jitter_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("PAPER_REJECT_PROB") {
            if let Ok(p) = v.parse() {
                config.reject_prob = p;
            }
        }
        if let Ok(v) = std::env::var("PAPER_SEED") {
            if let Ok(s) = v.parse() {
                config.seed = Some(s);
            }
        }
        config
    }
}

pub struct PaperBroker {
    config: PaperBrokerConfig,
    rng: Mutex<ChaCha8Rng>,
}

impl PaperBroker {
    pub fn new(config: PaperBrokerConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        Self {
            config,
            rng: Mutex::new(rng),
        }
    }
}

#[async_trait::async_trait]
impl BrokerClient for PaperBroker {
    async fn place_bracket(&self, order: &Order) -> Result<BrokerAck, BrokerError> {
        if order.qty == 0 {
            return Err(BrokerError::Rejected("qty must be positive".into()));
        }
        if !(order.take_profit_price.is_finite() && order.take_profit_price > 0.0) {
            return Err(BrokerError::Rejected("invalid take_profit_price".into()));
        }
        if !(order.stop_loss_price.is_finite() && order.stop_loss_price > 0.0) {
            return Err(BrokerError::Rejected("invalid stop_loss_price".into()));
        }

        let (latency_ms, rejected) = {
            let mut rng = self.rng.lock();
            let jitter = if self.config.latency_jitter_ms == 0 {
                0
            } else {
                rng.gen_range(0..=self.config.latency_jitter_ms)
            };
            (
                self.config.base_latency_ms + jitter,
                rng.gen::<f64>() < self.config.reject_prob,
            )
        };
        sleep(Duration::from_millis(latency_ms)).await;

        if rejected {
            return Err(BrokerError::Rejected("rejected (simulated)".into()));
        }

        let ack = BrokerAck {
            order_id: format!("paper:{}", Uuid::new_v4()),
            accepted_at: Utc::now(),
        };
        debug!(
            account = %order.account_id,
            symbol = %order.symbol,
            qty = order.qty,
            order_id = %ack.order_id,
            "paper bracket accepted"
        );
        Ok(ack)
    }
}

// ---------------------------------------------------------------------------
// BrokerSet
// ---------------------------------------------------------------------------

/// The per-account client table the execution stage dispatches through.
#[derive(Clone, Default)]
pub struct BrokerSet {
    by_account: BTreeMap<AccountId, Arc<dyn BrokerClient>>,
}

impl BrokerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, account: AccountId, client: Arc<dyn BrokerClient>) {
        self.by_account.insert(account, client);
    }

    pub fn get(&self, account: &AccountId) -> Option<Arc<dyn BrokerClient>> {
        self.by_account.get(account).cloned()
    }

    /// One shared paper broker bound to every given account.
    pub fn paper_for(accounts: impl IntoIterator<Item = AccountId>, config: PaperBrokerConfig) -> Self {
        let shared: Arc<dyn BrokerClient> = Arc::new(PaperBroker::new(config));
        let mut set = Self::new();
        for account in accounts {
            set.insert(account, shared.clone());
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderSide, OrderType};

    fn order(qty: u64) -> Order {
        Order {
            account_id: AccountId::new("A1"),
            symbol: "SPY".into(),
            side: OrderSide::Buy,
            qty,
            order_type: OrderType::Market,
            time_in_force: "day".into(),
            limit_price: None,
            take_profit_price: 105.0,
            stop_loss_price: 97.5,
        }
    }

    fn fast_config(reject_prob: f64) -> PaperBrokerConfig {
        PaperBrokerConfig {
            base_latency_ms: 0,
            latency_jitter_ms: 0,
            reject_prob,
            seed: Some(7),
        }
    }

    #[tokio::test]
    async fn accepts_a_well_formed_bracket() {
        let broker = PaperBroker::new(fast_config(0.0));
        let ack = broker.place_bracket(&order(100)).await.unwrap();
        assert!(ack.order_id.starts_with("paper:"));
    }

    #[tokio::test]
    async fn rejects_zero_qty() {
        let broker = PaperBroker::new(fast_config(0.0));
        let err = broker.place_bracket(&order(0)).await.unwrap_err();
        assert!(matches!(err, BrokerError::Rejected(_)));
    }

    #[tokio::test]
    async fn always_rejecting_config_rejects() {
        let broker = PaperBroker::new(fast_config(1.0));
        let err = broker.place_bracket(&order(10)).await.unwrap_err();
        assert!(matches!(err, BrokerError::Rejected(_)));
    }

    #[tokio::test]
    async fn broker_set_binds_accounts() {
        let set = BrokerSet::paper_for(
            [AccountId::new("A1"), AccountId::new("A2")],
            fast_config(0.0),
        );
        assert!(set.get(&AccountId::new("A1")).is_some());
        assert!(set.get(&AccountId::new("A3")).is_none());
    }
}
