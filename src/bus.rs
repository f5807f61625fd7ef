// =============================================================================
// Message Bus Client — subject-addressed pub/sub over NATS
// =============================================================================
//
// The bus is the only shared mutable interface between processes and carries
// only immutable JSON payloads. Ordering contract: per-subject FIFO within a
// single publisher; nothing is assumed across publishers. Delivery is
// at-least-once in principle, so consumers deduplicate on intent ids.
//
// Two implementations of the same trait:
//   - NatsBus:  production fabric (NATS_URL), reconnect handled by the client.
//   - LocalBus: in-process fan-out for tests and single-process paper runs.
//
// `subscribe` hands back a receiver; the subscribing component drains it from
// exactly one dispatcher task.
// =============================================================================

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Per-subscription channel depth. A consumer that falls this far behind is
/// shedding load; the publisher side logs and drops.
const SUBSCRIPTION_DEPTH: usize = 1024;

// ---------------------------------------------------------------------------
// Subjects
// ---------------------------------------------------------------------------

pub const MARKET_DATA_SUBJECT: &str = "market.data";
pub const ORDERS_SUBJECT: &str = "trading.orders";
pub const EXECUTIONS_SUBJECT: &str = "trading.executions";
pub const RISK_STATE_SUBJECT: &str = "risk.state";
pub const REPLAY_CONTROL_SUBJECT: &str = "replay.control";

/// Resolved subject names, after environment overrides.
#[derive(Debug, Clone)]
pub struct Subjects {
    pub market_data: String,
    pub orders: String,
    pub executions: String,
    pub risk_state: String,
    pub replay_control: String,
}

impl Default for Subjects {
    fn default() -> Self {
        Self {
            market_data: MARKET_DATA_SUBJECT.to_string(),
            orders: ORDERS_SUBJECT.to_string(),
            executions: EXECUTIONS_SUBJECT.to_string(),
            risk_state: RISK_STATE_SUBJECT.to_string(),
            replay_control: REPLAY_CONTROL_SUBJECT.to_string(),
        }
    }
}

impl Subjects {
    /// Apply `MARKET_DATA_SUBJECT` / `ORDERS_SUBJECT` / `EXEC_SUBJECT`
    /// overrides from the environment.
    pub fn from_env() -> Self {
        let mut s = Self::default();
        if let Ok(v) = std::env::var("MARKET_DATA_SUBJECT") {
            s.market_data = v;
        }
        if let Ok(v) = std::env::var("ORDERS_SUBJECT") {
            s.orders = v;
        }
        if let Ok(v) = std::env::var("EXEC_SUBJECT") {
            s.executions = v;
        }
        s
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Publish/subscribe over named subjects.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish `payload` on `subject`. FIFO relative to this publisher.
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()>;

    /// Open a subscription on `subject`. Messages arrive on the returned
    /// receiver; drain it from a single task.
    async fn subscribe(&self, subject: &str) -> Result<mpsc::Receiver<Vec<u8>>>;
}

// ---------------------------------------------------------------------------
// NATS implementation
// ---------------------------------------------------------------------------

/// Bus client over a NATS connection. The underlying client reconnects and
/// replays subscriptions on its own; connection establishment is retried here
/// so a late-starting server does not kill the process.
pub struct NatsBus {
    client: async_nats::Client,
}

impl NatsBus {
    /// Connect to `url`, retrying every 5 s until the server answers.
    pub async fn connect(url: &str) -> Result<Self> {
        loop {
            match async_nats::connect(url).await {
                Ok(client) => {
                    info!(url = %url, "bus connected");
                    return Ok(Self { client });
                }
                Err(e) => {
                    error!(url = %url, error = %e, "bus connection failed — retrying in 5s");
                    tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
                }
            }
        }
    }
}

#[async_trait]
impl MessageBus for NatsBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()> {
        self.client
            .publish(subject.to_string(), payload.into())
            .await
            .with_context(|| format!("failed to publish on {subject}"))?;
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<mpsc::Receiver<Vec<u8>>> {
        let mut sub = self
            .client
            .subscribe(subject.to_string())
            .await
            .with_context(|| format!("failed to subscribe to {subject}"))?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_DEPTH);
        let subject_owned = subject.to_string();

        // Single dispatcher per subscription.
        tokio::spawn(async move {
            while let Some(msg) = sub.next().await {
                if tx.send(msg.payload.to_vec()).await.is_err() {
                    debug!(subject = %subject_owned, "subscriber dropped — dispatcher exiting");
                    return;
                }
            }
            warn!(subject = %subject_owned, "bus subscription stream ended");
        });

        Ok(rx)
    }
}

// ---------------------------------------------------------------------------
// In-process implementation
// ---------------------------------------------------------------------------

/// Zero-infrastructure bus: fans every publish out to all current subscribers
/// of the subject. Preserves the per-publisher FIFO contract because `publish`
/// completes sends in subscription order before returning.
#[derive(Default)]
pub struct LocalBus {
    topics: Mutex<HashMap<String, Vec<mpsc::Sender<Vec<u8>>>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()> {
        let senders: Vec<mpsc::Sender<Vec<u8>>> = {
            let topics = self.topics.lock();
            topics.get(subject).cloned().unwrap_or_default()
        };

        for tx in &senders {
            if tx.send(payload.clone()).await.is_err() {
                // Receiver gone; prune it lazily.
                let mut topics = self.topics.lock();
                if let Some(list) = topics.get_mut(subject) {
                    list.retain(|t| !t.is_closed());
                }
            }
        }
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<mpsc::Receiver<Vec<u8>>> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_DEPTH);
        self.topics
            .lock()
            .entry(subject.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_bus_roundtrip() {
        let bus = LocalBus::new();
        let mut rx = bus.subscribe("t.one").await.unwrap();

        bus.publish("t.one", b"hello".to_vec()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn local_bus_fans_out_to_all_subscribers() {
        let bus = LocalBus::new();
        let mut a = bus.subscribe("t.fan").await.unwrap();
        let mut b = bus.subscribe("t.fan").await.unwrap();

        bus.publish("t.fan", b"x".to_vec()).await.unwrap();
        assert_eq!(a.recv().await.unwrap(), b"x");
        assert_eq!(b.recv().await.unwrap(), b"x");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let bus = LocalBus::new();
        assert!(bus.publish("t.empty", b"x".to_vec()).await.is_ok());
    }

    #[tokio::test]
    async fn per_publisher_fifo_preserved() {
        let bus = LocalBus::new();
        let mut rx = bus.subscribe("t.fifo").await.unwrap();

        for i in 0u8..10 {
            bus.publish("t.fifo", vec![i]).await.unwrap();
        }
        for i in 0u8..10 {
            assert_eq!(rx.recv().await.unwrap(), vec![i]);
        }
    }

    #[test]
    fn subject_env_overrides() {
        std::env::set_var("ORDERS_SUBJECT", "custom.orders");
        let s = Subjects::from_env();
        assert_eq!(s.orders, "custom.orders");
        assert_eq!(s.market_data, MARKET_DATA_SUBJECT);
        std::env::remove_var("ORDERS_SUBJECT");
    }
}
