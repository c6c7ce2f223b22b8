//! Transfer ledger and coordinator.
//!
//! The ledger owns every pending transfer negotiation, keyed by the
//! ordered (sender, recipient) pair, plus the cancellation handle of each
//! in-flight relay. Relay ports are allocated by probing a bounded range
//! with real binds; the winning listener stays bound and is handed to the
//! relay task, so a port can never be probed free and then lost to a
//! concurrent transfer.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use crate::event::ServerEvent;
use crate::registry::Registry;
use crate::relay;

/// Number of ports probed above the control port.
const PORT_SPAN: u16 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTransfer {
    pub sender: String,
    pub recipient: String,
    pub filename: String,
    pub size_kb: u64,
    pub checksum: Option<String>,
    pub port: Option<u16>,
}

/// Probe range exhausted without finding a bindable port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortExhausted;

pub struct TransferLedger {
    base_port: u16,
    port_span: u16,
    inner: Mutex<LedgerInner>,
}

struct LedgerInner {
    pending: HashMap<(String, String), PendingTransfer>,
    active: HashMap<(String, String), watch::Sender<bool>>,
}

impl TransferLedger {
    pub fn new(base_port: u16) -> Self {
        Self::with_span(base_port, PORT_SPAN)
    }

    fn with_span(base_port: u16, port_span: u16) -> Self {
        Self {
            base_port,
            port_span,
            inner: Mutex::new(LedgerInner {
                pending: HashMap::new(),
                active: HashMap::new(),
            }),
        }
    }

    /// Record a negotiation. A repeated `/sendfile` for the same ordered
    /// pair replaces the previous entry.
    pub async fn register(
        &self,
        sender: &str,
        recipient: &str,
        filename: &str,
        size_kb: u64,
        checksum: Option<String>,
    ) {
        let entry = PendingTransfer {
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            filename: filename.to_string(),
            size_kb,
            checksum,
            port: None,
        };
        let mut inner = self.inner.lock().await;
        inner
            .pending
            .insert((sender.to_string(), recipient.to_string()), entry);
    }

    pub async fn get(&self, sender: &str, recipient: &str) -> Option<PendingTransfer> {
        let inner = self.inner.lock().await;
        inner
            .pending
            .get(&(sender.to_string(), recipient.to_string()))
            .cloned()
    }

    /// Remove a pending negotiation that has no running relay.
    pub async fn remove(&self, sender: &str, recipient: &str) -> Option<PendingTransfer> {
        let mut inner = self.inner.lock().await;
        inner
            .pending
            .remove(&(sender.to_string(), recipient.to_string()))
    }

    async fn assign_port(&self, sender: &str, recipient: &str, port: u16) {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner
            .pending
            .get_mut(&(sender.to_string(), recipient.to_string()))
        {
            entry.port = Some(port);
        }
    }

    async fn track_active(&self, sender: &str, recipient: &str, cancel: watch::Sender<bool>) {
        let mut inner = self.inner.lock().await;
        inner
            .active
            .insert((sender.to_string(), recipient.to_string()), cancel);
    }

    /// Relay cleanup: drop both the pending entry and the cancel handle.
    pub async fn finish(&self, sender: &str, recipient: &str) -> Option<PendingTransfer> {
        let mut inner = self.inner.lock().await;
        let key = (sender.to_string(), recipient.to_string());
        inner.active.remove(&key);
        inner.pending.remove(&key)
    }

    /// Tear down everything that names `username` as sender or recipient.
    ///
    /// Not-yet-relaying entries are removed and returned so the caller can
    /// broadcast a cancellation per entry. In-flight relays get their
    /// cancel signal fired and announce their own termination.
    pub async fn cancel_for_user(&self, username: &str) -> Vec<PendingTransfer> {
        let mut inner = self.inner.lock().await;

        for (key, cancel) in &inner.active {
            if key.0 == username || key.1 == username {
                let _ = cancel.send(true);
            }
        }

        let idle_keys: Vec<(String, String)> = inner
            .pending
            .keys()
            .filter(|key| {
                (key.0 == username || key.1 == username) && !inner.active.contains_key(*key)
            })
            .cloned()
            .collect();

        idle_keys
            .into_iter()
            .filter_map(|key| inner.pending.remove(&key))
            .collect()
    }

    /// Probe the relay port range with real binds and return the first
    /// bindable port together with its still-bound listener.
    pub async fn allocate_port(&self) -> Result<(u16, TcpListener), PortExhausted> {
        for offset in 1..=self.port_span {
            let Some(port) = self.base_port.checked_add(offset) else {
                break;
            };
            match TcpListener::bind(("0.0.0.0", port)).await {
                Ok(listener) => return Ok((port, listener)),
                Err(_) => continue,
            }
        }
        Err(PortExhausted)
    }
}

/// Accept a negotiated transfer: allocate a relay port, announce it, and
/// hand the bound listener to a freshly spawned relay task. Never blocks
/// the calling session loop on relay progress.
pub async fn start_transfer(
    registry: Arc<Registry>,
    ledger: Arc<TransferLedger>,
    pending: PendingTransfer,
) {
    let sender = pending.sender.clone();
    let recipient = pending.recipient.clone();

    let (port, listener) = match ledger.allocate_port().await {
        Ok(allocation) => allocation,
        Err(PortExhausted) => {
            warn!(%sender, %recipient, "relay port range exhausted");
            ledger.remove(&sender, &recipient).await;
            let failed = ServerEvent::TransferFailed {
                sender,
                recipient,
                reason: "no relay port available".to_string(),
            };
            registry.broadcast(&failed.to_string(), None).await;
            return;
        }
    };

    ledger.assign_port(&sender, &recipient, port).await;
    let (cancel_tx, cancel_rx) = watch::channel(false);
    ledger.track_active(&sender, &recipient, cancel_tx).await;

    info!(%sender, %recipient, port, "starting relay");
    let started = ServerEvent::TransferStarted {
        sender: sender.clone(),
        recipient: recipient.clone(),
        port,
    };
    registry.broadcast(&started.to_string(), None).await;

    tokio::spawn(relay::run(listener, pending, registry, ledger, cancel_rx));
}
