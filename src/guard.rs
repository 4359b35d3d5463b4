//! Guard lifecycle and the ingestion API.
//!
//! [`DestinationGuard::start`] builds the topology, recovers the previous
//! allow-list from the kernel and spawns the synchronizer. The returned
//! [`GuardHandle`] is the only way in: it clones freely and every clone feeds
//! the same bounded queue.

use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::info;

use crate::config::FirewallConfiguration;
use crate::error::GuardError;
use crate::netfilter::RuleEngine;
use crate::recovery;
use crate::store::{AllowEntry, AllowList};
use crate::synchronizer::{expiry_for, Message, Synchronizer};
use crate::topology::{self, Topology};

/// Seam the DNS-observing collaborator programs against.
#[async_trait]
pub trait DestinationGuardManager: Send + Sync {
    /// Admit `addresses` (raw 4 or 16-byte forms) for `ttl` seconds plus grace.
    async fn add_routes(&self, addresses: Vec<Vec<u8>>, ttl: u32) -> Result<(), GuardError>;
}

pub struct DestinationGuard;

impl DestinationGuard {
    /// Build the firewall, recover, and start the synchronizer.
    ///
    /// Fails without spawning anything if the topology or the recovery read
    /// is rejected; the caller must not serve traffic in that case.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime, as the synchronizer is
    /// spawned with `tokio::spawn`.
    pub fn start<E>(
        config: &FirewallConfiguration,
        mut engine: E,
    ) -> Result<(GuardHandle, JoinHandle<()>), GuardError>
    where
        E: RuleEngine + 'static,
    {
        if config.queue_capacity == 0 {
            return Err(GuardError::Config(
                "queue_capacity must be greater than 0".to_string(),
            ));
        }

        let topology: Topology = topology::build(&mut engine, config)?;

        let mut store = AllowList::new();
        recovery::recover(&mut engine, &topology, &mut store, Instant::now())?;

        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let synchronizer = Synchronizer::new(engine, topology, store);
        let worker = tokio::spawn(synchronizer.run(rx));

        info!(
            "destguard started in {} mode (queue capacity {})",
            config.mode, config.queue_capacity
        );
        Ok((GuardHandle { tx }, worker))
    }
}

/// Cloneable ingestion handle.
#[derive(Debug, Clone)]
pub struct GuardHandle {
    tx: mpsc::Sender<Message>,
}

impl GuardHandle {
    /// Admit the addresses of one DNS answer until `now + ttl + grace`.
    ///
    /// Waits while the queue is full. An empty list does nothing.
    pub async fn observed_answer(&self, addresses: Vec<Vec<u8>>, ttl: u32) -> Result<(), GuardError> {
        if addresses.is_empty() {
            return Ok(());
        }
        let expires_at = expiry_for(Instant::now(), ttl);
        self.send(Message::Batch {
            addresses,
            expires_at,
        })
        .await
    }

    /// Admit records that each carry their own TTL, one batch per distinct TTL.
    pub async fn observe_records(&self, records: Vec<(Vec<u8>, u32)>) -> Result<(), GuardError> {
        let mut by_ttl: BTreeMap<u32, Vec<Vec<u8>>> = BTreeMap::new();
        for (address, ttl) in records {
            by_ttl.entry(ttl).or_default().push(address);
        }
        for (ttl, addresses) in by_ttl {
            self.observed_answer(addresses, ttl).await?;
        }
        Ok(())
    }

    /// Current allow-list, sorted by address.
    pub async fn entries(&self) -> Result<Vec<AllowEntry>, GuardError> {
        let (reply, rx) = oneshot::channel();
        self.send(Message::Snapshot(reply)).await?;
        rx.await.map_err(|_| GuardError::WorkerStopped)
    }

    /// Wait until everything sent before this call has been handled.
    pub async fn sync(&self) -> Result<(), GuardError> {
        let (reply, rx) = oneshot::channel();
        self.send(Message::Barrier(reply)).await?;
        rx.await.map_err(|_| GuardError::WorkerStopped)
    }

    /// Ask the synchronizer to stop after the messages already queued.
    pub async fn shutdown(&self) -> Result<(), GuardError> {
        self.send(Message::Shutdown).await
    }

    async fn send(&self, message: Message) -> Result<(), GuardError> {
        self.tx
            .send(message)
            .await
            .map_err(|_| GuardError::WorkerStopped)
    }
}

#[async_trait]
impl DestinationGuardManager for GuardHandle {
    async fn add_routes(&self, addresses: Vec<Vec<u8>>, ttl: u32) -> Result<(), GuardError> {
        self.observed_answer(addresses, ttl).await
    }
}
