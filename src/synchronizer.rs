//! Single owner of the allow-list and the rule-engine handle.
//!
//! Producers talk to the synchronizer only through its bounded queue. Batch
//! handling and the eviction tick run on the same task, so neither needs a
//! lock and they can never interleave.
//!
//! Every event ends in at most one commit: at most one element add (or
//! delete) per family, applied atomically. When a commit fails the store
//! stays authoritative and the kernel catches up on a later event:
//!
//! - additions are kept per family and merged into the next commit;
//! - deletions are retried on every tick until they land. After a failed
//!   delete commit both allow-sets are read back, and deletions whose element
//!   is already gone from the kernel are dropped so they cannot block the rest.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::GuardError;
use crate::netfilter::{AddressFamily, PerFamily, RuleEngine, SetElement, Transaction};
use crate::store::{AllowEntry, AllowList, Inserted};
use crate::topology::Topology;

/// Added to every answer's TTL before the address expires.
pub const TTL_GRACE: Duration = Duration::from_secs(30);

/// Period of the eviction tick.
pub const EVICTION_INTERVAL: Duration = Duration::from_secs(30);

/// Failed attempts after which a deletion still present in the kernel is
/// reported at WARN. It keeps being retried.
pub const MAX_DELETE_ATTEMPTS: u32 = 3;

/// Expiry of an address observed at `now` with the given TTL.
pub fn expiry_for(now: Instant, ttl: u32) -> Instant {
    now + Duration::from_secs(u64::from(ttl)) + TTL_GRACE
}

/// Messages accepted by the synchronizer task.
#[derive(Debug)]
pub enum Message {
    /// Addresses from one DNS answer, sharing one expiry.
    Batch {
        addresses: Vec<Vec<u8>>,
        expires_at: Instant,
    },
    /// Reply with the current store contents.
    Snapshot(oneshot::Sender<Vec<AllowEntry>>),
    /// Reply once every earlier message has been handled.
    Barrier(oneshot::Sender<()>),
    Shutdown,
}

/// What one batch did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub added: usize,
    pub extended: usize,
    pub malformed: usize,
    pub committed: bool,
}

/// What one eviction tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub evicted: usize,
    pub deleted: usize,
    /// Pending deletions found already missing from the kernel.
    pub vanished: usize,
    pub committed: bool,
}

#[derive(Debug)]
struct PendingDelete {
    address: Vec<u8>,
    attempts: u32,
}

pub struct Synchronizer<E: RuleEngine> {
    engine: E,
    topology: Topology,
    store: AllowList,
    /// Additions whose commit has not landed yet, keyed like the store.
    pending_adds: PerFamily<BTreeMap<String, Vec<u8>>>,
    /// Evicted addresses still present in the kernel set.
    pending_deletes: PerFamily<HashMap<String, PendingDelete>>,
}

impl<E: RuleEngine> Synchronizer<E> {
    pub fn new(engine: E, topology: Topology, store: AllowList) -> Self {
        Self {
            engine,
            topology,
            store,
            pending_adds: PerFamily::default(),
            pending_deletes: PerFamily::default(),
        }
    }

    pub fn store(&self) -> &AllowList {
        &self.store
    }

    pub fn pending_adds(&self) -> usize {
        self.pending_adds.v4.len() + self.pending_adds.v6.len()
    }

    pub fn pending_deletes(&self) -> usize {
        self.pending_deletes.v4.len() + self.pending_deletes.v6.len()
    }

    /// Track every address of one answer and push new ones to the kernel.
    pub fn apply_batch(&mut self, addresses: &[Vec<u8>], expires_at: Instant) -> BatchReport {
        let mut report = BatchReport::default();

        for address in addresses {
            match self.store.insert(address, expires_at) {
                Ok(Inserted::New(family)) => {
                    report.added += 1;
                    let Ok(key) = AllowList::key_of(address) else {
                        continue;
                    };
                    // Still in the kernel; forgetting the delete is enough
                    if self.pending_deletes.get_mut(family).remove(&key).is_some() {
                        continue;
                    }
                    self.pending_adds.get_mut(family).insert(key, address.clone());
                }
                Ok(Inserted::Extended) => report.extended += 1,
                Err(e) => {
                    report.malformed += 1;
                    error!("Dropping observed address: {}", e);
                }
            }
        }

        if self.pending_adds() > 0 {
            let mut tx = Transaction::new(&self.topology.table);
            self.queue_adds(&mut tx);
            report.committed = self.flush(&tx, "batch");
            if report.committed {
                self.pending_adds = PerFamily::default();
            }
        }

        debug!(
            "Batch: {} added, {} extended, {} malformed, {} tracked",
            report.added,
            report.extended,
            report.malformed,
            self.store.len()
        );
        report
    }

    /// Drop every entry that expired strictly before `now`.
    pub fn evict_expired(&mut self, now: Instant) -> TickReport {
        let mut report = TickReport::default();

        for (key, route) in self.store.take_expired(now) {
            report.evicted += 1;
            if let Some(family) = route.family() {
                // Never reached the kernel, so there is nothing to delete
                if self.pending_adds.get_mut(family).remove(&key).is_none() {
                    self.pending_deletes.get_mut(family).insert(
                        key,
                        PendingDelete {
                            address: route.address.clone(),
                            attempts: 0,
                        },
                    );
                }
            }
            self.store.recycle(route);
        }

        let mut tx = Transaction::new(&self.topology.table);
        self.queue_adds(&mut tx);
        for family in AddressFamily::ALL {
            let elements: Vec<SetElement> = self
                .pending_deletes
                .get(family)
                .values()
                .map(|p| SetElement::new(p.address.clone()))
                .collect();
            report.deleted += elements.len();
            tx.delete_elements(self.topology.allow_set(family), elements);
        }

        if !tx.is_empty() {
            report.committed = self.flush(&tx, "eviction");
            if report.committed {
                self.pending_adds = PerFamily::default();
                self.pending_deletes = PerFamily::default();
            } else {
                report.deleted = 0;
                report.vanished = self.reconcile_pending_deletes();
            }
        }

        debug!(
            "Eviction tick: {} expired, {} deleted, {} tracked",
            report.evicted,
            report.deleted,
            self.store.len()
        );
        report
    }

    /// Run until shutdown or until every sender is gone.
    pub async fn run(mut self, mut rx: mpsc::Receiver<Message>) {
        let mut tick = interval_at(Instant::now() + EVICTION_INTERVAL, EVICTION_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                message = rx.recv() => match message {
                    Some(Message::Batch { addresses, expires_at }) => {
                        self.apply_batch(&addresses, expires_at);
                    }
                    Some(Message::Snapshot(reply)) => {
                        let _ = reply.send(self.store.entries());
                    }
                    Some(Message::Barrier(reply)) => {
                        let _ = reply.send(());
                    }
                    Some(Message::Shutdown) | None => break,
                },
                _ = tick.tick() => {
                    self.evict_expired(Instant::now());
                }
            }
        }

        info!(
            "Allow-list synchronizer stopped with {} tracked entries",
            self.store.len()
        );
    }

    fn queue_adds(&self, tx: &mut Transaction) {
        for family in AddressFamily::ALL {
            let elements: Vec<SetElement> = self
                .pending_adds
                .get(family)
                .values()
                .map(|address| SetElement::new(address.clone()))
                .collect();
            tx.add_elements(self.topology.allow_set(family), elements);
        }
    }

    fn flush(&mut self, tx: &Transaction, event: &str) -> bool {
        match self.engine.commit(tx) {
            Ok(()) => true,
            Err(e) => {
                let err = GuardError::KernelSyncFailed(format!("{:#}", e));
                error!("{} after {} ({} commands)", err, event, tx.len());
                false
            }
        }
    }

    /// Re-check every pending delete against the kernel after a failed commit.
    ///
    /// Deletions whose element is no longer in the allow-set are dropped, as
    /// one missing element fails the whole delete. The rest stay queued with
    /// one more failed attempt. When a set cannot be read, all of its pending
    /// deletes stay queued.
    ///
    /// # Returns
    ///
    /// The number of deletions dropped because the element was already gone.
    fn reconcile_pending_deletes(&mut self) -> usize {
        let mut vanished = 0;
        for family in AddressFamily::ALL {
            if self.pending_deletes.get(family).is_empty() {
                continue;
            }

            let set = self.topology.allow_set(family);
            let present: Option<HashSet<Vec<u8>>> =
                match self.engine.set_elements(&self.topology.table, set) {
                    Ok(elements) => Some(elements.into_iter().map(|e| e.key).collect()),
                    Err(e) => {
                        warn!("Cannot read {} back after a failed delete: {:#}", set, e);
                        None
                    }
                };

            self.pending_deletes.get_mut(family).retain(|key, pending| {
                if let Some(present) = &present {
                    if !present.contains(&pending.address) {
                        debug!("{} already gone from {}", key, set);
                        vanished += 1;
                        return false;
                    }
                }
                pending.attempts += 1;
                if pending.attempts == MAX_DELETE_ATTEMPTS {
                    warn!(
                        "{} still admitted by the kernel after {} failed deletes",
                        key, pending.attempts
                    );
                }
                true
            });
        }
        vanished
    }
}
