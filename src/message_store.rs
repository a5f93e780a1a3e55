//! The hosting-runtime facade
//!
//! A [`MessageStore`] wraps one object manager behind an explicit
//! lifecycle. Startup retries against an unavailable persistence location
//! on a fixed tick, and a concurrent [`MessageStore::stop`] interrupts the
//! retry loop without waiting for it: an interrupted start is a normal
//! outcome, not a failure.
//!
//! Once started, the facade exposes the root item stream and convenience
//! put/remove operations that each run in their own committed transaction.
//! Callers needing multi-operation atomicity or two-phase coordination go
//! through [`MessageStore::manager`] and drive transactions themselves.

use mqstore_core::{Error, Result, StoreConfig};
use mqstore_engine::{Item, ItemStream, ObjectManager, Persistable, RecoveredItem, WorkContext};
use mqstore_log::OpenMode;
use mqstore_txn::Transaction;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use tracing::{info, warn};

/// Name of the root item stream every store carries
pub const ROOT_STREAM: &str = "root";

/// Lifecycle state of the message store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Constructed, never started
    Uninitialized,
    /// Start in progress (possibly retrying)
    Starting,
    /// Serving
    Started,
    /// Stop in progress
    Stopping,
    /// Stopped; can be started again
    Stopped,
    /// Startup gave up; requires operator attention
    Failed,
}

impl HealthState {
    /// State name for error reporting
    pub fn name(&self) -> &'static str {
        match self {
            HealthState::Uninitialized => "uninitialized",
            HealthState::Starting => "starting",
            HealthState::Started => "started",
            HealthState::Stopping => "stopping",
            HealthState::Stopped => "stopped",
            HealthState::Failed => "failed",
        }
    }
}

/// How a start attempt ended
#[derive(Debug)]
pub enum StartOutcome {
    /// The store is serving
    Started {
        /// Whether prior durable content was recovered
        warm: bool,
    },
    /// A concurrent stop cancelled the start; the store is stopped
    Interrupted,
    /// Attempts exhausted or a non-retryable failure; the store is failed
    Failed {
        /// The error that ended the last attempt
        error: Error,
    },
}

struct Inner {
    health: HealthState,
    stop_requested: bool,
    manager: Option<Arc<ObjectManager>>,
    root_stream: Option<Arc<ItemStream>>,
    recovered: Vec<RecoveredItem>,
}

/// Message store facade with an explicit lifecycle
pub struct MessageStore {
    config: StoreConfig,
    inner: Mutex<Inner>,
    wakeup: Condvar,
}

impl MessageStore {
    /// Store over `config`, not yet started
    pub fn new(config: StoreConfig) -> Self {
        MessageStore {
            config,
            inner: Mutex::new(Inner {
                health: HealthState::Uninitialized,
                stop_requested: false,
                manager: None,
                root_stream: None,
                recovered: Vec::new(),
            }),
            wakeup: Condvar::new(),
        }
    }

    /// Configuration this store was built with
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Current lifecycle state
    pub fn health_state(&self) -> HealthState {
        self.inner.lock().health
    }

    /// True when the store is serving
    pub fn is_ok(&self) -> bool {
        self.health_state() == HealthState::Started
    }

    /// Start the store, retrying against an unavailable location
    ///
    /// I/O failures are retried up to the configured attempt cap, sleeping
    /// the configured interval between attempts; any other failure ends the
    /// start immediately. A concurrent [`MessageStore::stop`] wakes the
    /// sleep and yields [`StartOutcome::Interrupted`].
    ///
    /// Fails fast with `StoreUnavailable` unless the store is uninitialized
    /// or stopped.
    pub fn start(&self, mode: OpenMode) -> Result<StartOutcome> {
        {
            let mut inner = self.inner.lock();
            match inner.health {
                HealthState::Uninitialized | HealthState::Stopped => {}
                state => {
                    return Err(Error::StoreUnavailable {
                        state: state.name(),
                    })
                }
            }
            inner.health = HealthState::Starting;
            inner.stop_requested = false;
        }

        let max_attempts = self.config.startup_retry_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.try_open(mode) {
                Ok((manager, stream, recovered, warm)) => {
                    let mut inner = self.inner.lock();
                    if inner.stop_requested {
                        // Stop raced the final attempt; tear back down
                        inner.health = HealthState::Stopped;
                        drop(inner);
                        manager.shutdown()?;
                        return Ok(StartOutcome::Interrupted);
                    }
                    inner.manager = Some(manager);
                    inner.root_stream = Some(stream);
                    inner.recovered = recovered;
                    inner.health = HealthState::Started;
                    info!(warm, attempt, "message store started");
                    return Ok(StartOutcome::Started { warm });
                }
                Err(error) => {
                    if let Some(outcome) = self.after_failed_attempt(error, attempt, max_attempts)
                    {
                        return Ok(outcome);
                    }
                }
            }
        }
    }

    /// Outcome of one failed open attempt, `None` to retry
    ///
    /// A stop requested at any point during the attempt wins over both the
    /// retry and the failure outcome: an explicitly stopped store ends
    /// `Stopped`, never `Failed`.
    fn after_failed_attempt(
        &self,
        error: Error,
        attempt: u32,
        max_attempts: u32,
    ) -> Option<StartOutcome> {
        let retryable = matches!(error, Error::Io(_));
        let mut inner = self.inner.lock();
        if inner.stop_requested {
            inner.health = HealthState::Stopped;
            info!(attempt, "message store start interrupted");
            return Some(StartOutcome::Interrupted);
        }
        if !retryable || attempt >= max_attempts {
            warn!(%error, attempt, "message store start failed");
            inner.health = HealthState::Failed;
            return Some(StartOutcome::Failed { error });
        }
        warn!(%error, attempt, "start attempt failed, retrying");
        let _ = self
            .wakeup
            .wait_for(&mut inner, self.config.startup_retry_interval);
        if inner.stop_requested {
            inner.health = HealthState::Stopped;
            info!(attempt, "message store start interrupted");
            return Some(StartOutcome::Interrupted);
        }
        None
    }

    fn try_open(
        &self,
        mode: OpenMode,
    ) -> Result<(Arc<ObjectManager>, Arc<ItemStream>, Vec<RecoveredItem>, bool)> {
        let (manager, warm) = ObjectManager::open(self.config.clone(), mode)?;
        let manager = Arc::new(manager);
        let (stream, _) = ItemStream::find_or_create(ROOT_STREAM, &manager)?;
        let recovered = stream.reload(&manager)?;
        Ok((manager, stream, recovered, warm))
    }

    /// Stop the store
    ///
    /// Against a start in progress this only requests the interruption and
    /// returns; the starting thread completes the transition. Against a
    /// started store it shuts the object manager down. Idempotent in every
    /// other state.
    pub fn stop(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.health {
            HealthState::Starting => {
                inner.stop_requested = true;
                self.wakeup.notify_all();
                Ok(())
            }
            HealthState::Started => {
                inner.health = HealthState::Stopping;
                let manager = inner.manager.take();
                inner.root_stream = None;
                inner.recovered.clear();
                drop(inner);

                let result = match manager {
                    Some(manager) => manager.shutdown(),
                    None => Ok(()),
                };
                self.inner.lock().health = HealthState::Stopped;
                info!("message store stopped");
                result
            }
            _ => Ok(()),
        }
    }

    /// The running object manager
    pub fn manager(&self) -> Result<Arc<ObjectManager>> {
        let inner = self.inner.lock();
        match (&inner.manager, inner.health) {
            (Some(manager), HealthState::Started) => Ok(Arc::clone(manager)),
            (_, state) => Err(Error::StoreUnavailable {
                state: state.name(),
            }),
        }
    }

    /// The root item stream
    pub fn root_item_stream(&self) -> Result<Arc<ItemStream>> {
        let inner = self.inner.lock();
        match (&inner.root_stream, inner.health) {
            (Some(stream), HealthState::Started) => Ok(Arc::clone(stream)),
            (_, state) => Err(Error::StoreUnavailable {
                state: state.name(),
            }),
        }
    }

    /// Items recovered into the root stream at the last start
    ///
    /// Drains: each call hands ownership of whatever is still unclaimed.
    pub fn take_recovered_items(&self) -> Vec<RecoveredItem> {
        std::mem::take(&mut self.inner.lock().recovered)
    }

    /// Begin a transaction for caller-driven work
    pub fn begin_transaction(&self) -> Result<Transaction> {
        Ok(self.manager()?.begin_transaction())
    }

    /// Begin a transaction for a unit of work carrying `contexts`
    pub fn begin_transaction_for(&self, contexts: &[WorkContext]) -> Result<Transaction> {
        self.manager()?.begin_transaction_for(contexts)
    }

    /// Commit a caller-driven transaction
    pub fn commit(&self, txn: &mut Transaction) -> Result<()> {
        self.manager()?.commit(txn)
    }

    /// Roll a caller-driven transaction back
    pub fn backout(&self, txn: &mut Transaction) -> Result<()> {
        self.manager()?.backout(txn)
    }

    /// Snapshot the stores and mark the log
    pub fn checkpoint(&self) -> Result<()> {
        self.manager()?.checkpoint()
    }

    /// Put one item to the root stream in its own committed transaction
    ///
    /// Returns the persistable driving the item's durable lifecycle, or
    /// `None` for a memory-only item. The item is a live stream member only
    /// after the commit succeeded.
    pub fn put(&self, item: &Arc<Item>) -> Result<Option<Persistable>> {
        let manager = self.manager()?;
        let stream = self.root_item_stream()?;

        let mut txn = manager.begin_transaction();
        let persistable = stream.put(item, &mut txn, &manager)?;
        manager.commit(&mut txn)?;
        stream.attach(Arc::clone(item));
        Ok(persistable)
    }

    /// Remove one item from the root stream in its own committed transaction
    ///
    /// `persistable` is `None` for memory-only items.
    pub fn remove(&self, item: &Arc<Item>, persistable: Option<&mut Persistable>) -> Result<()> {
        let manager = self.manager()?;
        let stream = self.root_item_stream()?;

        let mut txn = manager.begin_transaction();
        if let Some(persistable) = persistable {
            stream.remove(persistable, &mut txn)?;
        }
        manager.commit(&mut txn)?;
        stream.detach(item);
        Ok(())
    }
}
