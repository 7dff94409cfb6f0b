use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use anyhow::anyhow;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::reliability::transfer_state::{TransferMeta, TransferState};

pub type SharedTransferState = Arc<Mutex<TransferState>>;

/// The registry of all transfers that are currently tracked by this process.
///
/// Locking is per transfer: the map itself is only locked for looking up or creating a
///  transfer's entry, and each entry has its own lock. So chunks of unrelated transfers never
///  wait for each other while their state is updated.
///
/// NB: Callers must not hold a transfer's lock while calling into the registry - eviction locks
///      the map first and then each transfer in turn.
#[derive(Default)]
pub struct TransferRegistry {
    transfers: RwLock<FxHashMap<String, SharedTransferState>>,
}

impl TransferRegistry {
    pub fn new() -> TransferRegistry {
        Default::default()
    }

    pub fn get(&self, transfer_id: &str) -> anyhow::Result<Option<SharedTransferState>> {
        let transfers = self.transfers.read()
            .map_err(|_| anyhow!("transfer registry lock is poisoned"))?;
        Ok(transfers.get(transfer_id).cloned())
    }

    /// Returns the transfer's state, creating it with the given meta data if it does not exist
    ///  yet. For an existing transfer, `meta` is ignored.
    pub fn get_or_create(&self, transfer_id: &str, meta: TransferMeta) -> anyhow::Result<SharedTransferState> {
        // trying with a read lock first is an optimization for the common case
        if let Some(state) = self.get(transfer_id)? {
            return Ok(state);
        }

        let mut transfers = self.transfers.write()
            .map_err(|_| anyhow!("transfer registry lock is poisoned"))?;

        // we need to check again now that we have the exclusive lock to avoid racy initialization
        if let Some(state) = transfers.get(transfer_id) {
            return Ok(state.clone());
        }

        debug!("registering new transfer {:?}: {:?}", transfer_id, meta);
        let state = Arc::new(Mutex::new(TransferState::new(meta, Instant::now())));
        transfers.insert(transfer_id.to_string(), state.clone());
        Ok(state)
    }

    /// a copy of a transfer's current state
    pub fn snapshot(&self, transfer_id: &str) -> anyhow::Result<Option<TransferState>> {
        match self.get(transfer_id)? {
            None => Ok(None),
            Some(state) => {
                let state = state.lock()
                    .map_err(|_| anyhow!("state of transfer {:?} is poisoned", transfer_id))?;
                Ok(Some(state.clone()))
            }
        }
    }

    pub fn len(&self) -> usize {
        self.transfers.read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes all transfers that were not touched for longer than `ttl`, returning the number of
    ///  removed transfers. An evicted transfer is regarded as abandoned: a resume request for it
    ///  is answered as for an unknown transfer, and a subsequent chunk starts it from scratch.
    pub fn evict_idle(&self, ttl: Duration, now: Instant) -> anyhow::Result<usize> {
        let mut transfers = self.transfers.write()
            .map_err(|_| anyhow!("transfer registry lock is poisoned"))?;

        let num_before = transfers.len();
        transfers.retain(|transfer_id, state| {
            match state.lock() {
                Ok(state) => {
                    let idle = now.saturating_duration_since(state.last_touched());
                    if idle > ttl {
                        debug!("transfer {:?} was idle for {:?} - evicting", transfer_id, idle);
                        false
                    }
                    else {
                        true
                    }
                }
                Err(_) => {
                    warn!("state of transfer {:?} is poisoned - evicting", transfer_id);
                    false
                }
            }
        });
        Ok(num_before - transfers.len())
    }
}
