use thiserror::Error;
use tracing::{debug, info};

use crate::storage::{SharedStore, StoreError};

/// Sentinel accepted by release in place of the owner id.
pub const FORCE_RELEASE_SENTINEL: &str = "force-deactivate";

/// Bound on compare-and-swap retries when several instances race on the record.
const MAX_SWAP_ATTEMPTS: usize = 8;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("controller lock is held by {owner}")]
    Conflict { owner: String },
    #[error("controller lock is owned by {owner}")]
    NotOwner { owner: String },
    #[error("controller lock is contended; retry")]
    Contended,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquired {
    Fresh,
    AlreadyOwner,
    TookOver { previous: String },
}

impl Acquired {
    pub fn is_takeover(&self) -> bool {
        matches!(self, Acquired::TookOver { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Releaser {
    Owner(String),
    Force,
}

impl Releaser {
    pub fn from_client_id(client_id: &str) -> Self {
        if client_id == FORCE_RELEASE_SENTINEL {
            Releaser::Force
        } else {
            Releaser::Owner(client_id.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Released {
    Released { previous: String },
    NotHeld,
}

/// Unlocked / Locked(owner) state machine over the shared store. Every transition is a
/// compare-and-swap conditioned on the value that was just observed.
#[derive(Clone)]
pub struct ControllerLock {
    store: SharedStore,
}

impl ControllerLock {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    pub async fn current(&self) -> Result<Option<String>, LockError> {
        Ok(self.store.active_controller().await?)
    }

    pub async fn acquire(&self, owner: &str, force: bool) -> Result<Acquired, LockError> {
        for _ in 0..MAX_SWAP_ATTEMPTS {
            let current = self.store.active_controller().await?;
            match current {
                None => {
                    if self.store.swap_active_controller(None, Some(owner)).await? {
                        info!(controller = %owner, "controller lock acquired");
                        return Ok(Acquired::Fresh);
                    }
                }
                Some(existing) if existing == owner => return Ok(Acquired::AlreadyOwner),
                Some(existing) if !force => return Err(LockError::Conflict { owner: existing }),
                Some(existing) => {
                    if self
                        .store
                        .swap_active_controller(Some(&existing), Some(owner))
                        .await?
                    {
                        info!(controller = %owner, previous = %existing, "controller lock taken over");
                        return Ok(Acquired::TookOver { previous: existing });
                    }
                }
            }
            debug!(controller = %owner, "controller lock swap lost a race; retrying");
        }
        Err(LockError::Contended)
    }

    pub async fn release(&self, releaser: &Releaser) -> Result<Released, LockError> {
        for _ in 0..MAX_SWAP_ATTEMPTS {
            let Some(existing) = self.store.active_controller().await? else {
                return Ok(Released::NotHeld);
            };
            if let Releaser::Owner(id) = releaser {
                if *id != existing {
                    return Err(LockError::NotOwner { owner: existing });
                }
            }
            if self
                .store
                .swap_active_controller(Some(&existing), None)
                .await?
            {
                info!(previous = %existing, forced = matches!(releaser, Releaser::Force), "controller lock released");
                return Ok(Released::Released { previous: existing });
            }
        }
        Err(LockError::Contended)
    }
}
