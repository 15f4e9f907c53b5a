//! Per-class concurrency ceilings for external process calls.
//!
//! Each work class owns an independent [`Semaphore`], so a burst in one
//! class cannot starve another. Tokio semaphores queue waiters in FIFO
//! order and wake each exactly once; nothing here polls.
//!
//! A slot is held by a [`GatePermit`] and released when the permit drops,
//! which gives exactly one release per acquire on every path.
//!
//! [`ScopeLocks`] orders calls within one scope: a FIFO mutex per scope,
//! held from `begin` until the terminal ledger write.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::GateConfig;
use crate::{AppError, Result};

#[derive(Debug)]
struct ClassSlots {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

/// Bounded, fair admission per work class.
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    classes: Arc<HashMap<String, ClassSlots>>,
}

impl ConcurrencyGate {
    /// Build a gate from `(class, ceiling)` pairs.
    #[must_use]
    pub fn new<I, S>(classes: I) -> Self
    where
        I: IntoIterator<Item = (S, usize)>,
        S: Into<String>,
    {
        let classes = classes
            .into_iter()
            .map(|(name, limit)| {
                (
                    name.into(),
                    ClassSlots {
                        semaphore: Arc::new(Semaphore::new(limit)),
                        limit,
                    },
                )
            })
            .collect();
        Self {
            classes: Arc::new(classes),
        }
    }

    /// Build a gate from configuration.
    #[must_use]
    pub fn from_config(config: &GateConfig) -> Self {
        Self::new(config.classes.iter().map(|(name, limit)| (name.clone(), *limit)))
    }

    /// Wait for a slot in `class`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Gate` if the class is not configured.
    pub async fn acquire(&self, class: &str) -> Result<GatePermit> {
        let slots = self.slots(class)?;
        let permit = Arc::clone(&slots.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| AppError::Gate(format!("gate for class {class} is closed")))?;
        debug!(
            class,
            in_use = slots.limit - slots.semaphore.available_permits(),
            "gate slot acquired"
        );
        Ok(GatePermit {
            class: class.to_owned(),
            _permit: permit,
        })
    }

    /// Wait for a slot in `class`, giving up when `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Gate` for an unknown class and
    /// `AppError::Cancelled` if cancelled while queued.
    pub async fn acquire_cancellable(
        &self,
        class: &str,
        cancel: &CancellationToken,
    ) -> Result<GatePermit> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(AppError::Cancelled(format!(
                "cancelled while waiting for a {class} slot"
            ))),
            permit = self.acquire(class) => permit,
        }
    }

    /// Slots currently held in `class`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Gate` if the class is not configured.
    pub fn in_use(&self, class: &str) -> Result<usize> {
        let slots = self.slots(class)?;
        Ok(slots.limit - slots.semaphore.available_permits())
    }

    /// Slots currently free in `class`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Gate` if the class is not configured.
    pub fn available(&self, class: &str) -> Result<usize> {
        Ok(self.slots(class)?.semaphore.available_permits())
    }

    fn slots(&self, class: &str) -> Result<&ClassSlots> {
        self.classes
            .get(class)
            .ok_or_else(|| AppError::Gate(format!("unknown work class: {class}")))
    }
}

/// A held gate slot; dropping it releases the slot.
#[derive(Debug)]
pub struct GatePermit {
    class: String,
    _permit: OwnedSemaphorePermit,
}

impl GatePermit {
    /// Work class this slot belongs to.
    #[must_use]
    pub fn class(&self) -> &str {
        &self.class
    }

    /// Release the slot now.
    pub fn release(self) {
        debug!(class = self.class, "gate slot released");
    }
}

// ── Per-scope ordering ──────────────────────────────────────────────────────

type ScopeMap = HashMap<String, Arc<AsyncMutex<()>>>;

/// One FIFO lock per scope, created on first use and dropped with its
/// last holder.
#[derive(Debug, Clone, Default)]
pub struct ScopeLocks {
    scopes: Arc<Mutex<ScopeMap>>,
}

impl ScopeLocks {
    /// An empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no other caller holds `scope`, giving up when `cancel`
    /// fires.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Cancelled` if cancelled while queued.
    pub async fn lock(&self, scope: &str, cancel: &CancellationToken) -> Result<ScopeGuard> {
        let lock = {
            let mut scopes = self.scopes.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(scopes.entry(scope.to_owned()).or_default())
        };

        let guard = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return Err(AppError::Cancelled(format!(
                    "cancelled while waiting for scope {scope}"
                )));
            }
            guard = lock.lock_owned() => guard,
        };
        debug!(scope, "scope lock acquired");

        Ok(ScopeGuard {
            scope: scope.to_owned(),
            scopes: Arc::clone(&self.scopes),
            guard: Some(guard),
        })
    }

    /// Whether any caller holds or waits for `scope`.
    #[must_use]
    pub fn is_busy(&self, scope: &str) -> bool {
        self.scopes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(scope)
    }
}

/// A held scope lock; dropping it admits the next waiter.
#[derive(Debug)]
pub struct ScopeGuard {
    scope: String,
    scopes: Arc<Mutex<ScopeMap>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        let mut scopes = self.scopes.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(guard) = self.guard.take() {
            // Table entry plus this guard: nobody else is waiting.
            if Arc::strong_count(OwnedMutexGuard::mutex(&guard)) == 2 {
                scopes.remove(&self.scope);
            }
        }
    }
}
