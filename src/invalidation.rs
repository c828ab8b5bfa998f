use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::NaiveDate;
use dashmap::DashMap;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::limits::MAX_INVALIDATORS;

/// Which cached answers a booking mutation may have made stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    All,
    Service(Ulid),
    /// Inclusive date range, optionally narrowed to one service.
    Dates {
        start: NaiveDate,
        end: NaiveDate,
        service_id: Option<Ulid>,
    },
}

impl Scope {
    /// Does this scope touch an answer computed for `first..=last` and
    /// `service`? An answer computed without a service depends on every
    /// service's bookings, so it is always touched by a service match.
    pub fn covers(&self, first: NaiveDate, last: NaiveDate, service: Option<Ulid>) -> bool {
        let service_hit = |scoped: Option<Ulid>| match (scoped, service) {
            (None, _) | (_, None) => true,
            (Some(a), Some(b)) => a == b,
        };
        match *self {
            Scope::All => true,
            Scope::Service(id) => service_hit(Some(id)),
            Scope::Dates {
                start,
                end,
                service_id,
            } => first <= end && start <= last && service_hit(service_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidatorError(pub String);

impl std::fmt::Display for InvalidatorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalidator failed: {}", self.0)
    }
}

impl std::error::Error for InvalidatorError {}

/// A cache-clearing callback. A network-backed broadcaster for multi-process
/// deployments plugs in here without changing any caller of the bus.
pub trait Invalidator: Send + Sync {
    fn invalidate(&self, scope: &Scope) -> Result<(), InvalidatorError>;
}

/// Handle returned by [`InvalidationBus::register`]. Ordered by registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InvalidatorId(u64);

/// Fan-out registry that booking-mutating code calls after every committed write.
pub struct InvalidationBus {
    invalidators: DashMap<InvalidatorId, Arc<dyn Invalidator>>,
    next_id: AtomicU64,
}

impl Default for InvalidationBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InvalidationBus {
    pub fn new() -> Self {
        Self {
            invalidators: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn register(&self, invalidator: Arc<dyn Invalidator>) -> Option<InvalidatorId> {
        if self.invalidators.len() >= MAX_INVALIDATORS {
            warn!("invalidator limit reached, rejecting registration");
            return None;
        }
        let id = InvalidatorId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.invalidators.insert(id, invalidator);
        Some(id)
    }

    pub fn unregister(&self, id: InvalidatorId) -> bool {
        self.invalidators.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.invalidators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.invalidators.is_empty()
    }

    /// No arguments clears everything; a date and/or service narrows it.
    /// Returns how many invalidators failed.
    pub fn invalidate(&self, date: Option<NaiveDate>, service_id: Option<Ulid>) -> usize {
        let scope = match (date, service_id) {
            (None, None) => Scope::All,
            (None, Some(id)) => Scope::Service(id),
            (Some(d), service_id) => Scope::Dates {
                start: d,
                end: d,
                service_id,
            },
        };
        self.publish(&scope)
    }

    pub fn invalidate_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        service_id: Option<Ulid>,
    ) -> usize {
        let (start, end) = if start <= end { (start, end) } else { (end, start) };
        self.publish(&Scope::Dates {
            start,
            end,
            service_id,
        })
    }

    /// Run every invalidator in registration order. A failing invalidator is
    /// logged and skipped; the rest still run.
    pub fn publish(&self, scope: &Scope) -> usize {
        // Snapshot first so an invalidator may (un)register without deadlocking.
        let mut snapshot: Vec<(InvalidatorId, Arc<dyn Invalidator>)> = self
            .invalidators
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        snapshot.sort_by_key(|(id, _)| *id);

        metrics::counter!(crate::observability::INVALIDATIONS_TOTAL).increment(1);
        let mut failed = 0;
        for (id, invalidator) in snapshot {
            if let Err(e) = invalidator.invalidate(scope) {
                failed += 1;
                metrics::counter!(crate::observability::INVALIDATOR_FAILURES_TOTAL).increment(1);
                warn!("invalidator {} failed on {scope:?}: {e}", id.0);
            }
        }
        debug!("invalidated {scope:?}");
        failed
    }
}
