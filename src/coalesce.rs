use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallerPhase {
    Idle,
    /// Waiting out the debounce window.
    Pending,
    /// Computing; cancellable through the caller's token.
    InFlight,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    Delivered(T),
    /// A newer request from the same caller replaced this one.
    Superseded,
}

impl<T> Outcome<T> {
    pub fn delivered(self) -> Option<T> {
        match self {
            Outcome::Delivered(v) => Some(v),
            Outcome::Superseded => None,
        }
    }
}

struct CallerSlot {
    generation: u64,
    token: CancellationToken,
    phase: CallerPhase,
}

/// Drops the caller's slot when its request finishes or is abandoned, unless
/// a newer request already owns it.
struct SlotGuard<'a, K: Eq + Hash> {
    callers: &'a DashMap<K, CallerSlot>,
    caller: K,
    generation: u64,
}

impl<K: Eq + Hash> Drop for SlotGuard<'_, K> {
    fn drop(&mut self) {
        self.callers
            .remove_if(&self.caller, |_, slot| slot.generation == self.generation);
    }
}

/// Per-caller debounce and supersession for bursty availability queries.
///
/// Each caller moves through `Idle → Pending → InFlight → Idle`. A new
/// request from the same caller cancels whatever the previous one was doing
/// (waiting out the debounce or computing) and takes its place, so only the
/// latest request of a burst is ever delivered.
pub struct Coalescer<K> {
    debounce: Duration,
    callers: DashMap<K, CallerSlot>,
    next_generation: AtomicU64,
}

impl<K: Eq + Hash + Clone> Default for Coalescer<K> {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE)
    }
}

impl<K: Eq + Hash + Clone> Coalescer<K> {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            callers: DashMap::new(),
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    pub fn phase(&self, caller: &K) -> CallerPhase {
        self.callers
            .get(caller)
            .map_or(CallerPhase::Idle, |slot| slot.phase)
    }

    /// Callers with a pending or in-flight request.
    pub fn active(&self) -> usize {
        self.callers.len()
    }

    /// Abandon whatever `caller` has outstanding.
    pub fn cancel(&self, caller: &K) -> bool {
        match self.callers.remove(caller) {
            Some((_, slot)) => {
                slot.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Run `work` for `caller` after the debounce window, unless a newer
    /// request from the same caller arrives first.
    ///
    /// `work` receives the request's token so it can stop early; once the
    /// token fires its result is discarded. Cancellation is never an error:
    /// a replaced request resolves to `Ok(Outcome::Superseded)`.
    pub async fn request<T, E, F, Fut>(&self, caller: K, work: F) -> Result<Outcome<T>, E>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let previous = self.callers.insert(
            caller.clone(),
            CallerSlot {
                generation,
                token: token.clone(),
                phase: CallerPhase::Pending,
            },
        );
        if let Some(previous) = previous {
            previous.token.cancel();
        }
        let _guard = SlotGuard {
            callers: &self.callers,
            caller: caller.clone(),
            generation,
        };

        tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(self.superseded(generation)),
            _ = tokio::time::sleep(self.debounce) => {}
        }

        if let Some(mut slot) = self.callers.get_mut(&caller)
            && slot.generation == generation
        {
            slot.phase = CallerPhase::InFlight;
        }

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            result = work(token.clone()) => Some(result),
        };
        match result {
            Some(result) if !token.is_cancelled() => result.map(Outcome::Delivered),
            _ => Ok(self.superseded(generation)),
        }
    }

    fn superseded<T>(&self, generation: u64) -> Outcome<T> {
        metrics::counter!(crate::observability::QUERIES_SUPERSEDED_TOTAL).increment(1);
        debug!("request {generation} superseded");
        Outcome::Superseded
    }
}
