//! Global admission control for in-flight send attempts.

use std::{sync::Arc, time::Duration};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Default number of attempts allowed in flight across all accounts.
pub const DEFAULT_ADMISSION_CAPACITY: usize = 2000;

/// What a dispatch loop does when the gate is saturated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionPolicy {
    /// Give up on this tick, back off briefly and try again.
    #[default]
    Skip,
    /// Wait for a slot, up to the admission timeout.
    Wait,
}

/// Counting permit pool shared by every dispatch loop.
///
/// A permit is held for the whole lifetime of one send attempt, so the number
/// of attempts in flight never exceeds the capacity.
#[derive(Debug)]
pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    policy: AdmissionPolicy,
    saturation_backoff: Duration,
    admission_timeout: Duration,
}

impl AdmissionGate {
    /// Creates a gate with `capacity` slots using the [`Skip`](AdmissionPolicy::Skip) policy.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            policy: AdmissionPolicy::default(),
            saturation_backoff: Duration::from_millis(10),
            admission_timeout: Duration::from_secs(1),
        }
    }

    /// Sets the saturation policy.
    pub const fn with_policy(mut self, policy: AdmissionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sets how long a [`Skip`](AdmissionPolicy::Skip) caller sleeps after a refused tick.
    pub const fn with_saturation_backoff(mut self, backoff: Duration) -> Self {
        self.saturation_backoff = backoff;
        self
    }

    /// Sets how long a [`Wait`](AdmissionPolicy::Wait) caller waits for a slot.
    pub const fn with_admission_timeout(mut self, timeout: Duration) -> Self {
        self.admission_timeout = timeout;
        self
    }

    /// Returns the total number of slots.
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the saturation policy.
    pub const fn policy(&self) -> AdmissionPolicy {
        self.policy
    }

    /// Returns the number of attempts currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }

    /// Tries to obtain a slot according to the gate's policy.
    ///
    /// Returns `None` when no slot was obtained: the gate was saturated, the wait
    /// timed out, or `shutdown` fired. The caller simply loops and tries again.
    pub async fn acquire(&self, shutdown: &CancellationToken) -> Option<OwnedSemaphorePermit> {
        match self.policy {
            AdmissionPolicy::Skip => match Arc::clone(&self.semaphore).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(TryAcquireError::NoPermits) => {
                    trace!("admission gate saturated, skipping tick");
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        _ = tokio::time::sleep(self.saturation_backoff) => {}
                    }
                    None
                }
                Err(TryAcquireError::Closed) => None,
            },
            AdmissionPolicy::Wait => {
                let acquire = tokio::time::timeout(
                    self.admission_timeout,
                    Arc::clone(&self.semaphore).acquire_owned(),
                );
                tokio::select! {
                    _ = shutdown.cancelled() => None,
                    result = acquire => match result {
                        Ok(Ok(permit)) => Some(permit),
                        Ok(Err(_closed)) => None,
                        Err(_elapsed) => {
                            trace!("timed out waiting for admission");
                            None
                        }
                    },
                }
            }
        }
    }

    /// Waits until every outstanding slot has been released.
    pub async fn drain(&self) {
        let all = u32::try_from(self.capacity).unwrap_or(u32::MAX);
        // Holding every permit at once proves nothing else is in flight.
        let _ = self.semaphore.acquire_many(all).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_skip_policy_refuses_when_saturated() {
        let gate = AdmissionGate::new(1).with_saturation_backoff(Duration::from_millis(1));
        let shutdown = CancellationToken::new();

        let held = gate.acquire(&shutdown).await.unwrap();
        assert_eq!(gate.in_flight(), 1);
        assert!(gate.acquire(&shutdown).await.is_none());

        drop(held);
        assert!(gate.acquire(&shutdown).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_policy_waits_for_release() {
        let gate = Arc::new(AdmissionGate::new(1).with_policy(AdmissionPolicy::Wait));
        let shutdown = CancellationToken::new();

        let held = gate.acquire(&shutdown).await.unwrap();
        let waiter = {
            let gate = Arc::clone(&gate);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { gate.acquire(&shutdown).await.is_some() })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(held);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_policy_times_out() {
        let gate = AdmissionGate::new(1)
            .with_policy(AdmissionPolicy::Wait)
            .with_admission_timeout(Duration::from_millis(50));
        let shutdown = CancellationToken::new();

        let _held = gate.acquire(&shutdown).await.unwrap();
        assert!(gate.acquire(&shutdown).await.is_none());
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_wait() {
        let gate = AdmissionGate::new(1)
            .with_policy(AdmissionPolicy::Wait)
            .with_admission_timeout(Duration::from_secs(3600));
        let shutdown = CancellationToken::new();

        let _held = gate.acquire(&shutdown).await.unwrap();
        shutdown.cancel();
        assert!(gate.acquire(&shutdown).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_waits_for_outstanding_permits() {
        let gate = Arc::new(AdmissionGate::new(4));
        let shutdown = CancellationToken::new();
        let permit = gate.acquire(&shutdown).await.unwrap();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            drop(permit);
        });

        let start = tokio::time::Instant::now();
        gate.drain().await;
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert_eq!(gate.in_flight(), 0);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        assert_eq!(AdmissionGate::new(0).capacity(), 1);
    }
}
