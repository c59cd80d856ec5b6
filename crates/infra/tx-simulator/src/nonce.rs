//! Per-account nonce allocation.

use std::{sync::Arc, time::Duration};

use alloy_primitives::Address;
use tokio::{sync::Mutex, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{LedgerClient, LedgerError};

const INCLUSION_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Default)]
struct NonceState {
    next: u64,
    initialized: bool,
}

/// Hands out strictly increasing nonces for one account.
///
/// Every allocation queries the node's pending nonce inside the critical section.
/// The remote value wins when it is ahead of the local counter (transactions sent
/// by someone else, or a restart); otherwise the local counter wins, which covers
/// the window where a submitted transaction is not yet visible in the node's pool.
///
/// One allocator exists per account and is shared via `Arc` by every consumer that
/// sends from that account.
#[derive(Debug)]
pub struct NonceAllocator<C> {
    client: Arc<C>,
    address: Address,
    state: Mutex<NonceState>,
}

impl<C: LedgerClient> NonceAllocator<C> {
    /// Creates an uninitialized allocator for `address`.
    pub fn new(client: Arc<C>, address: Address) -> Self {
        Self { client, address, state: Mutex::new(NonceState::default()) }
    }

    /// Returns the account this allocator serves.
    pub const fn address(&self) -> Address {
        self.address
    }

    /// Returns the next nonce to use.
    ///
    /// Fails if the pending nonce query fails. No retry happens here; the caller
    /// decides whether to abort or try again.
    pub async fn allocate(&self) -> Result<u64, LedgerError> {
        let mut state = self.state.lock().await;

        let remote = self.client.pending_nonce(self.address).await?;
        if !state.initialized || remote > state.next {
            state.next = remote;
            state.initialized = true;
        }

        let nonce = state.next;
        state.next += 1;
        Ok(nonce)
    }

    /// Resynchronizes the local counter to the node's pending nonce.
    ///
    /// Call before handing the allocator to several concurrent consumers.
    pub async fn reset(&self) -> Result<u64, LedgerError> {
        let mut state = self.state.lock().await;

        let remote = self.client.pending_nonce(self.address).await?;
        state.next = remote;
        state.initialized = true;

        debug!(address = %self.address, nonce = remote, "nonce allocator reset");
        Ok(remote)
    }

    /// Waits until the node's pending nonce moves past `expected`.
    ///
    /// Returns `true` once the node reports the transaction, `false` on timeout or
    /// cancellation. Query errors are ignored and polled again.
    pub async fn wait_for_inclusion(
        &self,
        expected: u64,
        max_wait: Duration,
        shutdown: &CancellationToken,
    ) -> bool {
        let deadline = Instant::now() + max_wait;
        let mut ticker = tokio::time::interval(INCLUSION_POLL_INTERVAL);

        while Instant::now() < deadline {
            tokio::select! {
                _ = shutdown.cancelled() => return false,
                _ = ticker.tick() => {}
            }

            let Ok(remote) = self.client.pending_nonce(self.address).await else {
                continue;
            };

            if remote > expected {
                let mut state = self.state.lock().await;
                if remote > state.next {
                    state.next = remote;
                }
                state.initialized = true;
                return true;
            }
        }

        false
    }
}
