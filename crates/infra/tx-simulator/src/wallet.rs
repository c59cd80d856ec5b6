//! Sender accounts and recipient generation.

use std::sync::Arc;

use alloy_primitives::Address;
use alloy_signer_local::PrivateKeySigner;
use eyre::{Result, WrapErr};
use rand::Rng;

use crate::{LedgerClient, NonceAllocator};

/// An account this process can send from: its key and its nonce allocator.
#[derive(Debug)]
pub struct Wallet<C> {
    key: PrivateKeySigner,
    address: Address,
    nonces: Arc<NonceAllocator<C>>,
}

impl<C: LedgerClient> Wallet<C> {
    /// Wraps `key` with a fresh nonce allocator.
    pub fn new(key: PrivateKeySigner, client: Arc<C>) -> Self {
        let address = key.address();
        let nonces = Arc::new(NonceAllocator::new(client, address));
        Self { key, address, nonces }
    }

    /// Parses a hex private key, with or without `0x` prefix.
    pub fn from_private_key(private_key: &str, client: Arc<C>) -> Result<Self> {
        let key: PrivateKeySigner =
            private_key.trim().parse().wrap_err("Failed to parse private key")?;
        Ok(Self::new(key, client))
    }

    /// Generates a wallet with a random key.
    pub fn random(client: Arc<C>) -> Self {
        Self::new(PrivateKeySigner::random(), client)
    }

    /// Returns the account address.
    pub const fn address(&self) -> Address {
        self.address
    }

    /// Returns the signing key.
    pub const fn key(&self) -> &PrivateKeySigner {
        &self.key
    }

    /// Returns the account's nonce allocator.
    pub const fn nonces(&self) -> &Arc<NonceAllocator<C>> {
        &self.nonces
    }
}

/// Generates `count` wallets with random keys.
pub fn generate_wallets<C: LedgerClient>(count: usize, client: &Arc<C>) -> Vec<Arc<Wallet<C>>> {
    (0..count).map(|_| Arc::new(Wallet::random(Arc::clone(client)))).collect()
}

/// Generates `count` random recipient addresses.
pub fn random_addresses<R: Rng>(count: usize, rng: &mut R) -> Vec<Address> {
    (0..count)
        .map(|_| {
            let mut bytes = [0u8; 20];
            rng.fill(&mut bytes);
            Address::from(bytes)
        })
        .collect()
}

/// The accounts taking part in one run: the funding source first, then the
/// generated accounts in creation order.
#[derive(Debug)]
pub struct WalletFleet<C> {
    source: Arc<Wallet<C>>,
    generated: Vec<Arc<Wallet<C>>>,
}

impl<C: LedgerClient> WalletFleet<C> {
    /// Creates a fleet holding only the source account.
    pub const fn new(source: Arc<Wallet<C>>) -> Self {
        Self { source, generated: Vec::new() }
    }

    /// Adds generated accounts to the fleet.
    pub fn extend(&mut self, wallets: impl IntoIterator<Item = Arc<Wallet<C>>>) {
        self.generated.extend(wallets);
    }

    /// Returns the funding source.
    pub const fn source(&self) -> &Arc<Wallet<C>> {
        &self.source
    }

    /// Returns the generated accounts.
    pub fn generated(&self) -> &[Arc<Wallet<C>>] {
        &self.generated
    }

    /// Returns every account, source first.
    pub fn all(&self) -> impl Iterator<Item = &Arc<Wallet<C>>> {
        std::iter::once(&self.source).chain(self.generated.iter())
    }

    /// Returns the number of accounts including the source.
    pub fn len(&self) -> usize {
        1 + self.generated.len()
    }

    /// Always `false`; a fleet contains at least its source.
    pub const fn is_empty(&self) -> bool {
        false
    }
}
