//! In-memory ledger and signer for tests.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        Mutex,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use alloy_primitives::{Address, B256, Bytes, TxKind, U256, keccak256};
use alloy_signer_local::PrivateKeySigner;
use async_trait::async_trait;

use crate::{
    LedgerClient, LedgerError, ReceiptSummary, SignError, SignedTransaction, TransactionSigner,
    TransferRequest, TxStatus,
};

/// A transaction accepted by [`MockLedger`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockTransaction {
    /// Sender.
    pub from: Address,
    /// Recipient, or contract creation.
    pub to: TxKind,
    /// Sender nonce.
    pub nonce: u64,
    /// Transferred wei.
    pub value: U256,
    /// Gas budget.
    pub gas_limit: u64,
    /// Gas price.
    pub gas_price: u128,
    /// Payload.
    pub input: Bytes,
}

impl MockTransaction {
    fn encode(&self) -> Bytes {
        let mut buf = Vec::with_capacity(105 + self.input.len());
        buf.extend_from_slice(self.from.as_slice());
        match self.to {
            TxKind::Create => buf.extend_from_slice(&[0u8; 21]),
            TxKind::Call(to) => {
                buf.push(1);
                buf.extend_from_slice(to.as_slice());
            }
        }
        buf.extend_from_slice(&self.nonce.to_be_bytes());
        buf.extend_from_slice(&self.value.to_be_bytes::<32>());
        buf.extend_from_slice(&self.gas_limit.to_be_bytes());
        buf.extend_from_slice(&self.gas_price.to_be_bytes());
        buf.extend_from_slice(&self.input);
        buf.into()
    }

    fn decode(raw: &[u8]) -> Option<Self> {
        if raw.len() < 105 {
            return None;
        }
        let from = Address::from_slice(&raw[0..20]);
        let to = match raw[20] {
            0 => TxKind::Create,
            _ => TxKind::Call(Address::from_slice(&raw[21..41])),
        };
        let nonce = u64::from_be_bytes(raw[41..49].try_into().ok()?);
        let value = U256::from_be_slice(&raw[49..81]);
        let gas_limit = u64::from_be_bytes(raw[81..89].try_into().ok()?);
        let gas_price = u128::from_be_bytes(raw[89..105].try_into().ok()?);
        let input = Bytes::copy_from_slice(&raw[105..]);
        Some(Self { from, to, nonce, value, gas_limit, gas_price, input })
    }

    /// Wei this transaction costs its sender.
    pub fn cost(&self) -> U256 {
        U256::from(self.gas_price) * U256::from(self.gas_limit) + self.value
    }
}

/// Signer producing a compact encoding that [`MockLedger`] can decode.
#[derive(Debug, Clone, Copy, Default)]
pub struct MockSigner {
    fail: bool,
}

impl MockSigner {
    /// Creates a signer that always succeeds.
    pub const fn new() -> Self {
        Self { fail: false }
    }

    /// Creates a signer that always fails.
    pub const fn failing() -> Self {
        Self { fail: true }
    }
}

impl TransactionSigner for MockSigner {
    fn sign(
        &self,
        key: &PrivateKeySigner,
        request: &TransferRequest,
    ) -> Result<SignedTransaction, SignError> {
        if self.fail {
            return Err(SignError::InvalidTransaction("mock signer failure".into()));
        }
        let raw = MockTransaction {
            from: key.address(),
            to: request.to,
            nonce: request.nonce,
            value: request.value,
            gas_limit: request.gas_limit,
            gas_price: request.gas_price,
            input: request.input.clone(),
        }
        .encode();
        let hash = keccak256(&raw);
        Ok(SignedTransaction { raw, hash })
    }
}

#[derive(Debug)]
struct MockState {
    gas_price: u128,
    chain_id: u64,
    balances: HashMap<Address, U256>,
    pending_nonces: HashMap<Address, u64>,
    used_nonces: HashSet<(Address, u64)>,
    accepted: Vec<(B256, MockTransaction)>,
    failing_recipients: HashSet<Address>,
    deferred_settlement: bool,
    unsettled: VecDeque<MockTransaction>,
    status_override: Option<TxStatus>,
    fail_submissions: bool,
    fail_gas_price: bool,
    fail_nonce: bool,
    fail_balance: bool,
    fail_status: bool,
}

impl MockState {
    fn settle(&mut self, tx: &MockTransaction) {
        let balance = self.balances.entry(tx.from).or_default();
        *balance = balance.saturating_sub(tx.cost());
        if let TxKind::Call(to) = tx.to {
            *self.balances.entry(to).or_default() += tx.value;
        }
    }
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            gas_price: 1,
            chain_id: 1337,
            balances: HashMap::new(),
            pending_nonces: HashMap::new(),
            used_nonces: HashSet::new(),
            accepted: Vec::new(),
            failing_recipients: HashSet::new(),
            deferred_settlement: false,
            unsettled: VecDeque::new(),
            status_override: None,
            fail_submissions: false,
            fail_gas_price: false,
            fail_nonce: false,
            fail_balance: false,
            fail_status: false,
        }
    }
}

/// Instrumented in-memory [`LedgerClient`].
///
/// Accepted transactions debit `gas_price * gas_limit + value` from the sender,
/// credit the recipient and advance the sender's pending nonce. Reused nonces and
/// underfunded senders are rejected the way a node would.
///
/// With [`MockLedger::with_deferred_settlement`] the reported balance is the
/// confirmed one instead: accepted transactions queue up unsettled and each
/// balance query settles the oldest of them first.
#[derive(Debug, Default)]
pub struct MockLedger {
    state: Mutex<MockState>,
    submit_latency: Duration,
    balance_latency: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    submit_calls: AtomicU64,
    gas_price_calls: AtomicU64,
    balance_calls: AtomicU64,
}

impl MockLedger {
    /// Creates an empty ledger with gas price 1.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the gas price.
    pub fn with_gas_price(self, gas_price: u128) -> Self {
        self.state().gas_price = gas_price;
        self
    }

    /// Sets the balance of `address`.
    pub fn with_balance(self, address: Address, balance: U256) -> Self {
        self.set_balance(address, balance);
        self
    }

    /// Makes every submission take `latency` before it resolves.
    pub fn with_submit_latency(mut self, latency: Duration) -> Self {
        self.submit_latency = latency;
        self
    }

    /// Makes every balance query take `latency` before it resolves.
    pub fn with_balance_latency(mut self, latency: Duration) -> Self {
        self.balance_latency = latency;
        self
    }

    /// Reports confirmed balances that trail accepted transactions by one
    /// settlement per balance query.
    pub fn with_deferred_settlement(self) -> Self {
        self.state().deferred_settlement = true;
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().expect("mock ledger poisoned")
    }

    /// Sets the balance of `address`.
    pub fn set_balance(&self, address: Address, balance: U256) {
        self.state().balances.insert(address, balance);
    }

    /// Sets the pending nonce reported for `address`.
    pub fn set_pending_nonce(&self, address: Address, nonce: u64) {
        self.state().pending_nonces.insert(address, nonce);
    }

    /// Rejects every transaction sent to `recipient`.
    pub fn fail_recipient(&self, recipient: Address) {
        self.state().failing_recipients.insert(recipient);
    }

    /// Rejects every submission while `fail` is set.
    pub fn set_fail_submissions(&self, fail: bool) {
        self.state().fail_submissions = fail;
    }

    /// Fails every gas price query while `fail` is set.
    pub fn set_fail_gas_price(&self, fail: bool) {
        self.state().fail_gas_price = fail;
    }

    /// Fails every pending nonce query while `fail` is set.
    pub fn set_fail_nonce_queries(&self, fail: bool) {
        self.state().fail_nonce = fail;
    }

    /// Fails every balance query while `fail` is set.
    pub fn set_fail_balance_queries(&self, fail: bool) {
        self.state().fail_balance = fail;
    }

    /// Reports `status` for every transaction, or restores normal lookups with `None`.
    pub fn set_status_override(&self, status: Option<TxStatus>) {
        self.state().status_override = status;
    }

    /// Fails every transaction status query while `fail` is set.
    pub fn set_fail_status_queries(&self, fail: bool) {
        self.state().fail_status = fail;
    }

    /// Returns the number of accepted transactions not yet settled.
    pub fn unsettled(&self) -> usize {
        self.state().unsettled.len()
    }

    /// Returns the balance of `address`.
    pub fn balance_of(&self, address: Address) -> U256 {
        self.state().balances.get(&address).copied().unwrap_or_default()
    }

    /// Returns every accepted transaction in acceptance order.
    pub fn accepted(&self) -> Vec<MockTransaction> {
        self.state().accepted.iter().map(|(_, tx)| tx.clone()).collect()
    }

    /// Returns the sorted nonces accepted from `sender`.
    pub fn accepted_nonces(&self, sender: Address) -> Vec<u64> {
        let mut nonces: Vec<u64> = self
            .state()
            .accepted
            .iter()
            .filter(|(_, tx)| tx.from == sender)
            .map(|(_, tx)| tx.nonce)
            .collect();
        nonces.sort_unstable();
        nonces
    }

    /// Returns how many times submission was called.
    pub fn submit_calls(&self) -> u64 {
        self.submit_calls.load(Ordering::SeqCst)
    }

    /// Returns how many times the gas price was queried.
    pub fn gas_price_calls(&self) -> u64 {
        self.gas_price_calls.load(Ordering::SeqCst)
    }

    /// Returns how many times a balance was queried.
    pub fn balance_calls(&self) -> u64 {
        self.balance_calls.load(Ordering::SeqCst)
    }

    /// Returns the highest number of submissions observed in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn apply(&self, raw: &[u8]) -> Result<(), LedgerError> {
        let tx = MockTransaction::decode(raw)
            .ok_or_else(|| LedgerError::submit("rlp: malformed transaction"))?;
        let mut state = self.state();

        if state.fail_submissions {
            return Err(LedgerError::submit("connection reset by peer"));
        }
        if matches!(tx.to, TxKind::Call(to) if state.failing_recipients.contains(&to)) {
            return Err(LedgerError::submit("transaction rejected"));
        }
        if state.used_nonces.contains(&(tx.from, tx.nonce)) {
            return Err(LedgerError::submit("nonce too low"));
        }

        let cost = tx.cost();
        let balance = state.balances.get(&tx.from).copied().unwrap_or_default();
        if balance < cost {
            return Err(LedgerError::submit("insufficient funds for gas * price + value"));
        }

        if state.deferred_settlement {
            state.unsettled.push_back(tx.clone());
        } else {
            state.settle(&tx);
        }
        state.used_nonces.insert((tx.from, tx.nonce));
        let pending = state.pending_nonces.entry(tx.from).or_default();
        *pending = (*pending).max(tx.nonce + 1);
        state.accepted.push((keccak256(raw), tx));
        Ok(())
    }

    fn find(&self, hash: B256) -> Option<MockTransaction> {
        self.state().accepted.iter().find(|(h, _)| *h == hash).map(|(_, tx)| tx.clone())
    }
}

#[async_trait]
impl LedgerClient for MockLedger {
    async fn pending_nonce(&self, address: Address) -> Result<u64, LedgerError> {
        let state = self.state();
        if state.fail_nonce {
            return Err(LedgerError::query("eth_getTransactionCount", "connection refused"));
        }
        Ok(state.pending_nonces.get(&address).copied().unwrap_or_default())
    }

    async fn balance(&self, address: Address) -> Result<U256, LedgerError> {
        self.balance_calls.fetch_add(1, Ordering::SeqCst);
        if !self.balance_latency.is_zero() {
            tokio::time::sleep(self.balance_latency).await;
        }

        let mut state = self.state();
        if state.fail_balance {
            return Err(LedgerError::query("eth_getBalance", "connection refused"));
        }
        if let Some(tx) = state.unsettled.pop_front() {
            state.settle(&tx);
        }
        Ok(state.balances.get(&address).copied().unwrap_or_default())
    }

    async fn gas_price(&self) -> Result<u128, LedgerError> {
        self.gas_price_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state();
        if state.fail_gas_price {
            return Err(LedgerError::query("eth_gasPrice", "connection refused"));
        }
        Ok(state.gas_price)
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<(), LedgerError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.submit_latency.is_zero() {
            tokio::time::sleep(self.submit_latency).await;
        }
        let result = self.apply(&raw);

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn transaction_status(&self, hash: B256) -> Result<TxStatus, LedgerError> {
        {
            let state = self.state();
            if state.fail_status {
                return Err(LedgerError::query("eth_getTransactionByHash", "connection refused"));
            }
            if let Some(status) = state.status_override {
                return Ok(status);
            }
        }
        Ok(if self.find(hash).is_some() { TxStatus::Included } else { TxStatus::Unknown })
    }

    async fn transaction_receipt(
        &self,
        hash: B256,
    ) -> Result<Option<ReceiptSummary>, LedgerError> {
        Ok(self.find(hash).map(|tx| ReceiptSummary {
            block_number: Some(1),
            contract_address: tx.to.is_create().then(|| tx.from.create(tx.nonce)),
            success: true,
        }))
    }

    async fn chain_id(&self) -> Result<u64, LedgerError> {
        Ok(self.state().chain_id)
    }
}
