//! Transaction construction and signing.

use alloy_consensus::{SignableTransaction, TxEnvelope, TxLegacy};
use alloy_eips::eip2718::Encodable2718;
use alloy_network::TxSignerSync;
use alloy_primitives::{B256, Bytes, TxKind, U256};
use alloy_signer_local::PrivateKeySigner;

use crate::SignError;

/// An unsigned transaction ready to be signed by a [`TransactionSigner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    /// Sender nonce.
    pub nonce: u64,
    /// Recipient, or contract creation.
    pub to: TxKind,
    /// Amount of wei transferred.
    pub value: U256,
    /// Gas budget.
    pub gas_limit: u64,
    /// Gas price in wei.
    pub gas_price: u128,
    /// Call data or init code.
    pub input: Bytes,
    /// Chain id for replay protection.
    pub chain_id: u64,
}

/// Encoded transaction bytes and the hash the ledger will know it by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    /// EIP-2718 encoded transaction.
    pub raw: Bytes,
    /// Transaction hash.
    pub hash: B256,
}

/// Signs [`TransferRequest`]s with an account key.
pub trait TransactionSigner: Send + Sync + 'static {
    /// Builds and signs `request` with `key`.
    fn sign(
        &self,
        key: &PrivateKeySigner,
        request: &TransferRequest,
    ) -> Result<SignedTransaction, SignError>;
}

/// Signs legacy transactions with EIP-155 replay protection.
#[derive(Debug, Clone, Copy, Default)]
pub struct Eip155Signer;

impl TransactionSigner for Eip155Signer {
    fn sign(
        &self,
        key: &PrivateKeySigner,
        request: &TransferRequest,
    ) -> Result<SignedTransaction, SignError> {
        if request.gas_limit == 0 {
            return Err(SignError::InvalidTransaction("gas limit must be non-zero".into()));
        }
        if request.to.is_create() && request.input.is_empty() {
            return Err(SignError::InvalidTransaction("contract creation without init code".into()));
        }

        let mut tx = TxLegacy {
            chain_id: Some(request.chain_id),
            nonce: request.nonce,
            gas_price: request.gas_price,
            gas_limit: request.gas_limit,
            to: request.to,
            value: request.value,
            input: request.input.clone(),
        };

        let signature = key.sign_transaction_sync(&mut tx)?;
        let signed = tx.into_signed(signature);
        let hash = *signed.hash();
        let raw: Bytes = TxEnvelope::Legacy(signed).encoded_2718().into();

        Ok(SignedTransaction { raw, hash })
    }
}
