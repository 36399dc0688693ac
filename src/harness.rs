//! Drives one operation against both backends and asserts equivalence.
//!
//! Read-only invocations run against the two nodes concurrently; state
//! mutations run one at a time so each backend keeps a single linear
//! history. The first failure aborts the run with full context.

use ethers::abi::Token;
use ethers::types::{H160, U256};
use log::{debug, info};
use serde_json::{json, Value};
use thiserror::Error;

use crate::compare::{
    compare_access_sequences, compare_events, compare_results, compare_storage_values,
    reconcile_reverts, render_tokens, AccessComparer, EquivalenceFailure, EventComparer,
    FailureParameters, Mismatch, ResultComparer, RevertAgreement, StorageView, ValueComparer,
};
use crate::identity::{IdentityError, IdentityPool};
use crate::invoke::{execute_call, execute_tx, ExecutionResult, InvokeError, Operation};
use crate::precompiles::{Precompile, RemapRule};
use crate::rpc::{BackendPair, RpcError};

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("Rpc error {0}")]
    Rpc(#[from] RpcError),
    #[error("Identity error {0}")]
    Identity(#[from] IdentityError),
    #[error("Invoke error {0}")]
    Invoke(#[from] InvokeError),
    #[error("{0}")]
    Equivalence(#[from] EquivalenceFailure),
    #[error("A transaction equivalence check requires a sender identity")]
    MissingSender,
}

/// Per-check configuration. Unset comparators fall back to exact equality.
#[derive(Clone, Default)]
pub struct EquivalenceOptions {
    /// Acting identity. Optional for calls (defaults to the zero address),
    /// required for transactions.
    pub from: Option<H160>,
    /// Ether attached to a transaction.
    pub value: Option<U256>,
    pub result: Option<ResultComparer>,
    pub storage_access: Option<AccessComparer>,
    pub storage_values: Option<ValueComparer>,
    pub events: Option<EventComparer>,
}

impl EquivalenceOptions {
    pub fn with_from(mut self, from: H160) -> Self {
        self.from = Some(from);
        self
    }

    pub fn with_value(mut self, value: U256) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_result(mut self, comparer: ResultComparer) -> Self {
        self.result = Some(comparer);
        self
    }

    pub fn with_storage_access(mut self, comparer: AccessComparer) -> Self {
        self.storage_access = Some(comparer);
        self
    }

    pub fn with_storage_values(mut self, comparer: ValueComparer) -> Self {
        self.storage_values = Some(comparer);
        self
    }

    pub fn with_events(mut self, comparer: EventComparer) -> Self {
        self.events = Some(comparer);
        self
    }
}

/// Scenario context: both clients, the identity pool and the remapping
/// rule, built once at setup and threaded through every check.
pub struct Harness {
    pub pair: BackendPair,
    pub identities: IdentityPool,
    pub remap: RemapRule,
}

impl Harness {
    pub async fn connect(mock_url: &str, underlying_url: &str) -> Result<Self, HarnessError> {
        Ok(Self {
            pair: BackendPair::connect(mock_url, underlying_url).await?,
            identities: IdentityPool::new()?,
            remap: RemapRule::standard(),
        })
    }

    /// Read-only equivalence check under one caller address. Un-pooled
    /// callers are allowed here, including the zero address.
    pub async fn expect_equivalent_call(
        &self,
        address: H160,
        operation: &Operation,
        args: &[Token],
        options: &EquivalenceOptions,
    ) -> Result<(), HarnessError> {
        let from = options.from.unwrap_or_else(H160::zero);
        debug!("call {} on {address:?} from {from:?}", operation.name());

        let (mock, underlying) = tokio::try_join!(
            execute_call(&self.pair.mock, &self.remap, operation, address, args, from),
            execute_call(
                &self.pair.underlying,
                &self.remap,
                operation,
                address,
                args,
                from
            ),
        )?;
        let parameters = failure_parameters(operation, address, args, Some(from));

        match reconcile_reverts(
            mock.static_reverted,
            static_diagnostics(&mock),
            underlying.static_reverted,
            static_diagnostics(&underlying),
        ) {
            Ok(RevertAgreement::BothReverted) => return Ok(()),
            Ok(RevertAgreement::NeitherReverted) => {}
            Err(mismatch) => return Err(fail(parameters, mismatch)),
        }

        self.compare_static_results(&mock, &underlying, options, &parameters)?;
        self.compare_accesses(&mock, &underlying, options, &parameters)?;
        Ok(())
    }

    /// Transactional equivalence check. The sender must be a pooled
    /// identity; chain state on both backends changes.
    pub async fn expect_equivalent_tx(
        &self,
        address: H160,
        operation: &Operation,
        args: &[Token],
        options: &EquivalenceOptions,
    ) -> Result<(), HarnessError> {
        let from = options.from.ok_or(HarnessError::MissingSender)?;
        let index = self.identities.require_index(from)?;
        let wallet = self.identities.wallet(index)?;
        info!("tx {} on {address:?} from identity {index}", operation.name());

        // One state mutation in flight at a time.
        let mock = execute_tx(
            &self.pair.mock,
            &self.remap,
            operation,
            address,
            args,
            &wallet,
            options.value,
        )
        .await?;
        let underlying = execute_tx(
            &self.pair.underlying,
            &self.remap,
            operation,
            address,
            args,
            &wallet,
            options.value,
        )
        .await?;
        let parameters = failure_parameters(operation, address, args, Some(from));

        if !mock.static_reverted && !underlying.static_reverted {
            self.compare_static_results(&mock, &underlying, options, &parameters)?;
        }

        match reconcile_reverts(
            mock.reverted,
            tx_diagnostics(&mock),
            underlying.reverted,
            tx_diagnostics(&underlying),
        ) {
            Ok(RevertAgreement::BothReverted) => return Ok(()),
            Ok(RevertAgreement::NeitherReverted) => {}
            Err(mismatch) => return Err(fail(parameters, mismatch)),
        }

        let mock_status = mock.receipt.as_ref().and_then(|receipt| receipt.status);
        let underlying_status = underlying
            .receipt
            .as_ref()
            .and_then(|receipt| receipt.status);
        if mock_status != underlying_status {
            return Err(fail(
                parameters,
                Mismatch::new(
                    "Transaction status mismatch",
                    json!({ "status": mock_status }),
                    json!({ "status": underlying_status }),
                ),
            ));
        }

        self.compare_accesses(&mock, &underlying, options, &parameters)?;

        let mock_view = StorageView {
            accesses: &mock.storage_accesses,
            values: &mock.final_storage_values,
        };
        let underlying_view = StorageView {
            accesses: &underlying.storage_accesses,
            values: &underlying.final_storage_values,
        };
        match &options.storage_values {
            Some(comparer) => comparer(mock_view, underlying_view),
            None => compare_storage_values(mock_view, underlying_view, &Default::default()),
        }
        .map_err(|mismatch| fail(parameters.clone(), mismatch))?;

        match &options.events {
            Some(comparer) => comparer(&mock.events, &underlying.events),
            None => compare_events(&mock.events, &underlying.events),
        }
        .map_err(|mismatch| fail(parameters, mismatch))?;
        Ok(())
    }

    /// Probes read-only behavior from pooled identities plus unregistered
    /// callers: the zero address and a foreign precompile address.
    pub async fn expect_equivalent_call_from_multiple_addresses(
        &self,
        address: H160,
        operation: &Operation,
        args: &[Token],
        options: &EquivalenceOptions,
    ) -> Result<(), HarnessError> {
        for from in call_probe_addresses(&self.identities) {
            let probe = options.clone().with_from(from);
            self.expect_equivalent_call(address, operation, args, &probe)
                .await?;
        }
        Ok(())
    }

    /// Runs a transaction check from every pooled probe identity, one
    /// identity at a time so each backend keeps a linear history.
    pub async fn expect_equivalent_tx_from_multiple_addresses(
        &self,
        address: H160,
        operation: &Operation,
        args: &[Token],
        options: &EquivalenceOptions,
    ) -> Result<(), HarnessError> {
        for from in tx_sender_addresses(&self.identities) {
            let probe = options.clone().with_from(from);
            self.expect_equivalent_tx(address, operation, args, &probe)
                .await?;
        }
        Ok(())
    }

    pub async fn expect_equivalent_call_from_chain_owner(
        &self,
        address: H160,
        operation: &Operation,
        args: &[Token],
        options: &EquivalenceOptions,
    ) -> Result<(), HarnessError> {
        let options = options.clone().with_from(self.identities.owner_address());
        self.expect_equivalent_call(address, operation, args, &options)
            .await
    }

    pub async fn expect_equivalent_tx_from_chain_owner(
        &self,
        address: H160,
        operation: &Operation,
        args: &[Token],
        options: &EquivalenceOptions,
    ) -> Result<(), HarnessError> {
        let options = options.clone().with_from(self.identities.owner_address());
        self.expect_equivalent_tx(address, operation, args, &options)
            .await
    }

    fn compare_static_results(
        &self,
        mock: &ExecutionResult,
        underlying: &ExecutionResult,
        options: &EquivalenceOptions,
        parameters: &FailureParameters,
    ) -> Result<(), HarnessError> {
        let empty = Vec::new();
        let mock_tokens = mock.static_result.as_ref().unwrap_or(&empty);
        let underlying_tokens = underlying.static_result.as_ref().unwrap_or(&empty);
        match &options.result {
            Some(comparer) => comparer(mock_tokens, underlying_tokens),
            None => compare_results(mock_tokens, underlying_tokens),
        }
        .map_err(|mismatch| fail(parameters.clone(), mismatch))
    }

    fn compare_accesses(
        &self,
        mock: &ExecutionResult,
        underlying: &ExecutionResult,
        options: &EquivalenceOptions,
        parameters: &FailureParameters,
    ) -> Result<(), HarnessError> {
        match &options.storage_access {
            Some(comparer) => comparer(&mock.storage_accesses, &underlying.storage_accesses),
            None => compare_access_sequences(&mock.storage_accesses, &underlying.storage_accesses),
        }
        .map_err(|mismatch| fail(parameters.clone(), mismatch))
    }
}

/// Caller addresses probed by the read-only multi-address checks.
fn call_probe_addresses(identities: &IdentityPool) -> Vec<H160> {
    vec![
        identities.owner_address(),
        identities.plain_address(),
        H160::zero(),
        Precompile::ArbSys.address(),
    ]
}

/// Pooled senders used by the transactional multi-address checks.
fn tx_sender_addresses(identities: &IdentityPool) -> Vec<H160> {
    vec![identities.owner_address(), identities.plain_address()]
}

fn failure_parameters(
    operation: &Operation,
    address: H160,
    args: &[Token],
    from: Option<H160>,
) -> FailureParameters {
    FailureParameters {
        operation: operation.name().to_string(),
        address,
        args: args.iter().map(|token| token.to_string()).collect(),
        from,
    }
}

fn fail(parameters: FailureParameters, result: Mismatch) -> HarnessError {
    HarnessError::Equivalence(EquivalenceFailure { parameters, result })
}

fn static_diagnostics(result: &ExecutionResult) -> Value {
    if result.static_reverted {
        json!({ "error": result.static_error })
    } else {
        json!({
            "result": result.static_result.as_deref().map(render_tokens)
        })
    }
}

fn tx_diagnostics(result: &ExecutionResult) -> Value {
    if result.reverted {
        json!({ "error": result.revert_reason })
    } else {
        json!({ "txHash": result.tx_hash })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn call_probe_set_includes_unregistered_callers() {
        let identities = IdentityPool::new().unwrap();
        let probes = call_probe_addresses(&identities);
        assert_eq!(probes.len(), 4);
        assert!(probes.contains(&H160::zero()));
        assert!(probes.contains(&Precompile::ArbSys.address()));
        assert!(probes.contains(&identities.owner_address()));
    }

    #[test]
    fn tx_probe_set_is_pooled_identities_only() {
        let identities = IdentityPool::new().unwrap();
        let senders = tx_sender_addresses(&identities);
        assert_eq!(
            senders,
            vec![identities.owner_address(), identities.plain_address()]
        );
        assert!(senders.iter().all(|sender| identities.index_of(*sender).is_some()));
    }

    #[test]
    fn options_builders_set_fields() {
        let options = EquivalenceOptions::default()
            .with_from(H160::repeat_byte(0x05))
            .with_value(U256::from(7u64));
        assert_eq!(options.from, Some(H160::repeat_byte(0x05)));
        assert_eq!(options.value, Some(U256::from(7u64)));
        assert!(options.result.is_none());
    }
}
