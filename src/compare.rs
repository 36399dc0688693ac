//! Comparators over paired execution outcomes.
//!
//! Each comparator either passes silently or produces a structured mismatch
//! carrying both sides' raw data. Mismatches are never downgraded; known
//! intentional divergences are asserted with an exact expected pair, not
//! suppressed.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use arbdiff_interpret::StorageAccess;
use ethers::abi::Token;
use ethers::types::{Log, H160, H256};
use serde::Serialize;
use serde_json::{json, Value};

use crate::precompiles::{l2_base_fee_slot, version_slot};

/// One comparator disagreement, with both sides' payloads attached.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Mismatch {
    pub reason: String,
    pub mock_data: Value,
    pub underlying_data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl Mismatch {
    pub fn new(reason: impl Into<String>, mock_data: Value, underlying_data: Value) -> Self {
        Self {
            reason: reason.into(),
            mock_data,
            underlying_data,
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Invocation context attached to every failure.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureParameters {
    pub operation: String,
    pub address: H160,
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<H160>,
}

/// A semantic divergence between the two backends. Constructing one always
/// fails the run.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EquivalenceFailure {
    pub parameters: FailureParameters,
    pub result: Mismatch,
}

impl std::fmt::Display for EquivalenceFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match serde_json::to_string_pretty(self) {
            Ok(rendered) => write!(f, "equivalence failure: {rendered}"),
            Err(_) => write!(f, "equivalence failure: {self:?}"),
        }
    }
}

impl std::error::Error for EquivalenceFailure {}

/// One side's view of post-transaction storage: the accesses it performed
/// and the committed value at each touched pair.
#[derive(Clone, Copy, Debug)]
pub struct StorageView<'a> {
    pub accesses: &'a [StorageAccess],
    pub values: &'a HashMap<(H160, H256), H256>,
}

pub type ResultComparer = Arc<dyn Fn(&[Token], &[Token]) -> Result<(), Mismatch> + Send + Sync>;
pub type AccessComparer =
    Arc<dyn Fn(&[StorageAccess], &[StorageAccess]) -> Result<(), Mismatch> + Send + Sync>;
pub type ValueComparer =
    Arc<dyn for<'a> Fn(StorageView<'a>, StorageView<'a>) -> Result<(), Mismatch> + Send + Sync>;
pub type EventComparer = Arc<dyn Fn(&[Log], &[Log]) -> Result<(), Mismatch> + Send + Sync>;

/// Exact, order- and index-sensitive comparison of access sequences by
/// (address, slot, kind).
pub fn compare_access_sequences(
    mock: &[StorageAccess],
    underlying: &[StorageAccess],
) -> Result<(), Mismatch> {
    if mock.len() != underlying.len() {
        return Err(Mismatch::new(
            "Storage access count mismatch",
            json!({"count": mock.len(), "accesses": mock}),
            json!({"count": underlying.len(), "accesses": underlying}),
        ));
    }
    for (index, (mock_access, underlying_access)) in mock.iter().zip(underlying).enumerate() {
        if mock_access.address != underlying_access.address {
            return Err(access_mismatch("address", index, mock_access, underlying_access));
        }
        if mock_access.slot != underlying_access.slot {
            return Err(access_mismatch("slot", index, mock_access, underlying_access));
        }
        if mock_access.kind != underlying_access.kind {
            return Err(access_mismatch("kind", index, mock_access, underlying_access));
        }
    }
    Ok(())
}

fn access_mismatch(
    field: &str,
    index: usize,
    mock: &StorageAccess,
    underlying: &StorageAccess,
) -> Mismatch {
    Mismatch::new(
        format!("Storage access {index}: {field} mismatch"),
        json!(mock),
        json!(underlying),
    )
    .with_details(json!({"accessIndex": index}))
}

/// Drops accesses at the named slots from both sides, then compares exactly.
pub fn compare_access_sequences_excluding(
    mock: &[StorageAccess],
    underlying: &[StorageAccess],
    excluded: &HashSet<H256>,
) -> Result<(), Mismatch> {
    let keep = |accesses: &[StorageAccess]| -> Vec<StorageAccess> {
        accesses
            .iter()
            .filter(|access| !excluded.contains(&access.slot))
            .cloned()
            .collect()
    };
    compare_access_sequences(&keep(mock), &keep(underlying))
}

pub fn access_comparer_excluding(slots: Vec<H256>) -> AccessComparer {
    let excluded: HashSet<H256> = slots.into_iter().collect();
    Arc::new(move |mock, underlying| {
        compare_access_sequences_excluding(mock, underlying, &excluded)
    })
}

/// Tolerates the layout-version slot, which only one side touches on
/// deployment-driven updates.
pub fn access_comparer_excluding_version() -> AccessComparer {
    access_comparer_excluding(vec![version_slot()])
}

/// Additionally tolerates the stored base fee slot the mock reads during
/// simulated calls.
pub fn access_comparer_excluding_version_and_base_fee() -> AccessComparer {
    access_comparer_excluding(vec![version_slot(), l2_base_fee_slot()])
}

/// Compares committed values over the union of pairs either side touched.
/// A pair absent from one side's map reads as the zero value.
pub fn compare_storage_values(
    mock: StorageView,
    underlying: StorageView,
    excluded: &HashSet<H256>,
) -> Result<(), Mismatch> {
    let mut touched: BTreeSet<(H160, H256)> = BTreeSet::new();
    for access in mock.accesses.iter().chain(underlying.accesses) {
        if !excluded.contains(&access.slot) {
            touched.insert((access.address, access.slot));
        }
    }
    for (address, slot) in touched {
        let mock_value = mock.values.get(&(address, slot)).copied().unwrap_or_default();
        let underlying_value = underlying
            .values
            .get(&(address, slot))
            .copied()
            .unwrap_or_default();
        if mock_value != underlying_value {
            return Err(Mismatch::new(
                "Storage value mismatch after transaction",
                json!({"address": address, "slot": slot, "value": mock_value}),
                json!({"address": address, "slot": slot, "value": underlying_value}),
            ));
        }
    }
    Ok(())
}

pub fn value_comparer_excluding(slots: Vec<H256>) -> ValueComparer {
    let excluded: HashSet<H256> = slots.into_iter().collect();
    Arc::new(move |mock: StorageView, underlying: StorageView| {
        compare_storage_values(mock, underlying, &excluded)
    })
}

pub fn value_comparer_excluding_version() -> ValueComparer {
    value_comparer_excluding(vec![version_slot()])
}

/// Default result comparator: numeric equality for integers, element-wise
/// recursion for sequences and tuples, structural equality otherwise.
pub fn compare_results(mock: &[Token], underlying: &[Token]) -> Result<(), Mismatch> {
    if mock.len() != underlying.len() {
        return Err(Mismatch::new(
            "Result arity mismatch",
            render_tokens(mock),
            render_tokens(underlying),
        ));
    }
    for (index, (mock_token, underlying_token)) in mock.iter().zip(underlying).enumerate() {
        compare_token(mock_token, underlying_token, &[index])?;
    }
    Ok(())
}

fn compare_token(mock: &Token, underlying: &Token, path: &[usize]) -> Result<(), Mismatch> {
    match (mock, underlying) {
        (Token::Array(mock_items), Token::Array(underlying_items))
        | (Token::FixedArray(mock_items), Token::FixedArray(underlying_items))
        | (Token::Tuple(mock_items), Token::Tuple(underlying_items)) => {
            if mock_items.len() != underlying_items.len() {
                return Err(Mismatch::new(
                    "Result sequence length mismatch",
                    json!({"length": mock_items.len(), "items": render_token_list(mock_items)}),
                    json!({
                        "length": underlying_items.len(),
                        "items": render_token_list(underlying_items)
                    }),
                )
                .with_details(json!({ "path": path })));
            }
            for (index, (mock_item, underlying_item)) in
                mock_items.iter().zip(underlying_items).enumerate()
            {
                let mut deeper = path.to_vec();
                deeper.push(index);
                compare_token(mock_item, underlying_item, &deeper)?;
            }
            Ok(())
        }
        _ => {
            // Scalars: Uint/Int carry canonical 256-bit values, so equality
            // here is numeric, not representational.
            if mock != underlying {
                return Err(Mismatch::new(
                    "Result mismatch",
                    json!(mock.to_string()),
                    json!(underlying.to_string()),
                )
                .with_details(json!({ "path": path })));
            }
            Ok(())
        }
    }
}

/// Asserts a documented, intentional divergence: both sides must return
/// exactly the expected values; anything else fails.
pub fn expect_divergent_results(
    mock_expected: Vec<Token>,
    underlying_expected: Vec<Token>,
) -> ResultComparer {
    Arc::new(move |mock, underlying| {
        if mock == mock_expected.as_slice() && underlying == underlying_expected.as_slice() {
            return Ok(());
        }
        Err(Mismatch::new(
            "Divergence did not match the documented expectation",
            json!({
                "actual": render_tokens(mock),
                "expected": render_tokens(&mock_expected)
            }),
            json!({
                "actual": render_tokens(underlying),
                "expected": render_tokens(&underlying_expected)
            }),
        ))
    })
}

/// Pairwise log comparison: count, emitter, topics index-for-index, payload.
pub fn compare_events(mock: &[Log], underlying: &[Log]) -> Result<(), Mismatch> {
    if mock.len() != underlying.len() {
        return Err(Mismatch::new(
            "Event count mismatch",
            json!({"count": mock.len(), "events": mock}),
            json!({"count": underlying.len(), "events": underlying}),
        ));
    }
    for (index, (mock_event, underlying_event)) in mock.iter().zip(underlying).enumerate() {
        if mock_event.address != underlying_event.address {
            return Err(event_mismatch("address", index, None, mock_event, underlying_event));
        }
        if mock_event.topics.len() != underlying_event.topics.len() {
            return Err(event_mismatch(
                "topics length",
                index,
                None,
                mock_event,
                underlying_event,
            ));
        }
        for (topic_index, (mock_topic, underlying_topic)) in mock_event
            .topics
            .iter()
            .zip(&underlying_event.topics)
            .enumerate()
        {
            if mock_topic != underlying_topic {
                return Err(event_mismatch(
                    "topic",
                    index,
                    Some(topic_index),
                    mock_event,
                    underlying_event,
                ));
            }
        }
        if mock_event.data != underlying_event.data {
            return Err(event_mismatch("data", index, None, mock_event, underlying_event));
        }
    }
    Ok(())
}

fn event_mismatch(
    field: &str,
    index: usize,
    topic_index: Option<usize>,
    mock: &Log,
    underlying: &Log,
) -> Mismatch {
    let details = match topic_index {
        Some(topic_index) => json!({"eventIndex": index, "topicIndex": topic_index}),
        None => json!({ "eventIndex": index }),
    };
    Mismatch::new(
        format!("Event {index}: {field} mismatch"),
        json!(mock),
        json!(underlying),
    )
    .with_details(details)
}

/// Agreement on whether execution reverted.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RevertAgreement {
    /// Both sides reverted: behavioral agreement, comparison stops here.
    BothReverted,
    NeitherReverted,
}

/// Both sides reverting is a pass; exactly one side reverting is always a
/// hard failure carrying both diagnostics.
pub fn reconcile_reverts(
    mock_reverted: bool,
    mock_diagnostics: Value,
    underlying_reverted: bool,
    underlying_diagnostics: Value,
) -> Result<RevertAgreement, Mismatch> {
    match (mock_reverted, underlying_reverted) {
        (true, true) => Ok(RevertAgreement::BothReverted),
        (false, false) => Ok(RevertAgreement::NeitherReverted),
        (true, false) => Err(Mismatch::new(
            "Mock reverted but underlying succeeded",
            mock_diagnostics,
            underlying_diagnostics,
        )),
        (false, true) => Err(Mismatch::new(
            "Underlying reverted but mock succeeded",
            mock_diagnostics,
            underlying_diagnostics,
        )),
    }
}

pub fn render_tokens(tokens: &[Token]) -> Value {
    json!(render_token_list(tokens))
}

fn render_token_list(tokens: &[Token]) -> Vec<String> {
    tokens.iter().map(|token| token.to_string()).collect()
}
