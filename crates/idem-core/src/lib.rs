//! Flow identity, batch snapshots, idempotency ledger entries and the validation partitioner.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "idem-core";

/// A record shape that can flow through a pipeline.
///
/// `ENTITY_TYPE_ID` namespaces ledgers and snapshots, so two record types sharing a flow never collide.
pub trait FlowRecord: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    const ENTITY_TYPE_ID: &'static str;

    fn qualified_type_name() -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Contract violations. These are never retried.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("flow `{code}` already exists")]
    AlreadyExists { code: String },
    #[error("entity `{entity_type_id}` is already registered on flow `{flow_code}`")]
    AlreadyRegistered {
        flow_code: String,
        entity_type_id: String,
    },
    #[error("flow `{code}` not found")]
    FlowNotFound { code: String },
    #[error("entity `{entity_type_id}` is not registered on flow `{flow_code}`")]
    EntityNotRegistered {
        flow_code: String,
        entity_type_id: String,
    },
    #[error("missing required configuration: {0}")]
    MissingConfig(String),
    #[error("{address} holds {count} records, over the batch limit of {limit}")]
    BatchTooLarge {
        address: String,
        count: usize,
        limit: usize,
    },
}

/// Monotonic batch counter persisted with its flow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdSequence(u64);

impl IdSequence {
    pub fn starting_at(value: u64) -> Self {
        Self(value)
    }

    pub fn current(&self) -> u64 {
        self.0
    }

    pub fn advance(&mut self) -> u64 {
        self.0 += 1;
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowEntity {
    pub entity_type_id: String,
    pub qualified_type_name: String,
    pub date_registered: DateTime<Utc>,
}

/// A named, long-lived pipeline definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flow {
    pub code: String,
    pub display_name: String,
    pub data_dir: PathBuf,
    current_batch_id: IdSequence,
    pub entities: Vec<FlowEntity>,
    pub created_at: DateTime<Utc>,
}

impl Flow {
    pub fn new(code: impl Into<String>, display_name: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            code: code.into(),
            display_name: display_name.into(),
            data_dir: data_dir.into(),
            current_batch_id: IdSequence::default(),
            entities: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn current_batch_id(&self) -> u64 {
        self.current_batch_id.current()
    }

    /// Advance the counter and hand out the next batch. The caller persists the flow afterwards.
    pub fn issue_batch(&mut self) -> FlowBatch {
        let batch_id = self.current_batch_id.advance();
        FlowBatch {
            flow_code: self.code.clone(),
            batch_id,
        }
    }

    pub fn entity(&self, entity_type_id: &str) -> Option<&FlowEntity> {
        self.entities
            .iter()
            .find(|e| e.entity_type_id == entity_type_id)
    }

    pub fn register<T: FlowRecord>(&mut self) -> Result<FlowEntity, FlowError> {
        if self.entity(T::ENTITY_TYPE_ID).is_some() {
            return Err(FlowError::AlreadyRegistered {
                flow_code: self.code.clone(),
                entity_type_id: T::ENTITY_TYPE_ID.to_string(),
            });
        }
        let entity = FlowEntity {
            entity_type_id: T::ENTITY_TYPE_ID.to_string(),
            qualified_type_name: T::qualified_type_name().to_string(),
            date_registered: Utc::now(),
        };
        self.entities.push(entity.clone());
        Ok(entity)
    }

    pub fn require_entity(&self, entity_type_id: &str) -> Result<&FlowEntity, FlowError> {
        self.entity(entity_type_id)
            .ok_or_else(|| FlowError::EntityNotRegistered {
                flow_code: self.code.clone(),
                entity_type_id: entity_type_id.to_string(),
            })
    }
}

/// One numbered execution attempt within a flow. Never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowBatch {
    pub flow_code: String,
    pub batch_id: u64,
}

impl fmt::Display for FlowBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.flow_code, self.batch_id)
    }
}

/// A structured rule failure. Only the partitioner creates these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEvent {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    record_index: Option<usize>,
}

impl ErrorEvent {
    fn from_rule(rule: &str, message: String, record_index: Option<usize>) -> Self {
        Self {
            error_type: rule.to_string(),
            message,
            record_index,
        }
    }

    pub fn error_type(&self) -> &str {
        &self.error_type
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Position of the offending record in the candidate set; `None` for collection rules.
    pub fn record_index(&self) -> Option<usize> {
        self.record_index
    }
}

impl fmt::Display for ErrorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.record_index {
            Some(idx) => write!(f, "[{}] record #{}: {}", self.error_type, idx, self.message),
            None => write!(f, "[{}] {}", self.error_type, self.message),
        }
    }
}

/// Deterministic address of a persisted snapshot.
pub fn snapshot_address(process_name: &str, batch: &FlowBatch) -> String {
    format!("{}/{}/{}", process_name, batch.flow_code, batch.batch_id)
}

/// Where a snapshot's records came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotOrigin {
    pub process_name: String,
    pub source_type: String,
    pub source_address_id: String,
    pub target_type: String,
}

/// Persisted outcome of processing one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot<T> {
    pub batch: FlowBatch,
    pub process_name: String,
    pub source_type: String,
    pub source_address_id: String,
    pub target_type: String,
    pub target_address_id: String,
    pub output: Vec<T>,
    pub invalid: Vec<T>,
    pub errors: Vec<ErrorEvent>,
    #[serde(default)]
    pub exceptions: Vec<String>,
    pub processed_count: usize,
    pub process_time_ms: u64,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub supersedes: Option<u64>,
}

impl<T> Snapshot<T> {
    pub fn assemble(origin: SnapshotOrigin, batch: FlowBatch, partition: Partitioned<T>) -> Self {
        let target_address_id = snapshot_address(&origin.process_name, &batch);
        let processed_count = partition.valid.len() + partition.invalid.len();
        Self {
            batch,
            process_name: origin.process_name,
            source_type: origin.source_type,
            source_address_id: origin.source_address_id,
            target_type: origin.target_type,
            target_address_id,
            output: partition.valid,
            invalid: partition.invalid,
            errors: partition.errors,
            exceptions: Vec::new(),
            processed_count,
            process_time_ms: 0,
            warnings: Vec::new(),
            created_at: Utc::now(),
            supersedes: None,
        }
    }

    pub fn origin(&self) -> SnapshotOrigin {
        SnapshotOrigin {
            process_name: self.process_name.clone(),
            source_type: self.source_type.clone(),
            source_address_id: self.source_address_id.clone(),
            target_type: self.target_type.clone(),
        }
    }

    pub fn valid_count(&self) -> usize {
        self.output.len()
    }

    pub fn invalid_count(&self) -> usize {
        self.invalid.len()
    }

    /// Every record regardless of verdict: previously valid first, then previously invalid.
    pub fn into_records(self) -> Vec<T> {
        let mut records = self.output;
        records.extend(self.invalid);
        records
    }
}

/// File-consumption ledger entry. At most one per `(controller_name, address_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumptionEntry {
    pub controller_name: String,
    pub flow_code: String,
    pub batch_id: u64,
    pub address_id: String,
    pub date_processed: DateTime<Utc>,
}

/// Enrichment ledger entry. At most one completed entry per `(enricher_id, target_address_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentEntry {
    pub enricher_id: String,
    pub source_address_id: String,
    pub target_address_id: String,
    pub batch_id: u64,
    pub entities_enriched: usize,
    pub date_created: DateTime<Utc>,
    pub date_completed: Option<DateTime<Utc>>,
}

impl EnrichmentEntry {
    pub fn is_completed(&self) -> bool {
        self.date_completed.is_some()
    }
}

/// Ordered, append-only list of completed work, owned by one `(flow, entity type)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ledger<E> {
    pub flow_code: String,
    pub entity_type_id: String,
    entries: Vec<E>,
}

impl<E> Ledger<E> {
    pub fn new(flow_code: impl Into<String>, entity_type_id: impl Into<String>) -> Self {
        Self {
            flow_code: flow_code.into(),
            entity_type_id: entity_type_id.into(),
            entries: Vec::new(),
        }
    }

    pub fn entries(&self) -> &[E] {
        &self.entries
    }

    pub fn append(&mut self, entry: E) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub type ConsumptionLedger = Ledger<ConsumptionEntry>;
pub type EnrichmentLedger = Ledger<EnrichmentEntry>;

impl Ledger<ConsumptionEntry> {
    pub fn has_been_processed(&self, controller_name: &str, address_id: &str) -> bool {
        self.entries
            .iter()
            .any(|e| e.controller_name == controller_name && e.address_id == address_id)
    }
}

impl Ledger<EnrichmentEntry> {
    pub fn has_been_processed(&self, enricher_id: &str, target_address_id: &str) -> bool {
        self.entries.iter().any(|e| {
            e.is_completed() && e.enricher_id == enricher_id && e.target_address_id == target_address_id
        })
    }
}

/// A predicate over one record. Each returned message becomes one [`ErrorEvent`].
pub trait RecordRule<T>: Send + Sync {
    fn name(&self) -> &str;
    fn check(&self, record: &T) -> Vec<String>;
}

/// A predicate over the tentatively valid set as a whole.
pub trait CollectionRule<T>: Send + Sync {
    fn name(&self) -> &str;
    fn check(&self, records: &[&T]) -> Vec<String>;
}

struct FnRecordRule<F> {
    name: String,
    check: F,
}

impl<T, F> RecordRule<T> for FnRecordRule<F>
where
    F: Fn(&T) -> Vec<String> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self, record: &T) -> Vec<String> {
        (self.check)(record)
    }
}

struct FnCollectionRule<F> {
    name: String,
    check: F,
}

impl<T, F> CollectionRule<T> for FnCollectionRule<F>
where
    F: Fn(&[&T]) -> Vec<String> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self, records: &[&T]) -> Vec<String> {
        (self.check)(records)
    }
}

pub fn record_rule<T, F>(name: impl Into<String>, check: F) -> Arc<dyn RecordRule<T>>
where
    T: 'static,
    F: Fn(&T) -> Vec<String> + Send + Sync + 'static,
{
    Arc::new(FnRecordRule {
        name: name.into(),
        check,
    })
}

pub fn collection_rule<T, F>(name: impl Into<String>, check: F) -> Arc<dyn CollectionRule<T>>
where
    T: 'static,
    F: Fn(&[&T]) -> Vec<String> + Send + Sync + 'static,
{
    Arc::new(FnCollectionRule {
        name: name.into(),
        check,
    })
}

/// Collection rule failing when two records share a natural key. Keys compare case-insensitively.
pub struct UniqueBy<F> {
    name: String,
    key: F,
}

impl<F> UniqueBy<F> {
    pub fn new(name: impl Into<String>, key: F) -> Self {
        Self {
            name: name.into(),
            key,
        }
    }
}

impl<T, F> CollectionRule<T> for UniqueBy<F>
where
    F: Fn(&T) -> String + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self, records: &[&T]) -> Vec<String> {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for record in records.iter().copied() {
            *counts.entry((self.key)(record).to_lowercase()).or_default() += 1;
        }
        counts
            .into_iter()
            .filter(|(_, n)| *n > 1)
            .map(|(key, n)| format!("key `{key}` appears {n} times"))
            .collect()
    }
}

/// Outcome of a partitioning pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Partitioned<T> {
    pub valid: Vec<T>,
    pub invalid: Vec<T>,
    pub errors: Vec<ErrorEvent>,
}

/// Per-record and per-collection rules applied together.
///
/// Per-record failures only affect the offending record. Any collection failure demotes the whole
/// tentatively valid set, because a collection rule cannot be attributed to one record.
pub struct Validator<T> {
    record_rules: Vec<Arc<dyn RecordRule<T>>>,
    collection_rules: Vec<Arc<dyn CollectionRule<T>>>,
}

impl<T> Default for Validator<T> {
    fn default() -> Self {
        Self {
            record_rules: Vec::new(),
            collection_rules: Vec::new(),
        }
    }
}

impl<T> Clone for Validator<T> {
    fn clone(&self) -> Self {
        Self {
            record_rules: self.record_rules.clone(),
            collection_rules: self.collection_rules.clone(),
        }
    }
}

impl<T> Validator<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record_rule(mut self, rule: Arc<dyn RecordRule<T>>) -> Self {
        self.record_rules.push(rule);
        self
    }

    pub fn with_collection_rule(mut self, rule: Arc<dyn CollectionRule<T>>) -> Self {
        self.collection_rules.push(rule);
        self
    }

    pub fn partition(&self, candidates: Vec<T>) -> Partitioned<T> {
        let mut tentative = Vec::with_capacity(candidates.len());
        let mut invalid = Vec::new();
        let mut errors = Vec::new();

        for (idx, candidate) in candidates.into_iter().enumerate() {
            let before = errors.len();
            for rule in &self.record_rules {
                errors.extend(
                    rule.check(&candidate)
                        .into_iter()
                        .map(|msg| ErrorEvent::from_rule(rule.name(), msg, Some(idx))),
                );
            }
            if errors.len() == before {
                tentative.push(candidate);
            } else {
                invalid.push(candidate);
            }
        }

        let before = errors.len();
        {
            let refs: Vec<&T> = tentative.iter().collect();
            for rule in &self.collection_rules {
                errors.extend(
                    rule.check(&refs)
                        .into_iter()
                        .map(|msg| ErrorEvent::from_rule(rule.name(), msg, None)),
                );
            }
        }

        if errors.len() > before {
            invalid.extend(tentative);
            Partitioned {
                valid: Vec::new(),
                invalid,
                errors,
            }
        } else {
            Partitioned {
                valid: tentative,
                invalid,
                errors,
            }
        }
    }
}
