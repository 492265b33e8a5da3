//! Atomic JSON document storage for flows, idempotency ledgers and batch snapshots.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::Context;
use idem_core::{
    ConsumptionEntry, EnrichmentEntry, Flow, FlowBatch, FlowEntity, FlowError, FlowRecord, Ledger,
    Snapshot,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "idem-storage";

#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
}

/// Whole-file JSON persistence rooted at one directory.
#[derive(Debug, Clone)]
pub struct DocumentStore {
    root: PathBuf,
}

impl DocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn backup_path(path: &Path) -> PathBuf {
        let mut name = OsString::from(path.as_os_str());
        name.push(".bak");
        PathBuf::from(name)
    }

    /// Read a document, `None` when it does not exist.
    pub async fn read_json<T: DeserializeOwned>(&self, relative_path: &Path) -> anyhow::Result<Option<T>> {
        let path = self.root.join(relative_path);
        read_json_file(&path).await
    }

    /// Read a document, falling back to its `.bak` sibling when the primary file is missing.
    pub async fn read_json_or_backup<T: DeserializeOwned>(
        &self,
        relative_path: &Path,
    ) -> anyhow::Result<Option<T>> {
        let path = self.root.join(relative_path);
        if let Some(value) = read_json_file(&path).await? {
            return Ok(Some(value));
        }
        let backup = Self::backup_path(&path);
        let recovered = read_json_file(&backup).await?;
        if recovered.is_some() {
            warn!(path = %path.display(), "primary document missing; recovered from backup");
        }
        Ok(recovered)
    }

    /// Serialize to memory, write a temp file next to the target and rename it into place.
    ///
    /// With `rotate_backup` the previous file is first renamed to `<file>.bak`.
    pub async fn write_json<T: Serialize>(
        &self,
        relative_path: &Path,
        value: &T,
        rotate_backup: bool,
    ) -> anyhow::Result<StoredDocument> {
        let bytes = serde_json::to_vec_pretty(value)
            .with_context(|| format!("serializing {}", relative_path.display()))?;
        let absolute_path = self.root.join(relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating document directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp document {}", temp_path.display()))?;
        let written = async {
            file.write_all(&bytes).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        drop(file);
        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| format!("writing temp document {}", temp_path.display()));
        }

        if rotate_backup
            && fs::try_exists(&absolute_path)
                .await
                .with_context(|| format!("checking {}", absolute_path.display()))?
        {
            let backup = Self::backup_path(&absolute_path);
            if let Err(err) = fs::rename(&absolute_path, &backup).await {
                let _ = fs::remove_file(&temp_path).await;
                return Err(err).with_context(|| {
                    format!("rotating {} -> {}", absolute_path.display(), backup.display())
                });
            }
        }

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp document {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }

        debug!(path = %absolute_path.display(), bytes = bytes.len(), "document written");
        Ok(StoredDocument {
            content_hash: Self::sha256_hex(&bytes),
            relative_path: relative_path.to_path_buf(),
            absolute_path,
            byte_size: bytes.len(),
        })
    }
}

async fn read_json_file<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
    };
    let value = serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(value))
}

/// Keep key material usable as a single path segment.
///
/// A key that had to be rewritten gets the first 8 hex digits of its sha256 appended, so `"a b"`
/// and `"a_b"` land in different files.
pub fn path_segment(input: &str) -> String {
    let cleaned: String = input
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = match cleaned.trim_matches('.') {
        "" => "_",
        s => s,
    };
    if cleaned == input {
        return cleaned.to_string();
    }
    let digest = DocumentStore::sha256_hex(input.as_bytes());
    format!("{cleaned}-{}", &digest[..8])
}

/// Persists flows and hands out batch ids.
///
/// `next_batch` rewrites the whole flow document, so it is serialized with an in-process lock.
/// Two processes sharing one data directory are not coordinated.
#[derive(Debug)]
pub struct FlowStore {
    docs: DocumentStore,
    write_lock: Mutex<()>,
}

impl FlowStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            docs: DocumentStore::new(root),
            write_lock: Mutex::new(()),
        }
    }

    fn flow_path(code: &str) -> PathBuf {
        PathBuf::from("flows").join(format!("{}.json", path_segment(code)))
    }

    pub async fn create_flow(&self, code: &str, display_name: &str) -> anyhow::Result<Flow> {
        let _guard = self.write_lock.lock().await;
        let path = Self::flow_path(code);
        if self.docs.read_json_or_backup::<Flow>(&path).await?.is_some() {
            return Err(FlowError::AlreadyExists {
                code: code.to_string(),
            }
            .into());
        }
        let flow = Flow::new(code, display_name, self.docs.root());
        self.docs.write_json(&path, &flow, false).await?;
        debug!(flow = code, "flow created");
        Ok(flow)
    }

    pub async fn find_flow(&self, code: &str) -> anyhow::Result<Option<Flow>> {
        self.docs.read_json_or_backup(&Self::flow_path(code)).await
    }

    pub async fn get_flow(&self, code: &str) -> anyhow::Result<Flow> {
        self.find_flow(code).await?.ok_or_else(|| {
            FlowError::FlowNotFound {
                code: code.to_string(),
            }
            .into()
        })
    }

    pub async fn register_entity<T: FlowRecord>(&self, code: &str) -> anyhow::Result<FlowEntity> {
        let _guard = self.write_lock.lock().await;
        let mut flow = self.get_flow(code).await?;
        let entity = flow.register::<T>()?;
        self.docs.write_json(&Self::flow_path(code), &flow, true).await?;
        debug!(flow = code, entity = %entity.entity_type_id, "entity registered");
        Ok(entity)
    }

    pub async fn next_batch(&self, code: &str) -> anyhow::Result<FlowBatch> {
        let _guard = self.write_lock.lock().await;
        let mut flow = self.get_flow(code).await?;
        let batch = flow.issue_batch();
        self.docs
            .write_json(&Self::flow_path(code), &flow, true)
            .await
            .with_context(|| format!("persisting batch counter for {batch}"))?;
        Ok(batch)
    }
}

/// Entry types that have their own ledger document per `(flow, entity type)`.
pub trait LedgerEntryKind: Serialize + DeserializeOwned + Send + Sync {
    const FILE_NAME: &'static str;
}

impl LedgerEntryKind for ConsumptionEntry {
    const FILE_NAME: &'static str = "consumption.json";
}

impl LedgerEntryKind for EnrichmentEntry {
    const FILE_NAME: &'static str = "enrichment.json";
}

#[derive(Debug, Clone)]
pub struct LedgerStore {
    docs: DocumentStore,
}

impl LedgerStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            docs: DocumentStore::new(root),
        }
    }

    pub fn ledger_path<E: LedgerEntryKind>(flow_code: &str, entity_type_id: &str) -> PathBuf {
        PathBuf::from("ledgers")
            .join(path_segment(flow_code))
            .join(path_segment(entity_type_id))
            .join(E::FILE_NAME)
    }

    /// Load the ledger, or an empty one when nothing has been saved yet.
    pub async fn get<E: LedgerEntryKind>(
        &self,
        flow_code: &str,
        entity_type_id: &str,
    ) -> anyhow::Result<Ledger<E>> {
        let path = Self::ledger_path::<E>(flow_code, entity_type_id);
        Ok(self
            .docs
            .read_json_or_backup(&path)
            .await?
            .unwrap_or_else(|| Ledger::new(flow_code, entity_type_id)))
    }

    pub async fn save<E: LedgerEntryKind>(&self, ledger: &Ledger<E>) -> anyhow::Result<()> {
        let path = Self::ledger_path::<E>(&ledger.flow_code, &ledger.entity_type_id);
        self.docs.write_json(&path, ledger, true).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AddressIndex {
    address_id: String,
    batch_ids: Vec<u64>,
}

/// Snapshots keyed by `(process, flow, batch)`, with a per-source-address index.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    docs: DocumentStore,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            docs: DocumentStore::new(root),
        }
    }

    fn process_dir(process_name: &str, flow_code: &str) -> PathBuf {
        PathBuf::from("snapshots")
            .join(path_segment(process_name))
            .join(path_segment(flow_code))
    }

    pub fn snapshot_path(process_name: &str, flow_code: &str, batch_id: u64) -> PathBuf {
        Self::process_dir(process_name, flow_code).join(format!("{batch_id:012}.json"))
    }

    fn index_path(process_name: &str, flow_code: &str, address_id: &str) -> PathBuf {
        let hash = DocumentStore::sha256_hex(address_id.as_bytes());
        Self::process_dir(process_name, flow_code)
            .join("by-address")
            .join(format!("{hash}.json"))
    }

    /// Persist a snapshot, then record its batch under the source address.
    pub async fn save<T: Serialize>(&self, snapshot: &Snapshot<T>) -> anyhow::Result<StoredDocument> {
        let process = &snapshot.process_name;
        let flow = &snapshot.batch.flow_code;
        let stored = self
            .docs
            .write_json(
                &Self::snapshot_path(process, flow, snapshot.batch.batch_id),
                snapshot,
                false,
            )
            .await
            .with_context(|| format!("persisting snapshot for {}", snapshot.batch))?;

        let index_path = Self::index_path(process, flow, &snapshot.source_address_id);
        let mut index: AddressIndex = self.docs.read_json(&index_path).await?.unwrap_or_default();
        index.address_id = snapshot.source_address_id.clone();
        if !index.batch_ids.contains(&snapshot.batch.batch_id) {
            index.batch_ids.push(snapshot.batch.batch_id);
            index.batch_ids.sort_unstable();
        }
        self.docs.write_json(&index_path, &index, false).await?;
        Ok(stored)
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        process_name: &str,
        flow_code: &str,
        batch_id: u64,
    ) -> anyhow::Result<Option<Snapshot<T>>> {
        self.docs
            .read_json(&Self::snapshot_path(process_name, flow_code, batch_id))
            .await
    }

    pub async fn get_batch<T: DeserializeOwned>(
        &self,
        process_name: &str,
        batch: &FlowBatch,
    ) -> anyhow::Result<Option<Snapshot<T>>> {
        self.get(process_name, &batch.flow_code, batch.batch_id).await
    }

    /// Batch ids of every snapshot taken from `address_id`, oldest first.
    pub async fn batches_for_address(
        &self,
        process_name: &str,
        flow_code: &str,
        address_id: &str,
    ) -> anyhow::Result<Vec<u64>> {
        let index: Option<AddressIndex> = self
            .docs
            .read_json(&Self::index_path(process_name, flow_code, address_id))
            .await?;
        Ok(index.map(|i| i.batch_ids).unwrap_or_default())
    }

    /// The newest snapshot for a source address; later passes supersede earlier ones.
    pub async fn latest_for_address<T: DeserializeOwned>(
        &self,
        process_name: &str,
        flow_code: &str,
        address_id: &str,
    ) -> anyhow::Result<Option<Snapshot<T>>> {
        let batches = self
            .batches_for_address(process_name, flow_code, address_id)
            .await?;
        match batches.last() {
            Some(batch_id) => self.get(process_name, flow_code, *batch_id).await,
            None => Ok(None),
        }
    }

    /// Every batch id persisted for the process, ascending.
    pub async fn list(&self, process_name: &str, flow_code: &str) -> anyhow::Result<Vec<u64>> {
        let dir = self.docs.root().join(Self::process_dir(process_name, flow_code));
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err).with_context(|| format!("reading {}", dir.display())),
        };
        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("reading {}", dir.display()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// Latest snapshot per source address, ordered by batch id.
    pub async fn latest_per_address<T: DeserializeOwned>(
        &self,
        process_name: &str,
        flow_code: &str,
    ) -> anyhow::Result<Vec<Snapshot<T>>> {
        let dir = self
            .docs
            .root()
            .join(Self::process_dir(process_name, flow_code))
            .join("by-address");
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err).with_context(|| format!("reading {}", dir.display())),
        };
        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("reading {}", dir.display()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let index: Option<AddressIndex> = read_json_file(&path).await?;
            if let Some(batch_id) = index.and_then(|i| i.batch_ids.last().copied()) {
                ids.push(batch_id);
            }
        }
        ids.sort_unstable();

        let mut out = Vec::with_capacity(ids.len());
        for batch_id in ids {
            if let Some(snapshot) = self.get(process_name, flow_code, batch_id).await? {
                out.push(snapshot);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use idem_core::{ConsumptionLedger, SnapshotOrigin, Validator};
    use tempfile::tempdir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Policy {
        number: String,
    }

    impl FlowRecord for Policy {
        const ENTITY_TYPE_ID: &'static str = "policy";
    }

    fn snapshot(batch_id: u64, address: &str, numbers: &[&str]) -> Snapshot<Policy> {
        let records = numbers
            .iter()
            .map(|n| Policy {
                number: n.to_string(),
            })
            .collect();
        Snapshot::assemble(
            SnapshotOrigin {
                process_name: "import".into(),
                source_type: "file".into(),
                source_address_id: address.into(),
                target_type: "policy".into(),
            },
            FlowBatch {
                flow_code: "policies".into(),
                batch_id,
            },
            Validator::new().partition(records),
        )
    }

    #[test]
    fn document_hashing_is_stable() {
        let hash = DocumentStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn path_segments_are_filesystem_safe() {
        let rewritten = path_segment("a/b c");
        assert!(rewritten.starts_with("a_b_c-"));
        assert_eq!(rewritten.len(), "a_b_c-".len() + 8);
        assert!(path_segment("..").starts_with("_-"));
        assert_eq!(path_segment("flow-1.v2"), "flow-1.v2");
    }

    #[test]
    fn rewritten_keys_do_not_collide_with_clean_ones() {
        assert_eq!(path_segment("a_b"), "a_b");
        assert_ne!(path_segment("a b"), path_segment("a_b"));
        assert_ne!(path_segment("a b"), path_segment("a/b"));
    }

    #[tokio::test]
    async fn flows_with_similar_codes_are_kept_apart() {
        let dir = tempdir().expect("tempdir");
        let store = FlowStore::new(dir.path());
        store.create_flow("a b", "Spaced").await.unwrap();
        store.create_flow("a_b", "Underscored").await.unwrap();

        assert_eq!(store.get_flow("a b").await.unwrap().display_name, "Spaced");
        assert_eq!(store.get_flow("a_b").await.unwrap().display_name, "Underscored");
        store.next_batch("a b").await.unwrap();
        assert_eq!(store.get_flow("a_b").await.unwrap().current_batch_id(), 0);
    }

    #[tokio::test]
    async fn rotated_writes_keep_previous_version_as_backup() {
        let dir = tempdir().expect("tempdir");
        let docs = DocumentStore::new(dir.path());
        let rel = Path::new("a/doc.json");

        docs.write_json(rel, &vec![1], true).await.expect("first");
        docs.write_json(rel, &vec![1, 2], true).await.expect("second");

        let current: Vec<i32> = docs.read_json(rel).await.unwrap().unwrap();
        assert_eq!(current, vec![1, 2]);
        let backup = DocumentStore::backup_path(&dir.path().join(rel));
        let previous: Vec<i32> = serde_json::from_slice(&std::fs::read(backup).unwrap()).unwrap();
        assert_eq!(previous, vec![1]);

        let leftovers = std::fs::read_dir(dir.path().join("a"))
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn missing_primary_is_recovered_from_backup() {
        let dir = tempdir().expect("tempdir");
        let docs = DocumentStore::new(dir.path());
        let rel = Path::new("doc.json");
        docs.write_json(rel, &"old", true).await.unwrap();
        docs.write_json(rel, &"new", true).await.unwrap();
        // Crash window: primary renamed away, replacement never landed.
        std::fs::remove_file(dir.path().join(rel)).unwrap();

        let plain: Option<String> = docs.read_json(rel).await.unwrap();
        assert!(plain.is_none());
        let recovered: Option<String> = docs.read_json_or_backup(rel).await.unwrap();
        assert_eq!(recovered.as_deref(), Some("old"));
    }

    #[tokio::test]
    async fn flows_are_created_once() {
        let dir = tempdir().expect("tempdir");
        let store = FlowStore::new(dir.path());
        store.create_flow("policies", "Policies").await.unwrap();

        let err = store.create_flow("policies", "Again").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FlowError>(),
            Some(FlowError::AlreadyExists { .. })
        ));
        let missing = store.get_flow("assets").await.unwrap_err();
        assert!(matches!(
            missing.downcast_ref::<FlowError>(),
            Some(FlowError::FlowNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn batch_ids_survive_a_restart() {
        let dir = tempdir().expect("tempdir");
        let store = FlowStore::new(dir.path());
        store.create_flow("policies", "Policies").await.unwrap();
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(store.next_batch("policies").await.unwrap().batch_id);
        }
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);

        let reopened = FlowStore::new(dir.path());
        assert_eq!(reopened.next_batch("policies").await.unwrap().batch_id, 6);
    }

    #[tokio::test]
    async fn entity_registration_is_persisted_and_unique() {
        let dir = tempdir().expect("tempdir");
        let store = FlowStore::new(dir.path());
        store.create_flow("policies", "Policies").await.unwrap();
        store.register_entity::<Policy>("policies").await.unwrap();

        let flow = store.get_flow("policies").await.unwrap();
        assert!(flow.entity("policy").is_some());
        let err = store.register_entity::<Policy>("policies").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FlowError>(),
            Some(FlowError::AlreadyRegistered { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_ledger_is_empty_not_an_error() {
        let dir = tempdir().expect("tempdir");
        let store = LedgerStore::new(dir.path());
        let ledger: ConsumptionLedger = store.get("policies", "policy").await.unwrap();
        assert!(ledger.is_empty());
        assert_eq!(ledger.flow_code, "policies");
    }

    #[tokio::test]
    async fn ledgers_are_namespaced_by_entity_type() {
        let dir = tempdir().expect("tempdir");
        let store = LedgerStore::new(dir.path());
        let mut ledger: ConsumptionLedger = store.get("policies", "policy").await.unwrap();
        ledger.append(ConsumptionEntry {
            controller_name: "files".into(),
            flow_code: "policies".into(),
            batch_id: 1,
            address_id: "/in/a.csv".into(),
            date_processed: Utc::now(),
        });
        store.save(&ledger).await.unwrap();

        let same: ConsumptionLedger = store.get("policies", "policy").await.unwrap();
        assert!(same.has_been_processed("files", "/in/a.csv"));
        let other: ConsumptionLedger = store.get("policies", "stakeholder").await.unwrap();
        assert!(!other.has_been_processed("files", "/in/a.csv"));
    }

    #[tokio::test]
    async fn snapshots_are_addressable_by_batch_and_source() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        store.save(&snapshot(1, "/in/a.csv", &["P1"])).await.unwrap();
        store.save(&snapshot(2, "/in/b.csv", &["P2"])).await.unwrap();
        store.save(&snapshot(3, "/in/a.csv", &["P1", "P3"])).await.unwrap();

        assert_eq!(store.list("import", "policies").await.unwrap(), vec![1, 2, 3]);
        assert_eq!(
            store
                .batches_for_address("import", "policies", "/in/a.csv")
                .await
                .unwrap(),
            vec![1, 3]
        );
        let latest: Snapshot<Policy> = store
            .latest_for_address("import", "policies", "/in/a.csv")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.batch.batch_id, 3);
        assert_eq!(latest.output.len(), 2);

        let per_address: Vec<Snapshot<Policy>> =
            store.latest_per_address("import", "policies").await.unwrap();
        let ids: Vec<u64> = per_address.iter().map(|s| s.batch.batch_id).collect();
        assert_eq!(ids, vec![2, 3]);

        let none: Option<Snapshot<Policy>> = store.get("import", "policies", 9).await.unwrap();
        assert!(none.is_none());
    }
}
