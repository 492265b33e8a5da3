//! Record readers and enrichment sources.
//!
//! Readers turn one input file into candidate records; enrichers supply "part" records that fill in
//! fields on "whole" target records. Both are injected as values, never discovered.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use idem_core::FlowRecord;
use serde::de::DeserializeOwned;
use thiserror::Error;

pub const CRATE_NAME: &str = "idem-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse CSV record #{row}: {source}")]
    Csv {
        row: usize,
        #[source]
        source: csv::Error,
    },
    #[error("parse JSON document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("parse JSONL line {line}: {source}")]
    JsonLine {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0}")]
    Message(String),
}

/// Reads the records of one input file.
#[async_trait]
pub trait RecordReader<T: Send>: Send + Sync {
    fn source_type(&self) -> &'static str;

    fn parse(&self, bytes: &[u8]) -> Result<Vec<T>, AdapterError>;

    async fn read(&self, path: &Path) -> Result<Vec<T>, AdapterError> {
        let bytes = tokio::fs::read(path).await.map_err(|source| AdapterError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.parse(&bytes)
    }
}

/// CSV with a header row; columns map onto fields by name.
#[derive(Debug, Clone, Copy)]
pub struct CsvReader<T> {
    has_headers: bool,
    delimiter: u8,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Default for CsvReader<T> {
    fn default() -> Self {
        Self {
            has_headers: true,
            delimiter: b',',
            _marker: PhantomData,
        }
    }
}

impl<T> CsvReader<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    pub fn without_headers(mut self) -> Self {
        self.has_headers = false;
        self
    }
}

impl<T: DeserializeOwned + Send> RecordReader<T> for CsvReader<T> {
    fn source_type(&self) -> &'static str {
        "csv"
    }

    fn parse(&self, bytes: &[u8]) -> Result<Vec<T>, AdapterError> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(self.has_headers)
            .delimiter(self.delimiter)
            .trim(csv::Trim::All)
            .from_reader(bytes);
        let mut out = Vec::new();
        for (i, rec) in rdr.deserialize::<T>().enumerate() {
            out.push(rec.map_err(|source| AdapterError::Csv { row: i + 1, source })?);
        }
        Ok(out)
    }
}

/// A single JSON array of records. A blank file holds no records.
#[derive(Debug, Clone, Copy)]
pub struct JsonArrayReader<T>(PhantomData<fn() -> T>);

impl<T> Default for JsonArrayReader<T> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<T: DeserializeOwned + Send> RecordReader<T> for JsonArrayReader<T> {
    fn source_type(&self) -> &'static str {
        "json"
    }

    fn parse(&self, bytes: &[u8]) -> Result<Vec<T>, AdapterError> {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Newline-delimited JSON; blank lines are skipped.
#[derive(Debug, Clone, Copy)]
pub struct JsonLinesReader<T>(PhantomData<fn() -> T>);

impl<T> Default for JsonLinesReader<T> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<T: DeserializeOwned + Send> RecordReader<T> for JsonLinesReader<T> {
    fn source_type(&self) -> &'static str {
        "jsonl"
    }

    fn parse(&self, bytes: &[u8]) -> Result<Vec<T>, AdapterError> {
        let text = std::str::from_utf8(bytes).map_err(|e| AdapterError::Message(e.to_string()))?;
        let mut out = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let value = serde_json::from_str(line)
                .map_err(|source| AdapterError::JsonLine { line: idx + 1, source })?;
            out.push(value);
        }
        Ok(out)
    }
}

/// Pick a reader from the file extension.
pub fn reader_for_path<T>(path: &Path) -> Option<Arc<dyn RecordReader<T>>>
where
    T: DeserializeOwned + Send + 'static,
{
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "csv" => Some(Arc::new(CsvReader::<T>::new())),
        "tsv" => Some(Arc::new(CsvReader::<T>::new().with_delimiter(b'\t'))),
        "json" => Some(Arc::new(JsonArrayReader::<T>::default())),
        "jsonl" | "ndjson" => Some(Arc::new(JsonLinesReader::<T>::default())),
        _ => None,
    }
}

/// Supplies part records for whole records of type `W`.
#[async_trait]
pub trait Enricher<W>: Send + Sync + 'static {
    type Part: FlowRecord;

    /// Stable identity used as the enrichment ledger key.
    fn unique_id(&self) -> &str;

    fn source_entity_type(&self) -> &str {
        <Self::Part as FlowRecord>::ENTITY_TYPE_ID
    }

    fn address_id(&self) -> &str;

    async fn get(&self) -> Result<Vec<Self::Part>, AdapterError>;

    fn find(&self, parts: &[Self::Part], whole: &W) -> Vec<Self::Part>;

    /// Copy the enricher's field set from `part` into `whole`.
    fn enrich(&self, part: &Self::Part, whole: &mut W);
}

type KeyFn<T> = Box<dyn Fn(&T) -> String + Send + Sync>;
type MergeFn<P, W> = Box<dyn Fn(&P, &mut W) + Send + Sync>;

/// Natural-key join between parts and wholes plus the fixed field copy.
pub struct JoinSpec<P, W> {
    part_key: KeyFn<P>,
    whole_key: KeyFn<W>,
    merge: MergeFn<P, W>,
}

impl<P, W> JoinSpec<P, W> {
    pub fn new(
        part_key: impl Fn(&P) -> String + Send + Sync + 'static,
        whole_key: impl Fn(&W) -> String + Send + Sync + 'static,
        merge: impl Fn(&P, &mut W) + Send + Sync + 'static,
    ) -> Self {
        Self {
            part_key: Box::new(part_key),
            whole_key: Box::new(whole_key),
            merge: Box::new(merge),
        }
    }

    /// Parts whose key equals the whole's key, ignoring case and surrounding whitespace.
    pub fn find(&self, parts: &[P], whole: &W) -> Vec<P>
    where
        P: Clone,
    {
        let key = (self.whole_key)(whole).trim().to_lowercase();
        if key.is_empty() {
            return Vec::new();
        }
        parts
            .iter()
            .filter(|p| (self.part_key)(p).trim().to_lowercase() == key)
            .cloned()
            .collect()
    }

    pub fn merge(&self, part: &P, whole: &mut W) {
        (self.merge)(part, whole)
    }
}

/// Parts read from a CSV file on every pass.
pub struct CsvEnricher<P, W> {
    id: String,
    path: PathBuf,
    address_id: String,
    reader: CsvReader<P>,
    join: JoinSpec<P, W>,
}

impl<P, W> CsvEnricher<P, W> {
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>, join: JoinSpec<P, W>) -> Self {
        let path = path.into();
        let address_id = std::path::absolute(&path)
            .unwrap_or_else(|_| path.clone())
            .display()
            .to_string();
        Self {
            id: id.into(),
            path,
            address_id,
            reader: CsvReader::new(),
            join,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl<P, W> Enricher<W> for CsvEnricher<P, W>
where
    P: FlowRecord,
    W: Send + Sync + 'static,
{
    type Part = P;

    fn unique_id(&self) -> &str {
        &self.id
    }

    fn address_id(&self) -> &str {
        &self.address_id
    }

    async fn get(&self) -> Result<Vec<P>, AdapterError> {
        self.reader.read(&self.path).await
    }

    fn find(&self, parts: &[P], whole: &W) -> Vec<P> {
        self.join.find(parts, whole)
    }

    fn enrich(&self, part: &P, whole: &mut W) {
        self.join.merge(part, whole)
    }
}

/// Parts held in memory, e.g. produced by an earlier stage.
pub struct InMemoryEnricher<P, W> {
    id: String,
    address_id: String,
    parts: Vec<P>,
    join: JoinSpec<P, W>,
}

impl<P, W> InMemoryEnricher<P, W> {
    pub fn new(id: impl Into<String>, parts: Vec<P>, join: JoinSpec<P, W>) -> Self {
        let id = id.into();
        Self {
            address_id: format!("memory:{id}"),
            id,
            parts,
            join,
        }
    }
}

#[async_trait]
impl<P, W> Enricher<W> for InMemoryEnricher<P, W>
where
    P: FlowRecord,
    W: Send + Sync + 'static,
{
    type Part = P;

    fn unique_id(&self) -> &str {
        &self.id
    }

    fn address_id(&self) -> &str {
        &self.address_id
    }

    async fn get(&self) -> Result<Vec<P>, AdapterError> {
        Ok(self.parts.clone())
    }

    fn find(&self, parts: &[P], whole: &W) -> Vec<P> {
        self.join.find(parts, whole)
    }

    fn enrich(&self, part: &P, whole: &mut W) {
        self.join.merge(part, whole)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Stakeholder {
        asset_code: String,
        name: String,
    }

    impl FlowRecord for Stakeholder {
        const ENTITY_TYPE_ID: &'static str = "stakeholder";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Asset {
        code: String,
        #[serde(default)]
        owner: Option<String>,
    }

    fn owner_join() -> JoinSpec<Stakeholder, Asset> {
        JoinSpec::new(
            |s: &Stakeholder| s.asset_code.clone(),
            |a: &Asset| a.code.clone(),
            |s: &Stakeholder, a: &mut Asset| a.owner = Some(s.name.clone()),
        )
    }

    #[test]
    fn csv_rows_map_onto_fields_by_header() {
        let rows: Vec<Asset> = CsvReader::new()
            .parse(b"code,owner\nA1, alice \nB2,\n")
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].owner.as_deref(), Some("alice"));
        assert_eq!(rows[1].owner, None);
    }

    #[test]
    fn csv_errors_name_the_failing_record() {
        #[derive(Debug, Deserialize)]
        #[allow(dead_code)]
        struct Numbered {
            n: u32,
        }
        let err = CsvReader::<Numbered>::new()
            .parse(b"n\n1\nnot-a-number\n")
            .unwrap_err();
        assert!(matches!(err, AdapterError::Csv { row: 2, .. }));
    }

    #[test]
    fn json_readers_accept_arrays_and_lines() {
        let arr: Vec<Asset> = JsonArrayReader::default()
            .parse(br#"[{"code":"A1"},{"code":"B2","owner":"bob"}]"#)
            .unwrap();
        assert_eq!(arr.len(), 2);
        let blank: Vec<Asset> = JsonArrayReader::default().parse(b"  \n").unwrap();
        assert!(blank.is_empty());

        let lines: Vec<Asset> = JsonLinesReader::default()
            .parse(b"{\"code\":\"A1\"}\n\n{\"code\":\"B2\"}\n")
            .unwrap();
        assert_eq!(lines.len(), 2);
        let err = JsonLinesReader::<Asset>::default()
            .parse(b"{\"code\":\"A1\"}\n{broken\n")
            .unwrap_err();
        assert!(matches!(err, AdapterError::JsonLine { line: 2, .. }));
    }

    #[test]
    fn readers_are_chosen_by_extension() {
        assert_eq!(
            reader_for_path::<Asset>(Path::new("in/a.CSV")).map(|r| r.source_type()),
            Some("csv")
        );
        assert_eq!(
            reader_for_path::<Asset>(Path::new("in/a.ndjson")).map(|r| r.source_type()),
            Some("jsonl")
        );
        assert!(reader_for_path::<Asset>(Path::new("in/a.xlsx")).is_none());
    }

    #[tokio::test]
    async fn in_memory_enricher_joins_case_insensitively() {
        let enricher = InMemoryEnricher::new(
            "owners",
            vec![
                Stakeholder {
                    asset_code: "a1".into(),
                    name: "Alice".into(),
                },
                Stakeholder {
                    asset_code: "C3".into(),
                    name: "Carol".into(),
                },
            ],
            owner_join(),
        );
        assert_eq!(enricher.address_id(), "memory:owners");
        assert_eq!(enricher.source_entity_type(), "stakeholder");

        let parts = enricher.get().await.unwrap();
        let mut asset = Asset {
            code: " A1 ".into(),
            owner: None,
        };
        let found = enricher.find(&parts, &asset);
        assert_eq!(found.len(), 1);
        enricher.enrich(&found[0], &mut asset);
        assert_eq!(asset.owner.as_deref(), Some("Alice"));

        let blank = Asset {
            code: "".into(),
            owner: None,
        };
        assert!(enricher.find(&parts, &blank).is_empty());
    }

    #[tokio::test]
    async fn csv_enricher_reads_parts_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("owners.csv");
        std::fs::write(&path, "asset_code,name\nB2,Bob\n").unwrap();

        let enricher = CsvEnricher::new("owners-csv", &path, owner_join());
        assert!(enricher.address_id().ends_with("owners.csv"));
        let parts = enricher.get().await.unwrap();
        assert_eq!(parts.len(), 1);

        let asset = Asset {
            code: "b2".into(),
            owner: None,
        };
        assert_eq!(enricher.find(&parts, &asset)[0].name, "Bob");

        let missing = CsvEnricher::new("gone", dir.path().join("nope.csv"), owner_join());
        assert!(matches!(missing.get().await, Err(AdapterError::Io { .. })));
    }
}
