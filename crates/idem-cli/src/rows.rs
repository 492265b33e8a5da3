//! Generic string-map records and the rules and enrichers configured for them.

use std::collections::BTreeMap;
use std::sync::Arc;

use idem_adapters::{CsvEnricher, JoinSpec};
use idem_core::{record_rule, FlowRecord, UniqueBy, Validator};
use idem_sync::{EnricherConfig, PipelineConfig};
use serde::{Deserialize, Serialize};

/// One input row keyed by column name. JSON inputs must carry string values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row(pub BTreeMap<String, String>);

impl Row {
    pub fn get(&self, field: &str) -> &str {
        self.0.get(field).map(String::as_str).unwrap_or("")
    }
}

impl FlowRecord for Row {
    const ENTITY_TYPE_ID: &'static str = "row";
}

pub fn validator(config: &PipelineConfig) -> Validator<Row> {
    let mut validator = Validator::new();
    if !config.required_fields.is_empty() {
        let fields = config.required_fields.clone();
        validator = validator.with_record_rule(record_rule("required-fields", move |row: &Row| {
            fields
                .iter()
                .filter(|f| row.get(f).trim().is_empty())
                .map(|f| format!("field `{f}` is required"))
                .collect()
        }));
    }
    if let Some(field) = config.unique_field.clone() {
        validator = validator.with_collection_rule(Arc::new(UniqueBy::new(
            format!("unique-{field}"),
            move |row: &Row| row.get(&field).trim().to_string(),
        )));
    }
    validator
}

pub fn csv_enricher(config: &EnricherConfig) -> CsvEnricher<Row, Row> {
    let part_key = config.part_key.clone();
    let whole_key = config.whole_key.clone();
    let key_column = config.part_key.clone();
    let fields = config.fields.clone();
    CsvEnricher::new(
        &config.id,
        &config.path,
        JoinSpec::new(
            move |part: &Row| part.get(&part_key).to_string(),
            move |whole: &Row| whole.get(&whole_key).to_string(),
            move |part: &Row, whole: &mut Row| merge_fields(part, whole, &fields, &key_column),
        ),
    )
}

/// Copy the selected non-blank columns of `part` onto `whole`, overwriting.
fn merge_fields(part: &Row, whole: &mut Row, fields: &[String], key_column: &str) {
    for (name, value) in &part.0 {
        let selected = if fields.is_empty() {
            name != key_column
        } else {
            fields.contains(name)
        };
        if selected && !value.trim().is_empty() {
            whole.0.insert(name.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use idem_adapters::Enricher;

    fn row(pairs: &[(&str, &str)]) -> Row {
        Row(pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect())
    }

    #[test]
    fn configured_rules_partition_rows() {
        let mut config = PipelineConfig::new("assets");
        config.required_fields = vec!["code".into(), "name".into()];
        config.unique_field = Some("code".into());
        let validator = validator(&config);

        let out = validator.partition(vec![
            row(&[("code", "A1"), ("name", "Pump")]),
            row(&[("code", "B2"), ("name", " ")]),
        ]);
        assert_eq!(out.valid.len(), 1);
        assert_eq!(out.errors[0].error_type(), "required-fields");
        assert_eq!(out.errors[0].message(), "field `name` is required");

        let out = validator.partition(vec![
            row(&[("code", "A1"), ("name", "Pump")]),
            row(&[("code", "a1"), ("name", "Valve")]),
        ]);
        assert!(out.valid.is_empty());
        assert_eq!(out.errors[0].error_type(), "unique-code");
    }

    #[test]
    fn merge_copies_selected_non_blank_columns() {
        let part = row(&[("asset_code", "A1"), ("owner", "Alice"), ("site", "")]);
        let mut whole = row(&[("code", "A1"), ("site", "North")]);
        merge_fields(&part, &mut whole, &[], "asset_code");
        assert_eq!(whole.get("owner"), "Alice");
        assert_eq!(whole.get("site"), "North");
        assert_eq!(whole.get("asset_code"), "");

        let mut only_site = row(&[("code", "A1")]);
        merge_fields(&part, &mut only_site, &["owner".to_string()], "asset_code");
        assert_eq!(only_site.0.len(), 2);
    }

    #[tokio::test]
    async fn configured_csv_enricher_joins_on_named_columns() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("owners.csv");
        std::fs::write(&path, "asset_code,owner\nA1,Alice\n").unwrap();
        let enricher = csv_enricher(&EnricherConfig {
            id: "owners".into(),
            path,
            part_key: "asset_code".into(),
            whole_key: "code".into(),
            fields: vec![],
        });

        let parts = enricher.get().await.unwrap();
        let mut whole = row(&[("code", "a1")]);
        let found = enricher.find(&parts, &whole);
        assert_eq!(found.len(), 1);
        enricher.enrich(&found[0], &mut whole);
        assert_eq!(whole.get("owner"), "Alice");
    }
}
