//! Source-record → destination-row mapping, identifier derivation, and key collapsing.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use synapse_core::{CollapsedDuplicate, Identifier, IdentifierRule, Record, RejectedRecord};

/// Per-record reshaping applied before the identifier is derived.
pub trait TransformHook: Send + Sync {
    fn apply(&self, record: Record) -> anyhow::Result<Record>;
}

#[derive(Default)]
pub struct NoopTransformHook;

impl TransformHook for NoopTransformHook {
    fn apply(&self, record: Record) -> anyhow::Result<Record> {
        Ok(record)
    }
}

impl<F> TransformHook for F
where
    F: Fn(Record) -> anyhow::Result<Record> + Send + Sync,
{
    fn apply(&self, record: Record) -> anyhow::Result<Record> {
        self(record)
    }
}

/// Declarative field mapping from a job manifest.
///
/// Order of application: `rename`, `drop`, identifier derivation, the
/// `keep`/`payload_column` split, then `constants`. Key columns always stay
/// top-level. With `payload_column` set, every non-kept field is nested into
/// that column; with only `keep` set, non-kept fields are discarded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    #[serde(default)]
    pub rename: BTreeMap<String, String>,
    #[serde(default)]
    pub drop: Vec<String>,
    #[serde(default)]
    pub keep: Option<Vec<String>>,
    #[serde(default)]
    pub payload_column: Option<String>,
    #[serde(default)]
    pub constants: BTreeMap<String, Value>,
}

impl FieldMapping {
    fn shape(&self, mut record: Record, key_columns: &[String]) -> Record {
        if self.keep.is_none() && self.payload_column.is_none() {
            record.extend(self.constants.clone());
            return record;
        }

        let kept = |field: &str| {
            key_columns.iter().any(|c| c == field)
                || self
                    .keep
                    .as_ref()
                    .is_some_and(|keep| keep.iter().any(|k| k == field))
        };

        let mut top = Record::new();
        let mut payload = Record::new();
        for (field, value) in std::mem::take(&mut record) {
            if kept(&field) {
                top.insert(field, value);
            } else {
                payload.insert(field, value);
            }
        }
        if let Some(column) = &self.payload_column {
            top.insert(column.clone(), Value::Object(payload));
        }
        top.extend(self.constants.clone());
        top
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransformOutput {
    pub source_records: usize,
    /// Distinct destination rows, in first-occurrence order.
    pub records: Vec<Record>,
    pub identifiers: Vec<Identifier>,
    pub collapsed: Vec<CollapsedDuplicate>,
    pub rejected: Vec<RejectedRecord>,
}

/// Pure mapping of a full source list; the same input always yields the same output.
pub struct Transformer<'a> {
    rule: &'a IdentifierRule,
    mapping: &'a FieldMapping,
    hook: &'a dyn TransformHook,
}

impl<'a> Transformer<'a> {
    pub fn new(
        rule: &'a IdentifierRule,
        mapping: &'a FieldMapping,
        hook: &'a dyn TransformHook,
    ) -> Self {
        Self {
            rule,
            mapping,
            hook,
        }
    }

    pub fn transform_one(&self, record: Record) -> Result<(Identifier, Record), String> {
        let mut record = self.hook.apply(record).map_err(|err| format!("{err:#}"))?;
        for (from, to) in &self.mapping.rename {
            if let Some(value) = record.remove(from) {
                record.insert(to.clone(), value);
            }
        }
        for field in &self.mapping.drop {
            record.remove(field);
        }
        let identifier = self.rule.apply(&mut record).map_err(|err| err.to_string())?;
        let shaped = self.mapping.shape(record, &self.rule.key_columns());
        Ok((identifier, shaped))
    }

    /// Records sharing an identifier collapse into one row: the last one wins,
    /// placed at the first occurrence's position.
    pub fn transform(&self, source: Vec<Record>) -> TransformOutput {
        let mut out = TransformOutput {
            source_records: source.len(),
            ..Default::default()
        };
        let mut positions: HashMap<Identifier, usize> = HashMap::new();
        let mut occurrences: BTreeMap<Identifier, Vec<usize>> = BTreeMap::new();

        for (source_index, record) in source.into_iter().enumerate() {
            match self.transform_one(record) {
                Ok((identifier, shaped)) => {
                    occurrences
                        .entry(identifier.clone())
                        .or_default()
                        .push(source_index);
                    match positions.get(&identifier) {
                        Some(&position) => out.records[position] = shaped,
                        None => {
                            positions.insert(identifier.clone(), out.records.len());
                            out.records.push(shaped);
                            out.identifiers.push(identifier);
                        }
                    }
                }
                Err(reason) => out.rejected.push(RejectedRecord {
                    source_index,
                    reason,
                }),
            }
        }

        out.collapsed = occurrences
            .into_iter()
            .filter(|(_, indexes)| indexes.len() > 1)
            .map(|(key, source_indexes)| CollapsedDuplicate {
                key: key.to_string(),
                source_indexes,
            })
            .collect();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().cloned().expect("object literal")
    }

    fn slug_rule() -> IdentifierRule {
        IdentifierRule::Slug {
            from: "name".into(),
            column: "slug".into(),
        }
    }

    #[test]
    fn mapping_renames_nests_payload_and_adds_constants() {
        let mapping = FieldMapping {
            rename: BTreeMap::from([("displayName".to_string(), "name".to_string())]),
            drop: vec!["internal_note".into()],
            keep: Some(vec!["name".into()]),
            payload_column: Some("profile_data".into()),
            constants: BTreeMap::from([("is_active".to_string(), json!(true))]),
        };
        let rule = slug_rule();
        let transformer = Transformer::new(&rule, &mapping, &NoopTransformHook);
        let (id, row) = transformer
            .transform_one(record(json!({
                "displayName": "Tax Preparation",
                "internal_note": "x",
                "headline": "File faster",
                "scores": {"seo": 3}
            })))
            .expect("transform");

        assert_eq!(id.to_string(), "tax-preparation");
        assert_eq!(
            row,
            record(json!({
                "name": "Tax Preparation",
                "slug": "tax-preparation",
                "is_active": true,
                "profile_data": {"headline": "File faster", "scores": {"seo": 3}}
            }))
        );
    }

    #[test]
    fn mapping_without_keep_or_payload_passes_fields_through() {
        let rule = IdentifierRule::Natural {
            columns: vec!["code".into()],
        };
        let mapping = FieldMapping::default();
        let transformer = Transformer::new(&rule, &mapping, &NoopTransformHook);
        let (_, row) = transformer
            .transform_one(record(json!({"code": "541211", "title": "CPAs"})))
            .expect("transform");
        assert_eq!(row, record(json!({"code": "541211", "title": "CPAs"})));
    }

    #[test]
    fn duplicate_slugs_collapse_last_write_wins_at_first_position() {
        let rule = slug_rule();
        let mapping = FieldMapping::default();
        let transformer = Transformer::new(&rule, &mapping, &NoopTransformHook);
        let out = transformer.transform(vec![
            record(json!({"name": "Tax Preparation", "v": 1})),
            record(json!({"name": "Dentist", "v": 2})),
            record(json!({"name": "tax-preparation", "v": 3})),
        ]);

        assert_eq!(out.source_records, 3);
        assert_eq!(out.records.len(), 2);
        assert_eq!(out.records[0]["v"], json!(3));
        assert_eq!(out.records[0]["name"], json!("tax-preparation"));
        assert_eq!(out.records[1]["v"], json!(2));
        assert_eq!(
            out.collapsed,
            vec![CollapsedDuplicate {
                key: "tax-preparation".into(),
                source_indexes: vec![0, 2],
            }]
        );
    }

    #[test]
    fn unusable_records_are_rejected_not_fatal() {
        let rule = slug_rule();
        let mapping = FieldMapping::default();
        let hook = |record: Record| -> anyhow::Result<Record> {
            if record.contains_key("poison") {
                anyhow::bail!("poisoned record");
            }
            Ok(record)
        };
        let transformer = Transformer::new(&rule, &mapping, &hook);
        let out = transformer.transform(vec![
            record(json!({"name": "Dentist"})),
            record(json!({"title": "no name"})),
            record(json!({"name": "--"})),
            record(json!({"name": "Plumber", "poison": true})),
        ]);
        assert_eq!(out.records.len(), 1);
        let rejected: Vec<_> = out.rejected.iter().map(|r| r.source_index).collect();
        assert_eq!(rejected, vec![1, 2, 3]);
        assert!(out.rejected[2].reason.contains("poisoned"));
    }

    #[test]
    fn transform_is_deterministic() {
        let rule = slug_rule();
        let mapping = FieldMapping {
            payload_column: Some("data".into()),
            ..Default::default()
        };
        let transformer = Transformer::new(&rule, &mapping, &NoopTransformHook);
        let input = vec![
            record(json!({"name": "A & B Consulting", "x": 1})),
            record(json!({"name": "Roofing", "y": [1, 2]})),
        ];
        let first = transformer.transform(input.clone());
        let second = transformer.transform(input);
        assert_eq!(first.records, second.records);
        assert_eq!(first.identifiers, second.identifiers);
        assert_eq!(first.records[0]["slug"], json!("a-b-consulting"));
        assert_eq!(first.records[0]["data"], json!({"name": "A & B Consulting", "x": 1}));
    }
}
