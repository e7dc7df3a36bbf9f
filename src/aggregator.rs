use crate::job::{ResultRecord, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

/// Where the current value of a field came from. Ordering on
/// `(score, submitted_at, source_job_id)` decides conflicts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSource {
    pub score: usize,
    pub submitted_at: Timestamp,
    pub source_job_id: String,
}

impl FieldSource {
    fn rank(&self, other: &FieldSource) -> Ordering {
        self.score
            .cmp(&other.score)
            .then(self.submitted_at.cmp(&other.submitted_at))
            .then_with(|| self.source_job_id.cmp(&other.source_job_id))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedEntity {
    pub entity_key: String,
    pub fields: BTreeMap<String, Value>,
    pub provenance: BTreeMap<String, FieldSource>,
    pub source_job_ids: BTreeSet<String>,
    pub first_seen_at: Timestamp,
    pub updated_at: Timestamp,
}

impl AggregatedEntity {
    fn from_record(record: ResultRecord) -> Self {
        let source = source_of(&record);
        let mut fields = BTreeMap::new();
        let mut provenance = BTreeMap::new();
        for (name, value) in record.fields {
            if is_empty_value(&value) {
                continue;
            }
            provenance.insert(name.clone(), source.clone());
            fields.insert(name, value);
        }
        Self {
            entity_key: record.entity_key,
            fields,
            provenance,
            source_job_ids: BTreeSet::from([record.source_job_id]),
            first_seen_at: record.submitted_at,
            updated_at: record.submitted_at,
        }
    }

    /// Number of populated fields.
    pub fn completeness(&self) -> usize {
        self.fields.len()
    }

    fn absorb(&mut self, record: ResultRecord) {
        let incoming = source_of(&record);
        for (name, value) in record.fields {
            if is_empty_value(&value) {
                continue;
            }
            match self.provenance.get(&name) {
                None => {
                    self.fields.insert(name.clone(), value);
                    self.provenance.insert(name, incoming.clone());
                }
                Some(existing) if incoming.rank(existing) == Ordering::Greater => {
                    self.fields.insert(name.clone(), value);
                    self.provenance.insert(name, incoming.clone());
                }
                Some(_) => {}
            }
        }
        self.source_job_ids.insert(record.source_job_id);
        self.first_seen_at = self.first_seen_at.min(record.submitted_at);
        self.updated_at = self.updated_at.max(record.submitted_at);
    }
}

/// JSON null, blank strings, and empty arrays or objects count as missing.
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

pub fn completeness_score(fields: &Map<String, Value>) -> usize {
    fields.values().filter(|v| !is_empty_value(v)).count()
}

fn source_of(record: &ResultRecord) -> FieldSource {
    FieldSource {
        score: completeness_score(&record.fields),
        submitted_at: record.submitted_at,
        source_job_id: record.source_job_id.clone(),
    }
}

/// One canonical record per entity key, merged from every accepted result.
///
/// Each field holds the value from the highest-ranked record that populated it,
/// so the merged entity does not depend on the order results arrive in.
#[derive(Debug, Default)]
pub struct ResultAggregator {
    entities: BTreeMap<String, AggregatedEntity>,
    merged: u64,
}

impl ResultAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge(&mut self, entity_key: &str, mut result: ResultRecord) -> &AggregatedEntity {
        result.entity_key = entity_key.to_string();
        self.merged += 1;
        match self.entities.entry(entity_key.to_string()) {
            std::collections::btree_map::Entry::Vacant(slot) => {
                tracing::debug!(entity_key, "creating aggregated entity");
                slot.insert(AggregatedEntity::from_record(result))
            }
            std::collections::btree_map::Entry::Occupied(slot) => {
                let entity = slot.into_mut();
                let before = entity.completeness();
                entity.absorb(result);
                tracing::debug!(entity_key, before, after = entity.completeness(), "merged result");
                entity
            }
        }
    }

    pub fn get(&self, entity_key: &str) -> Option<&AggregatedEntity> {
        self.entities.get(entity_key)
    }

    pub fn contains(&self, entity_key: &str) -> bool {
        self.entities.contains_key(entity_key)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Results merged since this aggregator was created or restored.
    pub fn merged_count(&self) -> u64 {
        self.merged
    }

    /// Entities ordered by key.
    pub fn entities(&self) -> impl Iterator<Item = &AggregatedEntity> {
        self.entities.values()
    }

    pub fn snapshot(&self) -> Vec<AggregatedEntity> {
        self.entities.values().cloned().collect()
    }

    pub fn restore(&mut self, entities: Vec<AggregatedEntity>) {
        self.entities = entities
            .into_iter()
            .map(|entity| (entity.entity_key.clone(), entity))
            .collect();
        self.merged = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(job: &str, at: Timestamp, fields: Value) -> ResultRecord {
        let Value::Object(fields) = fields else {
            panic!("fields must be an object");
        };
        ResultRecord {
            entity_key: "K".to_string(),
            fields,
            submitted_at: at,
            source_job_id: job.to_string(),
        }
    }

    #[test]
    fn test_first_result_creates_entity() {
        let mut agg = ResultAggregator::new();
        let entity = agg.merge("K", record("K::a", 1, json!({"name": "Clinic", "phone": "", "rating": 4.5})));
        assert_eq!(entity.completeness(), 2);
        assert!(!entity.fields.contains_key("phone"));
        assert_eq!(agg.len(), 1);
    }

    #[test]
    fn test_more_complete_record_wins_conflicts() {
        let mut agg = ResultAggregator::new();
        agg.merge("K", record("K::b", 10, json!({"name": "Old Name", "a": 1, "b": 2})));
        agg.merge("K", record("K::a", 5, json!({"name": "Full Name", "a": 1, "b": 2, "c": 3, "d": 4})));

        let entity = agg.get("K").unwrap();
        assert_eq!(entity.fields["name"], json!("Full Name"));
        assert_eq!(entity.completeness(), 5);
    }

    #[test]
    fn test_tie_goes_to_most_recent() {
        let mut agg = ResultAggregator::new();
        agg.merge("K", record("K::b", 20, json!({"name": "Newer"})));
        agg.merge("K", record("K::a", 10, json!({"name": "Older"})));
        assert_eq!(agg.get("K").unwrap().fields["name"], json!("Newer"));
    }

    #[test]
    fn test_never_replaces_value_with_empty() {
        let mut agg = ResultAggregator::new();
        agg.merge("K", record("K::a", 1, json!({"name": "Clinic", "address": "Seoul"})));
        agg.merge("K", record("K::b", 2, json!({"name": null, "address": "  ", "hours": "9-5", "x": 1, "y": 2})));

        let entity = agg.get("K").unwrap();
        assert_eq!(entity.fields["name"], json!("Clinic"));
        assert_eq!(entity.fields["address"], json!("Seoul"));
        assert_eq!(entity.fields["hours"], json!("9-5"));
        assert_eq!(entity.source_job_ids.len(), 2);
    }

    #[test]
    fn test_merge_order_independent() {
        let records = vec![
            record("K::a", 3, json!({"name": "A", "phone": "1"})),
            record("K::b", 1, json!({"name": "B", "phone": "2", "site": "b.example"})),
            record("K::c", 2, json!({"name": "C", "hours": [], "site": "c.example", "rating": 3})),
            record("K::d", 3, json!({"name": "D", "phone": "4"})),
        ];

        let orders: Vec<Vec<usize>> = vec![
            vec![0, 1, 2, 3],
            vec![3, 2, 1, 0],
            vec![2, 0, 3, 1],
            vec![1, 3, 0, 2],
        ];

        let mut merged: Vec<AggregatedEntity> = Vec::new();
        for order in orders {
            let mut agg = ResultAggregator::new();
            for i in order {
                agg.merge("K", records[i].clone());
            }
            merged.push(agg.get("K").unwrap().clone());
        }
        for entity in &merged[1..] {
            assert_eq!(entity, &merged[0]);
        }
        // b and c tie on score 3; c is more recent
        assert_eq!(merged[0].fields["name"], json!("C"));
        // only a, b and d carry phone; b outranks both on score
        assert_eq!(merged[0].fields["phone"], json!("2"));
    }

    #[test]
    fn test_snapshot_restore() {
        let mut agg = ResultAggregator::new();
        agg.merge("K", record("K::a", 1, json!({"name": "Clinic"})));
        let snapshot = agg.snapshot();

        let mut restored = ResultAggregator::new();
        restored.restore(snapshot);
        assert_eq!(restored.get("K"), agg.get("K"));
        assert_eq!(restored.merged_count(), 0);
    }
}
