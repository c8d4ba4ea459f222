//! Incrementally maintained group-by aggregation views

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::changes::{ChangeEvent, ChangeOperation};
use crate::query::Filter;
use crate::types::{Document, DocumentId, Value};

/// Aggregation function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateKind {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    First,
    Last,
}

/// One aggregation column: a kind plus the field it reads (count needs
/// none; first/last without a field yield the document id)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateSpec {
    pub kind: AggregateKind,
    pub field: Option<String>,
}

impl AggregateSpec {
    pub fn count() -> Self {
        Self {
            kind: AggregateKind::Count,
            field: None,
        }
    }

    pub fn of(kind: AggregateKind, field: impl Into<String>) -> Self {
        Self {
            kind,
            field: Some(field.into()),
        }
    }
}

/// Definition of a computed (group-by) view
#[derive(Debug, Clone)]
pub struct ComputedViewDefinition {
    pub name: String,
    pub collection: String,
    pub filter: Option<Filter>,
    /// Field path grouped on; `None` collapses everything into one group
    pub group_by: Option<String>,
    /// alias → aggregation, ordered so rows render deterministically
    pub aggregations: BTreeMap<String, AggregateSpec>,
}

impl ComputedViewDefinition {
    pub fn new(name: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            collection: collection.into(),
            filter: None,
            group_by: None,
            aggregations: BTreeMap::new(),
        }
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn group_by(mut self, field: impl Into<String>) -> Self {
        self.group_by = Some(field.into());
        self
    }

    pub fn aggregate(mut self, alias: impl Into<String>, spec: AggregateSpec) -> Self {
        self.aggregations.insert(alias.into(), spec);
        self
    }

    fn matches(&self, doc: &Document) -> bool {
        !doc.deleted && self.filter.as_ref().map(|f| f.matches(doc)).unwrap_or(true)
    }

    fn key_of(&self, doc: &Document) -> Value {
        match &self.group_by {
            Some(path) => doc.field(path).cloned().unwrap_or(Value::Null),
            None => Value::Null,
        }
    }
}

/// One result row of a computed view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupRow {
    pub key: Value,
    pub values: BTreeMap<String, Value>,
}

/// Changed and dropped rows produced by one change event
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComputedDelta {
    pub changed: Vec<GroupRow>,
    pub removed: Vec<Value>,
}

impl ComputedDelta {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug)]
struct Member {
    order: u64,
    doc: Document,
}

#[derive(Debug)]
struct GroupState {
    key: Value,
    members: HashMap<DocumentId, Member>,
}

impl GroupState {
    fn new(key: Value) -> Self {
        Self {
            key,
            members: HashMap::new(),
        }
    }

    fn row(&self, def: &ComputedViewDefinition) -> GroupRow {
        let mut values = BTreeMap::new();
        for (alias, spec) in &def.aggregations {
            values.insert(alias.clone(), self.aggregate(spec));
        }
        GroupRow {
            key: self.key.clone(),
            values,
        }
    }

    fn aggregate(&self, spec: &AggregateSpec) -> Value {
        match spec.kind {
            AggregateKind::Count => Value::Int(self.members.len() as i64),
            AggregateKind::Sum => Value::Float(self.numeric_values(spec).sum()),
            AggregateKind::Avg => {
                let values: Vec<f64> = self.numeric_values(spec).collect();
                if values.is_empty() {
                    Value::Null
                } else {
                    Value::Float(values.iter().sum::<f64>() / values.len() as f64)
                }
            }
            AggregateKind::Min => self
                .field_values(spec)
                .min_by(|a, b| crate::types::compare_values(Some(a), Some(b)))
                .cloned()
                .unwrap_or(Value::Null),
            AggregateKind::Max => self
                .field_values(spec)
                .max_by(|a, b| crate::types::compare_values(Some(a), Some(b)))
                .cloned()
                .unwrap_or(Value::Null),
            AggregateKind::First => self.boundary_value(spec, false),
            AggregateKind::Last => self.boundary_value(spec, true),
        }
    }

    fn numeric_values<'a>(&'a self, spec: &'a AggregateSpec) -> impl Iterator<Item = f64> + 'a {
        self.members.values().filter_map(move |m| {
            spec.field
                .as_deref()
                .and_then(|f| m.doc.field(f))
                .and_then(Value::as_f64)
        })
    }

    fn field_values<'a>(&'a self, spec: &'a AggregateSpec) -> impl Iterator<Item = &'a Value> + 'a {
        self.members
            .values()
            .filter_map(move |m| spec.field.as_deref().and_then(|f| m.doc.field(f)))
    }

    fn boundary_value(&self, spec: &AggregateSpec, last: bool) -> Value {
        let member = if last {
            self.members.values().max_by_key(|m| m.order)
        } else {
            self.members.values().min_by_key(|m| m.order)
        };
        match member {
            None => Value::Null,
            Some(m) => match spec.field.as_deref() {
                Some(field) => m.doc.field(field).cloned().unwrap_or(Value::Null),
                None => Value::String(m.doc.id.clone()),
            },
        }
    }
}

/// Materialized group-by state
#[derive(Debug)]
pub struct ComputedState {
    groups: HashMap<String, GroupState>,
    /// Monotonic insertion order backing first/last
    order: u64,
}

impl Default for ComputedState {
    fn default() -> Self {
        Self {
            groups: HashMap::new(),
            order: 0,
        }
    }
}

/// Canonical key string; objects serialize with sorted fields so equal
/// keys always collide
fn canonical_key(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

pub(crate) fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Int(i) => out.push_str(&i.to_string()),
        Value::Float(f) => out.push_str(&format!("{f:?}")),
        Value::String(s) => {
            out.push('"');
            out.push_str(s);
            out.push('"');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push('"');
                out.push_str(key);
                out.push_str("\":");
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
    }
}

impl ComputedState {
    /// Seed from the current matching documents
    pub fn seed(&mut self, def: &ComputedViewDefinition, docs: Vec<Document>) {
        self.groups.clear();
        for doc in docs {
            if def.matches(&doc) {
                self.add_member(def, doc);
            }
        }
    }

    /// Current rows, ordered by canonical key for stable output. Empty
    /// groups never appear.
    pub fn rows(&self, def: &ComputedViewDefinition) -> Vec<GroupRow> {
        let mut keyed: Vec<(&String, &GroupState)> = self
            .groups
            .iter()
            .filter(|(_, g)| !g.members.is_empty())
            .collect();
        keyed.sort_by(|a, b| a.0.cmp(b.0));
        keyed.into_iter().map(|(_, g)| g.row(def)).collect()
    }

    /// Apply one change event; `None` when no accumulated value moved
    pub fn apply(
        &mut self,
        def: &ComputedViewDefinition,
        event: &ChangeEvent,
    ) -> Option<ComputedDelta> {
        let id = &event.document_id;
        let old_key = self.find_member_group(id);
        let incoming = match event.operation {
            ChangeOperation::Delete => None,
            _ => event.document.as_ref().filter(|d| def.matches(d)),
        };
        let new_key = incoming.map(|d| canonical_key(&def.key_of(d)));

        let mut delta = ComputedDelta::default();
        match (old_key, new_key) {
            (None, None) => return None,
            (None, Some(key)) => {
                let before = self.row_snapshot(def, &key);
                self.add_member(def, incoming.unwrap().clone());
                self.collect_row_change(def, &key, before, &mut delta);
            }
            (Some(key), None) => {
                let before = self.row_snapshot(def, &key);
                self.drop_member(&key, id);
                self.collect_row_change(def, &key, before, &mut delta);
            }
            (Some(old), Some(new)) if old == new => {
                let before = self.row_snapshot(def, &old);
                let group = self.groups.get_mut(&old).expect("member group exists");
                let member = group.members.get_mut(id).expect("member exists");
                member.doc = incoming.unwrap().clone();
                self.collect_row_change(def, &old, before, &mut delta);
            }
            (Some(old), Some(new)) => {
                // Group-key change: delete from the old group, insert into
                // the new one.
                let before_old = self.row_snapshot(def, &old);
                let before_new = self.row_snapshot(def, &new);
                self.drop_member(&old, id);
                self.add_member(def, incoming.unwrap().clone());
                self.collect_row_change(def, &old, before_old, &mut delta);
                self.collect_row_change(def, &new, before_new, &mut delta);
            }
        }

        if delta.is_empty() {
            None
        } else {
            Some(delta)
        }
    }

    fn find_member_group(&self, id: &str) -> Option<String> {
        self.groups
            .iter()
            .find(|(_, g)| g.members.contains_key(id))
            .map(|(k, _)| k.clone())
    }

    fn add_member(&mut self, def: &ComputedViewDefinition, doc: Document) {
        self.order += 1;
        let key_value = def.key_of(&doc);
        let key = canonical_key(&key_value);
        let group = self
            .groups
            .entry(key)
            .or_insert_with(|| GroupState::new(key_value));
        group.members.insert(
            doc.id.clone(),
            Member {
                order: self.order,
                doc,
            },
        );
    }

    fn drop_member(&mut self, key: &str, id: &str) {
        if let Some(group) = self.groups.get_mut(key) {
            group.members.remove(id);
            if group.members.is_empty() {
                self.groups.remove(key);
            }
        }
    }

    fn row_snapshot(&self, def: &ComputedViewDefinition, key: &str) -> Option<GroupRow> {
        self.groups
            .get(key)
            .filter(|g| !g.members.is_empty())
            .map(|g| g.row(def))
    }

    fn collect_row_change(
        &self,
        def: &ComputedViewDefinition,
        key: &str,
        before: Option<GroupRow>,
        delta: &mut ComputedDelta,
    ) {
        let after = self.row_snapshot(def, key);
        match (before, after) {
            (Some(b), Some(a)) => {
                if b != a {
                    delta.changed.push(a);
                }
            }
            (None, Some(a)) => delta.changed.push(a),
            (Some(b), None) => delta.removed.push(b.key),
            (None, None) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, fields: &[(&str, Value)]) -> Document {
        Document::with_id(
            id,
            fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
    }

    fn event(op: ChangeOperation, doc: Document) -> ChangeEvent {
        ChangeEvent {
            operation: op,
            document_id: doc.id.clone(),
            document: match op {
                ChangeOperation::Delete => None,
                _ => Some(doc.clone()),
            },
            previous: None,
            is_from_sync: false,
            timestamp: 0,
            sequence: 0,
        }
    }

    fn sales_view() -> ComputedViewDefinition {
        ComputedViewDefinition::new("by_region", "sales")
            .group_by("region")
            .aggregate("orders", AggregateSpec::count())
            .aggregate("total", AggregateSpec::of(AggregateKind::Sum, "amount"))
            .aggregate("top", AggregateSpec::of(AggregateKind::Max, "amount"))
    }

    fn sale(id: &str, region: &str, amount: i64) -> Document {
        doc(id, &[("region", region.into()), ("amount", amount.into())])
    }

    #[test]
    fn counts_and_sums_per_group() {
        let def = sales_view();
        let mut state = ComputedState::default();
        state.apply(&def, &event(ChangeOperation::Insert, sale("a", "eu", 10)));
        state.apply(&def, &event(ChangeOperation::Insert, sale("b", "eu", 30)));
        state.apply(&def, &event(ChangeOperation::Insert, sale("c", "us", 5)));

        let rows = state.rows(&def);
        assert_eq!(rows.len(), 2);
        let eu = rows.iter().find(|r| r.key == Value::from("eu")).unwrap();
        assert_eq!(eu.values["orders"], Value::Int(2));
        assert_eq!(eu.values["total"], Value::Float(40.0));
        assert_eq!(eu.values["top"], Value::Int(30));
    }

    #[test]
    fn max_recomputes_when_extremum_leaves() {
        let def = sales_view();
        let mut state = ComputedState::default();
        state.apply(&def, &event(ChangeOperation::Insert, sale("a", "eu", 10)));
        state.apply(&def, &event(ChangeOperation::Insert, sale("b", "eu", 30)));

        let delta = state
            .apply(&def, &event(ChangeOperation::Delete, sale("b", "eu", 30)))
            .unwrap();
        assert_eq!(delta.changed[0].values["top"], Value::Int(10));
    }

    #[test]
    fn group_key_change_moves_membership() {
        let def = sales_view();
        let mut state = ComputedState::default();
        state.apply(&def, &event(ChangeOperation::Insert, sale("a", "eu", 10)));
        state.apply(&def, &event(ChangeOperation::Insert, sale("b", "eu", 30)));

        let delta = state
            .apply(&def, &event(ChangeOperation::Update, sale("b", "us", 30)))
            .unwrap();
        // The old group shrank and the new group appeared.
        assert_eq!(delta.changed.len(), 2);
        let rows = state.rows(&def);
        let eu = rows.iter().find(|r| r.key == Value::from("eu")).unwrap();
        assert_eq!(eu.values["orders"], Value::Int(1));
    }

    #[test]
    fn empty_groups_are_dropped() {
        let def = sales_view();
        let mut state = ComputedState::default();
        state.apply(&def, &event(ChangeOperation::Insert, sale("a", "eu", 10)));
        let delta = state
            .apply(&def, &event(ChangeOperation::Delete, sale("a", "eu", 10)))
            .unwrap();
        assert_eq!(delta.removed, vec![Value::from("eu")]);
        assert!(state.rows(&def).is_empty());
    }

    #[test]
    fn untouched_aggregates_emit_nothing() {
        let def = ComputedViewDefinition::new("counts", "sales")
            .group_by("region")
            .aggregate("orders", AggregateSpec::count());
        let mut state = ComputedState::default();
        state.apply(&def, &event(ChangeOperation::Insert, sale("a", "eu", 10)));

        // Amount changes but no aggregation reads it.
        let delta = state.apply(&def, &event(ChangeOperation::Update, sale("a", "eu", 99)));
        assert!(delta.is_none());
    }

    #[test]
    fn first_and_last_track_insertion_order() {
        let def = ComputedViewDefinition::new("span", "sales")
            .aggregate("earliest", AggregateSpec::of(AggregateKind::First, "amount"))
            .aggregate("latest", AggregateSpec::of(AggregateKind::Last, "amount"));
        let mut state = ComputedState::default();
        state.apply(&def, &event(ChangeOperation::Insert, sale("a", "eu", 1)));
        state.apply(&def, &event(ChangeOperation::Insert, sale("b", "eu", 2)));
        state.apply(&def, &event(ChangeOperation::Insert, sale("c", "eu", 3)));

        let rows = state.rows(&def);
        assert_eq!(rows[0].values["earliest"], Value::Int(1));
        assert_eq!(rows[0].values["latest"], Value::Int(3));

        state.apply(&def, &event(ChangeOperation::Delete, sale("c", "eu", 3)));
        let rows = state.rows(&def);
        assert_eq!(rows[0].values["latest"], Value::Int(2));
    }

    #[test]
    fn filter_scopes_membership() {
        let def = ComputedViewDefinition::new("big", "sales")
            .with_filter(Filter::gte("amount", 10))
            .group_by("region")
            .aggregate("orders", AggregateSpec::count());
        let mut state = ComputedState::default();
        state.apply(&def, &event(ChangeOperation::Insert, sale("a", "eu", 5)));
        assert!(state.rows(&def).is_empty());
        state.apply(&def, &event(ChangeOperation::Insert, sale("b", "eu", 50)));
        assert_eq!(state.rows(&def)[0].values["orders"], Value::Int(1));
    }
}
