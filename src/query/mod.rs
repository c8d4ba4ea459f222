//! Declarative query specs and the in-memory execution pipeline
//!
//! A query runs in five steps: candidate selection (adapter), filter,
//! stable multi-key sort, skip/limit, projection. The pipeline here is
//! also the reference semantics the materialized-view engine must agree
//! with.

pub mod filter;

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::error::{EddyError, Result};
use crate::types::{compare_values, Document, Value};

pub use filter::{CompareOp, Filter};

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

/// One sort key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: String,
    pub direction: SortDirection,
}

impl SortSpec {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Desc,
        }
    }
}

/// Field projection; positive or negative, never both. The id field is
/// always kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Projection {
    Include(Vec<String>),
    Exclude(Vec<String>),
}

/// Declarative query specification
#[derive(Debug, Clone, Default)]
pub struct QuerySpec {
    pub filter: Option<Filter>,
    pub sort: Vec<SortSpec>,
    pub skip: Option<usize>,
    pub limit: Option<usize>,
    pub projection: Option<Projection>,
}

impl QuerySpec {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn filtered(filter: Filter) -> Self {
        Self {
            filter: Some(filter),
            ..Self::default()
        }
    }

    pub fn with_sort(mut self, sort: SortSpec) -> Self {
        self.sort.push(sort);
        self
    }

    pub fn with_skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_projection(mut self, projection: Projection) -> Self {
        self.projection = Some(projection);
        self
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.filter.as_ref().map(|f| f.matches(doc)).unwrap_or(true)
    }
}

/// Compare two documents under a sort spec. Empty specs preserve input
/// (insertion) order by comparing equal; the caller's sort must be stable.
pub fn compare_documents(a: &Document, b: &Document, sort: &[SortSpec]) -> Ordering {
    for key in sort {
        let ord = compare_values(a.field(&key.field), b.field(&key.field));
        let ord = match key.direction {
            SortDirection::Asc => ord,
            SortDirection::Desc => ord.reverse(),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Extract the sort-key tuple of a document, for change detection in views
pub fn sort_key(doc: &Document, sort: &[SortSpec]) -> Vec<Option<Value>> {
    sort.iter()
        .map(|key| doc.field(&key.field).cloned())
        .collect()
}

/// Run filter, sort, skip/limit and projection over a candidate set.
/// Candidates must already exclude soft-deleted documents.
pub fn execute(candidates: Vec<Document>, spec: &QuerySpec) -> Vec<Document> {
    let mut results: Vec<Document> = candidates
        .into_iter()
        .filter(|doc| spec.matches(doc))
        .collect();

    if !spec.sort.is_empty() {
        results.sort_by(|a, b| compare_documents(a, b, &spec.sort));
    }

    let skip = spec.skip.unwrap_or(0);
    if skip > 0 {
        results.drain(..skip.min(results.len()));
    }
    if let Some(limit) = spec.limit {
        results.truncate(limit);
    }

    if let Some(projection) = &spec.projection {
        for doc in &mut results {
            project(doc, projection);
        }
    }
    results
}

/// Apply a projection in place
pub fn project(doc: &mut Document, projection: &Projection) {
    match projection {
        Projection::Include(fields) => {
            doc.data.retain(|key, _| fields.iter().any(|f| f == key));
        }
        Projection::Exclude(fields) => {
            doc.data.retain(|key, _| !fields.iter().any(|f| f == key));
        }
    }
}

/// Validate a spec before execution
pub fn validate(spec: &QuerySpec) -> Result<()> {
    if let Some(Projection::Include(fields) | Projection::Exclude(fields)) = &spec.projection {
        if fields.is_empty() {
            return Err(EddyError::InvalidArgument(
                "projection must name at least one field".to_string(),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;

    fn doc(id: &str, fields: &[(&str, Value)]) -> Document {
        Document::with_id(
            id,
            fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
    }

    fn people() -> Vec<Document> {
        vec![
            doc("1", &[("name", "Eve".into()), ("score", 70.into())]),
            doc("2", &[("name", "Bob".into()), ("score", 85.into())]),
            doc("3", &[("name", "Alice".into()), ("score", 85.into())]),
            doc("4", &[("score", 99.into())]),
        ]
    }

    #[test]
    fn sort_skip_limit() {
        let spec = QuerySpec::all()
            .with_sort(SortSpec::asc("name"))
            .with_skip(1)
            .with_limit(2);
        let results = execute(people(), &spec);
        // Missing name sorts first, so after skip(1): Alice, Bob
        let names: Vec<_> = results.iter().map(|d| d.id.clone()).collect();
        assert_eq!(names, vec!["3", "2"]);
    }

    #[test]
    fn multi_key_sort_is_stable() {
        let spec = QuerySpec::all()
            .with_sort(SortSpec::desc("score"))
            .with_sort(SortSpec::asc("name"));
        let results = execute(people(), &spec);
        let ids: Vec<_> = results.iter().map(|d| d.id.clone()).collect();
        assert_eq!(ids, vec!["4", "3", "2", "1"]);
    }

    #[test]
    fn empty_sort_preserves_insertion_order() {
        let results = execute(people(), &QuerySpec::all());
        let ids: Vec<_> = results.iter().map(|d| d.id.clone()).collect();
        assert_eq!(ids, vec!["1", "2", "3", "4"]);
    }

    #[test]
    fn projection_keeps_requested_fields() {
        let spec = QuerySpec::all().with_projection(Projection::Include(vec!["name".into()]));
        let results = execute(people(), &spec);
        assert!(results[0].data.get("score").is_none());
        // id lives outside the data map and survives any projection
        assert_eq!(results[0].id, "1");
    }

    #[test]
    fn negative_projection_drops_fields() {
        let spec = QuerySpec::all().with_projection(Projection::Exclude(vec!["score".into()]));
        let results = execute(people(), &spec);
        assert!(results[1].data.get("score").is_none());
        assert!(results[1].data.get("name").is_some());
    }

    #[test]
    fn empty_projection_is_invalid() {
        let spec = QuerySpec::all().with_projection(Projection::Include(vec![]));
        assert!(validate(&spec).is_err());
    }

    #[test]
    fn sort_key_extraction() {
        let d = doc("1", &[("a", 1.into())]);
        let keys = sort_key(&d, &[SortSpec::asc("a"), SortSpec::asc("b")]);
        assert_eq!(keys, vec![Some(Value::Int(1)), None]);
    }

    #[test]
    fn empty_filter_matches_all() {
        let results = execute(people(), &QuerySpec::filtered(Filter::All));
        assert_eq!(results.len(), 4);
    }
}
