use std::collections::HashMap;

use eddy_core::{
    Database, DatabaseConfig, Document, Filter, QuerySpec, SortSpec, Value,
};
use tokio::runtime::Runtime;

fn doc(id: &str, fields: &[(&str, Value)]) -> Document {
    Document::with_id(
        id,
        fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect(),
    )
}

#[test]
fn get_reflects_last_operation() {
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let db = Database::new(DatabaseConfig::default()).await.unwrap();
        let users = db.collection("users").unwrap();

        // Interleave puts and deletes; get() must always reflect the
        // last operation on the id.
        users.upsert(doc("u1", &[("v", 1.into())])).await.unwrap();
        users.upsert(doc("u1", &[("v", 2.into())])).await.unwrap();
        let current = users.get("u1").await.unwrap().unwrap();
        assert_eq!(current.get("v"), Some(&Value::Int(2)));

        users.delete("u1").await.unwrap();
        assert!(users.get("u1").await.unwrap().is_none());

        users.upsert(doc("u1", &[("v", 3.into())])).await.unwrap();
        let revived = users.get("u1").await.unwrap().unwrap();
        assert_eq!(revived.get("v"), Some(&Value::Int(3)));
        assert!(users.get("never").await.unwrap().is_none());

        db.close().await.unwrap();
    });
}

#[test]
fn change_sequences_are_contiguous() {
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let db = Database::new(DatabaseConfig::default()).await.unwrap();
        let users = db.collection("users").unwrap();
        let mut rx = users.changes();

        for i in 0..10 {
            users
                .upsert(doc(&format!("u{}", i % 3), &[("i", (i as i64).into())]))
                .await
                .unwrap();
        }
        users.delete("u0").await.unwrap();

        let mut expected = 1u64;
        for _ in 0..11 {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.sequence, expected);
            expected += 1;
        }
    });
}

#[test]
fn query_matches_reference_semantics() {
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let db = Database::new(DatabaseConfig::default()).await.unwrap();
        let users = db.collection("users").unwrap();

        let mut rows: Vec<(String, Option<i64>, &str)> = Vec::new();
        for i in 0..20 {
            let id = format!("u{i:02}");
            let score = if i % 5 == 0 { None } else { Some((i * 7 % 13) as i64) };
            let status = if i % 2 == 0 { "active" } else { "idle" };
            rows.push((id.clone(), score, status));

            let mut fields: Vec<(&str, Value)> = vec![("status", status.into())];
            if let Some(s) = score {
                fields.push(("score", s.into()));
            }
            users.upsert(doc(&id, &fields)).await.unwrap();
        }

        let spec = QuerySpec::filtered(Filter::eq("status", "active"))
            .with_sort(SortSpec::desc("score"))
            .with_sort(SortSpec::asc("_none"))
            .with_skip(1)
            .with_limit(5);
        let results = users.find(&spec).await.unwrap();

        // Reference: filter, stable sort with missing-first ascending
        // (missing-last descending), then skip/limit.
        let mut reference: Vec<(String, Option<i64>)> = rows
            .iter()
            .filter(|(_, _, status)| *status == "active")
            .map(|(id, score, _)| (id.clone(), *score))
            .collect();
        reference.sort_by(|a, b| match (a.1, b.1) {
            (None, None) => std::cmp::Ordering::Equal,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (Some(_), None) => std::cmp::Ordering::Less,
            (Some(x), Some(y)) => y.cmp(&x),
        });
        let expected: Vec<String> =
            reference.iter().skip(1).take(5).map(|(id, _)| id.clone()).collect();
        let actual: Vec<String> = results.iter().map(|d| d.id.clone()).collect();
        assert_eq!(actual, expected);

        let count = users
            .count(Some(&QuerySpec::filtered(Filter::eq("status", "active"))))
            .await
            .unwrap();
        assert_eq!(count, reference.len());
    });
}

#[test]
fn bulk_put_emits_one_event_per_document() {
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let db = Database::new(DatabaseConfig::default()).await.unwrap();
        let users = db.collection("users").unwrap();
        let mut rx = users.changes();

        let docs: Vec<Document> = (0..5)
            .map(|i| doc(&format!("u{i}"), &[("i", (i as i64).into())]))
            .collect();
        users.bulk_upsert(docs).await.unwrap();

        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(rx.recv().await.unwrap().document_id);
        }
        assert_eq!(ids, vec!["u0", "u1", "u2", "u3", "u4"]);
    });
}

#[test]
fn projection_always_keeps_id() {
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let db = Database::new(DatabaseConfig::default()).await.unwrap();
        let users = db.collection("users").unwrap();
        users
            .upsert(doc("u1", &[("a", 1.into()), ("b", 2.into())]))
            .await
            .unwrap();

        let spec = QuerySpec::all()
            .with_projection(eddy_core::Projection::Include(vec!["a".to_string()]));
        let results = users.find(&spec).await.unwrap();
        assert_eq!(results[0].id, "u1");
        assert!(results[0].get("a").is_some());
        assert!(results[0].get("b").is_none());
    });
}

#[test]
fn operator_map_filters_parse_and_match() {
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let db = Database::new(DatabaseConfig::default()).await.unwrap();
        let users = db.collection("users").unwrap();
        users
            .upsert(doc("u1", &[("name", "Brian".into()), ("age", 30.into())]))
            .await
            .unwrap();
        users
            .upsert(doc("u2", &[("name", "Eve".into()), ("age", 41.into())]))
            .await
            .unwrap();

        let mut age_ops = HashMap::new();
        age_ops.insert("$lt".to_string(), Value::from(40));
        let mut raw = HashMap::new();
        raw.insert("age".to_string(), Value::Object(age_ops));
        let mut regex_ops = HashMap::new();
        regex_ops.insert("$regex".to_string(), Value::from("^Br"));
        raw.insert("name".to_string(), Value::Object(regex_ops));

        let filter = Filter::parse(&Value::Object(raw)).unwrap();
        let results = users.find(&QuerySpec::filtered(filter)).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "u1");
    });
}
