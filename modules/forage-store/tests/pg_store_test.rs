//! Postgres document store tests.
//! Requires a Postgres instance. Set DATABASE_TEST_URL or these tests are skipped.

use std::sync::Arc;

use serde_json::{json, Value};

use forage_store::{DocumentStore, Filter, OrderBy, PgStore, Query, StoreError};

async fn test_store() -> Option<PgStore> {
    let url = std::env::var("DATABASE_TEST_URL").ok()?;
    let store = PgStore::connect(&url).await.ok()?;
    store.migrate().await.ok()?;
    sqlx::query("DELETE FROM documents WHERE collection LIKE 'test_%'")
        .execute(store.pool())
        .await
        .ok()?;
    Some(store)
}

#[tokio::test]
async fn create_then_get_roundtrips_with_timestamps() {
    let Some(store) = test_store().await else {
        return;
    };
    let doc = store
        .create("test_docs", Some("d1"), json!({"name": "Taco Stand"}))
        .await
        .unwrap();
    assert_eq!(doc["id"], "d1");
    assert!(doc["created_at"].is_string());

    let fetched = store.get("test_docs", "d1").await.unwrap().unwrap();
    assert_eq!(fetched["name"], "Taco Stand");

    let err = store
        .create("test_docs", Some("d1"), json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::AlreadyExists { .. }));
}

#[tokio::test]
async fn query_applies_json_filters_and_order() {
    let Some(store) = test_store().await else {
        return;
    };
    for (id, score, country) in [("a", 20, "DE"), ("b", 80, "DE"), ("c", 60, "FR")] {
        store
            .create(
                "test_staged",
                Some(id),
                json!({"score": score, "payload": {"country": country}}),
            )
            .await
            .unwrap();
    }

    let q = Query::new()
        .filter(Filter::eq("payload.country", "DE"))
        .order_by(OrderBy::desc("score"));
    let ids: Vec<Value> = store
        .query("test_staged", &q)
        .await
        .unwrap()
        .into_iter()
        .map(|d| d["id"].clone())
        .collect();
    assert_eq!(ids, vec![json!("b"), json!("a")]);

    let n = store
        .count("test_staged", &[Filter::gte("score", 60)])
        .await
        .unwrap();
    assert_eq!(n, 2);
}

#[tokio::test]
async fn row_locked_updates_do_not_lose_increments() {
    let Some(store) = test_store().await else {
        return;
    };
    let store = Arc::new(store);
    store
        .create("test_counters", Some("c"), json!({"n": 0}))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..20 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let mut apply = |doc: &mut Value| -> forage_store::Result<()> {
                let n = doc["n"].as_u64().unwrap_or(0);
                doc["n"] = json!(n + 1);
                Ok(())
            };
            store
                .update_with("test_counters", "c", &mut apply)
                .await
                .unwrap();
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let doc = store.get("test_counters", "c").await.unwrap().unwrap();
    assert_eq!(doc["n"], 20);
}
