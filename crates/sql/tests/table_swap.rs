mod common;

use std::sync::Arc;

use common::{rows, sqlite_store};
use serde_json::json;
use vocabmirror_core::{BackingStore, MirrorConfig, MirrorError, Record, Statement};
use vocabmirror_sql::{create_table, insert_statements, AtomicTableSwapper};

async fn seed_concept(store: &dyn BackingStore) {
    store
        .execute_all(&[
            Statement::new("CREATE TABLE concept (concept_id, concept_name)"),
            Statement::new("INSERT INTO concept VALUES (1, 'aspirin')"),
            Statement::new("INSERT INTO concept VALUES (2, 'ibuprofen')"),
        ])
        .await
        .unwrap();
}

fn columns() -> Vec<String> {
    vec!["concept_id".into(), "concept_name".into()]
}

#[tokio::test]
async fn failed_loader_leaves_live_table_untouched() {
    let (sqlite, _tmp) = sqlite_store(&MirrorConfig::default()).await;
    let store: Arc<dyn BackingStore> = sqlite.clone();
    seed_concept(store.as_ref()).await;
    let before = rows(store.as_ref(), "concept", "concept_id").await;
    let swapper = AtomicTableSwapper::new(store.clone());

    let loader_store = store.clone();
    let result = swapper
        .replace_table("concept", &[], |staging| async move {
            loader_store
                .execute_all(&[create_table(&staging, &columns(), false)?])
                .await?;
            loader_store
                .execute(&Statement::new(format!(
                    "INSERT INTO {staging} VALUES (3, 'partial')"
                )))
                .await?;
            Err::<(), _>(MirrorError::Upstream("export interrupted".into()))
        })
        .await;

    assert!(matches!(result, Err(MirrorError::Upstream(_))));
    assert_eq!(rows(store.as_ref(), "concept", "concept_id").await, before);
    assert!(!store.table_exists("concept_new").await.unwrap());
}

#[tokio::test]
async fn successful_loader_replaces_content_and_indexes() {
    let (sqlite, _tmp) = sqlite_store(&MirrorConfig::default()).await;
    let store: Arc<dyn BackingStore> = sqlite.clone();
    seed_concept(store.as_ref()).await;
    let swapper = AtomicTableSwapper::new(store.clone());

    let replacement: Vec<Record> = vec![json!({"concept_id": 7, "concept_name": "naproxen"})]
        .into_iter()
        .filter_map(|v| v.as_object().cloned())
        .collect();
    let loader_store = store.clone();
    swapper
        .replace_table(
            "concept",
            &[vec!["concept_id".to_string()]],
            |staging| async move {
                let mut statements = vec![create_table(&staging, &columns(), false)?];
                statements.extend(insert_statements(&staging, &columns(), &replacement)?);
                loader_store.execute_all(&statements).await.map(|_| ())
            },
        )
        .await
        .unwrap();

    let live = rows(store.as_ref(), "concept", "concept_id").await;
    assert_eq!(live.len(), 1);
    assert_eq!(live[0]["concept_name"], json!("naproxen"));
    assert!(!store.table_exists("concept_old").await.unwrap());
    assert!(!store.table_exists("concept_new").await.unwrap());
}

#[tokio::test]
async fn first_swap_creates_missing_live_table() {
    let (sqlite, _tmp) = sqlite_store(&MirrorConfig::default()).await;
    let store: Arc<dyn BackingStore> = sqlite.clone();
    let swapper = AtomicTableSwapper::new(store.clone());

    let loader_store = store.clone();
    swapper
        .replace_table("vocabulary", &[], |staging| async move {
            loader_store
                .execute(&create_table(&staging, &["vocabulary_id".to_string()], false)?)
                .await
                .map(|_| ())
        })
        .await
        .unwrap();
    assert!(store.table_exists("vocabulary").await.unwrap());

    assert!(matches!(
        swapper.swap_in("vocabulary", &[]).await,
        Err(MirrorError::InvalidState(_))
    ));
}
