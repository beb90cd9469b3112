use serde_json::{json, Map, Value};

use super::*;
use shared::protocol::Query;

fn fields(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

async fn memory_storage() -> Storage {
    Storage::new("sqlite::memory:").await.expect("storage")
}

#[tokio::test]
async fn create_user_upserts_role_on_existing_username() {
    let storage = memory_storage().await;

    let first = storage.create_user("mara", Role::Buyer).await.expect("create");
    assert_eq!(
        storage.role_for_user(first).await.expect("role"),
        Some(Role::Buyer)
    );

    let second = storage
        .create_user("mara", Role::Seller)
        .await
        .expect("upsert");
    assert_eq!(first, second);
    assert_eq!(
        storage.role_for_user(first).await.expect("role"),
        Some(Role::Seller)
    );
    assert_eq!(
        storage.username_for_user(first).await.expect("username"),
        Some("mara".to_string())
    );
}

#[tokio::test]
async fn put_document_replaces_fields_wholesale() {
    let storage = memory_storage().await;

    let doc_id = storage
        .put_document(
            "products",
            None,
            &fields(&[("title", json!("lamp")), ("price", json!(40))]),
        )
        .await
        .expect("insert");

    storage
        .put_document(
            "products",
            Some(doc_id.clone()),
            &fields(&[("title", json!("desk lamp"))]),
        )
        .await
        .expect("replace");

    let record = storage
        .get_document("products", &doc_id)
        .await
        .expect("get")
        .expect("present");
    assert_eq!(record.fields.get("title"), Some(&json!("desk lamp")));
    assert!(
        record.fields.get("price").is_none(),
        "upsert is a full replace, not a merge"
    );
}

#[tokio::test]
async fn delete_document_reports_whether_a_row_went_away() {
    let storage = memory_storage().await;
    let doc_id = storage
        .put_document("products", None, &fields(&[("title", json!("rug"))]))
        .await
        .expect("insert");

    assert!(storage
        .delete_document("products", &doc_id)
        .await
        .expect("delete"));
    assert!(!storage
        .delete_document("products", &doc_id)
        .await
        .expect("second delete"));
    assert!(storage
        .get_document("products", &doc_id)
        .await
        .expect("get")
        .is_none());
}

#[tokio::test]
async fn run_query_filters_orders_and_limits() {
    let storage = memory_storage().await;
    for (title, price, status) in [
        ("lamp", 40, "active"),
        ("rug", 120, "active"),
        ("mug", 12, "draft"),
        ("desk", 300, "active"),
    ] {
        storage
            .put_document(
                "products",
                Some(DocumentId(title.to_string())),
                &fields(&[
                    ("title", json!(title)),
                    ("price", json!(price)),
                    ("status", json!(status)),
                ]),
            )
            .await
            .expect("seed");
    }

    let query = Query::collection("products")
        .where_field("status", FilterOp::Eq, json!("active"))
        .where_field("price", FilterOp::Gt, json!(20))
        .order_by("price", true)
        .limit(2);

    let records = storage.run_query(&query).await.expect("query");
    let titles: Vec<_> = records
        .iter()
        .map(|record| record.fields["title"].as_str().expect("title"))
        .collect();
    assert_eq!(titles, vec!["desk", "rug"]);
}

#[tokio::test]
async fn missing_fields_never_match_any_operator() {
    let storage = memory_storage().await;
    storage
        .put_document(
            "products",
            Some(DocumentId("bare".to_string())),
            &fields(&[("title", json!("bare"))]),
        )
        .await
        .expect("seed");

    for op in [FilterOp::Eq, FilterOp::Ne, FilterOp::Gt, FilterOp::Lte] {
        let query = Query::collection("products").where_field("price", op, json!(10));
        assert!(
            storage.run_query(&query).await.expect("query").is_empty(),
            "operator {op:?} matched a missing field"
        );
    }
}

#[tokio::test]
async fn query_on_unknown_collection_is_empty_not_an_error() {
    let storage = memory_storage().await;
    let records = storage
        .run_query(&Query::collection("nonexistent"))
        .await
        .expect("query");
    assert!(records.is_empty());
}

#[tokio::test]
async fn media_object_round_trips_bytes_content_type_and_metadata() {
    let storage = memory_storage().await;
    let mut metadata = HashMap::new();
    metadata.insert("uploader".to_string(), "7".to_string());

    storage
        .put_media_object(
            "media",
            "products/a.jpg",
            b"jpeg-bytes",
            Some("image/jpeg"),
            &metadata,
        )
        .await
        .expect("put");

    let object = storage
        .get_media_object("media", "products/a.jpg")
        .await
        .expect("get")
        .expect("present");
    assert_eq!(object.bytes, b"jpeg-bytes");
    assert_eq!(object.content_type.as_deref(), Some("image/jpeg"));
    assert_eq!(object.custom_metadata.get("uploader"), Some(&"7".to_string()));

    assert!(storage
        .get_media_object("media", "products/missing.jpg")
        .await
        .expect("get missing")
        .is_none());
}

#[tokio::test]
async fn object_store_publish_overwrites_in_place() {
    let storage = memory_storage().await;
    storage
        .put_media_object("media", "products/a.jpg", b"original", Some("image/png"), &HashMap::new())
        .await
        .expect("seed");

    let mut metadata = HashMap::new();
    metadata.insert("optimized".to_string(), "true".to_string());
    ObjectStore::publish(
        &storage,
        "media",
        "products/a.jpg",
        b"transformed".to_vec(),
        Some("image/png".to_string()),
        metadata,
    )
    .await
    .expect("publish");

    let object = ObjectStore::fetch(&storage, "media", "products/a.jpg")
        .await
        .expect("fetch")
        .expect("present");
    assert_eq!(object.bytes, b"transformed");
    assert_eq!(object.content_type.as_deref(), Some("image/png"));
    assert_eq!(
        object.custom_metadata.get("optimized"),
        Some(&"true".to_string())
    );
}

#[tokio::test]
async fn creates_parent_dir_for_file_backed_database() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("nested/data/bazaar.db");
    let url = format!("sqlite://{}", db_path.display());

    let storage = Storage::new(&url).await.expect("file-backed storage");
    storage.health_check().await.expect("health");
    assert!(db_path.parent().expect("parent").exists());
}
