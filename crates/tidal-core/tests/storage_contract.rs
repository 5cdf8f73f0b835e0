//! The storage contract, checked against every bundled backend.

use std::sync::Arc;

use bytes::Bytes;
use tidal_core::prelude::*;

async fn check_contract(backend: Arc<dyn StorageBackend>) {
    // create-if-absent admits exactly one writer
    let first = backend
        .put("t/_log/0.json", Bytes::from("a"), WritePrecondition::DoesNotExist)
        .await
        .unwrap();
    assert!(first.is_success());
    let second = backend
        .put("t/_log/0.json", Bytes::from("b"), WritePrecondition::DoesNotExist)
        .await
        .unwrap();
    assert!(!second.is_success());
    assert_eq!(backend.get("t/_log/0.json").await.unwrap(), Bytes::from("a"));

    // version-guarded overwrite
    let WriteResult::Success { version } = first else {
        panic!("first write applied");
    };
    let stale = backend
        .put(
            "t/_log/0.json",
            Bytes::from("c"),
            WritePrecondition::MatchesVersion(format!("{version}-stale")),
        )
        .await
        .unwrap();
    assert!(!stale.is_success());
    let fresh = backend
        .put(
            "t/_log/0.json",
            Bytes::from("c"),
            WritePrecondition::MatchesVersion(version),
        )
        .await
        .unwrap();
    assert!(fresh.is_success());

    // ranged reads clamp the end and reject inverted ranges
    backend
        .put("t/data.bin", Bytes::from("0123456789"), WritePrecondition::None)
        .await
        .unwrap();
    assert_eq!(
        backend.get_range("t/data.bin", 2..5).await.unwrap(),
        Bytes::from("234")
    );
    assert_eq!(
        backend.get_range("t/data.bin", 8..100).await.unwrap(),
        Bytes::from("89")
    );
    assert!(backend.get_range("t/data.bin", 11..12).await.is_err());

    // listing, metadata and idempotent deletes
    let mut listed: Vec<String> = backend
        .list("t/")
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.path)
        .collect();
    listed.sort();
    assert_eq!(listed, ["t/_log/0.json", "t/data.bin"]);
    assert_eq!(backend.head("t/data.bin").await.unwrap().unwrap().size, 10);
    assert!(backend.head("t/missing").await.unwrap().is_none());
    assert!(backend.get("t/missing").await.unwrap_err().is_not_found());

    backend.delete("t/data.bin").await.unwrap();
    backend.delete("t/data.bin").await.unwrap();
    assert!(backend.head("t/data.bin").await.unwrap().is_none());
}

#[tokio::test]
async fn memory_backend_honors_the_contract() {
    check_contract(Arc::new(MemoryBackend::new())).await;
}

#[tokio::test]
async fn local_backend_honors_the_contract() {
    let dir = tempfile::tempdir().unwrap();
    check_contract(Arc::new(LocalFsBackend::new(dir.path()))).await;
}

#[tokio::test]
async fn registry_scopes_tables_to_their_root() {
    let dir = tempfile::tempdir().unwrap();
    let location = dir.path().join("sales").join("orders");
    let registry = StorageRegistry::with_defaults();

    let storage = registry
        .resolve(location.to_str().unwrap(), &StorageOptions::new())
        .unwrap();
    storage
        .put("part-1.parquet", Bytes::from("x"), WritePrecondition::None)
        .await
        .unwrap();

    assert!(location.join("part-1.parquet").exists());
    let listed = storage.list("").await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].path, "part-1.parquet");
    assert!(storage.file_uri("part-1.parquet").ends_with("/sales/orders/part-1.parquet"));
}

#[tokio::test]
async fn memory_tables_in_one_registry_share_a_store() {
    let registry = StorageRegistry::with_defaults();
    let writer = registry
        .resolve("memory://warehouse/orders", &StorageOptions::new())
        .unwrap();
    let reader = registry
        .resolve("memory://warehouse/orders", &StorageOptions::new())
        .unwrap();
    let other = registry
        .resolve("memory://warehouse/customers", &StorageOptions::new())
        .unwrap();

    writer
        .put("a.parquet", Bytes::from("1"), WritePrecondition::None)
        .await
        .unwrap();
    assert_eq!(reader.get("a.parquet").await.unwrap(), Bytes::from("1"));
    assert!(other.list("").await.unwrap().is_empty());

    assert!(registry
        .resolve("s3://bucket/t", &StorageOptions::new())
        .is_err());
}
