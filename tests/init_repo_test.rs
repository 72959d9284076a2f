//! init-repo scenarios: build, rebuild confirmation, clean, migrate

use filetime::{set_file_mtime, FileTime};
use qfs::confirm::{DefaultAnswer, ScriptedConfirmer, UserConfirmer};
use qfs::coordinator::{Coordinator, InitMode, OpOptions};
use qfs::db::Database;
use qfs::site::Site;
use qfs::store::memory::MemoryStore;
use qfs::store::ObjectStore;
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

const PREFIX: &str = "pre";

async fn make_site_with(
	store: &Arc<MemoryStore>,
	confirmer: Arc<dyn UserConfirmer>,
) -> (TempDir, Coordinator) {
	let tmp = TempDir::new().unwrap();
	let site = Site::create(tmp.path(), "s3://bucket/pre", "a").await.unwrap();
	let dyn_store: Arc<dyn ObjectStore> = store.clone();
	(tmp, Coordinator::with_store(site, dyn_store, PREFIX, confirmer))
}

async fn repo_db_from_store(store: &Arc<MemoryStore>) -> Database {
	let dyn_store: Arc<dyn ObjectStore> = store.clone();
	let repo = qfs::repo::Repo::new(dyn_store, PREFIX);
	let (body, _) = repo.download_db("repo").await.unwrap().expect("repo db");
	Database::parse(&body, &[]).unwrap()
}

#[tokio::test]
async fn test_init_builds_database_from_listing() {
	let store = Arc::new(MemoryStore::new());
	store.put_bytes_at("pre/d@d,2000000,0755", vec![], 900).await;
	store.put_bytes_at("pre/d/f@f,2100000,0644", b"body".to_vec(), 901).await;
	let (_tmp, c) = make_site_with(&store, Arc::new(DefaultAnswer)).await;

	c.init_repo(InitMode::Normal, &OpOptions::default()).await.unwrap();

	let db = repo_db_from_store(&store).await;
	assert!(db.contains("d"));
	assert_eq!(db.get("d/f").unwrap().mtime_ms, 2_100_000);
	assert!(!store.contains("pre/.qfs/busy").await);
}

#[tokio::test]
async fn test_reinit_requires_confirmation() {
	let store = Arc::new(MemoryStore::new());
	store.put_bytes_at("pre/x@f,1000,0644", b"x".to_vec(), 900).await;
	let (_tmp, c) = make_site_with(&store, Arc::new(DefaultAnswer)).await;
	c.init_repo(InitMode::Normal, &OpOptions::default()).await.unwrap();
	let first_keys: Vec<String> = store.keys().await;

	// DefaultAnswer declines the rebuild prompt; nothing changes
	c.init_repo(InitMode::Normal, &OpOptions::default()).await.unwrap();
	assert_eq!(store.keys().await, first_keys);

	// An explicit yes rebuilds, leaving exactly one database object
	let (_tmp2, c2) =
		make_site_with(&store, Arc::new(ScriptedConfirmer::new(vec![true]))).await;
	c2.init_repo(InitMode::Normal, &OpOptions::default()).await.unwrap();
	let db_keys =
		store.keys().await.into_iter().filter(|k| k.starts_with("pre/.qfs/db/repo@")).count();
	assert_eq!(db_keys, 1);
}

#[tokio::test]
async fn test_clean_repo_removes_extra_keys() {
	let store = Arc::new(MemoryStore::new());
	store.put_bytes_at("pre/keep@f,2000000,0644", b"ok".to_vec(), 900).await;
	// A stale duplicate and a key outside the grammar
	store.put_bytes_at("pre/keep@f,1000000,0644", b"old".to_vec(), 800).await;
	store.put_bytes_at("pre/garbage", b"??".to_vec(), 850).await;

	// First answer: confirm deletion of extra keys
	let (_tmp, c) = make_site_with(&store, Arc::new(ScriptedConfirmer::new(vec![true]))).await;
	c.init_repo(InitMode::CleanRepo, &OpOptions::default()).await.unwrap();

	assert!(store.contains("pre/keep@f,2000000,0644").await);
	assert!(!store.contains("pre/keep@f,1000000,0644").await);
	assert!(!store.contains("pre/garbage").await);
}

#[tokio::test]
async fn test_clean_repo_keeps_extras_when_declined() {
	let store = Arc::new(MemoryStore::new());
	store.put_bytes_at("pre/keep@f,2000000,0644", b"ok".to_vec(), 900).await;
	store.put_bytes_at("pre/garbage", b"??".to_vec(), 850).await;

	let (_tmp, c) = make_site_with(&store, Arc::new(ScriptedConfirmer::new(vec![false]))).await;
	c.init_repo(InitMode::CleanRepo, &OpOptions::default()).await.unwrap();
	assert!(store.contains("pre/garbage").await);
}

#[tokio::test]
async fn test_migrate_rekeys_plain_objects() {
	let store = Arc::new(MemoryStore::new());
	let (tmp, c) = make_site_with(&store, Arc::new(DefaultAnswer)).await;

	// A plain key whose object is newer than the matching local file
	fs::write(tmp.path().join("legacy.txt"), b"legacy body").unwrap();
	fs::set_permissions(
		tmp.path().join("legacy.txt"),
		std::os::unix::fs::PermissionsExt::from_mode(0o644),
	)
	.unwrap();
	set_file_mtime(tmp.path().join("legacy.txt"), FileTime::from_unix_time(2000, 0)).unwrap();
	store.put_bytes_at("pre/legacy.txt", b"legacy body".to_vec(), 2_500_000).await;

	// A plain key whose object is older than the local file: left alone
	fs::write(tmp.path().join("stale.txt"), b"edited since upload").unwrap();
	set_file_mtime(tmp.path().join("stale.txt"), FileTime::from_unix_time(2000, 0)).unwrap();
	store.put_bytes_at("pre/stale.txt", b"old body".to_vec(), 1_000_000).await;

	// A plain key with no local counterpart: left alone
	store.put_bytes_at("pre/orphan.bin", b"??".to_vec(), 2_500_000).await;

	c.init_repo(InitMode::Migrate, &OpOptions::default()).await.unwrap();

	assert!(store.contains("pre/legacy.txt@f,2000000,0644").await);
	assert!(!store.contains("pre/legacy.txt").await);
	assert_eq!(store.body("pre/legacy.txt@f,2000000,0644").await.unwrap(), b"legacy body");
	assert!(store.contains("pre/stale.txt").await);
	assert!(store.contains("pre/orphan.bin").await);

	let db = repo_db_from_store(&store).await;
	assert!(db.contains("legacy.txt"));
	assert!(!db.contains("stale.txt"));
}

// vim: ts=4
