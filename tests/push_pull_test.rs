//! End-to-end push/pull scenarios against the in-memory object store

use filetime::{set_file_mtime, FileTime};
use qfs::confirm::{DefaultAnswer, ScriptedConfirmer, UserConfirmer};
use qfs::coordinator::{Coordinator, OpOptions};
use qfs::error::QfsError;
use qfs::site::Site;
use qfs::store::memory::MemoryStore;
use qfs::store::ObjectStore;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

const PREFIX: &str = "pre";

async fn seed_filter(store: &MemoryStore, name: &str, body: &str) {
	let key = format!("{}/.qfs/filters/{}@f,1000,0644", PREFIX, name);
	store.put_bytes_at(&key, body.as_bytes().to_vec(), 500).await;
}

async fn make_site(store: &Arc<MemoryStore>, name: &str) -> (TempDir, Coordinator) {
	make_site_with(store, name, Arc::new(DefaultAnswer)).await
}

async fn make_site_with(
	store: &Arc<MemoryStore>,
	name: &str,
	confirmer: Arc<dyn UserConfirmer>,
) -> (TempDir, Coordinator) {
	let tmp = TempDir::new().unwrap();
	let site = Site::create(tmp.path(), "s3://bucket/pre", name).await.unwrap();
	let dyn_store: Arc<dyn ObjectStore> = store.clone();
	let c = Coordinator::with_store(site, dyn_store, PREFIX, confirmer);
	(tmp, c)
}

fn write_file(top: &Path, rel: &str, body: &[u8], mtime_secs: i64) {
	let path = top.join(rel);
	if let Some(dir) = path.parent() {
		fs::create_dir_all(dir).unwrap();
	}
	fs::write(&path, body).unwrap();
	fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
	set_file_mtime(&path, FileTime::from_unix_time(mtime_secs, 0)).unwrap();
}

fn mtime_secs_of(path: &Path) -> i64 {
	FileTime::from_last_modification_time(&fs::symlink_metadata(path).unwrap()).unix_seconds()
}

#[tokio::test]
async fn test_first_push_creates_expected_objects() {
	let store = Arc::new(MemoryStore::new());
	seed_filter(&store, "repo", ":include:\ndir1\n").await;
	let (tmp, a) = make_site(&store, "a").await;

	write_file(tmp.path(), "dir1/file1", b"hello", 2000);
	fs::set_permissions(tmp.path().join("dir1"), fs::Permissions::from_mode(0o755)).unwrap();
	set_file_mtime(tmp.path().join("dir1"), FileTime::from_unix_time(3000, 0)).unwrap();

	a.push(&OpOptions::default()).await.unwrap();

	let keys = store.keys().await;
	let data: Vec<&String> =
		keys.iter().filter(|k| !k.starts_with("pre/.qfs/")).collect();
	assert_eq!(
		data,
		vec!["pre/dir1/file1@f,2000000,0644", "pre/dir1@d,3000000,0755"],
		"all keys: {:?}",
		keys
	);
	assert_eq!(keys.iter().filter(|k| k.starts_with("pre/.qfs/db/repo@")).count(), 1);
	assert_eq!(keys.iter().filter(|k| k.starts_with("pre/.qfs/db/a@")).count(), 1);
	assert!(!store.contains("pre/.qfs/busy").await);

	// The diff marker records exactly what was pushed
	let marker = fs::read_to_string(tmp.path().join(".qfs/push")).unwrap();
	assert_eq!(marker, "mkdir dir1\nadd dir1/file1\n");

	// The cached repository view now exists locally
	assert!(tmp.path().join(".qfs/db/repo").is_file());
}

#[tokio::test]
async fn test_bootstrap_pull_installs_only_filters() {
	let store = Arc::new(MemoryStore::new());
	seed_filter(&store, "repo", ":include:\ndir1\n").await;
	let (tmp_a, a) = make_site(&store, "a").await;
	write_file(tmp_a.path(), "dir1/file1", b"hello", 2000);
	a.push(&OpOptions::default()).await.unwrap();

	// Site b has no site filter anywhere: exclude-all bootstrap
	let (tmp_b, b) = make_site(&store, "b").await;
	b.pull(&OpOptions::default()).await.unwrap();

	let filter_body = fs::read_to_string(tmp_b.path().join(".qfs/filters/repo")).unwrap();
	assert_eq!(filter_body, ":include:\ndir1\n");
	assert!(!tmp_b.path().join("dir1").exists(), "data must not be fetched on bootstrap");
	assert!(store.keys().await.iter().any(|k| k.starts_with("pre/.qfs/db/b@")));
}

#[tokio::test]
async fn test_pull_fetches_included_data() {
	let store = Arc::new(MemoryStore::new());
	seed_filter(&store, "repo", ":include:\ndir1\n").await;
	seed_filter(&store, "b", ":include:\ndir1\n").await;
	let (tmp_a, a) = make_site(&store, "a").await;
	write_file(tmp_a.path(), "dir1/fileA", b"v1", 2000);
	a.push(&OpOptions::default()).await.unwrap();

	let (tmp_b, b) = make_site(&store, "b").await;
	b.pull(&OpOptions::default()).await.unwrap();

	let fetched = tmp_b.path().join("dir1/fileA");
	assert_eq!(fs::read(&fetched).unwrap(), b"v1");
	assert_eq!(mtime_secs_of(&fetched), 2000);
}

#[tokio::test]
async fn test_same_file_conflict_aborts_push() {
	let store = Arc::new(MemoryStore::new());
	for name in ["repo", "a", "b"] {
		seed_filter(&store, name, ":include:\ndir1\n").await;
	}
	let (tmp_a, a) = make_site(&store, "a").await;
	write_file(tmp_a.path(), "dir1/fileA", b"v1", 2000);
	a.push(&OpOptions::default()).await.unwrap();

	let (tmp_b, b) = make_site(&store, "b").await;
	b.pull(&OpOptions::default()).await.unwrap();

	// A modifies and pushes; B modifies the same file without pulling
	write_file(tmp_a.path(), "dir1/fileA", b"v2", 3000);
	a.push(&OpOptions::default()).await.unwrap();
	write_file(tmp_b.path(), "dir1/fileA", b"v3", 4000);

	match b.push(&OpOptions::default()).await {
		Err(QfsError::Conflict { paths }) => {
			assert_eq!(paths, vec!["dir1/fileA".to_string()]);
		}
		other => panic!("expected conflict, got {:?}", other.map(|_| ())),
	}
	// A's version is still what the repository holds
	assert!(store.contains("pre/dir1/fileA@f,3000000,0644").await);
	assert!(!store.contains("pre/.qfs/busy").await);

	// Overriding the prompt lets the push through
	let site_b = Site::open(tmp_b.path()).unwrap();
	let dyn_store: Arc<dyn ObjectStore> = store.clone();
	let b2 = Coordinator::with_store(
		site_b,
		dyn_store,
		PREFIX,
		Arc::new(ScriptedConfirmer::new(vec![false])),
	);
	b2.push(&OpOptions::default()).await.unwrap();
	assert!(store.contains("pre/dir1/fileA@f,4000000,0644").await);
	assert!(!store.contains("pre/dir1/fileA@f,3000000,0644").await);
}

#[tokio::test]
async fn test_disjoint_pushes_do_not_conflict() {
	let store = Arc::new(MemoryStore::new());
	for name in ["repo", "a", "b"] {
		seed_filter(&store, name, ":include:\ndir1\ndir2\n").await;
	}
	let (tmp_a, a) = make_site(&store, "a").await;
	write_file(tmp_a.path(), "dir1/fileA", b"a1", 2000);
	write_file(tmp_a.path(), "dir2/fileB", b"b1", 2100);
	a.push(&OpOptions::default()).await.unwrap();

	let (tmp_b, b) = make_site(&store, "b").await;
	b.pull(&OpOptions::default()).await.unwrap();

	// A touches dir1, B touches dir2; B pushes without pulling first
	write_file(tmp_a.path(), "dir1/fileA", b"a2", 3000);
	a.push(&OpOptions::default()).await.unwrap();
	write_file(tmp_b.path(), "dir2/fileB", b"b2", 3100);
	b.push(&OpOptions::default()).await.unwrap();

	assert!(store.contains("pre/dir1/fileA@f,3000000,0644").await, "no revert of A's change");
	assert!(store.contains("pre/dir2/fileB@f,3100000,0644").await);

	// Each site acquires the other's change on its next pull
	a.pull(&OpOptions::default()).await.unwrap();
	assert_eq!(fs::read(tmp_a.path().join("dir2/fileB")).unwrap(), b"b2");
	b.pull(&OpOptions::default()).await.unwrap();
	assert_eq!(fs::read(tmp_b.path().join("dir1/fileA")).unwrap(), b"a2");
}

#[tokio::test]
async fn test_typechange_propagates() {
	let store = Arc::new(MemoryStore::new());
	for name in ["repo", "a", "b"] {
		seed_filter(&store, name, ":include:\ndir1\n").await;
	}
	let (tmp_a, a) = make_site(&store, "a").await;
	write_file(tmp_a.path(), "dir1/thing", b"plain file", 2000);
	a.push(&OpOptions::default()).await.unwrap();

	let (tmp_b, b) = make_site(&store, "b").await;
	b.pull(&OpOptions::default()).await.unwrap();
	assert!(tmp_b.path().join("dir1/thing").is_file());

	// A replaces the file with a directory of the same name
	fs::remove_file(tmp_a.path().join("dir1/thing")).unwrap();
	write_file(tmp_a.path(), "dir1/thing/inner", b"nested", 3000);
	a.push(&OpOptions::default()).await.unwrap();

	let marker = fs::read_to_string(tmp_a.path().join(".qfs/push")).unwrap();
	assert!(
		marker.contains("typechange dir1/thing\nrm dir1/thing\nmkdir dir1/thing\n"),
		"marker: {}",
		marker
	);

	b.pull(&OpOptions::default()).await.unwrap();
	assert!(tmp_b.path().join("dir1/thing").is_dir());
	assert_eq!(fs::read(tmp_b.path().join("dir1/thing/inner")).unwrap(), b"nested");
}

#[tokio::test]
async fn test_busy_marker_blocks_operations() {
	let store = Arc::new(MemoryStore::new());
	let (_tmp, a) = make_site(&store, "a").await;
	store.put_bytes("pre/.qfs/busy", vec![]).await.unwrap();

	assert!(matches!(a.push(&OpOptions::default()).await, Err(QfsError::Busy { .. })));
	assert!(matches!(a.pull(&OpOptions::default()).await, Err(QfsError::Busy { .. })));
}

#[tokio::test]
async fn test_push_without_changes_refreshes_stale_cache() {
	let store = Arc::new(MemoryStore::new());
	seed_filter(&store, "repo", ":include:\ndir1\n").await;
	let (tmp_a, a) = make_site(&store, "a").await;
	write_file(tmp_a.path(), "dir1/file1", b"x", 2000);
	a.push(&OpOptions::default()).await.unwrap();

	// Someone else rewrites the repository database
	let dyn_store: Arc<dyn ObjectStore> = store.clone();
	let repo = qfs::repo::Repo::new(dyn_store, PREFIX);
	let scan = repo.scan(&[], 2).await.unwrap();
	let new_meta = repo.upload_db("repo", &scan.db).await.unwrap();

	a.push(&OpOptions::default()).await.unwrap();

	let site = Site::open(tmp_a.path()).unwrap();
	assert_eq!(site.cached_repo_db_origin().await, Some(new_meta.last_modified_ms));
	// Still no data changes on the repository
	assert!(store.contains("pre/dir1/file1@f,2000000,0644").await);
}

#[tokio::test]
async fn test_dry_run_changes_nothing() {
	let store = Arc::new(MemoryStore::new());
	seed_filter(&store, "repo", ":include:\ndir1\n").await;
	let (tmp_a, a) = make_site(&store, "a").await;
	write_file(tmp_a.path(), "dir1/file1", b"x", 2000);

	let options = OpOptions { dry_run: true, ..OpOptions::default() };
	a.push(&options).await.unwrap();

	let keys = store.keys().await;
	assert_eq!(
		keys.iter().filter(|k| !k.starts_with("pre/.qfs/filters/")).count(),
		0,
		"dry run must not write: {:?}",
		keys
	);
}

#[tokio::test]
async fn test_local_filter_edit_is_pushed() {
	let store = Arc::new(MemoryStore::new());
	seed_filter(&store, "repo", ":include:\ndir1\n").await;
	seed_filter(&store, "b", ":include:\ndir1\n").await;
	let (tmp_a, a) = make_site(&store, "a").await;
	write_file(tmp_a.path(), "dir1/file1", b"x", 2000);
	a.push(&OpOptions::default()).await.unwrap();

	let (tmp_b, b) = make_site(&store, "b").await;
	b.pull(&OpOptions::default()).await.unwrap();

	// b edits its own site filter and pushes; the filter flows upstream
	write_file(tmp_b.path(), ".qfs/filters/b", b":include:\ndir1\ndir2\n", 5000);
	b.push(&OpOptions::default()).await.unwrap();
	assert!(store.contains("pre/.qfs/filters/b@f,5000000,0644").await);
}

// vim: ts=4
