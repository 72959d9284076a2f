//! Push, pull, and repository maintenance state machines
//!
//! The discipline that makes out-of-order pushes and pulls safe: every diff
//! compares this site's state against this site's *cached* view of the
//! repository, never against a freshly fetched one. The authoritative
//! repository database is consulted only to verify the diff's check
//! records, and conflicts are exactly the paths whose destination state
//! matches none of the expected modification times.

use crate::apply::{apply_local, ApplyOptions, TreeFetcher};
use crate::concurrent::{run_pool, DEFAULT_WORKERS};
use crate::confirm::UserConfirmer;
use crate::db::{Database, DbFlavor};
use crate::diff::{diff, Check, Diff, DiffOptions, MetaChange};
use crate::error::{QfsError, QfsResult};
use crate::filter::{parse_filter_file, Filter};
use crate::logging::{info, warn};
use crate::repo::{decode_key, Repo, RepoScan, REPO_DB_NAME};
use crate::site::{Site, PULL_MARKER, PUSH_MARKER};
use crate::source::{LocalSource, RepoSource, Source};
use crate::store::{parse_s3_url, s3::S3Store, ObjectStore};
use crate::traverse::{traverse, TraverseOptions};
use crate::types::{mtime_ms_from_metadata, FileInfo, FileType};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Options shared by the filter-taking operations
#[derive(Clone, Default)]
pub struct OpOptions {
	/// Extra filters from the command line, intersected with the site's
	pub filters: Vec<Filter>,
	pub files_only: bool,
	pub no_special: bool,
	pub cleanup: bool,
	pub dry_run: bool,
	/// Worker pool size; 0 means the default
	pub workers: usize,
}

/// init-repo flavors; mutually exclusive
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InitMode {
	/// Build (or rebuild) the repository database from a full listing
	Normal,
	/// Additionally delete duplicate, malformed, and filtered-out keys
	CleanRepo,
	/// Re-key objects uploaded by a naive sync tool
	Migrate,
}

pub struct Coordinator {
	site: Site,
	repo: Repo,
	confirmer: Arc<dyn UserConfirmer>,
}

impl Coordinator {
	/// Connect to the repository named by the site's `.qfs/repo`
	pub async fn connect(site: Site, confirmer: Arc<dyn UserConfirmer>) -> QfsResult<Coordinator> {
		let url = site.repo_url().await?;
		let (bucket, prefix) = parse_s3_url(&url)?;
		let store: Arc<dyn ObjectStore> = Arc::new(S3Store::connect(&bucket).await);
		Ok(Coordinator { site, repo: Repo::new(store, &prefix), confirmer })
	}

	/// Build a coordinator over an arbitrary store (tests, scratch runs)
	pub fn with_store(
		site: Site,
		store: Arc<dyn ObjectStore>,
		prefix: &str,
		confirmer: Arc<dyn UserConfirmer>,
	) -> Coordinator {
		Coordinator { site, repo: Repo::new(store, prefix), confirmer }
	}

	pub fn site(&self) -> &Site {
		&self.site
	}

	pub fn repo(&self) -> &Repo {
		&self.repo
	}

	async fn fail_if_busy(&self) -> QfsResult<()> {
		if self.repo.is_busy().await? {
			return Err(QfsError::Busy { key: self.repo.busy_key() });
		}
		Ok(())
	}

	/// Print conflicts and ask whether to stop; `y` is the safe answer
	async fn resolve_conflicts(&self, conflicts: Vec<String>) -> QfsResult<()> {
		if conflicts.is_empty() {
			return Ok(());
		}
		for path in &conflicts {
			println!("conflict: {}", path);
		}
		let stop = self
			.confirmer
			.confirm("Conflicts were detected. Exit without applying?", true)
			.await?;
		if stop {
			Err(QfsError::Conflict { paths: conflicts })
		} else {
			warn!("continuing despite {} conflict(s)", conflicts.len());
			Ok(())
		}
	}

	/// Load the authoritative repo DB, reusing the cache when its origin
	/// stamp still matches. Returns the database plus the downloaded bytes
	/// and stamp when a download happened.
	async fn authoritative_repo_db(
		&self,
		cached: &Database,
	) -> QfsResult<(Database, Option<(Vec<u8>, i64)>)> {
		let remote = self.repo.find_db(REPO_DB_NAME).await?;
		match remote {
			None => Ok((Database::new(DbFlavor::Repo), None)),
			Some((_, meta)) => {
				if self.site.cached_repo_db_origin().await == Some(meta.last_modified_ms) {
					Ok((cached.clone(), None))
				} else {
					info!("cached repository database is stale; downloading");
					let (body, meta) = self
						.repo
						.download_db(REPO_DB_NAME)
						.await?
						.ok_or_else(|| QfsError::store_msg("repository database vanished"))?;
					let db = Database::parse(&body, &[])?;
					Ok((db, Some((body, meta.last_modified_ms))))
				}
			}
		}
	}

	/// Traverse the local tree with prune-only filters, so previously
	/// recorded paths outside the current filter stay tracked
	async fn fresh_site_db(&self, filters: &[Filter], options: &OpOptions) -> QfsResult<Database> {
		let prune_only: Vec<Filter> = filters.iter().map(Filter::prune_only).collect();
		let source = Arc::new(LocalSource::open(self.site.top())?);
		let result = traverse(
			source,
			DbFlavor::Qfs,
			TraverseOptions {
				filters: prune_only,
				files_only: options.files_only,
				no_special: options.no_special,
				cleanup: options.cleanup,
				same_device: true,
				workers: options.workers,
			},
		)
		.await?;
		for e in &result.errors {
			warn!("scan: {}", e);
		}
		Ok(result.db)
	}

	// === push ===

	pub async fn push(&self, options: &OpOptions) -> QfsResult<()> {
		self.fail_if_busy().await?;
		let site_name = self.site.site_name().await?;
		let filters = self.fetch_filters(&site_name, false, &options.filters).await?;

		let cached = self.site.load_cached_repo_db().await?;
		let site_db = self.fresh_site_db(&filters, options).await?;
		site_db.write(&self.site.db_path(&site_name)).await?;

		let d = diff(
			&cached,
			&site_db,
			&filters,
			DiffOptions {
				repo_rules: true,
				no_special: true,
				checks: true,
				..DiffOptions::default()
			},
		)?;
		self.site.write_marker(PUSH_MARKER, &d.render()).await?;

		let (authoritative, downloaded) = self.authoritative_repo_db(&cached).await?;
		let conflicts = conflicts_against_db(&d.checks, &authoritative);
		self.resolve_conflicts(conflicts).await?;

		if options.dry_run {
			print!("{}", d.render());
			return Ok(());
		}

		if d.is_empty() {
			info!("no changes to push");
			if let Some((body, origin)) = downloaded {
				self.site.save_cached_repo_db(&body, origin).await?;
			}
			self.repo.upload_db(&site_name, &site_db).await?;
			return Ok(());
		}

		self.repo.mark_busy().await?;
		let result = self.push_apply(&d, &site_db, &authoritative, options).await;
		if result.is_ok() {
			self.repo.clear_busy().await?;
		}
		result
	}

	async fn push_apply(
		&self,
		d: &Diff,
		site_db: &Database,
		authoritative: &Database,
		options: &OpOptions,
	) -> QfsResult<()> {
		let site_name = self.site.site_name().await?;
		let workers = if options.workers == 0 { DEFAULT_WORKERS } else { options.workers };

		// Deletions first: removed paths, plus superseded keys for changed
		// paths and re-permissioned entries (the key embeds the metadata)
		let mut doomed: Vec<FileInfo> = Vec::new();
		for rec in &d.rm {
			if let Some(existing) = authoritative.get(&rec.path) {
				doomed.push(existing.clone());
			}
		}
		for rec in d.change.iter() {
			if let Some(existing) = authoritative.get(&rec.path) {
				doomed.push(existing.clone());
			}
		}
		for m in &d.meta {
			if let MetaChange::Chmod { path, .. } = m {
				if let Some(existing) = authoritative.get(path) {
					doomed.push(existing.clone());
				}
			}
		}
		if !doomed.is_empty() {
			info!("deleting {} repository object(s)", doomed.len());
			self.repo.remove_records(&doomed).await?;
		}

		// Concurrent stores: new directories, new and changed entries, and
		// re-keyed permission changes
		let mut stores: Vec<FileInfo> = Vec::new();
		stores.extend(d.mkdir.iter().cloned());
		stores.extend(d.add.iter().cloned());
		stores.extend(d.change.iter().cloned());
		for m in &d.meta {
			if let MetaChange::Chmod { path, .. } = m {
				if let Some(rec) = site_db.get(path) {
					stores.push(rec.clone());
				}
			}
		}
		stores.retain(|r| !r.ftype.is_special());

		info!("storing {} repository object(s)", stores.len());
		let root = self.site.top().to_path_buf();
		let repo = self.repo.clone();
		let errors = run_pool(stores, workers, move |rec: FileInfo| {
			let repo = repo.clone();
			let root = root.clone();
			async move { repo.store_record(&root, &rec).await }
		})
		.await;
		crate::concurrent::first_error(errors)?;

		// Regenerate the repository database from what is actually there
		let scan = self.repo.scan(&[], workers).await?;
		let meta = self.repo.upload_db(REPO_DB_NAME, &scan.db).await?;
		self.site.save_cached_repo_db(&scan.db.serialize(), meta.last_modified_ms).await?;
		self.repo.upload_db(&site_name, site_db).await?;
		Ok(())
	}

	// === pull ===

	pub async fn pull(&self, options: &OpOptions) -> QfsResult<()> {
		self.fail_if_busy().await?;
		let site_name = self.site.site_name().await?;

		let cached = self.site.load_cached_repo_db().await?;
		let (repo_db, downloaded) = self.authoritative_repo_db(&cached).await?;

		// The repository's idea of this site; absent means bootstrap
		let mut site_view = match self.repo.download_db(&site_name).await? {
			Some((body, _)) => Database::parse(&body, &[])?,
			None => Database::new(DbFlavor::Qfs),
		};

		let filters = self.fetch_filters(&site_name, true, &options.filters).await?;

		let d = diff(
			&site_view,
			&repo_db,
			&filters,
			DiffOptions {
				repo_rules: true,
				no_special: true,
				checks: true,
				..DiffOptions::default()
			},
		)?;
		self.site.write_marker(PULL_MARKER, &d.render()).await?;

		let conflicts = conflicts_against_tree(&d.checks, self.site.top()).await;
		self.resolve_conflicts(conflicts).await?;

		if options.dry_run {
			print!("{}", d.render());
			return Ok(());
		}

		let fetcher = Arc::new(self.repo.clone());
		let stats = apply_local(
			self.site.top(),
			&d,
			fetcher,
			&mut site_view,
			ApplyOptions {
				no_special: true,
				no_ownerships: true,
				workers: options.workers,
			},
		)
		.await?;
		for e in &stats.errors {
			warn!("apply: {}", e);
		}

		self.repo.upload_db(&site_name, &site_view).await?;
		site_view.write(&self.site.db_path(&site_name)).await?;
		if let Some((body, origin)) = downloaded {
			self.site.save_cached_repo_db(&body, origin).await?;
		}
		self.site.remove_marker(PUSH_MARKER).await?;
		Ok(())
	}

	/// The filter set push and pull run under: the repository's filters
	/// fetched to a temporary directory (so `:read:` finds siblings there),
	/// the site filter falling back to the local copy, and, on pull only,
	/// an exclude-all bootstrap when no site filter exists yet
	async fn fetch_filters(
		&self,
		site_name: &str,
		bootstrap: bool,
		extra: &[Filter],
	) -> QfsResult<Vec<Filter>> {
		static SEQ: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
		let tmp = std::env::temp_dir().join(format!(
			"qfs-filters-{}-{}",
			std::process::id(),
			SEQ.fetch_add(1, std::sync::atomic::Ordering::SeqCst)
		));
		tokio::fs::create_dir_all(&tmp)
			.await
			.map_err(|e| QfsError::io(tmp.clone(), e))?;
		let fetched = self.repo.download_filters(&tmp).await?;

		let mut filters = Vec::new();
		if fetched.iter().any(|n| n == REPO_DB_NAME) {
			filters.push(parse_filter_file(&tmp.join(REPO_DB_NAME))?);
		} else if self.site.filter_path(REPO_DB_NAME).is_file() {
			filters.push(parse_filter_file(&self.site.filter_path(REPO_DB_NAME))?);
		}

		if fetched.iter().any(|n| n == site_name) {
			filters.push(parse_filter_file(&tmp.join(site_name))?);
		} else if self.site.filter_path(site_name).is_file() {
			filters.push(parse_filter_file(&self.site.filter_path(site_name))?);
		} else if bootstrap {
			info!("no site filter; bootstrapping with exclude-all");
			let mut exclude_all = Filter::new();
			exclude_all.set_default_include(false);
			filters.push(exclude_all);
		}

		let _ = tokio::fs::remove_dir_all(&tmp).await;
		filters.extend_from_slice(extra);
		Ok(filters)
	}

	// === push-db ===

	/// Declare the site's current tree as its known state, without pushing
	pub async fn push_db(&self, options: &OpOptions) -> QfsResult<()> {
		let site_name = self.site.site_name().await?;
		let filters = self.fetch_filters(&site_name, false, &options.filters).await?;
		let site_db = self.fresh_site_db(&filters, options).await?;
		site_db.write(&self.site.db_path(&site_name)).await?;
		if options.dry_run {
			info!("dry run: not uploading {} record(s)", site_db.len());
			return Ok(());
		}
		self.repo.upload_db(&site_name, &site_db).await?;
		Ok(())
	}

	// === push-times ===

	/// Re-key repository objects whose recorded mtime disagrees with the
	/// local tree while the content size still matches. No data moves;
	/// everything is server-side CopyObject.
	pub async fn push_times(&self, options: &OpOptions) -> QfsResult<()> {
		self.fail_if_busy().await?;
		let site_name = self.site.site_name().await?;
		let filters = self.fetch_filters(&site_name, false, &options.filters).await?;
		let site_db = self.fresh_site_db(&filters, options).await?;
		let cached = self.site.load_cached_repo_db().await?;
		let (authoritative, _) = self.authoritative_repo_db(&cached).await?;

		let mut moves: Vec<(String, String)> = Vec::new();
		for (path, local) in site_db.iter() {
			if local.ftype != FileType::File {
				continue;
			}
			if let Some(remote) = authoritative.get(path) {
				if remote.ftype == FileType::File
					&& remote.size == local.size
					&& remote.mtime_ms != local.mtime_ms
				{
					let from = self.repo.key_for(remote);
					let to = self.repo.key_for(local);
					moves.push((from, to));
				}
			}
		}
		if moves.is_empty() {
			info!("no times to repair");
			return Ok(());
		}
		if options.dry_run {
			for (from, to) in &moves {
				println!("rekey {} -> {}", from, to);
			}
			return Ok(());
		}

		self.repo.mark_busy().await?;
		let result = async {
			info!("re-keying {} object(s)", moves.len());
			let mut old_keys = Vec::with_capacity(moves.len());
			for (from, to) in &moves {
				self.repo.store().copy(from, to).await?;
				old_keys.push(from.clone());
			}
			self.repo.remove_keys(&old_keys).await?;
			let scan = self.repo.scan(&[], effective_workers(options)).await?;
			let meta = self.repo.upload_db(REPO_DB_NAME, &scan.db).await?;
			self.site.save_cached_repo_db(&scan.db.serialize(), meta.last_modified_ms).await?;
			Ok(())
		}
		.await;
		if result.is_ok() {
			self.repo.clear_busy().await?;
		}
		result
	}

	// === init-repo ===

	pub async fn init_repo(&self, mode: InitMode, options: &OpOptions) -> QfsResult<()> {
		self.fail_if_busy().await?;
		if self.repo.find_db(REPO_DB_NAME).await?.is_some() {
			let proceed = self
				.confirmer
				.confirm("Repository is already initialized. Rebuild its database?", false)
				.await?;
			if !proceed {
				info!("leaving repository unchanged");
				return Ok(());
			}
		}

		let workers = effective_workers(options);
		let filters = match mode {
			InitMode::CleanRepo => {
				let site_name = self.site.site_name().await?;
				self.fetch_filters(&site_name, false, &options.filters).await?
			}
			_ => Vec::new(),
		};

		self.repo.mark_busy().await?;
		let result = async {
			let mut scan = self.repo.scan(&filters, workers).await?;

			if mode == InitMode::Migrate {
				let migrated = self.migrate_legacy_keys(&scan).await?;
				if migrated > 0 {
					scan = self.repo.scan(&filters, workers).await?;
				}
			}

			if mode == InitMode::CleanRepo && !scan.extra_keys.is_empty() {
				for key in &scan.extra_keys {
					println!("extra: {}", key);
				}
				let delete = self
					.confirmer
					.confirm(
						&format!("Delete {} extra key(s)?", scan.extra_keys.len()),
						false,
					)
					.await?;
				if delete {
					self.repo.remove_keys(&scan.extra_keys).await?;
				}
			}

			let meta = self.repo.upload_db(REPO_DB_NAME, &scan.db).await?;
			self.site.save_cached_repo_db(&scan.db.serialize(), meta.last_modified_ms).await?;
			Ok(())
		}
		.await;
		if result.is_ok() {
			self.repo.clear_busy().await?;
		}
		result
	}

	/// `aws s3 sync` semantics: a plain key naming a local file whose
	/// object stamp is newer than the local mtime is re-keyed in place;
	/// everything else is left alone
	async fn migrate_legacy_keys(&self, scan: &RepoScan) -> QfsResult<usize> {
		let mut migrated = 0;
		for key in &scan.extra_keys {
			let tail = match key.strip_prefix(&format!("{}/", self.repo.prefix())) {
				Some(t) => t.to_string(),
				None if self.repo.prefix().is_empty() => key.clone(),
				None => continue,
			};
			if decode_key(&tail).is_some() {
				continue; // a stale duplicate, not a legacy key
			}
			let local = self.site.top().join(&tail);
			let meta = match tokio::fs::symlink_metadata(&local).await {
				Ok(m) if m.is_file() => m,
				_ => continue,
			};
			let object = match self.repo.store().head(key).await? {
				Some(o) => o,
				None => continue,
			};
			let local_mtime = mtime_ms_from_metadata(&meta);
			if object.last_modified_ms <= local_mtime {
				continue;
			}
			use std::os::unix::fs::MetadataExt;
			let info = FileInfo {
				path: tail.clone(),
				ftype: FileType::File,
				mtime_ms: local_mtime,
				size: meta.len(),
				mode: meta.mode() & 0o7777,
				uid: 0,
				gid: 0,
				special: String::new(),
				dev: 0,
				s3_time_ms: None,
			};
			let new_key = self.repo.key_for(&info);
			info!("migrating {} -> {}", key, new_key);
			self.repo.store().copy(key, &new_key).await?;
			self.repo.remove_keys(std::slice::from_ref(key)).await?;
			migrated += 1;
		}
		Ok(migrated)
	}

	// === list-versions / get ===

	pub async fn list_versions(&self, path: &str) -> QfsResult<()> {
		let versions = self.repo.versions_of(path).await?;
		if versions.is_empty() {
			return Err(QfsError::other(format!("{}: no versions found", path)));
		}
		for v in versions {
			let marker = if v.delete_marker {
				" delete-marker"
			} else if v.is_latest {
				" latest"
			} else {
				""
			};
			println!("{} {} {}{}", v.last_modified_ms, v.version_id, v.key, marker);
		}
		Ok(())
	}

	pub async fn get(&self, path: &str, version_id: Option<&str>, dest: &Path) -> QfsResult<()> {
		self.repo.fetch_version(path, version_id, dest).await
	}
}

fn effective_workers(options: &OpOptions) -> usize {
	if options.workers == 0 {
		DEFAULT_WORKERS
	} else {
		options.workers
	}
}

/// Conflicts against a database: present with an unexpected mtime
fn conflicts_against_db(checks: &[Check], db: &Database) -> Vec<String> {
	let mut out = Vec::new();
	for check in checks {
		if let Some(rec) = db.get(&check.path) {
			if !check.mtimes.contains(&rec.mtime_ms) {
				out.push(check.path.clone());
			}
		}
	}
	out
}

/// Conflicts against the local tree: present with an unexpected mtime
async fn conflicts_against_tree(checks: &[Check], top: &Path) -> Vec<String> {
	let mut out = Vec::new();
	for check in checks {
		let abs = top.join(&check.path);
		if let Ok(meta) = tokio::fs::symlink_metadata(&abs).await {
			if !check.mtimes.contains(&mtime_ms_from_metadata(&meta)) {
				out.push(check.path.clone());
			}
		}
	}
	out
}

// === scan / diff / sync entry points ===

/// What a scan or diff positional argument names
#[derive(Clone, PartialEq, Debug)]
pub enum TreeRef {
	Dir(PathBuf),
	DbFile(PathBuf),
	/// The repository database (`repo:`)
	Repo,
	/// A site database on the repository (`repo:<site>`)
	RepoSite(String),
	/// A raw prefix to scan (`s3://bucket/prefix`)
	S3(String),
}

/// Classify a scan/diff input argument
pub fn parse_tree_ref(arg: &str) -> TreeRef {
	if arg == "repo:" {
		TreeRef::Repo
	} else if let Some(site) = arg.strip_prefix("repo:") {
		TreeRef::RepoSite(site.to_string())
	} else if arg.starts_with("s3://") {
		TreeRef::S3(arg.to_string())
	} else {
		let path = PathBuf::from(arg);
		if path.is_file() {
			TreeRef::DbFile(path)
		} else {
			TreeRef::Dir(path)
		}
	}
}

/// Load a database for a scan/diff input. `coordinator` is required for the
/// `repo:` forms. Returns the database and whether it is repository-shaped.
pub async fn load_tree(
	tree: &TreeRef,
	coordinator: Option<&Coordinator>,
	filters: &[Filter],
	options: &OpOptions,
) -> QfsResult<(Database, bool)> {
	match tree {
		TreeRef::Dir(path) => {
			let source = Arc::new(LocalSource::open(path)?);
			let result = traverse(
				source,
				DbFlavor::Qfs,
				TraverseOptions {
					filters: filters.to_vec(),
					files_only: options.files_only,
					no_special: options.no_special,
					cleanup: options.cleanup,
					same_device: true,
					workers: options.workers,
				},
			)
			.await?;
			for e in &result.errors {
				warn!("scan: {}", e);
			}
			Ok((result.db, false))
		}
		TreeRef::DbFile(path) => {
			let db = Database::read_filtered(path, filters).await?;
			let repoish = db.flavor == DbFlavor::Repo;
			Ok((db, repoish))
		}
		TreeRef::Repo => {
			let c = coordinator
				.ok_or_else(|| QfsError::Usage { message: "repo: needs a site".to_string() })?;
			let (body, _) = c
				.repo()
				.download_db(REPO_DB_NAME)
				.await?
				.ok_or_else(|| QfsError::store_msg("repository has no database"))?;
			Ok((Database::parse(&body, filters)?, true))
		}
		TreeRef::RepoSite(site) => {
			let c = coordinator
				.ok_or_else(|| QfsError::Usage { message: "repo: needs a site".to_string() })?;
			let (body, _) = c.repo().download_db(site).await?.ok_or_else(|| {
				QfsError::store_msg(format!("repository has no database for site {}", site))
			})?;
			Ok((Database::parse(&body, filters)?, true))
		}
		TreeRef::S3(url) => {
			let (bucket, prefix) = parse_s3_url(url)?;
			let store: Arc<dyn ObjectStore> = Arc::new(S3Store::connect(&bucket).await);
			let repo = Repo::new(store, &prefix);
			let db = scan_repo_source(repo, filters, effective_workers(options)).await?;
			Ok((db, true))
		}
	}
}

/// The `sync` command: make `dst` match `src`, both local directories
pub async fn sync_trees(
	src: &Path,
	dst: &Path,
	filters: &[Filter],
	options: &OpOptions,
) -> QfsResult<()> {
	for f in filters {
		if f.has_implicit_includes() {
			return Err(crate::error::FilterError::ImplicitInclude.into());
		}
	}
	let src_source = Arc::new(LocalSource::open(src)?);
	let dst_source = Arc::new(LocalSource::open(dst)?);
	let t_options = TraverseOptions {
		filters: filters.to_vec(),
		files_only: options.files_only,
		no_special: options.no_special,
		cleanup: options.cleanup,
		same_device: true,
		workers: options.workers,
	};
	let to = traverse(src_source, DbFlavor::Qfs, t_options.clone()).await?.db;
	let mut from = traverse(dst_source, DbFlavor::Qfs, t_options).await?.db;

	let d = diff(
		&from,
		&to,
		filters,
		DiffOptions {
			no_special: options.no_special,
			no_ownerships: true,
			..DiffOptions::default()
		},
	)?;
	if options.dry_run {
		print!("{}", d.render());
		return Ok(());
	}
	let stats = apply_local(
		dst,
		&d,
		Arc::new(TreeFetcher::new(src)),
		&mut from,
		ApplyOptions {
			no_special: options.no_special,
			no_ownerships: true,
			workers: options.workers,
		},
	)
	.await?;
	for e in &stats.errors {
		warn!("apply: {}", e);
	}
	Ok(())
}

/// Scan a repository prefix as a tree: list it, then run the traverser over
/// the snapshot so filter semantics match a local scan exactly
pub async fn scan_repo_source(repo: Repo, filters: &[Filter], workers: usize) -> QfsResult<Database> {
	let scan = repo.scan(&[], workers).await?;
	for key in &scan.extra_keys {
		warn!("extra key: {}", key);
	}
	if scan.db.is_empty() {
		return Ok(scan.db);
	}
	let source = Arc::new(RepoSource::new(repo, scan.db));
	let result = traverse(
		source as Arc<dyn Source>,
		DbFlavor::Repo,
		TraverseOptions {
			filters: filters.to_vec(),
			same_device: false,
			workers,
			..TraverseOptions::default()
		},
	)
	.await?;
	Ok(result.db)
}


// vim: ts=4
