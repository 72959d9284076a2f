use clap::{Arg, ArgAction, ArgMatches, Command};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use qfs::confirm::{DefaultAnswer, StdioConfirmer, UserConfirmer};
use qfs::coordinator::{
	load_tree, parse_tree_ref, sync_trees, Coordinator, InitMode, OpOptions, TreeRef,
};
use qfs::diff::DiffOptions;
use qfs::error::{QfsError, QfsResult};
use qfs::filter::{parse_filter_file, Filter, Group};
use qfs::site::Site;

fn filter_args(cmd: Command) -> Command {
	cmd.arg(
		Arg::new("filter")
			.long("filter")
			.value_name("FILE")
			.action(ArgAction::Append)
			.help("Filter file to apply"),
	)
	.arg(
		Arg::new("filter-prune")
			.long("filter-prune")
			.value_name("FILE")
			.action(ArgAction::Append)
			.help("Filter file, prune and junk rules only"),
	)
	.arg(
		Arg::new("include")
			.long("include")
			.value_name("PATH")
			.action(ArgAction::Append)
			.help("Include this path (*/name matches any basename)"),
	)
	.arg(
		Arg::new("exclude")
			.long("exclude")
			.value_name("PATH")
			.action(ArgAction::Append)
			.help("Exclude this path"),
	)
	.arg(
		Arg::new("prune")
			.long("prune")
			.value_name("PATH")
			.action(ArgAction::Append)
			.help("Prune this path and everything beneath it"),
	)
	.arg(
		Arg::new("junk")
			.long("junk")
			.value_name("REGEX")
			.help("Junk regex applied to regular file basenames"),
	)
	.arg(
		Arg::new("files-only")
			.long("files-only")
			.action(ArgAction::SetTrue)
			.help("Only regular files"),
	)
	.arg(
		Arg::new("no-special")
			.long("no-special")
			.action(ArgAction::SetTrue)
			.help("Ignore devices, pipes, and sockets"),
	)
}

fn dry_run_arg(cmd: Command) -> Command {
	cmd.arg(
		Arg::new("dry-run")
			.short('n')
			.long("dry-run")
			.action(ArgAction::SetTrue)
			.help("Show what would be done without doing it"),
	)
}

fn filters_from(matches: &ArgMatches) -> QfsResult<Vec<Filter>> {
	let mut filters = Vec::new();
	if let Some(files) = matches.get_many::<String>("filter") {
		for file in files {
			filters.push(parse_filter_file(Path::new(file))?);
		}
	}
	if let Some(files) = matches.get_many::<String>("filter-prune") {
		for file in files {
			filters.push(parse_filter_file(Path::new(file))?.prune_only());
		}
	}

	let mut cli = Filter::new();
	let mut used = false;
	for (arg, group) in
		[("include", Group::Include), ("exclude", Group::Exclude), ("prune", Group::Prune)]
	{
		if let Some(paths) = matches.get_many::<String>(arg) {
			for path in paths {
				cli.add_path(path, group);
				used = true;
			}
		}
	}
	if let Some(junk) = matches.get_one::<String>("junk") {
		cli.set_junk(junk)?;
		used = true;
	}
	if used {
		filters.push(cli);
	}
	Ok(filters)
}

fn op_options(matches: &ArgMatches) -> QfsResult<OpOptions> {
	Ok(OpOptions {
		filters: filters_from(matches)?,
		files_only: matches.get_flag("files-only"),
		no_special: matches.get_flag("no-special"),
		cleanup: matches.try_get_one::<bool>("cleanup").ok().flatten().copied().unwrap_or(false),
		dry_run: matches.try_get_one::<bool>("dry-run").ok().flatten().copied().unwrap_or(false),
		workers: 0,
	})
}

fn confirmer() -> Arc<dyn UserConfirmer> {
	if qfs::util::stdin_is_tty() {
		Arc::new(StdioConfirmer)
	} else {
		Arc::new(DefaultAnswer)
	}
}

fn site_from(matches: &ArgMatches) -> QfsResult<Site> {
	match matches.get_one::<String>("top") {
		Some(top) => Site::open(Path::new(top)),
		None => {
			let cwd = std::env::current_dir()
				.map_err(|e| QfsError::io(PathBuf::from("."), e))?;
			Site::discover(&cwd)
		}
	}
}

async fn coordinator_from(matches: &ArgMatches) -> QfsResult<Coordinator> {
	Coordinator::connect(site_from(matches)?, confirmer()).await
}

fn cli() -> Command {
	let top = Arg::new("top")
		.long("top")
		.value_name("DIR")
		.help("Site working directory (default: nearest ancestor with .qfs)");

	Command::new("qfs")
		.version(env!("CARGO_PKG_VERSION"))
		.about("Filter-aware file tree synchronizer over an object-store repository")
		.subcommand_required(true)
		.subcommand(
			filter_args(
				Command::new("scan")
					.about("Scan a directory, database, or repository into a database")
					.arg(Arg::new("input").required(true).help(
						"Directory, database file, repo:, repo:<site>, or s3://bucket/prefix",
					))
					.arg(top.clone())
					.arg(
						Arg::new("db")
							.long("db")
							.value_name("FILE")
							.help("Write the database here instead of stdout"),
					)
					.arg(
						Arg::new("cleanup")
							.long("cleanup")
							.action(ArgAction::SetTrue)
							.help("Delete junk files while scanning"),
					),
			),
		)
		.subcommand(
			filter_args(
				Command::new("diff")
					.about("Diff two trees or databases")
					.arg(Arg::new("from").required(true))
					.arg(Arg::new("to").required(true))
					.arg(top.clone())
					.arg(
						Arg::new("checks")
							.long("checks")
							.action(ArgAction::SetTrue)
							.help("Emit conflict check lines"),
					)
					.arg(
						Arg::new("no-ownerships")
							.long("no-ownerships")
							.action(ArgAction::SetTrue)
							.help("Ignore uid/gid differences"),
					)
					.arg(
						Arg::new("no-dir-times")
							.long("no-dir-times")
							.action(ArgAction::SetTrue)
							.help("Ignore directory mtime differences"),
					),
			),
		)
		.subcommand(
			Command::new("init-repo")
				.about("Build the repository database from a full listing")
				.arg(top.clone())
				.arg(
					Arg::new("clean-repo")
						.long("clean-repo")
						.action(ArgAction::SetTrue)
						.help("Also delete extra keys (prompts first)"),
				)
				.arg(
					Arg::new("migrate")
						.long("migrate")
						.action(ArgAction::SetTrue)
						.help("Re-key objects uploaded by a plain sync tool"),
				),
		)
		.subcommand(dry_run_arg(filter_args(
			Command::new("push")
				.about("Push local changes to the repository")
				.arg(top.clone())
				.arg(
					Arg::new("cleanup")
						.long("cleanup")
						.action(ArgAction::SetTrue)
						.help("Delete junk files while scanning"),
				),
		)))
		.subcommand(dry_run_arg(filter_args(
			Command::new("pull")
				.about("Pull repository changes into the local tree")
				.arg(top.clone()),
		)))
		.subcommand(dry_run_arg(filter_args(
			Command::new("push-db")
				.about("Regenerate and upload the site database without pushing")
				.arg(top.clone()),
		)))
		.subcommand(dry_run_arg(filter_args(
			Command::new("push-times")
				.about("Repair repository mtimes from the local tree (CopyObject only)")
				.arg(top.clone()),
		)))
		.subcommand(
			Command::new("list-versions")
				.about("List stored versions of a repository path")
				.arg(Arg::new("path").required(true))
				.arg(top.clone()),
		)
		.subcommand(
			Command::new("get")
				.about("Fetch a repository path, optionally a specific version")
				.arg(Arg::new("path").required(true))
				.arg(Arg::new("dest").required(true))
				.arg(
					Arg::new("version")
						.long("version")
						.value_name("ID")
						.help("Version id from list-versions"),
				)
				.arg(top.clone()),
		)
		.subcommand(dry_run_arg(filter_args(
			Command::new("sync")
				.about("Make one local directory match another")
				.arg(Arg::new("src").required(true))
				.arg(Arg::new("dst").required(true)),
		)))
}

async fn run() -> QfsResult<()> {
	let matches = cli().get_matches();

	match matches.subcommand() {
		Some(("scan", m)) => {
			let options = op_options(m)?;
			let input = parse_tree_ref(m.get_one::<String>("input").expect("required"));
			let coordinator = match input {
				TreeRef::Repo | TreeRef::RepoSite(_) => Some(coordinator_from(m).await?),
				_ => None,
			};
			let (db, _) =
				load_tree(&input, coordinator.as_ref(), &options.filters, &options).await?;
			match m.get_one::<String>("db") {
				Some(out) => db.write(Path::new(out)).await?,
				None => {
					let stdout = std::io::stdout();
					let mut lock = stdout.lock();
					lock.write_all(&db.serialize())
						.and_then(|_| lock.flush())
						.map_err(|e| QfsError::io(PathBuf::from("stdout"), e))?;
				}
			}
			Ok(())
		}
		Some(("diff", m)) => {
			let options = op_options(m)?;
			let from_ref = parse_tree_ref(m.get_one::<String>("from").expect("required"));
			let to_ref = parse_tree_ref(m.get_one::<String>("to").expect("required"));
			let needs_site = |r: &TreeRef| matches!(r, TreeRef::Repo | TreeRef::RepoSite(_));
			let coordinator = if needs_site(&from_ref) || needs_site(&to_ref) {
				Some(coordinator_from(m).await?)
			} else {
				None
			};
			let (from, from_repo) =
				load_tree(&from_ref, coordinator.as_ref(), &options.filters, &options).await?;
			let (to, to_repo) =
				load_tree(&to_ref, coordinator.as_ref(), &options.filters, &options).await?;
			let d = qfs::diff::diff(
				&from,
				&to,
				&options.filters,
				DiffOptions {
					no_ownerships: m.get_flag("no-ownerships"),
					no_special: options.no_special,
					no_dir_times: m.get_flag("no-dir-times"),
					repo_rules: from_repo || to_repo,
					checks: m.get_flag("checks"),
				},
			)?;
			print!("{}", d.render());
			Ok(())
		}
		Some(("init-repo", m)) => {
			let mode = match (m.get_flag("clean-repo"), m.get_flag("migrate")) {
				(true, true) => {
					return Err(QfsError::Usage {
						message: "--clean-repo and --migrate are mutually exclusive".to_string(),
					});
				}
				(true, false) => InitMode::CleanRepo,
				(false, true) => InitMode::Migrate,
				(false, false) => InitMode::Normal,
			};
			coordinator_from(m).await?.init_repo(mode, &OpOptions::default()).await
		}
		Some(("push", m)) => coordinator_from(m).await?.push(&op_options(m)?).await,
		Some(("pull", m)) => coordinator_from(m).await?.pull(&op_options(m)?).await,
		Some(("push-db", m)) => coordinator_from(m).await?.push_db(&op_options(m)?).await,
		Some(("push-times", m)) => coordinator_from(m).await?.push_times(&op_options(m)?).await,
		Some(("list-versions", m)) => {
			coordinator_from(m)
				.await?
				.list_versions(m.get_one::<String>("path").expect("required"))
				.await
		}
		Some(("get", m)) => {
			coordinator_from(m)
				.await?
				.get(
					m.get_one::<String>("path").expect("required"),
					m.get_one::<String>("version").map(|s| s.as_str()),
					Path::new(m.get_one::<String>("dest").expect("required")),
				)
				.await
		}
		Some(("sync", m)) => {
			let options = op_options(m)?;
			sync_trees(
				Path::new(m.get_one::<String>("src").expect("required")),
				Path::new(m.get_one::<String>("dst").expect("required")),
				&options.filters,
				&options,
			)
			.await
		}
		_ => unreachable!("subcommand required"),
	}
}

#[tokio::main]
async fn main() {
	qfs::logging::init_tracing();
	if let Err(e) = run().await {
		eprintln!("qfs: {}", e);
		std::process::exit(1);
	}
}

// vim: ts=4
