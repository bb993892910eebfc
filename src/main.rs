use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use vanopticon_bifrost::{MIN_VERSION, Replica, ReplicaOptions, config, observability, sync};

#[derive(Parser)]
#[command(name = "bifrost", about = "Bifrost - conflict-free replicated SQLite tables")]
struct Cli {
	/// Replica database (overrides the configured one)
	#[arg(long, global = true, env = "BFT_DATABASE")]
	db: Option<PathBuf>,
	/// Print Prometheus metrics after the command finishes
	#[arg(long, global = true)]
	metrics: bool,
	#[command(subcommand)]
	command: Commands,
}

#[derive(Subcommand)]
enum Commands {
	/// Print this replica's site id
	SiteId,
	/// Print the current database version
	DbVersion,
	/// Print the Site Version Table
	SiteVersions,
	/// Start tracking a table
	Track { table: String },
	/// Run DDL against a tracked table and compact its change log
	Alter { table: String, ddl: String },
	/// Write change records as NDJSON
	Changes {
		/// Only records with a database version above this one
		#[arg(long, default_value_t = MIN_VERSION)]
		since: i64,
		/// Output file (stdout when omitted)
		#[arg(long)]
		out: Option<PathBuf>,
	},
	/// Merge an NDJSON changeset
	Merge { file: PathBuf },
	/// Pull every unseen change from another replica into this one
	Sync { from: PathBuf },
	/// List tracked peer cursors
	Peers,
}

fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();

	let mut settings = match config::load() {
		Ok(s) => s,
		Err(e) => {
			eprintln!("failed to load config, using defaults: {}", e);
			config::Settings::default()
		}
	};
	if let Some(db) = cli.db {
		settings.database = db;
	}

	let state = observability::init_observability(&settings)?;
	let mut replica = Replica::open_with_settings(&settings)
		.with_context(|| format!("failed to open replica '{}'", settings.database.display()))?
		.with_metrics(state.metrics.clone());

	match cli.command {
		Commands::SiteId => println!("{}", replica.site_id()),
		Commands::DbVersion => println!("{}", replica.db_version()),
		Commands::SiteVersions => {
			for entry in replica.site_versions()? {
				println!("{}\t{}", entry.site_id, entry.version);
			}
		}
		Commands::Track { table } => {
			replica.track_table(&table)?;
			println!("tracking '{}' at db_version {}", table, replica.db_version());
		}
		Commands::Alter { table, ddl } => {
			replica.alter_table(&table, &ddl)?;
			println!("altered '{}' at db_version {}", table, replica.db_version());
		}
		Commands::Changes { since, out } => {
			let written = match out {
				Some(path) => {
					let file = File::create(&path)
						.with_context(|| format!("failed to create '{}'", path.display()))?;
					sync::write_ndjson(&mut BufWriter::new(file), replica.changes_since(since)?)?
				}
				None => {
					let stdout = std::io::stdout();
					sync::write_ndjson(&mut stdout.lock(), replica.changes_since(since)?)?
				}
			};
			log::info!("wrote {} change records", written);
		}
		Commands::Merge { file } => {
			let reader = File::open(&file)
				.with_context(|| format!("failed to open '{}'", file.display()))?;
			let records = sync::read_ndjson(BufReader::new(reader))?;
			let report = replica.merge(&records)?;
			println!("{}", serde_json::to_string_pretty(&report)?);
		}
		Commands::Sync { from } => {
			let options = ReplicaOptions::from(&settings);
			let mut source = Replica::open_with(&from, &options)
				.with_context(|| format!("failed to open replica '{}'", from.display()))?;
			let report = sync::sync(&mut source, &mut replica)?;
			println!("{}", serde_json::to_string_pretty(&report)?);
		}
		Commands::Peers => {
			for peer in replica.tracked_peers()? {
				println!("{}\t{:?}\t{}", peer.site_id, peer.event, peer.version);
			}
		}
	}

	if cli.metrics {
		let mut stdout = std::io::stdout().lock();
		stdout.write_all(state.metrics.encode().as_bytes())?;
	}
	Ok(())
}
