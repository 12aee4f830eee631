use anyhow::{Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use rollout_artifact::{BuildCatalog, DirectoryCatalog};
use rollout_kernel::config::DeployConfig;
use rollout_kernel::logging::init_tracing;
use rollout_kernel::store::{pending_migrations, JsonFileRecordStore, RecordStore};
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG: &str = "rollout.toml";

fn cli() -> Command {
    Command::new("rollout")
        .version(rollout_kernel::VERSION)
        .about("Inspect and maintain deployment records")
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Config file (defaults to ./rollout.toml when present)"),
        )
        .arg(
            Arg::new("store")
                .long("store")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Record store directory, overriding [store] dir"),
        )
        .subcommand_required(true)
        .subcommand(
            Command::new("records")
                .about("Work with stored deployment records")
                .subcommand_required(true)
                .subcommand(
                    Command::new("list").about("List stored records").arg(
                        Arg::new("json")
                            .long("json")
                            .action(ArgAction::SetTrue)
                            .help("Output as JSON"),
                    ),
                )
                .subcommand(
                    Command::new("show")
                        .about("Print one record")
                        .arg(Arg::new("name").required(true)),
                )
                .subcommand(
                    Command::new("delete")
                        .about("Delete one record")
                        .arg(Arg::new("name").required(true)),
                ),
        )
        .subcommand(Command::new("pending").about("List migrations waiting to be promoted"))
        .subcommand(Command::new("builds").about("List build outputs in the catalog directory"))
        .subcommand(Command::new("config").about("Print the effective configuration"))
}

fn load_config(matches: &ArgMatches) -> Result<DeployConfig> {
    let mut config = match matches.get_one::<PathBuf>("config") {
        Some(path) => DeployConfig::load(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None if Path::new(DEFAULT_CONFIG).exists() => {
            DeployConfig::load(DEFAULT_CONFIG).context("failed to load rollout.toml")?
        }
        None => DeployConfig::default(),
    };
    if let Some(dir) = matches.get_one::<PathBuf>("store") {
        config = config.with_store_dir(dir.clone());
    }
    Ok(config)
}

fn records(config: &DeployConfig, matches: &ArgMatches) -> Result<()> {
    let store = JsonFileRecordStore::new(&config.store.dir);
    match matches.subcommand() {
        Some(("list", args)) => {
            let mut records = Vec::new();
            for name in store.names()? {
                records.push((name.clone(), store.get(&name)?));
            }
            if args.get_flag("json") {
                let map: serde_json::Map<String, serde_json::Value> = records
                    .into_iter()
                    .map(|(name, record)| Ok((name, serde_json::to_value(record)?)))
                    .collect::<Result<_, serde_json::Error>>()?;
                println!("{}", serde_json::to_string_pretty(&map)?);
            } else {
                for (name, record) in records {
                    let fingerprint = record
                        .code_fingerprint
                        .map_or_else(|| "-".to_string(), |fp| fp.short());
                    println!(
                        "{name:<32} {:<11} {:<44} {fingerprint}",
                        record.kind.as_str(),
                        record.address.as_str()
                    );
                }
            }
        }
        Some(("show", args)) => {
            let name = args.get_one::<String>("name").context("missing name")?;
            let record = store.get(name)?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Some(("delete", args)) => {
            let name = args.get_one::<String>("name").context("missing name")?;
            store.delete(name)?;
            tracing::info!(name = %name, "record deleted");
            println!("deleted {name}");
        }
        _ => unreachable!("subcommand required"),
    }
    Ok(())
}

fn main() -> Result<()> {
    let matches = cli().get_matches();
    let config = load_config(&matches)?;
    let _ = init_tracing(&config.logging);

    match matches.subcommand() {
        Some(("records", args)) => records(&config, args)?,
        Some(("pending", _)) => {
            let store = JsonFileRecordStore::new(&config.store.dir);
            let pending = pending_migrations(&store, &config.migration.shadow_suffix)?;
            if pending.is_empty() {
                println!("no pending migrations");
            }
            for name in pending {
                println!("{name} -> {name}{}", config.migration.shadow_suffix);
            }
        }
        Some(("builds", _)) => {
            let catalog = DirectoryCatalog::new(&config.catalog.dir);
            for name in catalog.names()? {
                let fingerprint = catalog
                    .lookup(&name)?
                    .map_or_else(|| "-".to_string(), |entry| entry.fingerprint().short());
                println!("{name:<32} {fingerprint}");
            }
        }
        Some(("config", _)) => print!("{}", config.to_toml_string()?),
        _ => unreachable!("subcommand required"),
    }
    Ok(())
}
