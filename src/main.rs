use std::collections::BTreeSet;
use std::path::Path;
use std::process::exit;

use anyhow::{anyhow, Result};
use argh::FromArgs;
use log::{error, info, LevelFilter};

use symboldb::closure;
use symboldb::config;
use symboldb::db::{ops, Database};
use symboldb::gc;
use symboldb::load::rpm_load;
use symboldb::sync::{self, finalize_package_set, SyncOptions};

mod cli;

fn parse_args() -> cli::SymbolDb {
    let args: Vec<String> = std::env::args().collect();
    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
    match cli::SymbolDb::from_args(&arg_refs[..1], &arg_refs[1..]) {
        Ok(parsed) => parsed,
        Err(early_exit) => {
            // Usage errors exit with 2, --help with 0.
            match early_exit.status {
                Ok(()) => {
                    println!("{}", early_exit.output);
                    exit(0);
                }
                Err(()) => {
                    eprintln!("{}", early_exit.output);
                    exit(2);
                }
            }
        }
    }
}

#[tokio::main]
async fn main() {
    let args = parse_args();
    let level = if args.verbose {
        LevelFilter::Debug
    } else if args.quiet {
        LevelFilter::Error
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();

    if let Err(e) = run(args).await {
        error!("{:#}", e);
        exit(1);
    }
}

async fn run(args: cli::SymbolDb) -> Result<()> {
    let config = match &args.config {
        Some(path) => config::parse_config(path)?,
        None => config::Config::default(),
    };
    let sync_options = SyncOptions {
        cache_dir: config::cache_dir(&config, args.cache.as_deref()),
        no_net: args.no_net,
        exclude_name: args
            .exclude_name
            .as_deref()
            .map(regex::Regex::new)
            .transpose()?,
        set_name: args.set.clone(),
        ignore_download_errors: args.ignore_download_errors,
    };

    info!("Connecting to database...");
    let db = Database::connect(&config::database_conninfo(&config)).await?;

    match args.command {
        cli::SymbolDbCommand::CreateSchema(_) => {
            db.create_schema(true, true).await?;
            info!("Schema created.");
        }
        cli::SymbolDbCommand::LoadRpm(load) => {
            load_rpms(&db, &load.paths, args.set.as_deref()).await?;
        }
        cli::SymbolDbCommand::CreateSet(create) => {
            let set = {
                let mut conn = db.pool().acquire().await?;
                if ops::lookup_package_set(&mut conn, &create.name)
                    .await?
                    .is_some()
                {
                    return Err(anyhow!("package set already exists: {}", create.name));
                }
                ops::create_package_set(&mut conn, &create.name).await?
            };
            let mut pids = BTreeSet::new();
            for path in &create.paths {
                pids.insert(rpm_load(&db, Path::new(path)).await?);
            }
            finalize_package_set(&db, set, &pids).await?;
        }
        cli::SymbolDbCommand::UpdateSetFromRepo(update) => {
            let opts = SyncOptions {
                set_name: Some(update.name.clone()),
                ..sync_options
            };
            sync::download_repo(&db, &opts, &update.urls, true).await?;
        }
        cli::SymbolDbCommand::DownloadRepo(download) => {
            sync::download_repo(&db, &sync_options, &download.urls, false).await?;
        }
        cli::SymbolDbCommand::ShowSonameConflicts(show) => {
            let mut conn = db.pool().acquire().await?;
            let set = ops::lookup_package_set(&mut conn, &show.set)
                .await?
                .ok_or_else(|| anyhow!("unknown package set: {}", show.set))?;
            drop(conn);
            closure::print_soname_conflicts(&db, set).await?;
        }
        cli::SymbolDbCommand::Expire(_) => {
            gc::run_expire(&db).await?;
        }
    }
    Ok(())
}

/// Load packages; with `--set`, the loaded packages join the set and
/// its caches are rebuilt.
async fn load_rpms(db: &Database, paths: &[String], set_name: Option<&str>) -> Result<()> {
    let set = match set_name {
        Some(name) => {
            let mut conn = db.pool().acquire().await?;
            Some(
                ops::lookup_package_set(&mut conn, name)
                    .await?
                    .ok_or_else(|| anyhow!("unknown package set: {}", name))?,
            )
        }
        None => None,
    };
    let mut pids = BTreeSet::new();
    for path in paths {
        pids.insert(rpm_load(db, Path::new(path)).await?);
    }
    if let Some(set) = set {
        let mut conn = db.pool().acquire().await?;
        let mut members = ops::package_set_members(&mut conn, set).await?;
        drop(conn);
        members.extend(pids);
        finalize_package_set(db, set, &members).await?;
    }
    Ok(())
}
