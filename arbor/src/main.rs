use std::path::PathBuf;

use arbor::config::{EngineConfig, RecordManagerOptions};
use arbor::storage::RecordManager;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "arbor=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // A path argument wins over ARBOR_DATABASE_PATH; options still come
    // from the environment when it is set.
    let config = match (std::env::args_os().nth(1), EngineConfig::from_env()) {
        (Some(path), Ok(config)) => EngineConfig {
            database_path: PathBuf::from(path),
            ..config
        },
        (Some(path), Err(_)) => EngineConfig {
            database_path: PathBuf::from(path),
            options: RecordManagerOptions::default(),
        },
        (None, Ok(config)) => config,
        (None, Err(e)) => {
            tracing::error!("Failed to load configuration: {e}");
            eprintln!("usage: arbor [DATABASE_PATH]");
            std::process::exit(2);
        }
    };

    tracing::info!(
        "Loaded configuration: database_path={}, page_size={}, max_node_entries={}",
        config.database_path.display(),
        config.options.page_size,
        config.options.max_node_entries
    );

    if let Err(e) = run(&config) {
        tracing::error!("Failed to inspect {}: {e}", config.database_path.display());
        std::process::exit(1);
    }
}

fn run(config: &EngineConfig) -> Result<(), arbor::StoreError> {
    let manager = RecordManager::open(&config.database_path, config.options)?;
    let recovery = manager.recovery();
    if !recovery.is_clean() {
        println!(
            "recovered: {} committed transactions replayed, {} discarded",
            recovery.transactions_replayed, recovery.transactions_discarded
        );
    }

    let stats = manager.stats()?;
    println!(
        "{} byte pages, {} total, {} free",
        manager.page_size(),
        stats.total_pages,
        stats.free_pages
    );

    for name in manager.table_names()? {
        if let Some(info) = manager.table_info(&name)? {
            println!(
                "{}\t{} entries\theight {}\t{}",
                info.name, info.size, info.height, info.descriptor
            );
        }
    }
    manager.close()
}
