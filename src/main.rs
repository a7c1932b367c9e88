use std::sync::Arc;

use tracing::{error, info};

use hoard::{
    Config, Database, FileService, NewOwner, OwnerRepository, PolicyRepository, PolicyResolver,
    RecycleSweeper,
};

/// Owner created on first start so a fresh install has someone to hold files.
const BOOTSTRAP_OWNER: &str = "admin";

#[tokio::main]
async fn main() {
    // Load configuration
    let mut config = match Config::load("config.toml") {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config.toml: {e}");
            eprintln!("Using default configuration.");
            Config::default()
        }
    };
    config.apply_env_overrides();
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {e}");
        std::process::exit(1);
    }

    // Initialize logging
    if let Err(e) = hoard::logging::init(&config.logging) {
        eprintln!("Failed to initialize logging: {e}");
        // Fall back to console-only logging
        hoard::logging::init_console_only(&config.logging.level);
    }

    info!("Hoard - content-addressed file storage");

    if let Err(e) = run(config).await {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}

async fn run(config: Config) -> hoard::Result<()> {
    let db = Database::open_with(&config.database.path, config.database.max_connections).await?;
    info!(path = %config.database.path, "database ready");

    let policy = PolicyRepository::new(db.pool())
        .ensure_default_local(&config.storage.local_root)
        .await?;
    info!(policy_id = policy.id, name = %policy.name, "default storage policy");

    let owners = OwnerRepository::new(db.pool());
    if owners.get_by_username(BOOTSTRAP_OWNER).await?.is_none() {
        let owner = owners
            .create(&NewOwner::new(BOOTSTRAP_OWNER, config.quota.default_total_bytes))
            .await?;
        info!(owner_id = owner.id, total = owner.total_size, "created bootstrap owner");
    }

    let db = Arc::new(db);
    let service = FileService::new(Arc::clone(&db), Arc::new(PolicyResolver::pooled()))
        .with_index_text_limit(config.storage.index_text_limit_bytes);

    let sweeper = if config.recycle.enabled {
        let sweeper = RecycleSweeper::new(
            service.clone(),
            config.recycle.retention_days,
            config.recycle.sweep_interval_secs,
        );
        let token = sweeper.cancel_token();
        Some((token, sweeper.spawn()))
    } else {
        info!("recycle sweeper disabled");
        None
    };

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    if let Some((token, handle)) = sweeper {
        token.cancel();
        if let Err(e) = handle.await {
            error!("recycle sweeper task failed: {}", e);
        }
    }
    db.close().await;
    Ok(())
}
