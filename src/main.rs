mod account;
mod builder;
mod codec;
mod config;
mod confirmation;
mod coordinator;
mod db;
mod price;
mod rpc;
#[cfg(test)]
mod test_util;
mod tx;
mod types;
mod watchers;

use std::sync::Arc;
use std::time::Duration;

use builder::{BuilderManager, MintBuilder, UnlockBuilder};
use config::Config;
use confirmation::{ConfirmationConfig, ConfirmationTracker};
use coordinator::{HttpSignerClient, RetryConfig, SignatureCoordinator, SignerClient};
use db::{PgStore, Store};
use price::{CachedPriceSource, HttpPriceSource, PriceSource};
use rpc::{ChainRpc, JsonRpcChainClient};
use watchers::{ShadowWatcher, SourceWatcher, WatcherManager};

fn main() -> eyre::Result<()> {
    // Install color-eyre for better error reporting
    color_eyre::install()?;

    // Run the async main
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    // Initialize logging
    init_logging();

    tracing::info!("Starting ShadowBridge Relayer");

    // Load configuration
    let config = Config::load()?;
    tracing::info!(
        verifiers = config.signers.endpoints.len(),
        threshold = config.signers.threshold,
        assets = config.assets.len(),
        "Configuration loaded"
    );

    // Connect to database
    let pool = db::create_pool(&config.database.url).await?;
    tracing::info!("Database connected");

    // Run migrations
    db::run_migrations(&pool).await?;
    tracing::info!("Database migrations complete");

    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool));
    let source_rpc: Arc<dyn ChainRpc> =
        Arc::new(JsonRpcChainClient::new(config.source.rpc_url.clone())?);
    let shadow_rpc: Arc<dyn ChainRpc> =
        Arc::new(JsonRpcChainClient::new(config.shadow.rpc_url.clone())?);

    let assets = config.asset_list()?;
    let multisig = config.multisig_config()?;
    let hot_key = config.hot_key()?;

    // Create shutdown channels
    let (shutdown_tx, shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
    let (shutdown_tx2, shutdown_rx2) = tokio::sync::mpsc::channel::<()>(1);

    // Setup signal handlers
    let shutdown_tx_signal = shutdown_tx.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = shutdown_tx_signal.send(()).await;
        let _ = shutdown_tx2.send(()).await;
    });

    // Watchers
    let shadow_watcher = ShadowWatcher::new(
        shadow_rpc.clone(),
        store.clone(),
        watchers::shadow::ShadowWatcherConfig {
            token_code_hash: config.shadow.token_code_hash.clone(),
            tracking_code_hash: config.shadow.tracking_code_hash.clone(),
            burn_lock: config.burn_lock(),
            owner_tag_prefix: format!("0x{}", hex::encode(config.owner_tag()?)),
            start_block_height: config.shadow.start_block_height,
        },
        &assets,
    );
    let source_watcher = SourceWatcher::new(
        source_rpc.clone(),
        store.clone(),
        watchers::source::SourceWatcherConfig {
            escrow_lock: config.escrow_lock(),
            native_asset_id: config.source.native_asset_id.clone(),
            shadow_address_prefix: config.shadow.address_prefix.clone(),
            start_block_height: config.source.start_block_height,
        },
    );
    let watcher_manager = WatcherManager::new(shadow_watcher, source_watcher);

    // Confirmation tracker
    let price: Arc<dyn PriceSource> = Arc::new(CachedPriceSource::new(
        HttpPriceSource::new(config.relayer.price_api_url.clone())?,
        Duration::from_secs(config.relayer.price_cache_ttl_secs),
    ));
    let confirmation = ConfirmationTracker::new(
        source_rpc.clone(),
        shadow_rpc.clone(),
        store.clone(),
        price,
        &assets,
        ConfirmationConfig {
            source_required_confirmations: config.source.required_confirmations,
            shadow_required_confirmations: config.shadow.required_confirmations,
            audit_threshold_usd: config.relayer.audit_threshold_usd,
        },
    );

    // Builders share one signer transport; mints wait for the shadow watcher
    // to pass the tip seen here so prior mints are recognized first.
    let signer: Arc<dyn SignerClient> =
        Arc::new(HttpSignerClient::new(Duration::from_secs(30))?);
    let sync_barrier_height = shadow_rpc.tip_height().await?;

    let mint_builder = MintBuilder::new(
        shadow_rpc.clone(),
        store.clone(),
        SignatureCoordinator::new(
            signer.clone(),
            config.verifiers()?,
            config.signers.threshold,
            RetryConfig::default(),
        ),
        multisig.clone(),
        hot_key,
        &assets,
        builder::mint::MintBuilderConfig {
            token_code_hash: config.shadow.token_code_hash.clone(),
            tracking_code_hash: config.shadow.tracking_code_hash.clone(),
            recipient_code_hash: config.shadow.recipient_code_hash.clone(),
            funding_lock: config.funding_lock(),
            batch_limit: config.relayer.mint_batch_limit,
            sync_barrier_height,
        },
    );
    let unlock_builder = UnlockBuilder::new(
        source_rpc.clone(),
        store.clone(),
        SignatureCoordinator::new(
            signer,
            config.verifiers()?,
            config.signers.threshold,
            RetryConfig::default(),
        ),
        multisig,
        hot_key,
        builder::unlock::UnlockBuilderConfig {
            escrow_lock: config.escrow_lock(),
            recipient_code_hash: config.source.recipient_code_hash.clone(),
        },
    );
    let mut builder_manager = BuilderManager::new(confirmation, mint_builder, unlock_builder);

    tracing::info!("Managers initialized, starting processing");

    // Run watchers and builders concurrently
    tokio::select! {
        result = watcher_manager.run(shutdown_rx) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Watcher manager error");
            }
        }
        result = builder_manager.run(shutdown_rx2) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Builder manager error");
            }
        }
    }

    tracing::info!("ShadowBridge Relayer stopped");
    Ok(())
}

/// Initialize tracing/logging with structured output
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,shadowbridge_relayer=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(filter)
        .init();
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
