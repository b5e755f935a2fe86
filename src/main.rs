#![deny(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use directories_next::ProjectDirs;
use ethers::providers::{JsonRpcClient, Middleware};
use futures::Future;
use structopt::StructOpt;
use tokio::signal::unix;
use tokio::sync::mpsc;
use warp::Filter;

use rsk_oracle_bridge::chainlink::{ChainlinkApi, JobService};
use rsk_oracle_bridge::config;
use rsk_oracle_bridge::context::BridgeContext;
use rsk_oracle_bridge::handler;
use rsk_oracle_bridge::service;
use rsk_oracle_bridge::store::sled::SledStore;
use rsk_oracle_bridge::store::{CredentialStore, Subscription, SubscriptionStore};
use rsk_oracle_bridge::trigger::JobTrigger;
use rsk_oracle_bridge::tx_submitter::TransactionSubmitter;

const PACKAGE_ID: [&str; 3] = ["tools", "chainlink", "rsk-oracle-bridge"];

/// The RSK Oracle Bridge Command-line tool
///
/// Start the bridge with the configuration read from the environment:
///
///     $ rsk-oracle-bridge -vvv
#[derive(StructOpt)]
#[structopt(name = "RSK Oracle Bridge")]
struct Opts {
    /// A level of verbosity, and can be used multiple times
    #[structopt(short, long, parse(from_occurrences))]
    verbose: i32,
    /// Create the Database Store in a temporary directory.
    /// and will be deleted when the process exits.
    #[structopt(long)]
    tmp: bool,
}

#[paw::main]
#[tokio::main]
async fn main(args: Opts) -> anyhow::Result<()> {
    setup_logger(args.verbose)?;
    match dotenv::dotenv() {
        Ok(_) => {
            tracing::trace!("Loaded .env file");
        }
        Err(e) => {
            tracing::warn!("Failed to load .env file: {}", e);
        }
    }
    let config = config::load()?;
    let ctx = BridgeContext::new(config);
    let store = create_store(&args)?;

    // the signing account; waits for the RSK node to come up.
    let provider = Arc::new(ctx.connect_evm_provider().await?);
    let chain_id = provider.get_chainid().await?;
    tracing::info!(
        "Connected to the RSK node. Chain ID: {}",
        chain_id,
    );
    let wallet = ctx.evm_wallet(chain_id.as_u64())?;
    let submitter =
        Arc::new(TransactionSubmitter::new(provider, wallet).await?);
    tracing::info!("Adapter account address: {:?}", submitter.address());

    let api = Arc::new(ChainlinkApi::new(&ctx.config.chainlink)?);
    let trigger = Arc::new(JobTrigger::new(api.clone(), store.clone()));

    let (subscription_tx, subscription_rx) = mpsc::channel(16);
    let (initiator_addr, initiator_server) =
        build_initiator_server(&ctx, store.clone(), subscription_tx)?;
    tracing::info!("Initiator listening on {}", initiator_addr);
    let (adapter_addr, adapter_server) =
        build_adapter_server(&ctx, store.clone(), api, submitter)?;
    tracing::info!("Adapter listening on {}", adapter_addr);
    let initiator_handle = tokio::spawn(initiator_server);
    let adapter_handle = tokio::spawn(adapter_server);

    // start all background services.
    // this does not block, will fire the services on background tasks.
    service::ignite(&ctx, store, trigger, subscription_rx).await?;
    tracing::event!(
        target: rsk_oracle_bridge::probe::TARGET,
        tracing::Level::DEBUG,
        kind = %rsk_oracle_bridge::probe::Kind::Lifecycle,
        started = true
    );

    // watch for signals
    let mut ctrlc_signal = unix::signal(unix::SignalKind::interrupt())?;
    let mut termination_signal = unix::signal(unix::SignalKind::terminate())?;
    let mut quit_signal = unix::signal(unix::SignalKind::quit())?;
    let shutdown = || {
        tracing::event!(
            target: rsk_oracle_bridge::probe::TARGET,
            tracing::Level::DEBUG,
            kind = %rsk_oracle_bridge::probe::Kind::Lifecycle,
            shutdown = true
        );
        tracing::warn!("Shutting down...");
        // send shutdown signal to all of the application.
        ctx.shutdown();
        // also abort the webhook server tasks
        initiator_handle.abort();
        adapter_handle.abort();
        std::thread::sleep(std::time::Duration::from_millis(300));
        tracing::info!("Clean Exit ..");
    };
    tokio::select! {
        _ = ctrlc_signal.recv() => {
            tracing::warn!("Interrupted (Ctrl+C) ...");
            shutdown();
        },
        _ = termination_signal.recv() => {
            tracing::warn!("Got Terminate signal ...");
            shutdown();
        },
        _ = quit_signal.recv() => {
            tracing::warn!("Quitting ...");
            shutdown();
        },
    }
    Ok(())
}

fn setup_logger(verbosity: i32) -> anyhow::Result<()> {
    use tracing::Level;
    let log_level = match verbosity {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        3 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(
            format!("rsk_oracle_bridge={}", log_level).parse()?,
        );
    tracing_subscriber::fmt()
        .with_target(true)
        .with_max_level(log_level)
        .with_env_filter(env_filter)
        .pretty()
        .init();
    Ok(())
}

fn build_initiator_server<S>(
    ctx: &BridgeContext,
    store: S,
    subscriptions: mpsc::Sender<Subscription>,
) -> anyhow::Result<(SocketAddr, impl Future<Output = ()> + 'static)>
where
    S: SubscriptionStore + CredentialStore + 'static,
{
    let routes = handler::initiator_routes(store, subscriptions)
        .with(warp::trace::request());
    let mut shutdown_signal = ctx.shutdown_signal();
    let shutdown_signal = async move {
        shutdown_signal.recv().await;
    };
    warp::serve(routes)
        .try_bind_with_graceful_shutdown(
            ([0, 0, 0, 0], ctx.config.initiator.port),
            shutdown_signal,
        )
        .map_err(Into::into)
}

fn build_adapter_server<P, A, S>(
    ctx: &BridgeContext,
    store: S,
    api: Arc<A>,
    submitter: Arc<TransactionSubmitter<P>>,
) -> anyhow::Result<(SocketAddr, impl Future<Output = ()> + 'static)>
where
    P: JsonRpcClient + 'static,
    A: JobService + 'static,
    S: CredentialStore + 'static,
{
    let routes = handler::adapter_routes(submitter, api, store)
        .with(warp::trace::request());
    let mut shutdown_signal = ctx.shutdown_signal();
    let shutdown_signal = async move {
        shutdown_signal.recv().await;
    };
    warp::serve(routes)
        .try_bind_with_graceful_shutdown(
            ([0, 0, 0, 0], ctx.config.adapter.port),
            shutdown_signal,
        )
        .map_err(Into::into)
}

fn create_store(opts: &Opts) -> anyhow::Result<SledStore> {
    // check if we shall use the temp dir.
    if opts.tmp {
        tracing::debug!("Using temp dir for store");
        let store = SledStore::temporary()?;
        return Ok(store);
    }
    let dirs = ProjectDirs::from(PACKAGE_ID[0], PACKAGE_ID[1], PACKAGE_ID[2])
        .context("failed to get project dirs")?;
    let db_path: PathBuf = dirs.data_local_dir().join("store");
    let store = SledStore::open(db_path)?;
    Ok(store)
}
