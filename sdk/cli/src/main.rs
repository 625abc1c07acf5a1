use std::path::PathBuf;
use std::sync::Arc;

use alloy_primitives::Address;
use anyhow::Context;
use clap::{Parser, Subcommand};
use sdk_rust::chain::{
    wait_for_finality, ChainClient, CounterContract, Devnet, DevnetSigner, JsonRpcClient,
    JsonRpcSigner,
};
use sdk_rust::engine::{Coprocessor, MockEngine, SystemClock};
use sdk_rust::fhe_counter::{CounterCall, LOCAL_CHAIN_ID};
use sdk_rust::{
    CounterClient, DeploymentRegistry, InMemoryAuthorizationStore, JsonFileAuthorizationStore,
    SdkConfig,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

// Fixed devnet account, so authorizations saved by one demo run are reused by the next.
const DEMO_ACCOUNT_SEED: [u8; 32] = [0x42; 32];

#[derive(Parser, Debug)]
#[command(name = "fhe-counter")]
#[command(about = "Client for the encrypted FHE counter", long_about = None)]
struct Cli {
    /// Ethereum JSON-RPC endpoint
    #[arg(long, env = "FHE_COUNTER_RPC", default_value = "http://localhost:8545")]
    rpc: String,

    /// YAML file with client settings
    #[arg(long, env = "FHE_COUNTER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Look up the counter deployment for a chain id
    Resolve {
        #[arg(long)]
        chain_id: u64,
    },
    /// Read the encrypted count handle from the node
    Status,
    /// Reset the counter from an account unlocked on the node
    Reset {
        #[arg(long)]
        from: Address,
    },
    /// Increment, decrement and decrypt against an in-process devnet
    Demo {
        #[arg(long, default_value = "5")]
        increment: u64,
        #[arg(long, default_value = "2")]
        decrement: u64,
        /// Where signed decryption authorizations are kept between runs
        #[arg(long, default_value = "fhe-counter-authorizations.json")]
        authorizations: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => SdkConfig::load(path)
            .with_context(|| format!("reading config at {}", path.display()))?,
        None => SdkConfig::default(),
    }
    .with_env_overrides()
    .context("applying environment overrides")?;
    let registry = config.registry().context("loading deployment registry")?;

    match cli.command {
        Commands::Resolve { chain_id } => match registry.resolve(chain_id) {
            Some(deployment) => println!("{}", serde_json::to_string_pretty(&deployment)?),
            None => println!("no counter deployed on chain {chain_id}"),
        },
        Commands::Status => {
            let rpc = Arc::new(JsonRpcClient::new(&cli.rpc));
            let chain_id = rpc.chain_id().await.context("querying chain id")?;
            let client = CounterClient::new(
                config,
                registry,
                Arc::new(InMemoryAuthorizationStore::new()),
                Arc::new(SystemClock),
            );
            if client.switch_network(chain_id, rpc).is_none() {
                anyhow::bail!("no counter deployed on chain {chain_id}");
            }
            client.refresh().await.context("reading count handle")?;
            println!("{}", serde_json::to_string_pretty(&client.snapshot().state)?);
        }
        Commands::Reset { from } => {
            let rpc = Arc::new(JsonRpcClient::new(&cli.rpc));
            let chain_id = rpc.chain_id().await.context("querying chain id")?;
            let deployment = registry
                .resolve(chain_id)
                .with_context(|| format!("no counter deployed on chain {chain_id}"))?;
            let contract = CounterContract::new(deployment.contract_address);
            let signer = JsonRpcSigner::new(rpc.clone(), from);
            let tx = contract
                .submit(&signer, &CounterCall::Reset)
                .await
                .context("sending reset")?;
            let receipt = wait_for_finality(rpc.as_ref(), tx, &config.finality())
                .await
                .context("waiting for reset receipt")?;
            println!("reset confirmed in block {} ({tx})", receipt.block_number);
        }
        Commands::Demo {
            increment,
            decrement,
            authorizations,
        } => run_demo(config, increment, decrement, authorizations).await?,
    }
    Ok(())
}

async fn run_demo(
    config: SdkConfig,
    increment: u64,
    decrement: u64,
    authorizations: PathBuf,
) -> anyhow::Result<()> {
    let registry = DeploymentRegistry::builtin();
    let deployment = registry
        .resolve(LOCAL_CHAIN_ID)
        .context("built-in registry has no local deployment")?;

    let coprocessor = Coprocessor::new();
    let devnet = Devnet::new(LOCAL_CHAIN_ID, coprocessor.clone());
    devnet.deploy_counter_at(deployment.contract_address);

    let client = CounterClient::new(
        config,
        registry,
        Arc::new(JsonFileAuthorizationStore::new(&authorizations)),
        Arc::new(SystemClock),
    );
    let mut updates = client.subscribe();
    let printer = tokio::spawn(async move {
        let mut last = None;
        while let Some(snapshot) = updates.changed().await {
            if snapshot.notice != last {
                if let Some(notice) = &snapshot.notice {
                    println!("[{:?}] {}", notice.level, notice.text);
                }
                last = snapshot.notice;
            }
        }
    });

    client.connect_signer(Arc::new(DevnetSigner::new(devnet.clone(), DEMO_ACCOUNT_SEED)));
    client.attach_engine(Arc::new(MockEngine::new(coprocessor, Arc::new(SystemClock))));
    client.switch_network(LOCAL_CHAIN_ID, Arc::new(devnet));

    client.refresh().await?;
    client.increment(increment).await?;
    client.decrement(decrement).await?;
    let value = client.decrypt_count().await?;
    info!(
        authorization = ?client.authorization_status().await,
        file = %authorizations.display(),
        "session finished"
    );
    // closing the store lets the printer drain what is queued and stop
    drop(client);
    printer.await.context("notice printer")?;

    match value {
        Some(value) => println!("decrypted count: {value}"),
        None => println!("nothing to decrypt"),
    }
    Ok(())
}
