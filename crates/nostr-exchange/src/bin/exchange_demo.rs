//! Exchange demo binary
//!
//! Runs a customer and a service provider (or a client and a remote signer)
//! against an in-process relay:
//!   cargo run --bin exchange-demo -- job "hello world" --uppercase --reverse
//!   cargo run --bin exchange-demo -- pair

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nostr_exchange::connect::ack_payload;
use nostr_exchange::{
    ConnectUri, DvmClient, DvmWorker, EventSigner, EventTemplate, ExchangeConfig,
    ExchangeManager, InMemorySigner, KIND_NOSTR_CONNECT, MemoryRelay, RelayTransport,
    TextProcessRequest, pair,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::info;

#[derive(Parser)]
#[command(name = "exchange-demo")]
#[command(about = "Correlated Nostr request/response exchanges against an in-memory relay")]
struct Args {
    /// Reply deadline in milliseconds (defaults to NOSTR_EXCHANGE_DEFAULT_TIMEOUT_MS or 10000)
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Submit a NIP-90 text-process job and print the result
    Job {
        /// Text to process
        input: String,

        #[arg(long)]
        uppercase: bool,

        #[arg(long)]
        reverse: bool,
    },
    /// Pair with a simulated NIP-46 remote signer and print the bunker URI
    Pair {
        /// Delay before the remote signer acknowledges (milliseconds)
        #[arg(long, default_value = "200")]
        ack_delay_ms: u64,
    },
}

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.json_logs);

    let mut config = ExchangeConfig::load().context("loading NOSTR_EXCHANGE_* settings")?;
    if let Some(timeout_ms) = args.timeout_ms {
        config.default_timeout_ms = timeout_ms;
    }

    let relay = Arc::new(MemoryRelay::new());
    match args.command {
        Command::Job {
            input,
            uppercase,
            reverse,
        } => run_job(relay, config, input, uppercase, reverse).await,
        Command::Pair { ack_delay_ms } => {
            run_pair(relay, config, Duration::from_millis(ack_delay_ms)).await
        }
    }
}

async fn run_job(
    relay: Arc<MemoryRelay>,
    config: ExchangeConfig,
    input: String,
    uppercase: bool,
    reverse: bool,
) -> Result<()> {
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let worker = DvmWorker::new(relay.clone(), Arc::new(InMemorySigner::new("provider")));
    let worker_task = tokio::spawn(async move {
        worker
            .run(async {
                let _ = stop_rx.await;
            })
            .await
    });
    // Jobs older than the worker's subscription are ignored.
    while relay.open_subscriptions() == 0 {
        tokio::task::yield_now().await;
    }

    let manager = ExchangeManager::new(relay, Arc::new(InMemorySigner::new("customer")), config);
    let client = DvmClient::new(manager.clone());
    let request = TextProcessRequest::new(input)
        .uppercase(uppercase)
        .reverse(reverse);

    let outcome = client.submit_text(&request, None).await;
    manager.shutdown().await;
    let _ = stop_tx.send(());
    let answered = worker_task.await.context("worker task failed")??;
    info!("Worker answered {} jobs", answered);

    let response = outcome.context("job failed")?;
    println!("{}", response.output);
    Ok(())
}

async fn run_pair(relay: Arc<MemoryRelay>, config: ExchangeConfig, ack_delay: Duration) -> Result<()> {
    let client = InMemorySigner::new("client");
    let client_pubkey = client.public_key()?;
    let uri = ConnectUri::new(client_pubkey.clone(), config.relay_url.clone());
    println!("{}", uri);

    let manager = ExchangeManager::new(relay.clone(), Arc::new(client.clone()), config)
        .with_decryptor(Arc::new(client.cipher()?))?;

    // Simulated remote signer: scans the URI, then acknowledges with the secret.
    let remote = InMemorySigner::new("remote-signer");
    let remote_cipher = remote.cipher()?;
    let secret = uri.secret.clone();
    let remote_task = tokio::spawn(async move {
        tokio::time::sleep(ack_delay).await;
        let ack = remote.sign(
            EventTemplate::new(
                KIND_NOSTR_CONNECT,
                remote_cipher.encrypt(&ack_payload(&secret), &client_pubkey),
            )
            .tag(["p", client_pubkey.as_str()]),
        )?;
        relay
            .publish(ack)
            .await
            .map_err(nostr_exchange::ExchangeError::PublishFailed)
    });

    let bunker = pair(&manager, &uri, None).await.context("pairing failed")?;
    remote_task.await.context("remote signer task failed")??;
    println!("{}", bunker);
    Ok(())
}
