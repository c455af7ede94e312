//! # mkv-cli
//!
//! Operator tool for issuing one-shot commands against a running device
//! over MQTT, for manual verification — not the out-of-scope mobile demo
//! app. Mirrors the teacher's `main.rs` entry point: `env_logger::init()`,
//! load config from a TOML file, run a `tokio` multi-threaded runtime.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use merkle_kv_mobile::{Config, MerkleKvClient};

#[derive(Parser)]
#[command(name = "mkv-cli", about = "Issue one-shot commands against a MerkleKV Mobile device")]
struct Cli {
    /// Path to a TOML config file (see `Config`). If it does not exist,
    /// `--broker`/`--client-id`/`--node-id` must all be supplied instead.
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    #[arg(long)]
    broker: Option<String>,
    #[arg(long)]
    client_id: Option<String>,
    #[arg(long)]
    node_id: Option<String>,

    /// Seconds to wait for the MQTT session to reach `Connected` before
    /// giving up.
    #[arg(long, default_value_t = 10)]
    connect_timeout_s: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    Get { key: String },
    Set { key: String, value: String },
    Del { key: String },
    Incr { key: String, #[arg(default_value_t = 1)] amount: i64 },
    Decr { key: String, #[arg(default_value_t = 1)] amount: i64 },
    Append { key: String, value: String },
    Prepend { key: String, value: String },
    Mget { keys: Vec<String> },
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    if cli.config.exists() {
        return Ok(Config::load(&cli.config)?);
    }
    let (broker, client_id, node_id) = match (&cli.broker, &cli.client_id, &cli.node_id) {
        (Some(b), Some(c), Some(n)) => (b.clone(), c.clone(), n.clone()),
        _ => anyhow::bail!(
            "{} not found; pass --broker, --client-id, and --node-id instead",
            cli.config.display()
        ),
    };
    let config = Config::new(broker, client_id, node_id);
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let client = MerkleKvClient::connect(config)?;

    let mut events = client.connection_events();
    let wait = tokio::time::timeout(Duration::from_secs(cli.connect_timeout_s), async {
        loop {
            if events.borrow().state == merkle_kv_mobile::mqtt::ConnectionState::Connected {
                return;
            }
            if events.changed().await.is_err() {
                return;
            }
        }
    })
    .await;
    if wait.is_err() {
        eprintln!("timed out waiting for broker connection after {}s", cli.connect_timeout_s);
        std::process::exit(1);
    }

    let result = run_command(&client, cli.command).await;
    client.disconnect().await;

    match result {
        Ok(output) => {
            println!("{output}");
            Ok(())
        }
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1)
        }
    }
}

async fn run_command(client: &MerkleKvClient, command: Command) -> merkle_kv_mobile::Result<String> {
    match command {
        Command::Get { key } => Ok(client.get(key).await?.unwrap_or_else(|| "(nil)".to_string())),
        Command::Set { key, value } => {
            client.set(key, value).await?;
            Ok("OK".to_string())
        }
        Command::Del { key } => {
            client.delete(key).await?;
            Ok("OK".to_string())
        }
        Command::Incr { key, amount } => Ok(client.increment(key, amount).await?.to_string()),
        Command::Decr { key, amount } => Ok(client.decrement(key, amount).await?.to_string()),
        Command::Append { key, value } => Ok(client.append(key, value).await?.to_string()),
        Command::Prepend { key, value } => Ok(client.prepend(key, value).await?.to_string()),
        Command::Mget { keys } => {
            let values = client.get_multiple(keys.clone()).await?;
            let rendered: Vec<String> = keys
                .into_iter()
                .zip(values)
                .map(|(k, v)| format!("{k} -> {}", v.unwrap_or_else(|| "(nil)".to_string())))
                .collect();
            Ok(rendered.join("\n"))
        }
    }
}
