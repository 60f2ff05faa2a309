//! chainclient CLI: dial an endpoint pool and inspect a chain from the terminal.
//!
//! Usage:
//! ```bash
//! # Dial every configured endpoint and print its state
//! chainclient nodes --config chain.json
//!
//! # Latest head (or a given block)
//! chainclient head --config chain.json --number 19000000
//!
//! # Native or ERC-20 balance
//! chainclient balance --config chain.json --account 0x... --token 0x...
//!
//! # Follow new heads
//! chainclient watch --config chain.json --count 5
//!
//! # Classify a node's send error offline
//! chainclient classify --message "already known"
//! ```

mod logging;

use std::env;
use std::process;
use std::sync::Arc;

use alloy_primitives::Address;
use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use chainclient_core::{ClientConfig, EndpointConfig, NamedTransport, RpcTransport};
use chainclient_evm::{format_units, Client, ErrorPatterns, SendError, SendErrorClassifier};
use chainclient_http::{HttpClientConfig, HttpRpcClient};
use chainclient_ws::{WsClientConfig, WsRpcClient};

use crate::logging::{init_tracing, LogConfig};

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let log = LogConfig {
        level: parse_flag(&args, "--log-level").unwrap_or_else(|| "info".into()),
        json: has_flag(&args, "--log-json"),
        ..Default::default()
    };
    init_tracing(&log);

    let result = match args[1].as_str() {
        "nodes" => cmd_nodes(&args[2..]).await,
        "head" => cmd_head(&args[2..]).await,
        "balance" => cmd_balance(&args[2..]).await,
        "watch" => cmd_watch(&args[2..]).await,
        "classify" => cmd_classify(&args[2..]),
        "version" | "--version" | "-V" => {
            println!("chainclient {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn print_usage() {
    println!("chainclient {}", env!("CARGO_PKG_VERSION"));
    println!("Multi-endpoint EVM JSON-RPC client\n");
    println!("USAGE:");
    println!("    chainclient <COMMAND> [FLAGS]\n");
    println!("COMMANDS:");
    println!("    nodes      Dial the pool and print every endpoint's state");
    println!("    head       Print the latest head, or --number <N>");
    println!("    balance    Print the native balance of --account, or its --token balance");
    println!("    watch      Print new heads, --count <N> of them (default: until Ctrl-C)");
    println!("    classify   Classify a send error --message offline [--l2] [--patterns <FILE>]");
    println!("    version    Print version");
    println!("    help       Print this help\n");
    println!("GLOBAL FLAGS:");
    println!("    --config <FILE>      Client configuration (JSON)");
    println!("    --log-level <LEVEL>  trace | debug | info | warn | error  [default: info]");
    println!("    --log-json           Emit JSON logs");
}

// ─── Setup ────────────────────────────────────────────────────────────────────

fn load_config(args: &[String]) -> Result<ClientConfig> {
    let path = parse_flag(args, "--config").context("--config is required")?;
    let raw = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
    ClientConfig::from_json(&raw).with_context(|| format!("parsing {path}"))
}

fn transport(ep: &EndpointConfig) -> Result<Arc<dyn RpcTransport>> {
    if ep.url.starts_with("ws://") || ep.url.starts_with("wss://") {
        Ok(Arc::new(WsRpcClient::new(ep.url.clone(), WsClientConfig::default())))
    } else {
        let client = HttpRpcClient::new(ep.url.clone(), HttpClientConfig::default())
            .with_context(|| format!("building HTTP client for {}", ep.name))?;
        Ok(Arc::new(client))
    }
}

async fn connect(args: &[String]) -> Result<Client> {
    let config = load_config(args)?;
    let named = |eps: Vec<&EndpointConfig>| -> Result<Vec<NamedTransport>> {
        eps.into_iter()
            .map(|ep| -> Result<NamedTransport> { Ok((ep.name.clone(), transport(ep)?)) })
            .collect()
    };
    let primaries = named(config.primaries().collect())?;
    let send_only = named(config.send_only().collect())?;
    let client = Client::new(
        config.pool.clone(),
        config.chain_id,
        config.chain_type,
        primaries,
        send_only,
    )?;
    client.dial().await.context("dialing endpoint pool")?;
    Ok(client)
}

// ─── Commands ─────────────────────────────────────────────────────────────────

async fn cmd_nodes(args: &[String]) -> Result<()> {
    let client = connect(args).await?;
    println!("Chain {} ({})", client.chain_id(), client.chain_type());
    for (name, state) in client.node_states() {
        println!("  {name:<24} {state}");
    }
    if let Some(active) = client.pool().active_primary() {
        println!("  Active primary: {active}");
    }
    client.close().await;
    Ok(())
}

async fn cmd_head(args: &[String]) -> Result<()> {
    let client = connect(args).await?;
    let number = parse_flag(args, "--number")
        .map(|n| n.parse::<u64>())
        .transpose()
        .context("--number must be a block number")?;
    let head = client.head_by_number(number).await?;
    println!("  Number:      {}", head.number);
    println!("  Hash:        {}", head.hash);
    println!("  Parent:      {}", head.parent_hash);
    println!("  Timestamp:   {}", head.timestamp);
    if let Some(base_fee) = head.base_fee_per_gas {
        println!("  Base fee:    {} gwei", format_units(base_fee, 9));
    }
    client.close().await;
    Ok(())
}

async fn cmd_balance(args: &[String]) -> Result<()> {
    let account: Address = parse_flag(args, "--account")
        .context("--account is required")?
        .parse()
        .context("--account must be an address")?;
    let token = parse_flag(args, "--token")
        .map(|t| t.parse::<Address>())
        .transpose()
        .context("--token must be an address")?;

    let client = connect(args).await?;
    match token {
        Some(token) => {
            let balance = client.erc20_balance(account, token).await?;
            println!("  {account} holds {balance} base units of {token}");
        }
        None => {
            let wei = client.native_balance(account, None).await?;
            println!("  {account}: {} ({wei} wei)", format_units(wei, 18));
        }
    }
    client.close().await;
    Ok(())
}

async fn cmd_watch(args: &[String]) -> Result<()> {
    let count = parse_flag(args, "--count")
        .map(|n| n.parse::<usize>())
        .transpose()
        .context("--count must be a number")?;
    let client = connect(args).await?;

    let (tx, mut heads) = mpsc::channel(16);
    let mut sub = client.subscribe_new_head(tx, CancellationToken::new()).await?;
    let mut seen = 0;
    loop {
        tokio::select! {
            head = heads.recv() => {
                let Some(head) = head else { break };
                println!("  #{} {}", head.number, head.hash);
                seen += 1;
                if count.is_some_and(|c| seen >= c) {
                    break;
                }
            }
            err = sub.err().recv() => {
                if let Some(e) = err {
                    eprintln!("subscription ended: {e}");
                }
                break;
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    sub.unsubscribe();
    sub.join().await;
    client.close().await;
    Ok(())
}

fn cmd_classify(args: &[String]) -> Result<()> {
    let message = parse_flag(args, "--message").context("--message is required")?;
    let mut patterns = ErrorPatterns::builtin().clone();
    if let Some(path) = parse_flag(args, "--patterns") {
        let raw = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
        let added = patterns.load_json(&raw)?;
        tracing::info!(path = %path, clients = added, "loaded send error patterns");
    }
    if message.is_empty() {
        bail!("--message must not be empty");
    }

    let classifier = SendErrorClassifier::new(patterns);
    let err = SendError::new(message);
    let result = classifier.classify_detailed(Some(&err), has_flag(args, "--l2"));
    match result.kind {
        Some(kind) => println!("{} ({kind})", result.outcome),
        None => println!("{}", result.outcome),
    }
    Ok(())
}

fn parse_flag(args: &[String], flag: &str) -> Option<String> {
    let pos = args.iter().position(|a| a == flag)?;
    args.get(pos + 1).cloned()
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}
