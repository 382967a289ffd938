use std::time::Duration;

use clap::ArgMatches;
use serde_json::Value;
use tracing::{error, info};

use mcp_hub::cli::{build_cli, parse_config};
use mcp_hub::internal::logger::init_logger;
use mcp_hub::TransportManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = build_cli().get_matches();
    let config = match parse_config(&matches) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = init_logger(&config.logging) {
        eprintln!("Failed to initialize logger: {}", e);
        std::process::exit(1);
    }

    info!("mcp-hub starting with {} configured server(s)", config.servers.len());

    let manager = TransportManager::new(
        config.servers.clone(),
        config.reconnect.to_policy(),
        config.transport.to_options(),
    );
    let default_timeout = config.transport.request_timeout();
    let grace = config.transport.to_options().kill_grace;

    let outcome = run(&manager, &matches, default_timeout).await;
    manager.shutdown_all(grace).await;

    if let Err(e) = outcome {
        error!("command failed: {}", e);
        std::process::exit(1);
    }
    Ok(())
}

async fn run(
    manager: &TransportManager,
    matches: &ArgMatches,
    default_timeout: Duration,
) -> anyhow::Result<()> {
    match matches.subcommand() {
        Some(("call", sub)) => {
            let server = sub.get_one::<String>("server").expect("server is required");
            let method = sub.get_one::<String>("method").expect("method is required");
            let params = parse_params(sub)?;
            let timeout = sub
                .get_one::<u64>("timeout")
                .map(|secs| Duration::from_secs(*secs))
                .unwrap_or(default_timeout);

            let result = manager.invoke(server, method, params, timeout).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Some(("notify", sub)) => {
            let server = sub.get_one::<String>("server").expect("server is required");
            let method = sub.get_one::<String>("method").expect("method is required");
            let params = parse_params(sub)?;

            manager.notify(server, method, params).await?;
        }
        Some(("status", sub)) => {
            let server = sub.get_one::<String>("server").expect("server is required");
            let status = manager.status(server).await;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Some(("servers", _)) => {
            for id in manager.server_ids() {
                println!("{}", id);
            }
        }
        _ => unreachable!("subcommand is required"),
    }
    Ok(())
}

fn parse_params(sub: &ArgMatches) -> anyhow::Result<Option<Value>> {
    sub.get_one::<String>("params")
        .map(|raw| serde_json::from_str(raw).map_err(|e| anyhow::anyhow!("invalid params JSON: {}", e)))
        .transpose()
}
