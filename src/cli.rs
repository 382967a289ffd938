use clap::{Arg, ArgMatches, Command};

use crate::internal::config::{get_version_info, AppConfig};

pub fn build_cli() -> Command {
    // Leak the version string to get a 'static lifetime
    let version: &'static str = Box::leak(get_version_info().into_boxed_str());

    Command::new("mcp-hub")
        .version(version)
        .about("Process manager and stdio transport hub for MCP tool servers")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .help("Path to config file (default: ./mcp-hub.yaml, /etc/mcp-hub/config.yaml)"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .global(true)
                .help("Override the configured log level (trace|debug|info|warn|error)"),
        )
        .subcommand(
            Command::new("call")
                .about("Invoke a method on a configured server and print the result")
                .arg(Arg::new("server").required(true).help("Logical server id"))
                .arg(Arg::new("method").required(true).help("JSON-RPC method name"))
                .arg(Arg::new("params").help("Params as a JSON value"))
                .arg(
                    Arg::new("timeout")
                        .long("timeout")
                        .short('t')
                        .value_parser(clap::value_parser!(u64))
                        .help("Request timeout in seconds"),
                ),
        )
        .subcommand(
            Command::new("notify")
                .about("Send a notification to a configured server (no response)")
                .arg(Arg::new("server").required(true).help("Logical server id"))
                .arg(Arg::new("method").required(true).help("JSON-RPC method name"))
                .arg(Arg::new("params").help("Params as a JSON value")),
        )
        .subcommand(
            Command::new("status")
                .about("Show connection state for a configured server")
                .arg(Arg::new("server").required(true).help("Logical server id")),
        )
        .subcommand(Command::new("servers").about("List configured server ids"))
}

pub fn parse_config(matches: &ArgMatches) -> anyhow::Result<AppConfig> {
    let path = matches.get_one::<String>("config").map(String::as_str);
    let mut config = AppConfig::load(path)?;

    if let Some(level) = matches.get_one::<String>("log-level") {
        config.logging.level = level.clone();
    }
    Ok(config)
}
