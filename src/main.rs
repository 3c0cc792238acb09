//! hubwire - command-line hub client
//!
//! Connects to a hub, then invokes a method, sends a fire-and-forget call or
//! prints server invocations as they arrive.

use clap::{Parser, Subcommand};
use colored::Colorize;
use hubwire_client::{ClientConfig, HubConnectionBuilder, ProtocolKind, Value};
use hubwire_protocol::json::{from_json, to_json};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hubwire")]
#[command(about = "Command-line client for SignalR-style hubs")]
#[command(version)]
struct Cli {
    /// Hub URL (ws:// or wss://)
    #[arg(short, long, env = "HUBWIRE_URL")]
    url: Option<String>,

    /// Wire protocol: json or messagepack
    #[arg(short, long)]
    protocol: Option<ProtocolKind>,

    /// YAML config file
    #[arg(short, long, env = "HUBWIRE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Invoke a hub method and print its result
    Invoke {
        /// Method name
        method: String,

        /// Arguments, each a JSON value
        args: Vec<String>,
    },

    /// Invoke a hub method without waiting for a result
    Send {
        /// Method name
        method: String,

        /// Arguments, each a JSON value
        args: Vec<String>,
    },

    /// Print server invocations of the given methods until interrupted
    Listen {
        /// Method names to subscribe to
        #[arg(required = true)]
        methods: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    // Config file first, then environment, then flags
    let mut config = match &cli.config {
        Some(path) => {
            let mut config = ClientConfig::from_file(path)?;
            config.apply_env_overrides();
            tracing::info!("Loaded config from {}", path.display());
            config
        }
        None => ClientConfig::from_env(),
    };
    if let Some(url) = cli.url {
        config.url = url;
    }
    if let Some(protocol) = cli.protocol {
        config.protocol = protocol;
    }

    let hub = HubConnectionBuilder::from_config(config).build()?;
    hub.on_disconnected(|cause| {
        if let Some(e) = cause {
            eprintln!("{}: {}", "Disconnected".red(), e);
        }
    })?;

    if let Commands::Listen { methods } = &cli.command {
        for method in methods {
            let name = method.clone();
            hub.on(method, move |args| {
                println!("{} {}", name.cyan(), format_args_json(args));
            })?;
        }
    }

    if let Err(e) = hub.start().await {
        eprintln!("{}: {}", "Connection failed".red(), e);
        std::process::exit(1);
    }
    tracing::info!(connection_id = ?hub.connection_id(), protocol = %hub.protocol().name(), "connected");

    let outcome = match cli.command {
        Commands::Invoke { method, args } => match hub.invoke(&method, parse_args(&args)?).await {
            Ok(result) => {
                println!("{}", format_value(&result));
                Ok(())
            }
            Err(e) => Err(e),
        },
        Commands::Send { method, args } => hub
            .send(&method, parse_args(&args)?)
            .await
            .map(|()| eprintln!("{}", "Sent".green())),
        Commands::Listen { methods } => {
            eprintln!("{} {}", "Listening for".green(), methods.join(", ").cyan());
            eprintln!("{}", "Press Ctrl+C to stop...".dimmed());
            tokio::signal::ctrl_c().await?;
            eprintln!("\n{}", "Stopping...".dimmed());
            Ok(())
        }
    };

    hub.stop().await?;

    if let Err(e) = outcome {
        eprintln!("{}: {}", "Error".red(), e);
        std::process::exit(1);
    }
    Ok(())
}

fn parse_args(args: &[String]) -> Result<Vec<Value>, serde_json::Error> {
    args.iter()
        .map(|arg| serde_json::from_str(arg).map(|json| from_json(&json)))
        .collect()
}

fn format_value(value: &Value) -> String {
    match to_json(value) {
        Ok(json) => json.to_string(),
        Err(_) => value.to_string(),
    }
}

fn format_args_json(args: &[Value]) -> String {
    args.iter().map(format_value).collect::<Vec<_>>().join(" ")
}
