//! toolwire command line
//!
//! Runs either end of the link: a tool server on stdio or TCP, or a one-shot
//! client that lists or invokes tools on a spawned or remote server.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};

use toolwire::config::Config;
use toolwire::error::Result;
use toolwire::mcp::server::{TcpServer, ToolServer};
use toolwire::mcp::tools::builtin_registry;
use toolwire::mcp::transport::Transport;

/// Line-delimited JSON tool server and client
#[derive(Parser)]
#[command(name = "toolwire")]
#[command(author, version, about = "toolwire - discover and invoke tools across a process or socket boundary")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the built-in tools over stdin/stdout
    Stdio,

    /// Serve the built-in tools over TCP
    Serve {
        /// Address to bind (overrides TOOLWIRE_HOST)
        #[arg(long)]
        host: Option<String>,

        /// Port to bind (overrides TOOLWIRE_PORT)
        #[arg(long)]
        port: Option<u16>,
    },

    /// List the tools a server offers
    List {
        #[command(flatten)]
        target: Target,
    },

    /// Invoke one tool and print its result
    Call {
        /// Tool name
        tool: String,

        /// Params as a JSON object
        params: Option<String>,

        #[command(flatten)]
        target: Target,
    },
}

/// Where the client side connects
#[derive(Args)]
struct Target {
    /// Connect to a TCP server instead of spawning one
    #[arg(long, value_name = "HOST:PORT", conflicts_with_all = ["server_cmd", "server_args"])]
    connect: Option<String>,

    /// Server executable to spawn (default: this binary in stdio mode)
    #[arg(long, value_name = "PATH")]
    server_cmd: Option<PathBuf>,

    /// Argument for the spawned server, repeatable
    #[arg(long = "server-arg", value_name = "ARG", allow_hyphen_values = true)]
    server_args: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries the protocol in stdio mode, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::new()?;

    match cli.command {
        Commands::Stdio => {
            let server = ToolServer::new(builtin_registry()?, config.server_config());
            server.run_stdio().await?;
        }
        Commands::Serve { host, port } => {
            let mut config = config;
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }

            let server = ToolServer::new(builtin_registry()?, config.server_config());
            TcpServer::bind(&config.addr(), server).await?.run().await?;
        }
        Commands::List { target } => {
            let mut transport = open_transport(target, &config)?;
            transport.connect().await?;
            let listed = transport.client()?.list_tools().await;
            transport.disconnect().await?;

            for tool in listed? {
                println!("{}: {}", tool.name, tool.description);
                println!("  parameters: {}", tool.parameters);
            }
        }
        Commands::Call {
            tool,
            params,
            target,
        } => {
            let params: Value = match params {
                Some(raw) => serde_json::from_str(&raw)?,
                None => json!({}),
            };

            let mut transport = open_transport(target, &config)?;
            transport.connect().await?;
            let outcome = transport.client()?.call(&tool, params).await;
            transport.disconnect().await?;

            let response = outcome?;
            let text = response.first_text().unwrap_or_default();
            if response.is_error {
                eprintln!("{}", text);
                std::process::exit(1);
            }
            println!("{}", text);
        }
    }

    Ok(())
}

fn open_transport(target: Target, config: &Config) -> Result<Transport> {
    if let Some(addr) = target.connect {
        return Ok(Transport::socket(config.socket_config(addr)));
    }

    let (command, args) = match target.server_cmd {
        Some(command) => (command, target.server_args),
        None => (std::env::current_exe()?, vec!["stdio".to_string()]),
    };
    Ok(Transport::process(config.process_config(command, args)))
}
