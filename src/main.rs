//! vnoc - VNOC message server and client
//!
//! Serves the built-in instructions or sends a single request to a server.

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vnoc_net::config::{self, Config};
use vnoc_net::dispatch::Dispatcher;
use vnoc_net::handlers;
use vnoc_net::network::{resolve_host, Client, Server, ServerEvent};
use vnoc_net::protocol::{Message, ReadMessage};

/// vnoc - Remote-control messaging over TCP
#[derive(Parser)]
#[command(name = "vnoc")]
#[command(author = "VNOC Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Serve or send VNOC protocol messages", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server with the built-in handlers
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Interface to bind to
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Send one message and print the reply
    Send {
        /// Server address to connect to
        #[arg(short, long)]
        server: Option<String>,

        /// Server port
        #[arg(short, long)]
        port: Option<u16>,

        /// Instruction code, decimal or 0x-prefixed hex
        #[arg(short, long, value_parser = parse_instruction)]
        instruction: u8,

        /// Text field as name=value
        #[arg(long = "text", value_parser = parse_key_value::<String>)]
        text: Vec<(String, String)>,

        /// u32 field as name=value
        #[arg(long = "u32", value_parser = parse_key_value::<u32>)]
        u32_fields: Vec<(String, u32)>,

        /// u64 field as name=value
        #[arg(long = "u64", value_parser = parse_key_value::<u64>)]
        u64_fields: Vec<(String, u64)>,

        /// i64 field as name=value
        #[arg(long = "i64", value_parser = parse_key_value::<i64>)]
        i64_fields: Vec<(String, i64)>,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)
            .with_context(|| format!("loading {}", config_path.display()))?
    } else {
        Config::load_default().unwrap_or_default()
    };

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Serve { port, bind } => {
            run_server(config, port, bind).await?;
        }
        Commands::Send {
            server,
            port,
            instruction,
            text,
            u32_fields,
            u64_fields,
            i64_fields,
        } => {
            let mut request = Message::new(instruction);
            for (name, value) in text {
                request = request.with(name, value);
            }
            for (name, value) in u32_fields {
                request = request.with(name, value);
            }
            for (name, value) in u64_fields {
                request = request.with(name, value);
            }
            for (name, value) in i64_fields {
                request = request.with(name, value);
            }
            run_send(config, server, port, request).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
    }

    Ok(())
}

/// Run the server until Ctrl+C
async fn run_server(config: Config, port: Option<u16>, bind: Option<String>) -> anyhow::Result<()> {
    let mut net_config = config.network_config();
    if let Some(port) = port {
        net_config.port = port;
    }
    if let Some(bind) = bind {
        net_config.bind_address = bind;
    }

    let mut dispatcher = Dispatcher::new();
    handlers::register_builtin(&mut dispatcher);
    tracing::info!("Registered instructions: {:02x?}", dispatcher.instructions());

    let mut server = Server::new(net_config, dispatcher);
    let mut event_rx = server
        .take_event_receiver()
        .context("server event receiver already taken")?;

    let local_addr = server.start().await?;

    println!("\n========================================");
    println!("  VNOC Server Running");
    println!("========================================");
    println!("  Listening: {}", local_addr);
    println!("========================================");
    println!("\nPress Ctrl+C to stop.\n");

    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                match event {
                    ServerEvent::ConnectionOpened { id, addr } => {
                        println!("+ Connection {} from {}", id, addr);
                    }
                    ServerEvent::ConnectionClosed { id, addr, reason } => match reason {
                        Some(reason) => println!("- Connection {} ({}) failed: {}", id, addr, reason),
                        None => println!("- Connection {} ({}) closed", id, addr),
                    },
                    ServerEvent::Error { message } => {
                        tracing::error!("Server error: {}", message);
                    }
                    _ => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
        }
    }

    server.stop().await?;
    tracing::info!("Server stopped");

    Ok(())
}

/// Send a single request and print the reply
async fn run_send(
    config: Config,
    server: Option<String>,
    port: Option<u16>,
    request: Message,
) -> anyhow::Result<()> {
    let host = server
        .or_else(|| config.client.server.clone())
        .unwrap_or_else(|| "127.0.0.1".to_string());
    let mut net_config = config.network_config();
    if let Some(port) = port {
        net_config.port = port;
    }

    let addr = resolve_host(&host, net_config.port)
        .await
        .with_context(|| format!("resolving {}", host))?;

    let mut client = Client::connect(addr, &net_config).await?;
    let reply = client.request(&request).await?;

    println!("{}", describe(&reply));
    client.close().await?;

    Ok(())
}

fn describe(message: &Message) -> String {
    let mut out = format!("instruction 0x{:02x}", message.instruction());
    for (name, value) in message.fields() {
        out.push_str(&format!("\n  {} = {:?}", name, value));
    }
    out
}

fn parse_instruction(s: &str) -> Result<u8, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid instruction '{}': {}", s, e))
}

fn parse_key_value<T>(s: &str) -> Result<(String, T), String>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{}'", s))?;
    if name.is_empty() {
        return Err(format!("missing field name in '{}'", s));
    }
    let value = value
        .parse()
        .map_err(|e| format!("invalid value for '{}': {}", name, e))?;
    Ok((name.to_string(), value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["vnoc", "serve", "--port", "9000"]).unwrap();
        assert!(matches!(cli.command, Commands::Serve { port: Some(9000), bind: None }));
    }

    #[test]
    fn test_send_parsing() {
        let cli = Cli::try_parse_from([
            "vnoc",
            "send",
            "--instruction",
            "0x05",
            "--text",
            "user=alice",
            "--text",
            "password=pw",
            "--u64",
            "timestamp=7",
        ])
        .unwrap();

        match cli.command {
            Commands::Send {
                instruction,
                text,
                u64_fields,
                ..
            } => {
                assert_eq!(instruction, 5);
                assert_eq!(text[0], ("user".to_string(), "alice".to_string()));
                assert_eq!(text.len(), 2);
                assert_eq!(u64_fields, vec![("timestamp".to_string(), 7)]);
            }
            _ => panic!("expected send"),
        }
    }

    #[test]
    fn test_bad_field_argument() {
        assert!(Cli::try_parse_from(["vnoc", "send", "-i", "3", "--u32", "count=abc"]).is_err());
        assert!(Cli::try_parse_from(["vnoc", "send", "-i", "3", "--text", "=x"]).is_err());
        assert!(Cli::try_parse_from(["vnoc", "send", "-i", "300"]).is_err());
    }

    #[test]
    fn test_parse_instruction() {
        assert_eq!(parse_instruction("0x1f"), Ok(0x1f));
        assert_eq!(parse_instruction("12"), Ok(12));
        assert!(parse_instruction("0xzz").is_err());
    }
}
