//! tieba-wire
//!
//! Command-line inspector for the transport layer.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use client::config::{default_config_path, Config};
use client::network::{
    CallbackRegistry, Channel, ConnectionManager, Payload, PushFrame, RequestBuilder, WsConfig,
    PUSH_NOTIFY_CMD,
};
use protocol::cipher::WS_SECRET_LEN;
use protocol::signing::{sign_params, SIGN_KEY};
use protocol::{Account, FrameCodec};
use tracing_subscriber::EnvFilter;

/// tieba-wire - inspect and exercise the forum transport layer.
#[derive(Parser, Debug)]
#[command(name = "tieba-wire")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Inspect the configuration
    #[command(subcommand)]
    Config(ConfigCommands),

    /// Sign a parameter list the way the mobile API expects
    Sign {
        /// Parameters as key=value
        #[arg(value_parser = parse_pair)]
        params: Vec<(String, String)>,
    },

    /// Build a request and print it without sending
    Build {
        /// Request channel
        #[arg(long, value_enum, default_value = "mobile-web")]
        channel: ChannelArg,

        /// Target URL
        #[arg(long)]
        url: String,

        /// Send parameters as a GET query (desktop web only)
        #[arg(long)]
        query: bool,

        /// Hex payload for the mobile app channel
        #[arg(long, conflicts_with = "params")]
        data: Option<String>,

        /// Parameters as key=value
        #[arg(value_parser = parse_pair)]
        params: Vec<(String, String)>,
    },

    /// Decode a captured frame
    DecodeFrame {
        /// Frame bytes as hex
        frame: String,

        /// Session secret as hex, needed for encrypted frames
        #[arg(long)]
        secret: Option<String>,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Connect to the push channel and log incoming pushes
    ///
    /// No application handshake is sent, because its payload schema lives in
    /// the endpoint layer. Servers that require one close the connection, so
    /// this is meant for local test servers and captures.
    Listen {
        /// Stop after this many seconds (default: run until Ctrl-C)
        #[arg(long)]
        duration: Option<u64>,
    },
}

/// Subcommands for configuration.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration with secrets masked
    Show,
    /// Print the default configuration path
    Path,
}

/// Request channel on the command line.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelArg {
    /// Multipart protobuf body
    MobileApp,
    /// Signed form body
    MobileWeb,
    /// Cookie-authenticated web request
    DesktopWeb,
}

impl From<ChannelArg> for Channel {
    fn from(arg: ChannelArg) -> Self {
        match arg {
            ChannelArg::MobileApp => Channel::MobileApp,
            ChannelArg::MobileWeb => Channel::MobileWeb,
            ChannelArg::DesktopWeb => Channel::DesktopWeb,
        }
    }
}

fn parse_pair(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got {s}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };

    // Apply environment variable overrides
    config.apply_env_overrides();

    // Validate configuration
    config.validate()?;

    // Initialize tracing
    let level = if cli.verbose { "debug" } else { config.log.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Config(ConfigCommands::Show) => {
            let mut shown = config.clone();
            shown.account = config.account.masked();
            shown.proxy = config.proxy.masked();
            print!("{}", shown.to_toml()?);
        }
        Commands::Config(ConfigCommands::Path) => {
            println!("{}", default_config_path().display());
        }
        Commands::Sign { params } => {
            let mut params = params;
            let sign = sign_params(&mut params);
            params.push((SIGN_KEY.to_string(), sign.clone()));
            println!("{sign}");
            println!("{}", serde_urlencoded::to_string(&params)?);
        }
        Commands::Build {
            channel,
            url,
            query,
            data,
            params,
        } => {
            let account = load_account(&config)?;
            let payload = match (data, query) {
                (Some(hex_data), _) => {
                    Payload::Binary(hex::decode(hex_data.trim()).context("Invalid hex payload")?)
                }
                (None, true) => Payload::Query(params),
                (None, false) => Payload::Form(params),
            };
            let request =
                RequestBuilder::new(account).build_request(channel.into(), &url, payload)?;

            println!("{} {}", request.method(), request.url());
            for (name, value) in request.headers() {
                println!("{}: {}", name, value.to_str().unwrap_or("<binary>"));
            }
            println!();
            match std::str::from_utf8(request.body()) {
                Ok(text) => println!("{text}"),
                Err(_) => println!("{}", hex::encode(request.body())),
            }
        }
        Commands::DecodeFrame {
            frame,
            secret,
            json,
        } => {
            let bytes = hex::decode(frame.trim()).context("Invalid hex frame")?;
            let codec = match secret {
                Some(secret) => {
                    let secret = hex::decode(secret.trim()).context("Invalid hex secret")?;
                    let secret: [u8; WS_SECRET_LEN] = secret.try_into().map_err(|s: Vec<u8>| {
                        anyhow::anyhow!("secret must be {WS_SECRET_LEN} bytes, got {}", s.len())
                    })?;
                    FrameCodec::with_cipher(Arc::new(Account::anonymous().with_ws_secret(secret)))
                }
                None => FrameCodec::new(),
            };
            let frame = codec.decode(&bytes)?;
            if json {
                let value = serde_json::json!({
                    "flags": frame.flags.as_byte(),
                    "encrypted": frame.flags.is_encrypted(),
                    "compressed": frame.flags.is_compressed(),
                    "cmd": frame.cmd,
                    "correlation_id": frame.correlation_id,
                    "payload": hex::encode(&frame.payload),
                });
                println!("{}", serde_json::to_string_pretty(&value)?);
                return Ok(());
            }
            println!("flags:          0x{:02x}", frame.flags.as_byte());
            println!("encrypted:      {}", frame.flags.is_encrypted());
            println!("compressed:     {}", frame.flags.is_compressed());
            println!("cmd:            {}", frame.cmd);
            println!("correlation id: {}", frame.correlation_id);
            println!("payload:        {}", hex::encode(&frame.payload));
        }
        Commands::Listen { duration } => {
            run_listen(&config, duration).await?;
        }
    }

    Ok(())
}

fn load_account(config: &Config) -> anyhow::Result<Arc<Account>> {
    if config.account.bduss.is_empty() {
        return Ok(Arc::new(Account::anonymous()));
    }
    let account = Account::new(config.account.bduss.clone(), config.account.stoken.clone())
        .context("Invalid account tokens in configuration")?;
    Ok(Arc::new(account))
}

async fn run_listen(config: &Config, duration: Option<u64>) -> anyhow::Result<()> {
    let account = load_account(config)?;

    let mut registry = CallbackRegistry::new();
    registry.register_callback(PUSH_NOTIFY_CMD, |frame: PushFrame| async move {
        tracing::info!(
            cmd = frame.cmd,
            len = frame.payload.len(),
            record_id = frame.cursors.record_id(),
            "Push received"
        );
    });

    // no handshake, see the Listen command docs
    let manager = ConnectionManager::new(WsConfig::from_config(config), account, Arc::new(registry));
    manager.connect().await.context("Failed to connect push channel")?;
    tracing::info!(url = %manager.config().url, "Listening for pushes");

    let stop = async {
        match duration {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::warn!(error = %e, "Failed to wait for Ctrl-C");
                }
            }
        }
    };

    let mut check = tokio::time::interval(Duration::from_secs(1));
    tokio::pin!(stop);
    loop {
        tokio::select! {
            _ = &mut stop => break,
            _ = check.tick() => {
                if manager.status() != client::ConnectionStatus::Open {
                    manager.close().await?;
                    bail!("Push channel closed by server");
                }
            }
        }
    }

    manager.close().await?;
    Ok(())
}
