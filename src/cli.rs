//! CLI surface for totem.

use std::ffi::OsString;
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{ArgAction, Args, Parser, Subcommand};

use crate::config::{self, Config, ConfigError, PeerSpec};
use crate::node::{self, LogSink, MessageLog};
use crate::proto::{Envelope, LineWriter, NodeId, Payload, Term, DEFAULT_ROOM};
use crate::telemetry::TelemetryConfig;
use crate::Result;

#[derive(Parser, Debug)]
#[command(
    name = "totem",
    version,
    about = "Replicated chat cluster with total-order broadcast",
    arg_required_else_help = true
)]
pub struct Cli {
    /// Debug output (repeat for more).
    #[arg(short = 'v', long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Errors only.
    #[arg(short = 'q', long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a cluster node until SIGINT/SIGTERM.
    Run(RunArgs),

    /// Send one chat message to a node and exit.
    Send(SendArgs),

    /// Print this node's persisted messages in delivery order.
    Log(LogArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Config file (default: ./totem.toml if present).
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Override the node id.
    #[arg(long, value_name = "ID")]
    pub node_id: Option<u64>,

    /// Override the listen address.
    #[arg(long, value_name = "HOST:PORT")]
    pub listen: Option<String>,

    /// Seed peer, repeatable. Replaces the configured list.
    #[arg(long = "seed", value_name = "ID:HOST:PORT")]
    pub seeds: Vec<String>,

    /// Override the message log directory.
    #[arg(long, value_name = "PATH")]
    pub log_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Node to contact.
    #[arg(long, value_name = "HOST:PORT")]
    pub to: String,

    /// Sender id to stamp on the message.
    #[arg(long = "from", value_name = "ID", default_value_t = 0)]
    pub from_id: u64,

    /// Room to post into.
    #[arg(long, default_value = DEFAULT_ROOM)]
    pub room: String,

    /// Message text.
    pub text: String,
}

#[derive(Args, Debug)]
pub struct LogArgs {
    /// Config file (default: ./totem.toml if present).
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Override the node id.
    #[arg(long, value_name = "ID")]
    pub node_id: Option<u64>,

    /// Override the message log directory.
    #[arg(long, value_name = "PATH")]
    pub log_dir: Option<PathBuf>,
}

pub fn parse_from<I, T>(args: I) -> Cli
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    Cli::parse_from(args)
}

impl Cli {
    fn config_path(&self) -> Option<&Path> {
        match &self.command {
            Commands::Run(args) => args.config.as_deref(),
            Commands::Log(args) => args.config.as_deref(),
            Commands::Send(_) => None,
        }
    }

    /// Telemetry settings, best-effort: a broken config file must not
    /// prevent logging the error about itself.
    pub fn telemetry_config(&self) -> TelemetryConfig {
        let logging = config::load(self.config_path())
            .map(|config| config.logging)
            .unwrap_or_default();
        TelemetryConfig::new(self.verbose, self.quiet, logging)
    }
}

pub fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Run(args) => run_node(args),
        Commands::Send(args) => send_chat(args),
        Commands::Log(args) => print_log(args),
    }
}

fn run_node(args: RunArgs) -> Result<()> {
    let mut config = config::load(args.config.as_deref())?;
    apply_run_overrides(&mut config, &args)?;
    node::run(config, Box::new(LogSink))
}

fn apply_run_overrides(config: &mut Config, args: &RunArgs) -> Result<()> {
    if let Some(node_id) = args.node_id {
        config.node_id = NodeId::new(node_id);
    }
    if let Some(listen) = &args.listen {
        let (host, port) = split_host_port(listen)?;
        config.listen_host = host;
        config.listen_port = port;
    }
    if !args.seeds.is_empty() {
        let mut seeds = Vec::new();
        for seed in &args.seeds {
            seeds.push(seed.parse::<PeerSpec>()?);
        }
        config.seed_peers = seeds;
    }
    if let Some(log_dir) = &args.log_dir {
        config.log_dir = log_dir.clone();
    }
    Ok(())
}

fn split_host_port(value: &str) -> Result<(String, u16)> {
    let invalid = || ConfigError::InvalidAddr {
        value: value.to_string(),
    };
    let (host, port) = value.rsplit_once(':').ok_or_else(invalid)?;
    if host.is_empty() {
        return Err(invalid().into());
    }
    let port = port.parse::<u16>().map_err(|_| invalid())?;
    Ok((host.to_string(), port))
}

fn send_chat(args: SendArgs) -> Result<()> {
    let stream = TcpStream::connect(&args.to)?;
    stream.set_write_timeout(Some(Duration::from_secs(5)))?;

    let envelope = Envelope::new(
        NodeId::new(args.from_id),
        Term::ZERO,
        Payload::Chat { payload: args.text },
    )
    .with_room(args.room);

    let mut writer = LineWriter::new(stream, config::Limits::default().max_line_bytes);
    writer.write_envelope(&envelope)?;
    tracing::info!("sent CHAT to {}", args.to);
    Ok(())
}

fn print_log(args: LogArgs) -> Result<()> {
    let mut config = config::load(args.config.as_deref())?;
    if let Some(node_id) = args.node_id {
        config.node_id = NodeId::new(node_id);
    }
    if let Some(log_dir) = &args.log_dir {
        config.log_dir = log_dir.clone();
    }

    let log = MessageLog::open(&config.log_dir, config.node_id)?;
    for record in log.load_all()? {
        println!(
            "[seq={}] node_{}: {}",
            record.seq_no, record.sender_id, record.text
        );
    }
    Ok(())
}
