use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand};
use sockrelay::http::DEFAULT_HTTP_ADDR;
use sockrelay::link::{DEFAULT_QUEUE_CAPACITY, DEFAULT_UPSTREAM_URL};
use sockrelay::relay::processor::{DEFAULT_PROGRAM, DEFAULT_VIDEO_CODEC};
use sockrelay::relay::DEFAULT_LISTEN_ADDR;

use crate::exit::{CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod client;
pub mod doctor;
pub mod send;
pub mod server;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a consumer: accept WebSocket links and process work packets.
    Server(ServerArgs),
    /// Run a producer: HTTP uploads relayed to a consumer.
    Client(ClientArgs),
    /// Send one work packet to a consumer.
    Send(SendArgs),
    /// Run local environment health checks.
    Doctor(DoctorArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Server(args) => server::run(args, format),
        Command::Client(args) => client::run(args, format),
        Command::Send(args) => send::run(args, format),
        Command::Doctor(args) => doctor::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    /// Address of the upgrade endpoint.
    #[arg(long, env = "SOCKRELAY_LISTEN", default_value = DEFAULT_LISTEN_ADDR)]
    pub listen: String,
    /// Request path that accepts WebSocket upgrades.
    #[arg(long, env = "SOCKRELAY_PATH", default_value = "/websocket")]
    pub path: String,
    /// Worker threads. Default: available parallelism.
    #[arg(long, env = "SOCKRELAY_WORKERS")]
    pub workers: Option<usize>,
    /// Jobs that may wait for a worker.
    #[arg(long, env = "SOCKRELAY_WORKER_QUEUE", default_value = "256")]
    pub queue: usize,
    /// Refuse registrations beyond this many connections.
    #[arg(long, env = "SOCKRELAY_MAX_CONNECTIONS")]
    pub max_connections: Option<usize>,
    /// Transcoder executable.
    #[arg(long, env = "SOCKRELAY_FFMPEG", default_value = DEFAULT_PROGRAM)]
    pub ffmpeg: PathBuf,
    /// Video codec passed to the transcoder.
    #[arg(long, env = "SOCKRELAY_VIDEO_CODEC", default_value = DEFAULT_VIDEO_CODEC)]
    pub video_codec: String,
    /// Bound on one WebSocket handshake (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub handshake_timeout: String,
    /// Leave the open-file limit as inherited.
    #[arg(long)]
    pub keep_fd_limit: bool,
}

#[derive(Args, Debug)]
pub struct ClientArgs {
    /// Consumer WebSocket URL.
    #[arg(long, env = "SOCKRELAY_UPSTREAM", default_value = DEFAULT_UPSTREAM_URL)]
    pub upstream: String,
    /// Address of the HTTP surface.
    #[arg(long, env = "SOCKRELAY_HTTP_LISTEN", default_value = DEFAULT_HTTP_ADDR)]
    pub listen: String,
    /// Directory uploads are stored in and downloads served from.
    #[arg(long, env = "SOCKRELAY_FILES_DIR", default_value = "files")]
    pub files_dir: PathBuf,
    /// Static front-end root.
    #[arg(long, env = "SOCKRELAY_STATIC_DIR", default_value = "static")]
    pub static_dir: PathBuf,
    /// Packets that may wait for the link before uploads are refused.
    #[arg(long, env = "SOCKRELAY_QUEUE", default_value_t = DEFAULT_QUEUE_CAPACITY)]
    pub queue: usize,
    /// Resend the packet whose write broke the link after redialing.
    #[arg(long, env = "SOCKRELAY_RETRY_FAILED")]
    pub retry_failed: bool,
    /// Bound on dialing the consumer (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub dial_timeout: String,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Consumer WebSocket URL.
    pub url: String,
    /// Path of the artifact to process, as the consumer sees it.
    #[arg(long)]
    pub path: String,
    /// Send as a binary frame instead of text.
    #[arg(long)]
    pub binary: bool,
    /// Wait for the result and print it.
    #[arg(long)]
    pub wait: bool,
    /// Maximum time to wait for the result when --wait is set (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub wait_timeout: String,
    /// Bound on dialing the consumer.
    #[arg(long, default_value = "5s")]
    pub dial_timeout: String,
}

#[derive(Args, Debug)]
pub struct DoctorArgs {
    /// Transcoder executable to probe.
    #[arg(long, env = "SOCKRELAY_FFMPEG", default_value = DEFAULT_PROGRAM)]
    pub ffmpeg: PathBuf,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub(crate) fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = match input.strip_suffix("ms") {
        Some(num) => (num, true),
        None => (input.strip_suffix('s').unwrap_or(input), false),
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;
    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}

/// Run `on_signal` on Ctrl-C.
pub(crate) fn install_ctrlc_handler(on_signal: impl Fn() + Send + 'static) -> CliResult<()> {
    ctrlc::set_handler(on_signal).map_err(|err| {
        CliError::new(
            crate::exit::INTERNAL,
            format!("signal handler setup failed: {err}"),
        )
    })
}
