use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

pub mod engine;

use engine::EngineSettings;

/// nptpd - named-pipe to TCP bridging daemon.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Run in the foreground instead of backgrounding via fork.
    #[arg(short = 'f', long)]
    pub foreground: bool,

    /// Path to the mapping configuration file.
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Path to the control-plane datagram socket.
    #[arg(long)]
    pub control_socket: Option<PathBuf>,

    /// Base path for this daemon's outbound local-stream bind addresses;
    /// the per-mapping index is appended.
    #[arg(long)]
    pub ipc_stream_root: Option<String>,
}

pub fn parse() -> Cli {
    Cli::parse()
}

/// Resolves on-disk defaults for paths the CLI didn't override, rooted
/// under the XDG runtime/config directories.
fn xdg_dirs() -> xdg::BaseDirectories {
    xdg::BaseDirectories::with_prefix("nptpd")
}

fn default_config_path() -> Result<PathBuf> {
    let xdg = xdg_dirs();
    Ok(xdg.find_config_file("nptpd.toml").unwrap_or_else(|| {
        xdg.get_config_home()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("nptpd.toml")
    }))
}

fn default_control_socket_path() -> PathBuf {
    std::env::var("XDG_RUNTIME_DIR")
        .map(|dir| PathBuf::from(dir).join("nptpd-ctl.sock"))
        .unwrap_or_else(|_| PathBuf::from("/tmp/nptpd-ctl.sock"))
}

fn default_ipc_stream_root() -> String {
    std::env::var("XDG_RUNTIME_DIR")
        .map(|dir| format!("{dir}/nptpd-stream-"))
        .unwrap_or_else(|_| "/tmp/nptpd-stream-".to_string())
}

pub fn settings_from_cli(cli: &Cli) -> Result<EngineSettings> {
    Ok(EngineSettings {
        config_path: match &cli.config {
            Some(p) => p.clone(),
            None => default_config_path().context("resolving default config path")?,
        },
        control_socket_path: cli.control_socket.clone().unwrap_or_else(default_control_socket_path),
        ipc_stream_root: cli.ipc_stream_root.clone().unwrap_or_else(default_ipc_stream_root),
    })
}

/// Forks once and exits the parent, leaving the child to run in the
/// background.
fn daemonize() {
    let pid = unsafe { libc::fork() };
    if pid > 0 {
        std::process::exit(0);
    }
}

pub fn run() -> Result<()> {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .try_init();

    let cli = parse();
    if !cli.foreground {
        daemonize();
    }

    let settings = settings_from_cli(&cli)?;
    engine::supervisor::run(&settings).map_err(Into::into)
}
