//! Control CLI for `nptpd`. Each flag sends exactly one command datagram to
//! the daemon's control socket; no response is expected.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use owo_colors::OwoColorize as _;

/// nptpctl - send control commands to a running nptpd.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Set log verbosity mask to 0 (LOG_MASK_NONE).
    #[arg(short = '0')]
    mask0: bool,
    /// Set log verbosity mask to 1 (INFO).
    #[arg(short = '1')]
    mask1: bool,
    /// Set log verbosity mask to 2 (TRACE).
    #[arg(short = '2')]
    mask2: bool,
    /// Set log verbosity mask to 3 (INFO|TRACE).
    #[arg(short = '3')]
    mask3: bool,
    /// Set log verbosity mask to 4 (DEBUG).
    #[arg(short = '4')]
    mask4: bool,
    /// Set log verbosity mask to 5 (INFO|DEBUG).
    #[arg(short = '5')]
    mask5: bool,
    /// Set log verbosity mask to 6 (TRACE|DEBUG).
    #[arg(short = '6')]
    mask6: bool,
    /// Set log verbosity mask to 7 (all bits).
    #[arg(short = '7')]
    mask7: bool,
    /// Turn the daemon's hex-dump flag on/off.
    #[arg(short = 'd')]
    dump: bool,
    /// List the daemon's mapping table.
    #[arg(short = 't')]
    list: bool,
    /// Terminate the daemon.
    #[arg(short = 'x')]
    exit: bool,

    /// Path to the daemon's control-plane datagram socket.
    #[arg(long)]
    socket: Option<PathBuf>,
}

fn default_control_socket_path() -> PathBuf {
    std::env::var("XDG_RUNTIME_DIR")
        .map(|dir| PathBuf::from(dir).join("nptpd-ctl.sock"))
        .unwrap_or_else(|_| PathBuf::from("/tmp/nptpd-ctl.sock"))
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let socket_path = cli.socket.clone().unwrap_or_else(default_control_socket_path);

    let mut commands: Vec<&str> = Vec::new();
    if cli.mask0 {
        commands.push("0");
    }
    if cli.mask1 {
        commands.push("1");
    }
    if cli.mask2 {
        commands.push("2");
    }
    if cli.mask3 {
        commands.push("3");
    }
    if cli.mask4 {
        commands.push("4");
    }
    if cli.mask5 {
        commands.push("5");
    }
    if cli.mask6 {
        commands.push("6");
    }
    if cli.mask7 {
        commands.push("7");
    }
    if cli.dump {
        commands.push("dump");
    }
    if cli.list {
        commands.push("list");
    }
    if cli.exit {
        commands.push("exit");
    }
    if commands.is_empty() {
        commands.push("help");
    }

    for command in commands {
        nptpd::engine::control::send_command(&socket_path, command)
            .with_context(|| format!("sending {command:?} to {}", socket_path.display()))?;
    }
    Ok(())
}

fn main() {
    if let Err(err) = run() {
        anstream::eprintln!("{}", err.to_string().red());
        std::process::exit(1);
    }
}
