// pibootd: a read-only TFTP server that serves files straight out of the
// FAT boot partitions of raw disk images, for netbooting Raspberry Pis.
//
// The Pi bootloader's netboot sequence requests every file under a prefix
// of its own serial number ("1234abcd/config.txt", "1234abcd/start4.elf",
// ...). Each configured board maps such a prefix to a disk image and a
// partition number; the partition's FAT file-system is mounted read-only in
// process and file contents are streamed over TFTP (RFC 1350 with the
// RFC 2347 options blksize, tsize, timeout and utimeout).
//
// Exit codes: 0 on normal shutdown, 1 for configuration errors, 2 when the
// listening socket cannot be acquired, 130 on interrupt.

mod boot;
mod conf;
mod disk;
mod fat;
mod image;
mod netascii;
mod server;
mod tftp;
mod transfer;

#[cfg(test)]
mod testutil;

use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{error, info, warn};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;

use crate::boot::BootResolver;
use crate::server::TftpServer;

/// Read-only TFTP server that netboots Raspberry Pis from the FAT boot
/// partitions of raw disk images.
#[derive(Parser)]
#[command(name = "pibootd", version)]
struct Args {
    /// Address to listen on: an IPv4/IPv6 literal, "stdin" to inherit fd 0,
    /// or "systemd" to accept a socket from the service manager
    #[arg(long)]
    listen: Option<String>,

    /// UDP port number or service name to listen on
    #[arg(long)]
    port: Option<String>,

    /// Board definition, repeatable; overrides boards from configuration
    /// files
    #[arg(long = "board", value_name = "SERIAL,IMAGE[,PART[,IP]]")]
    boards: Vec<String>,

    /// Configuration file to read instead of the default search path
    #[arg(long, value_name = "FILE")]
    conf: Option<PathBuf>,

    /// Enable debug output
    #[arg(long, short)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(
        if args.verbose { "debug" } else { "info" },
    ))
    .init();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("{e:#}");
            return ExitCode::from(1);
        }
    };
    let socket = match bind_socket(&config) {
        Ok(socket) => socket,
        Err(e) => {
            error!("{e:#}");
            return ExitCode::from(2);
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to start runtime: {e}");
            return ExitCode::from(1);
        }
    };
    match runtime.block_on(serve(args, config, socket)) {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(1)
        }
    }
}

fn load_config(args: &Args) -> Result<conf::Config> {
    let paths = match &args.conf {
        Some(path) => vec![path.clone()],
        None => conf::default_paths(),
    };
    let mut config = conf::Config::load(&paths, &args.boards)?;
    if let Some(listen) = &args.listen {
        config.listen = listen.clone();
    }
    if let Some(port) = &args.port {
        config.port = conf::parse_port(port).map_err(|msg| anyhow::anyhow!(msg))?;
    }
    if config.boards.is_empty() {
        warn!("no boards configured; every request will fail");
    }
    Ok(config)
}

/// Acquires the main socket: bound fresh, inherited on fd 0, or passed by
/// a service manager on fd 3.
fn bind_socket(config: &conf::Config) -> Result<std::net::UdpSocket> {
    use std::os::fd::FromRawFd;

    match config.listen.as_str() {
        "stdin" => {
            // Take the descriptor, clone it into a socket we own, and leak
            // the original so fd 0 stays open.
            let inherited = unsafe { std::net::UdpSocket::from_raw_fd(0) };
            let socket = inherited
                .try_clone()
                .context("fd 0 is not a datagram socket")?;
            std::mem::forget(inherited);
            Ok(socket)
        }
        "systemd" => {
            let pid: u32 = std::env::var("LISTEN_PID")
                .context("systemd listen mode but LISTEN_PID is not set")?
                .parse()
                .context("LISTEN_PID is not a number")?;
            if pid != std::process::id() {
                bail!("LISTEN_PID names another process");
            }
            let fds: u32 = std::env::var("LISTEN_FDS")
                .context("systemd listen mode but LISTEN_FDS is not set")?
                .parse()
                .context("LISTEN_FDS is not a number")?;
            if fds != 1 {
                bail!("expected exactly one inherited socket, got {fds}");
            }
            // The service manager passes sockets starting at fd 3.
            Ok(unsafe { std::net::UdpSocket::from_raw_fd(3) })
        }
        literal => {
            let ip: IpAddr = literal
                .parse()
                .with_context(|| format!("invalid listen address {literal:?}"))?;
            std::net::UdpSocket::bind((ip, config.port))
                .with_context(|| format!("unable to bind {literal}:{}", config.port))
        }
    }
}

async fn serve(args: Args, config: conf::Config, socket: std::net::UdpSocket) -> Result<ExitCode> {
    let resolver = Arc::new(BootResolver::new(config.boards.clone()));
    let server = Arc::new(TftpServer::new(socket, resolver.clone())?);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // SIGHUP re-reads the configuration and swaps the board registry; a
    // broken replacement keeps the old one.
    let mut hangup = signal(SignalKind::hangup())?;
    let reload_args = (args.conf.clone(), args.boards.clone());
    let reload_resolver = resolver.clone();
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            let paths = match &reload_args.0 {
                Some(path) => vec![path.clone()],
                None => conf::default_paths(),
            };
            match conf::Config::load(&paths, &reload_args.1) {
                Ok(new_config) => {
                    info!("configuration reloaded: {} boards", new_config.boards.len());
                    reload_resolver.replace_boards(new_config.boards);
                }
                Err(e) => warn!("configuration reload failed, keeping old: {e}"),
            }
        }
    });

    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let run_server = server.clone();
    let mut task = tokio::spawn(async move { run_server.run(shutdown_rx).await });

    let interrupted = tokio::select! {
        _ = terminate.recv() => {
            info!("SIGTERM received, draining transfers");
            false
        }
        _ = interrupt.recv() => {
            info!("interrupted, draining transfers");
            true
        }
        result = &mut task => {
            // The server only returns early on a socket error.
            result??;
            return Ok(ExitCode::SUCCESS);
        }
    };
    let _ = shutdown_tx.send(true);
    task.await??;
    Ok(if interrupted {
        ExitCode::from(130)
    } else {
        ExitCode::SUCCESS
    })
}
