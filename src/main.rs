//! `nobodd`: a read-only TFTP server that serves files straight out of the
//! FAT partitions of Raspberry Pi disk images, for netbooting.

use std::path::PathBuf;
use std::process::ExitCode;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{error, info, warn};

use nobodd::bootserver::BootServer;
use nobodd::config::{self, Board, ServerConfig};
use nobodd::dispatcher::{Dispatcher, Tick};
use nobodd::error::Error;
use nobodd::listen;

/// How long `drain` waits for in-flight transfers to finish on shutdown
/// before the process force-exits anyway.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "nobodd", about = "A read-only TFTP server for Raspberry Pi netbooting")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", default_value = "/etc/nobodd/nobodd.conf")]
    config: PathBuf,

    /// Override the `[tftp] listen` setting: a literal IP address, `stdin`
    /// (inherit fd 0), or `systemd` (inherit via LISTEN_FDS).
    #[arg(short = 'l', long = "listen")]
    listen: Option<String>,

    /// Override the `[tftp] port` setting: a decimal port number or a
    /// known service name (currently just `tftp`).
    #[arg(short = 'p', long = "port")]
    port: Option<String>,

    /// Add (or replace) a board: SERIAL,PATH[,PARTITION[,IP]]. May be
    /// repeated. Takes precedence over a same-serial config file section.
    #[arg(short = 'b', long = "board")]
    board: Vec<String>,

    /// Increase logging verbosity. May be repeated.
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    /// Decrease logging verbosity. May be repeated.
    #[arg(short = 'q', long = "quiet", action = clap::ArgAction::Count)]
    quiet: u8,
}

fn verbosity_filter(verbose: u8, quiet: u8) -> &'static str {
    let level = 2i16 + i16::from(verbose) - i16::from(quiet);
    match level {
        i16::MIN..=0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    }
}

fn build_config(cli: &Cli) -> Result<ServerConfig, Error> {
    let mut server_config = config::load(&cli.config)?;

    if let Some(listen) = &cli.listen {
        server_config.listen = listen.clone();
    }
    if let Some(port) = &cli.port {
        server_config.port = port.clone();
    }

    if !cli.board.is_empty() {
        let extra: Vec<Board> = cli
            .board
            .iter()
            .map(|raw| Board::parse_cli(raw))
            .collect::<Result<_, _>>()?;
        let merged = (*server_config.boards).clone().with_cli_boards(extra);
        server_config.boards = Arc::new(merged);
    }

    Ok(server_config)
}

fn run(cli: Cli) -> Result<(), Error> {
    let server_config = build_config(&cli)?;
    if server_config.boards.is_empty() {
        warn!("no boards configured; every RRQ will be rejected as an unknown serial");
    }

    let port = listen::resolve_port(&server_config.port)?;
    let main_socket = listen::resolve(&server_config.listen, port)?;
    info!(
        "listening on {}",
        main_socket
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| server_config.listen.clone())
    );

    let boot_server = Rc::new(BootServer::new(Arc::clone(&server_config.boards)));
    let mut dispatcher = Dispatcher::new(main_socket, Rc::clone(&boot_server))
        .map_err(|source| Error::Bind {
            addr: server_config.listen.clone(),
            source,
        })?;
    let mut signals = Dispatcher::watch_signals().map_err(|source| Error::Bind {
        addr: "signalfd".to_string(),
        source,
    })?;
    dispatcher
        .register_signals(&mut signals)
        .map_err(|source| Error::Bind {
            addr: "signalfd".to_string(),
            source,
        })?;

    loop {
        match dispatcher.tick(&mut signals) {
            Ok(Tick::Continue) => {}
            Ok(Tick::Reload) => match build_config(&cli) {
                Ok(reloaded) => {
                    info!("reloaded configuration: {} board(s)", reloaded.boards.len());
                    boot_server.reload(reloaded.boards);
                }
                Err(e) => error!("configuration reload failed, keeping previous config: {e}"),
            },
            Ok(Tick::Shutdown(signal)) => {
                info!(
                    "received signal {signal}, draining {} transfer(s)",
                    dispatcher.transfer_count()
                );
                if let Err(e) = dispatcher.drain(SHUTDOWN_GRACE) {
                    warn!("error while draining transfers: {e}");
                }
                return Err(Error::Interrupted(signal));
            }
            Err(e) => {
                error!("event loop error: {e}");
            }
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    env_logger::Builder::from_env(
        env_logger::Env::default()
            .default_filter_or(verbosity_filter(cli.verbose, cli.quiet)),
    )
    .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e @ Error::Interrupted(_)) => {
            info!("{e}");
            ExitCode::from(e.exit_code().clamp(0, 255) as u8)
        }
        Err(e) => {
            error!("{e}");
            ExitCode::from(e.exit_code().clamp(0, 255) as u8)
        }
    }
}
