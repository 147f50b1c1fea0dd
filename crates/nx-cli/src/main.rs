mod config;
mod progress;

use std::io::{self, BufRead, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use nx_transfer::{
    CancelToken, ReceiveReport, Receiver, ReceiverConfig, SenderConfig, TracingLogger,
    TransferError, TransportKind, local_ip, receive_messages, send_file, send_messages,
};

use config::Settings;
use progress::ConsoleProgress;

/// How long a cancelled operation may take to unwind before the process exits.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// nx - send files and messages between two machines over UDP or TCP
#[derive(Parser)]
#[command(name = "nx")]
#[command(version, about, long_about = None, disable_version_flag = true)]
struct Cli {
    /// Print version
    #[arg(short = 'v', long, action = clap::ArgAction::Version)]
    version: (),

    /// Debug-level logging
    #[arg(long, global = true)]
    verbose: bool,

    /// Print this machine's outward-facing IP address
    #[arg(short = 'i', long)]
    get_ip: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Send a message stream or a file
    Post {
        #[command(subcommand)]
        what: Post,
    },
    /// Receive messages or files
    Get {
        #[command(subcommand)]
        what: Get,
    },
}

#[derive(Subcommand)]
enum Post {
    /// Send lines typed on stdin until "EXIT"
    Msg { ip: IpAddr, port: u16 },
    /// Send one file
    File {
        ip: IpAddr,
        port: u16,
        file_path: PathBuf,
        /// Use TCP instead of UDP. More reliable but slower.
        #[arg(long)]
        tcp: bool,
        /// Bytes per chunk (overrides NX_CHUNK_SIZE)
        #[arg(long)]
        chunk_size: Option<usize>,
    },
}

#[derive(Subcommand)]
enum Get {
    /// Print incoming messages until "EXIT"
    Msg {
        port: u16,
        /// Print message text without the sender's address
        #[arg(short, long)]
        anonymous: bool,
    },
    /// Receive a file into a directory
    File {
        port: u16,
        file_dir: PathBuf,
        /// Keep receiving files until interrupted
        #[arg(short, long)]
        recursive: bool,
        /// Use TCP instead of UDP. More reliable but slower.
        #[arg(long)]
        tcp: bool,
        /// Bytes per chunk (overrides NX_CHUNK_SIZE)
        #[arg(long)]
        chunk_size: Option<usize>,
        /// Refuse files whose name would land outside the directory
        #[arg(long)]
        strict_names: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "nx=debug,nx_transfer=debug"
    } else {
        "nx=info,nx_transfer=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with_writer(io::stderr)
        .init();

    if cli.get_ip {
        println!("{}", local_ip());
        return Ok(());
    }

    let Some(command) = cli.command else {
        eprintln!("Nothing to do. See `nx --help`.");
        return Ok(());
    };
    let settings = Settings::from_env()?;

    run_cancellable(move |cancel| match command {
        Command::Post { what: Post::Msg { ip, port } } => post_msg(SocketAddr::new(ip, port), &cancel),
        Command::Post {
            what: Post::File {
                ip,
                port,
                file_path,
                tcp,
                chunk_size,
            },
        } => post_file(
            SocketAddr::new(ip, port),
            &file_path,
            transport_kind(tcp),
            &settings.with_chunk_size(chunk_size),
            &cancel,
        ),
        Command::Get { what: Get::Msg { port, anonymous } } => get_msg(port, anonymous, &cancel),
        Command::Get {
            what: Get::File {
                port,
                file_dir,
                recursive,
                tcp,
                chunk_size,
                strict_names,
            },
        } => {
            let settings = settings.with_chunk_size(chunk_size);
            let mut config = ReceiverConfig::new(
                transport_kind(tcp),
                SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
                file_dir,
            );
            config.chunk_size = settings.chunk_size;
            config.read_timeout = settings.read_timeout;
            config.stream_read_timeout = settings.stream_timeout;
            config.reject_unsafe_names = strict_names;
            config.logger = Some(Arc::new(TracingLogger));
            get_file(config, recursive, &cancel)
        }
    })
    .await
}

fn transport_kind(tcp: bool) -> TransportKind {
    if tcp { TransportKind::Stream } else { TransportKind::Datagram }
}

/// Run blocking transfer work off the runtime. A shutdown signal raises the
/// cancel token; if the work has not returned within [`SHUTDOWN_GRACE`] the
/// process exits.
async fn run_cancellable<F>(work: F) -> Result<()>
where
    F: FnOnce(CancelToken) -> Result<()> + Send + 'static,
{
    let cancel = CancelToken::new();
    let worker_cancel = cancel.clone();
    let mut task = tokio::task::spawn_blocking(move || work(worker_cancel));

    tokio::select! {
        joined = &mut task => joined?,
        () = shutdown_signal() => {
            cancel.cancel();
            match tokio::time::timeout(SHUTDOWN_GRACE, task).await {
                Ok(joined) => joined?,
                Err(_) => {
                    warn!("Blocking call did not return within {:?}, exiting", SHUTDOWN_GRACE);
                    std::process::exit(130);
                }
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, stopping..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, stopping..."),
                }
            }
            Err(e) => {
                warn!("SIGTERM handler unavailable: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, stopping...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, stopping...");
    }
}

// ── Chat ───────────────────────────────────────────────────────────────

fn post_msg(dest: SocketAddr, cancel: &CancelToken) -> Result<()> {
    println!("Sending messages to {}", dest);
    let stdin = io::stdin();
    let lines = std::iter::from_fn(move || {
        print!("send: ");
        io::stdout().flush().ok();
        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line.trim_end_matches(['\r', '\n']).to_string()),
        }
    })
    .take_while(|_| !cancel.is_cancelled());

    let sent = send_messages(dest, lines)?;
    info!("Sent {} message(s) to {}", sent, dest);
    Ok(())
}

fn get_msg(port: u16, anonymous: bool, cancel: &CancelToken) -> Result<()> {
    let bind = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    println!("Listening for messages on port {}...", port);
    receive_messages(bind, cancel, |message| {
        if anonymous {
            println!("{}", message.text);
        } else {
            println!("Message from {}: {}", message.from, message.text);
        }
    })?;
    Ok(())
}

// ── Files ──────────────────────────────────────────────────────────────

fn post_file(
    dest: SocketAddr,
    path: &Path,
    kind: TransportKind,
    settings: &Settings,
    cancel: &CancelToken,
) -> Result<()> {
    let config = SenderConfig {
        kind,
        chunk_size: settings.chunk_size,
        handshake_timeout: settings.handshake_timeout,
        connect_timeout: settings.stream_timeout,
        ack_timeout: settings.stream_timeout,
        write_timeout: settings.stream_timeout,
        logger: Some(Arc::new(TracingLogger)),
    };

    println!("Sending {} to {} over {}", path.display(), dest, kind);
    let progress = ConsoleProgress::stdout();
    let result = send_file(path, dest, &config, &progress, cancel);
    progress.finish();

    match result {
        Ok(report) => {
            println!(
                "complete. [{}] {} bytes in {:.2?}",
                path.display(),
                report.bytes_sent,
                report.elapsed
            );
            Ok(())
        }
        Err(TransferError::Cancelled) => {
            println!("Cancelled.");
            Ok(())
        }
        Err(e @ TransferError::HandshakeTimeout(_)) => {
            println!("Ensure that the receiver is open and listening on the correct port.");
            Err(e.into())
        }
        Err(e) => Err(e).with_context(|| format!("sending {}", path.display())),
    }
}

fn get_file(config: ReceiverConfig, recursive: bool, cancel: &CancelToken) -> Result<()> {
    let mut receiver = Receiver::new(config)?;
    let save_dir = receiver.config().save_dir.clone();
    let kind = receiver.config().kind;
    let progress = ConsoleProgress::stdout();

    if recursive {
        println!(
            "Receiving files into {} over {} until interrupted...",
            save_dir.display(),
            kind
        );
        let summary = receiver.run_repeating(&progress, cancel, |result| {
            progress.finish();
            if let Err(e) = print_outcome(result) {
                warn!("{:#}", e);
            }
        })?;
        println!(
            "Received {} file(s); {} failed validation, {} failed.",
            summary.completed, summary.mismatched, summary.failed
        );
        return Ok(());
    }

    let listening = receiver.listen()?;
    println!("Listening for file on {} ({})...", listening.local_addr(), kind);
    let result = listening
        .accept_transfer(&progress, cancel)
        .and_then(|received| {
            progress.finish();
            if let Some(metadata) = received.metadata() {
                println!("Validating {} against {}...", received.path().display(), metadata.digest);
            }
            received.validate()
        });
    progress.finish();
    print_outcome(&result)
}

/// Report one receive session. Cancellation is not an error.
fn print_outcome(result: &Result<ReceiveReport, TransferError>) -> Result<()> {
    match result {
        Ok(report) => {
            println!(
                "File validated. [{}] {} bytes in {:.2?}",
                report.path.display(),
                report.bytes_received,
                report.elapsed
            );
            Ok(())
        }
        Err(TransferError::Cancelled) => {
            println!("Cancelled.");
            Ok(())
        }
        Err(TransferError::ValidationMismatch {
            path,
            expected,
            computed,
        }) => {
            println!(
                "File validation failed! Expected {} but got {}. [{}]",
                expected,
                computed,
                path.display()
            );
            anyhow::bail!("validation failed for {}", path.display())
        }
        Err(e) => anyhow::bail!("file transfer failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use clap::error::ErrorKind;

    #[test]
    fn command_tree_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn lowercase_v_prints_version() {
        for flag in ["-v", "--version"] {
            let err = Cli::try_parse_from(["nx", flag]).err().unwrap();
            assert_eq!(err.kind(), ErrorKind::DisplayVersion);
        }
    }

    #[test]
    fn get_ip_parses_alongside_a_subcommand() {
        let cli = Cli::try_parse_from(["nx", "-i", "post", "msg", "127.0.0.1", "9000"]).unwrap();
        assert!(cli.get_ip);
        assert!(cli.command.is_some());
    }

    #[test]
    fn get_file_flags() {
        let cli = Cli::try_parse_from([
            "nx", "get", "file", "9000", "inbox", "-r", "--tcp", "--chunk-size", "4096",
            "--strict-names",
        ])
        .unwrap();
        match cli.command {
            Some(Command::Get {
                what:
                    Get::File {
                        port,
                        recursive,
                        tcp,
                        chunk_size,
                        strict_names,
                        ..
                    },
            }) => {
                assert_eq!(port, 9000);
                assert!(recursive && tcp && strict_names);
                assert_eq!(chunk_size, Some(4096));
            }
            _ => panic!("expected get file"),
        }
    }
}
