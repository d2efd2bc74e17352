use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};

use adbtun::config;
use adbtun::logging::{init_logger, LogVerbosity};
use adbtun::{AuthKey, Connection};

#[derive(Debug, Parser)]
#[command(name = "adbtun", version, about = "ADB wire-protocol client over TCP")]
struct Cli {
    /// Path to a PKCS#8 PEM private key to authenticate with (default: persisted key, or an
    /// ephemeral key generated for this connection)
    #[arg(long, global = true)]
    key: Option<PathBuf>,

    /// Connect timeout in milliseconds
    #[arg(long, default_value_t = 5000, global = true)]
    timeout: u64,

    /// Verbose logging
    #[arg(long, short = 'v', action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Perform the handshake against host:port and report the peer's banner
    Connect { host: String },
    /// Open a service stream, relaying stdin to it and its output to stdout
    Open { host: String, service: String },
    /// Shorthand for `open host shell:<command>`
    Shell { host: String, command: String },
    /// Persistently set the default private key path
    SetKey { path: PathBuf },
    /// Clear the persisted default private key path
    ClearKey,
}

fn dial(host: &str, timeout_ms: u64) -> Result<TcpStream> {
    let addr = if host.contains(':') { host.to_string() } else { format!("{host}:5555") };
    let mut addrs = addr.to_socket_addrs().with_context(|| format!("resolving {addr}"))?;
    let target = addrs.next().with_context(|| format!("no address for {addr}"))?;
    TcpStream::connect_timeout(&target, Duration::from_millis(timeout_ms))
        .with_context(|| format!("connecting to {addr}"))
}

fn load_key(cli_key: &Option<PathBuf>, state: &config::State) -> Result<Option<AuthKey>> {
    let path = cli_key.clone().or_else(|| state.default_key_path.clone());
    match path {
        Some(p) => Ok(Some(
            AuthKey::from_pkcs8_pem_file(&p).with_context(|| format!("loading key {}", p.display()))?,
        )),
        None => Ok(None),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger(match cli.verbose {
        0 => LogVerbosity::Normal,
        1 => LogVerbosity::Verbose,
        _ => LogVerbosity::Debug,
    });
    let mut state = config::load_state();

    // Handle config-only subcommands before dialing anything.
    match &cli.command {
        Commands::SetKey { path } => {
            if !path.exists() {
                bail!("no such file: {}", path.display());
            }
            state.default_key_path = Some(path.clone());
            config::save_state(&state).context("saving state")?;
            println!("Default key saved.");
            return Ok(());
        }
        Commands::ClearKey => {
            state.default_key_path = None;
            config::save_state(&state).context("saving state")?;
            println!("Default key cleared.");
            return Ok(());
        }
        _ => {}
    }

    let key = load_key(&cli.key, &state)?;

    match cli.command {
        Commands::Connect { host } => {
            let transport = dial(&host, cli.timeout)?;
            let conn = Connection::connect(transport, key).context("adb handshake failed")?;
            println!("connected; peer max payload = {}", conn.peer_max_payload());
            state.last_host = Some(host);
            config::save_state(&state).context("saving state")?;
        }
        Commands::Open { host, service } => {
            let transport = dial(&host, cli.timeout)?;
            let conn = Connection::connect(transport, key).context("adb handshake failed")?;
            let mut stream = conn.open(&service).context("opening stream")?;
            state.last_host = Some(host);
            config::save_state(&state).context("saving state")?;
            pump_stdio(&mut stream)?;
        }
        Commands::Shell { host, command } => {
            let transport = dial(&host, cli.timeout)?;
            let conn = Connection::connect(transport, key).context("adb handshake failed")?;
            let service = format!("shell:{command}");
            let mut stream = conn.open(&service).context("opening shell stream")?;
            state.last_host = Some(host);
            config::save_state(&state).context("saving state")?;
            pump_stdio(&mut stream)?;
        }
        Commands::SetKey { .. } | Commands::ClearKey => unreachable!("handled above"),
    }

    Ok(())
}

/// Relay stdin to the stream's writer on a background thread while pumping
/// the stream's output to stdout on this one, the way a generic `nc`-style
/// pipe would. Returns once the stream's output reaches end-of-stream; the
/// stdin-relay thread is left to exit on its own when stdin closes or the
/// stream does.
fn pump_stdio(stream: &mut adbtun::Stream) -> Result<()> {
    let mut writer = stream.writer();
    thread::spawn(move || {
        let _ = io::copy(&mut io::stdin(), &mut writer);
    });

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut buf = [0u8; 4096];
    loop {
        let n = stream.read(&mut buf).context("reading from stream")?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n]).context("writing to stdout")?;
    }
    out.flush().ok();
    Ok(())
}
