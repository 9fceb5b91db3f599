use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use clap::Parser;
use signal_hook::consts::signal;
use signal_hook::iterator::Signals;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use stlink_gdb_server::probe::stlink::StLinkProbe;
use stlink_gdb_server::probe::{ConnectMode, ProbeDriver, ProbeOptions};
use stlink_gdb_server::server::{GdbServer, ServerConfig, ServerError, SharedProbe};

/// GDB server for ST-Link debug probes.
#[derive(Parser)]
#[command(name = "st-util", version, about)]
struct Cli {
    /// Port to listen on for the GDB connection.
    #[arg(short = 'p', long = "listen_port", default_value_t = 4242)]
    listen_port: u16,

    /// Keep listening for connections after the client disconnects
    /// (extended mode).
    #[arg(short = 'm', long = "multi")]
    multi: bool,

    /// Do not reset the board on connection.
    #[arg(short = 'n', long = "no-reset", alias = "hot-plug")]
    no_reset: bool,

    /// Connect to the board before it executes any instructions.
    #[arg(short = 'u', long = "connect-under-reset")]
    connect_under_reset: bool,

    /// SWD frequency, e.g. `1800k` or `4M`.
    #[arg(short = 'F', long = "freq")]
    freq: Option<String>,

    /// Enable semihosting support.
    #[arg(long)]
    semihosting: bool,

    /// Use the probe with this serial number.
    #[arg(long)]
    serial: Option<String>,

    /// Verbose logging; may also be tuned with RUST_LOG.
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Parses `1800`, `1800k` or `1M` style frequencies into kHz.
fn parse_frequency(arg: &str) -> anyhow::Result<u32> {
    let arg = arg.trim();
    let (digits, multiplier) = match arg.as_bytes().last() {
        Some(b'k') | Some(b'K') => (&arg[..arg.len() - 1], 1),
        Some(b'm') | Some(b'M') => (&arg[..arg.len() - 1], 1000),
        _ => (arg, 1),
    };
    let value: u32 = digits
        .parse()
        .map_err(|_| anyhow!("can't parse a frequency: {arg}"))?;
    Ok(value * multiplier)
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .init();
}

/// Returns the target to normal execution and releases the probe. Runs on
/// signals and on the way out of a normal shutdown.
fn release_probe(probe: &SharedProbe) {
    let mut probe = probe.lock().unwrap();
    let _ = probe.run();
    let _ = probe.exit_debug_mode();
    probe.close();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let connect_mode = if cli.connect_under_reset {
        ConnectMode::UnderReset
    } else if cli.no_reset {
        ConnectMode::HotPlug
    } else {
        ConnectMode::Normal
    };

    let freq_khz = match cli.freq.as_deref().map(parse_frequency).transpose() {
        Ok(freq) => freq,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let options = ProbeOptions {
        connect_mode,
        freq_khz,
        serial: cli.serial.clone(),
    };

    let probe: Box<dyn ProbeDriver> = match StLinkProbe::open(&options) {
        Ok(probe) => Box::new(probe),
        Err(e) => {
            tracing::error!("failed to open the ST-Link: {e}");
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(
        "chip id {:#010x}, core id {:#010x}",
        probe.chip_id(),
        probe.core_id()
    );

    let shared: SharedProbe = Arc::new(Mutex::new(probe));

    // On SIGINT/SIGTERM, put the target back into normal run and close the
    // probe before going down. The watcher grabs the probe mutex, so it
    // waits out whatever probe transaction is in flight.
    let cleanup_probe = shared.clone();
    match Signals::new([signal::SIGINT, signal::SIGTERM]) {
        Ok(mut signals) => {
            std::thread::spawn(move || {
                if let Some(signum) = signals.forever().next() {
                    println!("Receive signal {signum}. Exiting...");
                    release_probe(&cleanup_probe);
                    std::process::exit(1);
                }
            });
        }
        Err(e) => tracing::warn!("cannot install signal handlers: {e}"),
    }

    let config = ServerConfig {
        listen_port: cli.listen_port,
        persistent: cli.multi,
        connect_mode,
        semihosting: cli.semihosting,
    };

    let reopen_options = options.clone();
    let opener = Box::new(move || {
        StLinkProbe::open(&reopen_options).map(|probe| Box::new(probe) as Box<dyn ProbeDriver>)
    });

    let mut server = GdbServer::new(shared.clone(), opener, config);
    let result = server.run();

    release_probe(&shared);

    match result {
        Ok(()) => ExitCode::SUCCESS,
        // A vanished client is the normal end of a session.
        Err(ServerError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::parse_frequency;

    #[test]
    fn frequency_suffixes() {
        assert_eq!(parse_frequency("1800").unwrap(), 1800);
        assert_eq!(parse_frequency("1800k").unwrap(), 1800);
        assert_eq!(parse_frequency("4M").unwrap(), 4000);
        assert!(parse_frequency("fast").is_err());
    }
}
