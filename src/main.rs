extern crate clap;

use clap::Parser;
use clap_verbosity_flag::{Verbosity, WarnLevel};
use log::debug;
use ookla_speed::config::{ConnectionMode, LoadedLatencyPolicy, TestOptions, Units};
use ookla_speed::display::{
    render_servers, render_summary, render_text, ConsoleProgress, DisplayMode,
};
use ookla_speed::errors::{exit_codes, format_error_for_display, ErrorKind};
use ookla_speed::ookla::server::MeasurementServer;
use ookla_speed::units::{DistanceUnit, SpeedUnit};
use ookla_speed::{SpeedTest, SpeedTestError};
use serde::Serialize;
use std::io::IsTerminal;
use std::sync::Arc;

/// Exit code after Ctrl-C, as shells report SIGINT.
const INTERRUPTED: i32 = 130;

#[derive(Parser)]
#[command(author, version = version(), about, long_about = None)]
struct Cli {
    /// Skip the download test
    #[arg(long)]
    no_download: bool,

    /// Skip the upload test
    #[arg(long)]
    no_upload: bool,

    /// Send every download connection to the best server only
    #[arg(long)]
    single: bool,

    /// Number of candidate servers to rank, or to list with --list
    #[arg(long, value_name = "N")]
    servers: Option<usize>,

    /// Test against this server id instead of the best ranked one
    #[arg(long, value_name = "ID")]
    server_id: Option<u32>,

    /// Print the servers matching TERM and exit
    #[arg(long, value_name = "TERM")]
    search: Option<String>,

    /// Print the nearest servers and exit
    #[arg(long)]
    list: bool,

    /// Unit for the download speed (Bps, KBps, MBps, GBps, bps, Kbps, Mbps, Gbps)
    #[arg(long, default_value = "Mbps")]
    download_unit: SpeedUnit,

    /// Unit for the upload speed
    #[arg(long, default_value = "Mbps")]
    upload_unit: SpeedUnit,

    /// Unit for server distances (mi, km)
    #[arg(long, default_value = "mi")]
    distance_unit: DistanceUnit,

    /// Print the results as JSON
    #[arg(long)]
    json: bool,

    /// Fail a throughput test when its loaded latency cannot be measured
    #[arg(long)]
    strict_loaded_latency: bool,

    #[command(flatten)]
    verbose: Verbosity<WarnLevel>,
}

impl Cli {
    fn options(&self) -> Result<TestOptions, SpeedTestError> {
        let connections =
            if self.single { ConnectionMode::Single } else { ConnectionMode::Multi };
        let loaded_latency = if self.strict_loaded_latency {
            LoadedLatencyPolicy::Fail
        } else {
            LoadedLatencyPolicy::Degrade
        };

        let mut options = TestOptions::default()
            .with_download(!self.no_download)
            .with_upload(!self.no_upload)
            .with_connections(connections)
            .with_server_id(self.server_id)
            .with_units(Units {
                distance: self.distance_unit,
                download: self.download_unit,
                upload: self.upload_unit,
            })
            .with_loaded_latency(loaded_latency);

        match self.servers {
            Some(0) => {
                return Err(SpeedTestError::config("--servers must be at least 1"))
            }
            Some(count) => options = options.with_servers_to_fetch(count),
            None => {}
        }

        Ok(options)
    }
}

fn version() -> &'static str {
    match option_env!("OOKLASPEED_BUILD_GIT_HASH") {
        Some(hash) => Box::leak(
            format!("{} (rev {})", env!("CARGO_PKG_VERSION"), hash).into_boxed_str(),
        ),
        None => env!("CARGO_PKG_VERSION"),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    env_logger::Builder::new()
        .filter_level(cli.verbose.log_level_filter())
        .parse_default_env()
        .init();

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        debug!("A TLS crypto provider was already installed");
    }

    let code = tokio::select! {
        code = run(&cli) => code,
        _ = tokio::signal::ctrl_c() => {
            eprintln!();
            eprintln!("Interrupted");
            INTERRUPTED
        }
    };

    std::process::exit(code);
}

async fn run(cli: &Cli) -> i32 {
    match execute(cli).await {
        Ok(()) => exit_codes::SUCCESS,
        Err(e) => {
            eprintln!("{}", format_error_for_display(&e));
            e.exit_code()
        }
    }
}

async fn execute(cli: &Cli) -> Result<(), SpeedTestError> {
    let mode = DisplayMode::detect(cli.json, std::io::stdout().is_terminal());
    let mut test = SpeedTest::new(cli.options()?);

    if cli.list {
        let servers = test.list_servers(cli.servers).await?;
        return print_servers(mode, &servers);
    }

    if let Some(term) = &cli.search {
        let servers = test.search_servers(term, cli.servers).await?;
        return print_servers(mode, &servers);
    }

    let interactive = mode == DisplayMode::Text && std::io::stderr().is_terminal();
    if interactive {
        test = test.with_progress(Arc::new(ConsoleProgress));
    }

    let result = test.run_full_test().await?;

    match mode {
        DisplayMode::Json => println!("{}", to_json(&result)?),
        DisplayMode::Text => println!("{}", render_text(&result)),
        DisplayMode::Silent => println!("{}", render_summary(&result)),
    }

    Ok(())
}

fn print_servers(mode: DisplayMode, servers: &[MeasurementServer]) -> Result<(), SpeedTestError> {
    match mode {
        DisplayMode::Json => println!("{}", to_json(&servers)?),
        DisplayMode::Text | DisplayMode::Silent => println!("{}", render_servers(servers)),
    }
    Ok(())
}

fn to_json<T: Serialize>(value: &T) -> Result<String, SpeedTestError> {
    serde_json::to_string_pretty(value).map_err(|e| {
        SpeedTestError::new(ErrorKind::Unknown, format!("Could not encode the results: {}", e))
    })
}
