use std::{path::PathBuf, process::exit, time::Duration};

use anyhow::Context;
pub use anyhow::Result;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{info, warn};
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

mod errors;
mod geocoders;
mod pipeline;
mod places;

use crate::errors::display_causes_and_backtrace;
use crate::geocoders::{google, GeocoderConfig, GeocoderKind};
use crate::pipeline::{geocode_places, write_results_to_path, ErrorStyle, Summary};
use crate::places::read_places;

/// Look up addresses and coordinates for a list of places.
///
/// INPUT_FILE may be a CSV file with a header row (we look for columns named
/// "place", "place name", "location" or "store", and "country" or "nation"),
/// or a text file with one "place,country" per line.
#[derive(Debug, Parser)]
#[command(about, version, author)]
struct Opt {
    /// A CSV or text file containing places to look up.
    input_file: PathBuf,

    /// Where to write our output CSV.
    #[arg(short = 'o', long = "output", default_value = "addresses_output.csv")]
    output: PathBuf,

    /// A country to use for places which don't specify one.
    #[arg(short = 'c', long = "default-country", default_value = "")]
    default_country: String,

    /// Which geocoding service to use. [google, osm-library, nominatim]
    #[arg(short = 'g', long = "geocoder", default_value = "nominatim")]
    geocoder: GeocoderKind,

    /// API key for the Google geocoder.
    #[arg(short = 'k', long = "api-key", env = google::API_KEY_ENV_VAR, hide_env_values = true)]
    api_key: Option<String>,

    /// How to report places we couldn't geocode: `address` puts the error in
    /// the Address column, `column` adds an Error column. [address, column]
    #[arg(long = "errors", default_value = "address")]
    error_style: ErrorStyle,

    /// Give up on a single request after this many seconds.
    #[arg(
        long = "timeout",
        default_value = "10",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    timeout_secs: u64,

    /// Base URL of the geocoding service, if you don't want the public one
    /// (for example, a self-hosted Nominatim server).
    #[arg(long = "endpoint")]
    endpoint: Option<String>,
}

#[tokio::main]
async fn main() {
    // Set up tracing. Our output goes to a file, so we log to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run().await {
        display_causes_and_backtrace(&err);
        exit(1);
    }
}

/// Our main entry point.
async fn run() -> Result<()> {
    let opt = Opt::parse();

    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .context("could not install metrics recorder")?;

    // Check our configuration before we do anything slow.
    let config = GeocoderConfig {
        kind: opt.geocoder,
        api_key: opt.api_key.clone(),
        endpoint: opt.endpoint.clone(),
        timeout: Duration::from_secs(opt.timeout_secs),
    };
    let geocoder = config.build()?;
    let places = read_places(&opt.input_file)?;

    if places.is_empty() {
        warn!("no places found in {}", opt.input_file.display());
    } else if geocoder.min_interval() > Duration::ZERO {
        info!(
            "geocoding {} places with {} (at most one request every {:?})",
            places.len(),
            geocoder.tag(),
            geocoder.min_interval(),
        );
    } else {
        info!("geocoding {} places with {}", places.len(), geocoder.tag());
    }

    let results =
        geocode_places(geocoder.as_ref(), &places, &opt.default_country).await;
    write_results_to_path(&opt.output, &results, opt.error_style)?;

    info!("{}", Summary::from_results(&results));
    info!("results saved to {}", opt.output.display());
    info!("Metrics:\n{}", metrics_handle.render());
    Ok(())
}
