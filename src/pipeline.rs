//! Geocoding support.
//!
//! We geocode one place at a time, in input order. The free services we
//! support allow at most one request per second, so there's nothing to gain
//! from running requests in parallel.

use std::{fmt, io, path::Path, time::Duration};

use anyhow::{format_err, Context};
use metrics::{counter, describe_counter};
use strum_macros::{Display, EnumString};
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

use crate::geocoders::{Geocoder, Location, ProviderError};
use crate::places::{InputRow, ProviderQuery};
use crate::Result;

/// Our output columns, in order.
static OUTPUT_HEADERS: &[&str] = &["Place", "Country", "Address", "Latitude", "Longitude"];

/// The extra column we add with [`ErrorStyle::Column`].
static ERROR_HEADER: &str = "Error";

/// The error message we record for rows without a place name.
static EMPTY_PLACE_MESSAGE: &str = "empty place name";

/// How should we record per-row errors in our output?
#[derive(Debug, Clone, Copy, Display, EnumString, Eq, PartialEq)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorStyle {
    /// Put the error message in the `Address` column.
    Address,
    /// Add an `Error` column, and leave `Address` empty.
    Column,
}

/// The outcome of geocoding a single input row.
#[derive(Clone, Debug, PartialEq)]
pub struct GeocodeResult {
    /// The place name from our input.
    pub place: String,
    /// The country we actually used (which may be the default country).
    pub country: String,
    /// Either a location, or a human-readable error message.
    pub outcome: std::result::Result<Location, String>,
}

impl GeocodeResult {
    /// The address we found, if any.
    pub fn address(&self) -> Option<&str> {
        self.outcome.as_ref().ok().map(|loc| &loc.address[..])
    }

    /// The latitude we found, if any.
    pub fn latitude(&self) -> Option<f64> {
        self.outcome.as_ref().ok().map(|loc| loc.latitude)
    }

    /// The longitude we found, if any.
    pub fn longitude(&self) -> Option<f64> {
        self.outcome.as_ref().ok().map(|loc| loc.longitude)
    }

    /// Why we couldn't geocode this row, if we couldn't.
    pub fn error(&self) -> Option<&str> {
        self.outcome.as_ref().err().map(|err| &err[..])
    }
}

/// Build the error message we record for `err`.
fn error_message(query: &ProviderQuery, err: &ProviderError) -> String {
    match err {
        ProviderError::NotFound => format!("address not found for {}", query),
        err => format!("error geocoding {}: {}", query, err),
    }
}

/// Enforces a fixed delay before every request except the first, whether or
/// not the previous request succeeded.
#[derive(Debug)]
pub struct Pacer {
    interval: Duration,
    first: bool,
}

impl Pacer {
    pub fn new(interval: Duration) -> Pacer {
        Pacer {
            interval,
            first: true,
        }
    }

    /// Wait until we're allowed to make another request.
    pub async fn wait(&mut self) {
        if self.first {
            self.first = false;
        } else if !self.interval.is_zero() {
            debug!("waiting {:?} before next request", self.interval);
            sleep(self.interval).await;
        }
    }
}

/// How many places did we geocode?
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Summary {
    pub succeeded: usize,
    pub failed: usize,
}

impl Summary {
    /// Count the successes and failures in `results`.
    pub fn from_results(results: &[GeocodeResult]) -> Summary {
        let succeeded = results.iter().filter(|r| r.outcome.is_ok()).count();
        Summary {
            succeeded,
            failed: results.len() - succeeded,
        }
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "geocoded {} of {} places ({} failed)",
            self.succeeded,
            self.succeeded + self.failed,
            self.failed,
        )
    }
}

/// Geocode every row in `places`, in order.
///
/// This never fails. Every input row produces exactly one output row, and any
/// problems are recorded in that row.
#[instrument(
    level = "debug",
    skip_all,
    fields(geocoder = geocoder.tag(), rows = places.len())
)]
pub async fn geocode_places(
    geocoder: &dyn Geocoder,
    places: &[InputRow],
    default_country: &str,
) -> Vec<GeocodeResult> {
    describe_counter!("geocodeplaces.places.total", "Total places processed");

    let mut pacer = Pacer::new(geocoder.min_interval());
    let total = places.len();
    let mut results = Vec::with_capacity(total);
    for (i, row) in places.iter().enumerate() {
        let country = row.effective_country(default_country);
        info!("geocoding {}/{}: {}, {}", i + 1, total, row.place, country);

        let outcome = if !row.is_valid() {
            warn!("row {} has no place name", i + 1);
            counter!("geocodeplaces.places.total", 1, "geocoder" => geocoder.tag().to_owned(), "geocode_result" => "invalid");
            Err(EMPTY_PLACE_MESSAGE.to_owned())
        } else {
            let query = ProviderQuery::new(&row.place, country);
            pacer.wait().await;
            match geocoder.geocode(&query).await {
                Ok(location) => {
                    debug!("found {:?}", location);
                    counter!("geocodeplaces.places.total", 1, "geocoder" => geocoder.tag().to_owned(), "geocode_result" => "found");
                    Ok(location)
                }
                Err(err) => {
                    let message = error_message(&query, &err);
                    warn!("{}", message);
                    counter!("geocodeplaces.places.total", 1, "geocoder" => geocoder.tag().to_owned(), "geocode_result" => err.metrics_label());
                    Err(message)
                }
            }
        };

        results.push(GeocodeResult {
            place: row.place.clone(),
            country: country.to_owned(),
            outcome,
        });
    }
    debug_assert_eq!(results.len(), places.len());
    results
}

/// Write `results` as CSV to `wtr`.
pub fn write_results<W: io::Write>(
    wtr: W,
    results: &[GeocodeResult],
    error_style: ErrorStyle,
) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(wtr);

    let mut headers = OUTPUT_HEADERS.to_vec();
    if error_style == ErrorStyle::Column {
        headers.push(ERROR_HEADER);
    }
    wtr.write_record(&headers)?;

    for result in results {
        // `f64`'s `Display` never uses scientific notation, and prints the
        // shortest string which round-trips.
        let (address, latitude, longitude, error) = match &result.outcome {
            Ok(loc) => (
                loc.address.as_str(),
                loc.latitude.to_string(),
                loc.longitude.to_string(),
                "",
            ),
            Err(err) => match error_style {
                ErrorStyle::Address => (err.as_str(), String::new(), String::new(), ""),
                ErrorStyle::Column => ("", String::new(), String::new(), err.as_str()),
            },
        };
        let mut row = vec![
            result.place.as_str(),
            result.country.as_str(),
            address,
            latitude.as_str(),
            longitude.as_str(),
        ];
        if error_style == ErrorStyle::Column {
            row.push(error);
        }
        wtr.write_record(&row)?;
    }
    wtr.flush()?;
    Ok(())
}

/// Write `results` to a CSV file at `path`.
pub fn write_results_to_path(
    path: &Path,
    results: &[GeocodeResult],
    error_style: ErrorStyle,
) -> Result<()> {
    let f = std::fs::File::create(path)
        .with_context(|| format_err!("cannot create {}", path.display()))?;
    write_results(io::BufWriter::new(f), results, error_style)
        .with_context(|| format_err!("error writing {}", path.display()))
}
