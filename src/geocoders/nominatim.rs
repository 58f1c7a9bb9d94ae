//! Direct HTTP interface to OpenStreetMap's Nominatim service.
//!
//! Nominatim's [usage policy](https://operations.osmfoundation.org/policies/nominatim/)
//! allows at most one request per second, and requires a `User-Agent` which
//! identifies the application.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::{describe_histogram, histogram, Unit};
use serde::Deserialize;
use tracing::{debug, instrument};
use url::Url;

use crate::{errors::ConfigError, places::ProviderQuery};

use super::{get_body, with_timeout, Geocoder, Location, ProviderError, SharedHttpClient};

/// The public Nominatim server.
pub static DEFAULT_ENDPOINT: &str = "https://nominatim.openstreetmap.org/";

/// The languages we ask Nominatim to use for display names.
static ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9";

/// A single search result. Nominatim returns coordinates as strings.
#[derive(Clone, Debug, Deserialize)]
pub struct SearchResult {
    #[serde(default)]
    pub display_name: String,
    pub lat: Option<String>,
    pub lon: Option<String>,
}

impl SearchResult {
    /// Convert this result into a `Location`.
    fn into_location(self) -> Result<Location, ProviderError> {
        let latitude = parse_coordinate("lat", self.lat.as_deref())?;
        let longitude = parse_coordinate("lon", self.lon.as_deref())?;
        Ok(Location {
            address: self.display_name,
            latitude,
            longitude,
        })
    }
}

fn parse_coordinate(name: &str, value: Option<&str>) -> Result<f64, ProviderError> {
    let value = value.ok_or_else(|| {
        ProviderError::MalformedResponse(format!("result has no {:?}", name))
    })?;
    value.trim().parse::<f64>().map_err(|err| {
        ProviderError::MalformedResponse(format!("invalid {} {:?}: {}", name, value, err))
    })
}

/// Interpret the body of a `/search` response. Only the first result matters.
pub fn parse_search_response(body: &[u8]) -> Result<Location, ProviderError> {
    let results: Vec<SearchResult> = serde_json::from_slice(body)?;
    results
        .into_iter()
        .next()
        .ok_or(ProviderError::NotFound)?
        .into_location()
}

#[test]
fn first_search_result_is_used() {
    let body = br#"[
        {
            "place_id": 88066702,
            "display_name": "Paris, Ile-de-France, Metropolitan France, France",
            "lat": "48.8588897",
            "lon": "2.3200410217200766"
        },
        { "display_name": "Paris, Lamar County, Texas, United States", "lat": "33.66", "lon": "-95.55" }
    ]"#;
    assert_eq!(
        parse_search_response(body).unwrap(),
        Location {
            address: "Paris, Ile-de-France, Metropolitan France, France".to_owned(),
            latitude: 48.8588897,
            longitude: 2.3200410217200766,
        },
    );
}

#[test]
fn empty_search_response_is_not_found() {
    assert!(matches!(
        parse_search_response(b"[]"),
        Err(ProviderError::NotFound)
    ));
}

#[test]
fn bad_search_responses_are_malformed() {
    for body in [
        &b"{\"error\": \"nope\"}"[..],
        &br#"[{ "display_name": "Somewhere", "lon": "1.0" }]"#[..],
        &br#"[{ "display_name": "Somewhere", "lat": "north", "lon": "1.0" }]"#[..],
    ] {
        assert!(matches!(
            parse_search_response(body),
            Err(ProviderError::MalformedResponse(_))
        ));
    }
}

/// Geocoding interface for Nominatim, using plain HTTP requests.
pub struct Nominatim {
    /// The full URL of the `/search` endpoint.
    search_url: Url,

    /// How long to wait for a single request.
    timeout: Duration,

    /// Our HTTP client.
    client: SharedHttpClient,
}

impl Nominatim {
    pub fn new(
        endpoint: Option<Url>,
        timeout: Duration,
        client: SharedHttpClient,
    ) -> Result<Nominatim, ConfigError> {
        describe_histogram!(
            "geocodeplaces.nominatim.geocode_request.duration_seconds",
            Unit::Seconds,
            "Time required for Nominatim to geocode a place"
        );

        let endpoint = endpoint.map(|e| e.to_string());
        let endpoint = endpoint.as_deref().unwrap_or(DEFAULT_ENDPOINT);
        let search_url = Url::parse(endpoint)
            .and_then(|base| base.join("search"))
            .map_err(|source| ConfigError::InvalidEndpoint {
                url: endpoint.to_owned(),
                source,
            })?;
        Ok(Nominatim {
            search_url,
            timeout,
            client,
        })
    }

    /// Build the request URL for `query`.
    fn url_for(&self, query: &str) -> Url {
        let mut url = self.search_url.clone();
        url.query_pairs_mut()
            .append_pair("q", query)
            .append_pair("format", "json")
            .append_pair("addressdetails", "1")
            .append_pair("limit", "1")
            .finish();
        url
    }

    #[instrument(name = "Nominatim::search", level = "debug", skip(self))]
    async fn search(&self, query: &str) -> Result<Location, ProviderError> {
        let start = Instant::now();
        let url = self.url_for(query);
        debug!("requesting {}", url);
        let body = get_body(
            &self.client,
            &url,
            &[("Accept-Language", ACCEPT_LANGUAGE)],
        )
        .await?;
        histogram!(
            "geocodeplaces.nominatim.geocode_request.duration_seconds",
            (Instant::now() - start).as_secs_f64(),
        );
        parse_search_response(&body)
    }
}

#[async_trait]
impl Geocoder for Nominatim {
    fn tag(&self) -> &str {
        "nominatim"
    }

    fn min_interval(&self) -> Duration {
        Duration::from_secs(1)
    }

    async fn geocode(&self, query: &ProviderQuery) -> Result<Location, ProviderError> {
        with_timeout(self.timeout, self.search(query.as_str())).await
    }
}

#[test]
fn search_urls_follow_the_nominatim_api() {
    use super::shared_http_client;

    let nominatim =
        Nominatim::new(None, Duration::from_secs(10), shared_http_client()).unwrap();
    assert_eq!(
        nominatim.url_for("Paris, France").as_str(),
        "https://nominatim.openstreetmap.org/search?q=Paris%2C+France&format=json&addressdetails=1&limit=1",
    );

    let mirror = Url::parse("http://localhost:8080/nominatim/").unwrap();
    let nominatim =
        Nominatim::new(Some(mirror), Duration::from_secs(10), shared_http_client())
            .unwrap();
    assert!(nominatim
        .url_for("Paris")
        .as_str()
        .starts_with("http://localhost:8080/nominatim/search?q=Paris&"));
}
