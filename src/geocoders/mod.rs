//! Geocoding backends.

use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use hyper::{client::HttpConnector, Body, Client, Request, StatusCode};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use strum_macros::{Display, EnumString};
use thiserror::Error;
use url::Url;

use crate::{errors::ConfigError, places::ProviderQuery};

pub mod google;
pub mod nominatim;
pub mod osm_library;

/// The `User-Agent` we send to every geocoding service. Nominatim's usage
/// policy requires one which identifies the application.
pub static USER_AGENT: &str = concat!("geocode-places/", env!("CARGO_PKG_VERSION"));

/// A `hyper` client shared between our HTTP-based geocoders.
pub type SharedHttpClient = Arc<Client<HttpsConnector<HttpConnector>>>;

pub fn shared_http_client() -> SharedHttpClient {
    // We only ever have one request in flight, so we don't need more than one
    // idle connection per host. We allow plain HTTP so that people can point us
    // at a local Nominatim mirror.
    Arc::new(
        Client::builder().pool_max_idle_per_host(1).build(
            HttpsConnectorBuilder::new()
                .with_webpki_roots()
                .https_or_http()
                .enable_http1()
                .enable_http2()
                .build(),
        ),
    )
}

/// Which geocoding service should we use?
#[derive(Clone, Copy, Debug, Display, EnumString, Eq, PartialEq)]
#[strum(serialize_all = "kebab-case")]
pub enum GeocoderKind {
    /// The Google Maps Geocoding API. Requires an API key.
    Google,
    /// OpenStreetMap Nominatim, via the `geocoding` crate.
    OsmLibrary,
    /// OpenStreetMap Nominatim, via direct HTTP requests.
    Nominatim,
}

#[test]
fn geocoder_kind_round_trips_through_strings() {
    use std::str::FromStr;
    for (s, kind) in [
        ("google", GeocoderKind::Google),
        ("osm-library", GeocoderKind::OsmLibrary),
        ("nominatim", GeocoderKind::Nominatim),
    ] {
        assert_eq!(GeocoderKind::from_str(s).unwrap(), kind);
        assert_eq!(kind.to_string(), s);
    }
    assert!(GeocoderKind::from_str("bing").is_err());
}

/// Everything we need to construct a geocoder.
#[derive(Clone, Debug)]
pub struct GeocoderConfig {
    /// Which geocoder to use.
    pub kind: GeocoderKind,
    /// An API key, for services which need one.
    pub api_key: Option<String>,
    /// Override the service's default base URL.
    pub endpoint: Option<String>,
    /// How long to wait for any single request.
    pub timeout: Duration,
}

impl GeocoderConfig {
    /// Build the configured geocoder. This is where we report configuration
    /// problems, before any rows have been processed.
    pub fn build(&self) -> Result<Box<dyn Geocoder>, ConfigError> {
        let endpoint = self
            .endpoint
            .as_deref()
            .map(parse_endpoint)
            .transpose()?;
        match self.kind {
            GeocoderKind::Google => {
                let api_key = self
                    .api_key
                    .clone()
                    .filter(|key| !key.trim().is_empty())
                    .ok_or(ConfigError::MissingApiKey {
                        geocoder: "google",
                        env_var: google::API_KEY_ENV_VAR,
                    })?;
                Ok(Box::new(google::Google::new(
                    api_key,
                    endpoint,
                    self.timeout,
                    shared_http_client(),
                )?))
            }
            GeocoderKind::OsmLibrary => Ok(Box::new(osm_library::OsmLibrary::new(
                endpoint,
                self.timeout,
            ))),
            GeocoderKind::Nominatim => Ok(Box::new(nominatim::Nominatim::new(
                endpoint,
                self.timeout,
                shared_http_client(),
            )?)),
        }
    }
}

/// Parse an endpoint URL, making sure it ends with a slash so that we can use
/// [`Url::join`] on it.
fn parse_endpoint(url: &str) -> Result<Url, ConfigError> {
    let mut with_slash = url.to_owned();
    if !with_slash.ends_with('/') {
        with_slash.push('/');
    }
    Url::parse(&with_slash).map_err(|source| ConfigError::InvalidEndpoint {
        url: url.to_owned(),
        source,
    })
}

#[test]
fn google_requires_an_api_key() {
    let config = GeocoderConfig {
        kind: GeocoderKind::Google,
        api_key: Some("  ".to_owned()),
        endpoint: None,
        timeout: Duration::from_secs(10),
    };
    assert!(matches!(
        config.build(),
        Err(ConfigError::MissingApiKey { .. })
    ));
}

#[test]
fn free_geocoders_wait_between_requests() {
    for kind in [GeocoderKind::Nominatim, GeocoderKind::OsmLibrary] {
        let config = GeocoderConfig {
            kind,
            api_key: None,
            endpoint: Some("http://localhost:8080".to_owned()),
            timeout: Duration::from_secs(10),
        };
        let geocoder = config.build().unwrap();
        assert_eq!(geocoder.min_interval(), Duration::from_secs(1));
    }
}

#[test]
fn endpoints_get_a_trailing_slash() {
    let url = parse_endpoint("http://localhost:8080/nominatim").unwrap();
    assert_eq!(url.as_str(), "http://localhost:8080/nominatim/");
    assert!(parse_endpoint("not a url").is_err());
}

/// A successfully geocoded place.
#[derive(Clone, Debug, PartialEq)]
pub struct Location {
    /// The formatted address returned by the service.
    pub address: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// Why a single geocoding request failed.
///
/// None of these are fatal to a batch. They are recorded in the output row for
/// the place that caused them.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The service didn't find anything.
    #[error("address not found")]
    NotFound,

    /// The service returned an application-level error status.
    #[error("geocoder returned status {status}{}", .message.as_deref().map(|m| format!(": {}", m)).unwrap_or_default())]
    Status {
        status: String,
        message: Option<String>,
    },

    /// The service returned an HTTP error.
    #[error("HTTP error {status}: {body}")]
    Http { status: StatusCode, body: String },

    /// The service took too long to answer.
    #[error("request timed out after {} seconds", .0.as_secs_f64())]
    Timeout(Duration),

    /// We couldn't talk to the service.
    #[error("could not contact geocoder: {0}")]
    Transport(#[from] hyper::Error),

    /// We couldn't build a request.
    #[error("could not build geocoder request: {0}")]
    Request(#[from] hyper::http::Error),

    /// We couldn't make sense of the response.
    #[error("malformed geocoder response: {0}")]
    MalformedResponse(String),

    /// An error reported by the `geocoding` library.
    #[error("geocoding library error: {0}")]
    Library(#[from] geocoding::GeocodingError),

    /// A background task failed.
    #[error("background geocoding task failed: {0}")]
    Background(String),
}

impl ProviderError {
    /// A short, low-arity description of this error, for use as a metrics
    /// label.
    pub fn metrics_label(&self) -> &'static str {
        match self {
            ProviderError::NotFound => "not_found",
            ProviderError::Status { .. } => "status",
            ProviderError::Http { .. } => "http",
            ProviderError::Timeout(_) => "timeout",
            ProviderError::Transport(_) => "transport",
            ProviderError::Request(_) => "request",
            ProviderError::MalformedResponse(_) => "malformed_response",
            ProviderError::Library(_) => "library",
            ProviderError::Background(_) => "background",
        }
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        ProviderError::MalformedResponse(err.to_string())
    }
}

#[test]
fn provider_errors_are_human_readable() {
    let err = ProviderError::Status {
        status: "REQUEST_DENIED".to_owned(),
        message: Some("The provided API key is invalid.".to_owned()),
    };
    assert_eq!(
        err.to_string(),
        "geocoder returned status REQUEST_DENIED: The provided API key is invalid.",
    );
    let err = ProviderError::Status {
        status: "OVER_QUERY_LIMIT".to_owned(),
        message: None,
    };
    assert_eq!(err.to_string(), "geocoder returned status OVER_QUERY_LIMIT");
    assert_eq!(
        ProviderError::Timeout(Duration::from_secs(10)).to_string(),
        "request timed out after 10 seconds",
    );
}

/// Abstract geocoding interface.
#[async_trait]
pub trait Geocoder: Send + Sync + 'static {
    /// A short name for this geocoder, used in logs and metrics.
    fn tag(&self) -> &str;

    /// The minimum time to wait between two requests to this geocoder, as
    /// required by the service's usage policy.
    fn min_interval(&self) -> Duration {
        Duration::ZERO
    }

    /// Look up a single place.
    async fn geocode(&self, query: &ProviderQuery) -> Result<Location, ProviderError>;
}

/// Run `fut`, giving up with [`ProviderError::Timeout`] after `timeout`.
pub async fn with_timeout<T, F>(timeout: Duration, fut: F) -> Result<T, ProviderError>
where
    F: Future<Output = Result<T, ProviderError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_elapsed) => Err(ProviderError::Timeout(timeout)),
    }
}

#[tokio::test]
async fn with_timeout_gives_up_on_slow_requests() {
    let timeout = Duration::from_millis(20);
    let result: Result<(), _> = with_timeout(timeout, async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(())
    })
    .await;
    assert!(matches!(result, Err(ProviderError::Timeout(t)) if t == timeout));
}

/// Fetch `url` with a GET request, returning the body if the request
/// succeeded.
pub(crate) async fn get_body(
    client: &SharedHttpClient,
    url: &Url,
    headers: &[(&str, &str)],
) -> Result<Vec<u8>, ProviderError> {
    let mut builder = Request::builder()
        .method("GET")
        .uri(url.as_str())
        .header("User-Agent", USER_AGENT);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let req = builder.body(Body::empty())?;

    let res = client.request(req).await?;
    let status = res.status();
    let body = hyper::body::to_bytes(res.into_body()).await?;
    if status.is_success() {
        Ok(body.to_vec())
    } else {
        Err(ProviderError::Http {
            status,
            body: String::from_utf8_lossy(&body).into_owned(),
        })
    }
}
