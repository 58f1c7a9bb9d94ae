//! Interface to the Google Maps Geocoding REST API.

use std::time::Instant;

use metrics::{describe_histogram, histogram, Unit};
use serde::Deserialize;
use tracing::{debug, instrument};
use url::Url;

use crate::errors::ConfigError;
use crate::geocoders::{get_body, Location, ProviderError, SharedHttpClient};

/// The default Google Maps API base URL.
pub static DEFAULT_ENDPOINT: &str = "https://maps.googleapis.com/maps/api/geocode/";

/// A Google geocoding response.
#[derive(Clone, Debug, Deserialize)]
pub struct GeocodeResponse {
    /// `OK`, `ZERO_RESULTS`, `OVER_QUERY_LIMIT`, `REQUEST_DENIED`, etc.
    pub status: String,

    /// Extra detail about non-`OK` statuses.
    #[serde(default)]
    pub error_message: Option<String>,

    /// Our candidate matches, best first.
    #[serde(default)]
    pub results: Vec<GeocodeResult>,
}

/// A single candidate match.
#[derive(Clone, Debug, Deserialize)]
pub struct GeocodeResult {
    pub formatted_address: String,
    pub geometry: Geometry,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Geometry {
    pub location: LatLng,
}

#[derive(Clone, Copy, Debug, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl GeocodeResponse {
    /// Convert this response into our best match, or an error.
    pub fn into_location(self) -> Result<Location, ProviderError> {
        if self.status != "OK" {
            return Err(ProviderError::Status {
                status: self.status,
                message: self.error_message,
            });
        }
        let best = self
            .results
            .into_iter()
            .next()
            .ok_or(ProviderError::NotFound)?;
        Ok(Location {
            address: best.formatted_address,
            latitude: best.geometry.location.lat,
            longitude: best.geometry.location.lng,
        })
    }
}

#[test]
fn ok_response_uses_first_result() {
    let json = r#"{
        "status": "OK",
        "results": [
            {
                "formatted_address": "Paris, France",
                "geometry": { "location": { "lat": 48.856614, "lng": 2.3522219 } }
            },
            {
                "formatted_address": "Paris, TX, USA",
                "geometry": { "location": { "lat": 33.6609389, "lng": -95.55551299999999 } }
            }
        ]
    }"#;
    let response: GeocodeResponse = serde_json::from_str(json).unwrap();
    assert_eq!(
        response.into_location().unwrap(),
        Location {
            address: "Paris, France".to_owned(),
            latitude: 48.856614,
            longitude: 2.3522219,
        },
    );
}

#[test]
fn non_ok_status_is_reported() {
    let json = r#"{
        "status": "REQUEST_DENIED",
        "error_message": "The provided API key is invalid.",
        "results": []
    }"#;
    let response: GeocodeResponse = serde_json::from_str(json).unwrap();
    match response.into_location() {
        Err(ProviderError::Status { status, message }) => {
            assert_eq!(status, "REQUEST_DENIED");
            assert_eq!(message.as_deref(), Some("The provided API key is invalid."));
        }
        other => panic!("unexpected result {:?}", other),
    }

    let response: GeocodeResponse =
        serde_json::from_str(r#"{ "status": "ZERO_RESULTS", "results": [] }"#).unwrap();
    assert!(matches!(
        response.into_location(),
        Err(ProviderError::Status { status, .. }) if status == "ZERO_RESULTS"
    ));
}

#[test]
fn ok_without_results_is_not_found() {
    let response: GeocodeResponse =
        serde_json::from_str(r#"{ "status": "OK", "results": [] }"#).unwrap();
    assert!(matches!(
        response.into_location(),
        Err(ProviderError::NotFound)
    ));
}

/// A client for the Google geocoding endpoint.
pub struct GoogleClient {
    api_key: String,
    /// The full URL of the JSON geocoding endpoint, without query parameters.
    json_url: Url,
    client: SharedHttpClient,
}

impl GoogleClient {
    /// Create a new Google client.
    pub fn new(
        api_key: String,
        endpoint: Url,
        client: SharedHttpClient,
    ) -> Result<GoogleClient, ConfigError> {
        describe_histogram!(
            "geocodeplaces.google.geocode_request.duration_seconds",
            Unit::Seconds,
            "Time required for Google to geocode a place"
        );

        let json_url =
            endpoint
                .join("json")
                .map_err(|source| ConfigError::InvalidEndpoint {
                    url: endpoint.to_string(),
                    source,
                })?;
        Ok(GoogleClient {
            api_key,
            json_url,
            client,
        })
    }

    /// Build the request URL for `address`.
    fn url_for(&self, address: &str) -> Url {
        let mut url = self.json_url.clone();
        url.query_pairs_mut()
            .append_pair("address", address)
            .append_pair("key", &self.api_key)
            .finish();
        url
    }

    /// Geocode a single address.
    #[instrument(name = "GoogleClient::geocode", level = "debug", skip(self))]
    pub async fn geocode(&self, address: &str) -> Result<Location, ProviderError> {
        let start = Instant::now();
        let url = self.url_for(address);
        // Don't log the URL, because it contains our API key.
        debug!("requesting Google geocode");
        let body = get_body(&self.client, &url, &[]).await?;
        histogram!(
            "geocodeplaces.google.geocode_request.duration_seconds",
            (Instant::now() - start).as_secs_f64(),
        );

        let response: GeocodeResponse = serde_json::from_slice(&body)?;
        debug!("Google status: {}", response.status);
        response.into_location()
    }
}

#[test]
fn request_urls_include_address_and_key() {
    use crate::geocoders::shared_http_client;

    let client = GoogleClient::new(
        "secret".to_owned(),
        Url::parse(DEFAULT_ENDPOINT).unwrap(),
        shared_http_client(),
    )
    .unwrap();
    assert_eq!(
        client.url_for("Paris, France").as_str(),
        "https://maps.googleapis.com/maps/api/geocode/json?address=Paris%2C+France&key=secret",
    );
}
