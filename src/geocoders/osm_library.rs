//! OpenStreetMap geocoding using the [`geocoding`] crate's Nominatim client.
//!
//! The `geocoding` client is blocking, so we run it on tokio's blocking thread
//! pool. A blocking request can't be cancelled, so after a timeout we still
//! wait for it to finish before returning.

use std::time::Duration;

use async_trait::async_trait;
use geocoding::openstreetmap::{OpenstreetmapParams, OpenstreetmapResponse};
use geocoding::Openstreetmap;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::places::ProviderQuery;

use super::{nominatim, Geocoder, Location, ProviderError};

/// Geocoding interface for Nominatim, via the `geocoding` library.
pub struct OsmLibrary {
    /// The Nominatim base URL, with a trailing slash.
    endpoint: String,

    /// How long to wait for a single request.
    timeout: Duration,
}

impl OsmLibrary {
    pub fn new(endpoint: Option<Url>, timeout: Duration) -> OsmLibrary {
        let endpoint = endpoint
            .map(|e| e.to_string())
            .unwrap_or_else(|| nominatim::DEFAULT_ENDPOINT.to_owned());
        OsmLibrary { endpoint, timeout }
    }
}

/// Run a blocking `geocoding` lookup for `query` against `endpoint`.
///
/// The client is created and dropped on the blocking thread, because its
/// internal `reqwest` runtime must not be touched from async code.
fn forward_full_blocking(
    endpoint: String,
    query: String,
) -> Result<OpenstreetmapResponse<f64>, ProviderError> {
    let osm = Openstreetmap::new_with_endpoint(endpoint);
    let params = OpenstreetmapParams::new(&query)
        .with_addressdetails(true)
        .build();
    Ok(osm.forward_full(&params)?)
}

/// Convert a `geocoding` response into our best match.
fn location_from_response(
    response: OpenstreetmapResponse<f64>,
) -> Result<Location, ProviderError> {
    let best = response
        .features
        .into_iter()
        .next()
        .ok_or(ProviderError::NotFound)?;
    // GeoJSON coordinates are (longitude, latitude).
    let (longitude, latitude) = best.geometry.coordinates;
    Ok(Location {
        address: best.properties.display_name,
        latitude,
        longitude,
    })
}

#[async_trait]
impl Geocoder for OsmLibrary {
    fn tag(&self) -> &str {
        "osm-library"
    }

    fn min_interval(&self) -> Duration {
        Duration::from_secs(1)
    }

    #[instrument(name = "OsmLibrary::geocode", level = "debug", skip(self))]
    async fn geocode(&self, query: &ProviderQuery) -> Result<Location, ProviderError> {
        let endpoint = self.endpoint.clone();
        let query = query.as_str().to_owned();
        debug!("geocoding {:?} via {}", query, endpoint);
        let mut task =
            tokio::task::spawn_blocking(move || forward_full_blocking(endpoint, query));
        let response = match tokio::time::timeout(self.timeout, &mut task).await {
            Ok(joined) => {
                joined.map_err(|err| ProviderError::Background(err.to_string()))??
            }
            Err(_elapsed) => {
                // Never start the next request while this one is still running.
                warn!("request timed out, waiting for it to finish");
                let _ = task.await;
                return Err(ProviderError::Timeout(self.timeout));
            }
        };
        location_from_response(response)
    }
}

#[cfg(test)]
static PARIS_GEOJSON: &str = r#"{
    "type": "FeatureCollection",
    "licence": "Data © OpenStreetMap contributors, ODbL 1.0. https://osm.org/copyright",
    "features": [
        {
            "type": "Feature",
            "properties": {
                "place_id": 88066702,
                "osm_type": "relation",
                "osm_id": 7444,
                "place_rank": 15,
                "category": "boundary",
                "type": "administrative",
                "importance": 0.8845663630228834,
                "addresstype": "suburb",
                "name": "Paris",
                "display_name": "Paris, Île-de-France, France métropolitaine, France",
                "address": {
                    "suburb": "Paris",
                    "city_district": "Paris",
                    "city": "Paris",
                    "ISO3166-2-lvl6": "FR-75",
                    "state": "Île-de-France",
                    "ISO3166-2-lvl4": "FR-IDF",
                    "region": "France métropolitaine",
                    "country": "France",
                    "country_code": "fr"
                }
            },
            "bbox": [2.224122, 48.8155755, 2.4697602, 48.902156],
            "geometry": {
                "type": "Point",
                "coordinates": [2.3200410217200766, 48.8588897]
            }
        }
    ]
}"#;

#[test]
fn geojson_coordinates_are_swapped_into_place() {
    let response: OpenstreetmapResponse<f64> =
        serde_json::from_str(PARIS_GEOJSON).unwrap();
    assert_eq!(
        location_from_response(response).unwrap(),
        Location {
            address: "Paris, Île-de-France, France métropolitaine, France".to_owned(),
            latitude: 48.8588897,
            longitude: 2.3200410217200766,
        },
    );
}

#[test]
fn empty_feature_collection_is_not_found() {
    let response: OpenstreetmapResponse<f64> = serde_json::from_str(
        r#"{ "type": "FeatureCollection", "licence": "ODbL", "features": [] }"#,
    )
    .unwrap();
    assert!(matches!(
        location_from_response(response),
        Err(ProviderError::NotFound)
    ));
}
