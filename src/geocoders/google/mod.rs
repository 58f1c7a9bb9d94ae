use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use crate::{errors::ConfigError, places::ProviderQuery};

use self::client::{GoogleClient, DEFAULT_ENDPOINT};

use super::{with_timeout, Geocoder, Location, ProviderError, SharedHttpClient};

pub mod client;

/// The environment variable we check for an API key.
pub static API_KEY_ENV_VAR: &str = "GOOGLE_MAPS_API_KEY";

/// Geocoding interface for the Google Maps Geocoding API.
pub struct Google {
    /// How long to wait for a single request.
    timeout: Duration,

    /// Our Google API client.
    client: GoogleClient,
}

impl Google {
    pub fn new(
        api_key: String,
        endpoint: Option<Url>,
        timeout: Duration,
        http_client: SharedHttpClient,
    ) -> Result<Google, ConfigError> {
        let endpoint = match endpoint {
            Some(endpoint) => endpoint,
            None => Url::parse(DEFAULT_ENDPOINT).map_err(|source| {
                ConfigError::InvalidEndpoint {
                    url: DEFAULT_ENDPOINT.to_owned(),
                    source,
                }
            })?,
        };
        let client = GoogleClient::new(api_key, endpoint, http_client)?;
        Ok(Google { timeout, client })
    }
}

#[async_trait]
impl Geocoder for Google {
    fn tag(&self) -> &str {
        "google"
    }

    // No `min_interval`. Google reports `OVER_QUERY_LIMIT` instead.

    async fn geocode(&self, query: &ProviderQuery) -> Result<Location, ProviderError> {
        with_timeout(self.timeout, self.client.geocode(query.as_str())).await
    }
}
