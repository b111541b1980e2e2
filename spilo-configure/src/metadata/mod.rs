//! Cloud instance metadata access
//!
//! The link-local metadata service is reached through the [`MetadataClient`]
//! trait so provider detection and instance lookups can be exercised without
//! a network:
//! - `HttpMetadataClient`: reqwest based client with a fixed request timeout
//! - `instance`: per-provider mapping of {ip, id, zone}

mod instance;

pub use instance::{fetch_instance_metadata, InstanceMetadata};

use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Link-local address of the metadata service.
pub const METADATA_BASE_URL: &str = "http://169.254.169.254";

/// Timeout while probing for the provider.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Timeout for every fetch once a provider is committed.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors talking to the metadata service.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("{url} returned an unparsable document: {source}")]
    Parse {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{url} is missing field {field}")]
    MissingField { url: String, field: &'static str },
}

/// A metadata service response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataResponse {
    pub status: u16,
    /// Header names are lower case
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl MetadataResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }

    /// Parse the body as JSON.
    pub fn json(&self, url: &str) -> Result<serde_json::Value, MetadataError> {
        serde_json::from_str(&self.body).map_err(|source| MetadataError::Parse {
            url: url.to_string(),
            source,
        })
    }

    /// Body of a successful response, an error otherwise.
    pub fn into_text(self, url: &str) -> Result<String, MetadataError> {
        if self.is_success() {
            Ok(self.body)
        } else {
            Err(MetadataError::Status {
                url: url.to_string(),
                status: self.status,
            })
        }
    }
}

/// Read access to the metadata service.
///
/// `path` is relative to the service root and starts with `/`.
#[allow(async_fn_in_trait)]
pub trait MetadataClient {
    async fn get(
        &self,
        path: &str,
        headers: &[(&str, &str)],
    ) -> Result<MetadataResponse, MetadataError>;
}

/// Metadata client backed by reqwest.
#[derive(Debug, Clone)]
pub struct HttpMetadataClient {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpMetadataClient {
    pub fn new(timeout: Duration) -> Self {
        Self::with_base_url(METADATA_BASE_URL, timeout)
    }

    pub fn with_base_url(base_url: &str, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        }
    }

    /// Same connection pool with a different request timeout.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            timeout,
            ..self.clone()
        }
    }
}

impl MetadataClient for HttpMetadataClient {
    async fn get(
        &self,
        path: &str,
        headers: &[(&str, &str)],
    ) -> Result<MetadataResponse, MetadataError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, "Querying metadata service");

        let transport = |source: reqwest::Error| MetadataError::Transport {
            url: url.clone(),
            source: Box::new(source),
        };

        let mut request = self.client.get(&url).timeout(self.timeout);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }

        let response = request.send().await.map_err(transport)?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| Some((k.as_str().to_lowercase(), v.to_str().ok()?.to_string())))
            .collect();
        let body = response.text().await.map_err(transport)?;

        Ok(MetadataResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory metadata service for tests.

    use super::*;
    use std::cell::RefCell;
    use std::io;

    #[derive(Debug, Default)]
    pub struct FakeMetadataClient {
        responses: BTreeMap<String, MetadataResponse>,
        unreachable: bool,
        pub requests: RefCell<Vec<(String, Vec<(String, String)>)>>,
    }

    impl FakeMetadataClient {
        /// A client whose every request fails to connect.
        pub fn unreachable() -> Self {
            Self {
                unreachable: true,
                ..Self::default()
            }
        }

        pub fn with(mut self, path: &str, status: u16, body: &str) -> Self {
            self.responses.insert(
                path.to_string(),
                MetadataResponse {
                    status,
                    headers: BTreeMap::new(),
                    body: body.to_string(),
                },
            );
            self
        }

        pub fn with_header(mut self, path: &str, name: &str, value: &str) -> Self {
            self.responses
                .entry(path.to_string())
                .or_insert_with(|| MetadataResponse {
                    status: 200,
                    ..MetadataResponse::default()
                })
                .headers
                .insert(name.to_lowercase(), value.to_string());
            self
        }

        pub fn requested(&self, path: &str) -> bool {
            self.requests.borrow().iter().any(|(p, _)| p == path)
        }
    }

    impl MetadataClient for FakeMetadataClient {
        async fn get(
            &self,
            path: &str,
            headers: &[(&str, &str)],
        ) -> Result<MetadataResponse, MetadataError> {
            self.requests.borrow_mut().push((
                path.to_string(),
                headers
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ));
            if self.unreachable {
                return Err(MetadataError::Transport {
                    url: path.to_string(),
                    source: Box::new(io::Error::new(io::ErrorKind::ConnectionRefused, "refused")),
                });
            }
            Ok(self.responses.get(path).cloned().unwrap_or(MetadataResponse {
                status: 404,
                ..MetadataResponse::default()
            }))
        }
    }
}
