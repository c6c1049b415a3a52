//! Registry bootstrap for the datastore.
//!
//! Before any readings can be submitted the datastore must know about each
//! data source. The client here speaks the registry API: look a source up by
//! its resource suffix, create it when absent and keep retrying until the
//! registry accepts it or reports a conflict.
//!
//! ## Metrics
//!
//! `registry_lookups`: Lookup requests issued
//! `registry_creates`: Creation requests issued
//! `registry_retries`: Attempts abandoned to a transient failure

use std::time::Duration;

use http::Uri;
use metrics::counter;
use reqwest::{StatusCode, header::LOCATION};
use serde::Deserialize;
use tracing::{info, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors produced by [`Client`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// HTTP transport failed
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),
    /// Lookup returned a status other than 200
    #[error("Registry lookup returned {status}: {body}")]
    LookupStatus {
        /// Response status code
        status: StatusCode,
        /// Response body, best effort
        body: String,
    },
    /// The registry holds an entry that conflicts with ours
    #[error("Registry conflict for resource {resource}: {body}")]
    Conflict {
        /// The resource we tried to register
        resource: String,
        /// Response body, best effort
        body: String,
    },
    /// Creation succeeded but the response did not name the new entry
    #[error("Registry response missing a usable Location header")]
    MissingLocation,
}

/// Registry value type of a data source
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    /// Float readings, submitted as SenML `v`
    #[default]
    Float,
    /// String readings, submitted as SenML `vs`
    String,
    /// Boolean readings, submitted as SenML `vb`
    Bool,
}

/// An aggregation the datastore maintains over a data source
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Aggregation {
    /// Aggregation interval, for instance `1m`
    pub interval: String,
    /// Aggregates to maintain, for instance `min` and `max`
    pub aggregates: Vec<String>,
    /// Retention period of the aggregated series
    pub retention: String,
}

/// A registry data source entry.
///
/// Responses carry more fields than modeled here; unknown fields are ignored
/// on decode and unset fields omitted on encode.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DataSource {
    /// Server-assigned ID, empty until registered
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// Resource URL identifying the stream of readings
    pub resource: String,
    /// Raw data retention period
    pub retention: String,
    /// Value type of the readings
    #[serde(rename = "type")]
    pub kind: SourceType,
    /// Aggregations the datastore should maintain
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aggregation: Vec<Aggregation>,
}

/// One page of registry lookup results
#[derive(Debug, Deserialize)]
pub struct RegistryPage {
    /// Entries on this page
    #[serde(default)]
    pub entries: Vec<DataSource>,
    /// Total matching entries across all pages
    #[serde(default)]
    pub total: u64,
}

/// Outcome of a creation attempt
#[derive(Debug)]
enum Created {
    /// Entry created, ID parsed from the Location header
    Accepted(String),
    /// Registry holds a conflicting entry
    Conflict {
        body: String,
    },
    /// Registry refused for a reason worth retrying
    Denied {
        status: StatusCode,
        body: String,
    },
}

/// Thin client for the datastore registry API
#[derive(Debug, Clone)]
pub struct Client {
    base: Uri,
    http: reqwest::Client,
    retry_interval: Duration,
}

impl Client {
    /// Create a new [`Client`] against the datastore at `base`.
    #[must_use]
    pub fn new(base: Uri, retry_interval: Duration) -> Self {
        Self {
            base,
            http: reqwest::Client::new(),
            retry_interval,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        let base = self.base.to_string();
        format!("{base}/{path}", base = base.trim_end_matches('/'))
    }

    async fn lookup(&self, name: &str) -> Result<Option<DataSource>, Error> {
        let url = self.endpoint(&format!("registry/one/resource/suffix/{name}"));
        let response = self
            .http
            .get(&url)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::LookupStatus { status, body });
        }
        let page: RegistryPage = response.json().await?;
        if page.total == 0 {
            return Ok(None);
        }
        Ok(page.entries.into_iter().next())
    }

    async fn create(&self, template: &DataSource) -> Result<Created, Error> {
        let url = self.endpoint("registry");
        let response = self
            .http
            .post(&url)
            .json(template)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        match response.status() {
            StatusCode::CREATED => {
                let id = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|location| location.to_str().ok())
                    .and_then(id_from_location)
                    .ok_or(Error::MissingLocation)?;
                Ok(Created::Accepted(id))
            }
            StatusCode::CONFLICT => {
                let body = response.text().await.unwrap_or_default();
                Ok(Created::Conflict { body })
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Ok(Created::Denied { status, body })
            }
        }
    }

    /// Register-if-absent for one data source.
    ///
    /// Looks `name` up by resource suffix and creates `template` when the
    /// registry has no matching entry. Transient failures of either call are
    /// retried on the client's retry interval.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry reports a conflict or a created entry
    /// cannot be identified from the response.
    pub async fn ensure(&self, name: &str, template: &DataSource) -> Result<DataSource, Error> {
        loop {
            info!("Looking for an existing data source with name {name}");
            counter!("registry_lookups").increment(1);
            match self.lookup(name).await {
                Ok(Some(existing)) => {
                    info!("Found data source {id}", id = existing.id);
                    return Ok(existing);
                }
                Ok(None) => {}
                Err(err) => {
                    warn!("Registry lookup for {name} failed: {err}. Retrying...");
                    counter!("registry_retries").increment(1);
                    tokio::time::sleep(self.retry_interval).await;
                    continue;
                }
            }

            info!(
                "Creating data source for resource {resource}",
                resource = template.resource
            );
            counter!("registry_creates").increment(1);
            match self.create(template).await {
                Ok(Created::Accepted(id)) => {
                    info!("Created data source {id}");
                    let mut registered = template.clone();
                    registered.id = id;
                    return Ok(registered);
                }
                Ok(Created::Conflict { body }) => {
                    return Err(Error::Conflict {
                        resource: template.resource.clone(),
                        body,
                    });
                }
                Ok(Created::Denied { status, body }) => {
                    warn!("Registry refused creation with {status}: {body}. Retrying...");
                }
                Err(err @ Error::MissingLocation) => return Err(err),
                Err(err) => {
                    warn!(
                        "Registry creation for {resource} failed: {err}. Retrying...",
                        resource = template.resource
                    );
                }
            }
            counter!("registry_retries").increment(1);
            tokio::time::sleep(self.retry_interval).await;
        }
    }
}

/// Extract the data source ID from a Location header, the last path segment
/// of `/registry/{id}`.
fn id_from_location(location: &str) -> Option<String> {
    let id = location.trim_end_matches('/').rsplit('/').next()?;
    if id.is_empty() || id == "registry" {
        return None;
    }
    Some(id.to_string())
}
