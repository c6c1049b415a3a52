//! The SenML publish loop.
//!
//! ## Metrics
//!
//! `requests_sent`: Total number of submissions attempted
//! `request_ok`: Submissions the datastore responded to, labeled by status
//! `request_failure`: Submissions that failed in transport
//! `bytes_written`: Total bytes submitted
//!

use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{
    Method, Request, StatusCode, Uri,
    header::{CONTENT_LENGTH, CONTENT_TYPE},
};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use metrics::counter;
use rand::{SeedableRng, rngs::StdRng};
use tracing::{info, warn};

use dripfeed_payload::{SenMl, Serialize};

use crate::signals::Shutdown;

/// Content type of SenML JSON packs
pub const SENML_CONTENT_TYPE: &str = "application/senml+json";

/// Byte budget for a single pack. A pack holds one record, so running into
/// this indicates a runaway resource name or string value.
const MAXIMUM_PACK_BYTES: usize = 4_096;

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Publisher`].
pub enum Error {
    /// Payload serialization failed
    #[error("Payload error: {0}")]
    Payload(#[from] dripfeed_payload::Error),
    /// Request could not be constructed
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::http::Error),
    /// Data URI could not be derived from the base URI
    #[error("Invalid data URI: {0}")]
    Uri(#[from] hyper::http::uri::InvalidUri),
}

/// A registered data source paired with its payload serializer.
#[derive(Debug)]
pub struct Source {
    uri: Uri,
    resource: String,
    serializer: SenMl,
    metric_labels: Vec<(String, String)>,
}

impl Source {
    /// Pair a registered data source ID with the serializer feeding it.
    ///
    /// # Errors
    ///
    /// Function will return an error if the data endpoint for `id` does not
    /// form a valid URI.
    pub fn new(base: &Uri, id: &str, resource: String, serializer: SenMl) -> Result<Self, Error> {
        let joined = format!(
            "{base}/data/{id}",
            base = base.to_string().trim_end_matches('/')
        );
        let uri: Uri = joined.parse()?;
        let metric_labels = vec![
            (String::from("resource"), resource.clone()),
            (String::from("target"), uri.to_string()),
        ];
        Ok(Self {
            uri,
            resource,
            serializer,
            metric_labels,
        })
    }
}

/// The publisher. Submits one synthesized reading per data source each tick.
#[derive(Debug)]
pub struct Publisher {
    interval: Duration,
    sources: Vec<Source>,
    rng: StdRng,
    shutdown: Shutdown,
}

impl Publisher {
    /// Create a new [`Publisher`] instance
    #[must_use]
    pub fn new(
        interval: Duration,
        seed: Option<[u8; 32]>,
        sources: Vec<Source>,
        shutdown: Shutdown,
    ) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::from_seed(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            interval,
            sources,
            rng,
            shutdown,
        }
    }

    /// Run [`Publisher`] to completion or until a shutdown signal is received.
    ///
    /// Every interval tick one reading per source is synthesized and
    /// submitted. Submissions that fail are logged and counted, never fatal;
    /// only shutdown ends the loop.
    ///
    /// # Errors
    ///
    /// Function will return an error if a payload cannot be serialized or a
    /// request cannot be constructed.
    pub async fn spin(self) -> Result<(), Error> {
        let Self {
            interval: period,
            mut sources,
            mut rng,
            mut shutdown,
        } = self;

        let client: Client<HttpConnector, Full<Bytes>> = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(sources.len().max(1))
            .build_http();

        let mut interval = tokio::time::interval(period);
        // A slow datastore must not earn itself a burst of catch-up posts.
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    for source in &mut sources {
                        let mut body = Vec::with_capacity(256);
                        source
                            .serializer
                            .to_bytes(&mut rng, MAXIMUM_PACK_BYTES, &mut body)?;
                        let body_length = body.len();

                        let request: Request<Full<Bytes>> = Request::builder()
                            .method(Method::POST)
                            .uri(source.uri.clone())
                            .header(CONTENT_TYPE, SENML_CONTENT_TYPE)
                            .header(CONTENT_LENGTH, body_length)
                            .body(Full::new(Bytes::from(body)))?;

                        counter!("requests_sent", &source.metric_labels).increment(1);
                        match client.request(request).await {
                            Ok(response) => {
                                counter!("bytes_written", &source.metric_labels)
                                    .increment(body_length as u64);

                                let status = response.status();
                                let mut status_labels = source.metric_labels.clone();
                                status_labels.push((
                                    String::from("status_code"),
                                    status.as_u16().to_string(),
                                ));
                                counter!("request_ok", &status_labels).increment(1);

                                if status != StatusCode::ACCEPTED {
                                    let body = response
                                        .into_body()
                                        .collect()
                                        .await
                                        .map(http_body_util::Collected::to_bytes)
                                        .unwrap_or_default();
                                    warn!(
                                        "Datastore answered submission for {resource} with {status}: {body}",
                                        resource = source.resource,
                                        body = String::from_utf8_lossy(&body),
                                    );
                                }
                            }
                            Err(err) => {
                                warn!(
                                    "Failed to submit reading for {resource}: {err}",
                                    resource = source.resource,
                                );
                                let mut error_labels = source.metric_labels.clone();
                                error_labels.push((String::from("error"), err.to_string()));
                                counter!("request_failure", &error_labels).increment(1);
                            }
                        }
                    }
                },
                () = shutdown.recv() => {
                    info!("shutdown signal received");
                    return Ok(());
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use dripfeed_payload::senml::{Record, ValueKind};
    use tokio::sync::mpsc;
    use warp::Filter;

    use super::*;

    #[tokio::test]
    async fn submits_senml_packs_until_shutdown() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let data = warp::post()
            .and(warp::path!("data" / String))
            .and(warp::header::<String>("content-type"))
            .and(warp::body::bytes())
            .map(move |id: String, content_type: String, body: bytes::Bytes| {
                let _ = tx.send((id, content_type, body));
                warp::reply::with_status(warp::reply(), warp::http::StatusCode::ACCEPTED)
            });
        let (addr, serve_fut) = warp::serve(data).bind_ephemeral(([127, 0, 0, 1], 0));
        let _server_handle = tokio::spawn(serve_fut);

        let base: Uri = format!("http://{addr}")
            .parse()
            .expect("addr forms a valid URI");
        let serializer = SenMl::new(
            String::from("http://dummy/ds1"),
            Some(String::from("Cel")),
            ValueKind::Float {
                min: 10.0,
                max: 20.0,
            },
        )
        .expect("bounds are valid");
        let source = Source::new(&base, "abc123", String::from("http://dummy/ds1"), serializer)
            .expect("data URI is valid");

        let shutdown = Shutdown::new();
        let publisher = Publisher::new(
            Duration::from_millis(10),
            Some([0; 32]),
            vec![source],
            shutdown.clone(),
        );
        let publisher_handle = tokio::spawn(publisher.spin());

        let (id, content_type, body) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("submission arrives before timeout")
            .expect("channel stays open");
        assert_eq!(id, "abc123");
        assert_eq!(content_type, SENML_CONTENT_TYPE);

        let pack: Vec<Record> = serde_json::from_slice(&body).expect("body is a SenML pack");
        assert_eq!(pack.len(), 1);
        assert_eq!(pack[0].name.as_deref(), Some("http://dummy/ds1"));
        assert_eq!(pack[0].unit.as_deref(), Some("Cel"));
        let value = pack[0].value.expect("float record carries v");
        assert!((10.0..20.0).contains(&value));

        shutdown.signal();
        let result = tokio::time::timeout(Duration::from_secs(5), publisher_handle)
            .await
            .expect("publisher honors shutdown")
            .expect("publisher task joins");
        assert!(result.is_ok());
    }

    #[test]
    fn data_uri_joins_without_doubled_slashes() {
        let base = Uri::from_static("http://hds:8085/");
        let serializer = SenMl::new(
            String::from("http://dummy/ds1"),
            None,
            ValueKind::default(),
        )
        .expect("default bounds are valid");
        let source = Source::new(&base, "abc123", String::from("http://dummy/ds1"), serializer)
            .expect("data URI is valid");
        assert_eq!(source.uri, Uri::from_static("http://hds:8085/data/abc123"));
    }
}
