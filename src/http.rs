use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use batch_protocol::{header::get_header, API_HEADER, ERROR_HEADER};
use data_model::{Error, Result};
use futures::Future;
use reqwest::header::HeaderMap;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::transport::{HttpRequest, HttpResponse, Transport};

/// API version the client is written against.
pub const API_MAJOR: u32 = 1;
pub const API_MINOR: u32 = 13;

/// Applies deadlines, turns error statuses into [`Error::Http`] and checks
/// the API version of the server. Cheap to clone; clones share the transport.
#[derive(Clone)]
pub struct HttpClient {
    transport: Arc<dyn Transport>,
    timeout: Option<Duration>,
    version_warned: Arc<AtomicBool>,
}

impl HttpClient {
    pub fn new(transport: Arc<dyn Transport>, timeout: Option<Duration>) -> Self {
        Self {
            transport,
            timeout,
            version_warned: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Default deadline of a network call.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.send_with_timeout(request, self.timeout).await
    }

    pub async fn send_with_timeout(
        &self,
        request: HttpRequest,
        timeout: Option<Duration>,
    ) -> Result<HttpResponse> {
        let response = with_deadline(timeout, self.transport.request(request)).await?;
        self.check_api_version(&response.headers)?;
        if !response.status.is_success() {
            return Err(error_from_response(&response));
        }
        Ok(response)
    }

    pub async fn json<T: DeserializeOwned>(&self, request: HttpRequest) -> Result<T> {
        let response = self.send(request).await?;
        with_deadline(self.timeout, response.json()).await
    }

    /// Send and drain the response.
    pub async fn execute(&self, request: HttpRequest) -> Result<HeaderMap> {
        let response = self.send(request).await?;
        let headers = response.headers.clone();
        with_deadline(self.timeout, response.bytes()).await?;
        Ok(headers)
    }

    fn check_api_version(&self, headers: &HeaderMap) -> Result<()> {
        let Some(version) = get_header(headers, API_HEADER)? else {
            return Ok(());
        };
        let (major, minor) = parse_version(version)?;
        if major != API_MAJOR {
            return Err(Error::protocol(format!(
                "unsupported API version {version}, the client speaks {API_MAJOR}.{API_MINOR}"
            )));
        }
        if minor + 2 < API_MINOR && !self.version_warned.swap(true, Ordering::Relaxed) {
            warn!(
                server = version,
                client = %format!("{API_MAJOR}.{API_MINOR}"),
                "server API is older than the client, some features may not work"
            );
        }
        Ok(())
    }
}

fn parse_version(version: &str) -> Result<(u32, u32)> {
    let invalid = || Error::protocol(format!("invalid API version '{version}'"));
    let (major, minor) = version.trim().split_once('.').ok_or_else(invalid)?;
    Ok((
        major.parse().map_err(|_| invalid())?,
        minor.parse().map_err(|_| invalid())?,
    ))
}

pub fn error_from_response(response: &HttpResponse) -> Error {
    let message = get_header(&response.headers, ERROR_HEADER)
        .ok()
        .flatten()
        .map(str::to_string)
        .unwrap_or_else(|| {
            response
                .status
                .canonical_reason()
                .unwrap_or("unknown error")
                .to_string()
        });
    Error::http(response.status.as_u16(), message)
}

pub async fn with_deadline<T>(
    timeout: Option<Duration>,
    future: impl Future<Output = Result<T>>,
) -> Result<T> {
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, future)
            .await
            .map_err(|_| Error::Timeout(timeout))?,
        None => future.await,
    }
}
