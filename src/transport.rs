use std::fmt;

use async_trait::async_trait;
use batch_protocol::ByteStream;
use bytes::{Bytes, BytesMut};
use data_model::{Error, Result};
use futures::{StreamExt, TryStreamExt};
use reqwest::{
    header::{HeaderMap, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE},
    Method, StatusCode,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;
use url::Url;

use crate::config::ClientConfig;

pub const API_PREFIX: [&str; 2] = ["api", "v1"];

pub enum Body {
    Empty,
    Bytes(Bytes),
    /// Streamed as is; `length` becomes the content length.
    Stream { stream: ByteStream, length: u64 },
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "Empty"),
            Self::Bytes(bytes) => write!(f, "Bytes({})", bytes.len()),
            Self::Stream { length, .. } => write!(f, "Stream({length})"),
        }
    }
}

/// A request relative to the API root, e.g. `GET /b/{bucket}`.
#[derive(Debug)]
pub struct HttpRequest {
    pub method: Method,
    /// Unescaped path; every `/` separated segment is escaped on the way out.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: Body,
}

impl HttpRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: HeaderMap::new(),
            body: Body::Empty,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn head(path: impl Into<String>) -> Self {
        Self::new(Method::HEAD, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn json<T: Serialize>(mut self, body: &T) -> Result<Self> {
        let body = serde_json::to_vec(body)?;
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.body = Body::Bytes(body.into());
        Ok(self)
    }

    pub fn stream(mut self, stream: ByteStream, length: u64) -> Self {
        self.body = Body::Stream { stream, length };
        self
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.path.split('/').filter(|segment| !segment.is_empty())
    }
}

pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ByteStream,
}

impl fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl HttpResponse {
    pub async fn bytes(self) -> Result<Bytes> {
        let mut data = BytesMut::new();
        let mut body = self.body;
        while let Some(chunk) = body.try_next().await? {
            data.extend_from_slice(&chunk);
        }
        Ok(data.freeze())
    }

    pub async fn json<T: DeserializeOwned>(self) -> Result<T> {
        let data = self.bytes().await?;
        Ok(serde_json::from_slice(&data)?)
    }
}

/// Moves one request to the server and hands back the response as soon as
/// its headers arrived. The body is streamed.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request(&self, request: HttpRequest) -> Result<HttpResponse>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
    base_url: Url,
    api_token: Option<String>,
}

impl ReqwestTransport {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let base_url = Url::parse(&config.url)
            .map_err(|e| Error::invalid_argument(format!("invalid url '{}': {e}", config.url)))?;
        if base_url.cannot_be_a_base() {
            return Err(Error::invalid_argument(format!(
                "url '{}' cannot be a base url",
                config.url
            )));
        }
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(!config.verify_ssl)
            .build()
            .map_err(|e| Error::Connection(e.to_string()))?;
        Ok(Self {
            client,
            base_url,
            api_token: config.api_token.clone(),
        })
    }

    fn url(&self, request: &HttpRequest) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| Error::invalid_argument("url cannot be a base url"))?
            .pop_if_empty()
            .extend(API_PREFIX)
            .extend(request.segments());
        Ok(url)
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn request(&self, request: HttpRequest) -> Result<HttpResponse> {
        let url = self.url(&request)?;
        debug!(method = %request.method, %url, body = ?request.body, "sending request");

        let mut headers = request.headers;
        if let Body::Stream { length, .. } = &request.body {
            headers.insert(CONTENT_LENGTH, HeaderValue::from(*length));
        }
        let mut builder = self.client.request(request.method, url).headers(headers);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(token) = &self.api_token {
            builder = builder.bearer_auth(token);
        }
        builder = match request.body {
            Body::Empty => builder,
            Body::Bytes(bytes) => builder.body(bytes),
            Body::Stream { stream, .. } => builder.body(reqwest::Body::wrap_stream(stream)),
        };

        let response = builder
            .send()
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes_stream()
            .map_err(|e| Error::Connection(format!("failed to read response body: {e}")))
            .boxed();
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}
