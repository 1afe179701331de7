use std::sync::Arc;

use data_model::{BucketInfo, BucketList, BucketSettings, Error, Result, ServerInfo};
use tracing::{debug, info};

use crate::{
    bucket::{validate_name, Bucket},
    config::ClientConfig,
    http::HttpClient,
    transport::{HttpRequest, ReqwestTransport, Transport},
};

/// Entry point to a ReductStore instance.
///
/// ```no_run
/// # async fn run() -> reduct_client::Result<()> {
/// use reduct_client::{Client, ClientConfig};
///
/// let client = Client::new(ClientConfig::new("http://127.0.0.1:8383"))?;
/// let bucket = client.create_bucket("data", Default::default(), true).await?;
/// bucket.write("sensor-1", 1_000u64, "hello").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    http: HttpClient,
    config: ClientConfig,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| Error::invalid_argument(format!("{e:#}")))?;
        let transport = ReqwestTransport::new(&config)?;
        info!(url = %config.url, "reduct client created");
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    /// Client over a caller-provided transport.
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        let http = HttpClient::new(transport, config.timeout());
        Self { http, config }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub async fn info(&self) -> Result<ServerInfo> {
        self.http.json(HttpRequest::get("/info")).await
    }

    pub async fn list(&self) -> Result<Vec<BucketInfo>> {
        let list: BucketList = self.http.json(HttpRequest::get("/list")).await?;
        Ok(list.buckets)
    }

    /// Handle to an existing bucket; `Error::Http` with status 404 if there
    /// is none.
    pub async fn get_bucket(&self, name: &str) -> Result<Bucket> {
        let bucket = self.bucket(name)?;
        self.http
            .execute(HttpRequest::head(format!("/b/{name}")))
            .await?;
        Ok(bucket)
    }

    /// Create a bucket. With `exist_ok` an existing bucket is returned as is,
    /// its settings untouched.
    pub async fn create_bucket(
        &self,
        name: &str,
        settings: BucketSettings,
        exist_ok: bool,
    ) -> Result<Bucket> {
        validate_name("bucket", name)?;
        let request = HttpRequest::post(format!("/b/{name}")).json(&settings)?;
        match self.http.execute(request).await {
            Ok(_) => {
                debug!(bucket = name, "bucket created");
                self.bucket(name)
            }
            Err(e) if exist_ok && e.status() == Some(409) => self.get_bucket(name).await,
            Err(e) => Err(e),
        }
    }

    /// Handle to a bucket without asking the server whether it exists.
    pub fn bucket(&self, name: &str) -> Result<Bucket> {
        Bucket::new(name, self.http.clone())
    }
}
