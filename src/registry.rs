//! Clients for the content-addressable registry backend.
//!
//! Two interfaces, because the backend has two deletion surfaces:
//!
//! - [`RegistryControl`] talks to the registry's control sidecar: health
//!   probe, blob content deletion, and removal of the per-repository
//!   manifest revision link on disk.
//! - [`DistributionApi`] talks to the registry's own v2 HTTP API, which is
//!   the only way to drop a manifest's tags (the metadata database does not
//!   know which tags exist on the backend side).
//!
//! Both treat "already gone" as success: deletion is idempotent, and a
//! retried run must not trip over work the previous run half-finished.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;

use crate::digest::Digest;
use crate::model::{DOCKER_MANIFEST, DOCKER_MANIFEST_LIST, OCI_INDEX, OCI_MANIFEST};

/// Time allowed to establish a connection to the backend.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Time allowed for a whole request, including reading the response.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(70);

/// Error type for backend registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The referenced object does not exist on the backend. Deletion paths
    /// treat this as success.
    #[error("{0} not found")]
    NotFound(String),

    /// Transport-level failure.
    #[error("registry request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The backend answered with a status the client did not expect.
    #[error("unexpected status {status} from {url}")]
    Status { status: u16, url: String },

    /// The backend (or an optional capability of it) is not reachable.
    #[error("registry unavailable: {0}")]
    Unavailable(String),
}

impl RegistryError {
    /// Whether this error means the object was already absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, RegistryError::NotFound(_))
    }
}

/// Outcome of a backend-side garbage-collection invocation.
///
/// Only used by the legacy [`RegistryControl::start_gc`] path, where the
/// control sidecar shells out to the registry's own collector.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct BackendGcResult {
    pub status: bool,
    pub msg: String,
    #[serde(rename = "starttime")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(rename = "endtime")]
    pub end_time: Option<DateTime<Utc>>,
}

/// The registry control sidecar: health plus physical deletion.
#[async_trait]
pub trait RegistryControl: Send + Sync {
    /// Probe the backend. A failure here aborts a collection run before
    /// anything is mutated.
    async fn health(&self) -> Result<(), RegistryError>;

    /// Delete blob content by digest.
    async fn delete_blob(&self, digest: &Digest) -> Result<(), RegistryError>;

    /// Remove the manifest revision link stored under `repository`.
    async fn delete_manifest(
        &self,
        repository: &str,
        digest: &Digest,
    ) -> Result<(), RegistryError>;

    /// Trigger the backend's own garbage collection. Legacy path; clients
    /// that don't support it keep this default.
    async fn start_gc(&self) -> Result<BackendGcResult, RegistryError> {
        Err(RegistryError::Unavailable(
            "backend-side garbage collection is not supported by this client".into(),
        ))
    }
}

/// The registry v2 API, reduced to what collection needs.
#[async_trait]
pub trait DistributionApi: Send + Sync {
    /// Delete a manifest through the v2 API, removing all of its tags.
    ///
    /// Implementations check for existence first and treat a missing
    /// manifest as success: the previous run may have removed it from the
    /// backend and then died before updating the database.
    async fn delete_manifest(
        &self,
        repository: &str,
        digest: &Digest,
    ) -> Result<(), RegistryError>;
}

fn build_client() -> Result<Client, RegistryError> {
    Ok(Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(REQUEST_TIMEOUT)
        .build()?)
}

fn trim_base(url: &str) -> String {
    url.trim_end_matches('/').to_owned()
}

/// HTTP client for the registry control sidecar.
pub struct HttpRegistryControl {
    base: String,
    client: Client,
    credentials: Option<(String, String)>,
}

impl HttpRegistryControl {
    pub fn new(base_url: &str) -> Result<Self, RegistryError> {
        Ok(Self {
            base: trim_base(base_url),
            client: build_client()?,
            credentials: None,
        })
    }

    /// Authenticate requests with HTTP basic auth.
    pub fn with_basic_auth(mut self, username: &str, password: &str) -> Self {
        self.credentials = Some((username.to_owned(), password.to_owned()));
        self
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let mut builder = self.client.request(method, url);
        if let Some((user, pass)) = &self.credentials {
            builder = builder.basic_auth(user, Some(pass));
        }
        builder
    }
}

#[async_trait]
impl RegistryControl for HttpRegistryControl {
    async fn health(&self) -> Result<(), RegistryError> {
        let url = format!("{}/api/health", self.base);
        let response = self.request(reqwest::Method::GET, &url).send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(RegistryError::Unavailable(format!(
                "health check returned {} from {url}",
                response.status()
            )))
        }
    }

    async fn delete_blob(&self, digest: &Digest) -> Result<(), RegistryError> {
        let url = format!("{}/api/registry/blob/{digest}", self.base);
        let response = self.request(reqwest::Method::DELETE, &url).send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status == StatusCode::NOT_FOUND {
            Err(RegistryError::NotFound(format!("blob {digest}")))
        } else {
            Err(RegistryError::Status {
                status: status.as_u16(),
                url,
            })
        }
    }

    async fn delete_manifest(
        &self,
        repository: &str,
        digest: &Digest,
    ) -> Result<(), RegistryError> {
        let url = format!("{}/api/registry/{repository}/manifests/{digest}", self.base);
        let response = self.request(reqwest::Method::DELETE, &url).send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status == StatusCode::NOT_FOUND {
            Err(RegistryError::NotFound(format!(
                "manifest {repository}@{digest}"
            )))
        } else {
            Err(RegistryError::Status {
                status: status.as_u16(),
                url,
            })
        }
    }

    async fn start_gc(&self) -> Result<BackendGcResult, RegistryError> {
        let url = format!("{}/api/registry/gc", self.base);
        let response = self.request(reqwest::Method::POST, &url).send().await?;
        if !response.status().is_success() {
            return Err(RegistryError::Status {
                status: response.status().as_u16(),
                url,
            });
        }
        Ok(response.json().await?)
    }
}

/// HTTP client for the registry v2 API.
pub struct HttpDistributionClient {
    base: String,
    client: Client,
    credentials: Option<(String, String)>,
}

impl HttpDistributionClient {
    pub fn new(base_url: &str) -> Result<Self, RegistryError> {
        Ok(Self {
            base: trim_base(base_url),
            client: build_client()?,
            credentials: None,
        })
    }

    /// Authenticate requests with HTTP basic auth.
    pub fn with_basic_auth(mut self, username: &str, password: &str) -> Self {
        self.credentials = Some((username.to_owned(), password.to_owned()));
        self
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let mut builder = self.client.request(method, url);
        if let Some((user, pass)) = &self.credentials {
            builder = builder.basic_auth(user, Some(pass));
        }
        builder
    }

    fn manifest_url(&self, repository: &str, digest: &Digest) -> String {
        format!("{}/v2/{repository}/manifests/{digest}", self.base)
    }

    async fn manifest_exists(
        &self,
        repository: &str,
        digest: &Digest,
    ) -> Result<bool, RegistryError> {
        let url = self.manifest_url(repository, digest);
        let accept = [DOCKER_MANIFEST, DOCKER_MANIFEST_LIST, OCI_MANIFEST, OCI_INDEX].join(", ");
        let response = self
            .request(reqwest::Method::HEAD, &url)
            .header(reqwest::header::ACCEPT, accept)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            Ok(true)
        } else if status == StatusCode::NOT_FOUND {
            Ok(false)
        } else {
            Err(RegistryError::Status {
                status: status.as_u16(),
                url,
            })
        }
    }
}

#[async_trait]
impl DistributionApi for HttpDistributionClient {
    async fn delete_manifest(
        &self,
        repository: &str,
        digest: &Digest,
    ) -> Result<(), RegistryError> {
        // A previous run may have deleted the manifest and died before the
        // database caught up; nothing left to do then.
        if !self.manifest_exists(repository, digest).await? {
            debug!("manifest {repository}@{digest} already absent from backend");
            return Ok(());
        }
        let url = self.manifest_url(repository, digest);
        let response = self.request(reqwest::Method::DELETE, &url).send().await?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(RegistryError::Status {
                status: status.as_u16(),
                url,
            })
        }
    }
}
