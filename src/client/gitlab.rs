//! GitLab REST v4 adapter
//!
//! One [`GitLabClient`] per instance. The access token is installed once as a
//! sensitive default header and is never part of a URL, log field or error.

use super::classify::{
    classify_status, classify_transport, parse_content_range, parse_next_page, parse_retry_after,
};
use super::{
    ApiError, ApiResult, ArchiveDownload, ExportApi, ExportStatus, InstanceInfo, ProjectPage,
    ProjectResource, RemoteProject, ResourcePage,
};
use crate::{Instance, ProjectRef};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, RANGE};
use reqwest::{Client, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, trace};

/// Projects requested per listing page (GitLab maximum)
pub const PROJECTS_PER_PAGE: u32 = 100;

/// Items requested per page of issues, merge requests, wikis and snippets
pub const RESOURCES_PER_PAGE: u32 = 100;

/// Header carrying the archive checksum, when the server provides one
pub const CHECKSUM_HEADER: &str = "x-checksum-sha256";

/// HTTP connect timeout (seconds)
const HTTP_CONNECT_TIMEOUT_SECS: u64 = 10;
/// Timeout for JSON API calls (seconds); archive downloads have none
const HTTP_REQUEST_TIMEOUT_SECS: u64 = 60;

/// Transport options for one instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpOptions {
    /// Reject invalid TLS certificates
    pub verify_ssl: bool,
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Timeout for API calls other than archive downloads
    pub request_timeout: Duration,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            verify_ssl: true,
            connect_timeout: Duration::from_secs(HTTP_CONNECT_TIMEOUT_SECS),
            request_timeout: Duration::from_secs(HTTP_REQUEST_TIMEOUT_SECS),
        }
    }
}

#[derive(Deserialize)]
struct UserResponse {
    username: String,
}

#[derive(Deserialize)]
struct VersionResponse {
    version: String,
}

#[derive(Deserialize)]
struct ExportStatusResponse {
    export_status: String,
}

/// `ExportApi` over HTTP
pub struct GitLabClient {
    client: Client,
    instance_name: String,
    api_base: String,
    request_timeout: Duration,
}

impl std::fmt::Debug for GitLabClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitLabClient")
            .field("instance_name", &self.instance_name)
            .field("api_base", &self.api_base)
            .finish_non_exhaustive()
    }
}

impl GitLabClient {
    /// Build a client authenticated with `token`
    ///
    /// # Errors
    /// Returns `ApiError::Protocol` when the token is not a valid header value or
    /// the TLS backend cannot be initialized.
    pub fn new(instance: &Instance, token: &SecretString, options: HttpOptions) -> ApiResult<Self> {
        let mut token_header = HeaderValue::from_str(token.expose_secret())
            .map_err(|_| ApiError::Protocol("access token contains invalid characters".into()))?;
        token_header.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert("PRIVATE-TOKEN", token_header);

        let client = Client::builder()
            .default_headers(headers)
            .user_agent(concat!("gitlab-backup/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(options.connect_timeout)
            .danger_accept_invalid_certs(!options.verify_ssl)
            .build()
            .map_err(|e| ApiError::Protocol(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            instance_name: instance.name.clone(),
            api_base: format!("{}/api/v4", instance.base_url),
            request_timeout: options.request_timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    fn project_url(&self, project: &ProjectRef, suffix: &str) -> String {
        self.url(&format!("/projects/{}{}", project.project_id, suffix))
    }

    async fn get(&self, url: &str, query: &[(&str, String)]) -> ApiResult<Response> {
        trace!(url, "GET");
        let response = self
            .client
            .get(url)
            .query(query)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;
        ensure_success(response).await
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> ApiResult<T> {
        self.get(url, &[])
            .await?
            .json::<T>()
            .await
            .map_err(|e| ApiError::Protocol(format!("invalid JSON from {url}: {e}")))
    }
}

/// Turn a non-success response into a classified error
async fn ensure_success(response: Response) -> ApiResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let retry_after = parse_retry_after(response.headers());
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status, retry_after, &body))
}

fn header_u64(headers: &HeaderMap, name: impl reqwest::header::AsHeaderName) -> Option<u64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

fn checksum_header(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(CHECKSUM_HEADER)?.to_str().ok()?.trim();
    let is_sha256_hex = value.len() == 64 && value.chars().all(|c| c.is_ascii_hexdigit());
    is_sha256_hex.then(|| value.to_ascii_lowercase())
}

#[async_trait]
impl ExportApi for GitLabClient {
    fn instance_name(&self) -> &str {
        &self.instance_name
    }

    async fn validate(&self) -> ApiResult<InstanceInfo> {
        let user: UserResponse = self.get_json(&self.url("/user")).await?;
        let version = match self.get_json::<VersionResponse>(&self.url("/version")).await {
            Ok(v) => Some(v.version),
            Err(e) => {
                debug!(instance = %self.instance_name, error = %e, "Version endpoint unavailable");
                None
            }
        };
        Ok(InstanceInfo {
            username: user.username,
            version,
        })
    }

    async fn list_projects_page(&self, page: u32) -> ApiResult<ProjectPage> {
        let query = [
            ("membership", "true".to_string()),
            ("per_page", PROJECTS_PER_PAGE.to_string()),
            ("order_by", "id".to_string()),
            ("sort", "asc".to_string()),
            ("page", page.to_string()),
        ];
        let url = self.url("/projects");
        let response = self.get(&url, &query).await?;
        let next_page = parse_next_page(response.headers());
        let projects = response
            .json::<Vec<RemoteProject>>()
            .await
            .map_err(|e| ApiError::Protocol(format!("invalid project listing: {e}")))?;
        debug!(
            instance = %self.instance_name,
            page,
            count = projects.len(),
            next_page = ?next_page,
            "Fetched project page"
        );
        Ok(ProjectPage {
            projects,
            next_page,
        })
    }

    async fn trigger_export(&self, project: &ProjectRef) -> ApiResult<()> {
        let url = self.project_url(project, "/export");
        let response = self
            .client
            .post(&url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;
        ensure_success(response).await?;
        Ok(())
    }

    async fn poll_export(&self, project: &ProjectRef) -> ApiResult<ExportStatus> {
        let status: ExportStatusResponse = self.get_json(&self.project_url(project, "/export")).await?;
        ExportStatus::from_api(&status.export_status).ok_or_else(|| {
            ApiError::Protocol(format!("unknown export_status '{}'", status.export_status))
        })
    }

    async fn download_archive(
        &self,
        project: &ProjectRef,
        offset: u64,
    ) -> ApiResult<ArchiveDownload> {
        let url = self.project_url(project, "/export/download");
        // No overall timeout: archives can be many gigabytes. Stalls are
        // bounded per chunk by the job runner.
        let mut request = self.client.get(&url);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }
        let response = request.send().await.map_err(|e| classify_transport(&e))?;
        let response = ensure_success(response).await?;

        let headers = response.headers();
        let (offset, expected_size) = if response.status() == StatusCode::PARTIAL_CONTENT {
            parse_content_range(headers).ok_or_else(|| {
                ApiError::Protocol("206 response without a usable Content-Range".into())
            })?
        } else {
            (0, header_u64(headers, CONTENT_LENGTH))
        };
        let expected_sha256 = checksum_header(headers);
        debug!(project_id = project.project_id, offset, "Opened archive download");

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| classify_transport(&e)))
            .boxed();

        Ok(ArchiveDownload {
            stream,
            offset,
            expected_size,
            expected_sha256,
        })
    }

    async fn list_resource_page(
        &self,
        project: &ProjectRef,
        resource: ProjectResource,
        page: u32,
    ) -> ApiResult<ResourcePage> {
        let url = self.project_url(project, &format!("/{}", resource.endpoint()));
        let mut query = vec![
            ("per_page", RESOURCES_PER_PAGE.to_string()),
            ("page", page.to_string()),
        ];
        if resource == ProjectResource::WikiPages {
            query.push(("with_content", "1".to_string()));
        }
        let response = self.get(&url, &query).await?;
        let next_page = parse_next_page(response.headers());
        let items = response
            .json::<Vec<serde_json::Value>>()
            .await
            .map_err(|e| ApiError::Protocol(format!("invalid {resource} listing: {e}")))?;
        trace!(project_id = project.project_id, %resource, page, count = items.len(), "Fetched resource page");
        Ok(ResourcePage { items, next_page })
    }

    async fn snippet_content(&self, project: &ProjectRef, snippet_id: u64) -> ApiResult<Bytes> {
        let url = self.project_url(project, &format!("/snippets/{snippet_id}/raw"));
        self.get(&url, &[])
            .await?
            .bytes()
            .await
            .map_err(|e| classify_transport(&e))
    }
}
