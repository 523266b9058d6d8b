//! GitLab API access
//!
//! The export engine talks to an instance only through the [`ExportApi`]
//! trait. [`gitlab::GitLabClient`] implements it over the REST v4 API; tests
//! substitute an in-memory fake.

use crate::export::{ErrorKind, JobFailure};
use crate::ProjectRef;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Duration;

pub mod classify;
pub mod gitlab;
pub mod pagination;

pub use gitlab::{GitLabClient, HttpOptions};
pub use pagination::{collect_projects, project_stream};

/// API errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// Token rejected (401)
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Token lacks access (403)
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Resource does not exist (404)
    #[error("not found: {0}")]
    NotFound(String),

    /// Rate limited (429)
    #[error("rate limited{}", .retry_after.map(|d| format!(" (retry after {}s)", d.as_secs())).unwrap_or_default())]
    RateLimited {
        /// Server-mandated delay, if provided
        retry_after: Option<Duration>,
    },

    /// Connection failure, timeout, 5xx or broken body
    #[error("network error: {0}")]
    Network(String),

    /// Unexpected status or payload
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Shutdown requested while the request or its backoff was pending
    #[error("cancelled")]
    Cancelled,
}

impl ApiError {
    /// Classified kind
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Auth(_) => ErrorKind::AuthError,
            ApiError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            ApiError::NotFound(_) => ErrorKind::RemoteNotFound,
            ApiError::RateLimited { .. } => ErrorKind::RateLimited,
            ApiError::Network(_) => ErrorKind::TransientNetworkError,
            ApiError::Protocol(_) => ErrorKind::ProtocolError,
            ApiError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Server retry-after hint
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ApiError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<ApiError> for JobFailure {
    fn from(err: ApiError) -> Self {
        JobFailure::new(err.kind(), err.to_string())
    }
}

/// Result type for API operations
pub type ApiResult<T> = Result<T, ApiError>;

/// Remote export status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportStatus {
    /// No export exists
    None,
    /// Queued in the background worker
    Queued,
    /// Being generated (`started` or `regeneration_in_progress`)
    Running,
    /// Archive ready for download
    Finished,
    /// Export failed on the server
    Failed,
}

impl ExportStatus {
    /// Parse the `export_status` field of the GitLab API
    pub fn from_api(status: &str) -> Option<Self> {
        match status {
            "none" => Some(ExportStatus::None),
            "queued" => Some(ExportStatus::Queued),
            "started" | "regeneration_in_progress" => Some(ExportStatus::Running),
            "finished" => Some(ExportStatus::Finished),
            "failed" => Some(ExportStatus::Failed),
            _ => None,
        }
    }
}

/// Stream of archive chunks
pub type ArchiveStream = Pin<Box<dyn Stream<Item = ApiResult<Bytes>> + Send>>;

/// Open archive download
pub struct ArchiveDownload {
    /// Body chunks in order
    pub stream: ArchiveStream,
    /// Byte position of the first chunk; 0 when the server sent the whole archive
    pub offset: u64,
    /// Expected size of the whole archive
    pub expected_size: Option<u64>,
    /// Expected lowercase hex SHA-256, if the server provided one
    pub expected_sha256: Option<String>,
}

impl std::fmt::Debug for ArchiveDownload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveDownload")
            .field("offset", &self.offset)
            .field("expected_size", &self.expected_size)
            .field("expected_sha256", &self.expected_sha256)
            .finish_non_exhaustive()
    }
}

/// Repository statistics returned with `statistics=true`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectStatistics {
    /// Repository size in bytes
    #[serde(default)]
    pub repository_size: u64,
}

/// Project as returned by `GET /projects`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteProject {
    /// Numeric id
    pub id: u64,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Full path with namespace
    pub path_with_namespace: String,
    /// Browser URL
    #[serde(default)]
    pub web_url: String,
    /// Whether the project is archived
    #[serde(default)]
    pub archived: bool,
    #[serde(default = "enabled")]
    pub issues_enabled: bool,
    #[serde(default = "enabled")]
    pub merge_requests_enabled: bool,
    #[serde(default = "enabled")]
    pub wiki_enabled: bool,
    #[serde(default = "enabled")]
    pub snippets_enabled: bool,
    /// Optional statistics
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statistics: Option<ProjectStatistics>,
}

fn enabled() -> bool {
    true
}

impl RemoteProject {
    /// Project with every feature enabled and no statistics
    pub fn new(id: u64, path_with_namespace: impl Into<String>) -> Self {
        let path_with_namespace = path_with_namespace.into();
        Self {
            id,
            name: path_with_namespace
                .rsplit('/')
                .next()
                .unwrap_or_default()
                .to_string(),
            path_with_namespace,
            web_url: String::new(),
            archived: false,
            issues_enabled: true,
            merge_requests_enabled: true,
            wiki_enabled: true,
            snippets_enabled: true,
            statistics: None,
        }
    }

    /// Identity within `instance_name`
    pub fn to_ref(&self, instance_name: &str) -> ProjectRef {
        ProjectRef::new(instance_name, self.id, self.path_with_namespace.clone())
    }

    /// Whether `resource` is switched on for this project
    pub fn has(&self, resource: ProjectResource) -> bool {
        match resource {
            ProjectResource::Issues => self.issues_enabled,
            ProjectResource::MergeRequests => self.merge_requests_enabled,
            ProjectResource::WikiPages => self.wiki_enabled,
            ProjectResource::Snippets => self.snippets_enabled,
        }
    }
}

/// Per-project collections saved next to the archive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectResource {
    Issues,
    MergeRequests,
    WikiPages,
    Snippets,
}

impl ProjectResource {
    /// Every resource, in export order
    pub const ALL: [ProjectResource; 4] = [
        ProjectResource::Issues,
        ProjectResource::MergeRequests,
        ProjectResource::WikiPages,
        ProjectResource::Snippets,
    ];

    /// Path segment under `/projects/:id/`
    pub fn endpoint(&self) -> &'static str {
        match self {
            ProjectResource::Issues => "issues",
            ProjectResource::MergeRequests => "merge_requests",
            ProjectResource::WikiPages => "wikis",
            ProjectResource::Snippets => "snippets",
        }
    }
}

impl std::fmt::Display for ProjectResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ProjectResource::Issues => "issues",
            ProjectResource::MergeRequests => "merge_requests",
            ProjectResource::WikiPages => "wiki_pages",
            ProjectResource::Snippets => "snippets",
        })
    }
}

/// One page of a project resource listing, kept as raw JSON
#[derive(Debug, Clone, PartialEq)]
pub struct ResourcePage {
    pub items: Vec<serde_json::Value>,
    /// Cursor of the next page, `None` on the last page
    pub next_page: Option<u32>,
}

/// One page of the project listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectPage {
    /// Projects on this page
    pub projects: Vec<RemoteProject>,
    /// Cursor of the next page, `None` on the last page
    pub next_page: Option<u32>,
}

/// Authenticated user and server version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceInfo {
    /// Username owning the token
    pub username: String,
    /// GitLab version, when the server reports it
    pub version: Option<String>,
}

/// Operations the export engine needs from one instance
#[async_trait]
pub trait ExportApi: Send + Sync {
    /// Instance name used in logs and project refs
    fn instance_name(&self) -> &str;

    /// Check the token (`GET /user`)
    async fn validate(&self) -> ApiResult<InstanceInfo>;

    /// Fetch one page of member projects, ordered by id
    async fn list_projects_page(&self, page: u32) -> ApiResult<ProjectPage>;

    /// Request a new export (`POST /projects/:id/export`)
    async fn trigger_export(&self, project: &ProjectRef) -> ApiResult<()>;

    /// Current export status (`GET /projects/:id/export`)
    async fn poll_export(&self, project: &ProjectRef) -> ApiResult<ExportStatus>;

    /// Open the finished archive (`GET /projects/:id/export/download`),
    /// asking for the bytes from `offset` onwards when it is non-zero
    async fn download_archive(
        &self,
        project: &ProjectRef,
        offset: u64,
    ) -> ApiResult<ArchiveDownload>;

    /// Fetch one page of issues, merge requests, wiki pages or snippets
    async fn list_resource_page(
        &self,
        project: &ProjectRef,
        resource: ProjectResource,
        page: u32,
    ) -> ApiResult<ResourcePage>;

    /// Raw content of one project snippet (`GET /projects/:id/snippets/:sid/raw`)
    async fn snippet_content(&self, project: &ProjectRef, snippet_id: u64) -> ApiResult<Bytes>;
}
