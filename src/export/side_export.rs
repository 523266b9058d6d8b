//! Issues, merge requests, wiki pages and snippets saved next to the archives.
//!
//! Runs once an instance's archive pass has finished. A collection the project
//! has switched off, or one the token cannot see (403/404), counts as
//! unavailable rather than failed. Failed collections are reported and logged
//! to `errors.log`; they are not retried by a later pass.

use super::{JobFailure, RetryPolicy};
use crate::client::pagination::{FIRST_PAGE, MAX_PAGES};
use crate::client::{ApiError, ApiResult, ExportApi, ProjectResource, RemoteProject};
use crate::config::SideExportSettings;
use crate::output::{sanitize_component, write_atomic, write_json_atomic, OutputError, RunLayout};
use crate::report::{ReportEvent, ReportSender, SideExportRecord};
use crate::shutdown::SharedShutdown;
use crate::ProjectRef;
use futures_util::{future, stream, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, info_span, warn, Instrument};

/// Page listing of a wiki, without page bodies
pub const WIKI_INDEX_FILE: &str = "wiki_index.json";

/// File name used for snippets that do not report one
const DEFAULT_SNIPPET_NAME: &str = "snippet";

#[derive(Debug, thiserror::Error)]
enum SideExportError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Output(#[from] OutputError),
}

impl From<SideExportError> for JobFailure {
    fn from(err: SideExportError) -> Self {
        match err {
            SideExportError::Api(e) => e.into(),
            SideExportError::Output(e) => JobFailure::disk("write side export", e),
        }
    }
}

/// Exports the per-project collections of one instance
pub struct SideExporter {
    api: Arc<dyn ExportApi>,
    layout: Arc<RunLayout>,
    settings: SideExportSettings,
    retry: RetryPolicy,
    shutdown: SharedShutdown,
    reports: ReportSender,
}

impl SideExporter {
    pub fn new(
        api: Arc<dyn ExportApi>,
        layout: Arc<RunLayout>,
        settings: SideExportSettings,
        retry: RetryPolicy,
        shutdown: SharedShutdown,
        reports: ReportSender,
    ) -> Self {
        Self {
            api,
            layout,
            settings,
            retry,
            shutdown,
            reports,
        }
    }

    /// Export the enabled collections of every project, `max_concurrent`
    /// projects at a time. Returns the number of collections written.
    pub async fn run(&self, projects: &[RemoteProject], max_concurrent: usize) -> usize {
        if !self.settings.any() {
            return 0;
        }
        info!(
            instance = self.api.instance_name(),
            projects = projects.len(),
            "Exporting issues, merge requests, wikis and snippets"
        );
        let saved = stream::iter(projects)
            .take_while(|_| future::ready(!self.shutdown.is_cancelled()))
            .map(|project| self.export_project(project))
            .buffer_unordered(max_concurrent.max(1))
            .fold(0, |total, saved| future::ready(total + saved))
            .await;
        info!(instance = self.api.instance_name(), collections = saved, "Side exports finished");
        saved
    }

    async fn export_project(&self, project: &RemoteProject) -> usize {
        let project_ref = project.to_ref(self.api.instance_name());
        let span = info_span!("side_export", project = %project_ref.path, project_id = project.id);
        async {
            let mut saved = 0;
            for resource in ProjectResource::ALL {
                if !self.settings.includes(resource) {
                    continue;
                }
                if self.shutdown.is_cancelled() {
                    break;
                }
                let record = if !project.has(resource) {
                    SideExportRecord::unavailable(project_ref.clone(), resource)
                } else {
                    match self.export_resource(&project_ref, resource).await {
                        Ok(items) => {
                            saved += 1;
                            debug!(%resource, items, "Saved");
                            SideExportRecord::saved(project_ref.clone(), resource, items)
                        }
                        Err(SideExportError::Api(
                            ApiError::NotFound(_) | ApiError::PermissionDenied(_),
                        )) => {
                            debug!(%resource, "Not available to this token");
                            SideExportRecord::unavailable(project_ref.clone(), resource)
                        }
                        Err(SideExportError::Api(ApiError::Cancelled)) => break,
                        Err(e) => {
                            let failure = JobFailure::from(e);
                            warn!(%resource, error = %failure, "Side export failed");
                            SideExportRecord::failed(project_ref.clone(), resource, &failure)
                        }
                    }
                };
                self.reports.send(ReportEvent::SideExport(record)).await;
            }
            saved
        }
        .instrument(span)
        .await
    }

    /// Fetch and write one collection; returns the number of items
    async fn export_resource(
        &self,
        project: &ProjectRef,
        resource: ProjectResource,
    ) -> Result<usize, SideExportError> {
        let items = self.fetch_all(project, resource).await?;
        if items.is_empty() {
            return Ok(0);
        }
        match resource {
            ProjectResource::Issues | ProjectResource::MergeRequests => {
                let path = self
                    .layout
                    .metadata_dir(project)
                    .join(format!("{}.json", resource.endpoint()));
                write_json_atomic(&path, &items)?;
            }
            ProjectResource::WikiPages => self.write_wiki(project, &items)?,
            ProjectResource::Snippets => self.write_snippets(project, &items).await?,
        }
        Ok(items.len())
    }

    async fn fetch_all(
        &self,
        project: &ProjectRef,
        resource: ProjectResource,
    ) -> ApiResult<Vec<Value>> {
        let mut items = Vec::new();
        let mut page = FIRST_PAGE;
        for _ in 0..MAX_PAGES {
            let what = format!("{project} {resource} page {page}");
            let fetched = self
                .retry
                .call(&self.shutdown, &what, || {
                    self.api.list_resource_page(project, resource, page)
                })
                .await?;
            items.extend(fetched.items);
            match fetched.next_page {
                Some(next) if next > page => page = next,
                _ => return Ok(items),
            }
        }
        Err(ApiError::Protocol(format!(
            "{resource} listing exceeded {MAX_PAGES} pages"
        )))
    }

    fn write_wiki(&self, project: &ProjectRef, pages: &[Value]) -> Result<(), OutputError> {
        let dir = self.layout.wiki_dir(project);
        let index: Vec<Value> = pages.iter().map(without_content).collect();
        write_json_atomic(&dir.join(WIKI_INDEX_FILE), &index)?;
        for page in pages {
            let Some(slug) = page.get("slug").and_then(Value::as_str) else {
                debug!("Wiki page without slug, index entry only");
                continue;
            };
            let content = page
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let path = dir.join(format!("{}.md", sanitize_component(slug)));
            write_atomic(&path, content.as_bytes())?;
        }
        Ok(())
    }

    async fn write_snippets(
        &self,
        project: &ProjectRef,
        snippets: &[Value],
    ) -> Result<(), SideExportError> {
        let dir = self.layout.snippets_dir(project);
        for snippet in snippets {
            let id = snippet
                .get("id")
                .and_then(Value::as_u64)
                .ok_or_else(|| ApiError::Protocol("snippet without id".into()))?;
            let file_name = snippet
                .get("file_name")
                .and_then(Value::as_str)
                .filter(|name| !name.is_empty())
                .unwrap_or(DEFAULT_SNIPPET_NAME);

            let what = format!("{project} snippet {id}");
            let content = self
                .retry
                .call(&self.shutdown, &what, || self.api.snippet_content(project, id))
                .await?;
            write_atomic(
                &dir.join(format!("{id}_{}", sanitize_component(file_name))),
                &content,
            )?;
            write_json_atomic(&dir.join(format!("{id}_metadata.json")), snippet)?;
        }
        Ok(())
    }
}

fn without_content(page: &Value) -> Value {
    let mut page = page.clone();
    if let Some(fields) = page.as_object_mut() {
        fields.remove("content");
    }
    page
}
