//! Page-cursor enumeration of member projects.
//!
//! GitLab pages are addressed by number and the next cursor comes from the
//! `x-next-page` header. The stream is lazy and restartable: pass the page
//! number at which an earlier enumeration stopped.

use super::{ApiError, ApiResult, ExportApi, RemoteProject};
use crate::export::RetryPolicy;
use crate::shutdown::SharedShutdown;
use futures_util::{stream, Stream, StreamExt, TryStreamExt};
use std::sync::Arc;
use tracing::{debug, warn};

/// Maximum number of pages fetched by one enumeration
pub const MAX_PAGES: u32 = 10_000;

/// First page number of the GitLab listing
pub const FIRST_PAGE: u32 = 1;

struct Cursor {
    api: Arc<dyn ExportApi>,
    policy: RetryPolicy,
    shutdown: SharedShutdown,
    next: Option<u32>,
    fetched: u32,
}

/// Lazily enumerate projects starting at `start_page`.
///
/// Transient page failures are retried with `policy`; a permanent failure is
/// yielded once and ends the stream, as does [`ApiError::Cancelled`] when
/// `shutdown` fires during a request or backoff. Archived projects are dropped
/// unless `include_archived` is set.
pub fn project_stream(
    api: Arc<dyn ExportApi>,
    start_page: u32,
    include_archived: bool,
    policy: RetryPolicy,
    shutdown: SharedShutdown,
) -> impl Stream<Item = ApiResult<RemoteProject>> + Send {
    let cursor = Cursor {
        api,
        policy,
        shutdown,
        next: Some(start_page.max(FIRST_PAGE)),
        fetched: 0,
    };

    stream::unfold(cursor, |mut cursor| async move {
        let page_no = cursor.next?;

        if cursor.fetched >= MAX_PAGES {
            cursor.next = None;
            let err = ApiError::Protocol(format!(
                "project listing exceeded {MAX_PAGES} pages - possible pagination loop at page {page_no}"
            ));
            return Some((Err(err), cursor));
        }

        let what = format!("{} project page {page_no}", cursor.api.instance_name());
        let fetched = cursor
            .policy
            .call(&cursor.shutdown, &what, || cursor.api.list_projects_page(page_no))
            .await;
        match fetched {
            Ok(page) => {
                cursor.fetched += 1;
                cursor.next = match page.next_page {
                    Some(next) if next > page_no => Some(next),
                    Some(next) => {
                        warn!(page = page_no, next, "Non-advancing next page cursor, stopping");
                        None
                    }
                    None => None,
                };
                Some((Ok(page.projects), cursor))
            }
            Err(err) => {
                cursor.next = None;
                Some((Err(err), cursor))
            }
        }
    })
    .flat_map(move |page: ApiResult<Vec<RemoteProject>>| {
        let items: Vec<ApiResult<RemoteProject>> = match page {
            Ok(projects) => projects
                .into_iter()
                .filter(|p| include_archived || !p.archived)
                .map(Ok)
                .collect(),
            Err(err) => vec![Err(err)],
        };
        stream::iter(items)
    })
}

/// Enumerate every project of the instance in listing order.
pub async fn collect_projects(
    api: Arc<dyn ExportApi>,
    include_archived: bool,
    policy: RetryPolicy,
    shutdown: SharedShutdown,
) -> ApiResult<Vec<RemoteProject>> {
    let projects: Vec<RemoteProject> =
        project_stream(api, FIRST_PAGE, include_archived, policy, shutdown)
            .try_collect()
            .await?;
    debug!(count = projects.len(), "Project enumeration complete");
    Ok(projects)
}
