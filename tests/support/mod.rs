//! In-memory GitLab instance shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use gitlab_backup::client::{
    ApiError, ApiResult, ArchiveDownload, ExportApi, ExportStatus, InstanceInfo, ProjectPage,
    ProjectResource, RemoteProject, ResourcePage,
};
use gitlab_backup::config::ExportSettings;
use gitlab_backup::orchestrator::{ClientFactory, CredentialSource, Orchestrator};
use gitlab_backup::report::{InstanceReport, RunReport};
use gitlab_backup::shutdown::SharedShutdown;
use gitlab_backup::{Instance, ProjectRef};
use secrecy::SecretString;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// What the server does for one export attempt of a project
#[derive(Debug, Clone)]
pub enum Step {
    /// Export finishes and the archive downloads intact
    Succeed,
    /// Export reports `failed`
    RemoteFails,
    /// Export stays `started` forever
    NeverFinishes,
    /// Archive body does not match the announced checksum
    CorruptArchive,
    /// Trigger request fails
    TriggerError(ApiError),
    /// Download request fails
    DownloadError(ApiError),
    /// First status poll answers 429 with this retry-after hint
    PollRateLimited(Duration),
    /// Body breaks after half the archive; a ranged request gets the rest
    InterruptedDownload,
}

#[derive(Default)]
struct ServerState {
    current: HashMap<u64, Step>,
    polls: HashMap<u64, u32>,
    running: HashSet<u64>,
    peak_running: usize,
    triggers: HashMap<u64, u32>,
    downloads: HashMap<u64, u32>,
    download_offsets: HashMap<u64, Vec<u64>>,
    poll_times: HashMap<u64, Vec<Instant>>,
}

/// Fake instance implementing [`ExportApi`]
pub struct FakeGitLab {
    name: String,
    projects: Vec<RemoteProject>,
    page_size: usize,
    polls_until_finished: u32,
    validate_error: Option<ApiError>,
    resources: HashMap<(u64, ProjectResource), Vec<serde_json::Value>>,
    scripts: Mutex<HashMap<u64, VecDeque<Step>>>,
    state: Mutex<ServerState>,
}

impl FakeGitLab {
    /// Instance `name` with projects `1..=count` named `group/project-<id>`
    pub fn new(name: &str, count: u64) -> Self {
        let projects = (1..=count).map(|id| remote_project(id, false)).collect();
        Self {
            name: name.to_string(),
            projects,
            page_size: 100,
            polls_until_finished: 2,
            validate_error: None,
            resources: HashMap::new(),
            scripts: Mutex::new(HashMap::new()),
            state: Mutex::new(ServerState::default()),
        }
    }

    /// Projects per listing page
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Add an archived project
    pub fn with_archived_project(mut self, id: u64) -> Self {
        self.projects.push(remote_project(id, true));
        self
    }

    /// Add a project with an explicit path
    pub fn with_project(mut self, id: u64, path: &str) -> Self {
        self.projects.push(RemoteProject::new(id, path));
        self
    }

    /// Serve `items` for one collection of project `id`
    pub fn with_resource(
        mut self,
        id: u64,
        resource: ProjectResource,
        items: Vec<serde_json::Value>,
    ) -> Self {
        self.resources.insert((id, resource), items);
        self
    }

    /// Script successive attempts for `id`; later attempts succeed
    pub fn with_script(self, id: u64, steps: Vec<Step>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(id, steps.into_iter().collect());
        self
    }

    /// Answer `validate` with 401
    pub fn rejecting_token(mut self) -> Self {
        self.validate_error = Some(ApiError::Auth("401 Unauthorized".to_string()));
        self
    }

    /// Answer `validate` with a connection error
    pub fn unreachable(mut self) -> Self {
        self.validate_error = Some(ApiError::Network("connection refused".to_string()));
        self
    }

    /// Exports triggered for `id`
    pub fn triggers(&self, id: u64) -> u32 {
        self.state
            .lock()
            .unwrap()
            .triggers
            .get(&id)
            .copied()
            .unwrap_or(0)
    }

    /// Offsets requested by each download of `id`
    pub fn download_offsets(&self, id: u64) -> Vec<u64> {
        self.state
            .lock()
            .unwrap()
            .download_offsets
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    /// Clock readings of every status poll of `id`
    pub fn poll_times(&self, id: u64) -> Vec<Instant> {
        self.state
            .lock()
            .unwrap()
            .poll_times
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    /// Exports triggered across all projects
    pub fn total_triggers(&self) -> u32 {
        self.state.lock().unwrap().triggers.values().sum()
    }

    /// Most exports running on the server at once
    pub fn peak_running(&self) -> usize {
        self.state.lock().unwrap().peak_running
    }

    fn next_step(&self, id: u64) -> Step {
        self.scripts
            .lock()
            .unwrap()
            .get_mut(&id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Step::Succeed)
    }
}

/// Archive bytes served for project `id`
pub fn archive_body(id: u64) -> Vec<u8> {
    format!("tarball of project {id} ").repeat(64).into_bytes()
}

/// Archive file name of project `id`
pub fn archive_name(id: u64) -> String {
    format!("{id}_group_project-{id}.tar.gz")
}

fn remote_project(id: u64, archived: bool) -> RemoteProject {
    RemoteProject {
        web_url: format!("https://gitlab.test/group/project-{id}"),
        archived,
        ..RemoteProject::new(id, format!("group/project-{id}"))
    }
}

#[async_trait]
impl ExportApi for FakeGitLab {
    fn instance_name(&self) -> &str {
        &self.name
    }

    async fn validate(&self) -> ApiResult<InstanceInfo> {
        if let Some(e) = &self.validate_error {
            return Err(e.clone());
        }
        Ok(InstanceInfo {
            username: "backup-bot".to_string(),
            version: Some("17.0.0".to_string()),
        })
    }

    async fn list_projects_page(&self, page: u32) -> ApiResult<ProjectPage> {
        let start = (page.saturating_sub(1) as usize) * self.page_size;
        let end = (start + self.page_size).min(self.projects.len());
        let projects = self
            .projects
            .get(start..end)
            .map(<[RemoteProject]>::to_vec)
            .unwrap_or_default();
        let next_page = (end < self.projects.len()).then_some(page + 1);
        Ok(ProjectPage {
            projects,
            next_page,
        })
    }

    async fn trigger_export(&self, project: &ProjectRef) -> ApiResult<()> {
        let id = project.project_id;
        let step = self.next_step(id);
        if let Step::TriggerError(e) = step {
            return Err(e);
        }
        let mut state = self.state.lock().unwrap();
        *state.triggers.entry(id).or_default() += 1;
        state.polls.insert(id, 0);
        state.current.insert(id, step);
        state.running.insert(id);
        state.peak_running = state.peak_running.max(state.running.len());
        Ok(())
    }

    async fn poll_export(&self, project: &ProjectRef) -> ApiResult<ExportStatus> {
        let id = project.project_id;
        let mut state = self.state.lock().unwrap();
        state.poll_times.entry(id).or_default().push(Instant::now());
        let polls = {
            let polls = state.polls.entry(id).or_default();
            *polls += 1;
            *polls
        };
        let step = state.current.get(&id).cloned().unwrap_or(Step::Succeed);
        match step {
            Step::PollRateLimited(hint) if polls == 1 => Err(ApiError::RateLimited {
                retry_after: Some(hint),
            }),
            Step::RemoteFails => {
                state.running.remove(&id);
                Ok(ExportStatus::Failed)
            }
            Step::NeverFinishes => Ok(ExportStatus::Running),
            _ if polls >= self.polls_until_finished => Ok(ExportStatus::Finished),
            _ => Ok(ExportStatus::Running),
        }
    }

    async fn download_archive(
        &self,
        project: &ProjectRef,
        offset: u64,
    ) -> ApiResult<ArchiveDownload> {
        let id = project.project_id;
        let step = {
            let mut state = self.state.lock().unwrap();
            state.running.remove(&id);
            *state.downloads.entry(id).or_default() += 1;
            state.download_offsets.entry(id).or_default().push(offset);
            state.current.get(&id).cloned().unwrap_or(Step::Succeed)
        };
        if let Step::DownloadError(e) = step {
            return Err(e);
        }

        let body = archive_body(id);
        let checksum = if matches!(step, Step::CorruptArchive) {
            hex::encode(Sha256::digest(b"something else"))
        } else {
            hex::encode(Sha256::digest(&body))
        };
        let expected_size = Some(body.len() as u64);
        let half = body.len() / 2;
        let start = (offset as usize).min(body.len());
        let chunks = match step {
            Step::InterruptedDownload if offset == 0 => vec![
                Ok(Bytes::copy_from_slice(&body[..half])),
                Err(ApiError::Network("connection reset by peer".into())),
            ],
            _ if start > 0 => vec![Ok(Bytes::copy_from_slice(&body[start..]))],
            _ => vec![
                Ok(Bytes::copy_from_slice(&body[..half])),
                Ok(Bytes::copy_from_slice(&body[half..])),
            ],
        };
        Ok(ArchiveDownload {
            stream: Box::pin(stream::iter(chunks)),
            offset: start as u64,
            expected_size,
            expected_sha256: Some(checksum),
        })
    }

    async fn list_resource_page(
        &self,
        project: &ProjectRef,
        resource: ProjectResource,
        _page: u32,
    ) -> ApiResult<ResourcePage> {
        let items = self
            .resources
            .get(&(project.project_id, resource))
            .cloned()
            .unwrap_or_default();
        Ok(ResourcePage {
            items,
            next_page: None,
        })
    }

    async fn snippet_content(&self, project: &ProjectRef, snippet_id: u64) -> ApiResult<Bytes> {
        Ok(Bytes::from(format!(
            "snippet {snippet_id} of project {}",
            project.project_id
        )))
    }
}

/// Client factory handing out the fakes by instance name
pub fn factory(fakes: &[Arc<FakeGitLab>]) -> ClientFactory {
    let by_name: HashMap<String, Arc<FakeGitLab>> = fakes
        .iter()
        .map(|fake| (fake.name.clone(), Arc::clone(fake)))
        .collect();
    Arc::new(move |instance: &Instance, _token: &SecretString, _settings: &ExportSettings| {
        by_name
            .get(&instance.name)
            .map(|fake| Arc::clone(fake) as Arc<dyn ExportApi>)
            .ok_or_else(|| ApiError::Protocol(format!("no fake for {}", instance.name)))
    })
}

/// Instance pointing nowhere, with `secret_ref` equal to its name
pub fn instance(name: &str) -> Instance {
    Instance::new(name, format!("https://{name}.gitlab.test"), name)
}

/// Environment-style credentials for `names`
pub fn credentials(names: &[&str]) -> CredentialSource {
    CredentialSource::Env(
        names
            .iter()
            .map(|name| (name.to_string(), SecretString::from(format!("glpat-{name}"))))
            .collect(),
    )
}

/// Fast settings: one-minute export timeout, one-second polls
pub fn settings(max_concurrent: usize) -> ExportSettings {
    ExportSettings {
        max_concurrent_exports: max_concurrent,
        timeout_minutes: 1,
        max_attempts: 3,
        poll_interval_secs: 1,
        ..ExportSettings::default()
    }
}

/// Orchestrator wired to `fakes`
pub fn orchestrator(
    root: &Path,
    settings: ExportSettings,
    fakes: &[Arc<FakeGitLab>],
    shutdown: SharedShutdown,
) -> Orchestrator {
    Orchestrator::new(settings, root.to_path_buf(), shutdown).with_client_factory(factory(fakes))
}

/// Report of instance `name`
pub fn instance_report<'a>(report: &'a RunReport, name: &str) -> &'a InstanceReport {
    report
        .instances
        .iter()
        .find(|i| i.instance == name)
        .unwrap_or_else(|| panic!("no report for instance {name}"))
}

/// Non-empty lines of the ledger under `root`
pub fn ledger_lines(root: &Path) -> Vec<String> {
    std::fs::read_to_string(gitlab_backup::output::ledger_path(root))
        .unwrap_or_default()
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(str::to_string)
        .collect()
}

/// Files under `dir` whose name ends with `.part`
pub fn partial_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "part"))
        .collect()
}
