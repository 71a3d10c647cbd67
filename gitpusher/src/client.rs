use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use octocrab::Octocrab;
use serde::Deserialize;
use serde_json::json;

use crate::error::{classify, PushError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueState {
    Open,
    Closed,
}

/// An issue as currently stored at the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteIssue {
    pub number: u64,
    pub title: String,
    pub body: Option<String>,
    pub state: IssueState,
    pub labels: Vec<String>,
    pub milestone: Option<u64>,
    pub is_pull_request: bool,
}

/// Fields to overwrite in one update call. `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IssuePatch {
    pub title: Option<String>,
    pub body: Option<String>,
    pub state: Option<IssueState>,
    /// Replaces the whole label set.
    pub labels: Option<Vec<String>>,
    pub milestone: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateBudget {
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
}

/// Issue operations of the destination tracker.
#[async_trait]
pub trait IssueTracker: Send + Sync {
    /// `Ok(None)` when nothing is stored under `number`.
    async fn get_issue(&self, number: u64) -> Result<Option<RemoteIssue>>;
    async fn create_issue(&self, title: &str) -> Result<RemoteIssue>;
    async fn update_issue(&self, number: u64, patch: &IssuePatch) -> Result<RemoteIssue>;
    async fn rate_limit(&self) -> Result<RateBudget>;
    async fn find_or_create_milestone(&self, title: &str) -> Result<u64>;
    /// Numbers already taken by pull requests.
    async fn reserved_numbers(&self) -> Result<BTreeSet<u64>>;
}

/// Repository file store holding migrated attachments.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn exists(&self, path: &str) -> Result<bool>;
    async fn put(&self, path: &str, content: &[u8], message: &str) -> Result<()>;
    /// Link written into issue bodies for a stored file.
    fn link_for(&self, path: &str) -> String;
}

fn build_octocrab(token: Option<String>) -> Result<Octocrab> {
    let mut builder = Octocrab::builder();
    if let Some(token) = token {
        builder = builder.personal_token(token);
    }
    builder
        .build()
        .map_err(|err| PushError::InvalidParam(format!("cannot build GitHub client: {err}")))
}

/// Contents route of `path`, each segment percent-encoded.
fn contents_route(owner: &str, repo: &str, path: &str) -> String {
    let segments: Vec<_> = path.split('/').map(urlencoding::encode).collect();
    format!("/repos/{owner}/{repo}/contents/{}", segments.join("/"))
}

/// GitHub issues of one repository, accessed through octocrab.
pub struct OctocrabTracker {
    octocrab: Octocrab,
    owner: String,
    repo: String,
    milestones: Mutex<HashMap<String, u64>>,
}

#[derive(Debug, Deserialize)]
struct MilestoneEntry {
    number: u64,
    title: String,
}

impl OctocrabTracker {
    /// Optionally uses a personal access token for authentication.
    pub fn new(token: Option<String>, owner: &str, repo: &str) -> Result<Self> {
        Ok(Self::with_client(build_octocrab(token)?, owner, repo))
    }

    pub fn with_client(octocrab: Octocrab, owner: &str, repo: &str) -> Self {
        Self {
            octocrab,
            owner: owner.to_string(),
            repo: repo.to_string(),
            milestones: Mutex::new(HashMap::new()),
        }
    }

    fn cached_milestone(&self, title: &str) -> Option<u64> {
        self.milestones
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(title)
            .copied()
    }

    fn remember_milestone(&self, title: &str, number: u64) {
        self.milestones
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(title.to_string(), number);
    }

    async fn load_milestones(&self) -> Result<()> {
        let mut page = 1u32;
        loop {
            let route = format!(
                "/repos/{}/{}/milestones?state=all&per_page=100&page={page}",
                self.owner, self.repo
            );
            let entries: Vec<MilestoneEntry> = self
                .octocrab
                .get(route, None::<&()>)
                .await
                .map_err(|err| classify(err, "list milestones"))?;
            if entries.is_empty() {
                return Ok(());
            }
            for entry in entries {
                self.remember_milestone(&entry.title, entry.number);
            }
            page += 1;
        }
    }
}

fn to_remote(issue: octocrab::models::issues::Issue) -> RemoteIssue {
    RemoteIssue {
        number: issue.number,
        title: issue.title,
        body: issue.body,
        state: match issue.state {
            octocrab::models::IssueState::Closed => IssueState::Closed,
            _ => IssueState::Open,
        },
        labels: issue.labels.into_iter().map(|label| label.name).collect(),
        milestone: issue.milestone.map(|m| m.number as u64),
        is_pull_request: issue.pull_request.is_some(),
    }
}

#[async_trait]
impl IssueTracker for OctocrabTracker {
    async fn get_issue(&self, number: u64) -> Result<Option<RemoteIssue>> {
        match self
            .octocrab
            .issues(&self.owner, &self.repo)
            .get(number)
            .await
        {
            Ok(issue) => Ok(Some(to_remote(issue))),
            Err(err) => match classify(err, &format!("get issue #{number}")) {
                PushError::NotFound(_) => Ok(None),
                other => Err(other),
            },
        }
    }

    async fn create_issue(&self, title: &str) -> Result<RemoteIssue> {
        let issue = self
            .octocrab
            .issues(&self.owner, &self.repo)
            .create(title)
            .send()
            .await
            .map_err(|err| classify(err, "create issue"))?;
        Ok(to_remote(issue))
    }

    async fn update_issue(&self, number: u64, patch: &IssuePatch) -> Result<RemoteIssue> {
        let issues = self.octocrab.issues(&self.owner, &self.repo);
        let mut update = issues.update(number);
        if let Some(title) = &patch.title {
            update = update.title(title);
        }
        if let Some(body) = &patch.body {
            update = update.body(body);
        }
        if let Some(state) = patch.state {
            update = update.state(match state {
                IssueState::Open => octocrab::models::IssueState::Open,
                IssueState::Closed => octocrab::models::IssueState::Closed,
            });
        }
        if let Some(labels) = &patch.labels {
            update = update.labels(labels);
        }
        if let Some(milestone) = patch.milestone {
            update = update.milestone(milestone);
        }
        let issue = update
            .send()
            .await
            .map_err(|err| classify(err, &format!("update issue #{number}")))?;
        Ok(to_remote(issue))
    }

    async fn rate_limit(&self) -> Result<RateBudget> {
        let limits = self
            .octocrab
            .ratelimit()
            .get()
            .await
            .map_err(|err| classify(err, "read rate limit"))?;
        let core = limits.resources.core;
        Ok(RateBudget {
            remaining: core.remaining as u64,
            reset_at: DateTime::<Utc>::from_timestamp(core.reset as i64, 0)
                .unwrap_or_else(Utc::now),
        })
    }

    async fn find_or_create_milestone(&self, title: &str) -> Result<u64> {
        if let Some(number) = self.cached_milestone(title) {
            return Ok(number);
        }
        self.load_milestones().await?;
        if let Some(number) = self.cached_milestone(title) {
            return Ok(number);
        }

        let route = format!("/repos/{}/{}/milestones", self.owner, self.repo);
        let created: MilestoneEntry = self
            .octocrab
            .post(
                route,
                Some(&json!({ "title": title, "description": "Created automatically" })),
            )
            .await
            .map_err(|err| classify(err, "create milestone"))?;
        log::info!("created milestone '{}' (#{})", created.title, created.number);
        self.remember_milestone(&created.title, created.number);
        Ok(created.number)
    }

    async fn reserved_numbers(&self) -> Result<BTreeSet<u64>> {
        let mut numbers = BTreeSet::new();
        let mut page = self
            .octocrab
            .pulls(&self.owner, &self.repo)
            .list()
            .state(octocrab::params::State::All)
            .per_page(100)
            .send()
            .await
            .map_err(|err| classify(err, "list pull requests"))?;

        loop {
            numbers.extend(page.items.iter().map(|pr| pr.number));
            let next_page = self
                .octocrab
                .get_page(&page.next)
                .await
                .map_err(|err| classify(err, "list pull requests"))?;
            match next_page {
                Some(new_page) => page = new_page,
                None => break,
            }
        }
        Ok(numbers)
    }
}

/// Attachment storage in the file tree of a GitHub repository.
pub struct OctocrabContentStore {
    octocrab: Octocrab,
    owner: String,
    repo: String,
}

impl OctocrabContentStore {
    pub fn new(token: Option<String>, owner: &str, repo: &str) -> Result<Self> {
        Ok(Self::with_client(build_octocrab(token)?, owner, repo))
    }

    pub fn with_client(octocrab: Octocrab, owner: &str, repo: &str) -> Self {
        Self {
            octocrab,
            owner: owner.to_string(),
            repo: repo.to_string(),
        }
    }

    fn route(&self, path: &str) -> String {
        contents_route(&self.owner, &self.repo, path)
    }
}

#[async_trait]
impl ContentStore for OctocrabContentStore {
    async fn exists(&self, path: &str) -> Result<bool> {
        let result: std::result::Result<serde_json::Value, _> =
            self.octocrab.get(self.route(path), None::<&()>).await;
        match result {
            Ok(_) => Ok(true),
            Err(err) => match classify(err, &format!("look up {path}")) {
                PushError::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn put(&self, path: &str, content: &[u8], message: &str) -> Result<()> {
        let payload = json!({
            "message": message,
            "content": base64::engine::general_purpose::STANDARD.encode(content),
        });
        let _: serde_json::Value = self
            .octocrab
            .put(self.route(path), Some(&payload))
            .await
            .map_err(|err| classify(err, &format!("upload {path}")))?;
        Ok(())
    }

    fn link_for(&self, path: &str) -> String {
        format!(
            "https://api.github.com{}",
            self.route(path)
        )
    }
}
