#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use gitpusher::client::{
    ContentStore, IssuePatch, IssueState, IssueTracker, RateBudget, RemoteIssue,
};
use gitpusher::pacing::{Clock, PushSettings, RetryPolicy, Sleeper};
use gitpusher::{PushContext, PushError};
use tigrisfetcher::models::{
    parse_timestamp, Attachment, AttachmentPayload, Comment, IssueStatus, IssueType, RelationKind,
    Relationship, SourceRecord,
};
use tigrisfetcher::{FetchError, TrackerSource};

pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += chrono::Duration::from_std(by).unwrap();
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Records requested sleeps and moves the manual clock forward instead of
/// waiting.
pub struct RecordingSleeper {
    clock: Arc<ManualClock>,
    pub sleeps: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new(clock: Arc<ManualClock>) -> Self {
        Self {
            clock,
            sleeps: Mutex::new(Vec::new()),
        }
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap().push(duration);
        self.clock.advance(duration);
    }
}

#[derive(Default)]
pub struct TrackerState {
    pub issues: BTreeMap<u64, RemoteIssue>,
    pub pulls: BTreeSet<u64>,
    pub next_number: u64,
    pub milestones: Vec<String>,
    /// Transient failures injected into the next update calls.
    pub failing_updates: u32,
    /// Quota values returned by successive rate-limit reads; 5000 once empty.
    pub quotas: VecDeque<u64>,
    /// An outside actor files an issue right before our next create.
    pub steal_next_create: bool,
    pub creates: u32,
    pub updates: u32,
}

pub struct MockIssueTracker {
    pub state: Mutex<TrackerState>,
    clock: Arc<ManualClock>,
}

impl MockIssueTracker {
    pub fn new(clock: Arc<ManualClock>, pulls: &[u64]) -> Self {
        let state = TrackerState {
            pulls: pulls.iter().copied().collect(),
            next_number: 1,
            ..TrackerState::default()
        };
        Self {
            state: Mutex::new(state),
            clock,
        }
    }

    pub fn issue(&self, number: u64) -> Option<RemoteIssue> {
        self.state.lock().unwrap().issues.get(&number).cloned()
    }

    fn take_number(state: &mut TrackerState) -> u64 {
        while state.pulls.contains(&state.next_number) {
            state.next_number += 1;
        }
        let number = state.next_number;
        state.next_number += 1;
        number
    }
}

fn open_issue(number: u64, title: &str) -> RemoteIssue {
    RemoteIssue {
        number,
        title: title.to_string(),
        body: None,
        state: IssueState::Open,
        labels: Vec::new(),
        milestone: None,
        is_pull_request: false,
    }
}

#[async_trait]
impl IssueTracker for MockIssueTracker {
    async fn get_issue(&self, number: u64) -> gitpusher::Result<Option<RemoteIssue>> {
        let state = self.state.lock().unwrap();
        if state.pulls.contains(&number) {
            let mut pr = open_issue(number, "some pull request");
            pr.is_pull_request = true;
            return Ok(Some(pr));
        }
        Ok(state.issues.get(&number).cloned())
    }

    async fn create_issue(&self, title: &str) -> gitpusher::Result<RemoteIssue> {
        let mut state = self.state.lock().unwrap();
        if state.steal_next_create {
            state.steal_next_create = false;
            let number = Self::take_number(&mut state);
            state.issues.insert(number, open_issue(number, "filed by someone else"));
        }
        let number = Self::take_number(&mut state);
        let issue = open_issue(number, title);
        state.issues.insert(number, issue.clone());
        state.creates += 1;
        Ok(issue)
    }

    async fn update_issue(
        &self,
        number: u64,
        patch: &IssuePatch,
    ) -> gitpusher::Result<RemoteIssue> {
        let mut state = self.state.lock().unwrap();
        if state.failing_updates > 0 {
            state.failing_updates -= 1;
            return Err(PushError::transient(
                format!("update issue #{number}"),
                "502 Bad Gateway",
            ));
        }
        state.updates += 1;
        let issue = state
            .issues
            .get_mut(&number)
            .ok_or_else(|| PushError::NotFound(format!("issue #{number}")))?;
        if let Some(title) = &patch.title {
            issue.title = title.clone();
        }
        if let Some(body) = &patch.body {
            issue.body = Some(body.clone());
        }
        if let Some(s) = patch.state {
            issue.state = s;
        }
        if let Some(labels) = &patch.labels {
            issue.labels = labels.clone();
        }
        if let Some(milestone) = patch.milestone {
            issue.milestone = Some(milestone);
        }
        Ok(issue.clone())
    }

    async fn rate_limit(&self) -> gitpusher::Result<RateBudget> {
        let remaining = self.state.lock().unwrap().quotas.pop_front().unwrap_or(5000);
        Ok(RateBudget {
            remaining,
            reset_at: self.clock.now() + chrono::Duration::seconds(60),
        })
    }

    async fn find_or_create_milestone(&self, title: &str) -> gitpusher::Result<u64> {
        let mut state = self.state.lock().unwrap();
        if let Some(pos) = state.milestones.iter().position(|m| m == title) {
            return Ok(pos as u64 + 1);
        }
        state.milestones.push(title.to_string());
        Ok(state.milestones.len() as u64)
    }

    async fn reserved_numbers(&self) -> gitpusher::Result<BTreeSet<u64>> {
        Ok(self.state.lock().unwrap().pulls.clone())
    }
}

#[derive(Default)]
pub struct MockContentStore {
    pub files: Mutex<BTreeMap<String, Vec<u8>>>,
    pub puts: Mutex<u32>,
}

#[async_trait]
impl ContentStore for MockContentStore {
    async fn exists(&self, path: &str) -> gitpusher::Result<bool> {
        Ok(self.files.lock().unwrap().contains_key(path))
    }

    async fn put(&self, path: &str, content: &[u8], _message: &str) -> gitpusher::Result<()> {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), content.to_vec());
        *self.puts.lock().unwrap() += 1;
        Ok(())
    }

    fn link_for(&self, path: &str) -> String {
        format!("https://files.example/{path}")
    }
}

/// Serves attachment payloads, failing transiently a configurable number of
/// times first.
#[derive(Default)]
pub struct MockSource {
    pub transient_failures: Mutex<u32>,
    pub fetches: Mutex<u32>,
}

#[async_trait]
impl TrackerSource for MockSource {
    async fn issue_exists(&self, _id: u64) -> tigrisfetcher::Result<bool> {
        Ok(false)
    }

    async fn export_range(&self, _first: u64, _last: u64) -> tigrisfetcher::Result<Vec<u8>> {
        Ok(Vec::new())
    }

    async fn fetch_attachment(&self, attachment: &Attachment) -> tigrisfetcher::Result<Vec<u8>> {
        *self.fetches.lock().unwrap() += 1;
        let mut failures = self.transient_failures.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Err(FetchError::Status {
                status: 503,
                body: "busy".into(),
            });
        }
        match &attachment.payload {
            Some(AttachmentPayload::Inline(data)) => tigrisfetcher::client::decode_inline(data),
            _ => Err(FetchError::AttachmentUnavailable {
                attach_id: attachment.attach_id.clone(),
            }),
        }
    }
}

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub sleeper: Arc<RecordingSleeper>,
    pub tracker: Arc<MockIssueTracker>,
    pub content: Arc<MockContentStore>,
    pub source: Arc<MockSource>,
}

impl Harness {
    pub fn new(pulls: &[u64]) -> Self {
        let clock = Arc::new(ManualClock::new());
        Self {
            sleeper: Arc::new(RecordingSleeper::new(clock.clone())),
            tracker: Arc::new(MockIssueTracker::new(clock.clone(), pulls)),
            content: Arc::new(MockContentStore::default()),
            source: Arc::new(MockSource::default()),
            clock,
        }
    }

    pub fn context(&self, settings: PushSettings) -> PushContext {
        PushContext::new(self.tracker.clone(), self.content.clone(), self.source.clone())
            .with_clock(self.clock.clone())
            .with_sleeper(self.sleeper.clone())
            .with_settings(settings)
            .with_resume(false)
    }
}

/// Settings without spacing between calls, so only retry sleeps are recorded.
pub fn quiet_settings() -> PushSettings {
    PushSettings {
        min_interval: Duration::ZERO,
        retry: RetryPolicy::linear(5, Duration::from_secs(10)),
        attachment_retry: RetryPolicy::fixed(10, Duration::from_secs(2)),
        ..PushSettings::default()
    }
}

pub fn ts(raw: &str) -> chrono::NaiveDateTime {
    parse_timestamp(raw).unwrap()
}

pub fn record(id: u64, title: &str) -> SourceRecord {
    SourceRecord {
        id,
        status: IssueStatus::New,
        resolution: None,
        issue_type: IssueType::Defect,
        priority: None,
        title: title.to_string(),
        reporter: Some("reporter".into()),
        assignee: None,
        component: None,
        subcomponent: None,
        version: None,
        platform: None,
        op_sys: None,
        target_milestone: None,
        keywords: Vec::new(),
        file_location: None,
        votes: None,
        created_at: ts("2001-01-01 10:00:00"),
        last_activity: ts("2001-06-01 10:00:00"),
        comments: vec![Comment {
            author: "reporter".into(),
            created_at: ts("2001-01-01 10:00:00"),
            text: format!("description of {title}"),
        }],
        attachments: Vec::new(),
        relationships: Vec::new(),
    }
}

pub fn with_attachment(mut record: SourceRecord, attach_id: &str, data: &str) -> SourceRecord {
    record.attachments.push(Attachment {
        attach_id: attach_id.to_string(),
        filename: "notes.txt".into(),
        submitter: Some("uploader".into()),
        description: None,
        mime_type: Some("text/plain".into()),
        created_at: ts("2001-01-02 00:00:00"),
        payload: Some(AttachmentPayload::Inline(data.to_string())),
    });
    record
}

pub fn with_edge(
    mut record: SourceRecord,
    kind: RelationKind,
    target: &str,
    when: &str,
) -> SourceRecord {
    record.relationships.push(Relationship {
        kind,
        author: "linker".into(),
        created_at: ts(when),
        target: target.to_string(),
    });
    record
}
