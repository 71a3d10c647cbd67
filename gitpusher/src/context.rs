use std::future::Future;
use std::sync::Arc;

use mstorage::catalog::Catalog;
use tigrisfetcher::models::Attachment;
use tigrisfetcher::TrackerSource;

use crate::client::{ContentStore, IssueTracker};
use crate::compose::LabelDefaults;
use crate::error::{PushError, Result};
use crate::pacing::{Clock, PushSettings, RateGuard, Sleeper, SystemClock, TokioSleeper};

/// Capabilities and settings shared by every record of a push or link run.
pub struct PushContext {
    pub tracker: Arc<dyn IssueTracker>,
    pub content: Arc<dyn ContentStore>,
    pub source: Arc<dyn TrackerSource>,
    pub sleeper: Arc<dyn Sleeper>,
    pub clock: Arc<dyn Clock>,
    pub settings: PushSettings,
    pub labels: LabelDefaults,
    pub catalog: Option<Arc<Catalog>>,
    /// Skip records the catalog already reports as done.
    pub resume: bool,
    guard: RateGuard,
}

impl PushContext {
    pub fn new(
        tracker: Arc<dyn IssueTracker>,
        content: Arc<dyn ContentStore>,
        source: Arc<dyn TrackerSource>,
    ) -> Self {
        let settings = PushSettings::default();
        Self {
            tracker,
            content,
            source,
            sleeper: Arc::new(TokioSleeper),
            clock: Arc::new(SystemClock),
            settings,
            labels: LabelDefaults::default(),
            catalog: None,
            resume: true,
            guard: RateGuard::new(settings),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_settings(mut self, settings: PushSettings) -> Self {
        self.settings = settings;
        self.rebuild_guard();
        self
    }

    pub fn with_labels(mut self, labels: LabelDefaults) -> Self {
        self.labels = labels;
        self
    }

    pub fn with_catalog(mut self, catalog: Arc<Catalog>) -> Self {
        self.catalog = Some(catalog);
        self.rebuild_guard();
        self
    }

    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    fn rebuild_guard(&mut self) {
        let guard = RateGuard::new(self.settings);
        self.guard = match &self.catalog {
            Some(catalog) => guard.with_catalog(catalog.clone()),
            None => guard,
        };
    }

    pub fn link_for(&self, attachment: &Attachment) -> String {
        self.content.link_for(&attachment.content_path())
    }

    /// Runs one mutating destination call behind the rate guard.
    pub async fn mutate<T, F, Fut>(&self, call: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.guard
            .before_mutation(self.tracker.as_ref(), self.clock.as_ref(), self.sleeper.as_ref())
            .await?;
        let outcome = call().await;
        self.guard.after_mutation(self.clock.as_ref());
        outcome
    }

    /// Repeats `op` on transient failures with the configured backoff.
    pub async fn with_retry<T, F, Fut>(
        &self,
        source_id: u64,
        destination_id: u64,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let policy = self.settings.retry;
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                    let delay = policy.delay_for(attempt);
                    log::warn!(
                        "source {source_id} -> #{destination_id}: attempt {attempt} failed ({err}), retrying in {}s",
                        delay.as_secs()
                    );
                    self.sleeper.sleep(delay).await;
                    attempt += 1;
                }
                Err(err) if err.is_transient() => {
                    return Err(PushError::Exhausted {
                        source_id,
                        destination_id,
                        operation: err.operation().to_string(),
                        attempts: attempt,
                        last_error: err.to_string(),
                    });
                }
                Err(err) => return Err(err),
            }
        }
    }
}
