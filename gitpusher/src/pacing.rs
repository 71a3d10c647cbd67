//! Time-related capabilities of a push run: sleeping, reading the clock,
//! retry schedules and rate-limit discipline.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mstorage::catalog::Catalog;
use mstorage::models::ApiBudget;

use crate::client::IssueTracker;
use crate::error::Result;

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// `attempt * delay`
    Linear,
    Fixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn linear(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay: base_delay,
            backoff: Backoff::Linear,
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            backoff: Backoff::Fixed,
        }
    }

    /// Pause after the failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Linear => self.delay.saturating_mul(attempt),
            Backoff::Fixed => self.delay,
        }
    }
}

/// Pacing knobs of a push run.
#[derive(Debug, Clone, Copy)]
pub struct PushSettings {
    /// Sleep until the quota resets once fewer requests than this remain.
    pub rate_threshold: u64,
    pub reset_margin: Duration,
    /// Minimum spacing between two mutating calls.
    pub min_interval: Duration,
    pub retry: RetryPolicy,
    pub attachment_retry: RetryPolicy,
}

impl Default for PushSettings {
    fn default() -> Self {
        Self {
            rate_threshold: 50,
            reset_margin: Duration::from_secs(5),
            min_interval: Duration::from_secs(1),
            retry: RetryPolicy::linear(5, Duration::from_secs(10)),
            attachment_retry: RetryPolicy::fixed(10, Duration::from_secs(2)),
        }
    }
}

/// Catalog key of the GitHub core quota.
pub const BUDGET_ENDPOINT: &str = "github.core";

/// Gate in front of every mutating destination call.
pub struct RateGuard {
    settings: PushSettings,
    last_mutation: Mutex<Option<DateTime<Utc>>>,
    catalog: Option<Arc<Catalog>>,
}

impl RateGuard {
    pub fn new(settings: PushSettings) -> Self {
        Self {
            settings,
            last_mutation: Mutex::new(None),
            catalog: None,
        }
    }

    /// Records every observed quota in the catalog.
    pub fn with_catalog(mut self, catalog: Arc<Catalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    fn last_mutation(&self) -> Option<DateTime<Utc>> {
        *self
            .last_mutation
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Waits out the minimum spacing and, if the quota is nearly spent, the
    /// remainder of the rate-limit window.
    pub async fn before_mutation(
        &self,
        tracker: &dyn IssueTracker,
        clock: &dyn Clock,
        sleeper: &dyn Sleeper,
    ) -> Result<()> {
        if let Some(last) = self.last_mutation() {
            let elapsed = (clock.now() - last).to_std().unwrap_or(Duration::ZERO);
            if elapsed < self.settings.min_interval {
                sleeper.sleep(self.settings.min_interval - elapsed).await;
            }
        }

        let budget = tracker.rate_limit().await?;
        if let Some(catalog) = &self.catalog {
            let record = ApiBudget {
                api_endpoint: BUDGET_ENDPOINT.to_string(),
                requests_left: budget.remaining as i64,
                reset_time: budget.reset_at.timestamp(),
            };
            if let Err(err) = catalog.upsert_api_budget(&record) {
                log::warn!("failed to record API budget: {err}");
            }
        }

        if budget.remaining < self.settings.rate_threshold {
            let until_reset = (budget.reset_at - clock.now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            let wait = until_reset + self.settings.reset_margin;
            log::warn!(
                "{} requests left, sleeping {}s until the rate limit resets",
                budget.remaining,
                wait.as_secs()
            );
            sleeper.sleep(wait).await;
        }
        Ok(())
    }

    /// Marks the end of a mutating call, whatever its outcome.
    pub fn after_mutation(&self, clock: &dyn Clock) {
        *self
            .last_mutation
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(clock.now());
    }
}
