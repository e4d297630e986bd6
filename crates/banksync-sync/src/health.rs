//! Connection health: weighted recent success rates minus a consecutive-failure penalty.

use banksync_core::{Connection, ConnectionStatus, ProviderError, SyncError, SyncJobStatus};
use banksync_storage::BackoffPolicy;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HealthPolicy {
    pub weight_30d: f64,
    pub weight_7d: f64,
    pub failure_penalty: f64,
    pub penalty_cap: u32,
    /// Consecutive failed jobs that force the connection into `error`.
    pub error_threshold: u32,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            weight_30d: 0.30,
            weight_7d: 0.70,
            failure_penalty: 0.05,
            penalty_cap: 5,
            error_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthBand {
    Excellent,
    Good,
    Fair,
    Poor,
    Critical,
}

impl HealthBand {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.90 {
            Self::Excellent
        } else if score >= 0.75 {
            Self::Good
        } else if score >= 0.50 {
            Self::Fair
        } else if score >= 0.25 {
            Self::Poor
        } else {
            Self::Critical
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Fair => "fair",
            Self::Poor => "poor",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub connection_id: Uuid,
    pub score: f64,
    pub band: HealthBand,
    pub status: ConnectionStatus,
    pub consecutive_failures: u32,
    pub success_rate_7d: f64,
    pub success_rate_30d: f64,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub next_sync_at: Option<DateTime<Utc>>,
}

/// What made a job fail, as far as health and rescheduling care.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Auth,
    Transient { retry_after_secs: Option<u64> },
    Other,
}

impl FailureKind {
    pub fn of(err: &SyncError) -> Self {
        match err {
            SyncError::Provider(ProviderError::Auth(_)) => Self::Auth,
            SyncError::Provider(ProviderError::RateLimited {
                retry_after_secs, ..
            }) => Self::Transient {
                retry_after_secs: *retry_after_secs,
            },
            SyncError::Provider(ProviderError::Unavailable(_)) => Self::Transient {
                retry_after_secs: None,
            },
            _ => Self::Other,
        }
    }
}

/// Completed jobs count 1, partial 0.5, failed 0. No jobs in the window reads as fully healthy.
pub fn success_rate(outcomes: &[(DateTime<Utc>, SyncJobStatus)], since: DateTime<Utc>) -> f64 {
    let mut total = 0usize;
    let mut credit = 0.0;
    for (finished_at, status) in outcomes {
        if *finished_at < since {
            continue;
        }
        let weight = match status {
            SyncJobStatus::Completed => 1.0,
            SyncJobStatus::Partial => 0.5,
            SyncJobStatus::Failed => 0.0,
            SyncJobStatus::Pending | SyncJobStatus::Running => continue,
        };
        total += 1;
        credit += weight;
    }
    if total == 0 {
        1.0
    } else {
        credit / total as f64
    }
}

pub fn compute_score(
    policy: &HealthPolicy,
    rate_30d: f64,
    rate_7d: f64,
    consecutive_failures: u32,
) -> f64 {
    let penalty = policy.failure_penalty * consecutive_failures.min(policy.penalty_cap) as f64;
    (policy.weight_30d * rate_30d + policy.weight_7d * rate_7d - penalty).clamp(0.0, 1.0)
}

#[derive(Debug, Clone)]
pub struct HealthTracker {
    policy: HealthPolicy,
    backoff: BackoffPolicy,
    sync_interval: Duration,
}

impl HealthTracker {
    pub fn new(policy: HealthPolicy, backoff: BackoffPolicy, sync_interval: Duration) -> Self {
        Self {
            policy,
            backoff,
            sync_interval,
        }
    }

    pub fn policy(&self) -> &HealthPolicy {
        &self.policy
    }

    pub fn report(
        &self,
        connection: &Connection,
        outcomes: &[(DateTime<Utc>, SyncJobStatus)],
        now: DateTime<Utc>,
    ) -> HealthReport {
        let rate_30d = success_rate(outcomes, now - Duration::days(30));
        let rate_7d = success_rate(outcomes, now - Duration::days(7));
        let score = compute_score(&self.policy, rate_30d, rate_7d, connection.consecutive_failures);
        HealthReport {
            connection_id: connection.id,
            score,
            band: HealthBand::from_score(score),
            status: connection.status,
            consecutive_failures: connection.consecutive_failures,
            success_rate_7d: rate_7d,
            success_rate_30d: rate_30d,
            last_sync_at: connection.last_sync_at,
            next_sync_at: connection.next_sync_at,
        }
    }

    /// Apply a finished job to the connection: counters, status escalation, next run, score.
    ///
    /// `outcomes` must already include the job being recorded.
    pub fn record_outcome(
        &self,
        connection: &mut Connection,
        status: SyncJobStatus,
        failure: Option<FailureKind>,
        outcomes: &[(DateTime<Utc>, SyncJobStatus)],
        now: DateTime<Utc>,
    ) -> HealthReport {
        match status {
            SyncJobStatus::Completed | SyncJobStatus::Partial => {
                connection.consecutive_failures = 0;
                connection.last_sync_at = Some(now);
                connection.next_sync_at = Some(now + self.sync_interval);
                if connection.status == ConnectionStatus::PendingSetup {
                    connection.status = ConnectionStatus::Active;
                }
            }
            SyncJobStatus::Failed => {
                connection.consecutive_failures = connection.consecutive_failures.saturating_add(1);
                let auth = failure == Some(FailureKind::Auth);
                if auth || connection.consecutive_failures >= self.policy.error_threshold {
                    connection.status = ConnectionStatus::Error;
                    connection.next_sync_at = None;
                } else {
                    let delay = self.retry_delay(connection.consecutive_failures, failure);
                    connection.next_sync_at = Some(now + delay);
                }
            }
            SyncJobStatus::Pending | SyncJobStatus::Running => {}
        }

        let report = self.report(connection, outcomes, now);
        connection.health_score = report.score;
        connection.updated_at = now;
        report
    }

    fn retry_delay(&self, consecutive_failures: u32, failure: Option<FailureKind>) -> Duration {
        let attempt = consecutive_failures.saturating_sub(1) as usize;
        let backoff = Duration::from_std(self.backoff.delay_for_attempt(attempt))
            .unwrap_or(self.sync_interval);
        match failure {
            Some(FailureKind::Transient {
                retry_after_secs: Some(secs),
            }) => backoff.max(Duration::seconds(secs as i64)),
            _ => backoff,
        }
    }
}
