//! Chooses the transaction fetch window for one account.
//!
//! | since last successful sync | window                      | reason              |
//! |----------------------------|-----------------------------|---------------------|
//! | never                      | backfill by account kind    | `initial_backfill`  |
//! | < 1 hour                   | skip (forced: incremental)  | `recently_synced`   |
//! | 1 hour to 7 days           | `[last - 1 day, now]`       | `incremental`       |
//! | 7 to 30 days               | `[last - 7 days, now]`      | `moderate_gap`      |
//! | > 30 days                  | backfill by account kind    | `long_gap_backfill` |

use banksync_core::{AccountKind, InternalAccount, SyncWindow};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowReason {
    InitialBackfill,
    RecentlySynced,
    Incremental,
    ModerateGap,
    LongGapBackfill,
    Override,
}

impl WindowReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InitialBackfill => "initial_backfill",
            Self::RecentlySynced => "recently_synced",
            Self::Incremental => "incremental",
            Self::ModerateGap => "moderate_gap",
            Self::LongGapBackfill => "long_gap_backfill",
            Self::Override => "override",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowPlan {
    Skip { reason: WindowReason },
    Fetch { window: SyncWindow, reason: WindowReason },
}

impl WindowPlan {
    pub fn reason(&self) -> WindowReason {
        match self {
            Self::Skip { reason } | Self::Fetch { reason, .. } => *reason,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanOptions {
    pub force: bool,
    pub window_override: Option<SyncWindow>,
    pub max_count: Option<u32>,
}

pub fn backfill_days(kind: AccountKind) -> i64 {
    match kind {
        AccountKind::Checking | AccountKind::Operating | AccountKind::Other => 90,
        AccountKind::Savings => 180,
        AccountKind::CreditCard | AccountKind::Loan => 365,
    }
}

pub fn plan_window(
    account: &InternalAccount,
    now: DateTime<Utc>,
    options: &PlanOptions,
) -> WindowPlan {
    plan_for(account.kind, account.last_synced_at, now, options)
}

pub fn plan_for(
    kind: AccountKind,
    last_sync: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    options: &PlanOptions,
) -> WindowPlan {
    if let Some(requested) = options.window_override {
        let (start, end) = if requested.start <= requested.end {
            (requested.start, requested.end)
        } else {
            (requested.end, requested.start)
        };
        return WindowPlan::Fetch {
            window: SyncWindow {
                start,
                end,
                max_count: requested.max_count.or(options.max_count),
            },
            reason: WindowReason::Override,
        };
    }

    let fetch = |start: DateTime<Utc>, reason| WindowPlan::Fetch {
        window: SyncWindow {
            start,
            end: now,
            max_count: options.max_count,
        },
        reason,
    };
    let backfill = now - Duration::days(backfill_days(kind));

    let Some(last) = last_sync else {
        return fetch(backfill, WindowReason::InitialBackfill);
    };

    // A last-sync stamp in the future counts as "just synced".
    let anchor = last.min(now);
    let elapsed = now - anchor;

    if elapsed < Duration::hours(1) {
        if options.force {
            return fetch(anchor - Duration::days(1), WindowReason::Incremental);
        }
        return WindowPlan::Skip {
            reason: WindowReason::RecentlySynced,
        };
    }
    if elapsed <= Duration::days(7) {
        return fetch(anchor - Duration::days(1), WindowReason::Incremental);
    }
    if elapsed <= Duration::days(30) {
        return fetch(anchor - Duration::days(7), WindowReason::ModerateGap);
    }
    fetch(backfill, WindowReason::LongGapBackfill)
}
