use tokio::sync::mpsc::{channel, error::TrySendError, Sender, UnboundedSender};
use tracing::{error, info};
use uuid::Uuid;

use super::limiter::UsageLimiter;

const USAGE_EVENT_BUFFER: usize = 256;

/// key: usage-events -> post-success metering
#[derive(Debug, Clone)]
pub enum UsageEvent {
    Increment {
        user_id: String,
        action: String,
        run_id: Uuid,
    },
}

/// What the worker did with one event. Failures here never reach the caller that
/// produced the event; they are logged and reported for reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsageEventReport {
    Recorded {
        user_id: String,
        action: String,
        run_id: Uuid,
        count: u64,
    },
    Failed {
        user_id: String,
        action: String,
        run_id: Uuid,
        error: String,
    },
}

/// key: usage-events-handle -> non-blocking enqueue interface
#[derive(Clone)]
pub struct UsageEventHandle {
    sender: Sender<UsageEvent>,
}

impl UsageEventHandle {
    /// Never waits. A full or closed queue drops the event with an error log.
    pub fn record(&self, event: UsageEvent) {
        if let Err(err) = self.sender.try_send(event) {
            let (reason, event) = match err {
                TrySendError::Full(event) => ("queue full", event),
                TrySendError::Closed(event) => ("worker stopped", event),
            };
            let UsageEvent::Increment {
                user_id,
                action,
                run_id,
            } = event;
            error!(
                %user_id,
                %action,
                %run_id,
                reason,
                "usage event dropped; counter needs reconciliation",
            );
        }
    }
}

pub fn start_usage_worker(
    limiter: UsageLimiter,
    reports: Option<UnboundedSender<UsageEventReport>>,
) -> UsageEventHandle {
    let (tx, mut rx) = channel(USAGE_EVENT_BUFFER);
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let report = match event {
                UsageEvent::Increment {
                    user_id,
                    action,
                    run_id,
                } => match limiter.increment_usage(&user_id, &action).await {
                    Ok(counter) => {
                        info!(
                            %user_id,
                            %action,
                            %run_id,
                            count = counter.count,
                            period = %counter.period,
                            "usage recorded"
                        );
                        UsageEventReport::Recorded {
                            user_id,
                            action,
                            run_id,
                            count: counter.count,
                        }
                    }
                    Err(err) => {
                        error!(
                            ?err,
                            %user_id,
                            %action,
                            %run_id,
                            "failed to record usage; counter needs reconciliation",
                        );
                        UsageEventReport::Failed {
                            user_id,
                            action,
                            run_id,
                            error: err.to_string(),
                        }
                    }
                },
            };
            if let Some(reports) = &reports {
                let _ = reports.send(report);
            }
        }
    });

    UsageEventHandle { sender: tx }
}
