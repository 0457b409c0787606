//! Watchdog: terminate silent minions and reconcile container reality
//! with the state store. A separate cleanup loop prunes dead containers,
//! and a slow sweep bounds the pending-question registry.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::minion::MinionStatus;
use crate::notify::DigestCategory;
use crate::overlord::Overlord;
use crate::runtime::ContainerStatus;

/// Log lines captured from a container that exited without reporting.
const EXIT_LOG_TAIL: usize = 50;

/// Watchdog task: heartbeat check + container reconciliation every tick.
pub(crate) async fn watchdog_loop(overlord: Arc<Overlord>) {
    info!("watchdog started");
    loop {
        heartbeat_pass(&overlord).await;
        reconcile_pass(&overlord).await;

        tokio::select! {
            _ = overlord.cancel.cancelled() => break,
            _ = tokio::time::sleep(overlord.config.watchdog_interval) => {}
        }
    }
    info!("watchdog stopped");
}

/// Kill and archive minions whose last heartbeat is older than the timeout.
pub(crate) async fn heartbeat_pass(overlord: &Overlord) {
    let Ok(timeout) = chrono::Duration::from_std(overlord.config.heartbeat_timeout) else {
        return;
    };
    let cutoff = Utc::now() - timeout;

    let active = match overlord.store.get_active().await {
        Ok(a) => a,
        Err(e) => {
            warn!("heartbeat pass skipped, store unreadable: {e}");
            return;
        }
    };

    for minion in active {
        // No heartbeat recorded yet means it only just started.
        let Some(heartbeat) = minion.last_heartbeat else {
            continue;
        };
        if heartbeat >= cutoff {
            continue;
        }

        warn!(
            "minion {} appears stuck (last heartbeat {heartbeat}); terminating",
            minion.id
        );
        overlord.runtime.kill(&minion.id).await;
        if let Err(e) = overlord
            .store
            .record_completion(
                &minion,
                MinionStatus::Timeout,
                None,
                Some("No heartbeat - terminated by watchdog"),
            )
            .await
        {
            warn!("archiving stuck minion {} failed: {e}", minion.id);
            continue;
        }
        overlord.questions.remove(&minion.id).await;
        overlord
            .notifier
            .send_urgent(&format!(
                "Minion `{}` on #{} went silent, terminated by watchdog",
                minion.id, minion.issue_number
            ))
            .await;
        overlord
            .notifier
            .accumulate(
                DigestCategory::Detection,
                format!("heartbeat timeout: {}#{}", minion.repo, minion.issue_number),
            )
            .await;
    }
}

/// Archive minions whose containers exited or disappeared without a report.
pub(crate) async fn reconcile_pass(overlord: &Overlord) {
    let active = match overlord.store.get_active().await {
        Ok(a) => a,
        Err(e) => {
            warn!("reconcile pass skipped, store unreadable: {e}");
            return;
        }
    };

    for minion in active {
        match overlord.runtime.status(&minion.id).await {
            ContainerStatus::Running => {}

            ContainerStatus::Exited => {
                warn!("minion {} container exited without reporting", minion.id);
                if let Some(logs) = overlord.runtime.logs(&minion.id, EXIT_LOG_TAIL).await {
                    debug!("container logs for {}:\n{logs}", minion.id);
                }
                overlord.runtime.kill(&minion.id).await;
                if let Err(e) = overlord
                    .store
                    .record_completion(
                        &minion,
                        MinionStatus::Failed,
                        None,
                        Some("Container exited unexpectedly"),
                    )
                    .await
                {
                    warn!("archiving exited minion {} failed: {e}", minion.id);
                    continue;
                }
                overlord.questions.remove(&minion.id).await;
                overlord
                    .notifier
                    .send_urgent(&format!(
                        "Minion `{}` on #{} container exited unexpectedly",
                        minion.id, minion.issue_number
                    ))
                    .await;
                overlord
                    .notifier
                    .accumulate(
                        DigestCategory::Detection,
                        format!("container exit: {}#{}", minion.repo, minion.issue_number),
                    )
                    .await;
            }

            ContainerStatus::Missing => {
                if overlord.config.stub_mode {
                    continue;
                }
                warn!("minion {} container not found", minion.id);
                if let Err(e) = overlord
                    .store
                    .record_completion(
                        &minion,
                        MinionStatus::Failed,
                        None,
                        Some("Container not found"),
                    )
                    .await
                {
                    warn!("archiving lost minion {} failed: {e}", minion.id);
                    continue;
                }
                overlord.questions.remove(&minion.id).await;
            }

            // Probe failed; no verdict this tick.
            ContainerStatus::Unknown => {}
        }
    }
}

/// Cleanup task: prune dead containers on its own, slower cadence.
pub(crate) async fn cleanup_loop(overlord: Arc<Overlord>) {
    loop {
        tokio::select! {
            _ = overlord.cancel.cancelled() => break,
            _ = tokio::time::sleep(overlord.config.cleanup_interval) => {}
        }
        let cleaned = overlord.runtime.cleanup_dead().await;
        if cleaned > 0 {
            info!("cleaned up {cleaned} dead containers");
            overlord
                .notifier
                .accumulate(
                    DigestCategory::HealthCheck,
                    format!("cleaned up {cleaned} dead containers"),
                )
                .await;
        }
    }
}

/// Question-registry sweep task.
pub(crate) async fn question_sweep_loop(overlord: Arc<Overlord>) {
    let interval = overlord.config.question_ttl.min(Duration::from_secs(600));
    loop {
        tokio::select! {
            _ = overlord.cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        sweep_questions(&overlord).await;
    }
}

/// Drop questions past their TTL. Before an unanswered one goes, poll its
/// thread once; a human reply that arrived while the webhook was down
/// still becomes the answer.
pub(crate) async fn sweep_questions(overlord: &Overlord) {
    for question in overlord.questions.expired(overlord.config.question_ttl).await {
        if !question.answered {
            let replies = overlord.chat.thread_history(&question.thread_ref).await;
            if let Some(reply) = replies.first() {
                if overlord
                    .questions
                    .record_answer(&question.minion_id, &reply.text)
                    .await
                {
                    info!(
                        "adopted missed thread reply as answer for {}",
                        question.minion_id
                    );
                    continue;
                }
            }
        }
        overlord.questions.remove(&question.minion_id).await;
        debug!("dropped expired question for {}", question.minion_id);
    }
}
