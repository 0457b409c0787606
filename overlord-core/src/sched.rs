//! Cron-driven queue sweeps.
//!
//! The loop computes the next fire time from the configured expression and
//! sleeps towards it in slices of at most 60 seconds, so shutdown never
//! waits on a long sleep. A sweep dispatches minions for the top queue
//! items until the concurrency cap is reached; each dispatch is
//! transactional with best-effort rollback inside
//! [`Overlord::dispatch`](crate::overlord::Overlord::dispatch).

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::Utc;
use cron::Schedule;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::config::OverlordConfig;
use crate::error::DispatchError;
use crate::notify::DigestCategory;
use crate::overlord::Overlord;

/// Parse a cron expression, accepting the common 5-field form by
/// prepending a seconds column (the parser itself wants 6 or 7 fields).
pub fn normalize_cron(expr: &str) -> Result<Schedule> {
    let trimmed = expr.trim();
    let full = if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };
    Schedule::from_str(&full).map_err(|e| anyhow!("{e}"))
}

/// Background task: fire [`sweep`] on the configured schedule, then flush
/// the notification digest.
pub(crate) async fn cron_loop(overlord: Arc<Overlord>) {
    if !overlord.config.cron_enabled {
        info!("cron scheduler disabled");
        return;
    }
    let schedule = match normalize_cron(&overlord.config.cron_schedule) {
        Ok(s) => s,
        // validate() refuses this config; belt and braces for embedders.
        Err(e) => {
            error!("cron schedule `{}` invalid: {e}", overlord.config.cron_schedule);
            return;
        }
    };
    info!(
        "cron scheduler started with schedule: {}",
        overlord.config.cron_schedule
    );

    loop {
        let Some(next) = schedule.after(&Utc::now()).next() else {
            warn!("cron schedule has no future fire times; scheduler exiting");
            return;
        };
        debug!("next queue sweep at {next}");

        // Sleep towards the fire time in bounded slices.
        loop {
            let remaining = (next - Utc::now()).num_seconds();
            if remaining <= 0 {
                break;
            }
            let slice = Duration::from_secs((remaining as u64).min(60));
            tokio::select! {
                _ = overlord.cancel.cancelled() => {
                    info!("cron scheduler stopped");
                    return;
                }
                _ = tokio::time::sleep(slice) => {}
            }
        }

        sweep(&overlord).await;
        overlord.notifier.send_digest().await;
    }
}

/// One sweep: dispatch minions for pending queue items up to the cap.
pub(crate) async fn sweep(overlord: &Overlord) {
    if overlord.paused() {
        info!("queue sweep skipped - processing paused");
        return;
    }
    let Some(queue) = overlord.queue.clone() else {
        warn!("queue sweep skipped - no queue scanner configured");
        return;
    };
    if !overlord.runtime.available().await {
        warn!("queue sweep skipped - container runtime unavailable");
        return;
    }

    let active = match overlord.store.active_count().await {
        Ok(n) => n,
        Err(e) => {
            error!("queue sweep aborted, store unreadable: {e}");
            return;
        }
    };
    let slots = overlord.config.max_concurrent.saturating_sub(active);
    if slots == 0 {
        info!("queue sweep: no available slots ({active} active)");
        return;
    }

    info!("starting queue sweep ({slots} slots)");
    let items = queue.scan().await;
    *overlord.queue_cache.write().await = items.clone();
    if items.is_empty() {
        info!("queue sweep complete - no pending issues");
        return;
    }

    // Cold LLM backends add minutes to the first minion's work; warm once
    // per sweep, never per dispatch.
    warm_up_llm(&overlord.config).await;

    let mut spawned = 0usize;
    for item in &items {
        if spawned >= slots {
            break;
        }
        match overlord.dispatch(&item.repo, item.number).await {
            Ok(minion_id) => {
                spawned += 1;
                overlord
                    .notifier
                    .send_urgent(&format!("Spawning minion `{minion_id}` for {item}"))
                    .await;
            }
            Err(DispatchError::AlreadyActive { .. }) => {
                debug!("skipping {item} - already in progress");
            }
            Err(DispatchError::CapReached(_)) => break,
            Err(e) => warn!("failed to dispatch {item}: {e}"),
        }
    }

    overlord
        .notifier
        .accumulate(
            DigestCategory::TestSweep,
            format!("sweep dispatched {spawned} of {} pending", items.len()),
        )
        .await;
    info!("queue sweep complete - spawned {spawned} minions");
}

/// Nudge the LLM backend awake with a minimal request. Failure is only a
/// warning; minions retry on their own.
pub(crate) async fn warm_up_llm(config: &OverlordConfig) -> bool {
    let Some(base_url) = &config.llm_base_url else {
        return false;
    };
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            warn!("LLM warm-up client unavailable: {e}");
            return false;
        }
    };

    // Models listing is the cheapest probe.
    if let Ok(resp) = client.get(format!("{base_url}/models")).send().await {
        if resp.status().is_success() {
            info!("LLM warm-up: models endpoint OK");
            return true;
        }
    }

    // Fall back to a one-token completion.
    let payload = json!({
        "model": config.llm_model,
        "messages": [{ "role": "user", "content": "hi" }],
        "max_tokens": 1,
    });
    match client
        .post(format!("{base_url}/chat/completions"))
        .json(&payload)
        .send()
        .await
    {
        Ok(resp) if resp.status().is_success() => {
            info!("LLM warm-up: completion request OK");
            true
        }
        Ok(resp) => {
            warn!("LLM warm-up: status {}", resp.status());
            false
        }
        Err(e) => {
            warn!("LLM warm-up failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::minion::MinionStatus;
    use crate::queue::QueueMark;
    use crate::testutil::{harness, harness_with, queue_item};

    // ── normalize_cron ─────────────────────────────────────────────────────

    #[test]
    fn five_field_expression_accepted() {
        let schedule = normalize_cron("0 2 * * *").unwrap();
        let next = schedule.after(&Utc::now()).next().unwrap();
        assert_eq!(next.format("%H:%M:%S").to_string(), "02:00:00");
    }

    #[test]
    fn six_field_expression_passes_through() {
        assert!(normalize_cron("30 0 2 * * *").is_ok());
    }

    #[test]
    fn garbage_expression_rejected() {
        assert!(normalize_cron("whenever").is_err());
        assert!(normalize_cron("").is_err());
    }

    // ── sweep ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn happy_path_dispatches_one_minion() {
        let h = harness().await;
        h.queue.set_items(vec![queue_item("o/r", 42, 0)]);

        sweep(&h.overlord).await;

        let active = h.overlord.store.get_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].issue_number, 42);
        assert_eq!(active[0].status, MinionStatus::Starting);

        assert!(h
            .chat
            .posts()
            .iter()
            .any(|p| p.text.starts_with("Spawning minion")));
        assert!(h
            .queue
            .marks()
            .contains(&QueueMark::InProgress { repo: "o/r".to_string(), number: 42 }));
    }

    #[tokio::test]
    async fn empty_queue_is_a_no_op() {
        let h = harness().await;
        sweep(&h.overlord).await;
        assert!(h.overlord.store.get_active().await.unwrap().is_empty());
        assert!(!h
            .chat
            .posts()
            .iter()
            .any(|p| p.text.starts_with("Spawning minion")));
    }

    #[tokio::test]
    async fn runtime_outage_skips_sweep_without_state_change() {
        let h = harness().await;
        h.queue.set_items(vec![queue_item("o/r", 42, 0)]);
        h.runtime.set_available(false);

        sweep(&h.overlord).await;

        assert!(h.overlord.store.get_active().await.unwrap().is_empty());
        assert!(h.queue.marks().is_empty());
        assert!(h.chat.posts().is_empty());
    }

    #[tokio::test]
    async fn paused_sweep_dispatches_nothing() {
        let h = harness().await;
        h.queue.set_items(vec![queue_item("o/r", 42, 0)]);
        h.overlord.set_paused(true);

        sweep(&h.overlord).await;
        assert!(h.overlord.store.get_active().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn burst_respects_cap_in_queue_order() {
        let h = harness_with(|cfg| cfg.max_concurrent = 2).await;
        h.queue.set_items(vec![
            queue_item("o/r", 1, 0),
            queue_item("o/r", 2, 0),
            queue_item("o/r", 3, 0),
            queue_item("o/r", 4, 0),
            queue_item("o/r", 5, 0),
        ]);

        sweep(&h.overlord).await;

        let active = h.overlord.store.get_active().await.unwrap();
        let issues: Vec<u64> = active.iter().map(|m| m.issue_number).collect();
        assert_eq!(issues.len(), 2);
        assert!(issues.contains(&1) && issues.contains(&2));

        // Next tick with the cap still consumed: zero further spawns.
        sweep(&h.overlord).await;
        assert_eq!(h.overlord.store.get_active().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn higher_priority_items_dispatch_first() {
        let h = harness_with(|cfg| cfg.max_concurrent = 1).await;
        h.queue.set_items(vec![
            queue_item("o/r", 1, 0),
            queue_item("o/r", 2, 2),
        ]);

        sweep(&h.overlord).await;

        let active = h.overlord.store.get_active().await.unwrap();
        assert_eq!(active[0].issue_number, 2);
    }

    #[tokio::test]
    async fn already_active_items_are_skipped_not_fatal() {
        let h = harness_with(|cfg| cfg.max_concurrent = 3).await;
        h.overlord.dispatch("o/r", 1).await.unwrap();
        h.queue
            .set_items(vec![queue_item("o/r", 1, 0), queue_item("o/r", 2, 0)]);

        sweep(&h.overlord).await;

        let active = h.overlord.store.get_active().await.unwrap();
        assert_eq!(active.len(), 2);
    }

    #[tokio::test]
    async fn sweep_caches_scan_result_for_queue_endpoint() {
        let h = harness().await;
        h.queue.set_items(vec![queue_item("o/r", 42, 0)]);

        sweep(&h.overlord).await;
        let cached = h.overlord.queue_cache.read().await.clone();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].number, 42);
    }
}
