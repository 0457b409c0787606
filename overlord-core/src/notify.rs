//! Notification routing: urgent messages post immediately, everything else
//! accumulates into a periodic digest with typed counters. Either channel
//! can be disabled by configuration without affecting the other.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::chat::ChatPort;

/// Digest categories. A closed set so counters stay typed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DigestCategory {
    Detection,
    ProposalCreated,
    ProposalApproved,
    ProposalDenied,
    Execution,
    HealthCheck,
    TestSweep,
}

impl DigestCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Detection => "detection",
            Self::ProposalCreated => "proposal_created",
            Self::ProposalApproved => "proposal_approved",
            Self::ProposalDenied => "proposal_denied",
            Self::Execution => "execution",
            Self::HealthCheck => "health_check",
            Self::TestSweep => "test_sweep",
        }
    }
}

/// Accumulated counters for one digest period.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DigestStats {
    pub detections: u64,
    pub proposals_created: u64,
    pub proposals_approved: u64,
    pub proposals_denied: u64,
    pub executions: u64,
    pub health_checks: u64,
    pub test_sweeps: u64,
}

impl DigestStats {
    fn bump(&mut self, category: DigestCategory) {
        match category {
            DigestCategory::Detection => self.detections += 1,
            DigestCategory::ProposalCreated => self.proposals_created += 1,
            DigestCategory::ProposalApproved => self.proposals_approved += 1,
            DigestCategory::ProposalDenied => self.proposals_denied += 1,
            DigestCategory::Execution => self.executions += 1,
            DigestCategory::HealthCheck => self.health_checks += 1,
            DigestCategory::TestSweep => self.test_sweeps += 1,
        }
    }

    fn has_activity(self) -> bool {
        self != Self::default()
    }
}

#[derive(Debug, Clone)]
struct BufferedNotification {
    category: DigestCategory,
    message: String,
}

#[derive(Default)]
struct DigestBuffer {
    entries: Vec<BufferedNotification>,
    stats: DigestStats,
}

/// Max buffered messages shown per category in one digest.
const DIGEST_TAIL: usize = 5;

pub struct NotificationManager {
    chat: Arc<dyn ChatPort>,
    urgent_enabled: bool,
    digest_enabled: bool,
    buffer: Mutex<DigestBuffer>,
}

impl NotificationManager {
    pub fn new(chat: Arc<dyn ChatPort>, urgent_enabled: bool, digest_enabled: bool) -> Self {
        Self {
            chat,
            urgent_enabled,
            digest_enabled,
            buffer: Mutex::new(DigestBuffer::default()),
        }
    }

    /// Post a message immediately. Failures are swallowed by the chat port.
    pub async fn send_urgent(&self, message: &str) {
        if !self.urgent_enabled {
            debug!("urgent notification suppressed: {}", first_line(message));
            return;
        }
        self.chat.post(message, None).await;
        info!("urgent notification: {}", first_line(message));
    }

    /// Buffer a message for the next digest and bump its counter.
    pub async fn accumulate(&self, category: DigestCategory, message: impl Into<String>) {
        let mut buffer = self.buffer.lock().await;
        buffer.entries.push(BufferedNotification {
            category,
            message: message.into(),
        });
        buffer.stats.bump(category);
    }

    /// Format and send the accumulated digest, then clear the buffer.
    /// A period with no activity sends nothing.
    pub async fn send_digest(&self) {
        if !self.digest_enabled {
            debug!("digest suppressed");
            return;
        }

        let (message, count) = {
            let mut buffer = self.buffer.lock().await;
            if buffer.entries.is_empty() && !buffer.stats.has_activity() {
                info!("no activity to report in digest");
                return;
            }
            let message = format_digest(&buffer.entries, buffer.stats);
            let count = buffer.entries.len();
            buffer.entries.clear();
            buffer.stats = DigestStats::default();
            (message, count)
        };

        self.chat.post(&message, None).await;
        info!("digest sent ({count} buffered events)");
    }

    /// Number of buffered notifications.
    pub async fn buffer_size(&self) -> usize {
        self.buffer.lock().await.entries.len()
    }

    /// Current counters (read-only snapshot).
    pub async fn stats(&self) -> DigestStats {
        self.buffer.lock().await.stats
    }
}

fn format_digest(entries: &[BufferedNotification], stats: DigestStats) -> String {
    let mut lines = vec![
        format!("Overlord digest - {}", Utc::now().format("%b %d, %Y")),
        String::new(),
    ];

    let mut activity = Vec::new();
    if stats.detections > 0 {
        activity.push(format!("{} detections", stats.detections));
    }
    if stats.proposals_created > 0 {
        activity.push(format!("{} proposals", stats.proposals_created));
    }
    if stats.executions > 0 {
        activity.push(format!("{} executed", stats.executions));
    }
    if !activity.is_empty() {
        lines.push(format!("Activity: {}", activity.join(", ")));
    }

    let mut scheduled = Vec::new();
    if stats.health_checks > 0 {
        scheduled.push(format!("{} health checks", stats.health_checks));
    }
    if stats.test_sweeps > 0 {
        scheduled.push(format!("{} sweeps", stats.test_sweeps));
    }
    if !scheduled.is_empty() {
        lines.push(format!("Scheduled: {}", scheduled.join(", ")));
    }

    if !entries.is_empty() {
        lines.push(String::new());
        let mut by_category: Vec<(DigestCategory, Vec<&str>)> = Vec::new();
        for entry in entries {
            match by_category.iter_mut().find(|(c, _)| *c == entry.category) {
                Some((_, messages)) => messages.push(&entry.message),
                None => by_category.push((entry.category, vec![&entry.message])),
            }
        }
        by_category.sort_by_key(|(c, _)| *c);

        for (category, messages) in by_category {
            lines.push(format!("{}:", category.as_str()));
            let skipped = messages.len().saturating_sub(DIGEST_TAIL);
            for message in messages.iter().skip(skipped) {
                lines.push(format!("  - {message}"));
            }
            if skipped > 0 {
                lines.push(format!("  ... and {skipped} more"));
            }
        }
    }

    lines.join("\n")
}

fn first_line(message: &str) -> &str {
    message.lines().next().unwrap_or("")
}
