//! Pending-question registry.
//!
//! In-memory map from minion id to its open clarification and the chat
//! thread that will answer it. The registry exclusively owns entries;
//! minions only observe them through the `/minion/answer/{id}` poll.
//! Entries are dropped when answered workers terminate and swept once
//! older than the configured TTL to bound memory.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::minion::PendingQuestion;

/// What a polling minion sees. An unknown minion id polls as unanswered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnswerPoll {
    pub answered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
}

#[derive(Default)]
pub struct QuestionRegistry {
    inner: RwLock<HashMap<String, PendingQuestion>>,
}

impl QuestionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or refresh a question. A repeated `question` event from the
    /// same minion replaces its entry; any stale entry holding the same
    /// thread ref is dropped so thread refs stay unique.
    pub async fn upsert(&self, question: PendingQuestion) {
        let mut inner = self.inner.write().await;
        inner.retain(|id, q| *id == question.minion_id || q.thread_ref != question.thread_ref);
        inner.insert(question.minion_id.clone(), question);
    }

    /// Record the answer for the question bound to `thread_ref`.
    ///
    /// Returns the minion id when this reply answered the question. Replies
    /// to unknown threads or to already-answered questions are ignored and
    /// leave the stored answer unchanged.
    pub async fn answer_by_thread(&self, thread_ref: &str, answer: &str) -> Option<String> {
        let mut inner = self.inner.write().await;
        let q = inner
            .values_mut()
            .find(|q| q.thread_ref == thread_ref && !q.answered)?;
        q.answered = true;
        q.answer = Some(answer.to_string());
        Some(q.minion_id.clone())
    }

    /// Record an answer found out-of-band (thread-history rescue). The
    /// entry's age is reset so the minion gets a window to poll it.
    pub async fn record_answer(&self, minion_id: &str, answer: &str) -> bool {
        let mut inner = self.inner.write().await;
        match inner.get_mut(minion_id) {
            Some(q) if !q.answered => {
                q.answered = true;
                q.answer = Some(answer.to_string());
                q.created_at = Utc::now();
                true
            }
            _ => false,
        }
    }

    /// Poll result for a minion. Unknown ids are simply unanswered.
    pub async fn poll(&self, minion_id: &str) -> AnswerPoll {
        let inner = self.inner.read().await;
        match inner.get(minion_id) {
            Some(q) if q.answered => AnswerPoll {
                answered: true,
                answer: q.answer.clone(),
            },
            _ => AnswerPoll {
                answered: false,
                answer: None,
            },
        }
    }

    /// Drop the entry for a minion (worker completed, failed, or stopped).
    pub async fn remove(&self, minion_id: &str) -> Option<PendingQuestion> {
        self.inner.write().await.remove(minion_id)
    }

    /// All current entries, for the `/status` endpoint.
    pub async fn snapshot(&self) -> Vec<PendingQuestion> {
        let mut all: Vec<_> = self.inner.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }

    /// Entries older than `ttl`, answered or not.
    pub async fn expired(&self, ttl: Duration) -> Vec<PendingQuestion> {
        let Ok(ttl) = chrono::Duration::from_std(ttl) else {
            return Vec::new();
        };
        let cutoff = Utc::now() - ttl;
        self.inner
            .read()
            .await
            .values()
            .filter(|q| q.created_at < cutoff)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn question(minion_id: &str, thread_ref: &str) -> PendingQuestion {
        PendingQuestion {
            minion_id: minion_id.to_string(),
            question_id: format!("q-{minion_id}"),
            issue_number: 42,
            repo: "owner/repo".to_string(),
            question_text: "Which endpoint?".to_string(),
            thread_ref: thread_ref.to_string(),
            answered: false,
            answer: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn unknown_minion_polls_unanswered() {
        let reg = QuestionRegistry::new();
        let poll = reg.poll("minion-nobody").await;
        assert!(!poll.answered);
        assert!(poll.answer.is_none());
    }

    #[tokio::test]
    async fn thread_reply_answers_question() {
        let reg = QuestionRegistry::new();
        reg.upsert(question("minion-1", "t1")).await;

        let who = reg.answer_by_thread("t1", "Use /users").await;
        assert_eq!(who.as_deref(), Some("minion-1"));

        let poll = reg.poll("minion-1").await;
        assert!(poll.answered);
        assert_eq!(poll.answer.as_deref(), Some("Use /users"));
    }

    #[tokio::test]
    async fn second_reply_does_not_overwrite_answer() {
        let reg = QuestionRegistry::new();
        reg.upsert(question("minion-1", "t1")).await;

        reg.answer_by_thread("t1", "first").await;
        assert_eq!(reg.answer_by_thread("t1", "second").await, None);

        let poll = reg.poll("minion-1").await;
        assert_eq!(poll.answer.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn reply_to_unknown_thread_ignored() {
        let reg = QuestionRegistry::new();
        reg.upsert(question("minion-1", "t1")).await;
        assert_eq!(reg.answer_by_thread("t-elsewhere", "hm").await, None);
        assert!(!reg.poll("minion-1").await.answered);
    }

    #[tokio::test]
    async fn upsert_replaces_entry_for_same_minion() {
        let reg = QuestionRegistry::new();
        reg.upsert(question("minion-1", "t1")).await;
        reg.upsert(question("minion-1", "t2")).await;

        assert_eq!(reg.len().await, 1);
        assert_eq!(reg.answer_by_thread("t1", "late").await, None);
        assert_eq!(
            reg.answer_by_thread("t2", "yes").await.as_deref(),
            Some("minion-1")
        );
    }

    #[tokio::test]
    async fn upsert_evicts_stale_entry_sharing_thread_ref() {
        let reg = QuestionRegistry::new();
        reg.upsert(question("minion-1", "t1")).await;
        reg.upsert(question("minion-2", "t1")).await;

        assert_eq!(reg.len().await, 1);
        assert_eq!(
            reg.answer_by_thread("t1", "a").await.as_deref(),
            Some("minion-2")
        );
    }

    #[tokio::test]
    async fn remove_drops_entry_unconditionally() {
        let reg = QuestionRegistry::new();
        reg.upsert(question("minion-1", "t1")).await;
        reg.answer_by_thread("t1", "done").await;

        assert!(reg.remove("minion-1").await.is_some());
        assert_eq!(reg.len().await, 0);
        assert!(reg.remove("minion-1").await.is_none());
    }

    #[tokio::test]
    async fn expired_honours_ttl() {
        let reg = QuestionRegistry::new();
        let mut old = question("minion-old", "t-old");
        old.created_at = Utc::now() - chrono::Duration::hours(2);
        reg.upsert(old).await;
        reg.upsert(question("minion-new", "t-new")).await;

        let expired = reg.expired(Duration::from_secs(3600)).await;
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].minion_id, "minion-old");
    }

    #[tokio::test]
    async fn record_answer_resets_age() {
        let reg = QuestionRegistry::new();
        let mut old = question("minion-1", "t1");
        old.created_at = Utc::now() - chrono::Duration::hours(2);
        reg.upsert(old).await;

        assert!(reg.record_answer("minion-1", "rescued").await);
        assert!(reg.expired(Duration::from_secs(3600)).await.is_empty());
        assert_eq!(
            reg.poll("minion-1").await.answer.as_deref(),
            Some("rescued")
        );
    }

    #[tokio::test]
    async fn record_answer_refuses_answered_entry() {
        let reg = QuestionRegistry::new();
        reg.upsert(question("minion-1", "t1")).await;
        reg.answer_by_thread("t1", "first").await;
        assert!(!reg.record_answer("minion-1", "second").await);
    }
}
