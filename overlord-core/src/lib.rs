//! Overlord: a long-running orchestrator that watches an issue queue,
//! dispatches sandboxed minion containers to handle items one at a time,
//! tracks their liveness and results, and exposes a chat command surface
//! plus an HTTP control plane.
//!
//! Component map:
//!   - `config`    - immutable configuration snapshot (env > file > default)
//!   - `error`     - typed domain errors (store, dispatch, config)
//!   - `minion`    - data model: minion records, history, queue items, questions
//!   - `store`     - SQLite-backed durable state (active / history / evaluations)
//!   - `queue`     - `QueueScanner` port + GitHub REST implementation
//!   - `runtime`   - `ContainerRuntime` port + docker CLI adapter + stub
//!   - `command`   - chat text → structured commands (pure)
//!   - `questions` - pending-question registry for blocked minions
//!   - `notify`    - urgent vs. digest notification routing
//!   - `chat`      - `ChatPort` + Slack adapter + inbound event model
//!   - `report`    - reporter endpoint (axum): lifecycle event ingestion
//!   - `watchdog`  - heartbeat enforcement + container reconciliation
//!   - `sched`     - cron-driven queue sweeps
//!   - `overlord`  - composition root, dispatch pipeline, lifecycle

pub mod chat;
pub mod command;
pub mod config;
pub mod error;
pub mod minion;
pub mod notify;
pub mod overlord;
pub mod queue;
pub mod questions;
pub mod report;
pub mod runtime;
pub mod sched;
pub mod store;
pub mod watchdog;

pub use config::OverlordConfig;
pub use error::{ConfigError, DispatchError, StoreError};
pub use minion::{Minion, MinionStatus};
pub use overlord::Overlord;

#[cfg(test)]
pub(crate) mod testutil {
    //! Shared harness: an Overlord wired to in-memory adapters and a
    //! throwaway state database.

    use std::sync::Arc;

    use tempfile::TempDir;

    use crate::chat::StubChat;
    use crate::config::OverlordConfig;
    use crate::minion::QueueItem;
    use crate::overlord::Overlord;
    use crate::queue::StubQueue;
    use crate::runtime::StubRuntime;

    pub(crate) struct TestHarness {
        pub overlord: Arc<Overlord>,
        pub runtime: Arc<StubRuntime>,
        pub queue: Arc<StubQueue>,
        pub chat: Arc<StubChat>,
        // Keeps the state db alive for the harness lifetime.
        _dir: TempDir,
    }

    pub(crate) async fn harness() -> TestHarness {
        harness_with(|_| {}).await
    }

    pub(crate) async fn harness_with(adjust: impl FnOnce(&mut OverlordConfig)) -> TestHarness {
        let dir = TempDir::new().expect("temp dir");
        let mut config =
            OverlordConfig::load_with_env(dir.path(), |_| None).expect("default config");
        // Chat is live in tests so channel filtering is exercised.
        config.chat_bot_token = Some("xoxb-test".to_string());
        config.chat_channel = Some("C123".to_string());
        adjust(&mut config);

        let runtime = Arc::new(StubRuntime::new());
        let queue = Arc::new(StubQueue::new());
        let chat = Arc::new(StubChat::new());
        let overlord = Overlord::new(
            config,
            runtime.clone(),
            Some(queue.clone()),
            chat.clone(),
        )
        .await
        .expect("harness overlord");

        TestHarness {
            overlord,
            runtime,
            queue,
            chat,
            _dir: dir,
        }
    }

    pub(crate) fn queue_item(repo: &str, number: u64, priority: i64) -> QueueItem {
        QueueItem {
            repo: repo.to_string(),
            number,
            title: format!("Issue {number}"),
            priority,
            labels: Vec::new(),
            created_at: None,
            url: None,
        }
    }
}
