//! The Overlord: composition root and lifecycle owner.
//!
//! Holds every component by its port, so nothing reaches back into the
//! orchestrator: the reporter endpoint, watchdog, cron scheduler, and chat
//! router all receive an `Arc<Overlord>` and call narrow methods on it.
//! The dispatch pipeline here is the single path through which minions are
//! started, shared by chat `work` commands and cron sweeps.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::chat::{ChatEvent, ChatPort, NoopChat, SlackChat};
use crate::command::{Command, CommandKind, CommandParser};
use crate::config::OverlordConfig;
use crate::error::DispatchError;
use crate::minion::{Minion, MinionStatus, PendingQuestion, QueueItem};
use crate::notify::{DigestCategory, NotificationManager};
use crate::queue::{GitHubQueue, QueueScanner};
use crate::questions::QuestionRegistry;
use crate::report::{EventKind, MinionReport, ReportError};
use crate::runtime::{ContainerRuntime, ContainerStatus, DockerCli, StubRuntime};
use crate::store::{MinionUpdate, StateStore};
use crate::{sched, watchdog};

/// Buffered inbound chat events awaiting the router task.
const CHAT_QUEUE_DEPTH: usize = 64;

pub struct Overlord {
    pub(crate) config: OverlordConfig,
    pub(crate) store: StateStore,
    pub(crate) runtime: Arc<dyn ContainerRuntime>,
    pub(crate) queue: Option<Arc<dyn QueueScanner>>,
    pub(crate) chat: Arc<dyn ChatPort>,
    pub(crate) parser: CommandParser,
    pub(crate) questions: QuestionRegistry,
    pub(crate) notifier: NotificationManager,
    pub(crate) paused: AtomicBool,
    /// Last queue scan, served by `GET /queue`.
    pub(crate) queue_cache: RwLock<Vec<QueueItem>>,
    pub(crate) chat_tx: mpsc::Sender<ChatEvent>,
    chat_rx: Mutex<Option<mpsc::Receiver<ChatEvent>>>,
    pub(crate) cancel: CancellationToken,
}

impl Overlord {
    /// Wire an Overlord from explicitly constructed adapters.
    ///
    /// Validates the configuration and opens the state store; both are
    /// fatal on failure.
    pub async fn new(
        config: OverlordConfig,
        runtime: Arc<dyn ContainerRuntime>,
        queue: Option<Arc<dyn QueueScanner>>,
        chat: Arc<dyn ChatPort>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let store = StateStore::open(&config.state_db)
            .await
            .context("cannot open state store")?;

        let parser = CommandParser::new(config.default_repo.clone());
        let notifier = NotificationManager::new(
            chat.clone(),
            config.urgent_notifications,
            config.digest_notifications,
        );
        let (chat_tx, chat_rx) = mpsc::channel(CHAT_QUEUE_DEPTH);

        Ok(Arc::new(Self {
            config,
            store,
            runtime,
            queue,
            chat,
            parser,
            questions: QuestionRegistry::new(),
            notifier,
            paused: AtomicBool::new(false),
            queue_cache: RwLock::new(Vec::new()),
            chat_tx,
            chat_rx: Mutex::new(Some(chat_rx)),
            cancel: CancellationToken::new(),
        }))
    }

    /// Build the standard adapter set from the config snapshot: docker CLI
    /// (or the stub in stub mode), the GitHub queue when repositories are
    /// watched, and Slack when chat credentials are present.
    pub async fn from_config(config: OverlordConfig) -> Result<Arc<Self>> {
        let runtime: Arc<dyn ContainerRuntime> = if config.stub_mode {
            info!("stub mode: container runtime calls are simulated");
            Arc::new(StubRuntime::new())
        } else {
            Arc::new(DockerCli::from_config(&config))
        };

        let queue: Option<Arc<dyn QueueScanner>> = match (&config.github_token, &config.watched_repos) {
            (Some(token), repos) if !repos.is_empty() => Some(Arc::new(GitHubQueue::new(
                token.clone(),
                repos.clone(),
                config.labels.clone(),
            ))),
            _ => None,
        };

        let chat: Arc<dyn ChatPort> = match (&config.chat_bot_token, &config.chat_channel) {
            (Some(token), Some(channel)) => {
                Arc::new(SlackChat::new(token.clone(), channel.clone()))
            }
            _ => {
                info!("chat credentials absent; notifications disabled");
                Arc::new(NoopChat)
            }
        };

        Self::new(config, runtime, queue, chat).await
    }

    /// Hand the inbound chat receiver to the router task. Yields `Some`
    /// exactly once per process.
    pub(crate) async fn take_chat_rx(&self) -> Option<mpsc::Receiver<ChatEvent>> {
        self.chat_rx.lock().await.take()
    }

    pub fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    /// Request shutdown; `run` unwinds all background tasks and returns.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    // ── Dispatch pipeline ─────────────────────────────────────────────────

    /// Start one minion for one issue.
    ///
    /// Pipeline: runtime available → cap free → issue not already worked →
    /// spawn → insert record → mark in-progress. A failed insert rolls the
    /// container back; a failed label transition is logged and tolerated.
    pub async fn dispatch(&self, repo: &str, issue_number: u64) -> Result<String, DispatchError> {
        if !self.runtime.available().await {
            return Err(DispatchError::RuntimeUnavailable);
        }
        let active = self.store.active_count().await.map_err(DispatchError::Store)?;
        if active >= self.config.max_concurrent {
            return Err(DispatchError::CapReached(self.config.max_concurrent));
        }
        if let Some(existing) = self
            .store
            .get_by_issue(repo, issue_number)
            .await
            .map_err(DispatchError::Store)?
        {
            return Err(DispatchError::AlreadyActive {
                repo: repo.to_string(),
                issue_number,
                minion_id: existing.id,
            });
        }

        let minion_id = self
            .runtime
            .spawn(repo, issue_number)
            .await
            .map_err(|e| DispatchError::Spawn(e.to_string()))?;

        let minion = Minion::dispatched(&minion_id, repo, issue_number);
        if let Err(e) = self.store.add_minion(&minion).await {
            // The container is orphaned without its record; take it down.
            self.runtime.kill(&minion_id).await;
            return Err(e.into());
        }

        if let Some(queue) = &self.queue {
            if let Err(e) = queue.mark_in_progress(repo, issue_number).await {
                warn!("mark in-progress failed for {repo}#{issue_number}: {e:#}");
            }
        }

        info!("dispatched minion {minion_id} for {repo}#{issue_number}");
        Ok(minion_id)
    }

    /// Kill a minion's container and archive it as manually stopped.
    async fn stop_minion(&self, minion: &Minion) {
        self.runtime.kill(&minion.id).await;
        if let Err(e) = self
            .store
            .record_completion(
                minion,
                MinionStatus::Failed,
                None,
                Some("Manually stopped by user"),
            )
            .await
        {
            warn!("archiving stopped minion {} failed: {e}", minion.id);
        }
        self.questions.remove(&minion.id).await;
    }

    // ── Start-up reconciliation ───────────────────────────────────────────

    /// Reconcile persisted state with actual containers: any active record
    /// whose container no longer runs is archived as failed.
    pub async fn sync_active(&self) {
        let active = match self.store.get_active().await {
            Ok(a) => a,
            Err(e) => {
                error!("sync_active could not read store: {e}");
                return;
            }
        };
        for minion in active {
            match self.runtime.status(&minion.id).await {
                ContainerStatus::Running => {}
                ContainerStatus::Exited | ContainerStatus::Missing => {
                    warn!(
                        "minion {} has no running container; archiving as failed",
                        minion.id
                    );
                    self.runtime.kill(&minion.id).await;
                    if let Err(e) = self
                        .store
                        .record_completion(
                            &minion,
                            MinionStatus::Failed,
                            None,
                            Some("Container not found"),
                        )
                        .await
                    {
                        warn!("archiving {} failed: {e}", minion.id);
                    }
                }
                // Probe failure says nothing about the container; leave it.
                ContainerStatus::Unknown => {}
            }
        }
    }

    // ── Minion report handling ────────────────────────────────────────────

    pub(crate) async fn handle_report(&self, report: MinionReport) -> Result<(), ReportError> {
        let minion = self
            .store
            .get(&report.minion_id)
            .await
            .map_err(ReportError::internal)?
            .ok_or(ReportError::UnknownMinion)?;
        let now = Utc::now();
        let issue = report.issue.unwrap_or(minion.issue_number);

        match report.event {
            EventKind::Heartbeat => {
                self.store
                    .update_minion(&report.minion_id, MinionUpdate::heartbeat(now))
                    .await
                    .map_err(ReportError::internal)?;
            }

            EventKind::Progress => {
                self.store
                    .update_minion(&report.minion_id, MinionUpdate::working(now))
                    .await
                    .map_err(ReportError::internal)?;
                let message = report.message.unwrap_or_default();
                self.notifier
                    .send_urgent(&format!(
                        "Minion `{}` on #{issue}: {message}",
                        report.minion_id
                    ))
                    .await;
            }

            EventKind::Question => {
                // A blocked minion is still alive; keep the watchdog away.
                self.store
                    .update_minion(&report.minion_id, MinionUpdate::heartbeat(now))
                    .await
                    .map_err(ReportError::internal)?;

                let text = report
                    .message
                    .unwrap_or_else(|| "needs input".to_string());
                let thread_ref = self
                    .chat
                    .post_question(
                        &report.minion_id,
                        minion.issue_number,
                        &text,
                        self.config.timeout_minutes,
                    )
                    .await;
                match thread_ref {
                    Some(thread_ref) => {
                        self.questions
                            .upsert(PendingQuestion {
                                minion_id: report.minion_id.clone(),
                                question_id: Uuid::new_v4().simple().to_string(),
                                issue_number: minion.issue_number,
                                repo: minion.repo.clone(),
                                question_text: text,
                                thread_ref,
                                answered: false,
                                answer: None,
                                created_at: now,
                            })
                            .await;
                    }
                    None => warn!(
                        "question from {} could not be posted to chat; not registered",
                        report.minion_id
                    ),
                }
            }

            EventKind::Complete => {
                let pr_number = report
                    .data
                    .get("pr_number")
                    .and_then(Value::as_u64);
                let pr_url = report
                    .data
                    .get("pr_url")
                    .and_then(Value::as_str)
                    .map(str::to_string);

                match self
                    .store
                    .record_completion(&minion, MinionStatus::Completed, pr_number, None)
                    .await
                {
                    Ok(_) => {}
                    Err(crate::error::StoreError::AlreadyArchived(_)) => {
                        debug!("duplicate complete report for {}", report.minion_id);
                        return Ok(());
                    }
                    Err(e) => return Err(ReportError::internal(e)),
                }

                if let (Some(queue), Some(pr)) = (&self.queue, pr_number) {
                    if let Err(e) = queue.mark_in_review(&minion.repo, minion.issue_number, pr).await
                    {
                        warn!("mark in-review failed for {}: {e:#}", minion.repo);
                    }
                }

                let mut msg = format!("Minion `{}` completed #{issue}", report.minion_id);
                if let Some(url) = pr_url {
                    msg.push_str(&format!("\n-> {url}"));
                } else if let Some(pr) = pr_number {
                    msg.push_str(&format!(" -> PR #{pr}"));
                }
                self.notifier.send_urgent(&msg).await;
                self.notifier
                    .accumulate(
                        DigestCategory::Execution,
                        format!("completed {}#{}", minion.repo, minion.issue_number),
                    )
                    .await;

                self.questions.remove(&report.minion_id).await;
                self.runtime.kill(&report.minion_id).await;
            }

            EventKind::Error => {
                let error_type = report
                    .data
                    .get("error_type")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                let details = report
                    .data
                    .get("details")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let message = report.message.unwrap_or_default();
                let error_msg = format!("{error_type}: {message}");

                match self
                    .store
                    .record_completion(&minion, MinionStatus::Failed, None, Some(&error_msg))
                    .await
                {
                    Ok(_) => {}
                    Err(crate::error::StoreError::AlreadyArchived(_)) => {
                        debug!("duplicate error report for {}", report.minion_id);
                        return Ok(());
                    }
                    Err(e) => return Err(ReportError::internal(e)),
                }

                if let Some(queue) = &self.queue {
                    if let Err(e) = queue
                        .mark_failed(&minion.repo, minion.issue_number, &error_msg)
                        .await
                    {
                        warn!("mark failed on {} not applied: {e:#}", minion.repo);
                    }
                }

                let mut msg = format!(
                    "Minion `{}` failed on #{issue}: {message}",
                    report.minion_id
                );
                if !details.is_empty() {
                    let cut = details.chars().take(200).collect::<String>();
                    msg.push_str(&format!("\n> {cut}"));
                }
                self.notifier.send_urgent(&msg).await;
                self.notifier
                    .accumulate(
                        DigestCategory::Execution,
                        format!("failed {}#{}", minion.repo, minion.issue_number),
                    )
                    .await;

                self.questions.remove(&report.minion_id).await;
                self.runtime.kill(&report.minion_id).await;
            }
        }
        Ok(())
    }

    // ── Chat handling ─────────────────────────────────────────────────────

    /// Process one inbound chat event. Returns the reply that was posted,
    /// if any (commands always reply; thread replies ack into the thread).
    pub async fn handle_chat_event(&self, event: ChatEvent) -> Option<String> {
        match event {
            ChatEvent::ChannelMessage {
                channel,
                user,
                text,
                from_bot,
            } => {
                if from_bot || text.is_empty() {
                    return None;
                }
                match &self.config.chat_channel {
                    Some(configured) if *configured == channel => {}
                    _ => return None,
                }
                debug!("channel message from {user}: {text}");
                let reply = self.handle_command(self.parser.parse(&text)).await;
                self.chat.post(&reply, None).await;
                Some(reply)
            }

            ChatEvent::Mention {
                user,
                text,
                from_bot,
            } => {
                if from_bot || text.is_empty() {
                    return None;
                }
                debug!("mentioned by {user}: {text}");
                let reply = self.handle_command(self.parser.parse(&text)).await;
                self.chat.post(&reply, None).await;
                Some(reply)
            }

            ChatEvent::ThreadReply {
                thread_ref,
                user,
                text,
                from_bot,
            } => {
                if from_bot || text.is_empty() {
                    return None;
                }
                let minion_id = self.questions.answer_by_thread(&thread_ref, &text).await?;
                info!("answer from {user} recorded for {minion_id}");
                let ack = format!("Got it - answer passed to minion `{minion_id}`.");
                self.chat.post(&ack, Some(&thread_ref)).await;
                Some(ack)
            }
        }
    }

    /// Execute a parsed command and produce the user-facing reply. Every
    /// command replies; user errors come back as plain text, never logs.
    pub async fn handle_command(&self, command: Command) -> String {
        match command.kind {
            CommandKind::Status => self.handle_status().await,
            CommandKind::Work => self.handle_work(&command).await,
            CommandKind::Stop => self.handle_stop(&command).await,
            CommandKind::Queue => self.handle_queue().await,
            CommandKind::Pause => {
                if self.paused() {
                    "Queue processing is already paused.".to_string()
                } else {
                    self.set_paused(true);
                    "Queue processing paused. Active minions will continue.".to_string()
                }
            }
            CommandKind::Resume => {
                if self.paused() {
                    self.set_paused(false);
                    "Queue processing resumed.".to_string()
                } else {
                    "Queue processing is already running.".to_string()
                }
            }
            CommandKind::History => self.handle_history().await,
            CommandKind::Help => self.parser.format_help(),
            CommandKind::Ping => "pong".to_string(),
            CommandKind::Unknown => format!(
                "I don't understand: `{}`\nType `help` to see available commands.",
                command.raw
            ),
        }
    }

    async fn handle_status(&self) -> String {
        let minions = match self.store.get_active().await {
            Ok(m) => m,
            Err(e) => return format!("Could not read state: {e}"),
        };

        if minions.is_empty() {
            let queue_state = if self.paused() { "paused" } else { "idle" };
            let runtime_state = if self.runtime.available().await {
                "available"
            } else {
                "unavailable"
            };
            return format!("No active minions. Queue is {queue_state}. Runtime: {runtime_state}");
        }

        let mut lines = vec![format!("Active minions ({}):", minions.len())];
        for minion in &minions {
            let container = self.runtime.status(&minion.id).await;
            let mut status = format!("({}", minion.status);
            if !matches!(container, ContainerStatus::Running) {
                status.push_str(&format!(", container: {container:?}").to_lowercase());
            }
            status.push(')');
            lines.push(format!(
                "- `{}` {}#{} {status}",
                minion.id, minion.repo, minion.issue_number
            ));
        }
        if self.paused() {
            lines.push("Queue processing is paused.".to_string());
        }
        lines.join("\n")
    }

    async fn handle_work(&self, command: &Command) -> String {
        let Some(repo) = &command.repo else {
            return "Specify a repository (e.g. `work on owner/repo#42`)".to_string();
        };
        let Some(issue_number) = command.issue_number else {
            return "Specify an issue number (e.g. `work on #42`)".to_string();
        };

        match self.dispatch(repo, issue_number).await {
            Ok(minion_id) => {
                format!("Spawning minion `{minion_id}` to work on {repo}#{issue_number}")
            }
            Err(e) => e.to_string(),
        }
    }

    async fn handle_stop(&self, command: &Command) -> String {
        if let Some(minion_id) = &command.minion_id {
            let minion = match self.store.get(minion_id).await {
                Ok(Some(m)) => m,
                Ok(None) => return format!("Minion `{minion_id}` not found"),
                Err(e) => return format!("Could not read state: {e}"),
            };
            self.stop_minion(&minion).await;
            return format!("Stopped minion `{minion_id}`");
        }

        if let Some(issue_number) = command.issue_number {
            let Some(repo) = command
                .repo
                .clone()
                .or_else(|| self.config.default_repo.clone())
            else {
                return "Specify a repository or set a default".to_string();
            };
            let minion = match self.store.get_by_issue(&repo, issue_number).await {
                Ok(Some(m)) => m,
                Ok(None) => return format!("No minion working on {repo}#{issue_number}"),
                Err(e) => return format!("Could not read state: {e}"),
            };
            self.stop_minion(&minion).await;
            return format!(
                "Stopped minion `{}` (was working on #{issue_number})",
                minion.id
            );
        }

        "Specify an issue number or minion id to stop".to_string()
    }

    async fn handle_queue(&self) -> String {
        let Some(queue) = &self.queue else {
            return "No watched repositories configured.".to_string();
        };

        let items = queue.scan().await;
        *self.queue_cache.write().await = items.clone();

        if items.is_empty() {
            return format!(
                "Pending work queue is empty (no `{}` issues found).",
                self.config.labels.ready
            );
        }

        let mut lines = vec![format!("Pending work queue ({} issues):", items.len())];
        for item in items.iter().take(10) {
            let marker = if item.priority > 0 { "!" } else { "-" };
            lines.push(format!("{marker} {item}: {}", item.title));
        }
        if items.len() > 10 {
            lines.push(format!("... and {} more", items.len() - 10));
        }
        if let Some(rate) = queue.rate_limit().await {
            lines.push(format!(
                "API: {}/{} requests remaining",
                rate.remaining, rate.limit
            ));
        }
        lines.join("\n")
    }

    async fn handle_history(&self) -> String {
        let history = match self.store.history(None, None, 10).await {
            Ok(h) => h,
            Err(e) => return format!("Could not read history: {e}"),
        };
        if history.is_empty() {
            return "No work history yet.".to_string();
        }

        let mut lines = vec!["Recent work:".to_string()];
        for entry in history {
            let pr = entry
                .pr_number
                .map(|n| format!(" -> PR #{n}"))
                .unwrap_or_default();
            lines.push(format!(
                "- [{}] {}#{}{pr}",
                entry.status, entry.repo, entry.issue_number
            ));
        }
        lines.join("\n")
    }

    // ── HTTP snapshots ────────────────────────────────────────────────────

    pub(crate) async fn health_snapshot(&self) -> Value {
        let active = self.store.active_count().await.unwrap_or(0);
        json!({
            "status": "healthy",
            "active_minions": active,
            "paused": self.paused(),
            "docker_available": self.runtime.available().await,
        })
    }

    pub(crate) async fn status_snapshot(&self) -> Value {
        let minions = self.store.get_active().await.unwrap_or_default();
        let containers = self.runtime.list().await;
        let questions = self.questions.snapshot().await;
        json!({
            "status": "healthy",
            "paused": self.paused(),
            "docker_available": self.runtime.available().await,
            "active_minions": minions,
            "docker_containers": containers,
            "pending_questions": questions,
            "config": {
                "max_concurrent": self.config.max_concurrent,
                "timeout_minutes": self.config.timeout_minutes,
                "watched_repos": self.config.watched_repos,
                "cron_schedule": self.config.cron_schedule,
            },
        })
    }

    pub(crate) async fn queue_snapshot(&self) -> Value {
        json!({
            "paused": self.paused(),
            "items": *self.queue_cache.read().await,
        })
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────

    fn startup_notice(&self) -> String {
        let cron = if self.config.cron_enabled {
            format!("enabled ({})", self.config.cron_schedule)
        } else {
            "disabled".to_string()
        };
        let repos = if self.config.watched_repos.is_empty() {
            "none".to_string()
        } else {
            self.config.watched_repos.join(", ")
        };
        format!(
            "Overlord online. Type `help` for commands.\n\
             Queue processing: {}\n\
             Max concurrent minions: {}\n\
             Cron: {cron}\n\
             Watched repos: {repos}",
            if self.paused() { "paused" } else { "active" },
            self.config.max_concurrent,
        )
    }

    /// Run until [`shutdown`](Self::shutdown) is called (typically from a
    /// signal handler).
    ///
    /// Start-up: network → reconcile → reporter endpoint → background
    /// tasks → chat router → startup notice. Shutdown unwinds in reverse:
    /// tasks observe the cancellation token, the HTTP server drains.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        info!("starting overlord");

        if !self.config.stub_mode {
            self.runtime
                .ensure_network()
                .await
                .context("container network unavailable")?;
            self.sync_active().await;
        }

        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.health_port));
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("cannot bind reporter endpoint on {addr}"))?;
        info!("reporter endpoint listening on {addr}");

        let app = crate::report::router(self.clone());
        let server_cancel = self.cancel.clone();
        let mut tasks = vec![tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(server_cancel.cancelled_owned())
                .await
            {
                error!("reporter endpoint failed: {e}");
            }
        })];

        tasks.push(tokio::spawn(watchdog::watchdog_loop(self.clone())));
        tasks.push(tokio::spawn(watchdog::cleanup_loop(self.clone())));
        tasks.push(tokio::spawn(watchdog::question_sweep_loop(self.clone())));
        tasks.push(tokio::spawn(sched::cron_loop(self.clone())));

        if let Some(rx) = self.take_chat_rx().await {
            tasks.push(tokio::spawn(chat_router_loop(self.clone(), rx)));
        }

        self.notifier.send_urgent(&self.startup_notice()).await;
        info!("overlord is running");

        self.cancel.cancelled().await;

        info!("shutting down overlord");
        for task in tasks {
            let _ = task.await;
        }
        info!("overlord shutdown complete");
        Ok(())
    }
}

/// Chat adapter task: drains inbound events until shutdown.
pub(crate) async fn chat_router_loop(
    overlord: Arc<Overlord>,
    mut rx: mpsc::Receiver<ChatEvent>,
) {
    info!("chat router started");
    loop {
        tokio::select! {
            _ = overlord.cancel.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => {
                    overlord.handle_chat_event(event).await;
                }
                None => break,
            },
        }
    }
    info!("chat router stopped");
}
