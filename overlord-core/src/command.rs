//! Free-text chat commands → structured commands (pure, no I/O).
//!
//! Recognised shapes:
//!
//! ```text
//! status
//! work on owner/repo#42     work #42 (default repo)     work on 42
//! stop minion-ab12cd34      stop #42
//! queue | pause | resume | history | help | ping
//! ```
//!
//! Anything ambiguous parses to `Unknown` with the original text preserved
//! so the reply can echo it back.

/// What the user asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Status,
    Work,
    Stop,
    Queue,
    Pause,
    Resume,
    History,
    Help,
    Ping,
    Unknown,
}

/// A parsed command plus whatever qualifiers were found in the text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub kind: CommandKind,
    pub repo: Option<String>,
    pub issue_number: Option<u64>,
    pub minion_id: Option<String>,
    /// Original input, for `Unknown` echoes.
    pub raw: String,
}

impl Command {
    fn bare(kind: CommandKind, raw: &str) -> Self {
        Self {
            kind,
            repo: None,
            issue_number: None,
            minion_id: None,
            raw: raw.to_string(),
        }
    }
}

/// Parser with an optional default repository for bare `#42` references.
#[derive(Debug, Clone)]
pub struct CommandParser {
    default_repo: Option<String>,
}

impl CommandParser {
    pub fn new(default_repo: Option<String>) -> Self {
        Self { default_repo }
    }

    pub fn parse(&self, text: &str) -> Command {
        let raw = text.trim();
        let mut tokens = raw.split_whitespace();
        let keyword = match tokens.next() {
            Some(t) => t.to_ascii_lowercase(),
            None => return Command::bare(CommandKind::Unknown, raw),
        };
        let rest: Vec<&str> = tokens.collect();

        match keyword.as_str() {
            "status" => Command::bare(CommandKind::Status, raw),
            "queue" => Command::bare(CommandKind::Queue, raw),
            "pause" => Command::bare(CommandKind::Pause, raw),
            "resume" => Command::bare(CommandKind::Resume, raw),
            "history" => Command::bare(CommandKind::History, raw),
            "help" => Command::bare(CommandKind::Help, raw),
            "ping" => Command::bare(CommandKind::Ping, raw),
            "work" => self.parse_work(&rest, raw),
            "stop" => self.parse_stop(&rest, raw),
            _ => Command::bare(CommandKind::Unknown, raw),
        }
    }

    fn parse_work(&self, rest: &[&str], raw: &str) -> Command {
        let (repo, issue_number) = self.find_issue_ref(rest);
        Command {
            kind: CommandKind::Work,
            repo,
            issue_number,
            minion_id: None,
            raw: raw.to_string(),
        }
    }

    fn parse_stop(&self, rest: &[&str], raw: &str) -> Command {
        if let Some(id) = rest.iter().find(|t| t.starts_with("minion-")) {
            return Command {
                kind: CommandKind::Stop,
                repo: None,
                issue_number: None,
                minion_id: Some((*id).to_string()),
                raw: raw.to_string(),
            };
        }
        let (repo, issue_number) = self.find_issue_ref(rest);
        Command {
            kind: CommandKind::Stop,
            repo,
            issue_number,
            minion_id: None,
            raw: raw.to_string(),
        }
    }

    /// Scan tokens for an issue reference: `owner/repo#42`, `#42`, or a
    /// bare number. Filler words like "on" are skipped by construction.
    fn find_issue_ref(&self, tokens: &[&str]) -> (Option<String>, Option<u64>) {
        for token in tokens {
            if let Some((left, right)) = token.split_once('#') {
                if let Ok(n) = right.parse::<u64>() {
                    let repo = if left.is_empty() {
                        self.default_repo.clone()
                    } else {
                        Some(left.to_string())
                    };
                    return (repo, Some(n));
                }
            }
        }
        // No `#` form; accept a bare number, and a bare owner/repo qualifier.
        let number = tokens.iter().find_map(|t| t.parse::<u64>().ok());
        let repo = tokens
            .iter()
            .find(|t| t.contains('/') && !t.contains('#'))
            .map(|t| (*t).to_string())
            .or_else(|| self.default_repo.clone());
        (repo, number)
    }

    /// Usage text for the `help` command.
    pub fn format_help(&self) -> String {
        let mut help = String::from(
            "Commands:\n\
             - `status` - active minions\n\
             - `work on owner/repo#42` - dispatch a minion for an issue\n\
             - `stop minion-<id>` / `stop #42` - stop a minion\n\
             - `queue` - pending work queue\n\
             - `pause` / `resume` - toggle queue processing\n\
             - `history` - recent completed work\n\
             - `help` - this message",
        );
        if let Some(repo) = &self.default_repo {
            help.push_str(&format!("\nDefault repo: {repo}"));
        }
        help
    }
}
