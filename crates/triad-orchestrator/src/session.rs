//! Per-session state and the session registry

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tracing::debug;
use triad_core::TodoList;

/// Role names agents sign their messages with
const ROLE_NAMES: &str = "system|atlas|grisha|tetyana|planner|executor|verifier|assistant|agent";

/// One prior turn of the conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// State owned by one user interaction stream
#[derive(Debug)]
pub struct Session {
    pub id: String,
    history: VecDeque<Turn>,
    history_limit: usize,
    pub todo: Option<TodoList>,
    /// Bumped at the start of every run
    pub generation: u64,
    last_active: DateTime<Utc>,
}

impl Session {
    pub fn new(id: impl Into<String>, history_limit: usize) -> Self {
        Self {
            id: id.into(),
            history: VecDeque::new(),
            history_limit: history_limit.max(1),
            todo: None,
            generation: 0,
            last_active: Utc::now(),
        }
    }

    /// Append a turn, sanitized, evicting the oldest beyond the limit
    pub fn push(&mut self, role: impl Into<String>, content: &str) {
        let content = sanitize(content);
        if content.is_empty() {
            return;
        }
        self.history.push_back(Turn {
            role: role.into(),
            content,
            timestamp: Utc::now(),
        });
        while self.history.len() > self.history_limit {
            self.history.pop_front();
        }
        self.touch();
    }

    pub fn history(&self) -> impl Iterator<Item = &Turn> {
        self.history.iter()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn touch(&mut self) {
        self.last_active = Utc::now();
    }

    pub fn last_active(&self) -> DateTime<Utc> {
        self.last_active
    }
}

fn sanitizer_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?is)```\s*system\b.*?```".to_string(),
            r"^\s*\[[A-Za-z][A-Za-z _-]{0,23}\]\s*:?\s*".to_string(),
            format!(r"(?i)^\s*(?:{})\s*:\s*", ROLE_NAMES),
        ]
        .iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .collect()
    })
}

/// Strip inter-agent signatures and system blocks before reusing text
///
/// Removes fenced `system` blocks anywhere, then repeatedly removes leading
/// bracketed tags (`[ATLAS]`, `[system]`) and `ROLE:` prefixes.
pub fn sanitize(text: &str) -> String {
    let patterns = sanitizer_patterns();
    let mut current = text.to_string();
    loop {
        let next = patterns
            .iter()
            .fold(current.clone(), |acc, re| re.replace_all(&acc, "").into_owned());
        if next == current {
            break;
        }
        current = next;
    }
    current.trim().to_string()
}

/// Sessions by id
///
/// Each session sits behind its own async mutex; holding it is what makes a
/// run single-flight for that session.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<tokio::sync::Mutex<Session>>>>,
    history_limit: usize,
    ttl: Duration,
}

impl SessionRegistry {
    pub fn new(history_limit: usize, ttl: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            history_limit,
            ttl,
        }
    }

    fn with_sessions<R>(
        &self,
        f: impl FnOnce(&mut HashMap<String, Arc<tokio::sync::Mutex<Session>>>) -> R,
    ) -> R {
        match self.sessions.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    pub fn get_or_create(&self, id: &str) -> Arc<tokio::sync::Mutex<Session>> {
        let limit = self.history_limit;
        self.with_sessions(|sessions| {
            sessions
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(Session::new(id, limit))))
                .clone()
        })
    }

    pub fn len(&self) -> usize {
        self.with_sessions(|sessions| sessions.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop sessions idle longer than the TTL; busy sessions are kept
    pub fn prune_expired(&self) -> usize {
        self.prune_idle_since(Utc::now())
    }

    fn prune_idle_since(&self, now: DateTime<Utc>) -> usize {
        let ttl = chrono::Duration::from_std(self.ttl)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        self.with_sessions(|sessions| {
            let before = sessions.len();
            sessions.retain(|id, session| match session.try_lock() {
                Ok(session) => {
                    let keep = now - session.last_active() <= ttl;
                    if !keep {
                        debug!(session_id = %id, "Session expired");
                    }
                    keep
                }
                Err(_) => true,
            });
            before - sessions.len()
        })
    }
}
