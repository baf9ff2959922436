//! TODO items and the list the orchestrator drives through its stages

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{ItemStatus, Result, TriadError};

fn default_max_attempts() -> u32 {
    3
}

/// One atomic unit of planned work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodoItem {
    #[serde(default)]
    pub id: String,
    pub action: String,
    #[serde(default)]
    pub tools_needed: Vec<String>,
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub success_criteria: String,
    #[serde(default)]
    pub fallback_options: Vec<String>,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub status: ItemStatus,
    /// Reason of the most recent failed verification
    #[serde(default)]
    pub last_failure: Option<String>,
}

impl TodoItem {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            action: action.into(),
            tools_needed: Vec::new(),
            parameters: serde_json::Map::new(),
            success_criteria: String::new(),
            fallback_options: Vec::new(),
            attempt: 0,
            max_attempts: default_max_attempts(),
            status: ItemStatus::Pending,
            last_failure: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools_needed = tools;
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn with_success_criteria(mut self, criteria: impl Into<String>) -> Self {
        self.success_criteria = criteria.into();
        self
    }

    pub fn with_fallbacks(mut self, fallbacks: Vec<String>) -> Self {
        self.fallback_options = fallbacks;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Reset the execution state so the item behaves as freshly planned
    fn reset_for_planning(&mut self, default_max: u32) {
        self.attempt = 0;
        self.status = ItemStatus::Pending;
        self.last_failure = None;
        if self.max_attempts == 0 {
            self.max_attempts = default_max;
        }
    }
}

/// Counts over a list's items
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TodoSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub pending: usize,
    pub total_attempts: u32,
    /// Percentage of completed items, 0-100
    pub success_rate: f64,
}

/// An ordered TODO list for one user request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodoList {
    pub id: String,
    pub request: String,
    pub items: Vec<TodoItem>,
    pub created_at: DateTime<Utc>,
    /// Set once the list is aborted
    pub aborted: Option<String>,
}

impl TodoList {
    /// Create a list, assigning sequential ids to items that have none
    pub fn new(request: impl Into<String>, items: Vec<TodoItem>) -> Self {
        let mut list = Self {
            id: Uuid::new_v4().to_string(),
            request: request.into(),
            items: Vec::with_capacity(items.len()),
            created_at: Utc::now(),
            aborted: None,
        };
        for (index, mut item) in items.into_iter().enumerate() {
            if item.id.is_empty() || list.position(&item.id).is_some() {
                item.id = list.unique_id(&(index + 1).to_string());
            }
            item.reset_for_planning(default_max_attempts());
            list.items.push(item);
        }
        list
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.items.iter().position(|item| item.id == id)
    }

    pub fn get(&self, id: &str) -> Option<&TodoItem> {
        self.items.iter().find(|item| item.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut TodoItem> {
        self.items.iter_mut().find(|item| item.id == id)
    }

    /// Index of the first pending item at or after `from`
    pub fn next_pending(&self, from: usize) -> Option<usize> {
        self.items
            .iter()
            .enumerate()
            .skip(from)
            .find(|(_, item)| item.status == ItemStatus::Pending)
            .map(|(index, _)| index)
    }

    /// Insert freshly planned items right after `after_id`
    ///
    /// Spliced items start at attempt 0 with pending status and get ids of the
    /// form `{after_id}.{n}`. Items after the insertion point keep their
    /// relative order. Returns the ids of the inserted items.
    pub fn splice_after(&mut self, after_id: &str, items: Vec<TodoItem>) -> Result<Vec<String>> {
        let index = self
            .position(after_id)
            .ok_or_else(|| TriadError::InvalidDecision(format!("unknown item id: {}", after_id)))?;
        let default_max = self.items[index].max_attempts;

        let mut inserted = Vec::with_capacity(items.len());
        let mut prepared = Vec::with_capacity(items.len());
        for (n, mut item) in items.into_iter().enumerate() {
            let candidate = format!("{}.{}", after_id, n + 1);
            item.id = self.unique_id_excluding(&candidate, &inserted);
            item.reset_for_planning(default_max);
            inserted.push(item.id.clone());
            prepared.push(item);
        }

        let tail = self.items.split_off(index + 1);
        self.items.extend(prepared);
        self.items.extend(tail);
        Ok(inserted)
    }

    /// Mark a single item skipped
    ///
    /// Completed items are never touched.
    pub fn skip(&mut self, id: &str) -> Result<()> {
        let item = self
            .get_mut(id)
            .ok_or_else(|| TriadError::InvalidDecision(format!("unknown item id: {}", id)))?;
        if item.status == ItemStatus::Completed {
            return Err(TriadError::InvalidDecision(format!(
                "item {} is already completed",
                id
            )));
        }
        item.status = ItemStatus::Skipped;
        Ok(())
    }

    /// Terminate the list: every unfinished item becomes failed
    pub fn abort(&mut self, reason: impl Into<String>) {
        for item in self.items.iter_mut().filter(|i| !i.status.is_terminal()) {
            item.status = ItemStatus::Failed;
        }
        self.aborted = Some(reason.into());
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.is_some()
    }

    pub fn completed(&self) -> impl Iterator<Item = &TodoItem> {
        self.items
            .iter()
            .filter(|i| i.status == ItemStatus::Completed)
    }

    pub fn remaining(&self) -> impl Iterator<Item = &TodoItem> {
        self.items.iter().filter(|i| !i.status.is_terminal())
    }

    pub fn summary(&self) -> TodoSummary {
        let mut summary = TodoSummary {
            total: self.items.len(),
            ..Default::default()
        };
        for item in &self.items {
            summary.total_attempts += item.attempt;
            match item.status {
                ItemStatus::Completed => summary.completed += 1,
                ItemStatus::Failed => summary.failed += 1,
                ItemStatus::Skipped => summary.skipped += 1,
                _ => summary.pending += 1,
            }
        }
        summary.success_rate = if summary.total == 0 {
            0.0
        } else {
            summary.completed as f64 * 100.0 / summary.total as f64
        };
        summary
    }

    fn unique_id(&self, candidate: &str) -> String {
        self.unique_id_excluding(candidate, &[])
    }

    fn unique_id_excluding(&self, candidate: &str, reserved: &[String]) -> String {
        let taken = |id: &str| self.position(id).is_some() || reserved.iter().any(|r| r == id);
        if !taken(candidate) {
            return candidate.to_string();
        }
        let mut suffix = 2;
        loop {
            let id = format!("{}-{}", candidate, suffix);
            if !taken(&id) {
                return id;
            }
            suffix += 1;
        }
    }
}
