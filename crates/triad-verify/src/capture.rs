//! Screenshot capture

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};
use triad_core::config::VerifyConfig;
use triad_core::{Result, Screenshot, TriadError};

/// Produces a snapshot of the current visual state
#[async_trait]
pub trait VisualCapture: Send + Sync {
    async fn capture(&self, context: &str) -> Result<Screenshot>;
}

/// Capture by running an external command
///
/// Every `{path}` argument is replaced by the target file, which is
/// `{dir}/{context}_{unix_ms}.png`. A command that outlives the timeout is
/// killed and the capture fails.
pub struct CommandCapture {
    command: Vec<String>,
    dir: PathBuf,
    timeout: Duration,
    last_hash: Mutex<Option<String>>,
}

impl CommandCapture {
    pub fn new(command: Vec<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            command,
            dir: dir.into(),
            timeout: Duration::from_millis(10_000),
            last_hash: Mutex::new(None),
        }
    }

    /// Build from config, resolving a relative screenshot dir against `root`
    pub fn from_config(config: &VerifyConfig, root: &Path) -> Self {
        Self::new(config.capture_command.clone(), root.join(&config.screenshot_dir))
            .with_timeout(config.capture_timeout())
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn target_path(&self, context: &str) -> PathBuf {
        self.dir.join(format!(
            "{}_{}.png",
            sanitize_context(context),
            Utc::now().timestamp_millis()
        ))
    }

    /// Swap in the new hash, reporting whether it differs from the last one
    fn record_hash(&self, hash: &str) -> bool {
        let mut last = match self.last_hash.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let changed = last.as_deref() != Some(hash);
        *last = Some(hash.to_string());
        changed
    }
}

#[async_trait]
impl VisualCapture for CommandCapture {
    async fn capture(&self, context: &str) -> Result<Screenshot> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| TriadError::Config("capture_command is empty".to_string()))?;

        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.target_path(context);
        let path_str = path.to_string_lossy().into_owned();
        let args: Vec<String> = args.iter().map(|a| a.replace("{path}", &path_str)).collect();

        debug!(program = %program, path = %path_str, "Capturing screenshot");
        let run = tokio::process::Command::new(program)
            .args(&args)
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| {
                TriadError::AnalysisFailed(format!(
                    "capture command timed out after {}ms",
                    self.timeout.as_millis()
                ))
            })?
            .map_err(|e| TriadError::AnalysisFailed(format!("capture command failed: {}", e)))?;

        if !output.status.success() {
            return Err(TriadError::AnalysisFailed(format!(
                "capture command exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let mut screenshot = describe_file(&path, context).await?;
        screenshot.changed = self.record_hash(&screenshot.hash);
        info!(
            path = %screenshot.filepath,
            size = screenshot.size,
            changed = screenshot.changed,
            "Screenshot captured"
        );
        Ok(screenshot)
    }
}

/// Metadata for an existing file; `changed` is left `true`
pub async fn describe_file(path: &Path, context: &str) -> Result<Screenshot> {
    let bytes = tokio::fs::read(path).await.map_err(|e| {
        TriadError::AnalysisFailed(format!("screenshot {} unreadable: {}", path.display(), e))
    })?;
    Ok(Screenshot {
        filepath: path.to_string_lossy().into_owned(),
        filename: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        timestamp: Utc::now(),
        size: bytes.len() as u64,
        hash: sha256_hex(&bytes),
        context: context.to_string(),
        changed: true,
    })
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn sanitize_context(context: &str) -> String {
    let cleaned: String = context
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .take(48)
        .collect();
    if cleaned.is_empty() {
        "screenshot".to_string()
    } else {
        cleaned
    }
}
