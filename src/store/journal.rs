use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, warn};

use crate::error::{OrchestratorError, Result};
use crate::events::DomainEvent;
use crate::state_machine::Job;

#[derive(Serialize)]
struct EntryRef<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    job: Option<&'a Job>,
    events: &'a [DomainEvent],
}

/// One committed unit as read back from disk.
#[derive(Debug, Deserialize)]
pub(crate) struct JournalEntry {
    #[serde(default)]
    pub job: Option<Job>,
    #[serde(default)]
    pub events: Vec<DomainEvent>,
}

/// Append-only JSONL file, one committed unit per line.
pub(crate) struct Journal {
    path: PathBuf,
    file: File,
    // A line may be half written; the next append starts on a fresh line.
    torn: bool,
    // A failed write could not be rolled back. Appends are refused until the
    // file is reopened and replayed.
    poisoned: bool,
}

impl Journal {
    /// Open (creating if needed) and read back every intact entry.
    pub async fn open(path: &Path) -> Result<(Self, Vec<JournalEntry>)> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut entries = Vec::new();
        let mut torn = false;
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let text = String::from_utf8_lossy(&bytes);
                for (n, line) in text.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<JournalEntry>(line) {
                        Ok(entry) => entries.push(entry),
                        Err(e) => warn!(
                            path = %path.display(),
                            line = n + 1,
                            error = %e,
                            "skipping unreadable journal line"
                        ),
                    }
                }
                torn = !bytes.is_empty() && !bytes.ends_with(b"\n");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        debug!(path = %path.display(), entries = entries.len(), "journal opened");
        Ok((
            Self {
                path: path.to_path_buf(),
                file,
                torn,
                poisoned: false,
            },
            entries,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one unit and flush it to disk.
    ///
    /// On failure the file is cut back to its length before the write, so a
    /// unit the caller saw fail is never replayed.
    pub async fn append(&mut self, job: Option<&Job>, events: &[DomainEvent]) -> Result<()> {
        if self.poisoned {
            return Err(OrchestratorError::Resource(format!(
                "journal {} has an unrecoverable partial write, reopen it",
                self.path.display()
            )));
        }
        let mut line = serde_json::to_string(&EntryRef { job, events })
            .map_err(|e| OrchestratorError::Resource(format!("journal encode: {e}")))?;
        line.push('\n');
        if self.torn {
            line.insert(0, '\n');
        }

        let start = self.file.metadata().await?.len();
        if let Err(e) = self.write_synced(line.as_bytes()).await {
            self.roll_back(start).await;
            return Err(e.into());
        }
        self.torn = false;
        Ok(())
    }

    async fn write_synced(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.file.write_all(bytes).await?;
        self.file.flush().await?;
        self.file.sync_data().await
    }

    async fn roll_back(&mut self, len: u64) {
        match self.file.set_len(len).await {
            Ok(()) => warn!(path = %self.path.display(), len, "journal write rolled back"),
            Err(e) => {
                self.poisoned = true;
                error!(
                    path = %self.path.display(),
                    error = %e,
                    "journal rollback failed, refusing further appends"
                );
            }
        }
    }

    /// Swap the handle for a read-only one so every write fails.
    #[cfg(test)]
    pub(crate) async fn break_writes(&mut self) {
        self.file = File::open(&self.path).await.unwrap();
    }
}
