use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::agent_engine::state::{Step, Task, TaskId, TaskStatus, TerminalReason};
use crate::errors::DeskResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
pub enum JournalEntry {
    Started {
        task_id: TaskId,
        goal: String,
        provider: String,
        ts: i64,
    },
    Step {
        step: Step,
    },
    Finished {
        status: TaskStatus,
        reason: Option<TerminalReason>,
        steps: usize,
        ts: i64,
    },
}

/// Append-only JSONL record of one task, `task_<id>.jsonl` under the journal dir.
pub struct TaskJournal {
    file_path: PathBuf,
}

impl TaskJournal {
    pub fn create(dir: &Path, task_id: TaskId) -> DeskResult<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self { file_path: dir.join(format!("task_{task_id}.jsonl")) })
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    pub fn started(&self, task: &Task) -> DeskResult<()> {
        self.append(&JournalEntry::Started {
            task_id: task.id,
            goal: task.goal.clone(),
            provider: task.provider.clone(),
            ts: chrono::Utc::now().timestamp_millis(),
        })
    }

    pub fn step(&self, step: &Step) -> DeskResult<()> {
        self.append(&JournalEntry::Step { step: step.clone() })
    }

    pub fn finished(&self, task: &Task) -> DeskResult<()> {
        self.append(&JournalEntry::Finished {
            status: task.status,
            reason: task.terminal_reason.clone(),
            steps: task.steps.len(),
            ts: chrono::Utc::now().timestamp_millis(),
        })
    }

    fn append(&self, entry: &JournalEntry) -> DeskResult<()> {
        let line = serde_json::to_string(entry)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)?;
        writeln!(file, "{}", line)?;
        tracing::debug!(path = %self.file_path.display(), "journal entry flushed");
        Ok(())
    }
}

/// Read a journal back, skipping lines that do not parse.
pub fn read_journal(path: &Path) -> DeskResult<Vec<JournalEntry>> {
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect())
}
