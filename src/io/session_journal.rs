//! Session journal - appends ended live shows to file
//!
//! Sessions are written in JSONL format (one JSON object per line) when they
//! end. Write failures are logged and swallowed.
//!
//! The registry never touches the file itself: ended sessions are sent over
//! an unbounded channel to a [`JournalWorker`], which does the blocking
//! write on the blocking pool.

use crate::domain::session::Session;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Handle the registry uses to hand off ended sessions
pub type JournalSender = mpsc::UnboundedSender<Session>;

pub struct SessionJournal {
    file_path: String,
}

impl SessionJournal {
    pub fn new(file_path: &str) -> Self {
        info!(file_path = %file_path, "session_journal_initialized");
        Self { file_path: file_path.to_string() }
    }

    pub fn file_path(&self) -> &str {
        &self.file_path
    }

    /// Record a session's final state. Returns true if written.
    pub fn record(&self, session: &Session) -> bool {
        let json = match serde_json::to_string(session) {
            Ok(json) => json,
            Err(e) => {
                error!(session_id = %session.id(), error = %e, "session_journal_serialize_failed");
                return false;
            }
        };

        match self.append_line(&json) {
            Ok(()) => {
                info!(
                    session_id = %session.id(),
                    participants = %session.participants().len(),
                    chat_messages = %session.chat_log().len(),
                    "session_journaled"
                );
                true
            }
            Err(e) => {
                error!(session_id = %session.id(), error = %e, "session_journal_write_failed");
                false
            }
        }
    }

    fn append_line(&self, line: &str) -> std::io::Result<()> {
        let path = Path::new(&self.file_path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", line)?;
        debug!(file = %self.file_path, bytes = %line.len(), "session_journal_written");

        Ok(())
    }
}

/// Drains ended sessions into the journal file
pub struct JournalWorker {
    journal: Arc<SessionJournal>,
    rx: mpsc::UnboundedReceiver<Session>,
}

impl JournalWorker {
    /// Run until every sender is dropped, writing sessions in arrival order
    pub async fn run(mut self) {
        info!(file_path = %self.journal.file_path(), "session_journal_worker_started");

        while let Some(session) = self.rx.recv().await {
            let journal = self.journal.clone();
            let session_id = session.id().clone();
            if let Err(e) = tokio::task::spawn_blocking(move || journal.record(&session)).await {
                error!(session_id = %session_id, error = %e, "session_journal_task_failed");
            }
        }

        info!("session_journal_worker_stopped");
    }
}

/// Create the journal channel and its worker
///
/// Returns the sender (for the registry) and the worker (to be spawned)
pub fn create_journal_worker(journal: SessionJournal) -> (JournalSender, JournalWorker) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, JournalWorker { journal: Arc::new(journal), rx })
}
