//! Write-ahead log fallback
//!
//! When the store is unreachable, `record_event` appends the draft as one
//! JSON line here and the caller gets success with `deferred: true`. Replay
//! runs at startup and whenever the store comes back: entries are re-recorded
//! in order; a failing entry stops the replay and everything from it onward
//! is preserved for operator inspection.

use chrono::Utc;
use engram_core::{EngramError, EngramResult, Timestamp};
use engram_recorder::{EventDraft, Recorder};
use engram_storage::Store;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;

/// One deferred write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    pub deferred_at: Timestamp,
    pub draft: EventDraft,
}

/// Outcome of one replay pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplayOutcome {
    pub replayed: usize,
    pub remaining: usize,
    /// Error from the entry that stopped the replay, if any.
    pub stopped_on: Option<String>,
}

/// Single-writer append-only WAL. The mutex serialises appends and replay
/// within this process; the file is opened in append mode so writes are
/// atomic at the OS level.
pub struct Wal {
    path: PathBuf,
    lock: Mutex<()>,
}

impl Wal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one deferred draft.
    pub async fn append(&self, draft: &EventDraft) -> EngramResult<()> {
        let _guard = self.lock.lock().await;
        let entry = WalEntry {
            deferred_at: Utc::now(),
            draft: draft.clone(),
        };
        let mut line = serde_json::to_string(&entry).map_err(|e| EngramError::Fatal {
            reason: format!("WAL serialize: {}", e),
        })?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(wal_io_err)?;
        file.write_all(line.as_bytes()).await.map_err(wal_io_err)?;
        file.flush().await.map_err(wal_io_err)?;
        Ok(())
    }

    /// Number of pending entries.
    pub async fn depth(&self) -> usize {
        let _guard = self.lock.lock().await;
        self.read_lines().await.map(|l| l.len()).unwrap_or(0)
    }

    /// Replay pending entries in order through the recorder. Replayed
    /// entries are removed; on the first failure the remainder (including
    /// the failing entry) is kept.
    pub async fn replay(
        &self,
        recorder: &Recorder,
        store: &dyn Store,
    ) -> EngramResult<ReplayOutcome> {
        let _guard = self.lock.lock().await;
        let lines = self.read_lines().await?;
        if lines.is_empty() {
            return Ok(ReplayOutcome::default());
        }

        let mut outcome = ReplayOutcome::default();
        let mut kept: Vec<String> = Vec::new();
        for (i, line) in lines.iter().enumerate() {
            if outcome.stopped_on.is_some() {
                kept.push(line.clone());
                continue;
            }
            let entry: WalEntry = match serde_json::from_str(line) {
                Ok(entry) => entry,
                Err(e) => {
                    // A corrupt line is a poison entry; keep it and stop.
                    outcome.stopped_on = Some(format!("entry {}: corrupt: {}", i, e));
                    kept.push(line.clone());
                    continue;
                }
            };
            match recorder.append(store, entry.draft).await {
                Ok(_) => outcome.replayed += 1,
                Err(e) => {
                    outcome.stopped_on = Some(format!("entry {}: {}", i, e));
                    kept.push(line.clone());
                }
            }
        }

        outcome.remaining = kept.len();
        if kept.is_empty() {
            match tokio::fs::remove_file(&self.path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(wal_io_err(e)),
            }
        } else {
            let mut body = kept.join("\n");
            body.push('\n');
            let tmp = self.path.with_extension("wal.tmp");
            let mut file = File::create(&tmp).await.map_err(wal_io_err)?;
            file.write_all(body.as_bytes()).await.map_err(wal_io_err)?;
            file.flush().await.map_err(wal_io_err)?;
            tokio::fs::rename(&tmp, &self.path)
                .await
                .map_err(wal_io_err)?;
        }

        if let Some(stopped) = &outcome.stopped_on {
            tracing::warn!(
                replayed = outcome.replayed,
                remaining = outcome.remaining,
                stopped_on = %stopped,
                "WAL replay stopped at a failing entry"
            );
        } else if outcome.replayed > 0 {
            tracing::info!(replayed = outcome.replayed, "WAL drained");
        }
        Ok(outcome)
    }

    async fn read_lines(&self) -> EngramResult<Vec<String>> {
        let mut file = match File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(wal_io_err(e)),
        };
        let mut raw = String::new();
        file.read_to_string(&mut raw).await.map_err(wal_io_err)?;
        Ok(raw
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect())
    }
}

fn wal_io_err(e: std::io::Error) -> EngramError {
    EngramError::Fatal {
        reason: format!("WAL I/O: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engram_core::{Actor, ActorKind, Channel, DraftContent, EngramConfig};
    use engram_storage::MemoryStore;
    use engram_test_utils::{agent, session, tenant};
    use std::sync::Arc;

    fn draft(text: &str) -> EventDraft {
        EventDraft {
            tenant_id: tenant("t1"),
            session_id: session("s1"),
            agent_id: agent("A"),
            channel: Channel::Private,
            actor: Actor {
                kind: ActorKind::Human,
                id: "user".to_string(),
            },
            content: DraftContent::Message {
                text: text.to_string(),
            },
            tags: vec![],
            refs: vec![],
            sensitivity: None,
            pinned: false,
        }
    }

    fn wal_in(dir: &tempfile::TempDir) -> Wal {
        Wal::new(dir.path().join("engram.wal"))
    }

    #[tokio::test]
    async fn test_append_and_depth() {
        let dir = tempfile::tempdir().unwrap();
        let wal = wal_in(&dir);
        assert_eq!(wal.depth().await, 0);
        wal.append(&draft("one")).await.unwrap();
        wal.append(&draft("two")).await.unwrap();
        assert_eq!(wal.depth().await, 2);
    }

    #[tokio::test]
    async fn test_replay_drains_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let wal = wal_in(&dir);
        wal.append(&draft("first deferred")).await.unwrap();
        wal.append(&draft("second deferred")).await.unwrap();

        let store = MemoryStore::new();
        let recorder = Recorder::new(Arc::new(EngramConfig::default()));
        let outcome = wal.replay(&recorder, &store).await.unwrap();
        assert_eq!(outcome.replayed, 2);
        assert_eq!(outcome.remaining, 0);
        assert!(outcome.stopped_on.is_none());
        assert_eq!(wal.depth().await, 0);

        let events = store
            .list_session_events(&tenant("t1"), &session("s1"), 10)
            .await
            .unwrap();
        assert_eq!(events.len(), 2);
        // Newest-first listing: the first deferred entry is the older event.
        assert!(events[1].content.excerpt_text().contains("first deferred"));
    }

    #[tokio::test]
    async fn test_replay_stops_on_poison_entry() {
        let dir = tempfile::tempdir().unwrap();
        let wal = wal_in(&dir);
        wal.append(&draft("good one")).await.unwrap();
        // Hand-inject a corrupt line between valid entries.
        {
            let mut file = OpenOptions::new()
                .append(true)
                .open(wal.path())
                .await
                .unwrap();
            file.write_all(b"{not json}\n").await.unwrap();
        }
        wal.append(&draft("after poison")).await.unwrap();

        let store = MemoryStore::new();
        let recorder = Recorder::new(Arc::new(EngramConfig::default()));
        let outcome = wal.replay(&recorder, &store).await.unwrap();
        assert_eq!(outcome.replayed, 1);
        assert_eq!(outcome.remaining, 2);
        assert!(outcome.stopped_on.unwrap().contains("corrupt"));
        // Poison and successor preserved for inspection.
        assert_eq!(wal.depth().await, 2);
    }

    #[tokio::test]
    async fn test_replay_against_down_store_keeps_everything() {
        let dir = tempfile::tempdir().unwrap();
        let wal = wal_in(&dir);
        wal.append(&draft("deferred")).await.unwrap();

        let store = MemoryStore::new();
        store.set_available(false);
        let recorder = Recorder::new(Arc::new(EngramConfig::default()));
        let outcome = wal.replay(&recorder, &store).await.unwrap();
        assert_eq!(outcome.replayed, 0);
        assert_eq!(outcome.remaining, 1);

        // Store recovers; the next pass drains.
        store.set_available(true);
        let outcome = wal.replay(&recorder, &store).await.unwrap();
        assert_eq!(outcome.replayed, 1);
        assert_eq!(wal.depth().await, 0);
    }
}
