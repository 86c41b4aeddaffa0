use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::session::{is_valid_session_id, Session, SessionSummary};

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Persists a finished session and returns where it was written.
    async fn save(&self, session: &Session) -> anyhow::Result<PathBuf>;
    async fn load(&self, id: &str) -> anyhow::Result<Option<Session>>;
    /// Newest first.
    async fn list(&self) -> anyhow::Result<Vec<SessionSummary>>;

    /// Every listed session, newest first.
    async fn load_all(&self) -> anyhow::Result<Vec<Session>> {
        let mut out = Vec::new();
        for summary in self.list().await? {
            if let Some(session) = self.load(&summary.id).await? {
                out.push(session);
            }
        }
        Ok(out)
    }
}

/// One pretty-printed `session_<id>.json` file per session.
#[derive(Debug, Clone)]
pub struct JsonLogStore {
    dir: PathBuf,
}

impl JsonLogStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("session_{id}.json"))
    }
}

#[async_trait]
impl SessionStore for JsonLogStore {
    async fn save(&self, session: &Session) -> anyhow::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating log directory {}", self.dir.display()))?;
        let path = self.path_for(&session.id);
        let json = serde_json::to_vec_pretty(session)?;
        // create_new: an existing log is never overwritten
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .with_context(|| format!("creating {}", path.display()))?;
        write_or_remove(&path, file, &json).await?;
        tracing::info!(path = %path.display(), turns = session.turns.len(), "session log written");
        Ok(path)
    }

    async fn load(&self, id: &str) -> anyhow::Result<Option<Session>> {
        if !is_valid_session_id(id) {
            anyhow::bail!("invalid session id `{id}`");
        }
        let path = self.path_for(id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        let session = serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(session))
    }

    async fn list(&self) -> anyhow::Result<Vec<SessionSummary>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("listing {}", self.dir.display())),
        };
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_log = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("session_") && n.ends_with(".json"));
            if !is_log {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<Session>(&bytes) {
                Ok(session) => {
                    let mut summary = session.summary();
                    summary.path = Some(path);
                    out.push(summary);
                }
                Err(err) => tracing::warn!(path = %path.display(), error = %err, "skipping unreadable session log"),
            }
        }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(out)
    }
}

/// Writes `json` through `out`. A failed write removes the file at `path` so
/// no truncated log is left behind.
async fn write_or_remove<W: AsyncWrite + Unpin>(path: &Path, mut out: W, json: &[u8]) -> anyhow::Result<()> {
    let res = async {
        out.write_all(json).await?;
        out.write_all(b"\n").await?;
        out.flush().await
    }
    .await;
    if let Err(err) = res {
        drop(out);
        if let Err(rm) = tokio::fs::remove_file(path).await {
            tracing::warn!(path = %path.display(), error = %rm, "could not remove partial log");
        }
        return Err(err).with_context(|| format!("writing {}", path.display()));
    }
    Ok(())
}
