//! File-backed local document store.
//!
//! Documents are cached in memory and, when a data directory is configured,
//! written through as one JSON file per document:
//!
//! ```text
//! <data_dir>/programs/<program id>.json
//! <data_dir>/sessions/<session id>.json
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use liftlog_core::{json_file_name, Program, Session, StorageError, StorageResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::store::DocumentStore;

const PROGRAMS_DIR: &str = "programs";
const SESSIONS_DIR: &str = "sessions";

#[derive(Debug, Default)]
struct Documents {
    programs: HashMap<String, Program>,
    sessions: HashMap<String, Session>,
}

/// Local durable store.
///
/// Deletes are hard deletes. Cloning yields another handle to the same store.
#[derive(Debug, Clone)]
pub struct FileStore {
    docs: Arc<RwLock<Documents>>,
    data_dir: Option<PathBuf>,
    ready: Arc<AtomicBool>,
}

impl FileStore {
    /// Create a store that keeps everything in memory. Ready immediately.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            docs: Arc::new(RwLock::new(Documents::default())),
            data_dir: None,
            ready: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Create a store persisted under `data_dir`.
    ///
    /// The directories are created here; documents are loaded by
    /// [`DocumentStore::init`], which must run before any other call.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the directories cannot be created.
    pub fn open(data_dir: impl Into<PathBuf>) -> StorageResult<Self> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(data_dir.join(PROGRAMS_DIR))?;
        std::fs::create_dir_all(data_dir.join(SESSIONS_DIR))?;
        Ok(Self {
            docs: Arc::new(RwLock::new(Documents::default())),
            data_dir: Some(data_dir),
            ready: Arc::new(AtomicBool::new(false)),
        })
    }

    fn ensure_ready(&self) -> StorageResult<()> {
        if self.ready.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StorageError::NotInitialized("local store".into()))
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Documents> {
        self.docs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Documents> {
        self.docs.write().unwrap_or_else(PoisonError::into_inner)
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    fn persist<T: Serialize>(&self, dir: &str, id: &str, doc: &T) -> StorageResult<()> {
        let Some(ref data_dir) = self.data_dir else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(doc)?;
        std::fs::write(document_path(data_dir, dir, id), json)?;
        Ok(())
    }

    fn unpersist(&self, dir: &str, id: &str) -> StorageResult<()> {
        let Some(ref data_dir) = self.data_dir else {
            return Ok(());
        };
        match std::fs::remove_file(document_path(data_dir, dir, id)) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

fn document_path(data_dir: &Path, dir: &str, id: &str) -> PathBuf {
    data_dir.join(dir).join(json_file_name(id))
}

/// Load every `*.json` document in `dir`, skipping unreadable files.
fn load_all<T: DeserializeOwned>(dir: &Path) -> StorageResult<Vec<T>> {
    let mut docs = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            continue;
        }
        let parsed = std::fs::read_to_string(&path)
            .map_err(StorageError::from)
            .and_then(|contents| serde_json::from_str(&contents).map_err(StorageError::from));
        match parsed {
            Ok(doc) => docs.push(doc),
            Err(e) => tracing::warn!(
                path = %path.display(),
                error = %e,
                "Skipping unreadable document"
            ),
        }
    }
    Ok(docs)
}

#[async_trait]
impl DocumentStore for FileStore {
    async fn init(&self) -> StorageResult<()> {
        if let Some(ref data_dir) = self.data_dir {
            let programs: Vec<Program> = load_all(&data_dir.join(PROGRAMS_DIR))?;
            let sessions: Vec<Session> = load_all(&data_dir.join(SESSIONS_DIR))?;
            tracing::info!(
                programs = programs.len(),
                sessions = sessions.len(),
                data_dir = %data_dir.display(),
                "Local store loaded"
            );

            let mut docs = self.write();
            docs.programs = programs.into_iter().map(|p| (p.id.clone(), p)).collect();
            docs.sessions = sessions.into_iter().map(|s| (s.id.clone(), s)).collect();
        }
        self.ready.store(true, Ordering::Release);
        Ok(())
    }

    async fn put_program(&self, program: &Program) -> StorageResult<()> {
        self.ensure_ready()?;
        self.persist(PROGRAMS_DIR, &program.id, program)?;
        self.write()
            .programs
            .insert(program.id.clone(), program.clone());
        Ok(())
    }

    async fn get_program(&self, id: &str) -> StorageResult<Option<Program>> {
        self.ensure_ready()?;
        Ok(self.read().programs.get(id).cloned())
    }

    async fn list_programs(&self) -> StorageResult<Vec<Program>> {
        self.ensure_ready()?;
        let mut programs: Vec<_> = self.read().programs.values().cloned().collect();
        programs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(programs)
    }

    async fn delete_program(&self, id: &str) -> StorageResult<()> {
        self.ensure_ready()?;
        self.unpersist(PROGRAMS_DIR, id)?;
        self.write().programs.remove(id);
        Ok(())
    }

    async fn put_session(&self, session: &Session) -> StorageResult<()> {
        self.ensure_ready()?;
        self.persist(SESSIONS_DIR, &session.id, session)?;
        self.write()
            .sessions
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get_session(&self, id: &str) -> StorageResult<Option<Session>> {
        self.ensure_ready()?;
        Ok(self.read().sessions.get(id).cloned())
    }

    async fn list_sessions(&self) -> StorageResult<Vec<Session>> {
        self.ensure_ready()?;
        let mut sessions: Vec<_> = self.read().sessions.values().cloned().collect();
        sessions.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.id.cmp(&b.id)));
        Ok(sessions)
    }

    async fn list_sessions_by_program(&self, program_id: &str) -> StorageResult<Vec<Session>> {
        let mut sessions = self.list_sessions().await?;
        sessions.retain(|s| s.program_id == program_id);
        Ok(sessions)
    }

    async fn delete_session(&self, id: &str) -> StorageResult<()> {
        self.ensure_ready()?;
        self.unpersist(SESSIONS_DIR, id)?;
        self.write().sessions.remove(id);
        Ok(())
    }
}
