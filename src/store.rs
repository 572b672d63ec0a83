//! Durable session store.
//!
//! Each session is one JSON-lines file, `<data_dir>/sessions/<id>.jsonl`:
//!
//! ```text
//! {"type":"header","version":1,"id":"kitchen","created_at":"2026-10-15T09:00:00Z"}
//! {"type":"turn","role":"user","text":"How long do I boil water?","timestamp":"..."}
//! {"type":"turn","role":"assistant","text":"...","timestamp":"...","grounding":[...]}
//! {"type":"documents","documents":[{"id":"...","name":"water.md",...}]}
//! ```
//!
//! - [`append`](SessionStore::append) writes one line and `sync_data`s it
//!   before returning, so an acknowledged turn survives a crash.
//! - [`save`](SessionStore::save) rewrites the whole file through a
//!   temporary file and a rename, which also compacts `documents` records.
//! - On load, a final line without its newline is an append that never
//!   completed (or one still in flight): it is skipped with a warning and
//!   the file is left alone. The next append cuts it before writing. Any
//!   other unreadable line is `CorruptState`. Unknown record types and
//!   unknown fields are skipped.
//!
//! Appends for one session are serialised by its sequencing lock
//! ([`session_lock`](SessionStore::session_lock)), which callers also hold
//! across compose → generate → append so turns land in submission order.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use hearth_core::models::{ConversationTurn, DocumentMeta, Session};
use hearth_core::{Error, Result};

/// Current on-disk format version, written in every header.
pub const FORMAT_VERSION: u32 = 1;
const MAX_SESSION_ID_LEN: usize = 64;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Record {
    Header {
        version: u32,
        id: String,
        created_at: DateTime<Utc>,
    },
    Turn(ConversationTurn),
    Documents {
        documents: Vec<DocumentMeta>,
    },
    #[serde(other)]
    Unknown,
}

/// Listing entry for [`SessionStore::list`].
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub modified: DateTime<Utc>,
    pub bytes: u64,
}

pub struct SessionStore {
    dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// `[A-Za-z0-9_-]{1,64}`.
pub fn validate_session_id(id: &str) -> Result<()> {
    let ok = !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(Error::CorruptInput(format!(
            "invalid session id '{id}': use 1-64 of A-Z a-z 0-9 _ -"
        )))
    }
}

fn io_error(path: &Path, e: std::io::Error) -> Error {
    Error::CorruptState(format!("{}: {e}", path.display()))
}

/// Truncate `file` back to its last newline. Only writers holding the
/// session lock call this; readers skip the partial line in memory.
fn cut_torn_tail(file: &mut File, id: &str) -> std::io::Result<()> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(());
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))?;
    file.read_exact(&mut last)?;
    if last[0] == b'\n' {
        return Ok(());
    }
    let mut content = Vec::with_capacity(len as usize);
    file.seek(SeekFrom::Start(0))?;
    file.read_to_end(&mut content)?;
    let complete = content
        .iter()
        .rposition(|&b| b == b'\n')
        .map_or(0, |i| i + 1);
    tracing::warn!(
        session_id = id,
        dropped_bytes = content.len() - complete,
        "cutting torn final record before append"
    );
    file.set_len(complete as u64)?;
    file.sync_data()
}

fn encode(record: &Record) -> Result<String> {
    let mut line = serde_json::to_string(record)
        .map_err(|e| Error::CorruptState(format!("cannot encode record: {e}")))?;
    line.push('\n');
    Ok(line)
}

impl SessionStore {
    /// Open (creating if needed) the store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| io_error(&dir, e))?;
        Ok(Self {
            dir,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.jsonl"))
    }

    /// The sequencing lock of session `id`.
    pub fn session_lock(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(id.to_string()).or_default())
    }

    pub fn exists(&self, id: &str) -> bool {
        validate_session_id(id).is_ok() && self.path(id).exists()
    }

    /// Create an empty session on disk. Fails if it already exists.
    pub fn create(&self, id: &str) -> Result<Session> {
        validate_session_id(id)?;
        let session = Session::new(id);
        let path = self.path(id);
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| io_error(&path, e))?;
        let header = encode(&Record::Header {
            version: FORMAT_VERSION,
            id: id.to_string(),
            created_at: session.created_at,
        })?;
        file.write_all(header.as_bytes())
            .and_then(|_| file.sync_data())
            .map_err(|e| io_error(&path, e))?;
        tracing::debug!(session_id = id, "session created");
        Ok(session)
    }

    pub fn load(&self, id: &str) -> Result<Session> {
        validate_session_id(id)?;
        let path = self.path(id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("session {id}")));
            }
            Err(e) => return Err(io_error(&path, e)),
        };
        let complete = bytes
            .iter()
            .rposition(|&b| b == b'\n')
            .map_or(0, |i| i + 1);
        if complete < bytes.len() {
            tracing::warn!(
                session_id = id,
                dropped_bytes = bytes.len() - complete,
                "skipping torn final record"
            );
        }
        let content = std::str::from_utf8(&bytes[..complete])
            .map_err(|_| Error::CorruptState(format!("session {id}: not valid UTF-8")))?;

        let mut header: Option<(String, DateTime<Utc>)> = None;
        let mut turns = Vec::new();
        let mut documents = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: Record = serde_json::from_str(line).map_err(|e| {
                Error::CorruptState(format!("session {id}, line {}: {e}", lineno + 1))
            })?;
            match record {
                Record::Header {
                    version,
                    id: stored,
                    created_at,
                } => {
                    if header.is_some() || lineno != 0 {
                        return Err(Error::CorruptState(format!(
                            "session {id}, line {}: unexpected header",
                            lineno + 1
                        )));
                    }
                    if stored != id {
                        return Err(Error::CorruptState(format!(
                            "session file {id} holds session {stored}"
                        )));
                    }
                    if version > FORMAT_VERSION {
                        tracing::warn!(session_id = id, version, "session written by a newer version");
                    }
                    header = Some((stored, created_at));
                }
                Record::Turn(turn) => turns.push(turn),
                Record::Documents { documents: docs } => documents = docs,
                Record::Unknown => {
                    tracing::debug!(session_id = id, line = lineno + 1, "skipping unknown record");
                }
            }
        }

        let (stored_id, created_at) = header
            .ok_or_else(|| Error::CorruptState(format!("session {id}: missing header")))?;
        Ok(Session::restore(stored_id, created_at, turns, documents))
    }

    pub fn load_or_create(&self, id: &str) -> Result<Session> {
        match self.load(id) {
            // a concurrent create may have won the race
            Err(Error::NotFound(_)) => match self.create(id) {
                Err(_) if self.path(id).exists() => self.load(id),
                created => created,
            },
            other => other,
        }
    }

    fn append_record(&self, id: &str, record: &Record) -> Result<()> {
        validate_session_id(id)?;
        let path = self.path(id);
        let line = encode(record)?;
        let mut file = match OpenOptions::new().read(true).append(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("session {id}")));
            }
            Err(e) => return Err(io_error(&path, e)),
        };
        cut_torn_tail(&mut file, id).map_err(|e| io_error(&path, e))?;
        file.write_all(line.as_bytes())
            .and_then(|_| file.sync_data())
            .map_err(|e| io_error(&path, e))
    }

    /// Durably append one turn. Callers hold [`session_lock`](Self::session_lock).
    pub fn append(&self, id: &str, turn: &ConversationTurn) -> Result<()> {
        self.append_record(id, &Record::Turn(turn.clone()))
    }

    /// Record the session's active documents (the latest record wins).
    pub fn set_documents(&self, id: &str, documents: &[DocumentMeta]) -> Result<()> {
        self.append_record(
            id,
            &Record::Documents {
                documents: documents.to_vec(),
            },
        )
    }

    /// Atomically rewrite session `id` from `session`.
    pub fn save(&self, id: &str, session: &Session) -> Result<()> {
        validate_session_id(id)?;
        if session.id != id {
            return Err(Error::CorruptInput(format!(
                "cannot save session {} as {id}",
                session.id
            )));
        }
        let path = self.path(id);
        let tmp = self.dir.join(format!(".{id}.jsonl.tmp"));

        let mut out = encode(&Record::Header {
            version: FORMAT_VERSION,
            id: session.id.clone(),
            created_at: session.created_at,
        })?;
        for turn in session.turns() {
            out.push_str(&encode(&Record::Turn(turn.clone()))?);
        }
        if !session.documents.is_empty() {
            out.push_str(&encode(&Record::Documents {
                documents: session.documents.clone(),
            })?);
        }

        let mut file = File::create(&tmp).map_err(|e| io_error(&tmp, e))?;
        file.write_all(out.as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|e| io_error(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| io_error(&path, e))?;
        tracing::debug!(session_id = %session.id, turns = session.turns().len(), "session saved");
        Ok(())
    }

    /// All sessions on disk, most recently modified first.
    pub fn list(&self) -> Result<Vec<SessionSummary>> {
        let entries = fs::read_dir(&self.dir).map_err(|e| io_error(&self.dir, e))?;
        let mut out = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| io_error(&self.dir, e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if validate_session_id(id).is_err() {
                continue;
            }
            let meta = entry.metadata().map_err(|e| io_error(&path, e))?;
            let modified = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            out.push(SessionSummary {
                id: id.to_string(),
                modified,
                bytes: meta.len(),
            });
        }
        out.sort_by(|a, b| b.modified.cmp(&a.modified).then(a.id.cmp(&b.id)));
        Ok(out)
    }
}
