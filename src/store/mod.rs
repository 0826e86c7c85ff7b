//! Document store abstraction.
//!
//! Defines the [`DocumentStore`] trait and the plain document model so the walker
//! can run against Firestore or the in-memory store used by tests.

pub mod firestore;
#[cfg(test)]
pub mod memory;

use anyhow::{bail, Result};
use serde_json::{Map, Value};

/// Owner field backfilled onto topics, notes and audios.
pub const USER_ID_FIELD: &str = "userId";
/// Reference list on a user pointing at top-level topics.
pub const CREATED_TOPICS_FIELD: &str = "createdTopics";
pub const SUBTOPICS_FIELD: &str = "subtopics";
pub const NOTES_FIELD: &str = "notes";
pub const AUDIO_FIELD: &str = "audioRecording";

/// Collections the backfill reads from or writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Users,
    Topics,
    Notes,
    Audios,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Users => "users",
            Self::Topics => "topics",
            Self::Notes => "notes",
            Self::Audios => "audios",
        }
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

const MAX_DOCUMENT_ID_BYTES: usize = 1500;

/// Whether `id` can name a single document in a collection: non-empty, no `/`,
/// not `.` or `..`, not `__reserved__`, at most 1500 bytes.
pub fn is_valid_document_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_DOCUMENT_ID_BYTES
        && !id.contains('/')
        && id != "."
        && id != ".."
        && !(id.len() >= 4 && id.starts_with("__") && id.ends_with("__"))
}

/// A fetched document: its id plus its fields decoded to plain JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub fields: Map<String, Value>,
}

impl Document {
    pub fn new(id: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    /// Key presence, not truthiness: a `null` value still counts as present.
    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Whether the document already carries an owner.
    pub fn is_tagged(&self) -> bool {
        self.has_field(USER_ID_FIELD)
    }

    /// Read a reference list. `Ok(None)` when the field is absent, an error when
    /// it is not an array of strings.
    pub fn references(&self, field: &str) -> Result<Option<Vec<String>>> {
        let Some(value) = self.fields.get(field) else {
            return Ok(None);
        };

        let Value::Array(items) = value else {
            bail!(
                "Field '{}' on document {} is not a list: {}",
                field,
                self.id,
                value
            );
        };

        let mut ids = Vec::with_capacity(items.len());
        for item in items {
            match item {
                Value::String(id) => ids.push(id.clone()),
                other => bail!(
                    "Field '{}' on document {} holds a non-string reference: {}",
                    field,
                    self.id,
                    other
                ),
            }
        }

        Ok(Some(ids))
    }
}

/// Primitives the backfill consumes from a remote document store.
#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync {
    /// Every document in a collection.
    async fn list_documents(&self, collection: Collection) -> Result<Vec<Document>>;

    /// One document by id; `None` when it does not exist.
    async fn get_document(&self, collection: Collection, id: &str) -> Result<Option<Document>>;

    /// Set a string field on an existing document. Must not create the document.
    async fn set_field(
        &self,
        collection: Collection,
        id: &str,
        field: &str,
        value: &str,
    ) -> Result<()>;

    /// Remove every occurrence of `values` from an array field.
    async fn remove_from_array(
        &self,
        collection: Collection,
        id: &str,
        field: &str,
        values: &[String],
    ) -> Result<()>;
}
