//! In-memory [`DocumentStore`] for tests. Records every write and can be told to
//! fail reads of, or writes to, specific documents.

use super::{Collection, Document, DocumentStore};
use anyhow::{bail, Result};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::RwLock;

/// A write the store received.
#[derive(Debug, Clone, PartialEq)]
pub enum Write {
    SetField {
        collection: Collection,
        id: String,
        field: String,
        value: String,
    },
    RemoveFromArray {
        collection: Collection,
        id: String,
        field: String,
        values: Vec<String>,
    },
}

#[derive(Default)]
pub struct MemoryStore {
    docs: RwLock<BTreeMap<(&'static str, String), Map<String, Value>>>,
    writes: RwLock<Vec<Write>>,
    failing_reads: RwLock<HashSet<(&'static str, String)>>,
    failing_writes: RwLock<HashSet<(&'static str, String)>>,
    rejected_writes: RwLock<Vec<Write>>,
    gets: RwLock<Vec<(Collection, String)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a document; `fields` must be a JSON object.
    pub fn insert(&self, collection: Collection, id: &str, fields: Value) {
        let Value::Object(map) = fields else {
            panic!("fields must be a JSON object");
        };
        self.docs
            .write()
            .unwrap()
            .insert((collection.as_str(), id.to_string()), map);
    }

    /// Make `get_document` fail for this document.
    pub fn fail_reads_of(&self, collection: Collection, id: &str) {
        self.failing_reads
            .write()
            .unwrap()
            .insert((collection.as_str(), id.to_string()));
    }

    /// Make `set_field` and `remove_from_array` fail for this document.
    pub fn fail_writes_to(&self, collection: Collection, id: &str) {
        self.failing_writes
            .write()
            .unwrap()
            .insert((collection.as_str(), id.to_string()));
    }

    /// Writes refused by [`MemoryStore::fail_writes_to`], in order.
    pub fn rejected_writes(&self) -> Vec<Write> {
        self.rejected_writes.read().unwrap().clone()
    }

    /// Record the attempt and refuse it if the document was marked failing.
    fn check_write(&self, collection: Collection, id: &str, write: &Write) -> Result<()> {
        if self
            .failing_writes
            .read()
            .unwrap()
            .contains(&(collection.as_str(), id.to_string()))
        {
            self.rejected_writes.write().unwrap().push(write.clone());
            bail!("injected write failure for {}/{}", collection, id);
        }
        Ok(())
    }

    pub fn field(&self, collection: Collection, id: &str, field: &str) -> Option<Value> {
        self.docs
            .read()
            .unwrap()
            .get(&(collection.as_str(), id.to_string()))
            .and_then(|m| m.get(field).cloned())
    }

    pub fn writes(&self) -> Vec<Write> {
        self.writes.read().unwrap().clone()
    }

    pub fn clear_writes(&self) {
        self.writes.write().unwrap().clear();
    }

    /// Every `get_document` call, in order.
    pub fn gets(&self) -> Vec<(Collection, String)> {
        self.gets.read().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl DocumentStore for MemoryStore {
    async fn list_documents(&self, collection: Collection) -> Result<Vec<Document>> {
        Ok(self
            .docs
            .read()
            .unwrap()
            .iter()
            .filter(|((c, _), _)| *c == collection.as_str())
            .map(|((_, id), fields)| Document::new(id.clone(), fields.clone()))
            .collect())
    }

    async fn get_document(&self, collection: Collection, id: &str) -> Result<Option<Document>> {
        self.gets
            .write()
            .unwrap()
            .push((collection, id.to_string()));

        let key = (collection.as_str(), id.to_string());
        if self.failing_reads.read().unwrap().contains(&key) {
            bail!("injected read failure for {}/{}", collection, id);
        }

        Ok(self
            .docs
            .read()
            .unwrap()
            .get(&key)
            .map(|fields| Document::new(id, fields.clone())))
    }

    async fn set_field(
        &self,
        collection: Collection,
        id: &str,
        field: &str,
        value: &str,
    ) -> Result<()> {
        let write = Write::SetField {
            collection,
            id: id.to_string(),
            field: field.to_string(),
            value: value.to_string(),
        };
        self.check_write(collection, id, &write)?;

        let mut docs = self.docs.write().unwrap();
        let Some(doc) = docs.get_mut(&(collection.as_str(), id.to_string())) else {
            bail!("{}/{} does not exist", collection, id);
        };
        doc.insert(field.to_string(), Value::String(value.to_string()));

        self.writes.write().unwrap().push(write);
        Ok(())
    }

    async fn remove_from_array(
        &self,
        collection: Collection,
        id: &str,
        field: &str,
        values: &[String],
    ) -> Result<()> {
        let write = Write::RemoveFromArray {
            collection,
            id: id.to_string(),
            field: field.to_string(),
            values: values.to_vec(),
        };
        self.check_write(collection, id, &write)?;

        let mut docs = self.docs.write().unwrap();
        let Some(doc) = docs.get_mut(&(collection.as_str(), id.to_string())) else {
            bail!("{}/{} does not exist", collection, id);
        };
        if let Some(Value::Array(items)) = doc.get_mut(field) {
            items.retain(|item| !matches!(item, Value::String(s) if values.contains(s)));
        }

        self.writes.write().unwrap().push(write);
        Ok(())
    }
}
