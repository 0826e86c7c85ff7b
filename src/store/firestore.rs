//! Firestore REST client implementing [`DocumentStore`].

use super::{is_valid_document_id, Collection, Document, DocumentStore};
use crate::auth::Credentials;
use anyhow::{anyhow, bail, Context, Result};
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

const FIRESTORE_HOST: &str = "https://firestore.googleapis.com";

/// Firestore client bound to one project/database.
pub struct FirestoreClient {
    client: Client,
    credentials: Credentials,
    /// `{host}/v1/projects/{p}/databases/{d}/documents`
    base_url: String,
    /// `projects/{p}/databases/{d}/documents`
    root_name: String,
    page_size: u32,
}

#[derive(Deserialize)]
struct RawDocument {
    name: String,
    #[serde(default)]
    fields: Map<String, Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    documents: Vec<RawDocument>,
    #[serde(default)]
    next_page_token: Option<String>,
}

impl FirestoreClient {
    /// `emulator_host` switches to plain HTTP against a local emulator.
    pub fn new(
        client: Client,
        credentials: Credentials,
        project_id: &str,
        database: &str,
        emulator_host: Option<&str>,
        page_size: u32,
    ) -> Self {
        let host = match emulator_host {
            Some(h) => format!("http://{}", h),
            None => FIRESTORE_HOST.to_string(),
        };
        let root_name = format!("projects/{}/databases/{}/documents", project_id, database);

        Self {
            client,
            credentials,
            base_url: format!("{}/v1/{}", host, root_name),
            root_name,
            page_size,
        }
    }

    /// Collection URL, with each segment percent-encoded.
    fn collection_url(&self, collection: Collection) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)
            .with_context(|| format!("Invalid Firestore base URL: {}", self.base_url))?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("Firestore base URL cannot hold a path: {}", self.base_url))?
            .push(collection.as_str());
        Ok(url)
    }

    /// Document URL. The id is pushed as one encoded segment, so `?`, `#` or `%`
    /// in an id can never change which document is addressed.
    fn document_url(&self, collection: Collection, id: &str) -> Result<Url> {
        ensure_document_id(collection, id)?;
        let mut url = self.collection_url(collection)?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("Firestore base URL cannot hold a path: {}", self.base_url))?
            .push(id);
        Ok(url)
    }

    /// Resource name used inside request bodies.
    fn document_name(&self, collection: Collection, id: &str) -> Result<String> {
        ensure_document_id(collection, id)?;
        Ok(format!("{}/{}/{}", self.root_name, collection, id))
    }

    async fn authorized(&self, builder: RequestBuilder) -> Result<RequestBuilder> {
        let token = self.credentials.bearer(&self.client).await?;
        Ok(builder.bearer_auth(token))
    }

    async fn commit(&self, writes: Value) -> Result<()> {
        let url = format!("{}:commit", self.base_url);
        let resp = self
            .authorized(self.client.post(&url))
            .await?
            .json(&json!({ "writes": writes }))
            .send()
            .await
            .context("Firestore commit request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("Firestore commit failed: {} - {}", status, text);
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl DocumentStore for FirestoreClient {
    async fn list_documents(&self, collection: Collection) -> Result<Vec<Document>> {
        let url = self.collection_url(collection)?;
        let page_size = self.page_size.to_string();
        let mut documents = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![("pageSize", page_size.as_str())];
            if let Some(ref token) = page_token {
                query.push(("pageToken", token.as_str()));
            }

            let resp = self
                .authorized(self.client.get(url.clone()).query(&query))
                .await?
                .send()
                .await
                .with_context(|| format!("Failed to list {}", collection))?;

            if !resp.status().is_success() {
                let status = resp.status();
                let text = resp.text().await.unwrap_or_default();
                bail!("Firestore list {} failed: {} - {}", collection, status, text);
            }

            let page: ListResponse = resp
                .json()
                .await
                .with_context(|| format!("Failed to parse {} page", collection))?;

            for raw in page.documents {
                documents.push(decode_document(raw)?);
            }

            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        debug!("Listed {} documents from {}", documents.len(), collection);
        Ok(documents)
    }

    async fn get_document(&self, collection: Collection, id: &str) -> Result<Option<Document>> {
        let resp = self
            .authorized(self.client.get(self.document_url(collection, id)?))
            .await?
            .send()
            .await
            .with_context(|| format!("Failed to fetch {}/{}", collection, id))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("Firestore GET {}/{} failed: {} - {}", collection, id, status, text);
        }

        let raw: RawDocument = resp
            .json()
            .await
            .with_context(|| format!("Failed to parse {}/{}", collection, id))?;

        decode_document(raw).map(Some)
    }

    async fn set_field(
        &self,
        collection: Collection,
        id: &str,
        field: &str,
        value: &str,
    ) -> Result<()> {
        let body = json!({ "fields": { field: { "stringValue": value } } });

        let resp = self
            .authorized(self.client.patch(self.document_url(collection, id)?))
            .await?
            .query(&[
                ("updateMask.fieldPaths", field),
                ("currentDocument.exists", "true"),
            ])
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Failed to update {}/{}", collection, id))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!(
                "Firestore update {}/{}.{} failed: {} - {}",
                collection,
                id,
                field,
                status,
                text
            );
        }

        debug!("Set {}/{}.{}", collection, id, field);
        Ok(())
    }

    async fn remove_from_array(
        &self,
        collection: Collection,
        id: &str,
        field: &str,
        values: &[String],
    ) -> Result<()> {
        let values: Vec<Value> = values
            .iter()
            .map(|v| json!({ "stringValue": v }))
            .collect();

        let writes = json!([{
            "transform": {
                "document": self.document_name(collection, id)?,
                "fieldTransforms": [{
                    "fieldPath": field,
                    "removeAllFromArray": { "values": values },
                }],
            },
            "currentDocument": { "exists": true },
        }]);

        self.commit(writes)
            .await
            .with_context(|| format!("Failed to prune {}/{}.{}", collection, id, field))
    }
}

fn ensure_document_id(collection: Collection, id: &str) -> Result<()> {
    if !is_valid_document_id(id) {
        bail!("Invalid document id for {}: {:?}", collection, id);
    }
    Ok(())
}

/// Turn a REST document into the plain model; the id is the last path segment.
fn decode_document(raw: RawDocument) -> Result<Document> {
    let id = raw
        .name
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow!("Document name has no id: {}", raw.name))?
        .to_string();

    let mut fields = Map::with_capacity(raw.fields.len());
    for (key, value) in raw.fields {
        let decoded =
            decode_value(&value).with_context(|| format!("Bad value for field '{}' in {}", key, id))?;
        fields.insert(key, decoded);
    }

    Ok(Document::new(id, fields))
}

/// Decode a Firestore typed value (`{"stringValue": "x"}`, ...) into plain JSON.
pub fn decode_value(value: &Value) -> Result<Value> {
    let obj = value
        .as_object()
        .ok_or_else(|| anyhow!("Expected a typed value object, got {}", value))?;
    let (kind, inner) = obj
        .iter()
        .next()
        .ok_or_else(|| anyhow!("Empty typed value"))?;

    let decoded = match kind.as_str() {
        "nullValue" => Value::Null,
        "booleanValue" | "doubleValue" => inner.clone(),
        // int64 travels as a decimal string
        "integerValue" => match inner {
            Value::String(s) => s
                .parse::<i64>()
                .map(Value::from)
                .with_context(|| format!("Bad integerValue: {}", s))?,
            other => other.clone(),
        },
        "stringValue" | "timestampValue" | "referenceValue" | "bytesValue" => inner.clone(),
        "geoPointValue" => inner.clone(),
        "arrayValue" => {
            let items = inner
                .get("values")
                .and_then(Value::as_array)
                .map(|vals| vals.iter().map(decode_value).collect::<Result<Vec<_>>>())
                .transpose()?
                .unwrap_or_default();
            Value::Array(items)
        }
        "mapValue" => {
            let mut map = Map::new();
            if let Some(fields) = inner.get("fields").and_then(Value::as_object) {
                for (k, v) in fields {
                    map.insert(k.clone(), decode_value(v)?);
                }
            }
            Value::Object(map)
        }
        other => bail!("Unknown Firestore value type: {}", other),
    };

    Ok(decoded)
}
