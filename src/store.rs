//! Document storage.
//!
//! The [`Store`] trait is the contract the HTTP layer is written against. It is implemented
//! by [`MemoryStore`], a process-local map, and [`RedisStore`], which keeps documents in a
//! redis instance under a key prefix. Both store documents as gzip-compressed JSON
//! [`Envelope`]s.

use std::{borrow::Borrow, collections::BTreeMap, fmt, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::Snafu;

pub mod codec;
pub mod memory;
pub mod redis;

pub use self::{
    codec::{CodecError, Envelope},
    memory::MemoryStore,
    redis::{RedisConfig, RedisStore},
};

/// Errors returned by [`Store`] operations.
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    #[snafu(display("document {id} already exists"))]
    IdCollision { id: DocId },
    #[snafu(display("document {id} does not exist"))]
    NotFound { id: DocId },
    #[snafu(transparent)]
    Codec { source: CodecError },
    #[snafu(display("redis command failed"))]
    Redis { source: ::redis::RedisError },
    #[snafu(display("a non-empty key prefix is required"))]
    InvalidPrefix,
    #[snafu(display("store connection was closed"))]
    Closed,
}

impl StoreError {
    /// Whether the error reports a missing document.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// The ID of a stored document.
///
/// Any non-empty string is a valid ID.
#[derive(
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    derive_more::Display,
    derive_more::Into,
)]
#[serde(try_from = "String", into = "String")]
pub struct DocId(String);

/// Error for [`DocId::new`] when given an empty string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
#[snafu(display("document id must not be empty"))]
pub struct EmptyDocId;

impl DocId {
    /// Creates an ID from a caller-supplied string.
    pub fn new(id: impl Into<String>) -> Result<Self, EmptyDocId> {
        let id = id.into();
        if id.is_empty() {
            return Err(EmptyDocId);
        }
        Ok(Self(id))
    }

    /// Generates a fresh random ID.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// The ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocId({:?})", self.0)
    }
}

impl TryFrom<String> for DocId {
    type Error = EmptyDocId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl std::str::FromStr for DocId {
    type Err = EmptyDocId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for DocId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for DocId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Whether a search query is a glob pattern rather than a plain substring.
pub fn is_glob(query: &str) -> bool {
    query.contains(['?', '*', '['])
}

/// A document store.
///
/// Backends implement the `*_raw` methods, which move [`Envelope`]s in and out of storage.
/// The provided methods encode and decode documents on top of those.
///
/// Every method is asynchronous, including on [`MemoryStore`], which yields to the runtime
/// before returning.
#[async_trait]
pub trait Store: fmt::Debug + Send + Sync + 'static {
    /// Stores `envelope` under `id`, failing with [`StoreError::IdCollision`] if `id` is
    /// taken. An existing entry is never modified.
    async fn insert_raw(&self, id: &DocId, envelope: Envelope) -> Result<(), StoreError>;

    /// Fetches the envelope stored under `id`.
    async fn fetch_raw(&self, id: &DocId) -> Result<Option<Envelope>, StoreError>;

    /// Overwrites the envelope stored under `id`, failing with [`StoreError::NotFound`] if
    /// there is none. Nothing is created in that case.
    async fn replace_raw(&self, id: &DocId, envelope: Envelope) -> Result<(), StoreError>;

    /// Stores every envelope, overwriting existing entries.
    ///
    /// This is a single batch where the backend supports it. There is no rollback if part
    /// of the batch fails.
    async fn bulk_upsert_raw(&self, entries: Vec<(DocId, Envelope)>) -> Result<(), StoreError>;

    /// Removes the document stored under `id`.
    ///
    /// Deleting a missing document succeeds.
    async fn delete(&self, id: &DocId) -> Result<(), StoreError>;

    /// Lists document IDs.
    ///
    /// Without a query all IDs are returned. A query containing `?`, `*` or `[` is a glob
    /// matched against the whole ID (see [`is_glob`]), anything else matches IDs containing
    /// it as a substring. Globs follow redis `MATCH` rules, so no pattern is rejected. The
    /// order of the result is unspecified.
    async fn search(&self, query: Option<&str>) -> Result<Vec<DocId>, StoreError>;

    /// Releases the resources held by the store. Calling it more than once is fine.
    async fn quit(&self) -> Result<(), StoreError>;

    /// Stores a new document under `id`.
    async fn insert(&self, id: &DocId, document: &Value) -> Result<(), StoreError> {
        let envelope = codec::encode(document)?;
        self.insert_raw(id, envelope).await
    }

    /// Stores a new document under `id`, or under a generated ID if `id` is `None`.
    ///
    /// Returns the ID the document was stored under.
    async fn create(&self, id: Option<DocId>, document: &Value) -> Result<DocId, StoreError> {
        let id = id.unwrap_or_else(DocId::generate);
        self.insert(&id, document).await?;
        Ok(id)
    }

    /// Fetches and decodes the document stored under `id`.
    async fn fetch(&self, id: &DocId) -> Result<Option<Value>, StoreError> {
        match self.fetch_raw(id).await? {
            Some(envelope) => Ok(Some(codec::decode(&envelope)?)),
            None => Ok(None),
        }
    }

    /// Replaces the document stored under `id`.
    async fn replace(&self, id: &DocId, document: &Value) -> Result<(), StoreError> {
        let envelope = codec::encode(document)?;
        self.replace_raw(id, envelope).await
    }

    /// Stores every document, creating or overwriting as needed.
    ///
    /// All documents are encoded before anything is written.
    async fn bulk_upsert(&self, documents: &BTreeMap<DocId, Value>) -> Result<(), StoreError> {
        let entries = documents
            .iter()
            .map(|(id, doc)| Ok((id.clone(), codec::encode(doc)?)))
            .collect::<Result<Vec<_>, StoreError>>()?;
        self.bulk_upsert_raw(entries).await
    }
}

/// Selects and configures the store backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StoreConfig {
    /// Keep documents in process memory.
    #[default]
    Memory,
    /// Keep documents in redis.
    Redis(RedisConfig),
}

impl StoreConfig {
    /// Opens the configured store.
    pub async fn open(&self) -> Result<Arc<dyn Store>, StoreError> {
        let store: Arc<dyn Store> = match self {
            Self::Memory => Arc::new(MemoryStore::new()),
            Self::Redis(config) => Arc::new(RedisStore::connect(config).await?),
        };
        Ok(store)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doc_id_rejects_empty() {
        assert_eq!(DocId::new(""), Err(EmptyDocId));
        assert_eq!(
            EmptyDocId.to_string(),
            "document id must not be empty"
        );
        assert_eq!(DocId::new("the-doc").unwrap().as_str(), "the-doc");
        assert!(serde_json::from_str::<DocId>("\"\"").is_err());
        assert_eq!(
            serde_json::from_str::<DocId>("\"x\"").unwrap(),
            DocId::new("x").unwrap()
        );
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = DocId::generate();
        let b = DocId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }

    #[test]
    fn glob_detection() {
        assert!(is_glob("the-??"));
        assert!(is_glob("bulk*"));
        assert!(is_glob("id-[12]"));
        assert!(!is_glob("bulk-id"));
        assert!(!is_glob("a]b"));
    }

    #[test]
    fn store_config_from_toml() {
        let config: StoreConfig = toml::from_str("backend = \"memory\"").unwrap();
        assert!(matches!(config, StoreConfig::Memory));

        let config: StoreConfig = toml::from_str(
            r#"
            backend = "redis"
            host = "redis.internal"
            port = 6380
            prefix = "data/v1:"
            "#,
        )
        .unwrap();
        let StoreConfig::Redis(redis) = config else {
            panic!("expected redis config");
        };
        assert_eq!(redis.host, "redis.internal");
        assert_eq!(redis.port, 6380);
        assert_eq!(redis.prefix, "data/v1:");
    }
}
