//! Redis document store.

use std::{collections::BTreeSet, time::Duration};

use async_trait::async_trait;
use parking_lot::RwLock;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, ensure};

use super::{
    ClosedSnafu, DocId, Envelope, IdCollisionSnafu, InvalidPrefixSnafu, NotFoundSnafu,
    RedisSnafu, Store, StoreError, is_glob,
};

/// Number of keys redis is asked to inspect per `SCAN` round trip.
const SCAN_COUNT: usize = 1000;

/// Config for the redis backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis host. Ignored if `url` is set.
    #[serde(default = "defaults::host")]
    pub host: String,
    /// Redis port. Ignored if `url` is set.
    #[serde(default = "defaults::port")]
    pub port: u16,
    /// Prefix prepended to every document ID to form the redis key.
    ///
    /// Must not be empty. Stores sharing one redis instance stay apart by using different
    /// prefixes.
    pub prefix: String,
    /// Optional connection URL, e.g. `redis://:password@host:6379/2`.
    #[serde(default)]
    pub url: Option<String>,
    /// Timeout for establishing the connection.
    #[serde(default, with = "humantime_serde")]
    pub connection_timeout: Option<Duration>,
    /// Timeout for each command's response.
    #[serde(default, with = "humantime_serde")]
    pub response_timeout: Option<Duration>,
}

mod defaults {
    pub(super) fn host() -> String {
        "127.0.0.1".to_string()
    }

    pub(super) fn port() -> u16 {
        6379
    }
}

impl RedisConfig {
    /// Config for a redis on `host:port` with the given key prefix.
    pub fn new(host: impl Into<String>, port: u16, prefix: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            prefix: prefix.into(),
            url: None,
            connection_timeout: None,
            response_timeout: None,
        }
    }
}

/// A [`Store`] keeping envelopes in redis.
///
/// All calls share one multiplexed connection, which reconnects on its own after
/// connection loss. Failed commands are not retried.
#[derive(derive_more::Debug)]
pub struct RedisStore {
    #[debug("ConnectionManager")]
    conn: RwLock<Option<ConnectionManager>>,
    prefix: String,
}

impl RedisStore {
    /// Connects to the redis instance described by `config`.
    pub async fn connect(config: &RedisConfig) -> Result<Self, StoreError> {
        ensure!(!config.prefix.is_empty(), InvalidPrefixSnafu);
        let client = match &config.url {
            Some(url) => redis::Client::open(url.as_str()),
            None => redis::Client::open((config.host.clone(), config.port)),
        }
        .context(RedisSnafu)?;

        let mut manager_config = ConnectionManagerConfig::new();
        if let Some(timeout) = config.connection_timeout {
            manager_config = manager_config.set_connection_timeout(timeout);
        }
        if let Some(timeout) = config.response_timeout {
            manager_config = manager_config.set_response_timeout(timeout);
        }
        let conn = ConnectionManager::new_with_config(client, manager_config)
            .await
            .context(RedisSnafu)?;
        Self::with_connection(conn, config.prefix.clone())
    }

    /// Creates a store on top of an existing connection.
    pub fn with_connection(
        conn: ConnectionManager,
        prefix: impl Into<String>,
    ) -> Result<Self, StoreError> {
        let prefix = prefix.into();
        ensure!(!prefix.is_empty(), InvalidPrefixSnafu);
        Ok(Self {
            conn: RwLock::new(Some(conn)),
            prefix,
        })
    }

    /// The key prefix of this store.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn connection(&self) -> Result<ConnectionManager, StoreError> {
        self.conn.read().clone().context(ClosedSnafu)
    }

    fn key(&self, id: &DocId) -> String {
        format!("{}{}", self.prefix, id)
    }
}

/// The `SCAN MATCH` pattern for a search query, starting with the escaped prefix.
fn scan_pattern(prefix: &str, query: Option<&str>) -> String {
    let mut pattern = escape_glob(prefix);
    match query {
        None => pattern.push('*'),
        Some(q) if is_glob(q) => pattern.push_str(q),
        Some(q) => {
            pattern.push('*');
            pattern.push_str(&escape_glob(q));
            pattern.push('*');
        }
    }
    pattern
}

/// Escapes redis glob metacharacters so `s` only matches itself.
fn escape_glob(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[async_trait]
impl Store for RedisStore {
    async fn insert_raw(&self, id: &DocId, envelope: Envelope) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.key(id))
            .arg(envelope.as_bytes())
            .arg("NX")
            .query_async(&mut conn)
            .await
            .context(RedisSnafu)?;
        // a nil reply means the key already existed
        reply
            .map(|_| ())
            .context(IdCollisionSnafu { id: id.clone() })
    }

    async fn fetch_raw(&self, id: &DocId) -> Result<Option<Envelope>, StoreError> {
        let mut conn = self.connection()?;
        let reply: Option<Vec<u8>> = redis::cmd("GET")
            .arg(self.key(id))
            .query_async(&mut conn)
            .await
            .context(RedisSnafu)?;
        Ok(reply.map(Envelope::from))
    }

    async fn replace_raw(&self, id: &DocId, envelope: Envelope) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.key(id))
            .arg(envelope.as_bytes())
            .arg("XX")
            .query_async(&mut conn)
            .await
            .context(RedisSnafu)?;
        reply.map(|_| ()).context(NotFoundSnafu { id: id.clone() })
    }

    async fn bulk_upsert_raw(&self, entries: Vec<(DocId, Envelope)>) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection()?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (id, envelope) in &entries {
            pipe.cmd("SET")
                .arg(self.key(id))
                .arg(envelope.as_bytes())
                .ignore();
        }
        let () = pipe.query_async(&mut conn).await.context(RedisSnafu)?;
        Ok(())
    }

    async fn delete(&self, id: &DocId) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        let _removed: u64 = redis::cmd("DEL")
            .arg(self.key(id))
            .query_async(&mut conn)
            .await
            .context(RedisSnafu)?;
        Ok(())
    }

    async fn search(&self, query: Option<&str>) -> Result<Vec<DocId>, StoreError> {
        let mut conn = self.connection()?;
        let pattern = scan_pattern(&self.prefix, query);
        // SCAN may report a key more than once
        let mut ids = BTreeSet::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await
                .context(RedisSnafu)?;
            ids.extend(
                keys.into_iter()
                    .filter_map(|key| DocId::new(key.strip_prefix(&self.prefix)?).ok()),
            );
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(ids.into_iter().collect())
    }

    async fn quit(&self) -> Result<(), StoreError> {
        // dropping the last handle closes the connection
        self.conn.write().take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use testresult::TestResult;
    use tracing_test::traced_test;

    use super::*;
    use crate::store::contract;

    /// Integration tests run against the redis at this URL, and are skipped if it is unset.
    const REDIS_URL_ENV: &str = "DOCSTORE_TEST_REDIS_URL";

    /// Connects with a fresh prefix, so tests sharing a redis do not see each other's keys.
    async fn test_store() -> TestResult<Option<RedisStore>> {
        let Ok(url) = std::env::var(REDIS_URL_ENV) else {
            eprintln!("{REDIS_URL_ENV} not set, skipping redis test");
            return Ok(None);
        };
        let prefix = format!("docstore-test/{}:", DocId::generate());
        let mut config = RedisConfig::new("unused", 0, prefix);
        config.url = Some(url);
        config.response_timeout = Some(Duration::from_secs(5));
        Ok(Some(RedisStore::connect(&config).await?))
    }

    async fn cleanup(store: RedisStore) -> TestResult {
        for id in store.search(None).await? {
            store.delete(&id).await?;
        }
        store.quit().await?;
        Ok(())
    }

    macro_rules! contract_test {
        ($name:ident) => {
            #[tokio::test]
            #[traced_test]
            async fn $name() -> TestResult {
                let Some(store) = test_store().await? else {
                    return Ok(());
                };
                contract::$name(&store).await?;
                cleanup(store).await
            }
        };
    }

    contract_test!(insert_collision_keeps_first);
    contract_test!(replace_requires_existing);
    contract_test!(delete_is_idempotent);
    contract_test!(search_by_substring_and_glob);
    contract_test!(bulk_upsert_overwrites_and_creates);
    contract_test!(document_lifecycle);

    #[tokio::test]
    #[traced_test]
    async fn prefix_isolates_stores() -> TestResult {
        let Some(a) = test_store().await? else {
            return Ok(());
        };
        let Some(b) = test_store().await? else {
            return Ok(());
        };
        let id = contract::id("shared-name");
        a.insert(&id, &json!({"store": "a"})).await?;
        b.insert(&id, &json!({"store": "b"})).await?;
        assert_eq!(a.fetch(&id).await?, Some(json!({"store": "a"})));
        assert_eq!(b.search(None).await?, vec![id.clone()]);
        cleanup(a).await?;
        cleanup(b).await
    }

    #[tokio::test]
    #[traced_test]
    async fn operations_fail_after_quit() -> TestResult {
        let Some(store) = test_store().await? else {
            return Ok(());
        };
        store.quit().await?;
        store.quit().await?;
        let err = store.fetch(&contract::id("any")).await.unwrap_err();
        assert!(matches!(err, StoreError::Closed), "{err:?}");
        Ok(())
    }

    #[test]
    fn glob_metacharacters_are_escaped() {
        assert_eq!(escape_glob("data-test/v1:"), "data-test/v1:");
        assert_eq!(escape_glob("a*b?[c]\\"), "a\\*b\\?\\[c\\]\\\\");
    }

    #[test]
    fn scan_patterns() {
        assert_eq!(scan_pattern("data/v1:", None), "data/v1:*");
        assert_eq!(scan_pattern("data/v1:", Some("bulk-id")), "data/v1:*bulk-id*");
        assert_eq!(scan_pattern("data/v1:", Some("the-??")), "data/v1:the-??");
        assert_eq!(scan_pattern("[x]:", Some("a]b")), "\\[x\\]:*a\\]b*");
    }

    #[test]
    fn config_defaults_and_timeouts() -> TestResult {
        let config: RedisConfig = toml::from_str(
            r#"
            prefix = "data/v1:"
            response_timeout = "250ms"
            "#,
        )?;
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 6379);
        assert_eq!(config.response_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.connection_timeout, None);
        Ok(())
    }
}
