//! In-memory document store.

use std::collections::HashMap;

use async_trait::async_trait;
use globset::{GlobBuilder, GlobMatcher};
use parking_lot::Mutex;

use super::{DocId, Envelope, IdCollisionSnafu, NotFoundSnafu, Store, StoreError, is_glob};

/// A [`Store`] backed by a process-local map.
///
/// Documents are encoded into envelopes just like with the redis backend, so both behave
/// the same. Each operation holds the lock for its whole check-and-write. Nothing is
/// persisted.
#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: Mutex<HashMap<DocId, Envelope>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_raw(&self, id: &DocId, envelope: Envelope) -> Result<(), StoreError> {
        let res = {
            let mut docs = self.docs.lock();
            if docs.contains_key(id) {
                IdCollisionSnafu { id: id.clone() }.fail()
            } else {
                docs.insert(id.clone(), envelope);
                Ok(())
            }
        };
        tokio::task::yield_now().await;
        res
    }

    async fn fetch_raw(&self, id: &DocId) -> Result<Option<Envelope>, StoreError> {
        let envelope = self.docs.lock().get(id).cloned();
        tokio::task::yield_now().await;
        Ok(envelope)
    }

    async fn replace_raw(&self, id: &DocId, envelope: Envelope) -> Result<(), StoreError> {
        let res = match self.docs.lock().get_mut(id) {
            Some(entry) => {
                *entry = envelope;
                Ok(())
            }
            None => NotFoundSnafu { id: id.clone() }.fail(),
        };
        tokio::task::yield_now().await;
        res
    }

    async fn bulk_upsert_raw(&self, entries: Vec<(DocId, Envelope)>) -> Result<(), StoreError> {
        self.docs.lock().extend(entries);
        tokio::task::yield_now().await;
        Ok(())
    }

    async fn delete(&self, id: &DocId) -> Result<(), StoreError> {
        self.docs.lock().remove(id);
        tokio::task::yield_now().await;
        Ok(())
    }

    async fn search(&self, query: Option<&str>) -> Result<Vec<DocId>, StoreError> {
        let matcher = query.map(IdMatcher::new);
        let ids = self
            .docs
            .lock()
            .keys()
            .filter(|id| matcher.as_ref().is_none_or(|m| m.matches(id.as_str())))
            .cloned()
            .collect();
        tokio::task::yield_now().await;
        Ok(ids)
    }

    async fn quit(&self) -> Result<(), StoreError> {
        tokio::task::yield_now().await;
        Ok(())
    }
}

/// Matches IDs against a search query, the same way redis `SCAN MATCH` does.
///
/// Redis accepts every pattern, so no query is an error here either.
#[derive(Debug)]
enum IdMatcher {
    Substring(String),
    Glob(GlobMatcher),
    Exact(String),
    Nothing,
}

impl IdMatcher {
    fn new(query: &str) -> Self {
        if !is_glob(query) {
            return Self::Substring(query.to_string());
        }
        let Some(pattern) = redis_glob_to_globset(query) else {
            return Self::Nothing;
        };
        match GlobBuilder::new(&pattern)
            .literal_separator(false)
            .backslash_escape(true)
            .build()
        {
            Ok(glob) => Self::Glob(glob.compile_matcher()),
            Err(_) => Self::Exact(query.to_string()),
        }
    }

    fn matches(&self, id: &str) -> bool {
        match self {
            Self::Substring(s) => id.contains(s.as_str()),
            Self::Glob(glob) => glob.is_match(id),
            Self::Exact(s) => id == s,
            Self::Nothing => false,
        }
    }
}

/// A character class being translated.
#[derive(Debug, Clone, Copy)]
struct Class {
    /// Offset of the class in the output.
    start: usize,
    negated: bool,
    /// Whether the class holds a literal `!`, emitted last so globset does not read it as
    /// negation.
    bang: bool,
}

/// Rewrites a redis-style glob into globset syntax.
///
/// Braces are literal in redis but alternations in globset, and redis negates a class with
/// `[^...]` where globset uses `[!...]`. Redis also collapses runs of `*`, swaps reversed
/// ranges, closes a class left open at the end of the pattern and matches a trailing `\`
/// literally. Returns `None` for patterns that cannot match anything, i.e. those with an
/// empty class.
fn redis_glob_to_globset(pattern: &str) -> Option<String> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::with_capacity(pattern.len() + 4);
    let mut class: Option<Class> = None;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        i += 1;
        match (c, class) {
            ('\\', _) => match chars.get(i) {
                Some(&next) => {
                    out.push('\\');
                    out.push(next);
                    i += 1;
                }
                None => out.push_str("\\\\"),
            },
            (']', Some(open)) => {
                close_class(&mut out, open)?;
                class = None;
            }
            ('!', Some(open)) if !open.negated && out.len() == open.start + 1 => {
                class = Some(Class { bang: true, ..open });
            }
            (from, Some(_))
                if chars.get(i) == Some(&'-') && chars.get(i + 1).is_some_and(|&d| d != ']') =>
            {
                let to = chars[i + 1];
                let (lo, hi) = if from <= to { (from, to) } else { (to, from) };
                out.push(lo);
                out.push('-');
                out.push(hi);
                i += 2;
            }
            ('[', None) => {
                let negated = chars.get(i) == Some(&'^');
                if negated {
                    i += 1;
                }
                class = Some(Class {
                    start: out.len(),
                    negated,
                    bang: false,
                });
                out.push_str(if negated { "[!" } else { "[" });
            }
            ('*', None) => {
                while chars.get(i) == Some(&'*') {
                    i += 1;
                }
                out.push('*');
            }
            ('{' | '}', None) => {
                out.push('[');
                out.push(c);
                out.push(']');
            }
            (c, _) => out.push(c),
        }
    }
    if let Some(open) = class {
        close_class(&mut out, open)?;
    }
    Some(out)
}

/// Terminates `class`. An empty class matches no character, an empty negated one any.
fn close_class(out: &mut String, class: Class) -> Option<()> {
    let opener = if class.negated { 2 } else { 1 };
    if out.len() == class.start + opener && !class.bang {
        if !class.negated {
            return None;
        }
        out.truncate(class.start);
        out.push('?');
        return Some(());
    }
    if class.bang {
        out.push('!');
    }
    out.push(']');
    Some(())
}

#[cfg(test)]
mod tests {
    use std::{
        future::Future,
        pin::pin,
        sync::Arc,
        task::{Context, Poll, Waker},
    };

    use serde_json::json;
    use testresult::TestResult;

    use super::*;
    use crate::store::contract;

    #[tokio::test]
    async fn insert_collision_keeps_first() -> TestResult {
        contract::insert_collision_keeps_first(&MemoryStore::new()).await
    }

    #[tokio::test]
    async fn replace_requires_existing() -> TestResult {
        contract::replace_requires_existing(&MemoryStore::new()).await
    }

    #[tokio::test]
    async fn delete_is_idempotent() -> TestResult {
        contract::delete_is_idempotent(&MemoryStore::new()).await
    }

    #[tokio::test]
    async fn search_by_substring_and_glob() -> TestResult {
        contract::search_by_substring_and_glob(&MemoryStore::new()).await
    }

    #[tokio::test]
    async fn bulk_upsert_overwrites_and_creates() -> TestResult {
        contract::bulk_upsert_overwrites_and_creates(&MemoryStore::new()).await
    }

    #[tokio::test]
    async fn document_lifecycle() -> TestResult {
        contract::document_lifecycle(&MemoryStore::new()).await
    }

    #[tokio::test]
    async fn operations_never_complete_on_first_poll() -> TestResult {
        let store = MemoryStore::new();
        let id = contract::id("the-id");
        let doc = contract::doc();
        let mut cx = Context::from_waker(Waker::noop());

        let mut insert = pin!(store.insert(&id, &doc));
        assert!(insert.as_mut().poll(&mut cx).is_pending());
        insert.await?;

        let mut fetch = pin!(store.fetch(&id));
        assert!(fetch.as_mut().poll(&mut cx).is_pending());
        assert_eq!(fetch.await?, Some(doc.clone()));

        let mut delete = pin!(store.delete(&id));
        assert!(matches!(delete.as_mut().poll(&mut cx), Poll::Pending));
        delete.await?;
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_inserts_admit_one_winner() -> TestResult {
        let store = Arc::new(MemoryStore::new());
        let id = contract::id("contended");
        let tasks = (0..16)
            .map(|i| {
                let store = store.clone();
                let id = id.clone();
                tokio::spawn(async move { store.insert(&id, &json!({ "writer": i })).await })
            })
            .collect::<Vec<_>>();
        let mut winners = 0;
        for task in tasks {
            match task.await? {
                Ok(()) => winners += 1,
                Err(StoreError::IdCollision { .. }) => {}
                Err(err) => return Err(err.into()),
            }
        }
        assert_eq!(winners, 1);
        Ok(())
    }

    #[test]
    fn redis_globs_redis_glob_to_globset() {
        assert_eq!(redis_glob_to_globset("the-??").as_deref(), Some("the-??"));
        assert_eq!(redis_glob_to_globset("id-[^0]").as_deref(), Some("id-[!0]"));
        assert_eq!(redis_glob_to_globset("{a,b}*").as_deref(), Some("[{]a,b[}]*"));
        assert_eq!(redis_glob_to_globset("a\\*b").as_deref(), Some("a\\*b"));
        assert_eq!(redis_glob_to_globset("a**b").as_deref(), Some("a*b"));
        assert_eq!(redis_glob_to_globset("id-[z-a]").as_deref(), Some("id-[a-z]"));
        assert_eq!(redis_glob_to_globset("[!x]").as_deref(), Some("[x!]"));
        assert_eq!(redis_glob_to_globset("id-[ab").as_deref(), Some("id-[ab]"));
        assert_eq!(redis_glob_to_globset("id-[^").as_deref(), Some("id-?"));
        assert_eq!(redis_glob_to_globset("id-*\\").as_deref(), Some("id-*\\\\"));
        assert_eq!(redis_glob_to_globset("id-["), None);
        assert_eq!(redis_glob_to_globset("id-[]x"), None);
    }

    #[test]
    fn matcher_semantics() {
        let m = IdMatcher::new("id-[^0]");
        assert!(m.matches("id-1"));
        assert!(!m.matches("id-0"));

        let m = IdMatcher::new("docs/*");
        assert!(m.matches("docs/a/b"));

        let m = IdMatcher::new("{x}*");
        assert!(m.matches("{x}-literal"));
        assert!(!m.matches("x-literal"));

        let m = IdMatcher::new("a/b");
        assert!(m.matches("xa/by"));

        let m = IdMatcher::new("[!x]");
        assert!(m.matches("!"));
        assert!(m.matches("x"));
        assert!(!m.matches("y"));
    }

    #[test]
    fn malformed_globs_still_match() {
        let m = IdMatcher::new("id-[");
        assert!(!m.matches("id-"));
        assert!(!m.matches("id-["));

        let m = IdMatcher::new("id-[12");
        assert!(m.matches("id-1"));
        assert!(!m.matches("id-3"));

        let m = IdMatcher::new("id**");
        assert!(m.matches("id-3"));

        let m = IdMatcher::new("id-[^");
        assert!(m.matches("id-x"));
        assert!(!m.matches("id-xy"));
    }
}
