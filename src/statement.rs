//! Per-session prepared-statement cache

use std::collections::VecDeque;
use std::sync::Arc;

use crate::session::Statement;

/// Cache key: the SQL together with the session context it was prepared
/// under. Including the active schema keeps statements prepared under one
/// context from aliasing the same SQL under another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StatementKey {
    pub schema: Option<String>,
    pub sql: String,
}

/// Bounded LRU cache of prepared statements.
///
/// Entries are kept in recency order, least recent at the front. Evicted
/// statements are simply dropped; drivers release the server-side handle
/// when the last reference goes away.
pub(crate) struct StatementCache {
    capacity: usize,
    entries: VecDeque<(StatementKey, Arc<dyn Statement>)>,
}

impl StatementCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity.min(16)),
        }
    }

    pub(crate) fn get(&mut self, key: &StatementKey) -> Option<Arc<dyn Statement>> {
        let pos = self.entries.iter().position(|(k, _)| k == key)?;
        let (key, stmt) = self.entries.remove(pos)?;
        self.entries.push_back((key, stmt.clone()));
        Some(stmt)
    }

    pub(crate) fn put(&mut self, key: StatementKey, stmt: Arc<dyn Statement>) {
        if self.capacity == 0 {
            return;
        }
        if let Some(pos) = self.entries.iter().position(|(k, _)| *k == key) {
            self.entries.remove(pos);
        } else if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back((key, stmt));
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::error::Result;

    struct FakeStatement {
        sql: String,
    }

    #[async_trait]
    impl Statement for FakeStatement {
        async fn execute(&self) -> Result<u64> {
            Ok(0)
        }

        fn sql(&self) -> &str {
            &self.sql
        }
    }

    fn stmt(sql: &str) -> Arc<dyn Statement> {
        Arc::new(FakeStatement { sql: sql.into() })
    }

    fn key(schema: Option<&str>, sql: &str) -> StatementKey {
        StatementKey {
            schema: schema.map(Into::into),
            sql: sql.into(),
        }
    }

    #[test]
    fn test_hit_returns_same_artifact() {
        let mut cache = StatementCache::new(4);
        let s = stmt("select 1");
        cache.put(key(None, "select 1"), s.clone());

        let hit = cache.get(&key(None, "select 1")).expect("hit");
        assert!(Arc::ptr_eq(&hit, &s));
    }

    #[test]
    fn test_schema_isolates_entries() {
        let mut cache = StatementCache::new(4);
        let a = stmt("select * from t");
        cache.put(key(Some("tenant_1"), "select * from t"), a.clone());

        assert!(cache.get(&key(Some("tenant_2"), "select * from t")).is_none());
        let hit = cache
            .get(&key(Some("tenant_1"), "select * from t"))
            .expect("hit");
        assert!(Arc::ptr_eq(&hit, &a));
    }

    #[test]
    fn test_lru_eviction() {
        let mut cache = StatementCache::new(2);
        cache.put(key(None, "a"), stmt("a"));
        cache.put(key(None, "b"), stmt("b"));

        // Touch "a" so "b" is the eviction candidate.
        cache.get(&key(None, "a"));
        cache.put(key(None, "c"), stmt("c"));

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&key(None, "a")).is_some());
        assert!(cache.get(&key(None, "b")).is_none());
        assert!(cache.get(&key(None, "c")).is_some());
    }

    #[test]
    fn test_zero_capacity_caches_nothing() {
        let mut cache = StatementCache::new(0);
        cache.put(key(None, "a"), stmt("a"));
        assert!(cache.get(&key(None, "a")).is_none());
    }
}
