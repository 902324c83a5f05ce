use crate::oracle::client::{OracleError, OracleExchange, StructureOracle};
use crate::oracle::prompt::PROMPT_VERSION;
use crate::storage::{calculate_exchange_hash, ResponseStorage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Version constants for cache invalidation
pub mod versions {
    pub const BOOKMAP_VERSION: &str = env!("CARGO_PKG_VERSION");
    pub const ORACLE_CACHE_VERSION: &str = "1";
}

/// Key of one cached oracle reply: the full exchange plus everything that
/// changes what the oracle would say to it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct OracleCacheKey {
    pub exchange_hash: String,
    pub model: String,
    pub prompt_version: String,
    pub bookmap_version: String,
}

impl OracleCacheKey {
    pub fn new(exchange: &OracleExchange, model: &str) -> Self {
        Self {
            exchange_hash: calculate_exchange_hash(exchange),
            model: model.to_string(),
            prompt_version: PROMPT_VERSION.to_string(),
            bookmap_version: versions::BOOKMAP_VERSION.to_string(),
        }
    }

    /// Compute cache key hash for storage
    pub fn to_cache_hash(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(&self.exchange_hash);
        hasher.update(&self.model);
        hasher.update(&self.prompt_version);
        hasher.update(&self.bookmap_version);
        format!("{:x}", hasher.finalize())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleCacheValue {
    pub response: String,
    pub created_at: DateTime<Utc>,
    pub cache_version: String,
}

impl OracleCacheValue {
    pub fn new(response: String) -> Self {
        Self {
            response,
            created_at: Utc::now(),
            cache_version: versions::ORACLE_CACHE_VERSION.to_string(),
        }
    }
}

/// Serves repeated exchanges from storage so reruns and override rounds
/// never pay for the same call twice. Replies are stored only once the
/// caller accepts them, so a malformed reply is asked for again next run.
pub struct CachedOracle {
    inner: Box<dyn StructureOracle>,
    storage: Box<dyn ResponseStorage>,
}

impl CachedOracle {
    pub fn new(inner: Box<dyn StructureOracle>, storage: Box<dyn ResponseStorage>) -> Self {
        Self { inner, storage }
    }

    fn key(&self, exchange: &OracleExchange) -> OracleCacheKey {
        OracleCacheKey::new(exchange, self.inner.name())
    }
}

impl StructureOracle for CachedOracle {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn complete(&self, exchange: &OracleExchange) -> Result<String, OracleError> {
        let key = self.key(exchange);
        match self.storage.get_oracle_response(&key) {
            Ok(Some(cached)) => {
                debug!("Oracle cache hit {}", &key.to_cache_hash()[..12]);
                return Ok(cached.response);
            }
            Ok(None) => {}
            Err(e) => warn!("Oracle cache read failed: {}", e),
        }
        self.inner.complete(exchange)
    }

    fn accept(&self, exchange: &OracleExchange, response: &str) {
        let key = self.key(exchange);
        if let Err(e) = self
            .storage
            .store_oracle_response(&key, &OracleCacheValue::new(response.to_string()))
        {
            warn!("Oracle cache write failed: {}", e);
        }
        self.inner.accept(exchange, response);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::client::ScriptedOracle;
    use crate::oracle::retry::ask_structured;
    use crate::storage::{FileStorage, NoOpStorage};
    use tempfile::TempDir;

    #[test]
    fn key_changes_with_model_and_exchange() {
        let a = OracleExchange::new("system", "book one");
        let b = OracleExchange::new("system", "book two");
        assert_eq!(
            OracleCacheKey::new(&a, "m").to_cache_hash(),
            OracleCacheKey::new(&a, "m").to_cache_hash()
        );
        assert_ne!(
            OracleCacheKey::new(&a, "m").to_cache_hash(),
            OracleCacheKey::new(&b, "m").to_cache_hash()
        );
        assert_ne!(
            OracleCacheKey::new(&a, "m").to_cache_hash(),
            OracleCacheKey::new(&a, "other").to_cache_hash()
        );
    }

    #[test]
    fn second_identical_exchange_is_served_from_disk() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path().to_str().unwrap()).unwrap();
        // one scripted reply only: a second real call would fail
        let oracle = CachedOracle::new(Box::new(ScriptedOracle::new(["{}"])), Box::new(storage));
        let exchange = OracleExchange::new("system", "user");

        assert_eq!(oracle.complete(&exchange).unwrap(), "{}");
        oracle.accept(&exchange, "{}");
        assert_eq!(oracle.complete(&exchange).unwrap(), "{}");
        assert!(oracle
            .complete(&OracleExchange::new("system", "different"))
            .is_err());
    }

    #[test]
    fn only_replies_that_parse_are_cached() {
        let dir = TempDir::new().unwrap();
        let cache_dir = dir.path().to_str().unwrap();
        let parse = |raw: &str| serde_json::from_str::<serde_json::Value>(raw).map_err(|e| e.to_string());
        let exchange = OracleExchange::new("system", "user");

        let oracle = CachedOracle::new(
            Box::new(ScriptedOracle::new(["not json at all", r#"{"ok": 1}"#])),
            Box::new(FileStorage::new(cache_dir).unwrap()),
        );
        let outcome = ask_structured(&oracle, &exchange, 2, parse);
        assert_eq!(outcome.attempts, 2);
        assert!(outcome.result.is_ok());

        // only the corrected exchange's reply is on disk
        let storage = FileStorage::new(cache_dir).unwrap();
        assert!(storage
            .get_oracle_response(&OracleCacheKey::new(&exchange, oracle.name()))
            .unwrap()
            .is_none());
        assert_eq!(std::fs::read_dir(dir.path().join("oracle")).unwrap().count(), 1);

        // a rerun asks the original exchange afresh instead of replaying the bad reply
        let rerun = CachedOracle::new(
            Box::new(ScriptedOracle::new([r#"{"ok": 2}"#])),
            Box::new(FileStorage::new(cache_dir).unwrap()),
        );
        let outcome = ask_structured(&rerun, &exchange, 2, parse);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.result.unwrap()["ok"], 2);
    }

    #[test]
    fn noop_storage_always_calls_through() {
        let oracle = CachedOracle::new(
            Box::new(ScriptedOracle::new(["a", "b"])),
            Box::new(NoOpStorage::new()),
        );
        let exchange = OracleExchange::new("s", "u");
        assert_eq!(oracle.complete(&exchange).unwrap(), "a");
        assert_eq!(oracle.complete(&exchange).unwrap(), "b");
    }
}
