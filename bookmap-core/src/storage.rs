use crate::cache::{OracleCacheKey, OracleCacheValue};
use crate::oracle::client::OracleExchange;
use anyhow::{anyhow, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;

/// Storage abstraction for caching oracle replies
pub trait ResponseStorage {
    fn get_oracle_response(&self, cache_key: &OracleCacheKey) -> Result<Option<OracleCacheValue>>;
    fn store_oracle_response(&self, cache_key: &OracleCacheKey, cache_value: &OracleCacheValue) -> Result<()>;
}

/// File-based storage implementation using local cache directory
pub struct FileStorage {
    cache_dir: String,
}

impl FileStorage {
    pub fn new(cache_dir: &str) -> Result<Self> {
        fs::create_dir_all(format!("{cache_dir}/oracle"))?;

        Ok(Self {
            cache_dir: cache_dir.to_string(),
        })
    }

    fn oracle_path(&self, cache_key: &OracleCacheKey) -> String {
        format!("{}/oracle/{}.json", self.cache_dir, cache_key.to_cache_hash())
    }
}

impl ResponseStorage for FileStorage {
    fn get_oracle_response(&self, cache_key: &OracleCacheKey) -> Result<Option<OracleCacheValue>> {
        let path = self.oracle_path(cache_key);
        if Path::new(&path).exists() {
            let json_str = fs::read_to_string(path)?;
            let cache_value: OracleCacheValue = serde_json::from_str(&json_str)
                .map_err(|e| anyhow!("Failed to deserialize cached oracle reply: {}", e))?;
            Ok(Some(cache_value))
        } else {
            Ok(None)
        }
    }

    fn store_oracle_response(&self, cache_key: &OracleCacheKey, cache_value: &OracleCacheValue) -> Result<()> {
        let path = self.oracle_path(cache_key);
        let json_str = serde_json::to_string_pretty(cache_value)
            .map_err(|e| anyhow!("Failed to serialize oracle reply: {}", e))?;
        fs::write(path, json_str)?;
        Ok(())
    }
}

/// Hash of every message in an exchange, roles included
pub fn calculate_exchange_hash(exchange: &OracleExchange) -> String {
    let mut hasher = Sha256::new();
    for message in &exchange.messages {
        hasher.update(format!("{:?}", message.role).as_bytes());
        hasher.update((message.content.len() as u64).to_le_bytes());
        hasher.update(message.content.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Hash of the effective configuration, stamped on the structure report
pub fn calculate_config_hash<T: serde::Serialize>(config: &T) -> Result<String> {
    let config_json = serde_json::to_string(config)
        .map_err(|e| anyhow!("Failed to serialize config for hashing: {}", e))?;

    let mut hasher = Sha256::new();
    hasher.update(config_json.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

/// No-op storage implementation that disables all caching
pub struct NoOpStorage;

impl Default for NoOpStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl NoOpStorage {
    pub fn new() -> Self {
        Self
    }
}

impl ResponseStorage for NoOpStorage {
    fn get_oracle_response(&self, _cache_key: &OracleCacheKey) -> Result<Option<OracleCacheValue>> {
        Ok(None) // Always cache miss
    }

    fn store_oracle_response(&self, _cache_key: &OracleCacheKey, _cache_value: &OracleCacheValue) -> Result<()> {
        Ok(()) // No-op
    }
}
