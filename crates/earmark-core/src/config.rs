use std::collections::BTreeMap;

use crate::tagger::CompletionConfig;

pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const DEFAULT_COLLECTION: &str = "all_opportunities";

/// Runtime configuration, resolved from the environment with defaults.
///
/// Every knob has an `EARMARK_*` variable so deployments never need to edit
/// code to point at a different store or completion service.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path of the sqlite opportunity store.
    pub db_path: String,
    /// Logical database name recorded in record provenance.
    pub database: String,
    /// Logical collection name recorded in record provenance.
    pub collection: String,
    pub completion: CompletionConfig,
    pub batch_size: usize,
    pub workers: usize,
}

impl Config {
    #[must_use]
    pub fn from_env() -> Self {
        Self::default()
    }

    /// Provenance mapping stamped onto every normalized record.
    #[must_use]
    pub fn provenance(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("database".to_string(), self.database.clone()),
            ("collection".to_string(), self.collection.clone()),
        ])
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: env_or("EARMARK_DB", "earmark.db"),
            database: env_or("EARMARK_DATABASE_NAME", "grants"),
            collection: env_or("EARMARK_COLLECTION", DEFAULT_COLLECTION),
            completion: completion_from_env(),
            batch_size: env_parse("EARMARK_BATCH_SIZE", DEFAULT_BATCH_SIZE),
            workers: env_parse("EARMARK_WORKERS", default_workers()),
        }
    }
}

pub(crate) fn default_workers() -> usize {
    std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get)
}

fn completion_from_env() -> CompletionConfig {
    let base = CompletionConfig::default();
    CompletionConfig {
        url: env_or("EARMARK_LLM_URL", &base.url),
        model: env_or("EARMARK_LLM_MODEL", &base.model),
        api_key: std::env::var("EARMARK_LLM_API_KEY").ok(),
        temperature: env_parse("EARMARK_LLM_TEMPERATURE", base.temperature),
        max_tokens: env_parse("EARMARK_LLM_MAX_TOKENS", base.max_tokens),
        timeout_secs: env_parse("EARMARK_LLM_TIMEOUT_SECS", base.timeout_secs),
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
