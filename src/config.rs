use std::path::PathBuf;

const DEFAULT_MAX_PAGE_SIZE: usize = 200;
const DEFAULT_RELATED_TAG_LIMIT: usize = 10;
const STORE_FILE: &str = "supportdesk.db";

/// Configuration for the local store, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database file. `None` keeps everything in memory (tests, previews).
    pub path: Option<PathBuf>,
    /// Upper bound for `limit` on any query.
    pub max_page_size: usize,
    /// How many co-occurring tags `search` returns alongside results.
    pub related_tag_limit: usize,
    /// Tags inserted with a zero count the first time the store is created,
    /// so suggestions are not empty on a fresh install.
    pub seed_tags: Vec<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_page_size: DEFAULT_MAX_PAGE_SIZE,
            related_tag_limit: DEFAULT_RELATED_TAG_LIMIT,
            seed_tags: Vec::new(),
        }
    }
}

impl StoreConfig {
    /// Load config from environment variables with sensible defaults.
    ///
    /// `SUPPORTDESK_DATA_DIR` (default `./data`), `SUPPORTDESK_MAX_PAGE_SIZE`,
    /// `SUPPORTDESK_RELATED_TAGS`, and `SUPPORTDESK_SEED_TAGS` (comma separated).
    pub fn from_env() -> Self {
        let data_dir =
            std::env::var("SUPPORTDESK_DATA_DIR").unwrap_or_else(|_| "./data".to_string());

        Self {
            path: Some(PathBuf::from(data_dir).join(STORE_FILE)),
            max_page_size: std::env::var("SUPPORTDESK_MAX_PAGE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|v: &usize| *v > 0)
                .unwrap_or(DEFAULT_MAX_PAGE_SIZE),
            related_tag_limit: std::env::var("SUPPORTDESK_RELATED_TAGS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_RELATED_TAG_LIMIT),
            seed_tags: std::env::var("SUPPORTDESK_SEED_TAGS")
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    /// In-memory store with defaults.
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn with_seed_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.seed_tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    #[test]
    #[serial]
    fn test_config_from_env() {
        env::set_var("SUPPORTDESK_DATA_DIR", "/tmp/sd-test");
        env::set_var("SUPPORTDESK_MAX_PAGE_SIZE", "50");
        env::set_var("SUPPORTDESK_SEED_TAGS", "Installation, Felsökning,,");

        let config = StoreConfig::from_env();
        assert_eq!(
            config.path,
            Some(PathBuf::from("/tmp/sd-test").join(STORE_FILE))
        );
        assert_eq!(config.max_page_size, 50);
        assert_eq!(config.seed_tags, vec!["Installation", "Felsökning"]);

        env::remove_var("SUPPORTDESK_DATA_DIR");
        env::remove_var("SUPPORTDESK_MAX_PAGE_SIZE");
        env::remove_var("SUPPORTDESK_SEED_TAGS");
    }

    #[test]
    #[serial]
    fn test_config_rejects_zero_page_size() {
        env::set_var("SUPPORTDESK_MAX_PAGE_SIZE", "0");
        let config = StoreConfig::from_env();
        assert_eq!(config.max_page_size, DEFAULT_MAX_PAGE_SIZE);
        env::remove_var("SUPPORTDESK_MAX_PAGE_SIZE");
    }
}
