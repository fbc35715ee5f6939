use std::path::PathBuf;
use std::time::Duration;

use getset::Getters;
use mesh_durable_buffer::{BufferConfig, BufferContext};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{Registry, layer::SubscriberExt};

#[derive(Debug, Clone, Getters)]
pub struct AppConfig {
    #[getset(get = "pub")]
    app_name: String,
    /// Root of all buffer storage; `~` is expanded against `HOME`
    #[getset(get = "pub")]
    data_dir: PathBuf,
    /// Id of the peer this process buffers for
    #[getset(get = "pub")]
    node_id: String,
    #[getset(get = "pub")]
    message_ttl: Duration,
    #[getset(get = "pub")]
    expire_interval: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app_name: "mesh_relay".to_string(),
            data_dir: expand_home("~/.mesh/data"),
            node_id: "default".to_string(),
            message_ttl: BufferConfig::default().ttl,
            expire_interval: Duration::from_secs(60),
        }
    }
}

impl AppConfig {
    pub fn dev() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from `lookup`, falling back to defaults for missing or
    /// unparsable values
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(app_name) = lookup("APP_NAME") {
            config.app_name = app_name;
        }
        if let Some(dir) = lookup("DATA_DIR") {
            config.data_dir = expand_home(&dir);
        }
        if let Some(node_id) = lookup("NODE_ID") {
            config.node_id = node_id;
        }
        if let Some(secs) = lookup("BUFFER_TTL_SECS").and_then(|v| v.parse().ok()) {
            config.message_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = lookup("EXPIRE_INTERVAL_SECS").and_then(|v| v.parse::<u64>().ok()) {
            if secs > 0 {
                config.expire_interval = Duration::from_secs(secs);
            }
        }
        config
    }

    pub fn with_data_dir(&mut self, dir: impl Into<PathBuf>) -> &mut Self {
        self.data_dir = dir.into();
        self
    }

    pub fn with_node_id(&mut self, node_id: &str) -> &mut Self {
        self.node_id = node_id.to_string();
        self
    }

    pub fn buffer_config(&self) -> BufferConfig {
        BufferConfig {
            ttl: self.message_ttl,
            ..BufferConfig::default()
        }
    }

    pub fn print_args(&self) -> &Self {
        info!("AppConfig:app_name={}", self.app_name);
        info!("AppConfig:data_dir={}", self.data_dir.display());
        info!("AppConfig:node_id={}", self.node_id);
        info!("AppConfig:message_ttl={:?}", self.message_ttl);
        info!("AppConfig:expire_interval={:?}", self.expire_interval);
        self
    }

    /// Install the global tracing subscriber. Filtering comes from `RUST_LOG`.
    pub fn init_tracing(&self) -> Result<(), Box<dyn std::error::Error>> {
        let subscriber = Registry::default()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(
                tracing_subscriber::fmt::layer()
                    .with_file(true)
                    .with_line_number(true)
                    .with_thread_ids(true)
                    .with_writer(std::io::stderr),
            );

        tracing::subscriber::set_global_default(subscriber)?;
        info!(app_name = %self.app_name, "tracing initialized");
        Ok(())
    }
}

impl BufferContext for AppConfig {
    fn default_data_dir(&self) -> PathBuf {
        self.data_dir.clone()
    }
}

/// Expand a leading `~` to the user's home directory
pub fn expand_home(path: &str) -> PathBuf {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    match (path.strip_prefix('~'), home) {
        (Some(""), Some(home)) => home,
        (Some(rest), Some(home)) if rest.starts_with('/') => home.join(&rest[1..]),
        _ => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_from_lookup_overrides() {
        let env: HashMap<&str, &str> = [
            ("APP_NAME", "relay-test"),
            ("DATA_DIR", "/var/lib/mesh"),
            ("NODE_ID", "peer-9"),
            ("BUFFER_TTL_SECS", "30"),
            ("EXPIRE_INTERVAL_SECS", "0"),
        ]
        .into_iter()
        .collect();
        let config = AppConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.app_name(), "relay-test");
        assert_eq!(config.data_dir(), &PathBuf::from("/var/lib/mesh"));
        assert_eq!(config.node_id(), "peer-9");
        assert_eq!(config.message_ttl(), &Duration::from_secs(30));
        // Zero interval is ignored
        assert_eq!(config.expire_interval(), &Duration::from_secs(60));
        assert_eq!(config.buffer_config().ttl, Duration::from_secs(30));
        assert_eq!(config.default_data_dir(), PathBuf::from("/var/lib/mesh"));
    }

    #[test]
    fn test_defaults_on_bad_values() {
        let config = AppConfig::from_lookup(|k| match k {
            "BUFFER_TTL_SECS" => Some("soon".to_string()),
            _ => None,
        });
        assert_eq!(config.message_ttl(), &Duration::from_secs(300));
        assert_eq!(config.node_id(), "default");
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("/abs/path"), PathBuf::from("/abs/path"));
        assert_eq!(expand_home("relative"), PathBuf::from("relative"));
        if let Some(home) = std::env::var_os("HOME") {
            let home = PathBuf::from(home);
            assert_eq!(expand_home("~"), home);
            assert_eq!(expand_home("~/data"), home.join("data"));
        }
        assert_eq!(expand_home("~user/data"), PathBuf::from("~user/data"));
    }

    #[test]
    fn test_builders() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut config = AppConfig::default();
        config.with_data_dir(tmp.path()).with_node_id("peer-2");
        assert_eq!(config.data_dir(), &tmp.path().to_path_buf());
        assert_eq!(config.node_id(), "peer-2");
    }
}
