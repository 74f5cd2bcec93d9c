//! Operator configuration and the periodic refresh coordinator.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reportpal_core::{
    XmlValue, DEFAULT_FEED_URL, DEFAULT_UPDATE_INTERVAL_MINUTES, MAX_UPDATE_INTERVAL_MINUTES,
    MIN_UPDATE_INTERVAL_MINUTES,
};
use reportpal_entities::{discover_entities, DiscoveryOptions};
use reportpal_feed::{parse_document, FeedClientConfig, FeedFetcher, FetchError, ParseError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "reportpal-sync";

/// Current persisted-config schema version.
pub const CONFIG_VERSION: u32 = 2;

/// Operator-facing configuration surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedConfig {
    pub feed_url: String,
    pub create_lift_entities: bool,
    pub create_trail_entities: bool,
    pub update_interval_minutes: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            feed_url: DEFAULT_FEED_URL.to_string(),
            create_lift_entities: true,
            create_trail_entities: true,
            update_interval_minutes: DEFAULT_UPDATE_INTERVAL_MINUTES,
        }
    }
}

impl FeedConfig {
    pub fn from_env() -> Self {
        Self {
            feed_url: std::env::var("REPORTPAL_FEED_URL")
                .unwrap_or_else(|_| DEFAULT_FEED_URL.to_string()),
            create_lift_entities: env_flag("REPORTPAL_CREATE_LIFT_ENTITIES", true),
            create_trail_entities: env_flag("REPORTPAL_CREATE_TRAIL_ENTITIES", true),
            update_interval_minutes: std::env::var("REPORTPAL_UPDATE_INTERVAL")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_UPDATE_INTERVAL_MINUTES),
        }
        .normalized()
    }

    /// Clamp the refresh interval into the supported range.
    pub fn normalized(mut self) -> Self {
        self.update_interval_minutes = self
            .update_interval_minutes
            .clamp(MIN_UPDATE_INTERVAL_MINUTES, MAX_UPDATE_INTERVAL_MINUTES);
        self
    }

    pub fn discovery_options(&self) -> DiscoveryOptions {
        DiscoveryOptions {
            create_lift_entities: self.create_lift_entities,
            create_trail_entities: self.create_trail_entities,
        }
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

/// Persisted configuration as written by older releases; fields that arrived
/// later are optional so a v1 file still deserializes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredConfig {
    pub version: u32,
    #[serde(default)]
    pub feed_url: Option<String>,
    #[serde(default)]
    pub create_lift_entities: Option<bool>,
    #[serde(default)]
    pub create_trail_entities: Option<bool>,
    #[serde(default)]
    pub update_interval_minutes: Option<u64>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("parsing config file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported config version {version}")]
    UnsupportedVersion { version: u32 },
}

/// Upgrade a stored configuration to [`CONFIG_VERSION`], filling the fields
/// a version-1 entry lacks with their documented defaults. Idempotent.
pub fn migrate_config(mut stored: StoredConfig) -> Result<StoredConfig, ConfigError> {
    if stored.version == 1 {
        stored
            .feed_url
            .get_or_insert_with(|| DEFAULT_FEED_URL.to_string());
        stored.create_lift_entities.get_or_insert(true);
        stored.create_trail_entities.get_or_insert(true);
        stored
            .update_interval_minutes
            .get_or_insert(DEFAULT_UPDATE_INTERVAL_MINUTES);
        stored.version = 2;
        info!("migrated stored config from version 1 to 2");
    }
    if stored.version != CONFIG_VERSION {
        return Err(ConfigError::UnsupportedVersion {
            version: stored.version,
        });
    }
    Ok(stored)
}

impl From<StoredConfig> for FeedConfig {
    fn from(stored: StoredConfig) -> Self {
        Self {
            feed_url: stored
                .feed_url
                .unwrap_or_else(|| DEFAULT_FEED_URL.to_string()),
            create_lift_entities: stored.create_lift_entities.unwrap_or(true),
            create_trail_entities: stored.create_trail_entities.unwrap_or(true),
            update_interval_minutes: stored
                .update_interval_minutes
                .unwrap_or(DEFAULT_UPDATE_INTERVAL_MINUTES),
        }
        .normalized()
    }
}

/// Load a persisted config, migrating it in memory if needed.
pub fn load_config_file(path: impl AsRef<Path>) -> Result<FeedConfig, ConfigError> {
    let data = std::fs::read_to_string(path)?;
    let stored: StoredConfig = serde_json::from_str(&data)?;
    Ok(migrate_config(stored)?.into())
}

/// Load a persisted config and rewrite the file at the current version.
pub fn migrate_config_file(path: impl AsRef<Path>) -> Result<FeedConfig, ConfigError> {
    let path = path.as_ref();
    let data = std::fs::read_to_string(path)?;
    let stored: StoredConfig = serde_json::from_str(&data)?;
    let migrated = migrate_config(stored)?;
    std::fs::write(path, serde_json::to_string_pretty(&migrated)?)?;
    Ok(migrated.into())
}

/// One successfully refreshed document, replaced wholesale every cycle.
#[derive(Debug, Clone)]
pub struct DocumentSnapshot {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
    pub document: Arc<XmlValue>,
}

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub byte_size: usize,
    pub entity_count: usize,
}

/// Owns the fetch-and-parse cycle and the channel consumers read from.
///
/// A cycle either publishes a complete fresh snapshot or leaves the previous
/// one fully intact; there is no field-level merging and readers never see a
/// half-replaced document.
#[derive(Debug)]
pub struct FeedCoordinator {
    config: FeedConfig,
    fetcher: FeedFetcher,
    sender: watch::Sender<Option<DocumentSnapshot>>,
}

impl FeedCoordinator {
    pub fn new(config: FeedConfig) -> anyhow::Result<Self> {
        let fetcher = FeedFetcher::new(FeedClientConfig {
            user_agent: Some(format!("reportpal/{}", env!("CARGO_PKG_VERSION"))),
            ..FeedClientConfig::default()
        })?;
        let (sender, _) = watch::channel(None);
        Ok(Self {
            config: config.normalized(),
            fetcher,
            sender,
        })
    }

    pub fn config(&self) -> &FeedConfig {
        &self.config
    }

    /// Handle for consumers that want to be woken on document replacement.
    pub fn subscribe(&self) -> watch::Receiver<Option<DocumentSnapshot>> {
        self.sender.subscribe()
    }

    /// The latest snapshot, if any cycle has succeeded yet.
    pub fn current(&self) -> Option<DocumentSnapshot> {
        self.sender.borrow().clone()
    }

    fn publish(&self, snapshot: DocumentSnapshot) {
        self.sender.send_replace(Some(snapshot));
    }

    /// Run one fetch-and-parse cycle and publish the result.
    pub async fn refresh(&self) -> Result<RefreshSummary, RefreshError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let fetched = self.fetcher.fetch(run_id, &self.config.feed_url).await?;
        let byte_size = fetched.body.len();
        let document = Arc::new(parse_document(&fetched.body)?);
        let entity_count =
            discover_entities(&document, self.config.discovery_options()).len();
        self.publish(DocumentSnapshot {
            run_id,
            fetched_at: Utc::now(),
            document,
        });
        let finished_at = Utc::now();
        info!(%run_id, byte_size, entity_count, "feed refresh complete");
        Ok(RefreshSummary {
            run_id,
            started_at,
            finished_at,
            byte_size,
            entity_count,
        })
    }

    /// Poll forever at the configured interval, one cycle at a time. A failed
    /// cycle is logged and the previous document stays readable until the
    /// next attempt.
    pub async fn run(&self) {
        let period = Duration::from_secs(self.config.update_interval_minutes * 60);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = self.refresh().await {
                warn!(error = %err, "feed refresh failed; keeping previous document");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reportpal_core::EntityValue;
    use reportpal_entities::resort_status;

    fn v1_stored() -> StoredConfig {
        StoredConfig {
            version: 1,
            feed_url: None,
            create_lift_entities: None,
            create_trail_entities: None,
            update_interval_minutes: None,
        }
    }

    #[test]
    fn migration_fills_documented_defaults() {
        let migrated = migrate_config(v1_stored()).expect("migrate");
        assert_eq!(migrated.version, CONFIG_VERSION);
        assert_eq!(migrated.feed_url.as_deref(), Some(DEFAULT_FEED_URL));
        assert_eq!(migrated.create_lift_entities, Some(true));
        assert_eq!(migrated.create_trail_entities, Some(true));
        assert_eq!(
            migrated.update_interval_minutes,
            Some(DEFAULT_UPDATE_INTERVAL_MINUTES)
        );
    }

    #[test]
    fn migration_keeps_existing_values_and_is_idempotent() {
        let stored = StoredConfig {
            version: 1,
            feed_url: Some("https://example.test/mtnxml/7".to_string()),
            update_interval_minutes: Some(5),
            ..v1_stored()
        };
        let once = migrate_config(stored).expect("migrate");
        let twice = migrate_config(once.clone()).expect("re-migrate");
        assert_eq!(once, twice);
        assert_eq!(twice.feed_url.as_deref(), Some("https://example.test/mtnxml/7"));
        assert_eq!(twice.update_interval_minutes, Some(5));
    }

    #[test]
    fn future_versions_are_rejected() {
        let stored = StoredConfig {
            version: 3,
            ..v1_stored()
        };
        assert!(matches!(
            migrate_config(stored),
            Err(ConfigError::UnsupportedVersion { version: 3 })
        ));
    }

    #[test]
    fn interval_is_clamped_into_range() {
        let config = FeedConfig {
            update_interval_minutes: 720,
            ..FeedConfig::default()
        }
        .normalized();
        assert_eq!(config.update_interval_minutes, MAX_UPDATE_INTERVAL_MINUTES);

        let config = FeedConfig {
            update_interval_minutes: 0,
            ..FeedConfig::default()
        }
        .normalized();
        assert_eq!(config.update_interval_minutes, MIN_UPDATE_INTERVAL_MINUTES);
    }

    #[test]
    fn config_file_migration_rewrites_at_current_version() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("reportpal.json");
        std::fs::write(&path, r#"{"version": 1, "update_interval_minutes": 30}"#)
            .expect("write v1 config");

        let config = migrate_config_file(&path).expect("migrate file");
        assert_eq!(config.update_interval_minutes, 30);
        assert_eq!(config.feed_url, DEFAULT_FEED_URL);

        let rewritten: StoredConfig =
            serde_json::from_str(&std::fs::read_to_string(&path).expect("read back"))
                .expect("parse rewritten config");
        assert_eq!(rewritten.version, CONFIG_VERSION);

        let reloaded = load_config_file(&path).expect("load migrated file");
        assert_eq!(reloaded, config);
    }

    #[tokio::test]
    async fn publishing_replaces_the_document_atomically() {
        let coordinator = FeedCoordinator::new(FeedConfig::default()).expect("coordinator");
        let mut receiver = coordinator.subscribe();
        assert!(coordinator.current().is_none());

        let open_doc = parse_document(
            b"<report><operations resortStatus=\"Open\" openTime=\"9\" closeTime=\"4\"/></report>",
        )
        .expect("parse open doc");
        coordinator.publish(DocumentSnapshot {
            run_id: Uuid::new_v4(),
            fetched_at: Utc::now(),
            document: Arc::new(open_doc),
        });
        receiver.changed().await.expect("first change");
        let first = coordinator.current().expect("first snapshot");
        assert_eq!(
            resort_status(&first.document).expect("status").value,
            EntityValue::Bool(true)
        );

        let closed_doc = parse_document(
            b"<report><operations resortStatus=\"Closed\"/></report>",
        )
        .expect("parse closed doc");
        coordinator.publish(DocumentSnapshot {
            run_id: Uuid::new_v4(),
            fetched_at: Utc::now(),
            document: Arc::new(closed_doc),
        });
        receiver.changed().await.expect("second change");

        // Every read now reflects only the new document; the old snapshot's
        // open/close times are gone rather than merged in.
        let second = coordinator.current().expect("second snapshot");
        let status = resort_status(&second.document).expect("status");
        assert_eq!(status.value, EntityValue::Bool(false));
        assert_eq!(status.attributes["open_time"], serde_json::json!(""));
        assert_ne!(first.run_id, second.run_id);
    }
}
