//! Manifest: the on-disk snapshot of a buffer's pending item metadata.
//!
//! Layout is a JSON array in queue order:
//!
//! ```json
//! [{"ident": "<uuid>", "expire_time": {"_type": "datetime.datetime", "value": "2024-01-01T12:00:00.123456"}}]
//! ```
//!
//! The tagged timestamp keeps files readable by older nodes that decode the
//! manifest with a generic JSON decoder.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace};
use uuid::Uuid;

use crate::blocking::unblock;
use crate::error::{BufferError, Result};
use crate::item::ItemMetadata;

const DATETIME_TAG: &str = "datetime.datetime";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

#[derive(Debug, Serialize, Deserialize)]
struct ManifestEntry {
    ident: Uuid,
    expire_time: TaggedTimestamp,
}

#[derive(Debug, Serialize, Deserialize)]
struct TaggedTimestamp {
    #[serde(rename = "_type")]
    type_tag: String,
    value: String,
}

impl TaggedTimestamp {
    fn encode(at: DateTime<Utc>) -> Self {
        Self {
            type_tag: DATETIME_TAG.to_string(),
            value: at.naive_utc().format(TIMESTAMP_FORMAT).to_string(),
        }
    }

    fn decode(&self) -> std::result::Result<DateTime<Utc>, String> {
        if self.type_tag != DATETIME_TAG {
            return Err(format!("unexpected timestamp tag {:?}", self.type_tag));
        }
        // Values written with an explicit offset are accepted as well
        if let Ok(at) = DateTime::parse_from_rfc3339(&self.value) {
            return Ok(at.with_timezone(&Utc));
        }
        self.value
            .parse::<NaiveDateTime>()
            .map(|naive| naive.and_utc())
            .map_err(|e| format!("invalid timestamp {:?}: {}", self.value, e))
    }
}

/// Encode items, in order, into the manifest representation
pub fn encode(items: &[ItemMetadata]) -> Result<Vec<u8>> {
    let entries: Vec<ManifestEntry> = items
        .iter()
        .map(|item| ManifestEntry {
            ident: item.ident(),
            expire_time: TaggedTimestamp::encode(item.expire_at()),
        })
        .collect();
    serde_json::to_vec(&entries)
        .map_err(|e| BufferError::SerializationError(format!("Serialization failed: {}", e)))
}

/// Decode a manifest. Any malformed entry rejects the whole document.
pub fn decode(data: &[u8]) -> std::result::Result<Vec<ItemMetadata>, String> {
    let entries: Vec<ManifestEntry> =
        serde_json::from_slice(data).map_err(|e| format!("Deserialization failed: {}", e))?;
    entries
        .into_iter()
        .map(|entry| {
            let expire_at = entry.expire_time.decode()?;
            Ok(ItemMetadata::with_expiry(entry.ident, expire_at))
        })
        .collect()
}

/// Manifest file of one buffer
#[derive(Debug, Clone)]
pub struct Manifest {
    path: PathBuf,
    sync_on_write: bool,
}

impl Manifest {
    pub fn for_node(base_dir: &Path, node_id: &str, sync_on_write: bool) -> Self {
        Self {
            path: base_dir.join(format!("manifest-{}", node_id)),
            sync_on_write,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the manifest. A missing file is an empty buffer; a file that
    /// fails to decode is logged verbatim and reported as corrupt.
    pub fn load_blocking(&self) -> Result<Vec<ItemMetadata>> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No manifest found, starting empty");
                return Ok(Vec::new());
            }
            Err(e) => return Err(BufferError::io("read manifest", &self.path, e)),
        };

        match decode(&raw) {
            Ok(items) => {
                debug!(path = %self.path.display(), count = items.len(), "Loaded manifest");
                Ok(items)
            }
            Err(reason) => {
                error!(
                    path = %self.path.display(),
                    content = %String::from_utf8_lossy(&raw),
                    "Failed to decode manifest"
                );
                Err(BufferError::ManifestCorrupt {
                    path: self.path.clone(),
                    reason,
                })
            }
        }
    }

    /// Replace the manifest with a snapshot of `items`.
    /// Written to a hidden sibling file first and renamed into place.
    pub fn store_blocking(&self, items: &[ItemMetadata]) -> Result<()> {
        let data = encode(items)?;
        let tmp = self.tmp_path();

        let mut file =
            fs::File::create(&tmp).map_err(|e| BufferError::io("create manifest", &tmp, e))?;
        file.write_all(&data)
            .map_err(|e| BufferError::io("write manifest", &tmp, e))?;
        if self.sync_on_write {
            file.sync_all()
                .map_err(|e| BufferError::io("sync manifest", &tmp, e))?;
        }
        drop(file);

        fs::rename(&tmp, &self.path)
            .map_err(|e| BufferError::io("rename manifest", &self.path, e))?;

        trace!(path = %self.path.display(), count = items.len(), "Persisted manifest");
        Ok(())
    }

    pub async fn load(&self) -> Result<Vec<ItemMetadata>> {
        let manifest = self.clone();
        unblock(move || manifest.load_blocking()).await
    }

    pub async fn store(&self, items: Vec<ItemMetadata>) -> Result<()> {
        let manifest = self.clone();
        unblock(move || manifest.store_blocking(&items)).await
    }

    /// Scratch file for rewrites. Manifest names always start with
    /// `manifest-`, so the leading dot keeps it clear of every node's manifest.
    pub(crate) fn tmp_path(&self) -> PathBuf {
        let mut name = std::ffi::OsString::from(".");
        if let Some(file_name) = self.path.file_name() {
            name.push(file_name);
        }
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{SubsecRound, TimeDelta};
    use tempfile::TempDir;

    fn sample_items() -> Vec<ItemMetadata> {
        let base = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        vec![
            ItemMetadata::with_expiry(Uuid::new_v4(), base),
            ItemMetadata::with_expiry(Uuid::new_v4(), base + TimeDelta::microseconds(1)),
            ItemMetadata::with_expiry(Uuid::new_v4(), base - TimeDelta::days(400)),
            ItemMetadata::new(TimeDelta::minutes(5)),
        ]
    }

    #[test]
    fn test_codec_roundtrip_preserves_order_and_timestamps() {
        let items = sample_items();
        let encoded = encode(&items).unwrap();
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, items);
        for (a, b) in decoded.iter().zip(items.iter()) {
            assert_eq!(a.expire_at().timestamp_micros(), b.expire_at().timestamp_micros());
        }
    }

    #[test]
    fn test_encoded_layout_is_tagged() {
        let at = DateTime::<Utc>::from_timestamp(1_700_000_000, 5_000).unwrap();
        let ident = Uuid::new_v4();
        let encoded = encode(&[ItemMetadata::with_expiry(ident, at)]).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&encoded).unwrap();

        assert_eq!(value[0]["ident"], ident.to_string());
        assert_eq!(value[0]["expire_time"]["_type"], "datetime.datetime");
        assert_eq!(value[0]["expire_time"]["value"], "2023-11-14T22:13:20.000005");
    }

    #[test]
    fn test_decode_accepts_whole_seconds_and_offsets() {
        let ident = Uuid::new_v4();
        let doc = format!(
            r#"[{{"ident":"{ident}","expire_time":{{"_type":"datetime.datetime","value":"2024-01-01T12:00:00"}}}},
                {{"ident":"{ident}","expire_time":{{"_type":"datetime.datetime","value":"2024-01-01T13:00:00+01:00"}}}}]"#
        );
        let items = decode(doc.as_bytes()).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].expire_at(), items[1].expire_at());
        assert_eq!(items[0].expire_at().trunc_subsecs(0), items[0].expire_at());
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(decode(b"").is_err());
        assert!(decode(b"{not json").is_err());
        assert!(decode(br#"[{"ident":"nope","expire_time":{"_type":"datetime.datetime","value":"2024-01-01T12:00:00"}}]"#).is_err());

        let ident = Uuid::new_v4();
        let wrong_tag = format!(
            r#"[{{"ident":"{ident}","expire_time":{{"_type":"date","value":"2024-01-01T12:00:00"}}}}]"#
        );
        assert!(decode(wrong_tag.as_bytes()).is_err());

        let bad_value = format!(
            r#"[{{"ident":"{ident}","expire_time":{{"_type":"datetime.datetime","value":"yesterday"}}}}]"#
        );
        assert!(decode(bad_value.as_bytes()).is_err());
    }

    #[test]
    fn test_manifest_file_store_and_load() {
        let tmp = TempDir::new().unwrap();
        let manifest = Manifest::for_node(tmp.path(), "node-a", true);
        assert_eq!(manifest.path(), tmp.path().join("manifest-node-a"));

        assert!(manifest.load_blocking().unwrap().is_empty());

        let items = sample_items();
        manifest.store_blocking(&items).unwrap();
        assert_eq!(manifest.load_blocking().unwrap(), items);
        assert!(!manifest.tmp_path().exists());

        manifest.store_blocking(&items[..1]).unwrap();
        assert_eq!(manifest.load_blocking().unwrap(), items[..1].to_vec());
    }

    #[test]
    fn test_tmp_file_never_collides_with_another_node() {
        let tmp = TempDir::new().unwrap();
        let plain = Manifest::for_node(tmp.path(), "x", false);
        let suffixed = Manifest::for_node(tmp.path(), "x.tmp", false);
        assert_eq!(plain.tmp_path(), tmp.path().join(".manifest-x.tmp"));
        assert_ne!(plain.tmp_path(), suffixed.path().to_path_buf());

        let kept = sample_items();
        suffixed.store_blocking(&kept).unwrap();
        plain.store_blocking(&kept[..1]).unwrap();
        assert_eq!(suffixed.load_blocking().unwrap(), kept);
        assert_eq!(plain.load_blocking().unwrap(), kept[..1].to_vec());
    }

    #[test]
    fn test_corrupt_manifest_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let manifest = Manifest::for_node(tmp.path(), "node-a", false);
        fs::write(manifest.path(), b"[{\"ident\": ").unwrap();

        let err = manifest.load_blocking().unwrap_err();
        assert!(err.is_corruption());
    }

    #[tokio::test]
    async fn test_async_store_and_load() {
        let tmp = TempDir::new().unwrap();
        let manifest = Manifest::for_node(tmp.path(), "node-b", false);
        let items = sample_items();

        manifest.store(items.clone()).await.unwrap();
        assert_eq!(manifest.load().await.unwrap(), items);
    }
}
