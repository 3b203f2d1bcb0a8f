//! Asset loading
//!
//! Every asset learns which target types use it by scanning all actions,
//! subactions included. Local assets are read and checksummed when
//! preloading is on; remote ones never are.

use md5::{Digest, Md5};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use super::{read_file, ActionTemplate, Asset, OpusError};

/// MD5 hex digest of asset contents, as peers report it
pub fn checksum(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

pub fn is_remote(path: &str) -> bool {
    path.starts_with("http://") || path.starts_with("https://")
}

/// Target types of every action (at any depth) that references `asset_id`
pub fn asset_targets<'a>(
    asset_id: &str,
    actions: impl IntoIterator<Item = &'a ActionTemplate>,
) -> BTreeSet<String> {
    fn visit(asset_id: &str, action: &ActionTemplate, targets: &mut BTreeSet<String>) {
        if action.assets.iter().any(|a| a == asset_id) {
            targets.insert(action.target.clone());
        }
        for subaction in &action.subactions {
            visit(asset_id, subaction, targets);
        }
    }

    let mut targets = BTreeSet::new();
    for action in actions {
        visit(asset_id, action, &mut targets);
    }
    targets
}

/// Load one asset definition
pub async fn load_asset(
    id: String,
    raw: Value,
    actions: &BTreeMap<String, ActionTemplate>,
    base_dir: &Path,
    read_data: bool,
) -> Result<(String, Asset), OpusError> {
    let path = raw
        .get("path")
        .and_then(Value::as_str)
        .ok_or_else(|| OpusError::missing(format!("asset '{id}'"), "path"))?
        .to_string();

    if read_data && !is_remote(&path) {
        let bytes = read_file(&base_dir.join(&path)).await?;
        let asset = preloaded_asset(&id, path, &bytes, actions, true);
        return Ok((id, asset));
    }

    let targets = asset_targets(&id, actions.values());
    Ok((
        id,
        Asset {
            path,
            data: None,
            checksum: None,
            targets,
        },
    ))
}

/// Asset whose contents were already read. Bytes and checksum are only kept
/// when `keep_data` is set.
pub fn preloaded_asset(
    id: &str,
    path: String,
    bytes: &[u8],
    actions: &BTreeMap<String, ActionTemplate>,
    keep_data: bool,
) -> Asset {
    let (data, checksum) = if keep_data {
        (Some(Arc::<[u8]>::from(bytes)), Some(checksum(bytes)))
    } else {
        (None, None)
    };
    Asset {
        path,
        data,
        checksum,
        targets: asset_targets(id, actions.values()),
    }
}

/// Load all assets concurrently
pub async fn load_assets(
    raw: Vec<(String, Value)>,
    actions: &BTreeMap<String, ActionTemplate>,
    base_dir: &Path,
    read_data: bool,
) -> Result<BTreeMap<String, Asset>, OpusError> {
    let loads = raw
        .into_iter()
        .map(|(id, value)| load_asset(id, value, actions, base_dir, read_data));
    let loaded = futures::future::try_join_all(loads).await?;
    Ok(loaded.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn action(id: &str, target: &str, assets: &[&str]) -> ActionTemplate {
        ActionTemplate {
            id: id.into(),
            target: target.into(),
            cmd: "play".into(),
            desc: None,
            assets: assets.iter().map(|a| a.to_string()).collect(),
            params: Default::default(),
            subactions: vec![],
        }
    }

    #[test]
    fn test_checksum_is_md5_hex() {
        assert_eq!(checksum(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
        assert_eq!(checksum(b""), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn test_targets_include_subactions() {
        let mut composite = ActionTemplate::composite("both", vec![action("both_1", "video", &["intro"])]);
        composite.subactions.push(action("both_2", "audio", &["other"]));
        let actions = vec![composite, action("solo", "image", &["intro"])];

        let targets = asset_targets("intro", actions.iter());
        assert_eq!(targets.into_iter().collect::<Vec<_>>(), vec!["image", "video"]);
    }

    #[tokio::test]
    async fn test_remote_asset_not_read() {
        let actions = BTreeMap::new();
        let (_, asset) = load_asset(
            "stream".into(),
            json!({"path": "https://example.com/a.mp4"}),
            &actions,
            Path::new("/nonexistent"),
            true,
        )
        .await
        .unwrap();
        assert!(asset.data.is_none());
        assert!(asset.checksum.is_none());
    }

    #[tokio::test]
    async fn test_local_asset_checksummed() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("bell.wav"), b"ding").unwrap();
        let mut actions = BTreeMap::new();
        actions.insert("ring".to_string(), action("ring", "audio", &["bell"]));

        let (id, asset) = load_asset("bell".into(), json!({"path": "bell.wav"}), &actions, dir.path(), true)
            .await
            .unwrap();
        assert_eq!(id, "bell");
        assert_eq!(asset.data.as_deref(), Some(&b"ding"[..]));
        assert_eq!(asset.checksum, Some(checksum(b"ding")));
        assert!(asset.targets.contains("audio"));
    }

    #[test]
    fn test_preloaded_asset_uses_given_bytes() {
        let mut actions = BTreeMap::new();
        actions.insert("show_page".to_string(), action("show_page", "web", &["script"]));

        let asset = preloaded_asset("script", "gone.pdf".into(), b"%PDF", &actions, true);
        assert_eq!(asset.path, "gone.pdf");
        assert_eq!(asset.data.as_deref(), Some(&b"%PDF"[..]));
        assert_eq!(asset.checksum, Some(checksum(b"%PDF")));
        assert!(asset.targets.contains("web"));

        let bare = preloaded_asset("script", "gone.pdf".into(), b"%PDF", &actions, false);
        assert!(bare.data.is_none());
        assert!(bare.checksum.is_none());
    }

    #[tokio::test]
    async fn test_preloading_disabled() {
        let actions = BTreeMap::new();
        let (_, asset) = load_asset("x".into(), json!({"path": "missing.wav"}), &actions, Path::new("."), false)
            .await
            .unwrap();
        assert!(asset.data.is_none());
    }
}
