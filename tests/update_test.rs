mod common;

use std::sync::Arc;

use common::{bundle, config, manifest, ship, version, MockOrigin, PLATFORM};
use ma_asset_engine::cache::CacheIndex;
use ma_asset_engine::config::PlayMode;
use ma_asset_engine::error::AssetError;
use ma_asset_engine::update::{UpdateStatus, VersionResolver};

fn open_resolver(
    root: &std::path::Path,
    mode: PlayMode,
    origin: Arc<MockOrigin>,
) -> (VersionResolver, CacheIndex) {
    let config = config(root, mode);
    let cache = CacheIndex::from_config(&config).unwrap();
    (VersionResolver::new(&config, origin, cache.clone()), cache)
}

#[tokio::test]
async fn test_force_update_reports_download_plan() {
    let dir = tempfile::tempdir().unwrap();
    ship(dir.path(), &version("1.0.0", false), &manifest("1.0.0", Vec::new()));

    let origin = Arc::new(MockOrigin::default());
    let remote = manifest(
        "2.0.0",
        vec![
            bundle("ui_common", &[1u8; 100], &["base"], &[]),
            bundle("level_1", &[2u8; 200], &["level1"], &[]),
        ],
    );
    origin.publish(&version("2.0.0", true), &remote);

    let (resolver, _cache) = open_resolver(dir.path(), PlayMode::Online, origin);
    resolver.initialize().await;
    assert!(resolver.has_new_version());

    let result = resolver.check_update().await;
    assert_eq!(result.status, UpdateStatus::ForceUpdate);
    assert!(result.has_update());
    assert_eq!(result.local_version.as_deref(), Some("1.0.0"));
    assert_eq!(result.remote_version.as_deref(), Some("2.0.0"));
    assert_eq!(result.download_size, 300);
    assert_eq!(result.download_count, 2);
    assert!(result.error.is_none());
}

#[tokio::test]
async fn test_optional_and_no_update() {
    let dir = tempfile::tempdir().unwrap();
    ship(dir.path(), &version("1.0.0", false), &manifest("1.0.0", Vec::new()));

    let origin = Arc::new(MockOrigin::default());
    origin.publish(&version("1.1.0", false), &manifest("1.1.0", Vec::new()));
    let (resolver, _cache) = open_resolver(dir.path(), PlayMode::Online, origin.clone());
    resolver.initialize().await;
    assert_eq!(resolver.check_update().await.status, UpdateStatus::OptionalUpdate);

    origin.publish(&version("1.0.0", true), &manifest("1.0.0", Vec::new()));
    let result = resolver.check_update().await;
    assert_eq!(result.status, UpdateStatus::NoUpdate);
    assert!(!result.has_update());
}

#[tokio::test]
async fn test_unreachable_origin_fails_check() {
    let dir = tempfile::tempdir().unwrap();
    ship(dir.path(), &version("1.0.0", false), &manifest("1.0.0", Vec::new()));

    let origin = Arc::new(MockOrigin::default());
    let (resolver, _cache) = open_resolver(dir.path(), PlayMode::Online, origin);
    resolver.initialize().await;
    assert!(!resolver.has_new_version());

    let result = resolver.check_update().await;
    assert_eq!(result.status, UpdateStatus::CheckFailed);
    assert_eq!(result.local_version.as_deref(), Some("1.0.0"));
    assert!(result.error.is_some());
}

#[tokio::test]
async fn test_download_plan_skips_cached_and_shipped_bundles() {
    let dir = tempfile::tempdir().unwrap();
    let cached_data = [3u8; 50];
    let shipped_data = [4u8; 60];
    let cached = bundle("cached", &cached_data, &["level1"], &[]);
    let shipped = bundle("shipped", &shipped_data, &["level1"], &[]);
    let missing = bundle("missing", &[5u8; 70], &["level1"], &[]);
    let other = bundle("other", &[6u8; 80], &["level2"], &[]);
    let remote = manifest("2.0.0", vec![cached.clone(), shipped.clone(), missing, other]);

    ship(dir.path(), &version("1.0.0", false), &manifest("1.0.0", Vec::new()));
    let streaming = dir.path().join("streaming").join(PLATFORM);
    std::fs::write(streaming.join(shipped.file_name()), shipped_data).unwrap();

    let origin = Arc::new(MockOrigin::default());
    origin.publish(&version("2.0.0", false), &remote);
    let (resolver, cache) = open_resolver(dir.path(), PlayMode::Online, origin);
    std::fs::write(cache.cache_path(&cached), cached_data).unwrap();
    cache.add(&cached);

    resolver.initialize().await;
    let result = resolver.check_update().await;
    assert_eq!(result.download_count, 2);
    assert_eq!(result.download_size, 150);

    let plan = resolver.get_bundles_to_download(&["level1"], None);
    let names: Vec<&str> = plan.iter().map(|b| b.bundle_name.as_str()).collect();
    assert_eq!(names, vec!["missing"]);
    assert_eq!(resolver.get_download_size(&["level1", "level2"]), 150);
}

#[tokio::test]
async fn test_load_manifest_refreshes_and_persists_remote() {
    let dir = tempfile::tempdir().unwrap();
    ship(dir.path(), &version("1.0.0", false), &manifest("1.0.0", Vec::new()));
    let origin = Arc::new(MockOrigin::default());
    let remote = manifest("2.0.0", vec![bundle("ui_common", &[1u8; 10], &[], &["ui/a.txt"])]);
    origin.publish(&version("2.0.0", false), &remote);

    {
        let (resolver, _cache) = open_resolver(dir.path(), PlayMode::Online, origin.clone());
        resolver.initialize().await;
        let loaded = resolver.load_manifest().await.unwrap();
        assert_eq!(loaded.version(), "2.0.0");
        assert_eq!(loaded.bundle_name_for_asset("ui/a.txt"), Some("ui_common"));
        assert_eq!(resolver.local_version().unwrap().version, "2.0.0");
    }

    // The persisted copy wins over the shipped one, even offline.
    let (offline, _cache) = open_resolver(dir.path(), PlayMode::Offline, origin);
    offline.initialize().await;
    assert_eq!(offline.local_version().unwrap().version, "2.0.0");
    assert_eq!(offline.load_manifest().await.unwrap().version(), "2.0.0");
}

#[tokio::test]
async fn test_load_manifest_falls_back_to_local_copy() {
    let dir = tempfile::tempdir().unwrap();
    ship(dir.path(), &version("1.0.0", false), &manifest("1.0.0", Vec::new()));
    let origin = Arc::new(MockOrigin::default());
    origin.publish(&version("2.0.0", false), &manifest("2.0.0", Vec::new()));
    origin.remove("manifest.json");

    let (resolver, _cache) = open_resolver(dir.path(), PlayMode::Online, origin.clone());
    resolver.initialize().await;
    assert_eq!(resolver.load_manifest().await.unwrap().version(), "1.0.0");

    // A manifest whose size disagrees with the version document is rejected too.
    let mut announced = version("3.0.0", false);
    announced.manifest_size = 1;
    origin.publish(&announced, &manifest("3.0.0", Vec::new()));
    let (resolver, _cache) = open_resolver(dir.path(), PlayMode::Online, origin);
    resolver.initialize().await;
    assert_eq!(resolver.load_manifest().await.unwrap().version(), "1.0.0");
}

#[tokio::test]
async fn test_missing_manifest_per_mode() {
    let dir = tempfile::tempdir().unwrap();
    let origin = Arc::new(MockOrigin::default());

    let (offline, _cache) = open_resolver(dir.path(), PlayMode::Offline, origin.clone());
    offline.initialize().await;
    let err = offline.load_manifest().await.unwrap_err();
    assert!(matches!(err, AssetError::ManifestUnavailable(_)));

    let (simulate, _cache) = open_resolver(dir.path(), PlayMode::Simulate, origin.clone());
    simulate.initialize().await;
    let empty = simulate.load_manifest().await.unwrap();
    assert!(empty.bundles().is_empty());
    assert!(origin.fetched().is_empty());
}
