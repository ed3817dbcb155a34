// Manifest snapshot with O(1) lookup indices rebuilt on every construction.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::info::{AssetInfo, BundleInfo};
use crate::error::{AssetError, Result};

/// Wire form of the manifest document.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct ManifestDocument {
    version: String,
    build_time: String,
    platform: String,
    bundles: Vec<BundleInfo>,
    assets: Vec<AssetInfo>,
}

/// Read-only catalog of bundles and assets for one build.
#[derive(Debug, Clone, Default)]
pub struct BundleManifest {
    doc: ManifestDocument,
    by_name: HashMap<String, usize>,
    by_asset: HashMap<String, usize>,
    asset_infos: HashMap<String, usize>,
    by_tag: HashMap<String, Vec<usize>>,
}

impl BundleManifest {
    pub fn new(
        version: impl Into<String>,
        build_time: impl Into<String>,
        platform: impl Into<String>,
        bundles: Vec<BundleInfo>,
        assets: Vec<AssetInfo>,
    ) -> Self {
        Self::from_document(ManifestDocument {
            version: version.into(),
            build_time: build_time.into(),
            platform: platform.into(),
            bundles,
            assets,
        })
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let doc: ManifestDocument = serde_json::from_str(json)
            .map_err(|e| AssetError::ManifestUnavailable(format!("invalid manifest: {}", e)))?;
        let manifest = Self::from_document(doc);
        for problem in manifest.check_dependencies() {
            warn!("manifest {}: {}", manifest.version(), problem);
        }
        Ok(manifest)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.doc)
            .map_err(|e| AssetError::ManifestUnavailable(format!("serialize manifest: {}", e)))
    }

    fn from_document(doc: ManifestDocument) -> Self {
        let mut manifest = Self {
            doc,
            ..Default::default()
        };
        manifest.build_index();
        manifest
    }

    fn build_index(&mut self) {
        self.by_name.clear();
        self.by_asset.clear();
        self.asset_infos.clear();
        self.by_tag.clear();

        for (i, bundle) in self.doc.bundles.iter().enumerate() {
            self.by_name.insert(bundle.bundle_name.clone(), i);
            for asset in &bundle.assets {
                self.by_asset.insert(asset.clone(), i);
            }
            for tag in &bundle.tags {
                self.by_tag.entry(tag.clone()).or_default().push(i);
            }
        }

        // The explicit asset list wins over the per-bundle listing.
        for (i, asset) in self.doc.assets.iter().enumerate() {
            self.asset_infos.insert(asset.asset_path.clone(), i);
            if let Some(&bundle_idx) = self.by_name.get(&asset.bundle_name) {
                self.by_asset.insert(asset.asset_path.clone(), bundle_idx);
            }
        }
    }

    pub fn version(&self) -> &str {
        &self.doc.version
    }

    pub fn build_time(&self) -> &str {
        &self.doc.build_time
    }

    pub fn platform(&self) -> &str {
        &self.doc.platform
    }

    pub fn bundles(&self) -> &[BundleInfo] {
        &self.doc.bundles
    }

    pub fn assets(&self) -> &[AssetInfo] {
        &self.doc.assets
    }

    pub fn bundle(&self, bundle_name: &str) -> Option<&BundleInfo> {
        self.by_name.get(bundle_name).map(|&i| &self.doc.bundles[i])
    }

    pub fn bundle_for_asset(&self, asset_path: &str) -> Option<&BundleInfo> {
        self.by_asset.get(asset_path).map(|&i| &self.doc.bundles[i])
    }

    pub fn bundle_name_for_asset(&self, asset_path: &str) -> Option<&str> {
        self.bundle_for_asset(asset_path)
            .map(|b| b.bundle_name.as_str())
    }

    pub fn asset_info(&self, asset_path: &str) -> Option<&AssetInfo> {
        self.asset_infos.get(asset_path).map(|&i| &self.doc.assets[i])
    }

    pub fn contains_asset(&self, asset_path: &str) -> bool {
        self.by_asset.contains_key(asset_path)
    }

    pub fn is_raw_file(&self, asset_path: &str) -> bool {
        self.bundle_for_asset(asset_path)
            .map(|b| b.is_raw_file)
            .unwrap_or(false)
    }

    /// Every addressable asset path, sorted.
    pub fn asset_paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = self.by_asset.keys().map(String::as_str).collect();
        paths.sort_unstable();
        paths
    }

    pub fn bundles_by_tag(&self, tag: &str) -> Vec<&BundleInfo> {
        self.by_tag
            .get(tag)
            .map(|idx| idx.iter().map(|&i| &self.doc.bundles[i]).collect())
            .unwrap_or_default()
    }

    /// Union of the bundles carrying any of `tags`, in manifest order.
    pub fn bundles_by_tags<S: AsRef<str>>(&self, tags: &[S]) -> Vec<&BundleInfo> {
        let mut selected: Vec<usize> = tags
            .iter()
            .filter_map(|t| self.by_tag.get(t.as_ref()))
            .flatten()
            .copied()
            .collect();
        selected.sort_unstable();
        selected.dedup();
        selected.into_iter().map(|i| &self.doc.bundles[i]).collect()
    }

    /// Transitive dependencies of `bundle_name`, each listed after its own
    /// dependencies. Revisits are skipped so malformed cycles terminate.
    pub fn all_dependencies(&self, bundle_name: &str) -> Vec<&BundleInfo> {
        let mut visited = HashSet::new();
        let mut out = Vec::new();
        visited.insert(bundle_name.to_string());
        if let Some(bundle) = self.bundle(bundle_name) {
            for dep in &bundle.dependencies {
                self.collect_dependencies(dep, &mut visited, &mut out);
            }
        }
        out
    }

    fn collect_dependencies<'a>(
        &'a self,
        bundle_name: &str,
        visited: &mut HashSet<String>,
        out: &mut Vec<&'a BundleInfo>,
    ) {
        if !visited.insert(bundle_name.to_string()) {
            return;
        }
        let Some(bundle) = self.bundle(bundle_name) else {
            return;
        };
        for dep in &bundle.dependencies {
            self.collect_dependencies(dep, visited, out);
        }
        out.push(bundle);
    }

    /// All bundles needed to load `asset_path`: dependencies first, owner last.
    pub fn required_bundles(&self, asset_path: &str) -> Vec<&BundleInfo> {
        let Some(owner) = self.bundle_for_asset(asset_path) else {
            return Vec::new();
        };
        let mut bundles = self.all_dependencies(&owner.bundle_name);
        bundles.push(owner);
        bundles
    }

    pub fn asset_count(&self) -> usize {
        self.doc.bundles.iter().map(|b| b.assets.len()).sum()
    }

    pub fn total_size(&self) -> u64 {
        self.doc.bundles.iter().map(|b| b.size).sum()
    }

    pub fn size_by_tag(&self, tag: &str) -> u64 {
        self.bundles_by_tag(tag).iter().map(|b| b.size).sum()
    }

    /// Dangling, self-referencing and cyclic dependency edges, as messages.
    pub fn check_dependencies(&self) -> Vec<String> {
        let mut problems = Vec::new();
        for bundle in &self.doc.bundles {
            for dep in &bundle.dependencies {
                if dep == &bundle.bundle_name {
                    problems.push(format!("{} depends on itself", bundle.bundle_name));
                } else if !self.by_name.contains_key(dep) {
                    problems.push(format!(
                        "{} depends on unknown bundle {}",
                        bundle.bundle_name, dep
                    ));
                }
            }
        }
        if let Some(cycle) = self.find_cycle() {
            problems.push(format!("dependency cycle {}", cycle.join(" -> ")));
        }
        problems
    }

    fn find_cycle(&self) -> Option<Vec<String>> {
        // 0 = unvisited, 1 = on stack, 2 = done
        let mut marks = vec![0u8; self.doc.bundles.len()];
        let mut stack = Vec::new();
        for start in 0..self.doc.bundles.len() {
            if marks[start] == 0 {
                if let Some(cycle) = self.visit_for_cycle(start, &mut marks, &mut stack) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    fn visit_for_cycle(
        &self,
        idx: usize,
        marks: &mut [u8],
        stack: &mut Vec<usize>,
    ) -> Option<Vec<String>> {
        marks[idx] = 1;
        stack.push(idx);
        for dep in &self.doc.bundles[idx].dependencies {
            let Some(&next) = self.by_name.get(dep) else {
                continue;
            };
            if next == idx {
                continue; // reported separately as a self-dependency
            }
            match marks[next] {
                1 => {
                    let from = stack.iter().position(|&i| i == next).unwrap_or(0);
                    let mut cycle: Vec<String> = stack[from..]
                        .iter()
                        .map(|&i| self.doc.bundles[i].bundle_name.clone())
                        .collect();
                    cycle.push(self.doc.bundles[next].bundle_name.clone());
                    return Some(cycle);
                }
                0 => {
                    if let Some(cycle) = self.visit_for_cycle(next, marks, stack) {
                        return Some(cycle);
                    }
                }
                _ => {}
            }
        }
        stack.pop();
        marks[idx] = 2;
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle(name: &str, deps: &[&str], tags: &[&str], assets: &[&str], size: u64) -> BundleInfo {
        BundleInfo {
            bundle_name: name.to_string(),
            hash: format!("{}hash", name),
            size,
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
            tags: tags.iter().map(|s| s.to_string()).collect(),
            assets: assets.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn sample() -> BundleManifest {
        BundleManifest::new(
            "1.0.0",
            "2024-01-01 00:00:00",
            "Linux",
            vec![
                bundle("shaders", &[], &["base"], &["Shaders/lit.shader"], 10),
                bundle("ui_common", &["shaders"], &["base", "ui"], &["UI/atlas.png"], 20),
                bundle("login_scene", &["ui_common"], &["ui"], &["Scenes/login.unity"], 40),
            ],
            vec![AssetInfo {
                asset_path: "Config/strings.json".to_string(),
                asset_type: "TextAsset".to_string(),
                bundle_name: "ui_common".to_string(),
                is_raw_file: false,
            }],
        )
    }

    #[test]
    fn test_lookup_indices() {
        let manifest = sample();
        assert_eq!(manifest.bundle("ui_common").unwrap().size, 20);
        assert_eq!(
            manifest.bundle_name_for_asset("Scenes/login.unity"),
            Some("login_scene")
        );
        assert_eq!(
            manifest.bundle_name_for_asset("Config/strings.json"),
            Some("ui_common")
        );
        assert!(manifest.bundle_for_asset("Missing/asset.png").is_none());
        assert_eq!(manifest.asset_paths().len(), 4);
        assert_eq!(manifest.total_size(), 70);
        assert_eq!(manifest.size_by_tag("ui"), 60);
    }

    #[test]
    fn test_tag_union_is_deduplicated_in_manifest_order() {
        let manifest = sample();
        let names: Vec<&str> = manifest
            .bundles_by_tags(&["ui", "base"])
            .iter()
            .map(|b| b.bundle_name.as_str())
            .collect();
        assert_eq!(names, vec!["shaders", "ui_common", "login_scene"]);
        assert!(manifest.bundles_by_tags(&["nope"]).is_empty());
    }

    #[test]
    fn test_required_bundles_lists_dependencies_first() {
        let manifest = sample();
        let names: Vec<&str> = manifest
            .required_bundles("Scenes/login.unity")
            .iter()
            .map(|b| b.bundle_name.as_str())
            .collect();
        assert_eq!(names, vec!["shaders", "ui_common", "login_scene"]);
    }

    #[test]
    fn test_cycle_is_reported_and_walk_terminates() {
        let manifest = BundleManifest::new(
            "1",
            "",
            "Linux",
            vec![
                bundle("a", &["b"], &[], &[], 1),
                bundle("b", &["a"], &[], &[], 1),
            ],
            vec![],
        );
        let deps: Vec<&str> = manifest
            .all_dependencies("a")
            .iter()
            .map(|b| b.bundle_name.as_str())
            .collect();
        assert_eq!(deps, vec!["b"]);
        assert!(manifest
            .check_dependencies()
            .iter()
            .any(|p| p.contains("cycle")));
    }

    #[test]
    fn test_json_round_trip_uses_camel_case_fields() {
        let json = r#"{
            "version": "2.0.0",
            "buildTime": "2024-05-01 10:00:00",
            "platform": "Android",
            "bundles": [
                {"bundleName": "audio", "hash": "abc", "crc": 7, "size": 99,
                 "dependencies": [], "tags": ["sfx"], "priority": 3,
                 "isRawFile": true, "assets": ["Audio/click.wav"]}
            ]
        }"#;
        let manifest = BundleManifest::from_json(json).unwrap();
        assert_eq!(manifest.version(), "2.0.0");
        let audio = manifest.bundle("audio").unwrap();
        assert_eq!(audio.file_name(), "audio_abc");
        assert!(manifest.is_raw_file("Audio/click.wav"));

        let reparsed = BundleManifest::from_json(&manifest.to_json().unwrap()).unwrap();
        assert_eq!(reparsed.bundles(), manifest.bundles());
        assert!(manifest.to_json().unwrap().contains("\"isRawFile\": true"));
    }
}
