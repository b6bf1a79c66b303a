use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::Mutex;

use crate::config::LauncherConfig;
use crate::errors::Result;
use crate::models::Branch;
use crate::services::transfer::ArtifactTransport;
use crate::utils::file::write_atomic;
use crate::utils::platform::{arch_name, os_name};

const VERSION_CACHE_FILE: &str = "version_cache.json";

/// Builds the URL of the artifact that brings an instance to `version`.
pub fn patch_url(server_base: &str, os: &str, arch: &str, branch: Branch, version: u32) -> String {
    format!(
        "{}/{}/{}/{}/0/{}.pwr",
        server_base.trim_end_matches('/'),
        os,
        arch,
        branch.as_str(),
        version
    )
}

/// Versions to apply, in order, to move from `installed` to `latest`.
pub fn get_patch_sequence(installed: u32, latest: u32) -> Vec<u32> {
    if installed >= latest {
        return Vec::new();
    }
    (installed + 1..=latest).collect()
}

struct Scan {
    latest: u32,
    missing: BTreeSet<u32>,
}

pub struct VersionResolver {
    transport: Arc<dyn ArtifactTransport>,
    server_base: String,
    os: String,
    arch: String,
    miss_tolerance: u32,
    probe_window: u32,
    cache_file: PathBuf,
    versions: Mutex<HashMap<Branch, Vec<u32>>>,
    last_known: Mutex<HashMap<Branch, u32>>,
}

impl VersionResolver {
    pub fn new(config: &LauncherConfig, transport: Arc<dyn ArtifactTransport>) -> Self {
        let cache_file = config.cache_dir().join(VERSION_CACHE_FILE);
        let last_known = load_last_known(&cache_file);
        Self {
            transport,
            server_base: config.patch_server_base.clone(),
            os: os_name().to_string(),
            arch: arch_name().to_string(),
            miss_tolerance: config.probe_miss_tolerance.max(1),
            probe_window: config.probe_window.max(1),
            cache_file,
            versions: Mutex::new(HashMap::new()),
            last_known: Mutex::new(last_known),
        }
    }

    pub fn patch_url(&self, branch: Branch, version: u32) -> String {
        patch_url(&self.server_base, &self.os, &self.arch, branch, version)
    }

    /// Published versions for `branch`, newest first. Cached until `invalidate`.
    pub async fn get_version_list(&self, branch: Branch) -> Result<Vec<u32>> {
        let mut versions = self.versions.lock().await;
        if let Some(cached) = versions.get(&branch) {
            return Ok(cached.clone());
        }

        let start = self
            .last_known
            .lock()
            .await
            .get(&branch)
            .copied()
            .unwrap_or(1)
            .max(1);
        let scan = self.scan_latest(branch, start).await?;
        let latest = scan.latest;
        let list: Vec<u32> = (1..=latest)
            .rev()
            .filter(|version| !scan.missing.contains(version))
            .collect();
        tracing::info!(
            "version scan branch={} start={} latest={} gaps={:?}",
            branch,
            start,
            latest,
            scan.missing
        );

        if latest > 0 {
            self.remember_latest(branch, latest).await;
        }
        versions.insert(branch, list.clone());
        Ok(list)
    }

    pub async fn get_latest_version(&self, branch: Branch) -> Result<Option<u32>> {
        Ok(self.get_version_list(branch).await?.first().copied())
    }

    /// Drops the in-memory list so the next call rescans from the last-known version.
    pub async fn invalidate(&self, branch: Branch) {
        self.versions.lock().await.remove(&branch);
    }

    async fn exists(&self, branch: Branch, version: u32) -> Result<bool> {
        let url = self.patch_url(branch, version);
        let probe = self.transport.probe(&url).await?;
        tracing::debug!("version probe branch={} version={} exists={}", branch, version, probe.exists());
        Ok(probe.exists())
    }

    /// Finds the newest published version at or above `start`. Versions below
    /// `start` are assumed published unless the scan probed them as missing.
    async fn scan_latest(&self, branch: Branch, start: u32) -> Result<Scan> {
        let mut missing = BTreeSet::new();
        if !self.exists(branch, start).await? {
            missing.insert(start);
            // Last-known version vanished; walk back until something is published.
            for candidate in (1..start).rev() {
                if self.exists(branch, candidate).await? {
                    return Ok(Scan {
                        latest: candidate,
                        missing,
                    });
                }
                missing.insert(candidate);
            }
            return Ok(Scan { latest: 0, missing });
        }

        let mut latest = start;
        let mut next = start.saturating_add(1);
        let mut misses = 0;
        while misses < self.miss_tolerance {
            let batch: Vec<u32> = (0..self.probe_window)
                .map(|offset| next.saturating_add(offset))
                .collect();
            let results = join_all(batch.iter().map(|version| self.exists(branch, *version))).await;
            for (version, found) in batch.iter().zip(results) {
                if found? {
                    latest = *version;
                    misses = 0;
                } else {
                    missing.insert(*version);
                    misses += 1;
                    if misses >= self.miss_tolerance {
                        break;
                    }
                }
            }
            next = next.saturating_add(self.probe_window);
        }
        missing.retain(|version| *version < latest);
        Ok(Scan { latest, missing })
    }

    async fn remember_latest(&self, branch: Branch, latest: u32) {
        let mut last_known = self.last_known.lock().await;
        last_known.insert(branch, latest);
        let serializable: HashMap<&str, u32> = last_known
            .iter()
            .map(|(branch, version)| (branch.as_str(), *version))
            .collect();
        match serde_json::to_vec_pretty(&serializable) {
            Ok(payload) => {
                if let Err(err) = write_atomic(&self.cache_file, &payload) {
                    tracing::warn!("failed to persist version cache: {}", err);
                }
            }
            Err(err) => tracing::warn!("failed to encode version cache: {}", err),
        }
    }
}

fn load_last_known(path: &std::path::Path) -> HashMap<Branch, u32> {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return HashMap::new();
    };
    let parsed: HashMap<String, u32> = match serde_json::from_str(&raw) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!("ignoring unreadable version cache {}: {}", path.display(), err);
            return HashMap::new();
        }
    };
    parsed
        .into_iter()
        .filter_map(|(key, version)| key.parse::<Branch>().ok().map(|branch| (branch, version)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::transfer::{ByteProgress, ProbeResult};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::path::Path;
    use std::sync::Mutex as StdMutex;
    use tokio_util::sync::CancellationToken;
    use crate::utils::test_support::TempRoot;

    struct PublishedSet {
        versions: HashSet<u32>,
        probes: StdMutex<Vec<u32>>,
    }

    impl PublishedSet {
        fn new(versions: impl IntoIterator<Item = u32>) -> Arc<Self> {
            Arc::new(Self {
                versions: versions.into_iter().collect(),
                probes: StdMutex::new(Vec::new()),
            })
        }

        fn probed(&self) -> Vec<u32> {
            self.probes.lock().expect("probe log").clone()
        }
    }

    #[async_trait]
    impl ArtifactTransport for PublishedSet {
        async fn probe(&self, url: &str) -> Result<ProbeResult> {
            let version: u32 = url
                .rsplit('/')
                .next()
                .and_then(|name| name.strip_suffix(".pwr"))
                .and_then(|value| value.parse().ok())
                .expect("versioned url");
            self.probes.lock().expect("probe log").push(version);
            if self.versions.contains(&version) {
                Ok(ProbeResult::Present { size: Some(1024) })
            } else {
                Ok(ProbeResult::Missing)
            }
        }

        async fn download(
            &self,
            _url: &str,
            _dest: &Path,
            _on_progress: ByteProgress<'_>,
            _cancel: &CancellationToken,
        ) -> Result<u64> {
            unreachable!("resolver never downloads")
        }
    }

    fn config(root: &TempRoot) -> LauncherConfig {
        LauncherConfig {
            root_dir: root.path().to_path_buf(),
            patch_server_base: "https://patches.test/p/".to_string(),
            ..LauncherConfig::default()
        }
    }

    #[test]
    fn patch_sequence_is_contiguous_run_to_latest() {
        assert_eq!(get_patch_sequence(3, 5), vec![4, 5]);
        assert_eq!(get_patch_sequence(0, 3), vec![1, 2, 3]);
        assert!(get_patch_sequence(5, 5).is_empty());
        assert!(get_patch_sequence(9, 5).is_empty());

        for installed in 0..20u32 {
            for latest in 0..20u32 {
                let hops = get_patch_sequence(installed, latest);
                if installed < latest {
                    let expected: Vec<u32> = (installed + 1..=latest).collect();
                    assert_eq!(hops, expected);
                } else {
                    assert!(hops.is_empty());
                }
            }
        }
    }

    #[test]
    fn patch_url_follows_server_layout() {
        assert_eq!(
            patch_url("https://cdn.test/patches/", "linux", "amd64", Branch::PreRelease, 12),
            "https://cdn.test/patches/linux/amd64/pre-release/0/12.pwr"
        );
    }

    #[tokio::test]
    async fn scans_from_scratch_and_caches() {
        let root = TempRoot::new("game-updater-versions");
        let published = PublishedSet::new(1..=7);
        let resolver = VersionResolver::new(&config(&root), published.clone());

        let list = resolver
            .get_version_list(Branch::Release)
            .await
            .expect("version list");
        assert_eq!(list, vec![7, 6, 5, 4, 3, 2, 1]);

        let probes_after_first = published.probed().len();
        let again = resolver
            .get_version_list(Branch::Release)
            .await
            .expect("cached list");
        assert_eq!(again, list);
        assert_eq!(published.probed().len(), probes_after_first);

        resolver.invalidate(Branch::Release).await;
        resolver
            .get_version_list(Branch::Release)
            .await
            .expect("rescanned list");
        assert!(published.probed().len() > probes_after_first);
    }

    #[tokio::test]
    async fn restart_resumes_from_persisted_last_known() {
        let root = TempRoot::new("game-updater-versions");
        let config = config(&root);
        {
            let first = VersionResolver::new(&config, PublishedSet::new(1..=5));
            first
                .get_latest_version(Branch::Release)
                .await
                .expect("first scan");
        }

        let published = PublishedSet::new(1..=6);
        let resolver = VersionResolver::new(&config, published.clone());
        let latest = resolver
            .get_latest_version(Branch::Release)
            .await
            .expect("second scan");

        assert_eq!(latest, Some(6));
        assert!(published.probed().iter().all(|version| *version >= 5));
    }

    #[tokio::test]
    async fn walks_back_when_last_known_disappears() {
        let root = TempRoot::new("game-updater-versions");
        let config = config(&root);
        {
            let first = VersionResolver::new(&config, PublishedSet::new(1..=9));
            first
                .get_latest_version(Branch::PreRelease)
                .await
                .expect("first scan");
        }

        let resolver = VersionResolver::new(&config, PublishedSet::new(1..=6));
        let list = resolver
            .get_version_list(Branch::PreRelease)
            .await
            .expect("rolled back list");
        assert_eq!(list.first(), Some(&6));
        assert_eq!(list.len(), 6);
    }

    #[tokio::test]
    async fn gaps_are_skipped_but_not_listed() {
        let root = TempRoot::new("game-updater-versions");
        let resolver = VersionResolver::new(&config(&root), PublishedSet::new([1, 2, 3, 5]));

        let list = resolver
            .get_version_list(Branch::Release)
            .await
            .expect("scan with gap");

        assert_eq!(list, vec![5, 3, 2, 1]);
        assert_eq!(
            resolver.get_latest_version(Branch::Release).await.expect("latest"),
            Some(5)
        );
    }

    #[tokio::test]
    async fn empty_server_yields_no_versions() {
        let root = TempRoot::new("game-updater-versions");
        let resolver = VersionResolver::new(&config(&root), PublishedSet::new(Vec::<u32>::new()));
        let list = resolver
            .get_version_list(Branch::Release)
            .await
            .expect("empty scan");
        assert!(list.is_empty());
    }
}
