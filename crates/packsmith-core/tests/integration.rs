//! End-to-end pipeline tests against an in-memory mirror.

use packsmith_core::{
    verify_installed, BuildOptions, CommitPolicy, CoreError, Pipeline, RecordingSleeper,
    RetryPolicy, ShutdownFlag, Stage, TargetLock,
};
use packsmith_remote::{
    GithubProvider, MemoryFailure, MemoryTransport, MirrorIndexEntry, MirrorProvider,
    ProviderSet, Transport,
};
use packsmith_schema::{parse_manifest_str, Checksum, LockFile, NormalizedManifest};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const BASE: &str = "https://mirror.test/packs";

struct Fixture {
    transport: Arc<MemoryTransport>,
    sleeper: Arc<RecordingSleeper>,
    shutdown: ShutdownFlag,
    pipeline: Pipeline,
    dir: tempfile::TempDir,
}

impl Fixture {
    fn new() -> Self {
        let transport = Arc::new(MemoryTransport::new());
        let shared = Arc::clone(&transport) as Arc<dyn Transport>;
        let providers = ProviderSet::new().with(MirrorProvider::new(Arc::clone(&shared), None));
        let sleeper = Arc::new(RecordingSleeper::new());
        let shutdown = ShutdownFlag::new();
        let pipeline = Pipeline::new(Arc::new(providers), shared)
            .with_sleeper(Arc::clone(&sleeper) as Arc<dyn packsmith_core::Sleeper>)
            .with_shutdown(shutdown.clone());
        Self {
            transport,
            sleeper,
            shutdown,
            pipeline,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn target(&self) -> PathBuf {
        self.dir.path().join("pack")
    }

    fn lock_path(&self) -> PathBuf {
        self.dir.path().join("packsmith.lock")
    }

    fn artifact_url(name: &str, version: &str) -> String {
        format!("{BASE}/{name}/{name}-{version}.jar")
    }

    /// Publish `releases` for `name`, with or without checksums in the index.
    fn publish(&self, name: &str, releases: &[(&str, &[u8])], with_checksums: bool) {
        let index: Vec<MirrorIndexEntry> = releases
            .iter()
            .map(|(version, body)| {
                self.transport
                    .insert(&Self::artifact_url(name, version), body.to_vec());
                MirrorIndexEntry {
                    version: (*version).to_owned(),
                    file: format!("{name}-{version}.jar"),
                    checksum: with_checksums.then(|| Checksum::blake3(body)),
                }
            })
            .collect();
        self.transport.insert(
            &format!("{BASE}/{name}/index.json"),
            serde_json::to_vec(&index).unwrap(),
        );
    }

    /// Publish releases whose file names are chosen by the caller.
    fn publish_files(&self, name: &str, releases: &[(&str, &str, &[u8])]) {
        let index: Vec<MirrorIndexEntry> = releases
            .iter()
            .map(|(version, file, body)| {
                self.transport
                    .insert(&format!("{BASE}/{name}/{file}"), body.to_vec());
                MirrorIndexEntry {
                    version: (*version).to_owned(),
                    file: (*file).to_owned(),
                    checksum: Some(Checksum::blake3(body)),
                }
            })
            .collect();
        self.transport.insert(
            &format!("{BASE}/{name}/index.json"),
            serde_json::to_vec(&index).unwrap(),
        );
    }

    fn installed(&self, relative: &str) -> Option<Vec<u8>> {
        std::fs::read(self.target().join(relative)).ok()
    }

    fn build(
        &self,
        manifest: &NormalizedManifest,
        options: &BuildOptions,
    ) -> Result<packsmith_core::BuildReport, CoreError> {
        self.pipeline
            .build(manifest, &self.target(), &self.lock_path(), options)
    }

    fn lock(&self) -> LockFile {
        LockFile::read_from_file(self.lock_path()).unwrap()
    }
}

/// A manifest of mirror-sourced mods given as `(id, selector)` pairs.
fn manifest(mods: &[(&str, &str)]) -> NormalizedManifest {
    let mut text = String::from("manifest_version = 1\n[pack]\nname = \"horizons\"\n");
    for (id, selector) in mods {
        text.push_str(&format!(
            "\n[[mods]]\nid = \"{id}\"\nversion = \"{selector}\"\n\
             [mods.source]\nprovider = \"mirror\"\nurl = \"{BASE}\"\nname = \"{id}\"\n"
        ));
    }
    parse_manifest_str(&text).unwrap().normalize().unwrap()
}

fn options() -> BuildOptions {
    BuildOptions {
        concurrency: 4,
        retry: RetryPolicy::with_max_attempts(3),
        ..BuildOptions::default()
    }
}

#[test]
fn unchanged_updated_and_removed_entries() {
    let fx = Fixture::new();
    fx.publish("modA", &[("1.0.0", b"a100")], true);
    fx.publish("modB", &[("3.0.0", b"b300"), ("3.1.0", b"b310")], true);
    fx.publish("modC", &[("2.0.0", b"c200")], true);

    let first = manifest(&[("modA", "1.0.0"), ("modB", "3.0.0"), ("modC", "2.0.0")]);
    let report = fx.build(&first, &options()).unwrap();
    assert!(report.is_success());
    assert_eq!(report.plan.to_add.len(), 3);

    let second = manifest(&[("modA", "1.0.0"), ("modB", "3.1.0")]);
    let report = fx.build(&second, &options()).unwrap();
    assert!(report.is_success());

    let unchanged: Vec<&str> = report.plan.unchanged.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(unchanged, vec!["modA"]);
    assert_eq!(report.plan.to_update.len(), 1);
    assert_eq!(report.plan.to_update[0].old.version, "3.0.0");
    assert_eq!(report.plan.to_update[0].new.version, "3.1.0");
    assert_eq!(report.plan.to_remove.len(), 1);
    assert_eq!(report.plan.to_remove[0].id.as_str(), "modC");

    assert_eq!(fx.installed("mods/modA-1.0.0.jar").unwrap(), b"a100");
    assert_eq!(fx.installed("mods/modB-3.1.0.jar").unwrap(), b"b310");
    assert!(fx.installed("mods/modB-3.0.0.jar").is_none());
    assert!(fx.installed("mods/modC-2.0.0.jar").is_none());

    let lock = fx.lock();
    assert_eq!(lock.entries.len(), 2);
    assert_eq!(lock.get("modB").unwrap().checksum, Checksum::blake3(b"b310"));
    // modA was never downloaded a second time.
    assert_eq!(
        fx.transport
            .request_count(&Fixture::artifact_url("modA", "1.0.0")),
        1
    );
}

#[test]
fn second_run_with_unchanged_inputs_is_a_noop() {
    let fx = Fixture::new();
    fx.publish("modA", &[("1.0.0", b"a")], true);
    fx.publish("modB", &[("1.0.0", b"b")], false);
    let pack = manifest(&[("modA", "1.0.0"), ("modB", "latest")]);

    fx.build(&pack, &options()).unwrap();
    let lock_before = std::fs::read(fx.lock_path()).unwrap();

    let report = fx.build(&pack, &options()).unwrap();
    assert!(report.plan.is_noop());
    assert!(report.downloaded.is_empty());
    let assembly = report.assembly.unwrap();
    assert!(assembly.written.is_empty() && assembly.removed.is_empty());
    assert!(!assembly.lock_written);
    assert_eq!(std::fs::read(fx.lock_path()).unwrap(), lock_before);
    for (name, version) in [("modA", "1.0.0"), ("modB", "1.0.0")] {
        assert_eq!(
            fx.transport
                .request_count(&Fixture::artifact_url(name, version)),
            1
        );
    }
}

#[test]
fn mismatched_payload_is_never_written() {
    let fx = Fixture::new();
    fx.publish("modA", &[("1.0.0", b"a100")], true);
    fx.build(&manifest(&[("modA", "1.0.0")]), &options())
        .unwrap();

    // 1.1.0 is advertised with one digest and served with other bytes.
    fx.publish("modA", &[("1.0.0", b"a100"), ("1.1.0", b"a110")], true);
    fx.transport
        .insert(&Fixture::artifact_url("modA", "1.1.0"), b"tampered".to_vec());

    let report = fx
        .build(&manifest(&[("modA", "1.1.0")]), &options())
        .unwrap();
    assert!(!report.is_success());
    assert_eq!(report.failures[0].stage, Stage::Verify);
    assert!(report.failures[0].message.contains("checksum mismatch"));

    assert!(fx.installed("mods/modA-1.1.0.jar").is_none());
    assert_eq!(fx.installed("mods/modA-1.0.0.jar").unwrap(), b"a100");
    assert_eq!(fx.lock().get("modA").unwrap().version, "1.0.0");
}

#[test]
fn all_or_nothing_leaves_target_untouched_on_failure() {
    let fx = Fixture::new();
    fx.publish("modA", &[("1.0.0", b"a1"), ("2.0.0", b"a2")], true);
    fx.publish("modB", &[("1.0.0", b"b1")], true);
    fx.build(&manifest(&[("modA", "1.0.0"), ("modB", "1.0.0")]), &options())
        .unwrap();
    let lock_before = fx.lock();

    let strict = BuildOptions {
        commit: CommitPolicy::AllOrNothing,
        ..options()
    };
    let report = fx
        .build(&manifest(&[("modA", "2.0.0"), ("modB", "9.9.9")]), &strict)
        .unwrap();

    assert!(!report.is_success());
    assert!(!report.committed());
    assert_eq!(report.failures[0].id.as_str(), "modB");
    assert_eq!(fx.lock(), lock_before);
    assert!(fx.installed("mods/modA-1.0.0.jar").is_some());
    assert!(fx.installed("mods/modA-2.0.0.jar").is_none());
}

#[test]
fn partial_commit_keeps_failed_entries_installed() {
    let fx = Fixture::new();
    fx.publish("modA", &[("1.0.0", b"a1"), ("2.0.0", b"a2")], true);
    fx.publish("modB", &[("1.0.0", b"b1")], true);
    fx.build(&manifest(&[("modA", "1.0.0"), ("modB", "1.0.0")]), &options())
        .unwrap();

    let report = fx
        .build(&manifest(&[("modA", "2.0.0"), ("modB", "9.9.9")]), &options())
        .unwrap();
    assert!(!report.is_success());
    assert!(report.committed());

    let lock = fx.lock();
    assert_eq!(lock.get("modA").unwrap().version, "2.0.0");
    assert_eq!(lock.get("modB").unwrap().version, "1.0.0");
    assert!(fx.installed("mods/modB-1.0.0.jar").is_some());
    assert!(fx.installed("mods/modA-1.0.0.jar").is_none());
}

#[test]
fn transient_download_failures_are_retried() {
    let fx = Fixture::new();
    fx.publish("modA", &[("1.0.0", b"a")], true);
    let url = Fixture::artifact_url("modA", "1.0.0");
    fx.transport.fail_next(&url, MemoryFailure::Status(503), 1);
    fx.transport.fail_next(&url, MemoryFailure::Reset, 1);

    let report = fx.build(&manifest(&[("modA", "1.0.0")]), &options()).unwrap();
    assert!(report.is_success());
    assert_eq!(fx.transport.request_count(&url), 3);
    assert_eq!(
        fx.sleeper.delays(),
        vec![Duration::from_millis(500), Duration::from_millis(1000)]
    );
}

#[test]
fn exhausted_retries_fail_only_that_entry() {
    let fx = Fixture::new();
    fx.publish("modA", &[("1.0.0", b"a")], true);
    fx.publish("modB", &[("1.0.0", b"b")], true);
    let url = Fixture::artifact_url("modA", "1.0.0");
    fx.transport.fail_next(&url, MemoryFailure::Timeout, 10);

    let report = fx
        .build(&manifest(&[("modA", "1.0.0"), ("modB", "1.0.0")]), &options())
        .unwrap();
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].stage, Stage::Fetch);
    assert!(report.failures[0].message.contains("after 3 attempts"));
    assert_eq!(fx.transport.request_count(&url), 3);
    assert!(fx.lock().get("modB").is_some());
    assert!(fx.lock().get("modA").is_none());
}

#[test]
fn first_use_checksum_pins_later_downloads() {
    let fx = Fixture::new();
    fx.publish("modA", &[("1.0.0", b"original")], false);
    let pack = manifest(&[("modA", "1.0.0")]);

    let report = fx.build(&pack, &options()).unwrap();
    assert_eq!(report.first_use.len(), 1);
    assert_eq!(
        fx.lock().get("modA").unwrap().checksum,
        Checksum::blake3(b"original")
    );

    // Upstream silently replaces the file, and the local copy is gone.
    fx.transport
        .insert(&Fixture::artifact_url("modA", "1.0.0"), b"replaced".to_vec());
    std::fs::remove_file(fx.target().join("mods/modA-1.0.0.jar")).unwrap();

    let report = fx.build(&pack, &options()).unwrap();
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].stage, Stage::Verify);
    assert!(report.first_use.is_empty());
    assert_eq!(
        fx.lock().get("modA").unwrap().checksum,
        Checksum::blake3(b"original")
    );
}

#[test]
fn latest_and_range_selectors_pick_highest_match() {
    let fx = Fixture::new();
    for name in ["modA", "modB"] {
        fx.publish(
            name,
            &[
                ("1.0.0", b"1"),
                ("1.10.0", b"110"),
                ("1.2.0", b"12"),
                ("2.0.0-beta.1", b"2b"),
            ],
            true,
        );
    }
    let report = fx
        .build(&manifest(&[("modA", "latest"), ("modB", "<1.5")]), &options())
        .unwrap();
    assert!(report.is_success());
    let lock = fx.lock();
    assert_eq!(lock.get("modA").unwrap().version, "1.10.0");
    assert_eq!(lock.get("modB").unwrap().version, "1.2.0");
}

#[test]
fn unmatched_selector_is_a_resolve_failure() {
    let fx = Fixture::new();
    fx.publish("modA", &[("1.0.0", b"1")], true);
    let report = fx
        .build(&manifest(&[("modA", ">=5")]), &options())
        .unwrap();
    assert_eq!(report.failures[0].stage, Stage::Resolve);
    assert!(report.failures[0].message.contains("no release matches"));
}

#[test]
fn interrupt_before_assembly_keeps_previous_lock() {
    let fx = Fixture::new();
    fx.publish("modA", &[("1.0.0", b"a1"), ("2.0.0", b"a2")], true);
    fx.build(&manifest(&[("modA", "1.0.0")]), &options())
        .unwrap();
    let lock_before = fx.lock();

    fx.shutdown.request();
    let result = fx.build(&manifest(&[("modA", "2.0.0")]), &options());
    assert!(matches!(result, Err(CoreError::Interrupted)));
    assert_eq!(fx.lock(), lock_before);
    assert!(fx.installed("mods/modA-2.0.0.jar").is_none());
}

#[test]
fn concurrent_run_on_same_target_is_refused() {
    let fx = Fixture::new();
    fx.publish("modA", &[("1.0.0", b"a")], true);
    let _held = TargetLock::for_target(&fx.target()).unwrap();
    assert!(matches!(
        fx.build(&manifest(&[("modA", "1.0.0")]), &options()),
        Err(CoreError::TargetLocked(_))
    ));
}

#[test]
fn download_cache_serves_rebuilds() {
    let fx = Fixture::new();
    fx.publish("modA", &[("1.0.0", b"a")], true);
    let cached = BuildOptions {
        cache_dir: Some(fx.dir.path().join("cache")),
        ..options()
    };
    let pack = manifest(&[("modA", "1.0.0")]);
    fx.build(&pack, &cached).unwrap();

    std::fs::remove_dir_all(fx.target().join("mods")).unwrap();
    std::fs::remove_file(fx.lock_path()).unwrap();

    let report = fx.build(&pack, &cached).unwrap();
    assert!(report.downloaded.is_empty());
    assert_eq!(report.plan.to_add.len(), 1);
    assert_eq!(fx.installed("mods/modA-1.0.0.jar").unwrap(), b"a");
    assert_eq!(
        fx.transport
            .request_count(&Fixture::artifact_url("modA", "1.0.0")),
        1
    );
}

#[test]
fn outdated_compares_lock_with_upstream() {
    let fx = Fixture::new();
    fx.publish("modA", &[("1.0.0", b"1"), ("1.2.0", b"12")], true);
    fx.publish("modB", &[("3.0.0", b"3")], true);
    let pack = manifest(&[("modA", "1.0.0"), ("modB", "3.0.0")]);
    fx.build(&pack, &options()).unwrap();

    let lock = fx.lock();
    let outdated = fx
        .pipeline
        .check_outdated(&pack, Some(&lock), &options())
        .unwrap();
    let a = outdated.iter().find(|e| e.id.as_str() == "modA").unwrap();
    assert!(a.is_outdated());
    assert_eq!(a.latest.as_deref(), Some("1.2.0"));
    let b = outdated.iter().find(|e| e.id.as_str() == "modB").unwrap();
    assert!(!b.is_outdated());
}

#[test]
fn failed_entry_keeps_its_install_path() {
    let fx = Fixture::new();
    fx.publish_files("modB", &[("1.0.0", "shared.jar", b"b")]);
    fx.build(&manifest(&[("modB", "1.0.0")]), &options()).unwrap();

    fx.transport.remove(&format!("{BASE}/modB/index.json"));
    fx.publish_files("modC", &[("1.0.0", "shared.jar", b"c")]);
    let report = fx
        .build(&manifest(&[("modB", "1.0.0"), ("modC", "1.0.0")]), &options())
        .unwrap();

    let stages: Vec<(&str, Stage)> = report
        .failures
        .iter()
        .map(|f| (f.id.as_str(), f.stage))
        .collect();
    assert_eq!(
        stages,
        vec![("modB", Stage::Resolve), ("modC", Stage::Conflict)]
    );
    assert_eq!(fx.installed("mods/shared.jar").unwrap(), b"b");

    let lock = fx.lock();
    let ids: Vec<&str> = lock.entries.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["modB"]);
    let statuses = verify_installed(&fx.target(), &lock).unwrap();
    assert!(statuses.iter().all(|s| s.is_ok()), "{statuses:?}");
}

#[test]
fn pinned_manifest_still_resolves_two_component_tags() {
    const API: &str = "https://api.test";
    let transport = Arc::new(MemoryTransport::new());
    transport.insert(
        &format!("{API}/repos/GTNewHorizons/modA/releases?per_page=100&page=1"),
        serde_json::to_vec(&serde_json::json!([{
            "tag_name": "1.2",
            "assets": [{
                "name": "modA-1.2.jar",
                "browser_download_url": "https://dl.test/modA-1.2.jar",
            }],
        }]))
        .unwrap(),
    );
    transport.insert("https://dl.test/modA-1.2.jar", b"a12".to_vec());
    let shared = Arc::clone(&transport) as Arc<dyn Transport>;
    let providers = ProviderSet::new().with(GithubProvider::new(Arc::clone(&shared), API));
    let pipeline = Pipeline::new(Arc::new(providers), shared)
        .with_sleeper(Arc::new(RecordingSleeper::new()));

    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("pack");
    let lock_path = dir.path().join("packsmith.lock");
    let mut declared = parse_manifest_str(
        r#"
manifest_version = 1
[pack]
name = "horizons"

[[mods]]
id = "modA"
version = "latest"
[mods.source]
provider = "github"
repo = "GTNewHorizons/modA"
"#,
    )
    .unwrap();

    let first = pipeline
        .build(&declared.normalize().unwrap(), &target, &lock_path, &options())
        .unwrap();
    assert!(first.is_success());
    let lock = LockFile::read_from_file(&lock_path).unwrap();
    assert_eq!(lock.get("modA").unwrap().version, "1.2.0");

    assert_eq!(declared.pin_from_lock(&lock), vec!["modA"]);
    let pinned = parse_manifest_str(&declared.to_toml().unwrap())
        .unwrap()
        .normalize()
        .unwrap();
    let reference = pipeline
        .resolve_entry(pinned.get("modA").unwrap(), &options())
        .unwrap();
    assert_eq!(reference.version, "1.2.0");
    assert_eq!(reference.file_name, "modA-1.2.jar");

    let second = pipeline
        .build(&pinned, &target, &lock_path, &options())
        .unwrap();
    assert!(second.is_success());
    assert!(second.plan.is_noop());
}
