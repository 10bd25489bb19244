use modsync_lib::cache::{hash_bytes, RetryPolicy};
use modsync_lib::provider::MemoryProvider;
use modsync_lib::storage::{LocalStorage, StorageBackend};
use modsync_lib::{
    cancel_pair, progress_channel, CancelToken, ContentCache, Dependency, InstallRequest,
    Installation, Lockfile, LockfileError, Profile, ProfileMod, ProgressEvent, ResolutionError,
    ResolvedVersion, SyncConfig, SyncEngine, SyncError, VersionTarget,
};
use semver::Version;
use std::collections::BTreeMap;
use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};
use zip::write::SimpleFileOptions;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn archive(reference: &str, version: &str, payload: &[u8]) -> Vec<u8> {
    let descriptor = serde_json::json!({
        "FriendlyName": reference,
        "CreatedBy": "Tests",
        "SemVersion": version,
    });
    let mut buf = Cursor::new(Vec::new());
    {
        let mut zip = zip::ZipWriter::new(&mut buf);
        let options = SimpleFileOptions::default();
        zip.start_file(format!("{}.uplugin", reference), options).unwrap();
        zip.write_all(descriptor.to_string().as_bytes()).unwrap();
        zip.start_file("Binaries/Win64/payload.bin", options).unwrap();
        zip.write_all(payload).unwrap();
        zip.finish().unwrap();
    }
    buf.into_inner()
}

struct Fixture {
    server: MockServer,
    cache_dir: TempDir,
    game_dir: TempDir,
}

impl Fixture {
    async fn new() -> Self {
        init_logging();
        let game_dir = TempDir::new().unwrap();
        std::fs::write(game_dir.path().join("FactoryGame.exe"), b"MZ").unwrap();
        Self {
            server: MockServer::start().await,
            cache_dir: TempDir::new().unwrap(),
            game_dir,
        }
    }

    /// Serve `data` once and describe it as a version with a Windows target.
    async fn publish(
        &self,
        reference: &str,
        version: &str,
        data: &[u8],
        deps: &[(&str, &str)],
        expected_calls: u64,
    ) -> ResolvedVersion {
        let route = format!("/{}/{}.smod", reference, version);
        Mock::given(method("GET"))
            .and(path(route.clone()))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(data.to_vec()))
            .expect(expected_calls)
            .mount(&self.server)
            .await;

        let mut targets = BTreeMap::new();
        targets.insert(
            "Windows".to_string(),
            VersionTarget {
                link: format!("{}{}", self.server.uri(), route),
                hash: hash_bytes(data),
                size: data.len() as u64,
            },
        );
        ResolvedVersion {
            id: format!("{}-{}", reference, version),
            version: Version::parse(version).unwrap(),
            dependencies: deps
                .iter()
                .map(|(r, c)| Dependency {
                    reference: r.to_string(),
                    constraint: c.to_string(),
                    optional: false,
                })
                .collect(),
            targets,
        }
    }

    async fn engine(&self, provider: MemoryProvider) -> SyncEngine {
        let config = SyncConfig {
            cache_dir: self.cache_dir.path().to_path_buf(),
            ..SyncConfig::default()
        };
        let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(self.cache_dir.path()));
        let retry = RetryPolicy {
            retries: 1,
            delay: Duration::from_millis(1),
        };
        let cache = ContentCache::with_storage(storage, reqwest::Client::new(), retry)
            .await
            .unwrap();
        SyncEngine::new(config, Arc::new(provider), Arc::new(cache))
    }

    fn installation(&self) -> Installation {
        Installation::new(self.game_dir.path().to_string_lossy().to_string(), "default")
    }

    fn mod_file(&self, reference: &str) -> std::path::PathBuf {
        self.game_dir
            .path()
            .join("FactoryGame/Mods")
            .join(reference)
            .join("Binaries/Win64/payload.bin")
    }

    fn lockfile(&self) -> Option<Lockfile> {
        read_lockfile(self.game_dir.path())
    }
}

fn read_lockfile(root: &Path) -> Option<Lockfile> {
    let path = root.join("FactoryGame/Mods/mods-lock.json");
    let data = std::fs::read(path).ok()?;
    Some(Lockfile::from_json("mods-lock.json", &data).unwrap())
}

fn profile(mods: &[(&str, &str)]) -> Profile {
    let mut profile = Profile::new("default");
    for (reference, constraint) in mods {
        profile.add_mod(*reference, *reference, *constraint).unwrap();
    }
    profile
}

#[tokio::test]
async fn sync_installs_then_reuses_then_removes() {
    let fixture = Fixture::new().await;
    let foo = fixture
        .publish("Foo", "1.0.0", &archive("Foo", "1.0.0", b"foo"), &[("SML", "^3.0.0")], 1)
        .await;
    let sml = fixture
        .publish("SML", "3.6.1", &archive("SML", "3.6.1", b"sml"), &[], 1)
        .await;
    let provider = MemoryProvider::new()
        .with_package("Foo", "Foo Mod", vec![foo])
        .with_package("SML", "Mod Loader", vec![sml]);
    let engine = fixture.engine(provider).await;
    let installation = fixture.installation();
    let mut profile = profile(&[("Foo", "^1.0.0")]);

    let (sender, mut receiver) = progress_channel(256);
    let report = engine
        .install(&installation, &profile, Some(sender), &CancelToken::never())
        .await
        .unwrap();

    assert_eq!(report.installed, vec!["Foo".to_string(), "SML".to_string()]);
    assert!(!report.cancelled);
    assert_eq!(std::fs::read(fixture.mod_file("Foo")).unwrap(), b"foo");
    assert_eq!(std::fs::read(fixture.mod_file("SML")).unwrap(), b"sml");
    let lockfile = fixture.lockfile().unwrap();
    assert_eq!(lockfile.get("SML").unwrap().version, "3.6.1");
    assert_eq!(lockfile.get("Foo").unwrap().dependencies["SML"], "^3.0.0");

    let mut events = Vec::new();
    while let Some(event) = receiver.try_recv() {
        events.push(event);
    }
    let position = |wanted: &ProgressEvent| events.iter().position(|e| e == wanted).unwrap();
    let foo_download = position(&ProgressEvent::ModDownload("Foo".to_string(), 1.0));
    let foo_extract = position(&ProgressEvent::ModExtract("Foo".to_string(), 1.0));
    let foo_done = position(&ProgressEvent::ModComplete("Foo".to_string()));
    assert!(foo_download < foo_extract && foo_extract < foo_done);
    assert!(position(&ProgressEvent::ModComplete("SML".to_string())) > foo_done);
    assert_eq!(events.last(), Some(&ProgressEvent::Overall(1.0)));

    // Same profile again: nothing to download, nothing to extract.
    let report = engine
        .install(&installation, &profile, None, &CancelToken::never())
        .await
        .unwrap();
    assert!(report.installed.is_empty());
    assert_eq!(report.unchanged, vec!["Foo".to_string(), "SML".to_string()]);

    // Disabling Foo drops it and its now unneeded dependency.
    profile.set_enabled("Foo", false);
    let report = engine
        .install(&installation, &profile, None, &CancelToken::never())
        .await
        .unwrap();
    assert_eq!(report.removed, vec!["Foo".to_string(), "SML".to_string()]);
    assert!(!fixture.mod_file("Foo").exists());
    assert!(fixture.lockfile().unwrap().mods.is_empty());
}

#[tokio::test]
async fn failed_package_keeps_previous_lockfile() {
    let fixture = Fixture::new().await;
    let good = fixture
        .publish("Good", "1.0.0", &archive("Good", "1.0.0", b"good"), &[], 1)
        .await;
    let mut broken = fixture
        .publish("Broken", "1.0.0", &archive("Broken", "1.0.0", b"x"), &[], 0)
        .await;
    for target in broken.targets.values_mut() {
        target.link = format!("{}/missing.smod", fixture.server.uri());
    }
    Mock::given(method("GET"))
        .and(path("/missing.smod"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&fixture.server)
        .await;

    let provider = MemoryProvider::new()
        .with_package("Good", "Good", vec![good])
        .with_package("Broken", "Broken", vec![broken]);
    let engine = fixture.engine(provider).await;

    let err = engine
        .install(
            &fixture.installation(),
            &profile(&[("Broken", "*"), ("Good", "*")]),
            None,
            &CancelToken::never(),
        )
        .await
        .unwrap_err();

    match err {
        SyncError::PackagesFailed { failures } => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].reference, "Broken");
        }
        other => panic!("unexpected error: {}", other),
    }
    // The healthy package was still processed, but nothing was committed.
    assert!(fixture.mod_file("Good").exists());
    assert!(fixture.lockfile().is_none());
}

#[tokio::test]
async fn cancellation_stops_between_packages() {
    let fixture = Fixture::new().await;
    let foo = fixture
        .publish("Foo", "1.0.0", &archive("Foo", "1.0.0", b"foo"), &[], 0)
        .await;
    let provider = MemoryProvider::new().with_package("Foo", "Foo", vec![foo]);
    let engine = fixture.engine(provider).await;

    let (handle, token) = cancel_pair();
    handle.cancel();
    let report = engine
        .install(&fixture.installation(), &profile(&[("Foo", "*")]), None, &token)
        .await
        .unwrap();

    assert!(report.cancelled);
    assert!(report.installed.is_empty());
    assert!(!fixture.mod_file("Foo").exists());
    // Nothing completed, so the committed lockfile lists nothing.
    assert!(fixture.lockfile().map(|l| l.mods.is_empty()).unwrap_or(true));
}

#[tokio::test]
async fn batch_isolates_invalid_installations() {
    let fixture = Fixture::new().await;
    let foo = fixture
        .publish("Foo", "1.0.0", &archive("Foo", "1.0.0", b"foo"), &[], 1)
        .await;
    let provider = MemoryProvider::new().with_package("Foo", "Foo", vec![foo]);
    let engine = fixture.engine(provider).await;

    let empty_dir = TempDir::new().unwrap();
    let requests = vec![
        InstallRequest {
            installation: Installation::new(
                empty_dir.path().to_string_lossy().to_string(),
                "default",
            ),
            profile: profile(&[("Foo", "*")]),
        },
        InstallRequest {
            installation: fixture.installation(),
            profile: profile(&[("Foo", "*")]),
        },
    ];

    let results = engine
        .install_batch(&requests, None, &CancelToken::never())
        .await;
    assert_eq!(results.len(), 2);
    assert!(matches!(results[0].1, Err(SyncError::Validation(_))));
    assert_eq!(
        results[1].1.as_ref().unwrap().installed,
        vec!["Foo".to_string()]
    );
}

#[tokio::test]
async fn resolution_errors_use_display_names() {
    let fixture = Fixture::new().await;
    let provider = MemoryProvider::new();
    let engine = fixture.engine(provider).await;

    let err = engine
        .install(
            &fixture.installation(),
            &profile(&[("Unknown$$$", ">0.0.0")]),
            None,
            &CancelToken::never(),
        )
        .await
        .unwrap_err();
    match err {
        SyncError::Resolution { explanation, .. } => assert!(explanation.contains("Unknown$$$")),
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn unsafe_references_never_touch_the_mods_directory() {
    let fixture = Fixture::new().await;
    let engine = fixture.engine(MemoryProvider::new()).await;
    let mods_dir = fixture.game_dir.path().join("FactoryGame/Mods");
    let keep = mods_dir.join("Other/keep.txt");
    std::fs::create_dir_all(keep.parent().unwrap()).unwrap();
    std::fs::write(&keep, b"keep").unwrap();

    // Profiles edited by hand can bypass Profile::add_mod.
    for reference in ["", ".."] {
        let mut profile = Profile::new("default");
        profile.mods.insert(
            reference.to_string(),
            ProfileMod {
                display_name: "Bad".to_string(),
                version: "*".to_string(),
                enabled: true,
            },
        );
        let err = engine
            .install(&fixture.installation(), &profile, None, &CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::Resolution {
                source: ResolutionError::InvalidReference { .. },
                ..
            }
        ));
    }

    // A lockfile naming the parent directory is refused instead of removed.
    let lockfile = br#"{"version": 1, "mods": {"..": {"version": "1.0.0"}}}"#;
    std::fs::write(mods_dir.join("mods-lock.json"), lockfile).unwrap();
    let err = engine
        .install(&fixture.installation(), &profile(&[]), None, &CancelToken::never())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SyncError::Lockfile(LockfileError::InvalidReference { .. })
    ));

    assert_eq!(std::fs::read(&keep).unwrap(), b"keep");
    assert!(fixture.game_dir.path().join("FactoryGame.exe").exists());
}
