//! Standalone plugin install flow against a mock releases host

use std::collections::HashMap;
use std::fs;
use std::sync::Arc;

use flate2::write::GzEncoder;
use flate2::Compression;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crucible_core::types::{ActionData, InstallStatus, InstallationPatch, ProgressReporter};
use crucible_core::{CancelToken, InstallationStore, JsonInstallationStore, OutputSink, Settings};
use crucible_pipeline::Downloader;
use crucible_snapshot::{SnapshotService, SnapshotTrigger};
use crucible_sources::plugin::SourcePlugin;
use crucible_sources::standalone::StandaloneSource;
use crucible_sources::InstallContext;
use crucible_update::UpdateTracker;

/// A tar.gz bundle with an app entrypoint and a bundled runtime
fn build_bundle() -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::fast());
    let mut builder = tar::Builder::new(encoder);

    let mut add = |path: &str, content: &[u8]| {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, content).unwrap();
    };
    add("main.py", b"print('hello')\n");
    add("requirements.txt", b"requests==2.32.0\n");
    add("runtime/python", b"#!/bin/sh\n");

    builder.into_inner().unwrap().finish().unwrap()
}

async fn mock_release_host(archive: &[u8]) -> MockServer {
    let server = MockServer::start().await;
    let asset_url = format!("{}/download/bundle-linux-nvidia-cu128.tar.gz", server.uri());

    Mock::given(method("GET"))
        .and(path("/repos/acme/bundle/releases/tags/v1.2.0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "tag_name": "v1.2.0",
            "name": "Release v1.2.0",
            "body": "notes",
            "prerelease": false,
            "draft": false,
            "published_at": "2026-08-01T00:00:00Z",
            "assets": [{
                "name": "bundle-linux-nvidia-cu128.tar.gz",
                "browser_download_url": asset_url,
                "size": archive.len()
            }]
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/download/bundle-linux-nvidia-cu128.tar.gz"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(archive.to_vec()))
        .mount(&server)
        .await;

    server
}

fn context(dir: &TempDir, server: &MockServer) -> (Arc<JsonInstallationStore>, InstallContext) {
    let store = Arc::new(JsonInstallationStore::new(dir.path().join("store.json")));
    let settings = Settings {
        releases_base_url: server.uri(),
        releases_repository: "acme/bundle".to_string(),
        ..Default::default()
    };
    let ctx = InstallContext {
        store: store.clone(),
        settings: settings.clone(),
        downloader: Downloader::new(dir.path().join("cache")).unwrap(),
        updates: Arc::new(UpdateTracker::new(server.uri(), 3600).unwrap()),
        reporter: ProgressReporter::discard(),
        output: OutputSink::discard(),
        cancel: CancelToken::new(),
    };
    (store, ctx)
}

#[tokio::test]
async fn test_install_produces_tree_env_and_boot_snapshot() {
    let archive = build_bundle();
    let server = mock_release_host(&archive).await;
    let dir = TempDir::new().unwrap();
    let (store, ctx) = context(&dir, &server);

    let mut selections = HashMap::new();
    selections.insert("name".to_string(), "Main".to_string());
    selections.insert(
        "install_path".to_string(),
        dir.path().join("main").to_string_lossy().to_string(),
    );
    selections.insert("release".to_string(), "v1.2.0".to_string());
    selections.insert("variant".to_string(), "linux-nvidia-cu128".to_string());

    let plugin = StandaloneSource;
    let patch = plugin.build_installation(&selections).unwrap();
    let record = store.create(patch).await.unwrap();
    assert_eq!(record.status, InstallStatus::Pending);

    plugin.install(&record, &ctx).await.unwrap();
    plugin.post_install(&record, &ctx).await.unwrap();

    // Extracted application tree
    let app = record.install_path.join("app");
    assert!(app.join("main.py").is_file());

    // Environment bootstrapped and activated
    let updated = store.get(&record.id).await.unwrap();
    assert_eq!(updated.active_env.as_deref(), Some("main"));
    assert!(record.install_path.join("envs").join("main").is_dir());
    assert!(record
        .install_path
        .join("envs")
        .join("master")
        .join("bin")
        .join("python")
        .is_file());

    // Boot snapshot exists
    let snapshots = SnapshotService::new(&updated, store.clone());
    let listed = snapshots.list().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].snapshot.trigger, SnapshotTrigger::Boot);

    // Launchable once the engine flips the status
    store
        .update(&record.id, InstallationPatch::status(InstallStatus::Installed))
        .await
        .unwrap();
    let installed = store.get(&record.id).await.unwrap();
    let command = plugin.launch_command(&installed).unwrap();
    assert!(command.program.ends_with("bin/python"));
    assert_eq!(command.cwd, app);
}

#[tokio::test]
async fn test_cancelled_install_leaves_no_app_tree() {
    let archive = build_bundle();
    let server = mock_release_host(&archive).await;
    let dir = TempDir::new().unwrap();
    let (store, ctx) = context(&dir, &server);

    let mut selections = HashMap::new();
    selections.insert("name".to_string(), "Main".to_string());
    selections.insert(
        "install_path".to_string(),
        dir.path().join("main").to_string_lossy().to_string(),
    );
    selections.insert("release".to_string(), "v1.2.0".to_string());
    selections.insert("variant".to_string(), "linux-nvidia-cu128".to_string());

    let plugin = StandaloneSource;
    let record = store
        .create(plugin.build_installation(&selections).unwrap())
        .await
        .unwrap();

    ctx.cancel.cancel();
    let err = plugin.install(&record, &ctx).await.unwrap_err();
    assert!(err
        .downcast_ref::<crucible_core::Error>()
        .is_some_and(crucible_core::Error::is_cancelled));

    assert!(!record.install_path.join("app").join("main.py").exists());
    let unchanged = store.get(&record.id).await.unwrap();
    assert_eq!(unchanged.status, InstallStatus::Pending);
}

#[tokio::test]
async fn test_failed_update_preserves_prior_install() {
    let archive = build_bundle();
    let server = mock_release_host(&archive).await;
    let dir = TempDir::new().unwrap();
    let (store, ctx) = context(&dir, &server);

    // A newer release whose asset download always fails
    let broken_url = format!("{}/download/broken.tar.gz", server.uri());
    let newer = serde_json::json!({
        "tag_name": "v1.3.0",
        "name": "Release v1.3.0",
        "body": "notes",
        "prerelease": false,
        "draft": false,
        "published_at": "2026-08-20T00:00:00Z",
        "assets": [{
            "name": "bundle-linux-nvidia-cu128.tar.gz",
            "browser_download_url": broken_url,
            "size": 64
        }]
    });
    Mock::given(method("GET"))
        .and(path("/repos/acme/bundle/releases/latest"))
        .respond_with(ResponseTemplate::new(200).set_body_json(newer.clone()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/repos/acme/bundle/releases/tags/v1.3.0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(newer))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/download/broken.tar.gz"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let mut selections = HashMap::new();
    selections.insert("name".to_string(), "Main".to_string());
    selections.insert(
        "install_path".to_string(),
        dir.path().join("main").to_string_lossy().to_string(),
    );
    selections.insert("release".to_string(), "v1.2.0".to_string());
    selections.insert("variant".to_string(), "linux-nvidia-cu128".to_string());

    let plugin = StandaloneSource;
    let record = store
        .create(plugin.build_installation(&selections).unwrap())
        .await
        .unwrap();
    plugin.install(&record, &ctx).await.unwrap();
    store
        .update(&record.id, InstallationPatch::status(InstallStatus::Installed))
        .await
        .unwrap();

    let installed = store.get(&record.id).await.unwrap();
    let err = plugin
        .handle_action("apply-update", &installed, &ActionData::default(), &ctx)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Download failed"));

    // The v1.2.0 tree survived the dead update and is still launchable
    assert!(record.install_path.join("app").join("main.py").is_file());
    let after = store.get(&record.id).await.unwrap();
    assert_eq!(after.version.as_deref(), Some("v1.2.0"));
    assert!(plugin.launch_command(&after).is_some());

    // The pre-update snapshot was taken before anything destructive
    let snapshots = SnapshotService::new(&after, store.clone());
    let listed = snapshots.list().await.unwrap();
    assert!(listed
        .iter()
        .any(|e| e.snapshot.trigger == SnapshotTrigger::PreUpdate));
}

#[tokio::test]
async fn test_missing_variant_asset_is_invalid_release() {
    let archive = build_bundle();
    let server = mock_release_host(&archive).await;
    let dir = TempDir::new().unwrap();
    let (store, ctx) = context(&dir, &server);

    let mut selections = HashMap::new();
    selections.insert("name".to_string(), "Main".to_string());
    selections.insert(
        "install_path".to_string(),
        dir.path().join("main").to_string_lossy().to_string(),
    );
    selections.insert("release".to_string(), "v1.2.0".to_string());
    selections.insert("variant".to_string(), "macos-arm64".to_string());

    let plugin = StandaloneSource;
    let record = store
        .create(plugin.build_installation(&selections).unwrap())
        .await
        .unwrap();

    let err = plugin.install(&record, &ctx).await.unwrap_err();
    assert!(err.to_string().contains("Invalid release metadata"));
}
