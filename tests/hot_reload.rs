//! Hot-reload behavior: snapshot isolation for in-flight requests, atomic
//! swap, generation counting, and the debounced watcher.

use prompt_forge::registry::watcher::RegistryWatcher;
use prompt_forge::registry::Registry;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn write_file(path: &Path, content: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

// S6: a request that took its snapshot before a swap keeps seeing the old
// version; the next request sees the new one; generation bumps exactly once.
#[test]
fn in_flight_snapshot_survives_reload() {
    let dir = tempfile::tempdir().unwrap();
    let prompt_path = dir.path().join("prompts/greeting.toml");
    write_file(&prompt_path, "name = \"Greeting\"\ntemplate = \"v1\"\n");

    let (registry, _) = Registry::load(dir.path().to_path_buf()).unwrap();
    let generation_before = registry.generation();

    // Request R1 takes its snapshot
    let in_flight = registry.snapshot();
    assert_eq!(in_flight.prompt("greeting").unwrap().template, "v1");

    // Disk mutation + reload swap while R1 is "running"
    write_file(&prompt_path, "name = \"Greeting\"\ntemplate = \"v2\"\n");
    let summary = registry.reload();

    // R1 still sees v1; a fresh snapshot sees v2
    assert_eq!(in_flight.prompt("greeting").unwrap().template, "v1");
    assert_eq!(registry.snapshot().prompt("greeting").unwrap().template, "v2");
    assert_eq!(summary.generation, generation_before + 1);
    assert_eq!(registry.generation(), generation_before + 1);
}

#[test]
fn reload_failure_is_isolated_per_resource() {
    let dir = tempfile::tempdir().unwrap();
    write_file(
        &dir.path().join("prompts/stable.toml"),
        "name = \"Stable\"\ntemplate = \"ok\"\n",
    );
    write_file(
        &dir.path().join("prompts/other.toml"),
        "name = \"Other\"\ntemplate = \"ok\"\n",
    );
    let (registry, _) = Registry::load(dir.path().to_path_buf()).unwrap();

    // Break one file; the other keeps loading and the broken one retains
    // its previous version
    write_file(&dir.path().join("prompts/stable.toml"), "not toml {{{{");
    let summary = registry.reload();
    assert_eq!(summary.errors.len(), 1);
    let snapshot = registry.snapshot();
    assert!(snapshot.prompt("other").is_some());
    assert_eq!(snapshot.prompt("stable").unwrap().template, "ok");
}

#[tokio::test]
async fn watcher_debounces_rapid_edits_into_one_reload() {
    let dir = tempfile::tempdir().unwrap();
    let prompt_path = dir.path().join("prompts/watched.toml");
    write_file(&prompt_path, "name = \"Watched\"\ntemplate = \"v1\"\n");

    let (registry, _) = Registry::load(dir.path().to_path_buf()).unwrap();
    let registry = Arc::new(registry);
    let _watcher = RegistryWatcher::start(Arc::clone(&registry), Duration::from_millis(200))
        .expect("watcher should start");
    let generation_before = registry.generation();

    // Rapid successive edits inside the debounce window
    for i in 2..=4 {
        write_file(
            &prompt_path,
            &format!("name = \"Watched\"\ntemplate = \"v{}\"\n", i),
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    // Wait out the debounce window plus processing slack
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let generation_after = registry.generation();
    assert!(
        generation_after > generation_before,
        "watcher should have reloaded"
    );
    assert!(
        generation_after - generation_before <= 2,
        "rapid edits should coalesce, got {} reloads",
        generation_after - generation_before
    );
    assert_eq!(
        registry.snapshot().prompt("watched").unwrap().template,
        "v4"
    );
}

#[tokio::test]
async fn sidecar_history_writes_do_not_trigger_reload() {
    let dir = tempfile::tempdir().unwrap();
    write_file(
        &dir.path().join("prompts/quiet.toml"),
        "name = \"Quiet\"\ntemplate = \"x\"\n",
    );
    let (registry, _) = Registry::load(dir.path().to_path_buf()).unwrap();
    let registry = Arc::new(registry);
    let _watcher = RegistryWatcher::start(Arc::clone(&registry), Duration::from_millis(100))
        .expect("watcher should start");
    let generation_before = registry.generation();

    write_file(
        &dir.path().join("prompts/quiet.toml.history.json"),
        "{\"versions\": []}",
    );
    tokio::time::sleep(Duration::from_millis(800)).await;

    assert_eq!(registry.generation(), generation_before);
}
