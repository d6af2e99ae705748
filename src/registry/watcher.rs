//! Debounced filesystem watching that drives registry reloads.

use super::Registry;
use crate::error::{PromptForgeError, Result};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use notify_debouncer_full::{new_debouncer, DebounceEventResult, Debouncer, FileIdMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Keeps the filesystem watcher alive; dropping it stops monitoring.
pub struct RegistryWatcher {
    #[allow(dead_code)]
    debouncer: Debouncer<notify::RecommendedWatcher, FileIdMap>,
}

impl RegistryWatcher {
    /// Watch the registry's base directory and reload on coalesced changes.
    ///
    /// Rapid successive edits inside the debounce window produce a single
    /// reload, so half-written files are not picked up mid-save.
    pub fn start(registry: Arc<Registry>, debounce: Duration) -> Result<Self> {
        let base_dir = registry.base_dir().clone();

        let mut debouncer = new_debouncer(debounce, None, move |result: DebounceEventResult| {
            match result {
                Ok(events) => {
                    let relevant = events
                        .iter()
                        .filter(|e| is_relevant_event(&e.event))
                        .any(|e| e.event.paths.iter().any(|p| is_resource_path(p)));
                    if !relevant {
                        return;
                    }
                    let summary = registry.reload();
                    debug!(
                        generation = summary.generation,
                        prompts = summary.prompts,
                        errors = summary.errors.len(),
                        "hot reload complete"
                    );
                }
                Err(errors) => {
                    for e in errors {
                        error!("filesystem watcher error: {:?}", e);
                    }
                }
            }
        })
        .map_err(|e| PromptForgeError::Internal {
            message: format!("failed to create filesystem watcher: {}", e),
        })?;

        debouncer
            .watcher()
            .watch(&base_dir, RecursiveMode::Recursive)
            .map_err(|e| PromptForgeError::Internal {
                message: format!("failed to watch {}: {}", base_dir.display(), e),
            })?;

        info!(dir = %base_dir.display(), "watching resources for changes");
        Ok(Self { debouncer })
    }
}

fn is_relevant_event(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

/// Ignore churn from our own sidecar and temp writes.
fn is_resource_path(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if name.ends_with(".tmp") || name.ends_with(".history.json") {
        return false;
    }
    !name.starts_with('.')
}
