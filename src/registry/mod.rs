//! In-memory resource registry mirrored from the resources directory.
//!
//! The active set is an immutable snapshot behind an atomic pointer: reloads
//! build a complete new set off to the side and swap it in one operation.
//! A request clones the pointer once at entry and keeps that snapshot for
//! its whole lifetime, so a mid-flight swap never changes what it sees.

pub mod loader;
pub mod watcher;

use crate::error::Result;
use crate::frameworks::Methodology;
use crate::gates::Gate;
use crate::prompts::Prompt;
use crate::styles::Style;
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{error, info};

/// One immutable snapshot of every loaded resource.
#[derive(Debug, Default)]
pub struct ResourceSet {
    pub prompts: HashMap<String, Prompt>,
    pub gates: HashMap<String, Gate>,
    pub methodologies: HashMap<String, Methodology>,
    pub styles: HashMap<String, Style>,
}

impl ResourceSet {
    pub fn prompt(&self, id: &str) -> Option<&Prompt> {
        self.prompts.get(id)
    }

    pub fn gate(&self, id: &str) -> Option<&Gate> {
        self.gates.get(id)
    }

    pub fn methodology(&self, id: &str) -> Option<&Methodology> {
        self.methodologies.get(&Methodology::canonical_id(id))
    }

    pub fn style(&self, id: &str) -> Option<&Style> {
        self.styles.get(id)
    }
}

/// Outcome of one reload pass.
#[derive(Debug, Clone)]
pub struct ReloadSummary {
    pub generation: u64,
    pub prompts: usize,
    pub gates: usize,
    pub methodologies: usize,
    pub styles: usize,
    /// Per-resource failures; these ids kept their previous version
    pub errors: Vec<String>,
}

/// Registry over a base directory, reloadable without restart.
pub struct Registry {
    base_dir: PathBuf,
    current: ArcSwap<ResourceSet>,
    generation: AtomicU64,
}

impl Registry {
    /// Scan the base directory and build the initial set.
    pub fn load(base_dir: PathBuf) -> Result<(Self, ReloadSummary)> {
        let scan = loader::scan(&base_dir, None);
        let registry = Self {
            base_dir,
            current: ArcSwap::from_pointee(scan.set),
            generation: AtomicU64::new(1),
        };
        let summary = registry.summarize(scan.errors);
        for err in &summary.errors {
            error!("resource load failure: {}", err);
        }
        info!(
            prompts = summary.prompts,
            gates = summary.gates,
            methodologies = summary.methodologies,
            styles = summary.styles,
            "registry loaded"
        );
        Ok((registry, summary))
    }

    /// The current snapshot. Cheap; callers hold it for a whole request.
    pub fn snapshot(&self) -> Arc<ResourceSet> {
        self.current.load_full()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn base_dir(&self) -> &PathBuf {
        &self.base_dir
    }

    /// Rebuild from disk and swap atomically.
    ///
    /// A resource that fails to parse keeps its previous version; the
    /// failure is reported but never invalidates the rest of the set.
    pub fn reload(&self) -> ReloadSummary {
        let previous = self.snapshot();
        let scan = loader::scan(&self.base_dir, Some(previous.as_ref()));
        self.current.store(Arc::new(scan.set));
        self.generation.fetch_add(1, Ordering::AcqRel);
        let summary = self.summarize(scan.errors);
        for err in &summary.errors {
            error!("resource reload failure: {}", err);
        }
        info!(generation = summary.generation, "registry reloaded");
        summary
    }

    fn summarize(&self, errors: Vec<String>) -> ReloadSummary {
        let set = self.snapshot();
        ReloadSummary {
            generation: self.generation(),
            prompts: set.prompts.len(),
            gates: set.gates.len(),
            methodologies: set.methodologies.len(),
            styles: set.styles.len(),
            errors,
        }
    }
}
