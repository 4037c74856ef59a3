//! Handler Resolver
//!
//! Maps an event namespace (the part before the first `.`) to a registered
//! controller. Kebab-case prefixes resolve to Pascal-case controller names,
//! first flat (`chat-message` -> `ChatMessageController`), then with folder
//! segmentation (`Chat/MessageController`). Lookups are cached per prefix,
//! including negative results; the cache can be disabled for setups that
//! swap controllers at runtime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::dispatch::Controller;

/// Resolver cache and lookup counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverStats {
    pub hits: u64,
    pub misses: u64,
    pub cached_entries: usize,
}

/// Registry of controllers keyed by their Pascal-case name, optionally with
/// folder segments (`Billing/InvoiceController`).
pub struct ControllerRegistry {
    user: RwLock<HashMap<String, Arc<dyn Controller>>>,
    builtin: RwLock<HashMap<String, Arc<dyn Controller>>>,
    cache: RwLock<HashMap<String, Option<Arc<dyn Controller>>>>,
    cache_enabled: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ControllerRegistry {
    pub fn new() -> Self {
        ControllerRegistry {
            user: RwLock::new(HashMap::new()),
            builtin: RwLock::new(HashMap::new()),
            cache: RwLock::new(HashMap::new()),
            cache_enabled: AtomicBool::new(true),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Registers a controller under a name like `ChatMessageController` or
    /// `Chat/MessageController`. Later registrations replace earlier ones.
    pub fn register(&self, name: &str, controller: Arc<dyn Controller>) {
        self.user
            .write()
            .unwrap()
            .insert(name.to_string(), controller);
        self.clear_cache();
    }

    /// Registers a fallback controller consulted only when no user-supplied
    /// controller matches.
    pub fn register_builtin(&self, name: &str, controller: Arc<dyn Controller>) {
        self.builtin
            .write()
            .unwrap()
            .insert(name.to_string(), controller);
        self.clear_cache();
    }

    /// Disables or re-enables result caching. With caching off, every
    /// resolve walks the candidate list again, so controller swaps take
    /// effect immediately.
    pub fn set_cache_enabled(&self, enabled: bool) {
        self.cache_enabled.store(enabled, Ordering::SeqCst);
        if !enabled {
            self.clear_cache();
        }
    }

    pub fn clear_cache(&self) {
        self.cache.write().unwrap().clear();
    }

    /// Warms the cache with an entry for every registered controller.
    pub fn preload(&self) {
        if !self.cache_enabled.load(Ordering::SeqCst) {
            return;
        }
        let names: Vec<String> = {
            let user = self.user.read().unwrap();
            let builtin = self.builtin.read().unwrap();
            user.keys().chain(builtin.keys()).cloned().collect()
        };
        for name in names {
            let prefix = name_to_prefix(&name);
            let resolved = self.resolve_uncached(&prefix);
            self.cache.write().unwrap().insert(prefix, resolved);
        }
    }

    pub fn stats(&self) -> ResolverStats {
        ResolverStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            cached_entries: self.cache.read().unwrap().len(),
        }
    }

    /// Resolves an event prefix to a controller.
    pub fn resolve(&self, prefix: &str) -> Option<Arc<dyn Controller>> {
        if self.cache_enabled.load(Ordering::SeqCst) {
            if let Some(cached) = self.cache.read().unwrap().get(prefix) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return cached.clone();
            }
            self.misses.fetch_add(1, Ordering::Relaxed);
            let resolved = self.resolve_uncached(prefix);
            self.cache
                .write()
                .unwrap()
                .insert(prefix.to_string(), resolved.clone());
            resolved
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            self.resolve_uncached(prefix)
        }
    }

    fn resolve_uncached(&self, prefix: &str) -> Option<Arc<dyn Controller>> {
        for candidate in candidates(prefix) {
            if let Some(controller) = self.user.read().unwrap().get(&candidate) {
                return Some(controller.clone());
            }
            if let Some(controller) = self.builtin.read().unwrap().get(&candidate) {
                return Some(controller.clone());
            }
        }
        None
    }
}

impl Default for ControllerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn pascal_word(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Candidate controller names for an event prefix, most specific first:
/// the flat name, then folder segmentations in registration-friendly order
/// (`a-b-c` -> `ABCController`, `A/BCController`, `A/B/CController`,
/// `AB/CController`).
fn candidates(prefix: &str) -> Vec<String> {
    let segments: Vec<String> = prefix
        .split('-')
        .filter(|s| !s.is_empty())
        .map(pascal_word)
        .collect();
    if segments.is_empty() {
        return Vec::new();
    }

    let mut names = vec![format!("{}Controller", segments.concat())];
    let mut paths = Vec::new();
    folder_splits(&segments, String::new(), &mut paths);
    names.extend(paths.into_iter().map(|p| format!("{}Controller", p)));
    names
}

/// All ways of splitting segments into folders, recursing on the tail so a
/// shallower head split is tried before a deeper one.
fn folder_splits(segments: &[String], path: String, out: &mut Vec<String>) {
    for split in 1..segments.len() {
        let head = segments[..split].concat();
        let rest = &segments[split..];
        let base = if path.is_empty() {
            head
        } else {
            format!("{}/{}", path, head)
        };
        out.push(format!("{}/{}", base, rest.concat()));
        folder_splits(rest, base, out);
    }
}

/// Inverse of the candidate mapping, used to warm the cache: controller
/// name (with optional folders) back to the kebab-case event prefix.
fn name_to_prefix(name: &str) -> String {
    let flat: String = name
        .trim_end_matches("Controller")
        .chars()
        .filter(|c| *c != '/')
        .collect();
    let mut prefix = String::new();
    for (i, c) in flat.chars().enumerate() {
        if c.is_uppercase() {
            if i > 0 {
                prefix.push('-');
            }
            prefix.extend(c.to_lowercase());
        } else {
            prefix.push(c);
        }
    }
    prefix
}
