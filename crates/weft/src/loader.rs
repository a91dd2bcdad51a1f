/*
 * loader.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! Resource loading for template sources, imports, and escaper tables.
//!
//! This module provides traits and implementations for fetching template
//! text from various sources (filesystem, memory). Locations are plain
//! strings; a registered [`SchemeResolver`] is consulted first for
//! `scheme:rest` locations, otherwise the location is used directly.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use thiserror::Error;

/// Failure to fetch a resource.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct LoadError {
    pub message: String,
}

impl LoadError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Fetches text and modification stamps for resolved locations.
///
/// Fetching is synchronous and blocking; callers needing bounded latency
/// wrap the loader themselves.
pub trait ResourceLoader: Send + Sync {
    /// Load the full text at `location`.
    fn fetch(&self, location: &str) -> Result<String, LoadError>;

    /// Modification stamp used for dirty-checking, if the backing
    /// resource has one.
    fn modified(&self, location: &str) -> Option<SystemTime>;
}

/// Maps a location under a registered scheme to a fetchable location.
pub trait SchemeResolver: Send + Sync {
    /// Resolve the part after `scheme:`, or `None` if unknown.
    fn resolve(&self, rest: &str) -> Option<String>;
}

/// Split `scheme:rest` if the location carries a scheme. Single-letter
/// prefixes are left alone so Windows drive paths stay intact.
pub fn split_scheme(location: &str) -> Option<(&str, &str)> {
    let colon = location.find(':')?;
    if colon < 2 {
        return None;
    }
    let scheme = &location[..colon];
    if scheme.chars().all(|c| c.is_ascii_alphanumeric()) {
        Some((scheme, &location[colon + 1..]))
    } else {
        None
    }
}

/// Join a relative location onto a base. Absolute locations and
/// scheme-qualified ones pass through untouched.
pub fn join_location(base: Option<&str>, location: &str) -> String {
    if Path::new(location).is_absolute() || split_scheme(location).is_some() {
        return location.to_string();
    }
    match base {
        Some(base) if !base.is_empty() => {
            let mut path = PathBuf::from(base);
            path.push(location);
            path.to_string_lossy().into_owned()
        }
        _ => location.to_string(),
    }
}

/// Directory of a page location, used to resolve relative imports.
pub fn parent_of(location: &str) -> Option<String> {
    Path::new(location)
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(|p| p.to_string_lossy().into_owned())
}

/// Loader that reads templates from the filesystem.
#[derive(Debug, Clone, Default)]
pub struct FileLoader;

impl ResourceLoader for FileLoader {
    fn fetch(&self, location: &str) -> Result<String, LoadError> {
        std::fs::read_to_string(location).map_err(|e| LoadError::new(e.to_string()))
    }

    fn modified(&self, location: &str) -> Option<SystemTime> {
        std::fs::metadata(location).ok()?.modified().ok()
    }
}

/// Loader backed by an in-memory map. Useful for bundled templates and
/// tests; re-adding a location bumps its modification stamp.
#[derive(Debug, Clone, Default)]
pub struct MemoryLoader {
    entries: HashMap<String, (String, SystemTime)>,
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a template source under a location.
    pub fn add(&mut self, location: impl Into<String>, source: impl Into<String>) -> &mut Self {
        self.entries
            .insert(location.into(), (source.into(), SystemTime::now()));
        self
    }

    /// Create a loader with the given sources.
    pub fn with_sources(
        sources: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> Self {
        let mut loader = Self::new();
        for (location, source) in sources {
            loader.add(location, source);
        }
        loader
    }
}

impl ResourceLoader for MemoryLoader {
    fn fetch(&self, location: &str) -> Result<String, LoadError> {
        self.entries
            .get(location)
            .map(|(source, _)| source.clone())
            .ok_or_else(|| LoadError::new(format!("no such resource: {location}")))
    }

    fn modified(&self, location: &str) -> Option<SystemTime> {
        self.entries.get(location).map(|(_, stamp)| *stamp)
    }
}
