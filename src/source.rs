//! Source units and the injected boundary contracts
//!
//! The engine never touches the filesystem or the network itself: source
//! units arrive through a `SourceProvider` and model calls go out through a
//! `ModelInvoker`. Both are defined here and implemented by the caller.

use crate::config::ModelConfig;
use crate::error::InvokeError;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Supported programming languages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Language {
    Rust,
    JavaScript,
    TypeScript,
    Python,
    Go,
    Unknown,
}

impl Language {
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_lowercase().as_str() {
            "rs" => Language::Rust,
            "js" | "jsx" | "mjs" | "cjs" => Language::JavaScript,
            "ts" | "tsx" => Language::TypeScript,
            "py" | "pyi" => Language::Python,
            "go" => Language::Go,
            _ => Language::Unknown,
        }
    }

    pub fn from_path(path: &Path) -> Self {
        path.extension()
            .and_then(|e| e.to_str())
            .map(Self::from_extension)
            .unwrap_or(Language::Unknown)
    }
}

/// One file (or virtual unit) under review. Immutable once constructed.
#[derive(Debug, Clone)]
pub struct SourceUnit {
    pub path: PathBuf,
    pub language: Language,
    pub text: String,
}

impl SourceUnit {
    /// Build a unit, inferring the language from the path extension.
    pub fn new(path: impl Into<PathBuf>, text: impl Into<String>) -> Self {
        let path = path.into();
        let language = Language::from_path(&path);
        Self {
            path,
            language,
            text: text.into(),
        }
    }

    pub fn bytes(&self) -> usize {
        self.text.len()
    }

    pub fn line_count(&self) -> usize {
        self.text.lines().count()
    }
}

/// A set of source units with path lookup, the shape the engine works over.
#[derive(Debug, Clone, Default)]
pub struct SourceSet {
    units: Vec<SourceUnit>,
    by_path: HashMap<PathBuf, usize>,
}

impl SourceSet {
    pub fn new(units: Vec<SourceUnit>) -> Self {
        let by_path = units
            .iter()
            .enumerate()
            .map(|(i, u)| (u.path.clone(), i))
            .collect();
        Self { units, by_path }
    }

    pub fn units(&self) -> &[SourceUnit] {
        &self.units
    }

    pub fn get(&self, path: &Path) -> Option<&SourceUnit> {
        self.by_path.get(path).map(|&i| &self.units[i])
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.units.iter().map(|u| &u.path)
    }
}

/// Yields source units for a review target. Discovery and ignore-pattern
/// filtering live behind this trait, outside the engine.
pub trait SourceProvider {
    fn load(&self) -> anyhow::Result<Vec<SourceUnit>>;
}

/// The externally supplied model-call capability.
///
/// The engine treats the response as opaque text and the error as opaque
/// apart from its transient/permanent kind. Per-call retries belong to the
/// implementation behind this trait, not to the engine.
pub trait ModelInvoker: Send + Sync {
    fn invoke<'a>(
        &'a self,
        prompt: String,
        config: &'a ModelConfig,
    ) -> BoxFuture<'a, Result<String, InvokeError>>;
}
