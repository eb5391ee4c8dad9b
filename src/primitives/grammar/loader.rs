//! Grammar and theme source lookup with I/O abstraction.
//!
//! This module provides the `GrammarLoader` trait that maps an identifier to a
//! document location and reads it, and `LocalGrammarLoader` as the default
//! filesystem-based implementation.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

/// Kind of document being looked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BundleKind {
    Language,
    Theme,
}

impl BundleKind {
    /// File name suffix used for documents of this kind.
    pub fn extension(self) -> &'static str {
        match self {
            BundleKind::Language => "tmLanguage.json",
            BundleKind::Theme => "tmTheme.json",
        }
    }

    pub fn file_name(self, identifier: &str) -> String {
        format!("{}.{}", identifier, self.extension())
    }
}

/// Trait for locating and reading grammar and theme documents.
///
/// This abstraction allows:
/// - Testing with in-memory implementations
/// - Custom document sources (bundled, network, etc.)
pub trait GrammarLoader: Send + Sync {
    /// Location of the document for `identifier`, if one exists.
    fn locate(&self, identifier: &str, kind: BundleKind) -> Option<PathBuf>;

    /// Read file contents as string.
    fn read_file(&self, path: &Path) -> io::Result<String>;
}

/// Default implementation using the local filesystem.
///
/// Documents are looked up as `<identifier>.tmLanguage.json` and
/// `<identifier>.tmTheme.json`, first in the extra search roots and then in
/// `<config dir>/scoped-syntax/{grammars,themes}`.
pub struct LocalGrammarLoader {
    config_dir: Option<PathBuf>,
    search_dirs: Vec<PathBuf>,
}

impl LocalGrammarLoader {
    /// Create a new LocalGrammarLoader with default config directory.
    pub fn new() -> Self {
        Self {
            config_dir: dirs::config_dir(),
            search_dirs: Vec::new(),
        }
    }

    /// Create a LocalGrammarLoader with a custom config directory.
    pub fn with_config_dir(config_dir: Option<PathBuf>) -> Self {
        Self {
            config_dir,
            search_dirs: Vec::new(),
        }
    }

    /// Add search roots consulted before the config directory.
    pub fn with_search_dirs(mut self, dirs: impl IntoIterator<Item = PathBuf>) -> Self {
        self.search_dirs.extend(dirs);
        self
    }

    /// Config subdirectory holding documents of `kind`.
    pub fn bundle_dir(&self, kind: BundleKind) -> Option<PathBuf> {
        let sub = match kind {
            BundleKind::Language => "scoped-syntax/grammars",
            BundleKind::Theme => "scoped-syntax/themes",
        };
        self.config_dir.as_ref().map(|p| p.join(sub))
    }
}

impl Default for LocalGrammarLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl GrammarLoader for LocalGrammarLoader {
    fn locate(&self, identifier: &str, kind: BundleKind) -> Option<PathBuf> {
        let file_name = kind.file_name(identifier);
        let found = self
            .search_dirs
            .iter()
            .cloned()
            .chain(self.bundle_dir(kind))
            .map(|dir| dir.join(&file_name))
            .find(|path| path.is_file());
        if found.is_none() {
            tracing::debug!("No {:?} document named {:?}", kind, file_name);
        }
        found
    }

    fn read_file(&self, path: &Path) -> io::Result<String> {
        std::fs::read_to_string(path)
    }
}

/// Loader over documents held in memory, keyed by identifier.
///
/// Useful for embedding grammars in a binary and for tests.
#[derive(Debug, Default, Clone)]
pub struct EmbeddedGrammarLoader {
    files: HashMap<PathBuf, String>,
}

impl EmbeddedGrammarLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(
        mut self,
        identifier: &str,
        kind: BundleKind,
        contents: impl Into<String>,
    ) -> Self {
        self.insert(identifier, kind, contents);
        self
    }

    pub fn insert(&mut self, identifier: &str, kind: BundleKind, contents: impl Into<String>) {
        self.files
            .insert(PathBuf::from(kind.file_name(identifier)), contents.into());
    }
}

impl GrammarLoader for EmbeddedGrammarLoader {
    fn locate(&self, identifier: &str, kind: BundleKind) -> Option<PathBuf> {
        let path = PathBuf::from(kind.file_name(identifier));
        self.files.contains_key(&path).then_some(path)
    }

    fn read_file(&self, path: &Path) -> io::Result<String> {
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "File not found"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_loader_bundle_dir() {
        let loader = LocalGrammarLoader::new();
        // Might be None in some test environments
        if let Some(dir) = loader.bundle_dir(BundleKind::Language) {
            assert!(dir.to_string_lossy().contains("scoped-syntax"));
            assert!(dir.to_string_lossy().contains("grammars"));
        }
    }

    #[test]
    fn test_local_loader_search_dirs() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        std::fs::write(second.path().join("lua.tmLanguage.json"), "{}").unwrap();
        std::fs::write(first.path().join("dark.tmTheme.json"), "{}").unwrap();

        let loader = LocalGrammarLoader::with_config_dir(None)
            .with_search_dirs([first.path().to_path_buf(), second.path().to_path_buf()]);

        let lua = loader.locate("lua", BundleKind::Language).unwrap();
        assert_eq!(lua, second.path().join("lua.tmLanguage.json"));
        assert_eq!(loader.read_file(&lua).unwrap(), "{}");

        assert!(loader.locate("dark", BundleKind::Theme).is_some());
        assert!(loader.locate("dark", BundleKind::Language).is_none());
        assert!(loader.locate("missing", BundleKind::Language).is_none());
    }

    #[test]
    fn test_local_loader_config_dir() {
        let config = tempfile::tempdir().unwrap();
        let grammars = config.path().join("scoped-syntax/grammars");
        std::fs::create_dir_all(&grammars).unwrap();
        std::fs::write(grammars.join("json.tmLanguage.json"), "{}").unwrap();

        let loader = LocalGrammarLoader::with_config_dir(Some(config.path().to_path_buf()));
        assert_eq!(
            loader.locate("json", BundleKind::Language),
            Some(grammars.join("json.tmLanguage.json"))
        );
    }

    #[test]
    fn test_embedded_loader() {
        let loader = EmbeddedGrammarLoader::new().with_document("a", BundleKind::Language, "doc");
        let path = loader.locate("a", BundleKind::Language).unwrap();
        assert_eq!(loader.read_file(&path).unwrap(), "doc");
        assert!(loader.locate("a", BundleKind::Theme).is_none());
        assert!(loader.read_file(Path::new("nope")).is_err());
    }
}
