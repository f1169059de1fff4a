use std::collections::HashSet;
use std::path::{Path, PathBuf};

use common::{normalize_path, Zone};
use tracing::debug;
use walkdir::WalkDir;

pub const ABC_EXTENSION: &str = "abc";

/// Effective roots for one scan, each normalised to an absolute,
/// symlink-resolved form where possible.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RootSet {
    pub library_roots: Vec<PathBuf>,
    pub export_roots: Vec<PathBuf>,
    pub exclude_paths: Vec<PathBuf>,
}

impl RootSet {
    pub fn new<L, E, X>(library_roots: L, export_roots: E, exclude_paths: X) -> Self
    where
        L: IntoIterator,
        L::Item: AsRef<Path>,
        E: IntoIterator,
        E::Item: AsRef<Path>,
        X: IntoIterator,
        X::Item: AsRef<Path>,
    {
        Self {
            library_roots: normalize_all(library_roots),
            export_roots: normalize_all(export_roots),
            exclude_paths: normalize_all(exclude_paths),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.library_roots.is_empty()
    }

    pub fn is_excluded(&self, path: &Path) -> bool {
        let path = normalize_path(path);
        under_any(&path, &self.exclude_paths)
    }
}

/// Exclude wins first; export-only paths are set copies; everything else,
/// including paths under both a library and an export root, is primary.
pub fn classify(path: &Path, roots: &RootSet) -> Zone {
    let path = normalize_path(path);
    if under_any(&path, &roots.exclude_paths) {
        return Zone::Excluded;
    }
    let under_export = under_any(&path, &roots.export_roots);
    let under_library = under_any(&path, &roots.library_roots);
    if under_export && !under_library {
        Zone::SetCopy
    } else {
        Zone::Primary
    }
}

/// Recursively collects `.abc` files under `roots`, resolved and
/// de-duplicated, skipping anything under an exclude path. Files that vanish
/// or cannot be resolved are skipped.
pub fn collect_abc_files(roots: &[PathBuf], exclude_paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    let mut files = Vec::new();
    for root in roots {
        let root = normalize_path(root);
        if !root.is_dir() {
            debug!("Skipping missing root {:?}", root);
            continue;
        }
        for entry in WalkDir::new(&root)
            .follow_links(false)
            .into_iter()
            .filter_map(Result::ok)
        {
            if entry.file_type().is_dir() || !is_abc_file(entry.path()) {
                continue;
            }
            let resolved = match entry.path().canonicalize() {
                Ok(path) => path,
                Err(_) => continue,
            };
            if under_any(&resolved, exclude_paths) {
                continue;
            }
            if !resolved.is_file() {
                continue;
            }
            if seen.insert(resolved.clone()) {
                files.push(resolved);
            }
        }
    }
    files.sort();
    files
}

pub fn is_abc_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case(ABC_EXTENSION))
        .unwrap_or(false)
}

fn under_any(path: &Path, prefixes: &[PathBuf]) -> bool {
    prefixes.iter().any(|prefix| path.starts_with(prefix))
}

fn normalize_all<I>(paths: I) -> Vec<PathBuf>
where
    I: IntoIterator,
    I::Item: AsRef<Path>,
{
    let mut out: Vec<PathBuf> = Vec::new();
    for path in paths {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            continue;
        }
        let normalized = normalize_path(path);
        if !out.contains(&normalized) {
            out.push(normalized);
        }
    }
    out
}
