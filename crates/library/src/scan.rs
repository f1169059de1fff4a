use std::collections::HashSet;
use std::path::Path;

use common::{path_to_string, Fingerprint, SongIdentity, Zone};
use metadata::{parse_abc_file, ParsedSong};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::classify::{classify, collect_abc_files, RootSet};
use crate::resolver::{decide, find_matches, DuplicateDecision, DuplicatePolicy};
use crate::{Catalog, LibraryError};

/// Record-level operations the scanner needs from the catalog.
pub trait CatalogStore {
    fn song_file_exists(&self, path: &str) -> Result<bool, LibraryError>;

    fn upsert_song_file(
        &self,
        path: &str,
        parsed: &ParsedSong,
        fingerprint: &Fingerprint,
        zone: Zone,
    ) -> Result<u64, LibraryError>;

    /// Returns `false` when `song_id` does not exist.
    fn link_song_file(
        &self,
        song_id: u64,
        path: &str,
        parsed: &ParsedSong,
        fingerprint: &Fingerprint,
        zone: Zone,
    ) -> Result<bool, LibraryError>;

    fn find_songs_by_identity(&self, identity: &SongIdentity) -> Result<Vec<u64>, LibraryError>;

    fn remove_song_files_not_in(&self, seen: &HashSet<String>) -> Result<usize, LibraryError>;

    fn remove_orphaned_songs(&self) -> Result<usize, LibraryError>;
}

impl CatalogStore for Catalog {
    fn song_file_exists(&self, path: &str) -> Result<bool, LibraryError> {
        Ok(self.song_file(path)?.is_some())
    }

    fn upsert_song_file(
        &self,
        path: &str,
        parsed: &ParsedSong,
        fingerprint: &Fingerprint,
        zone: Zone,
    ) -> Result<u64, LibraryError> {
        Catalog::upsert_song_file(self, path, parsed, fingerprint, zone)
    }

    fn link_song_file(
        &self,
        song_id: u64,
        path: &str,
        parsed: &ParsedSong,
        fingerprint: &Fingerprint,
        zone: Zone,
    ) -> Result<bool, LibraryError> {
        Catalog::link_song_file(self, song_id, path, parsed, fingerprint, zone)
    }

    fn find_songs_by_identity(&self, identity: &SongIdentity) -> Result<Vec<u64>, LibraryError> {
        Catalog::find_songs_by_identity(self, identity)
    }

    fn remove_song_files_not_in(&self, seen: &HashSet<String>) -> Result<usize, LibraryError> {
        Catalog::remove_song_files_not_in(self, seen)
    }

    fn remove_orphaned_songs(&self) -> Result<usize, LibraryError> {
        Catalog::remove_orphaned_songs(self)
    }
}

pub trait RootSource {
    fn enabled_roots(&self) -> Result<RootSet, LibraryError>;
}

impl RootSource for RootSet {
    fn enabled_roots(&self) -> Result<RootSet, LibraryError> {
        Ok(self.clone())
    }
}

/// What a scan does when no library root resolves.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EmptyRootsPolicy {
    /// Treat it as an empty library and remove every cataloged file.
    #[default]
    ClearCatalog,
    /// Skip the scan and leave the catalog as it is.
    KeepCatalog,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub found: usize,
    pub scanned: usize,
    pub errors: usize,
    pub ignored: usize,
    pub removed_files: usize,
    pub removed_songs: usize,
}

enum FileOutcome {
    Cataloged,
    Ignored,
}

pub struct Scanner<'a, S: CatalogStore + ?Sized> {
    store: &'a S,
    policy: Option<Box<dyn DuplicatePolicy + 'a>>,
    progress: Option<Box<dyn FnMut(usize, usize) + 'a>>,
    scan_export_roots: bool,
    empty_roots: EmptyRootsPolicy,
}

impl<'a, S: CatalogStore + ?Sized> Scanner<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self {
            store,
            policy: None,
            progress: None,
            scan_export_roots: false,
            empty_roots: EmptyRootsPolicy::default(),
        }
    }

    /// Consulted only for new primary files whose identity already exists.
    pub fn with_policy<P: DuplicatePolicy + 'a>(mut self, policy: P) -> Self {
        self.policy = Some(Box::new(policy));
        self
    }

    /// Called with (done, total) after every file.
    pub fn with_progress<F: FnMut(usize, usize) + 'a>(mut self, progress: F) -> Self {
        self.progress = Some(Box::new(progress));
        self
    }

    pub fn scan_export_roots(mut self, enabled: bool) -> Self {
        self.scan_export_roots = enabled;
        self
    }

    pub fn empty_roots(mut self, policy: EmptyRootsPolicy) -> Self {
        self.empty_roots = policy;
        self
    }

    pub fn run<R: RootSource + ?Sized>(&mut self, source: &R) -> Result<ScanReport, LibraryError> {
        let mut roots = source.enabled_roots()?;
        roots.library_roots.retain(|root| {
            let present = root.is_dir();
            if !present {
                warn!("Library root {:?} is not a directory; skipping it", root);
            }
            present
        });
        let mut report = ScanReport::default();
        let mut seen: HashSet<String> = HashSet::new();

        if roots.is_empty() {
            match self.empty_roots {
                EmptyRootsPolicy::KeepCatalog => {
                    warn!("No library roots resolved; leaving catalog untouched");
                    return Ok(report);
                }
                EmptyRootsPolicy::ClearCatalog => {
                    warn!("No library roots resolved; removing every cataloged file");
                }
            }
        } else {
            let mut walk_roots = roots.library_roots.clone();
            if self.scan_export_roots {
                walk_roots.extend(roots.export_roots.iter().cloned());
            }
            let files = collect_abc_files(&walk_roots, &roots.exclude_paths);
            let total = files.len();
            report.found = total;
            info!("Scanning {} files under {} roots", total, walk_roots.len());

            for (idx, path) in files.iter().enumerate() {
                let key = path_to_string(path);
                match self.scan_file(path, &key, &roots) {
                    Ok(FileOutcome::Cataloged) => report.scanned += 1,
                    Ok(FileOutcome::Ignored) => report.ignored += 1,
                    Err(err) => {
                        warn!("Skipping {}: {}", key, err);
                        report.errors += 1;
                    }
                }
                seen.insert(key);
                if let Some(progress) = self.progress.as_mut() {
                    progress(idx + 1, total);
                }
            }
        }

        report.removed_files = self.store.remove_song_files_not_in(&seen)?;
        report.removed_songs = self.store.remove_orphaned_songs()?;
        info!(
            "Scan complete: found={} scanned={} errors={} ignored={} removed_files={} removed_songs={}",
            report.found,
            report.scanned,
            report.errors,
            report.ignored,
            report.removed_files,
            report.removed_songs
        );
        Ok(report)
    }

    fn scan_file(
        &mut self,
        path: &Path,
        key: &str,
        roots: &RootSet,
    ) -> Result<FileOutcome, LibraryError> {
        let zone = classify(path, roots);
        let parsed = parse_abc_file(path)?;
        let fingerprint = Fingerprint::of(path);

        if self.store.song_file_exists(key)? {
            self.store.upsert_song_file(key, &parsed, &fingerprint, zone)?;
            return Ok(FileOutcome::Cataloged);
        }

        if zone == Zone::Primary {
            if let Some(policy) = self.policy.as_mut() {
                let candidates = find_matches(self.store, &parsed)?;
                if !candidates.is_empty() {
                    debug!("{} matches {} existing songs", key, candidates.len());
                    match decide(policy.as_mut(), key, &parsed, &candidates) {
                        DuplicateDecision::Link(song_id) => {
                            if self
                                .store
                                .link_song_file(song_id, key, &parsed, &fingerprint, zone)?
                            {
                                return Ok(FileOutcome::Cataloged);
                            }
                            warn!("Cannot link {} to missing song {}; ignoring", key, song_id);
                            return Ok(FileOutcome::Ignored);
                        }
                        DuplicateDecision::Ignore => return Ok(FileOutcome::Ignored),
                        DuplicateDecision::Separate => {}
                    }
                }
            }
        }

        self.store.upsert_song_file(key, &parsed, &fingerprint, zone)?;
        Ok(FileOutcome::Cataloged)
    }
}
