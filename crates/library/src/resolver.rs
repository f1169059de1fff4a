use common::SongIdentity;
use metadata::ParsedSong;

use crate::scan::CatalogStore;
use crate::LibraryError;

/// What to do with a newly discovered primary file whose identity matches
/// existing songs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DuplicateDecision {
    /// Attach the file to this existing song.
    Link(u64),
    /// Create a new song anyway.
    Separate,
    /// Leave the file out of the catalog.
    Ignore,
}

/// Caller-supplied choice for identity collisions. Returning `None` (for
/// example a cancelled prompt) is treated as [`DuplicateDecision::Ignore`].
pub trait DuplicatePolicy {
    fn resolve(
        &mut self,
        path: &str,
        parsed: &ParsedSong,
        candidates: &[u64],
    ) -> Option<DuplicateDecision>;
}

impl<F> DuplicatePolicy for F
where
    F: FnMut(&str, &ParsedSong, &[u64]) -> Option<DuplicateDecision>,
{
    fn resolve(
        &mut self,
        path: &str,
        parsed: &ParsedSong,
        candidates: &[u64],
    ) -> Option<DuplicateDecision> {
        self(path, parsed, candidates)
    }
}

pub fn identity(parsed: &ParsedSong) -> SongIdentity {
    SongIdentity::new(&parsed.title, &parsed.composers, parsed.parts.len())
}

pub fn find_matches<S: CatalogStore + ?Sized>(
    store: &S,
    parsed: &ParsedSong,
) -> Result<Vec<u64>, LibraryError> {
    store.find_songs_by_identity(&identity(parsed))
}

pub(crate) fn decide(
    policy: &mut dyn DuplicatePolicy,
    path: &str,
    parsed: &ParsedSong,
    candidates: &[u64],
) -> DuplicateDecision {
    policy
        .resolve(path, parsed, candidates)
        .unwrap_or(DuplicateDecision::Ignore)
}

#[cfg(test)]
mod tests {
    use super::*;
    use metadata::PartInfo;

    fn parsed(title: &str, composers: &str, parts: usize) -> ParsedSong {
        ParsedSong {
            title: title.to_string(),
            composers: composers.to_string(),
            parts: (1..=parts as u32)
                .map(|n| PartInfo {
                    part_number: n,
                    ..PartInfo::default()
                })
                .collect(),
            ..ParsedSong::default()
        }
    }

    #[test]
    fn identity_normalises_title_and_composers() {
        let id = identity(&parsed("  My Title  ", " Composer A ", 2));
        assert_eq!(id.title, "my title");
        assert_eq!(id.composers, "Composer A");
        assert_eq!(id.part_count, 2);
    }

    #[test]
    fn identity_ignores_surrounding_whitespace_and_case() {
        for title in ["Reel", "Morning Star", "tune"] {
            let padded = identity(&parsed(&format!(" {} ", title), "Trad.", 1));
            let lowered = identity(&parsed(&title.to_lowercase(), "Trad.", 1));
            assert_eq!(padded.title, lowered.title);
        }
    }

    #[test]
    fn declined_choice_maps_to_ignore() {
        let mut policy = |_: &str, _: &ParsedSong, _: &[u64]| -> Option<DuplicateDecision> { None };
        let decision = decide(&mut policy, "/a.abc", &parsed("x", "y", 1), &[1]);
        assert_eq!(decision, DuplicateDecision::Ignore);
    }

    #[test]
    fn closure_policy_sees_candidates() {
        let mut policy = |_: &str, _: &ParsedSong, candidates: &[u64]| -> Option<DuplicateDecision> {
            candidates.first().copied().map(DuplicateDecision::Link)
        };
        let decision = decide(&mut policy, "/a.abc", &parsed("x", "y", 1), &[7, 9]);
        assert_eq!(decision, DuplicateDecision::Link(7));
    }
}
