use std::collections::HashMap;
use std::fs;
use std::path::Path;

const TAG_MARKER: &str = "%%";
const TITLE_TAG: &str = "song-title";
const COMPOSER_TAG: &str = "song-composer";
const TRANSCRIBER_TAG: &str = "song-transcriber";
const DURATION_TAG: &str = "song-duration";
const EXPORT_TIMESTAMP_TAG: &str = "export-timestamp";
const PART_NAME_TAG: &str = "part-name";
const MADE_FOR_TAG: &str = "made-for";
const UNKNOWN: &str = "Unknown";

/// One `X:` block. `made_for` is the raw instrument hint; the catalog resolves it.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PartInfo {
    pub part_number: u32,
    pub part_name: Option<String>,
    pub made_for: Option<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ParsedSong {
    pub title: String,
    pub composers: String,
    pub duration_seconds: Option<u32>,
    pub transcriber: Option<String>,
    pub export_timestamp: Option<String>,
    pub parts: Vec<PartInfo>,
}

#[derive(Debug)]
pub enum MetadataError {
    Io(std::io::Error),
}

impl std::fmt::Display for MetadataError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetadataError::Io(err) => write!(f, "io error: {}", err),
        }
    }
}

impl std::error::Error for MetadataError {}

impl From<std::io::Error> for MetadataError {
    fn from(err: std::io::Error) -> Self {
        MetadataError::Io(err)
    }
}

/// Reads the file (invalid UTF-8 is replaced) and parses it, using the file
/// name as the last title fallback.
pub fn parse_abc_file(path: &Path) -> Result<ParsedSong, MetadataError> {
    let bytes = fs::read(path)?;
    let content = String::from_utf8_lossy(&bytes);
    let filename = path.file_name().map(|name| name.to_string_lossy().to_string());
    Ok(parse_abc_content(&content, filename.as_deref()))
}

/// Best-effort metadata extraction. Never fails; missing fields fall back
/// along a fixed precedence chain.
pub fn parse_abc_content(content: &str, filename: Option<&str>) -> ParsedSong {
    let headers = parse_headers(content);
    let parts = parse_parts(content);

    let title = headers
        .tag(TITLE_TAG)
        .or(non_empty(&headers.first_t))
        .or(filename.map(str::trim).filter(|name| !name.is_empty()))
        .unwrap_or(UNKNOWN)
        .to_string();

    let composers = headers
        .tag(COMPOSER_TAG)
        .or(non_empty(&headers.first_c))
        .unwrap_or(UNKNOWN)
        .to_string();

    let transcriber = headers
        .tag(TRANSCRIBER_TAG)
        .or(non_empty(&headers.first_z))
        .map(str::to_string);

    let duration_seconds = headers.tag(DURATION_TAG).and_then(parse_mm_ss);
    let export_timestamp = headers.tag(EXPORT_TIMESTAMP_TAG).map(str::to_string);

    ParsedSong {
        title,
        composers,
        duration_seconds,
        transcriber,
        export_timestamp,
        parts,
    }
}

/// `mm:ss` to seconds; both fields non-negative integers and seconds below 60.
pub fn parse_mm_ss(value: &str) -> Option<u32> {
    let value = value.trim();
    let (minutes, seconds) = value.split_once(':')?;
    if seconds.contains(':') {
        return None;
    }
    let minutes: u32 = minutes.trim().parse().ok()?;
    let seconds: u32 = seconds.trim().parse().ok()?;
    if seconds >= 60 {
        return None;
    }
    minutes.checked_mul(60)?.checked_add(seconds)
}

#[derive(Debug, Default)]
struct Headers {
    tags: HashMap<String, String>,
    first_t: Option<String>,
    first_c: Option<String>,
    first_z: Option<String>,
}

impl Headers {
    fn tag(&self, name: &str) -> Option<&str> {
        self.tags
            .get(name)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }
}

fn parse_headers(content: &str) -> Headers {
    let mut headers = Headers::default();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some((name, value)) = split_tag(line) {
            headers.tags.insert(name.to_string(), value.to_string());
            continue;
        }
        if let Some(value) = line.strip_prefix("T:") {
            set_first(&mut headers.first_t, value);
        } else if let Some(value) = line.strip_prefix("C:") {
            set_first(&mut headers.first_c, value);
        } else if let Some(value) = line.strip_prefix("Z:") {
            set_first(&mut headers.first_z, value);
        }
    }
    headers
}

// An empty first occurrence still claims the slot.
fn set_first(slot: &mut Option<String>, value: &str) {
    if slot.is_none() {
        *slot = Some(value.trim().to_string());
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

fn parse_parts(content: &str) -> Vec<PartInfo> {
    let mut parts: Vec<PartInfo> = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if let Some(number) = part_marker(line) {
            parts.push(PartInfo {
                part_number: number,
                part_name: None,
                made_for: None,
            });
            continue;
        }
        let current = match parts.last_mut() {
            Some(part) => part,
            None => continue,
        };
        if let Some((name, value)) = split_tag(line) {
            let value = Some(value.to_string()).filter(|v| !v.is_empty());
            match name {
                PART_NAME_TAG => current.part_name = value,
                MADE_FOR_TAG => current.made_for = value,
                _ => {}
            }
        }
    }
    parts
}

/// `X:` (either case) followed by optional whitespace and an integer.
/// Numbers past `u32::MAX` saturate so the block still starts a new part.
fn part_marker(line: &str) -> Option<u32> {
    let rest = line
        .strip_prefix("X:")
        .or_else(|| line.strip_prefix("x:"))?
        .trim_start();
    let digits: &str = {
        let end = rest
            .char_indices()
            .find(|(_, ch)| !ch.is_ascii_digit())
            .map(|(idx, _)| idx)
            .unwrap_or(rest.len());
        &rest[..end]
    };
    if digits.is_empty() {
        return None;
    }
    Some(digits.parse().unwrap_or(u32::MAX))
}

/// Splits `%%tag-name value`. Tag names are lowercase words joined by single
/// hyphens; matching is case-sensitive.
fn split_tag(line: &str) -> Option<(&str, &str)> {
    let rest = line.strip_prefix(TAG_MARKER)?;
    let bytes = rest.as_bytes();
    let mut end = 0usize;
    let mut idx = 0usize;
    while idx < bytes.len() {
        if bytes[idx].is_ascii_lowercase() {
            idx += 1;
            end = idx;
        } else if bytes[idx] == b'-'
            && end == idx
            && end > 0
            && bytes.get(idx + 1).map(u8::is_ascii_lowercase).unwrap_or(false)
        {
            idx += 1;
        } else {
            break;
        }
    }
    if end == 0 {
        return None;
    }
    Some((&rest[..end], rest[end..].trim()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_win_over_header_lines() {
        let content = "\
%%song-title       My Song
%%song-composer    The Composer
%%song-duration    3:45
%%song-transcriber Someone
X: 1
T: Other Title
";
        let parsed = parse_abc_content(content, Some("file.abc"));
        assert_eq!(parsed.title, "My Song");
        assert_eq!(parsed.composers, "The Composer");
        assert_eq!(parsed.duration_seconds, Some(225));
        assert_eq!(parsed.transcriber.as_deref(), Some("Someone"));
    }

    #[test]
    fn header_lines_fill_in_missing_tags() {
        let content = "T: Header Title\nC: Fallback Composer\nZ: Scribe\nX: 1\n";
        let parsed = parse_abc_content(content, Some("file.abc"));
        assert_eq!(parsed.title, "Header Title");
        assert_eq!(parsed.composers, "Fallback Composer");
        assert_eq!(parsed.transcriber.as_deref(), Some("Scribe"));
    }

    #[test]
    fn only_first_header_line_counts() {
        let content = "X: 1\nT: First\nX: 2\nT: Second\nC: One\nC: Two\n";
        let parsed = parse_abc_content(content, None);
        assert_eq!(parsed.title, "First");
        assert_eq!(parsed.composers, "One");
    }

    #[test]
    fn filename_then_unknown() {
        let parsed = parse_abc_content("X: 1\n", Some("file.abc"));
        assert_eq!(parsed.title, "file.abc");
        assert_eq!(parsed.composers, "Unknown");
        assert_eq!(parsed.transcriber, None);

        let parsed = parse_abc_content("", None);
        assert_eq!(parsed.title, "Unknown");
        assert!(parsed.parts.is_empty());
    }

    #[test]
    fn empty_first_header_line_is_not_replaced_by_later_one() {
        let content = "T:\nT: Later\n";
        let parsed = parse_abc_content(content, Some("file.abc"));
        assert_eq!(parsed.title, "file.abc");
    }

    #[test]
    fn empty_tag_falls_through() {
        let content = "%%song-title   \nT: From Header\n";
        let parsed = parse_abc_content(content, Some("x.abc"));
        assert_eq!(parsed.title, "From Header");
    }

    #[test]
    fn tag_names_are_case_sensitive() {
        let content = "%%Song-Title Shouting\nT: Quiet\n";
        let parsed = parse_abc_content(content, None);
        assert_eq!(parsed.title, "Quiet");
    }

    #[test]
    fn unknown_tags_are_ignored() {
        let content = "%%abc-version 2.1\n%%song-title Real\n";
        let parsed = parse_abc_content(content, None);
        assert_eq!(parsed.title, "Real");
        assert_eq!(parsed.export_timestamp, None);
    }

    #[test]
    fn duration_parsing() {
        assert_eq!(parse_mm_ss("3:45"), Some(225));
        assert_eq!(parse_mm_ss(" 1:30 "), Some(90));
        assert_eq!(parse_mm_ss("0:00"), Some(0));
        assert_eq!(parse_mm_ss("3:75"), None);
        assert_eq!(parse_mm_ss("not-a-time"), None);
        assert_eq!(parse_mm_ss("-1:30"), None);
        assert_eq!(parse_mm_ss("1:2:3"), None);
        assert_eq!(parse_mm_ss(""), None);
    }

    #[test]
    fn invalid_duration_tag_leaves_duration_absent() {
        let parsed = parse_abc_content("%%song-duration 3:75\n", None);
        assert_eq!(parsed.duration_seconds, None);
    }

    #[test]
    fn export_timestamp_comes_from_tag_only() {
        let content = "%%export-timestamp 2024-03-01 12:00:00\nX: 1\n";
        let parsed = parse_abc_content(content, None);
        assert_eq!(parsed.export_timestamp.as_deref(), Some("2024-03-01 12:00:00"));
    }

    #[test]
    fn parts_in_file_order() {
        let content = "\
%%song-title Test
%%song-composer A
X: 1
%%part-name Part One
%%made-for Flute
X: 2
%%part-name Part Two
%%made-for Lute
";
        let parsed = parse_abc_content(content, None);
        assert_eq!(
            parsed.parts,
            vec![
                PartInfo {
                    part_number: 1,
                    part_name: Some("Part One".to_string()),
                    made_for: Some("Flute".to_string()),
                },
                PartInfo {
                    part_number: 2,
                    part_name: Some("Part Two".to_string()),
                    made_for: Some("Lute".to_string()),
                },
            ]
        );
    }

    #[test]
    fn part_numbers_are_kept_as_written() {
        let content = "x:7\nX: 3\n%%made-for Horn\nX:3\nX: nope\n";
        let parsed = parse_abc_content(content, None);
        let numbers: Vec<u32> = parsed.parts.iter().map(|p| p.part_number).collect();
        assert_eq!(numbers, vec![7, 3, 3]);
        assert_eq!(parsed.parts[0].made_for, None);
        assert_eq!(parsed.parts[1].made_for.as_deref(), Some("Horn"));
        assert_eq!(parsed.parts[1].part_name, None);
    }

    #[test]
    fn oversized_part_numbers_still_open_a_part() {
        let content = "X: 1\n%%part-name Small\nX: 99999999999\n%%part-name Big\n%%made-for Tuba\n";
        let parsed = parse_abc_content(content, None);
        assert_eq!(parsed.parts.len(), 2);
        assert_eq!(parsed.parts[0].part_name.as_deref(), Some("Small"));
        assert_eq!(parsed.parts[0].made_for, None);
        assert_eq!(parsed.parts[1].part_number, u32::MAX);
        assert_eq!(parsed.parts[1].part_name.as_deref(), Some("Big"));
        assert_eq!(parsed.parts[1].made_for.as_deref(), Some("Tuba"));
    }

    #[test]
    fn split_tag_shapes() {
        assert_eq!(split_tag("%%song-title  A B "), Some(("song-title", "A B")));
        assert_eq!(split_tag("%%made-for"), Some(("made-for", "")));
        assert_eq!(split_tag("%%a--b x"), Some(("a", "--b x")));
        assert_eq!(split_tag("%%Title x"), None);
        assert_eq!(split_tag("T: x"), None);
    }

    #[test]
    fn parse_file_uses_file_name_and_tolerates_bad_utf8() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tune.abc");
        fs::write(&path, b"X: 1\n%%part-name \xff\xfe\n").unwrap();
        let parsed = parse_abc_file(&path).unwrap();
        assert_eq!(parsed.title, "tune.abc");
        assert_eq!(parsed.parts.len(), 1);
        assert!(parse_abc_file(&dir.path().join("missing.abc")).is_err());
    }
}
