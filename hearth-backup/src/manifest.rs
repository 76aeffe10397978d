//! Reading the `save query` answer out of the console log.
//!
//! The server prints the files to copy as one line:
//!
//! ```text
//! MyWorld/db/000001.ldb:100, MyWorld/db/MANIFEST-000002:50, MyWorld/level.dat:2048
//! ```
//!
//! Each entry is `<level>/<relative path>:<length>`. The log is cumulative, so
//! the scan runs from the newest line backward and the first qualifying line
//! wins.

const READY_MARKERS: [&str; 2] = ["files are now ready to be copied", "data saved"];

/// `true` if `text` contains either save-ready marker, ignoring case.
pub fn contains_ready_marker(text: &str) -> bool {
    let lower = text.to_lowercase();
    READY_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Paths relative to the world directory from the most recent manifest line.
pub fn parse_manifest(log: &str, level_name: &str) -> Vec<String> {
    let prefix = format!("{level_name}/");

    for line in log.lines().rev() {
        if !line.contains(':') {
            continue;
        }
        if starts_with_ignore_ascii_case(line, level_name) {
            return parse_entries(line, &prefix);
        }
        if let Some(start) = find_ignore_ascii_case(line, &prefix) {
            let files = parse_entries(&line[start..], &prefix);
            if !files.is_empty() {
                return files;
            }
        }
    }
    Vec::new()
}

fn parse_entries(line: &str, prefix: &str) -> Vec<String> {
    line.split(',')
        .filter_map(|entry| {
            let path = entry.trim().split(':').next()?.trim();
            if !starts_with_ignore_ascii_case(path, prefix) {
                return None;
            }
            let relative = path[prefix.len()..].trim();
            (!relative.is_empty()).then(|| relative.to_string())
        })
        .collect()
}

fn starts_with_ignore_ascii_case(haystack: &str, needle: &str) -> bool {
    haystack
        .as_bytes()
        .get(..needle.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(needle.as_bytes()))
}

fn find_ignore_ascii_case(haystack: &str, needle: &str) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack
        .as_bytes()
        .windows(needle.len())
        .position(|window| window.eq_ignore_ascii_case(needle.as_bytes()))
}
