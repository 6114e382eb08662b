//! Pure path algebra over `/`-separated strings.
//!
//! These operate on build-manifest paths, which are plain byte strings with
//! forward slashes, independent of the platform path type. Inputs may be
//! absolute or relative and may contain `.` and `..` segments.

/// Normalize a path: collapse `.` and empty segments, resolve `..` against
/// preceding segments where possible. `..` at the root of an absolute path
/// refers to the root itself and is dropped. The normalized form of the
/// current directory is `.`, not the empty string.
pub fn normalize_path(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        if segment == ".." {
            match segments.last() {
                Some(&last) if last != ".." => {
                    segments.pop();
                }
                None if absolute => {
                    // dot-dot in the root directory refers to the root
                    // directory itself and can thus be dropped.
                }
                _ => segments.push(segment),
            }
        } else if !segment.is_empty() && segment != "." {
            segments.push(segment);
        }
    }
    if segments.is_empty() {
        return if absolute { "/".to_string() } else { ".".to_string() };
    }
    let joined = segments.join("/");
    if absolute {
        format!("/{}", joined)
    } else {
        joined
    }
}

/// The final segment of a path, or the empty string when there is none
/// (root, empty, or a bare name without a slash).
pub fn path_basename(path: &str) -> &str {
    if path.len() <= 1 {
        return "";
    }
    let trimmed = path.strip_suffix('/').unwrap_or(path);
    match trimmed.rfind('/') {
        Some(pos) => &trimmed[pos + 1..],
        None => "",
    }
}

/// How many levels above the current directory the path reaches, i.e. the
/// minimum number of leading `..` segments needed to anchor it. Paths that
/// never escape return 0.
pub fn parent_directory_level(path: &str) -> i32 {
    let mut current: i32 = 0;
    let mut lowest: i32 = 0;
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                current -= 1;
                lowest = lowest.min(current);
            }
            _ => current += 1,
        }
    }
    -lowest
}

/// The last `n` segments of `path`, or `None` if the path has fewer.
/// `n == 0` yields the empty string.
pub fn last_n_segments(path: &str, n: i32) -> Option<String> {
    if n == 0 {
        return Some(String::new());
    }
    let trimmed = path.strip_suffix('/').unwrap_or(path);
    let segments: Vec<&str> = trimmed.split('/').filter(|s| !s.is_empty()).collect();
    if segments.len() < n as usize {
        return None;
    }
    Some(segments[segments.len() - n as usize..].join("/"))
}

/// Whether `prefix` is a whole-segment prefix of `path`. The empty path is
/// never a prefix.
pub fn has_path_prefix(path: &str, prefix: &str) -> bool {
    if prefix.is_empty() {
        return false;
    }
    if path == prefix {
        return true;
    }
    let mut prefix = prefix.to_string();
    if !prefix.ends_with('/') {
        prefix.push('/');
    }
    let mut path = path.to_string();
    if !path.ends_with('/') {
        path.push('/');
    }
    path.starts_with(&prefix)
}

/// Rewrite an absolute `path` to be relative to the absolute directory
/// `base`, inserting `..` segments as needed. Relative paths and empty
/// inputs pass through unchanged.
pub fn make_path_relative(path: &str, base: &str) -> String {
    if base.is_empty() || path.is_empty() || !path.starts_with('/') {
        return path.to_string();
    }
    debug_assert!(base.starts_with('/'), "base must be an absolute path");

    let path_segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let base_segments: Vec<&str> = base.split('/').filter(|s| !s.is_empty()).collect();

    let common = path_segments
        .iter()
        .zip(base_segments.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let dotdots = base_segments.len() - common;
    if dotdots == 0 && common == path_segments.len() {
        // path and base are the same directory.
        return if path.ends_with('/') { "./".into() } else { ".".into() };
    }

    let mut out: Vec<&str> = Vec::with_capacity(dotdots + path_segments.len() - common);
    for _ in 0..dotdots {
        out.push("..");
    }
    out.extend(&path_segments[common..]);
    let mut result = out.join("/");
    if path.ends_with('/') {
        result.push('/');
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("a/b/../c", "a/c")]
    #[test_case("/a/./b//c", "/a/b/c")]
    #[test_case("/../a", "/a"; "dotdot at absolute root is dropped")]
    #[test_case("../a", "../a"; "dotdot at relative root is kept")]
    #[test_case("a/..", "."; "collapses to current dir")]
    #[test_case("/a/..", "/")]
    #[test_case(".", "."; "dot normalizes to dot")]
    #[test_case("", "."; "empty normalizes to dot")]
    #[test_case("a/b/c", "a/b/c"; "already normal")]
    fn normalize(input: &str, expected: &str) {
        assert_eq!(normalize_path(input), expected);
    }

    #[test]
    fn normalize_is_idempotent() {
        for p in ["a/b/../c", "/x/./y/..", "../..", "foo//bar/"] {
            let once = normalize_path(p);
            assert_eq!(normalize_path(&once), once);
        }
    }

    #[test_case("a/b/c", "c")]
    #[test_case("a/b/c/", "c"; "trailing slash still yields basename")]
    #[test_case("abc", ""; "bare name has no basename")]
    #[test_case("/", ""; "root has no basename")]
    #[test_case("", "")]
    fn basename(input: &str, expected: &str) {
        assert_eq!(path_basename(input), expected);
    }

    #[test_case("a/b.c", 0)]
    #[test_case("../a", 1)]
    #[test_case("../../a/b", 2)]
    #[test_case("a/../../b", 1; "escape after descent")]
    #[test_case("..", 1; "bare dotdot")]
    #[test_case("./a", 0)]
    fn parent_level(input: &str, expected: i32) {
        assert_eq!(parent_directory_level(input), expected);
    }

    #[test]
    fn last_segments() {
        assert_eq!(last_n_segments("/a/b/c", 1), Some("c".to_string()));
        assert_eq!(last_n_segments("/a/b/c", 2), Some("b/c".to_string()));
        assert_eq!(last_n_segments("/a/b/c", 3), Some("a/b/c".to_string()));
        assert_eq!(last_n_segments("/a/b/c", 4), None);
        assert_eq!(last_n_segments("only", 1), Some("only".to_string()));
        assert_eq!(last_n_segments("/a/b/", 1), Some("b".to_string()));
        assert_eq!(last_n_segments("whatever", 0), Some(String::new()));
    }

    #[test_case("/p/build/x.c", "/p", true)]
    #[test_case("/p", "/p", true; "equal paths")]
    #[test_case("/prefix-not/x", "/p", false; "segment boundary honored")]
    #[test_case("/p/x", "", false; "empty prefix never matches")]
    fn prefix(path: &str, prefix: &str, expected: bool) {
        assert_eq!(has_path_prefix(path, prefix), expected);
    }

    #[test_case("/p/build/a.c", "/p/build", "a.c")]
    #[test_case("/p/src/a.c", "/p/build", "../src/a.c")]
    #[test_case("/p/build", "/p/build", "."; "equal base and path yields dot")]
    #[test_case("/p/build/", "/p/build", "./")]
    #[test_case("/other/x", "/p/build", "../../other/x")]
    #[test_case("relative/path", "/p/build", "relative/path"; "relative passes through")]
    #[test_case("", "/p", ""; "empty path passes through")]
    fn relative(path: &str, base: &str, expected: &str) {
        assert_eq!(make_path_relative(path, base), expected);
    }

    #[test]
    fn relative_round_trip() {
        let base = "/p/build";
        for rel in ["a.c", "sub/dir/x.o", "deep/er/most.h"] {
            let abs = format!("{}/{}", base, rel);
            assert_eq!(make_path_relative(&abs, base), rel);
        }
    }
}
