//! Ordered prefix rewrites for bundle path placement.

/// Ordered list of `(prefix, replacement)` rules. Given a relative source
/// path, the first prefix matching on whole path segments wins; unmatched
/// paths keep their relative form. An empty prefix matches everything and
/// prepends its replacement.
#[derive(Debug, Clone, Default)]
pub struct MapFile {
    rules: Vec<(String, String)>,
}

impl MapFile {
    pub fn new(rules: Vec<(String, String)>) -> Self {
        Self { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Apply the first matching rule to a forward-slash relative path.
    pub fn apply(&self, relative: &str) -> String {
        for (prefix, replacement) in &self.rules {
            if prefix.is_empty() {
                return join(replacement, relative);
            }
            let prefix = prefix.trim_end_matches('/');
            if relative == prefix {
                return replacement.trim_end_matches('/').to_string();
            }
            if let Some(rest) = relative.strip_prefix(prefix) {
                // Segment boundary: "src" must not match "srcery/a.php".
                if let Some(rest) = rest.strip_prefix('/') {
                    return join(replacement, rest);
                }
            }
        }
        relative.to_string()
    }
}

fn join(prefix: &str, rest: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        rest.to_string()
    } else if rest.is_empty() {
        prefix.to_string()
    } else {
        format!("{}/{}", prefix, rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(rules: &[(&str, &str)]) -> MapFile {
        MapFile::new(
            rules
                .iter()
                .map(|(a, b)| (a.to_string(), b.to_string()))
                .collect(),
        )
    }

    #[test]
    fn unmatched_paths_keep_relative_form() {
        let m = map(&[("src/", "lib/")]);
        assert_eq!(m.apply("tests/a.php"), "tests/a.php");
    }

    #[test]
    fn first_match_wins() {
        let m = map(&[("src/", "one/"), ("src/deep/", "two/")]);
        assert_eq!(m.apply("src/deep/a.php"), "one/deep/a.php");
    }

    #[test]
    fn prefix_matches_whole_segments_only() {
        let m = map(&[("src", "lib")]);
        assert_eq!(m.apply("src/a.php"), "lib/a.php");
        assert_eq!(m.apply("srcery/a.php"), "srcery/a.php");
        assert_eq!(m.apply("src"), "lib");
    }

    #[test]
    fn empty_prefix_prepends() {
        let m = map(&[("", "pkg/")]);
        assert_eq!(m.apply("a.php"), "pkg/a.php");
        assert_eq!(m.apply("dir/b.php"), "pkg/dir/b.php");
    }

    #[test]
    fn apply_is_idempotent_when_target_not_a_prefix_source() {
        let m = map(&[("src/", "lib/")]);
        let once = m.apply("src/a.php");
        assert_eq!(m.apply(&once), once);
    }
}
