// File selection filters

use glob::Pattern;

use crate::manifest::FileManifest;

/// True when the file matches one of the configured exclude patterns.
///
/// Patterns are matched case-insensitively against the forward-slash
/// relative path. A pattern containing a `/` with no leading or trailing
/// `*` must match the file's directory exactly, with only the basename
/// matched as a glob; every other pattern is matched against the whole
/// path.
pub fn matches_configured(filename: &str, patterns: &[String]) -> bool {
    let filename = filename.to_lowercase();
    for pattern in patterns {
        let pattern = pattern.to_lowercase();
        let path_scoped = filename.contains('/')
            && !pattern.ends_with('*')
            && !pattern.starts_with('*');
        if path_scoped {
            let (file_dir, file_base) = split_path(&filename);
            let (pat_dir, pat_base) = split_path(&pattern);
            if file_dir == pat_dir && glob_match(pat_base, file_base) {
                return true;
            }
        } else if glob_match(&pattern, &filename) {
            return true;
        }
    }
    false
}

fn split_path(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(idx) => (&path[..idx], &path[idx + 1..]),
        None => ("", path),
    }
}

fn glob_match(pattern: &str, text: &str) -> bool {
    // invalid patterns simply match nothing
    Pattern::new(pattern)
        .map(|p| p.matches(text))
        .unwrap_or(false)
}

/// True when the file carries one of the wanted install tags, or has no
/// tags at all while the empty tag is wanted.
pub fn matches_install_tag(fm: &FileManifest, wanted: &[String]) -> bool {
    wanted.iter().any(|tag| {
        fm.install_tags.iter().any(|t| t == tag) || (tag.is_empty() && fm.install_tags.is_empty())
    })
}

/// Case-insensitive prefix test against any of the given prefixes.
pub fn matches_prefix(filename: &str, prefixes: &[String]) -> bool {
    let filename = filename.to_lowercase();
    prefixes
        .iter()
        .any(|prefix| filename.starts_with(&prefix.to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterns(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_whole_path_glob() {
        let pats = patterns(&["*.log"]);
        // fnmatch semantics: `*` crosses directory separators
        assert!(matches_configured("logs/run.log", &pats));
        assert!(matches_configured("run.log", &pats));
        assert!(!matches_configured("run.pak", &pats));
    }

    #[test]
    fn test_path_scoped_pattern() {
        let pats = patterns(&["movies/intro.?mv"]);
        assert!(matches_configured("movies/intro.wmv", &pats));
        // directory must match exactly
        assert!(!matches_configured("extra/movies/intro.wmv", &pats));
        assert!(!matches_configured("other/intro.wmv", &pats));
    }

    #[test]
    fn test_star_suffix_disables_path_scoping() {
        let pats = patterns(&["movies/*"]);
        assert!(matches_configured("movies/intro.wmv", &pats));
        assert!(matches_configured("movies/sub/clip.wmv", &pats));
    }

    #[test]
    fn test_case_insensitive() {
        let pats = patterns(&["*.PAK"]);
        assert!(matches_configured("Data/Content.pak", &pats));
    }

    #[test]
    fn test_install_tags() {
        let tagged = FileManifest {
            install_tags: vec!["lang-de".to_string()],
            ..Default::default()
        };
        let untagged = FileManifest::default();

        let wanted = patterns(&["lang-de"]);
        assert!(matches_install_tag(&tagged, &wanted));
        assert!(!matches_install_tag(&untagged, &wanted));

        // the empty tag selects untagged files
        let wanted = patterns(&["", "lang-de"]);
        assert!(matches_install_tag(&untagged, &wanted));
    }

    #[test]
    fn test_prefix() {
        let prefixes = patterns(&["Data/Maps"]);
        assert!(matches_prefix("data/maps/m01.pak", &prefixes));
        assert!(!matches_prefix("data/textures/t.pak", &prefixes));
    }
}
