use std::collections::HashSet;
use std::path::{Path, PathBuf};

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use tracing::warn;
use walkdir::{DirEntry, WalkDir};

use crate::model::{raw_extension, RawFileRecord};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoverySurvey {
    pub total_files: u64,
    pub directories_visited: u64,
    pub directories_with_raw: u64,
    pub walk_errors: u64,
}

pub struct Discoverer {
    root: PathBuf,
    excludes: ExcludeMatcher,
}

impl Discoverer {
    pub fn new(root: impl Into<PathBuf>, excludes: &[String]) -> Self {
        Self {
            root: root.into(),
            excludes: ExcludeMatcher::new(excludes),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn survey(&self) -> DiscoverySurvey {
        let mut survey = DiscoverySurvey::default();
        let mut raw_dirs: HashSet<PathBuf> = HashSet::new();

        for item in self.walk() {
            let entry = match item {
                Ok(entry) => entry,
                Err(err) => {
                    survey.walk_errors += 1;
                    warn!("skipping unreadable entry under {}: {}", self.root.display(), err);
                    continue;
                }
            };
            if entry.file_type().is_dir() {
                survey.directories_visited += 1;
                continue;
            }
            if !entry.file_type().is_file() || raw_extension(entry.path()).is_none() {
                continue;
            }

            survey.total_files += 1;
            if let Some(parent) = entry.path().parent() {
                raw_dirs.insert(parent.to_path_buf());
            }
        }

        survey.directories_with_raw = raw_dirs.len() as u64;
        survey
    }

    pub fn iter(&self) -> RawFiles<'_> {
        RawFiles {
            root: &self.root,
            inner: Box::new(self.walk()),
        }
    }

    fn walk(&self) -> impl Iterator<Item = walkdir::Result<DirEntry>> + '_ {
        // Sorted so runs over an unchanged tree visit files in the same order.
        WalkDir::new(&self.root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |entry| {
                entry.depth() == 0
                    || entry
                        .path()
                        .strip_prefix(&self.root)
                        .map_or(true, |relative| !self.excludes.is_excluded(relative))
            })
    }
}

pub struct RawFiles<'a> {
    root: &'a Path,
    inner: Box<dyn Iterator<Item = walkdir::Result<DirEntry>> + 'a>,
}

impl Iterator for RawFiles<'_> {
    type Item = RawFileRecord;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.inner.next()? {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("walk error under {}: {}", self.root.display(), err);
                    continue;
                }
            };
            if !entry.file_type().is_file() || raw_extension(entry.path()).is_none() {
                continue;
            }

            match RawFileRecord::from_path(entry.path()) {
                Ok(record) => return Some(record),
                Err(err) => {
                    warn!(
                        "metadata read failed for {}: {}",
                        entry.path().display(),
                        err
                    );
                }
            }
        }
    }
}

struct ExcludeMatcher {
    globs: GlobSet,
    fragments: Vec<String>,
}

impl ExcludeMatcher {
    fn new(patterns: &[String]) -> Self {
        let mut builder = GlobSetBuilder::new();
        let mut fragments = Vec::new();
        for pattern in patterns.iter().map(|pattern| pattern.trim()) {
            if pattern.is_empty() {
                continue;
            }
            if !has_glob_syntax(pattern) {
                fragments.push(pattern.to_lowercase());
                continue;
            }
            match GlobBuilder::new(pattern).case_insensitive(true).build() {
                Ok(glob) => {
                    builder.add(glob);
                }
                Err(err) => {
                    warn!("invalid exclude glob '{pattern}': {err}; matching it as plain text");
                    fragments.push(pattern.to_lowercase());
                }
            }
        }

        let globs = builder.build().unwrap_or_else(|err| {
            warn!("failed to compile exclude globs: {err}; glob excludes disabled");
            GlobSet::empty()
        });
        Self { globs, fragments }
    }

    fn is_excluded(&self, relative: &Path) -> bool {
        if self.globs.is_match(relative) {
            return true;
        }
        if self.fragments.is_empty() {
            return false;
        }
        let lowered = relative.to_string_lossy().to_lowercase();
        self.fragments
            .iter()
            .any(|fragment| lowered.contains(fragment.as_str()))
    }
}

fn has_glob_syntax(pattern: &str) -> bool {
    pattern.contains(['*', '?', '[', ']', '{', '}'])
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use super::{Discoverer, ExcludeMatcher};

    fn touch(path: &Path) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(path, b"raw").expect("write file");
    }

    #[test]
    fn finds_raw_files_recursively_and_case_insensitively() {
        let dir = tempfile::tempdir().expect("tempdir");
        touch(&dir.path().join("a/IMG_0001.CR2"));
        touch(&dir.path().join("a/IMG_0001.jpg"));
        touch(&dir.path().join("a/b/P1000.rw2"));
        touch(&dir.path().join("c/notes.txt"));
        touch(&dir.path().join("DSC_0002.NeF"));

        let discoverer = Discoverer::new(dir.path(), &[]);
        let survey = discoverer.survey();
        assert_eq!(survey.total_files, 3);
        assert_eq!(survey.directories_with_raw, 3);
        assert_eq!(survey.directories_visited, 4);

        let records = discoverer.iter().collect::<Vec<_>>();
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|record| record.size_bytes == 3));
        assert!(records.iter().any(|record| record.extension == "nef"));

        // A second walk starts over.
        assert_eq!(discoverer.iter().count(), 3);
    }

    #[test]
    fn excluded_directories_are_not_walked() {
        let dir = tempfile::tempdir().expect("tempdir");
        touch(&dir.path().join("keep/IMG_1.CR2"));
        touch(&dir.path().join("trash/IMG_2.CR2"));
        touch(&dir.path().join("keep/tmp/IMG_3.ARW"));

        let discoverer = Discoverer::new(dir.path(), &["trash".to_string(), "**/tmp".to_string()]);
        let records = discoverer.iter().collect::<Vec<_>>();
        assert_eq!(records.len(), 1);
        assert!(records[0].path.ends_with("keep/IMG_1.CR2"));
        assert_eq!(discoverer.survey().total_files, 1);
    }

    #[test]
    fn excludes_match_relative_to_the_root() {
        let base = tempfile::tempdir().expect("tempdir");
        let root = base.path().join("Export");
        touch(&root.join("2023/IMG_1.ARW"));
        touch(&root.join("2024/IMG_2.ARW"));
        touch(&root.join("2024/IMG_3.nef"));

        // The root's own name must not exclude everything beneath it.
        let by_name = Discoverer::new(&root, &["export".to_string()]);
        assert_eq!(by_name.survey().total_files, 3);

        let by_glob = Discoverer::new(&root, &["2023/*".to_string(), "*.NEF".to_string()]);
        let records = by_glob.iter().collect::<Vec<_>>();
        assert_eq!(records.len(), 1);
        assert!(records[0].path.ends_with("2024/IMG_2.ARW"));
    }

    #[test]
    fn exclude_matcher_falls_back_to_substring_for_bad_glob() {
        let matcher = ExcludeMatcher::new(&["[".to_string(), "Export".to_string()]);
        assert!(matcher.is_excluded(Path::new("[x]/a.cr2")));
        assert!(matcher.is_excluded(Path::new("export/a.cr2")));
        assert!(!matcher.is_excluded(Path::new("2024/a.cr2")));
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_directory_is_counted_and_skipped() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        touch(&dir.path().join("locked/IMG_1.CR2"));
        touch(&dir.path().join("open/IMG_2.CR2"));
        let locked = dir.path().join("locked");
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).expect("chmod");
        if fs::read_dir(&locked).is_ok() {
            // Permission bits do not bind this user (root).
            fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).expect("chmod");
            return;
        }

        let discoverer = Discoverer::new(dir.path(), &[]);
        let survey = discoverer.survey();
        let records = discoverer.iter().collect::<Vec<_>>();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).expect("chmod");

        assert_eq!(survey.walk_errors, 1);
        assert_eq!(survey.total_files, 1);
        assert_eq!(records.len(), 1);
        assert!(records[0].path.ends_with("open/IMG_2.CR2"));
    }
}
