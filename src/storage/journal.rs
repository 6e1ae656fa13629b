// Resume journal

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::common::error::Result;

/// Append-only record of completed files, one `hex_sha1:filename` line
/// per successfully closed file. The journal is deleted when an install
/// run finishes cleanly.
#[derive(Debug, Clone)]
pub struct ResumeJournal {
    path: PathBuf,
}

impl ResumeJournal {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Read all records. Each line is split on the first `:`; trailing
    /// whitespace is trimmed.
    pub fn load(&self) -> Result<Vec<(String, String)>> {
        let reader = BufReader::new(File::open(&self.path)?);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            match line.split_once(':') {
                Some((hash, filename)) => entries.push((hash.to_string(), filename.to_string())),
                None => entries.push((line.to_string(), String::new())),
            }
        }
        Ok(entries)
    }

    /// Record one completed file.
    pub fn append(&self, file_hash: &str, filename: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}:{}", file_hash, filename)?;
        Ok(())
    }

    /// Delete the journal after a successful run.
    pub fn remove(&self) -> Result<()> {
        fs::remove_file(&self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_append_and_load() {
        let dir = TempDir::new().unwrap();
        let journal = ResumeJournal::new(dir.path().join("install.resume"));
        assert!(!journal.exists());

        journal.append(&"ab".repeat(20), "data/a.pak").unwrap();
        journal.append(&"cd".repeat(20), "data/b.pak").unwrap();
        assert!(journal.exists());

        let entries = journal.load().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], ("ab".repeat(20), "data/a.pak".to_string()));
        assert_eq!(entries[1].1, "data/b.pak");
    }

    #[test]
    fn test_load_splits_on_first_colon() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("install.resume");
        fs::write(&path, "deadbeef:dir/odd:name.txt  \n\n").unwrap();

        let entries = ResumeJournal::new(&path).load().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "deadbeef");
        // filename keeps later colons, trailing whitespace is trimmed
        assert_eq!(entries[0].1, "dir/odd:name.txt");
    }

    #[test]
    fn test_remove() {
        let dir = TempDir::new().unwrap();
        let journal = ResumeJournal::new(dir.path().join("install.resume"));
        journal.append("00", "x").unwrap();
        journal.remove().unwrap();
        assert!(!journal.exists());
    }
}
