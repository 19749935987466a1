//! Static per-thread work-estimate file.
//!
//! One entry per line: `<thread_id> <work_units>`. Blank lines and lines
//! starting with `#` are ignored. Every thread in the population must have
//! exactly one entry.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use tracing::debug;

use crate::error::{CoreError, CoreResult};
use crate::types::ThreadId;

/// Parsed work estimates, keyed by thread id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkEstimates {
    entries: BTreeMap<ThreadId, f64>,
}

impl WorkEstimates {
    /// Load estimates for the given thread population.
    pub fn from_file(path: &Path, population: &[ThreadId]) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| CoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content, path, population)
    }

    /// Parse estimate text. `path` is only used in error messages.
    pub fn parse(content: &str, path: &Path, population: &[ThreadId]) -> CoreResult<Self> {
        let known: HashSet<ThreadId> = population.iter().copied().collect();
        let mut entries = BTreeMap::new();

        for (idx, raw) in content.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut fields = line.split_whitespace();
            let (Some(id), Some(work), None) = (fields.next(), fields.next(), fields.next())
            else {
                return Err(CoreError::parse(
                    path,
                    line_no,
                    format!("expected `<thread_id> <work_units>`, got `{line}`"),
                ));
            };

            let id: ThreadId = id.parse().map_err(|_| {
                CoreError::parse(path, line_no, format!("malformed thread id `{id}`"))
            })?;
            let work: f64 = work
                .parse()
                .ok()
                .filter(|w: &f64| w.is_finite() && *w >= 0.0)
                .ok_or_else(|| {
                    CoreError::parse(path, line_no, format!("malformed work estimate `{work}`"))
                })?;

            if !known.contains(&id) {
                return Err(CoreError::Config(format!(
                    "{}: line {line_no} references unknown thread {id}",
                    path.display()
                )));
            }
            if entries.insert(id, work).is_some() {
                return Err(CoreError::parse(
                    path,
                    line_no,
                    format!("duplicate entry for thread {id}"),
                ));
            }
        }

        if let Some(missing) = population.iter().find(|id| !entries.contains_key(id)) {
            return Err(CoreError::parse(
                path,
                0,
                format!("no work estimate for thread {missing}"),
            ));
        }

        debug!(threads = entries.len(), path = %path.display(), "work estimates loaded");
        Ok(Self { entries })
    }

    /// Uniform estimates, used when no estimate file is supplied.
    pub fn uniform(population: &[ThreadId], work: f64) -> Self {
        Self {
            entries: population.iter().map(|id| (*id, work)).collect(),
        }
    }

    pub fn get(&self, thread: ThreadId) -> Option<f64> {
        self.entries.get(&thread).copied()
    }

    pub fn total(&self) -> f64 {
        self.entries.values().sum()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ThreadId, f64)> + '_ {
        self.entries.iter().map(|(id, w)| (*id, *w))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str, population: &[ThreadId]) -> CoreResult<WorkEstimates> {
        WorkEstimates::parse(s, Path::new("work.txt"), population)
    }

    #[test]
    fn parses_entries_and_skips_comments() {
        let est = parse("# thread work\n0 10\n\n1 20.5\n2 0\n", &[0, 1, 2]).unwrap();
        assert_eq!(est.len(), 3);
        assert_eq!(est.get(1), Some(20.5));
        assert_eq!(est.total(), 30.5);
    }

    #[test]
    fn unknown_thread_is_config_error() {
        let err = parse("0 10\n1 10\n7 10\n", &[0, 1]).unwrap_err();
        assert!(err.is_config(), "{err}");
    }

    #[test]
    fn missing_thread_is_parse_error() {
        let err = parse("0 10\n", &[0, 1]).unwrap_err();
        assert!(err.is_parse(), "{err}");
    }

    #[test]
    fn malformed_id_is_parse_error() {
        let err = parse("zero 10\n", &[0]).unwrap_err();
        match err {
            CoreError::Parse { line, .. } => assert_eq!(line, 1),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn negative_work_is_parse_error() {
        assert!(parse("0 -3\n", &[0]).unwrap_err().is_parse());
    }

    #[test]
    fn extra_fields_are_parse_error() {
        assert!(parse("0 1 2\n", &[0]).unwrap_err().is_parse());
    }

    #[test]
    fn duplicate_entry_is_parse_error() {
        assert!(parse("0 1\n0 2\n", &[0]).unwrap_err().is_parse());
    }

    #[test]
    fn uniform_covers_population() {
        let est = WorkEstimates::uniform(&[3, 4, 5], 1.0);
        assert_eq!(est.total(), 3.0);
        assert_eq!(est.get(4), Some(1.0));
    }

    #[test]
    fn from_file_reads_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("work.txt");
        std::fs::write(&path, "0 5\n1 7\n").unwrap();
        let est = WorkEstimates::from_file(&path, &[0, 1]).unwrap();
        assert_eq!(est.get(0), Some(5.0));
    }
}
