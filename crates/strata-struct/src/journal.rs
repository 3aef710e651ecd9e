//! Append-only revision journal
//!
//! Each revision sets the value at a key path of the materialized document.
//! `contents` is always the fold of every revision in order, and each
//! revision records the content hash of the document after it was applied,
//! so a client holding a hash can tell whether it is in sync without
//! fetching the document.

use crate::document::Document;
use crate::store::{Struct, StructFile};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use strata_common::{Error, Result, Timestamp, TimestampGenerator};
use tracing::debug;

/// One recorded mutation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    /// Key path into the document; empty replaces the whole document
    pub path: Vec<String>,
    pub data: Document,
    pub metadata: Document,
    pub timestamp: Timestamp,
    /// Content hash of the document after this revision
    pub hash: String,
}

/// Persisted journal layout
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JournalData {
    pub contents: Document,
    pub revisions: Vec<Revision>,
}

impl Default for JournalData {
    fn default() -> Self {
        Self {
            contents: Document::map(),
            revisions: Vec::new(),
        }
    }
}

/// Document with a replayable mutation history
#[derive(Debug)]
pub struct RevisionJournal {
    file: StructFile<JournalData>,
    clock: TimestampGenerator,
}

impl RevisionJournal {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self::with_clock(path, TimestampGenerator::default())
    }

    pub fn with_clock(path: Option<PathBuf>, clock: TimestampGenerator) -> Self {
        Self {
            file: StructFile::new(path),
            clock,
        }
    }

    /// Recorded revisions, oldest first
    #[must_use]
    pub fn revisions(&self) -> &[Revision] {
        &self.file.data.revisions
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.file.data.revisions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.file.data.revisions.is_empty()
    }

    /// Value at a key path of the current contents
    pub fn get<S: AsRef<str>>(&self, path: &[S]) -> Option<&Document> {
        self.file.data.contents.get_path(path)
    }

    /// Set `path` to `data` and record the change
    pub fn add_revision<S: AsRef<str>>(
        &mut self,
        path: &[S],
        data: Document,
        metadata: Document,
    ) -> Result<&Revision> {
        let mut contents = self.file.data.contents.clone();
        contents.set_path(path, data.clone());
        let hash = contents.content_hash()?;

        let revision = Revision {
            path: path.iter().map(|s| s.as_ref().to_string()).collect(),
            data,
            metadata,
            timestamp: self.clock.next(),
            hash,
        };

        debug!(
            "Journal revision {} at {:?} ({})",
            self.file.data.revisions.len(),
            revision.path,
            revision.timestamp
        );

        self.file.data.contents = contents;
        self.file.data.revisions.push(revision);
        self.file.mark_dirty();

        let index = self.file.data.revisions.len() - 1;
        Ok(&self.file.data.revisions[index])
    }

    /// Materialized document as of revision `index`
    pub fn get_revision_contents(&self, index: usize) -> Result<Document> {
        let revisions = &self.file.data.revisions;
        if index >= revisions.len() {
            return Err(Error::NotExists(format!(
                "revision {index} (journal has {})",
                revisions.len()
            )));
        }

        Ok(replay(&revisions[..=index]))
    }

    /// Current materialized document
    #[must_use]
    pub fn get_latest_revision_contents(&self) -> &Document {
        &self.file.data.contents
    }

    /// Roll back to revision `index`, discarding everything after it
    pub fn restore_revision(&mut self, index: usize) -> Result<()> {
        let contents = self.get_revision_contents(index)?;

        self.file.data.revisions.truncate(index + 1);
        self.file.data.contents = contents;
        self.file.mark_dirty();
        Ok(())
    }

    /// Collapse the whole history into one revision holding the current contents
    pub fn purge_revisions(&mut self, metadata: Document) -> Result<()> {
        let contents = self.file.data.contents.clone();
        let hash = contents.content_hash()?;

        self.file.data.revisions = vec![Revision {
            path: Vec::new(),
            data: contents,
            metadata,
            timestamp: self.clock.next(),
            hash,
        }];
        self.file.mark_dirty();
        Ok(())
    }

    /// Revisions recorded at or after `since`, oldest first
    #[must_use]
    pub fn get_revisions_since(&self, since: Timestamp) -> &[Revision] {
        let revisions = &self.file.data.revisions;
        let start = revisions.partition_point(|r| r.timestamp < since);
        &revisions[start..]
    }

    /// Index of the newest revision recorded at or before `at`
    #[must_use]
    pub fn get_revision_index_at_date(&self, at: Timestamp) -> Option<usize> {
        self.file
            .data
            .revisions
            .partition_point(|r| r.timestamp <= at)
            .checked_sub(1)
    }

    /// Hash of the current contents, if any revision exists
    #[must_use]
    pub fn latest_hash(&self) -> Option<&str> {
        self.file.data.revisions.last().map(|r| r.hash.as_str())
    }

    /// Whether a client holding `hash` has the current contents
    #[must_use]
    pub fn is_in_sync(&self, hash: &str) -> bool {
        self.latest_hash() == Some(hash)
    }
}

impl Struct for RevisionJournal {
    type Data = JournalData;

    fn file(&self) -> &StructFile<JournalData> {
        &self.file
    }

    fn file_mut(&mut self) -> &mut StructFile<JournalData> {
        &mut self.file
    }

    fn after_load(&mut self) {
        if let Some(last) = self.file.data.revisions.last() {
            self.clock.observe(last.timestamp);
        }
    }
}

fn replay(revisions: &[Revision]) -> Document {
    let mut contents = Document::map();
    for revision in revisions {
        contents.set_path(&revision.path, revision.data.clone());
    }
    contents
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::tempdir;

    fn reason(r: &str) -> Document {
        Document::from_pairs([("reason", r)])
    }

    #[test]
    fn test_revisions_replay_and_restore() {
        let mut journal = RevisionJournal::new(None);
        journal
            .add_revision(&["test", "path"], "example".into(), reason("initial"))
            .unwrap();
        journal
            .add_revision(&["test", "path"], "new".into(), reason("initial"))
            .unwrap();
        journal
            .add_revision(&["test", "secondary"], "other".into(), reason("initial"))
            .unwrap();

        let first = journal.get_revision_contents(0).unwrap();
        assert_eq!(first.get_path(&["test", "path"]), Some(&Document::from("example")));
        assert!(first.get_path(&["test", "secondary"]).is_none());

        assert_eq!(
            &journal.get_revision_contents(2).unwrap(),
            journal.get_latest_revision_contents()
        );

        journal.restore_revision(0).unwrap();
        assert_eq!(journal.len(), 1);
        assert_eq!(journal.get_latest_revision_contents(), &first);
        assert!(journal.get_revision_contents(1).is_err());
    }

    #[test]
    fn test_purge_keeps_contents_and_hash() {
        let mut journal = RevisionJournal::new(None);
        journal
            .add_revision(&["test", "path"], "afterRestore".into(), reason("a"))
            .unwrap();
        journal
            .add_revision(&["test", "secondary"], "another".into(), reason("a"))
            .unwrap();
        let before = journal.get_latest_revision_contents().clone();
        let hash = journal.latest_hash().unwrap().to_string();

        journal.purge_revisions(reason("reset")).unwrap();

        assert_eq!(journal.len(), 1);
        assert_eq!(journal.get_latest_revision_contents(), &before);
        assert_eq!(journal.get_revision_contents(0).unwrap(), before);
        assert!(journal.is_in_sync(&hash));
        assert_eq!(journal.revisions()[0].metadata, reason("reset"));
    }

    #[test]
    fn test_empty_path_replaces_document() {
        let mut journal = RevisionJournal::new(None);
        journal.add_revision(&["a"], 1i64.into(), Document::Null).unwrap();
        let empty: [&str; 0] = [];
        journal
            .add_revision(&empty, Document::from_pairs([("b", 2i64)]), Document::Null)
            .unwrap();

        assert_eq!(
            journal.get_latest_revision_contents(),
            &Document::from_pairs([("b", 2i64)])
        );
        assert_eq!(journal.get(&["b"]), Some(&Document::Int(2)));
    }

    #[test]
    fn test_out_of_range_revision() {
        let journal = RevisionJournal::new(None);
        let err = journal.get_revision_contents(0).unwrap_err();
        assert!(matches!(err, Error::NotExists(_)));
        assert!(journal.latest_hash().is_none());
    }

    #[test]
    fn test_date_queries() {
        let mut journal = RevisionJournal::new(None);
        for i in 0..4i64 {
            journal.add_revision(&["n"], i.into(), Document::Null).unwrap();
        }
        let stamps: Vec<Timestamp> = journal.revisions().iter().map(|r| r.timestamp).collect();

        assert_eq!(journal.get_revisions_since(stamps[2]).len(), 2);
        assert_eq!(journal.get_revisions_since(stamps[2])[0].data, Document::Int(2));
        assert_eq!(journal.get_revisions_since(Timestamp::ZERO).len(), 4);

        assert_eq!(journal.get_revision_index_at_date(stamps[1]), Some(1));
        assert_eq!(journal.get_revision_index_at_date(Timestamp(stamps[2].0 - 1)), Some(1));
        assert_eq!(journal.get_revision_index_at_date(Timestamp(stamps[0].0 - 1)), None);
        assert_eq!(journal.get_revision_index_at_date(Timestamp(u64::MAX)), Some(3));
    }

    #[test]
    fn test_hash_tracks_contents() {
        let mut journal = RevisionJournal::new(None);
        let h1 = journal
            .add_revision(&["k"], "v".into(), Document::Null)
            .unwrap()
            .hash
            .clone();
        let h2 = journal
            .add_revision(&["k"], "w".into(), Document::Null)
            .unwrap()
            .hash
            .clone();
        let h3 = journal
            .add_revision(&["k"], "v".into(), Document::Null)
            .unwrap()
            .hash
            .clone();

        assert_ne!(h1, h2);
        assert_eq!(h1, h3);
        assert!(journal.is_in_sync(&h3));
        assert!(!journal.is_in_sync(&h2));
    }

    #[test]
    fn test_save_load_continues_clock() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.journal");

        let mut journal = RevisionJournal::new(Some(path.clone()));
        journal.add_revision(&["theme"], "dark".into(), Document::Null).unwrap();
        journal.save_to_file().unwrap();
        let last = journal.revisions()[0].timestamp;

        let mut loaded = RevisionJournal::new(Some(path));
        loaded.load_from_file().unwrap();
        assert_eq!(loaded.get(&["theme"]), Some(&Document::from("dark")));

        loaded.add_revision(&["theme"], "light".into(), Document::Null).unwrap();
        assert!(loaded.revisions()[1].timestamp > last);
    }

    fn revision_strategy() -> impl Strategy<Value = (Vec<String>, i64)> {
        (
            prop::collection::vec(prop::sample::select(vec!["a", "b", "c"]), 0..3),
            any::<i64>(),
        )
            .prop_map(|(path, value)| (path.into_iter().map(String::from).collect(), value))
    }

    proptest! {
        #[test]
        fn prop_replay_matches_contents(
            ops in prop::collection::vec(revision_strategy(), 1..30),
            pick in any::<prop::sample::Index>(),
        ) {
            let mut journal = RevisionJournal::new(None);
            for (path, value) in &ops {
                journal.add_revision(path, Document::Int(*value), Document::Null).unwrap();
            }

            let last = journal.len() - 1;
            prop_assert_eq!(
                &journal.get_revision_contents(last).unwrap(),
                journal.get_latest_revision_contents()
            );

            let i = pick.index(journal.len());
            let expected = journal.get_revision_contents(i).unwrap();
            let expected_hash = journal.revisions()[i].hash.clone();
            journal.restore_revision(i).unwrap();
            prop_assert_eq!(journal.get_latest_revision_contents(), &expected);
            prop_assert_eq!(journal.len(), i + 1);
            prop_assert!(journal.is_in_sync(&expected_hash));
        }
    }
}
