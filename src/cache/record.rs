use std::collections::BTreeSet;

use crate::domain::{Md5Hash, Post};

/// Everything the cache knows about one piece of media, keyed by content
/// hash.
///
/// All fields describe literally the same binary content, accumulated from
/// every place it was seen. Merging two records for the same hash is a
/// set-union, never an overwrite; the presence flags only ever go from
/// false to true.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRecord {
    pub hash: Md5Hash,
    pub size: u64,
    /// Extension including the leading dot.
    pub ext: String,
    /// Boards the content was posted on.
    pub boards: BTreeSet<String>,
    /// Free-form labels attached by consumers; carried through merges and
    /// snapshots.
    pub tags: BTreeSet<String>,
    /// Original upload filenames.
    pub filenames: BTreeSet<String>,
    /// Poster identities the content was posted under.
    pub posters: BTreeSet<String>,
    /// Unix timestamps of posts carrying the content.
    pub dates: BTreeSet<i64>,
    pub spoiler_count: u16,
    pub deleted_count: u16,
    pub has_thumb: bool,
    pub has_image: bool,
}

impl MediaRecord {
    pub fn new(hash: Md5Hash, size: u64, ext: impl Into<String>) -> Self {
        Self {
            hash,
            size,
            ext: ext.into(),
            boards: BTreeSet::new(),
            tags: BTreeSet::new(),
            filenames: BTreeSet::new(),
            posters: BTreeSet::new(),
            dates: BTreeSet::new(),
            spoiler_count: 0,
            deleted_count: 0,
            has_thumb: false,
            has_image: false,
        }
    }

    /// Fold another record for the same content into this one.
    ///
    /// Idempotent: merging a record into itself changes nothing, so the
    /// counters take the maximum rather than summing.
    pub fn merge(&mut self, other: &MediaRecord) {
        debug_assert_eq!(self.hash, other.hash);
        if self.size == 0 {
            self.size = other.size;
        }
        if self.ext.is_empty() {
            self.ext = other.ext.clone();
        }
        self.boards.extend(other.boards.iter().cloned());
        self.tags.extend(other.tags.iter().cloned());
        self.filenames.extend(other.filenames.iter().cloned());
        self.posters.extend(other.posters.iter().cloned());
        self.dates.extend(other.dates.iter().copied());
        self.spoiler_count = self.spoiler_count.max(other.spoiler_count);
        self.deleted_count = self.deleted_count.max(other.deleted_count);
        self.has_thumb |= other.has_thumb;
        self.has_image |= other.has_image;
    }

    /// Accumulate metadata from a post that carries this content.
    pub fn note_post(&mut self, board: &str, post: &Post) {
        let Some(media) = post.media.as_ref() else {
            return;
        };
        debug_assert_eq!(self.hash, media.hash);
        if self.size == 0 {
            self.size = media.size;
        }
        if self.ext.is_empty() {
            self.ext = media.ext.clone();
        }
        self.boards.insert(board.to_string());
        if !media.original_name.is_empty() {
            self.filenames.insert(media.original_name.clone());
        }
        if !post.author.is_empty() {
            self.posters.insert(post.author.clone());
        }
        self.dates.insert(post.time.timestamp());
        if media.spoiler {
            self.spoiler_count = self.spoiler_count.saturating_add(1);
        }
        if post.deleted {
            self.deleted_count = self.deleted_count.saturating_add(1);
        }
    }
}
