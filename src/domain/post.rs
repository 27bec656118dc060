use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};

/// MD5 content hash of a media file, as reported by the board API.
///
/// This is the cache/content-addressing key for all media: two files with the
/// same hash are treated as literally the same binary content.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Md5Hash([u8; 16]);

impl Md5Hash {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Parse the base64 form used by the board API's `md5` field.
    pub fn from_base64(s: &str) -> Option<Self> {
        let decoded = BASE64.decode(s.trim()).ok()?;
        let bytes: [u8; 16] = decoded.try_into().ok()?;
        Some(Self(bytes))
    }

    /// Hash raw file bytes.
    pub fn of(data: &[u8]) -> Self {
        Self(md5::compute(data).0)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Two-character shard directory name derived from the hash.
    pub fn shard(&self) -> String {
        self.to_hex()[..2].to_string()
    }
}

impl std::fmt::Display for Md5Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl std::fmt::Debug for Md5Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Md5Hash({})", self.to_hex())
    }
}

/// Media attached to a post.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaInfo {
    /// Server-assigned filename stem (the "renamed" name media URLs use).
    pub renamed: String,
    /// Filename as uploaded by the poster.
    pub original_name: String,
    /// Extension including the leading dot, e.g. `.jpg`.
    pub ext: String,
    pub size: u64,
    pub width: u32,
    pub height: u32,
    pub thumb_width: u32,
    pub thumb_height: u32,
    pub spoiler: bool,
    pub hash: Md5Hash,
}

impl MediaInfo {
    /// URL of the full-size file on the media origin.
    pub fn image_url(&self, media_base: &str, board: &str) -> String {
        format!("{}/{}/{}{}", media_base, board, self.renamed, self.ext)
    }

    /// URL of the thumbnail; the origin always serves thumbnails as
    /// `<renamed>s.jpg` regardless of the full file's extension.
    pub fn thumb_url(&self, media_base: &str, board: &str) -> String {
        format!("{}/{}/{}s.jpg", media_base, board, self.renamed)
    }
}

/// A single post, immutable after construction.
///
/// Updates arrive as whole replacement snapshots via [`Post::update_from`];
/// nothing mutates a `Post` field-by-field.
#[derive(Debug, Clone, PartialEq)]
pub struct Post {
    pub id: u64,
    pub time: DateTime<Utc>,
    pub author: String,
    pub subject: Option<String>,
    pub comment: Option<String>,
    pub sticky: bool,
    pub closed: bool,
    /// Set when the post (or its file) has been deleted server-side.
    pub deleted: bool,
    pub media: Option<MediaInfo>,
}

impl Post {
    /// Replace this post's contents with `fresh` if the two differ
    /// semantically. Only the id and the sticky/closed/deleted flags count as
    /// semantic differences; edits the API cannot make (text, media) are not
    /// compared. Returns whether a replacement happened.
    pub fn update_from(&mut self, fresh: &Post) -> bool {
        let changed = self.id != fresh.id
            || self.sticky != fresh.sticky
            || self.closed != fresh.closed
            || self.deleted != fresh.deleted;
        if changed {
            *self = fresh.clone();
        }
        changed
    }

    /// Mark the post deleted. Returns whether this was a change.
    pub fn mark_deleted(&mut self) -> bool {
        if self.deleted {
            false
        } else {
            self.deleted = true;
            true
        }
    }
}
