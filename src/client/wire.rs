//! Serde shapes for the board API's JSON envelopes.
//!
//! The wire format uses short field names and 0/1 integers for flags; these
//! structs stay private to the client and are converted into the plain
//! domain types immediately after parsing.

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use tracing::warn;

use crate::domain::{Md5Hash, MediaInfo, Post, ThreadSummary};

#[derive(Debug, Deserialize)]
pub struct ThreadEnvelope {
    pub posts: Vec<WirePost>,
}

#[derive(Debug, Deserialize)]
pub struct CatalogEnvelope {
    pub threads: HashMap<String, WireSummary>,
}

#[derive(Debug, Deserialize)]
pub struct WirePost {
    pub no: u64,
    pub time: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub com: Option<String>,
    #[serde(default)]
    pub sticky: Option<u8>,
    #[serde(default)]
    pub closed: Option<u8>,
    #[serde(default)]
    pub filedeleted: Option<u8>,
    // Media fields; present together when the post has a file.
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub ext: Option<String>,
    #[serde(default)]
    pub tim: Option<u64>,
    #[serde(default)]
    pub fsize: Option<u64>,
    #[serde(default)]
    pub w: Option<u32>,
    #[serde(default)]
    pub h: Option<u32>,
    #[serde(default)]
    pub tn_w: Option<u32>,
    #[serde(default)]
    pub tn_h: Option<u32>,
    #[serde(default)]
    pub spoiler: Option<u8>,
    #[serde(default)]
    pub md5: Option<String>,
}

impl WirePost {
    fn media(&self) -> Option<MediaInfo> {
        let tim = self.tim?;
        let ext = self.ext.clone()?;
        let hash = match self.md5.as_deref().and_then(Md5Hash::from_base64) {
            Some(hash) => hash,
            None => {
                warn!(post = self.no, "post has a file but no parseable md5; ignoring media");
                return None;
            }
        };
        Some(MediaInfo {
            renamed: tim.to_string(),
            original_name: self.filename.clone().unwrap_or_default(),
            ext,
            size: self.fsize.unwrap_or(0),
            width: self.w.unwrap_or(0),
            height: self.h.unwrap_or(0),
            thumb_width: self.tn_w.unwrap_or(0),
            thumb_height: self.tn_h.unwrap_or(0),
            spoiler: self.spoiler.unwrap_or(0) != 0,
            hash,
        })
    }
}

impl From<WirePost> for Post {
    fn from(wire: WirePost) -> Self {
        let media = wire.media();
        Post {
            id: wire.no,
            time: timestamp(wire.time),
            author: wire.name.unwrap_or_else(|| "Anonymous".into()),
            subject: wire.sub,
            comment: wire.com,
            sticky: wire.sticky.unwrap_or(0) != 0,
            closed: wire.closed.unwrap_or(0) != 0,
            deleted: wire.filedeleted.unwrap_or(0) != 0,
            media,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct WireSummary {
    pub last_modified: i64,
    #[serde(default)]
    pub replies: u32,
    #[serde(default)]
    pub images: u32,
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub com: Option<String>,
}

impl WireSummary {
    /// Keys of the catalog map are thread ids encoded as strings.
    pub fn into_summary(self, id: String) -> ThreadSummary {
        let id = id.parse().unwrap_or_else(|_| {
            panic!("malformed catalog envelope: non-numeric thread id {id:?}")
        });
        ThreadSummary {
            id,
            last_modified: timestamp(self.last_modified),
            replies: self.replies,
            images: self.images,
            subject: self.sub,
            excerpt: self.com,
        }
    }
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_without_file_has_no_media() {
        let wire: WirePost =
            serde_json::from_str(r#"{"no":1,"time":1700000000,"com":"text only"}"#).unwrap();
        let post = Post::from(wire);
        assert!(post.media.is_none());
        assert_eq!(post.author, "Anonymous");
    }

    #[test]
    fn flags_decode_from_integers() {
        let wire: WirePost =
            serde_json::from_str(r#"{"no":1,"time":1700000000,"sticky":1,"closed":1}"#).unwrap();
        let post = Post::from(wire);
        assert!(post.sticky);
        assert!(post.closed);
    }

    #[test]
    fn unparseable_md5_drops_media_not_post() {
        let wire: WirePost = serde_json::from_str(
            r#"{"no":1,"time":1700000000,"tim":123,"ext":".png","md5":"!!!"}"#,
        )
        .unwrap();
        let post = Post::from(wire);
        assert!(post.media.is_none());
        assert_eq!(post.id, 1);
    }
}
