use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::domain::Post;

/// Identifies a monitored thread: board plus numeric id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadKey {
    pub board: String,
    pub id: u64,
}

impl ThreadKey {
    pub fn new(board: impl Into<String>, id: u64) -> Self {
        Self {
            board: board.into(),
            id,
        }
    }
}

impl std::fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "/{}/{}", self.board, self.id)
    }
}

/// A monitored thread and its post history.
///
/// Owned exclusively by the polling manager; everything handed outward is a
/// clone. Posts are held by value in an ordered map, so iteration follows
/// post-id order.
#[derive(Debug, Clone)]
pub struct Thread {
    pub board: String,
    pub id: u64,
    pub url: String,
    /// Timestamp of the newest post seen, used as the conditional-request
    /// watermark.
    pub last_post_at: Option<DateTime<Utc>>,
    pub last_checked_at: Option<DateTime<Utc>>,
    /// Set once the server reports the thread gone; terminal.
    pub gone: bool,
    pub interval: Duration,
    pub posts: BTreeMap<u64, Post>,
}

impl Thread {
    pub fn new(board: impl Into<String>, id: u64, api_base: &str, initial_interval: Duration) -> Self {
        let board = board.into();
        let url = format!("{}/{}/thread/{}.json", api_base, board, id);
        Self {
            board,
            id,
            url,
            last_post_at: None,
            last_checked_at: None,
            gone: false,
            interval: initial_interval,
            posts: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> ThreadKey {
        ThreadKey::new(self.board.clone(), self.id)
    }

    /// Whether enough time has elapsed since the last check to poll again.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_checked_at {
            None => true,
            Some(checked) => {
                let elapsed = now.signed_duration_since(checked);
                elapsed.num_milliseconds().max(0) as u128 >= self.interval.as_millis()
            }
        }
    }

    /// Fold a freshly fetched post list into the history.
    ///
    /// New posts are inserted; existing posts are replaced when semantically
    /// changed; posts that vanished from the response are marked deleted.
    /// Returns the number of new or changed posts and advances the
    /// `last_post_at` watermark.
    pub fn absorb(&mut self, fetched: Vec<Post>) -> usize {
        let mut changed = 0;
        let mut seen = Vec::with_capacity(fetched.len());

        for post in fetched {
            seen.push(post.id);
            if post.time > self.last_post_at.unwrap_or(DateTime::<Utc>::MIN_UTC) {
                self.last_post_at = Some(post.time);
            }
            match self.posts.get_mut(&post.id) {
                Some(existing) => {
                    if existing.update_from(&post) {
                        changed += 1;
                    }
                }
                None => {
                    self.posts.insert(post.id, post);
                    changed += 1;
                }
            }
        }

        // A full response that no longer lists a post means it was deleted.
        if !seen.is_empty() {
            for (id, post) in self.posts.iter_mut() {
                if !seen.contains(id) && post.mark_deleted() {
                    changed += 1;
                }
            }
        }

        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn post(id: u64, time: i64) -> Post {
        Post {
            id,
            time: Utc.timestamp_opt(time, 0).unwrap(),
            author: "Anonymous".into(),
            subject: None,
            comment: None,
            sticky: false,
            closed: false,
            deleted: false,
            media: None,
        }
    }

    fn thread() -> Thread {
        Thread::new("g", 1000, "https://a.example.org", Duration::from_secs(10))
    }

    #[test]
    fn url_follows_api_convention() {
        assert_eq!(thread().url, "https://a.example.org/g/thread/1000.json");
    }

    #[test]
    fn never_checked_thread_is_due() {
        assert!(thread().is_due(Utc::now()));
    }

    #[test]
    fn recently_checked_thread_is_not_due() {
        let mut t = thread();
        let now = Utc::now();
        t.last_checked_at = Some(now);
        assert!(!t.is_due(now + chrono::Duration::seconds(5)));
        assert!(t.is_due(now + chrono::Duration::seconds(10)));
    }

    #[test]
    fn absorb_counts_new_posts_and_advances_watermark() {
        let mut t = thread();
        let changed = t.absorb(vec![post(1000, 100), post(1001, 200)]);
        assert_eq!(changed, 2);
        assert_eq!(t.posts.len(), 2);
        assert_eq!(
            t.last_post_at,
            Some(Utc.timestamp_opt(200, 0).unwrap())
        );
    }

    #[test]
    fn absorb_of_identical_list_changes_nothing() {
        let mut t = thread();
        t.absorb(vec![post(1000, 100), post(1001, 200)]);
        let changed = t.absorb(vec![post(1000, 100), post(1001, 200)]);
        assert_eq!(changed, 0);
    }

    #[test]
    fn absorb_marks_vanished_posts_deleted() {
        let mut t = thread();
        t.absorb(vec![post(1000, 100), post(1001, 200)]);
        let changed = t.absorb(vec![post(1000, 100)]);
        assert_eq!(changed, 1);
        assert!(t.posts[&1001].deleted);

        // Still absent next cycle: no further change.
        assert_eq!(t.absorb(vec![post(1000, 100)]), 0);
    }

    #[test]
    fn absorb_replaces_on_closed_flag() {
        let mut t = thread();
        t.absorb(vec![post(1000, 100)]);
        let mut op = post(1000, 100);
        op.closed = true;
        assert_eq!(t.absorb(vec![op]), 1);
        assert!(t.posts[&1000].closed);
    }

    #[test]
    fn posts_iterate_in_id_order() {
        let mut t = thread();
        t.absorb(vec![post(1002, 300), post(1000, 100), post(1001, 200)]);
        let ids: Vec<u64> = t.posts.keys().copied().collect();
        assert_eq!(ids, vec![1000, 1001, 1002]);
    }
}
