use chrono::{DateTime, Utc};

/// Catalog entry describing one active thread on a board.
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadSummary {
    pub id: u64,
    pub last_modified: DateTime<Utc>,
    pub replies: u32,
    pub images: u32,
    pub subject: Option<String>,
    pub excerpt: Option<String>,
}

/// The catalog of one board: the ordered list of currently active threads.
///
/// Replaced wholesale on every successful poll; there is no incremental merge
/// at this layer.
#[derive(Debug, Clone)]
pub struct BoardCatalog {
    pub board: String,
    pub threads: Vec<ThreadSummary>,
    pub fetched_at: DateTime<Utc>,
}

impl BoardCatalog {
    pub fn new(board: impl Into<String>, mut threads: Vec<ThreadSummary>) -> Self {
        // Most recently bumped first.
        threads.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
        Self {
            board: board.into(),
            threads,
            fetched_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn summary(id: u64, modified: i64) -> ThreadSummary {
        ThreadSummary {
            id,
            last_modified: Utc.timestamp_opt(modified, 0).unwrap(),
            replies: 0,
            images: 0,
            subject: None,
            excerpt: None,
        }
    }

    #[test]
    fn catalog_orders_by_recency() {
        let catalog = BoardCatalog::new(
            "g",
            vec![summary(1, 100), summary(2, 300), summary(3, 200)],
        );
        let ids: Vec<u64> = catalog.threads.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }
}
