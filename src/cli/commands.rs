use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use crate::app::{AppContext, EddyError, Result};
use crate::cache::{MediaCache, MediaKind};
use crate::client::ApiClient;
use crate::config::Config;
use crate::domain::{Thread, ThreadKey};
use crate::poller::PollerEvent;

/// Parse a `board/id` thread spec like `g/12345`.
fn parse_thread_spec(spec: &str) -> Result<(String, u64)> {
    let (board, id) = spec
        .trim_matches('/')
        .split_once('/')
        .ok_or_else(|| EddyError::Other(format!("Invalid thread spec: {spec} (want BOARD/ID)")))?;
    let id = id
        .parse()
        .map_err(|_| EddyError::Other(format!("Invalid thread id in spec: {spec}")))?;
    Ok((board.to_string(), id))
}

fn excerpt(text: Option<&str>, width: usize) -> String {
    let text = text.unwrap_or("");
    let mut out: String = text.chars().take(width).collect();
    if text.chars().count() > width {
        out.push('…');
    }
    out
}

pub fn show_thread(config: &Config, board: &str, id: u64) -> Result<()> {
    let client = ApiClient::new(config.api_base_url.clone());
    let thread = Thread::new(
        board,
        id,
        &config.api_base_url,
        Duration::from_secs(config.min_poll_secs),
    );
    let posts = client.fetch_thread(&thread)?;

    println!("/{board}/{id}: {} posts", posts.len());
    for post in posts {
        let media = post
            .media
            .as_ref()
            .map(|m| format!(" [{}{}, {} bytes]", m.renamed, m.ext, m.size))
            .unwrap_or_default();
        println!(
            "  {} {} {}{}  {}",
            post.id,
            post.time.format("%Y-%m-%d %H:%M:%S"),
            post.author,
            media,
            excerpt(post.comment.as_deref(), 60),
        );
    }
    Ok(())
}

pub fn show_catalog(config: &Config, board: &str) -> Result<()> {
    let client = ApiClient::new(config.api_base_url.clone());
    let mut summaries = client.fetch_catalog(board)?;
    summaries.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));

    println!("/{board}/: {} active threads", summaries.len());
    for summary in summaries {
        println!(
            "  {} ({} replies, {} images)  {}",
            summary.id,
            summary.replies,
            summary.images,
            excerpt(
                summary.subject.as_deref().or(summary.excerpt.as_deref()),
                60
            ),
        );
    }
    Ok(())
}

pub fn cache_stats(config: &Config) -> Result<()> {
    let cache = MediaCache::open(config.cache_dir()?, config.flush_period())?;
    let stats = cache.stats();
    println!("Cache at {}", cache.root().display());
    println!("  {} records", stats.records);
    println!("  {} thumbnails", stats.thumbs);
    println!(
        "  {} full images ({:.1} MiB)",
        stats.images,
        stats.image_bytes as f64 / (1024.0 * 1024.0)
    );
    cache.shutdown();
    Ok(())
}

/// Watch threads and catalogs, printing updates until Ctrl-C.
pub fn watch(ctx: &AppContext, threads: &[String], boards: &[String], thumbs: bool) -> Result<()> {
    if threads.is_empty() && boards.is_empty() {
        return Err(EddyError::Other(
            "Nothing to watch: give at least one BOARD/ID or --boards".into(),
        ));
    }

    for spec in threads {
        let (board, id) = parse_thread_spec(spec)?;
        ctx.poller.add_thread(&board, id);
    }
    for board in boards {
        ctx.poller.add_catalog_board(board);
    }
    ctx.poller.update_threads();
    ctx.poller.update_catalogs();

    // A tiny runtime on the side flips `running` on Ctrl-C.
    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        std::thread::spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("Failed to build signal runtime");
            rt.block_on(async {
                let _ = tokio::signal::ctrl_c().await;
            });
            running.store(false, Ordering::SeqCst);
        });
    }

    println!(
        "Watching {} thread(s) and {} board(s); Ctrl-C to stop.",
        threads.len(),
        boards.len()
    );

    // Highest post id already reported per thread, so each poll only
    // announces genuinely new posts.
    let mut reported: HashMap<ThreadKey, u64> = HashMap::new();

    while running.load(Ordering::SeqCst) {
        match ctx.poller_events.recv_timeout(Duration::from_millis(200)) {
            Ok(PollerEvent::ThreadsUpdated) => {
                while let Some(key) = ctx.poller.pop_updated_thread() {
                    handle_thread_update(ctx, &key, &mut reported, thumbs);
                }
            }
            Ok(PollerEvent::CatalogsUpdated) => {
                while let Some(board) = ctx.poller.pop_updated_catalog_board() {
                    if let Some(catalog) = ctx.poller.catalog_snapshot(&board) {
                        println!("/{board}/ catalog: {} active threads", catalog.threads.len());
                    }
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }

        while ctx.media_events.try_recv().is_ok() {
            for update in ctx.fetcher.drain_completed() {
                println!("  media {} {:?}: {:?}", update.hash, update.kind, update.status);
            }
        }
    }

    println!("Stopping...");
    ctx.shutdown();
    Ok(())
}

fn handle_thread_update(
    ctx: &AppContext,
    key: &ThreadKey,
    reported: &mut HashMap<ThreadKey, u64>,
    thumbs: bool,
) {
    let Some(snapshot) = ctx.poller.thread_snapshot(key) else {
        println!("{key} is gone (404), no longer watching");
        reported.remove(key);
        return;
    };

    let watermark = reported.get(key).copied().unwrap_or(0);
    let fresh: Vec<_> = snapshot
        .posts
        .values()
        .filter(|p| p.id > watermark)
        .collect();
    if fresh.is_empty() {
        return;
    }

    println!("{key}: {} new post(s)", fresh.len());
    for post in &fresh {
        println!(
            "  {} {}  {}",
            post.id,
            post.author,
            excerpt(post.comment.as_deref(), 60)
        );
        if let Some(media) = post.media.as_ref() {
            ctx.cache.note_post(&key.board, post);
            if thumbs {
                ctx.fetcher.request(
                    media.hash,
                    media.thumb_url(&ctx.config.media_base_url, &key.board),
                    MediaKind::Thumbnail,
                );
            }
        }
    }
    if let Some(max) = fresh.iter().map(|p| p.id).max() {
        reported.insert(key.clone(), max);
    }
}
