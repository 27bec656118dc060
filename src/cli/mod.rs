pub mod commands;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "eddy")]
#[command(about = "Headless imageboard thread watcher", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Fetch a thread once and print its posts
    Thread {
        /// Board the thread lives on, e.g. "g"
        board: String,
        /// Numeric thread id
        id: u64,
    },
    /// Fetch a board's catalog once and print it
    Catalog {
        /// Board to list, e.g. "g"
        board: String,
    },
    /// Watch threads and boards until interrupted
    Watch {
        /// Threads to watch, as BOARD/ID (e.g. g/12345)
        #[arg(value_name = "BOARD/ID")]
        threads: Vec<String>,

        /// Boards whose catalogs to watch
        #[arg(short, long)]
        boards: Vec<String>,

        /// Fetch thumbnails for new posts with media
        #[arg(long)]
        thumbs: bool,
    },
    /// Show media cache statistics
    Cache,
}
