use clap::{Parser, Subcommand};
use mlsync_core::SyncType;

#[derive(Parser)]
#[command(name = "mlsyncd", version, about = "MLS listing sync daemon")]
pub struct Cli {
    /// Config file (falls back to MLSYNC_CONFIG, then ~/.mlsync/mlsync.toml)
    #[arg(long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the scheduler, dispatcher and status endpoint until Ctrl-C
    Serve,

    /// Run one sync now, under the same lease the scheduler uses
    Sync {
        /// full, incremental or image-refresh
        sync_type: SyncType,

        #[arg(long, help = "Records (or listing keys) to process; defaults to sync.record_limit")]
        limit: Option<u32>,

        #[arg(long, help = "Image refresh: leave listings that already have media alone")]
        skip_existing: bool,

        #[arg(long, conflicts_with = "skip_existing", help = "Image refresh: replace existing media")]
        overwrite_media: bool,
    },

    /// Print cursors, leases, triggers and recent runs as JSON
    Status {
        #[arg(long, default_value_t = 20, help = "Number of recent runs to include")]
        runs: usize,
    },

    /// Move a cursor by hand and clear its watermark
    ResetCursor {
        sync_type: SyncType,

        #[arg(long, default_value_t = 0)]
        offset: u64,
    },
}

impl Commands {
    /// Commands that call AMPRE. These refuse to start on a broken config
    /// instead of running with default (empty) tokens.
    pub fn needs_feed(&self) -> bool {
        matches!(self, Commands::Serve | Commands::Sync { .. })
    }
}
