// ---------------------------------------------------------------------------
// Runtime defaults
// ---------------------------------------------------------------------------

/// Config directory used when `UNWIND_CONFIG_DIR` is unset.
pub const DEFAULT_CONFIG_DIR: &str = "config";

/// Rolling log file name inside `app.logging.log_dir`.
pub const LOG_FILE_NAME: &str = "unwind.log";

/// Default tracing filter when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "pair_unwind=info,warn";

/// Paper venue ledger when `paper.ledger_file` is unset.
pub const DEFAULT_PAPER_LEDGER_FILE: &str = "state/paper_venues.json";

// ---------------------------------------------------------------------------
// Aggregator HTTP
// ---------------------------------------------------------------------------

/// Client-wide timeout; providers may set a tighter per-request one.
pub const HTTP_TIMEOUT_SECONDS: u64 = 10;

/// LRU capacity of the fill cache.
pub const DEFAULT_QUOTE_CACHE_SIZE: usize = 64;
