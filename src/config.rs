/// Default Bolt endpoint when neither flags nor an environment file name one
pub const DEFAULT_BOLT_URI: &str = "bolt://localhost:7687";

/// Default Neo4j user
pub const DEFAULT_USER: &str = "neo4j";

/// Default environment file consulted by the CLI
pub const DEFAULT_ENV_FILE: &str = "environments.toml";

/// Rows per UNWIND batch
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Writer partitions per target (label or relationship type)
pub const DEFAULT_WORKERS: usize = 4;

/// Batches buffered per partition channel before the producer blocks
pub const CHANNEL_BATCHES: usize = 2;

/// Raw records normalized together on the rayon pool
pub const NORMALIZE_CHUNK: usize = 2048;

/// Attempts for a retryable store failure (network, timeout, transient)
pub const STORE_MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff between retries
pub const RETRY_BASE_DELAY_MS: u64 = 250;

/// Attempts when establishing the initial connection
pub const CONNECT_MAX_RETRIES: u32 = 5;

/// Delay between connection attempts
pub const CONNECT_RETRY_DELAY_SECS: u64 = 2;

/// Per-operation timeout enforced by the Neo4j store
pub const STORE_OP_TIMEOUT_SECS: u64 = 120;

/// Nodes or relationships removed per delete transaction
pub const DELETE_BATCH_SIZE: i64 = 10_000;

/// Nodes sampled per label by the diff tool
pub const DEFAULT_SAMPLE_SIZE: usize = 10;

/// Exact phrase required before a full drop proceeds
pub const DROP_CONFIRMATION_PHRASE: &str = "DELETE ALL DATA";

/// Row-level failures kept verbatim in the ingest summary
pub const MAX_REPORTED_FAILURES: usize = 20;

/// Exit code when the diff tool finds differences
pub const EXIT_DIFFERENT: u8 = 1;

/// Exit code for any failure
pub const EXIT_FAILURE: u8 = 2;
