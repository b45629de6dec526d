use std::sync::LazyLock;

/// The maximum number of documents a single worker consumes per batch.
pub static BATCH_DOC_LIMIT: LazyLock<usize> =
	lazy_env_parse!("TIDEMARK_BATCH_DOC_LIMIT", usize, 4096);

/// The maximum number of accumulated source bytes per batch.
pub static BATCH_SIZE_LIMIT: LazyLock<usize> =
	lazy_env_parse!("TIDEMARK_BATCH_SIZE_LIMIT", usize, 4 * 1024 * 1024);

/// How many entries to fetch in one scan when paging over storage.
pub static NORMAL_FETCH_SIZE: LazyLock<u32> = lazy_env_parse!("TIDEMARK_FETCH_SIZE", u32, 500);

/// The schema version written into every index environment.
pub const SCHEMA_VERSION: u16 = 1;

/// How many consecutive non-transient write errors demote an index to Error.
pub const WRITE_ERRORS_LIMIT: u32 = 10;

/// How many recorded indexing errors the persisted ring retains.
pub const ERROR_RING_CAPACITY: usize = 50;

/// The longest token the analyzer accepts, in bytes.
pub const MAX_TERM_LENGTH: usize = 512;
