use std::time::Duration;

/// Preferred number of headers served by a single historical sub-stream.
pub const DEFAULT_TARGET_BATCH_SIZE: u32 = 50_000;

/// Hard cap on concurrently open historical sub-streams.
pub const DEFAULT_MAX_PARALLEL_STREAMS: u32 = 6;

/// Transient transport failures tolerated per sub-stream before the run is
/// failed.
pub const DEFAULT_MAX_RETRIES: u32 = 10;

/// Base delay before the first retry of a failed sub-stream. Doubles on each
/// subsequent attempt, see [`crate::backoff`].
pub const DEFAULT_STREAM_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Buffer size of the reader event channel. Batches are individually
/// acknowledged, so this only needs to absorb lifecycle events.
pub const READER_EVENT_BUFFER: usize = 16;

/// Buffer size of the provider's consumer-facing broadcast channel.
pub const PROVIDER_EVENT_BUFFER: usize = 16;
