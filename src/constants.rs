pub const RETRYABLE_STATUS_CODES: &[u16] = &[408, 429, 500, 502, 503, 504, 520];

/// Backoff defaults
pub const DEFAULT_BASE_DELAY_MS: u64 = 1_000;
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;

/// Reconnect budget for one job stream
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Retry budget for request/response calls (history fetch, send)
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Progress reduction
pub const META_DEFAULT_PCT: f64 = 10.0;
pub const PROGRESS_CEILING_PCT: f64 = 95.0;

/// How long a recoverable connection issue stays visible without further events
pub const DEFAULT_ERROR_GRACE_MS: u64 = 10_000;
/// Silence (no events, no heartbeats) after which a job stream is presumed dead
pub const DEFAULT_LIVENESS_TIMEOUT_MS: u64 = 45_000;
/// Lower bounds accepted by config validation
pub const MIN_ERROR_GRACE_MS: u64 = 100;
pub const MIN_LIVENESS_TIMEOUT_MS: u64 = 1_000;

/// HTTP client defaults
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Endpoint templates; `{job_id}` is substituted per stream
pub const EVENTS_PATH_TEMPLATE: &str = "/events/{job_id}";
pub const LEGACY_EVENTS_PATH_TEMPLATE: &str = "/upload/events/{job_id}";
pub const TRACE_QUERY_PARAM: &str = "t";

/// Wire sub-event names
pub const EVENT_META: &str = "meta";
pub const EVENT_PROGRESS: &str = "progress";
pub const EVENT_READY: &str = "ready";
pub const EVENT_FAILED: &str = "failed";
pub const EVENT_HEARTBEAT: &str = "heartbeat";
pub const EVENT_MESSAGE: &str = "message";

/// SSE framing limits
pub const MAX_SSE_LINE_BYTES: usize = 1024 * 1024;
pub const MAX_SSE_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Environment variable names read by `SyncConfig::from_env`
pub const ENV_BASE_URL: &str = "CHAT_SYNC_BASE_URL";
pub const ENV_LEGACY_EVENTS_PATH: &str = "CHAT_SYNC_LEGACY_EVENTS_PATH";
pub const ENV_BASE_DELAY_MS: &str = "CHAT_SYNC_BASE_DELAY_MS";
pub const ENV_MAX_DELAY_MS: &str = "CHAT_SYNC_MAX_DELAY_MS";
pub const ENV_MAX_RECONNECTS: &str = "CHAT_SYNC_MAX_RECONNECTS";
pub const ENV_RECONNECT: &str = "CHAT_SYNC_RECONNECT";
pub const ENV_MAX_RETRIES: &str = "CHAT_SYNC_MAX_RETRIES";
pub const ENV_ERROR_GRACE_MS: &str = "CHAT_SYNC_ERROR_GRACE_MS";
pub const ENV_LIVENESS_TIMEOUT_MS: &str = "CHAT_SYNC_LIVENESS_TIMEOUT_MS";
/// Bearer token sent on stream and chat requests, read by the binary only.
pub const ENV_AUTH_TOKEN: &str = "CHAT_SYNC_TOKEN";
