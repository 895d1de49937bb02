/// Application name
pub const APP_NAME: &str = "Murmur";

/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// Symmetric key size in bytes (for XChaCha20-Poly1305)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Number of decimal digits in a client-generated temp id
pub const TEMP_ID_DIGITS: u32 = 9;

/// Maximum file transfer size in bytes (50 MiB)
pub const MAX_FILE_SIZE: u64 = 50 * 1024 * 1024;

/// Messages requested per history page
pub const DEFAULT_PAGE_SIZE: u32 = 30;

/// Minimum time after the initial load before "load more" may fire
pub const DEFAULT_HISTORY_DEBOUNCE_MS: u64 = 1_500;

/// Distance from the top of the log (in messages) that triggers a prefetch
pub const DEFAULT_PREFETCH_THRESHOLD: usize = 5;

/// How long a correlated request waits for its response
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;

/// Capacity of the outbound/inbound frame channels
pub const FRAME_CHANNEL_CAPACITY: usize = 256;

/// Upload pipeline progress markers (percent). These are stage markers,
/// not byte counts.
pub const PROGRESS_QUEUED: u8 = 10;
pub const PROGRESS_READ: u8 = 50;
pub const PROGRESS_SENT: u8 = 90;
pub const PROGRESS_DONE: u8 = 100;

/// Key derivation context (BLAKE3)
pub const KDF_CONTEXT_CONVERSATION_KEY: &str = "murmur-conversation-key-v1";
