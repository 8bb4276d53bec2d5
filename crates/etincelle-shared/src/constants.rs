/// Application name
pub const APP_NAME: &str = "Étincelle";

/// Diamond cost of a text message send
pub const TEXT_SEND_COST: u64 = 100;

/// Diamond cost of an image message send
pub const IMAGE_SEND_COST: u64 = 500;

/// Maximum text message length in characters
pub const MAX_MESSAGE_LEN: usize = 4096;

/// Separator between the two sorted participant ids in a conversation key.
/// User ids containing this character are rejected at parse time; that is
/// what keeps the key injective for distinct unordered pairs.
pub const CONVERSATION_KEY_SEPARATOR: char = ':';

/// Number of messages per history page
pub const DEFAULT_PAGE_SIZE: u32 = 50;

/// Hard cap on the client-side in-memory message window per conversation
pub const MESSAGE_WINDOW_CAP: usize = 1000;

/// Maximum length of the chat-list preview text
pub const PREVIEW_MAX_LEN: usize = 80;

/// Preview placeholder for image messages
pub const IMAGE_PREVIEW: &str = "[photo]";

/// Default HTTP API port (server)
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// How often a connected client sends a heartbeat frame
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// How long the server tolerates a silent handle before reaping it
pub const HANDLE_TIMEOUT_SECS: u64 = 90;

/// Reconnect backoff: initial delay
pub const RECONNECT_BASE_DELAY_MS: u64 = 1_000;

/// Reconnect backoff: delay ceiling
pub const RECONNECT_MAX_DELAY_MS: u64 = 30_000;

/// Reconnect backoff: attempts before parking in Disconnected
pub const RECONNECT_MAX_ATTEMPTS: u32 = 8;

/// Hard timeout on the read-acknowledgment call; past this the ack is
/// abandoned and the unread state heals on the next full refetch.
pub const READ_ACK_TIMEOUT_MS: u64 = 3_000;
