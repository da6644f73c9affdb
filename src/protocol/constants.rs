//! Chat Protocol Constants

// Frame delimiter
pub const FRAME_DELIMITER: u8 = b'\n';

// Client handshake, always the first frame on a connection
pub const HANDSHAKE_PREFIX: &str = "USERNAME:";

// Roster frame prefix
pub const ROSTER_PREFIX: &str = "USERS:";
pub const ROSTER_SEPARATOR: char = ',';

// Sent once to a client whose first frame is not a handshake
pub const HANDSHAKE_ERROR: &str = "Invalid handshake. Expected USERNAME:<yourname>";

// Sender label for relay announcements
pub const SERVER_SENDER: &str = "SERVER";

// Name used when the handshake carries an empty one
pub const DEFAULT_DISPLAY_NAME: &str = "Guest";
