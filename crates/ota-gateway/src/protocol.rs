//! Wire constants for the device-facing OTA protocol.
//!
//! Invitation (UDP, device port 8266):
//!   `<cmd> <tcp_port> <length> <md5_hex>\n` → reply of at most 37 bytes
//!
//! Push (TCP, device connects back to `tcp_port`):
//!   [chunk ≤1024 bytes] → ack ≤10 bytes, repeated until the image is sent,
//!   then one final ack ≤32 bytes once the device has verified and flashed.
//!
//! Every reply is accepted only if it starts with `OK`.

/// Well-known UDP port the device listens on for invitations.
pub const DEVICE_PORT: u16 = 8266;

/// Maximum payload bytes written per chunk.
pub const CHUNK_SIZE: usize = 1024;

/// Maximum invitation reply length.
pub const INVITE_RESPONSE_LEN: usize = 37;

/// Maximum per-chunk acknowledgment length.
pub const CHUNK_ACK_LEN: usize = 10;

/// Maximum final confirmation length.
pub const FINAL_ACK_LEN: usize = 32;

/// Prefix of every positive acknowledgment.
pub const ACK_OK: &[u8] = b"OK";

/// Whether a device response is a positive acknowledgment.
pub fn is_ok(response: &[u8]) -> bool {
    response.starts_with(ACK_OK)
}

/// Number of chunks needed to push `len` bytes.
pub fn chunk_count(len: usize) -> usize {
    len.div_ceil(CHUNK_SIZE)
}

/// Render raw device bytes for diagnostics: lossy text plus hex.
pub fn describe_response(raw: &[u8]) -> String {
    format!(
        "{:?} ({})",
        String::from_utf8_lossy(raw),
        hex::encode(raw)
    )
}
