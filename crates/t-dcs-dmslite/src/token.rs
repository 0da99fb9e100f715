//! ---
//! tdcs_section: "02-device-protocols"
//! tdcs_subsection: "module"
//! tdcs_type: "source"
//! tdcs_scope: "code"
//! tdcs_description: "Bounded token reader for XML documents."
//! tdcs_version: "v0.1.0"
//! tdcs_owner: "tbd"
//! ---
use std::time::Duration;

use t_dcs_core::channel::Channel;
use t_dcs_core::{CommError, Result};
use tokio::time::Instant;

/// Initial buffer allocation.
const BUFFER_SIZE: usize = 1024;

/// Hard cap on buffered bytes while hunting for a token. A peer that
/// streams more than this without a closing tag is broken.
pub const MAX_CAPACITY: usize = 16384;

/// Scans the byte stream for one `<Tag>...</Tag>` token.
///
/// The stream is not length-prefixed or delimited, so bytes are accumulated
/// until the closing tag appears, the overall timeout lapses, or the
/// capacity bound trips.
pub struct TokenStreamReader {
    buffer: String,
    capacity: usize,
}

impl Default for TokenStreamReader {
    fn default() -> Self {
        Self::new(MAX_CAPACITY)
    }
}

impl TokenStreamReader {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: String::with_capacity(BUFFER_SIZE),
            capacity,
        }
    }

    /// Discard anything buffered from a previous exchange.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Read until a complete `start`..`end` token is buffered and return it
    /// (tags included). Garbage before the start tag is dropped.
    pub async fn read_token(
        &mut self,
        channel: &mut dyn Channel,
        start: &str,
        end: &str,
        timeout: Duration,
    ) -> Result<String> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(token) = self.extract(start, end) {
                return Ok(token);
            }
            if self.buffer.len() >= self.capacity {
                return Err(CommError::Parsing("token buffer capacity exceeded".into()));
            }
            if Instant::now() >= deadline {
                return Err(CommError::Timeout);
            }
            let mut byte = [0u8; 1];
            match channel.read_exact(&mut byte).await {
                Ok(()) => self.buffer.push(byte[0] as char),
                // Per-read timeouts are shorter than the operation timeout;
                // keep waiting until the overall deadline.
                Err(CommError::Timeout) => continue,
                Err(err) => return Err(err),
            }
        }
    }

    fn extract(&mut self, start: &str, end: &str) -> Option<String> {
        let begin = self.buffer.find(start)?;
        if begin > 0 {
            self.buffer.drain(..begin);
        }
        let finish = self.buffer.find(end)? + end.len();
        let token = self.buffer[..finish].to_owned();
        self.buffer.drain(..finish);
        Some(token)
    }
}

#[cfg(test)]
mod tests {
    use t_dcs_core::channel::ScriptedChannel;

    use super::*;

    #[tokio::test]
    async fn token_is_extracted_with_leading_garbage_dropped() {
        let script = ScriptedChannel::new();
        script.push_read(b"garbage<DmsLite><StatusRespMsg/></DmsLite>trailing");
        let mut channel: Box<dyn Channel> = Box::new(script);
        let mut reader = TokenStreamReader::default();
        let token = reader
            .read_token(
                channel.as_mut(),
                "<DmsLite>",
                "</DmsLite>",
                Duration::from_secs(1),
            )
            .await
            .expect("token");
        assert_eq!(token, "<DmsLite><StatusRespMsg/></DmsLite>");
    }

    #[tokio::test]
    async fn capacity_overflow_is_a_parsing_error() {
        let script = ScriptedChannel::new();
        script.push_read(&vec![b'x'; 64]);
        let mut channel: Box<dyn Channel> = Box::new(script);
        let mut reader = TokenStreamReader::new(32);
        let err = reader
            .read_token(
                channel.as_mut(),
                "<DmsLite>",
                "</DmsLite>",
                Duration::from_secs(1),
            )
            .await
            .expect_err("overflow");
        assert!(matches!(err, CommError::Parsing(_)));
    }

    #[tokio::test]
    async fn starved_stream_times_out() {
        let script = ScriptedChannel::new();
        script.push_read(b"<DmsLite><unfinished>");
        let mut channel: Box<dyn Channel> = Box::new(script);
        let mut reader = TokenStreamReader::default();
        let err = reader
            .read_token(
                channel.as_mut(),
                "<DmsLite>",
                "</DmsLite>",
                Duration::from_millis(50),
            )
            .await
            .expect_err("timeout");
        assert!(matches!(err, CommError::Timeout));
    }
}
