use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::{LinkError, SerialInterface};
use crate::stop::StopSignal;

const READ_CHUNK: usize = 128;
const MAX_PARTIAL_BYTES: usize = 8192;
const TRIMMED_PARTIAL_BYTES: usize = 4096;

/// Motion board control commands. Each encodes to one newline-terminated ASCII line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    Hold,
    Release,
    Zero,
    MoveTo(f64),
    Ping,
}

impl Command {
    /// Wire form including the trailing newline
    pub fn encode(&self) -> String {
        format!("{}\n", self)
    }

    /// Acknowledgement the firmware sends back, if any
    pub fn expected_token(&self) -> Option<Token> {
        match self {
            Command::MoveTo(_) => Some(Token::Done),
            Command::Ping => Some(Token::Pong),
            Command::Hold | Command::Release | Command::Zero => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Hold => f.write_str("H"),
            Command::Release => f.write_str("R"),
            Command::Zero => f.write_str("Z"),
            // Fixed notation only; the firmware parses with atof()
            Command::MoveTo(deg) => write!(f, "M{:.6}", deg),
            Command::Ping => f.write_str("P"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Token {
    Done,
    Pong,
}

impl Token {
    pub fn as_str(&self) -> &'static str {
        match self {
            Token::Done => "DONE",
            Token::Pong => "PONG",
        }
    }

    pub fn parse(line: &str) -> Option<Token> {
        match line.trim() {
            "DONE" => Some(Token::Done),
            "PONG" => Some(Token::Pong),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Timed out waiting for response")]
    Timeout,

    #[error("Wait cancelled by stop request")]
    Cancelled,

    #[error("Link closed")]
    LinkClosed,
}

/// The single outstanding request on a link.
#[derive(Debug, Clone, Copy)]
pub struct PendingResponse {
    pub expected: Token,
    pub deadline: Instant,
}

/// Splits an incoming byte stream into trimmed, non-empty lines.
///
/// Partial lines persist across pushes until their terminator arrives.
#[derive(Debug, Default)]
pub struct LineBuffer {
    partial: Vec<u8>,
    trims: u64,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.partial.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(pos) = self.partial.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.partial.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&raw[..pos]);
            let text = text.trim();
            if !text.is_empty() {
                lines.push(text.to_string());
            }
        }

        if self.partial.len() > MAX_PARTIAL_BYTES {
            let cut = self.partial.len() - TRIMMED_PARTIAL_BYTES;
            self.partial.drain(..cut);
            self.trims += 1;
        }

        lines
    }

    pub fn clear(&mut self) {
        self.partial.clear();
    }

    pub fn pending_bytes(&self) -> usize {
        self.partial.len()
    }

    pub fn trims(&self) -> u64 {
        self.trims
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProtocolMetrics {
    pub lines_read: u64,
    pub noise_lines: u64,
    pub requests_completed: u64,
    pub timeouts: u64,
    pub cancellations: u64,
    pub last_latency_ms: Option<u64>,
}

/// Text command protocol over one motion link.
///
/// Holds at most one [`PendingResponse`]; callers serialize access by owning
/// the engine behind a lock.
pub struct MotionProtocol {
    interface: SerialInterface,
    rx: LineBuffer,
    pending: Option<PendingResponse>,
    read_window_ms: u64,
    metrics: ProtocolMetrics,
}

impl MotionProtocol {
    pub fn new(interface: SerialInterface, read_window_ms: u64) -> Self {
        Self {
            interface,
            rx: LineBuffer::new(),
            pending: None,
            read_window_ms: read_window_ms.max(1),
            metrics: ProtocolMetrics::default(),
        }
    }

    /// Write one command line
    pub async fn send(&mut self, command: &Command) -> Result<(), LinkError> {
        log::debug!("-> {}", command);
        self.interface.send_data(command.encode().as_bytes()).await
    }

    /// Discard everything received so far so stale acknowledgements cannot
    /// satisfy the next request.
    pub async fn drain(&mut self) {
        self.rx.clear();
        if let Err(e) = self.interface.clear_input().await {
            log::debug!("Input clear failed, reading leftovers instead: {}", e);
            let mut buf = [0u8; READ_CHUNK];
            while let Ok(n) = self.interface.read_data(&mut buf, 1).await {
                if n == 0 {
                    break;
                }
            }
            self.rx.clear();
        }
    }

    /// Poll the link until `token` arrives, `timeout` elapses or `stop` is set.
    ///
    /// Lines that are not the expected token are discarded as noise.
    pub async fn await_token(
        &mut self,
        token: Token,
        timeout: Duration,
        stop: Option<&StopSignal>,
    ) -> Result<(), ProtocolError> {
        let started = Instant::now();
        self.pending = Some(PendingResponse {
            expected: token,
            deadline: started + timeout,
        });

        let result = self.wait_pending(token, started + timeout, stop).await;
        self.pending = None;

        match result {
            Ok(()) => {
                let latency = started.elapsed().as_millis() as u64;
                self.metrics.requests_completed += 1;
                self.metrics.last_latency_ms = Some(latency);
            }
            Err(ProtocolError::Timeout) => {
                self.metrics.timeouts += 1;
                log::warn!("{} not received within {:?}", token.as_str(), timeout);
            }
            Err(ProtocolError::Cancelled) => self.metrics.cancellations += 1,
            Err(_) => {}
        }
        result
    }

    async fn wait_pending(
        &mut self,
        token: Token,
        deadline: Instant,
        stop: Option<&StopSignal>,
    ) -> Result<(), ProtocolError> {
        loop {
            if stop.is_some_and(|s| s.is_set()) {
                return Err(ProtocolError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ProtocolError::Timeout);
            }

            let remaining = (deadline - now).as_millis() as u64;
            let window = self.read_window_ms.min(remaining.max(1));
            for line in self.read_lines(window).await? {
                if Token::parse(&line) == Some(token) {
                    return Ok(());
                }
                self.metrics.noise_lines += 1;
                log::debug!("<- (ignored) {}", line);
            }
        }
    }

    async fn read_lines(&mut self, window_ms: u64) -> Result<Vec<String>, ProtocolError> {
        let mut buf = [0u8; READ_CHUNK];
        match self.interface.read_data(&mut buf, window_ms).await {
            Ok(n) => {
                let lines = self.rx.push(&buf[..n]);
                self.metrics.lines_read += lines.len() as u64;
                Ok(lines)
            }
            Err(LinkError::Timeout) => Ok(Vec::new()),
            Err(e) => {
                log::warn!("Motion link read failed: {}", e);
                Err(ProtocolError::LinkClosed)
            }
        }
    }

    /// Drain, send `command` and wait for its acknowledgement token.
    pub async fn request(
        &mut self,
        command: Command,
        timeout: Duration,
        stop: Option<&StopSignal>,
    ) -> Result<(), ProtocolError> {
        // A wait whose future was dropped never cleared its slot; its token,
        // if it still arrives, is discarded by the drain below
        if let Some(abandoned) = self.pending.take() {
            log::debug!("Discarding abandoned wait for {}", abandoned.expected.as_str());
        }
        self.drain().await;
        self.send(&command).await.map_err(|e| {
            log::warn!("Failed to send {}: {}", command, e);
            ProtocolError::LinkClosed
        })?;

        match command.expected_token() {
            Some(token) => self.await_token(token, timeout, stop).await,
            None => Ok(()),
        }
    }

    pub async fn hold(&mut self) -> Result<(), LinkError> {
        self.send(&Command::Hold).await
    }

    pub async fn release(&mut self) -> Result<(), LinkError> {
        self.send(&Command::Release).await
    }

    pub async fn zero(&mut self) -> Result<(), LinkError> {
        self.send(&Command::Zero).await
    }

    pub async fn move_to(
        &mut self,
        deg: f64,
        timeout: Duration,
        stop: Option<&StopSignal>,
    ) -> Result<(), ProtocolError> {
        self.request(Command::MoveTo(deg), timeout, stop).await
    }

    pub async fn ping(&mut self, timeout: Duration) -> Result<(), ProtocolError> {
        self.request(Command::Ping, timeout, None).await
    }

    pub fn pending(&self) -> Option<PendingResponse> {
        self.pending
    }

    pub fn metrics(&self) -> &ProtocolMetrics {
        &self.metrics
    }

    pub fn interface_mut(&mut self) -> &mut SerialInterface {
        &mut self.interface
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_encode_to_single_lines() {
        assert_eq!(Command::Hold.encode(), "H\n");
        assert_eq!(Command::Release.encode(), "R\n");
        assert_eq!(Command::Zero.encode(), "Z\n");
        assert_eq!(Command::Ping.encode(), "P\n");
        assert_eq!(Command::MoveTo(45.0).encode(), "M45.000000\n");
        assert_eq!(Command::MoveTo(-2.5).encode(), "M-2.500000\n");
        assert_eq!(Command::MoveTo(355.0).encode(), "M355.000000\n");
    }

    #[test]
    fn only_move_and_ping_expect_tokens() {
        assert_eq!(Command::MoveTo(1.0).expected_token(), Some(Token::Done));
        assert_eq!(Command::Ping.expected_token(), Some(Token::Pong));
        assert_eq!(Command::Hold.expected_token(), None);
        assert_eq!(Command::Release.expected_token(), None);
        assert_eq!(Command::Zero.expected_token(), None);
    }

    #[test]
    fn token_parse_ignores_surrounding_whitespace_only() {
        assert_eq!(Token::parse("DONE"), Some(Token::Done));
        assert_eq!(Token::parse(" PONG\r"), Some(Token::Pong));
        assert_eq!(Token::parse("DONE moving"), None);
        assert_eq!(Token::parse("done"), None);
    }

    #[test]
    fn partial_lines_survive_across_pushes() {
        let mut rx = LineBuffer::new();
        assert!(rx.push(b"DO").is_empty());
        assert_eq!(rx.pending_bytes(), 2);
        assert_eq!(rx.push(b"NE\r\nstep 12\n\nPO"), vec!["DONE", "step 12"]);
        assert_eq!(rx.push(b"NG\n"), vec!["PONG"]);
        assert_eq!(rx.pending_bytes(), 0);
    }

    #[test]
    fn runaway_partial_line_is_trimmed() {
        let mut rx = LineBuffer::new();
        rx.push(&vec![b'x'; MAX_PARTIAL_BYTES + 1]);
        assert_eq!(rx.pending_bytes(), TRIMMED_PARTIAL_BYTES);
        assert_eq!(rx.trims(), 1);
    }
}
