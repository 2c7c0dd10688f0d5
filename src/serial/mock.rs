//! Simulated motion board firmware.
//!
//! Speaks the same line protocol as the real board: `H`/`R`/`Z` are silent,
//! `M<deg>` answers `DONE` after the configured move time and `P` answers
//! `PONG`. Faults (unplugged cable, a move that never completes, debug chatter)
//! are switched on through [`MockDeviceHandle`].

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::protocol::LineBuffer;
use super::{LinkError, Result, SerialPortIO};

#[derive(Debug)]
struct MockState {
    received: Vec<String>,
    outbox: VecDeque<(Instant, Vec<u8>)>,
    rx: LineBuffer,
    unplugged: bool,
    answer_pings: bool,
    silent_moves: HashSet<usize>,
    noise: Option<String>,
    move_time: Duration,
    moves: usize,
    holding: bool,
    position_deg: f64,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            received: Vec::new(),
            outbox: VecDeque::new(),
            rx: LineBuffer::new(),
            unplugged: false,
            answer_pings: true,
            silent_moves: HashSet::new(),
            noise: None,
            move_time: Duration::from_millis(5),
            moves: 0,
            holding: false,
            position_deg: 0.0,
        }
    }
}

impl MockState {
    fn queue(&mut self, at: Instant, line: &str) {
        self.outbox.push_back((at, format!("{}\n", line).into_bytes()));
    }

    fn handle_line(&mut self, line: &str) {
        self.received.push(line.to_string());
        let now = Instant::now();
        if let Some(noise) = self.noise.clone() {
            self.queue(now, &noise);
        }

        match line.chars().next() {
            Some('H') => self.holding = true,
            Some('R') => self.holding = false,
            Some('Z') => self.position_deg = 0.0,
            Some('P') => {
                if self.answer_pings {
                    self.queue(now, "PONG");
                }
            }
            Some('M') => {
                let ordinal = self.moves;
                self.moves += 1;
                if let Ok(target) = line[1..].parse::<f64>() {
                    self.position_deg = target;
                }
                if !self.silent_moves.contains(&ordinal) {
                    let at = now + self.move_time;
                    self.queue(at, "DONE");
                }
            }
            _ => self.queue(now, "ERR unknown command"),
        }
    }
}

/// Cloneable view onto a [`MockDevice`] for scripting faults and inspecting traffic.
#[derive(Debug, Clone, Default)]
pub struct MockDeviceHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockDeviceHandle {
    fn with<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    /// Every command line received so far, in order
    pub fn commands(&self) -> Vec<String> {
        self.with(|s| s.received.clone())
    }

    pub fn clear_commands(&self) {
        self.with(|s| s.received.clear());
    }

    pub fn set_unplugged(&self, unplugged: bool) {
        self.with(|s| {
            s.unplugged = unplugged;
            s.outbox.clear();
        });
    }

    pub fn is_unplugged(&self) -> bool {
        self.with(|s| s.unplugged)
    }

    pub fn set_answer_pings(&self, answer: bool) {
        self.with(|s| s.answer_pings = answer);
    }

    /// The `ordinal`-th move (0-based, counted since creation) never reports `DONE`.
    pub fn never_finish_move(&self, ordinal: usize) {
        self.with(|s| {
            s.silent_moves.insert(ordinal);
        });
    }

    /// Debug text emitted ahead of every response
    pub fn set_noise(&self, noise: Option<&str>) {
        self.with(|s| s.noise = noise.map(str::to_string));
    }

    pub fn set_move_time(&self, move_time: Duration) {
        self.with(|s| s.move_time = move_time);
    }

    pub fn is_holding(&self) -> bool {
        self.with(|s| s.holding)
    }

    pub fn position_deg(&self) -> f64 {
        self.with(|s| s.position_deg)
    }

    pub fn moves(&self) -> usize {
        self.with(|s| s.moves)
    }
}

pub struct MockDevice {
    handle: MockDeviceHandle,
}

impl MockDevice {
    pub fn new() -> (Self, MockDeviceHandle) {
        let handle = MockDeviceHandle::default();
        (Self::attach(handle.clone()), handle)
    }

    /// Another connection to the same simulated board (used after a reconnect)
    pub fn attach(handle: MockDeviceHandle) -> Self {
        Self { handle }
    }
}

fn unplugged_error() -> LinkError {
    LinkError::IoError(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        "device unplugged",
    ))
}

#[async_trait]
impl SerialPortIO for MockDevice {
    async fn send_data(&mut self, data: &[u8]) -> Result<()> {
        self.handle.with(|s| {
            if s.unplugged {
                return Err(unplugged_error());
            }
            for line in s.rx.push(data) {
                s.handle_line(&line);
            }
            Ok(())
        })
    }

    async fn read_data(&mut self, buf: &mut [u8], timeout_ms: u64) -> Result<usize> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            let step = self.handle.with(|s| {
                if s.unplugged {
                    return Err(unplugged_error());
                }
                let now = Instant::now();
                match s.outbox.front_mut() {
                    Some((at, bytes)) if *at <= now => {
                        let n = bytes.len().min(buf.len());
                        buf[..n].copy_from_slice(&bytes[..n]);
                        bytes.drain(..n);
                        if bytes.is_empty() {
                            s.outbox.pop_front();
                        }
                        Ok(Some(n))
                    }
                    _ => Ok(None),
                }
            })?;

            if let Some(n) = step {
                return Ok(n);
            }
            if Instant::now() >= deadline {
                return Err(LinkError::Timeout);
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    async fn clear_input(&mut self) -> Result<()> {
        // Only bytes already due are discarded; a move still in flight keeps its DONE.
        self.handle.with(|s| {
            let now = Instant::now();
            s.outbox.retain(|(at, _)| *at > now);
        });
        Ok(())
    }
}
