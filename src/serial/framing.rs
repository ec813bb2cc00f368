//! Reply frame recognition.
//!
//! The matcher is armed with the [`ResponseDescriptor`] of the command in
//! flight and fed every chunk the transport delivers. It reports a frame
//! once the suffix shows up within `max_length` bytes of the frame start.
//!
//! On overflow the whole buffer is dropped and the matcher disarms.
//! Nothing left over from a broken reply reaches the next command's frame.

use super::protocol::ResponseDescriptor;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchResult {
    /// No complete frame yet.
    Incomplete,
    /// A complete frame, prefix through suffix inclusive.
    Frame(Vec<u8>),
    /// `max_length` bytes arrived without a suffix; carries the dropped bytes.
    Overflow(Vec<u8>),
    /// Bytes arrived while no command was pending and were dropped.
    Unsolicited(usize),
}

#[derive(Debug, Default)]
pub struct FrameMatcher {
    descriptor: Option<ResponseDescriptor>,
    buffer: Vec<u8>,
}

impl FrameMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start matching replies for a new command. Any buffered bytes are dropped.
    pub fn arm(&mut self, descriptor: ResponseDescriptor) {
        self.buffer.clear();
        self.descriptor = Some(descriptor);
    }

    /// Stop matching and return whatever was buffered.
    pub fn disarm(&mut self) -> Vec<u8> {
        self.descriptor = None;
        std::mem::take(&mut self.buffer)
    }

    pub fn is_armed(&self) -> bool {
        self.descriptor.is_some()
    }

    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    pub fn push(&mut self, bytes: &[u8]) -> MatchResult {
        let Some(descriptor) = self.descriptor.as_ref() else {
            return MatchResult::Unsolicited(bytes.len());
        };
        self.buffer.extend_from_slice(bytes);

        let mut search_from = 0;
        if let Some(prefix) = descriptor.prefix.as_deref() {
            match find(&self.buffer, prefix) {
                Some(start) => {
                    self.buffer.drain(..start);
                    search_from = prefix.len();
                }
                None => {
                    // Keep a tail that could still be the start of the prefix.
                    let keep = prefix.len().saturating_sub(1).min(self.buffer.len());
                    let drop = self.buffer.len() - keep;
                    self.buffer.drain(..drop);
                    return MatchResult::Incomplete;
                }
            }
        }

        let window_end = self.buffer.len().min(descriptor.max_length);
        if window_end > search_from {
            if let Some(pos) = find(&self.buffer[search_from..window_end], &descriptor.suffix) {
                let end = search_from + pos + descriptor.suffix.len();
                let frame = self.buffer[..end].to_vec();
                self.disarm();
                return MatchResult::Frame(frame);
            }
        }

        if self.buffer.len() >= descriptor.max_length {
            return MatchResult::Overflow(self.disarm());
        }
        MatchResult::Incomplete
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
