//! Framed message channel over shared memory.
//!
//! Messages are length-prefixed frames in a circular slot region. Payloads
//! above the compression threshold are lz4-compressed before framing; an
//! optional per-message checksum is verified on receive. Batched send and
//! receive take the channel lock once per batch.

use std::time::{Duration, Instant};

use gonex_core::{GonexError, GonexResult};

use crate::atomic_cell::{AtomicCell, CellMutex};
use crate::buffer::{BufferFlags, SharedMemoryBuffer};

const PARK_SLICE: Duration = Duration::from_millis(10);

/// Frame flag: payload is lz4-compressed.
const FRAME_COMPRESSED: u8 = 1;

/// Per-frame header: stored length (4) + flags (1) + checksum (4).
const FRAME_HEADER: usize = 9;

/// Options accepted by [`SharedChannel::with_options`].
#[derive(Debug, Clone)]
pub struct SharedChannelOptions {
    /// Message slots in the ring.
    pub capacity: usize,
    /// Largest accepted payload (pre-compression), in bytes.
    pub max_message_size: usize,
    /// Verify a per-message checksum on receive.
    pub enable_checksum: bool,
    /// Compress payloads larger than this many bytes; 0 compresses
    /// everything, `usize::MAX` nothing.
    pub compression_threshold: usize,
    pub name: Option<String>,
}

impl Default for SharedChannelOptions {
    fn default() -> Self {
        Self {
            capacity: 64,
            max_message_size: 64 * 1024,
            enable_checksum: false,
            compression_threshold: 4 * 1024,
            name: None,
        }
    }
}

/// Occupancy and back-pressure view of a [`SharedChannel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedChannelState {
    pub length: usize,
    pub capacity: usize,
    pub is_full: bool,
    pub is_empty: bool,
    pub waiting_senders: usize,
    pub waiting_receivers: usize,
}

/// A framed byte channel shared across threads.
pub struct SharedChannel {
    mutex: CellMutex,
    generation: AtomicCell,
    head: AtomicCell,
    tail: AtomicCell,
    size: AtomicCell,
    waiting_senders: AtomicCell,
    waiting_receivers: AtomicCell,
    capacity: usize,
    max_message_size: usize,
    enable_checksum: bool,
    compression_threshold: usize,
    slot_size: usize,
    buffer: SharedMemoryBuffer,
    name: Option<String>,
}

impl SharedChannel {
    pub fn new(capacity: usize, max_message_size: usize) -> GonexResult<Self> {
        Self::with_options(SharedChannelOptions {
            capacity,
            max_message_size,
            ..SharedChannelOptions::default()
        })
    }

    pub fn with_options(options: SharedChannelOptions) -> GonexResult<Self> {
        if options.capacity == 0 || options.max_message_size == 0 {
            return Err(GonexError::InvalidBufferSize { value: 0 });
        }
        // Compressed payloads that grow are stored raw, so a slot never
        // needs more than the original size.
        let slot_size = FRAME_HEADER + options.max_message_size;
        Ok(Self {
            mutex: CellMutex::new(),
            generation: AtomicCell::new(0),
            head: AtomicCell::new(0),
            tail: AtomicCell::new(0),
            size: AtomicCell::new(0),
            waiting_senders: AtomicCell::new(0),
            waiting_receivers: AtomicCell::new(0),
            capacity: options.capacity,
            max_message_size: options.max_message_size,
            enable_checksum: options.enable_checksum,
            compression_threshold: options.compression_threshold,
            slot_size,
            buffer: SharedMemoryBuffer::allocate(
                options.capacity * slot_size,
                BufferFlags::empty(),
            ),
            name: options.name,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.size.load() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Blocking send; `ChannelTimeout` when the ring stays full past the
    /// deadline.
    pub fn send(&self, data: &[u8], timeout: Option<Duration>) -> GonexResult<()> {
        self.check_message(data)?;
        let deadline = timeout.map(|d| Instant::now() + d);
        self.waiting_senders.fetch_add(1);
        let result = self.send_inner(data, deadline, timeout);
        self.waiting_senders.fetch_sub(1);
        result
    }

    /// Blocking receive; `ChannelTimeout` when nothing arrives in time.
    pub fn receive(&self, timeout: Option<Duration>) -> GonexResult<Vec<u8>> {
        let deadline = timeout.map(|d| Instant::now() + d);
        self.waiting_receivers.fetch_add(1);
        let result = self.receive_inner(deadline, timeout);
        self.waiting_receivers.fetch_sub(1);
        result
    }

    /// Non-blocking send; `ChannelBufferFull` when no slot is free.
    pub fn try_send(&self, data: &[u8]) -> GonexResult<()> {
        self.check_message(data)?;
        self.mutex.lock();
        let result = self.push_frame_locked(data);
        self.mutex.unlock();
        result
    }

    /// Non-blocking receive; `None` when the ring is empty.
    pub fn try_receive(&self) -> GonexResult<Option<Vec<u8>>> {
        self.mutex.lock();
        let result = if self.size.load() > 0 {
            self.pop_frame_locked().map(Some)
        } else {
            Ok(None)
        };
        self.mutex.unlock();
        result
    }

    /// Send every message, taking the lock once per burst of free slots.
    pub fn send_batch(&self, messages: &[&[u8]], timeout: Option<Duration>) -> GonexResult<()> {
        for m in messages {
            self.check_message(m)?;
        }
        let deadline = timeout.map(|d| Instant::now() + d);
        self.waiting_senders.fetch_add(1);
        let mut sent = 0;
        let result = loop {
            let gen_before = {
                self.mutex.lock();
                while sent < messages.len() && (self.size.load() as usize) < self.capacity {
                    if let Err(e) = self.push_frame_locked(messages[sent]) {
                        self.mutex.unlock();
                        self.waiting_senders.fetch_sub(1);
                        return Err(e);
                    }
                    sent += 1;
                }
                let g = self.generation.load();
                self.mutex.unlock();
                g
            };
            if sent == messages.len() {
                break Ok(());
            }
            if !self.park(gen_before, deadline) {
                break Err(timeout_error(timeout));
            }
        };
        self.waiting_senders.fetch_sub(1);
        result
    }

    /// Receive up to `max` messages: blocks for the first, then drains
    /// whatever else is ready under the same lock.
    pub fn receive_batch(
        &self,
        max: usize,
        timeout: Option<Duration>,
    ) -> GonexResult<Vec<Vec<u8>>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let first = self.receive(timeout)?;
        let mut out = vec![first];
        self.mutex.lock();
        while out.len() < max && self.size.load() > 0 {
            match self.pop_frame_locked() {
                Ok(m) => out.push(m),
                Err(e) => {
                    self.mutex.unlock();
                    return Err(e);
                }
            }
        }
        self.mutex.unlock();
        Ok(out)
    }

    /// Occupancy and back-pressure snapshot.
    pub fn state(&self) -> SharedChannelState {
        let length = self.len();
        SharedChannelState {
            length,
            capacity: self.capacity,
            is_full: length == self.capacity,
            is_empty: length == 0,
            waiting_senders: self.waiting_senders.load() as usize,
            waiting_receivers: self.waiting_receivers.load() as usize,
        }
    }

    /// Healthy when the region header validates and the ring counters are
    /// mutually consistent.
    pub fn is_healthy(&self) -> bool {
        if self.buffer.validate_header().is_err() {
            return false;
        }
        self.mutex.with(|| {
            let (head, tail, size) = (self.head.load(), self.tail.load(), self.size.load());
            let cap = self.capacity as u32;
            size <= cap && (head + size) % cap == tail % cap
        })
    }

    fn send_inner(
        &self,
        data: &[u8],
        deadline: Option<Instant>,
        timeout: Option<Duration>,
    ) -> GonexResult<()> {
        loop {
            let gen_before = {
                self.mutex.lock();
                if (self.size.load() as usize) < self.capacity {
                    let r = self.push_frame_locked(data);
                    self.mutex.unlock();
                    return r;
                }
                let g = self.generation.load();
                self.mutex.unlock();
                g
            };
            if !self.park(gen_before, deadline) {
                return Err(timeout_error(timeout));
            }
        }
    }

    fn receive_inner(
        &self,
        deadline: Option<Instant>,
        timeout: Option<Duration>,
    ) -> GonexResult<Vec<u8>> {
        loop {
            let gen_before = {
                self.mutex.lock();
                if self.size.load() > 0 {
                    let r = self.pop_frame_locked();
                    self.mutex.unlock();
                    return r;
                }
                let g = self.generation.load();
                self.mutex.unlock();
                g
            };
            if !self.park(gen_before, deadline) {
                return Err(timeout_error(timeout));
            }
        }
    }

    /// Encode and write one frame at the tail. Caller holds the lock and
    /// has verified a slot is free.
    fn push_frame_locked(&self, data: &[u8]) -> GonexResult<()> {
        if (self.size.load() as usize) >= self.capacity {
            return Err(GonexError::ChannelBufferFull {
                capacity: self.capacity,
            });
        }
        let checksum = if self.enable_checksum {
            fnv32(data)
        } else {
            0
        };
        let mut flags = 0u8;
        let stored: Vec<u8>;
        let payload: &[u8] = if data.len() > self.compression_threshold {
            stored = lz4::block::compress(data, None, true).map_err(|e| {
                GonexError::SerializationFailed {
                    message: format!("lz4 compress: {e}"),
                }
            })?;
            if stored.len() < data.len() {
                flags |= FRAME_COMPRESSED;
                &stored
            } else {
                // Compression did not pay off; store raw.
                data
            }
        } else {
            data
        };

        let offset = self.tail.load() as usize * self.slot_size;
        let mut header = [0u8; FRAME_HEADER];
        header[..4].copy_from_slice(&(payload.len() as u32).to_be_bytes());
        header[4] = flags;
        header[5..9].copy_from_slice(&checksum.to_be_bytes());
        self.buffer.write(offset, &header)?;
        self.buffer.write(offset + FRAME_HEADER, payload)?;

        self.tail
            .store((self.tail.load() + 1) % self.capacity as u32);
        self.size.fetch_add(1);
        self.generation.fetch_add(1);
        Ok(())
    }

    /// Read and decode the frame at the head. Caller holds the lock and has
    /// verified the ring is non-empty.
    fn pop_frame_locked(&self) -> GonexResult<Vec<u8>> {
        let offset = self.head.load() as usize * self.slot_size;
        let header = self.buffer.read(offset, FRAME_HEADER)?;
        let stored_len =
            u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let flags = header[4];
        let checksum = u32::from_be_bytes([header[5], header[6], header[7], header[8]]);
        if stored_len > self.slot_size - FRAME_HEADER {
            return Err(GonexError::Internal {
                message: format!("corrupt frame length {stored_len}"),
            });
        }
        let stored = self.buffer.read(offset + FRAME_HEADER, stored_len)?;
        let data = if flags & FRAME_COMPRESSED != 0 {
            lz4::block::decompress(&stored, None).map_err(|e| GonexError::SerializationFailed {
                message: format!("lz4 decompress: {e}"),
            })?
        } else {
            stored
        };
        if self.enable_checksum {
            let actual = fnv32(&data);
            if actual != checksum {
                return Err(GonexError::ChecksumMismatch {
                    expected: checksum,
                    actual,
                });
            }
        }
        self.head
            .store((self.head.load() + 1) % self.capacity as u32);
        self.size.fetch_sub(1);
        self.generation.fetch_add(1);
        Ok(data)
    }

    fn check_message(&self, data: &[u8]) -> GonexResult<()> {
        if data.len() > self.max_message_size {
            return Err(GonexError::InvalidBufferSize {
                value: data.len() as i64,
            });
        }
        Ok(())
    }

    fn park(&self, gen_before: u32, deadline: Option<Instant>) -> bool {
        let slice = match deadline {
            Some(d) => {
                let now = Instant::now();
                if now >= d {
                    return false;
                }
                PARK_SLICE.min(d - now)
            }
            None => PARK_SLICE,
        };
        self.generation.wait_until_changed(gen_before, Some(slice));
        match deadline {
            Some(d) => Instant::now() < d,
            None => true,
        }
    }

}

fn timeout_error(timeout: Option<Duration>) -> GonexError {
    GonexError::ChannelTimeout {
        timeout_ms: timeout.map(|d| d.as_millis() as i64).unwrap_or(-1),
    }
}

fn fnv32(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &b in bytes {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_send_receive_round_trip() {
        let ch = SharedChannel::new(4, 128).unwrap();
        ch.try_send(b"hello").unwrap();
        assert_eq!(ch.len(), 1);
        assert_eq!(ch.try_receive().unwrap(), Some(b"hello".to_vec()));
        assert_eq!(ch.try_receive().unwrap(), None);
    }

    #[test]
    fn test_compression_above_threshold() {
        let ch = SharedChannel::with_options(SharedChannelOptions {
            capacity: 2,
            max_message_size: 64 * 1024,
            enable_checksum: true,
            compression_threshold: 128,
            name: None,
        })
        .unwrap();
        // Highly compressible and larger than the threshold.
        let message = vec![7u8; 10_000];
        ch.try_send(&message).unwrap();
        assert_eq!(ch.try_receive().unwrap(), Some(message));
    }

    #[test]
    fn test_checksum_round_trip() {
        let ch = SharedChannel::with_options(SharedChannelOptions {
            capacity: 4,
            max_message_size: 256,
            enable_checksum: true,
            compression_threshold: usize::MAX,
            name: None,
        })
        .unwrap();
        ch.try_send(b"checked").unwrap();
        assert_eq!(ch.try_receive().unwrap(), Some(b"checked".to_vec()));
    }

    #[test]
    fn test_full_and_oversize_rejections() {
        let ch = SharedChannel::new(1, 16).unwrap();
        ch.try_send(b"x").unwrap();
        assert_eq!(
            ch.try_send(b"y").unwrap_err().kind(),
            gonex_core::ErrorKind::ChannelBufferFull
        );
        assert_eq!(
            ch.try_send(&[0u8; 64]).unwrap_err().kind(),
            gonex_core::ErrorKind::InvalidBufferSize
        );
    }

    #[test]
    fn test_batch_send_receive() {
        let ch = SharedChannel::new(8, 32).unwrap();
        ch.send_batch(
            &[b"a".as_slice(), b"bb", b"ccc"],
            Some(Duration::from_secs(1)),
        )
        .unwrap();
        assert_eq!(ch.len(), 3);
        let got = ch.receive_batch(10, Some(Duration::from_secs(1))).unwrap();
        assert_eq!(got, vec![b"a".to_vec(), b"bb".to_vec(), b"ccc".to_vec()]);
        assert!(ch.is_empty());
    }

    #[test]
    fn test_blocking_send_waits_for_drain() {
        let ch = Arc::new(SharedChannel::new(1, 32).unwrap());
        ch.try_send(b"first").unwrap();
        let sender = {
            let ch = ch.clone();
            thread::spawn(move || ch.send(b"second", Some(Duration::from_secs(5))))
        };
        thread::sleep(Duration::from_millis(30));
        assert_eq!(ch.receive(Some(Duration::from_secs(1))).unwrap(), b"first");
        sender.join().ok();
        assert_eq!(ch.receive(Some(Duration::from_secs(1))).unwrap(), b"second");
    }

    #[test]
    fn test_state_reports_waiters() {
        let ch = Arc::new(SharedChannel::new(4, 32).unwrap());
        let receiver = {
            let ch = ch.clone();
            thread::spawn(move || ch.receive(Some(Duration::from_millis(500))))
        };
        thread::sleep(Duration::from_millis(50));
        let state = ch.state();
        assert_eq!(state.waiting_receivers, 1);
        assert_eq!(state.waiting_senders, 0);
        assert!(state.is_empty);
        ch.try_send(b"unblock").unwrap();
        receiver.join().ok();
        assert_eq!(ch.state().waiting_receivers, 0);
    }

    #[test]
    fn test_health() {
        let ch = SharedChannel::new(4, 32).unwrap();
        assert!(ch.is_healthy());
        ch.try_send(b"a").unwrap();
        ch.try_send(b"b").unwrap();
        ch.try_receive().unwrap();
        assert!(ch.is_healthy());
    }
}
