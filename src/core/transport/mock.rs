//! Scripted in-memory serial link for tests and hardware-free development
//!
//! Responses are canned per request frame; each read call delivers one
//! chunk, so trickled and short deliveries are both expressible.

use super::{SerialLink, TransportError};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

#[derive(Default)]
struct MockInner {
    baudrate: u32,
    open: bool,
    /// Scripted responses per request frame, consumed front to back
    scripts: HashMap<Vec<u8>, VecDeque<Vec<Vec<u8>>>>,
    /// Chunks queued for delivery to subsequent reads
    pending: VecDeque<Vec<u8>>,
    /// Every frame written, in order
    written: Vec<Vec<u8>>,
    open_count: usize,
    fail_writes: usize,
}

/// In-memory [`SerialLink`] returning canned bytes keyed by request frame
///
/// Clones share state, so a test can keep a handle for scripting and
/// inspection after moving another into the client.
#[derive(Clone)]
pub struct MockLink {
    name: String,
    inner: Arc<Mutex<MockInner>>,
}

impl MockLink {
    /// Create a closed mock link
    pub fn new(name: &str, baudrate: u32) -> Self {
        Self {
            name: name.to_string(),
            inner: Arc::new(Mutex::new(MockInner {
                baudrate,
                ..MockInner::default()
            })),
        }
    }

    /// Queue `response` to be delivered in one chunk when `request` is written
    pub fn script(&self, request: &[u8], response: &[u8]) {
        self.script_chunks(request, &[response]);
    }

    /// Queue a response delivered as multiple read chunks
    pub fn script_chunks(&self, request: &[u8], chunks: &[&[u8]]) {
        let mut inner = self.inner.lock();
        inner
            .scripts
            .entry(request.to_vec())
            .or_default()
            .push_back(chunks.iter().map(|c| c.to_vec()).collect());
    }

    /// Make the next `count` writes fail with an I/O error
    pub fn fail_writes(&self, count: usize) {
        self.inner.lock().fail_writes = count;
    }

    /// Frames written so far
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.inner.lock().written.clone()
    }

    /// Number of times the link has been opened
    pub fn open_count(&self) -> usize {
        self.inner.lock().open_count
    }
}

impl SerialLink for MockLink {
    fn open(&mut self) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        inner.open = true;
        inner.open_count += 1;
        Ok(())
    }

    fn close(&mut self) {
        self.inner.lock().open = false;
    }

    fn is_open(&self) -> bool {
        self.inner.lock().open
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn baudrate(&self) -> u32 {
        self.inner.lock().baudrate
    }

    fn set_baudrate(&mut self, baudrate: u32) -> Result<(), TransportError> {
        self.inner.lock().baudrate = baudrate;
        Ok(())
    }

    fn read_available(&mut self, buf: &mut Vec<u8>) -> Result<usize, TransportError> {
        let mut inner = self.inner.lock();
        if !inner.open {
            return Err(TransportError::NotConnected);
        }
        match inner.pending.pop_front() {
            Some(chunk) => {
                buf.extend_from_slice(&chunk);
                Ok(chunk.len())
            }
            None => Ok(0),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        if !inner.open {
            return Err(TransportError::NotConnected);
        }
        if inner.fail_writes > 0 {
            inner.fail_writes -= 1;
            return Err(TransportError::Io(std::io::Error::other("injected write failure")));
        }
        inner.written.push(data.to_vec());
        if let Some(queue) = inner.scripts.get_mut(data) {
            if let Some(chunks) = queue.pop_front() {
                inner.pending.extend(chunks);
            }
        }
        Ok(())
    }

    fn flush_input(&mut self) -> Result<(), TransportError> {
        self.inner.lock().pending.clear();
        Ok(())
    }

    fn flush_output(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_exchange() {
        let mut link = MockLink::new("mock0", 9600);
        link.open().unwrap();
        link.script(&[0x01, 0x02], &[0xAA, 0xBB]);

        link.write_all(&[0x01, 0x02]).unwrap();
        let mut buf = Vec::new();
        assert_eq!(link.read_available(&mut buf).unwrap(), 2);
        assert_eq!(buf, vec![0xAA, 0xBB]);
        assert_eq!(link.read_available(&mut buf).unwrap(), 0);
        assert_eq!(link.written(), vec![vec![0x01, 0x02]]);
    }

    #[test]
    fn test_chunked_delivery() {
        let mut link = MockLink::new("mock0", 9600);
        link.open().unwrap();
        link.script_chunks(&[0x01], &[&[0xAA], &[0xBB, 0xCC]]);

        link.write_all(&[0x01]).unwrap();
        let mut buf = Vec::new();
        link.read_available(&mut buf).unwrap();
        assert_eq!(buf, vec![0xAA]);
        link.read_available(&mut buf).unwrap();
        assert_eq!(buf, vec![0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn test_flush_input_discards_pending() {
        let mut link = MockLink::new("mock0", 9600);
        link.open().unwrap();
        link.script(&[0x01], &[0xAA]);
        link.write_all(&[0x01]).unwrap();
        link.flush_input().unwrap();
        let mut buf = Vec::new();
        assert_eq!(link.read_available(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_unscripted_request_times_out_silently() {
        let mut link = MockLink::new("mock0", 9600);
        link.open().unwrap();
        link.write_all(&[0x09]).unwrap();
        let mut buf = Vec::new();
        assert_eq!(link.read_available(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_injected_write_failure() {
        let mut link = MockLink::new("mock0", 9600);
        link.open().unwrap();
        link.fail_writes(1);
        assert!(link.write_all(&[0x01]).is_err());
        assert!(link.write_all(&[0x01]).is_ok());
    }
}
