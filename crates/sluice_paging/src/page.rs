//! Page files.
//!
//! A page is an append-only file of framed messages:
//!
//! ```text
//! ┌──────────────┬──────────────────┬──────────────┐
//! │ length (u32) │ payload (length) │ crc32 (u32)  │
//! └──────────────┴──────────────────┴──────────────┘
//! ```
//!
//! The checksum covers the length and the payload, so a torn length field
//! is caught as well as a torn payload. All integers are little-endian.

use crate::error::{PagingError, PagingResult};
use crc32fast::Hasher;
use parking_lot::{Mutex, RwLock};
use sluice_storage::StorageBackend;
use std::collections::HashSet;
use std::fmt;

/// Page file extension.
pub const PAGE_EXTENSION: &str = "page";

/// Bytes of framing around each payload.
pub const FRAME_OVERHEAD: usize = 8;

/// Returns the file name of a page.
#[must_use]
pub fn page_file_name(id: u64) -> String {
    format!("{id:010}.{PAGE_EXTENSION}")
}

/// Parses a page id from a file name.
#[must_use]
pub fn parse_page_file_name(name: &str) -> Option<u64> {
    let stem = name.strip_suffix(PAGE_EXTENSION)?.strip_suffix('.')?;
    if stem.len() != 10 || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

fn frame_crc(len: u32, payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&len.to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}

/// Frames a payload.
///
/// # Errors
///
/// Returns [`PagingError::InvalidArgument`] if the payload is larger than
/// `u32::MAX` bytes.
pub fn encode_frame(payload: &[u8]) -> PagingResult<Vec<u8>> {
    let len = u32::try_from(payload.len())
        .map_err(|_| PagingError::invalid_argument("message larger than 4 GiB"))?;
    let mut buf = Vec::with_capacity(payload.len() + FRAME_OVERHEAD);
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(payload);
    buf.extend_from_slice(&frame_crc(len, payload).to_le_bytes());
    Ok(buf)
}

/// Why a frame could not be read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FrameError {
    /// The frame runs past the end of the data.
    Truncated,
    /// The checksum does not match; the frame spans `frame_len` bytes.
    Checksum { frame_len: usize },
}

impl FrameError {
    pub(crate) fn reason(&self) -> &'static str {
        match self {
            Self::Truncated => "truncated message",
            Self::Checksum { .. } => "checksum mismatch",
        }
    }
}

/// Decodes the frame at the start of `data`, returning the payload and
/// the frame length.
pub(crate) fn decode_frame(data: &[u8]) -> Result<(&[u8], usize), FrameError> {
    let Some(len_bytes) = data.get(..4) else {
        return Err(FrameError::Truncated);
    };
    let len = u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]);
    let frame_len = len as usize + FRAME_OVERHEAD;
    let Some(frame) = data.get(..frame_len) else {
        return Err(FrameError::Truncated);
    };
    let payload = &frame[4..frame_len - 4];
    let stored = u32::from_le_bytes([
        frame[frame_len - 4],
        frame[frame_len - 3],
        frame[frame_len - 2],
        frame[frame_len - 1],
    ]);
    if stored != frame_crc(len, payload) {
        return Err(FrameError::Checksum { frame_len });
    }
    Ok((payload, frame_len))
}

/// Counters of one page.
#[derive(Debug, Default)]
pub(crate) struct PageState {
    /// Bytes written.
    pub(crate) size: u64,
    /// Messages written.
    pub(crate) written: u64,
    /// Indexes handed out by depage and not acknowledged yet.
    pub(crate) outstanding: HashSet<u64>,
    /// Messages acknowledged.
    pub(crate) acked: u64,
    /// No more messages will be written.
    pub(crate) sealed: bool,
}

impl PageState {
    /// Every message was written, depaged and acknowledged.
    pub(crate) fn is_done(&self) -> bool {
        self.sealed && self.acked == self.written
    }
}

/// One page file.
pub(crate) struct PageFile {
    pub(crate) id: u64,
    pub(crate) name: String,
    backend: RwLock<Box<dyn StorageBackend>>,
    pub(crate) state: Mutex<PageState>,
}

impl PageFile {
    pub(crate) fn new(id: u64, backend: Box<dyn StorageBackend>, state: PageState) -> Self {
        Self {
            id,
            name: page_file_name(id),
            backend: RwLock::new(backend),
            state: Mutex::new(state),
        }
    }

    /// Appends an encoded frame, returning its offset.
    ///
    /// The counters are updated only after the bytes are written, so a
    /// reader that sees a message counted can read it.
    pub(crate) fn append(&self, frame: &[u8], sync: bool) -> PagingResult<(u64, u64)> {
        let offset = {
            let mut backend = self.backend.write();
            let offset = backend.append(frame)?;
            if sync {
                backend.sync()?;
            } else {
                backend.flush()?;
            }
            offset
        };
        let mut state = self.state.lock();
        let index = state.written;
        state.written += 1;
        state.size = offset + frame.len() as u64;
        Ok((index, offset))
    }

    /// Reads the message at `offset`, returning the payload and frame
    /// length.
    pub(crate) fn read(&self, offset: u64) -> PagingResult<(Vec<u8>, usize)> {
        let backend = self.backend.read();
        let header = backend.read_at(offset, 4)?;
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let frame = backend.read_at(offset, len + FRAME_OVERHEAD)?;
        match decode_frame(&frame) {
            Ok((payload, frame_len)) => Ok((payload.to_vec(), frame_len)),
            Err(err) => Err(PagingError::corrupt_page(self.id, offset, err.reason())),
        }
    }

    /// Reads the whole file.
    pub(crate) fn read_all(&self) -> PagingResult<Vec<u8>> {
        let backend = self.backend.read();
        let size = backend.size()?;
        Ok(backend.read_at(0, size as usize)?)
    }

    pub(crate) fn truncate(&self, size: u64) -> PagingResult<()> {
        let mut backend = self.backend.write();
        backend.truncate(size)?;
        backend.sync()?;
        Ok(())
    }

    pub(crate) fn sync(&self) -> PagingResult<()> {
        self.backend.write().sync()?;
        Ok(())
    }
}

impl fmt::Debug for PageFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageFile")
            .field("id", &self.id)
            .field("state", &*self.state.lock())
            .finish()
    }
}

/// Result of scanning an existing page at open.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct PageScan {
    /// Messages found.
    pub(crate) messages: u64,
    /// Bytes of valid frames.
    pub(crate) valid_len: u64,
    /// Where the first invalid frame starts, with the reason, if any.
    pub(crate) damage: Option<(u64, FrameError)>,
}

/// Walks the frames of a page image.
pub(crate) fn scan_page(data: &[u8]) -> PageScan {
    let mut offset = 0;
    let mut messages = 0;
    while offset < data.len() {
        match decode_frame(&data[offset..]) {
            Ok((_, frame_len)) => {
                offset += frame_len;
                messages += 1;
            }
            Err(err) => {
                return PageScan {
                    messages,
                    valid_len: offset as u64,
                    damage: Some((offset as u64, err)),
                }
            }
        }
    }
    PageScan {
        messages,
        valid_len: offset as u64,
        damage: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_storage::InMemoryBackend;

    #[test]
    fn file_names() {
        assert_eq!(page_file_name(7), "0000000007.page");
        assert_eq!(parse_page_file_name("0000000007.page"), Some(7));
        assert_eq!(parse_page_file_name("7.page"), None);
        assert_eq!(parse_page_file_name("0000000007.jrn"), None);
        assert_eq!(parse_page_file_name("address.txt"), None);
    }

    #[test]
    fn frame_detects_damage() {
        let frame = encode_frame(b"payload").unwrap();
        assert_eq!(frame.len(), 7 + FRAME_OVERHEAD);
        let (payload, len) = decode_frame(&frame).unwrap();
        assert_eq!(payload, b"payload");
        assert_eq!(len, frame.len());

        assert_eq!(decode_frame(&frame[..10]), Err(FrameError::Truncated));
        assert_eq!(decode_frame(&frame[..2]), Err(FrameError::Truncated));

        let mut bad = frame.clone();
        bad[5] ^= 0xFF;
        assert_eq!(
            decode_frame(&bad),
            Err(FrameError::Checksum {
                frame_len: frame.len()
            })
        );
    }

    #[test]
    fn scan_stops_at_damage() {
        let mut data = encode_frame(b"one").unwrap();
        data.extend(encode_frame(b"two").unwrap());
        let good = data.len() as u64;
        data.extend(&encode_frame(b"three").unwrap()[..6]);

        let scan = scan_page(&data);
        assert_eq!(scan.messages, 2);
        assert_eq!(scan.valid_len, good);
        assert_eq!(scan.damage, Some((good, FrameError::Truncated)));
    }

    #[test]
    fn append_then_read() {
        let page = PageFile::new(1, Box::new(InMemoryBackend::new()), PageState::default());
        let first = encode_frame(b"hello").unwrap();
        let second = encode_frame(b"world").unwrap();
        assert_eq!(page.append(&first, false).unwrap(), (0, 0));
        assert_eq!(
            page.append(&second, false).unwrap(),
            (1, first.len() as u64)
        );

        let (payload, len) = page.read(first.len() as u64).unwrap();
        assert_eq!(payload, b"world");
        assert_eq!(len, second.len());
        assert_eq!(page.state.lock().written, 2);
    }
}
