//! On-disk layout of a cache entry
//!
//! ```text
//! header : magic "PFCACHE\0" | u32 format version | 32-byte fingerprint
//! frame  : 0x01 | u64 payload length | bincode payload
//! end    : 0x00 | u64 frame count | SHA-256 of every frame byte
//! ```
//!
//! Integers are little-endian. An entry without its end marker, or whose
//! count or checksum disagrees with the frames, is corrupt.

use std::io::{self, Read, Write};

use serde::Serialize;
use sha2::{Digest, Sha256};

use pullflow_core::{Error, Result};

use crate::fingerprint::{Fingerprint, FINGERPRINT_LEN};

/// File magic
pub const MAGIC: &[u8; 8] = b"PFCACHE\0";

/// Current layout version
pub const FORMAT_VERSION: u32 = 1;

/// Header size in bytes
pub const HEADER_LEN: usize = MAGIC.len() + 4 + FINGERPRINT_LEN;

const TAG_END: u8 = 0;
const TAG_FRAME: u8 = 1;

fn corrupt(reason: impl Into<String>) -> Error {
    Error::CacheCorrupt(reason.into())
}

/// Map a short read to corruption; everything else stays an I/O error
fn read_exact_or_corrupt<R: Read>(input: &mut R, buf: &mut [u8], what: &str) -> Result<()> {
    input.read_exact(buf).map_err(|err| match err.kind() {
        io::ErrorKind::UnexpectedEof => corrupt(format!("truncated {what}")),
        _ => Error::Io(err),
    })
}

fn read_u64<R: Read>(input: &mut R, what: &str) -> Result<u64> {
    let mut buf = [0u8; 8];
    read_exact_or_corrupt(input, &mut buf, what)?;
    Ok(u64::from_le_bytes(buf))
}

/// Streams elements into an entry
pub struct EntryWriter<W: Write> {
    out: W,
    digest: Sha256,
    count: u64,
}

impl<W: Write> EntryWriter<W> {
    /// Write the header for `fingerprint`
    pub fn new(mut out: W, fingerprint: &Fingerprint) -> Result<Self> {
        out.write_all(MAGIC)?;
        out.write_all(&FORMAT_VERSION.to_le_bytes())?;
        out.write_all(fingerprint.as_bytes())?;
        Ok(Self {
            out,
            digest: Sha256::new(),
            count: 0,
        })
    }

    /// Append one element
    pub fn write_item<T: Serialize>(&mut self, item: &T) -> Result<()> {
        let payload = bincode::serialize(item)?;
        let mut head = [0u8; 9];
        head[0] = TAG_FRAME;
        head[1..].copy_from_slice(&(payload.len() as u64).to_le_bytes());
        self.digest.update(head);
        self.digest.update(&payload);
        self.out.write_all(&head)?;
        self.out.write_all(&payload)?;
        self.count += 1;
        Ok(())
    }

    /// Elements written so far
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Write the end marker and flush; returns the underlying writer
    pub fn finish(mut self) -> Result<W> {
        self.out.write_all(&[TAG_END])?;
        self.out.write_all(&self.count.to_le_bytes())?;
        self.out.write_all(&self.digest.finalize())?;
        self.out.flush()?;
        Ok(self.out)
    }
}

/// Reads the frames of an entry, checking the end marker when it is reached
pub struct EntryReader<R: Read> {
    input: R,
    digest: Sha256,
    count: u64,
    finished: bool,
}

impl<R: Read> EntryReader<R> {
    /// Read and check the header against `expected`
    pub fn open(mut input: R, expected: &Fingerprint) -> Result<Self> {
        let mut magic = [0u8; 8];
        read_exact_or_corrupt(&mut input, &mut magic, "header")?;
        if &magic != MAGIC {
            return Err(corrupt("bad magic"));
        }
        let mut version = [0u8; 4];
        read_exact_or_corrupt(&mut input, &mut version, "header")?;
        let version = u32::from_le_bytes(version);
        if version != FORMAT_VERSION {
            return Err(corrupt(format!("unsupported format version {version}")));
        }
        let mut fingerprint = [0u8; FINGERPRINT_LEN];
        read_exact_or_corrupt(&mut input, &mut fingerprint, "header")?;
        if &fingerprint != expected.as_bytes() {
            return Err(corrupt("fingerprint mismatch"));
        }
        Ok(Self {
            input,
            digest: Sha256::new(),
            count: 0,
            finished: false,
        })
    }

    /// Next frame payload, or `None` after a verified end marker
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        if self.finished {
            return Ok(None);
        }
        let mut tag = [0u8; 1];
        read_exact_or_corrupt(&mut self.input, &mut tag, "frame tag")?;
        match tag[0] {
            TAG_FRAME => {
                let len = read_u64(&mut self.input, "frame length")?;
                // Never trust the length for an up-front allocation.
                let mut payload = Vec::new();
                (&mut self.input).take(len).read_to_end(&mut payload)?;
                if payload.len() as u64 != len {
                    return Err(corrupt("truncated frame payload"));
                }
                self.digest.update([TAG_FRAME]);
                self.digest.update(len.to_le_bytes());
                self.digest.update(&payload);
                self.count += 1;
                Ok(Some(payload))
            }
            TAG_END => {
                let count = read_u64(&mut self.input, "end marker")?;
                let mut checksum = [0u8; 32];
                read_exact_or_corrupt(&mut self.input, &mut checksum, "end marker")?;
                if count != self.count {
                    return Err(corrupt(format!("end marker counts {count} frames, found {}", self.count)));
                }
                let actual: [u8; 32] = std::mem::take(&mut self.digest).finalize().into();
                if actual != checksum {
                    return Err(corrupt("checksum mismatch"));
                }
                let mut trailing = [0u8; 1];
                if self.input.read(&mut trailing)? != 0 {
                    return Err(corrupt("trailing bytes after end marker"));
                }
                self.finished = true;
                Ok(None)
            }
            other => Err(corrupt(format!("unknown frame tag {other:#04x}"))),
        }
    }

    /// Frames read so far
    pub fn frames_read(&self) -> u64 {
        self.count
    }
}

/// Read a whole entry without decoding payloads; returns its element count
pub fn validate<R: Read>(input: R, expected: &Fingerprint) -> Result<u64> {
    let mut reader = EntryReader::open(input, expected)?;
    while reader.next_frame()?.is_some() {}
    Ok(reader.frames_read())
}
