//! Typed record I/O over queue files.
//!
//! A record is a 1-byte type tag, a variable-length integer payload length,
//! then the payload. The encoding is byte-exact so callers can cache record
//! offsets and patch records in place.

use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::SpoolError;

/// Closed enumeration of record types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordKind {
    /// Fixed-width size/totals record; always first, patched in place.
    Size = b'C',
    /// Arrival time, seconds since the epoch.
    Time = b'T',
    /// Envelope sender.
    From = b'S',
    /// Envelope or extracted recipient.
    Recipient = b'R',
    /// Original recipient before rewriting, paired with the following
    /// recipient record.
    OrigRecipient = b'O',
    /// Terminal marker overwritten onto a completed recipient.
    Done = b'D',
    /// Delayed-mail warning deadline.
    Warn = b'W',
    /// Named attribute (`name=value`).
    Attr = b'A',
    /// Start of message content.
    Mesg = b'M',
    /// One line of message content.
    Norm = b'N',
    /// Start of the extracted segment.
    Xtra = b'X',
    /// Return-Receipt-To extracted from headers.
    Rrto = b'r',
    /// Errors-To extracted from headers.
    Erto = b'e',
    /// Padding left behind by an in-place patch.
    Pad = b'P',
    /// Terminator; always last.
    End = b'E',
}

impl RecordKind {
    pub fn from_tag(tag: u8) -> Result<Self, SpoolError> {
        match tag {
            b'C' => Ok(Self::Size),
            b'T' => Ok(Self::Time),
            b'S' => Ok(Self::From),
            b'R' => Ok(Self::Recipient),
            b'O' => Ok(Self::OrigRecipient),
            b'D' => Ok(Self::Done),
            b'W' => Ok(Self::Warn),
            b'A' => Ok(Self::Attr),
            b'M' => Ok(Self::Mesg),
            b'N' => Ok(Self::Norm),
            b'X' => Ok(Self::Xtra),
            b'r' => Ok(Self::Rrto),
            b'e' => Ok(Self::Erto),
            b'P' => Ok(Self::Pad),
            b'E' => Ok(Self::End),
            other => Err(SpoolError::corrupt(format!(
                "unknown record tag 0x{other:02x}"
            ))),
        }
    }

    #[must_use]
    pub const fn tag(self) -> u8 {
        self as u8
    }

    /// Record kinds legal in the envelope segment.
    #[must_use]
    pub const fn is_envelope(self) -> bool {
        matches!(
            self,
            Self::Time | Self::From | Self::Recipient | Self::OrigRecipient | Self::Warn | Self::Attr
        )
    }
}

/// One decoded record with its position in the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Byte offset of the record's tag.
    pub offset: u64,
    pub kind: RecordKind,
    pub payload: Vec<u8>,
}

impl Record {
    /// Payload interpreted as UTF-8 text.
    pub fn text(&self) -> Result<&str, SpoolError> {
        std::str::from_utf8(&self.payload)
            .map_err(|_| SpoolError::corrupt(format!("non-UTF-8 payload in {:?} record", self.kind)))
    }
}

/// Encode a length as LEB128.
fn write_varint<W: Write>(writer: &mut W, mut value: u64) -> io::Result<()> {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            writer.write_all(&[byte])?;
            return Ok(());
        }
        writer.write_all(&[byte | 0x80])?;
    }
}

fn read_varint<R: Read>(reader: &mut R) -> Result<Option<u64>, SpoolError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let mut byte = [0u8; 1];
        match reader.read_exact(&mut byte) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof && shift == 0 => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(SpoolError::corrupt("truncated record length"));
            }
            Err(e) => return Err(e.into()),
        }
        if shift > 63 {
            return Err(SpoolError::corrupt("record length overflow"));
        }
        value |= u64::from(byte[0] & 0x7f) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(Some(value));
        }
        shift += 7;
    }
}

/// Appends records to a stream and patches earlier records in place.
#[derive(Debug)]
pub struct RecordWriter<W> {
    inner: W,
}

impl<W: Read + Write + Seek> RecordWriter<W> {
    pub const fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    /// Append a record at the current position; returns the record offset.
    ///
    /// A short write surfaces as an error to the caller; nothing is retried
    /// here.
    pub fn append(&mut self, kind: RecordKind, payload: &[u8]) -> Result<u64, SpoolError> {
        let offset = self.inner.stream_position()?;
        self.inner.write_all(&[kind.tag()])?;
        write_varint(&mut self.inner, payload.len() as u64)?;
        self.inner.write_all(payload)?;
        Ok(offset)
    }

    /// Rewrite the record at `offset` with a payload no longer than the old
    /// one, padding the leftover space into a PAD record byte run.
    ///
    /// The length prefix keeps its original value so every later record
    /// offset is preserved; short payloads are space-padded.
    pub fn patch(&mut self, offset: u64, kind: RecordKind, payload: &[u8]) -> Result<(), SpoolError> {
        let end = self.inner.stream_position()?;
        self.inner.seek(SeekFrom::Start(offset))?;

        let mut tag = [0u8; 1];
        self.inner.read_exact(&mut tag)?;
        let old_len = read_varint(&mut self.inner)?
            .ok_or_else(|| SpoolError::corrupt("patch offset past end of file"))?;
        RecordKind::from_tag(tag[0])?;

        let old_len = usize::try_from(old_len)
            .map_err(|_| SpoolError::corrupt("record length overflow"))?;
        if payload.len() > old_len {
            self.inner.seek(SeekFrom::Start(end))?;
            return Err(SpoolError::PatchTooLarge {
                old: old_len,
                new: payload.len(),
            });
        }

        self.inner.seek(SeekFrom::Start(offset))?;
        self.inner.write_all(&[kind.tag()])?;
        write_varint(&mut self.inner, old_len as u64)?;
        self.inner.write_all(payload)?;
        // Keep the stored length honest by filling the tail with spaces.
        for _ in payload.len()..old_len {
            self.inner.write_all(b" ")?;
        }
        self.inner.seek(SeekFrom::Start(end))?;
        Ok(())
    }

    /// Overwrite only the type tag of the record at `offset`.
    pub fn overwrite_kind(&mut self, offset: u64, kind: RecordKind) -> Result<(), SpoolError> {
        let end = self.inner.stream_position()?;
        self.inner.seek(SeekFrom::Start(offset))?;
        self.inner.write_all(&[kind.tag()])?;
        self.inner.seek(SeekFrom::Start(end))?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), SpoolError> {
        self.inner.flush()?;
        Ok(())
    }
}

/// Iterates records from a given offset.
#[derive(Debug)]
pub struct RecordReader<R> {
    inner: R,
    offset: u64,
}

impl<R: Read + Seek> RecordReader<R> {
    pub fn new(mut inner: R) -> Result<Self, SpoolError> {
        inner.seek(SeekFrom::Start(0))?;
        Ok(Self { inner, offset: 0 })
    }

    pub fn from_offset(mut inner: R, offset: u64) -> Result<Self, SpoolError> {
        inner.seek(SeekFrom::Start(offset))?;
        Ok(Self { inner, offset })
    }

    /// Read the next record, or `None` at a clean end of stream.
    ///
    /// A stream that ends inside a record yields a corrupt-file error.
    pub fn next_record(&mut self) -> Result<Option<Record>, SpoolError> {
        let mut tag = [0u8; 1];
        match self.inner.read_exact(&mut tag) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let kind = RecordKind::from_tag(tag[0])?;
        let len = read_varint(&mut self.inner)?
            .ok_or_else(|| SpoolError::corrupt("truncated record header"))?;
        let len = usize::try_from(len).map_err(|_| SpoolError::corrupt("record length overflow"))?;

        let mut payload = vec![0u8; len];
        self.inner
            .read_exact(&mut payload)
            .map_err(|e| match e.kind() {
                io::ErrorKind::UnexpectedEof => SpoolError::corrupt("truncated record payload"),
                _ => SpoolError::Io(e),
            })?;

        let record = Record {
            offset: self.offset,
            kind,
            payload,
        };
        self.offset = self.inner.stream_position()?;
        Ok(Some(record))
    }
}
