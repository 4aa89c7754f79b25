//! # Flat Object Streams
//!
//! A stream is a sequence of frames, each a varint length followed by one
//! flattened object. One flattener writes the whole stream and one inflater
//! reads it, so shared nodes are emitted once per stream.
//!
//! Reading distinguishes three outcomes:
//!
//! - `Ok(ReadNext::Object(_))`: a complete frame,
//! - `Ok(ReadNext::EndOfStream)`: input ended exactly on a frame boundary,
//! - `Err(_)`: input ended inside a frame or a frame failed to inflate.

use std::io::{self, ErrorKind, Read, Write};
use std::sync::Arc;

use super::flatten::{SerializedObjectFlattener, SerializedObjectInflater};
use super::object::SerializedObject;
use super::wire::{encode_uleb128, read_uleb128};
use super::SerializeError;
use crate::memory::VectorDataMemoryManager;

/// Default upper bound on one frame.
pub const DEFAULT_MAX_FRAME_BYTES: u64 = 1 << 30;

/// Result of a successful read attempt.
#[derive(Debug)]
pub enum ReadNext {
    /// The next object.
    Object(Arc<SerializedObject>),
    /// Clean end of input.
    EndOfStream,
}

/// Writes framed objects through one flattener.
pub struct FlatObjectWriter<W> {
    writer: W,
    flattener: SerializedObjectFlattener,
    frames: u64,
}

impl<W: Write> FlatObjectWriter<W> {
    /// Wrap `writer`.
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            flattener: SerializedObjectFlattener::new(),
            frames: 0,
        }
    }

    /// Append one object.
    pub fn write(&mut self, object: &SerializedObject) -> Result<(), SerializeError> {
        let block = self.flattener.flatten(object);
        let mut len = [0u8; 10];
        let n = encode_uleb128(block.total_byte_count() as u64, &mut len);
        self.writer.write_all(&len[..n])?;
        for chunk in block.chunks() {
            self.writer.write_all(chunk)?;
        }
        self.frames += 1;
        Ok(())
    }

    /// Frames written so far.
    pub fn frames_written(&self) -> u64 {
        self.frames
    }

    /// Flush the underlying writer.
    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }

    /// Recover the underlying writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Reads framed objects through one inflater.
pub struct FlatObjectReader<R> {
    reader: R,
    inflater: SerializedObjectInflater,
    max_frame_bytes: u64,
    frames: u64,
    finished: bool,
}

impl<R: Read> FlatObjectReader<R> {
    /// Wrap `reader`, using the free-store manager for decoded data.
    pub fn new(reader: R) -> Self {
        Self::with_memory(reader, VectorDataMemoryManager::free_store())
    }

    /// Wrap `reader`, charging decoded data to `memory`.
    pub fn with_memory(reader: R, memory: Arc<VectorDataMemoryManager>) -> Self {
        Self {
            reader,
            inflater: SerializedObjectInflater::with_memory(memory),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            frames: 0,
            finished: false,
        }
    }

    /// Reject frames longer than `limit`.
    pub fn with_max_frame_bytes(mut self, limit: u64) -> Self {
        self.max_frame_bytes = limit;
        self
    }

    /// Frames read so far.
    pub fn frames_read(&self) -> u64 {
        self.frames
    }

    /// Read the next frame.
    pub fn try_read_next(&mut self) -> Result<ReadNext, SerializeError> {
        let Some(len) = self.read_frame_len()? else {
            return Ok(ReadNext::EndOfStream);
        };
        if len > self.max_frame_bytes {
            return Err(SerializeError::Malformed(format!(
                "frame of {len} bytes exceeds limit of {}",
                self.max_frame_bytes
            )));
        }

        // Grows with the bytes actually present, not the declared length.
        let mut frame = Vec::new();
        let got = self.reader.by_ref().take(len).read_to_end(&mut frame)?;
        if (got as u64) < len {
            return Err(SerializeError::UnexpectedEof);
        }
        let object = self.inflater.inflate(&frame)?;
        self.frames += 1;
        Ok(ReadNext::Object(object))
    }

    /// `None` on a clean end of input before the first length byte.
    fn read_frame_len(&mut self) -> Result<Option<u64>, SerializeError> {
        read_uleb128(|| Ok(self.read_byte()?))
    }

    fn read_byte(&mut self) -> io::Result<Option<u8>> {
        let mut byte = [0u8; 1];
        loop {
            match self.reader.read(&mut byte) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(byte[0])),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

impl<R: Read> Iterator for FlatObjectReader<R> {
    type Item = Result<Arc<SerializedObject>, SerializeError>;

    /// Yields objects until a clean end, or one error and then nothing.
    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.try_read_next() {
            Ok(ReadNext::Object(o)) => Some(Ok(o)),
            Ok(ReadNext::EndOfStream) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}
