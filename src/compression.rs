//! permessage-deflate payload transforms (RFC 7692).
//!
//! Both directions use raw DEFLATE. Every message ends with a sync flush; the flush marker
//! `00 00 ff ff` that closes the message is stripped by the sender and appended again by the
//! receiver before inflating the last frame.
use std::io;

use flate2::{FlushCompress, FlushDecompress, Status};

use crate::CompressionLevel;

/// Trailer of a sync flush, removed from the end of every compressed message.
pub(crate) const DEFLATE_TRAILER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// A compressor for handling WebSocket payload compression, supporting both contextual and no-context-takeover modes.
pub struct Compressor {
    compressor_type: CompressorType,
}

/// - `Contextual`: keeps the LZ77 window across messages.
/// - `NoContextTakeover`: starts every message from an empty window.
enum CompressorType {
    Contextual(Deflate),
    NoContextTakeover(Deflate),
}

impl Compressor {
    /// Creates a compressor that keeps its context across messages.
    pub fn new(level: CompressionLevel) -> Self {
        Self {
            compressor_type: CompressorType::Contextual(Deflate::new(level)),
        }
    }

    /// Creates a compressor that resets its context before each message.
    pub fn no_context_takeover(level: CompressionLevel) -> Self {
        Self {
            compressor_type: CompressorType::NoContextTakeover(Deflate::new(level)),
        }
    }

    /// Whether the context is discarded between messages.
    #[cfg(test)]
    pub fn is_no_context_takeover(&self) -> bool {
        matches!(self.compressor_type, CompressorType::NoContextTakeover(_))
    }

    /// Prepares for a new message.
    pub fn begin_message(&mut self) {
        if let CompressorType::NoContextTakeover(deflate) = &mut self.compressor_type {
            deflate.compress.reset();
        }
    }

    /// Compresses one chunk of a message and sync-flushes it to a byte boundary.
    ///
    /// The output always ends with [`DEFLATE_TRAILER`]; a streaming sender keeps the trailer
    /// of the last chunk back and drops it when the message ends.
    pub fn compress(&mut self, input: &[u8]) -> io::Result<Vec<u8>> {
        self.deflate().write(input)
    }

    /// Compresses a whole message, trailer stripped.
    pub fn compress_message(&mut self, input: &[u8]) -> io::Result<Vec<u8>> {
        self.begin_message();
        let mut output = self.compress(input)?;
        if output.ends_with(&DEFLATE_TRAILER) {
            output.truncate(output.len() - DEFLATE_TRAILER.len());
        }
        Ok(output)
    }

    fn deflate(&mut self) -> &mut Deflate {
        match &mut self.compressor_type {
            CompressorType::Contextual(deflate) | CompressorType::NoContextTakeover(deflate) => {
                deflate
            }
        }
    }
}

/// Raw DEFLATE stream wrapped around `flate2::Compress`.
struct Deflate {
    compress: flate2::Compress,
}

impl Deflate {
    fn new(level: CompressionLevel) -> Self {
        Self {
            compress: flate2::Compress::new(level, false),
        }
    }

    /// Feeds `input` and sync-flushes, growing the output until the flush completes.
    fn write(&mut self, mut input: &[u8]) -> io::Result<Vec<u8>> {
        let mut output = Vec::with_capacity(input.len() / 2 + 64);

        loop {
            if output.len() == output.capacity() {
                output.reserve(output.capacity().max(1024));
            }

            let before_in = self.compress.total_in();
            let before_out = self.compress.total_out();

            let status = self
                .compress
                .compress_vec(input, &mut output, FlushCompress::Sync)
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;

            let consumed = (self.compress.total_in() - before_in) as usize;
            let produced = self.compress.total_out() - before_out;
            input = &input[consumed..];

            // a flush is complete once all input is consumed and zlib had room to spare
            if input.is_empty() && output.len() < output.capacity() {
                break Ok(output);
            }

            if matches!(status, Status::BufError) && consumed == 0 && produced == 0 {
                if input.is_empty() {
                    break Ok(output);
                }
                break Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "deflate made no progress",
                ));
            }
        }
    }
}

/// Why inflating failed.
#[derive(Debug, PartialEq, Eq)]
pub enum InflateError {
    /// The input is not a valid DEFLATE stream.
    Corrupt(String),
    /// The output grew past the caller's bound.
    TooLarge,
}

/// A decompressor for handling WebSocket payload decompression.
///
/// - Contextual mode: the window is kept across messages, matching a peer that keeps its
///   compression context.
/// - No-context-takeover mode: the window is reset at the start of each message.
pub struct Decompressor {
    decompressor_type: DecompressorType,
}

enum DecompressorType {
    Contextual(Inflate),
    NoContextTakeover(Inflate),
}

impl Default for Decompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl Decompressor {
    /// Creates a decompressor that keeps its window across messages.
    pub fn new() -> Self {
        Self {
            decompressor_type: DecompressorType::Contextual(Inflate::new()),
        }
    }

    /// Creates a decompressor that resets its window before each message.
    pub fn no_context_takeover() -> Self {
        Self {
            decompressor_type: DecompressorType::NoContextTakeover(Inflate::new()),
        }
    }

    /// Prepares for a new compressed message.
    pub fn begin_message(&mut self) {
        if let DecompressorType::NoContextTakeover(inflate) = &mut self.decompressor_type {
            inflate.decompress.reset(false);
        }
    }

    /// Inflates the payload of one frame of a compressed message.
    ///
    /// When `fin` is set the stripped [`DEFLATE_TRAILER`] is fed after the payload so the
    /// final block is flushed out. Fails with [`InflateError::TooLarge`] as soon as the
    /// output exceeds `max_output` bytes, without inflating further.
    pub fn decompress(
        &mut self,
        input: &[u8],
        fin: bool,
        max_output: usize,
    ) -> Result<Vec<u8>, InflateError> {
        let inflate = match &mut self.decompressor_type {
            DecompressorType::Contextual(inflate) | DecompressorType::NoContextTakeover(inflate) => {
                inflate
            }
        };

        let mut output = Vec::with_capacity((input.len() * 2).clamp(64, 16 * 1024));
        inflate.write(input, &mut output, max_output)?;
        if fin {
            inflate.write(&DEFLATE_TRAILER, &mut output, max_output)?;
        }
        Ok(output)
    }
}

/// Raw DEFLATE stream wrapped around `flate2::Decompress`.
struct Inflate {
    decompress: flate2::Decompress,
}

impl Inflate {
    fn new() -> Self {
        Self {
            decompress: flate2::Decompress::new(false),
        }
    }

    fn write(
        &mut self,
        mut input: &[u8],
        output: &mut Vec<u8>,
        max_output: usize,
    ) -> Result<(), InflateError> {
        loop {
            if output.len() == output.capacity() {
                // never allocate much beyond what the caller is willing to accept
                let room = max_output.saturating_add(1).saturating_sub(output.len());
                output.reserve(room.clamp(1, 16 * 1024));
            }

            let before_in = self.decompress.total_in();
            let before_out = self.decompress.total_out();

            let status = self
                .decompress
                .decompress_vec(input, output, FlushDecompress::Sync)
                .map_err(|err| InflateError::Corrupt(err.to_string()))?;

            let consumed = (self.decompress.total_in() - before_in) as usize;
            let produced = self.decompress.total_out() - before_out;
            input = &input[consumed..];

            if output.len() > max_output {
                return Err(InflateError::TooLarge);
            }

            if matches!(status, Status::StreamEnd) {
                return Ok(());
            }

            if input.is_empty() && output.len() < output.capacity() {
                return Ok(());
            }

            if consumed == 0 && produced == 0 {
                if input.is_empty() {
                    return Ok(());
                }
                return Err(InflateError::Corrupt("inflate made no progress".into()));
            }
        }
    }
}
