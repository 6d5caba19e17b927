//! Frame codec for [`tokio_util::codec`].
//!
//! [`Decoder`] parses exactly one frame per item and validates everything that can be checked
//! from the frame alone: reserved bits, opcode, masking direction, control frame constraints and
//! payload length. Message-level rules (continuations, fragment ordering) belong to the
//! connection. [`Encoder`] serializes one frame, masking it when acting as a client.
use bytes::{Buf, BytesMut};
use tokio_util::codec;

use crate::{
    frame::{Frame, OpCode, MAX_CONTROL_PAYLOAD, MAX_HEAD_SIZE},
    ProtocolError, Role, WebSocketError,
};

/// Largest step the read buffer grows by while a payload is still arriving.
const MAX_RESERVE_STEP: usize = 64 * 1024;

/// Represents the reading state of a WebSocket frame.
enum ReadState {
    /// The two fixed header bytes were parsed; waiting for length and mask.
    Header(Header),
    /// Waiting for the payload.
    Payload(HeaderAndMask),
}

/// Represents the initial header fields of a WebSocket frame.
struct Header {
    /// Indicates if this is the final fragment in a message.
    fin: bool,
    /// Compression flag indicating if payload is compressed.
    rsv1: bool,
    /// The operation code of the frame.
    opcode: OpCode,
    /// Size of the extended length field: 0, 2 or 8 bytes.
    extra: usize,
    /// 7-bit length code from the second header byte.
    length_code: u8,
    /// Remaining header bytes: extended length plus the masking key.
    header_size: usize,
    masked: bool,
}

/// Contains header and mask data after decoding the bytes before the payload.
struct HeaderAndMask {
    header: Header,
    mask: Option<[u8; 4]>,
    payload_len: usize,
}

/// A decoder for WebSocket frames, handling state transitions.
///
/// `Decoder` tracks the read limit of the connection so a frame announcing a payload larger
/// than any acceptable message is rejected before its payload is buffered.
pub struct Decoder {
    /// Current reading state (header or payload).
    state: Option<ReadState>,
    role: Role,
    /// Largest message the connection accepts, in bytes.
    read_limit: usize,
    /// Whether permessage-deflate was negotiated, allowing RSV1.
    compression: bool,
    /// Reject payload lengths that are not minimally encoded.
    strict_length: bool,
}

impl Decoder {
    /// Creates a new `Decoder`.
    ///
    /// # Parameters
    /// - `role`: The role of the local endpoint. Servers require masked frames, clients reject them.
    /// - `read_limit`: The maximum message size accepted by the connection.
    /// - `compression`: Whether RSV1 may be set on data frames.
    /// - `strict_length`: Whether a longer-than-necessary length encoding is an error.
    pub fn new(role: Role, read_limit: usize, compression: bool, strict_length: bool) -> Self {
        Self {
            state: None,
            role,
            read_limit,
            compression,
            strict_length,
        }
    }

    /// Updates the read limit applied to frames decoded from now on.
    pub fn set_read_limit(&mut self, read_limit: usize) {
        self.read_limit = read_limit;
    }

    /// Largest data frame payload accepted.
    ///
    /// Compressed frames may be slightly larger than the message they inflate to, so the bound
    /// is relaxed when compression is on. The exact limit is enforced on the inflated bytes.
    fn frame_limit(&self) -> u64 {
        let limit = self.read_limit as u64;
        if self.compression {
            limit
                .saturating_add(limit >> 12)
                .saturating_add(limit >> 14)
                .saturating_add(64)
        } else {
            limit
        }
    }

    /// Checks the first two header bytes.
    fn parse_head(&self, b0: u8, b1: u8) -> Result<Header, WebSocketError> {
        let fin = b0 & 0b1000_0000 != 0;
        let rsv1 = b0 & 0b0100_0000 != 0;

        if b0 & 0b0011_0000 != 0 {
            return Err(ProtocolError::ReservedBitsNotZero.into());
        }

        let opcode = OpCode::try_from(b0 & 0b0000_1111)?;
        let masked = b1 & 0b1000_0000 != 0;
        let length_code = b1 & 0x7F;

        if rsv1 {
            if opcode.is_control() {
                return Err(ProtocolError::CompressedControlFrame.into());
            }
            if !self.compression {
                return Err(ProtocolError::CompressionNotSupported.into());
            }
            if opcode == OpCode::Continuation {
                return Err(ProtocolError::CompressedContinuation.into());
            }
        }

        match (self.role, masked) {
            (Role::Server, false) => return Err(ProtocolError::UnmaskedClientFrame.into()),
            (Role::Client, true) => return Err(ProtocolError::MaskedServerFrame.into()),
            _ => {}
        }

        if opcode.is_control() && !fin {
            return Err(ProtocolError::ControlFrameFragmented.into());
        }

        let extra = match length_code {
            126 => 2,
            127 => 8,
            _ => 0,
        };

        Ok(Header {
            fin,
            rsv1,
            opcode,
            extra,
            length_code,
            header_size: extra + masked as usize * 4,
            masked,
        })
    }

    /// Reads the extended length and the masking key once they are buffered.
    fn parse_length(
        &self,
        header: &Header,
        src: &mut BytesMut,
    ) -> Result<(u64, Option<[u8; 4]>), WebSocketError> {
        let payload_len = match header.extra {
            2 => {
                let len = u64::from(src.get_u16());
                if self.strict_length && len < 126 {
                    return Err(ProtocolError::NonMinimalLength.into());
                }
                len
            }
            8 => {
                let len = src.get_u64();
                if len >> 63 != 0 {
                    return Err(ProtocolError::InvalidPayloadLength.into());
                }
                if self.strict_length && len < 65536 {
                    return Err(ProtocolError::NonMinimalLength.into());
                }
                len
            }
            _ => u64::from(header.length_code),
        };

        let mask = if header.masked {
            Some(src.get_u32().to_be_bytes())
        } else {
            None
        };

        Ok((payload_len, mask))
    }
}

impl codec::Decoder for Decoder {
    type Item = Frame;
    type Error = WebSocketError;

    /// Decodes one frame from `src`, keeping partial progress across calls.
    ///
    /// # Returns
    /// - `Ok(Some(Frame))`: a complete frame with its payload unmasked.
    /// - `Ok(None)`: more data is needed.
    /// - `Err(WebSocketError)`: a protocol violation, or `MessageTooBig` when the frame alone
    ///   exceeds the read limit.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state.take() {
                None => {
                    if src.remaining() < 2 {
                        return Ok(None);
                    }

                    let header = self.parse_head(src[0], src[1])?;
                    src.advance(2);
                    self.state = Some(ReadState::Header(header));
                }
                Some(ReadState::Header(header)) => {
                    if src.remaining() < header.header_size {
                        self.state = Some(ReadState::Header(header));
                        return Ok(None);
                    }

                    let (payload_len, mask) = self.parse_length(&header, src)?;

                    if header.opcode.is_control() {
                        if payload_len > MAX_CONTROL_PAYLOAD as u64 {
                            return Err(ProtocolError::ControlFrameTooLarge(payload_len).into());
                        }
                    } else if payload_len > self.frame_limit() {
                        return Err(WebSocketError::MessageTooBig {
                            limit: self.read_limit,
                        });
                    }

                    let payload_len = usize::try_from(payload_len).map_err(|_| {
                        WebSocketError::MessageTooBig {
                            limit: self.read_limit,
                        }
                    })?;

                    self.state = Some(ReadState::Payload(HeaderAndMask {
                        header,
                        mask,
                        payload_len,
                    }));
                }
                Some(ReadState::Payload(header_and_mask)) => {
                    if src.remaining() < header_and_mask.payload_len {
                        let missing = header_and_mask.payload_len - src.remaining();
                        src.reserve(missing.min(MAX_RESERVE_STEP));
                        self.state = Some(ReadState::Payload(header_and_mask));
                        return Ok(None);
                    }

                    let header = header_and_mask.header;
                    let payload = src.split_to(header_and_mask.payload_len);

                    let mut frame = Frame::new(header.fin, header.opcode, header_and_mask.mask, payload);
                    frame.is_compressed = header.rsv1;
                    frame.unmask();

                    break Ok(Some(frame));
                }
            }
        }
    }
}

/// WebSocket frame encoder for serializing `Frame` instances into a buffer.
///
/// Client encoders mask every frame with a fresh random key, as RFC 6455 requires for
/// client-to-server traffic. Server encoders never mask.
pub struct Encoder {
    role: Role,
}

impl Encoder {
    pub fn new(role: Role) -> Self {
        Self { role }
    }
}

impl codec::Encoder<Frame> for Encoder {
    type Error = WebSocketError;

    fn encode(&mut self, mut frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if self.role == Role::Client {
            frame.mask();
        }

        let mut header = [0; MAX_HEAD_SIZE];
        let size = frame.fmt_head(&mut header[..]);

        dst.reserve(size + frame.payload.len());
        dst.extend_from_slice(&header[..size]);
        dst.extend_from_slice(&frame.payload);

        Ok(())
    }
}
