//! NBD protocol constants and frame definitions.
//!
//! Pure codec layer: every frame knows how to read itself from a stream and
//! write itself to one. Byte order is network (big-endian) throughout.
//!
//! See <https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md>
//! for the protocol description.
#![allow(clippy::upper_case_acronyms)]
#![allow(non_camel_case_types)]

use std::io::{Read, Write};

use bitflags::bitflags;
use byteorder::{ReadBytesExt, WriteBytesExt, BE};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::{Error, Result};

/// Default NBD TCP port.
pub const TCP_PORT: u16 = 10809;

/// Handshake greeting magic, b"NBDMAGIC".
pub const MAGIC: u64 = 0x4e42444d41474943;
/// Newstyle handshake identifier, b"IHAVEOPT".
pub const IHAVEOPT: u64 = 0x49484156454F5054;
/// Magic prefixing every option reply.
pub const OPTION_REPLY_MAGIC: u64 = 0x3e889045565a9;
/// Magic the oldstyle server sends after b"NBDMAGIC".
pub const OLDSTYLE_MAGIC: u64 = 0x00420281861253;

// transmission constants
/// Magic prefixing every request.
pub const REQUEST_MAGIC: u32 = 0x25609513;
/// Magic prefixing every simple reply.
pub const SIMPLE_REPLY_MAGIC: u32 = 0x67446698;
/// Magic prefixing every structured reply chunk.
pub const STRUCTURED_REPLY_MAGIC: u32 = 0x668e33ef;

/// Option replies with this bit set are errors.
pub const REP_ERR_BIT: u32 = 1 << 31;
/// Structured reply types with this bit set are errors.
pub const REPLY_TYPE_ERR_BIT: u16 = 1 << 15;

// Frames larger than this are treated as protocol violations rather than
// allocated; negotiation payloads are tiny in practice.
const MAX_FRAME_LEN: u32 = 1 << 20;

bitflags! {
    /// Flags the server offers in the newstyle greeting.
    pub struct HandshakeFlags: u16 {
        const FIXED_NEWSTYLE = 1 << 0;
        const NO_ZEROES = 1 << 1;
    }

    /// Flags the client answers the greeting with.
    pub struct ClientHandshakeFlags: u32 {
        const C_FIXED_NEWSTYLE = 1 << 0;
        const C_NO_ZEROES = 1 << 1;
    }

    /// Per-export transmission flags.
    pub struct TransmitFlags: u16 {
        const HAS_FLAGS = 1 << 0;
        const READ_ONLY = 1 << 1;
        const SEND_FLUSH = 1 << 2;
        const SEND_FUA = 1 << 3;
        const ROTATIONAL = 1 << 4;
        const SEND_TRIM = 1 << 5;
        const SEND_WRITE_ZEROES = 1 << 6;
        const SEND_DF = 1 << 7;
        const CAN_MULTI_CONN = 1 << 8;
    }

    /// Per-request command flags (always empty for this client).
    pub struct CmdFlags: u16 {
        const FUA = 1 << 0;
        const NO_HOLE = 1 << 1;
        // "don't fragment"
        const DF = 1 << 2;
        const REQ_ONE = 1 << 3;
    }

    /// Flags carried by a structured reply chunk.
    pub struct StructuredReplyFlags: u16 {
        /// Last chunk of the reply series for this request.
        const DONE = 1 << 0;
    }
}

/// Options the client can haggle with during the handshake phase.
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum OptType {
    EXPORT_NAME = 1,
    ABORT = 2,
    STARTTLS = 5,
    STRUCTURED_REPLY = 8,
    LIST_META_CONTEXT = 9,
    SET_META_CONTEXT = 10,
}

/// Non-error option reply types.
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum OptReplyType {
    ACK = 1,
    SERVER = 2,
    META_CONTEXT = 4,
}

/// Transmission request types.
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u16)]
pub enum Cmd {
    READ = 0,
    WRITE = 1,
    // NBD_CMD_DISC
    DISCONNECT = 2,
    FLUSH = 3,
    BLOCK_STATUS = 7,
}

/// Non-error structured reply chunk types.
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u16)]
pub enum StructuredReplyType {
    NONE = 0,
    OFFSET_DATA = 1,
    OFFSET_HOLE = 2,
    BLOCK_STATUS = 3,
}

/// Error chunk without offset information.
pub const REPLY_TYPE_ERROR: u16 = REPLY_TYPE_ERR_BIT | 1;
/// Error chunk that pins the error to a byte offset.
pub const REPLY_TYPE_ERROR_OFFSET: u16 = REPLY_TYPE_ERR_BIT | 2;

/// An option as sent by the client during the handshake phase.
#[derive(Debug, Clone)]
pub struct Opt {
    pub typ: OptType,
    pub data: Vec<u8>,
}

impl Opt {
    /// Frame an option with no payload.
    pub fn bare(typ: OptType) -> Self {
        Self { typ, data: vec![] }
    }

    /// Write the option to the stream.
    pub fn put<IO: Write>(&self, mut stream: IO) -> Result<()> {
        // C: 64 bits, 0x49484156454F5054 (ASCII 'IHAVEOPT')
        // C: 32 bits, option
        // C: 32 bits, length of option data (unsigned)
        // C: any data needed for the chosen option, of length as specified above.
        stream.write_u64::<BE>(IHAVEOPT)?;
        stream.write_u32::<BE>(self.typ.into())?;
        stream.write_u32::<BE>(self.data.len() as u32)?;
        stream.write_all(&self.data)?;
        stream.flush()?;
        Ok(())
    }

    /// Read an option from the stream (server side).
    pub fn get<IO: Read>(mut stream: IO) -> Result<Self> {
        let magic = stream.read_u64::<BE>()?;
        if magic != IHAVEOPT {
            return Err(Error::protocol(format!(
                "unexpected option magic {magic:#x}"
            )));
        }
        let option = stream.read_u32::<BE>()?;
        let typ = OptType::try_from(option)
            .map_err(|_| Error::protocol(format!("unexpected option {option}")))?;
        let option_len = stream.read_u32::<BE>()?;
        if option_len > MAX_FRAME_LEN {
            return Err(Error::protocol(format!(
                "option length {option_len} is too large"
            )));
        }
        let mut data = vec![0u8; option_len as usize];
        stream.read_exact(&mut data)?;
        Ok(Self { typ, data })
    }
}

/// Payload of `OPT_SET_META_CONTEXT` / `OPT_LIST_META_CONTEXT`: an export
/// name followed by a list of context queries.
pub fn meta_context_data(export_name: &str, queries: &[String]) -> Vec<u8> {
    let mut data = Vec::with_capacity(8 + export_name.len());
    data.extend_from_slice(&(export_name.len() as u32).to_be_bytes());
    data.extend_from_slice(export_name.as_bytes());
    data.extend_from_slice(&(queries.len() as u32).to_be_bytes());
    for query in queries {
        data.extend_from_slice(&(query.len() as u32).to_be_bytes());
        data.extend_from_slice(query.as_bytes());
    }
    data
}

/// A server reply to any option other than `OPT_EXPORT_NAME`.
#[derive(Debug, Clone)]
pub struct OptReply {
    /// The option id this is a reply to.
    pub option: u32,
    /// Raw reply type; check [`OptReply::is_error`] before converting.
    pub reply_type: u32,
    pub data: Vec<u8>,
}

impl OptReply {
    /// Build an ACK reply (server side).
    pub fn ack(opt: OptType) -> Self {
        Self {
            option: opt.into(),
            reply_type: OptReplyType::ACK.into(),
            data: vec![],
        }
    }

    /// Build a reply carrying data (server side).
    pub fn new(opt: OptType, reply_type: u32, data: Vec<u8>) -> Self {
        Self {
            option: opt.into(),
            reply_type,
            data,
        }
    }

    /// Read one option reply from the stream.
    pub fn get<IO: Read>(mut stream: IO) -> Result<Self> {
        // S: 64 bits, 0x3e889045565a9 (magic number for replies)
        // S: 32 bits, the option as sent by the client to which this is a reply
        // S: 32 bits, reply type
        // S: 32 bits, length of the reply
        // S: any data as required by the reply
        let magic = stream.read_u64::<BE>()?;
        if magic != OPTION_REPLY_MAGIC {
            return Err(Error::protocol(format!(
                "unexpected option reply magic {magic:#x}"
            )));
        }
        let option = stream.read_u32::<BE>()?;
        let reply_type = stream.read_u32::<BE>()?;
        let data_len = stream.read_u32::<BE>()?;
        if data_len > MAX_FRAME_LEN {
            return Err(Error::protocol(format!(
                "option reply length {data_len} is too large"
            )));
        }
        let mut data = vec![0u8; data_len as usize];
        stream.read_exact(&mut data)?;
        Ok(Self {
            option,
            reply_type,
            data,
        })
    }

    /// Write the reply to the stream (server side).
    pub fn put<IO: Write>(&self, mut stream: IO) -> Result<()> {
        stream.write_u64::<BE>(OPTION_REPLY_MAGIC)?;
        stream.write_u32::<BE>(self.option)?;
        stream.write_u32::<BE>(self.reply_type)?;
        stream.write_u32::<BE>(self.data.len() as u32)?;
        stream.write_all(&self.data)?;
        stream.flush()?;
        Ok(())
    }

    /// Whether the server flagged this reply as an error.
    pub fn is_error(&self) -> bool {
        self.reply_type & REP_ERR_BIT != 0
    }

    /// Parse the payload of a `META_CONTEXT` reply.
    pub fn meta_context(&self) -> Result<(u32, String)> {
        if self.data.len() < 4 {
            return Err(Error::protocol("short META_CONTEXT reply"));
        }
        let context_id =
            u32::from_be_bytes([self.data[0], self.data[1], self.data[2], self.data[3]]);
        let name = String::from_utf8(self.data[4..].to_vec())
            .map_err(|_| Error::protocol("non-UTF8 meta context name"))?;
        Ok((context_id, name))
    }
}

/// The export information sent after a successful `OPT_EXPORT_NAME`, and
/// also (preceded by [`OLDSTYLE_MAGIC`]) by an oldstyle server.
#[derive(Debug, Clone, Copy)]
pub struct ExportInfo {
    /// Size of the export in bytes.
    pub size: u64,
    pub transmit_flags: TransmitFlags,
}

impl ExportInfo {
    /// Read the newstyle export info: size, transmission flags, then 124
    /// reserved bytes that are discarded.
    pub fn get<IO: Read>(mut stream: IO) -> Result<Self> {
        // S: 64 bits, size of the export in bytes (unsigned)
        // S: 16 bits, transmission flags
        // S: 124 bytes, zeroes (reserved)
        let size = stream.read_u64::<BE>()?;
        let bits = stream.read_u16::<BE>()?;
        let transmit_flags = TransmitFlags::from_bits_truncate(bits);
        if !transmit_flags.contains(TransmitFlags::HAS_FLAGS) {
            return Err(Error::protocol(format!(
                "transmission flags {bits:#x} lack HAS_FLAGS"
            )));
        }
        let mut zeroes = [0u8; 124];
        stream.read_exact(&mut zeroes)?;
        Ok(Self {
            size,
            transmit_flags,
        })
    }

    /// Read the oldstyle variant: magic, size, 32-bit flags, 124 reserved
    /// bytes.
    pub fn get_oldstyle<IO: Read>(mut stream: IO) -> Result<Self> {
        let magic = stream.read_u64::<BE>()?;
        if magic != OLDSTYLE_MAGIC {
            return Err(Error::protocol(format!(
                "unexpected oldstyle magic {magic:#x}"
            )));
        }
        let size = stream.read_u64::<BE>()?;
        let bits = stream.read_u32::<BE>()?;
        let transmit_flags = TransmitFlags::from_bits_truncate(bits as u16);
        if !transmit_flags.contains(TransmitFlags::HAS_FLAGS) {
            return Err(Error::protocol(format!(
                "oldstyle flags {bits:#x} lack HAS_FLAGS"
            )));
        }
        let mut zeroes = [0u8; 124];
        stream.read_exact(&mut zeroes)?;
        Ok(Self {
            size,
            transmit_flags,
        })
    }

    /// Write the newstyle export info (server side).
    pub fn put<IO: Write>(&self, mut stream: IO) -> Result<()> {
        stream.write_u64::<BE>(self.size)?;
        stream.write_u16::<BE>(self.transmit_flags.bits())?;
        stream.write_all(&[0u8; 124])?;
        stream.flush()?;
        Ok(())
    }
}

/// A transmission-phase request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub flags: CmdFlags,
    pub typ: Cmd,
    pub handle: u64,
    pub offset: u64,
    /// Payload length for READ/BLOCK_STATUS, data length for WRITE.
    pub len: u32,
}

impl Request {
    /// Frame a request with no command flags.
    pub fn new(typ: Cmd, handle: u64, offset: u64, len: u32) -> Self {
        Self {
            flags: CmdFlags::empty(),
            typ,
            handle,
            offset,
            len,
        }
    }

    /// Write the request header, followed by `data` for WRITE requests.
    pub fn put<IO: Write>(&self, data: &[u8], mut stream: IO) -> Result<()> {
        // C: 32 bits, 0x25609513, magic (NBD_REQUEST_MAGIC)
        // C: 16 bits, command flags
        // C: 16 bits, type
        // C: 64 bits, handle
        // C: 64 bits, offset (unsigned)
        // C: 32 bits, length (unsigned)
        // C: (length bytes of data if the request is of type NBD_CMD_WRITE)
        stream.write_u32::<BE>(REQUEST_MAGIC)?;
        stream.write_u16::<BE>(self.flags.bits())?;
        stream.write_u16::<BE>(self.typ.into())?;
        stream.write_u64::<BE>(self.handle)?;
        stream.write_u64::<BE>(self.offset)?;
        stream.write_u32::<BE>(self.len)?;
        stream.write_all(data)?;
        stream.flush()?;
        Ok(())
    }

    /// Read a request, filling `buf` with the payload of a WRITE (server
    /// side).
    pub fn get<IO: Read>(mut stream: IO, buf: &mut Vec<u8>) -> Result<Self> {
        let magic = stream.read_u32::<BE>()?;
        if magic != REQUEST_MAGIC {
            return Err(Error::protocol(format!("wrong request magic {magic:#x}")));
        }
        let flags = stream.read_u16::<BE>()?;
        let flags = CmdFlags::from_bits(flags)
            .ok_or_else(|| Error::protocol(format!("unexpected command flags {flags:#x}")))?;
        let typ = stream.read_u16::<BE>()?;
        let typ =
            Cmd::try_from(typ).map_err(|_| Error::protocol(format!("unexpected command {typ}")))?;
        let handle = stream.read_u64::<BE>()?;
        let offset = stream.read_u64::<BE>()?;
        let len = stream.read_u32::<BE>()?;
        buf.clear();
        if typ == Cmd::WRITE {
            if len > MAX_FRAME_LEN {
                return Err(Error::protocol(format!("write request of length {len}")));
            }
            buf.resize(len as usize, 0);
            stream.read_exact(buf)?;
        }
        Ok(Self {
            flags,
            typ,
            handle,
            offset,
            len,
        })
    }
}

/// Header of a simple (non-structured) reply. Read payloads follow on the
/// wire and are consumed by the caller, which knows the expected length.
#[derive(Debug, Clone, Copy)]
pub struct SimpleReply {
    pub errno: u32,
    pub handle: u64,
}

impl SimpleReply {
    /// Read a simple reply header.
    pub fn get<IO: Read>(mut stream: IO) -> Result<Self> {
        // S: 32 bits, 0x67446698, magic (NBD_SIMPLE_REPLY_MAGIC)
        // S: 32 bits, error (MAY be zero)
        // S: 64 bits, handle
        // S: (length bytes of data if the request is of type NBD_CMD_READ)
        let magic = stream.read_u32::<BE>()?;
        if magic != SIMPLE_REPLY_MAGIC {
            return Err(Error::protocol(format!(
                "wrong simple reply magic {magic:#x}"
            )));
        }
        let errno = stream.read_u32::<BE>()?;
        let handle = stream.read_u64::<BE>()?;
        Ok(Self { errno, handle })
    }

    /// Write a reply header followed by `data` (server side).
    pub fn put<IO: Write>(errno: u32, handle: u64, data: &[u8], mut stream: IO) -> Result<()> {
        stream.write_u32::<BE>(SIMPLE_REPLY_MAGIC)?;
        stream.write_u32::<BE>(errno)?;
        stream.write_u64::<BE>(handle)?;
        stream.write_all(data)?;
        stream.flush()?;
        Ok(())
    }
}

/// One `(length, status)` descriptor from a block status chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockStatusDescriptor {
    /// Length of the described range in bytes.
    pub length: u32,
    /// Context-defined status bits for the range.
    pub status: u32,
}

/// Decoded payload of a structured reply chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkPayload {
    /// No payload (`NBD_REPLY_TYPE_NONE`).
    None,
    /// Data at an absolute offset of the export.
    OffsetData { offset: u64, data: Vec<u8> },
    /// A hole: the given range reads as zeroes.
    OffsetHole { offset: u64, size: u32 },
    /// Block status descriptors for one metadata context.
    BlockStatus {
        context_id: u32,
        descriptors: Vec<BlockStatusDescriptor>,
    },
    /// An error chunk, optionally pinned to an offset.
    Error {
        errno: u32,
        message: String,
        offset: Option<u64>,
    },
    /// A chunk type this client does not interpret.
    Unknown { typ: u16, data: Vec<u8> },
}

/// One chunk of a structured reply series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuredChunk {
    pub flags: StructuredReplyFlags,
    pub handle: u64,
    pub payload: ChunkPayload,
}

impl StructuredChunk {
    /// Whether this is the last chunk of the reply series.
    pub fn is_done(&self) -> bool {
        self.flags.contains(StructuredReplyFlags::DONE)
    }

    /// Read one chunk from the stream.
    pub fn get<IO: Read>(mut stream: IO) -> Result<Self> {
        // S: 32 bits, 0x668e33ef, magic (NBD_STRUCTURED_REPLY_MAGIC)
        // S: 16 bits, flags
        // S: 16 bits, type
        // S: 64 bits, handle
        // S: 32 bits, length of payload (unsigned)
        // S: length bytes of payload data
        let magic = stream.read_u32::<BE>()?;
        if magic != STRUCTURED_REPLY_MAGIC {
            return Err(Error::protocol(format!(
                "wrong structured reply magic {magic:#x}"
            )));
        }
        let flags = stream.read_u16::<BE>()?;
        let flags = StructuredReplyFlags::from_bits_truncate(flags);
        let typ = stream.read_u16::<BE>()?;
        let handle = stream.read_u64::<BE>()?;
        let data_len = stream.read_u32::<BE>()?;
        if data_len > MAX_FRAME_LEN {
            return Err(Error::protocol(format!(
                "structured reply length {data_len} is too large"
            )));
        }
        let mut data = vec![0u8; data_len as usize];
        stream.read_exact(&mut data)?;
        let payload = Self::decode_payload(typ, data)?;
        Ok(Self {
            flags,
            handle,
            payload,
        })
    }

    fn decode_payload(typ: u16, data: Vec<u8>) -> Result<ChunkPayload> {
        if typ & REPLY_TYPE_ERR_BIT != 0 {
            return Self::decode_error(typ, &data);
        }
        let payload = match StructuredReplyType::try_from(typ) {
            Ok(StructuredReplyType::NONE) => ChunkPayload::None,
            Ok(StructuredReplyType::OFFSET_DATA) => {
                if data.len() < 8 {
                    return Err(Error::protocol("short OFFSET_DATA chunk"));
                }
                let offset = u64::from_be_bytes(data[..8].try_into().unwrap());
                ChunkPayload::OffsetData {
                    offset,
                    data: data[8..].to_vec(),
                }
            }
            Ok(StructuredReplyType::OFFSET_HOLE) => {
                if data.len() != 12 {
                    return Err(Error::protocol("malformed OFFSET_HOLE chunk"));
                }
                let offset = u64::from_be_bytes(data[..8].try_into().unwrap());
                let size = u32::from_be_bytes(data[8..12].try_into().unwrap());
                ChunkPayload::OffsetHole { offset, size }
            }
            Ok(StructuredReplyType::BLOCK_STATUS) => {
                if data.len() < 4 || (data.len() - 4) % 8 != 0 {
                    return Err(Error::protocol("malformed BLOCK_STATUS chunk"));
                }
                let context_id = u32::from_be_bytes(data[..4].try_into().unwrap());
                let descriptors = data[4..]
                    .chunks_exact(8)
                    .map(|d| BlockStatusDescriptor {
                        length: u32::from_be_bytes(d[..4].try_into().unwrap()),
                        status: u32::from_be_bytes(d[4..8].try_into().unwrap()),
                    })
                    .collect();
                ChunkPayload::BlockStatus {
                    context_id,
                    descriptors,
                }
            }
            Err(_) => ChunkPayload::Unknown { typ, data },
        };
        Ok(payload)
    }

    fn decode_error(typ: u16, data: &[u8]) -> Result<ChunkPayload> {
        // 32 bits of errno, 16 bits of message length, the message itself,
        // then (for ERROR_OFFSET only) 64 bits of offset
        if data.len() < 6 {
            return Err(Error::protocol("short error chunk"));
        }
        let errno = u32::from_be_bytes(data[..4].try_into().unwrap());
        let message_len = u16::from_be_bytes(data[4..6].try_into().unwrap()) as usize;
        let rest = &data[6..];
        if message_len > rest.len() {
            return Err(Error::protocol("error chunk message length exceeds payload"));
        }
        let message = String::from_utf8_lossy(&rest[..message_len]).into_owned();
        let offset = if typ == REPLY_TYPE_ERROR_OFFSET {
            let tail = &rest[message_len..];
            if tail.len() < 8 {
                return Err(Error::protocol("ERROR_OFFSET chunk lacks offset"));
            }
            Some(u64::from_be_bytes(tail[..8].try_into().unwrap()))
        } else {
            None
        };
        Ok(ChunkPayload::Error {
            errno,
            message,
            offset,
        })
    }

    /// Write a chunk (server side). The payload must already be encoded.
    pub fn put<IO: Write>(
        flags: StructuredReplyFlags,
        typ: u16,
        handle: u64,
        data: &[u8],
        mut stream: IO,
    ) -> Result<()> {
        stream.write_u32::<BE>(STRUCTURED_REPLY_MAGIC)?;
        stream.write_u16::<BE>(flags.bits())?;
        stream.write_u16::<BE>(typ)?;
        stream.write_u64::<BE>(handle)?;
        stream.write_u32::<BE>(data.len() as u32)?;
        stream.write_all(data)?;
        stream.flush()?;
        Ok(())
    }

    /// Encode a block status payload (server side).
    pub fn block_status_data(context_id: u32, descriptors: &[BlockStatusDescriptor]) -> Vec<u8> {
        let mut data = Vec::with_capacity(4 + descriptors.len() * 8);
        data.extend_from_slice(&context_id.to_be_bytes());
        for d in descriptors {
            data.extend_from_slice(&d.length.to_be_bytes());
            data.extend_from_slice(&d.status.to_be_bytes());
        }
        data
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn request_roundtrip() {
        let req = Request::new(Cmd::WRITE, 7, 4096, 3);
        let mut wire = vec![];
        req.put(b"abc", &mut wire).unwrap();

        let mut buf = vec![];
        let parsed = Request::get(Cursor::new(&wire), &mut buf).unwrap();
        assert_eq!(parsed, req);
        assert_eq!(buf, b"abc");
    }

    #[test]
    fn read_request_has_no_payload() {
        let req = Request::new(Cmd::READ, 1, 512, 512);
        let mut wire = vec![];
        req.put(&[], &mut wire).unwrap();

        let mut buf = vec![];
        let parsed = Request::get(Cursor::new(&wire), &mut buf).unwrap();
        assert_eq!(parsed.typ, Cmd::READ);
        assert!(buf.is_empty());
    }

    #[test]
    fn option_reply_roundtrip() {
        let reply = OptReply::ack(OptType::STRUCTURED_REPLY);
        let mut wire = vec![];
        reply.put(&mut wire).unwrap();

        let parsed = OptReply::get(Cursor::new(&wire)).unwrap();
        assert_eq!(parsed.option, u32::from(OptType::STRUCTURED_REPLY));
        assert_eq!(parsed.reply_type, u32::from(OptReplyType::ACK));
        assert!(!parsed.is_error());
    }

    #[test]
    fn option_reply_error_bit() {
        let reply = OptReply::new(OptType::STARTTLS, REP_ERR_BIT | 1, vec![]);
        let mut wire = vec![];
        reply.put(&mut wire).unwrap();
        assert!(OptReply::get(Cursor::new(&wire)).unwrap().is_error());
    }

    #[test]
    fn bad_request_magic() {
        let mut wire = vec![];
        Request::new(Cmd::READ, 1, 0, 512)
            .put(&[], &mut wire)
            .unwrap();
        wire[0] ^= 0xff;
        let mut buf = vec![];
        match Request::get(Cursor::new(&wire), &mut buf) {
            Err(Error::Protocol(_)) => {}
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[test]
    fn block_status_chunk_roundtrip() {
        let descriptors = [
            BlockStatusDescriptor {
                length: 65536,
                status: 1,
            },
            BlockStatusDescriptor {
                length: 131072,
                status: 0,
            },
        ];
        let data = StructuredChunk::block_status_data(2, &descriptors);
        let mut wire = vec![];
        StructuredChunk::put(
            StructuredReplyFlags::DONE,
            StructuredReplyType::BLOCK_STATUS.into(),
            9,
            &data,
            &mut wire,
        )
        .unwrap();

        let chunk = StructuredChunk::get(Cursor::new(&wire)).unwrap();
        assert!(chunk.is_done());
        assert_eq!(chunk.handle, 9);
        match chunk.payload {
            ChunkPayload::BlockStatus {
                context_id,
                descriptors: parsed,
            } => {
                assert_eq!(context_id, 2);
                assert_eq!(parsed, descriptors);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn error_chunk_with_offset() {
        let mut data = vec![];
        data.extend_from_slice(&5u32.to_be_bytes());
        let msg = b"I/O error";
        data.extend_from_slice(&(msg.len() as u16).to_be_bytes());
        data.extend_from_slice(msg);
        data.extend_from_slice(&196608u64.to_be_bytes());
        let mut wire = vec![];
        StructuredChunk::put(
            StructuredReplyFlags::DONE,
            REPLY_TYPE_ERROR_OFFSET,
            3,
            &data,
            &mut wire,
        )
        .unwrap();

        let chunk = StructuredChunk::get(Cursor::new(&wire)).unwrap();
        match chunk.payload {
            ChunkPayload::Error {
                errno,
                message,
                offset,
            } => {
                assert_eq!(errno, 5);
                assert_eq!(message, "I/O error");
                assert_eq!(offset, Some(196608));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn error_chunk_message_too_long() {
        let mut data = vec![];
        data.extend_from_slice(&5u32.to_be_bytes());
        data.extend_from_slice(&100u16.to_be_bytes());
        data.extend_from_slice(b"short");
        let mut wire = vec![];
        StructuredChunk::put(
            StructuredReplyFlags::DONE,
            REPLY_TYPE_ERROR,
            3,
            &data,
            &mut wire,
        )
        .unwrap();
        assert!(matches!(
            StructuredChunk::get(Cursor::new(&wire)),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn meta_context_payload_layout() {
        let data = meta_context_data("export", &["base:allocation".to_string()]);
        assert_eq!(&data[..4], &6u32.to_be_bytes());
        assert_eq!(&data[4..10], b"export");
        assert_eq!(&data[10..14], &1u32.to_be_bytes());
        assert_eq!(&data[14..18], &15u32.to_be_bytes());
        assert_eq!(&data[18..], b"base:allocation");
    }

    #[test]
    fn export_info_rejects_missing_has_flags() {
        let mut wire = vec![];
        wire.extend_from_slice(&4096u64.to_be_bytes());
        wire.extend_from_slice(&0u16.to_be_bytes());
        wire.extend_from_slice(&[0u8; 124]);
        assert!(matches!(
            ExportInfo::get(Cursor::new(&wire)),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn oldstyle_export_info() {
        let mut wire = vec![];
        wire.extend_from_slice(&OLDSTYLE_MAGIC.to_be_bytes());
        wire.extend_from_slice(&1048576u64.to_be_bytes());
        wire.extend_from_slice(&5u32.to_be_bytes()); // HAS_FLAGS | SEND_FLUSH
        wire.extend_from_slice(&[0u8; 124]);
        let info = ExportInfo::get_oldstyle(Cursor::new(&wire)).unwrap();
        assert_eq!(info.size, 1048576);
        assert!(info.transmit_flags.contains(TransmitFlags::SEND_FLUSH));
    }
}
