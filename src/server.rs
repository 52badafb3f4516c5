//! A small NBD server used as the test peer for the client.
//!
//! Serves one file-backed export with the fixed-newstyle handshake (plus an
//! oldstyle variant), simple replies for read/write/flush, and structured
//! block-status replies when the extension was negotiated. Every
//! transmission request type is recorded so tests can assert on the wire
//! traffic.

use std::fs::File;
use std::io::{self, Read, Write};
use std::net::TcpListener;
use std::os::unix::prelude::FileExt;
use std::sync::{Arc, Mutex};

use byteorder::{ReadBytesExt, WriteBytesExt, BE};
use log::{info, warn};

use crate::error::{Error, Result};
use crate::proto::*;

const EINVAL: u32 = 22;
const ENOTSUP: u32 = 95;

/// A file to be exported as a block device.
#[derive(Debug)]
pub struct Export {
    pub name: String,
    pub file: File,
}

impl Export {
    fn read(&self, off: u64, len: u32) -> io::Result<Vec<u8>> {
        let mut buf = vec![0; len as usize];
        self.file.read_exact_at(&mut buf, off)?;
        Ok(buf)
    }

    fn write(&self, off: u64, data: &[u8]) -> io::Result<()> {
        self.file.write_all_at(data, off)
    }

    fn flush(&self) -> io::Result<()> {
        self.file.sync_data()
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

/// Server for a single export and a single connection at a time.
#[derive(Debug)]
pub struct Server {
    export: Export,
    /// Block-status descriptors served for BLOCK_STATUS requests.
    status_descriptors: Vec<BlockStatusDescriptor>,
    requests: Arc<Mutex<Vec<Cmd>>>,
}

impl Server {
    fn transmit_flags() -> TransmitFlags {
        TransmitFlags::HAS_FLAGS | TransmitFlags::SEND_FLUSH
    }

    pub fn new(export: Export) -> Self {
        Self {
            export,
            status_descriptors: vec![],
            requests: Arc::new(Mutex::new(vec![])),
        }
    }

    /// Serve the given descriptors (verbatim) for BLOCK_STATUS requests.
    pub fn with_status_descriptors(mut self, descriptors: Vec<BlockStatusDescriptor>) -> Self {
        self.status_descriptors = descriptors;
        self
    }

    /// Handle of the transmission-request log, for test assertions.
    pub fn request_log(&self) -> Arc<Mutex<Vec<Cmd>>> {
        Arc::clone(&self.requests)
    }

    fn initial_handshake<IO: Read + Write>(stream: &mut IO) -> Result<()> {
        stream.write_u64::<BE>(MAGIC)?;
        stream.write_u64::<BE>(IHAVEOPT)?;
        stream.write_u16::<BE>(HandshakeFlags::FIXED_NEWSTYLE.bits())?;
        stream.flush()?;
        let client_flags = stream.read_u32::<BE>()?;
        let client_flags = ClientHandshakeFlags::from_bits(client_flags).ok_or_else(|| {
            Error::protocol(format!("unexpected client flags {client_flags:#x}"))
        })?;
        if !client_flags.contains(ClientHandshakeFlags::C_FIXED_NEWSTYLE) {
            return Err(Error::protocol("client does not support fixed newstyle"));
        }
        Ok(())
    }

    fn send_export_info<IO: Write>(&self, stream: &mut IO) -> Result<()> {
        ExportInfo {
            size: self.export.size()?,
            transmit_flags: Self::transmit_flags(),
        }
        .put(stream)
    }

    /// Reply to one META_CONTEXT query list, assigning context ids in
    /// order, then ACK.
    fn send_meta_contexts<IO: Write>(&self, opt: &Opt, stream: &mut IO) -> Result<()> {
        let queries = parse_meta_context_queries(&opt.data)?;
        for (index, query) in queries.iter().enumerate() {
            let mut data = ((index + 1) as u32).to_be_bytes().to_vec();
            data.extend_from_slice(query.as_bytes());
            OptReply::new(opt.typ, OptReplyType::META_CONTEXT.into(), data).put(&mut *stream)?;
        }
        OptReply::ack(opt.typ).put(stream)
    }

    /// After the initial handshake, haggle options until the client
    /// requests the export (returns whether structured replies were
    /// negotiated) or aborts (returns `None`).
    fn handshake_haggle<IO: Read + Write>(&self, stream: &mut IO) -> Result<Option<bool>> {
        let mut structured = false;
        loop {
            let opt = Opt::get(&mut *stream)?;
            match opt.typ {
                OptType::EXPORT_NAME => {
                    // the requested export name is ignored; there is only
                    // one export
                    self.send_export_info(stream)?;
                    return Ok(Some(structured));
                }
                OptType::STRUCTURED_REPLY => {
                    structured = true;
                    OptReply::ack(opt.typ).put(&mut *stream)?;
                }
                OptType::SET_META_CONTEXT | OptType::LIST_META_CONTEXT => {
                    self.send_meta_contexts(&opt, stream)?;
                }
                OptType::ABORT => {
                    OptReply::ack(opt.typ).put(&mut *stream)?;
                    return Ok(None);
                }
                OptType::STARTTLS => {
                    warn!("client requested TLS, which this server does not offer");
                    OptReply::new(opt.typ, REP_ERR_BIT | 1, vec![]).put(&mut *stream)?;
                }
            }
        }
    }

    fn handle_ops<IO: Read + Write>(&self, structured: bool, stream: &mut IO) -> Result<()> {
        let mut buf = vec![];
        loop {
            let req = Request::get(&mut *stream, &mut buf)?;
            self.requests.lock().unwrap().push(req.typ);
            match req.typ {
                Cmd::READ => match self.export.read(req.offset, req.len) {
                    Ok(data) => SimpleReply::put(0, req.handle, &data, &mut *stream)?,
                    Err(err) => {
                        warn!(target: "nbd", "read error {err}");
                        SimpleReply::put(EINVAL, req.handle, &[], &mut *stream)?;
                    }
                },
                Cmd::WRITE => match self.export.write(req.offset, &buf) {
                    Ok(()) => SimpleReply::put(0, req.handle, &[], &mut *stream)?,
                    Err(err) => {
                        warn!(target: "nbd", "write error {err}");
                        SimpleReply::put(EINVAL, req.handle, &[], &mut *stream)?;
                    }
                },
                Cmd::FLUSH => {
                    self.export.flush()?;
                    SimpleReply::put(0, req.handle, &[], &mut *stream)?;
                }
                Cmd::DISCONNECT => return Ok(()),
                Cmd::BLOCK_STATUS => {
                    if structured {
                        let data =
                            StructuredChunk::block_status_data(1, &self.status_descriptors);
                        StructuredChunk::put(
                            StructuredReplyFlags::DONE,
                            StructuredReplyType::BLOCK_STATUS.into(),
                            req.handle,
                            &data,
                            &mut *stream,
                        )?;
                    } else {
                        SimpleReply::put(ENOTSUP, req.handle, &[], &mut *stream)?;
                    }
                }
            }
        }
    }

    /// Run the fixed-newstyle handshake and serve requests until the
    /// client disconnects.
    pub fn handle_client<IO: Read + Write>(&self, stream: &mut IO) -> Result<()> {
        Self::initial_handshake(stream)?;
        if let Some(structured) = self.handshake_haggle(stream)? {
            info!(target: "nbd", "handshake finished (structured={structured})");
            self.handle_ops(structured, stream)?;
        }
        Ok(())
    }

    /// Serve one client with the oldstyle greeting: size and flags up
    /// front, transmission immediately after.
    pub fn handle_client_oldstyle<IO: Read + Write>(&self, stream: &mut IO) -> Result<()> {
        stream.write_u64::<BE>(MAGIC)?;
        stream.write_u64::<BE>(OLDSTYLE_MAGIC)?;
        stream.write_u64::<BE>(self.export.size()?)?;
        stream.write_u32::<BE>(Self::transmit_flags().bits() as u32)?;
        stream.write_all(&[0u8; 124])?;
        stream.flush()?;
        self.handle_ops(false, stream)
    }

    /// Accept and serve a single connection from the listener.
    pub fn serve_one(&self, listener: &TcpListener) -> Result<()> {
        let (mut stream, peer) = listener.accept()?;
        stream.set_nodelay(true)?;
        info!(target: "nbd", "client connected from {peer}");
        self.handle_client(&mut stream)
    }
}

fn parse_meta_context_queries(data: &[u8]) -> Result<Vec<String>> {
    let take = |data: &[u8], at: usize| -> Result<u32> {
        data.get(at..at + 4)
            .map(|b| u32::from_be_bytes(b.try_into().unwrap()))
            .ok_or_else(|| Error::protocol("short meta context option"))
    };
    let name_len = take(data, 0)? as usize;
    let mut cursor = 4 + name_len;
    let count = take(data, cursor)?;
    cursor += 4;
    let mut queries = vec![];
    for _ in 0..count {
        let len = take(data, cursor)? as usize;
        cursor += 4;
        let bytes = data
            .get(cursor..cursor + len)
            .ok_or_else(|| Error::protocol("short meta context query"))?;
        queries.push(
            String::from_utf8(bytes.to_vec())
                .map_err(|_| Error::protocol("non-UTF8 meta context query"))?,
        );
        cursor += len;
    }
    Ok(queries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_meta_context_queries() {
        let data = meta_context_data(
            "exp",
            &["base:allocation".to_string(), "qemu:dirty".to_string()],
        );
        let queries = parse_meta_context_queries(&data).unwrap();
        assert_eq!(queries, vec!["base:allocation", "qemu:dirty"]);
    }

    #[test]
    fn rejects_truncated_meta_context_option() {
        let data = meta_context_data("exp", &["base:allocation".to_string()]);
        assert!(parse_meta_context_queries(&data[..data.len() - 3]).is_err());
    }
}
