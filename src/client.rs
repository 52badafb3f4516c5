//! NBD client: handshake state machine, optional TLS upgrade, and the
//! synchronous transmission phase.
//!
//! A client owns its socket exclusively. One request is outstanding at a
//! time, and every reply is matched against the handle of that request.
//! Dropping the client closes the connection (sending a disconnect request
//! first when possible).

use std::io::{self, Cursor, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use byteorder::{ReadBytesExt, WriteBytesExt, BE};
use log::{debug, info, warn};
use rustls::pki_types::ServerName;
use rustls::{ClientConnection, StreamOwned};

use crate::error::{Error, Result};
use crate::proto::*;

/// Which greeting the server is expected to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStyle {
    /// Fixed-newstyle: option haggling, optional TLS, then `OPT_EXPORT_NAME`.
    Newstyle,
    /// Oldstyle: the server sends size and flags immediately. No options,
    /// no TLS.
    Oldstyle,
}

/// Everything needed to reach one export on one server.
#[derive(Debug, Clone)]
pub struct ConnectInfo {
    pub address: String,
    pub port: u16,
    pub exportname: String,
    /// Socket read/write timeout.
    pub timeout: Duration,
    pub use_tls: bool,
    /// PEM CA bundle the server certificate must chain to.
    pub cert: Option<String>,
    /// Expected TLS server name; when empty the dialed address is used.
    pub subject: Option<String>,
    pub style: HandshakeStyle,
    /// Negotiate the structured-reply extension. Downgraded with a warning
    /// if the server rejects it.
    pub structured_reply: bool,
    /// Metadata context queries to activate with `OPT_SET_META_CONTEXT`.
    /// Only sent when the structured-reply negotiation succeeded.
    pub meta_context_queries: Vec<String>,
}

impl ConnectInfo {
    /// Connection info with the defaults: NBD port, empty export name, 60 s
    /// timeout, no TLS, fixed-newstyle handshake.
    pub fn to(address: &str) -> Self {
        Self {
            address: address.to_string(),
            port: TCP_PORT,
            exportname: String::new(),
            timeout: Duration::from_secs(60),
            use_tls: false,
            cert: None,
            subject: None,
            style: HandshakeStyle::Newstyle,
            structured_reply: false,
            meta_context_queries: vec![],
        }
    }
}

/// The transport under the client: plain TCP, or TCP wrapped in TLS after a
/// mid-handshake `OPT_STARTTLS` upgrade.
#[derive(Debug)]
enum Stream {
    Tcp(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            Stream::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            Stream::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.flush(),
            Stream::Tls(s) => s.flush(),
        }
    }
}

/// A connected NBD client bound to one export, in the transmission phase.
#[derive(Debug)]
pub struct NbdClient {
    stream: Option<Stream>,
    size: u64,
    transmit_flags: TransmitFlags,
    handle: u64,
    last_option: u32,
    flushed: bool,
    structured_reply: bool,
    transmission: bool,
    meta_contexts: Vec<(u32, String)>,
}

impl NbdClient {
    /// Connect to the server described by `info`, run the handshake, and
    /// return a client in the transmission phase.
    pub fn connect(info: &ConnectInfo) -> Result<Self> {
        if info.use_tls && info.style == HandshakeStyle::Oldstyle {
            return Err(Error::TlsUnsupported);
        }
        info!(
            "connecting to export '{}' on {}:{}",
            info.exportname, info.address, info.port
        );
        let tcp = Self::dial(&info.address, info.port, info.timeout)?;
        let mut client = NbdClient {
            stream: Some(Stream::Tcp(tcp)),
            size: 0,
            transmit_flags: TransmitFlags::empty(),
            handle: 0,
            last_option: 0,
            flushed: true,
            structured_reply: false,
            transmission: false,
            meta_contexts: vec![],
        };
        match info.style {
            HandshakeStyle::Newstyle => {
                client.newstyle_greeting()?;
                if info.use_tls {
                    client.starttls()?;
                    client.upgrade_to_tls(info)?;
                }
                if info.structured_reply {
                    match client.negotiate_structured_reply() {
                        Ok(()) => {}
                        Err(Error::Option { option, reply }) => {
                            warn!(
                                "server rejected structured replies \
                                 (option {option}, reply {reply:#x}), continuing without"
                            );
                        }
                        Err(err) => return Err(err),
                    }
                    if client.structured_reply && !info.meta_context_queries.is_empty() {
                        client.set_meta_contexts(&info.exportname, &info.meta_context_queries)?;
                    }
                }
                client.request_export(&info.exportname)?;
            }
            HandshakeStyle::Oldstyle => client.oldstyle_greeting()?,
        }
        info!(
            "connected, export size {} bytes, flags {:?}",
            client.size, client.transmit_flags
        );
        Ok(client)
    }

    fn dial(address: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
        let mut last_err: Option<io::Error> = None;
        for addr in (address, port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(tcp) => {
                    tcp.set_read_timeout(Some(timeout))?;
                    tcp.set_write_timeout(Some(timeout))?;
                    tcp.set_nodelay(true)?;
                    return Ok(tcp);
                }
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err
            .map(Error::from)
            .unwrap_or_else(|| Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses resolved for {address}:{port}"),
            ))))
    }

    fn stream(&mut self) -> Result<&mut Stream> {
        self.stream.as_mut().ok_or(Error::Closed)
    }

    // ------------------
    // Handshake phase
    // ------------------

    fn newstyle_greeting(&mut self) -> Result<()> {
        let stream = self.stream()?;
        let magic = stream.read_u64::<BE>()?;
        if magic != MAGIC {
            return Err(Error::protocol(format!("unexpected magic {magic:#x}")));
        }
        let opt_magic = stream.read_u64::<BE>()?;
        if opt_magic != IHAVEOPT {
            return Err(Error::protocol(format!(
                "unexpected IHAVEOPT value {opt_magic:#x}"
            )));
        }
        let bits = stream.read_u16::<BE>()?;
        let flags = HandshakeFlags::from_bits_truncate(bits);
        if !flags.contains(HandshakeFlags::FIXED_NEWSTYLE) {
            return Err(Error::protocol(format!(
                "server handshake flags {bits:#x} lack fixed-newstyle support"
            )));
        }
        stream.write_u32::<BE>(ClientHandshakeFlags::C_FIXED_NEWSTYLE.bits())?;
        stream.flush()?;
        Ok(())
    }

    fn oldstyle_greeting(&mut self) -> Result<()> {
        let stream = self.stream()?;
        let magic = stream.read_u64::<BE>()?;
        if magic != MAGIC {
            return Err(Error::protocol(format!("unexpected magic {magic:#x}")));
        }
        let export = ExportInfo::get_oldstyle(&mut *stream)?;
        self.size = export.size;
        self.transmit_flags = export.transmit_flags;
        self.transmission = true;
        Ok(())
    }

    fn send_option(&mut self, opt: Opt) -> Result<()> {
        debug!(target: "nbd", "sending option {:?} ({} data bytes)", opt.typ, opt.data.len());
        self.last_option = opt.typ.into();
        opt.put(self.stream()?)
    }

    /// Read one option reply and enforce the pairing rules: the reply must
    /// answer the option we last sent, and error replies abort.
    fn recv_option_reply(&mut self) -> Result<OptReply> {
        let expected = self.last_option;
        let reply = OptReply::get(self.stream()?)?;
        debug!(
            target: "nbd",
            "option reply: option {} type {:#x}", reply.option, reply.reply_type
        );
        if reply.option != expected {
            return Err(Error::UnexpectedOptionReply {
                expected,
                received: reply.option,
            });
        }
        if reply.is_error() {
            return Err(Error::Option {
                option: reply.option,
                reply: reply.reply_type,
            });
        }
        Ok(reply)
    }

    fn recv_option_ack(&mut self) -> Result<OptReply> {
        let reply = self.recv_option_reply()?;
        if reply.reply_type != u32::from(OptReplyType::ACK) {
            return Err(Error::protocol(format!(
                "expected ACK, got reply type {:#x}",
                reply.reply_type
            )));
        }
        Ok(reply)
    }

    fn starttls(&mut self) -> Result<()> {
        self.send_option(Opt::bare(OptType::STARTTLS))?;
        let reply = self.recv_option_ack()?;
        if !reply.data.is_empty() {
            return Err(Error::protocol("STARTTLS ack carries data"));
        }
        Ok(())
    }

    /// Wrap the underlying TCP stream in TLS and drive the handshake to
    /// completion. Subsequent negotiation continues over the TLS stream.
    fn upgrade_to_tls(&mut self, info: &ConnectInfo) -> Result<()> {
        let cert = info
            .cert
            .as_deref()
            .ok_or_else(|| Error::Tls("no CA certificate provided".to_string()))?;
        let config = tls_client_config(cert)?;
        let name = match info.subject.as_deref() {
            Some(subject) if !subject.is_empty() => subject,
            _ => info.address.as_str(),
        };
        let server_name = ServerName::try_from(name.to_string())
            .map_err(|_| Error::Tls(format!("invalid TLS server name '{name}'")))?;
        let mut tcp = match self.stream.take() {
            Some(Stream::Tcp(tcp)) => tcp,
            Some(other) => {
                self.stream = Some(other);
                return Err(Error::Tls("connection is already TLS".to_string()));
            }
            None => return Err(Error::Closed),
        };
        let mut conn = ClientConnection::new(Arc::new(config), server_name)
            .map_err(|err| Error::Tls(err.to_string()))?;
        while conn.is_handshaking() {
            conn.complete_io(&mut tcp).map_err(|err| match err.kind() {
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Error::Timeout,
                io::ErrorKind::UnexpectedEof => Error::Eof,
                _ => Error::Tls(err.to_string()),
            })?;
        }
        info!("upgraded NBD connection to TLS");
        self.stream = Some(Stream::Tls(Box::new(StreamOwned::new(conn, tcp))));
        Ok(())
    }

    /// Negotiate the structured-reply extension.
    fn negotiate_structured_reply(&mut self) -> Result<()> {
        self.send_option(Opt::bare(OptType::STRUCTURED_REPLY))?;
        self.recv_option_ack()?;
        self.structured_reply = true;
        Ok(())
    }

    /// Change the set of active metadata contexts. The negotiated
    /// `(context_id, name)` pairs are available via [`Self::meta_contexts`].
    fn set_meta_contexts(&mut self, export_name: &str, queries: &[String]) -> Result<()> {
        self.send_option(Opt {
            typ: OptType::SET_META_CONTEXT,
            data: meta_context_data(export_name, queries),
        })?;
        self.meta_contexts = self.drain_meta_context_replies()?;
        Ok(())
    }

    /// List the metadata contexts the export offers for the given queries.
    /// Only valid during the handshake phase.
    pub fn list_meta_contexts(
        &mut self,
        export_name: &str,
        queries: &[String],
    ) -> Result<Vec<(u32, String)>> {
        if self.transmission {
            return Err(Error::protocol(
                "meta context listing is only valid during the handshake phase",
            ));
        }
        self.send_option(Opt {
            typ: OptType::LIST_META_CONTEXT,
            data: meta_context_data(export_name, queries),
        })?;
        self.drain_meta_context_replies()
    }

    fn drain_meta_context_replies(&mut self) -> Result<Vec<(u32, String)>> {
        let mut contexts = vec![];
        loop {
            let reply = self.recv_option_reply()?;
            if reply.reply_type == u32::from(OptReplyType::ACK) {
                return Ok(contexts);
            }
            if reply.reply_type != u32::from(OptReplyType::META_CONTEXT) {
                return Err(Error::protocol(format!(
                    "expected META_CONTEXT reply, got {:#x}",
                    reply.reply_type
                )));
            }
            contexts.push(reply.meta_context()?);
        }
    }

    /// Request the export and enter the transmission phase.
    fn request_export(&mut self, exportname: &str) -> Result<()> {
        self.send_option(Opt {
            typ: OptType::EXPORT_NAME,
            data: exportname.as_bytes().to_vec(),
        })?;
        // the server answers EXPORT_NAME with export info directly, not
        // with an option reply
        let export = ExportInfo::get(self.stream()?)?;
        self.size = export.size;
        self.transmit_flags = export.transmit_flags;
        self.transmission = true;
        Ok(())
    }

    // ------------------
    // Transmission phase
    // ------------------

    /// Size of the export in bytes, as reported by the server.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Metadata contexts activated during negotiation.
    pub fn meta_contexts(&self) -> &[(u32, String)] {
        &self.meta_contexts
    }

    /// Whether the structured-reply extension was negotiated.
    pub fn structured_reply(&self) -> bool {
        self.structured_reply
    }

    fn check_aligned(name: &'static str, value: u64) -> Result<()> {
        if value % 512 != 0 {
            return Err(Error::Unaligned { name, value });
        }
        Ok(())
    }

    fn ensure_transmission(&self) -> Result<()> {
        if self.stream.is_none() {
            return Err(Error::Closed);
        }
        if !self.transmission {
            return Err(Error::protocol("client is not in the transmission phase"));
        }
        Ok(())
    }

    fn next_handle(&mut self) -> u64 {
        self.handle += 1;
        self.handle
    }

    fn send_request(&mut self, typ: Cmd, offset: u64, len: u32, data: &[u8]) -> Result<u64> {
        let handle = self.next_handle();
        debug!(
            target: "nbd",
            "{typ:?} handle={handle} offset={offset} len={len}"
        );
        Request::new(typ, handle, offset, len).put(data, self.stream()?)?;
        Ok(handle)
    }

    fn check_handle(&self, received: u64) -> Result<()> {
        if received != self.handle {
            return Err(Error::UnexpectedHandle {
                expected: self.handle,
                received,
            });
        }
        Ok(())
    }

    /// Read a simple reply header, verify the handle, and consume
    /// `data_len` payload bytes into a fresh buffer. An error reply carries
    /// no payload and leaves the socket ready for the next request.
    fn recv_simple_reply(&mut self, data_len: u32) -> Result<Vec<u8>> {
        let reply = SimpleReply::get(self.stream()?)?;
        self.check_handle(reply.handle)?;
        if reply.errno != 0 {
            return Err(Error::Transmission { errno: reply.errno });
        }
        let mut data = vec![0u8; data_len as usize];
        self.stream()?.read_exact(&mut data)?;
        Ok(data)
    }

    /// Read exactly `length` bytes starting at `offset`. Both arguments
    /// must be multiples of 512.
    pub fn read(&mut self, offset: u64, length: u32) -> Result<Vec<u8>> {
        Self::check_aligned("offset", offset)?;
        Self::check_aligned("length", length as u64)?;
        self.ensure_transmission()?;
        self.send_request(Cmd::READ, offset, length, &[])?;
        self.recv_simple_reply(length)
    }

    /// Write `data` at `offset`. Offset and data length must be multiples
    /// of 512. Returns once the server has acknowledged the write.
    pub fn write(&mut self, data: &[u8], offset: u64) -> Result<()> {
        Self::check_aligned("offset", offset)?;
        Self::check_aligned("size", data.len() as u64)?;
        self.ensure_transmission()?;
        self.flushed = false;
        self.send_request(Cmd::WRITE, offset, data.len() as u32, data)?;
        self.recv_simple_reply(0)?;
        Ok(())
    }

    /// Flush completed writes to stable storage. A no-op if the server did
    /// not advertise `SEND_FLUSH` or nothing was written since the last
    /// flush.
    pub fn flush(&mut self) -> Result<()> {
        self.ensure_transmission()?;
        if self.flushed || !self.transmit_flags.contains(TransmitFlags::SEND_FLUSH) {
            self.flushed = true;
            return Ok(());
        }
        self.send_request(Cmd::FLUSH, 0, 0, &[])?;
        self.recv_simple_reply(0)?;
        self.flushed = true;
        Ok(())
    }

    /// Query block status for the given range. Returns a lazy sequence of
    /// structured reply chunks; the caller must consume it to completion
    /// (the socket carries the remaining chunks until the DONE flag).
    pub fn query_block_status(&mut self, offset: u64, length: u32) -> Result<StructuredReplies<'_>> {
        self.ensure_transmission()?;
        if !self.structured_reply {
            return Err(Error::protocol(
                "block status requires the structured-reply extension",
            ));
        }
        self.send_request(Cmd::BLOCK_STATUS, offset, length, &[])?;
        Ok(StructuredReplies {
            client: self,
            done: false,
        })
    }

    /// Flush if dirty, tell the peer we are leaving (a disconnect request
    /// in the transmission phase, `OPT_ABORT` before it), and release the
    /// socket. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if self.stream.is_none() {
            return Ok(());
        }
        let result = (|| {
            if self.transmission {
                if !self.flushed {
                    self.flush()?;
                }
                let handle = self.next_handle();
                debug!(target: "nbd", "DISCONNECT handle={handle}");
                Request::new(Cmd::DISCONNECT, handle, 0, 0).put(&[], self.stream()?)?;
            } else {
                Opt::bare(OptType::ABORT).put(self.stream()?)?;
            }
            Ok(())
        })();
        self.stream = None;
        result
    }
}

impl Drop for NbdClient {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!("error closing NBD client: {err}");
        }
    }
}

/// Lazy structured-reply chunk sequence for one request. Iteration ends
/// after the chunk carrying the DONE flag.
pub struct StructuredReplies<'a> {
    client: &'a mut NbdClient,
    done: bool,
}

impl Iterator for StructuredReplies<'_> {
    type Item = Result<StructuredChunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let chunk = (|| {
            let stream = self.client.stream()?;
            let chunk = StructuredChunk::get(stream)?;
            self.client.check_handle(chunk.handle)?;
            Ok(chunk)
        })();
        match chunk {
            Ok(chunk) => {
                self.done = chunk.is_done();
                Some(Ok(chunk))
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

fn tls_client_config(cert_pem: &str) -> Result<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut Cursor::new(cert_pem.as_bytes())) {
        let cert = cert.map_err(|err| Error::Tls(format!("invalid CA bundle: {err}")))?;
        roots
            .add(cert)
            .map_err(|err| Error::Tls(format!("unusable CA certificate: {err}")))?;
    }
    if roots.is_empty() {
        return Err(Error::Tls("CA bundle contains no certificates".to_string()));
    }
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    // TLS 1.2 minimum; the default version set is 1.2 and 1.3
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|err| Error::Tls(err.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn closed_client() -> NbdClient {
        NbdClient {
            stream: None,
            size: 0,
            transmit_flags: TransmitFlags::empty(),
            handle: 0,
            last_option: 0,
            flushed: true,
            structured_reply: false,
            transmission: true,
            meta_contexts: vec![],
        }
    }

    #[test]
    fn unaligned_arguments_fail_before_any_io() {
        let mut client = closed_client();
        // alignment is checked before the socket is touched, so even a
        // closed client reports the caller bug
        match client.read(513, 512) {
            Err(Error::Unaligned { name, value }) => {
                assert_eq!(name, "offset");
                assert_eq!(value, 513);
            }
            other => panic!("expected Unaligned, got {other:?}"),
        }
        match client.write(&[0u8; 100], 512) {
            Err(Error::Unaligned { name, value }) => {
                assert_eq!(name, "size");
                assert_eq!(value, 100);
            }
            other => panic!("expected Unaligned, got {other:?}"),
        }
    }

    #[test]
    fn operations_after_close_are_rejected() {
        let mut client = closed_client();
        assert!(matches!(client.read(0, 512), Err(Error::Closed)));
        assert!(matches!(client.flush(), Err(Error::Closed)));
        // close is idempotent
        client.close().unwrap();
        client.close().unwrap();
    }

    #[test]
    fn oldstyle_with_tls_is_rejected() {
        let mut info = ConnectInfo::to("localhost");
        info.style = HandshakeStyle::Oldstyle;
        info.use_tls = true;
        assert!(matches!(
            NbdClient::connect(&info),
            Err(Error::TlsUnsupported)
        ));
    }

    #[test]
    fn tls_config_rejects_empty_bundle() {
        assert!(matches!(tls_client_config(""), Err(Error::Tls(_))));
    }
}
