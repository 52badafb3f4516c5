//! Integration tests for the NBD client against the in-process server,
//! covering handshake failures, alignment rules, flush behavior,
//! structured replies, and full/incremental download round trips.

use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::os::unix::prelude::FileExt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use byteorder::{ReadBytesExt, WriteBytesExt, BE};
use tempfile::{NamedTempFile, TempDir};

use cbt_backup::bitmap::BLOCK_SIZE;
use cbt_backup::checksum::{file_checksum, reflink_or_copy};
use cbt_backup::client::{ConnectInfo, HandshakeStyle, NbdClient};
use cbt_backup::download::BlockDownloader;
use cbt_backup::proto::{BlockStatusDescriptor, ChunkPayload, Cmd};
use cbt_backup::server::{Export, Server};
use cbt_backup::writer::OutputMode;
use cbt_backup::xapi::NbdInfo;
use cbt_backup::Error;

const MIB: u64 = 1024 * 1024;

fn export_file(size: u64, fill: u8) -> NamedTempFile {
    let file = NamedTempFile::new().unwrap();
    file.as_file().set_len(size).unwrap();
    if fill != 0 {
        file.as_file()
            .write_all_at(&vec![fill; size as usize], 0)
            .unwrap();
    }
    file
}

fn server_for(file: &NamedTempFile) -> Server {
    let handle = OpenOptions::new()
        .read(true)
        .write(true)
        .open(file.path())
        .unwrap();
    Server::new(Export {
        name: "default".to_string(),
        file: handle,
    })
}

/// Bind an ephemeral port and serve a single connection on a thread.
fn start_server(server: Server) -> (Arc<Server>, SocketAddr, JoinHandle<cbt_backup::Result<()>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(server);
    let worker = Arc::clone(&server);
    let handle = thread::spawn(move || worker.serve_one(&listener));
    (server, addr, handle)
}

fn connect_info(addr: SocketAddr) -> ConnectInfo {
    let mut info = ConnectInfo::to("127.0.0.1");
    info.port = addr.port();
    info
}

fn nbd_info(addr: SocketAddr) -> NbdInfo {
    NbdInfo {
        address: "127.0.0.1".to_string(),
        port: addr.port(),
        exportname: String::new(),
        subject: String::new(),
        cert: String::new(),
    }
}

#[test]
fn rejects_greeting_without_ihaveopt() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let fake = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream.write_u64::<BE>(0x4e42444d41474943).unwrap(); // NBDMAGIC
        stream.write_all(b"NOIHAVEO").unwrap();
        stream.flush().unwrap();
    });

    match NbdClient::connect(&connect_info(addr)) {
        Err(Error::Protocol(_)) => {}
        other => panic!("expected a protocol violation, got {other:?}"),
    }
    fake.join().unwrap();
}

#[test]
fn rejects_reply_to_wrong_option() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let fake = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream.write_u64::<BE>(0x4e42444d41474943).unwrap();
        stream.write_u64::<BE>(0x49484156454F5054).unwrap(); // IHAVEOPT
        stream.write_u16::<BE>(0b01).unwrap();
        let _client_flags = stream.read_u32::<BE>().unwrap();
        // consume the STRUCTURED_REPLY option the client sends
        let _ihaveopt = stream.read_u64::<BE>().unwrap();
        let _option = stream.read_u32::<BE>().unwrap();
        let _len = stream.read_u32::<BE>().unwrap();
        // answer an option the client never sent
        stream.write_u64::<BE>(0x3e889045565a9).unwrap();
        stream.write_u32::<BE>(999).unwrap();
        stream.write_u32::<BE>(1).unwrap(); // ACK
        stream.write_u32::<BE>(0).unwrap();
        stream.flush().unwrap();
    });

    let mut info = connect_info(addr);
    info.structured_reply = true;
    match NbdClient::connect(&info) {
        Err(Error::UnexpectedOptionReply { received: 999, .. }) => {}
        other => panic!("expected an option mismatch, got {other:?}"),
    }
    fake.join().unwrap();
}

#[test]
fn rejects_reply_with_wrong_handle() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let fake = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream.write_u64::<BE>(0x4e42444d41474943).unwrap();
        stream.write_u64::<BE>(0x49484156454F5054).unwrap();
        stream.write_u16::<BE>(0b01).unwrap();
        let _client_flags = stream.read_u32::<BE>().unwrap();
        // EXPORT_NAME option
        let _ihaveopt = stream.read_u64::<BE>().unwrap();
        let _option = stream.read_u32::<BE>().unwrap();
        let len = stream.read_u32::<BE>().unwrap();
        let mut name = vec![0u8; len as usize];
        stream.read_exact(&mut name).unwrap();
        // export info
        stream.write_u64::<BE>(1024 * 1024).unwrap();
        stream.write_u16::<BE>(0b01).unwrap(); // HAS_FLAGS
        stream.write_all(&[0u8; 124]).unwrap();
        stream.flush().unwrap();
        // first request: reply with the wrong handle
        let mut header = [0u8; 28];
        stream.read_exact(&mut header).unwrap();
        stream.write_u32::<BE>(0x67446698).unwrap();
        stream.write_u32::<BE>(0).unwrap();
        stream.write_u64::<BE>(999).unwrap();
        stream.write_all(&[0u8; 512]).unwrap();
        stream.flush().unwrap();
    });

    let mut client = NbdClient::connect(&connect_info(addr)).unwrap();
    match client.read(0, 512) {
        Err(Error::UnexpectedHandle {
            expected: 1,
            received: 999,
        }) => {}
        other => panic!("expected a handle mismatch, got {other:?}"),
    }
    fake.join().unwrap();
}

#[test]
fn unaligned_read_sends_nothing_on_the_socket() {
    let file = export_file(MIB, 0);
    let server = server_for(&file);
    let (server, addr, handle) = start_server(server);

    let mut client = NbdClient::connect(&connect_info(addr)).unwrap();
    match client.read(513, 512) {
        Err(Error::Unaligned { name: "offset", .. }) => {}
        other => panic!("expected Unaligned, got {other:?}"),
    }
    assert!(
        server.request_log().lock().unwrap().is_empty(),
        "no request may reach the server"
    );

    // the connection is still usable after the caller bug
    let data = client.read(512, 512).unwrap();
    assert_eq!(data.len(), 512);
    client.close().unwrap();
    handle.join().unwrap().unwrap();
}

#[test]
fn read_write_flush_roundtrip() {
    let file = export_file(MIB, 0);
    let server = server_for(&file);
    let log = server.request_log();
    let (_server, addr, handle) = start_server(server);

    let mut client = NbdClient::connect(&connect_info(addr)).unwrap();
    assert_eq!(client.size(), MIB);

    // flush before any write is a client-side no-op
    client.flush().unwrap();
    assert!(log.lock().unwrap().is_empty());

    client.write(&[7u8; 1024], 4096).unwrap();
    client.flush().unwrap();
    // a second flush with nothing new written is again a no-op
    client.flush().unwrap();

    let data = client.read(4096, 1024).unwrap();
    assert_eq!(data, vec![7u8; 1024]);

    client.close().unwrap();
    handle.join().unwrap().unwrap();

    assert_eq!(
        log.lock().unwrap().as_slice(),
        &[Cmd::WRITE, Cmd::FLUSH, Cmd::READ, Cmd::DISCONNECT]
    );

    // the write went through to the backing file
    let mut contents = vec![0u8; 1024];
    file.as_file().read_exact_at(&mut contents, 4096).unwrap();
    assert_eq!(contents, vec![7u8; 1024]);
}

#[test]
fn server_errno_does_not_corrupt_the_socket() {
    let file = export_file(MIB, 0x33);
    let server = server_for(&file);
    let (_server, addr, handle) = start_server(server);

    let mut client = NbdClient::connect(&connect_info(addr)).unwrap();
    // read past the end of the export: the server answers with an errno
    match client.read(MIB, 512) {
        Err(Error::Transmission { errno }) => assert_ne!(errno, 0),
        other => panic!("expected a transmission error, got {other:?}"),
    }
    // the next request on the same socket succeeds
    assert_eq!(client.read(0, 512).unwrap(), vec![0x33u8; 512]);
    client.close().unwrap();
    handle.join().unwrap().unwrap();
}

#[test]
fn oldstyle_handshake_enters_transmission_directly() {
    let file = export_file(MIB, 0x42);
    let server = server_for(&file);
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        server.handle_client_oldstyle(&mut stream)
    });

    let mut info = connect_info(addr);
    info.style = HandshakeStyle::Oldstyle;
    let mut client = NbdClient::connect(&info).unwrap();
    assert_eq!(client.size(), MIB);
    assert_eq!(client.read(0, 512).unwrap(), vec![0x42u8; 512]);
    client.close().unwrap();
    handle.join().unwrap().unwrap();
}

#[test]
fn structured_block_status_replies() {
    let file = export_file(MIB, 0);
    let descriptors = vec![
        BlockStatusDescriptor {
            length: 65536,
            status: 1,
        },
        BlockStatusDescriptor {
            length: (MIB - 65536) as u32,
            status: 0,
        },
    ];
    let server = server_for(&file).with_status_descriptors(descriptors.clone());
    let (_server, addr, handle) = start_server(server);

    let mut info = connect_info(addr);
    info.structured_reply = true;
    info.meta_context_queries = vec!["base:allocation".to_string()];
    let mut client = NbdClient::connect(&info).unwrap();
    assert!(client.structured_reply());
    assert_eq!(
        client.meta_contexts(),
        &[(1, "base:allocation".to_string())]
    );

    let chunks: Vec<_> = client
        .query_block_status(0, MIB as u32)
        .unwrap()
        .collect::<cbt_backup::Result<_>>()
        .unwrap();
    assert_eq!(chunks.len(), 1);
    assert!(chunks[0].is_done());
    match &chunks[0].payload {
        ChunkPayload::BlockStatus {
            context_id,
            descriptors: got,
        } => {
            assert_eq!(*context_id, 1);
            assert_eq!(got, &descriptors);
        }
        other => panic!("unexpected payload {other:?}"),
    }

    // the socket is clean after the chunk stream was drained
    assert_eq!(client.read(0, 512).unwrap(), vec![0u8; 512]);
    client.close().unwrap();
    handle.join().unwrap().unwrap();
}

#[test]
fn block_status_requires_negotiation() {
    let file = export_file(MIB, 0);
    let server = server_for(&file);
    let (_server, addr, handle) = start_server(server);

    let mut client = NbdClient::connect(&connect_info(addr)).unwrap();
    assert!(client.query_block_status(0, 65536).is_err());
    client.close().unwrap();
    handle.join().unwrap().unwrap();
}

#[test]
fn full_download_matches_source_checksum() {
    let size = 4 * MIB;
    let file = export_file(size, 0xab);
    let server = server_for(&file);
    let (_server, addr, handle) = start_server(server);

    let dir = TempDir::new().unwrap();
    let out = dir.path().join("data");
    let downloader = BlockDownloader::new(false);
    downloader.download_vdi(&[nbd_info(addr)], &out).unwrap();
    handle.join().unwrap().unwrap();

    assert_eq!(std::fs::metadata(&out).unwrap().len(), size);
    let mut contents = vec![];
    std::fs::File::open(&out)
        .unwrap()
        .read_to_end(&mut contents)
        .unwrap();
    assert!(contents.iter().all(|&b| b == 0xab));
    assert_eq!(
        file_checksum(&out).unwrap(),
        file_checksum(file.path()).unwrap()
    );
}

#[test]
fn large_extents_are_fetched_in_sub_blocks() {
    let file = export_file(MIB, 0x11);
    let server = server_for(&file);
    let log = server.request_log();
    let (_server, addr, handle) = start_server(server);

    let dir = TempDir::new().unwrap();
    let out = dir.path().join("data");
    let mut downloader = BlockDownloader::new(false);
    downloader.block_size = 64 * 1024;
    downloader.download_vdi(&[nbd_info(addr)], &out).unwrap();
    handle.join().unwrap().unwrap();

    let reads = log
        .lock()
        .unwrap()
        .iter()
        .filter(|c| **c == Cmd::READ)
        .count();
    assert_eq!(reads as u64, MIB / (64 * 1024));
    assert_eq!(
        file_checksum(&out).unwrap(),
        file_checksum(file.path()).unwrap()
    );
}

#[test]
fn incremental_download_reconstructs_the_disk() {
    let size = 4 * MIB;

    // the live disk: all zeroes except 0xff in [65536, 131072)
    let live = export_file(size, 0);
    live.as_file()
        .write_all_at(&vec![0xffu8; BLOCK_SIZE as usize], BLOCK_SIZE)
        .unwrap();

    // the local backup of the base snapshot: all zeroes
    let dir = TempDir::new().unwrap();
    let base_backup = dir.path().join("base");
    std::fs::write(&base_backup, vec![0u8; size as usize]).unwrap();

    // block 1 changed between the snapshots
    let mut bitmap = vec![0u8; (size / BLOCK_SIZE / 8) as usize];
    bitmap[0] = 0b0100_0000;
    let bitmap_b64 = {
        use base64::Engine as _;
        base64::engine::general_purpose::STANDARD.encode(&bitmap)
    };

    let server = server_for(&live);
    let (_server, addr, handle) = start_server(server);

    let out = dir.path().join("data");
    reflink_or_copy(&base_backup, &out).unwrap();
    let downloader = BlockDownloader::new(false);
    downloader
        .download_changed_blocks(&bitmap_b64, &[nbd_info(addr)], &out, OutputMode::Overwrite)
        .unwrap();
    handle.join().unwrap().unwrap();

    let mut contents = vec![];
    std::fs::File::open(&out)
        .unwrap()
        .read_to_end(&mut contents)
        .unwrap();
    assert_eq!(contents.len() as u64, size);
    assert_eq!(contents[65535], 0x00);
    assert!(contents[65536..131072].iter().all(|&b| b == 0xff));
    assert_eq!(contents[131072], 0x00);
    assert_eq!(
        file_checksum(&out).unwrap(),
        file_checksum(live.path()).unwrap()
    );
}

#[test]
fn client_drop_closes_the_connection() {
    let file = export_file(MIB, 0);
    let server = server_for(&file);
    let (_server, addr, handle) = start_server(server);

    {
        let mut client = NbdClient::connect(&connect_info(addr)).unwrap();
        client.read(0, 512).unwrap();
        // dropped without an explicit close: the disconnect request still
        // goes out and the server finishes cleanly
    }
    handle.join().unwrap().unwrap();
}
