// The dispatcher and its per-transfer sub-servers.
//
// Only the first packet of a transaction arrives on the main port; every
// packet after that belongs to a transfer identified by its TID, the pair of
// ephemeral UDP ports on either end (RFC 1350). Each accepted RRQ therefore
// gets a freshly bound socket and its own task driving the `Transfer` state
// machine; the dispatcher keeps a map of peer tuples so that a client which
// re-sends to port 69 mid-transfer still reaches its transfer.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant as TokioInstant};

use crate::boot::{ResolveError, Resolver};
use crate::netascii;
use crate::tftp::{ErrorCode, Mode, Packet, PacketError, MAX_PACKET, TSIZE_OPTION};
use crate::transfer::{encode_source, Step, Transfer};

/// How long a shutdown waits for in-flight transfers before forcing the
/// issue.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

type PeerMap = Arc<Mutex<HashMap<SocketAddr, mpsc::Sender<Vec<u8>>>>>;

pub struct TftpServer {
    socket: Arc<UdpSocket>,
    resolver: Arc<dyn Resolver>,
    peers: PeerMap,
}

impl TftpServer {
    /// Wraps an already bound (blocking) UDP socket.
    pub fn new(socket: std::net::UdpSocket, resolver: Arc<dyn Resolver>) -> io::Result<TftpServer> {
        socket.set_nonblocking(true)?;
        Ok(TftpServer {
            socket: Arc::new(UdpSocket::from_std(socket)?),
            resolver,
            peers: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Serves until *shutdown* flips to true, then drains outstanding
    /// transfers for up to `SHUTDOWN_GRACE`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
        info!("listening on {}", self.socket.local_addr()?);
        let mut buf = vec![0u8; MAX_PACKET];
        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    let (len, peer) = received?;
                    self.dispatch(&buf[..len], peer).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.drain().await;
        Ok(())
    }

    async fn dispatch(&self, datagram: &[u8], peer: SocketAddr) {
        // A registered peer's datagrams are forwarded to its transfer task,
        // wherever the client chose to send them.
        let forwarded = {
            let peers = self.peers.lock().unwrap();
            peers
                .get(&peer)
                .map(|tx| tx.try_send(datagram.to_vec()).is_ok())
        };
        match forwarded {
            // Queue full or task just exited: drop, the client will retry.
            Some(_) => (),
            None => self.handle_new(datagram, peer).await,
        }
    }

    async fn handle_new(&self, datagram: &[u8], peer: SocketAddr) {
        let reply = match Packet::parse(datagram) {
            Ok(Packet::ReadReq {
                filename,
                mode,
                options,
            }) => {
                self.start_transfer(filename, mode, options, peer).await;
                None
            }
            Ok(Packet::WriteReq { .. }) => {
                info!("{peer} - WRQ refused");
                Some(Packet::error_with(
                    ErrorCode::IllegalOperation,
                    "write not supported",
                ))
            }
            // An early ERROR means the client no longer wants a transfer we
            // haven't started; nothing to do.
            Ok(Packet::Error { .. }) => None,
            Ok(other) => {
                debug!("{peer} - unexpected {other:?} on main port");
                Some(Packet::error(ErrorCode::IllegalOperation))
            }
            Err(PacketError::UnsupportedMode(mode)) => {
                info!("{peer} - ERROR - unsupported mode {mode:?}");
                Some(Packet::error_with(
                    ErrorCode::IllegalOperation,
                    format!("unsupported transfer mode {mode}"),
                ))
            }
            Err(e) => {
                warn!("{peer} - ERROR - {e}");
                Some(Packet::error_with(
                    ErrorCode::Undefined,
                    format!("invalid request: {e}"),
                ))
            }
        };
        if let Some(packet) = reply {
            let _ = self.socket.send_to(&packet.to_bytes(), peer).await;
        }
    }

    async fn start_transfer(
        &self,
        filename: String,
        mode: Mode,
        options: Vec<(String, String)>,
        peer: SocketAddr,
    ) {
        info!("{peer} - RRQ ({mode:?}) {filename}");
        let source = match self.resolver.resolve(&filename, peer) {
            Ok(source) => source,
            Err(e) => {
                info!("{peer} - ERROR - {e}");
                let packet = match e {
                    ResolveError::NotFound(_) => Packet::error(ErrorCode::FileNotFound),
                    ResolveError::NotPermitted(_) => Packet::error(ErrorCode::AccessViolation),
                    ResolveError::Filesystem(msg) => {
                        Packet::error_with(ErrorCode::Undefined, msg)
                    }
                };
                let _ = self.socket.send_to(&packet.to_bytes(), peer).await;
                return;
            }
        };

        // tsize on a netascii transfer advertises the transformed length,
        // which takes a dedicated scan of the file.
        let wants_tsize = options.iter().any(|(name, _)| name == TSIZE_OPTION);
        let encoded_size = if mode == Mode::Netascii && wants_tsize {
            self.resolver
                .resolve(&filename, peer)
                .ok()
                .and_then(|again| netascii::encoded_len(again.reader).ok())
        } else {
            None
        };
        let (reader, size) = encode_source(source.reader, source.size, mode, encoded_size);

        let transfer = match Transfer::new(reader, size, &options) {
            Ok(transfer) => transfer,
            Err(e) => {
                info!("{peer} - ERROR - {e}");
                let packet = Packet::error_with(ErrorCode::OptionNegotiation, e.to_string());
                let _ = self.socket.send_to(&packet.to_bytes(), peer).await;
                return;
            }
        };

        // The reply must originate from a fresh ephemeral port, not from
        // the main one: that port pair is the transfer's identity.
        let local_ip = match self.socket.local_addr() {
            Ok(addr) => addr.ip(),
            Err(_) => return,
        };
        let ephemeral = match UdpSocket::bind((local_ip, 0)).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!("{peer} - unable to bind ephemeral socket: {e}");
                let packet = Packet::error_with(ErrorCode::Undefined, "server out of ports");
                let _ = self.socket.send_to(&packet.to_bytes(), peer).await;
                return;
            }
        };

        let (tx, rx) = mpsc::channel(8);
        self.peers.lock().unwrap().insert(peer, tx);
        let peers = Arc::clone(&self.peers);
        tokio::spawn(async move {
            run_transfer(ephemeral, peer, transfer, rx).await;
            peers.lock().unwrap().remove(&peer);
        });
    }

    async fn drain(&self) {
        let deadline = TokioInstant::now() + SHUTDOWN_GRACE;
        loop {
            let outstanding = self.peers.lock().unwrap().len();
            if outstanding == 0 {
                return;
            }
            if TokioInstant::now() >= deadline {
                warn!("shutting down with {outstanding} transfers outstanding");
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

enum Event {
    Packet(Packet),
    Malformed,
    WrongPeer(SocketAddr),
    Timeout,
    Lost,
}

async fn run_transfer(
    socket: UdpSocket,
    peer: SocketAddr,
    mut transfer: Transfer,
    mut forwarded: mpsc::Receiver<Vec<u8>>,
) {
    let started = Instant::now();
    let mut buf = vec![0u8; MAX_PACKET];
    let mut deadline = TokioInstant::now() + transfer.timeout();
    let mut step = transfer.start();
    loop {
        match step {
            Step::Send(packet) => {
                if socket.send_to(&packet.to_bytes(), peer).await.is_err() {
                    return;
                }
                deadline = TokioInstant::now() + transfer.timeout();
            }
            // Neither a duplicate ACK nor a stray packet restarts the
            // retransmission clock.
            Step::Duplicate | Step::Ignore => (),
            Step::Done => {
                let secs = started.elapsed().as_secs_f64().max(0.001);
                let bytes = transfer.transferred();
                info!(
                    "{peer} - DONE - {secs:.1} secs, {bytes} bytes, ~{:.1} KiB/s",
                    bytes as f64 / secs / 1024.0
                );
                return;
            }
            Step::Fatal(packet) => {
                warn!("{peer} - FAILED - {packet:?}");
                let _ = socket.send_to(&packet.to_bytes(), peer).await;
                return;
            }
            Step::Terminated => {
                info!("{peer} - aborted by client");
                return;
            }
        }

        let event = tokio::select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok((_, from)) if from != peer => Event::WrongPeer(from),
                Ok((len, _)) => match Packet::parse(&buf[..len]) {
                    Ok(packet) => Event::Packet(packet),
                    Err(e) => {
                        debug!("{peer} - unparseable packet: {e}");
                        Event::Malformed
                    }
                },
                Err(_) => Event::Lost,
            },
            datagram = forwarded.recv() => match datagram {
                Some(data) => match Packet::parse(&data) {
                    Ok(packet) => Event::Packet(packet),
                    Err(e) => {
                        debug!("{peer} - unparseable forwarded packet: {e}");
                        Event::Malformed
                    }
                },
                None => Event::Lost,
            },
            _ = sleep_until(deadline) => Event::Timeout,
        };

        step = match event {
            Event::Packet(packet) => {
                debug!("{peer} -> {packet:?}");
                transfer.on_packet(&packet)
            }
            Event::Malformed => {
                let packet = Packet::error_with(ErrorCode::Undefined, "invalid packet");
                let _ = socket.send_to(&packet.to_bytes(), peer).await;
                Step::Ignore
            }
            // A datagram from some other endpoint entirely: tell them this
            // TID is taken and carry on undisturbed.
            Event::WrongPeer(from) => {
                warn!("{from} - IGNORE - bad client for {peer}");
                let packet = Packet::error(ErrorCode::UnknownTid);
                let _ = socket.send_to(&packet.to_bytes(), from).await;
                Step::Ignore
            }
            Event::Timeout => transfer.on_timeout(),
            Event::Lost => return,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::Source;
    use std::io::Cursor;
    use tokio::time::timeout;

    struct MapResolver(HashMap<String, Vec<u8>>);

    impl MapResolver {
        fn single(name: &str, data: &[u8]) -> MapResolver {
            MapResolver(HashMap::from([(name.to_string(), data.to_vec())]))
        }
    }

    impl Resolver for MapResolver {
        fn resolve(&self, filename: &str, _peer: SocketAddr) -> Result<Source, ResolveError> {
            match self.0.get(filename.trim_start_matches('/')) {
                Some(data) => Ok(Source {
                    reader: Box::new(Cursor::new(data.clone())),
                    size: data.len() as u64,
                }),
                None => Err(ResolveError::NotFound(filename.to_string())),
            }
        }
    }

    struct Harness {
        server_addr: SocketAddr,
        _shutdown: watch::Sender<bool>,
    }

    fn start_server(resolver: MapResolver) -> Harness {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let server_addr = socket.local_addr().unwrap();
        let server = Arc::new(TftpServer::new(socket, Arc::new(resolver)).unwrap());
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            let _ = server.run(rx).await;
        });
        Harness {
            server_addr,
            _shutdown: tx,
        }
    }

    async fn client() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").await.unwrap()
    }

    async fn recv(socket: &UdpSocket) -> (Packet, SocketAddr) {
        let mut buf = vec![0u8; MAX_PACKET];
        let (len, from) = timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
            .await
            .expect("timed out waiting for packet")
            .unwrap();
        (Packet::parse(&buf[..len]).unwrap(), from)
    }

    fn rrq(filename: &str, options: &[(&str, &str)]) -> Vec<u8> {
        Packet::ReadReq {
            filename: filename.to_string(),
            mode: Mode::Octet,
            options: options
                .iter()
                .map(|(n, v)| (n.to_string(), v.to_string()))
                .collect(),
        }
        .to_bytes()
    }

    #[tokio::test]
    async fn test_end_to_end_minimal_transfer() {
        let harness = start_server(MapResolver::single("hello", b"hi\n"));
        let client = client().await;
        client
            .send_to(&rrq("hello", &[]), harness.server_addr)
            .await
            .unwrap();
        let (packet, from) = recv(&client).await;
        // No options: the first reply is DATA(1) straight from a fresh
        // ephemeral port.
        assert_ne!(from, harness.server_addr);
        assert_eq!(
            packet,
            Packet::Data {
                block: 1,
                data: b"hi\n".to_vec(),
            }
        );
        client
            .send_to(&Packet::Ack { block: 1 }.to_bytes(), from)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_end_to_end_blksize_negotiation() {
        let payload = vec![7u8; 1500];
        let harness = start_server(MapResolver::single("kernel.img", &payload));
        let client = client().await;
        client
            .send_to(
                &rrq("kernel.img", &[("blksize", "1024"), ("tsize", "0")]),
                harness.server_addr,
            )
            .await
            .unwrap();
        let (packet, from) = recv(&client).await;
        assert_eq!(
            packet,
            Packet::OptionsAck {
                options: vec![
                    ("blksize".to_string(), "1024".to_string()),
                    ("tsize".to_string(), "1500".to_string()),
                ],
            }
        );
        client
            .send_to(&Packet::Ack { block: 0 }.to_bytes(), from)
            .await
            .unwrap();
        let (packet, _) = recv(&client).await;
        let Packet::Data { block: 1, data } = packet else {
            panic!("expected DATA(1), got {packet:?}");
        };
        assert_eq!(data.len(), 1024);
        client
            .send_to(&Packet::Ack { block: 1 }.to_bytes(), from)
            .await
            .unwrap();
        let (packet, _) = recv(&client).await;
        let Packet::Data { block: 2, data } = packet else {
            panic!("expected DATA(2), got {packet:?}");
        };
        assert_eq!(data.len(), 476);
        client
            .send_to(&Packet::Ack { block: 2 }.to_bytes(), from)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unknown_tid_gets_error_5() {
        let payload = vec![1u8; 2000];
        let harness = start_server(MapResolver::single("file", &payload));
        let client = client().await;
        client
            .send_to(&rrq("file", &[]), harness.server_addr)
            .await
            .unwrap();
        let (_, ephemeral) = recv(&client).await;

        // A different endpoint pokes the transfer's port.
        let intruder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        intruder
            .send_to(&Packet::Ack { block: 1 }.to_bytes(), ephemeral)
            .await
            .unwrap();
        let (packet, _) = recv(&intruder).await;
        assert!(matches!(
            packet,
            Packet::Error {
                code: ErrorCode::UnknownTid,
                ..
            }
        ));

        // The real transfer is unaffected.
        client
            .send_to(&Packet::Ack { block: 1 }.to_bytes(), ephemeral)
            .await
            .unwrap();
        let (packet, _) = recv(&client).await;
        assert!(matches!(packet, Packet::Data { block: 2, .. }));
    }

    #[tokio::test]
    async fn test_wrq_rejected() {
        let harness = start_server(MapResolver::single("file", b"x"));
        let client = client().await;
        let wrq = Packet::WriteReq {
            filename: "file".to_string(),
            mode: Mode::Octet,
            options: vec![],
        };
        client
            .send_to(&wrq.to_bytes(), harness.server_addr)
            .await
            .unwrap();
        let (packet, from) = recv(&client).await;
        assert_eq!(from, harness.server_addr);
        assert!(matches!(
            packet,
            Packet::Error {
                code: ErrorCode::IllegalOperation,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_missing_file_gets_error_1() {
        let harness = start_server(MapResolver::single("present", b"x"));
        let client = client().await;
        client
            .send_to(&rrq("absent", &[]), harness.server_addr)
            .await
            .unwrap();
        let (packet, from) = recv(&client).await;
        assert_eq!(from, harness.server_addr);
        assert!(matches!(
            packet,
            Packet::Error {
                code: ErrorCode::FileNotFound,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_duplicate_ack_no_retransmit() {
        let payload = vec![2u8; 1200];
        let harness = start_server(MapResolver::single("file", &payload));
        let client = client().await;
        client
            .send_to(&rrq("file", &[]), harness.server_addr)
            .await
            .unwrap();
        let (_, ephemeral) = recv(&client).await;
        client
            .send_to(&Packet::Ack { block: 1 }.to_bytes(), ephemeral)
            .await
            .unwrap();
        let (packet, _) = recv(&client).await;
        assert!(matches!(packet, Packet::Data { block: 2, .. }));
        // Re-ACK block 1 twice; no retransmission of DATA(2) may follow.
        for _ in 0..2 {
            client
                .send_to(&Packet::Ack { block: 1 }.to_bytes(), ephemeral)
                .await
                .unwrap();
        }
        let mut buf = vec![0u8; MAX_PACKET];
        let silent = timeout(Duration::from_millis(500), client.recv_from(&mut buf)).await;
        assert!(silent.is_err(), "server retransmitted on a duplicate ACK");
    }
}
