//! InboundAdapter - listening sockets, accept/read loops and UDP write-back
//!
//! TCP: one accept loop; every connection runs its handler in its own task.
//!
//! UDP: one read loop plus one write-back task. Replies are queued by
//! `InboundPacketConn::write_packet` and written by the write-back task, so
//! any number of flows may reply concurrently. When the read loop ends the
//! queue is closed: senders fail fast with `Error::Closed` and whatever is
//! still queued is dropped unwritten.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock as SyncRwLock};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{ConnectionHandler, ListenOptions, PacketData, PacketHandler};
use crate::app::metrics::{
    INBOUND_CONNECTIONS_ACTIVE, INBOUND_CONNECTIONS_TOTAL, INBOUND_ERRORS_TOTAL,
    INBOUND_PACKETS_TOTAL,
};
use crate::common::{
    Address, IntoStream, Metadata, Network, PacketConn, SharedPacketConn, MAX_PACKET_SIZE,
};
use crate::error::{Error, Result};

/// Write-back queue depth; senders wait when it is full
const WRITE_BACK_QUEUE_SIZE: usize = 128;

const TCP_LISTEN_BACKLOG: i32 = 1024;

/// Pending TCP fast open requests on the listener
#[cfg(target_os = "linux")]
const TCP_FASTOPEN_QUEUE: libc::c_int = 256;

/// A reply datagram waiting for the write-back task
#[derive(Debug)]
pub struct PendingPacket {
    pub buffer: Bytes,
    pub destination: Address,
}

/// Log a handler failure; closed connections are routine and stay at debug
fn report_error(tag: &str, err: Error) {
    if err.is_closed() {
        debug!("[{}] connection closed: {}", tag, err);
        return;
    }
    INBOUND_ERRORS_TOTAL.with_label_values(&[tag]).inc();
    error!("[{}] {}", tag, err);
}

fn canonical(addr: SocketAddr) -> SocketAddr {
    SocketAddr::new(addr.ip().to_canonical(), addr.port())
}

/// Resolve once `flag` is set; the watch guard never outlives the call
async fn signalled(flag: &mut watch::Receiver<bool>) {
    let _ = flag.wait_for(|set| *set).await;
}

fn listen_tcp(addr: SocketAddr, fast_open: bool) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if addr.is_ipv6() && addr.ip().is_unspecified() {
        socket.set_only_v6(false)?;
    }
    if fast_open {
        set_tcp_fast_open(&socket)?;
    }
    socket.bind(&addr.into())?;
    socket.listen(TCP_LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    TcpListener::from_std(socket.into())
}

#[cfg(target_os = "linux")]
fn set_tcp_fast_open(socket: &Socket) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    let queue = TCP_FASTOPEN_QUEUE;
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_FASTOPEN,
            std::ptr::addr_of!(queue).cast::<libc::c_void>(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_tcp_fast_open(_socket: &Socket) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "tcp fast open is only supported on linux",
    ))
}

fn listen_udp(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if addr.is_ipv6() && addr.ip().is_unspecified() {
        socket.set_only_v6(false)?;
    }
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

/// Packet connection over the inbound's UDP socket.
///
/// Reads go straight to the socket; writes are queued for the write-back task.
pub struct InboundPacketConn {
    tag: String,
    /// Taken once both loops have stopped, which unbinds the port
    socket: SyncRwLock<Option<Arc<UdpSocket>>>,
    /// Fixed when the socket is opened: IPv4 destinations are written as
    /// IPv4-mapped IPv6 addresses
    force_ipv6: bool,
    queue: mpsc::Sender<PendingPacket>,
    /// Senders hold the read lock from the check through the enqueue
    closed: RwLock<bool>,
    /// Fired before `closed` is set, so blocked senders give up their lock
    closed_signal: watch::Sender<bool>,
    /// Asks the read loop to stop
    stop: watch::Sender<bool>,
}

impl InboundPacketConn {
    pub fn new(tag: impl Into<String>, socket: UdpSocket) -> Result<(Arc<Self>, mpsc::Receiver<PendingPacket>)> {
        let force_ipv6 = socket.local_addr()?.is_ipv6();
        let (queue, rx) = mpsc::channel(WRITE_BACK_QUEUE_SIZE);
        let conn = Arc::new(Self {
            tag: tag.into(),
            socket: SyncRwLock::new(Some(Arc::new(socket))),
            force_ipv6,
            queue,
            closed: RwLock::new(false),
            closed_signal: watch::channel(false).0,
            stop: watch::channel(false).0,
        });
        Ok((conn, rx))
    }

    fn socket(&self) -> Result<Arc<UdpSocket>> {
        self.socket.read().clone().ok_or(Error::Closed)
    }

    /// Drop the socket; later reads and writes fail with `Error::Closed`
    pub(crate) fn release(&self) {
        self.socket.write().take();
    }

    /// Mark the write side closed.
    ///
    /// The signal fires first: senders waiting on a full queue abort and the
    /// write-back task starts draining. The write lock then waits out senders
    /// already past the check. Idempotent.
    pub async fn signal_closed(&self) {
        self.closed_signal.send_replace(true);
        let mut closed = self.closed.write().await;
        *closed = true;
    }

    pub async fn is_closed(&self) -> bool {
        *self.closed.read().await
    }

    async fn write_back(&self, packet: PendingPacket) -> Result<()> {
        let PendingPacket {
            buffer,
            destination,
        } = packet;

        let target = match destination {
            Address::Socket(addr) => addr,
            Address::Domain(domain, port) => tokio::net::lookup_host((domain.as_str(), port))
                .await?
                .next()
                .ok_or_else(|| Error::Dns(format!("no addresses for {}", domain)))?,
        };
        let target = match target {
            SocketAddr::V4(v4) if self.force_ipv6 => {
                SocketAddr::new(IpAddr::V6(v4.ip().to_ipv6_mapped()), v4.port())
            }
            other => other,
        };

        self.socket()?.send_to(&buffer, target).await?;
        Ok(())
    }

    /// Write queued packets until closure, then drop the rest unwritten
    async fn run_write_back(self: Arc<Self>, mut queue: mpsc::Receiver<PendingPacket>) {
        let mut closed = self.closed_signal.subscribe();

        loop {
            tokio::select! {
                biased;
                _ = signalled(&mut closed) => break,
                packet = queue.recv() => match packet {
                    Some(packet) => {
                        if let Err(e) = self.write_back(packet).await {
                            if !e.is_closed() {
                                warn!("[{}] write back udp: {}", self.tag, e);
                            }
                        }
                    }
                    None => return,
                },
            }
        }

        queue.close();
        let mut dropped = 0usize;
        while let Ok(packet) = queue.try_recv() {
            drop(packet);
            dropped += 1;
        }
        debug!("[{}] write-back stopped, {} queued packets dropped", self.tag, dropped);
    }
}

#[async_trait]
impl PacketConn for InboundPacketConn {
    async fn read_packet(&self, buf: &mut [u8]) -> Result<(usize, Address)> {
        let mut stop = self.stop.subscribe();
        if *stop.borrow() {
            return Err(Error::Closed);
        }
        let socket = self.socket()?;
        tokio::select! {
            result = socket.recv_from(buf) => {
                let (n, from) = result?;
                Ok((n, Address::Socket(canonical(from))))
            }
            _ = signalled(&mut stop) => Err(Error::Closed),
        }
    }

    async fn write_packet(&self, payload: Bytes, destination: Address) -> Result<()> {
        let mut closing = self.closed_signal.subscribe();
        let closed = self.closed.read().await;
        if *closed || *closing.borrow() {
            return Err(Error::Closed);
        }
        let packet = PendingPacket {
            buffer: payload,
            destination,
        };
        let result = tokio::select! {
            biased;
            _ = signalled(&mut closing) => Err(Error::Closed),
            sent = self.queue.send(packet) => sent.map_err(|_| Error::Closed),
        };
        drop(closed);
        result
    }

    /// Stops the inbound's UDP side; replies fail once the read loop exits
    fn close(&self) -> Result<()> {
        self.stop.send_replace(true);
        Ok(())
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket()?.local_addr()?)
    }

    /// Writes are queued, so concurrent callers need no serialization
    fn write_is_thread_unsafe(&self) -> bool {
        false
    }
}

struct Running {
    stop: watch::Sender<bool>,
    tcp_addr: Option<SocketAddr>,
    udp: Option<Arc<InboundPacketConn>>,
    tasks: Vec<JoinHandle<()>>,
}

/// Listening sockets of one inbound and the loops serving them
pub struct InboundAdapter {
    protocol: &'static str,
    networks: Vec<Network>,
    tag: String,
    listen: ListenOptions,
    connection_handler: Option<Arc<dyn ConnectionHandler>>,
    packet_handler: Option<Arc<dyn PacketHandler>>,
    running: Mutex<Option<Running>>,
}

impl InboundAdapter {
    pub fn new(
        protocol: &'static str,
        networks: Vec<Network>,
        tag: impl Into<String>,
        listen: ListenOptions,
    ) -> Self {
        Self {
            protocol,
            networks,
            tag: tag.into(),
            listen,
            connection_handler: None,
            packet_handler: None,
            running: Mutex::new(None),
        }
    }

    pub fn with_connection_handler(mut self, handler: Arc<dyn ConnectionHandler>) -> Self {
        self.connection_handler = Some(handler);
        self
    }

    pub fn with_packet_handler(mut self, handler: Arc<dyn PacketHandler>) -> Self {
        self.packet_handler = Some(handler);
        self
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn protocol(&self) -> &'static str {
        self.protocol
    }

    pub fn networks(&self) -> &[Network] {
        &self.networks
    }

    /// Bound TCP address once started
    pub fn tcp_local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref()?.tcp_addr
    }

    /// Bound UDP address once started
    pub fn udp_local_addr(&self) -> Option<SocketAddr> {
        let running = self.running.lock();
        running.as_ref()?.udp.as_ref()?.local_addr().ok()
    }

    /// Open every configured socket and start serving.
    ///
    /// Sockets are all opened before any loop starts; if one fails the
    /// others are dropped again and the adapter stays stopped.
    pub fn start(&self) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }

        let bind = self.listen.socket_addr();

        let tcp = if self.networks.contains(&Network::Tcp) {
            let handler = self.connection_handler.clone().ok_or_else(|| {
                Error::Config(format!("[{}] tcp enabled without a connection handler", self.tag))
            })?;
            let listener = listen_tcp(bind, self.listen.tcp_fast_open)
                .map_err(|e| Error::from(e).cause(format!("listen tcp {}", bind)))?;
            Some((listener, handler))
        } else {
            None
        };

        let udp = if self.networks.contains(&Network::Udp) {
            let handler = self.packet_handler.clone().ok_or_else(|| {
                Error::Config(format!("[{}] udp enabled without a packet handler", self.tag))
            })?;
            let socket = listen_udp(bind).map_err(|e| Error::from(e).cause(format!("listen udp {}", bind)))?;
            let (conn, queue) = InboundPacketConn::new(self.tag.clone(), socket)?;
            Some((conn, queue, handler))
        } else {
            None
        };

        let (stop, _) = watch::channel(false);
        let mut tasks = Vec::new();
        let mut tcp_addr = None;
        let mut listen_addr = None;

        if let Some((listener, handler)) = tcp {
            let addr = listener.local_addr()?;
            tcp_addr = Some(addr);
            listen_addr = Some(addr);
            tasks.push(tokio::spawn(loop_tcp_in(
                listener,
                handler,
                self.tag.clone(),
                self.protocol,
                stop.subscribe(),
            )));
        }

        let udp_conn = match udp {
            Some((conn, queue, handler)) => {
                listen_addr.get_or_insert(conn.local_addr()?);
                // Closing the packet conn stops the read loop like adapter close does
                let mut conn_stop = conn.stop.subscribe();
                let adapter_stop = stop.subscribe();
                let relay = conn.stop.clone();
                tasks.push(tokio::spawn(async move {
                    let mut adapter_stop = adapter_stop;
                    tokio::select! {
                        _ = signalled(&mut adapter_stop) => { relay.send_replace(true); }
                        _ = signalled(&mut conn_stop) => {}
                    }
                }));
                tasks.push(tokio::spawn(conn.clone().run_write_back(queue)));
                tasks.push(tokio::spawn(loop_udp_in(
                    conn.clone(),
                    handler,
                    self.tag.clone(),
                    self.protocol,
                )));
                Some(conn)
            }
            None => None,
        };

        if let Some(addr) = listen_addr {
            info!("[{}] {} inbound started at {}", self.tag, self.protocol, addr);
        }

        *running = Some(Running {
            stop,
            tcp_addr,
            udp: udp_conn,
            tasks,
        });
        Ok(())
    }

    /// Stop both loops, wait for them and release the sockets; safe to call
    /// more than once.
    ///
    /// TCP connections already handed to the handler keep running; UDP flows
    /// end with the packet handler's `close`.
    pub async fn close(&self) -> Result<()> {
        let running = self.running.lock().take();
        let Some(running) = running else {
            return Ok(());
        };

        running.stop.send_replace(true);
        if let Some(conn) = &running.udp {
            conn.close()?;
        }

        let mut first_error = None;
        for task in running.tasks {
            if let Err(e) = task.await {
                let e = Error::Protocol(format!("inbound task failed: {}", e));
                error!("[{}] close: {}", self.tag, e);
                first_error.get_or_insert(e);
            }
        }

        if let Some(conn) = &running.udp {
            conn.release();
            if let Some(handler) = &self.packet_handler {
                handler.close();
            }
        }
        info!("[{}] inbound closed", self.tag);

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

async fn loop_tcp_in(
    listener: TcpListener,
    handler: Arc<dyn ConnectionHandler>,
    tag: String,
    protocol: &'static str,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let (stream, source) = tokio::select! {
            result = listener.accept() => match result {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("[{}] accept failed, tcp loop stopped: {}", tag, e);
                    return;
                }
            },
            _ = signalled(&mut stop) => return,
        };

        INBOUND_CONNECTIONS_TOTAL.with_label_values(&[&tag]).inc();
        let handler = handler.clone();
        let tag = tag.clone();
        tokio::spawn(async move {
            let _ = stream.set_nodelay(true);
            let source = canonical(source);
            let metadata = Metadata::new(tag.clone(), Network::Tcp, source).with_inbound_type(protocol);
            info!("[{}] inbound connection from {}", tag, source);

            let active = INBOUND_CONNECTIONS_ACTIVE.with_label_values(&[&tag]);
            active.inc();
            let result = handler.new_connection(stream.into_stream(), metadata).await;
            active.dec();

            if let Err(e) = result {
                report_error(&tag, e.cause(format!("process connection from {}", source)));
            }
        });
    }
}

/// Read datagrams until the socket fails or a stop is requested, then close
/// the write side.
///
/// One read buffer is reused; owned-mode handlers get an exact-size copy of
/// each datagram.
async fn loop_udp_in(
    conn: Arc<InboundPacketConn>,
    handler: Arc<dyn PacketHandler>,
    tag: String,
    protocol: &'static str,
) {
    let shared: SharedPacketConn = conn.clone();
    let mut stop = conn.stop.subscribe();
    let packets = INBOUND_PACKETS_TOTAL.with_label_values(&[&tag]);
    let exclusive = handler.requires_exclusive_buffer();

    if let Ok(socket) = conn.socket() {
        let mut buffer = vec![0u8; MAX_PACKET_SIZE];
        loop {
            let (n, source) = tokio::select! {
                result = socket.recv_from(&mut buffer) => match result {
                    Ok(received) => received,
                    Err(e) => {
                        debug!("[{}] udp read stopped: {}", tag, e);
                        break;
                    }
                },
                _ = signalled(&mut stop) => break,
            };
            packets.inc();

            let source = canonical(source);
            let metadata = Metadata::new(tag.clone(), Network::Udp, source).with_inbound_type(protocol);
            let packet = if exclusive {
                PacketData::Borrowed(&buffer[..n])
            } else {
                PacketData::Owned(Bytes::copy_from_slice(&buffer[..n]))
            };
            if let Err(e) = handler.new_packet(shared.clone(), packet, metadata).await {
                warn!("[{}] process packet from {}: {}", tag, source, e);
            }
        }
    }

    conn.signal_closed().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Stream;
    use std::net::{Ipv4Addr, Ipv6Addr};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn loopback() -> ListenOptions {
        ListenOptions::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
    }

    /// Fails the first connection, echoes the rest
    struct FlakyEcho {
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl ConnectionHandler for FlakyEcho {
        async fn new_connection(&self, mut stream: Stream, metadata: Metadata) -> Result<()> {
            assert_eq!(metadata.network, Network::Tcp);
            assert_eq!(metadata.inbound_tag, "test-in");
            if self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                return Err(Error::Protocol("bad handshake".into()));
            }
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await?;
            stream.write_all(&buf).await?;
            Ok(())
        }
    }

    /// Records packets; with `exclusive` it asks for the borrowed buffer mode
    struct Recorder {
        exclusive: bool,
        seen: tokio::sync::mpsc::UnboundedSender<(Vec<u8>, bool)>,
        kept: Mutex<Vec<Bytes>>,
    }

    #[async_trait]
    impl PacketHandler for Recorder {
        async fn new_packet(
            &self,
            conn: SharedPacketConn,
            packet: PacketData<'_>,
            metadata: Metadata,
        ) -> Result<()> {
            let borrowed = matches!(packet, PacketData::Borrowed(_));
            let data = packet.as_slice().to_vec();
            if let PacketData::Owned(bytes) = packet {
                self.kept.lock().push(bytes);
            }
            conn.write_packet(Bytes::from(data.clone()), Address::Socket(metadata.source))
                .await?;
            let _ = self.seen.send((data, borrowed));
            Ok(())
        }

        fn requires_exclusive_buffer(&self) -> bool {
            self.exclusive
        }
    }

    #[tokio::test]
    async fn test_tcp_handler_error_keeps_accepting() {
        let adapter = InboundAdapter::new("direct", vec![Network::Tcp], "test-in", loopback())
            .with_connection_handler(Arc::new(FlakyEcho {
                calls: Default::default(),
            }));
        adapter.start().unwrap();
        let addr = adapter.tcp_local_addr().unwrap();

        let mut first = TcpStream::connect(addr).await.unwrap();
        let mut buf = Vec::new();
        let _ = first.read_to_end(&mut buf).await;

        let mut second = TcpStream::connect(addr).await.unwrap();
        second.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        second.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"ping");

        adapter.close().await.unwrap();
        adapter.close().await.unwrap();
    }

    async fn udp_round_trip(exclusive: bool) -> Vec<(Vec<u8>, bool)> {
        let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
        let recorder = Arc::new(Recorder {
            exclusive,
            seen: seen_tx,
            kept: Mutex::new(Vec::new()),
        });
        let adapter = InboundAdapter::new("direct", vec![Network::Udp], "test-in", loopback())
            .with_packet_handler(recorder.clone());
        adapter.start().unwrap();
        let addr = adapter.udp_local_addr().unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut replies = Vec::new();
        for payload in [&b"one"[..], b"two", b"three"] {
            client.send_to(payload, addr).await.unwrap();
            let mut buf = [0u8; 64];
            let (n, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            replies.push(buf[..n].to_vec());
        }
        assert_eq!(replies, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(seen_rx.recv().await.unwrap());
        }

        if !exclusive {
            let kept = recorder.kept.lock();
            let lengths: Vec<_> = kept.iter().map(Bytes::len).collect();
            assert_eq!(lengths, vec![3, 3, 5]);
            assert_eq!(&kept[0][..], b"one");
            assert_eq!(&kept[1][..], b"two");
            assert_eq!(&kept[2][..], b"three");
        }

        adapter.close().await.unwrap();
        seen
    }

    #[tokio::test]
    async fn test_udp_borrowed_mode_in_order() {
        let seen = udp_round_trip(true).await;
        let payloads: Vec<_> = seen.iter().map(|(data, _)| data.clone()).collect();
        assert_eq!(payloads, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
        assert!(seen.iter().all(|(_, borrowed)| *borrowed));
    }

    #[tokio::test]
    async fn test_udp_owned_mode_keeps_buffers() {
        let seen = udp_round_trip(false).await;
        assert!(seen.iter().all(|(_, borrowed)| !*borrowed));
    }

    #[tokio::test]
    async fn test_write_after_close_fails_fast() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (conn, _queue) = InboundPacketConn::new("test-in", socket).unwrap();
        conn.signal_closed().await;
        conn.signal_closed().await;

        let err = tokio::time::timeout(
            Duration::from_millis(500),
            conn.write_packet(Bytes::from_static(b"late"), Address::Socket("127.0.0.1:9".parse().unwrap())),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert!(matches!(err, Error::Closed));
    }

    #[tokio::test]
    async fn test_queued_packets_dropped_on_close() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = Address::Socket(receiver.local_addr().unwrap());

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (conn, queue) = InboundPacketConn::new("test-in", socket).unwrap();
        for _ in 0..3 {
            conn.write_packet(Bytes::from_static(b"queued"), target.clone())
                .await
                .unwrap();
        }

        conn.signal_closed().await;
        tokio::time::timeout(Duration::from_secs(1), conn.clone().run_write_back(queue))
            .await
            .unwrap();

        let mut buf = [0u8; 64];
        let received = tokio::time::timeout(Duration::from_millis(200), receiver.recv_from(&mut buf)).await;
        assert!(received.is_err(), "queued packet was written after close");
    }

    #[tokio::test]
    async fn test_start_failure_leaves_adapter_stopped() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let (seen, _) = tokio::sync::mpsc::unbounded_channel();
        let adapter = InboundAdapter::new(
            "direct",
            vec![Network::Tcp, Network::Udp],
            "test-in",
            ListenOptions::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
        )
        .with_connection_handler(Arc::new(FlakyEcho {
            calls: Default::default(),
        }))
        .with_packet_handler(Arc::new(Recorder {
            exclusive: false,
            seen,
            kept: Mutex::new(Vec::new()),
        }));

        assert!(adapter.start().is_err());
        assert!(adapter.tcp_local_addr().is_none());
        assert!(adapter.udp_local_addr().is_none());
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn test_loops_are_send() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (conn, queue) = InboundPacketConn::new("test-in", socket).unwrap();
        let write_back = conn.clone().run_write_back(queue);
        assert_send(&write_back);
        let write = conn.write_packet(Bytes::from_static(b"x"), Address::Socket("127.0.0.1:9".parse().unwrap()));
        assert_send(&write);
        drop(write);

        conn.signal_closed().await;
        tokio::time::timeout(Duration::from_secs(1), tokio::spawn(write_back))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_blocked_senders_released_on_close() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (conn, _queue) = InboundPacketConn::new("test-in", socket).unwrap();
        let target = Address::Socket("127.0.0.1:9".parse().unwrap());

        // No write-back task: the queue fills and the surplus senders wait
        let senders: Vec<_> = (0..WRITE_BACK_QUEUE_SIZE + 8)
            .map(|_| {
                let conn = conn.clone();
                let target = target.clone();
                tokio::spawn(async move { conn.write_packet(Bytes::from_static(b"reply"), target).await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(100)).await;

        tokio::time::timeout(Duration::from_secs(1), conn.signal_closed())
            .await
            .expect("close waited on a blocked sender");

        let mut queued = 0;
        let mut refused = 0;
        for sender in senders {
            match tokio::time::timeout(Duration::from_secs(1), sender).await.unwrap().unwrap() {
                Ok(()) => queued += 1,
                Err(Error::Closed) => refused += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(queued, WRITE_BACK_QUEUE_SIZE);
        assert_eq!(refused, 8);
    }

    #[tokio::test]
    async fn test_dual_stack_replies_to_ipv4_client() {
        let (seen, _seen_rx) = tokio::sync::mpsc::unbounded_channel();
        let adapter = InboundAdapter::new(
            "direct",
            vec![Network::Udp],
            "test-in",
            ListenOptions::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        )
        .with_packet_handler(Arc::new(Recorder {
            exclusive: false,
            seen,
            kept: Mutex::new(Vec::new()),
        }));
        if adapter.start().is_err() {
            // host without IPv6
            return;
        }
        let port = adapter.udp_local_addr().unwrap().port();
        let inbound = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"mapped", inbound).await.unwrap();
        let mut buf = [0u8; 64];
        let (n, from) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"mapped");
        assert_eq!(from, inbound);

        adapter.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_releases_udp_port() {
        let (seen, _seen_rx) = tokio::sync::mpsc::unbounded_channel();
        let adapter = InboundAdapter::new("direct", vec![Network::Udp], "test-in", loopback())
            .with_packet_handler(Arc::new(Recorder {
                exclusive: false,
                seen,
                kept: Mutex::new(Vec::new()),
            }));
        adapter.start().unwrap();
        let addr = adapter.udp_local_addr().unwrap();
        adapter.close().await.unwrap();

        assert!(adapter.udp_local_addr().is_none());
        std::net::UdpSocket::bind(addr).unwrap();
    }
}
