use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use bytes::Bytes;
use rustc_hash::FxHasher;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};
use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::events::EventDispatcher;
use crate::session::{OutgoingDatagram, SessionOutput, TransportSession};
use crate::socket::{send_loop, SendSocket};
use crate::wire_header::{ChannelKind, ConnectionId, WireHeader};

struct InboundDatagram {
    socket_index: usize,
    from: SocketAddr,
    datagram: Bytes,
}

type OutboundQueues = Arc<Vec<mpsc::Sender<OutgoingDatagram>>>;

/// EndPoint is the place where all parts of the transport come together: it owns the sockets and
///  runs the [TransportSession] with the following tasks:
///
/// * a receive loop per socket, routing datagrams to workers by connection id
/// * a pool of workers, each feeding its datagrams through the session and dispatching the
///    resulting events; all datagrams of a connection are processed by the same worker, in order
/// * a send loop per socket, draining that socket's outbound queue
/// * a timer task for retransmission, heartbeats and eviction of inactive connections
///
/// Replies to inbound datagrams leave through the socket the datagram arrived on. Datagrams
///  originating locally (application sends, heartbeats, re-sends) use the first socket.
pub struct EndPoint {
    session: Arc<TransportSession>,
    local_addrs: Vec<SocketAddr>,
    sockets: Vec<Arc<UdpSocket>>,
    outbound: Option<OutboundQueues>,
    shutdown_sender: watch::Sender<bool>,
    loop_handles: Vec<JoinHandle<()>>,
    worker_handles: Vec<JoinHandle<()>>,
    send_handles: Vec<JoinHandle<()>>,
}

impl Drop for EndPoint {
    fn drop(&mut self) {
        for handle in self.loop_handles.iter()
            .chain(self.worker_handles.iter())
            .chain(self.send_handles.iter())
        {
            handle.abort();
        }
    }
}

impl EndPoint {
    pub async fn new(config: TransportConfig, dispatcher: Arc<dyn EventDispatcher>) -> anyhow::Result<EndPoint> {
        config.validate()?;
        let config = Arc::new(config);

        let mut sockets = Vec::new();
        let mut local_addrs = Vec::new();
        for addr in &config.bind_addrs {
            let socket = Arc::new(UdpSocket::bind(addr).await?);
            let local_addr = socket.local_addr()?;
            info!("bound socket to {:?}", local_addr);
            sockets.push(socket);
            local_addrs.push(local_addr);
        }

        let session = Arc::new(TransportSession::new(config.clone()));
        let (shutdown_sender, shutdown_receiver) = watch::channel(false);

        let mut outbound_senders = Vec::new();
        let mut send_handles = Vec::new();
        for (socket, local_addr) in sockets.iter().zip(&local_addrs) {
            let (sender, receiver) = mpsc::channel(config.outbound_queue_size);
            outbound_senders.push(sender);
            let send_socket: Arc<dyn SendSocket> = Arc::new(socket.clone());
            send_handles.push(tokio::spawn(
                send_loop(send_socket, receiver)
                    .instrument(span!(Level::INFO, "send_loop", %local_addr))
            ));
        }
        let outbound: OutboundQueues = Arc::new(outbound_senders);

        let mut inbound_senders = Vec::new();
        let mut worker_handles = Vec::new();
        for worker_id in 0..config.workers {
            let (sender, receiver) = mpsc::channel(config.inbound_queue_size);
            inbound_senders.push(sender);
            worker_handles.push(tokio::spawn(
                Self::worker_loop(session.clone(), dispatcher.clone(), outbound.clone(), receiver)
                    .instrument(span!(Level::INFO, "worker", worker_id))
            ));
        }
        let inbound = Arc::new(inbound_senders);

        let mut loop_handles = Vec::new();
        for (socket_index, (socket, local_addr)) in sockets.iter().zip(&local_addrs).enumerate() {
            loop_handles.push(tokio::spawn(
                Self::receive_loop(socket_index, socket.clone(), inbound.clone(), config.clone(), shutdown_receiver.clone())
                    .instrument(span!(Level::INFO, "receive_loop", %local_addr))
            ));
        }
        loop_handles.push(tokio::spawn(
            Self::timer_loop(session.clone(), dispatcher, outbound.clone(), config.clone(), shutdown_receiver)
                .instrument(span!(Level::INFO, "timers"))
        ));

        Ok(EndPoint {
            session,
            local_addrs,
            sockets,
            outbound: Some(outbound),
            shutdown_sender,
            loop_handles,
            worker_handles,
            send_handles,
        })
    }

    /// the address of the first socket, which is used for datagrams originating locally
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addrs[0]
    }

    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    pub fn session(&self) -> &TransportSession {
        &self.session
    }

    async fn enqueue(&self, datagram: OutgoingDatagram) -> Result<(), TransportError> {
        let Some(outbound) = &self.outbound else {
            return Err(TransportError::ShutDown);
        };
        outbound[0].send(datagram).await
            .map_err(|_| TransportError::ShutDown)
    }

    fn check_running(&self) -> Result<(), TransportError> {
        if self.outbound.is_none() {
            return Err(TransportError::ShutDown);
        }
        Ok(())
    }

    /// Sends an application payload to a connection's primary endpoint
    pub async fn send(&self, connection_id: ConnectionId, kind: ChannelKind, hook_id: u8, payload: &[u8]) -> Result<(), TransportError> {
        self.send_to(connection_id, kind, hook_id, payload, None).await
    }

    pub async fn send_to(&self, connection_id: ConnectionId, kind: ChannelKind, hook_id: u8, payload: &[u8], destination: Option<SocketAddr>) -> Result<(), TransportError> {
        self.check_running()?;
        let datagram = self.session.send(connection_id, kind, hook_id, payload, destination, Instant::now())?;
        self.enqueue(datagram).await
    }

    /// Sends a payload to several connections, returning the number of recipients it could not
    ///  be sent to
    pub async fn send_to_many(&self, connection_ids: &[ConnectionId], kind: ChannelKind, hook_id: u8, payload: &[u8]) -> Result<usize, TransportError> {
        self.check_running()?;
        let (datagrams, num_failed) = self.session.send_to_many(connection_ids, kind, hook_id, payload, Instant::now());
        for datagram in datagrams {
            self.enqueue(datagram).await?;
        }
        Ok(num_failed)
    }

    /// Starts connecting to a remote end point. The connection is usable once the
    ///  [crate::events::TransportEvent::Connected] event for the returned id was dispatched.
    pub async fn connect(&self, remote_addr: SocketAddr) -> Result<ConnectionId, TransportError> {
        self.check_running()?;
        let (connection_id, datagram) = self.session.connect(remote_addr, Instant::now());
        self.enqueue(datagram).await?;
        Ok(connection_id)
    }

    pub async fn disconnect(&self, connection_id: ConnectionId) -> Result<(), TransportError> {
        self.check_running()?;
        let datagram = self.session.disconnect(connection_id, Instant::now())?;
        self.enqueue(datagram).await
    }

    pub fn is_connected(&self, connection_id: &ConnectionId) -> bool {
        self.session.is_connected(connection_id)
    }

    pub fn rtt(&self, connection_id: &ConnectionId) -> Option<Duration> {
        self.session.rtt(connection_id)
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.session.connection_ids()
    }

    /// Stops all loops, waiting for them to finish: receive loops and timers first, then workers
    ///  once their queues are drained, then send loops once everything was sent. Connections are
    ///  dropped after that, and the sockets are released last.
    pub async fn shutdown(&mut self) {
        info!("shutting down end point {:?}", self.local_addrs);
        let _ = self.shutdown_sender.send(true);

        for handle in self.loop_handles.drain(..) {
            if let Err(e) = handle.await {
                warn!("loop terminated abnormally: {}", e);
            }
        }
        for handle in self.worker_handles.drain(..) {
            if let Err(e) = handle.await {
                warn!("worker terminated abnormally: {}", e);
            }
        }
        self.outbound = None;
        for handle in self.send_handles.drain(..) {
            if let Err(e) = handle.await {
                warn!("send loop terminated abnormally: {}", e);
            }
        }

        let num_connections = self.session.clear();
        debug!("dropped {} connections", num_connections);
        self.sockets.clear();
        info!("end point shut down");
    }

    /// picks the worker for a datagram so that all datagrams of a connection go to the same worker
    fn worker_index(datagram: &[u8], num_workers: usize) -> usize {
        match WireHeader::peek_connection_id(datagram) {
            Some(connection_id) => {
                let mut hasher = FxHasher::default();
                connection_id.hash(&mut hasher);
                (hasher.finish() % num_workers as u64) as usize
            }
            None => 0,
        }
    }

    async fn receive_loop(
        socket_index: usize,
        socket: Arc<UdpSocket>,
        workers: Arc<Vec<mpsc::Sender<InboundDatagram>>>,
        config: Arc<TransportConfig>,
        shutdown: watch::Receiver<bool>,
    ) {
        info!("starting receive loop");

        let mut buf = vec![0u8; config.receive_buffer_size];
        loop {
            if *shutdown.borrow() {
                break;
            }

            let (num_read, from) = match timeout(config.poll_frequency, socket.recv_from(&mut buf)).await {
                Err(_) => continue,
                Ok(Err(e)) => {
                    error!("socket error: {}", e);
                    continue;
                }
                Ok(Ok(x)) => x,
            };
            trace!("received {} bytes from {:?}", num_read, from);

            let datagram = Bytes::copy_from_slice(&buf[..num_read]);
            let worker = Self::worker_index(&datagram, workers.len());
            if workers[worker].send(InboundDatagram { socket_index, from, datagram }).await.is_err() {
                warn!("worker {} terminated - stopping receive loop", worker);
                break;
            }
        }
        info!("receive loop finished");
    }

    async fn worker_loop(
        session: Arc<TransportSession>,
        dispatcher: Arc<dyn EventDispatcher>,
        outbound: OutboundQueues,
        mut inbound: mpsc::Receiver<InboundDatagram>,
    ) {
        debug!("starting worker");
        while let Some(inbound_datagram) = inbound.recv().await {
            let output = session.handle_datagram(inbound_datagram.from, &inbound_datagram.datagram, Instant::now());
            Self::forward(output, &outbound[inbound_datagram.socket_index], dispatcher.as_ref()).await;
        }
        debug!("worker finished");
    }

    async fn timer_loop(
        session: Arc<TransportSession>,
        dispatcher: Arc<dyn EventDispatcher>,
        outbound: OutboundQueues,
        config: Arc<TransportConfig>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut resend_ticks = interval(config.resend_interval);
        let mut heartbeat_ticks = interval(config.heartbeat_interval);
        let mut sweep_ticks = interval(config.sweep_interval);
        for ticks in [&mut resend_ticks, &mut heartbeat_ticks, &mut sweep_ticks] {
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        loop {
            select! {
                _ = resend_ticks.tick() => {
                    let output = session.tick(Instant::now());
                    Self::forward(output, &outbound[0], dispatcher.as_ref()).await;
                }
                _ = heartbeat_ticks.tick() => {
                    let output = session.heartbeat_all(Instant::now());
                    Self::forward(output, &outbound[0], dispatcher.as_ref()).await;
                }
                _ = sweep_ticks.tick() => {
                    let evicted = session.sweep(Instant::now());
                    if !evicted.is_empty() {
                        debug!("evicted {} inactive connections", evicted.len());
                    }
                }
                _ = shutdown.changed() => {
                    break;
                }
            }
        }
        debug!("timers finished");
    }

    async fn forward(output: SessionOutput, outbound: &mpsc::Sender<OutgoingDatagram>, dispatcher: &dyn EventDispatcher) {
        for datagram in output.datagrams {
            if outbound.send(datagram).await.is_err() {
                debug!("send loop terminated - discarding datagram");
            }
        }
        for event in output.events {
            dispatcher.on_event(event).await;
        }
    }
}
