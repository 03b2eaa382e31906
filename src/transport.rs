use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::select;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use crate::buffers::buffer_pool::BufferPool;
use crate::command_channel::{CommandChannel, Inbound};
use crate::config::TransportConfig;
use crate::datagram_channel::CommandDatagramChannel;
use crate::datagram_header::SourceId;
use crate::listener::TransportListener;
use crate::uri::{TransportScheme, TransportUri};
use crate::wire_format::WireFormat;

/// The lifecycle states of a transport. Transitions are driven exclusively by [UdpTransport::start],
///  [UdpTransport::stop] and a fatal receive error in the read loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Creates the [CommandChannel] a transport reads from and writes to. This is the seam between
///  the shared transport machinery and the unicast / multicast variants, and a test seam for
///  injecting an in-memory channel.
#[async_trait]
pub trait CommandChannelFactory<W: WireFormat>: Send + Sync + 'static {
    async fn create_command_channel(
        &self,
        config: &TransportConfig,
        wire_format: Arc<W>,
        buffer_pool: Arc<BufferPool>,
        source_id: SourceId,
    ) -> anyhow::Result<Arc<dyn CommandChannel<W>>>;
}

/// Connects a [CommandDatagramChannel] to the peer named by a `udp://` URI. Host resolution
///  happens here, i.e. at transport start rather than configuration time.
pub struct UdpChannelFactory {
    uri: TransportUri,
}

impl UdpChannelFactory {
    pub fn new(uri: TransportUri) -> UdpChannelFactory {
        UdpChannelFactory { uri }
    }
}

#[async_trait]
impl<W: WireFormat> CommandChannelFactory<W> for UdpChannelFactory {
    async fn create_command_channel(
        &self,
        config: &TransportConfig,
        wire_format: Arc<W>,
        buffer_pool: Arc<BufferPool>,
        source_id: SourceId,
    ) -> anyhow::Result<Arc<dyn CommandChannel<W>>> {
        let remote = self.uri.resolve().await?;
        let channel = CommandDatagramChannel::connect(remote, config, wire_format, buffer_pool, source_id).await?;
        Ok(Arc::new(channel))
    }
}

/// A datagram-based transport: frames commands of a pluggable [WireFormat] into datagrams on a
///  [CommandChannel], runs a read loop dispatching inbound commands to a [TransportListener],
///  and tracks peer liveness through keep-alive traffic.
///
/// All methods take `&self`; the transport is meant to be shared behind an `Arc` between the
///  sending side and whoever controls its lifecycle.
pub struct UdpTransport<W: WireFormat> {
    config: Arc<TransportConfig>,
    wire_format: Arc<W>,
    listener: Arc<dyn TransportListener<W::Command>>,
    channel_factory: Box<dyn CommandChannelFactory<W>>,
    source_id: SourceId,
    buffer_pool: Arc<BufferPool>,
    state: Arc<Mutex<TransportState>>,
    channel: Mutex<Option<Arc<dyn CommandChannel<W>>>>,
    shutdown: watch::Sender<bool>,
    read_loop: Mutex<Option<JoinHandle<()>>>,
    last_outbound: Arc<LastOutbound>,
}

impl<W: WireFormat> UdpTransport<W> {
    /// Create a transport for a connection URI, selecting the unicast or multicast variant by
    ///  its scheme. The transport starts in [TransportState::Created] and opens no socket
    ///  until [UdpTransport::start] is called.
    pub fn new(
        uri: TransportUri,
        config: TransportConfig,
        wire_format: Arc<W>,
        listener: Arc<dyn TransportListener<W::Command>>,
    ) -> anyhow::Result<UdpTransport<W>> {
        let channel_factory: Box<dyn CommandChannelFactory<W>> = match uri.scheme {
            TransportScheme::Udp => Box::new(UdpChannelFactory::new(uri)),
            TransportScheme::Multicast => Box::new(crate::multicast::MulticastChannelFactory::new(uri)),
        };
        Self::with_channel_factory(channel_factory, config, wire_format, listener)
    }

    pub fn with_channel_factory(
        channel_factory: Box<dyn CommandChannelFactory<W>>,
        config: TransportConfig,
        wire_format: Arc<W>,
        listener: Arc<dyn TransportListener<W::Command>>,
    ) -> anyhow::Result<UdpTransport<W>> {
        config.validate()?;
        let buffer_pool = Arc::new(BufferPool::new(
            config.datagram_size,
            config.max_outstanding_buffers,
            config.pool_exhaustion_policy,
        ));

        Ok(UdpTransport {
            config: Arc::new(config),
            wire_format,
            listener,
            channel_factory,
            source_id: SourceId::new_random(),
            buffer_pool,
            state: Arc::new(Mutex::new(TransportState::Created)),
            channel: Mutex::new(None),
            shutdown: watch::Sender::new(false),
            read_loop: Mutex::new(None),
            last_outbound: Arc::new(LastOutbound::new()),
        })
    }

    pub fn state(&self) -> TransportState {
        *self.state.lock().unwrap()
    }

    /// the bound local address, once the transport is started
    pub fn local_address(&self) -> Option<SocketAddr> {
        self.channel.lock().unwrap()
            .as_ref()
            .map(|channel| channel.local_address())
    }

    /// Open the channel and spawn the read loop. Starting an already starting or running
    ///  transport is a no-op; a stopped transport can be started again.
    pub async fn start(&self) -> anyhow::Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                TransportState::Created | TransportState::Stopped => *state = TransportState::Starting,
                TransportState::Starting | TransportState::Running => return Ok(()),
                TransportState::Stopping => bail!("cannot start a transport that is stopping"),
            }
        }

        let channel = match self.channel_factory
            .create_command_channel(&self.config, self.wire_format.clone(), self.buffer_pool.clone(), self.source_id)
            .await
        {
            Ok(channel) => channel,
            Err(e) => {
                *self.state.lock().unwrap() = TransportState::Stopped;
                return Err(e).context("starting transport");
            }
        };
        info!("transport running on {:?}", channel.local_address());

        *self.channel.lock().unwrap() = Some(channel.clone());
        self.last_outbound.touch();

        self.shutdown.send_replace(false);
        let read_loop = ReadLoop {
            channel,
            listener: self.listener.clone(),
            config: self.config.clone(),
            state: self.state.clone(),
            shutdown: self.shutdown.subscribe(),
            last_outbound: self.last_outbound.clone(),
            peers: FxHashMap::default(),
        };
        *self.read_loop.lock().unwrap() = Some(tokio::spawn(read_loop.run()));

        *self.state.lock().unwrap() = TransportState::Running;
        Ok(())
    }

    /// Send a command to the channel's default destination, i.e. the connected peer for
    ///  unicast and the group for multicast.
    pub async fn send(&self, command: &W::Command) -> anyhow::Result<()> {
        self.do_send(command, None).await
    }

    /// Send a command to an explicit peer address, e.g. a unicast reply to a command that
    ///  arrived via the group.
    pub async fn send_to(&self, command: &W::Command, destination: SocketAddr) -> anyhow::Result<()> {
        self.do_send(command, Some(destination)).await
    }

    async fn do_send(&self, command: &W::Command, destination: Option<SocketAddr>) -> anyhow::Result<()> {
        let channel = {
            let state = self.state.lock().unwrap();
            if *state != TransportState::Running {
                bail!("cannot send in transport state {:?}", *state);
            }
            self.channel.lock().unwrap()
                .clone()
                .ok_or_else(|| anyhow!("running transport has no channel"))?
        };

        channel.send(command, destination).await
            .context("sending command")?;
        self.last_outbound.touch();
        Ok(())
    }

    /// Stop the read loop and close the channel. Stopping is prompt - it interrupts a read
    ///  loop that is blocked waiting for traffic rather than waiting out its timeout. Stopping
    ///  an already stopped transport is a no-op.
    pub async fn stop(&self) -> anyhow::Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                TransportState::Created => {
                    *state = TransportState::Stopped;
                    return Ok(());
                }
                TransportState::Stopped => return Ok(()),
                _ => *state = TransportState::Stopping,
            }
        }
        debug!("stopping transport");

        self.shutdown.send_replace(true);
        let read_loop = self.read_loop.lock().unwrap().take();
        if let Some(read_loop) = read_loop {
            if let Err(e) = read_loop.await {
                warn!("read loop terminated abnormally: {}", e);
            }
        }

        let channel = self.channel.lock().unwrap().take();
        let mut errors = Vec::new();
        if let Some(channel) = channel {
            errors = channel.close().await;
        }

        *self.state.lock().unwrap() = TransportState::Stopped;
        info!("transport stopped");

        // teardown continues past individual failures; report them all afterwards
        if errors.is_empty() {
            Ok(())
        }
        else {
            for e in &errors {
                error!("error stopping transport: {:#}", e);
            }
            Err(anyhow!("{} error(s) stopping transport, see log", errors.len()))
        }
    }
}

/// Tracks when this transport last sent anything, at millisecond granularity, so the read loop
///  can decide cheaply whether a keep-alive is due.
struct LastOutbound {
    epoch: Instant,
    elapsed_millis: AtomicU64,
}

impl LastOutbound {
    fn new() -> LastOutbound {
        LastOutbound {
            epoch: Instant::now(),
            elapsed_millis: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        self.elapsed_millis.store(self.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn idle_duration(&self) -> Duration {
        let now = self.epoch.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.elapsed_millis.load(Ordering::Relaxed)))
    }
}

/// The transport's read loop, running as its own task: receives inbound traffic, dispatches it
///  to the listener, expires silent peers and sends keep-alives when the outbound side goes
///  idle.
struct ReadLoop<W: WireFormat> {
    channel: Arc<dyn CommandChannel<W>>,
    listener: Arc<dyn TransportListener<W::Command>>,
    config: Arc<TransportConfig>,
    state: Arc<Mutex<TransportState>>,
    shutdown: watch::Receiver<bool>,
    last_outbound: Arc<LastOutbound>,
    peers: FxHashMap<SocketAddr, Instant>,
}

impl<W: WireFormat> ReadLoop<W> {
    async fn run(mut self) {
        debug!("read loop started");

        // Waking at half the liveness window means both keep-alive sending and peer expiry
        //  happen at least twice per window, leaving margin for jitter.
        let wakeup_interval = self.config.keep_alive_interval / 2;

        loop {
            select! {
                _ = self.shutdown.changed() => break,
                received = self.channel.receive(wakeup_interval) => {
                    match received {
                        Ok(Some(Inbound::Command { from, command })) => {
                            self.peers.insert(from, Instant::now());
                            self.listener.on_command(from, command).await;
                        }
                        Ok(Some(Inbound::KeepAlive { from })) => {
                            self.peers.insert(from, Instant::now());
                        }
                        Ok(None) => {
                            // receive timeout - nothing to dispatch, just housekeeping below
                        }
                        Err(e) => {
                            error!("receiving from the channel failed: {:#}", e);
                            *self.state.lock().unwrap() = TransportState::Stopping;
                            self.listener.on_transport_error(e).await;
                            break;
                        }
                    }
                }
            }

            self.expire_silent_peers().await;
            self.maybe_send_keep_alive().await;
        }
        debug!("read loop terminated");
    }

    /// Report peers that have been silent for longer than the liveness window. Removing the
    ///  map entry on report makes the notification exactly-once; a peer that comes back is
    ///  simply re-inserted by its next datagram.
    async fn expire_silent_peers(&mut self) {
        let now = Instant::now();
        let expired = self.peers.iter()
            .filter(|(_, last_seen)| now.duration_since(**last_seen) > self.config.keep_alive_interval)
            .map(|(peer, _)| *peer)
            .collect::<Vec<_>>();

        for peer in expired {
            self.peers.remove(&peer);
            info!("peer {:?} went silent, reporting as disconnected", peer);
            self.listener.on_peer_disconnected(peer).await;
        }
    }

    async fn maybe_send_keep_alive(&self) {
        if self.last_outbound.idle_duration() < self.config.keep_alive_interval / 2 {
            return;
        }

        match self.channel.send_keep_alive().await {
            Ok(()) => self.last_outbound.touch(),
            Err(e) => {
                // non-fatal: the next inbound datagram or send will show whether the channel
                //  is actually broken
                warn!("failed to send keep-alive: {:#}", e);
            }
        }
    }
}
