//! Pipeline de sortie
//!
//! Deux formes de puits :
//! - **direct** : les octets vont tels quels vers stdout ou un fichier ;
//! - **multiplexé** : les octets traversent un tube, un scanner de trames et
//!   un multiplexeur MPEG-TS avant d'atteindre un fichier `.ts` ou un socket UDP.
//!
//! Le puits multiplexé possède trois tâches (drain, serve différé, fermeture)
//! regroupées dans un [`TaskGroup`]. L'émission périodique des tables ne
//! démarre qu'après la première écriture ou fermeture du tube.

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use icympegts::{
    DiscontinuityMarker, FrameScanner, MuxOptions, Muxer, ProgramWriter, ServiceTable, StreamType,
    TS_PACKET_SIZE,
};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::{Host, Url};

use crate::gate::{TriggerGate, TriggerWriter};
use crate::icy::ServiceMetadata;
use crate::reader::{noop_notifier, DiscontinuityNotifier, MetadataHandler};
use crate::tasks::{FailurePolicy, TaskGroup};
use crate::{PipelineContext, Result, StreamError};

/// Numéro du programme audio unique
pub const AUDIO_PROGRAM_ID: u16 = 1;

const PKT_SIZE_PARAM: &str = "pkt_size";
const TTL_PARAM: &str = "ttl";

/// Arrondit une taille de paquet au multiple inférieur de 188, au minimum 188
pub fn normalize_packet_size(requested: usize) -> usize {
    let normalized = requested - requested % TS_PACKET_SIZE;
    if normalized == 0 {
        TS_PACKET_SIZE
    } else {
        normalized
    }
}

/// Destination de sortie
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Stdout,
    File(PathBuf),
    /// Fichier MPEG-TS (multiplexé, sans découpage en datagrammes)
    TsFile(PathBuf),
    /// Flux MPEG-TS en datagrammes de `packet_size` octets
    Udp { url: Url, packet_size: usize },
}

impl Destination {
    pub fn parse(output: &str, default_packet_size: usize) -> Result<Self> {
        let output = output.trim();
        if output.is_empty() || output == "-" {
            return Ok(Self::Stdout);
        }

        if output.to_ascii_lowercase().starts_with("udp:") {
            return Self::parse_udp(output, default_packet_size);
        }

        let path = PathBuf::from(output);
        let is_ts = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("ts"))
            .unwrap_or(false);
        Ok(if is_ts { Self::TsFile(path) } else { Self::File(path) })
    }

    fn parse_udp(output: &str, default_packet_size: usize) -> Result<Self> {
        let mut url =
            Url::parse(output).map_err(|e| StreamError::invalid_address(output, e.to_string()))?;
        if url.host().is_none() {
            return Err(StreamError::invalid_address(output, "missing host"));
        }
        if url.port().is_none() {
            return Err(StreamError::invalid_address(output, "missing port"));
        }

        let mut requested = default_packet_size;
        let mut others = Vec::new();
        for (key, value) in url.query_pairs() {
            if key == PKT_SIZE_PARAM {
                requested = value.parse().map_err(|_| {
                    StreamError::invalid_address(output, format!("invalid {}: {}", PKT_SIZE_PARAM, value))
                })?;
            } else {
                others.push((key.into_owned(), value.into_owned()));
            }
        }

        let packet_size = normalize_packet_size(requested);
        if packet_size != requested {
            debug!(requested, packet_size, "Packet size normalized");
        }

        {
            let mut query = url.query_pairs_mut();
            query.clear();
            for (key, value) in &others {
                query.append_pair(key, value);
            }
            query.append_pair(PKT_SIZE_PARAM, &packet_size.to_string());
        }

        Ok(Self::Udp { url, packet_size })
    }

    pub fn is_muxed(&self) -> bool {
        matches!(self, Self::TsFile(_) | Self::Udp { .. })
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::File(p) | Self::TsFile(p) => write!(f, "{}", p.display()),
            Self::Udp { url, .. } => write!(f, "{}", url),
        }
    }
}

/// Puits UDP : chaque datagramme fait exactement `packet_size` octets,
/// sauf le dernier, vidé à la fermeture
pub struct UdpPacketSink {
    socket: UdpSocket,
    target: SocketAddr,
    packet_size: usize,
    buffer: Vec<u8>,
}

impl UdpPacketSink {
    pub async fn connect(url: &Url, packet_size: usize) -> Result<Self> {
        let port = url
            .port()
            .ok_or_else(|| StreamError::invalid_address(url.as_str(), "missing port"))?;
        let target = resolve(url, port).await?;

        let bind: SocketAddr = if target.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind).await?;

        if let Some(ttl) = url
            .query_pairs()
            .find(|(k, _)| k == TTL_PARAM)
            .and_then(|(_, v)| v.parse::<u32>().ok())
        {
            socket.set_ttl(ttl)?;
            if target.is_ipv4() && target.ip().is_multicast() {
                socket.set_multicast_ttl_v4(ttl)?;
            }
        }

        // Socket non connecté : un récepteur absent ne fait jamais échouer l'envoi
        info!(%target, packet_size, "UDP output ready");
        Ok(Self {
            socket,
            target,
            packet_size,
            buffer: Vec::with_capacity(packet_size * 2),
        })
    }

    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Envoie un datagramme ; un refus du récepteur le fait simplement perdre
    fn poll_send_datagram(&self, cx: &mut Context<'_>, len: usize) -> Poll<io::Result<()>> {
        match ready!(self.socket.poll_send_to(cx, &self.buffer[..len], self.target)) {
            Ok(_) => Poll::Ready(Ok(())),
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                trace!(dest = %self.target, "Datagram dropped: receiver not listening");
                Poll::Ready(Ok(()))
            }
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_send_full(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.buffer.len() >= self.packet_size {
            ready!(self.poll_send_datagram(cx, self.packet_size))?;
            self.buffer.drain(..self.packet_size);
        }
        Poll::Ready(Ok(()))
    }
}

async fn resolve(url: &Url, port: u16) -> Result<SocketAddr> {
    match url.host() {
        Some(Host::Ipv4(ip)) => Ok((ip, port).into()),
        Some(Host::Ipv6(ip)) => Ok((ip, port).into()),
        Some(Host::Domain(domain)) => tokio::net::lookup_host((domain, port))
            .await?
            .next()
            .ok_or_else(|| StreamError::invalid_address(url.as_str(), "host did not resolve")),
        None => Err(StreamError::invalid_address(url.as_str(), "missing host")),
    }
}

impl AsyncWrite for UdpPacketSink {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_send_full(cx))?;
        this.buffer.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().poll_send_full(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_send_full(cx))?;
        if !this.buffer.is_empty() {
            ready!(this.poll_send_datagram(cx, this.buffer.len()))?;
            this.buffer.clear();
        }
        Poll::Ready(Ok(()))
    }
}

#[derive(Debug, Clone)]
pub struct OutputOptions {
    /// Capacité du tube entre le producteur et le scanner
    pub pipe_capacity: usize,
    /// Période d'émission des tables PSI
    pub service_interval: Duration,
}

impl Default for OutputOptions {
    fn default() -> Self {
        Self {
            pipe_capacity: 64 * 1024,
            service_interval: Duration::from_millis(100),
        }
    }
}

/// Puits multiplexé : tube à déclenchement, muxer et ses trois tâches
pub struct MuxedSink {
    writer: TriggerWriter<DuplexStream>,
    muxer: Muxer,
    marker: DiscontinuityMarker,
    tasks: TaskGroup,
}

impl MuxedSink {
    pub fn new<W>(sink: W, ctx: &PipelineContext, options: &OutputOptions) -> Result<Self>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let muxer = Muxer::new(
            sink,
            MuxOptions {
                service_interval: options.service_interval,
                ..MuxOptions::default()
            },
        );
        let program = muxer.writer(AUDIO_PROGRAM_ID, StreamType::Mpeg1Audio)?;
        let marker = program.discontinuity_marker();

        let (pipe_writer, pipe_reader) = tokio::io::duplex(options.pipe_capacity);
        let gate = TriggerGate::new();
        let writer = TriggerWriter::new(pipe_writer, gate.clone());

        let mut tasks = TaskGroup::new(ctx.clone());
        let token = tasks.token();
        let (drained_tx, drained_rx) = oneshot::channel();

        tasks.spawn(
            "drain",
            FailurePolicy::Log,
            drain_frames(FrameScanner::new(pipe_reader), program, token.clone(), drained_tx),
        );
        tasks.spawn(
            "gated-serve",
            FailurePolicy::Fatal,
            gated_serve(gate, muxer.clone(), token),
        );
        tasks.spawn(
            "shutdown",
            FailurePolicy::Log,
            close_after_drain(drained_rx, muxer.clone()),
        );

        Ok(Self {
            writer,
            muxer,
            marker,
            tasks,
        })
    }

    pub fn gate(&self) -> &TriggerGate {
        self.writer.gate()
    }

    pub fn discontinuity_notifier(&self) -> DiscontinuityNotifier {
        let marker = self.marker.clone();
        Arc::new(move || marker.mark())
    }

    pub fn set_service_metadata(&self, meta: ServiceMetadata) {
        self.muxer.set_service_table(ServiceTable {
            name: meta.name,
            provider: meta.provider,
        });
    }

    pub fn metadata_handler(&self) -> MetadataHandler {
        let muxer = self.muxer.clone();
        Arc::new(move |meta: ServiceMetadata| {
            muxer.set_service_table(ServiceTable {
                name: meta.name,
                provider: meta.provider,
            })
        })
    }

    /// Ferme le tube puis attend les trois tâches
    pub async fn close(mut self) -> Result<()> {
        if let Err(e) = self.writer.shutdown().await {
            debug!("Closing pipe failed: {}", e);
        }
        self.tasks.join().await
    }
}

async fn drain_frames<R>(
    mut scanner: FrameScanner<R>,
    mut program: ProgramWriter,
    cancel: CancellationToken,
    drained: oneshot::Sender<ProgramWriter>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut frames = 0u64;
    let result = loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            next = scanner.next_frame() => next,
        };
        match next {
            Ok(Some(frame)) => match program.write(&frame).await {
                Ok(_) => frames += 1,
                Err(e) => break Err(StreamError::from(e)),
            },
            Ok(None) => break Ok(()),
            Err(e) => break Err(StreamError::from(e)),
        }
    };

    debug!(frames, skipped = scanner.skipped_bytes(), "Drain finished");
    let _ = drained.send(program);
    result
}

async fn gated_serve(gate: TriggerGate, muxer: Muxer, cancel: CancellationToken) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        _ = gate.wait_for_trigger() => {}
    }
    debug!("Pipe activated, starting multiplexer");
    muxer.serve(cancel).await?;
    Ok(())
}

async fn close_after_drain(drained: oneshot::Receiver<ProgramWriter>, muxer: Muxer) -> Result<()> {
    match drained.await {
        Ok(mut program) => {
            if let Err(e) = program.close().await {
                warn!("Closing program writer failed: {}", e);
            }
        }
        Err(_) => warn!("Drain task ended without releasing its program writer"),
    }
    if let Err(e) = muxer.close().await {
        warn!("Closing multiplexer failed: {}", e);
    }
    Ok(())
}

/// Puits de sortie, direct ou multiplexé
pub enum OutputPipeline {
    Direct(Box<dyn AsyncWrite + Send + Unpin>),
    Muxed(MuxedSink),
}

impl OutputPipeline {
    /// Crée le puits ; toute erreur ici est fatale au démarrage
    pub async fn open(
        destination: &Destination,
        ctx: &PipelineContext,
        options: &OutputOptions,
    ) -> Result<Self> {
        let setup = |e: StreamError| {
            StreamError::setup(format!("cannot open output {}: {}", destination, e))
        };

        let pipeline = match destination {
            Destination::Stdout => Self::direct(tokio::io::stdout()),
            Destination::File(path) => Self::direct(create_file(path).await.map_err(setup)?),
            Destination::TsFile(path) => {
                let file = create_file(path).await.map_err(setup)?;
                Self::muxed(file, ctx, options)?
            }
            Destination::Udp { url, packet_size } => {
                let sink = UdpPacketSink::connect(url, *packet_size).await.map_err(setup)?;
                Self::muxed(sink, ctx, options)?
            }
        };
        info!("Writing to {}", destination);
        Ok(pipeline)
    }

    pub fn direct(writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self::Direct(Box::new(writer))
    }

    pub fn muxed<W>(sink: W, ctx: &PipelineContext, options: &OutputOptions) -> Result<Self>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Ok(Self::Muxed(MuxedSink::new(sink, ctx, options)?))
    }

    pub fn is_muxed(&self) -> bool {
        matches!(self, Self::Muxed(_))
    }

    /// No-op pour un puits direct
    pub fn discontinuity_notifier(&self) -> DiscontinuityNotifier {
        match self {
            Self::Direct(_) => noop_notifier(),
            Self::Muxed(sink) => sink.discontinuity_notifier(),
        }
    }

    pub fn metadata_handler(&self) -> Option<MetadataHandler> {
        match self {
            Self::Direct(_) => None,
            Self::Muxed(sink) => Some(sink.metadata_handler()),
        }
    }

    pub async fn close(self) -> Result<()> {
        match self {
            Self::Direct(mut writer) => {
                writer.flush().await?;
                writer.shutdown().await?;
                Ok(())
            }
            Self::Muxed(sink) => sink.close().await,
        }
    }
}

async fn create_file(path: &Path) -> Result<tokio::fs::File> {
    Ok(tokio::fs::File::create(path).await?)
}

impl AsyncWrite for OutputPipeline {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Direct(w) => Pin::new(w).poll_write(cx, buf),
            Self::Muxed(sink) => Pin::new(&mut sink.writer).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Direct(w) => Pin::new(w).poll_flush(cx),
            Self::Muxed(sink) => Pin::new(&mut sink.writer).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Direct(w) => Pin::new(w).poll_shutdown(cx),
            Self::Muxed(sink) => Pin::new(&mut sink.writer).poll_shutdown(cx),
        }
    }
}
