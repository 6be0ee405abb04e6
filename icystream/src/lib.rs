#![doc = r#"
icystream - Relais de flux ICY avec reconnexion transparente

Cette crate assemble le cœur du relais : lecture d'une source amont qui se
reconnecte indéfiniment, copie bornée par chien de garde, et puits de sortie
direct ou multiplexé en MPEG-TS.

# Architecture

```text
Source ──► SourceReader ──(tampon)──► RetryCopyLoop ──► OutputPipeline ──► stdout / fichier
   ▲            │                                           │
   └ reopen ────┘ discontinuité ───────────────────────────►│ MuxedSink ──► UDP / .ts
```

- [`SourceReader`] possède la connexion amont : ouverture, copie, fermeture,
  réouverture espacée d'au moins `timeout`. Chaque (ré)ouverture appelle le
  [`DiscontinuityNotifier`] avant le premier octet de la connexion.
- [`RetryCopyLoop`] pilote la copie vers le puits et s'arrête sur fin de flux
  propre ou annulation.
- [`OutputPipeline`] est soit direct, soit un [`MuxedSink`] dont l'émetteur
  périodique ne démarre qu'après l'ouverture de la [`TriggerGate`].

Tous les composants partagent un [`PipelineContext`] explicite : signal
d'annulation commun et première erreur fatale.

# Exemple

```no_run
use std::sync::Arc;
use std::time::Duration;
use icystream::{
    AnySource, Destination, OutputOptions, OutputPipeline, PipelineContext, ReaderOptions,
    RetryCopyLoop, SourceReader,
};

#[tokio::main]
async fn main() -> icystream::Result<()> {
    let ctx = PipelineContext::new();
    let timeout = Duration::from_secs(5);

    let destination = Destination::parse("udp://239.0.0.1:1234?pkt_size=1500", 1316)?;
    let sink = OutputPipeline::open(&destination, &ctx, &OutputOptions::default()).await?;

    let source = Arc::new(AnySource::new("icycat/1.0", timeout)?);
    let reader = SourceReader::new(source, "http://radio.example.org/live", ReaderOptions::default())
        .with_discontinuity_notifier(sink.discontinuity_notifier());
    let (handoff, _reader) = reader.spawn(ctx.clone(), 64 * 1024);

    RetryCopyLoop::new(ctx, timeout).run(handoff, sink).await?;
    Ok(())
}
```
"#]

pub mod context;
pub mod copy;
pub mod error;
pub mod gate;
pub mod icy;
pub mod metrics;
pub mod output;
pub mod reader;
pub mod relay;
pub mod source;
pub mod tasks;

pub use context::PipelineContext;
pub use copy::{copy_with_watchdog, CopyOutcome};
pub use error::{CopyError, Result, StreamError};
pub use gate::{TriggerGate, TriggerWriter};
pub use icy::{icy_headers, ServiceMetadata};
pub use metrics::{BandwidthMetrics, MetricsSnapshot};
pub use output::{
    normalize_packet_size, Destination, MuxedSink, OutputOptions, OutputPipeline, UdpPacketSink,
};
pub use reader::{
    noop_notifier, DiscontinuityNotifier, MetadataHandler, ReaderOptions, ReaderStats,
    SourceReader,
};
pub use relay::{LoopExit, RetryCopyLoop};
pub use source::{AnySource, FileSource, HttpSource, Source, SourceStream};
pub use tasks::{FailurePolicy, TaskGroup};
