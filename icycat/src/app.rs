//! Assemblage du relais : puits, lecteur de source, boucle de copie, métriques

use std::sync::Arc;

use anyhow::{Context, Result};
use icyconfig::Config;
use icyserver::MetricsServer;
use icystream::{
    AnySource, BandwidthMetrics, Destination, LoopExit, OutputOptions, OutputPipeline,
    PipelineContext, ReaderOptions, RetryCopyLoop, SourceReader,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Annule le token sur Ctrl+C
pub fn spawn_interrupt_handler(cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupted, shutting down");
                cancel.cancel();
            }
            Err(e) => warn!("Cannot listen for Ctrl+C: {}", e),
        }
    })
}

/// Relaie `source` selon `config` jusqu'à la fin de flux ou l'annulation de `ctx`
pub async fn run(config: &Config, source: &str, ctx: PipelineContext) -> Result<LoopExit> {
    let metrics = config
        .metrics
        .is_enabled()
        .then(|| Arc::new(BandwidthMetrics::default()));

    let metrics_task = match (config.metrics.listen_address(), &metrics) {
        (Some(address), Some(metrics)) => {
            let server = MetricsServer::bind(&address, metrics.clone()).await?;
            Some(tokio::spawn(server.serve(ctx.child_token())))
        }
        _ => None,
    };

    let destination = Destination::parse(&config.output, config.packet_size)?;
    let options = OutputOptions {
        pipe_capacity: config.pipe_capacity,
        service_interval: config.service_interval,
    };
    let sink = OutputPipeline::open(&destination, &ctx, &options).await?;

    let upstream = Arc::new(
        AnySource::new(&config.user_agent, config.timeout).context("cannot build HTTP client")?,
    );
    let mut reader = SourceReader::new(
        upstream,
        source,
        ReaderOptions {
            timeout: config.timeout,
            restart_on_eof: config.restart_on_eof,
        },
    )
    .with_discontinuity_notifier(sink.discontinuity_notifier());
    if let Some(handler) = sink.metadata_handler() {
        reader = reader.with_metadata_handler(handler);
    }
    let (handoff, reader_task) = reader.spawn(ctx.clone(), config.pipe_capacity);

    let mut relay = RetryCopyLoop::new(ctx.clone(), config.timeout);
    if let Some(metrics) = &metrics {
        relay = relay.with_metrics(metrics.clone());
    }
    let result = relay.run(handoff, sink).await;

    // Arrête le lecteur et le serveur de métriques encore actifs
    ctx.cancel();
    match reader_task.await {
        Ok(stats) => debug!(?stats, "Source reader joined"),
        Err(e) => warn!("Source reader task failed: {}", e),
    }
    if let Some(task) = metrics_task {
        match task.await {
            Ok(Err(e)) => warn!("{:#}", e),
            Err(e) => warn!("Metrics task failed: {}", e),
            Ok(Ok(())) => {}
        }
    }

    Ok(result?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config(output: &str) -> Config {
        Config {
            output: output.to_string(),
            timeout: Duration::from_millis(200),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_file_to_file_relay() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.mp3");
        let output = dir.path().join("out.mp3");
        let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&input, &payload).unwrap();

        let config = test_config(output.to_str().unwrap());
        let exit = run(&config, input.to_str().unwrap(), PipelineContext::new())
            .await
            .unwrap();

        assert_eq!(exit, LoopExit::EndOfStream);
        assert_eq!(std::fs::read(&output).unwrap(), payload);
    }

    #[tokio::test]
    async fn test_unwritable_output_fails_setup() {
        let config = test_config("/nonexistent-dir/icycat/out.mp3");
        let err = run(&config, "/dev/null", PipelineContext::new()).await.unwrap_err();
        assert!(err.to_string().contains("cannot open output"));
    }

    #[tokio::test]
    async fn test_cancellation_stops_unreachable_source() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path().join("out.mp3").to_str().unwrap());
        config.restart_on_eof = true;
        let ctx = PipelineContext::new();

        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            canceller.cancel();
        });

        let exit = run(&config, "/nonexistent/icycat/stream.mp3", ctx).await.unwrap();
        assert_eq!(exit, LoopExit::Cancelled);
    }

    #[tokio::test]
    async fn test_metrics_bind_failure_is_fatal() {
        let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let taken = blocker.local_addr().unwrap().to_string();

        let mut config = test_config("-");
        config.metrics.address = Some(taken);
        let err = run(&config, "/dev/null", PipelineContext::new()).await.unwrap_err();
        assert!(format!("{:#}", err).contains("cannot bind metrics endpoint"));
    }
}
