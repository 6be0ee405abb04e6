//! Multiplexeur MPEG-TS
//!
//! Le [`Muxer`] partage un puits d'écriture entre :
//! - une boucle de service ([`Muxer::serve`]) qui réémet PAT/PMT/SDT périodiquement
//! - un ou plusieurs [`ProgramWriter`] qui portent les trames audio en PES
//!
//! Chaque écriture (table ou trame) est émise d'un bloc sous le verrou du
//! puits, les paquets de deux écritures ne sont donc jamais entrelacés.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::packet::{packetize_pes, packetize_section, AdaptationOptions};
use crate::pes::audio_pes;
use crate::psi::{pat, pmt, sdt};
use crate::{AudioFrame, MuxError, StreamType};

const PID_PAT: u16 = 0x0000;
const PID_SDT: u16 = 0x0011;
const PID_PMT_BASE: u16 = 0x1000;
const PID_ES_BASE: u16 = 0x0100;

/// Décalage initial entre PCR et PTS (700 ms, marge de décodage)
const PTS_OFFSET_90KHZ: u64 = 63_000;

type BoxedSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Nom et fournisseur annoncés dans la SDT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceTable {
    pub name: String,
    pub provider: String,
}

/// Options du multiplexeur
#[derive(Debug, Clone)]
pub struct MuxOptions {
    pub transport_stream_id: u16,
    /// Période d'émission des tables PSI
    pub service_interval: Duration,
}

impl Default for MuxOptions {
    fn default() -> Self {
        Self {
            transport_stream_id: 1,
            service_interval: Duration::from_millis(100),
        }
    }
}

struct ProgramEntry {
    program_number: u16,
    pmt_pid: u16,
    pmt_cc: u8,
    streams: Vec<(StreamType, u16)>,
}

struct PsiState {
    version: u8,
    pat_cc: u8,
    sdt_cc: u8,
    programs: Vec<ProgramEntry>,
    service: Option<ServiceTable>,
    next_es_pid: u16,
}

impl PsiState {
    fn bump_version(&mut self) {
        self.version = (self.version + 1) & 0x1F;
    }

    /// Encode PAT, PMT(s) et SDT en paquets
    fn encode(&mut self, transport_stream_id: u16) -> Vec<u8> {
        let mut out = Vec::new();

        let programs: Vec<(u16, u16)> = self
            .programs
            .iter()
            .map(|p| (p.program_number, p.pmt_pid))
            .collect();
        let section = pat(transport_stream_id, self.version, &programs);
        packetize_section(PID_PAT, &section, &mut self.pat_cc, &mut out);

        let version = self.version;
        for program in &mut self.programs {
            let streams: Vec<(u8, u16)> = program
                .streams
                .iter()
                .map(|(t, pid)| (t.code(), *pid))
                .collect();
            let pcr_pid = streams.first().map(|(_, pid)| *pid).unwrap_or(0x1FFF);
            let section = pmt(program.program_number, version, pcr_pid, &streams);
            packetize_section(program.pmt_pid, &section, &mut program.pmt_cc, &mut out);
        }

        if let (Some(service), Some(program)) = (&self.service, self.programs.first()) {
            let section = sdt(
                transport_stream_id,
                self.version,
                program.program_number,
                &service.provider,
                &service.name,
            );
            packetize_section(PID_SDT, &section, &mut self.sdt_cc, &mut out);
        }

        out
    }
}

struct MuxInner {
    sink: tokio::sync::Mutex<Option<BoxedSink>>,
    psi: Mutex<PsiState>,
    options: MuxOptions,
    /// Résolu à la première trame audio écrite avec succès
    payload_started: CancellationToken,
    /// Résolu par `close()`
    closed: CancellationToken,
}

impl MuxInner {
    fn psi(&self) -> std::sync::MutexGuard<'_, PsiState> {
        self.psi.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn write_packets(&self, packets: &[u8]) -> Result<(), MuxError> {
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(MuxError::Closed)?;
        sink.write_all(packets).await?;
        Ok(())
    }

    async fn write_psi(&self) -> Result<(), MuxError> {
        let packets = self.psi().encode(self.options.transport_stream_id);
        trace!("Emitting PSI ({} bytes)", packets.len());
        self.write_packets(&packets).await
    }
}

/// Multiplexeur MPEG-TS partagé
#[derive(Clone)]
pub struct Muxer {
    inner: Arc<MuxInner>,
}

impl Muxer {
    pub fn new<W>(sink: W, options: MuxOptions) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            inner: Arc::new(MuxInner {
                sink: tokio::sync::Mutex::new(Some(Box::new(sink))),
                psi: Mutex::new(PsiState {
                    version: 0,
                    pat_cc: 0,
                    sdt_cc: 0,
                    programs: Vec::new(),
                    service: None,
                    next_es_pid: PID_ES_BASE,
                }),
                options,
                payload_started: CancellationToken::new(),
                closed: CancellationToken::new(),
            }),
        }
    }

    /// Crée un writer pour un flux élémentaire du programme `program_id`
    ///
    /// Le type de flux est mis à jour à la première trame si le codec réel diffère.
    pub fn writer(&self, program_id: u16, stream_type: StreamType) -> Result<ProgramWriter, MuxError> {
        if self.inner.closed.is_cancelled() {
            return Err(MuxError::Closed);
        }

        let mut psi = self.inner.psi();
        let pid = psi.next_es_pid;
        psi.next_es_pid += 1;

        let index = match psi.programs.iter().position(|p| p.program_number == program_id) {
            Some(i) => i,
            None => {
                let pmt_pid = PID_PMT_BASE + psi.programs.len() as u16;
                psi.programs.push(ProgramEntry {
                    program_number: program_id,
                    pmt_pid,
                    pmt_cc: 0,
                    streams: Vec::new(),
                });
                psi.programs.len() - 1
            }
        };
        psi.programs[index].streams.push((stream_type, pid));
        psi.bump_version();
        drop(psi);

        debug!(program_id, pid, ?stream_type, "Created program writer");
        Ok(ProgramWriter {
            inner: self.inner.clone(),
            program_id,
            pid,
            stream_type,
            cc: 0,
            clock_secs: 0.0,
            discontinuity: DiscontinuityMarker::default(),
            closed: false,
        })
    }

    /// Configure le nom et le fournisseur du service (SDT)
    pub fn set_service_table(&self, table: ServiceTable) {
        let mut psi = self.inner.psi();
        if psi.service.as_ref() != Some(&table) {
            debug!(name = %table.name, provider = %table.provider, "Service table updated");
            psi.service = Some(table);
            psi.bump_version();
        }
    }

    /// Indique si au moins une trame audio a été écrite
    pub fn payload_started(&self) -> bool {
        self.inner.payload_started.is_cancelled()
    }

    /// Boucle d'émission périodique des tables PSI
    ///
    /// La première émission attend la première trame audio écrite. Retourne
    /// `Ok(())` sur annulation ou fermeture, une erreur si le puits échoue.
    pub async fn serve(&self, cancel: CancellationToken) -> Result<(), MuxError> {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = self.inner.closed.cancelled() => return Ok(()),
            _ = self.inner.payload_started.cancelled() => {}
        }
        debug!("Multiplexer serve loop started");

        let mut ticker = tokio::time::interval(self.inner.options.service_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = self.inner.closed.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }

            match self.inner.write_psi().await {
                Ok(()) => {}
                // Fermeture concurrente : fin normale
                Err(MuxError::Closed) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    /// Ferme le multiplexeur : arrête `serve`, vide et ferme le puits
    pub async fn close(&self) -> Result<(), MuxError> {
        self.inner.closed.cancel();
        let mut guard = self.inner.sink.lock().await;
        match guard.take() {
            Some(mut sink) => {
                sink.flush().await?;
                sink.shutdown().await?;
                debug!("Multiplexer closed");
                Ok(())
            }
            None => Err(MuxError::Closed),
        }
    }
}

/// Poignée clonable pour marquer une discontinuité depuis une autre tâche
#[derive(Debug, Clone, Default)]
pub struct DiscontinuityMarker {
    pending: Arc<AtomicBool>,
}

impl DiscontinuityMarker {
    /// Le prochain paquet audio portera l'indicateur de discontinuité
    pub fn mark(&self) {
        self.pending.store(true, Ordering::SeqCst);
    }

    fn take(&self) -> bool {
        self.pending.swap(false, Ordering::SeqCst)
    }
}

/// Writer d'un flux élémentaire audio
pub struct ProgramWriter {
    inner: Arc<MuxInner>,
    program_id: u16,
    pid: u16,
    stream_type: StreamType,
    cc: u8,
    /// Position de la prochaine trame sur la ligne de temps audio
    clock_secs: f64,
    discontinuity: DiscontinuityMarker,
    closed: bool,
}

impl ProgramWriter {
    pub fn pid(&self) -> u16 {
        self.pid
    }

    pub fn discontinuity_marker(&self) -> DiscontinuityMarker {
        self.discontinuity.clone()
    }

    pub fn mark_discontinuity(&self) {
        self.discontinuity.mark();
    }

    /// Écrit une trame ; retourne le nombre d'octets de la trame consommés
    pub async fn write(&mut self, frame: &AudioFrame) -> Result<usize, MuxError> {
        if self.closed {
            return Err(MuxError::Closed);
        }

        let stream_type = frame.codec.stream_type();
        if stream_type != self.stream_type {
            self.update_stream_type(stream_type);
        }

        let elapsed_90k = (self.clock_secs * 90_000.0) as u64;
        let pes = audio_pes(&frame.data, PTS_OFFSET_90KHZ + elapsed_90k)?;

        let discontinuity = self.discontinuity.take();
        if discontinuity {
            debug!(pid = self.pid, "Marking discontinuity");
        }
        let first = AdaptationOptions {
            discontinuity,
            random_access: true,
            pcr: Some(elapsed_90k * 300),
        };

        let mut packets = Vec::with_capacity((pes.len() / 184 + 2) * crate::TS_PACKET_SIZE);

        // Tables en tête du tout premier paquet audio
        let first_payload = !self.inner.payload_started.is_cancelled();
        if first_payload {
            packets.extend(self.inner.psi().encode(self.inner.options.transport_stream_id));
        }
        packetize_pes(self.pid, &pes, &mut self.cc, first, &mut packets);

        if let Err(e) = self.inner.write_packets(&packets).await {
            if discontinuity {
                // Ne pas perdre le marqueur pour la prochaine tentative
                self.discontinuity.mark();
            }
            return Err(e);
        }

        self.clock_secs += frame.duration().as_secs_f64();
        if first_payload {
            self.inner.payload_started.cancel();
        }
        Ok(frame.data.len())
    }

    /// Ferme ce writer ; le puits reste ouvert jusqu'à `Muxer::close`
    pub async fn close(&mut self) -> Result<(), MuxError> {
        if self.closed {
            return Err(MuxError::Closed);
        }
        self.closed = true;

        let mut guard = self.inner.sink.lock().await;
        if let Some(sink) = guard.as_mut() {
            sink.flush().await?;
        }
        debug!(program_id = self.program_id, pid = self.pid, "Program writer closed");
        Ok(())
    }

    fn update_stream_type(&mut self, stream_type: StreamType) {
        let mut psi = self.inner.psi();
        if let Some(program) = psi
            .programs
            .iter_mut()
            .find(|p| p.program_number == self.program_id)
        {
            if let Some(entry) = program.streams.iter_mut().find(|(_, pid)| *pid == self.pid) {
                entry.0 = stream_type;
            }
        } else {
            warn!(program_id = self.program_id, "Program vanished from PSI state");
        }
        psi.bump_version();
        debug!(pid = self.pid, from = ?self.stream_type, to = ?stream_type, "Stream type changed");
        self.stream_type = stream_type;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::tests::{adts_frame, mp3_frame};
    use crate::{AudioCodec, TS_PACKET_SIZE, TS_SYNC_BYTE};
    use bytes::Bytes;
    use tokio::io::AsyncReadExt;

    fn frame(data: Vec<u8>, codec: AudioCodec) -> AudioFrame {
        AudioFrame {
            data: Bytes::from(data),
            codec,
            sample_rate: 44100,
            samples: 1152,
        }
    }

    fn pids(ts: &[u8]) -> Vec<u16> {
        ts.chunks(TS_PACKET_SIZE)
            .map(|p| {
                assert_eq!(p[0], TS_SYNC_BYTE);
                (((p[1] & 0x1F) as u16) << 8) | p[2] as u16
            })
            .collect()
    }

    #[tokio::test]
    async fn test_first_frame_is_preceded_by_psi() {
        let (sink, mut rx) = tokio::io::duplex(64 * 1024);
        let mux = Muxer::new(sink, MuxOptions::default());
        mux.set_service_table(ServiceTable {
            name: "Radio".into(),
            provider: "example.org".into(),
        });
        let mut writer = mux.writer(1, StreamType::Mpeg1Audio).unwrap();

        let n = writer
            .write(&frame(mp3_frame(0), AudioCodec::Mpeg { version: 1, layer: 3 }))
            .await
            .unwrap();
        assert_eq!(n, 417);
        assert!(mux.payload_started());

        writer.close().await.unwrap();
        mux.close().await.unwrap();

        let mut ts = Vec::new();
        rx.read_to_end(&mut ts).await.unwrap();
        assert_eq!(ts.len() % TS_PACKET_SIZE, 0);

        let pids = pids(&ts);
        assert_eq!(&pids[..3], &[PID_PAT, PID_PMT_BASE, PID_SDT]);
        assert!(pids[3..].iter().all(|&p| p == PID_ES_BASE));
    }

    #[tokio::test]
    async fn test_discontinuity_marker_applies_to_next_packet_only() {
        let (sink, mut rx) = tokio::io::duplex(64 * 1024);
        let mux = Muxer::new(sink, MuxOptions::default());
        let mut writer = mux.writer(1, StreamType::AdtsAac).unwrap();
        let marker = writer.discontinuity_marker();

        marker.mark();
        writer.write(&frame(adts_frame(100), AudioCodec::Adts)).await.unwrap();
        writer.write(&frame(adts_frame(100), AudioCodec::Adts)).await.unwrap();
        mux.close().await.unwrap();

        let mut ts = Vec::new();
        rx.read_to_end(&mut ts).await.unwrap();
        let audio: Vec<&[u8]> = ts
            .chunks(TS_PACKET_SIZE)
            .filter(|p| ((((p[1] & 0x1F) as u16) << 8) | p[2] as u16) == PID_ES_BASE)
            .collect();
        assert_eq!(audio.len(), 2);
        assert_eq!(audio[0][5] & 0x80, 0x80);
        assert_eq!(audio[1][5] & 0x80, 0x00);
    }

    #[tokio::test]
    async fn test_stream_type_follows_first_frame() {
        let (sink, _rx) = tokio::io::duplex(64 * 1024);
        let mux = Muxer::new(sink, MuxOptions::default());
        let mut writer = mux.writer(1, StreamType::Mpeg1Audio).unwrap();
        writer.write(&frame(adts_frame(100), AudioCodec::Adts)).await.unwrap();

        let psi = mux.inner.psi();
        assert_eq!(psi.programs[0].streams[0].0, StreamType::AdtsAac);
        assert!(psi.version >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_serve_waits_for_payload() {
        let (sink, _rx) = tokio::io::duplex(1024 * 1024);
        let mux = Muxer::new(sink, MuxOptions::default());
        let mut writer = mux.writer(1, StreamType::Mpeg1Audio).unwrap();

        let serving = {
            let mux = mux.clone();
            tokio::spawn(async move { mux.serve(CancellationToken::new()).await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!mux.payload_started());
        assert!(!serving.is_finished());

        writer
            .write(&frame(mp3_frame(0), AudioCodec::Mpeg { version: 1, layer: 3 }))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(350)).await;

        mux.close().await.unwrap();
        assert!(serving.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let (sink, _rx) = tokio::io::duplex(1024);
        let mux = Muxer::new(sink, MuxOptions::default());
        let mut writer = mux.writer(1, StreamType::Mpeg1Audio).unwrap();
        mux.close().await.unwrap();

        let err = writer
            .write(&frame(mp3_frame(0), AudioCodec::Mpeg { version: 1, layer: 3 }))
            .await
            .unwrap_err();
        assert!(matches!(err, MuxError::Closed));
        assert!(matches!(mux.close().await, Err(MuxError::Closed)));
        assert!(matches!(mux.writer(1, StreamType::Mpeg1Audio), Err(MuxError::Closed)));
    }
}
