//! Détection des frontières de trames audio dans un flux d'octets
//!
//! Le scanner reconnaît les en-têtes MPEG-1/2/2.5 Layer I/II/III et ADTS (AAC).
//! Comme le motif de synchronisation (11 ou 12 bits à 1) apparaît au hasard
//! dans les données compressées, une trame n'est acceptée que si l'en-tête
//! suivant est lui aussi valide, quand il est déjà disponible. Les octets
//! ne formant pas une trame (tags ID3v2, données tronquées, bruit) sont ignorés.

use std::io;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, trace};

use crate::StreamType;

const READ_CHUNK: usize = 8 * 1024;
const MIN_HEADER: usize = 7;

/// Famille de codec d'une trame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodec {
    /// MPEG audio ; `version` vaut 1, 2 ou 25 (MPEG-2.5), `layer` 1 à 3
    Mpeg { version: u8, layer: u8 },
    /// AAC en trames ADTS
    Adts,
}

impl AudioCodec {
    pub fn stream_type(self) -> StreamType {
        match self {
            AudioCodec::Mpeg { version: 1, .. } => StreamType::Mpeg1Audio,
            AudioCodec::Mpeg { .. } => StreamType::Mpeg2Audio,
            AudioCodec::Adts => StreamType::AdtsAac,
        }
    }
}

/// Une trame audio complète
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub data: Bytes,
    pub codec: AudioCodec,
    pub sample_rate: u32,
    pub samples: u32,
}

impl AudioFrame {
    /// Durée de lecture de la trame
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples as f64 / self.sample_rate as f64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct FrameHeader {
    codec: AudioCodec,
    length: usize,
    sample_rate: u32,
    samples: u32,
}

/// Découpe un `AsyncRead` en [`AudioFrame`]
pub struct FrameScanner<R> {
    reader: R,
    buffer: BytesMut,
    eof: bool,
    skipped: u64,
    /// Octets d'un tag ID3v2 restant à ignorer au fil de l'arrivée
    tag_remaining: usize,
}

impl<R: AsyncRead + Unpin> FrameScanner<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: BytesMut::with_capacity(2 * READ_CHUNK),
            eof: false,
            skipped: 0,
            tag_remaining: 0,
        }
    }

    /// Nombre d'octets ignorés faute de trame valide
    pub fn skipped_bytes(&self) -> u64 {
        self.skipped
    }

    /// Retourne la trame suivante, ou `None` en fin de flux
    ///
    /// Une trame tronquée en fin de flux est abandonnée.
    pub async fn next_frame(&mut self) -> io::Result<Option<AudioFrame>> {
        loop {
            match self.try_extract() {
                Extract::Frame(frame) => return Ok(Some(frame)),
                Extract::NeedMore => {}
            }

            if self.eof {
                if !self.buffer.is_empty() {
                    debug!(
                        "Dropping {} trailing bytes at end of stream",
                        self.buffer.len()
                    );
                    self.skipped += self.buffer.len() as u64;
                    self.buffer.clear();
                }
                return Ok(None);
            }

            self.buffer.reserve(READ_CHUNK);
            let n = self.reader.read_buf(&mut self.buffer).await?;
            if n == 0 {
                self.eof = true;
            }
        }
    }

    fn try_extract(&mut self) -> Extract {
        loop {
            if self.tag_remaining > 0 {
                let skip = self.tag_remaining.min(self.buffer.len());
                self.discard(skip);
                self.tag_remaining -= skip;
                if self.tag_remaining > 0 {
                    return Extract::NeedMore;
                }
            }

            if self.buffer.len() < MIN_HEADER {
                return Extract::NeedMore;
            }

            if let Some(tag_len) = id3v2_length(&self.buffer) {
                trace!("Skipping ID3v2 tag ({} bytes)", tag_len);
                self.tag_remaining = tag_len;
                continue;
            }

            let Some(header) = parse_header(&self.buffer) else {
                self.discard_until_sync();
                continue;
            };

            if self.buffer.len() < header.length {
                if self.eof {
                    // Trame tronquée : resynchronisation sur la suite
                    self.discard(1);
                    continue;
                }
                return Extract::NeedMore;
            }

            // Validation par l'en-tête suivant quand il est disponible
            let next = &self.buffer[header.length..];
            if next.len() >= MIN_HEADER {
                match parse_header(next) {
                    Some(h) if same_stream(&h, &header) => {}
                    _ if id3v2_length(next).is_some() => {}
                    _ => {
                        self.discard(1);
                        continue;
                    }
                }
            } else if !self.eof {
                return Extract::NeedMore;
            }

            let data = self.buffer.split_to(header.length).freeze();
            return Extract::Frame(AudioFrame {
                data,
                codec: header.codec,
                sample_rate: header.sample_rate,
                samples: header.samples,
            });
        }
    }

    fn discard(&mut self, n: usize) {
        self.skipped += n as u64;
        self.buffer.advance(n);
    }

    fn discard_until_sync(&mut self) {
        let pos = self.buffer[1..]
            .iter()
            .position(|&b| b == 0xFF || b == b'I')
            .map(|p| p + 1)
            .unwrap_or(self.buffer.len());
        self.discard(pos);
    }
}

enum Extract {
    Frame(AudioFrame),
    NeedMore,
}

fn same_stream(a: &FrameHeader, b: &FrameHeader) -> bool {
    a.codec == b.codec && a.sample_rate == b.sample_rate
}

/// Longueur totale d'un tag ID3v2 (en-tête de 10 octets inclus)
fn id3v2_length(data: &[u8]) -> Option<usize> {
    if data.len() < 10 || &data[..3] != b"ID3" {
        return None;
    }
    let size = &data[6..10];
    if size.iter().any(|b| b & 0x80 != 0) {
        return None;
    }
    let synchsafe = ((size[0] as usize) << 21)
        | ((size[1] as usize) << 14)
        | ((size[2] as usize) << 7)
        | size[3] as usize;
    let footer = if data[5] & 0x10 != 0 { 10 } else { 0 };
    Some(10 + synchsafe + footer)
}

fn parse_header(data: &[u8]) -> Option<FrameHeader> {
    if data.len() < MIN_HEADER || data[0] != 0xFF {
        return None;
    }
    if data[1] & 0xF6 == 0xF0 {
        parse_adts(data)
    } else if data[1] & 0xE0 == 0xE0 {
        parse_mpeg(data)
    } else {
        None
    }
}

const ADTS_SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

fn parse_adts(data: &[u8]) -> Option<FrameHeader> {
    let sf_index = ((data[2] >> 2) & 0x0F) as usize;
    let sample_rate = *ADTS_SAMPLE_RATES.get(sf_index)?;

    let length = (((data[3] & 0x03) as usize) << 11)
        | ((data[4] as usize) << 3)
        | ((data[5] as usize) >> 5);
    let header_len = if data[1] & 0x01 == 0 { 9 } else { 7 };
    if length <= header_len {
        return None;
    }

    let blocks = (data[6] & 0x03) as u32 + 1;
    Some(FrameHeader {
        codec: AudioCodec::Adts,
        length,
        sample_rate,
        samples: 1024 * blocks,
    })
}

// Débits en kbit/s, indexés par bitrate_index (0 = libre, non supporté)
const BITRATES_V1_L1: [u32; 15] = [0, 32, 64, 96, 128, 160, 192, 224, 256, 288, 320, 352, 384, 416, 448];
const BITRATES_V1_L2: [u32; 15] = [0, 32, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384];
const BITRATES_V1_L3: [u32; 15] = [0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320];
const BITRATES_V2_L1: [u32; 15] = [0, 32, 48, 56, 64, 80, 96, 112, 128, 144, 160, 176, 192, 224, 256];
const BITRATES_V2_L23: [u32; 15] = [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160];

fn parse_mpeg(data: &[u8]) -> Option<FrameHeader> {
    let version = match (data[1] >> 3) & 0x03 {
        0 => 25,
        2 => 2,
        3 => 1,
        _ => return None,
    };
    let layer = match (data[1] >> 1) & 0x03 {
        1 => 3,
        2 => 2,
        3 => 1,
        _ => return None,
    };

    let bitrate_index = (data[2] >> 4) as usize;
    if bitrate_index == 0 || bitrate_index == 15 {
        return None;
    }
    let table = match (version, layer) {
        (1, 1) => &BITRATES_V1_L1,
        (1, 2) => &BITRATES_V1_L2,
        (1, _) => &BITRATES_V1_L3,
        (_, 1) => &BITRATES_V2_L1,
        _ => &BITRATES_V2_L23,
    };
    let bitrate = table[bitrate_index] * 1000;

    let base_rate = match (data[2] >> 2) & 0x03 {
        0 => 44100,
        1 => 48000,
        2 => 32000,
        _ => return None,
    };
    let sample_rate = match version {
        1 => base_rate,
        2 => base_rate / 2,
        _ => base_rate / 4,
    };

    let padding = ((data[2] >> 1) & 0x01) as u32;
    let (length, samples) = match layer {
        1 => ((12 * bitrate / sample_rate + padding) * 4, 384),
        2 => (144 * bitrate / sample_rate + padding, 1152),
        _ if version == 1 => (144 * bitrate / sample_rate + padding, 1152),
        _ => (72 * bitrate / sample_rate + padding, 576),
    };
    if (length as usize) < MIN_HEADER {
        return None;
    }

    Some(FrameHeader {
        codec: AudioCodec::Mpeg { version, layer },
        length: length as usize,
        sample_rate,
        samples,
    })
}
