//! # icympegts - Multiplexeur MPEG-TS audio minimal
//!
//! Cette crate fournit ce dont le relais a besoin pour réémettre un flux
//! audio compressé dans un transport stream :
//!
//! - [`FrameScanner`] : découpe un flux d'octets en trames MPEG audio / ADTS
//! - [`Muxer`] : émet périodiquement PAT, PMT et SDT, et porte les trames
//!   audio dans des paquets PES via un [`ProgramWriter`]
//!
//! ## Pipeline type
//!
//! ```text
//! AsyncRead → FrameScanner → ProgramWriter ─┐
//!                                           ├→ Muxer → AsyncWrite (UDP, fichier)
//!             Muxer::serve (PSI périodique) ┘
//! ```
//!
//! Le multiplexeur n'émet aucune table tant qu'aucune trame audio n'a été
//! écrite : un transport partiellement configuré ne produit jamais de paquets
//! structurels sans contenu.

mod error;
mod mux;
mod packet;
mod pes;
mod psi;
mod scanner;

pub use error::MuxError;
pub use mux::{DiscontinuityMarker, MuxOptions, Muxer, ProgramWriter, ServiceTable};
pub use scanner::{AudioCodec, AudioFrame, FrameScanner};

/// Taille d'un paquet MPEG-TS
pub const TS_PACKET_SIZE: usize = 188;

/// Octet de synchronisation MPEG-TS (0x47)
pub const TS_SYNC_BYTE: u8 = 0x47;

/// Types de flux élémentaires (ISO/IEC 13818-1, table 2-34)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamType {
    /// MPEG-1 audio (0x03)
    Mpeg1Audio,
    /// MPEG-2 audio, y compris MPEG-2.5 (0x04)
    Mpeg2Audio,
    /// AAC en trames ADTS (0x0F)
    AdtsAac,
}

impl StreamType {
    pub fn code(self) -> u8 {
        match self {
            StreamType::Mpeg1Audio => 0x03,
            StreamType::Mpeg2Audio => 0x04,
            StreamType::AdtsAac => 0x0F,
        }
    }
}
