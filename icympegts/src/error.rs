use std::io;

/// Erreurs du multiplexeur et de ses writers de programme
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    /// Échec d'écriture vers le puits sous-jacent
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Multiplexeur (ou writer) déjà fermé
    #[error("multiplexer closed")]
    Closed,

    /// Trame trop grande pour un seul paquet PES
    #[error("frame too large for a PES packet: {0} bytes")]
    FrameTooLarge(usize),
}
