//! En-têtes PES audio avec PTS

use crate::MuxError;

/// stream_id des flux audio MPEG (0xC0 = premier flux audio)
const AUDIO_STREAM_ID: u8 = 0xC0;
const PES_HEADER_DATA_LENGTH: u8 = 5;

/// Construit un paquet PES contenant une trame audio
///
/// `pts` est exprimé en unités de 90 kHz (33 bits).
pub(crate) fn audio_pes(payload: &[u8], pts: u64) -> Result<Vec<u8>, MuxError> {
    // Octets suivant le champ PES_packet_length
    let packet_length = 3 + PES_HEADER_DATA_LENGTH as usize + payload.len();
    if packet_length > u16::MAX as usize {
        return Err(MuxError::FrameTooLarge(payload.len()));
    }

    let mut pes = Vec::with_capacity(6 + packet_length);
    pes.extend_from_slice(&[0x00, 0x00, 0x01, AUDIO_STREAM_ID]);
    pes.extend_from_slice(&(packet_length as u16).to_be_bytes());
    pes.push(0x84); // '10', data_alignment_indicator
    pes.push(0x80); // PTS seul
    pes.push(PES_HEADER_DATA_LENGTH);
    pes.extend_from_slice(&encode_pts(pts));
    pes.extend_from_slice(payload);
    Ok(pes)
}

fn encode_pts(pts: u64) -> [u8; 5] {
    let pts = pts & 0x1_FFFF_FFFF;
    [
        0x21 | ((pts >> 29) as u8 & 0x0E),
        (pts >> 22) as u8,
        0x01 | ((pts >> 14) as u8 & 0xFE),
        (pts >> 7) as u8,
        0x01 | ((pts << 1) as u8 & 0xFE),
    ]
}
