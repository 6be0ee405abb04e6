//! Découpage en paquets de 188 octets
//!
//! Deux formes de charge utile sont gérées :
//! - les sections PSI, précédées d'un `pointer_field` et bourrées avec `0xFF`
//! - les paquets PES, dont le dernier paquet est bourré par un champ d'adaptation

use crate::{TS_PACKET_SIZE, TS_SYNC_BYTE};

const HEADER_SIZE: usize = 4;
const PAYLOAD_SIZE: usize = TS_PACKET_SIZE - HEADER_SIZE;

/// Champs optionnels du champ d'adaptation du premier paquet d'un PES
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct AdaptationOptions {
    pub discontinuity: bool,
    pub random_access: bool,
    /// PCR en unités de 27 MHz
    pub pcr: Option<u64>,
}

impl AdaptationOptions {
    fn is_empty(&self) -> bool {
        !self.discontinuity && !self.random_access && self.pcr.is_none()
    }

    /// Corps du champ d'adaptation, sans l'octet de longueur
    fn body(&self) -> Vec<u8> {
        let mut flags = 0u8;
        if self.discontinuity {
            flags |= 0x80;
        }
        if self.random_access {
            flags |= 0x40;
        }
        if self.pcr.is_some() {
            flags |= 0x10;
        }

        let mut body = vec![flags];
        if let Some(pcr) = self.pcr {
            body.extend_from_slice(&encode_pcr(pcr));
        }
        body
    }
}

/// Encode l'en-tête de 4 octets d'un paquet
fn header(pid: u16, payload_unit_start: bool, adaptation_control: u8, cc: u8) -> [u8; 4] {
    [
        TS_SYNC_BYTE,
        (if payload_unit_start { 0x40 } else { 0 }) | ((pid >> 8) & 0x1F) as u8,
        (pid & 0xFF) as u8,
        (adaptation_control << 4) | (cc & 0x0F),
    ]
}

/// PCR : base 33 bits à 90 kHz, 6 bits réservés, extension 9 bits
fn encode_pcr(pcr_27mhz: u64) -> [u8; 6] {
    let base = (pcr_27mhz / 300) & 0x1_FFFF_FFFF;
    let ext = (pcr_27mhz % 300) as u16;
    [
        (base >> 25) as u8,
        (base >> 17) as u8,
        (base >> 9) as u8,
        (base >> 1) as u8,
        (((base & 1) as u8) << 7) | 0x7E | ((ext >> 8) as u8 & 0x01),
        (ext & 0xFF) as u8,
    ]
}

/// Découpe une section PSI complète (CRC inclus)
pub(crate) fn packetize_section(pid: u16, section: &[u8], cc: &mut u8, out: &mut Vec<u8>) {
    let mut payload = Vec::with_capacity(section.len() + 1);
    payload.push(0x00); // pointer_field
    payload.extend_from_slice(section);

    for (i, chunk) in payload.chunks(PAYLOAD_SIZE).enumerate() {
        out.extend_from_slice(&header(pid, i == 0, 0x01, *cc));
        out.extend_from_slice(chunk);
        out.resize(out.len() + PAYLOAD_SIZE - chunk.len(), 0xFF);
        *cc = (*cc + 1) & 0x0F;
    }
}

/// Découpe un paquet PES ; `first` décrit le champ d'adaptation du premier paquet
pub(crate) fn packetize_pes(
    pid: u16,
    pes: &[u8],
    cc: &mut u8,
    first: AdaptationOptions,
    out: &mut Vec<u8>,
) {
    let mut offset = 0;
    let mut is_first = true;

    while offset < pes.len() {
        let (mut has_af, mut body) = if is_first && !first.is_empty() {
            (true, first.body())
        } else {
            (false, Vec::new())
        };

        let remaining = pes.len() - offset;
        let space = PAYLOAD_SIZE - if has_af { 1 + body.len() } else { 0 };

        if remaining < space {
            let stuffing = space - remaining;
            if has_af {
                body.resize(body.len() + stuffing, 0xFF);
            } else {
                has_af = true;
                // Un seul octet de bourrage : champ d'adaptation de longueur nulle
                if stuffing > 1 {
                    body.push(0x00);
                    body.resize(stuffing - 1, 0xFF);
                }
            }
        }

        let take = remaining.min(PAYLOAD_SIZE - if has_af { 1 + body.len() } else { 0 });
        let control = if has_af { 0x03 } else { 0x01 };

        out.extend_from_slice(&header(pid, is_first, control, *cc));
        if has_af {
            out.push(body.len() as u8);
            out.extend_from_slice(&body);
        }
        out.extend_from_slice(&pes[offset..offset + take]);

        *cc = (*cc + 1) & 0x0F;
        offset += take;
        is_first = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid_of(packet: &[u8]) -> u16 {
        (((packet[1] & 0x1F) as u16) << 8) | packet[2] as u16
    }

    #[test]
    fn test_section_fits_one_packet() {
        let mut out = Vec::new();
        let mut cc = 0;
        packetize_section(0x0000, &[0xAA; 20], &mut cc, &mut out);

        assert_eq!(out.len(), TS_PACKET_SIZE);
        assert_eq!(out[0], TS_SYNC_BYTE);
        assert_eq!(out[1] & 0x40, 0x40, "PUSI must be set");
        assert_eq!(out[4], 0x00, "pointer field");
        assert_eq!(&out[5..25], &[0xAA; 20]);
        assert!(out[25..].iter().all(|&b| b == 0xFF));
        assert_eq!(cc, 1);
    }

    #[test]
    fn test_pes_packets_are_always_188_bytes() {
        for len in [1, 2, 150, 183, 184, 185, 367, 368, 1000] {
            let pes = vec![0x11u8; len];
            let mut out = Vec::new();
            let mut cc = 15;
            packetize_pes(0x0100, &pes, &mut cc, AdaptationOptions::default(), &mut out);

            assert_eq!(out.len() % TS_PACKET_SIZE, 0, "len {len}");
            let payload: usize = out
                .chunks(TS_PACKET_SIZE)
                .map(|p| {
                    assert_eq!(p[0], TS_SYNC_BYTE);
                    assert_eq!(pid_of(p), 0x0100);
                    let af = if p[3] & 0x20 != 0 { 1 + p[4] as usize } else { 0 };
                    TS_PACKET_SIZE - HEADER_SIZE - af
                })
                .sum();
            assert_eq!(payload, len, "len {len}");
        }
    }

    #[test]
    fn test_continuity_counter_wraps() {
        let mut out = Vec::new();
        let mut cc = 15;
        packetize_pes(0x0100, &[0u8; 400], &mut cc, AdaptationOptions::default(), &mut out);
        let counters: Vec<u8> = out.chunks(TS_PACKET_SIZE).map(|p| p[3] & 0x0F).collect();
        assert_eq!(counters, vec![15, 0, 1]);
        assert_eq!(cc, 2);
    }

    #[test]
    fn test_discontinuity_and_pcr_on_first_packet_only() {
        let mut out = Vec::new();
        let mut cc = 0;
        let opts = AdaptationOptions {
            discontinuity: true,
            random_access: true,
            pcr: Some(27_000_000),
        };
        packetize_pes(0x0100, &[0u8; 300], &mut cc, opts, &mut out);

        let first = &out[..TS_PACKET_SIZE];
        assert_eq!(first[3] & 0x30, 0x30);
        assert_eq!(first[5] & 0x80, 0x80, "discontinuity indicator");
        assert_eq!(first[5] & 0x10, 0x10, "PCR flag");

        let second = &out[TS_PACKET_SIZE..2 * TS_PACKET_SIZE];
        assert_eq!(second[1] & 0x40, 0);
        if second[3] & 0x20 != 0 && second[4] > 0 {
            assert_eq!(second[5] & 0x80, 0);
        }
    }

    #[test]
    fn test_pcr_encoding() {
        // 1 seconde = base 90000, extension 0
        let bytes = encode_pcr(27_000_000);
        let base = ((bytes[0] as u64) << 25)
            | ((bytes[1] as u64) << 17)
            | ((bytes[2] as u64) << 9)
            | ((bytes[3] as u64) << 1)
            | ((bytes[4] as u64) >> 7);
        assert_eq!(base, 90_000);
        assert_eq!(bytes[4] & 0x7E, 0x7E);
    }
}
