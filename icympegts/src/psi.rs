//! Sections PSI/SI : PAT, PMT et SDT (avec descripteur de service DVB)

/// Identifiants de table
const TABLE_PAT: u8 = 0x00;
const TABLE_PMT: u8 = 0x02;
const TABLE_SDT_ACTUAL: u8 = 0x42;

/// Descripteur de service DVB (EN 300 468, 6.2.33)
const SERVICE_DESCRIPTOR_TAG: u8 = 0x48;
/// service_type "digital radio sound service"
const SERVICE_TYPE_DIGITAL_RADIO: u8 = 0x02;

const ORIGINAL_NETWORK_ID: u16 = 0xFF01;

/// Calcule le CRC-32/MPEG-2 d'une section
///
/// Polynôme 0x04C11DB7, initialisé à 0xFFFFFFFF, sans réflexion ni XOR final.
pub(crate) fn crc32_mpeg2(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = generate_crc32_table();

    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in data {
        crc = (crc << 8) ^ CRC32_TABLE[(((crc >> 24) as u8) ^ byte) as usize];
    }
    crc
}

const fn generate_crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u32) << 24;
        let mut j = 0;
        while j < 8 {
            if (crc & 0x8000_0000) != 0 {
                crc = (crc << 1) ^ 0x04C1_1DB7;
            } else {
                crc <<= 1;
            }
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Section longue (section_syntax_indicator = 1) avec CRC
fn long_section(table_id: u8, flags_nibble: u8, table_id_ext: u16, version: u8, body: &[u8]) -> Vec<u8> {
    // 5 octets d'en-tête étendu + corps + CRC
    let section_length = 5 + body.len() + 4;

    let mut section = Vec::with_capacity(3 + section_length);
    section.push(table_id);
    section.push(flags_nibble | ((section_length >> 8) as u8 & 0x0F));
    section.push((section_length & 0xFF) as u8);
    section.extend_from_slice(&table_id_ext.to_be_bytes());
    section.push(0xC0 | ((version & 0x1F) << 1) | 0x01);
    section.push(0x00); // section_number
    section.push(0x00); // last_section_number
    section.extend_from_slice(body);

    let crc = crc32_mpeg2(&section);
    section.extend_from_slice(&crc.to_be_bytes());
    section
}

/// PAT : association programme → PID de PMT
pub(crate) fn pat(transport_stream_id: u16, version: u8, programs: &[(u16, u16)]) -> Vec<u8> {
    let mut body = Vec::with_capacity(programs.len() * 4);
    for &(program_number, pmt_pid) in programs {
        body.extend_from_slice(&program_number.to_be_bytes());
        body.push(0xE0 | ((pmt_pid >> 8) as u8 & 0x1F));
        body.push((pmt_pid & 0xFF) as u8);
    }
    long_section(TABLE_PAT, 0xB0, transport_stream_id, version, &body)
}

/// PMT : flux élémentaires d'un programme, `streams` = (type, PID)
pub(crate) fn pmt(program_number: u16, version: u8, pcr_pid: u16, streams: &[(u8, u16)]) -> Vec<u8> {
    let mut body = Vec::with_capacity(4 + streams.len() * 5);
    body.push(0xE0 | ((pcr_pid >> 8) as u8 & 0x1F));
    body.push((pcr_pid & 0xFF) as u8);
    body.extend_from_slice(&[0xF0, 0x00]); // program_info_length = 0
    for &(stream_type, pid) in streams {
        body.push(stream_type);
        body.push(0xE0 | ((pid >> 8) as u8 & 0x1F));
        body.push((pid & 0xFF) as u8);
        body.extend_from_slice(&[0xF0, 0x00]); // ES_info_length = 0
    }
    long_section(TABLE_PMT, 0xB0, program_number, version, &body)
}

/// SDT (actual TS) : un service avec son descripteur nom/fournisseur
pub(crate) fn sdt(
    transport_stream_id: u16,
    version: u8,
    service_id: u16,
    provider: &str,
    name: &str,
) -> Vec<u8> {
    let provider = truncate_name(provider);
    let name = truncate_name(name);

    let mut descriptor = Vec::with_capacity(5 + provider.len() + name.len());
    descriptor.push(SERVICE_DESCRIPTOR_TAG);
    descriptor.push((3 + provider.len() + name.len()) as u8);
    descriptor.push(SERVICE_TYPE_DIGITAL_RADIO);
    descriptor.push(provider.len() as u8);
    descriptor.extend_from_slice(provider);
    descriptor.push(name.len() as u8);
    descriptor.extend_from_slice(name);

    let mut body = Vec::with_capacity(8 + descriptor.len());
    body.extend_from_slice(&ORIGINAL_NETWORK_ID.to_be_bytes());
    body.push(0xFF); // reserved_future_use
    body.extend_from_slice(&service_id.to_be_bytes());
    body.push(0xFC); // pas d'EIT
    // running_status = 4 (en cours), free_CA_mode = 0
    body.push(0x80 | ((descriptor.len() >> 8) as u8 & 0x0F));
    body.push((descriptor.len() & 0xFF) as u8);
    body.extend_from_slice(&descriptor);

    long_section(TABLE_SDT_ACTUAL, 0xF0, transport_stream_id, version, &body)
}

/// Les longueurs de chaînes du descripteur tiennent sur un octet ; on garde
/// une marge pour que la section reste dans un seul paquet.
fn truncate_name(s: &str) -> &[u8] {
    const MAX: usize = 64;
    if s.len() <= MAX {
        return s.as_bytes();
    }
    let mut end = MAX;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s.as_bytes()[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_check_value() {
        // Valeur de contrôle du CRC-32/MPEG-2
        assert_eq!(crc32_mpeg2(b"123456789"), 0x0376_E6E7);
    }

    #[test]
    fn test_section_crc_over_whole_section_is_zero() {
        // Propriété du CRC MPEG-2 : le CRC calculé sur la section complète vaut 0
        let section = pat(1, 0, &[(1, 0x1000)]);
        assert_eq!(crc32_mpeg2(&section), 0);
    }

    #[test]
    fn test_pat_layout() {
        let section = pat(0x0001, 3, &[(1, 0x1000)]);
        assert_eq!(section[0], 0x00);
        let section_length = (((section[1] & 0x0F) as usize) << 8) | section[2] as usize;
        assert_eq!(section_length, section.len() - 3);
        assert_eq!((section[5] >> 1) & 0x1F, 3, "version");
        assert_eq!(&section[8..10], &[0x00, 0x01]);
        assert_eq!(((section[10] as u16 & 0x1F) << 8) | section[11] as u16, 0x1000);
    }

    #[test]
    fn test_pmt_lists_streams() {
        let section = pmt(1, 0, 0x0100, &[(0x0F, 0x0100)]);
        assert_eq!(section[0], 0x02);
        // PCR PID
        assert_eq!(((section[8] as u16 & 0x1F) << 8) | section[9] as u16, 0x0100);
        assert_eq!(section[12], 0x0F);
        assert_eq!(crc32_mpeg2(&section), 0);
    }

    #[test]
    fn test_sdt_carries_service_descriptor() {
        let section = sdt(1, 0, 1, "example.org", "Radio Test");
        assert_eq!(section[0], 0x42);
        let descriptor = &section[16..];
        assert_eq!(descriptor[0], SERVICE_DESCRIPTOR_TAG);
        assert_eq!(descriptor[2], SERVICE_TYPE_DIGITAL_RADIO);
        let provider_len = descriptor[3] as usize;
        assert_eq!(&descriptor[4..4 + provider_len], b"example.org");
        let name_len = descriptor[4 + provider_len] as usize;
        assert_eq!(
            &descriptor[5 + provider_len..5 + provider_len + name_len],
            b"Radio Test"
        );
        assert_eq!(crc32_mpeg2(&section), 0);
    }

    #[test]
    fn test_long_names_are_truncated_on_char_boundary() {
        let name = "é".repeat(40); // 80 octets
        let truncated = truncate_name(&name);
        assert!(truncated.len() <= 64);
        assert!(std::str::from_utf8(truncated).is_ok());
    }
}
