use super::*;
use chrono::{DateTime, Datelike};
use rom_peek_core::{FieldValue, MetaValue, StreamReader};

fn detect(data: &[u8]) -> i32 {
    let window = &data[..data.len().min(4352)];
    is_supported(&DetectInfo {
        header_offset: 0,
        header: window,
        ext_hint: None,
        file_size: data.len() as u64,
    })
}

/// Plain iNES image: header + PRG + CHR, all zero filled.
fn make_ines(prg_banks: u8, chr_banks: u8) -> Vec<u8> {
    let mut rom = vec![0u8; 16 + (prg_banks as usize) * 16384 + (chr_banks as usize) * 8192];
    rom[0..4].copy_from_slice(b"NES\x1A");
    rom[4] = prg_banks;
    rom[5] = chr_banks;
    rom
}

/// iNES image with the spec'd internal footer in the last 32 bytes of PRG.
fn make_ines_with_footer() -> Vec<u8> {
    let mut rom = make_ines(2, 1);
    rom[6] = 0x00;
    let footer_addr = 16 + 2 * 16384 - 32;
    let footer = &mut rom[footer_addr..footer_addr + 32];
    footer[0..16].copy_from_slice(b"SUPER MARIO BROS");
    footer[0x10..0x12].copy_from_slice(&[0x12, 0x34]); // PRG checksum
    footer[0x12..0x14].copy_from_slice(&[0x56, 0x78]); // CHR checksum
    footer[0x14] = 0x20; // PRG 32KB (idx 2), CHR 8KB (idx 0)
    footer[0x15] = 0x04; // MMCx board
    footer[0x16] = 1; // ASCII title
    footer[0x17] = 15;
    footer[0x18] = 0x08; // Capcom
    footer[0x1A..0x1C].copy_from_slice(&0xFFFAu16.to_le_bytes());
    footer[0x1C..0x1E].copy_from_slice(&0x8000u16.to_le_bytes());
    footer[0x1E..0x20].copy_from_slice(&0xFFF0u16.to_le_bytes());
    rom
}

/// Raw FDS disk image with one disk header.
fn make_fds_raw() -> Vec<u8> {
    let mut disk = vec![0u8; 65500];
    disk[0] = 0x01;
    disk[1..15].copy_from_slice(b"*NINTENDO-HVC*");
    disk[15] = 0x01; // Nintendo
    disk[16..19].copy_from_slice(b"ZEL");
    disk[19] = b' ';
    disk[20] = 0; // revision
    disk[21] = 0; // side
    disk[22] = 0; // disk number
    disk[23] = 0; // FMC
    disk[31] = 0x61; // BCD year 61 -> Showa -> 1986
    disk[32] = 0x02;
    disk[33] = 0x21;
    disk
}

// -- Detection --

#[test]
fn test_detect_ines() {
    assert_eq!(detect(&make_ines(2, 1)), NesFormat::Ines as i32);
}

#[test]
fn test_detect_wiiu_vc_variant() {
    let mut rom = make_ines(2, 1);
    rom[3] = 0;
    assert_eq!(detect(&rom), NesFormat::Ines as i32);
}

#[test]
fn test_detect_archaic_ines() {
    let mut rom = make_ines(2, 1);
    rom[12..16].copy_from_slice(&b"DiskDude"[0..4]);
    assert_eq!(detect(&rom), NesFormat::InesArchaic as i32);
}

#[test]
fn test_detect_nes2() {
    let mut rom = make_ines(2, 1);
    rom[7] = 0x08;
    assert_eq!(detect(&rom), NesFormat::Nes2 as i32);
}

#[test]
fn test_nes2_falls_back_when_declared_size_exceeds_file() {
    let mut rom = make_ines(2, 1);
    rom[7] = 0x08;
    rom[9] = 0x0E; // PRG banks 0xE02 * 16K, way past EOF
    assert_eq!(detect(&rom), NesFormat::Ines as i32);
}

#[test]
fn test_detect_tnes() {
    let mut rom = vec![0u8; 0x4000];
    rom[0..4].copy_from_slice(b"TNES");
    rom[4] = 3; // TxROM
    rom[5] = 4;
    assert_eq!(detect(&rom), NesFormat::Tnes as i32);
}

#[test]
fn test_detect_tnes_fds_container() {
    let mut rom = vec![0u8; 0x3000];
    rom[0..4].copy_from_slice(b"TNES");
    rom[4] = 100;
    assert_eq!(detect(&rom), NesFormat::FdsTnes as i32);
}

#[test]
fn test_detect_fwnes_fds() {
    let mut rom = vec![0u8; 16];
    rom[0..4].copy_from_slice(b"FDS\x1A");
    rom[4] = 2;
    rom.extend_from_slice(&make_fds_raw());
    assert_eq!(detect(&rom), NesFormat::FdsFwNes as i32);
}

#[test]
fn test_detect_raw_fds() {
    assert_eq!(detect(&make_fds_raw()), NesFormat::FdsRaw as i32);
}

#[test]
fn test_detect_garbage() {
    assert_eq!(detect(&[0u8; 64]), -1);
}

// -- Size computation --

#[test]
fn test_nes2_exponent_encoding() {
    // banks_hi nibble 0xF: [EEEEEE MM] = 2^E * (M*2+1)
    assert_eq!(nes2_rom_size(0b0001_1100, 0x0F, 14), (1 << 7) * 1);
    assert_eq!(nes2_rom_size(0b0001_1101, 0x0F, 14), (1 << 7) * 3);
    // Plain 12-bit bank count
    assert_eq!(nes2_rom_size(2, 0, 14), 32 * 1024);
    assert_eq!(nes2_rom_size(0, 1, 14), 256 * 16384);
}

#[test]
fn test_galaxian_8k_prg() {
    let mut rom = make_ines(1, 1);
    rom.truncate(16400);
    let nes = Nes::new(StreamReader::from_vec(rom));
    assert_eq!(nes.prg_size(), 8 * 1024);
}

// -- Internal footer --

#[test]
fn test_internal_footer_seed_scenario() {
    let rom = make_ines_with_footer();
    let mut nes = Nes::new(StreamReader::from_vec(rom));
    assert!(nes.is_valid());
    let fields = nes.fields();
    assert!(matches!(
        fields.get("Internal Name").map(|f| &f.value),
        Some(FieldValue::Text(t)) if t == "SUPER MARIO BROS"
    ));
    assert!(matches!(
        fields.get("Board Type").map(|f| &f.value),
        Some(FieldValue::Text(t)) if t == "MMCx"
    ));
    assert!(matches!(
        fields.get("Publisher").map(|f| &f.value),
        Some(FieldValue::Text(t)) if t == "Capcom"
    ));
}

#[test]
fn test_internal_footer_publisher_metadata() {
    let rom = make_ines_with_footer();
    let mut nes = Nes::new(StreamReader::from_vec(rom));
    let meta = nes.metadata();
    assert!(matches!(
        meta.get(Property::Title),
        Some(MetaValue::Text(t)) if t == "SUPER MARIO BROS"
    ));
    assert!(matches!(
        meta.get(Property::Publisher),
        Some(MetaValue::Text(t)) if t == "Capcom"
    ));
}

#[test]
fn test_internal_footer_rejected_on_bad_rom_size() {
    let mut rom = make_ines_with_footer();
    let footer_addr = 16 + 2 * 16384 - 32;
    rom[footer_addr + 0x14] = 0x50; // PRG 512KB: neither exact nor half/double
    let mut nes = Nes::new(StreamReader::from_vec(rom));
    assert!(nes.fields().get("Internal Name").is_none());
}

#[test]
fn test_internal_footer_half_size_needs_name() {
    let mut rom = make_ines_with_footer();
    let footer_addr = 16 + 2 * 16384 - 32;
    rom[footer_addr + 0x14] = 0x10; // PRG 16KB = half of actual
    let mut nes = Nes::new(StreamReader::from_vec(rom));
    // Name present, so the half-size footer is still accepted.
    assert!(nes.fields().get("Internal Name").is_some());

    let mut rom2 = make_ines_with_footer();
    rom2[footer_addr + 0x14] = 0x10;
    rom2[footer_addr + 0x16] = 0; // no title
    let mut nes2 = Nes::new(StreamReader::from_vec(rom2));
    assert!(nes2.fields().get("PRG Checksum").is_none());
}

#[test]
fn test_footer_title_left_aligned() {
    // Left-aligned title with 0xFF padding at the end.
    let mut raw = [0xFFu8; 16];
    raw[0..5].copy_from_slice(b"ZELDA");
    assert_eq!(extract_footer_title(&raw, 4, false), "ZELDA");
}

#[test]
fn test_footer_title_right_aligned() {
    let mut raw = [0xFFu8; 16];
    raw[11..16].copy_from_slice(b"ZELDA");
    assert_eq!(extract_footer_title(&raw, 4, false), "ZELDA");
}

// -- TNES --

#[test]
fn test_tnes_mapper_remap_field() {
    let mut rom = vec![0u8; 0x4000];
    rom[0..4].copy_from_slice(b"TNES");
    rom[4] = 3; // TxROM -> iNES 4
    rom[5] = 4;
    rom[6] = 2;
    let mut nes = Nes::new(StreamReader::from_vec(rom));
    let fields = nes.fields();
    assert!(matches!(
        fields.get("Mapper").map(|f| &f.value),
        Some(FieldValue::Text(t)) if t.starts_with("4 - ")
    ));
    assert!(matches!(
        fields.get("TNES Mapper").map(|f| &f.value),
        Some(FieldValue::Numeric { value: 3, .. })
    ));
}

// -- FDS --

#[test]
fn test_fds_bcd_era_boundary() {
    // BCD 0x57 -> Heisei -> 2045; BCD 0x58 -> Showa -> 1983
    let ts_57 = fds_bcd_date_to_unix(0x57, 0x01, 0x01).unwrap();
    assert_eq!(DateTime::from_timestamp(ts_57, 0).unwrap().year(), 2045);
    let ts_58 = fds_bcd_date_to_unix(0x58, 0x01, 0x01).unwrap();
    assert_eq!(DateTime::from_timestamp(ts_58, 0).unwrap().year(), 1983);
}

#[test]
fn test_fds_bcd_invalid() {
    assert!(fds_bcd_date_to_unix(0xAB, 0x01, 0x01).is_none());
    assert!(fds_bcd_date_to_unix(0x61, 0x13, 0x01).is_none());
}

#[test]
fn test_fds_fields() {
    let mut nes = Nes::new(StreamReader::from_vec(make_fds_raw()));
    assert!(nes.is_valid());
    assert_eq!(nes.system_name(), "Famicom Disk System");
    let fields = nes.fields();
    assert!(matches!(
        fields.get("Game ID").map(|f| &f.value),
        Some(FieldValue::Text(t)) if t == "FMC-ZEL"
    ));
    assert!(matches!(
        fields.get("Publisher").map(|f| &f.value),
        Some(FieldValue::Text(t)) if t == "Nintendo"
    ));
    let ts = match fields.get("Manufacture Date").map(|f| &f.value) {
        Some(FieldValue::DateTime(ts)) => *ts,
        other => panic!("missing manufacture date: {other:?}"),
    };
    assert_eq!(DateTime::from_timestamp(ts, 0).unwrap().year(), 1986);
}

#[test]
fn test_fds_ext_url_uses_game_code() {
    let nes = Nes::new(StreamReader::from_vec(make_fds_raw()));
    let urls = nes.ext_urls(ImageType::ExtTitleScreen);
    assert_eq!(urls.len(), 1);
    assert!(urls[0].cache_key.ends_with("FMC-ZEL.png"));
    assert!(urls[0].cache_key.starts_with("fds/title/"));
}

#[test]
fn test_nes_ext_url_uses_crc32_pair() {
    let mut rom = make_ines(1, 1);
    for (i, b) in rom.iter_mut().enumerate().skip(16) {
        *b = (i * 31) as u8;
    }
    let prg_crc = crc32fast::hash(&rom[16..16 + 8192]);
    let chr_crc = crc32fast::hash(&rom[16 + 16384..16 + 16384 + 8192]);
    let nes = Nes::new(StreamReader::from_vec(rom));
    let urls = nes.ext_urls(ImageType::ExtTitleScreen);
    assert_eq!(urls.len(), 1);
    assert!(
        urls[0]
            .cache_key
            .ends_with(&format!("{prg_crc:08X}-{chr_crc:08X}.png"))
    );
}

#[test]
fn test_no_urls_for_internal_kinds() {
    let nes = Nes::new(StreamReader::from_vec(make_ines(1, 1)));
    assert!(nes.ext_urls(ImageType::Icon).is_empty());
}
