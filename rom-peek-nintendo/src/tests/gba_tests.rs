use super::*;
use rom_peek_core::{FieldValue, MetaValue, StreamReader};

fn make_gba() -> Vec<u8> {
    let mut rom = vec![0u8; 0x8000];
    // ARM branch to 0x08000000+8: b +0x2C is typical; use offset 0x18
    rom[0..4].copy_from_slice(&0xEA00_0006u32.to_le_bytes());
    rom[0x04..0x14].copy_from_slice(&LOGO_PREFIX);
    rom[0xA0..0xAC].copy_from_slice(b"METROID4\0\0\0\0");
    rom[0xAC..0xB2].copy_from_slice(b"AMTE01");
    rom[0xB2] = 0x96;
    rom
}

/// Fill in a valid header checksum over 0xA0..0xBC.
fn fix_checksum(rom: &mut [u8]) {
    rom[0xBD] = header_checksum(rom);
}

fn detect(data: &[u8]) -> i32 {
    is_supported(&DetectInfo {
        header_offset: 0,
        header: &data[..data.len().min(4352)],
        ext_hint: Some(".gba"),
        file_size: data.len() as u64,
    })
}

#[test]
fn test_detect_licensed() {
    assert_eq!(detect(&make_gba()), GbaType::Licensed as i32);
}

#[test]
fn test_detect_nds_expansion() {
    let mut rom = make_gba();
    rom[0x04..0x14].fill(0); // no logo
    rom[0..4].copy_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
    fix_checksum(&mut rom);
    assert_eq!(detect(&rom), GbaType::NdsExpansion as i32);
}

#[test]
fn test_detect_unlicensed_passthrough() {
    let mut rom = make_gba();
    rom[0x04..0x14].fill(0);
    fix_checksum(&mut rom);
    assert_eq!(detect(&rom), GbaType::Unlicensed as i32);
}

#[test]
fn test_detect_garbage() {
    let mut rom = make_gba();
    rom[0x04..0x14].fill(0);
    rom[0xBD] = rom[0xBD].wrapping_add(1); // break checksum too
    assert_eq!(detect(&rom), -1);
}

#[test]
fn test_fields() {
    let mut gba = GameBoyAdvance::new(StreamReader::from_vec(make_gba()));
    assert!(gba.is_valid());
    let fields = gba.fields();
    assert!(matches!(
        fields.get("Title").map(|f| &f.value),
        Some(FieldValue::Text(t)) if t == "METROID4"
    ));
    assert!(matches!(
        fields.get("Game ID").map(|f| &f.value),
        Some(FieldValue::Text(t)) if t == "AGB-AMTE"
    ));
    assert!(matches!(
        fields.get("Publisher").map(|f| &f.value),
        Some(FieldValue::Text(t)) if t == "Nintendo"
    ));
}

#[test]
fn test_arm_branch_resolution() {
    // 0xEA000006: offset (6+2)<<2 = 0x20
    assert_eq!(resolve_arm_branch(0xEA00_0006), Some(0x20));
    // Negative offset sign-extends
    assert_eq!(resolve_arm_branch(0xEAFF_FFFD), Some(0xFFFF_FFFC));
    // Not a branch opcode
    assert_eq!(resolve_arm_branch(0x1234_5678), None);
}

#[test]
fn test_entry_point_field_present() {
    let mut gba = GameBoyAdvance::new(StreamReader::from_vec(make_gba()));
    let fields = gba.fields();
    assert!(matches!(
        fields.get("Entry Point").map(|f| &f.value),
        Some(FieldValue::Numeric { value, .. }) if *value == 0xEA000006
    ));
    assert!(matches!(
        fields.get("Entry Point Address").map(|f| &f.value),
        Some(FieldValue::Numeric { value: 0x20, .. })
    ));
}

#[test]
fn test_debug_flag() {
    let mut rom = make_gba();
    rom[0x9C] = 0xA5;
    let mut gba = GameBoyAdvance::new(StreamReader::from_vec(rom));
    assert!(gba.fields().get("Debugging").is_some());

    let mut gba2 = GameBoyAdvance::new(StreamReader::from_vec(make_gba()));
    assert!(gba2.fields().get("Debugging").is_none());
}

#[test]
fn test_metadata() {
    let mut gba = GameBoyAdvance::new(StreamReader::from_vec(make_gba()));
    let meta = gba.metadata();
    assert!(matches!(
        meta.get(Property::Title),
        Some(MetaValue::Text(t)) if t == "METROID4"
    ));
    assert!(matches!(
        meta.get(Property::GameId),
        Some(MetaValue::Text(t)) if t == "AGB-AMTE"
    ));
}

#[test]
fn test_ext_url() {
    let gba = GameBoyAdvance::new(StreamReader::from_vec(make_gba()));
    let urls = gba.ext_urls(ImageType::ExtTitleScreen);
    assert_eq!(urls.len(), 1);
    assert_eq!(urls[0].cache_key, "gba/title/AMTE01.png");
}
