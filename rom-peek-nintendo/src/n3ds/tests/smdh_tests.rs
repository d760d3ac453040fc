use super::*;
use rom_peek_core::{FieldValue, MetaValue, StreamReader};

fn put_utf16(buf: &mut [u8], s: &str) {
    for (i, unit) in s.encode_utf16().enumerate() {
        buf[i * 2..i * 2 + 2].copy_from_slice(&unit.to_le_bytes());
    }
}

fn make_smdh() -> Vec<u8> {
    let mut data = vec![0u8; SMDH_SIZE];
    data[0..4].copy_from_slice(b"SMDH");
    // English titles
    let en = TITLES_OFFSET + SmdhLanguage::English as usize * TITLE_BLOCK_LEN;
    put_utf16(&mut data[en..en + 0x80], "Example Game");
    put_utf16(&mut data[en + 0x80..en + 0x180], "Example Game: The Long Title");
    put_utf16(&mut data[en + 0x180..en + 0x200], "Example Publisher");
    // Japanese short title only
    let jp = TITLES_OFFSET + SmdhLanguage::Japanese as usize * TITLE_BLOCK_LEN;
    put_utf16(&mut data[jp..jp + 0x80], "Example JP");
    // Region: USA + Europe
    data[SETTINGS_OFFSET + 0x10..SETTINGS_OFFSET + 0x14]
        .copy_from_slice(&(REGION_USA | REGION_EUROPE).to_le_bytes());
    // CERO slot: active, age 12; ESRB: active, no restriction
    data[SETTINGS_OFFSET] = 0x80 | 12;
    data[SETTINGS_OFFSET + 1] = 0x80 | 0x20;
    // Slot 2 is unused on 3DS and must be ignored even if set
    data[SETTINGS_OFFSET + 2] = 0x80 | 5;
    // Flags: visible
    data[SETTINGS_OFFSET + 0x20..SETTINGS_OFFSET + 0x24].copy_from_slice(&1u32.to_le_bytes());
    // Large icon: all-red RGB565
    for px in data[LARGE_ICON_OFFSET..LARGE_ICON_OFFSET + 48 * 48 * 2].chunks_exact_mut(2) {
        px.copy_from_slice(&0xF800u16.to_le_bytes());
    }
    data
}

#[test]
fn test_detection() {
    let data = make_smdh();
    let info = DetectInfo {
        header_offset: 0,
        header: &data[..4352],
        ext_hint: Some(".smdh"),
        file_size: data.len() as u64,
    };
    assert_eq!(is_supported(&info), 0);

    let mut bad = data.clone();
    bad[0] = b'X';
    let info_bad = DetectInfo {
        header: &bad[..4352],
        ..info
    };
    assert_eq!(is_supported(&info_bad), -1);
}

#[test]
fn test_titles_and_language_fallback() {
    let smdh = Smdh::from_bytes(make_smdh());
    assert!(smdh.is_valid());
    assert_eq!(smdh.short_title(SmdhLanguage::English), "Example Game");
    assert_eq!(smdh.publisher(SmdhLanguage::English), "Example Publisher");
    // French has no title: falls back to English
    assert_eq!(
        smdh.display_language(SmdhLanguage::French),
        SmdhLanguage::English
    );
    // Japanese is populated and wins when requested
    assert_eq!(
        smdh.display_language(SmdhLanguage::Japanese),
        SmdhLanguage::Japanese
    );
}

#[test]
fn test_fallback_to_japanese_when_english_empty() {
    let mut data = make_smdh();
    let en = TITLES_OFFSET + SmdhLanguage::English as usize * TITLE_BLOCK_LEN;
    data[en..en + 0x200].fill(0);
    let smdh = Smdh::from_bytes(data);
    assert_eq!(
        smdh.display_language(SmdhLanguage::French),
        SmdhLanguage::Japanese
    );
}

#[test]
fn test_age_ratings() {
    let smdh = Smdh::from_bytes(make_smdh());
    let ratings = smdh.age_ratings();
    assert!(ratings[0].active);
    assert_eq!(ratings[0].age, 12);
    assert!(ratings[1].active);
    assert!(ratings[1].no_restriction);
    // Slot 2 is not meaningful for 3DS
    assert!(!ratings[2].active);
    assert!(!ratings[5].active);
}

#[test]
fn test_fields() {
    let mut smdh = Smdh::from_bytes(make_smdh());
    let fields = smdh.fields();
    assert!(matches!(
        fields.get("Title").map(|f| &f.value),
        Some(FieldValue::Text(t)) if t == "Example Game"
    ));
    assert!(matches!(
        fields.get("Full Title").map(|f| &f.value),
        Some(FieldValue::Text(t)) if t == "Example Game: The Long Title"
    ));
    assert!(matches!(
        fields.get("Region Lockout").map(|f| &f.value),
        Some(FieldValue::Bitfield { bits, .. }) if *bits == (REGION_USA | REGION_EUROPE)
    ));
}

#[test]
fn test_region_free() {
    let mut data = make_smdh();
    data[SETTINGS_OFFSET + 0x10..SETTINGS_OFFSET + 0x14]
        .copy_from_slice(&REGION_FREE.to_le_bytes());
    let mut smdh = Smdh::from_bytes(data);
    assert!(matches!(
        smdh.fields().get("Region").map(|f| &f.value),
        Some(FieldValue::Text(t)) if t == "Region-free"
    ));
}

#[test]
fn test_metadata() {
    let mut smdh = Smdh::from_bytes(make_smdh());
    let meta = smdh.metadata();
    assert!(matches!(
        meta.get(Property::Title),
        Some(MetaValue::Text(t)) if t == "Example Game"
    ));
    assert!(matches!(
        meta.get(Property::Publisher),
        Some(MetaValue::Text(t)) if t == "Example Publisher"
    ));
}

#[test]
fn test_large_icon_decodes_red() {
    let mut smdh = Smdh::from_bytes(make_smdh());
    let icon = smdh.image(ImageType::Icon).expect("icon decodes");
    assert_eq!((icon.width, icon.height), (48, 48));
    assert!(icon.pixels.iter().all(|&p| p == 0xFFFF0000));
}

#[test]
fn test_small_icon_dimensions() {
    let mut smdh = Smdh::from_bytes(make_smdh());
    let icon = smdh.small_icon().expect("small icon decodes");
    assert_eq!((icon.width, icon.height), (24, 24));
}

#[test]
fn test_ique_fields() {
    let mut data = make_smdh();
    data[SETTINGS_OFFSET + 0x10..SETTINGS_OFFSET + 0x14]
        .copy_from_slice(&REGION_CHINA.to_le_bytes());
    let zh = TITLES_OFFSET + SmdhLanguage::ChineseSimplified as usize * TITLE_BLOCK_LEN;
    let ique = zh + 0x80 + 218;
    data[ique..ique + 17].copy_from_slice(b"978-7-1234-5678-9");
    data[ique + 17..ique + 28].copy_from_slice(b"01234567890");
    data[ique + 28] = 0;
    data[ique + 29..ique + 33].copy_from_slice(b"2012");
    data[ique + 33..ique + 36].copy_from_slice(b"555");
    let mut smdh = Smdh::from_bytes(data);
    assert!(smdh.is_ique());
    let fields = smdh.fields();
    assert!(matches!(
        fields.get("ISBN").map(|f| &f.value),
        Some(FieldValue::Text(t)) if t == "978-7-1234-5678-9"
    ));
    assert!(matches!(
        fields.get("Publishing Approval No.").map(|f| &f.value),
        Some(FieldValue::Text(t)) if t == "2012-555"
    ));
}

#[test]
fn test_smdh_via_stream() {
    let mut smdh = Smdh::new(StreamReader::from_vec(make_smdh()));
    assert!(smdh.is_valid());
    assert_eq!(smdh.system_name(), "Nintendo 3DS");
    assert_eq!(smdh.metadata().entries().len(), 2);
}
