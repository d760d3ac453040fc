use super::*;
use std::io;

fn detect_mem(data: Vec<u8>, ext: Option<&str>) -> Option<Box<dyn RomData>> {
    detect_stream(StreamReader::from_vec(data), ext, false)
}

use rom_peek_core::RomData;

// -- Sample builders --

fn sample_z64() -> Vec<u8> {
    let mut rom = vec![0u8; 0x1000];
    rom[0..4].copy_from_slice(&[0x80, 0x37, 0x12, 0x40]);
    rom[0x20..0x34].copy_from_slice(b"SAMPLE              ");
    rom
}

fn sample_ines() -> Vec<u8> {
    let mut rom = vec![0u8; 16 + 16384 + 8192];
    rom[0..4].copy_from_slice(b"NES\x1A");
    rom[4] = 1;
    rom[5] = 1;
    rom
}

fn sample_gba() -> Vec<u8> {
    let mut rom = vec![0u8; 0x8000];
    rom[0x04..0x14].copy_from_slice(&[
        0x24, 0xFF, 0xAE, 0x51, 0x69, 0x9A, 0xA2, 0x21, 0x3D, 0x84, 0x82, 0x0A, 0x84, 0xE4,
        0x09, 0xAD,
    ]);
    rom[0xA0..0xAC].copy_from_slice(b"SAMPLEGAME\0\0");
    rom[0xAC..0xB2].copy_from_slice(b"ASME01");
    rom[0xB2] = 0x96;
    rom
}

fn sample_gci() -> Vec<u8> {
    let mut file = vec![0u8; 64 + 8192];
    file[0..6].copy_from_slice(b"GAFE01");
    file[0x06] = 0xFF;
    file[0x07] = 0x02;
    file[0x2C..0x30].copy_from_slice(&0x40u32.to_be_bytes());
    file[0x30..0x32].copy_from_slice(&0x0002u16.to_be_bytes());
    file[0x32..0x34].copy_from_slice(&0x0001u16.to_be_bytes());
    file[0x38..0x3A].copy_from_slice(&1u16.to_be_bytes());
    file[0x3A..0x3C].copy_from_slice(&0xFFFFu16.to_be_bytes());
    file[0x3C..0x40].copy_from_slice(&0x1C00u32.to_be_bytes());
    file
}

fn sample_smdh() -> Vec<u8> {
    let mut data = vec![0u8; 0x36C0];
    data[0..4].copy_from_slice(b"SMDH");
    data
}

fn sample_ncsd() -> Vec<u8> {
    let mut data = vec![0u8; 0x400];
    data[0x100..0x104].copy_from_slice(b"NCSD");
    data
}

fn sample_vms() -> Vec<u8> {
    let mut vms = vec![0u8; 1024];
    vms[0..16].copy_from_slice(b"SAMPLE_SAVE_SYS ");
    vms[16..48].copy_from_slice(b"Sample save file description    ");
    vms
}

fn sample_sfc() -> Vec<u8> {
    let mut rom = vec![0u8; 0x10000];
    let h = &mut rom[0x7FB0..0x8000];
    h[0x10..0x25].copy_from_slice(b"SAMPLE SNES GAME     ");
    h[0x25] = 0x20;
    h[0x26] = 0x00;
    h[0x27] = 0x08;
    h[0x2A] = 0x01;
    let checksum: u16 = 0xABCD;
    h[0x2C..0x2E].copy_from_slice(&(!checksum).to_le_bytes());
    h[0x2E..0x30].copy_from_slice(&checksum.to_le_bytes());
    rom
}

fn sample_vb() -> Vec<u8> {
    let mut rom = vec![0u8; 8192];
    let base = 8192 - 0x220;
    rom[base..base + 20].copy_from_slice(b"SAMPLE VB GAME      ");
    rom[base + 25..base + 27].copy_from_slice(b"01");
    rom[base + 27..base + 31].copy_from_slice(b"VSME");
    rom
}

// -- Dispatch --

#[test]
fn test_dispatch_each_format() {
    let cases: Vec<(Vec<u8>, Option<&str>, &str)> = vec![
        (sample_z64(), Some(".z64"), "Nintendo 64"),
        (sample_ines(), Some(".nes"), "Nintendo Entertainment System"),
        (sample_gba(), Some(".gba"), "Game Boy Advance"),
        (sample_gci(), Some(".gci"), "Nintendo GameCube"),
        (sample_smdh(), Some(".smdh"), "Nintendo 3DS"),
        (sample_ncsd(), Some(".3ds"), "Nintendo 3DS"),
        (sample_vms(), Some(".vms"), "Sega Dreamcast"),
        (
            sample_sfc(),
            Some(".sfc"),
            "Super Nintendo Entertainment System",
        ),
    ];
    for (data, ext, expected) in cases {
        let parser = detect_mem(data, ext)
            .unwrap_or_else(|| panic!("no parser for expected {expected}"));
        assert_eq!(parser.system_name(), expected);
        assert!(parser.is_valid());
    }
}

#[test]
fn test_dispatch_is_deterministic() {
    for _ in 0..3 {
        let parser = detect_mem(sample_z64(), Some(".z64")).unwrap();
        assert_eq!(parser.system_name(), "Nintendo 64");
    }
}

#[test]
fn test_dispatch_unknown_returns_none() {
    assert!(detect_mem(vec![0u8; 512], None).is_none());
    assert!(detect_mem(vec![0xEEu8; 4096], Some(".xyz")).is_none());
}

#[test]
fn test_extension_normalization() {
    // Uppercase, with or without the dot
    let parser = detect_stream(
        StreamReader::from_vec(sample_vms()),
        Some("VMS"),
        false,
    )
    .expect("normalized extension matches");
    assert_eq!(parser.system_name(), "Sega Dreamcast");
}

#[test]
fn test_header_group_exclusivity() {
    // At most one header parser claims any given input.
    let cases: Vec<(Vec<u8>, Option<&str>)> = vec![
        (sample_z64(), Some(".z64")),
        (sample_ines(), Some(".nes")),
        (sample_gba(), Some(".gba")),
        (sample_gci(), Some(".gci")),
        (sample_smdh(), Some(".smdh")),
        (sample_ncsd(), Some(".3ds")),
        (sample_vms(), Some(".vms")),
        (sample_sfc(), Some(".sfc")),
    ];
    for (data, ext) in cases {
        let window_len = data.len().min(rom_peek_core::DETECT_HEADER_MAX);
        let info = DetectInfo {
            header_offset: 0,
            header: &data[..window_len],
            ext_hint: ext,
            file_size: data.len() as u64,
        };
        let matches: Vec<&str> = HEADER_PARSERS
            .iter()
            .filter(|e| (e.is_supported)(&info) >= 0)
            .map(|e| e.name)
            .collect();
        assert!(
            matches.len() <= 1,
            "multiple parsers claimed {ext:?}: {matches:?}"
        );
    }
}

// -- Footer phase --

#[test]
fn test_footer_dispatch_virtual_boy() {
    let parser = detect_mem(sample_vb(), Some(".vb")).expect("VB detected from footer");
    assert_eq!(parser.system_name(), "Virtual Boy");
}

#[test]
fn test_footer_phase_skipped_for_huge_files() {
    // A stream that claims to be 2 GiB: the footer phase is skipped
    // and no parser matches.
    struct Huge;
    impl ReadAt for Huge {
        fn read_at(&self, _offset: u64, buf: &mut [u8]) -> io::Result<usize> {
            buf.fill(0);
            Ok(buf.len())
        }
        fn size(&self) -> u64 {
            2 << 30
        }
    }
    assert!(detect_stream(std::rc::Rc::new(Huge), Some(".vb"), false).is_none());
}

// -- Thumbnail-only filtering --

#[test]
fn test_thumbnail_only_skips_imageless_parsers() {
    assert!(detect_stream(StreamReader::from_vec(sample_z64()), Some(".z64"), true).is_none());
    // Image-bearing formats still match.
    assert!(detect_stream(StreamReader::from_vec(sample_gci()), Some(".gci"), true).is_some());
}

// -- open_path --

#[test]
fn test_open_path_pairs_vms_and_vmi() {
    let dir = std::env::temp_dir().join(format!("rp-registry-test-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();

    // VMS alone
    let vms_path = dir.join("solo.vms");
    std::fs::write(&vms_path, sample_vms()).unwrap();
    let solo = open_path(&vms_path, false).expect("solo .vms opens");
    assert_eq!(solo.system_name(), "Sega Dreamcast");

    // VMS + VMI pair
    let pair_vms = dir.join("paired.vms");
    let pair_vmi = dir.join("paired.vmi");
    std::fs::write(&pair_vms, sample_vms()).unwrap();
    let mut vmi = vec![0u8; 108];
    vmi[4..36].copy_from_slice(b"Paired download                 ");
    vmi[68..70].copy_from_slice(&2001u16.to_le_bytes());
    vmi[70] = 1;
    vmi[71] = 1;
    vmi[88..100].copy_from_slice(b"SAMPLE_SAVE ");
    vmi[104..108].copy_from_slice(&1024u32.to_le_bytes());
    std::fs::write(&pair_vmi, vmi).unwrap();

    let mut paired = open_path(&pair_vms, false).expect("pair opens");
    assert!(paired.fields().tabs().contains(&"VMI".to_string()));

    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_open_path_unknown_is_not_supported() {
    let dir = std::env::temp_dir().join(format!("rp-registry-unk-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("noise.xyz");
    std::fs::write(&path, vec![0u8; 256]).unwrap();
    assert!(matches!(
        open_path(&path, false),
        Err(ParseError::NotSupported)
    ));
    std::fs::remove_dir_all(&dir).unwrap();
}
