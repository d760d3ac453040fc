use super::*;
use rom_peek_core::StreamReader;

const PARTITION_ID: u64 = 0x0004_0000_0FF3_0500;

const PLAIN_OFF: usize = 0x400;
const EXEFS_OFF: usize = 0x600;
const TOTAL: usize = 0xE00;

/// Synthetic NCCH: 0x200 header, plain region at 0x400 (1 MU), ExeFS
/// at 0x600 (4 MU) holding "icon" and "banner" files.
fn make_ncch(flags7: u8) -> Vec<u8> {
    let mut img = vec![0u8; TOTAL];
    // Signature (doubles as KeyY for non-fixed crypto)
    img[0..16].copy_from_slice(&[0xA5; 16]);
    img[0x100..0x104].copy_from_slice(b"NCCH");
    img[0x104..0x108].copy_from_slice(&((TOTAL as u32) >> 9).to_le_bytes());
    img[0x108..0x110].copy_from_slice(&PARTITION_ID.to_le_bytes());
    img[0x110..0x112].copy_from_slice(b"01");
    img[0x150..0x160].copy_from_slice(b"CTR-P-TEST\0\0\0\0\0\0");
    // flags: crypto method 0, content type CFA (form type 1), options
    img[0x188 + 3] = 0;
    img[0x188 + 5] = 0x01;
    img[0x188 + 7] = flags7;
    // Plain region: 1 MU at 0x400
    img[0x190..0x194].copy_from_slice(&2u32.to_le_bytes());
    img[0x194..0x198].copy_from_slice(&1u32.to_le_bytes());
    // ExeFS: 4 MU at 0x600
    img[0x1A0..0x1A4].copy_from_slice(&3u32.to_le_bytes());
    img[0x1A4..0x1A8].copy_from_slice(&4u32.to_le_bytes());

    // Plain-region payload
    for (i, b) in img[PLAIN_OFF..PLAIN_OFF + 0x200].iter_mut().enumerate() {
        *b = (i * 3 + 1) as u8;
    }

    // ExeFS header: icon (0x100 bytes) then banner (0x80 bytes)
    let eh = EXEFS_OFF;
    img[eh..eh + 4].copy_from_slice(b"icon");
    img[eh + 8..eh + 12].copy_from_slice(&0u32.to_le_bytes());
    img[eh + 12..eh + 16].copy_from_slice(&0x100u32.to_le_bytes());
    img[eh + 16..eh + 22].copy_from_slice(b"banner");
    img[eh + 24..eh + 28].copy_from_slice(&0x100u32.to_le_bytes());
    img[eh + 28..eh + 32].copy_from_slice(&0x80u32.to_le_bytes());

    // File payloads at ExeFS data base (0x600 + 0x200)
    for (i, b) in img[eh + 0x200..eh + 0x200 + 0x180].iter_mut().enumerate() {
        *b = (0x40 + i) as u8;
    }
    img
}

fn base_ctr(section_id: u8) -> u128 {
    ((PARTITION_ID as u128) << 64) | ((section_id as u128) << 56)
}

/// Encrypt the ExeFS of a fixed-key NCCH in place (zero keys).
fn encrypt_exefs_fixed_key(img: &mut [u8]) {
    let cipher = AesCtrCipher::new([0u8; 16]);
    let exefs_len = 0x800;
    let ctr = base_ctr(SECTION_EXEFS);
    cipher
        .decrypt(ctr, &mut img[EXEFS_OFF..EXEFS_OFF + exefs_len])
        .unwrap();
}

#[test]
fn test_nocrypto_passthrough() {
    let img = make_ncch(0x04);
    let reader = NcchReader::new(
        StreamReader::from_vec(img.clone()),
        0,
        TOTAL as u64,
        &KeyManager::empty(),
    );
    assert!(reader.is_valid());
    assert_eq!(reader.crypto_type().name, "NoCrypto");
    assert!(!reader.crypto_type().encrypted);

    let mut buf = vec![0u8; TOTAL];
    assert_eq!(reader.read_at(0, &mut buf).unwrap(), TOTAL);
    assert_eq!(buf, img);
}

#[test]
fn test_plain_section_round_trip() {
    // Fixed-key image with an encrypted ExeFS; the plain region must
    // still read byte-equal to the underlying stream.
    let mut img = make_ncch(0x01);
    encrypt_exefs_fixed_key(&mut img);
    let reader = NcchReader::new(
        StreamReader::from_vec(img.clone()),
        0,
        TOTAL as u64,
        &KeyManager::empty(),
    );
    assert!(reader.is_valid());
    assert_eq!(reader.crypto_type().name, "Fixed");

    let mut buf = vec![0u8; 0x200];
    assert_eq!(reader.read_at(PLAIN_OFF as u64, &mut buf).unwrap(), 0x200);
    assert_eq!(buf, &img[PLAIN_OFF..PLAIN_OFF + 0x200]);
}

#[test]
fn test_fixed_key_exefs_decrypts() {
    let plain = make_ncch(0x01);
    let mut img = plain.clone();
    encrypt_exefs_fixed_key(&mut img);
    assert_ne!(img, plain);

    let reader = NcchReader::new(
        StreamReader::from_vec(img),
        0,
        TOTAL as u64,
        &KeyManager::empty(),
    );
    assert!(reader.is_valid());
    let names: Vec<_> = reader.exefs_files().iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, ["icon", "banner"]);

    // Reading the whole ExeFS region through the reader yields the
    // original plaintext.
    let mut buf = vec![0u8; 0x800];
    assert_eq!(reader.read_at(EXEFS_OFF as u64, &mut buf).unwrap(), 0x800);
    assert_eq!(buf, &plain[EXEFS_OFF..EXEFS_OFF + 0x800]);
}

#[test]
fn test_counter_continuity_across_reads() {
    let mut img = make_ncch(0x01);
    encrypt_exefs_fixed_key(&mut img);
    let reader = NcchReader::new(
        StreamReader::from_vec(img),
        0,
        TOTAL as u64,
        &KeyManager::empty(),
    );

    // [a, b) in one read vs. two non-overlapping reads, with an
    // unaligned split point.
    let a = EXEFS_OFF as u64 + 0x10;
    let mut whole = vec![0u8; 0x300];
    assert_eq!(reader.read_at(a, &mut whole).unwrap(), 0x300);

    let split = 0x12B;
    let mut first = vec![0u8; split];
    let mut second = vec![0u8; 0x300 - split];
    assert_eq!(reader.read_at(a, &mut first).unwrap(), split);
    assert_eq!(
        reader.read_at(a + split as u64, &mut second).unwrap(),
        0x300 - split
    );
    assert_eq!(whole[..split], first[..]);
    assert_eq!(whole[split..], second[..]);
}

#[test]
fn test_open_file_bounded_substream() {
    let mut img = make_ncch(0x01);
    let plain = make_ncch(0x01);
    encrypt_exefs_fixed_key(&mut img);
    let reader = Rc::new(NcchReader::new(
        StreamReader::from_vec(img),
        0,
        TOTAL as u64,
        &KeyManager::empty(),
    ));

    let icon = reader.open_file("icon").expect("icon opens");
    assert_eq!(icon.size(), 0x100);
    let mut buf = vec![0u8; 0x200];
    let n = icon.read_at(0, &mut buf).unwrap();
    assert_eq!(n, 0x100);
    assert_eq!(&buf[..0x100], &plain[EXEFS_OFF + 0x200..EXEFS_OFF + 0x300]);

    assert!(reader.open_file("missing").is_none());
}

#[test]
fn test_missing_keys_fall_back_to_no_crypto() {
    // Secure1 crypto without keys on file: retail fails, debug fails,
    // the reader degrades to plaintext reads and flags the key gap.
    let img = make_ncch(0x00);
    let reader = NcchReader::new(
        StreamReader::from_vec(img.clone()),
        0,
        TOTAL as u64,
        &KeyManager::empty(),
    );
    assert!(reader.is_valid());
    assert!(reader.force_no_crypto());
    assert_eq!(reader.verify_result(), VerifyResult::KeyNotFound);

    let mut buf = vec![0u8; 0x200];
    assert_eq!(reader.read_at(EXEFS_OFF as u64, &mut buf).unwrap(), 0x200);
    assert_eq!(buf, &img[EXEFS_OFF..EXEFS_OFF + 0x200]);
}

#[test]
fn test_alternate_content_tag() {
    let mut img = vec![0u8; 0x400];
    img[0..4].copy_from_slice(b"NDHT");
    let reader = NcchReader::new(
        StreamReader::from_vec(img),
        0,
        0x400,
        &KeyManager::empty(),
    );
    assert!(reader.is_valid());
    assert_eq!(reader.alternate_tag(), Some("NDHT"));
}

#[test]
fn test_bad_magic_invalid() {
    let img = vec![0u8; 0x400];
    let reader = NcchReader::new(
        StreamReader::from_vec(img),
        0,
        0x400,
        &KeyManager::empty(),
    );
    assert!(!reader.is_valid());
}

#[test]
fn test_section_table_shape() {
    let img = make_ncch(0x04);
    let reader = NcchReader::new(
        StreamReader::from_vec(img),
        0,
        TOTAL as u64,
        &KeyManager::empty(),
    );
    let sections = reader.sections();
    // Sorted, non-overlapping
    for w in sections.windows(2) {
        assert!(w[0].address + w[0].length <= w[1].address);
    }
    // Plain region present and marked plain
    assert!(
        sections
            .iter()
            .any(|s| s.address == PLAIN_OFF as u64 && s.plain)
    );
    // Icon file span uses keyslot 0, banner too; both inside ExeFS
    assert!(
        sections
            .iter()
            .any(|s| s.section_id == SECTION_EXEFS && s.key_index == 0)
    );
}
