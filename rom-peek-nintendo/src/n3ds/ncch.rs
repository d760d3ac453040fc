//! NCCH partition reader.
//!
//! Layers transparent AES-CTR decryption over an NCCH image, whether
//! it comes from a raw file, an NCSD partition, or CIA content. The
//! section table mirrors the on-disk layout: plain regions pass
//! through, ExHeader and the ExeFS header/icon/banner use keyslot 0,
//! the rest of the ExeFS and the RomFS use keyslot 1.
//!
//! Key selection runs retail first, then debug. If both fail the
//! reader falls back to treating the content as unencrypted, matching
//! a family of mis-mastered titles in the wild.

use std::io;
use std::rc::Rc;

use log::{debug, warn};

use super::keys::{AesCtrCipher, KeyManager, VerifyResult, scramble_ctr};
use rom_peek_core::byteorder::{read_u16_le, read_u32_le, read_u64_le};
use rom_peek_core::{ReadAt, SubStream, text};

pub const NCCH_HEADER_LEN: usize = 0x200;
pub const EXEFS_HEADER_LEN: usize = 0x200;

/// Section ids, also the AES-CTR counter discriminant.
pub const SECTION_EXHEADER: u8 = 1;
pub const SECTION_EXEFS: u8 = 2;
pub const SECTION_ROMFS: u8 = 3;

/// One contiguous span of the NCCH with a single crypto treatment.
#[derive(Debug, Clone)]
pub struct EncryptedSection {
    /// Offset within the NCCH image.
    pub address: u64,
    /// Section start for counter computation: the counter for a byte
    /// at `p` is `base_ctr(section_id) + (p - ctr_base) / 16`.
    pub ctr_base: u64,
    pub length: u64,
    /// Index into the reader's two-key set (0 or 1).
    pub key_index: u8,
    pub section_id: u8,
    /// Plain sections are copied through without decryption.
    pub plain: bool,
}

/// Parsed NCCH header fields needed by the reader and the parser.
pub struct NcchHeader {
    raw: [u8; NCCH_HEADER_LEN],
}

impl NcchHeader {
    pub fn parse(raw: [u8; NCCH_HEADER_LEN]) -> Option<Self> {
        if &raw[0x100..0x104] != b"NCCH" {
            return None;
        }
        Some(Self { raw })
    }

    /// Alternate content tags used by some system titles.
    pub fn alternate_tag(raw: &[u8]) -> Option<&'static str> {
        match &raw[0..4] {
            b"NDHT" => Some("NDHT"),
            b"NARC" => Some("NARC"),
            _ => None,
        }
    }

    /// First 16 bytes of the RSA signature double as KeyY.
    pub fn key_y(&self) -> [u8; 16] {
        let mut y = [0u8; 16];
        y.copy_from_slice(&self.raw[0..16]);
        y
    }

    pub fn content_size_mu(&self) -> u32 {
        read_u32_le(&self.raw, 0x104)
    }

    pub fn partition_id(&self) -> u64 {
        read_u64_le(&self.raw, 0x108)
    }

    pub fn maker_code(&self) -> String {
        text::read_ascii(&self.raw[0x110..0x112])
    }

    pub fn version(&self) -> u16 {
        read_u16_le(&self.raw, 0x112)
    }

    pub fn program_id(&self) -> u64 {
        read_u64_le(&self.raw, 0x118)
    }

    pub fn product_code(&self) -> String {
        text::read_ascii(&self.raw[0x150..0x160])
    }

    pub fn exheader_size(&self) -> u32 {
        read_u32_le(&self.raw, 0x180)
    }

    pub fn crypto_method(&self) -> u8 {
        self.raw[0x188 + 3]
    }

    pub fn platform(&self) -> u8 {
        self.raw[0x188 + 4]
    }

    pub fn content_type_flags(&self) -> u8 {
        self.raw[0x188 + 5]
    }

    pub fn fixed_crypto_key(&self) -> bool {
        self.raw[0x188 + 7] & 0x01 != 0
    }

    pub fn no_crypto(&self) -> bool {
        self.raw[0x188 + 7] & 0x04 != 0
    }

    pub fn uses_seed(&self) -> bool {
        self.raw[0x188 + 7] & 0x20 != 0
    }

    fn region_mu(&self, offset: usize) -> (u32, u32) {
        (read_u32_le(&self.raw, offset), read_u32_le(&self.raw, offset + 4))
    }

    pub fn plain_region_mu(&self) -> (u32, u32) {
        self.region_mu(0x190)
    }

    pub fn logo_region_mu(&self) -> (u32, u32) {
        self.region_mu(0x198)
    }

    pub fn exefs_region_mu(&self) -> (u32, u32) {
        self.region_mu(0x1A0)
    }

    pub fn romfs_region_mu(&self) -> (u32, u32) {
        self.region_mu(0x1B0)
    }

    /// Executable content (CXI) vs data archive (CFA).
    pub fn is_cxi(&self) -> bool {
        self.content_type_flags() & 0x02 != 0
    }

    pub fn content_type_name(&self) -> &'static str {
        let flags = self.content_type_flags();
        let form_type = flags & 0x03;
        let category = (flags >> 2) & 0x3F;
        match (form_type, category) {
            (1, 0) => "Simple content",
            (2, 0) => "Executable (no RomFS)",
            (3, 0) => "Executable",
            (_, 1) => "System update",
            (_, 2) => "Manual",
            (_, 3) => "Download Play child",
            (_, 4) => "Trial",
            _ => "Unknown",
        }
    }
}

/// One ExeFS file-table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExeFsFile {
    pub name: String,
    /// Offset relative to the end of the ExeFS header.
    pub offset: u32,
    pub size: u32,
}

fn parse_exefs_files(header: &[u8]) -> Vec<ExeFsFile> {
    let mut files = Vec::new();
    for i in 0..10 {
        let base = i * 16;
        let name = text::read_ascii(&header[base..base + 8]);
        if name.is_empty() {
            continue;
        }
        files.push(ExeFsFile {
            name,
            offset: read_u32_le(header, base + 8),
            size: read_u32_le(header, base + 12),
        });
    }
    files
}

/// How the content ended up being read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CryptoType {
    pub name: &'static str,
    pub encrypted: bool,
    pub keyslot: u8,
    pub seed: bool,
}

/// Streaming reader over a (possibly encrypted) NCCH.
pub struct NcchReader {
    inner: Rc<dyn ReadAt>,
    ncch_offset: u64,
    ncch_length: u64,
    header: Option<NcchHeader>,
    /// Alternate non-NCCH content ("NDHT"/"NARC").
    alternate: Option<&'static str>,
    valid: bool,
    media_unit_shift: u8,
    /// Crypto disabled: NoCrypto flag, or the fallback after both key
    /// sets failed.
    no_crypto: bool,
    force_no_crypto: bool,
    keys: [[u8; 16]; 2],
    sections: Vec<EncryptedSection>,
    exefs_files: Vec<ExeFsFile>,
    verify_result: VerifyResult,
}

/// KeyX names per crypto method, retail and debug.
fn keyslot_names(crypto_method: u8, debug: bool) -> (&'static str, u8) {
    match (crypto_method, debug) {
        (0x01, false) => ("ctr-Slot0x25KeyX", 0x25),
        (0x0A, false) => ("ctr-Slot0x18KeyX", 0x18),
        (0x0B, false) => ("ctr-Slot0x1BKeyX", 0x1B),
        (0x01, true) => ("ctr-dev-Slot0x25KeyX", 0x25),
        (0x0A, true) => ("ctr-dev-Slot0x18KeyX", 0x18),
        (0x0B, true) => ("ctr-dev-Slot0x1BKeyX", 0x1B),
        (_, true) => ("ctr-dev-Slot0x2CKeyX", 0x2C),
        (_, false) => ("ctr-Slot0x2CKeyX", 0x2C),
    }
}

impl NcchReader {
    /// Construct over `inner[ncch_offset .. ncch_offset+ncch_length]`.
    /// Never fails; an unreadable or unrecognised image yields
    /// `is_valid() == false`.
    pub fn new(
        inner: Rc<dyn ReadAt>,
        ncch_offset: u64,
        ncch_length: u64,
        key_manager: &KeyManager,
    ) -> Self {
        let mut reader = Self {
            inner,
            ncch_offset,
            ncch_length,
            header: None,
            alternate: None,
            valid: false,
            media_unit_shift: 9,
            no_crypto: false,
            force_no_crypto: false,
            keys: [[0u8; 16]; 2],
            sections: Vec::new(),
            exefs_files: Vec::new(),
            verify_result: VerifyResult::Ok,
        };

        let mut raw = [0u8; NCCH_HEADER_LEN];
        match reader.inner.read_at(ncch_offset, &mut raw) {
            Ok(NCCH_HEADER_LEN) => {}
            _ => return reader,
        }

        if let Some(tag) = NcchHeader::alternate_tag(&raw) {
            reader.alternate = Some(tag);
            reader.valid = true;
            reader.no_crypto = true;
            return reader;
        }

        let Some(header) = NcchHeader::parse(raw) else {
            return reader;
        };

        reader.valid = true;
        reader.no_crypto = header.no_crypto();

        if !reader.no_crypto {
            if header.fixed_crypto_key() {
                // Fixed-key titles encrypt with the all-zero key pair.
                reader.keys = [[0u8; 16]; 2];
                reader.header = Some(header);
                reader.build_sections();
                reader.load_exefs_header();
            } else {
                reader.header = Some(header);
                reader.build_sections();
                // Retail keys, then debug keys, then no crypto at all.
                if !reader.try_keys(key_manager, false) && !reader.try_keys(key_manager, true) {
                    warn!("NCCH decryption keys unavailable or wrong; reading as plaintext");
                    reader.force_no_crypto = true;
                    if reader.verify_result == VerifyResult::Ok {
                        reader.verify_result = VerifyResult::KeyNotFound;
                    }
                    reader.load_exefs_header();
                }
            }
        } else {
            reader.header = Some(header);
            reader.build_sections();
            reader.load_exefs_header();
        }

        reader
    }

    /// Attempt one key set; returns true when the ExeFS header
    /// verifies (or there is no ExeFS to verify against).
    fn try_keys(&mut self, key_manager: &KeyManager, debug: bool) -> bool {
        let Some(header) = &self.header else {
            return false;
        };
        let key_y = header.key_y();

        // Keyslot 0 is always the Secure1 (0x2C) slot; keyslot 1
        // depends on the crypto method.
        let (key0_name, _) = keyslot_names(0x00, debug);
        let (key1_name, _) = keyslot_names(header.crypto_method(), debug);

        let key0_x = match key_manager.get_and_verify(key0_name) {
            Ok((k, _)) => k,
            Err(e) => {
                debug!("{key0_name}: {e}");
                self.verify_result = VerifyResult::KeyNotFound;
                return false;
            }
        };
        let key1_x = match key_manager.get_and_verify(key1_name) {
            Ok((k, _)) => k,
            Err(e) => {
                debug!("{key1_name}: {e}");
                self.verify_result = VerifyResult::KeyNotFound;
                return false;
            }
        };

        self.keys = [scramble_ctr(&key0_x, &key_y), scramble_ctr(&key1_x, &key_y)];

        if !self.load_exefs_header() {
            self.verify_result = VerifyResult::WrongKey;
            return false;
        }
        self.verify_result = VerifyResult::Ok;
        true
    }

    fn mu(&self, units: u32) -> u64 {
        (units as u64) << self.media_unit_shift
    }

    /// Build the ordered, non-overlapping section table.
    fn build_sections(&mut self) {
        let Some(header) = &self.header else { return };
        let mut sections = Vec::new();

        let exheader_size = header.exheader_size();
        if exheader_size > 0 {
            // On disk the ExHeader region also covers the access
            // descriptor, twice the declared size.
            sections.push(EncryptedSection {
                address: NCCH_HEADER_LEN as u64,
                ctr_base: NCCH_HEADER_LEN as u64,
                length: (exheader_size as u64) * 2,
                key_index: 0,
                section_id: SECTION_EXHEADER,
                plain: false,
            });
        }

        let (plain_off, plain_size) = header.plain_region_mu();
        if plain_size > 0 {
            sections.push(EncryptedSection {
                address: self.mu(plain_off),
                ctr_base: self.mu(plain_off),
                length: self.mu(plain_size),
                key_index: 0,
                section_id: 0,
                plain: true,
            });
        }

        let (logo_off, logo_size) = header.logo_region_mu();
        if logo_size > 0 {
            sections.push(EncryptedSection {
                address: self.mu(logo_off),
                ctr_base: self.mu(logo_off),
                length: self.mu(logo_size),
                key_index: 0,
                section_id: 0,
                plain: true,
            });
        }

        let (exefs_off, exefs_size) = header.exefs_region_mu();
        if exefs_size > 0 {
            // The header (and later, icon/banner files) use keyslot 0;
            // the remainder uses keyslot 1. Until the file table is
            // decrypted the whole region is mapped as keyslot 1 with a
            // keyslot-0 header carve-out.
            let start = self.mu(exefs_off);
            sections.push(EncryptedSection {
                address: start,
                ctr_base: start,
                length: EXEFS_HEADER_LEN as u64,
                key_index: 0,
                section_id: SECTION_EXEFS,
                plain: false,
            });
            sections.push(EncryptedSection {
                address: start + EXEFS_HEADER_LEN as u64,
                ctr_base: start,
                length: self.mu(exefs_size) - EXEFS_HEADER_LEN as u64,
                key_index: 1,
                section_id: SECTION_EXEFS,
                plain: false,
            });
        }

        let (romfs_off, romfs_size) = header.romfs_region_mu();
        if romfs_size > 0 {
            let start = self.mu(romfs_off);
            sections.push(EncryptedSection {
                address: start,
                ctr_base: start,
                length: self.mu(romfs_size),
                key_index: 1,
                section_id: SECTION_ROMFS,
                plain: false,
            });
        }

        sections.sort_by_key(|s| s.address);
        self.sections = sections;
    }

    /// Split the ExeFS into keyslot-0 (header, icon, banner) and
    /// keyslot-1 (everything else) spans now that the file table is
    /// known.
    fn refine_exefs_sections(&mut self) {
        let Some(header) = &self.header else { return };
        let (exefs_off, exefs_size) = header.exefs_region_mu();
        if exefs_size == 0 {
            return;
        }
        let start = self.mu(exefs_off);
        let end = start + self.mu(exefs_size);

        self.sections
            .retain(|s| !(s.section_id == SECTION_EXEFS && s.address >= start && s.address < end));

        let mut spans: Vec<EncryptedSection> = vec![EncryptedSection {
            address: start,
            ctr_base: start,
            length: EXEFS_HEADER_LEN as u64,
            key_index: 0,
            section_id: SECTION_EXEFS,
            plain: false,
        }];
        let data_base = start + EXEFS_HEADER_LEN as u64;
        let mut files: Vec<&ExeFsFile> = self.exefs_files.iter().collect();
        files.sort_by_key(|f| f.offset);
        let mut cursor = data_base;
        for file in files {
            let fstart = data_base + file.offset as u64;
            let fend = fstart + file.size as u64;
            if fstart > cursor {
                spans.push(EncryptedSection {
                    address: cursor,
                    ctr_base: start,
                    length: fstart - cursor,
                    key_index: 1,
                    section_id: SECTION_EXEFS,
                    plain: false,
                });
            }
            let key_index = if file.name == "icon" || file.name == "banner" {
                0
            } else {
                1
            };
            spans.push(EncryptedSection {
                address: fstart,
                ctr_base: start,
                length: fend - fstart,
                key_index,
                section_id: SECTION_EXEFS,
                plain: false,
            });
            cursor = fend;
        }
        if cursor < end {
            spans.push(EncryptedSection {
                address: cursor,
                ctr_base: start,
                length: end - cursor,
                key_index: 1,
                section_id: SECTION_EXEFS,
                plain: false,
            });
        }

        self.sections.extend(spans);
        self.sections.sort_by_key(|s| s.address);
    }

    /// Decrypt and validate the ExeFS header. Returns false when the
    /// decrypted file table is clearly wrong (wrong key).
    fn load_exefs_header(&mut self) -> bool {
        let Some(header) = &self.header else {
            return true;
        };
        let (exefs_off, exefs_size) = header.exefs_region_mu();
        if exefs_size == 0 {
            // Nothing to verify against.
            return true;
        }
        let is_cxi = header.is_cxi();
        let start = self.mu(exefs_off);
        let mut raw = [0u8; EXEFS_HEADER_LEN];
        match self.inner.read_at(self.ncch_offset + start, &mut raw) {
            Ok(EXEFS_HEADER_LEN) => {}
            _ => return false,
        }

        if !(self.no_crypto || self.force_no_crypto) {
            let ctr = self.base_ctr(SECTION_EXEFS);
            if AesCtrCipher::new(self.keys[0]).decrypt(ctr, &mut raw).is_err() {
                return false;
            }
        }

        let files = parse_exefs_files(&raw);
        // A CXI's first file is ".code"; a CFA's is "icon".
        let expected = if is_cxi { ".code" } else { "icon" };
        let ok = files.first().is_some_and(|f| f.name == expected)
            || files.iter().any(|f| f.name == "icon");
        if !ok {
            debug!("ExeFS file table failed validation (first file: {:?})", files.first());
            return false;
        }

        self.exefs_files = files;
        self.refine_exefs_sections();
        true
    }

    /// Counter base for a section: partition id, section discriminant,
    /// then the block index fills the low bytes.
    fn base_ctr(&self, section_id: u8) -> u128 {
        let tid = self
            .header
            .as_ref()
            .map(|h| h.partition_id())
            .unwrap_or_default();
        ((tid as u128) << 64) | ((section_id as u128) << 56)
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn header(&self) -> Option<&NcchHeader> {
        self.header.as_ref()
    }

    pub fn alternate_tag(&self) -> Option<&'static str> {
        self.alternate
    }

    pub fn verify_result(&self) -> VerifyResult {
        self.verify_result
    }

    pub fn force_no_crypto(&self) -> bool {
        self.force_no_crypto
    }

    pub fn sections(&self) -> &[EncryptedSection] {
        &self.sections
    }

    pub fn exefs_files(&self) -> &[ExeFsFile] {
        &self.exefs_files
    }

    pub fn crypto_type(&self) -> CryptoType {
        let Some(header) = &self.header else {
            return CryptoType {
                name: "Unknown",
                encrypted: false,
                keyslot: 0xFF,
                seed: false,
            };
        };
        if header.no_crypto() {
            return CryptoType {
                name: "NoCrypto",
                encrypted: false,
                keyslot: 0xFF,
                seed: false,
            };
        }
        if header.fixed_crypto_key() {
            return CryptoType {
                name: "Fixed",
                encrypted: true,
                keyslot: 0x11,
                seed: false,
            };
        }
        let (name, keyslot) = match header.crypto_method() {
            0x00 => ("Secure1", 0x2C),
            0x01 => ("Secure2", 0x25),
            0x0A => ("Secure3", 0x18),
            0x0B => ("Secure4", 0x1B),
            _ => ("Unknown", 0xFF),
        };
        CryptoType {
            name,
            encrypted: true,
            keyslot,
            seed: header.uses_seed(),
        }
    }

    /// Open a bounded view of one ExeFS file.
    pub fn open_file(self: &Rc<Self>, name: &str) -> Option<SubStream> {
        let Some(header) = &self.header else {
            return None;
        };
        let file = self.exefs_files.iter().find(|f| f.name == name)?;
        let (exefs_off, _) = header.exefs_region_mu();
        let offset = self.mu(exefs_off) + EXEFS_HEADER_LEN as u64 + file.offset as u64;
        let parent: Rc<dyn ReadAt> = Rc::clone(self) as Rc<dyn ReadAt>;
        Some(SubStream::new(parent, offset, file.size as u64))
    }

    /// The logo: a dedicated region on SDK5+ titles, otherwise the
    /// ExeFS `logo` file.
    pub fn open_logo(self: &Rc<Self>) -> Option<SubStream> {
        let header = self.header.as_ref()?;
        let (logo_off, logo_size) = header.logo_region_mu();
        if logo_size > 0 {
            let parent: Rc<dyn ReadAt> = Rc::clone(self) as Rc<dyn ReadAt>;
            return Some(SubStream::new(parent, self.mu(logo_off), self.mu(logo_size)));
        }
        self.open_file("logo")
    }

    fn section_at(&self, pos: u64) -> Option<&EncryptedSection> {
        let idx = self.sections.partition_point(|s| s.address <= pos);
        if idx == 0 {
            return None;
        }
        let s = &self.sections[idx - 1];
        if pos < s.address + s.length { Some(s) } else { None }
    }
}

impl ReadAt for NcchReader {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        if !self.valid || offset >= self.ncch_length {
            return Ok(0);
        }
        let want = (self.ncch_length - offset).min(buf.len() as u64) as usize;
        let buf = &mut buf[..want];

        // Header and everything else reads as plaintext when crypto is
        // off entirely.
        if self.no_crypto || self.force_no_crypto {
            return self.inner.read_at(self.ncch_offset + offset, buf);
        }

        let mut done = 0usize;
        while done < want {
            let pos = offset + done as u64;

            // The NCCH header itself is never encrypted.
            if pos < NCCH_HEADER_LEN as u64 {
                let span = ((NCCH_HEADER_LEN as u64 - pos) as usize).min(want - done);
                let n = self
                    .inner
                    .read_at(self.ncch_offset + pos, &mut buf[done..done + span])?;
                done += n;
                if n < span {
                    break;
                }
                continue;
            }

            let Some(section) = self.section_at(pos) else {
                break;
            };
            let span = ((section.address + section.length - pos) as usize).min(want - done);

            if section.plain {
                let n = self
                    .inner
                    .read_at(self.ncch_offset + pos, &mut buf[done..done + span])?;
                done += n;
                if n < span {
                    break;
                }
                continue;
            }

            // Round down to the AES block, decrypt, copy the window.
            let aligned = pos & !0xF;
            let skew = (pos - aligned) as usize;
            let mut block_buf = vec![0u8; (skew + span + 15) & !0xF];
            let n = self
                .inner
                .read_at(self.ncch_offset + aligned, &mut block_buf)?;
            if n < skew + span {
                break;
            }
            let ctr = self.base_ctr(section.section_id) + ((aligned - section.ctr_base) / 16) as u128;
            AesCtrCipher::new(self.keys[section.key_index as usize])
                .decrypt(ctr, &mut block_buf)
                .map_err(|e| io::Error::other(e.to_string()))?;
            buf[done..done + span].copy_from_slice(&block_buf[skew..skew + span]);
            done += span;
        }
        Ok(done)
    }

    fn size(&self) -> u64 {
        self.ncch_length
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }
}

#[cfg(test)]
#[path = "tests/ncch_tests.rs"]
mod tests;
