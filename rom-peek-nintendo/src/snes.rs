//! SNES / Super Famicom / BS-X ROM parser.
//!
//! SNES ROMs have no magic number. Detection goes by extension and by
//! the 512-byte copier headers (Super Magicom, Game Doctor, Super UFO);
//! the constructor then probes the candidate internal-header addresses
//! and validates each 80-byte block until one passes.
//!
//! Nintendo Power multicassettes additionally carry an 8-entry menu
//! directory at 0x60000, exposed as a separate tab.

use std::rc::Rc;

use chrono::NaiveDate;
use log::debug;

use crate::licensee::{maker_code_name, old_publisher_name};
use rom_peek_core::byteorder::{read_u16_le, read_u32_le};
use rom_peek_core::{
    DetectInfo, FieldFlags, FileType, ListData, Property, ReadAt, Region, RomData, RomFields,
    RomMetaData, text,
};

const HEADER_LEN: usize = 80;

/// Candidate internal-header addresses relative to the ROM image start.
const ADDR_LOROM: u64 = 0x7FB0;
const ADDR_HIROM: u64 = 0xFFB0;
const COPIER_HEADER_LEN: u64 = 512;

/// SNES vs BS-X. The discriminant is the detection subtype id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnesType {
    Snes = 0,
    Bsx = 1,
}

/// Copier-header formats that prepend 512 bytes to the ROM image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CopierHeader {
    None,
    SuperMagicom,
    GameDoctor,
    SuperUfo,
}

fn detect_copier(header: &[u8]) -> CopierHeader {
    if header.len() < 512 {
        return CopierHeader::None;
    }
    if header[8] == 0xAA && header[9] == 0xBB {
        return CopierHeader::SuperMagicom;
    }
    if header.starts_with(b"GAME DOCTOR SF ") {
        return CopierHeader::GameDoctor;
    }
    if &header[8..16] == b"SUPERUFO" {
        return CopierHeader::SuperUfo;
    }
    CopierHeader::None
}

/// Registry hook. No magic: extension plus copier-header evidence.
pub fn is_supported(info: &DetectInfo) -> i32 {
    if info.header_offset != 0 {
        return -1;
    }
    if info.file_size < 0x8000 {
        return -1;
    }

    match info.ext_hint {
        Some(".bs") | Some(".bsx") => return SnesType::Bsx as i32,
        Some(".smc") | Some(".sfc") | Some(".fig") | Some(".swc") | Some(".mgd")
        | Some(".ufo") => return SnesType::Snes as i32,
        _ => {}
    }
    if detect_copier(info.header) != CopierHeader::None {
        return SnesType::Snes as i32;
    }
    -1
}

/// ROM mapping bytes valid for SNES headers, split by header address.
fn mapping_matches_address(mapping: u8, hirom_addr: bool) -> bool {
    const LOROM: [u8; 5] = [0x20, 0x22, 0x23, 0x30, 0x32];
    const HIROM: [u8; 5] = [0x21, 0x25, 0x31, 0x35, 0x3A];
    if hirom_addr {
        HIROM.contains(&mapping)
    } else {
        LOROM.contains(&mapping)
    }
}

fn mapping_name(mapping: u8) -> Option<&'static str> {
    Some(match mapping {
        0x20 => "LoROM",
        0x21 => "HiROM",
        0x22 => "LoROM + S-DD1",
        0x23 => "LoROM + SA-1",
        0x25 => "ExHiROM",
        0x30 => "LoROM + FastROM",
        0x31 => "HiROM + FastROM",
        0x32 => "ExLoROM + FastROM",
        0x35 => "ExHiROM + FastROM",
        0x3A => "HiROM + FastROM + SPC7110",
        _ => return None,
    })
}

/// BS-X uses the plain LoROM/HiROM mappings only.
fn bsx_mapping_valid(mapping: u8) -> bool {
    matches!(mapping, 0x20 | 0x21 | 0x30 | 0x31)
}

/// Titles known to overflow into the mapping byte. Checked when the
/// mapping byte itself fails validation.
static EXTENDED_TITLES: &[(&[u8], u8)] = &[(b"WWF SUPER WRESTLEMANI", b'A')];

fn title_extends_into_mapping(header: &[u8]) -> bool {
    let title_and_mapping = &header[0x10..0x26];
    EXTENDED_TITLES.iter().any(|(prefix, last)| {
        title_and_mapping.len() > prefix.len()
            && &title_and_mapping[..prefix.len()] == *prefix
            && title_and_mapping[prefix.len()] == *last
    })
}

fn rom_type_valid(rom_type: u8) -> bool {
    matches!(rom_type & 0x0F, 0x00..=0x06 | 0x09 | 0x0A)
        && matches!(rom_type & 0xF0, 0x00 | 0x10 | 0x20 | 0x30 | 0x40 | 0x50 | 0xE0 | 0xF0)
}

fn ext_field_valid(bytes: &[u8]) -> bool {
    bytes.iter().all(|&b| b.is_ascii_alphanumeric()) || bytes.iter().all(|&b| b == 0)
}

/// Validate an 80-byte SNES header block read from `hirom_addr`-style
/// address.
fn snes_header_valid(header: &[u8], hirom_addr: bool) -> bool {
    // Title: printable ASCII or SJIS bytes, no control characters.
    if header[0x10..0x25].iter().any(|&b| b < 0x20 && b != 0) {
        return false;
    }

    let mapping = header[0x25];
    if !mapping_matches_address(mapping, hirom_addr) && !title_extends_into_mapping(header) {
        return false;
    }

    if !rom_type_valid(header[0x26]) {
        return false;
    }

    let old_publisher = header[0x2A];
    if old_publisher == 0x33 && !(ext_field_valid(&header[0..2]) && ext_field_valid(&header[2..6]))
    {
        return false;
    }

    let complement = read_u16_le(header, 0x2C);
    let checksum = read_u16_le(header, 0x2E);
    // Prototypes leave both zero.
    (checksum ^ complement) == 0xFFFF || (checksum == 0 && complement == 0)
}

/// Validate an 80-byte BS-X header block.
fn bsx_header_valid(header: &[u8]) -> bool {
    if header[0x10..0x20].iter().any(|&b| b < 0x20 && b != 0) {
        return false;
    }
    if !bsx_mapping_valid(header[0x28]) {
        return false;
    }
    let program_type = read_u32_le(header, 0x02);
    matches!(program_type, 0 | 0x100 | 0x200)
}

/// Super NES / Super Famicom / Satellaview ROM image.
pub struct Snes {
    stream: Rc<dyn ReadAt>,
    valid: bool,
    rom_type: SnesType,
    /// 80-byte internal header block.
    header: [u8; HEADER_LEN],
    /// Absolute address the header was found at.
    header_addr: u64,
    fields: Option<RomFields>,
    metadata: Option<RomMetaData>,
}

impl Snes {
    pub fn new(stream: Rc<dyn ReadAt>) -> Self {
        Self::with_hint(stream, None)
    }

    /// Construct with the extension hint used at detection time, which
    /// biases the SNES/BS-X choice.
    pub fn with_hint(stream: Rc<dyn ReadAt>, ext_hint: Option<&str>) -> Self {
        let mut prefer_bsx = matches!(ext_hint, Some(".bs") | Some(".bsx"));

        // BS-X memory pack signature: "M\0P\0\0\0" at 0x7F00 or 0xFF00,
        // type nibble 0x7 = ROM.
        for pack_addr in [0x7F00u64, 0xFF00] {
            let mut sig = [0u8; 7];
            if let Ok(7) = stream.read_at(pack_addr, &mut sig) {
                if &sig[0..6] == b"M\0P\0\0\0" && sig[6] >> 4 == 0x7 {
                    prefer_bsx = true;
                }
            }
        }

        let mut copier_buf = [0u8; 512];
        let copier = match stream.read_at(0, &mut copier_buf) {
            Ok(512) => detect_copier(&copier_buf),
            _ => CopierHeader::None,
        };

        // Candidate order depends on whether a copier header is present.
        let candidates: [(u64, bool); 4] = if copier != CopierHeader::None {
            [
                (ADDR_LOROM + COPIER_HEADER_LEN, false),
                (ADDR_HIROM + COPIER_HEADER_LEN, true),
                (ADDR_LOROM, false),
                (ADDR_HIROM, true),
            ]
        } else {
            [
                (ADDR_LOROM, false),
                (ADDR_HIROM, true),
                (ADDR_LOROM + COPIER_HEADER_LEN, false),
                (ADDR_HIROM + COPIER_HEADER_LEN, true),
            ]
        };

        let mut found: Option<(u64, [u8; HEADER_LEN], SnesType)> = None;
        for (addr, hirom_addr) in candidates {
            let mut header = [0u8; HEADER_LEN];
            match stream.read_at(addr, &mut header) {
                Ok(n) if n == HEADER_LEN => {}
                _ => continue,
            }
            if prefer_bsx && bsx_header_valid(&header) {
                found = Some((addr, header, SnesType::Bsx));
                break;
            }
            if snes_header_valid(&header, hirom_addr) {
                found = Some((addr, header, SnesType::Snes));
                break;
            }
            if !prefer_bsx && bsx_header_valid(&header) && header[0x2A] == 0x33 {
                found = Some((addr, header, SnesType::Bsx));
                break;
            }
        }

        match found {
            Some((addr, header, rom_type)) => Self {
                stream,
                valid: true,
                rom_type,
                header,
                header_addr: addr,
                fields: None,
                metadata: None,
            },
            None => {
                debug!("no valid SNES/BS-X header at any candidate address");
                Self {
                    stream,
                    valid: false,
                    rom_type: SnesType::Snes,
                    header: [0u8; HEADER_LEN],
                    header_addr: 0,
                    fields: None,
                    metadata: None,
                }
            }
        }
    }

    pub fn rom_type(&self) -> SnesType {
        self.rom_type
    }

    pub fn header_address(&self) -> u64 {
        self.header_addr
    }

    fn title(&self) -> String {
        let raw = match self.rom_type {
            SnesType::Snes => &self.header[0x10..0x25],
            SnesType::Bsx => &self.header[0x10..0x20],
        };
        // Trailing 0x00/0x20/0xFF are stripped before encoding
        // detection; some ROMs carry meaningful trailing bytes that
        // this loses, matching long-standing behaviour.
        let trimmed = text::trim_end_padding(raw);
        text::sjis_or_ascii(trimmed)
    }

    fn old_publisher_code(&self) -> u8 {
        self.header[0x2A]
    }

    fn new_publisher_code(&self) -> String {
        text::read_ascii(&self.header[0..2])
    }

    fn id4(&self) -> String {
        text::read_ascii(&self.header[2..6])
    }

    fn publisher(&self) -> String {
        if self.old_publisher_code() == 0x33 {
            let code = self.new_publisher_code();
            maker_code_name(&code)
                .map(str::to_string)
                .unwrap_or_else(|| format!("Unknown ({code})"))
        } else {
            old_publisher_name(self.old_publisher_code())
                .map(str::to_string)
                .unwrap_or_else(|| format!("Unknown (0x{:02X})", self.old_publisher_code()))
        }
    }

    fn region(&self) -> Region {
        match self.header[0x29] {
            0x00 => Region::Japan,
            0x01 => Region::Usa,
            0x02..=0x0C => Region::Europe,
            0x0D => Region::Korea,
            _ => Region::Unknown,
        }
    }

    /// Nintendo Power multicassette directory, when present.
    fn load_np_directory(&self) -> Option<ListData> {
        if self.rom_type != SnesType::Snes
            || self.old_publisher_code() != 0x33
            || self.region() != Region::Japan
            || self.new_publisher_code() != "01"
            || self.id4() != "MENU"
        {
            return None;
        }

        const DIR_BASE: u64 = 0x60000;
        const ENTRY_LEN: usize = 512;
        let mut dir = [0u8; ENTRY_LEN * 8];
        match self.stream.read_at(DIR_BASE, &mut dir) {
            Ok(n) if n == dir.len() => {}
            _ => return None,
        }

        // Entry 0 must end with the multicassette footer.
        if &dir[ENTRY_LEN - 16..ENTRY_LEN] != b"MULTICASSETTE 32" {
            return None;
        }

        let mut list = ListData {
            headers: ["#", "Title", "Game Code", "Timestamp", "Kiosk ID"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            ..Default::default()
        };

        for i in 0..8 {
            let entry = &dir[i * ENTRY_LEN..(i + 1) * ENTRY_LEN];
            let index = entry[0];
            if index == 0xFF {
                continue;
            }
            let title = text::sjis_or_ascii(text::trim_end_padding(&entry[0x13..0x3F]));
            let game_code = text::read_ascii_fixed(&entry[0x07..0x13]);
            let date = text::read_ascii(&entry[0x1BF..0x1C9]);
            let time = text::read_ascii(&entry[0x1C9..0x1D1]);
            let kiosk = text::read_ascii(&entry[0x1D1..0x1D9]);
            let ts = np_timestamp(&date, &time)
                .map(|t| t.to_string())
                .unwrap_or_else(|| "-".to_string());
            list.rows
                .push(vec![index.to_string(), title, game_code, ts, kiosk]);
            list.row_flags.push(FieldFlags::empty());
        }

        if list.rows.is_empty() { None } else { Some(list) }
    }

    fn build_fields(&self) -> RomFields {
        let mut f = RomFields::new();
        if !self.valid {
            return f;
        }

        f.add_text_flags("Title", self.title(), FieldFlags::TRIM_END);

        if self.old_publisher_code() == 0x33 {
            let id4 = self.id4();
            if !id4.is_empty() {
                f.add_text("Game ID", id4);
            }
        }
        f.add_text("Publisher", self.publisher());

        match self.rom_type {
            SnesType::Snes => {
                f.add_text("Region", self.region().name());
                let mapping = self.header[0x25];
                f.add_text(
                    "ROM Mapping",
                    mapping_name(mapping)
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("Unknown (0x{mapping:02X})")),
                );
                f.add_hex("ROM Type", self.header[0x26] as u64, 2);
                f.add_text("ROM Size", format!("{} KiB", 1u32 << self.header[0x27]));
                let sram = self.header[0x28];
                if sram > 0 {
                    f.add_text("SRAM Size", format!("{} KiB", 1u32 << sram));
                }
                f.add_numeric("Version", self.header[0x2B] as u64);

                let complement = read_u16_le(&self.header, 0x2C);
                let checksum = read_u16_le(&self.header, 0x2E);
                let flags = if checksum ^ complement == 0xFFFF {
                    FieldFlags::MONOSPACE
                } else {
                    FieldFlags::MONOSPACE | FieldFlags::WARNING
                };
                f.add_text_flags(
                    "Checksum",
                    format!("0x{checksum:04X} (complement 0x{complement:04X})"),
                    flags,
                );
            }
            SnesType::Bsx => {
                let program_type = read_u32_le(&self.header, 0x02);
                let type_name = match program_type {
                    0 => "Memory pack",
                    0x100 => "SoundLink",
                    0x200 => "St.GIGA download",
                    _ => "Unknown",
                };
                f.add_text("Program Type", type_name);
                f.add_text(
                    "ROM Mapping",
                    mapping_name(self.header[0x28])
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("Unknown (0x{:02X})", self.header[0x28])),
                );
                f.add_hex("Block Allocation", read_u32_le(&self.header, 0x20) as u64, 8);
                f.add_numeric("Limited Starts", read_u16_le(&self.header, 0x24) as u64);
            }
        }

        if let Some(list) = self.load_np_directory() {
            f.add_tab("NP");
            f.add_list("Directory", list);
        }

        f
    }

    fn build_metadata(&self) -> RomMetaData {
        let mut m = RomMetaData::new();
        if !self.valid {
            return m;
        }
        let title = self.title();
        if !title.is_empty() {
            m.add_text(Property::Title, title);
        }
        m.add_text(Property::Publisher, self.publisher());
        m
    }
}

/// Parse a Nintendo Power directory timestamp. The date string is
/// "MM/DD/YYYY" on LAW cartridges and "YYYY/MM/DD" on NIN ones.
fn np_timestamp(date: &str, time: &str) -> Option<i64> {
    let d: Vec<&str> = date.split('/').collect();
    if d.len() != 3 {
        return None;
    }
    let (year, month, day) = if d[0].len() == 4 {
        (d[0], d[1], d[2])
    } else {
        (d[2], d[0], d[1])
    };
    let t: Vec<&str> = time.split(':').collect();
    if t.len() != 3 {
        return None;
    }
    let date = NaiveDate::from_ymd_opt(
        year.parse().ok()?,
        month.parse().ok()?,
        day.parse().ok()?,
    )?;
    let dt = date.and_hms_opt(t[0].parse().ok()?, t[1].parse().ok()?, t[2].parse().ok()?)?;
    Some(dt.and_utc().timestamp())
}

impl RomData for Snes {
    fn is_valid(&self) -> bool {
        self.valid
    }

    fn file_type(&self) -> FileType {
        FileType::RomImage
    }

    fn system_name(&self) -> &'static str {
        match self.rom_type {
            SnesType::Snes => "Super Nintendo Entertainment System",
            SnesType::Bsx => "Satellaview BS-X",
        }
    }

    fn mime_type(&self) -> &'static str {
        match self.rom_type {
            SnesType::Snes => "application/vnd.nintendo.snes.rom",
            SnesType::Bsx => "application/x-satellaview-rom",
        }
    }

    fn fields(&mut self) -> &RomFields {
        if self.fields.is_none() {
            self.fields = Some(self.build_fields());
        }
        self.fields.get_or_insert_with(RomFields::new)
    }

    fn metadata(&mut self) -> &RomMetaData {
        if self.metadata.is_none() {
            self.metadata = Some(self.build_metadata());
        }
        self.metadata.get_or_insert_with(RomMetaData::new)
    }
}

#[cfg(test)]
#[path = "tests/snes_tests.rs"]
mod tests;
