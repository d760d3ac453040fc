//! NES / Famicom / Famicom Disk System ROM parser.
//!
//! Header flavours:
//! - iNES (`NES\x1A`, plus the `NES\0` Wii U VC variant), including
//!   archaic iNES and NES 2.0
//! - TNES (3DS Virtual Console), including its FDS container
//! - fwNES-headered FDS images
//! - raw FDS images (`*NINTENDO-HVC*` at offset 1)
//!
//! Some cartridges also carry an internal footer in the last 32 bytes
//! of PRG ROM with a title, checksums and vectors; it is recovered
//! heuristically since many ROMs leave the area uninitialised.

use std::rc::Rc;

use chrono::NaiveDate;
use log::debug;

use crate::licensee::old_publisher_name;
use crate::nes_mappers::{mapper_name, tnes_to_ines_mapper};
use rom_peek_core::byteorder::{bcd_to_u8, read_u16_le};
use rom_peek_core::{
    DetectInfo, ExtUrl, FieldFlags, FileType, ImageType, Property, ReadAt, RomData, RomFields,
    RomMetaData, text,
};

const RPDB_BASE: &str = "https://rpdb.gerbilsoft.com";

/// NES container format. The discriminant is the detection subtype id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NesFormat {
    InesArchaic = 0,
    Ines = 1,
    Nes2 = 2,
    Tnes = 3,
    FdsFwNes = 4,
    FdsRaw = 5,
    FdsTnes = 6,
}

impl NesFormat {
    fn is_fds(self) -> bool {
        matches!(self, Self::FdsFwNes | Self::FdsRaw | Self::FdsTnes)
    }

    fn name(self) -> &'static str {
        match self {
            Self::InesArchaic => "Archaic iNES",
            Self::Ines => "iNES",
            Self::Nes2 => "NES 2.0",
            Self::Tnes => "TNES (3DS Virtual Console)",
            Self::FdsFwNes => "FDS (fwNES header)",
            Self::FdsRaw => "FDS",
            Self::FdsTnes => "FDS (TNES container)",
        }
    }
}

/// NES 2.0 bank count: `[EEEEEE MM]` exponent encoding when the high
/// nibble is 0xF, plain 12-bit bank count otherwise.
fn nes2_rom_size(banks_lo: u8, banks_hi: u8, bank_shift: u32) -> u64 {
    if banks_hi == 0x0F {
        let exp = banks_lo >> 2;
        let mult = (banks_lo & 0x03) as u64 * 2 + 1;
        (1u64 << exp) * mult
    } else {
        (((banks_hi as u64) << 8) | banks_lo as u64) << bank_shift
    }
}

fn classify_ines(header: &[u8], file_size: u64) -> NesFormat {
    // NES 2.0: bits 2-3 of byte 7 == 10b, and the declared sizes fit.
    if header[7] & 0x0C == 0x08 {
        let prg = nes2_rom_size(header[4], header[9] & 0x0F, 14);
        let chr = nes2_rom_size(header[5], header[9] >> 4, 13);
        if 16 + prg + chr <= file_size {
            return NesFormat::Nes2;
        }
    }
    if header[12..16].iter().all(|&b| b == 0) {
        NesFormat::Ines
    } else {
        NesFormat::InesArchaic
    }
}

/// Registry hook.
pub fn is_supported(info: &DetectInfo) -> i32 {
    if info.header_offset != 0 || info.header.len() < 16 {
        return -1;
    }
    let h = info.header;

    if &h[0..4] == b"NES\x1A" || &h[0..4] == b"NES\0" {
        return classify_ines(h, info.file_size) as i32;
    }
    if &h[0..4] == b"TNES" {
        if h[4] == 100 {
            return NesFormat::FdsTnes as i32;
        }
        return NesFormat::Tnes as i32;
    }
    if &h[0..4] == b"FDS\x1A" && info.file_size > 16 {
        return NesFormat::FdsFwNes as i32;
    }
    if h.len() >= 15 && &h[1..15] == b"*NINTENDO-HVC*" {
        return NesFormat::FdsRaw as i32;
    }
    -1
}

const FDS_HEADER_SIZE: usize = 58;

/// Recovered internal footer fields.
struct IntFooter {
    title: String,
    prg_checksum: u16,
    chr_checksum: u16,
    rom_size: u8,
    board_info: u8,
    publisher_code: u8,
    nmi_vector: u16,
    reset_vector: u16,
    irq_vector: u16,
}

/// NES/Famicom/FDS ROM image.
pub struct Nes {
    stream: Rc<dyn ReadAt>,
    valid: bool,
    format: NesFormat,
    header: [u8; 16],
    /// 58-byte FDS disk header, for the FDS variants.
    fds_header: Option<[u8; FDS_HEADER_SIZE]>,
    fields: Option<RomFields>,
    metadata: Option<RomMetaData>,
}

impl Nes {
    pub fn new(stream: Rc<dyn ReadAt>) -> Self {
        let mut header = [0u8; 16];
        let mut valid = false;
        let mut format = NesFormat::Ines;
        let mut fds_header = None;

        if let Ok(16) = stream.read_at(0, &mut header) {
            let info = DetectInfo {
                header_offset: 0,
                header: &header,
                ext_hint: None,
                file_size: stream.size(),
            };
            let subtype = is_supported(&info);
            if subtype >= 0 {
                format = match subtype {
                    0 => NesFormat::InesArchaic,
                    1 => NesFormat::Ines,
                    2 => NesFormat::Nes2,
                    3 => NesFormat::Tnes,
                    4 => NesFormat::FdsFwNes,
                    5 => NesFormat::FdsRaw,
                    _ => NesFormat::FdsTnes,
                };
                valid = true;

                if format.is_fds() {
                    let offset = match format {
                        NesFormat::FdsRaw => 0,
                        NesFormat::FdsFwNes => 16,
                        _ => 0x2010,
                    };
                    let mut fds = [0u8; FDS_HEADER_SIZE];
                    match stream.read_at(offset, &mut fds) {
                        Ok(n) if n == FDS_HEADER_SIZE && &fds[1..15] == b"*NINTENDO-HVC*" => {
                            fds_header = Some(fds);
                        }
                        _ => {
                            debug!("FDS disk header missing or truncated at 0x{offset:X}");
                            valid = false;
                        }
                    }
                }
            }
        }

        Self {
            stream,
            valid,
            format,
            header,
            fds_header,
            fields: None,
            metadata: None,
        }
    }

    pub fn format(&self) -> NesFormat {
        self.format
    }

    /// PRG ROM size in bytes.
    fn prg_size(&self) -> u64 {
        match self.format {
            NesFormat::Nes2 => nes2_rom_size(self.header[4], self.header[9] & 0x0F, 14),
            NesFormat::Tnes => (self.header[5] as u64) << 13,
            NesFormat::Ines | NesFormat::InesArchaic => {
                // Galaxian: a lone 8 KiB PRG bank dumped as 16400 bytes.
                if self.header[4] == 1 && self.header[5] == 1 && self.stream.size() == 16400 {
                    8 * 1024
                } else {
                    (self.header[4] as u64) << 14
                }
            }
            _ => 0,
        }
    }

    /// CHR ROM size in bytes.
    fn chr_size(&self) -> u64 {
        match self.format {
            NesFormat::Nes2 => nes2_rom_size(self.header[5], self.header[9] >> 4, 13),
            NesFormat::Tnes => (self.header[6] as u64) << 13,
            NesFormat::Ines | NesFormat::InesArchaic => (self.header[5] as u64) << 13,
            _ => 0,
        }
    }

    fn has_trainer(&self) -> bool {
        matches!(
            self.format,
            NesFormat::Ines | NesFormat::InesArchaic | NesFormat::Nes2
        ) && self.header[6] & 0x04 != 0
    }

    /// Composed mapper number, already remapped for TNES.
    fn mapper(&self) -> Option<u16> {
        match self.format {
            NesFormat::Ines | NesFormat::InesArchaic => {
                let mut m = (self.header[6] >> 4) as u16;
                if self.format != NesFormat::InesArchaic {
                    m |= (self.header[7] & 0xF0) as u16;
                }
                Some(m)
            }
            NesFormat::Nes2 => Some(
                ((self.header[6] >> 4) as u16)
                    | ((self.header[7] & 0xF0) as u16)
                    | (((self.header[8] & 0x0F) as u16) << 8),
            ),
            NesFormat::Tnes => tnes_to_ines_mapper(self.header[4]),
            _ => None,
        }
    }

    /// Absolute file offset of PRG data.
    fn prg_offset(&self) -> u64 {
        16 + if self.has_trainer() { 512 } else { 0 }
    }

    /// Try to recover the 32-byte internal footer from the end of PRG ROM.
    fn load_internal_footer(&self) -> Option<IntFooter> {
        let prg_size = self.prg_size();
        if prg_size < 32 || self.format.is_fds() || self.format == NesFormat::Tnes {
            return None;
        }

        let addr = self.prg_offset() + prg_size - 32;
        let mut footer = [0u8; 32];
        match self.stream.read_at(addr, &mut footer) {
            Ok(32) => {}
            _ => return None,
        }

        // NOTE: the footer checksum (sum of [0xFFF2,0xFFF9] == 0) is
        // deliberately not enforced; many legitimate ROMs fail it.

        let mut only_if_valid_name = false;

        let publisher_code = footer[0x18];
        if publisher_code == 0x00 || publisher_code == 0xFF {
            only_if_valid_name = true;
        }

        // ROM size nibbles must be in range and consistent with the header.
        const PRG_SHIFT: [u32; 6] = [16, 14, 15, 17, 18, 19];
        let prg_idx = (footer[0x14] >> 4) as usize;
        let chr_idx = (footer[0x14] & 0x07) as usize;
        if prg_idx >= PRG_SHIFT.len() || chr_idx >= 5 {
            return None;
        }
        let footer_prg = 1u64 << PRG_SHIFT[prg_idx];
        if footer_prg == prg_size {
            // exact match
        } else if footer_prg == prg_size / 2 || footer_prg == prg_size * 2 {
            only_if_valid_name = true;
        } else {
            return None;
        }

        let title_encoding = footer[0x16];
        if title_encoding > 4 {
            return None;
        }

        let title = if matches!(title_encoding, 1 | 2 | 4) {
            extract_footer_title(&footer[0..16], footer[0x17], title_encoding == 2)
        } else {
            String::new()
        };

        if only_if_valid_name && title.is_empty() {
            return None;
        }

        Some(IntFooter {
            title,
            prg_checksum: u16::from_be_bytes([footer[0x10], footer[0x11]]),
            chr_checksum: u16::from_be_bytes([footer[0x12], footer[0x13]]),
            rom_size: footer[0x14],
            board_info: footer[0x15],
            publisher_code,
            nmi_vector: read_u16_le(&footer, 0x1A),
            reset_vector: read_u16_le(&footer, 0x1C),
            irq_vector: read_u16_le(&footer, 0x1E),
        })
    }

    /// CRC-32 of the first 8 KiB of a region, for RPDB filenames.
    fn region_crc32(&self, offset: u64, size: u64) -> Option<u32> {
        if size == 0 {
            return None;
        }
        let len = size.min(8 * 1024) as usize;
        let mut buf = vec![0u8; len];
        match self.stream.read_at(offset, &mut buf) {
            Ok(n) if n == len => Some(crc32fast::hash(&buf)),
            _ => None,
        }
    }

    /// RPDB image filename: `{prg_crc:08X}-{chr_crc:08X}` or the FDS
    /// game code.
    fn rpdb_filename(&self) -> Option<String> {
        if let Some(fds) = &self.fds_header {
            let game_id = text::read_ascii(&fds[16..19]);
            if game_id.len() != 3 {
                return None;
            }
            let prefix = if fds[23] == 1 { "FSC" } else { "FMC" };
            return Some(format!("{prefix}-{game_id}"));
        }

        let prg_crc = self.region_crc32(self.prg_offset(), self.prg_size())?;
        let chr_offset = self.prg_offset() + self.prg_size();
        match self.region_crc32(chr_offset, self.chr_size()) {
            Some(chr_crc) => Some(format!("{prg_crc:08X}-{chr_crc:08X}")),
            None => Some(format!("{prg_crc:08X}")),
        }
    }

    fn build_fields(&self) -> RomFields {
        let mut f = RomFields::new();
        if !self.valid {
            return f;
        }

        f.add_text("Format", self.format.name());

        if let Some(fds) = &self.fds_header {
            build_fds_fields(&mut f, fds);
            return f;
        }

        match self.mapper() {
            Some(m) => {
                let name = mapper_name(m).unwrap_or("Unknown");
                f.add_text("Mapper", format!("{m} - {name}"));
            }
            None => {
                f.add_text_flags("Mapper", "Unknown", FieldFlags::WARNING);
            }
        }
        if self.format == NesFormat::Nes2 {
            f.add_numeric("Submapper", (self.header[8] >> 4) as u64);
        }
        if self.format == NesFormat::Tnes {
            f.add_numeric("TNES Mapper", self.header[4] as u64);
        }

        f.add_text("PRG ROM Size", format_size(self.prg_size()));
        f.add_text("CHR ROM Size", format_size(self.chr_size()));

        if self.format == NesFormat::Tnes {
            let mirroring = match self.header[8] {
                0 => "Programmable",
                1 => "Horizontal",
                2 => "Vertical",
                _ => "Unknown",
            };
            f.add_text("Mirroring", mirroring);
        } else {
            let f6 = self.header[6];
            let mirroring = if f6 & 0x08 != 0 {
                "Four screens"
            } else if f6 & 0x01 != 0 {
                "Vertical"
            } else {
                "Horizontal"
            };
            f.add_text("Mirroring", mirroring);
            f.add_bitfield(
                "Features",
                (f6 & 0x06) as u32 >> 1,
                vec!["Battery", "Trainer"],
            );
        }

        if let Some(footer) = self.load_internal_footer() {
            f.add_tab("Internal Footer");
            if !footer.title.is_empty() {
                f.add_text_flags("Internal Name", footer.title, FieldFlags::TRIM_END);
            }
            f.add_hex("PRG Checksum", footer.prg_checksum as u64, 4);
            f.add_hex("CHR Checksum", footer.chr_checksum as u64, 4);
            f.add_hex("ROM Size Byte", footer.rom_size as u64, 2);
            let board = match footer.board_info & 0x7F {
                0 => "NROM",
                1 => "CNROM",
                2 => "UNROM",
                3 => "GNROM",
                4 => "MMCx",
                _ => "Unknown",
            };
            f.add_text("Board Type", board);
            let publisher = old_publisher_name(footer.publisher_code)
                .map(str::to_string)
                .unwrap_or_else(|| format!("Unknown (0x{:02X})", footer.publisher_code));
            f.add_text("Publisher", publisher);
            f.add_hex("NMI Vector", footer.nmi_vector as u64, 4);
            f.add_hex("Reset Vector", footer.reset_vector as u64, 4);
            f.add_hex("IRQ Vector", footer.irq_vector as u64, 4);
        }

        f
    }

    fn build_metadata(&self) -> RomMetaData {
        let mut m = RomMetaData::new();
        if !self.valid {
            return m;
        }
        if let Some(fds) = &self.fds_header {
            let game_id = text::read_ascii(&fds[16..19]);
            if !game_id.is_empty() {
                m.add_text(Property::Title, game_id);
            }
            if let Some(name) = old_publisher_name(fds[15]) {
                m.add_text(Property::Publisher, name);
            }
            if let Some(ts) = fds_bcd_date_to_unix(fds[31], fds[32], fds[33]) {
                m.add_timestamp(Property::CreationDate, ts);
            }
        } else if let Some(footer) = self.load_internal_footer() {
            if !footer.title.is_empty() {
                m.add_text(Property::Title, footer.title);
            }
            if let Some(name) = old_publisher_name(footer.publisher_code) {
                m.add_text(Property::Publisher, name);
            }
        }
        m
    }
}

/// Extract the internal-footer title, handling the alignment quirk:
/// the field is nominally right-aligned with 0xFF/0x00/0x20 padding,
/// but some games left-align it. The 16th byte disambiguates.
fn extract_footer_title(raw: &[u8], length_byte: u8, sjis: bool) -> String {
    if length_byte == 0 || length_byte > 16 {
        return String::new();
    }
    // Length byte is off by one, except when it's exactly 16.
    let len = if length_byte < 16 {
        length_byte as usize + 1
    } else {
        16
    };

    let last = raw[15];
    let mut start = if !matches!(last, 0x00 | 0x20 | 0xFF) {
        16 - len
    } else {
        0
    };
    let mut len = len;

    while len > 0 && matches!(raw[start], 0x00 | 0x20 | 0xFF) {
        start += 1;
        len -= 1;
    }
    for i in 0..len {
        let b = raw[start + i];
        if b < 0x20 || b == 0xFF {
            len = i;
            break;
        }
    }

    let slice = &raw[start..start + len];
    let s = if sjis {
        text::sjis_or_ascii(slice)
    } else {
        text::cp1252(slice)
    };
    s.trim().to_string()
}

/// Convert an FDS BCD date to UTC Unix seconds.
///
/// The year uses Japanese eras: BCD >= 58 is Shōwa (add 1925),
/// below that Heisei (add 1988).
pub(crate) fn fds_bcd_date_to_unix(year: u8, mon: u8, day: u8) -> Option<i64> {
    let year = bcd_to_u8(year)?;
    let mon = bcd_to_u8(mon)?;
    let day = bcd_to_u8(day)?;
    let year = if year >= 58 {
        1925 + year as i32
    } else {
        1988 + year as i32
    };
    let date = NaiveDate::from_ymd_opt(year, mon as u32, day as u32)?;
    Some(date.and_hms_opt(0, 0, 0)?.and_utc().timestamp())
}

fn build_fds_fields(f: &mut RomFields, fds: &[u8; FDS_HEADER_SIZE]) {
    let game_id = text::read_ascii(&fds[16..19]);
    let prefix = if fds[23] == 1 { "FSC" } else { "FMC" };
    if !game_id.is_empty() {
        f.add_text("Game ID", format!("{prefix}-{game_id}"));
    }

    let publisher = old_publisher_name(fds[15])
        .map(str::to_string)
        .unwrap_or_else(|| format!("Unknown (0x{:02X})", fds[15]));
    f.add_text("Publisher", publisher);

    let game_type = match fds[19] {
        b' ' => "Normal",
        b'E' => "Event",
        b'R' => "Reduced price",
        _ => "Unknown",
    };
    f.add_text("Game Type", game_type);
    f.add_numeric("Revision", fds[20] as u64);
    f.add_numeric("Side Number", fds[21] as u64);
    f.add_numeric("Disk Number", fds[22] as u64);

    match fds_bcd_date_to_unix(fds[31], fds[32], fds[33]) {
        Some(ts) => f.add_datetime("Manufacture Date", ts),
        None => f.add_datetime("Manufacture Date", -1),
    }
}

fn format_size(bytes: u64) -> String {
    if bytes >= 1024 && bytes % 1024 == 0 {
        format!("{} KiB", bytes / 1024)
    } else {
        format!("{bytes} bytes")
    }
}

impl RomData for Nes {
    fn is_valid(&self) -> bool {
        self.valid
    }

    fn file_type(&self) -> FileType {
        if self.format.is_fds() {
            FileType::DiscImage
        } else {
            FileType::RomImage
        }
    }

    fn system_name(&self) -> &'static str {
        if self.format.is_fds() {
            "Famicom Disk System"
        } else {
            "Nintendo Entertainment System"
        }
    }

    fn mime_type(&self) -> &'static str {
        if self.format.is_fds() {
            "application/x-fds-disk"
        } else {
            "application/x-nes-rom"
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

    fn ext_urls(&self, kind: ImageType) -> Vec<ExtUrl> {
        if kind != ImageType::ExtTitleScreen || !self.valid {
            return Vec::new();
        }
        let sys = if self.format.is_fds() { "fds" } else { "nes" };
        match self.rpdb_filename() {
            Some(file) => {
                let cache_key = format!("{sys}/title/{file}.png");
                vec![ExtUrl {
                    url: format!("{RPDB_BASE}/{cache_key}"),
                    cache_key,
                }]
            }
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
#[path = "tests/nes_tests.rs"]
mod tests;
