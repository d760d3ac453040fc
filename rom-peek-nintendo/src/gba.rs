//! Game Boy Advance ROM parser.
//!
//! Licensed carts are recognised by the compressed Nintendo logo in
//! the 192-byte header. Dumps without the logo fall into two buckets:
//! NDS expansion cartridges (valid header checksum, no boot entry) and
//! unlicensed pass-through carts.

use std::rc::Rc;

use crate::licensee::maker_code_name;
use rom_peek_core::byteorder::read_u32_le;
use rom_peek_core::{
    DetectInfo, ExtUrl, FieldFlags, FileType, ImageType, Property, ReadAt, RomData, RomFields,
    RomMetaData, text,
};

const RPDB_BASE: &str = "https://rpdb.gerbilsoft.com";

const HEADER_SIZE: usize = 192;

/// First 16 bytes of the compressed Nintendo logo.
const LOGO_PREFIX: [u8; 16] = [
    0x24, 0xFF, 0xAE, 0x51, 0x69, 0x9A, 0xA2, 0x21, 0x3D, 0x84, 0x82, 0x0A, 0x84, 0xE4, 0x09,
    0xAD,
];

/// Cartridge classification. The discriminant is the detection
/// subtype id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GbaType {
    /// Licensed cartridge with the Nintendo logo.
    Licensed = 0,
    /// NDS memory expansion cartridge (not bootable).
    NdsExpansion = 1,
    /// Unlicensed cartridge without the logo.
    Unlicensed = 2,
}

/// Header checksum over bytes 0xA0..0xBC: `-(sum) - 0x19`.
fn header_checksum(header: &[u8]) -> u8 {
    let sum: u8 = header[0xA0..0xBD]
        .iter()
        .fold(0u8, |acc, &b| acc.wrapping_add(b));
    0u8.wrapping_sub(sum).wrapping_sub(0x19)
}

fn classify(header: &[u8]) -> Option<GbaType> {
    if header[0x04..0x14] == LOGO_PREFIX {
        return Some(GbaType::Licensed);
    }
    // No logo: look for the expansion-cartridge signature.
    if header[0xB2] == 0x96 && header[0xB4] == 0x00 && header_checksum(header) == header[0xBD] {
        if read_u32_le(header, 0) == 0xFFFF_FFFF {
            return Some(GbaType::NdsExpansion);
        }
        return Some(GbaType::Unlicensed);
    }
    None
}

/// Registry hook.
pub fn is_supported(info: &DetectInfo) -> i32 {
    if info.header_offset != 0 || info.header.len() < HEADER_SIZE {
        return -1;
    }
    match classify(info.header) {
        Some(t) => t as i32,
        None => -1,
    }
}

/// Resolve an ARM unconditional-branch entry point to its target
/// address offset. Only meaningful when the opcode byte is 0xEA.
fn resolve_arm_branch(entry_point: u32) -> Option<u32> {
    if entry_point >> 24 != 0xEA {
        return None;
    }
    let mut offset = entry_point.wrapping_add(2) & 0x00FF_FFFF;
    // Sign-extend the 24-bit branch offset.
    if offset & 0x0080_0000 != 0 {
        offset |= 0xFF00_0000;
    }
    Some(offset << 2)
}

/// Game Boy Advance ROM image.
pub struct GameBoyAdvance {
    valid: bool,
    gba_type: GbaType,
    header: [u8; HEADER_SIZE],
    fields: Option<RomFields>,
    metadata: Option<RomMetaData>,
}

impl GameBoyAdvance {
    pub fn new(stream: Rc<dyn ReadAt>) -> Self {
        let mut header = [0u8; HEADER_SIZE];
        let mut valid = false;
        let mut gba_type = GbaType::Licensed;

        if let Ok(HEADER_SIZE) = stream.read_at(0, &mut header) {
            if let Some(t) = classify(&header) {
                gba_type = t;
                valid = true;
            }
        }

        Self {
            valid,
            gba_type,
            header,
            fields: None,
            metadata: None,
        }
    }

    pub fn gba_type(&self) -> GbaType {
        self.gba_type
    }

    fn title(&self) -> String {
        text::read_ascii_fixed(&self.header[0xA0..0xAC])
    }

    fn id6(&self) -> String {
        text::read_ascii(&self.header[0xAC..0xB2])
    }

    /// Debug handler enable: `(byte & 0xA5) == 0xA5` in the reserved
    /// slot at the tail of the logo region.
    fn debug_enabled(&self) -> bool {
        self.header[0x9C] & 0xA5 == 0xA5
    }

    fn build_fields(&self) -> RomFields {
        let mut f = RomFields::new();
        if !self.valid {
            return f;
        }

        match self.gba_type {
            GbaType::Licensed => {}
            GbaType::NdsExpansion => {
                f.add_text("Cartridge Type", "NDS memory expansion (not bootable)");
            }
            GbaType::Unlicensed => {
                f.add_text_flags("Cartridge Type", "Unlicensed", FieldFlags::WARNING);
            }
        }

        let title = self.title();
        if !title.is_empty() {
            f.add_text("Title", title);
        }
        let id6 = self.id6();
        if id6.len() == 6 {
            f.add_text("Game ID", format!("AGB-{}", &id6[..4]));
            let company = &id6[4..6];
            let publisher = maker_code_name(company)
                .map(str::to_string)
                .unwrap_or_else(|| format!("Unknown ({company})"));
            f.add_text("Publisher", publisher);
        }

        let entry_point = read_u32_le(&self.header, 0);
        if self.gba_type != GbaType::NdsExpansion {
            f.add_hex("Entry Point", entry_point as u64, 8);
            if let Some(target) = resolve_arm_branch(entry_point) {
                f.add_hex("Entry Point Address", target as u64, 8);
            }
        }

        f.add_numeric("Revision", self.header[0xBC] as u64);
        if self.debug_enabled() {
            f.add_text("Debugging", "Enabled");
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
        let id6 = self.id6();
        if id6.len() == 6 {
            if let Some(name) = maker_code_name(&id6[4..6]) {
                m.add_text(Property::Publisher, name);
            }
            m.add_text(Property::GameId, format!("AGB-{}", &id6[..4]));
        }
        m
    }
}

impl RomData for GameBoyAdvance {
    fn is_valid(&self) -> bool {
        self.valid
    }

    fn file_type(&self) -> FileType {
        FileType::RomImage
    }

    fn system_name(&self) -> &'static str {
        "Game Boy Advance"
    }

    fn mime_type(&self) -> &'static str {
        "application/x-gba-rom"
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
        let id6 = self.id6();
        if id6.len() != 6 {
            return Vec::new();
        }
        let cache_key = format!("gba/title/{id6}.png");
        vec![ExtUrl {
            url: format!("{RPDB_BASE}/{cache_key}"),
            cache_key,
        }]
    }
}

#[cfg(test)]
#[path = "tests/gba_tests.rs"]
mod tests;
