//! Virtual Boy ROM parser.
//!
//! The 32-byte header sits at `size - 0x220`, so validation starts
//! with the file size itself: 4 KiB to 16 MiB and a power of two.

use std::rc::Rc;

use crate::licensee::maker_code_name;
use rom_peek_core::{
    DetectInfo, FileType, Property, ReadAt, RomData, RomFields, RomMetaData, text,
};

const FOOTER_OFFSET_FROM_END: u64 = 0x220;
const FOOTER_LEN: usize = 32;

const MIN_SIZE: u64 = 4 * 1024;
const MAX_SIZE: u64 = 16 * 1024 * 1024;

fn size_is_valid(size: u64) -> bool {
    (MIN_SIZE..=MAX_SIZE).contains(&size) && size.is_power_of_two()
}

/// JIS X 0201: printable ASCII or half-width katakana. NUL padding is
/// allowed; other control characters are not.
fn title_byte_valid(b: u8) -> bool {
    matches!(b, 0x00 | 0x20..=0x7E | 0xA1..=0xDF)
}

fn game_id_valid(id: &[u8]) -> bool {
    id.iter()
        .all(|&b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b' ' || b == b'-')
}

fn footer_valid(footer: &[u8; FOOTER_LEN]) -> bool {
    // Title: 20 JIS X 0201 bytes, byte 20 must be NUL.
    if footer[20] != 0 || !footer[..20].iter().all(|&b| title_byte_valid(b)) {
        return false;
    }
    if !footer[25..27]
        .iter()
        .all(|&b| b.is_ascii_uppercase() || b.is_ascii_digit())
    {
        return false;
    }
    game_id_valid(&footer[27..31])
}

/// Registry hook: footer-based, so the registry offers this parser the
/// trailing window; the parser re-reads the exact footer itself.
pub fn is_supported(info: &DetectInfo) -> i32 {
    if !size_is_valid(info.file_size) {
        return -1;
    }
    if info.ext_hint == Some(".vb") {
        return 0;
    }
    -1
}

/// Virtual Boy ROM image.
pub struct VirtualBoy {
    valid: bool,
    footer: [u8; FOOTER_LEN],
    fields: Option<RomFields>,
    metadata: Option<RomMetaData>,
}

impl VirtualBoy {
    pub fn new(stream: Rc<dyn ReadAt>) -> Self {
        let mut footer = [0u8; FOOTER_LEN];
        let mut valid = false;

        let size = stream.size();
        if size_is_valid(size) {
            let addr = size - FOOTER_OFFSET_FROM_END;
            if let Ok(FOOTER_LEN) = stream.read_at(addr, &mut footer) {
                valid = footer_valid(&footer);
            }
        }

        Self {
            valid,
            footer,
            fields: None,
            metadata: None,
        }
    }

    fn title(&self) -> String {
        text::sjis_or_ascii(text::trim_end_padding(&self.footer[..20]))
    }

    fn game_id(&self) -> String {
        text::read_ascii_fixed(&self.footer[27..31])
    }

    /// The region slot exists in the game ID but no PAL Virtual Boy
    /// ever shipped; real IDs end in 'E' or 'J'.
    pub fn is_pal(&self) -> bool {
        self.footer[30] == b'P'
    }

    fn build_fields(&self) -> RomFields {
        let mut f = RomFields::new();
        if !self.valid {
            return f;
        }
        f.add_text("Title", self.title());
        f.add_text("Game ID", self.game_id());
        let code = text::read_ascii(&self.footer[25..27]);
        let publisher = maker_code_name(&code)
            .map(str::to_string)
            .unwrap_or_else(|| format!("Unknown ({code})"));
        f.add_text("Publisher", publisher);
        f.add_numeric("Version", self.footer[31] as u64);
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
        let code = text::read_ascii(&self.footer[25..27]);
        if let Some(name) = maker_code_name(&code) {
            m.add_text(Property::Publisher, name);
        }
        m
    }
}

impl RomData for VirtualBoy {
    fn is_valid(&self) -> bool {
        self.valid
    }

    fn file_type(&self) -> FileType {
        FileType::RomImage
    }

    fn system_name(&self) -> &'static str {
        "Virtual Boy"
    }

    fn mime_type(&self) -> &'static str {
        "application/x-virtual-boy-rom"
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
