//! Minimal Nintendo DS SRL reader.
//!
//! DSiWare CIAs wrap a DS ROM instead of an NCCH; the 3DS parser
//! delegates those to this reader, which covers the header fields and
//! the banner icon (4bpp, 16-colour BGR555 palette, 8x8 tiles in a
//! 4x4 grid).

use std::rc::Rc;

use crate::licensee::maker_code_name;
use rom_peek_core::byteorder::{read_u16_le, read_u32_le};
use rom_peek_core::{
    DecodedImage, FileType, ImageType, ImageTypes, ImgProcFlags, Property, ReadAt, RomData,
    RomFields, RomMetaData, SBit, text,
};

const HEADER_LEN: usize = 0x180;

/// CRC16 of the Nintendo logo, fixed across all licensed DS ROMs.
const NDS_LOGO_CRC: u16 = 0xCF56;

/// Quick structural check for an NDS/DSi ROM header.
pub fn looks_like_nds(header: &[u8]) -> bool {
    header.len() >= HEADER_LEN
        && read_u16_le(header, 0x15C) == NDS_LOGO_CRC
        && header[0x0C..0x10]
            .iter()
            .all(|&b| b.is_ascii_alphanumeric() || b == b'#')
}

/// Nintendo DS ROM image (SRL), typically DSiWare content.
pub struct NdsSrl {
    stream: Rc<dyn ReadAt>,
    valid: bool,
    header: [u8; HEADER_LEN],
    fields: Option<RomFields>,
    metadata: Option<RomMetaData>,
    icon: Option<Option<DecodedImage>>,
}

impl NdsSrl {
    pub fn new(stream: Rc<dyn ReadAt>) -> Self {
        let mut header = [0u8; HEADER_LEN];
        let valid = matches!(stream.read_at(0, &mut header), Ok(HEADER_LEN))
            && looks_like_nds(&header);
        Self {
            stream,
            valid,
            header,
            fields: None,
            metadata: None,
            icon: None,
        }
    }

    fn title(&self) -> String {
        text::read_ascii_fixed(&self.header[0..12])
    }

    fn game_code(&self) -> String {
        text::read_ascii(&self.header[0x0C..0x10])
    }

    fn maker_code(&self) -> String {
        text::read_ascii(&self.header[0x10..0x12])
    }

    fn banner_offset(&self) -> u32 {
        read_u32_le(&self.header, 0x68)
    }

    /// Banner English title, when the banner is readable.
    fn banner_title(&self) -> Option<String> {
        let banner_offset = self.banner_offset();
        if banner_offset == 0 {
            return None;
        }
        let mut raw = [0u8; 0x100];
        match self
            .stream
            .read_at(banner_offset as u64 + 0x340, &mut raw)
        {
            Ok(n) if n == raw.len() => {}
            _ => return None,
        }
        let title = text::utf16le(&raw);
        if title.is_empty() { None } else { Some(title) }
    }

    fn load_icon(&self) -> Option<DecodedImage> {
        let banner_offset = self.banner_offset();
        if banner_offset == 0 {
            return None;
        }
        let mut bitmap = [0u8; 0x200];
        let mut palette_raw = [0u8; 0x20];
        match self.stream.read_at(banner_offset as u64 + 0x20, &mut bitmap) {
            Ok(n) if n == bitmap.len() => {}
            _ => return None,
        }
        match self
            .stream
            .read_at(banner_offset as u64 + 0x220, &mut palette_raw)
        {
            Ok(n) if n == palette_raw.len() => {}
            _ => return None,
        }

        // BGR555 palette; index 0 is transparent.
        let mut palette = [0u32; 16];
        for (i, color) in palette.iter_mut().enumerate().skip(1) {
            let px = read_u16_le(&palette_raw, i * 2);
            let r = (px & 0x1F) as u32;
            let g = ((px >> 5) & 0x1F) as u32;
            let b = ((px >> 10) & 0x1F) as u32;
            *color = 0xFF000000
                | ((r << 3 | r >> 2) << 16)
                | ((g << 3 | g >> 2) << 8)
                | (b << 3 | b >> 2);
        }

        // 4x4 grid of 8x8 tiles, two pixels per byte, low nibble first.
        let mut img = DecodedImage::new(32, 32);
        img.sbit = SBit::new(5, 5, 5, 1);
        img.palette = Some(palette.to_vec());
        let mut pos = 0usize;
        for tile_y in 0..4 {
            for tile_x in 0..4 {
                for y in 0..8 {
                    for x in 0..4 {
                        let byte = bitmap[pos];
                        pos += 1;
                        let px = tile_x * 8 + x * 2;
                        let py = tile_y * 8 + y;
                        img.set_pixel(px as u16, py as u16, palette[(byte & 0xF) as usize]);
                        img.set_pixel((px + 1) as u16, py as u16, palette[(byte >> 4) as usize]);
                    }
                }
            }
        }
        Some(img)
    }

    fn build_fields(&self) -> RomFields {
        let mut f = RomFields::new();
        if !self.valid {
            return f;
        }
        let title = match self.banner_title() {
            Some(t) => t,
            None => self.title(),
        };
        f.add_text("Title", title);
        f.add_text("Game ID", format!("NTR-{}", self.game_code()));
        let maker = self.maker_code();
        let publisher = maker_code_name(&maker)
            .map(str::to_string)
            .unwrap_or_else(|| format!("Unknown ({maker})"));
        f.add_text("Publisher", publisher);
        f.add_numeric("Revision", self.header[0x1E] as u64);
        let unit = match self.header[0x12] {
            0x00 => "Nintendo DS",
            0x02 => "Nintendo DS (DSi enhanced)",
            0x03 => "Nintendo DSi",
            _ => "Unknown",
        };
        f.add_text("Hardware", unit);
        f
    }

    fn build_metadata(&self) -> RomMetaData {
        let mut m = RomMetaData::new();
        if !self.valid {
            return m;
        }
        let title = self.banner_title().unwrap_or_else(|| self.title());
        if !title.is_empty() {
            m.add_text(Property::Title, title);
        }
        if let Some(name) = maker_code_name(&self.maker_code()) {
            m.add_text(Property::Publisher, name);
        }
        m.add_text(Property::GameId, self.game_code());
        m
    }
}

impl RomData for NdsSrl {
    fn is_valid(&self) -> bool {
        self.valid
    }

    fn file_type(&self) -> FileType {
        FileType::RomImage
    }

    fn system_name(&self) -> &'static str {
        "Nintendo DS"
    }

    fn mime_type(&self) -> &'static str {
        "application/x-nintendo-ds-rom"
    }

    fn supported_image_types(&self) -> ImageTypes {
        if self.valid && self.banner_offset() != 0 {
            ImageTypes::ICON
        } else {
            ImageTypes::empty()
        }
    }

    fn supported_image_sizes(&self, kind: ImageType) -> Vec<(u16, u16)> {
        match kind {
            ImageType::Icon => vec![(32, 32)],
            _ => Vec::new(),
        }
    }

    fn imgpf(&self, kind: ImageType) -> ImgProcFlags {
        match kind {
            ImageType::Icon => ImgProcFlags::RESCALE_NEAREST,
            _ => ImgProcFlags::empty(),
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

    fn image(&mut self, kind: ImageType) -> Option<&DecodedImage> {
        if !self.valid || kind != ImageType::Icon {
            return None;
        }
        if self.icon.is_none() {
            self.icon = Some(self.load_icon());
        }
        self.icon.as_ref()?.as_ref()
    }
}
