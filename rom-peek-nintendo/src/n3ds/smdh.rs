//! SMDH icon+metadata block parser.
//!
//! An SMDH carries 16 per-language title blocks, the application
//! settings (age ratings, region lockout, flags), and two icons in the
//! PICA200 tiled RGB565 format. It appears standalone (`.smdh`) and
//! embedded: in the ExeFS `icon` file of an NCCH and in the meta
//! section of a CIA.

use std::rc::Rc;

use rom_peek_core::byteorder::{read_u16_le, read_u32_le};
use rom_peek_core::pixel;
use rom_peek_core::{
    AgeRating, DecodedImage, DetectInfo, FileType, ImageType, ImageTypes, ImgProcFlags,
    Property, ReadAt, RomData, RomFields, RomMetaData, text,
};

/// Full SMDH size: 0x2040 header + small icon + large icon.
pub const SMDH_SIZE: usize = 0x36C0;

const TITLES_OFFSET: usize = 0x008;
const TITLE_BLOCK_LEN: usize = 0x200;
const SETTINGS_OFFSET: usize = 0x2008;
const SMALL_ICON_OFFSET: usize = 0x2040;
const LARGE_ICON_OFFSET: usize = 0x24C0;

/// SMDH language indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum SmdhLanguage {
    Japanese = 0,
    English = 1,
    French = 2,
    German = 3,
    Italian = 4,
    Spanish = 5,
    ChineseSimplified = 6,
    Korean = 7,
    Dutch = 8,
    Portuguese = 9,
    Russian = 10,
    ChineseTraditional = 11,
}

/// Region lockout bits.
const REGION_JAPAN: u32 = 1 << 0;
const REGION_USA: u32 = 1 << 1;
const REGION_EUROPE: u32 = 1 << 2;
const REGION_AUSTRALIA: u32 = 1 << 3;
const REGION_CHINA: u32 = 1 << 4;
const REGION_KOREA: u32 = 1 << 5;
const REGION_TAIWAN: u32 = 1 << 6;
const REGION_FREE: u32 = 0x7FFF_FFFF;

/// Age-rating slots that are meaningful on 3DS.
const ACTIVE_RATING_SLOTS: [usize; 9] = [0, 1, 3, 4, 6, 7, 8, 9, 10];

/// Registry hook.
pub fn is_supported(info: &DetectInfo) -> i32 {
    if info.header_offset != 0 || info.header.len() < 4 {
        return -1;
    }
    if &info.header[0..4] == b"SMDH" && info.file_size >= SMDH_SIZE as u64 {
        return 0;
    }
    -1
}

/// A parsed SMDH block.
pub struct Smdh {
    valid: bool,
    data: Vec<u8>,
    fields: Option<RomFields>,
    metadata: Option<RomMetaData>,
    icon_small: Option<Option<DecodedImage>>,
    icon_large: Option<Option<DecodedImage>>,
}

impl Smdh {
    pub fn new(stream: Rc<dyn ReadAt>) -> Self {
        let mut data = vec![0u8; SMDH_SIZE];
        let valid = matches!(stream.read_at(0, &mut data), Ok(n) if n == SMDH_SIZE)
            && &data[0..4] == b"SMDH";
        Self {
            valid,
            data,
            fields: None,
            metadata: None,
            icon_small: None,
            icon_large: None,
        }
    }

    /// Wrap an SMDH already read out of a container.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        let valid = data.len() >= SMDH_SIZE && &data[0..4] == b"SMDH";
        Self {
            valid,
            data,
            fields: None,
            metadata: None,
            icon_small: None,
            icon_large: None,
        }
    }

    fn title_block(&self, lang: usize) -> &[u8] {
        let base = TITLES_OFFSET + lang * TITLE_BLOCK_LEN;
        &self.data[base..base + TITLE_BLOCK_LEN]
    }

    pub fn short_title(&self, lang: SmdhLanguage) -> String {
        text::utf16le(&self.title_block(lang as usize)[0..0x80])
    }

    pub fn long_title(&self, lang: SmdhLanguage) -> String {
        text::utf16le(&self.title_block(lang as usize)[0x80..0x180])
    }

    pub fn publisher(&self, lang: SmdhLanguage) -> String {
        text::utf16le(&self.title_block(lang as usize)[0x180..0x200])
    }

    /// Pick the display language: the requested one if it has a short
    /// title, else English, else Japanese.
    pub fn display_language(&self, preferred: SmdhLanguage) -> SmdhLanguage {
        for lang in [preferred, SmdhLanguage::English, SmdhLanguage::Japanese] {
            if !self.short_title(lang).is_empty() {
                return lang;
            }
        }
        SmdhLanguage::English
    }

    pub fn region_code(&self) -> u32 {
        read_u32_le(&self.data, SETTINGS_OFFSET + 0x10)
    }

    /// True when the title is locked to China only (iQue 3DS).
    pub fn is_ique(&self) -> bool {
        self.region_code() == REGION_CHINA
    }

    pub fn age_ratings(&self) -> [AgeRating; 16] {
        let raw = &self.data[SETTINGS_OFFSET..SETTINGS_OFFSET + 16];
        let mut out = [AgeRating::default(); 16];
        for (i, rating) in out.iter_mut().enumerate() {
            if !ACTIVE_RATING_SLOTS.contains(&i) {
                continue;
            }
            let b = raw[i];
            if b & 0x80 == 0 {
                continue;
            }
            rating.active = true;
            rating.pending = b & 0x40 != 0;
            rating.no_restriction = b & 0x20 != 0;
            if !rating.pending && !rating.no_restriction {
                rating.age = b & 0x1F;
            }
        }
        out
    }

    fn decode_icon(&self, offset: usize, dim: u16) -> Option<DecodedImage> {
        let len = dim as usize * dim as usize * 2;
        pixel::from_n3ds_rgb565_tiled(dim, dim, &self.data[offset..offset + len]).ok()
    }

    /// iQue-exclusive publication numbers, stored as ASCII inside the
    /// simplified-Chinese long description.
    fn ique_fields(&self) -> Option<(String, String, String)> {
        if !self.is_ique() {
            return None;
        }
        let long = &self.title_block(SmdhLanguage::ChineseSimplified as usize)[0x80..0x180];
        let raw = &long[218..];
        if !raw[0].is_ascii_digit() {
            return None;
        }
        let isbn = text::read_ascii_fixed(&raw[0..17]);
        let contract = text::read_ascii_fixed(&raw[17..28]);
        // 4-digit year and 3-digit serial, one NUL between contract
        // and approval.
        let approval = format!(
            "{}-{}",
            text::read_ascii_fixed(&raw[29..33]),
            text::read_ascii_fixed(&raw[33..36])
        );
        Some((isbn, contract, approval))
    }

    fn build_fields(&self) -> RomFields {
        let mut f = RomFields::new();
        if !self.valid {
            return f;
        }
        let lang = self.display_language(SmdhLanguage::English);
        let short = self.short_title(lang);
        let long = self.long_title(lang);
        let publisher = self.publisher(lang);

        f.add_text("Title", short.clone());
        // The long description frequently repeats the short title;
        // only show it when it differs.
        if !long.is_empty() && long != short {
            f.add_text("Full Title", long);
        }
        f.add_text("Publisher", publisher);

        let region = self.region_code();
        if region == REGION_FREE {
            f.add_text("Region", "Region-free");
        } else {
            f.add_bitfield(
                "Region Lockout",
                region
                    & (REGION_JAPAN
                        | REGION_USA
                        | REGION_EUROPE
                        | REGION_AUSTRALIA
                        | REGION_CHINA
                        | REGION_KOREA
                        | REGION_TAIWAN),
                vec![
                    "Japan",
                    "USA",
                    "Europe",
                    "Australia",
                    "China",
                    "South Korea",
                    "Taiwan",
                ],
            );
        }

        f.add_age_ratings("Age Ratings", self.age_ratings());

        let flags = read_u32_le(&self.data, SETTINGS_OFFSET + 0x20);
        f.add_bitfield(
            "Flags",
            flags & 0x1FFF,
            vec![
                "Visible",
                "Auto Boot",
                "3D Effect",
                "Requires EULA",
                "Autosave",
                "Extended Banner",
                "Region Rating Required",
                "Uses Save Data",
                "Records Usage",
                "",
                "No Save Backup",
                "",
                "New 3DS Only",
            ],
        );

        let eula = read_u16_le(&self.data, SETTINGS_OFFSET + 0x24);
        if eula != 0 {
            f.add_text("EULA Version", format!("{}.{}", eula >> 8, eula & 0xFF));
        }

        if let Some((isbn, contract, approval)) = self.ique_fields() {
            f.add_text("ISBN", isbn);
            f.add_text("Contract Reg. No.", contract);
            f.add_text("Publishing Approval No.", approval);
        }
        f
    }

    fn build_metadata(&self) -> RomMetaData {
        let mut m = RomMetaData::new();
        if !self.valid {
            return m;
        }
        let lang = self.display_language(SmdhLanguage::English);
        let title = self.short_title(lang);
        if !title.is_empty() {
            m.add_text(Property::Title, title);
        }
        let publisher = self.publisher(lang);
        if !publisher.is_empty() {
            m.add_text(Property::Publisher, publisher);
        }
        m
    }
}

impl RomData for Smdh {
    fn is_valid(&self) -> bool {
        self.valid
    }

    fn file_type(&self) -> FileType {
        FileType::IconFile
    }

    fn system_name(&self) -> &'static str {
        "Nintendo 3DS"
    }

    fn mime_type(&self) -> &'static str {
        "application/x-nintendo-3ds-smdh"
    }

    fn supported_image_types(&self) -> ImageTypes {
        ImageTypes::ICON
    }

    fn supported_image_sizes(&self, kind: ImageType) -> Vec<(u16, u16)> {
        match kind {
            ImageType::Icon => vec![(48, 48), (24, 24)],
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
        if self.icon_large.is_none() {
            self.icon_large = Some(self.decode_icon(LARGE_ICON_OFFSET, 48));
        }
        self.icon_large.as_ref()?.as_ref()
    }

    fn icon_animation(&mut self) -> Option<&rom_peek_core::IconAnimation> {
        None
    }
}

impl Smdh {
    /// The 24x24 icon, for hosts that want the small variant.
    pub fn small_icon(&mut self) -> Option<&DecodedImage> {
        if !self.valid {
            return None;
        }
        if self.icon_small.is_none() {
            self.icon_small = Some(self.decode_icon(SMALL_ICON_OFFSET, 24));
        }
        self.icon_small.as_ref()?.as_ref()
    }
}

#[cfg(test)]
#[path = "tests/smdh_tests.rs"]
mod tests;
