//! GameCube memory-card save parser (.gci, .gcs, .sav).
//!
//! All three containers embed the same 64-byte CARD directory entry,
//! at different offsets and with different byte orderings:
//!
//! - GCI: direntry at 0, native big-endian
//! - GCS (GameShark): "GCSAVE" header, direntry at 0x110
//! - SAV (MaxDrive): "DATELGC_SAVE" header, direntry at 0x80, with
//!   16-bit byteswapping on the non-text fields, which makes the two
//!   32-bit address fields PDP-endian
//!
//! The icon/banner data in the save's data area uses the GameCube
//! tiled pixel formats.

use std::rc::Rc;

use log::debug;

use crate::licensee::maker_code_name;
use rom_peek_core::byteorder::{read_u16_be, read_u32_be, swap16_pairs};
use rom_peek_core::pixel;
use rom_peek_core::{
    DecodedImage, DetectInfo, FieldFlags, FileType, FrameDelay, IconAnimation, ImageType,
    ImageTypes, ImgProcFlags, Property, ReadAt, RomData, RomFields, RomMetaData, text,
};

const DIRENTRY_LEN: usize = 64;
const BLOCK_SIZE: u64 = 8192;

const BANNER_W: u16 = 96;
const BANNER_H: u16 = 32;
const ICON_W: u16 = 32;
const ICON_H: u16 = 32;
const MAX_ICONS: usize = 8;

/// Seconds between 2000-01-01 (GameCube epoch) and the Unix epoch.
const GC_EPOCH_OFFSET: i64 = 946_684_800;

/// Save container format. The discriminant is the detection subtype id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcnSaveType {
    Gci = 0,
    Gcs = 1,
    Sav = 2,
}

impl GcnSaveType {
    fn direntry_offset(self) -> u64 {
        match self {
            Self::Gci => 0,
            Self::Gcs => 0x110,
            Self::Sav => 0x80,
        }
    }

    fn data_offset(self) -> u64 {
        self.direntry_offset() + DIRENTRY_LEN as u64
    }
}

/// Normalise a SAV direntry to GCI (big-endian) layout: the MaxDrive
/// dumper 16-bit-swaps the banner-format pair and everything from
/// 0x2C to 0x40.
fn normalize_sav_direntry(direntry: &mut [u8; DIRENTRY_LEN]) {
    swap16_pairs(&mut direntry[0x06..0x08]);
    swap16_pairs(&mut direntry[0x2C..0x40]);
}

/// Validate a (normalised) directory entry against the data area size.
fn direntry_valid(direntry: &[u8; DIRENTRY_LEN], data_size: u64, save_type: GcnSaveType) -> bool {
    // Game ID must be alphanumeric ASCII.
    if !direntry[0..6].iter().all(|&b| b.is_ascii_alphanumeric()) {
        return false;
    }
    if direntry[0x06] != 0xFF {
        return false;
    }
    if read_u16_be(direntry, 0x3A) != 0xFFFF {
        return false;
    }

    let length = read_u16_be(direntry, 0x38) as u64;
    match save_type {
        // The GCS length field is known-unreliable; any non-zero value
        // is accepted.
        GcnSaveType::Gcs => {
            if length == 0 {
                return false;
            }
        }
        _ => {
            if length * BLOCK_SIZE != data_size {
                return false;
            }
        }
    }

    for offset in [0x2C, 0x3C] {
        let addr = read_u32_be(direntry, offset);
        if addr != 0xFFFF_FFFF && addr as u64 >= data_size {
            return false;
        }
    }
    true
}

/// Registry hook. GCI has no magic, so its direntry is validated
/// directly from the header window.
pub fn is_supported(info: &DetectInfo) -> i32 {
    if info.header_offset != 0 || info.header.len() < 0x150 + DIRENTRY_LEN {
        return -1;
    }
    let h = info.header;
    let size = info.file_size;

    if h.starts_with(b"GCSAVE\0") && size > 336 && (size - 336) % BLOCK_SIZE == 0 {
        return GcnSaveType::Gcs as i32;
    }
    if h.starts_with(b"DATELGC_SAVE\0\0\0\0") && size > 192 && (size - 192) % BLOCK_SIZE == 0 {
        return GcnSaveType::Sav as i32;
    }
    if size > 64 && (size - 64) % BLOCK_SIZE == 0 {
        let mut direntry = [0u8; DIRENTRY_LEN];
        direntry.copy_from_slice(&h[..DIRENTRY_LEN]);
        if direntry_valid(&direntry, size - 64, GcnSaveType::Gci) {
            return GcnSaveType::Gci as i32;
        }
    }
    -1
}

/// GameCube memory-card save file.
pub struct GameCubeSave {
    stream: Rc<dyn ReadAt>,
    valid: bool,
    save_type: GcnSaveType,
    /// Directory entry, normalised to big-endian layout.
    direntry: [u8; DIRENTRY_LEN],
    fields: Option<RomFields>,
    metadata: Option<RomMetaData>,
    banner: Option<Option<DecodedImage>>,
    icon_anim: Option<Option<IconAnimation>>,
}

impl GameCubeSave {
    pub fn new(stream: Rc<dyn ReadAt>) -> Self {
        Self::with_type_hint(stream, None)
    }

    /// Construct with the subtype already known from detection.
    pub fn with_type_hint(stream: Rc<dyn ReadAt>, hint: Option<GcnSaveType>) -> Self {
        let size = stream.size();
        let save_type = hint.unwrap_or_else(|| {
            let mut magic = [0u8; 16];
            match stream.read_at(0, &mut magic) {
                Ok(16) if magic.starts_with(b"GCSAVE\0") => GcnSaveType::Gcs,
                Ok(16) if magic.starts_with(b"DATELGC_SAVE\0\0\0\0") => GcnSaveType::Sav,
                _ => GcnSaveType::Gci,
            }
        });

        let mut direntry = [0u8; DIRENTRY_LEN];
        let mut valid = false;
        let data_size = size.saturating_sub(save_type.data_offset());
        if data_size > 0 {
            if let Ok(DIRENTRY_LEN) = stream.read_at(save_type.direntry_offset(), &mut direntry) {
                if save_type == GcnSaveType::Sav {
                    normalize_sav_direntry(&mut direntry);
                }
                valid = direntry_valid(&direntry, data_size, save_type);
                if !valid {
                    debug!("GameCube direntry failed validation");
                }
            }
        }

        Self {
            stream,
            valid,
            save_type,
            direntry,
            fields: None,
            metadata: None,
            banner: None,
            icon_anim: None,
        }
    }

    pub fn save_type(&self) -> GcnSaveType {
        self.save_type
    }

    fn id6(&self) -> String {
        text::read_ascii(&self.direntry[0..6])
    }

    fn region_byte(&self) -> u8 {
        self.direntry[3]
    }

    /// Comment fields use CP1252 for western regions, Shift-JIS otherwise.
    fn is_western_region(&self) -> bool {
        matches!(
            self.region_byte(),
            b'E' | b'P' | b'X' | b'Y' | b'L' | b'M' | b'D' | b'F' | b'H' | b'I' | b'R' | b'S'
                | b'U'
        )
    }

    fn decode_text(&self, raw: &[u8]) -> String {
        let trimmed: &[u8] = match raw.iter().position(|&b| b == 0) {
            Some(p) => &raw[..p],
            None => raw,
        };
        let s = if self.is_western_region() {
            text::cp1252(trimmed)
        } else {
            text::sjis_or_ascii(trimmed)
        };
        s.trim_end_matches('\r').to_string()
    }

    fn bannerfmt(&self) -> u8 {
        self.direntry[0x07]
    }

    fn iconaddr(&self) -> u32 {
        read_u32_be(&self.direntry, 0x2C)
    }

    fn commentaddr(&self) -> u32 {
        read_u32_be(&self.direntry, 0x3C)
    }

    /// `lastmodified` is seconds since the GameCube epoch (2000-01-01).
    fn last_modified_unix(&self) -> i64 {
        read_u32_be(&self.direntry, 0x28) as i64 + GC_EPOCH_OFFSET
    }

    /// Banner pixel data size, 0 when absent.
    fn banner_size(&self) -> u32 {
        match self.bannerfmt() & 0x03 {
            1 => (BANNER_W as u32 * BANNER_H as u32) + 512, // CI8 + palette
            2 => BANNER_W as u32 * BANNER_H as u32 * 2,     // RGB5A3
            _ => 0,
        }
    }

    /// Game description + file description, joined with a newline.
    fn comment(&self) -> Option<String> {
        let commentaddr = self.commentaddr();
        if commentaddr == 0xFFFF_FFFF {
            return None;
        }
        let mut buf = [0u8; 64];
        match self
            .stream
            .read_at(self.save_type.data_offset() + commentaddr as u64, &mut buf)
        {
            Ok(64) => {}
            _ => return None,
        }
        let game_desc = self.decode_text(&buf[0..32]);
        let file_desc = self.decode_text(&buf[32..64]);
        Some(match (game_desc.is_empty(), file_desc.is_empty()) {
            (false, false) => format!("{game_desc}\n{file_desc}"),
            (false, true) => game_desc,
            (true, false) => file_desc,
            (true, true) => return None,
        })
    }

    fn load_banner(&self) -> Option<DecodedImage> {
        let iconaddr = self.iconaddr();
        if iconaddr == 0xFFFF_FFFF {
            return None;
        }
        let addr = self.save_type.data_offset() + iconaddr as u64;
        match self.bannerfmt() & 0x03 {
            1 => {
                let npx = BANNER_W as usize * BANNER_H as usize;
                let mut data = vec![0u8; npx + 512];
                match self.stream.read_at(addr, &mut data) {
                    Ok(n) if n == data.len() => {}
                    _ => return None,
                }
                let palette = pixel::palette_rgb5a3_be(&data[npx..]);
                pixel::from_gcn_ci8_tiled(BANNER_W, BANNER_H, &data[..npx], &palette).ok()
            }
            2 => {
                let mut data = vec![0u8; BANNER_W as usize * BANNER_H as usize * 2];
                match self.stream.read_at(addr, &mut data) {
                    Ok(n) if n == data.len() => {}
                    _ => return None,
                }
                pixel::from_gcn_rgb5a3_tiled(BANNER_W, BANNER_H, &data).ok()
            }
            _ => None,
        }
    }

    /// Per-frame format codes, LSB-first, terminated by a speed of 0.
    fn frame_formats(&self) -> Vec<(u8, u8)> {
        let mut iconfmt = read_u16_be(&self.direntry, 0x30);
        let mut iconspeed = read_u16_be(&self.direntry, 0x32);
        let mut frames = Vec::new();
        for _ in 0..MAX_ICONS {
            let speed = (iconspeed & 0x03) as u8;
            if speed == 0 {
                break;
            }
            frames.push(((iconfmt & 0x03) as u8, speed));
            iconfmt >>= 2;
            iconspeed >>= 2;
        }
        frames
    }

    fn load_icons(&self) -> Option<IconAnimation> {
        let iconaddr = self.iconaddr();
        if iconaddr == 0xFFFF_FFFF {
            return None;
        }
        let frames = self.frame_formats();
        if frames.is_empty() {
            return None;
        }

        // Total size: RGB5A3 = 2 KiB; CI8 unique = 1 KiB + its own
        // palette; CI8 shared = 1 KiB each plus one palette after all
        // icons.
        let npx = ICON_W as usize * ICON_H as usize;
        let mut total = 0usize;
        let mut has_shared = false;
        for &(fmt, _) in &frames {
            match fmt {
                2 => total += npx * 2,
                1 => total += npx + 512,
                3 => {
                    total += npx;
                    has_shared = true;
                }
                _ => {}
            }
        }
        if has_shared {
            total += 512;
        }

        let addr = self.save_type.data_offset() + iconaddr as u64 + self.banner_size() as u64;
        let mut data = vec![0u8; total];
        match self.stream.read_at(addr, &mut data) {
            Ok(n) if n == total => {}
            _ => return None,
        }

        let shared_palette = if has_shared {
            Some(pixel::palette_rgb5a3_be(&data[total - 512..]))
        } else {
            None
        };

        let is_pal = self.region_byte() == b'P';
        let denom: u16 = if is_pal { 50 } else { 60 };

        let mut anim = IconAnimation::default();
        let mut pos = 0usize;
        for (i, &(fmt, speed)) in frames.iter().enumerate() {
            let img = match fmt {
                2 => {
                    let img = pixel::from_gcn_rgb5a3_tiled(ICON_W, ICON_H, &data[pos..pos + npx * 2]);
                    pos += npx * 2;
                    img.ok()?
                }
                1 => {
                    let bitmap = &data[pos..pos + npx];
                    let palette = pixel::palette_rgb5a3_be(&data[pos + npx..pos + npx + 512]);
                    let img = pixel::from_gcn_ci8_tiled(ICON_W, ICON_H, bitmap, &palette);
                    pos += npx + 512;
                    img.ok()?
                }
                3 => {
                    let bitmap = &data[pos..pos + npx];
                    pos += npx;
                    let palette = shared_palette.as_ref()?;
                    pixel::from_gcn_ci8_tiled(ICON_W, ICON_H, bitmap, palette).ok()?
                }
                _ => {
                    // "None" frame: keep the slot but repeat the
                    // previous image if there is one.
                    match anim.frames.last() {
                        Some(prev) => prev.clone(),
                        None => continue,
                    }
                }
            };
            anim.frames.push(img);

            // Delay: {4,8,12}/N ticks; the first frame shows one extra
            // tick, the last one fewer.
            let base = speed as u32 * 4;
            let is_last = i + 1 == frames.len();
            let numer = if i == 0 {
                base + 1
            } else if is_last {
                base.saturating_sub(1)
            } else {
                base
            } as u16;
            anim.seq.push((anim.frames.len() - 1) as u8);
            anim.delays.push(FrameDelay {
                numer,
                denom,
                ms: (numer as u32 * 1000 / denom as u32) as u16,
            });
        }

        if anim.frames.is_empty() {
            return None;
        }

        // Bounce mode plays 0..k then back down to 1.
        if self.bannerfmt() & 0x04 != 0 && anim.frames.len() > 2 {
            let n = anim.seq.len();
            for i in (1..n - 1).rev() {
                let frame = anim.seq[i];
                let delay = anim.delays[i];
                if anim.seq.len() >= rom_peek_core::image::ICON_SEQ_MAX {
                    break;
                }
                anim.seq.push(frame);
                anim.delays.push(delay);
            }
        }

        Some(anim)
    }

    fn build_fields(&self) -> RomFields {
        let mut f = RomFields::new();
        if !self.valid {
            return f;
        }

        f.add_text("Game ID", self.id6());
        let company = text::read_ascii(&self.direntry[4..6]);
        if let Some(publisher) = maker_code_name(&company) {
            f.add_text("Publisher", publisher);
        }
        f.add_text_flags(
            "Filename",
            self.decode_text(&self.direntry[0x08..0x28]),
            FieldFlags::TRIM_END,
        );
        f.add_datetime("Last Modified", self.last_modified_unix());

        let permission = self.direntry[0x34];
        f.add_bitfield(
            "Permission",
            ((permission >> 2) & 0x07) as u32,
            vec!["No Copy", "No Move", "Public"],
        );
        f.add_numeric("Copy Count", self.direntry[0x35] as u64);
        f.add_numeric("Blocks", read_u16_be(&self.direntry, 0x38) as u64);

        if let Some(comment) = self.comment() {
            f.add_text("Description", comment);
        }
        f
    }

    fn build_metadata(&self) -> RomMetaData {
        let mut m = RomMetaData::new();
        if !self.valid {
            return m;
        }
        if let Some(comment) = self.comment() {
            let first_line = comment.lines().next().unwrap_or_default();
            if !first_line.is_empty() {
                m.add_text(Property::Title, first_line);
            }
        }
        let company = text::read_ascii(&self.direntry[4..6]);
        if let Some(publisher) = maker_code_name(&company) {
            m.add_text(Property::Publisher, publisher);
        }
        m.add_timestamp(Property::CreationDate, self.last_modified_unix());
        m
    }
}

impl RomData for GameCubeSave {
    fn is_valid(&self) -> bool {
        self.valid
    }

    fn file_type(&self) -> FileType {
        FileType::SaveFile
    }

    fn system_name(&self) -> &'static str {
        "Nintendo GameCube"
    }

    fn mime_type(&self) -> &'static str {
        "application/x-gamecube-save"
    }

    fn supported_image_types(&self) -> ImageTypes {
        let mut types = ImageTypes::empty();
        if !self.valid {
            return types;
        }
        if self.iconaddr() != 0xFFFF_FFFF {
            if !self.frame_formats().is_empty() {
                types |= ImageTypes::ICON;
            }
            if self.bannerfmt() & 0x03 != 0 {
                types |= ImageTypes::BANNER;
            }
        }
        types
    }

    fn supported_image_sizes(&self, kind: ImageType) -> Vec<(u16, u16)> {
        match kind {
            ImageType::Icon => vec![(ICON_W, ICON_H)],
            ImageType::Banner => vec![(BANNER_W, BANNER_H)],
            _ => Vec::new(),
        }
    }

    fn imgpf(&self, kind: ImageType) -> ImgProcFlags {
        match kind {
            ImageType::Icon => ImgProcFlags::RESCALE_NEAREST,
            ImageType::Banner => ImgProcFlags::RESCALE_ASPECT | ImgProcFlags::RESCALE_NEAREST,
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
        if !self.valid {
            return None;
        }
        match kind {
            ImageType::Banner => {
                if self.banner.is_none() {
                    self.banner = Some(self.load_banner());
                }
                self.banner.as_ref()?.as_ref()
            }
            ImageType::Icon => {
                if self.icon_anim.is_none() {
                    self.icon_anim = Some(self.load_icons());
                }
                self.icon_anim.as_ref()?.as_ref().map(|a| &a.frames[0])
            }
            _ => None,
        }
    }

    fn icon_animation(&mut self) -> Option<&IconAnimation> {
        if !self.valid {
            return None;
        }
        if self.icon_anim.is_none() {
            self.icon_anim = Some(self.load_icons());
        }
        self.icon_anim.as_ref()?.as_ref()
    }
}

#[cfg(test)]
#[path = "tests/gcn_save_tests.rs"]
mod tests;
