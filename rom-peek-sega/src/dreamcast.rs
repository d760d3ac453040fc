//! Dreamcast VMU save parser (.vms, .vmi, .dci, and .vms+.vmi pairs).
//!
//! Container quirks:
//! - VMS: the raw save payload. The 96-byte file header sits at block
//!   0 for data files and block 1 (offset 512) for game files.
//! - VMI: a 108-byte download-metadata sidecar. Standalone it yields a
//!   synthetic directory entry; next to its VMS it provides the real
//!   one.
//! - DCI: a 32-byte directory entry followed by the VMS payload with
//!   every 32-bit word byteswapped.
//!
//! ICONDATA_VMS is a special icon-only file with its own 24-byte
//! header carrying a monochrome and an optional colour icon.

use std::path::{Path, PathBuf};
use std::rc::Rc;

use chrono::NaiveDate;
use log::debug;

use rom_peek_core::byteorder::{bcd_to_u8, read_u16_le, read_u32_le, swap32_words};
use rom_peek_core::pixel;
use rom_peek_core::{
    DecodedImage, DetectInfo, FieldFlags, FileType, FrameDelay, IconAnimation, ImageType,
    ImageTypes, ImgProcFlags, Property, ReadAt, RomData, RomFields, RomMetaData, StreamReader,
    text,
};

const VMS_HEADER_LEN: usize = 96;
const VMI_LEN: u64 = 108;
const DIRENTRY_LEN: usize = 32;
const ICONDATA_HEADER_LEN: usize = 24;
const BLOCK: u64 = 512;

const ICON_DIM: u16 = 32;
const EYECATCH_W: u16 = 72;
const EYECATCH_H: u16 = 56;

/// Monochrome ICONDATA palette: VMU-screen green background, blue ink.
const ICONDATA_MONO_PALETTE: [u32; 2] = [0xFF8CCEAD, 0xFF081884];

/// Container format. The discriminant is the detection subtype id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DcSaveType {
    Vms = 0,
    Vmi = 1,
    Dci = 2,
}

fn vms_size_valid(size: u64) -> bool {
    size > 0 && (size % BLOCK == 0 || size == 160)
}

/// Registry hook. Detection is by (file size, extension).
pub fn is_supported(info: &DetectInfo) -> i32 {
    match info.ext_hint {
        Some(".vmi") if info.file_size == VMI_LEN => return DcSaveType::Vmi as i32,
        Some(".vms") if vms_size_valid(info.file_size) => return DcSaveType::Vms as i32,
        Some(".dci") => {
            if info.file_size > DIRENTRY_LEN as u64
                && vms_size_valid(info.file_size - DIRENTRY_LEN as u64)
                && !info.header.is_empty()
                && matches!(info.header[0], 0x00 | 0x33 | 0xCC)
            {
                return DcSaveType::Dci as i32;
            }
        }
        _ => {}
    }
    -1
}

/// Parsed VMU directory entry.
#[derive(Debug, Clone)]
struct DirEntry {
    filetype: u8,
    protect: u8,
    address: u16,
    filename: String,
    /// BCD timestamp converted to Unix seconds; -1 when invalid.
    ctime: i64,
    size_blocks: u16,
    header_addr: u16,
}

impl DirEntry {
    fn parse(raw: &[u8]) -> Self {
        Self {
            filetype: raw[0],
            protect: raw[1],
            address: read_u16_le(raw, 2),
            filename: text::read_ascii_fixed(&raw[4..16]),
            ctime: bcd_timestamp(&raw[16..24]),
            size_blocks: read_u16_le(raw, 24),
            header_addr: read_u16_le(raw, 26),
        }
    }

    fn is_game(&self) -> bool {
        self.filetype == 0xCC
    }
}

/// 8-byte BCD timestamp: century, year, month, day, hour, minute,
/// second, weekday.
fn bcd_timestamp(raw: &[u8]) -> i64 {
    let decode = || -> Option<i64> {
        let century = bcd_to_u8(raw[0])? as i32;
        let year = bcd_to_u8(raw[1])? as i32;
        let month = bcd_to_u8(raw[2])? as u32;
        let day = bcd_to_u8(raw[3])? as u32;
        let hour = bcd_to_u8(raw[4])? as u32;
        let minute = bcd_to_u8(raw[5])? as u32;
        let second = bcd_to_u8(raw[6])? as u32;
        let date = NaiveDate::from_ymd_opt(century * 100 + year, month, day)?;
        Some(date.and_hms_opt(hour, minute, second)?.and_utc().timestamp())
    };
    decode().unwrap_or(-1)
}

/// VMI binary timestamp: little-endian year, then month, day, hour,
/// minute, second bytes.
fn vmi_timestamp(raw: &[u8]) -> i64 {
    let decode = || -> Option<i64> {
        let year = read_u16_le(raw, 0) as i32;
        let date = NaiveDate::from_ymd_opt(year, raw[2] as u32, raw[3] as u32)?;
        Some(
            date.and_hms_opt(raw[4] as u32, raw[5] as u32, raw[6] as u32)?
                .and_utc()
                .timestamp(),
        )
    };
    decode().unwrap_or(-1)
}

/// Parsed VMI sidecar.
#[derive(Debug, Clone)]
struct VmiHeader {
    /// AND of the first 4 VMS-resource-name bytes with "SEGA".
    checksum: u32,
    description: String,
    copyright: String,
    ctime: i64,
    mode: u16,
    vms_filename: String,
    filesize: u32,
}

impl VmiHeader {
    fn parse(raw: &[u8]) -> Self {
        Self {
            checksum: read_u32_le(raw, 0),
            description: text::read_ascii_fixed(&raw[4..36]),
            copyright: text::read_ascii_fixed(&raw[36..68]),
            ctime: vmi_timestamp(&raw[68..76]),
            mode: read_u16_le(raw, 100),
            vms_filename: text::read_ascii_fixed(&raw[88..100]),
            filesize: read_u32_le(raw, 104),
        }
    }

    /// Synthetic directory entry for a standalone VMI, mirroring what
    /// the VMU would write on download.
    fn synthesize_dirent(&self) -> DirEntry {
        let blocks = self.filesize.div_ceil(BLOCK as u32) as u16;
        let is_game = self.mode & 0x02 != 0;
        DirEntry {
            filetype: if is_game { 0xCC } else { 0x33 },
            protect: if self.mode & 0x01 != 0 { 0xFF } else { 0x00 },
            // Fake start block: count down from the top of a 200-block
            // card.
            address: 200u16.saturating_sub(blocks),
            filename: self.vms_filename.clone(),
            ctime: self.ctime,
            size_blocks: blocks,
            header_addr: if is_game { 1 } else { 0 },
        }
    }
}

/// Description field validation: the first 8 bytes must be free of
/// control characters; the rest may contain NULs but nothing else
/// below 0x20.
fn description_valid(desc: &[u8], strict_len: usize) -> bool {
    desc.iter()
        .enumerate()
        .all(|(i, &b)| b >= 0x20 || (i >= strict_len && b == 0))
}

/// ICONDATA heuristic on a headerless VMS: the bytes where a normal
/// save keeps the DC description instead hold the mono-icon offset, a
/// small little-endian u32.
fn looks_like_icondata(vms_header: &[u8]) -> bool {
    vms_header[16] >= 96 && vms_header[17] == 0 && vms_header[18] == 0 && vms_header[19] == 0
}

/// Dreamcast VMU save file.
pub struct DreamcastSave {
    /// VMS payload view (already word-swapped for DCI).
    vms: Option<Rc<dyn ReadAt>>,
    valid: bool,
    save_type: DcSaveType,
    header_offset: u64,
    vms_header: Option<[u8; VMS_HEADER_LEN]>,
    icondata: Option<[u8; ICONDATA_HEADER_LEN]>,
    dirent: Option<DirEntry>,
    vmi: Option<VmiHeader>,
    fields: Option<RomFields>,
    metadata: Option<RomMetaData>,
    icon_anim: Option<Option<IconAnimation>>,
    eyecatch: Option<Option<DecodedImage>>,
}

impl DreamcastSave {
    /// Open a standalone file of the given detected subtype.
    pub fn new(stream: Rc<dyn ReadAt>, save_type: DcSaveType) -> Self {
        match save_type {
            DcSaveType::Vms => Self::from_vms(stream, None),
            DcSaveType::Dci => Self::from_dci(stream),
            DcSaveType::Vmi => Self::from_vmi_only(stream),
        }
    }

    /// Open a .vms/.vmi pair: the VMI provides the directory entry,
    /// the VMS the payload.
    pub fn new_pair(vms: Rc<dyn ReadAt>, vmi: Rc<dyn ReadAt>) -> Self {
        let mut raw = [0u8; VMI_LEN as usize];
        match vmi.read_at(0, &mut raw) {
            Ok(n) if n == raw.len() => {
                let vmi_header = VmiHeader::parse(&raw);
                let mut save = Self::from_vms(vms, Some(vmi_header.synthesize_dirent()));
                save.vmi = Some(vmi_header);
                save
            }
            _ => Self::invalid(DcSaveType::Vmi),
        }
    }

    /// Attempt the paired-file opener for a path ending in .vms or
    /// .vmi. Tries the sibling extension in both cases on
    /// case-sensitive filesystems.
    pub fn open_pair(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?;
        let sibling_exts: &[&str] = match ext.to_ascii_lowercase().as_str() {
            "vms" => &["vmi", "VMI"],
            "vmi" => &["vms", "VMS"],
            _ => return None,
        };
        let mut sibling: Option<PathBuf> = None;
        for other in sibling_exts {
            let candidate = path.with_extension(other);
            if candidate.exists() {
                sibling = Some(candidate);
                break;
            }
        }
        let sibling = sibling?;
        let (vms_path, vmi_path) = if ext.eq_ignore_ascii_case("vms") {
            (path.to_path_buf(), sibling)
        } else {
            (sibling, path.to_path_buf())
        };
        let vms = StreamReader::open(&vms_path).ok()?;
        let vmi = StreamReader::open(&vmi_path).ok()?;
        let save = Self::new_pair(vms, vmi);
        if save.is_valid() { Some(save) } else { None }
    }

    fn invalid(save_type: DcSaveType) -> Self {
        Self {
            vms: None,
            valid: false,
            save_type,
            header_offset: 0,
            vms_header: None,
            icondata: None,
            dirent: None,
            vmi: None,
            fields: None,
            metadata: None,
            icon_anim: None,
            eyecatch: None,
        }
    }

    fn from_vms(stream: Rc<dyn ReadAt>, dirent: Option<DirEntry>) -> Self {
        let mut save = Self::invalid(DcSaveType::Vms);

        // With a directory entry the header block is known; keep the
        // offset-0/offset-512 probes as a fallback since downloadable
        // game files don't always match their on-card layout.
        let mut candidates: Vec<u64> = match &dirent {
            Some(d) => vec![d.header_addr as u64 * BLOCK],
            None => Vec::new(),
        };
        for fallback in [0, BLOCK] {
            if !candidates.contains(&fallback) {
                candidates.push(fallback);
            }
        }

        for offset in candidates {
            let mut header = [0u8; VMS_HEADER_LEN];
            match stream.read_at(offset, &mut header) {
                Ok(n) if n == VMS_HEADER_LEN => {}
                _ => continue,
            }
            if !description_valid(&header[0..16], 8) {
                continue;
            }
            if looks_like_icondata(&header) {
                let mut icondata = [0u8; ICONDATA_HEADER_LEN];
                icondata.copy_from_slice(&header[..ICONDATA_HEADER_LEN]);
                save.icondata = Some(icondata);
                save.header_offset = offset;
                save.valid = true;
                break;
            }
            if !description_valid(&header[16..48], 0) {
                continue;
            }
            save.vms_header = Some(header);
            save.header_offset = offset;
            save.valid = true;
            break;
        }

        if !save.valid {
            debug!("no valid VMS header at any candidate offset");
        }
        save.vms = Some(stream);
        save.dirent = dirent;
        save
    }

    fn from_dci(stream: Rc<dyn ReadAt>) -> Self {
        let size = stream.size() as usize;
        let mut raw = vec![0u8; size];
        match stream.read_at(0, &mut raw) {
            Ok(n) if n == size => {}
            _ => return Self::invalid(DcSaveType::Dci),
        }
        let dirent = DirEntry::parse(&raw[..DIRENTRY_LEN]);
        // The VMS payload is stored with each 32-bit word byteswapped.
        let mut vms_data = raw.split_off(DIRENTRY_LEN);
        swap32_words(&mut vms_data);

        let mut save = Self::from_vms(StreamReader::from_vec(vms_data), Some(dirent));
        save.save_type = DcSaveType::Dci;
        save
    }

    fn from_vmi_only(stream: Rc<dyn ReadAt>) -> Self {
        let mut raw = [0u8; VMI_LEN as usize];
        match stream.read_at(0, &mut raw) {
            Ok(n) if n == raw.len() => {}
            _ => return Self::invalid(DcSaveType::Vmi),
        }
        let vmi = VmiHeader::parse(&raw);
        let mut save = Self::invalid(DcSaveType::Vmi);
        save.dirent = Some(vmi.synthesize_dirent());
        save.vmi = Some(vmi);
        save.valid = true;
        save
    }

    pub fn save_type(&self) -> DcSaveType {
        self.save_type
    }

    fn is_icondata(&self) -> bool {
        self.icondata.is_some()
    }

    fn icon_count(&self) -> u16 {
        match &self.vms_header {
            // More than 3 frames would overlap the eyecatch data.
            Some(h) => read_u16_le(h, 64).min(3),
            None => 0,
        }
    }

    fn eyecatch_type(&self) -> u16 {
        match &self.vms_header {
            Some(h) => read_u16_le(h, 68),
            None => 0,
        }
    }

    fn load_icons(&self) -> Option<IconAnimation> {
        if let Some(icondata) = &self.icondata {
            return self.load_icondata_icon(icondata);
        }
        let vms = self.vms.as_ref()?;
        let count = self.icon_count();
        if count == 0 {
            return None;
        }
        let anim_speed = self
            .vms_header
            .as_ref()
            .map(|h| read_u16_le(h, 66))
            .unwrap_or(0);

        let palette_offset = self.header_offset + VMS_HEADER_LEN as u64;
        let mut palette_raw = [0u8; 32];
        match vms.read_at(palette_offset, &mut palette_raw) {
            Ok(32) => {}
            _ => return None,
        }
        let palette = pixel::palette_argb4444_le(&palette_raw);

        let mut anim = IconAnimation::default();
        for i in 0..count {
            let mut bitmap = [0u8; 512];
            let offset = palette_offset + 32 + i as u64 * 512;
            match vms.read_at(offset, &mut bitmap) {
                Ok(512) => {}
                _ => break,
            }
            let frame = pixel::from_linear_ci4(ICON_DIM, ICON_DIM, &bitmap, &palette).ok()?;
            anim.frames.push(frame);
            anim.seq.push(i as u8);
            // icon_anim_speed is in 1/30-second units.
            anim.delays.push(FrameDelay {
                numer: anim_speed,
                denom: 30,
                ms: (anim_speed as u32 * 1000 / 30) as u16,
            });
        }
        if anim.frames.is_empty() {
            None
        } else {
            Some(anim)
        }
    }

    fn load_icondata_icon(&self, icondata: &[u8; ICONDATA_HEADER_LEN]) -> Option<IconAnimation> {
        let vms = self.vms.as_ref()?;
        let mono_addr = read_u32_le(icondata, 16) as u64;
        let color_addr = read_u32_le(icondata, 20) as u64;

        let frame = if color_addr >= ICONDATA_HEADER_LEN as u64 {
            let mut palette_raw = [0u8; 32];
            let mut bitmap = [0u8; 512];
            let base = self.header_offset + color_addr;
            match (
                vms.read_at(base, &mut palette_raw),
                vms.read_at(base + 32, &mut bitmap),
            ) {
                (Ok(32), Ok(512)) => {
                    let palette = pixel::palette_argb4444_le(&palette_raw);
                    pixel::from_linear_ci4(ICON_DIM, ICON_DIM, &bitmap, &palette).ok()?
                }
                _ => return None,
            }
        } else {
            let mut bitmap = [0u8; 128];
            match vms.read_at(self.header_offset + mono_addr, &mut bitmap) {
                Ok(128) => {}
                _ => return None,
            }
            pixel::from_linear_mono(ICON_DIM, ICON_DIM, &bitmap, ICONDATA_MONO_PALETTE).ok()?
        };

        Some(IconAnimation {
            frames: vec![frame],
            seq: vec![0],
            delays: vec![FrameDelay {
                numer: 0,
                denom: 30,
                ms: 0,
            }],
        })
    }

    /// The eyecatch banner, fixed at 72x56 pixels in one of three
    /// pixel formats.
    fn load_eyecatch(&self) -> Option<DecodedImage> {
        let vms = self.vms.as_ref()?;
        let npx = EYECATCH_W as usize * EYECATCH_H as usize;
        let offset =
            self.header_offset + VMS_HEADER_LEN as u64 + 32 + self.icon_count() as u64 * 512;
        match self.eyecatch_type() {
            1 => {
                let mut data = vec![0u8; npx * 2];
                match vms.read_at(offset, &mut data) {
                    Ok(n) if n == data.len() => {}
                    _ => return None,
                }
                pixel::from_linear_argb4444(EYECATCH_W, EYECATCH_H, &data).ok()
            }
            2 => {
                let mut data = vec![0u8; 512 + npx];
                match vms.read_at(offset, &mut data) {
                    Ok(n) if n == data.len() => {}
                    _ => return None,
                }
                let palette = pixel::palette_argb4444_le(&data[..512]);
                pixel::from_linear_ci8(EYECATCH_W, EYECATCH_H, &data[512..], &palette).ok()
            }
            3 => {
                let mut data = vec![0u8; 32 + npx / 2];
                match vms.read_at(offset, &mut data) {
                    Ok(n) if n == data.len() => {}
                    _ => return None,
                }
                let palette = pixel::palette_argb4444_le(&data[..32]);
                pixel::from_linear_ci4(EYECATCH_W, EYECATCH_H, &data[32..], &palette).ok()
            }
            _ => None,
        }
    }

    fn build_fields(&self) -> RomFields {
        let mut f = RomFields::new();
        if !self.valid {
            return f;
        }

        if let Some(header) = &self.vms_header {
            f.add_text_flags(
                "VMS Description",
                text::read_ascii_fixed(&header[0..16]),
                FieldFlags::TRIM_END,
            );
            f.add_text_flags(
                "DC Description",
                text::read_ascii_fixed(&header[16..48]),
                FieldFlags::TRIM_END,
            );
            let application = text::read_ascii_fixed(&header[48..64]);
            if !application.is_empty() {
                f.add_text("Application", application);
            }
            f.add_numeric("Icon Count", self.icon_count() as u64);
            let eyecatch = match self.eyecatch_type() {
                0 => "None",
                1 => "ARGB4444",
                2 => "8-bit indexed",
                3 => "4-bit indexed",
                _ => "Invalid",
            };
            f.add_text("Eyecatch Type", eyecatch);
            f.add_hex("CRC", read_u16_le(header, 70) as u64, 4);
            f.add_numeric("Data Size", read_u32_le(header, 72) as u64);
        }

        if self.is_icondata() {
            f.add_text("File Type", "Icon Data");
        }

        if let Some(dirent) = &self.dirent {
            if !dirent.filename.is_empty() {
                f.add_text_flags("Filename", dirent.filename.clone(), FieldFlags::MONOSPACE);
            }
            f.add_text(
                "VMU File Type",
                if dirent.is_game() { "Game" } else { "Data" },
            );
            f.add_text(
                "Copy Protect",
                if dirent.protect == 0xFF {
                    "Protected"
                } else {
                    "Copyable"
                },
            );
            f.add_numeric("Blocks", dirent.size_blocks as u64);
            f.add_numeric("Start Block", dirent.address as u64);
            f.add_datetime("Created", dirent.ctime);
        }

        if let Some(vmi) = &self.vmi {
            f.add_tab("VMI");
            f.add_hex("Checksum", vmi.checksum as u64, 8);
            f.add_text_flags("Description", vmi.description.clone(), FieldFlags::TRIM_END);
            f.add_text_flags("Copyright", vmi.copyright.clone(), FieldFlags::TRIM_END);
            f.add_datetime("Created", vmi.ctime);
            f.add_bitfield("Mode", (vmi.mode & 0x03) as u32, vec!["Copy Protect", "Game"]);
            f.add_numeric("File Size", vmi.filesize as u64);
        }

        f
    }

    fn build_metadata(&self) -> RomMetaData {
        let mut m = RomMetaData::new();
        if !self.valid {
            return m;
        }
        let title = match (&self.vms_header, &self.vmi) {
            (Some(h), _) => text::read_ascii_fixed(&h[16..48]),
            (None, Some(vmi)) => vmi.description.clone(),
            _ => String::new(),
        };
        if !title.is_empty() {
            m.add_text(Property::Title, title);
        }
        let ctime = match (&self.dirent, &self.vmi) {
            (Some(d), _) => d.ctime,
            (None, Some(v)) => v.ctime,
            _ => -1,
        };
        if ctime != -1 {
            m.add_timestamp(Property::CreationDate, ctime);
        }
        m
    }
}

impl RomData for DreamcastSave {
    fn is_valid(&self) -> bool {
        self.valid
    }

    fn file_type(&self) -> FileType {
        if self.is_icondata() {
            FileType::IconFile
        } else {
            FileType::SaveFile
        }
    }

    fn system_name(&self) -> &'static str {
        "Sega Dreamcast"
    }

    fn mime_type(&self) -> &'static str {
        match self.save_type {
            DcSaveType::Vms => "application/x-dreamcast-vms",
            DcSaveType::Vmi => "application/x-dreamcast-vms-info",
            DcSaveType::Dci => "application/x-dreamcast-dci",
        }
    }

    fn supported_image_types(&self) -> ImageTypes {
        let mut types = ImageTypes::empty();
        if !self.valid {
            return types;
        }
        if self.is_icondata() || self.icon_count() > 0 {
            types |= ImageTypes::ICON;
        }
        if self.eyecatch_type() >= 1 && self.eyecatch_type() <= 3 {
            types |= ImageTypes::BANNER;
        }
        types
    }

    fn supported_image_sizes(&self, kind: ImageType) -> Vec<(u16, u16)> {
        match kind {
            ImageType::Icon => vec![(ICON_DIM, ICON_DIM)],
            ImageType::Banner => vec![(EYECATCH_W, EYECATCH_H)],
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
            ImageType::Icon => {
                if self.icon_anim.is_none() {
                    self.icon_anim = Some(self.load_icons());
                }
                self.icon_anim.as_ref()?.as_ref().map(|a| &a.frames[0])
            }
            ImageType::Banner => {
                if self.eyecatch.is_none() {
                    self.eyecatch = Some(self.load_eyecatch());
                }
                self.eyecatch.as_ref()?.as_ref()
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
#[path = "tests/dreamcast_tests.rs"]
mod tests;
