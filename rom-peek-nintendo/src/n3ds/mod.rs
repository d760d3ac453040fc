//! Nintendo 3DS family parser.
//!
//! Handles five container formats: 3DSX homebrew, CIA installable
//! archives, NCSD card images (CCI) and eMMC dumps, and bare NCCH
//! partitions. The container layer resolves a primary NCCH (partition
//! 0 for CCI, the TMD boot content for CIA, the file itself for NCCH),
//! reads the SMDH out of it, and presents everything as nested tabs.
//!
//! DSiWare CIAs carry a DS SRL instead of an NCCH and are delegated to
//! the DS reader.

pub mod cia;
pub mod keys;
pub mod ncch;
pub mod smdh;
pub mod srl;

use std::rc::Rc;

use log::debug;

use crate::licensee::maker_code_name;
use cia::{CiaHeader, CiaReader, HashStatus, Tmd, Ticket, align64, verify_content_hash};
use keys::{KeyManager, VerifyResult};
use ncch::NcchReader;
use smdh::{Smdh, SMDH_SIZE};
use srl::NdsSrl;

use rom_peek_core::byteorder::{read_u16_le, read_u32_le, read_u64_le};
use rom_peek_core::{
    DecodedImage, DetectInfo, ExtUrl, FieldFlags, FileType, IconAnimation, ImageType, ImageTypes,
    ImgProcFlags, ListData, Property, ReadAt, RomData, RomFields, RomMetaData, SubStream,
};

/// Media unit: 512 bytes.
const MEDIA_UNIT_SHIFT: u8 = 9;

const GAMETDB_BASE: &str = "https://art.gametdb.com";

/// Container format. The discriminant is the detection subtype id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum N3dsFormat {
    ThreeDsx = 0,
    Cia = 1,
    Cci = 2,
    Emmc = 3,
    Ncch = 4,
}

impl N3dsFormat {
    fn name(self) -> &'static str {
        match self {
            Self::ThreeDsx => "3DSX (homebrew)",
            Self::Cia => "CIA",
            Self::Cci => "CCI (game card image)",
            Self::Emmc => "eMMC dump",
            Self::Ncch => "NCCH",
        }
    }
}

/// eMMC images carry this crypt-type signature in the NCSD header;
/// game cards leave the field zeroed.
fn ncsd_is_emmc(crypt: &[u8]) -> bool {
    crypt.len() == 8
        && crypt[0] == 1
        && crypt[1] == 2
        && crypt[2] == 2
        && crypt[3] == 2
        && (crypt[4] == 2 || crypt[4] == 3)
        && crypt[5..8] == [0, 0, 0]
}

/// Registry hook.
pub fn is_supported(info: &DetectInfo) -> i32 {
    if info.header_offset != 0 || info.header.len() < 0x120 {
        return -1;
    }
    let h = info.header;

    if &h[0..4] == b"3DSX" {
        return N3dsFormat::ThreeDsx as i32;
    }
    if &h[0x100..0x104] == b"NCSD" {
        if ncsd_is_emmc(&h[0x118..0x120]) {
            return N3dsFormat::Emmc as i32;
        }
        return N3dsFormat::Cci as i32;
    }
    if &h[0x100..0x104] == b"NCCH" {
        return N3dsFormat::Ncch as i32;
    }
    if info.ext_hint == Some(".cia") && CiaHeader::parse(h).is_some() {
        return N3dsFormat::Cia as i32;
    }
    -1
}

/// Largest content the boot-content digest check will stream.
const HASH_CHECK_MAX: u64 = 16 << 20;

/// Parsed per-container state.
struct CiaState {
    header: CiaHeader,
    ticket: Option<Ticket>,
    tmd: Option<Tmd>,
    /// SHA-256 status of the boot content vs. its TMD digest.
    boot_hash: Option<HashStatus>,
}

/// Nintendo 3DS title container.
pub struct Nintendo3ds {
    stream: Rc<dyn ReadAt>,
    valid: bool,
    format: N3dsFormat,
    cia: Option<CiaState>,
    /// NCSD media id and partition table (offset, length in bytes).
    ncsd: Option<(u64, Vec<(u64, u64)>)>,
    /// Primary NCCH reader, when the container holds one.
    ncch: Option<Rc<NcchReader>>,
    /// DSiWare delegate.
    srl: Option<Box<NdsSrl>>,
    smdh: Option<Smdh>,
    fields: Option<RomFields>,
    metadata: Option<RomMetaData>,
}

impl Nintendo3ds {
    pub fn new(stream: Rc<dyn ReadAt>) -> Self {
        Self::with_key_manager(stream, KeyManager::instance())
    }

    /// Construct with an explicit key store (tests, hosts with their
    /// own key handling).
    pub fn with_key_manager(stream: Rc<dyn ReadAt>, key_manager: &KeyManager) -> Self {
        let mut parser = Self {
            stream,
            valid: false,
            format: N3dsFormat::Ncch,
            cia: None,
            ncsd: None,
            ncch: None,
            srl: None,
            smdh: None,
            fields: None,
            metadata: None,
        };

        let mut header = [0u8; 0x200];
        let n = match parser.stream.read_at(0, &mut header) {
            Ok(n) => n,
            Err(_) => return parser,
        };
        if n < 0x120 {
            return parser;
        }

        // CIA has no magic; when the stream has no filename hint the
        // structural header check decides.
        let ext = parser
            .stream
            .name_hint()
            .and_then(|name| name.rfind('.').map(|i| name[i..].to_ascii_lowercase()));
        let subtype = is_supported(&DetectInfo {
            header_offset: 0,
            header: &header[..n],
            ext_hint: ext.as_deref().or(Some(".cia")),
            file_size: parser.stream.size(),
        });
        if subtype < 0 {
            return parser;
        }
        parser.format = match subtype {
            0 => N3dsFormat::ThreeDsx,
            1 => N3dsFormat::Cia,
            2 => N3dsFormat::Cci,
            3 => N3dsFormat::Emmc,
            _ => N3dsFormat::Ncch,
        };
        parser.valid = true;

        match parser.format {
            N3dsFormat::Cia => parser.init_cia(key_manager),
            N3dsFormat::Cci | N3dsFormat::Emmc => parser.init_ncsd(&header, key_manager),
            N3dsFormat::Ncch => {
                let reader = Rc::new(NcchReader::new(
                    Rc::clone(&parser.stream),
                    0,
                    parser.stream.size(),
                    key_manager,
                ));
                if reader.is_valid() {
                    parser.ncch = Some(reader);
                }
            }
            N3dsFormat::ThreeDsx => parser.init_3dsx(&header),
        }

        parser.load_smdh();
        parser
    }

    fn init_cia(&mut self, key_manager: &KeyManager) {
        let mut raw = [0u8; 0x20];
        match self.stream.read_at(0, &mut raw) {
            Ok(0x20) => {}
            _ => {
                self.valid = false;
                return;
            }
        }
        let Some(header) = CiaHeader::parse(&raw) else {
            self.valid = false;
            return;
        };
        let ticket = Ticket::parse(self.stream.as_ref(), header.ticket_offset());
        let tmd = Tmd::parse(self.stream.as_ref(), header.tmd_offset());
        let mut state = CiaState {
            header,
            ticket,
            tmd,
            boot_hash: None,
        };

        if let Some(tmd) = &state.tmd {
            // Content offsets accumulate in TMD chunk order.
            let mut offset = state.header.content_offset();
            let mut boot = None;
            for chunk in &tmd.chunks {
                if chunk.index == tmd.boot_content {
                    boot = Some((offset, chunk));
                    break;
                }
                offset += align64(chunk.size);
            }

            if let Some((content_offset, chunk)) = boot {
                let ticket_for_crypto = if chunk.is_encrypted() {
                    state.ticket.as_ref()
                } else {
                    None
                };
                let content: Rc<dyn ReadAt> = Rc::new(CiaReader::new(
                    Rc::clone(&self.stream),
                    content_offset,
                    chunk.size,
                    ticket_for_crypto,
                    chunk.index,
                    key_manager,
                ));

                if chunk.size <= HASH_CHECK_MAX {
                    state.boot_hash = verify_content_hash(content.as_ref(), chunk).ok();
                }

                // DSiWare: at most two contents, no meta block, and
                // content 0 is a DS ROM rather than an NCCH.
                if tmd.chunks.len() <= 2 && state.header.meta_size == 0 {
                    let mut nds_header = [0u8; 0x180];
                    if matches!(content.read_at(0, &mut nds_header), Ok(0x180))
                        && srl::looks_like_nds(&nds_header)
                    {
                        debug!("CIA content is a DSiWare SRL; delegating to the DS reader");
                        self.srl = Some(Box::new(NdsSrl::new(Rc::clone(&content))));
                        self.cia = Some(state);
                        return;
                    }
                }

                let reader = Rc::new(NcchReader::new(content, 0, chunk.size, key_manager));
                if reader.is_valid() {
                    self.ncch = Some(reader);
                }
            }
        }
        self.cia = Some(state);
    }

    fn init_ncsd(&mut self, header: &[u8], key_manager: &KeyManager) {
        let media_id = read_u64_le(header, 0x108);
        let mut partitions = Vec::with_capacity(8);
        for i in 0..8 {
            let off = read_u32_le(header, 0x120 + i * 8) as u64;
            let len = read_u32_le(header, 0x124 + i * 8) as u64;
            partitions.push((off << MEDIA_UNIT_SHIFT, len << MEDIA_UNIT_SHIFT));
        }
        if self.format == N3dsFormat::Cci {
            let (p0_off, p0_len) = partitions[0];
            if p0_len > 0 {
                let reader = Rc::new(NcchReader::new(
                    Rc::clone(&self.stream),
                    p0_off,
                    p0_len,
                    key_manager,
                ));
                if reader.is_valid() {
                    self.ncch = Some(reader);
                }
            }
        }
        self.ncsd = Some((media_id, partitions));
    }

    fn init_3dsx(&mut self, header: &[u8]) {
        // Extended header carries the SMDH location.
        let header_size = read_u16_le(header, 0x04);
        if header_size <= 0x20 {
            debug!("3DSX without extended header; no SMDH available");
        }
    }

    fn load_smdh(&mut self) {
        if self.srl.is_some() {
            return;
        }
        let data = match self.format {
            N3dsFormat::Cia => {
                let Some(state) = &self.cia else { return };
                if (state.header.meta_size as usize) < 0x400 + SMDH_SIZE {
                    // No meta block: fall back to the NCCH ExeFS icon.
                    self.read_smdh_from_ncch()
                } else {
                    let mut data = vec![0u8; SMDH_SIZE];
                    match self
                        .stream
                        .read_at(state.header.meta_offset() + 0x400, &mut data)
                    {
                        Ok(n) if n == SMDH_SIZE => Some(data),
                        _ => None,
                    }
                }
            }
            N3dsFormat::ThreeDsx => {
                let mut head = [0u8; 0x28];
                match self.stream.read_at(0, &mut head) {
                    Ok(0x28) => {}
                    _ => return,
                }
                if read_u16_le(&head, 0x04) <= 0x20 {
                    return;
                }
                let smdh_offset = read_u32_le(&head, 0x20) as u64;
                let smdh_size = read_u32_le(&head, 0x24) as usize;
                if smdh_size < SMDH_SIZE {
                    return;
                }
                let mut data = vec![0u8; SMDH_SIZE];
                match self.stream.read_at(smdh_offset, &mut data) {
                    Ok(n) if n == SMDH_SIZE => Some(data),
                    _ => None,
                }
            }
            _ => self.read_smdh_from_ncch(),
        };

        if let Some(data) = data {
            let smdh = Smdh::from_bytes(data);
            if smdh.is_valid() {
                self.smdh = Some(smdh);
            }
        }
    }

    fn read_smdh_from_ncch(&self) -> Option<Vec<u8>> {
        let ncch = self.ncch.as_ref()?;
        let icon: SubStream = ncch.open_file("icon")?;
        let mut data = vec![0u8; SMDH_SIZE];
        match icon.read_at(0, &mut data) {
            Ok(n) if n == SMDH_SIZE => Some(data),
            _ => None,
        }
    }

    pub fn format(&self) -> N3dsFormat {
        self.format
    }

    /// The primary NCCH reader, when one was resolved.
    pub fn ncch_reader(&self) -> Option<&Rc<NcchReader>> {
        self.ncch.as_ref()
    }

    pub fn smdh(&self) -> Option<&Smdh> {
        self.smdh.as_ref()
    }

    fn title_id(&self) -> Option<u64> {
        if let Some(state) = &self.cia {
            if let Some(tmd) = &state.tmd {
                return Some(tmd.title_id);
            }
            if let Some(ticket) = &state.ticket {
                return Some(ticket.title_id);
            }
        }
        if let Some((media_id, _)) = &self.ncsd {
            return Some(*media_id);
        }
        self.ncch
            .as_ref()
            .and_then(|n| n.header())
            .map(|h| h.program_id())
    }

    /// GameTDB region directory from the SMDH region bitmask plus the
    /// product-code region character.
    fn gametdb_region(&self) -> &'static str {
        if let Some(smdh) = &self.smdh {
            let region = smdh.region_code();
            match region {
                0x01 => return "JA",
                0x02 => return "US",
                0x04 | 0x08 => return "EN",
                0x10 => return "ZH",
                0x20 => return "KO",
                0x40 => return "ZH",
                _ => {}
            }
        }
        let product_code = self
            .ncch
            .as_ref()
            .and_then(|n| n.header())
            .map(|h| h.product_code())
            .unwrap_or_default();
        match product_code.chars().last() {
            Some('J') => "JA",
            Some('E') => "US",
            Some('K') => "KO",
            Some('C') => "ZH",
            _ => "EN",
        }
    }

    fn build_fields(&mut self) -> RomFields {
        let mut f = RomFields::new();
        if !self.valid {
            return f;
        }

        if let Some(srl) = &mut self.srl {
            f.add_text("Format", "CIA (DSiWare)");
            f.extend_from(srl.fields());
            return f;
        }

        f.add_text("Format", self.format.name());
        if let Some(tid) = self.title_id() {
            f.add_hex("Title ID", tid, 16);
        }

        if let Some(ncch) = &self.ncch {
            if let Some(header) = ncch.header() {
                f.add_text("Product Code", header.product_code());
                let maker = header.maker_code();
                if let Some(name) = maker_code_name(&maker) {
                    f.add_text("Publisher", name);
                }
                f.add_text("Content Type", header.content_type_name());
                f.add_numeric("NCCH Version", header.version() as u64);
            }
            let crypto = ncch.crypto_type();
            f.add_text(
                "Issuer",
                match &self.cia {
                    Some(state) => match &state.ticket {
                        Some(t) if t.is_debug() => "Debug",
                        Some(_) => "Retail",
                        None => "Unknown",
                    },
                    None => "Retail",
                },
            );
            if ncch.force_no_crypto() {
                f.add_warning(
                    "Encryption",
                    format!("{} (keys unavailable; read as plaintext)", crypto.name),
                );
            } else {
                let mut desc = crypto.name.to_string();
                if crypto.seed {
                    desc.push_str(" + seed");
                }
                f.add_text("Encryption", desc);
            }
            match ncch.verify_result() {
                VerifyResult::Ok | VerifyResult::NotVerified => {}
                VerifyResult::KeyNotFound => {
                    f.add_warning("Warning", "Missing encryption keys");
                }
                VerifyResult::WrongKey => {
                    f.add_warning("Warning", "Encryption keys failed verification");
                }
            }
        }

        if let Some(smdh) = &mut self.smdh {
            f.add_tab("SMDH");
            f.extend_from(smdh.fields());
        }

        if let Some((media_id, partitions)) = &self.ncsd {
            f.add_tab("NCSD");
            f.add_hex("Media ID", *media_id, 16);
            let mut list = ListData {
                headers: ["#", "Offset", "Size"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
                ..Default::default()
            };
            for (i, &(off, len)) in partitions.iter().enumerate() {
                if len == 0 {
                    continue;
                }
                list.rows.push(vec![
                    i.to_string(),
                    format!("0x{off:X}"),
                    format!("0x{len:X}"),
                ]);
                list.row_flags.push(FieldFlags::empty());
            }
            f.add_list("Partitions", list);
        }

        if let Some(state) = &self.cia {
            f.add_tab("CIA");
            if let Some(ticket) = &state.ticket {
                f.add_text("Ticket Issuer", ticket.issuer.clone());
                f.add_numeric("Common Key Index", ticket.key_y_index as u64);
            }
            match state.boot_hash {
                Some(HashStatus::Ok) => f.add_text("Boot Content Hash", "OK"),
                Some(HashStatus::Mismatch) => {
                    f.add_warning("Boot Content Hash", "MISMATCH");
                }
                Some(HashStatus::NoDigest) | Some(HashStatus::Skipped) | None => {}
            }
            if let Some(tmd) = &state.tmd {
                f.add_numeric("Title Version", tmd.title_version as u64);
                let mut list = ListData {
                    headers: ["#", "Content ID", "Type", "Size"]
                        .iter()
                        .map(|s| s.to_string())
                        .collect(),
                    ..Default::default()
                };
                for chunk in &tmd.chunks {
                    list.rows.push(vec![
                        chunk.index.to_string(),
                        format!("{:08X}", chunk.id),
                        if chunk.is_encrypted() {
                            "Encrypted".to_string()
                        } else {
                            "Plain".to_string()
                        },
                        format!("0x{:X}", chunk.size),
                    ]);
                    list.row_flags.push(FieldFlags::empty());
                }
                f.add_list("Contents", list);
            }
        }

        f
    }

    fn build_metadata(&mut self) -> RomMetaData {
        let mut m = RomMetaData::new();
        if !self.valid {
            return m;
        }
        if let Some(srl) = &mut self.srl {
            return srl.metadata().clone();
        }
        if let Some(smdh) = &mut self.smdh {
            m = smdh.metadata().clone();
        }
        if m.get(Property::Title).is_none() {
            if let Some(product_code) = self
                .ncch
                .as_ref()
                .and_then(|n| n.header())
                .map(|h| h.product_code())
            {
                if !product_code.is_empty() {
                    m.add_text(Property::Title, product_code);
                }
            }
        }
        if let Some(tid) = self.title_id() {
            m.add_text(Property::GameId, format!("{tid:016X}"));
        }
        m
    }
}

impl RomData for Nintendo3ds {
    fn is_valid(&self) -> bool {
        self.valid
    }

    fn file_type(&self) -> FileType {
        match self.format {
            N3dsFormat::ThreeDsx => FileType::Homebrew,
            N3dsFormat::Cia => FileType::ApplicationPackage,
            N3dsFormat::Cci => FileType::RomImage,
            N3dsFormat::Emmc => FileType::EmmcDump,
            N3dsFormat::Ncch => FileType::RomImage,
        }
    }

    fn system_name(&self) -> &'static str {
        if self.srl.is_some() {
            "Nintendo DSi"
        } else {
            "Nintendo 3DS"
        }
    }

    fn mime_type(&self) -> &'static str {
        match self.format {
            N3dsFormat::Cia => "application/x-ctr-cia",
            N3dsFormat::ThreeDsx => "application/x-ctr-3dsx",
            _ => "application/x-nintendo-3ds-rom",
        }
    }

    fn supported_image_types(&self) -> ImageTypes {
        if let Some(srl) = &self.srl {
            return srl.supported_image_types();
        }
        if self.smdh.is_some() {
            ImageTypes::ICON
        } else {
            ImageTypes::empty()
        }
    }

    fn supported_image_sizes(&self, kind: ImageType) -> Vec<(u16, u16)> {
        if let Some(srl) = &self.srl {
            return srl.supported_image_sizes(kind);
        }
        match kind {
            ImageType::Icon if self.smdh.is_some() => vec![(48, 48), (24, 24)],
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
            let built = self.build_fields();
            self.fields = Some(built);
        }
        self.fields.get_or_insert_with(RomFields::new)
    }

    fn metadata(&mut self) -> &RomMetaData {
        if self.metadata.is_none() {
            let built = self.build_metadata();
            self.metadata = Some(built);
        }
        self.metadata.get_or_insert_with(RomMetaData::new)
    }

    fn image(&mut self, kind: ImageType) -> Option<&DecodedImage> {
        if let Some(srl) = &mut self.srl {
            return srl.image(kind);
        }
        self.smdh.as_mut()?.image(kind)
    }

    fn icon_animation(&mut self) -> Option<&IconAnimation> {
        self.srl.as_mut()?.icon_animation()
    }

    fn ext_urls(&self, kind: ImageType) -> Vec<ExtUrl> {
        if !self.valid || self.srl.is_some() {
            return Vec::new();
        }
        let id4: String = self
            .ncch
            .as_ref()
            .and_then(|n| n.header())
            .map(|h| h.product_code())
            .and_then(|pc| pc.rsplit('-').next().map(str::to_string))
            .unwrap_or_default();
        if id4.len() != 4 {
            return Vec::new();
        }
        let region = self.gametdb_region();
        let kind_dir = match kind {
            ImageType::ExtCover => "cover",
            ImageType::ExtCoverFull => "coverfull",
            ImageType::ExtTitleScreen => return Vec::new(),
            _ => return Vec::new(),
        };
        let cache_key = format!("3ds/{kind_dir}/{region}/{id4}.jpg");
        vec![ExtUrl {
            url: format!("{GAMETDB_BASE}/{cache_key}"),
            cache_key,
        }]
    }
}

#[cfg(test)]
#[path = "tests/mod_tests.rs"]
mod tests;
