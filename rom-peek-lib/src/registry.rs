//! Parser registry and the detect-and-dispatch loop.
//!
//! Parsers sit in two statically ordered arrays: those that recognise
//! a header near the start of the file, and those keyed off a footer
//! at a fixed distance from EOF. Order matters in the header group:
//! parsers with strong magic run first, and the extension-driven ones
//! (SNES, Dreamcast) run at the end so they can't shadow a real match.

use std::path::Path;
use std::rc::Rc;

use log::debug;

use rom_peek_core::{DETECT_HEADER_MAX, DetectInfo, ParseError, ReadAt, RomData, StreamReader};
use rom_peek_nintendo::gcn_save::GcnSaveType;
use rom_peek_nintendo::{
    GameBoyAdvance, GameCubeSave, N64, Nes, Nintendo3ds, Smdh, Snes, VirtualBoy, gba, gcn_save,
    n3ds, n64, nes, snes, vboy,
};
use rom_peek_sega::dreamcast::{self, DcSaveType};
use rom_peek_sega::DreamcastSave;

/// Footer window length offered to the footer-parser group.
const FOOTER_WINDOW: usize = 1024;

/// Files above this size skip the footer phase entirely.
const FOOTER_MAX_FILE_SIZE: u64 = 1 << 30;

/// A registered parser.
pub struct ParserEntry {
    pub name: &'static str,
    /// Non-negative return is a format-specific subtype id.
    pub is_supported: fn(&DetectInfo) -> i32,
    /// Construct the parser; receives the detect info and the subtype
    /// returned by `is_supported`.
    pub construct: fn(Rc<dyn ReadAt>, &DetectInfo, i32) -> Box<dyn RomData>,
    pub extensions: &'static [&'static str],
    pub supports_thumbnail: bool,
}

fn construct_nes(stream: Rc<dyn ReadAt>, _info: &DetectInfo, _subtype: i32) -> Box<dyn RomData> {
    Box::new(Nes::new(stream))
}

fn construct_n64(stream: Rc<dyn ReadAt>, _info: &DetectInfo, _subtype: i32) -> Box<dyn RomData> {
    Box::new(N64::new(stream))
}

fn construct_gba(stream: Rc<dyn ReadAt>, _info: &DetectInfo, _subtype: i32) -> Box<dyn RomData> {
    Box::new(GameBoyAdvance::new(stream))
}

fn construct_smdh(stream: Rc<dyn ReadAt>, _info: &DetectInfo, _subtype: i32) -> Box<dyn RomData> {
    Box::new(Smdh::new(stream))
}

fn construct_n3ds(stream: Rc<dyn ReadAt>, _info: &DetectInfo, _subtype: i32) -> Box<dyn RomData> {
    Box::new(Nintendo3ds::new(stream))
}

fn construct_gcn_save(
    stream: Rc<dyn ReadAt>,
    _info: &DetectInfo,
    subtype: i32,
) -> Box<dyn RomData> {
    let hint = match subtype {
        0 => Some(GcnSaveType::Gci),
        1 => Some(GcnSaveType::Gcs),
        2 => Some(GcnSaveType::Sav),
        _ => None,
    };
    Box::new(GameCubeSave::with_type_hint(stream, hint))
}

fn construct_dreamcast(
    stream: Rc<dyn ReadAt>,
    _info: &DetectInfo,
    subtype: i32,
) -> Box<dyn RomData> {
    let save_type = match subtype {
        1 => DcSaveType::Vmi,
        2 => DcSaveType::Dci,
        _ => DcSaveType::Vms,
    };
    Box::new(DreamcastSave::new(stream, save_type))
}

fn construct_snes(stream: Rc<dyn ReadAt>, info: &DetectInfo, _subtype: i32) -> Box<dyn RomData> {
    Box::new(Snes::with_hint(stream, info.ext_hint))
}

fn construct_vboy(stream: Rc<dyn ReadAt>, _info: &DetectInfo, _subtype: i32) -> Box<dyn RomData> {
    Box::new(VirtualBoy::new(stream))
}

/// Header-group parsers, in match order.
pub static HEADER_PARSERS: &[ParserEntry] = &[
    ParserEntry {
        name: "NES",
        is_supported: nes::is_supported,
        construct: construct_nes,
        extensions: &[".nes", ".fds", ".tds"],
        supports_thumbnail: false,
    },
    ParserEntry {
        name: "Nintendo64",
        is_supported: n64::is_supported,
        construct: construct_n64,
        extensions: &[".z64", ".n64", ".v64"],
        supports_thumbnail: false,
    },
    ParserEntry {
        name: "GameBoyAdvance",
        is_supported: gba::is_supported,
        construct: construct_gba,
        extensions: &[".gba", ".agb", ".mb", ".srl"],
        supports_thumbnail: false,
    },
    ParserEntry {
        name: "Nintendo3DS_SMDH",
        is_supported: n3ds::smdh::is_supported,
        construct: construct_smdh,
        extensions: &[".smdh"],
        supports_thumbnail: true,
    },
    ParserEntry {
        name: "Nintendo3DS",
        is_supported: n3ds::is_supported,
        construct: construct_n3ds,
        extensions: &[".3ds", ".cci", ".cia", ".ncch", ".cxi", ".3dsx", ".csu"],
        supports_thumbnail: true,
    },
    ParserEntry {
        name: "GameCubeSave",
        is_supported: gcn_save::is_supported,
        construct: construct_gcn_save,
        extensions: &[".gci", ".gcs", ".sav"],
        supports_thumbnail: true,
    },
    ParserEntry {
        name: "DreamcastSave",
        is_supported: dreamcast::is_supported,
        construct: construct_dreamcast,
        extensions: &[".vms", ".vmi", ".dci"],
        supports_thumbnail: true,
    },
    // Extension-driven, no magic: must run after everything with a
    // real signature.
    ParserEntry {
        name: "SNES",
        is_supported: snes::is_supported,
        construct: construct_snes,
        extensions: &[".smc", ".sfc", ".fig", ".swc", ".mgd", ".ufo", ".bs", ".bsx"],
        supports_thumbnail: false,
    },
];

/// Footer-group parsers, tried only when no header parser matched and
/// the file is small enough to make the trailing read worthwhile.
pub static FOOTER_PARSERS: &[ParserEntry] = &[ParserEntry {
    name: "VirtualBoy",
    is_supported: vboy::is_supported,
    construct: construct_vboy,
    extensions: &[".vb"],
    supports_thumbnail: false,
}];

/// Normalise an extension hint: lowercase, leading dot.
fn normalize_ext(ext: Option<&str>) -> Option<String> {
    let ext = ext?;
    let ext = ext.strip_prefix('.').unwrap_or(ext);
    if ext.is_empty() {
        return None;
    }
    Some(format!(".{}", ext.to_ascii_lowercase()))
}

/// Detect the format of an opened stream and construct its parser.
///
/// Pure with respect to `(bytes, extension, size)`: the same inputs
/// always select the same parser.
pub fn detect_stream(
    stream: Rc<dyn ReadAt>,
    ext_hint: Option<&str>,
    thumbnail_only: bool,
) -> Option<Box<dyn RomData>> {
    let ext = normalize_ext(ext_hint);
    let file_size = stream.size();

    let mut header = [0u8; DETECT_HEADER_MAX];
    let header_len = stream.read_at(0, &mut header).ok()?;
    let info = DetectInfo {
        header_offset: 0,
        header: &header[..header_len],
        ext_hint: ext.as_deref(),
        file_size,
    };

    for entry in HEADER_PARSERS {
        if thumbnail_only && !entry.supports_thumbnail {
            continue;
        }
        let subtype = (entry.is_supported)(&info);
        if subtype >= 0 {
            debug!("detected {} (subtype {subtype})", entry.name);
            let parser = (entry.construct)(Rc::clone(&stream), &info, subtype);
            if parser.is_valid() {
                return Some(parser);
            }
            debug!("{} constructor rejected the stream; trying next", entry.name);
        }
    }

    // Footer phase: one shared trailing window.
    if file_size <= FOOTER_MAX_FILE_SIZE && file_size > 0 {
        let footer_offset = file_size.saturating_sub(FOOTER_WINDOW as u64);
        let mut footer = [0u8; FOOTER_WINDOW];
        let footer_len = stream.read_at(footer_offset, &mut footer).ok()?;
        let footer_info = DetectInfo {
            header_offset: footer_offset as u32,
            header: &footer[..footer_len],
            ext_hint: ext.as_deref(),
            file_size,
        };
        for entry in FOOTER_PARSERS {
            if thumbnail_only && !entry.supports_thumbnail {
                continue;
            }
            let subtype = (entry.is_supported)(&footer_info);
            if subtype >= 0 {
                debug!("detected {} from footer (subtype {subtype})", entry.name);
                let parser = (entry.construct)(Rc::clone(&stream), &footer_info, subtype);
                if parser.is_valid() {
                    return Some(parser);
                }
            }
        }
    }

    None
}

/// Open a file from disk and detect its format.
///
/// `.vms`/`.vmi` files first go through the paired-file opener so a
/// sidecar next to its payload is presented as one record.
pub fn open_path(path: &Path, thumbnail_only: bool) -> Result<Box<dyn RomData>, ParseError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    if matches!(ext.as_deref(), Some("vms") | Some("vmi")) {
        if let Some(pair) = DreamcastSave::open_pair(path) {
            return Ok(Box::new(pair));
        }
    }

    let stream = StreamReader::open(path)?;
    detect_stream(stream, ext.as_deref(), thumbnail_only).ok_or(ParseError::NotSupported)
}

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod tests;
