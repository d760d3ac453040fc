//! Core types for ROM and save-file metadata extraction.
//!
//! This crate carries everything the per-platform parser crates share:
//! the positional stream abstraction, byte-order and text helpers,
//! pixel-format decoders, the field/metadata output model, and the
//! [`RomData`] trait every parser implements.

pub mod byteorder;
pub mod error;
pub mod fields;
pub mod image;
pub mod pixel;
pub mod region;
pub mod stream;
pub mod text;

pub use error::{ErrorKind, ParseError};
pub use fields::{
    AgeRating, Field, FieldFlags, FieldValue, ListData, MetaValue, NumericBase, Property,
    RomFields, RomMetaData,
};
pub use image::{DecodedImage, FrameDelay, IconAnimation, SBit};
pub use region::Region;
pub use stream::{ReadAt, StreamCursor, StreamReader, SubStream};

/// Maximum header window offered to detection: 4 KiB + 256 bytes.
pub const DETECT_HEADER_MAX: usize = 4352;

/// Everything a parser's `is_supported` gets to look at.
#[derive(Clone, Copy)]
pub struct DetectInfo<'a> {
    /// Absolute file offset `header` was read from (0 for most parsers).
    pub header_offset: u32,
    /// Header window, at most [`DETECT_HEADER_MAX`] bytes.
    pub header: &'a [u8],
    /// Lowercased file extension including the leading dot.
    pub ext_hint: Option<&'a str>,
    pub file_size: u64,
}

/// Broad classification of the parsed file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum FileType {
    RomImage,
    SaveFile,
    DiscImage,
    /// Installable title container (CIA).
    ApplicationPackage,
    /// Icon-only file (Dreamcast ICONDATA_VMS).
    IconFile,
    /// Homebrew executable (3DSX).
    Homebrew,
    /// Raw NAND/eMMC dump.
    EmmcDump,
    Unknown,
}

/// Image kinds a parser may expose. `Icon` and `Banner` are embedded
/// in the file; the `Ext*` kinds are served by external databases via
/// [`RomData::ext_urls`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum ImageType {
    Icon,
    Banner,
    ExtTitleScreen,
    ExtCover,
    ExtCoverFull,
}

bitflags::bitflags! {
    /// Bitfield of [`ImageType`]s supported by a parser.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ImageTypes: u8 {
        const ICON = 1 << 0;
        const BANNER = 1 << 1;
    }
}

impl ImageTypes {
    pub fn has(self, kind: ImageType) -> bool {
        match kind {
            ImageType::Icon => self.contains(Self::ICON),
            ImageType::Banner => self.contains(Self::BANNER),
            _ => false,
        }
    }
}

bitflags::bitflags! {
    /// Image-processing hints for the thumbnail host.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ImgProcFlags: u8 {
        /// Rescale preserving aspect ratio (icons that aren't square).
        const RESCALE_ASPECT = 1 << 0;
        /// Nearest-neighbour upscaling looks right for this source
        /// (small pixel-art icons).
        const RESCALE_NEAREST = 1 << 1;
    }
}

/// An external image URL (RPDB title screens, GameTDB covers).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ExtUrl {
    pub url: String,
    /// Stable cache key, `sys/kind/region/id.ext`.
    pub cache_key: String,
}

/// A parsed ROM/save record.
///
/// Constructed by a parser's `new(stream)`; all heavy work (field
/// table, image decoding) happens on first access and is memoised.
/// When construction decided the file is structurally invalid,
/// `is_valid` is false and the accessors return empty results.
pub trait RomData {
    fn is_valid(&self) -> bool;
    fn file_type(&self) -> FileType;
    fn system_name(&self) -> &'static str;
    fn mime_type(&self) -> &'static str;

    fn supported_image_types(&self) -> ImageTypes {
        ImageTypes::empty()
    }

    /// Expected pixel sizes for an image kind, `(width, height)` pairs.
    fn supported_image_sizes(&self, _kind: ImageType) -> Vec<(u16, u16)> {
        Vec::new()
    }

    fn imgpf(&self, _kind: ImageType) -> ImgProcFlags {
        ImgProcFlags::empty()
    }

    /// Descriptive field table, built on first call.
    fn fields(&mut self) -> &RomFields;

    /// Metadata properties, built on first call.
    fn metadata(&mut self) -> &RomMetaData;

    /// Decode (and memoise) an embedded image.
    fn image(&mut self, _kind: ImageType) -> Option<&DecodedImage> {
        None
    }

    /// Icon animation data, for formats with animated icons.
    fn icon_animation(&mut self) -> Option<&IconAnimation> {
        None
    }

    /// External image URLs for the given kind.
    fn ext_urls(&self, _kind: ImageType) -> Vec<ExtUrl> {
        Vec::new()
    }
}
