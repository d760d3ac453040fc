//! rom-peek: ROM and save-file metadata extraction.
//!
//! Feed a byte stream in, get a structured record out: descriptive
//! fields, metadata properties, and decoded icons/banners. The
//! [`registry`] module maps byte patterns to parsers; [`thumbnail`]
//! wraps the whole pipeline for shell-extension style hosts.

pub mod registry;
pub mod thumbnail;

pub use registry::{detect_stream, open_path, HEADER_PARSERS, FOOTER_PARSERS};
pub use thumbnail::{FallbackProvider, Thumbnail, ThumbnailHost};

pub use rom_peek_core::{
    DecodedImage, DetectInfo, ErrorKind, ExtUrl, FieldFlags, FieldValue, FileType, IconAnimation,
    ImageType, ImageTypes, ImgProcFlags, ListData, MetaValue, ParseError, Property, ReadAt,
    RomData, RomFields, RomMetaData, StreamReader, SubStream,
};
