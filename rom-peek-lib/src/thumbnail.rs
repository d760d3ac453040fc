//! Thumbnail extraction host glue.
//!
//! Given a stream and a requested pixel width, run thumbnail-only
//! detection, pull the parser's icon (banner as fallback), and emit a
//! pre-rasterised 32-bit bitmap plus an alpha-presence flag. A
//! chained [`FallbackProvider`] lets a host keep a third-party
//! thumbnailer registered for the same extension working.

use std::rc::Rc;

use log::debug;

use crate::registry::detect_stream;
use rom_peek_core::{DecodedImage, ImageType, ImgProcFlags, ParseError, ReadAt};

/// A finished thumbnail.
#[derive(Debug)]
pub struct Thumbnail {
    pub image: DecodedImage,
    /// True when the source carries meaningful alpha; hosts emit ARGB
    /// then, RGB otherwise.
    pub has_alpha: bool,
}

/// Secondary provider consulted when no parser claims the stream.
/// On Windows this wraps the previously registered COM thumbnailer;
/// elsewhere it is typically absent.
pub trait FallbackProvider {
    fn get_thumbnail(&self, stream: Rc<dyn ReadAt>, width: u32) -> Result<Thumbnail, ParseError>;
}

/// Thumbnail pipeline host.
#[derive(Default)]
pub struct ThumbnailHost {
    fallback: Option<Box<dyn FallbackProvider>>,
}

impl ThumbnailHost {
    pub fn new() -> Self {
        Self { fallback: None }
    }

    pub fn with_fallback(fallback: Box<dyn FallbackProvider>) -> Self {
        Self {
            fallback: Some(fallback),
        }
    }

    /// Produce a thumbnail of width `cx` for the stream.
    pub fn get_thumbnail(
        &self,
        stream: Rc<dyn ReadAt>,
        ext_hint: Option<&str>,
        cx: u32,
    ) -> Result<Thumbnail, ParseError> {
        match detect_stream(Rc::clone(&stream), ext_hint, true) {
            Some(mut parser) => {
                let kind = if parser.supported_image_types().has(ImageType::Icon) {
                    ImageType::Icon
                } else {
                    ImageType::Banner
                };
                let imgpf = parser.imgpf(kind);
                let Some(image) = parser.image(kind) else {
                    return Err(ParseError::invalid_format("no thumbnail image"));
                };
                let has_alpha = image.sbit.a > 0;
                let scaled = rescale(image, cx, imgpf.contains(ImgProcFlags::RESCALE_ASPECT));
                Ok(Thumbnail {
                    image: scaled,
                    has_alpha,
                })
            }
            None => match &self.fallback {
                Some(fallback) => {
                    debug!("no parser claimed the stream; delegating to fallback provider");
                    fallback.get_thumbnail(stream, cx)
                }
                None => Err(ParseError::NotSupported),
            },
        }
    }
}

/// Nearest-neighbour rescale to width `cx`. Aspect-aware sources keep
/// their ratio; everything else is treated as square.
fn rescale(src: &DecodedImage, cx: u32, keep_aspect: bool) -> DecodedImage {
    if src.width == 0 || src.height == 0 || cx == 0 {
        return src.clone();
    }
    let (dst_w, dst_h) = if keep_aspect {
        let h = (src.height as u32 * cx).div_ceil(src.width as u32);
        (cx, h.max(1))
    } else {
        (cx, cx)
    };
    if dst_w == src.width as u32 && dst_h == src.height as u32 {
        return src.clone();
    }

    let mut dst = DecodedImage::new(dst_w as u16, dst_h as u16);
    dst.sbit = src.sbit;
    for y in 0..dst_h {
        let sy = (y * src.height as u32 / dst_h) as u16;
        for x in 0..dst_w {
            let sx = (x * src.width as u32 / dst_w) as u16;
            dst.set_pixel(x as u16, y as u16, src.pixel(sx, sy));
        }
    }
    dst
}

#[cfg(test)]
#[path = "tests/thumbnail_tests.rs"]
mod tests;
