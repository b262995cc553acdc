use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::io::Cursor;
use std::path::Path;

use crate::error::Result;

/// A rendered thumbnail plus the source image's pixel size
#[derive(Debug, Clone)]
pub struct Thumbnail {
    pub width: u32,
    pub height: u32,
    pub bytes: Vec<u8>,
}

/// Decode `path` and render a JPEG thumbnail whose longer edge is `size`.
pub fn render(path: &Path, size: u32) -> Result<Thumbnail> {
    let image = image::open(path)?;
    let (width, height) = (image.width(), image.height());

    let small = DynamicImage::ImageRgb8(image.thumbnail(size, size).to_rgb8());
    let mut bytes = Cursor::new(Vec::new());
    small.write_to(&mut bytes, ImageFormat::Jpeg)?;

    Ok(Thumbnail {
        width,
        height,
        bytes: bytes.into_inner(),
    })
}

/// Flat gray PNG used when the source cannot be decoded.
pub fn placeholder(size: u32) -> Result<Vec<u8>> {
    let image = RgbImage::from_pixel(size.max(1), size.max(1), Rgb([96, 96, 96]));
    let mut bytes = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image).write_to(&mut bytes, ImageFormat::Png)?;
    Ok(bytes.into_inner())
}
