use anyhow::{Context, Result};
use base64::{engine::general_purpose, Engine};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;

/// Longest edge sent to a VLM. Smaller images mean fewer tokens and faster inference.
pub const MAX_EDGE: u32 = 1024;
pub const JPEG_QUALITY: u8 = 85;

/// JPEG bytes ready for a VLM request.
#[derive(Debug, Clone)]
pub struct PreparedImage {
    pub jpeg_base64: String,
    pub width: u32,
    pub height: u32,
}

impl PreparedImage {
    /// `data:` URL form used by multimodal chat messages.
    pub fn data_url(&self) -> String {
        format!("data:image/jpeg;base64,{}", self.jpeg_base64)
    }
}

/// Decode an uploaded image (any supported format).
pub fn decode(bytes: &[u8]) -> Result<DynamicImage> {
    image::load_from_memory(bytes).context("Unsupported or corrupt image")
}

/// Downscale so the longer edge is at most [`MAX_EDGE`], then re-encode as JPEG.
/// Images already within bounds keep their size.
pub fn prepare(image: &DynamicImage) -> Result<PreparedImage> {
    let resized;
    let source = if image.width().max(image.height()) > MAX_EDGE {
        resized = image.resize(MAX_EDGE, MAX_EDGE, FilterType::CatmullRom);
        &resized
    } else {
        image
    };

    let rgb = source.to_rgb8();
    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY)
        .encode_image(&rgb)
        .context("JPEG encoding failed")?;

    log::debug!(
        "📐 Prepared image {}x{} -> {}x{} ({} JPEG bytes)",
        image.width(),
        image.height(),
        rgb.width(),
        rgb.height(),
        jpeg.len()
    );

    Ok(PreparedImage {
        jpeg_base64: general_purpose::STANDARD.encode(&jpeg),
        width: rgb.width(),
        height: rgb.height(),
    })
}

#[cfg(test)]
pub(crate) fn sample_png(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
    });
    let mut out = std::io::Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut out, image::ImageFormat::Png)
        .unwrap();
    out.into_inner()
}
