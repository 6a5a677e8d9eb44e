//! Base64 / data-URL image transport.
//!
//! Reference images arrive either as bare base64 or as a `data:<mime>;base64,`
//! URL. Results always leave as a JPEG data URL, so any alpha channel is
//! composited onto white first.

use std::io::Cursor;

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageError, Rgb, RgbImage};
use thiserror::Error;

pub const OUTPUT_MIME: &str = "image/jpeg";
pub const JPEG_QUALITY: u8 = 85;

/// Standard alphabet, padding optional.
const LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("data URL has no payload")]
    MalformedDataUrl,

    #[error("image payload is empty")]
    Empty,

    #[error("payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("unsupported image content: {0}")]
    Unsupported(#[source] ImageError),

    #[error("failed to encode image: {0}")]
    Encode(#[source] ImageError),
}

/// Returns the base64 payload of a data URL, or the input itself when it is
/// not one.
pub fn strip_data_url(input: &str) -> Result<&str, CodecError> {
    let input = input.trim();
    match input.strip_prefix("data:") {
        Some(rest) => rest
            .split_once(',')
            .map(|(_, payload)| payload)
            .ok_or(CodecError::MalformedDataUrl),
        None => Ok(input),
    }
}

pub fn decode_reference(input: &str) -> Result<DynamicImage, CodecError> {
    let payload = strip_data_url(input)?;
    let compact: String = payload.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    if compact.is_empty() {
        return Err(CodecError::Empty);
    }
    let bytes = LENIENT.decode(compact)?;
    image::load_from_memory(&bytes).map_err(CodecError::Unsupported)
}

pub fn encode_output(img: &DynamicImage) -> Result<String, CodecError> {
    let rgb = DynamicImage::ImageRgb8(flatten_to_rgb(img));
    let mut bytes = Vec::new();
    let encoder = JpegEncoder::new_with_quality(Cursor::new(&mut bytes), JPEG_QUALITY);
    rgb.write_with_encoder(encoder).map_err(CodecError::Encode)?;
    Ok(format!("data:{OUTPUT_MIME};base64,{}", STANDARD.encode(&bytes)))
}

/// Drops the alpha channel by compositing onto opaque white; images without
/// alpha are only converted to 8-bit RGB.
pub fn flatten_to_rgb(img: &DynamicImage) -> RgbImage {
    if !img.color().has_alpha() {
        return img.to_rgb8();
    }
    let rgba = img.to_rgba8();
    RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let [r, g, b, a] = rgba.get_pixel(x, y).0;
        let a = u16::from(a);
        let over_white = |c: u8| ((u16::from(c) * a + 255 * (255 - a) + 127) / 255) as u8;
        Rgb([over_white(r), over_white(g), over_white(b)])
    })
}
