use crate::error::TranscodeError;
use bytes::Bytes;
use image::codecs::gif::{GifDecoder, GifEncoder, Repeat};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::webp::WebPEncoder;
use image::imageops::FilterType;
use image::{AnimationDecoder, DynamicImage, Frame, ImageFormat, ImageReader};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const JPEG_QUALITY: u8 = 80;

/// Pixel dimensions of an image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

/// Output of [`MediaTranscoder::optimize`]
#[derive(Debug, Clone)]
pub struct Transcoded {
    pub bytes: Bytes,
    pub dimensions: Dimensions,
}

/// Decodes dimensions and produces bounded renditions of media
#[cfg_attr(test, mockall::automock)]
pub trait MediaTranscoder: Send + Sync {
    /// Read dimensions from the image header
    fn probe(&self, bytes: &[u8]) -> Result<Dimensions, TranscodeError>;

    /// Re-encode in the source format with the longest edge at most
    /// `max_dimension`. Images that already fit are returned as-is.
    fn optimize(&self, bytes: &[u8], mime: &str, max_dimension: u32) -> Result<Transcoded, TranscodeError>;
}

/// Fit `width x height` inside a `max x max` box, preserving aspect ratio.
///
/// The width is clamped first and the height derived from it; if the height
/// still overshoots it is clamped and the width derived back. Neither edge is
/// ever zero.
pub fn fit_within(width: u32, height: u32, max: u32) -> (u32, u32) {
    if width == 0 || height == 0 || (width <= max && height <= max) {
        return (width, height);
    }

    let ratio = width as f64 / height as f64;
    let mut w = width.min(max) as f64;
    let mut h = w / ratio;
    if h > max as f64 {
        h = max as f64;
        w = h * ratio;
    }

    let clamp = |v: f64| (v.round() as u32).clamp(1, max);
    (clamp(w), clamp(h))
}

fn format_for(mime: &str) -> Result<ImageFormat, TranscodeError> {
    match mime {
        "image/png" => Ok(ImageFormat::Png),
        "image/jpeg" => Ok(ImageFormat::Jpeg),
        "image/webp" => Ok(ImageFormat::WebP),
        "image/gif" => Ok(ImageFormat::Gif),
        other => Err(TranscodeError::UnsupportedMediaType(other.to_string())),
    }
}

/// [`MediaTranscoder`] on the `image` crate
#[derive(Debug, Default, Clone)]
pub struct ImageTranscoder;

impl ImageTranscoder {
    pub fn new() -> Self {
        Self
    }

    fn resize_still(
        &self,
        bytes: &[u8],
        format: ImageFormat,
        width: u32,
        height: u32,
    ) -> Result<Vec<u8>, TranscodeError> {
        let img = image::load_from_memory_with_format(bytes, format)
            .map_err(|e| TranscodeError::Decode(e.to_string()))?;
        let resized = img.resize_exact(width, height, FilterType::Lanczos3);

        let mut out = Vec::new();
        let written = match format {
            ImageFormat::Jpeg => {
                let encoder = JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY);
                DynamicImage::ImageRgb8(resized.to_rgb8()).write_with_encoder(encoder)
            }
            ImageFormat::WebP => {
                let encoder = WebPEncoder::new_lossless(&mut out);
                DynamicImage::ImageRgba8(resized.to_rgba8()).write_with_encoder(encoder)
            }
            _ => resized.write_to(&mut Cursor::new(&mut out), format),
        };
        written.map_err(|e| TranscodeError::Encode(e.to_string()))?;

        Ok(out)
    }

    /// Resize every frame of an animated GIF, keeping offsets and delays
    fn resize_animation(
        &self,
        bytes: &[u8],
        source: Dimensions,
        width: u32,
        height: u32,
    ) -> Result<Vec<u8>, TranscodeError> {
        let decoder =
            GifDecoder::new(Cursor::new(bytes)).map_err(|e| TranscodeError::Decode(e.to_string()))?;
        let frames = decoder
            .into_frames()
            .collect_frames()
            .map_err(|e| TranscodeError::Decode(e.to_string()))?;

        let scale_x = width as f64 / source.width as f64;
        let scale_y = height as f64 / source.height as f64;

        let resized = frames.into_iter().map(|frame| {
            let left = (frame.left() as f64 * scale_x).round() as u32;
            let top = (frame.top() as f64 * scale_y).round() as u32;
            let delay = frame.delay();
            let buffer = frame.into_buffer();
            let frame_width = ((buffer.width() as f64 * scale_x).round() as u32).max(1);
            let frame_height = ((buffer.height() as f64 * scale_y).round() as u32).max(1);
            let buffer =
                image::imageops::resize(&buffer, frame_width, frame_height, FilterType::Triangle);
            Frame::from_parts(buffer, left, top, delay)
        });

        let mut out = Vec::new();
        {
            let mut encoder = GifEncoder::new(&mut out);
            encoder
                .set_repeat(Repeat::Infinite)
                .map_err(|e| TranscodeError::Encode(e.to_string()))?;
            encoder
                .encode_frames(resized)
                .map_err(|e| TranscodeError::Encode(e.to_string()))?;
        }
        Ok(out)
    }
}

impl MediaTranscoder for ImageTranscoder {
    fn probe(&self, bytes: &[u8]) -> Result<Dimensions, TranscodeError> {
        let (width, height) = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| TranscodeError::Decode(e.to_string()))?
            .into_dimensions()
            .map_err(|e| TranscodeError::Decode(e.to_string()))?;
        Ok(Dimensions { width, height })
    }

    fn optimize(&self, bytes: &[u8], mime: &str, max_dimension: u32) -> Result<Transcoded, TranscodeError> {
        let format = format_for(mime)?;
        let source = self.probe(bytes)?;
        let (width, height) = fit_within(source.width, source.height, max_dimension);

        if (width, height) == (source.width, source.height) {
            return Ok(Transcoded {
                bytes: Bytes::copy_from_slice(bytes),
                dimensions: source,
            });
        }

        let out = match format {
            ImageFormat::Gif => self.resize_animation(bytes, source, width, height)?,
            _ => self.resize_still(bytes, format, width, height)?,
        };

        debug!(
            mime = %mime,
            from = ?(source.width, source.height),
            to = ?(width, height),
            "Image resized"
        );

        Ok(Transcoded {
            bytes: Bytes::from(out),
            dimensions: Dimensions { width, height },
        })
    }
}

/// Run [`MediaTranscoder::optimize`] on the blocking pool under a deadline
pub async fn optimize_blocking(
    transcoder: Arc<dyn MediaTranscoder>,
    bytes: Bytes,
    mime: String,
    max_dimension: u32,
    timeout: Duration,
) -> Result<Transcoded, TranscodeError> {
    let task = tokio::task::spawn_blocking(move || transcoder.optimize(&bytes, &mime, max_dimension));

    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => Err(TranscodeError::Decode(format!(
            "transcoder task failed: {}",
            join_error
        ))),
        Err(_) => Err(TranscodeError::Timeout(timeout)),
    }
}

/// Run [`MediaTranscoder::probe`] on the blocking pool under a deadline
pub async fn probe_blocking(
    transcoder: Arc<dyn MediaTranscoder>,
    bytes: Bytes,
    timeout: Duration,
) -> Result<Dimensions, TranscodeError> {
    let task = tokio::task::spawn_blocking(move || transcoder.probe(&bytes));

    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => Err(TranscodeError::Decode(format!(
            "transcoder task failed: {}",
            join_error
        ))),
        Err(_) => Err(TranscodeError::Timeout(timeout)),
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use image::codecs::gif::GifEncoder;
    use image::{Delay, DynamicImage, Frame, ImageFormat, Rgba, RgbaImage};
    use std::io::Cursor;

    /// Noisy image so encoders cannot collapse it to a few bytes
    pub fn image(width: u32, height: u32) -> RgbaImage {
        RgbaImage::from_fn(width, height, |x, y| {
            let v = (x.wrapping_mul(31) ^ y.wrapping_mul(17)) as u8;
            Rgba([v, v.wrapping_mul(3), x as u8, 255])
        })
    }

    pub fn png(width: u32, height: u32) -> Vec<u8> {
        encode(width, height, ImageFormat::Png)
    }

    pub fn encode(width: u32, height: u32, format: ImageFormat) -> Vec<u8> {
        let img = DynamicImage::ImageRgba8(image(width, height));
        let img = match format {
            ImageFormat::Jpeg => DynamicImage::ImageRgb8(img.to_rgb8()),
            _ => img,
        };
        let mut out = Vec::new();
        img.write_to(&mut Cursor::new(&mut out), format).unwrap();
        out
    }

    pub fn gif(width: u32, height: u32, frames: usize) -> Vec<u8> {
        let mut out = Vec::new();
        {
            let mut encoder = GifEncoder::new(&mut out);
            let frames = (0..frames).map(|_| {
                Frame::from_parts(image(width, height), 0, 0, Delay::from_numer_denom_ms(100, 1))
            });
            encoder.encode_frames(frames).unwrap();
        }
        out
    }
}
