//! Incremental media decoding.
//!
//! Download code pushes bytes in as they arrive and closes the decoder once
//! the transfer completes; the buffered bytes double as the raw side copy
//! handed to the disk cache.

use image::GenericImageView;

/// A decoded image in RGBA8 form, ready for a renderer to upload.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

/// Accumulates media bytes chunk by chunk and decodes on close.
#[derive(Debug, Default)]
pub struct MediaDecoder {
    buf: Vec<u8>,
}

impl MediaDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bytes(bytes: Vec<u8>) -> Self {
        Self { buf: bytes }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Close the decoder and produce the image, along with the raw bytes for
    /// the cache write.
    pub fn finish(self) -> Result<(DecodedImage, Vec<u8>), image::ImageError> {
        let img = image::load_from_memory(&self.buf)?;
        let (width, height) = img.dimensions();
        let decoded = DecodedImage {
            width,
            height,
            pixels: img.to_rgba8().into_raw(),
        };
        Ok((decoded, self.buf))
    }
}

/// The stock stand-in shown for media the origin no longer has: a flat
/// mid-gray tile.
pub fn missing_placeholder() -> DecodedImage {
    const SIDE: u32 = 64;
    let mut pixels = Vec::with_capacity((SIDE * SIDE * 4) as usize);
    for _ in 0..SIDE * SIDE {
        pixels.extend_from_slice(&[0x55, 0x55, 0x55, 0xff]);
    }
    DecodedImage {
        width: SIDE,
        height: SIDE,
        pixels,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png_bytes() -> Vec<u8> {
        let img = image::RgbaImage::from_pixel(3, 2, image::Rgba([1, 2, 3, 255]));
        let mut out = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut out, image::ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[test]
    fn chunked_pushes_decode_like_a_single_buffer() {
        let bytes = png_bytes();
        let mut decoder = MediaDecoder::new();
        for chunk in bytes.chunks(7) {
            decoder.push(chunk);
        }
        let (decoded, raw) = decoder.finish().unwrap();
        assert_eq!((decoded.width, decoded.height), (3, 2));
        assert_eq!(raw, bytes);
    }

    #[test]
    fn garbage_fails_to_decode() {
        let mut decoder = MediaDecoder::new();
        decoder.push(b"definitely not an image");
        assert!(decoder.finish().is_err());
    }

    #[test]
    fn placeholder_is_opaque_and_square() {
        let img = missing_placeholder();
        assert_eq!(img.width, img.height);
        assert_eq!(img.pixels.len(), (img.width * img.height * 4) as usize);
        assert!(img.pixels.chunks(4).all(|px| px[3] == 0xff));
    }
}
