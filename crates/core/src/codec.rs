//! Transport encodings for images and queue entries

use crate::error::CodecError;
use crate::models::{Artwork, QueueEntry, QueueItemSummary};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ExtendedColorType, RgbaImage};
use tracing::warn;

/// Quality used when re-encoding cover images
pub const JPEG_QUALITY: u8 = 100;

/// Re-encode a platform image as JPEG bytes
pub fn encode_artwork(artwork: &Artwork) -> Result<Vec<u8>, CodecError> {
    let image = match artwork {
        Artwork::Bitmap { width, height, rgba } => {
            let buffer = RgbaImage::from_raw(*width, *height, rgba.clone()).ok_or(
                CodecError::BitmapSize {
                    width: *width,
                    height: *height,
                    len: rgba.len(),
                },
            )?;
            DynamicImage::ImageRgba8(buffer)
        }
        Artwork::Encoded(bytes) => image::load_from_memory(bytes)?,
    };

    // JPEG has no alpha channel
    let rgb = image.to_rgb8();
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY).encode(
        rgb.as_raw(),
        rgb.width(),
        rgb.height(),
        ExtendedColorType::Rgb8,
    )?;
    Ok(out)
}

/// Encode optional artwork, logging and dropping images that fail to encode
pub fn encode_cover(artwork: Option<&Artwork>) -> Option<Vec<u8>> {
    let artwork = artwork?;
    match encode_artwork(artwork) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            warn!("Failed to encode artwork: {}", e);
            None
        }
    }
}

/// Summarize a queue entry from its description
pub fn summarize_queue_entry(entry: &QueueEntry) -> QueueItemSummary {
    let description = &entry.description;
    QueueItemSummary {
        title: description.title.clone(),
        artist: description.subtitle.clone(),
        album_art: encode_cover(description.icon.as_ref()),
        album_art_uri: description.icon_uri.clone(),
    }
}

/// Serde adapter carrying optional bytes as a base64 string
pub mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|encoded| STANDARD.decode(encoded).map_err(serde::de::Error::custom))
            .transpose()
    }
}
