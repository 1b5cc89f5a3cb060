//! Bounded thumbnails for images embedded in contact lists.

use std::borrow::Cow;
use std::io::Cursor;

use image::{DynamicImage, ImageFormat, ImageResult};
use tracing::debug;

/// Bounds for a contact's profile image.
pub const PROFILE_IMAGE_BOUNDS: (u32, u32) = (100, 100);

/// Bounds for a contact's secondary (banner) image.
pub const ADDITIONAL_IMAGE_BOUNDS: (u32, u32) = (200, 100);

/// Shrink an encoded image to fit within `max_width` x `max_height`,
/// preserving aspect ratio and the original format.
///
/// Images that already fit, or that cannot be decoded or re-encoded, are
/// returned unchanged.
pub fn downscale(bytes: &[u8], (max_width, max_height): (u32, u32)) -> Cow<'_, [u8]> {
    match try_downscale(bytes, max_width, max_height) {
        Ok(Some(resized)) => Cow::Owned(resized),
        Ok(None) => Cow::Borrowed(bytes),
        Err(e) => {
            debug!("Passing image through unchanged: {}", e);
            Cow::Borrowed(bytes)
        }
    }
}

fn try_downscale(bytes: &[u8], max_width: u32, max_height: u32) -> ImageResult<Option<Vec<u8>>> {
    let format = image::guess_format(bytes)?;
    let img = image::load_from_memory_with_format(bytes, format)?;

    if img.width() <= max_width && img.height() <= max_height {
        return Ok(None);
    }

    let mut thumb = img.thumbnail(max_width, max_height);
    if format == ImageFormat::Jpeg {
        // JPEG has no alpha channel.
        thumb = DynamicImage::ImageRgb8(thumb.to_rgb8());
    }

    let mut out = Cursor::new(Vec::new());
    thumb.write_to(&mut out, format)?;
    Ok(Some(out.into_inner()))
}
