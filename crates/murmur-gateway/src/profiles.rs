use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;

use murmur_db::models::UserRow;
use murmur_db::queries::parse_timestamp;
use murmur_types::models::Profile;

use crate::error::RouteError;
use crate::images::{self, ADDITIONAL_IMAGE_BOUNDS, PROFILE_IMAGE_BOUNDS};

/// Profile as shown in contact lists and broadcasts: images are thumbnails.
pub fn contact_profile(row: UserRow, online: bool) -> Profile {
    let profile_image = row
        .profile_image
        .as_deref()
        .map(|bytes| B64.encode(images::downscale(bytes, PROFILE_IMAGE_BOUNDS)));
    let additional_image = row
        .additional_image
        .as_deref()
        .map(|bytes| B64.encode(images::downscale(bytes, ADDITIONAL_IMAGE_BOUNDS)));

    Profile {
        profile_image,
        additional_image,
        ..base_profile(&row, online)
    }
}

/// Profile with the stored images at full size.
pub fn full_profile(row: UserRow, online: bool) -> Profile {
    Profile {
        profile_image: row.profile_image.as_deref().map(|b| B64.encode(b)),
        additional_image: row.additional_image.as_deref().map(|b| B64.encode(b)),
        ..base_profile(&row, online)
    }
}

fn base_profile(row: &UserRow, online: bool) -> Profile {
    Profile {
        username: row.username.clone(),
        display_name: row.display_name.clone(),
        status_message: row.status_message.clone(),
        profile_image: None,
        additional_image: None,
        current_theme: row.current_theme.clone(),
        last_seen: row.last_seen.as_deref().map(parse_timestamp),
        online,
    }
}

/// Decode an optional base64 image field. Empty strings count as absent.
pub fn decode_image(field: Option<&str>) -> Result<Option<Vec<u8>>, RouteError> {
    match field {
        None => Ok(None),
        Some(s) if s.is_empty() => Ok(None),
        Some(s) => B64
            .decode(s)
            .map(Some)
            .map_err(|_| RouteError::invalid("Invalid image encoding")),
    }
}
