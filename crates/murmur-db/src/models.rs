//! Row types for the SQLite store, kept apart from the wire models in murmur-types.

/// A user row without the credential column.
#[derive(Debug, Clone)]
pub struct UserRow {
    pub username: String,
    pub display_name: String,
    pub status_message: String,
    pub profile_image: Option<Vec<u8>>,
    pub additional_image: Option<Vec<u8>>,
    pub current_theme: Option<String>,
    pub registration_date: String,
    pub last_seen: Option<String>,
}

/// Input for account creation.
#[derive(Debug, Default)]
pub struct NewUser<'a> {
    pub username: &'a str,
    pub password: &'a str,
    pub display_name: Option<&'a str>,
    pub profile_image: Option<&'a [u8]>,
    pub additional_image: Option<&'a [u8]>,
}

/// Partial profile update. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct ProfileChanges {
    pub display_name: Option<String>,
    pub status_message: Option<String>,
    pub profile_image: Option<Vec<u8>>,
    pub additional_image: Option<Vec<u8>>,
    pub current_theme: Option<String>,
}

impl ProfileChanges {
    pub fn is_empty(&self) -> bool {
        self.display_name.is_none()
            && self.status_message.is_none()
            && self.profile_image.is_none()
            && self.additional_image.is_none()
            && self.current_theme.is_none()
    }
}
