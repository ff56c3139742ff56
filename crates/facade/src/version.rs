//! Library API version
//!
//! Host bindings check this before calling into the library.

/// API version using semantic versioning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

/// Current API version, taken from the crate version
pub const CURRENT_VERSION: ApiVersion = ApiVersion {
    major: parse_component(env!("CARGO_PKG_VERSION_MAJOR")),
    minor: parse_component(env!("CARGO_PKG_VERSION_MINOR")),
    patch: parse_component(env!("CARGO_PKG_VERSION_PATCH")),
};

impl ApiVersion {
    /// Check if this version can serve a caller built against `other`
    pub fn is_compatible_with(&self, other: &ApiVersion) -> bool {
        self.major == other.major && self.minor >= other.minor
    }

    /// Single integer form, `major * 100 + minor`
    pub fn code(&self) -> u32 {
        self.major * 100 + self.minor
    }
}

impl std::fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// True if a caller expecting `major.minor` can use this library
pub fn check_api_version(major: u32, minor: u32) -> bool {
    CURRENT_VERSION.is_compatible_with(&ApiVersion {
        major,
        minor,
        patch: 0,
    })
}

const fn parse_component(s: &str) -> u32 {
    let bytes = s.as_bytes();
    let mut value = 0;
    let mut i = 0;
    while i < bytes.len() {
        value = value * 10 + (bytes[i] - b'0') as u32;
        i += 1;
    }
    value
}
