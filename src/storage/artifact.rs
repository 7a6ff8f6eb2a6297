//! The naming scheme of the versioned artifacts.

use derive_more::Display;

/// The name of a versioned artifact: `{version}.{extension}`.
///
/// Global models are versioned by the global version, local updates by the local epoch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display)]
#[display(fmt = "{}.{}", version, extension)]
pub struct ArtifactName {
    pub version: u64,
    pub extension: String,
}

impl ArtifactName {
    pub fn new(version: u64, extension: impl Into<String>) -> Self {
        Self {
            version,
            extension: extension.into(),
        }
    }

    /// Parses a file name of the form `{version}.{extension}`.
    ///
    /// Anything else, including names with another extension, signs, whitespace or a version that
    /// overflows a `u64`, is rejected.
    pub fn parse(file_name: &str, extension: &str) -> Option<Self> {
        let stem = file_name.strip_suffix(extension)?.strip_suffix('.')?;
        if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        stem.parse()
            .ok()
            .map(|version| Self::new(version, extension))
    }

    /// Parses the last segment of a `/` separated key.
    pub fn from_key(key: &str, extension: &str) -> Option<Self> {
        key.rsplit('/')
            .next()
            .and_then(|file_name| Self::parse(file_name, extension))
    }

    /// The key of this artifact inside `folder`.
    pub fn key_in(&self, folder: &str) -> String {
        super::join_key([folder, self.to_string().as_str()])
    }
}
