//! Image name parsing.

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use quarry_common::{QuarryError, QuarryResult};
use regex::Regex;

/// Repository syntax shared by names and tags.
/// See <https://docs.docker.com/registry/spec/api/#overview>.
static COMPONENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([a-z0-9][._/-]?)+$").expect("static repository pattern compiles")
});

/// A validated `name:tag` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageName {
    /// Repository name.
    pub name: String,
    /// Tag.
    pub tag: String,
}

impl ImageName {
    /// Default tag.
    pub const DEFAULT_TAG: &'static str = "latest";

    /// Parse an image name.
    ///
    /// Examples:
    /// - `alpine` -> alpine:latest
    /// - `alpine:3.19` -> alpine:3.19
    /// - `registry.example.com/team/app:v1` -> registry.example.com/team/app:v1
    ///
    /// # Errors
    ///
    /// Returns [`QuarryError::InvalidImageName`] if the name contains more
    /// than one `:` or if the name or tag breaks the repository syntax.
    pub fn parse(full_name: &str) -> QuarryResult<Self> {
        let invalid = || QuarryError::InvalidImageName {
            name: full_name.to_string(),
        };

        let (name, tag) = match full_name.split_once(':') {
            Some((_, tag)) if tag.contains(':') => return Err(invalid()),
            Some((name, tag)) => (name, tag),
            None => (full_name, Self::DEFAULT_TAG),
        };

        if !COMPONENT.is_match(name) || !COMPONENT.is_match(tag) {
            return Err(invalid());
        }

        Ok(Self {
            name: name.to_string(),
            tag: tag.to_string(),
        })
    }
}

impl FromStr for ImageName {
    type Err = QuarryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ImageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)
    }
}
