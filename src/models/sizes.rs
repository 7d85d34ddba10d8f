//! The size catalog: the fixed, ordered set of target widths.

use std::{collections::HashSet, fmt, str::FromStr};
use thiserror::Error;

/// Widths produced when no catalog is configured.
pub const DEFAULT_SIZES: [u32; 2] = [320, 640];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SizeCatalogError {
    #[error("size catalog must contain at least one width")]
    Empty,
    #[error("width must be greater than zero")]
    ZeroWidth,
    #[error("width {0} is listed more than once")]
    Duplicate(u32),
    #[error("`{0}` is not a valid width")]
    Unparsable(String),
}

/// Ordered list of target widths, immutable once built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SizeCatalog {
    widths: Vec<u32>,
}

impl SizeCatalog {
    pub fn new(widths: Vec<u32>) -> Result<Self, SizeCatalogError> {
        if widths.is_empty() {
            return Err(SizeCatalogError::Empty);
        }
        let mut seen = HashSet::new();
        for &width in &widths {
            if width == 0 {
                return Err(SizeCatalogError::ZeroWidth);
            }
            if !seen.insert(width) {
                return Err(SizeCatalogError::Duplicate(width));
            }
        }
        Ok(Self { widths })
    }

    pub fn widths(&self) -> &[u32] {
        &self.widths
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.widths.iter().copied()
    }

    /// Returns the catalog width whose `_<width>` suffix ends `basename`, if any.
    pub fn suffix_of(&self, basename: &str) -> Option<u32> {
        self.iter()
            .find(|width| basename.ends_with(&format!("_{}", width)))
    }
}

impl Default for SizeCatalog {
    fn default() -> Self {
        Self {
            widths: DEFAULT_SIZES.to_vec(),
        }
    }
}

impl FromStr for SizeCatalog {
    type Err = SizeCatalogError;

    /// Parse a comma separated list such as `320,640`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let widths = s
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| {
                part.parse::<u32>()
                    .map_err(|_| SizeCatalogError::Unparsable(part.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(widths)
    }
}

impl fmt::Display for SizeCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.widths.iter().map(u32::to_string).collect();
        write!(f, "{}", parts.join(","))
    }
}
