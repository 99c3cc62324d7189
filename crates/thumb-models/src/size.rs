//! Named thumbnail sizes and variant naming.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Prefix shared by every thumbnail variant name.
pub const VARIANT_PREFIX: &str = "thumbnail_";

/// Default size catalogue used when `THUMBNAIL_SIZES` is not configured.
pub const DEFAULT_SIZES: &str = "small:150x150,medium:512x512,large:1024x1024";

/// Errors raised while parsing a size list.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SizeParseError {
    #[error("Malformed size entry '{0}' (expected name:WIDTHxHEIGHT)")]
    Malformed(String),

    #[error("Size '{name}' must have positive dimensions (got {width}x{height})")]
    NonPositive { name: String, width: i64, height: i64 },

    #[error("Duplicate size name '{0}'")]
    Duplicate(String),

    #[error("Size list is empty")]
    Empty,
}

/// A named bounding box a rendition must fit into.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct SizeSpec {
    /// Human name (e.g. "small")
    pub name: String,
    /// Maximum width in pixels
    pub width: u32,
    /// Maximum height in pixels
    pub height: u32,
}

impl SizeSpec {
    pub fn new(name: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            name: name.into(),
            width,
            height,
        }
    }

    /// Deterministic variant name for this box.
    ///
    /// Square boxes use a single number (`thumbnail_512`), others `thumbnail_512x384`.
    /// The reconciliation scanner matches existing renditions on this name.
    pub fn variant_name(&self) -> String {
        variant_name(self.width, self.height)
    }

    /// Parse a single `name:WxH` entry.
    pub fn parse(entry: &str) -> Result<Self, SizeParseError> {
        let entry = entry.trim();
        let (name, dims) = entry
            .split_once(':')
            .ok_or_else(|| SizeParseError::Malformed(entry.to_string()))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(SizeParseError::Malformed(entry.to_string()));
        }

        let (w, h) = dims
            .trim()
            .split_once(['x', 'X'])
            .ok_or_else(|| SizeParseError::Malformed(entry.to_string()))?;
        let width: i64 = w
            .trim()
            .parse()
            .map_err(|_| SizeParseError::Malformed(entry.to_string()))?;
        let height: i64 = h
            .trim()
            .parse()
            .map_err(|_| SizeParseError::Malformed(entry.to_string()))?;

        if width <= 0 || height <= 0 || width > u32::MAX as i64 || height > u32::MAX as i64 {
            return Err(SizeParseError::NonPositive {
                name: name.to_string(),
                width,
                height,
            });
        }

        Ok(Self::new(name, width as u32, height as u32))
    }
}

/// Variant name for a (width, height) pair.
pub fn variant_name(width: u32, height: u32) -> String {
    if width == height {
        format!("{}{}", VARIANT_PREFIX, width)
    } else {
        format!("{}{}x{}", VARIANT_PREFIX, width, height)
    }
}

/// Ordered set of configured sizes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeCatalog {
    sizes: Vec<SizeSpec>,
}

impl SizeCatalog {
    /// Build a catalogue from explicit specs.
    pub fn new(sizes: Vec<SizeSpec>) -> Result<Self, SizeParseError> {
        if sizes.is_empty() {
            return Err(SizeParseError::Empty);
        }
        for (i, spec) in sizes.iter().enumerate() {
            if sizes[..i].iter().any(|s| s.name == spec.name) {
                return Err(SizeParseError::Duplicate(spec.name.clone()));
            }
        }
        Ok(Self { sizes })
    }

    /// Parse a comma-separated `name:WxH` list.
    pub fn parse(list: &str) -> Result<Self, SizeParseError> {
        let sizes = list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(SizeSpec::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(sizes)
    }

    /// All configured sizes, in configuration order.
    pub fn all(&self) -> &[SizeSpec] {
        &self.sizes
    }

    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }

    /// Look up a size by name.
    pub fn get(&self, name: &str) -> Option<&SizeSpec> {
        self.sizes.iter().find(|s| s.name == name)
    }

    /// Resolve a `thumbnail_sizes` hint against the catalogue.
    ///
    /// Unknown names are ignored. An absent or empty hint, or one where nothing
    /// matches, resolves to the full catalogue.
    pub fn resolve(&self, hint: Option<&str>) -> Vec<SizeSpec> {
        let Some(hint) = hint else {
            return self.sizes.clone();
        };

        let requested: Vec<&str> = split_size_names(hint).collect();
        let selected: Vec<SizeSpec> = self
            .sizes
            .iter()
            .filter(|s| requested.contains(&s.name.as_str()))
            .cloned()
            .collect();

        if selected.is_empty() {
            self.sizes.clone()
        } else {
            selected
        }
    }

    /// Comma-joined size names, suitable for a `thumbnail_sizes` hint.
    pub fn names_hint(&self) -> String {
        self.sizes
            .iter()
            .map(|s| s.name.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl Default for SizeCatalog {
    fn default() -> Self {
        Self {
            sizes: vec![
                SizeSpec::new("small", 150, 150),
                SizeSpec::new("medium", 512, 512),
                SizeSpec::new("large", 1024, 1024),
            ],
        }
    }
}

/// Split a comma-separated list of size names, trimming blanks.
pub fn split_size_names(list: &str) -> impl Iterator<Item = &str> {
    list.split(',').map(str::trim).filter(|s| !s.is_empty())
}
