//! Derived object names: `<basename>_<width><ext>`.

use crate::models::sizes::SizeCatalog;

/// Split a path-style object name at the extension of its last segment.
///
/// Dots in directory components never start an extension, and a name whose
/// last segment has no dot has an empty extension.
pub fn split_extension(name: &str) -> (&str, &str) {
    let segment_start = name.rfind('/').map(|i| i + 1).unwrap_or(0);
    match name[segment_start..].rfind('.') {
        Some(dot) => name.split_at(segment_start + dot),
        None => (name, ""),
    }
}

/// Compute the derivative name of `name` at `width`.
///
/// Returns `None` when the basename already ends in `_<w>` for any width of
/// the catalog, whichever width is being derived.
pub fn derive_name(name: &str, width: u32, sizes: &SizeCatalog) -> Option<String> {
    let (basename, ext) = split_extension(name);
    if sizes.suffix_of(basename).is_some() {
        return None;
    }
    Some(format!("{}_{}{}", basename, width, ext))
}
