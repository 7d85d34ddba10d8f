//! Eligibility check run before any byte of an object is read.

use crate::models::metadata::ObjectAttributes;
use serde::Serialize;
use std::fmt;

/// Why an object was left alone.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The object is itself a derivative.
    AlreadyResized,
    /// The content type is not `image/*`.
    NotAnImage { content_type: String },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::AlreadyResized => f.write_str("object is already resized"),
            SkipReason::NotAnImage { content_type } => {
                write!(f, "content type `{}` is not an image", content_type)
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Eligibility {
    Proceed,
    Skip(SkipReason),
}

/// Decide whether an object may be fed to the transform pipeline.
pub fn check(attrs: &ObjectAttributes) -> Eligibility {
    if attrs.is_resized() {
        return Eligibility::Skip(SkipReason::AlreadyResized);
    }
    if !attrs.content_type.starts_with("image/") {
        return Eligibility::Skip(SkipReason::NotAnImage {
            content_type: attrs.content_type.clone(),
        });
    }
    Eligibility::Proceed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::metadata::RESIZED_KEY;

    #[test]
    fn images_proceed() {
        assert_eq!(check(&ObjectAttributes::new("image/jpeg")), Eligibility::Proceed);
        assert_eq!(
            check(&ObjectAttributes::new("image/png").with_metadata("author", "kim")),
            Eligibility::Proceed
        );
    }

    #[test]
    fn derivatives_are_skipped_before_content_type() {
        let attrs = ObjectAttributes::new("application/pdf").with_metadata(RESIZED_KEY, "true");
        assert_eq!(check(&attrs), Eligibility::Skip(SkipReason::AlreadyResized));
    }

    #[test]
    fn only_the_exact_marker_value_counts() {
        let attrs = ObjectAttributes::new("image/jpeg").with_metadata(RESIZED_KEY, "false");
        assert_eq!(check(&attrs), Eligibility::Proceed);
    }

    #[test]
    fn non_images_are_skipped() {
        for content_type in ["application/pdf", "", "text/plain", "IMAGE/JPEG", "video/mp4"] {
            assert_eq!(
                check(&ObjectAttributes::new(content_type)),
                Eligibility::Skip(SkipReason::NotAnImage {
                    content_type: content_type.to_string()
                })
            );
        }
    }
}
