//! Mime detection and the convertible allow-list

/// Mime types that get a converted rendition after upload
const CONVERTIBLE: &[&str] = &[
    // office documents, converted to PDF
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.ms-powerpoint",
    "application/vnd.openxmlformats-officedocument.presentationml.presentation",
    // images browsers can't display
    "image/bmp",
    "image/x-ms-bmp",
    "image/tiff",
];

/// Mime type guessed from a file name, `unknown` if the extension is unknown
pub fn mime_type_for(name: &str) -> String {
    mime_guess::from_path(name)
        .first_raw()
        .unwrap_or("unknown")
        .to_string()
}

pub fn is_convertible(mime_type: &str) -> bool {
    CONVERTIBLE.contains(&mime_type)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guess() {
        assert_eq!(mime_type_for("file.txt"), "text/plain");
        assert_eq!(mime_type_for("report.doc"), "application/msword");
        assert_eq!(mime_type_for("no_extension"), "unknown");
    }

    #[test]
    fn test_convertible() {
        assert!(is_convertible("image/tiff"));
        assert!(is_convertible(
            "application/vnd.openxmlformats-officedocument.presentationml.presentation"
        ));
        assert!(is_convertible(&mime_type_for("slides.ppt")));
        assert!(!is_convertible("text/plain"));
        assert!(!is_convertible("image/png"));
    }
}
