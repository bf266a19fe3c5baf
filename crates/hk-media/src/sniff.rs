//! Content-type detection from magic bytes.

/// How much of the head the sniffer looks at.
pub const SNIFF_LEN: usize = 512;

/// Known file signatures, checked in order.
const SIGNATURES: &[(&[u8], &str)] = &[
    (b"\xFF\xD8\xFF", "image/jpeg"),
    (b"\x89PNG\r\n\x1a\n", "image/png"),
    (b"GIF87a", "image/gif"),
    (b"GIF89a", "image/gif"),
];

/// Detect the content type from the first bytes of a file.
///
/// MP4 does not anchor its signature at offset zero: the `ftyp` box sits
/// after a length prefix, so it is matched by scanning the head.
pub fn detect(head: &[u8]) -> Option<&'static str> {
    for (signature, content_type) in SIGNATURES {
        if head.starts_with(signature) {
            return Some(content_type);
        }
    }

    let scan = &head[..head.len().min(32)];
    if find(scan, b"ftyp").is_some()
        && (find(scan, b"mp4").is_some() || find(scan, b"M4V").is_some() || find(scan, b"isom").is_some())
    {
        return Some("video/mp4");
    }

    None
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jpeg_detected() {
        assert_eq!(detect(b"\xFF\xD8\xFF\xE0rest-of-jfif"), Some("image/jpeg"));
    }

    #[test]
    fn png_detected() {
        assert_eq!(detect(b"\x89PNG\r\n\x1a\nIHDR"), Some("image/png"));
    }

    #[test]
    fn both_gif_variants_detected() {
        assert_eq!(detect(b"GIF87a...."), Some("image/gif"));
        assert_eq!(detect(b"GIF89a...."), Some("image/gif"));
    }

    #[test]
    fn mp4_detected_behind_length_prefix() {
        assert_eq!(detect(b"\x00\x00\x00\x18ftypmp42\x00\x00\x00\x00"), Some("video/mp4"));
        assert_eq!(detect(b"\x00\x00\x00\x20ftypisom\x00\x00\x02\x00"), Some("video/mp4"));
    }

    #[test]
    fn unknown_bytes_are_none() {
        assert_eq!(detect(b"plain text file"), None);
        assert_eq!(detect(b""), None);
    }

    #[test]
    fn truncated_head_is_safe() {
        assert_eq!(detect(b"\xFF"), None);
        assert_eq!(detect(b"GIF8"), None);
    }
}
