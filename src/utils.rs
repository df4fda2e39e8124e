//! Utility functions and helpers for uploads

use std::path::Path;

use crate::core::resolver::encode_data_uri;

/// Validate that a file has an allowed extension
#[cfg_attr(not(feature = "web"), allow(dead_code))]
pub(crate) fn validate_file_extension<S: AsRef<str>>(filename: &str, allowed_extensions: &[S]) -> bool {
    if let Some(ext) = Path::new(filename).extension() {
        if let Some(ext_str) = ext.to_str() {
            return allowed_extensions
                .iter()
                .any(|e| e.as_ref().eq_ignore_ascii_case(ext_str));
        }
    }
    false
}

/// Wrap uploaded bytes in a data URI, guessing the MIME type from the file name
#[cfg_attr(not(feature = "web"), allow(dead_code))]
pub(crate) fn upload_to_data_uri(filename: &str, data: &[u8]) -> String {
    let mime = mime_guess::from_path(filename).first_or_octet_stream();
    encode_data_uri(mime.essence_str(), data)
}
