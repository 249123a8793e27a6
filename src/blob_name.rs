//! Deriving output blob names from the URL of the blob that triggered us.

use std::{ffi::OsStr, path::Path as StdPath};

use percent_encoding::percent_decode_str;
use url::Url;

use crate::{error::ExtractError, prelude::*};

/// Suffix for the extracted-text blob. The content is plain text, but
/// downstream consumers already look for `.json`, so we keep it.
pub const EXTRACTED_TEXT_SUFFIX: &str = ".json";

/// Suffix for the completion output blob. The spelling matches what existing
/// consumers of the translated-text container expect.
pub const TRANSLATION_SUFFIX: &str = "_tranlation.json";

/// Parse `blob_url` as an absolute URL.
pub fn parse_blob_url(blob_url: &str) -> Result<Url, ExtractError> {
    Url::parse(blob_url).map_err(|err| ExtractError::InvalidBlobUrl {
        url: blob_url.to_owned(),
        reason: err.to_string(),
    })
}

/// Get the base name of a blob: its file name without the final extension.
///
/// `https://acct.blob.core.windows.net/container/dir/photo.jpg` becomes
/// `photo`. Virtual directories inside the container are dropped.
pub fn base_name(blob_url: &Url) -> Result<String, ExtractError> {
    let empty = || ExtractError::EmptyBaseName {
        url: blob_url.to_string(),
    };

    let segment = blob_url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|segment| !segment.is_empty())
        .ok_or_else(empty)?;
    let file_name = percent_decode_str(segment).decode_utf8_lossy();

    let stem = StdPath::new(file_name.as_ref())
        .file_stem()
        .and_then(OsStr::to_str)
        .unwrap_or_default();
    if stem.is_empty() {
        return Err(empty());
    }
    Ok(stem.to_owned())
}

/// The names of every blob one invocation may write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputNames {
    /// The base name shared by all outputs.
    pub base_name: String,
}

impl OutputNames {
    /// Derive output names from a blob URL string.
    pub fn from_blob_url(blob_url: &str) -> Result<Self, ExtractError> {
        Self::from_url(&parse_blob_url(blob_url)?)
    }

    /// Derive output names from an already-parsed blob URL.
    pub fn from_url(url: &Url) -> Result<Self, ExtractError> {
        Ok(Self {
            base_name: base_name(url)?,
        })
    }

    /// The name of the extracted-text blob.
    pub fn extracted_text(&self) -> String {
        format!("{}{EXTRACTED_TEXT_SUFFIX}", self.base_name)
    }

    /// The name of the translated-text blob.
    pub fn translation(&self) -> String {
        format!("{}{TRANSLATION_SUFFIX}", self.base_name)
    }
}

/// Does the OCR service accept this kind of file?
///
/// The Read API handles the common raster formats and PDF. We go by the
/// extension, since that's all we know before submitting the job.
pub fn is_supported_format(blob_url: &Url) -> bool {
    let Some(segment) = blob_url.path_segments().and_then(|mut s| s.next_back())
    else {
        return false;
    };
    let Some(mime) = mime_guess::from_path(segment).first() else {
        return false;
    };
    match (mime.type_().as_str(), mime.subtype().as_str()) {
        ("image", "gif" | "png" | "jpeg" | "bmp" | "tiff") => true,
        ("application", "pdf") => true,
        _ => false,
    }
}
