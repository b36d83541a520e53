//! Normalization of the three media reference schemes found in backup records.
//!
//! Every reference resolves to a forward-slash path relative to the device's
//! primary storage, e.g. `Music/Artist/Album/01.opus`. Percent-decoding runs
//! once, on the composed result, so encoded delimiters inside a component
//! never split it.

use std::borrow::Cow;

use percent_encoding::percent_decode_str;

use crate::error::{Error, Result};

const FILE_SCHEME: &str = "file://";
const MUSICOLET_SCHEME: &str = "musicolet://";
const CONTENT_SCHEME: &str = "content://";

/// Absolute path of the primary storage root on the device.
const STORAGE_ROOT: &str = "/storage/emulated/0/";

const DIRECTORY_PARAM: &str = "p_rp";
const FILENAME_PARAM: &str = "p_dn";

const DOCUMENT_MARKERS: [&str; 3] = ["document/primary:", "document/primary%3A", "document/primary%3a"];

/// A media reference split by scheme. The remainder after the scheme prefix
/// is kept verbatim until [`Reference::normalize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reference<'a> {
    /// `file:///storage/emulated/0/Music/a.mp3`
    File(&'a str),
    /// `musicolet://media-store?p_rp=Music&p_dn=a.mp3`
    Musicolet(&'a str),
    /// `content://.../document/primary%3AMusic%2Fa.mp3`
    Content(&'a str),
}

impl<'a> Reference<'a> {
    pub fn parse(raw: &'a str) -> Result<Self> {
        if let Some(rest) = raw.strip_prefix(FILE_SCHEME) {
            return Ok(Reference::File(rest));
        }

        if let Some(rest) = raw.strip_prefix(MUSICOLET_SCHEME) {
            return Ok(Reference::Musicolet(rest));
        }

        if let Some(rest) = raw.strip_prefix(CONTENT_SCHEME) {
            return Ok(Reference::Content(rest));
        }

        return Err(Error::UnsupportedScheme(raw.to_string()));
    }

    pub fn normalize(self) -> Result<String> {
        match self {
            Reference::File(rest) => {
                let relative = match rest.find(STORAGE_ROOT) {
                    Some(index) => &rest[index + STORAGE_ROOT.len()..],
                    None => rest,
                };
                decode(relative, rest)
            }
            Reference::Musicolet(rest) => {
                let (_, query) = rest
                    .split_once('?')
                    .ok_or_else(|| Error::malformed(rest, "no query string"))?;

                let mut directory = None;
                let mut filename = None;
                for pair in query.split('&') {
                    match pair.split_once('=') {
                        Some((DIRECTORY_PARAM, value)) => directory = Some(value.trim()),
                        Some((FILENAME_PARAM, value)) => filename = Some(value.trim()),
                        _ => {}
                    }
                }

                let directory =
                    directory.ok_or_else(|| Error::malformed(rest, "missing directory parameter"))?;
                let filename =
                    filename.ok_or_else(|| Error::malformed(rest, "missing filename parameter"))?;
                if filename.is_empty() {
                    return Err(Error::malformed(rest, "empty filename parameter"));
                }

                let directory = directory.trim_end_matches('/');
                if directory.is_empty() {
                    decode(filename, rest)
                } else {
                    decode(&format!("{directory}/{filename}"), rest)
                }
            }
            Reference::Content(rest) => {
                let index = DOCUMENT_MARKERS
                    .iter()
                    .filter_map(|marker| rest.rfind(marker).map(|index| index + marker.len()))
                    .max()
                    .ok_or_else(|| Error::malformed(rest, "no primary document marker"))?;

                let relative = &rest[index..];
                if relative.is_empty() {
                    return Err(Error::malformed(rest, "empty document path"));
                }
                decode(relative, rest)
            }
        }
    }
}

fn decode(path: &str, reference: &str) -> Result<String> {
    return percent_decode_str(path)
        .decode_utf8()
        .map(Cow::into_owned)
        .map_err(|_| Error::malformed(reference, "percent-encoding is not valid UTF-8"));
}

/// Resolves any supported media reference to its storage-relative path.
pub fn normalize(raw: &str) -> Result<String> {
    return Reference::parse(raw)?.normalize();
}
