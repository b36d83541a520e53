use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::path;

/// A playlist or favourites member as stored in the backup: four parallel
/// columns, one entry per song.
#[derive(Deserialize, Debug)]
struct PlaylistDocument {
    paths: Vec<String>,

    titles: Vec<String>,

    albums: Vec<String>,

    /// Milliseconds.
    durations: Vec<i64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SongRecord {
    pub path: String,

    pub title: String,

    pub album: String,

    /// Milliseconds.
    pub duration: i64,
}

/// Decodes a playlist document into songs with normalized paths.
///
/// Columns of unequal length are truncated to the shortest one. A single
/// path that fails to normalize fails the whole playlist.
pub fn parse(document: &[u8]) -> Result<Vec<SongRecord>> {
    let document: PlaylistDocument = serde_json::from_slice(document)?;

    let lengths = [
        document.paths.len(),
        document.titles.len(),
        document.albums.len(),
        document.durations.len(),
    ];
    if lengths.iter().any(|len| *len != lengths[0]) {
        tracing::warn!(?lengths, "playlist columns differ in length, truncating to the shortest");
    }

    return document
        .paths
        .into_iter()
        .zip(document.titles)
        .zip(document.albums)
        .zip(document.durations)
        .map(|(((raw_path, title), album), duration)| -> Result<SongRecord> {
            Ok(SongRecord {
                path: path::normalize(&raw_path)?,
                title,
                album,
                duration,
            })
        })
        .collect();
}
