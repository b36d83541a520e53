//! Decryption and inspection of Musicolet backup archives.
//!
//! A backup is a zip container whose members are Blowfish/ECB encrypted with a
//! fixed key, apart from one plaintext MD5 of the manifest. [`archive`]
//! handles the container in both directions, [`store::BackupStore`] exposes
//! the decrypted playlists and the play statistics database.

pub mod archive;
pub mod cipher;
pub mod error;
pub mod path;
pub mod playlist;
pub mod store;

pub use archive::{decrypt_archive, encrypt_tree, export_members, DecryptedArchive, ManifestRecord};
pub use error::{Error, Result};
pub use playlist::SongRecord;
pub use store::{BackupStore, Period, PlayStatsRow, Ranking};
