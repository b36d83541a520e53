//! Query surface over a decrypted backup.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tempfile::TempDir;

use crate::archive::{self, DecryptFailure, DecryptedArchive};
use crate::error::{Error, Result};
use crate::path;
use crate::playlist::{self, SongRecord};

/// The SQLite database holding per-song play statistics.
pub const SONGS_DB_MEMBER: &str = "DB_SONGS_LOG";

pub const PLAYLIST_SUFFIX: &str = ".playlist";

/// Playlist name reserved for the favourites list.
pub const FAVORITES_PLAYLIST: &str = "FAVOURITES";

const SONG_COLUMNS: &str = "COL_TITLE, COL_ALBUM, COL_ARTIST, COL_DURATION, COL_PATH, \
    COL_NUM_PLAYED, COL_NUM_PLAYED_Y, COL_NUM_PLAYED_M, COL_NUM_PLAYED_W";

/// Counter granularity in `TABLE_SONGS`.
///
/// Only [`Period::AllTime`] is exact. The yearly, monthly and weekly counters
/// reset on a schedule the app does not document, so totals derived from them
/// are approximations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Period {
    AllTime,
    Year,
    Month,
    Week,
}

impl Period {
    fn column(self) -> &'static str {
        match self {
            Period::AllTime => "COL_NUM_PLAYED",
            Period::Year => "COL_NUM_PLAYED_Y",
            Period::Month => "COL_NUM_PLAYED_M",
            Period::Week => "COL_NUM_PLAYED_W",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Ranking {
    /// All-time play count.
    Plays,
    /// Play count multiplied by duration.
    Time,
}

impl Ranking {
    fn order_by(self) -> &'static str {
        match self {
            Ranking::Plays => "COL_NUM_PLAYED",
            Ranking::Time => "COL_NUM_PLAYED * COL_DURATION",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlayCounts {
    pub all_time: i64,

    pub year: i64,

    pub month: i64,

    pub week: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayStatsRow {
    pub title: String,

    pub album: String,

    pub artist: String,

    /// Milliseconds.
    pub duration: i64,

    /// As stored, in any of the supported reference schemes.
    pub raw_path: String,

    pub plays: PlayCounts,
}

impl PlayStatsRow {
    /// Normalizes [`PlayStatsRow::raw_path`]. Computed on every call.
    pub fn path(&self) -> Result<String> {
        return path::normalize(&self.raw_path);
    }
}

impl sqlx::FromRow<'_, SqliteRow> for PlayStatsRow {
    fn from_row(row: &SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        let text = |column: &str| -> std::result::Result<String, sqlx::Error> {
            Ok(row.try_get::<Option<String>, _>(column)?.unwrap_or_default())
        };
        let integer = |column: &str| -> std::result::Result<i64, sqlx::Error> {
            Ok(row.try_get::<Option<i64>, _>(column)?.unwrap_or_default())
        };

        Ok(Self {
            title: text("COL_TITLE")?,
            album: text("COL_ALBUM")?,
            artist: text("COL_ARTIST")?,
            duration: integer("COL_DURATION")?,
            raw_path: text("COL_PATH")?,
            plays: PlayCounts {
                all_time: integer("COL_NUM_PLAYED")?,
                year: integer("COL_NUM_PLAYED_Y")?,
                month: integer("COL_NUM_PLAYED_M")?,
                week: integer("COL_NUM_PLAYED_W")?,
            },
        })
    }
}

/// A decrypted backup together with a read handle on its songs database.
///
/// The database member is copied into a temporary directory owned by the
/// store, next to any journal files SQLite creates for it. The directory is
/// removed by [`BackupStore::close`], or when the store is dropped.
pub struct BackupStore {
    members: BTreeMap<String, Vec<u8>>,

    failures: Vec<DecryptFailure>,

    // Declared before `workspace` so it is dropped first.
    pool: SqlitePool,

    database: PathBuf,

    workspace: TempDir,
}

impl BackupStore {
    pub async fn open(path: &Path) -> Result<Self> {
        let archive = archive::decrypt_archive(path)?;

        return Self::from_archive(archive).await;
    }

    pub async fn from_archive(archive: DecryptedArchive) -> Result<Self> {
        return Self::from_archive_in(archive, &std::env::temp_dir()).await;
    }

    /// Like [`BackupStore::from_archive`], with the temporary directory
    /// created under `parent`.
    pub async fn from_archive_in(archive: DecryptedArchive, parent: &Path) -> Result<Self> {
        let songs = archive
            .members
            .get(SONGS_DB_MEMBER)
            .ok_or_else(|| Error::MissingRequiredMember(SONGS_DB_MEMBER.to_string()))?;

        let workspace = tempfile::Builder::new()
            .prefix("musicolet-songs-")
            .tempdir_in(parent)?;

        let database = workspace.path().join(SONGS_DB_MEMBER);

        fs::write(&database, songs)?;

        let options = SqliteConnectOptions::new()
            .filename(&database)
            .read_only(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        // Opening is lazy, a member that is not a songs database only fails on first use.
        if let Err(error) = sqlx::query("SELECT 1 FROM TABLE_SONGS LIMIT 0")
            .execute(&pool)
            .await
        {
            pool.close().await;
            return Err(error.into());
        }

        tracing::debug!(path = ?database, "opened songs database");

        return Ok(Self {
            members: archive.members,
            failures: archive.failures,
            pool,
            database,
            workspace,
        });
    }

    /// Closes the database and deletes its temporary directory.
    pub async fn close(self) -> Result<()> {
        self.pool.close().await;

        self.workspace.close()?;

        return Ok(());
    }

    pub fn database_path(&self) -> &Path {
        &self.database
    }

    pub fn member(&self, name: &str) -> Option<&[u8]> {
        self.members.get(name).map(Vec::as_slice)
    }

    pub fn members(&self) -> impl Iterator<Item = &str> {
        self.members.keys().map(String::as_str)
    }

    pub fn decrypt_failures(&self) -> &[DecryptFailure] {
        &self.failures
    }

    /// Most played songs first. A `limit` of zero returns every row.
    pub async fn top_songs_by_play_count(&self, limit: i64) -> Result<Vec<PlayStatsRow>> {
        return self.top_songs(Ranking::Plays, limit).await;
    }

    /// Songs ordered by play count times duration, an estimate of total
    /// listening time. A `limit` of zero returns every row.
    pub async fn top_songs_by_listen_time(&self, limit: i64) -> Result<Vec<PlayStatsRow>> {
        return self.top_songs(Ranking::Time, limit).await;
    }

    pub async fn top_songs(&self, ranking: Ranking, limit: i64) -> Result<Vec<PlayStatsRow>> {
        if limit < 0 {
            return Err(Error::InvalidArgument(format!("limit must not be negative, got {limit}")));
        }

        // SQLite treats a negative LIMIT as unbounded.
        let limit = if limit == 0 { -1 } else { limit };

        let query = format!(
            "SELECT {SONG_COLUMNS} FROM TABLE_SONGS ORDER BY {} DESC, rowid LIMIT ?",
            ranking.order_by()
        );

        let rows = sqlx::query_as::<_, PlayStatsRow>(&query)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        return Ok(rows);
    }

    /// Sum of plays times duration over every song, in milliseconds.
    pub async fn listening_time(&self, period: Period) -> Result<i64> {
        let query = format!(
            "SELECT COALESCE(SUM({} * COL_DURATION), 0) FROM TABLE_SONGS",
            period.column()
        );

        let total = sqlx::query_scalar::<_, i64>(&query)
            .fetch_one(&self.pool)
            .await?;

        return Ok(total);
    }

    pub fn favorites(&self) -> Result<Vec<SongRecord>> {
        return self.get_playlist(FAVORITES_PLAYLIST);
    }

    pub fn get_playlist(&self, name: &str) -> Result<Vec<SongRecord>> {
        let member = format!("{name}{PLAYLIST_SUFFIX}");

        let document = self
            .members
            .get(&member)
            .ok_or_else(|| Error::NotFound(format!("playlist {name}")))?;

        return playlist::parse(document);
    }

    /// User playlist names in sorted order, favourites excluded.
    pub fn list_playlist_names(&self) -> Vec<String> {
        self.members
            .keys()
            .filter_map(|member| member.strip_suffix(PLAYLIST_SUFFIX))
            .filter(|name| *name != FAVORITES_PLAYLIST)
            .map(String::from)
            .collect()
    }

    pub fn export_decrypted_members(&self, target: &Path) -> Result<()> {
        return archive::export_members(&self.members, target);
    }
}
