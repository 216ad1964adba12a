//! SQLite-backed collection store.
//!
//! Uses SQLx with SQLite for lightweight, embedded storage. The scanner
//! runs on a plain worker thread, so [`SqliteStore`] owns a current-thread
//! tokio runtime and drives every query through `block_on`. The runtime sits
//! behind a mutex, which also serialises access from the worker and the
//! event consumer.
//!
//! # Example
//!
//! ```ignore
//! use collection_watcher::db::SqliteStore;
//! use collection_watcher::store::Store;
//!
//! let store = SqliteStore::open(Path::new("collection.db"))?;
//! let songs = store.songs_in_root(1)?;
//! ```

use std::future::Future;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use sqlx::migrate::MigrateDatabase;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use crate::error::{Result, ResultExt};
use crate::model::{Root, Song, Source, Subdir, UserData};
use crate::store::{Store, StoreWriter, expiry_cutoff};

/// Default database filename.
pub const DEFAULT_DB_NAME: &str = "collection.db";

/// Build a SQLite database URL from an optional path.
pub fn db_url(path: Option<&Path>) -> String {
    match path {
        Some(p) => format!("sqlite:{}", p.display()),
        None => format!("sqlite:{}", DEFAULT_DB_NAME),
    }
}

/// Initialize the database connection pool and run migrations.
///
/// Creates the database file if it doesn't exist.
pub async fn init_db(db_url: &str) -> Result<SqlitePool> {
    if !sqlx::Sqlite::database_exists(db_url).await.unwrap_or(false) {
        sqlx::Sqlite::create_database(db_url).await?;
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(db_url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

/// In-memory database; a single connection so every query sees the same data.
pub async fn init_memory_db() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct SongRow {
    id: i64,
    source: String,
    root_id: i64,
    path: String,
    mtime: i64,
    ctime: i64,
    filesize: i64,
    filetype: String,
    title: String,
    artist: String,
    album: String,
    album_artist: String,
    composer: String,
    genre: String,
    track: Option<i64>,
    disc: Option<i64>,
    year: Option<i64>,
    bitrate: Option<i64>,
    samplerate: Option<i64>,
    length_nanosec: Option<i64>,
    beginning_nanosec: i64,
    end_nanosec: Option<i64>,
    cue_path: Option<String>,
    fingerprint: String,
    embedded_cover: bool,
    art_automatic: Option<String>,
    art_manual: Option<String>,
    unavailable: bool,
    last_seen: i64,
    rating: Option<f64>,
    playcount: i64,
    skipcount: i64,
    lastplayed: Option<i64>,
    score: i64,
    grouping: Option<String>,
    compilation_on: bool,
    compilation_off: bool,
}

fn opt_u32(v: Option<i64>) -> Option<u32> {
    v.and_then(|v| u32::try_from(v).ok())
}

impl From<SongRow> for Song {
    fn from(row: SongRow) -> Self {
        Song {
            id: Some(row.id),
            source: Source::parse(&row.source),
            root_id: row.root_id,
            path: PathBuf::from(row.path),
            mtime: row.mtime,
            ctime: row.ctime,
            filesize: row.filesize.max(0) as u64,
            filetype: row.filetype,
            title: row.title,
            artist: row.artist,
            album: row.album,
            album_artist: row.album_artist,
            composer: row.composer,
            genre: row.genre,
            track: opt_u32(row.track),
            disc: opt_u32(row.disc),
            year: opt_u32(row.year),
            bitrate: opt_u32(row.bitrate),
            samplerate: opt_u32(row.samplerate),
            length_nanosec: row.length_nanosec,
            beginning_nanosec: row.beginning_nanosec,
            end_nanosec: row.end_nanosec,
            cue_path: row.cue_path.map(PathBuf::from),
            fingerprint: row.fingerprint,
            embedded_cover: row.embedded_cover,
            art_automatic: row.art_automatic.map(PathBuf::from),
            art_manual: row.art_manual.map(PathBuf::from),
            unavailable: row.unavailable,
            last_seen: row.last_seen,
            user: UserData {
                rating: row.rating.map(|r| r as f32),
                playcount: row.playcount.max(0) as u32,
                skipcount: row.skipcount.max(0) as u32,
                lastplayed: row.lastplayed,
                score: row.score as i32,
                grouping: row.grouping,
                compilation_on: row.compilation_on,
                compilation_off: row.compilation_off,
            },
        }
    }
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Collection store persisted in SQLite.
pub struct SqliteStore {
    runtime: Mutex<tokio::runtime::Runtime>,
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and migrate it.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).with_context(format!("creating {}", dir.display()))?;
        }
        let url = db_url(Some(path));
        Self::with_runtime(|| init_db(&url))
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_runtime(init_memory_db)
    }

    fn with_runtime<F, Fut>(init: F) -> Result<Self>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<SqlitePool>>,
    {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let pool = runtime.block_on(init())?;
        tracing::debug!(target: "db", "Database ready");
        Ok(Self {
            runtime: Mutex::new(runtime),
            pool,
        })
    }

    fn block_on<T>(&self, fut: impl Future<Output = T>) -> T {
        self.runtime.lock().block_on(fut)
    }

    /// The root registered for `path`, registering it on first use.
    pub fn root(&self, path: &Path) -> Result<Root> {
        let text = path_text(path);
        let id: i64 = self
            .block_on(async {
                sqlx::query("INSERT OR IGNORE INTO roots (path) VALUES (?)")
                    .bind(&text)
                    .execute(&self.pool)
                    .await?;
                sqlx::query_scalar::<_, i64>("SELECT id FROM roots WHERE path = ?")
                    .bind(&text)
                    .fetch_one(&self.pool)
                    .await
            })
            .with_context(format!("registering root {}", path.display()))?;
        Ok(Root::new(id, path))
    }

    /// Every registered root.
    pub fn roots(&self) -> Result<Vec<Root>> {
        let rows: Vec<(i64, String)> = self.block_on(
            sqlx::query_as("SELECT id, path FROM roots ORDER BY id").fetch_all(&self.pool),
        )?;
        Ok(rows.into_iter().map(|(id, path)| Root::new(id, path)).collect())
    }

    /// Every stored song ordered by path, for listings.
    pub fn all_songs(&self) -> Result<Vec<Song>> {
        let rows = self.block_on(
            sqlx::query_as::<_, SongRow>("SELECT * FROM songs ORDER BY path, beginning_nanosec")
                .fetch_all(&self.pool),
        )?;
        Ok(into_songs(rows))
    }
}

fn into_songs(rows: Vec<SongRow>) -> Vec<Song> {
    rows.into_iter().map(Song::from).collect()
}

impl Store for SqliteStore {
    fn subdirs_in_root(&self, root_id: i64) -> Result<Vec<Subdir>> {
        let rows: Vec<(i64, String, i64)> = self.block_on(
            sqlx::query_as("SELECT root_id, path, mtime FROM subdirs WHERE root_id = ? ORDER BY path")
                .bind(root_id)
                .fetch_all(&self.pool),
        )?;
        Ok(rows
            .into_iter()
            .map(|(root_id, path, mtime)| Subdir::new(root_id, path, mtime))
            .collect())
    }

    fn songs_in_root(&self, root_id: i64) -> Result<Vec<Song>> {
        let rows = self.block_on(
            sqlx::query_as::<_, SongRow>("SELECT * FROM songs WHERE root_id = ?")
                .bind(root_id)
                .fetch_all(&self.pool),
        )?;
        Ok(into_songs(rows))
    }

    fn songs_missing_fingerprint(&self, root_id: i64) -> Result<Vec<Song>> {
        let rows = self.block_on(
            sqlx::query_as::<_, SongRow>(
                "SELECT * FROM songs WHERE root_id = ? AND fingerprint = ''",
            )
            .bind(root_id)
            .fetch_all(&self.pool),
        )?;
        Ok(into_songs(rows))
    }

    fn songs_by_path(&self, path: &Path) -> Result<Vec<Song>> {
        let rows = self.block_on(
            sqlx::query_as::<_, SongRow>("SELECT * FROM songs WHERE path = ?")
                .bind(path_text(path))
                .fetch_all(&self.pool),
        )?;
        Ok(into_songs(rows))
    }

    fn songs_by_fingerprint(&self, fingerprint: &str) -> Result<Vec<Song>> {
        let rows = self.block_on(
            sqlx::query_as::<_, SongRow>("SELECT * FROM songs WHERE fingerprint = ?")
                .bind(fingerprint)
                .fetch_all(&self.pool),
        )?;
        Ok(into_songs(rows))
    }

    fn close(&self) {
        self.block_on(self.pool.close());
        tracing::debug!(target: "db", "Database closed");
    }
}

impl StoreWriter for SqliteStore {
    fn add_or_update_songs(&self, songs: &[Song]) -> Result<()> {
        self.block_on(async {
            let mut tx = self.pool.begin().await?;
            for song in songs {
                sqlx::query(
                    "INSERT OR REPLACE INTO songs (
                        id, source, root_id, path, mtime, ctime, filesize, filetype,
                        title, artist, album, album_artist, composer, genre,
                        track, disc, year, bitrate, samplerate,
                        length_nanosec, beginning_nanosec, end_nanosec, cue_path,
                        fingerprint, embedded_cover, art_automatic, art_manual,
                        unavailable, last_seen,
                        rating, playcount, skipcount, lastplayed, score, grouping,
                        compilation_on, compilation_off
                    ) VALUES (
                        ?, ?, ?, ?, ?, ?, ?, ?,
                        ?, ?, ?, ?, ?, ?,
                        ?, ?, ?, ?, ?,
                        ?, ?, ?, ?,
                        ?, ?, ?, ?,
                        0, ?,
                        ?, ?, ?, ?, ?, ?,
                        ?, ?
                    )",
                )
                .bind(song.id)
                .bind(song.source.as_str())
                .bind(song.root_id)
                .bind(path_text(&song.path))
                .bind(song.mtime)
                .bind(song.ctime)
                .bind(song.filesize as i64)
                .bind(&song.filetype)
                .bind(&song.title)
                .bind(&song.artist)
                .bind(&song.album)
                .bind(&song.album_artist)
                .bind(&song.composer)
                .bind(&song.genre)
                .bind(song.track.map(i64::from))
                .bind(song.disc.map(i64::from))
                .bind(song.year.map(i64::from))
                .bind(song.bitrate.map(i64::from))
                .bind(song.samplerate.map(i64::from))
                .bind(song.length_nanosec)
                .bind(song.beginning_nanosec)
                .bind(song.end_nanosec)
                .bind(song.cue_path.as_deref().map(path_text))
                .bind(&song.fingerprint)
                .bind(song.embedded_cover)
                .bind(song.art_automatic.as_deref().map(path_text))
                .bind(song.art_manual.as_deref().map(path_text))
                .bind(song.last_seen)
                .bind(song.user.rating.map(f64::from))
                .bind(i64::from(song.user.playcount))
                .bind(i64::from(song.user.skipcount))
                .bind(song.user.lastplayed)
                .bind(i64::from(song.user.score))
                .bind(song.user.grouping.as_deref())
                .bind(song.user.compilation_on)
                .bind(song.user.compilation_off)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await
        })
        .with_context("saving songs")
    }

    fn update_mtimes(&self, songs: &[Song]) -> Result<()> {
        self.block_on(async {
            let mut tx = self.pool.begin().await?;
            for song in songs {
                sqlx::query("UPDATE songs SET mtime = ? WHERE id = ?")
                    .bind(song.mtime)
                    .bind(song.id)
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await
        })
        .with_context("updating mtimes")
    }

    fn delete_songs(&self, songs: &[Song]) -> Result<()> {
        self.block_on(async {
            let mut tx = self.pool.begin().await?;
            for id in songs.iter().filter_map(|s| s.id) {
                sqlx::query("DELETE FROM songs WHERE id = ?")
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await
        })
        .with_context("deleting songs")
    }

    fn set_unavailable(&self, songs: &[Song], unavailable: bool) -> Result<()> {
        self.block_on(async {
            let mut tx = self.pool.begin().await?;
            for id in songs.iter().filter_map(|s| s.id) {
                sqlx::query("UPDATE songs SET unavailable = ? WHERE id = ?")
                    .bind(unavailable)
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await
        })
        .with_context("updating availability")
    }

    fn upsert_subdirs(&self, subdirs: &[Subdir]) -> Result<()> {
        self.block_on(async {
            let mut tx = self.pool.begin().await?;
            for subdir in subdirs {
                let Some(root_id) = subdir.root_id else {
                    continue;
                };
                if subdir.is_tombstone() {
                    sqlx::query("DELETE FROM subdirs WHERE root_id = ? AND path = ?")
                        .bind(root_id)
                        .bind(path_text(&subdir.path))
                        .execute(&mut *tx)
                        .await?;
                } else {
                    sqlx::query(
                        "INSERT OR REPLACE INTO subdirs (root_id, path, mtime) VALUES (?, ?, ?)",
                    )
                    .bind(root_id)
                    .bind(path_text(&subdir.path))
                    .bind(subdir.mtime)
                    .execute(&mut *tx)
                    .await?;
                }
            }
            tx.commit().await
        })
        .with_context("saving subdirs")
    }

    fn update_last_seen(&self, root_id: i64, expire_days: i64, now: i64) -> Result<()> {
        let expired = self
            .block_on(async {
                let mut tx = self.pool.begin().await?;
                sqlx::query("UPDATE songs SET last_seen = ? WHERE root_id = ? AND unavailable = 0")
                    .bind(now)
                    .bind(root_id)
                    .execute(&mut *tx)
                    .await?;
                let mut expired = 0;
                if expire_days > 0 {
                    expired = sqlx::query(
                        "DELETE FROM songs WHERE root_id = ? AND unavailable = 1 AND last_seen < ?",
                    )
                    .bind(root_id)
                    .bind(expiry_cutoff(now, expire_days))
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
                }
                tx.commit().await?;
                Ok::<_, sqlx::Error>(expired)
            })
            .with_context("updating last seen")?;

        if expired > 0 {
            tracing::info!(target: "db", root_id, expired, "Expired unavailable songs");
        }
        Ok(())
    }
}
