//! Core data models for the collection index.
//!
//! Defines the entities the scanner reconciles against the file system:
//! [`Root`] (a user-chosen music folder), [`Subdir`] (any directory below a
//! root, the unit of mtime tracking) and [`Song`] (one track, possibly a
//! virtual CUE section sharing its media file with other songs).

use std::path::{Path, PathBuf};

/// Fingerprint value recorded when fingerprinting was attempted and failed.
pub const FINGERPRINT_NONE: &str = "NONE";

/// Where a song comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Source {
    #[default]
    Local,
    Device,
    Unknown,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Local => "local",
            Source::Device => "device",
            Source::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "local" => Source::Local,
            "device" => Source::Device,
            _ => Source::Unknown,
        }
    }
}

/// A user-added top-level music folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Root {
    pub id: i64,
    pub path: PathBuf,
}

impl Root {
    pub fn new(id: i64, path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            path: path.into(),
        }
    }
}

/// A directory at any depth under a [`Root`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subdir {
    /// Owning root. `None` for a fresh discovery the store has not seen yet.
    pub root_id: Option<i64>,
    pub path: PathBuf,
    /// Last-scan mtime in seconds since the epoch; 0 marks a known deletion.
    pub mtime: i64,
}

impl Subdir {
    pub fn new(root_id: i64, path: impl Into<PathBuf>, mtime: i64) -> Self {
        Self {
            root_id: Some(root_id),
            path: path.into(),
            mtime,
        }
    }

    /// A directory found on disk that the store does not know about.
    pub fn discovered(path: impl Into<PathBuf>, mtime: i64) -> Self {
        Self {
            root_id: None,
            path: path.into(),
            mtime,
        }
    }

    pub fn is_new(&self) -> bool {
        self.root_id.is_none()
    }

    pub fn is_tombstone(&self) -> bool {
        self.mtime == 0
    }
}

/// Fields the user sets through the player; the scanner only carries them
/// over from the stored record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserData {
    pub rating: Option<f32>,
    pub playcount: u32,
    pub skipcount: u32,
    pub lastplayed: Option<i64>,
    pub score: i32,
    pub grouping: Option<String>,
    pub compilation_on: bool,
    pub compilation_off: bool,
}

/// The metadata record for one track.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Song {
    /// Store id; `None` until the store assigns one.
    pub id: Option<i64>,
    pub source: Source,
    pub root_id: i64,
    /// Local path of the underlying media file.
    pub path: PathBuf,
    pub mtime: i64,
    pub ctime: i64,
    pub filesize: u64,
    pub filetype: String,

    pub title: String,
    pub artist: String,
    pub album: String,
    pub album_artist: String,
    pub composer: String,
    pub genre: String,
    pub track: Option<u32>,
    pub disc: Option<u32>,
    pub year: Option<u32>,
    pub bitrate: Option<u32>,
    pub samplerate: Option<u32>,

    /// Length of the (virtual) track.
    pub length_nanosec: Option<i64>,
    /// Offset of this track within the media file; non-zero for CUE sections.
    pub beginning_nanosec: i64,
    pub end_nanosec: Option<i64>,
    /// CUE sheet this song is a section of.
    pub cue_path: Option<PathBuf>,

    /// Empty = not computed, [`FINGERPRINT_NONE`] = attempted and failed.
    pub fingerprint: String,

    pub embedded_cover: bool,
    pub art_automatic: Option<PathBuf>,
    pub art_manual: Option<PathBuf>,

    pub unavailable: bool,
    pub last_seen: i64,

    pub user: UserData,
}

impl Song {
    pub fn new(source: Source, path: impl Into<PathBuf>) -> Self {
        Self {
            source,
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn has_cue(&self) -> bool {
        self.cue_path.is_some()
    }

    /// Directory containing the media file.
    pub fn directory(&self) -> &Path {
        self.path.parent().unwrap_or(Path::new(""))
    }

    /// Whether the tag-derived fields and the file identity match.
    ///
    /// Ignores ids, mtimes, fingerprints, art and user-set data.
    pub fn metadata_equal(&self, other: &Song) -> bool {
        self.path == other.path
            && self.title == other.title
            && self.artist == other.artist
            && self.album == other.album
            && self.album_artist == other.album_artist
            && self.composer == other.composer
            && self.genre == other.genre
            && self.track == other.track
            && self.disc == other.disc
            && self.year == other.year
            && self.bitrate == other.bitrate
            && self.samplerate == other.samplerate
            && self.length_nanosec == other.length_nanosec
            && self.beginning_nanosec == other.beginning_nanosec
            && self.end_nanosec == other.end_nanosec
            && self.cue_path == other.cue_path
            && self.filetype == other.filetype
    }

    /// Copy user-set fields from a stored record onto this freshly read one.
    pub fn merge_user_set_data(&mut self, other: &Song) {
        self.user = other.user.clone();
        if self.art_manual.is_none() {
            self.art_manual = other.art_manual.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored() -> Song {
        Song {
            id: Some(7),
            title: "Song".into(),
            artist: "Artist".into(),
            path: PathBuf::from("/m/a/song.mp3"),
            user: UserData {
                rating: Some(0.8),
                playcount: 12,
                skipcount: 3,
                lastplayed: Some(1_700_000_000),
                score: 42,
                grouping: Some("Morning".into()),
                ..Default::default()
            },
            art_manual: Some(PathBuf::from("/covers/manual.jpg")),
            ..Default::default()
        }
    }

    #[test]
    fn test_merge_user_set_data_copies_user_fields() {
        let old = stored();
        let mut fresh = Song::new(Source::Local, "/m/a/song.mp3");
        fresh.merge_user_set_data(&old);

        assert_eq!(fresh.user, old.user);
        assert_eq!(fresh.art_manual, old.art_manual);
        assert_eq!(fresh.id, None, "ids are assigned separately");
    }

    #[test]
    fn test_metadata_equal_ignores_mtime_and_user_data() {
        let a = stored();
        let mut b = a.clone();
        b.mtime = 99;
        b.id = None;
        b.user = UserData::default();
        b.fingerprint = "abc".into();
        assert!(a.metadata_equal(&b));

        b.title = "Other".into();
        assert!(!a.metadata_equal(&b));
    }

    #[test]
    fn test_metadata_equal_sees_cue_sections() {
        let a = stored();
        let mut b = a.clone();
        b.beginning_nanosec = 1_000;
        assert!(!a.metadata_equal(&b));

        let mut c = a.clone();
        c.cue_path = Some(PathBuf::from("/m/a/song.cue"));
        assert!(!a.metadata_equal(&c));
    }

    #[test]
    fn test_subdir_states() {
        assert!(Subdir::discovered("/m/a", 10).is_new());
        assert!(!Subdir::new(1, "/m/a", 10).is_new());
        assert!(Subdir::new(1, "/m/a", 0).is_tombstone());
    }

    #[test]
    fn test_source_roundtrip_strings() {
        for source in [Source::Local, Source::Device, Source::Unknown] {
            assert_eq!(Source::parse(source.as_str()), source);
        }
    }
}
