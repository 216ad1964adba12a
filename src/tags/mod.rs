//! Tag reading.
//!
//! The scanner treats tag reading as a blocking oracle: given a path it
//! answers whether the file is media at all, and reads a [`Song`] from it.
//! [`LoftyTagReader`] is the real implementation; tests use a text-based
//! fake.

use std::borrow::Cow;
use std::path::Path;
use std::time::UNIX_EPOCH;

use lofty::file::{AudioFile, FileType, TaggedFileExt};
use lofty::probe::Probe;
use lofty::tag::{Accessor, ItemKey};

use crate::model::{Song, Source};
use crate::paths::extension_part;

/// Reads metadata from media files.
pub trait TagReader: Send + Sync {
    /// Cheap check, usually by extension.
    fn is_media_file(&self, path: &Path) -> bool;

    /// Read a song from `path`; `None` when the file is not readable media.
    fn read_file(&self, path: &Path) -> Option<Song>;
}

/// File-system facts every reader stamps onto a song.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub mtime: i64,
    pub ctime: i64,
    pub size: u64,
}

impl FileStat {
    pub fn read(path: &Path) -> Option<Self> {
        let meta = std::fs::metadata(path).ok()?;
        let secs = |t: std::io::Result<std::time::SystemTime>| {
            t.ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
        };
        let mtime = secs(meta.modified()).unwrap_or(0);
        Some(Self {
            mtime,
            ctime: secs(meta.created()).unwrap_or(mtime),
            size: meta.len(),
        })
    }

    /// A fresh song for `path` carrying these facts.
    pub fn song(&self, path: &Path) -> Song {
        Song {
            mtime: self.mtime,
            ctime: self.ctime,
            filesize: self.size,
            filetype: extension_part(path),
            ..Song::new(Source::Local, path)
        }
    }
}

fn text(value: Option<Cow<'_, str>>) -> String {
    value.map(Cow::into_owned).unwrap_or_default()
}

/// Tag reader backed by `lofty`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoftyTagReader;

impl TagReader for LoftyTagReader {
    fn is_media_file(&self, path: &Path) -> bool {
        path.extension()
            .and_then(FileType::from_ext)
            .is_some()
    }

    fn read_file(&self, path: &Path) -> Option<Song> {
        let stat = FileStat::read(path)?;

        let tagged_file = match Probe::open(path).and_then(|p| p.read()) {
            Ok(f) => f,
            Err(e) => {
                tracing::debug!(target: "tags", path = %path.display(), "Unreadable tags: {}", e);
                return None;
            }
        };

        let mut song = stat.song(path);

        let tag = tagged_file
            .primary_tag()
            .or_else(|| tagged_file.first_tag());

        if let Some(tag) = tag {
            song.title = text(tag.title());
            song.artist = text(tag.artist());
            song.album = text(tag.album());
            song.genre = text(tag.genre());
            song.album_artist = tag
                .get_string(&ItemKey::AlbumArtist)
                .unwrap_or_default()
                .to_string();
            song.composer = tag
                .get_string(&ItemKey::Composer)
                .unwrap_or_default()
                .to_string();
            song.track = tag.track();
            song.disc = tag.disk();
            song.year = tag.year();
        }

        song.embedded_cover = tagged_file
            .tags()
            .iter()
            .any(|t| !t.pictures().is_empty());

        let properties = tagged_file.properties();
        let length = properties.duration().as_nanos();
        song.length_nanosec = (length > 0).then_some(length as i64);
        song.bitrate = properties.audio_bitrate();
        song.samplerate = properties.sample_rate();

        Some(song)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::wav_bytes;

    #[test]
    fn test_is_media_file_by_extension() {
        let reader = LoftyTagReader;
        assert!(reader.is_media_file(Path::new("/m/a.mp3")));
        assert!(reader.is_media_file(Path::new("/m/a.FLAC")));
        assert!(reader.is_media_file(Path::new("/m/a.wav")));
        assert!(!reader.is_media_file(Path::new("/m/a.jpg")));
        assert!(!reader.is_media_file(Path::new("/m/a.cue")));
        assert!(!reader.is_media_file(Path::new("/m/README")));
    }

    #[test]
    fn test_read_wav() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("tone.wav");
        std::fs::write(&path, wav_bytes(8000, 8000)).unwrap();

        let song = LoftyTagReader.read_file(&path).expect("valid wav");
        assert_eq!(song.path, path);
        assert_eq!(song.filetype, "wav");
        assert_eq!(song.samplerate, Some(8000));
        assert!(song.mtime > 0);
        assert!(song.filesize > 44);
        assert!(!song.embedded_cover);
        assert!(song.title.is_empty());
    }

    #[test]
    fn test_garbage_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("broken.flac");
        std::fs::write(&path, b"definitely not flac").unwrap();
        assert!(LoftyTagReader.read_file(&path).is_none());
    }

    #[test]
    fn test_missing_file_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(LoftyTagReader.read_file(&dir.path().join("gone.mp3")).is_none());
    }
}
