//! CUE sheet parsing.
//!
//! A CUE sheet describes virtual tracks inside one (or several) media
//! files. Each `TRACK` becomes a [`Song`] pointing at the underlying media
//! file, distinguished from its siblings by `beginning_nanosec`.
//!
//! ```text
//! PERFORMER "Album Artist"
//! TITLE "Album"
//! FILE "album.flac" WAVE
//!   TRACK 01 AUDIO
//!     TITLE "First"
//!     INDEX 01 00:00:00
//!   TRACK 02 AUDIO
//!     TITLE "Second"
//!     INDEX 01 03:12:40
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::model::{Song, Source};
use crate::paths::mtime_secs;
use crate::tags::{FileStat, TagReader};

/// CUE frames per second.
const FRAMES_PER_SECOND: i64 = 75;
const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// Turns CUE text into songs.
pub trait CueParser: Send + Sync {
    /// Parse `input`, the contents of `cue_path`. Relative `FILE`
    /// references resolve against `dir`. Never fails: malformed input
    /// yields fewer (or no) songs.
    fn parse(&self, input: &str, cue_path: &Path, dir: &Path) -> Vec<Song>;
}

/// One `TRACK` block, with album-level values already folded in.
#[derive(Debug, Clone, Default)]
struct CueEntry {
    file: PathBuf,
    track: Option<u32>,
    index: Option<i64>,
    /// `INDEX 00`, used only when a track has no `INDEX 01`
    pregap: Option<i64>,
    title: String,
    artist: String,
    album_artist: String,
    album: String,
    composer: String,
    album_composer: String,
    genre: String,
    year: Option<u32>,
    disc: Option<u32>,
}

impl CueEntry {
    fn beginning(&self) -> Option<i64> {
        self.index.or(self.pregap)
    }

    fn pretty_artist(&self) -> &str {
        if self.artist.is_empty() {
            &self.album_artist
        } else {
            &self.artist
        }
    }

    fn pretty_composer(&self) -> &str {
        if self.composer.is_empty() {
            &self.album_composer
        } else {
            &self.composer
        }
    }
}

/// Sheet-level values that tracks inherit.
#[derive(Debug, Default)]
struct AlbumFields {
    title: String,
    artist: String,
    composer: String,
    genre: String,
    year: Option<u32>,
    disc: Option<u32>,
}

/// Parser that reads base properties (length, bitrate, embedded art) of the
/// referenced media files through a [`TagReader`].
pub struct CueSheetParser {
    tags: Arc<dyn TagReader>,
}

impl CueSheetParser {
    pub fn new(tags: Arc<dyn TagReader>) -> Self {
        Self { tags }
    }

    fn base_song(&self, media: &Path) -> Song {
        self.tags
            .read_file(media)
            .or_else(|| FileStat::read(media).map(|stat| stat.song(media)))
            .unwrap_or_else(|| Song::new(Source::Local, media))
    }
}

impl CueParser for CueSheetParser {
    fn parse(&self, input: &str, cue_path: &Path, dir: &Path) -> Vec<Song> {
        let entries = read_entries(input, dir);
        let cue_mtime = mtime_secs(cue_path);

        let mut songs = Vec::with_capacity(entries.len());
        let mut base: Option<Song> = None;

        for (i, entry) in entries.iter().enumerate() {
            let Some(beginning) = entry.beginning() else {
                tracing::debug!(target: "cue", cue = %cue_path.display(), track = ?entry.track, "Track without index");
                continue;
            };

            if base.as_ref().is_none_or(|b| b.path != entry.file) {
                base = Some(self.base_song(&entry.file));
            }
            let Some(base) = base.as_ref() else {
                continue;
            };

            // Sections end where the next one in the same file begins.
            let end = entries[i + 1..]
                .iter()
                .find(|next| next.file == entry.file)
                .and_then(CueEntry::beginning)
                .or(base.length_nanosec);

            let mut song = base.clone();
            song.title = entry.title.clone();
            song.artist = entry.pretty_artist().to_string();
            song.album_artist = entry.album_artist.clone();
            song.album = entry.album.clone();
            song.composer = entry.pretty_composer().to_string();
            if !entry.genre.is_empty() {
                song.genre = entry.genre.clone();
            }
            song.year = entry.year.or(base.year);
            song.disc = entry.disc.or(base.disc);
            song.track = entry.track;
            song.beginning_nanosec = beginning;
            song.end_nanosec = end;
            song.length_nanosec = end.map(|end| end - beginning).filter(|len| *len > 0);
            song.cue_path = Some(cue_path.to_path_buf());
            song.mtime = base.mtime.max(cue_mtime);

            songs.push(song);
        }

        songs
    }
}

fn read_entries(input: &str, dir: &Path) -> Vec<CueEntry> {
    let mut album = AlbumFields::default();
    let mut file: Option<PathBuf> = None;
    let mut current: Option<CueEntry> = None;
    let mut entries = Vec::new();

    for line in input.lines() {
        let tokens = split_cue_line(line);
        let Some(keyword) = tokens.first() else {
            continue;
        };
        let arg = |n: usize| tokens.get(n).map(String::as_str).unwrap_or_default();

        match keyword.to_ascii_uppercase().as_str() {
            "FILE" => {
                entries.extend(current.take());
                let name = Path::new(arg(1));
                file = Some(if name.is_absolute() {
                    name.to_path_buf()
                } else {
                    dir.join(name)
                });
            }
            "TRACK" => {
                entries.extend(current.take());
                let Some(file) = file.clone() else {
                    continue;
                };
                if !arg(2).eq_ignore_ascii_case("AUDIO") {
                    continue;
                }
                current = Some(CueEntry {
                    file,
                    track: arg(1).parse().ok(),
                    album_artist: album.artist.clone(),
                    album: album.title.clone(),
                    album_composer: album.composer.clone(),
                    genre: album.genre.clone(),
                    year: album.year,
                    disc: album.disc,
                    ..Default::default()
                });
            }
            "INDEX" => {
                if let Some(entry) = current.as_mut() {
                    match arg(1) {
                        "01" | "1" => entry.index = index_to_nanos(arg(2)),
                        "00" | "0" => entry.pregap = index_to_nanos(arg(2)),
                        _ => {}
                    }
                }
            }
            "TITLE" => match current.as_mut() {
                Some(entry) => entry.title = arg(1).to_string(),
                None => album.title = arg(1).to_string(),
            },
            "PERFORMER" => match current.as_mut() {
                Some(entry) => entry.artist = arg(1).to_string(),
                None => album.artist = arg(1).to_string(),
            },
            "SONGWRITER" => match current.as_mut() {
                Some(entry) => entry.composer = arg(1).to_string(),
                None => album.composer = arg(1).to_string(),
            },
            "REM" => {
                let value = arg(2);
                match arg(1).to_ascii_uppercase().as_str() {
                    "GENRE" => match current.as_mut() {
                        Some(entry) => entry.genre = value.to_string(),
                        None => album.genre = value.to_string(),
                    },
                    "DATE" => {
                        let year = value.get(..4).and_then(|y| y.parse().ok());
                        match current.as_mut() {
                            Some(entry) => entry.year = year,
                            None => album.year = year,
                        }
                    }
                    "DISC" | "DISCNUMBER" => {
                        let disc = value.parse().ok();
                        match current.as_mut() {
                            Some(entry) => entry.disc = disc,
                            None => album.disc = disc,
                        }
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }
    entries.extend(current);
    entries
}

/// Split a CUE line on whitespace, keeping double-quoted runs together.
fn split_cue_line(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut token = String::new();
    let mut quoted = false;
    let mut in_token = false;

    for c in line.trim().chars() {
        match c {
            '"' => {
                quoted = !quoted;
                in_token = true;
            }
            c if c.is_whitespace() && !quoted => {
                if in_token {
                    tokens.push(std::mem::take(&mut token));
                    in_token = false;
                }
            }
            c => {
                token.push(c);
                in_token = true;
            }
        }
    }
    if in_token {
        tokens.push(token);
    }
    tokens
}

/// `mm:ss:ff` to nanoseconds.
fn index_to_nanos(index: &str) -> Option<i64> {
    let mut parts = index.split(':').map(|p| p.trim().parse::<i64>().ok());
    let (Some(Some(min)), Some(Some(sec)), Some(Some(frames)), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return None;
    };
    if min < 0 || !(0..60).contains(&sec) || !(0..FRAMES_PER_SECOND).contains(&frames) {
        return None;
    }
    let total_frames = min
        .checked_mul(60)?
        .checked_add(sec)?
        .checked_mul(FRAMES_PER_SECOND)?
        .checked_add(frames)?;
    Some(total_frames.checked_mul(NANOS_PER_SECOND)? / FRAMES_PER_SECOND)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeTagReader;

    const SHEET: &str = r#"
REM GENRE "Jazz"
REM DATE 1959
PERFORMER "Miles Davis"
TITLE "Kind of Blue"
FILE "album.flac" WAVE
  TRACK 01 AUDIO
    TITLE "So What"
    INDEX 01 00:00:00
  TRACK 02 AUDIO
    TITLE "Freddie Freeloader"
    PERFORMER "Miles Davis Sextet"
    INDEX 00 09:20:00
    INDEX 01 09:22:00
  TRACK 03 AUDIO
    TITLE "Blue in Green"
    INDEX 01 19:00:37
"#;

    fn parser() -> CueSheetParser {
        CueSheetParser::new(Arc::new(FakeTagReader))
    }

    #[test]
    fn test_split_cue_line() {
        assert_eq!(
            split_cue_line(r#"  FILE "My Album.flac" WAVE"#),
            vec!["FILE", "My Album.flac", "WAVE"]
        );
        assert_eq!(split_cue_line(r#"TITLE """#), vec!["TITLE", ""]);
        assert!(split_cue_line("   ").is_empty());
    }

    #[test]
    fn test_index_to_nanos() {
        assert_eq!(index_to_nanos("00:00:00"), Some(0));
        assert_eq!(index_to_nanos("01:02:00"), Some(62 * NANOS_PER_SECOND));
        assert_eq!(index_to_nanos("00:01:75"), None);
        assert_eq!(index_to_nanos("00:00:15"), Some(200_000_000));
        assert_eq!(index_to_nanos("garbage"), None);
        assert_eq!(index_to_nanos("1:2:3:4"), None);
        assert_eq!(index_to_nanos("3000000:00:00"), None);
        assert_eq!(index_to_nanos(&format!("{}:00:00", i64::MAX)), None);
    }

    #[test]
    fn test_out_of_range_index_drops_section() {
        let sheet = r#"
FILE "album.flac" WAVE
  TRACK 01 AUDIO
    INDEX 01 00:00:00
  TRACK 02 AUDIO
    INDEX 01 3000000:00:00
"#;
        let dir = Path::new("/m/c");
        let songs = parser().parse(sheet, &dir.join("album.cue"), dir);
        assert_eq!(songs.len(), 1);
        assert_eq!(songs[0].beginning_nanosec, 0);
    }

    #[test]
    fn test_parse_sections() {
        let dir = tempfile::TempDir::new().unwrap();
        let media = dir.path().join("album.flac");
        std::fs::write(&media, "title=Whole album\nlength=1800\n").unwrap();
        let cue = dir.path().join("album.cue");
        std::fs::write(&cue, SHEET).unwrap();

        let songs = parser().parse(SHEET, &cue, dir.path());
        assert_eq!(songs.len(), 3);

        let beginnings: Vec<_> = songs.iter().map(|s| s.beginning_nanosec).collect();
        assert_eq!(
            beginnings,
            vec![
                0,
                562 * NANOS_PER_SECOND,
                (1140 * 75 + 37) * NANOS_PER_SECOND / 75
            ]
        );

        assert_eq!(songs[0].end_nanosec, Some(songs[1].beginning_nanosec));
        assert_eq!(songs[2].end_nanosec, Some(1800 * NANOS_PER_SECOND));

        assert!(songs.iter().all(|s| s.path == media));
        assert!(songs.iter().all(|s| s.cue_path.as_deref() == Some(cue.as_path())));

        assert_eq!(songs[0].title, "So What");
        assert_eq!(songs[0].artist, "Miles Davis");
        assert_eq!(songs[1].artist, "Miles Davis Sextet");
        assert_eq!(songs[1].album_artist, "Miles Davis");
        assert_eq!(songs[2].album, "Kind of Blue");
        assert_eq!(songs[2].genre, "Jazz");
        assert_eq!(songs[2].year, Some(1959));
        assert_eq!(songs[2].track, Some(3));

        let expected_mtime = mtime_secs(&media).max(mtime_secs(&cue));
        assert!(songs.iter().all(|s| s.mtime == expected_mtime));
    }

    #[test]
    fn test_unknown_length_leaves_last_section_open() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("album.flac"), "title=x\n").unwrap();
        let cue = dir.path().join("album.cue");

        let songs = parser().parse(SHEET, &cue, dir.path());
        assert_eq!(songs[2].end_nanosec, None);
        assert_eq!(songs[2].length_nanosec, None);
    }

    #[test]
    fn test_multiple_files() {
        let sheet = r#"
FILE "one.flac" WAVE
  TRACK 01 AUDIO
    INDEX 01 00:00:00
  TRACK 02 AUDIO
    INDEX 01 01:00:00
FILE "two.flac" WAVE
  TRACK 03 AUDIO
    INDEX 01 00:00:00
"#;
        let dir = Path::new("/m/c");
        let songs = parser().parse(sheet, &dir.join("x.cue"), dir);
        assert_eq!(songs.len(), 3);
        assert_eq!(songs[2].path, dir.join("two.flac"));
        assert_eq!(songs[2].beginning_nanosec, 0);
        // The first file's last section does not run into the second file.
        assert_eq!(songs[1].end_nanosec, None);
    }

    #[test]
    fn test_garbage_yields_nothing() {
        let songs = parser().parse("not a cue sheet\n\u{0}\u{1}", Path::new("/m/x.cue"), Path::new("/m"));
        assert!(songs.is_empty());
    }
}
