use chrono::{DateTime, TimeZone};
use std::path::{Path, PathBuf};

/// Sortable date plus weekday, e.g. "2024-03-09 14:05:59 Saturday".
pub const CLIP_NAME_FORMAT: &str = "%Y-%m-%d %H:%M:%S %A";

/// File stem for a clip started at `at`.
pub fn clip_stem<Tz>(at: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    at.format(CLIP_NAME_FORMAT).to_string()
}

/// Hands out clip paths in one directory, suffixing " (n)" when clips start
/// within the same second so a later clip never overwrites an earlier one.
#[derive(Debug)]
pub struct ClipNamer {
    dir: PathBuf,
    extension: String,
    last_stem: Option<String>,
    repeats: u32,
}

impl ClipNamer {
    pub fn new(dir: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            extension: extension.into(),
            last_stem: None,
            repeats: 0,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn next_path<Tz>(&mut self, at: &DateTime<Tz>) -> PathBuf
    where
        Tz: TimeZone,
        Tz::Offset: std::fmt::Display,
    {
        let stem = clip_stem(at);
        if self.last_stem.as_deref() == Some(stem.as_str()) {
            self.repeats += 1;
        } else {
            self.last_stem = Some(stem.clone());
            self.repeats = 0;
        }
        let name = if self.repeats == 0 {
            format!("{stem}.{}", self.extension)
        } else {
            format!("{stem} ({}).{}", self.repeats, self.extension)
        };
        self.dir.join(name)
    }
}
