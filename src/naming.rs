// Copyright 2024 FastLabs Developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::Path;
use std::path::PathBuf;

use jiff::Timestamp;
use jiff::civil::DateTime;
use jiff::tz::TimeZone;

/// Sortable both lexically and chronologically.
pub(crate) const BACKUP_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub(crate) const COMPRESS_SUFFIX: &str = ".gz";

/// Backup names for a log file `<dir>/<prefix>.<ext>` look like
/// `<dir>/<prefix>-<YYYY-MM-DD HH:MM:SS>.<ext>`, with an optional `.gz` once compressed.
#[derive(Debug, Clone)]
pub(crate) struct BackupNaming {
    dir: PathBuf,
    // includes the trailing '-'
    prefix: String,
    // includes the leading '.', or empty
    ext: String,
    zone: TimeZone,
}

impl BackupNaming {
    pub(crate) fn new(filename: &Path, local_time: bool) -> BackupNaming {
        let zone = if local_time {
            TimeZone::system()
        } else {
            TimeZone::UTC
        };
        BackupNaming::with_zone(filename, zone)
    }

    /// Backup names with timestamps rendered and parsed in `zone`.
    pub(crate) fn with_zone(filename: &Path, zone: TimeZone) -> BackupNaming {
        let dir = match filename.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let stem = filename
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let ext = filename
            .extension()
            .map(|s| format!(".{}", s.to_string_lossy()))
            .unwrap_or_default();

        BackupNaming {
            dir,
            prefix: format!("{stem}-"),
            ext,
            zone,
        }
    }

    pub(crate) fn dir(&self) -> &Path {
        &self.dir
    }

    /// The backup path for a rotation happening at `now`.
    pub(crate) fn backup_path(&self, now: Timestamp) -> PathBuf {
        let timestamp = now.to_zoned(self.zone.clone());
        let timestamp = timestamp.strftime(BACKUP_TIME_FORMAT);
        self.dir.join(format!("{}{timestamp}{}", self.prefix, self.ext))
    }

    /// Parse a directory entry name into a backup, or `None` if it is not a backup of this log.
    pub(crate) fn parse(&self, filename: &str) -> Option<BackupFile> {
        let rest = filename.strip_prefix(&self.prefix)?;

        let compressed_ext = format!("{}{COMPRESS_SUFFIX}", self.ext);
        let candidates = [(compressed_ext.as_str(), true), (self.ext.as_str(), false)];
        candidates.into_iter().find_map(|(ext, compressed)| {
            let datetime = rest.strip_suffix(ext)?;
            let timestamp = self.parse_timestamp(datetime)?;
            Some(BackupFile {
                path: self.dir.join(filename),
                name: filename.to_string(),
                timestamp,
                compressed,
            })
        })
    }

    fn parse_timestamp(&self, datetime: &str) -> Option<Timestamp> {
        let datetime = DateTime::strptime(BACKUP_TIME_FORMAT, datetime).ok()?;
        let zoned = datetime.to_zoned(self.zone.clone()).ok()?;
        Some(zoned.timestamp())
    }
}

/// A rotated-out log file found in the log directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BackupFile {
    pub(crate) path: PathBuf,
    pub(crate) name: String,
    pub(crate) timestamp: Timestamp,
    pub(crate) compressed: bool,
}

impl BackupFile {
    /// The uncompressed name; a backup and its compressed counterpart share it.
    pub(crate) fn logical_name(&self) -> &str {
        if self.compressed {
            self.name.strip_suffix(COMPRESS_SUFFIX).unwrap_or(&self.name)
        } else {
            &self.name
        }
    }

    pub(crate) fn compressed_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(COMPRESS_SUFFIX);
        PathBuf::from(name)
    }
}
