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

use std::env;
use std::path::Path;
use std::path::PathBuf;

const MEGABYTE: u64 = 1024 * 1024;

/// The rotation threshold used when none is configured: 100 MiB.
pub const DEFAULT_MAX_SIZE: u64 = 100 * MEGABYTE;

/// Settings of a [`RotatingFile`](crate::RotatingFile).
///
/// Build one through [`RotatingFileBuilder`](crate::RotatingFileBuilder). With the `serde`
/// feature it can also be deserialized; every field is optional and falls back to its default:
///
/// ```json
/// { "filename": "logs/app.log", "max_size": 10485760, "max_backups": 5, "compress": true }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default, deny_unknown_fields))]
pub struct RotationConfig {
    pub(crate) filename: Option<PathBuf>,
    pub(crate) max_size: u64,
    pub(crate) max_backups: usize,
    pub(crate) max_age_days: u32,
    pub(crate) compress: bool,
    pub(crate) local_time: bool,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            filename: None,
            max_size: DEFAULT_MAX_SIZE,
            max_backups: 0,
            max_age_days: 0,
            compress: false,
            local_time: false,
        }
    }
}

impl RotationConfig {
    /// The active log file path.
    ///
    /// Defaults to `<temp dir>/<program name>_rotate.log`.
    pub fn filename(&self) -> PathBuf {
        match &self.filename {
            Some(filename) => filename.clone(),
            None => default_filename(),
        }
    }

    /// The maximum size in bytes of the active file before it is rotated.
    ///
    /// A configured size of zero means [`DEFAULT_MAX_SIZE`].
    pub fn max_size(&self) -> u64 {
        if self.max_size == 0 {
            DEFAULT_MAX_SIZE
        } else {
            self.max_size
        }
    }

    /// The number of backups to retain. Zero retains all.
    pub fn max_backups(&self) -> usize {
        self.max_backups
    }

    /// The number of days to retain a backup, judged by the timestamp in its name. Zero retains
    /// backups regardless of age.
    pub fn max_age_days(&self) -> u32 {
        self.max_age_days
    }

    /// Whether backups are gzip compressed.
    pub fn compress(&self) -> bool {
        self.compress
    }

    /// Whether backup names use the local time instead of UTC.
    pub fn local_time(&self) -> bool {
        self.local_time
    }

    pub(crate) fn set_max_size_megabytes(&mut self, n: u64) {
        self.max_size = n.saturating_mul(MEGABYTE);
    }

    pub(crate) fn set_filename(&mut self, filename: &Path) {
        self.filename = Some(filename.to_path_buf());
    }
}

fn default_filename() -> PathBuf {
    let program = env::args_os()
        .next()
        .and_then(|arg0| {
            Path::new(&arg0)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| "logforth".to_string());
    env::temp_dir().join(format!("{program}_rotate.log"))
}
