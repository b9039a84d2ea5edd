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

//! A rotating log file writer.
//!
//! [`RotatingFile`] appends bytes to a log file. When a write would grow the file past the
//! configured maximum size, the file is first renamed to a backup carrying the rotation time,
//! and a new empty file takes its place:
//!
//! ```text
//! logs/app.log                          active file
//! logs/app-2024-08-10 17:12:52.log      backup
//! logs/app-2024-08-09 08:00:13.log.gz   compressed backup
//! ```
//!
//! After each rotation a background thread compresses backups and removes those beyond the
//! configured count or age. Errors of that thread never reach the writer; they are handed to a
//! [`Trap`].
//!
//! # Example
//!
//! ```
//! use std::io::Write;
//!
//! use logforth_rotate::RotatingFile;
//!
//! let dir = tempfile::tempdir().unwrap();
//! let mut writer = RotatingFile::builder(dir.path().join("app.log"))
//!     .max_size_megabytes(10)
//!     .max_backups(5)
//!     .max_age_days(7)
//!     .compress(true)
//!     .build()
//!     .unwrap();
//!
//! writeln!(writer, "This line will be written to a rotating file.").unwrap();
//! ```

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod trap;

mod clock;
mod config;
mod error;
mod maintenance;
mod mode;
mod naming;
mod rotating;

pub use self::config::DEFAULT_MAX_SIZE;
pub use self::config::RotationConfig;
pub use self::error::Error;
pub use self::error::ErrorKind;
pub use self::rotating::RotatingFile;
pub use self::rotating::RotatingFileBuilder;
pub use self::trap::Trap;
