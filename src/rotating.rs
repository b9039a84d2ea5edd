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

use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use crate::Error;
use crate::ErrorKind;
use crate::RotationConfig;
use crate::Trap;
use crate::clock::Clock;
use crate::maintenance::Maintainer;
use crate::maintenance::Retention;
use crate::mode;
use crate::naming::BackupNaming;
use crate::trap::DefaultTrap;

/// A writer that rotates its file once it would grow past a maximum size.
///
/// All writes, including through a shared `&RotatingFile`, are serialized by one lock. Backups
/// are compressed and pruned by a background thread that is started on first use and stopped
/// when the writer is dropped.
#[derive(Debug)]
pub struct RotatingFile {
    config: RotationConfig,
    trap: Arc<dyn Trap>,
    state: Mutex<State>,
}

impl RotatingFile {
    /// Creates a new [`RotatingFileBuilder`] writing to `filename`.
    ///
    /// # Examples
    ///
    /// ```
    /// use logforth_rotate::RotatingFile;
    ///
    /// let builder = RotatingFile::builder("logs/app.log");
    /// ```
    #[must_use]
    pub fn builder(filename: impl AsRef<Path>) -> RotatingFileBuilder {
        RotatingFileBuilder::new(filename)
    }

    /// The path of the active log file.
    pub fn path(&self) -> PathBuf {
        self.config.filename()
    }

    /// The configuration of this writer.
    pub fn config(&self) -> &RotationConfig {
        &self.config
    }

    /// Rotate the active file now, regardless of its size.
    ///
    /// The current file, if any, is renamed to a timestamped backup and a new empty file is
    /// created in its place.
    pub fn rotate(&self) -> Result<(), Error> {
        self.state().rotate()
    }

    /// Sync and close the active file. Closing twice is fine; the next write opens the file again.
    pub fn close(&self) -> Result<(), Error> {
        self.state().close()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&*self).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        (&*self).flush()
    }
}

impl Write for &RotatingFile {
    /// Write `buf` to the active file, rotating first if it would grow past the maximum size.
    ///
    /// A buffer larger than the maximum size is rejected with [`io::ErrorKind::InvalidInput`]
    /// carrying an [`ErrorKind::OversizedWrite`] error, and nothing is written.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.state().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.state().flush()
    }
}

impl Drop for RotatingFile {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Err(err) = state.flush() {
            let err = Error::new(ErrorKind::Io, "failed to flush log file on drop")
                .with_source(err);
            self.trap.trap(&err);
        }
    }
}

/// A builder for configuring [`RotatingFile`].
#[derive(Debug)]
pub struct RotatingFileBuilder {
    config: RotationConfig,
    clock: Clock,
    trap: Box<dyn Trap>,
}

impl Default for RotatingFileBuilder {
    /// A builder writing to `<temp dir>/<program name>_rotate.log`.
    fn default() -> Self {
        Self::from_config(RotationConfig::default())
    }
}

impl RotatingFileBuilder {
    /// Creates a new [`RotatingFileBuilder`] writing to `filename`.
    #[must_use]
    pub fn new(filename: impl AsRef<Path>) -> Self {
        let mut config = RotationConfig::default();
        config.set_filename(filename.as_ref());
        Self::from_config(config)
    }

    /// Creates a new [`RotatingFileBuilder`] from an existing configuration.
    #[must_use]
    pub fn from_config(config: RotationConfig) -> Self {
        Self {
            config,
            clock: Clock::DefaultClock,
            trap: Box::new(DefaultTrap::default()),
        }
    }

    /// Set the maximum size of the active file in bytes.
    ///
    /// Default to 100 MiB. Zero restores the default.
    #[must_use]
    pub fn max_size(mut self, n: u64) -> Self {
        self.config.max_size = n;
        self
    }

    /// Set the maximum size of the active file in megabytes.
    #[must_use]
    pub fn max_size_megabytes(mut self, n: u64) -> Self {
        self.config.set_max_size_megabytes(n);
        self
    }

    /// Set the maximum number of backups to keep.
    ///
    /// Default to 0, which keeps all of them.
    #[must_use]
    pub fn max_backups(mut self, n: usize) -> Self {
        self.config.max_backups = n;
        self
    }

    /// Set the maximum number of days to keep a backup, judged by the timestamp in its name.
    ///
    /// Default to 0, which keeps backups regardless of their age.
    #[must_use]
    pub fn max_age_days(mut self, n: u32) -> Self {
        self.config.max_age_days = n;
        self
    }

    /// Set whether backups are compressed with gzip.
    #[must_use]
    pub fn compress(mut self, compress: bool) -> Self {
        self.config.compress = compress;
        self
    }

    /// Set whether backup names use the local time. Default to UTC.
    #[must_use]
    pub fn local_time(mut self, local_time: bool) -> Self {
        self.config.local_time = local_time;
        self
    }

    /// Set the trap for errors of background maintenance.
    ///
    /// Default to [`DefaultTrap`].
    #[must_use]
    pub fn trap(mut self, trap: impl Into<Box<dyn Trap>>) -> Self {
        self.trap = trap.into();
        self
    }

    #[cfg(test)]
    fn clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Builds the [`RotatingFile`].
    ///
    /// No file is touched until the first write.
    ///
    /// # Errors
    ///
    /// Return an [`ErrorKind::InvalidConfig`] error if the filename is empty or names a
    /// directory.
    pub fn build(self) -> Result<RotatingFile, Error> {
        let Self {
            mut config,
            clock,
            trap,
        } = self;

        let filename = config.filename();
        if filename.as_os_str().is_empty() || filename.file_name().is_none() {
            return Err(Error::new(ErrorKind::InvalidConfig, "filename must name a file")
                .with_context("filename", filename.display()));
        }
        if filename.is_dir() {
            return Err(Error::new(ErrorKind::InvalidConfig, "filename is a directory")
                .with_context("filename", filename.display()));
        }
        config.set_filename(&filename);

        let trap: Arc<dyn Trap> = Arc::from(trap);
        let naming = BackupNaming::new(&filename, config.local_time());
        let retention = Retention::new(&config, naming.clone(), clock.clone());
        let state = State {
            filename,
            max_size: config.max_size(),
            naming,
            clock,
            file: None,
            current_filesize: 0,
            maintainer: Maintainer::new(retention, trap.clone()),
        };

        Ok(RotatingFile {
            config,
            trap,
            state: Mutex::new(state),
        })
    }
}

#[derive(Debug)]
struct State {
    filename: PathBuf,
    max_size: u64,
    naming: BackupNaming,
    clock: Clock,
    file: Option<File>,
    current_filesize: u64,
    maintainer: Maintainer,
}

impl State {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let len = buf.len() as u64;
        if len > self.max_size {
            let err = Error::new(
                ErrorKind::OversizedWrite,
                "write length exceeds maximum file size",
            )
            .with_context("length", len)
            .with_context("max_size", self.max_size);
            return Err(err.into());
        }

        if self.file.is_none() {
            self.open_existing_or_new(len)?;
        }

        if self.current_filesize + len > self.max_size {
            self.rotate()?;
        }

        let Some(file) = self.file.as_mut() else {
            let err = Error::new(ErrorKind::OpenFailure, "no active log file")
                .with_context("path", self.filename.display());
            return Err(err.into());
        };

        let n = file.write(buf)?;
        self.current_filesize += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }

    /// Open the log file if it exists and the pending write fits; otherwise start a new one.
    fn open_existing_or_new(&mut self, write_len: u64) -> Result<(), Error> {
        // clean up stale backups even if this writer never rotates
        self.maintainer.signal();

        let metadata = match fs::metadata(&self.filename) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return self.open_new(),
            Err(err) => {
                return Err(Error::new(ErrorKind::OpenFailure, "failed to get log file info")
                    .with_context("path", self.filename.display())
                    .with_source(err));
            }
        };

        if metadata.len() + write_len > self.max_size {
            return self.rotate();
        }

        match OpenOptions::new().append(true).open(&self.filename) {
            Ok(file) => {
                self.file = Some(file);
                self.current_filesize = metadata.len();
                Ok(())
            }
            // e.g. no permission to append; move it aside and start over
            Err(_) => self.open_new(),
        }
    }

    /// Move the current log file, if any, to a backup and create an empty one in its place.
    ///
    /// Assumes the active file has been closed.
    fn open_new(&mut self) -> Result<(), Error> {
        mode::create_dir_all(self.naming.dir()).map_err(|err| {
            Error::new(ErrorKind::OpenFailure, "failed to create log directory")
                .with_context("path", self.naming.dir().display())
                .with_source(err)
        })?;

        let mut file_mode = mode::DEFAULT_FILE_MODE;
        if let Ok(metadata) = fs::metadata(&self.filename) {
            file_mode = mode::file_mode(&metadata);
            let backup = self.naming.backup_path(self.clock.now());
            fs::rename(&self.filename, &backup).map_err(|err| {
                Error::new(ErrorKind::RotationFailure, "failed to rename log file")
                    .with_context("from", self.filename.display())
                    .with_context("to", backup.display())
                    .with_source(err)
            })?;
        }

        let file = mode::create_truncate(&self.filename, file_mode).map_err(|err| {
            Error::new(ErrorKind::OpenFailure, "failed to create log file")
                .with_context("path", self.filename.display())
                .with_source(err)
        })?;
        self.file = Some(file);
        self.current_filesize = 0;
        Ok(())
    }

    fn rotate(&mut self) -> Result<(), Error> {
        self.close()?;
        self.open_new().map_err(|err| {
            Error::new(ErrorKind::RotationFailure, "failed to rotate log file")
                .with_context("path", self.filename.display())
                .with_source(err)
        })?;
        self.maintainer.signal();
        Ok(())
    }

    /// Sync and close the active file so write-back failures reach the caller.
    fn close(&mut self) -> Result<(), Error> {
        match self.file.take() {
            Some(file) => file.sync_all().map_err(Error::from_io_error),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::Write;
    use std::path::Path;
    use std::str::FromStr;
    use std::sync::Arc;
    use std::thread;

    use jiff::SignedDuration;
    use jiff::Timestamp;
    use rand::Rng;
    use rand::distr::Alphanumeric;
    use tempfile::TempDir;

    use super::*;
    use crate::clock::ManualClock;

    fn manual_clock(now: &str) -> Arc<ManualClock> {
        Arc::new(ManualClock::new(Timestamp::from_str(now).unwrap()))
    }

    fn backups_in(dir: &Path) -> Vec<String> {
        let naming = BackupNaming::new(&dir.join("app.log"), false);
        let mut names = fs::read_dir(dir)
            .unwrap()
            .filter_map(|entry| {
                let name = entry.unwrap().file_name().to_string_lossy().into_owned();
                naming.parse(&name).map(|backup| backup.name)
            })
            .collect::<Vec<_>>();
        names.sort();
        names
    }

    fn generate_random_string() -> String {
        let mut rng = rand::rng();
        let len = rng.random_range(50..=100);
        let random_string: String = std::iter::repeat(())
            .map(|()| rng.sample(Alphanumeric))
            .map(char::from)
            .take(len)
            .collect();

        random_string
    }

    #[test]
    fn test_writes_accumulate_until_threshold() {
        let temp_dir = TempDir::new().unwrap();
        let clock = manual_clock("2024-08-10T00:00:00Z");
        let mut writer = RotatingFileBuilder::new(temp_dir.path().join("app.log"))
            .max_size(1000)
            .clock(Clock::ManualClock(clock.clone()))
            .build()
            .unwrap();

        let mut now = Timestamp::from_str("2024-08-10T00:00:00Z").unwrap();
        let mut expected_file_size = 0;
        let mut expected_rotations = 0;
        for _ in 0..200 {
            let rand_str = generate_random_string();
            let len = rand_str.len() as u64;
            if expected_file_size > 0 && expected_file_size + len > 1000 {
                expected_rotations += 1;
                expected_file_size = 0;
            }
            expected_file_size += len;

            assert_eq!(writer.write(rand_str.as_bytes()).unwrap(), rand_str.len());
            assert_eq!(writer.state().current_filesize, expected_file_size);

            now += SignedDuration::from_secs(1);
            clock.set_now(now);
        }

        writer.flush().unwrap();
        assert_eq!(backups_in(temp_dir.path()).len(), expected_rotations);
        assert_eq!(
            fs::metadata(temp_dir.path().join("app.log")).unwrap().len(),
            expected_file_size
        );
    }

    #[test]
    fn test_oversized_write_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let filename = temp_dir.path().join("app.log");
        let mut writer = RotatingFileBuilder::new(&filename)
            .max_size(100)
            .build()
            .unwrap();

        let err = writer.write(&[b'x'; 101]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        let err = err.get_ref().and_then(|e| e.downcast_ref::<Error>()).unwrap();
        assert_eq!(err.kind(), ErrorKind::OversizedWrite);
        assert!(!filename.exists());

        assert_eq!(writer.write(&[b'x'; 100]).unwrap(), 100);
        assert!(writer.write(&[b'x'; 101]).is_err());
        assert_eq!(fs::metadata(&filename).unwrap().len(), 100);
        assert!(backups_in(temp_dir.path()).is_empty());
    }

    #[test]
    fn test_rotation_happens_before_crossing_write() {
        let temp_dir = TempDir::new().unwrap();
        let clock = manual_clock("2024-08-10T17:12:52Z");
        let mut writer = RotatingFileBuilder::new(temp_dir.path().join("app.log"))
            .max_size(1024)
            .clock(Clock::ManualClock(clock))
            .build()
            .unwrap();

        writer.write_all(&[b'a'; 600]).unwrap();
        writer.write_all(&[b'b'; 600]).unwrap();

        assert_eq!(
            backups_in(temp_dir.path()),
            vec!["app-2024-08-10 17:12:52.log"]
        );
        let backup = fs::read(temp_dir.path().join("app-2024-08-10 17:12:52.log")).unwrap();
        assert_eq!(backup, vec![b'a'; 600]);
        let active = fs::read(temp_dir.path().join("app.log")).unwrap();
        assert_eq!(active, vec![b'b'; 600]);
    }

    #[test]
    fn test_rotations_produce_increasing_backups() {
        let temp_dir = TempDir::new().unwrap();
        let clock = manual_clock("2024-08-10T23:59:58Z");
        let writer = RotatingFileBuilder::new(temp_dir.path().join("app.log"))
            .max_size(10)
            .clock(Clock::ManualClock(clock.clone()))
            .build()
            .unwrap();

        let mut now = Timestamp::from_str("2024-08-10T23:59:58Z").unwrap();
        for i in 0..6 {
            (&writer).write_all(format!("line {i:04}").as_bytes()).unwrap();
            now += SignedDuration::from_secs(1);
            clock.set_now(now);
        }

        let backups = backups_in(temp_dir.path());
        assert_eq!(
            backups,
            vec![
                "app-2024-08-10 23:59:59.log",
                "app-2024-08-11 00:00:00.log",
                "app-2024-08-11 00:00:01.log",
                "app-2024-08-11 00:00:02.log",
                "app-2024-08-11 00:00:03.log",
            ]
        );
        for (i, backup) in backups.iter().enumerate() {
            let content = fs::read_to_string(temp_dir.path().join(backup)).unwrap();
            assert_eq!(content, format!("line {i:04}"));
        }
        let active = fs::read_to_string(temp_dir.path().join("app.log")).unwrap();
        assert_eq!(active, "line 0005");
    }

    #[test]
    fn test_open_existing_appends_and_adopts_size() {
        let temp_dir = TempDir::new().unwrap();
        let filename = temp_dir.path().join("app.log");
        fs::write(&filename, [b'a'; 100]).unwrap();

        let mut writer = RotatingFileBuilder::new(&filename)
            .max_size(1000)
            .build()
            .unwrap();
        writer.write_all(&[b'b'; 10]).unwrap();

        assert_eq!(writer.state().current_filesize, 110);
        assert_eq!(fs::metadata(&filename).unwrap().len(), 110);
        assert!(backups_in(temp_dir.path()).is_empty());
    }

    #[test]
    fn test_open_existing_rotates_when_full() {
        let temp_dir = TempDir::new().unwrap();
        let filename = temp_dir.path().join("app.log");
        fs::write(&filename, [b'a'; 990]).unwrap();

        let clock = manual_clock("2024-08-10T00:00:00Z");
        let mut writer = RotatingFileBuilder::new(&filename)
            .max_size(1000)
            .clock(Clock::ManualClock(clock))
            .build()
            .unwrap();
        writer.write_all(&[b'b'; 20]).unwrap();

        assert_eq!(
            backups_in(temp_dir.path()),
            vec!["app-2024-08-10 00:00:00.log"]
        );
        let backup = temp_dir.path().join("app-2024-08-10 00:00:00.log");
        assert_eq!(fs::metadata(backup).unwrap().len(), 990);
        assert_eq!(fs::metadata(&filename).unwrap().len(), 20);
        assert_eq!(writer.state().current_filesize, 20);
    }

    #[test]
    fn test_close_is_idempotent_and_write_reopens() {
        let temp_dir = TempDir::new().unwrap();
        let filename = temp_dir.path().join("app.log");
        let mut writer = RotatingFileBuilder::new(&filename)
            .max_size(1000)
            .build()
            .unwrap();

        writer.close().unwrap();
        writer.write_all(b"hello ").unwrap();
        writer.close().unwrap();
        assert!(writer.state().file.is_none());
        assert_eq!(fs::read_to_string(&filename).unwrap(), "hello ");
        writer.close().unwrap();
        writer.write_all(b"world").unwrap();

        assert_eq!(fs::read_to_string(&filename).unwrap(), "hello world");
        assert_eq!(writer.state().current_filesize, 11);
    }

    #[test]
    fn test_failed_rotation_leaves_no_file_and_next_write_retries() {
        let temp_dir = TempDir::new().unwrap();
        let filename = temp_dir.path().join("app.log");
        let clock = manual_clock("2024-08-10T00:00:00Z");
        let mut writer = RotatingFileBuilder::new(&filename)
            .max_size(10)
            .clock(Clock::ManualClock(clock.clone()))
            .build()
            .unwrap();

        // a non-empty directory at the backup path makes the rename fail
        let blocked = temp_dir.path().join("app-2024-08-10 00:00:00.log");
        fs::create_dir(&blocked).unwrap();
        fs::write(blocked.join("keep"), b"keep").unwrap();

        writer.write_all(b"abcdefgh").unwrap();
        let err = writer.write(b"abcd").unwrap_err();
        let err = err.get_ref().and_then(|e| e.downcast_ref::<Error>()).unwrap();
        assert_eq!(err.kind(), ErrorKind::RotationFailure);
        assert!(writer.state().file.is_none());
        assert_eq!(fs::read_to_string(&filename).unwrap(), "abcdefgh");

        clock.set_now(Timestamp::from_str("2024-08-10T00:00:01Z").unwrap());
        writer.write_all(b"abcd").unwrap();

        assert_eq!(fs::read_to_string(&filename).unwrap(), "abcd");
        let backup = temp_dir.path().join("app-2024-08-10 00:00:01.log");
        assert_eq!(fs::read_to_string(backup).unwrap(), "abcdefgh");
        assert!(blocked.join("keep").exists());
    }

    #[test]
    fn test_manual_rotate_creates_parent_directory() {
        let temp_dir = TempDir::new().unwrap();
        let filename = temp_dir.path().join("nested").join("logs").join("app.log");
        let clock = manual_clock("2024-08-10T00:00:00Z");
        let writer = RotatingFileBuilder::new(&filename)
            .clock(Clock::ManualClock(clock))
            .build()
            .unwrap();

        writer.rotate().unwrap();
        assert!(filename.exists());
        assert!(backups_in(filename.parent().unwrap()).is_empty());

        (&writer).write_all(b"data").unwrap();
        writer.rotate().unwrap();
        assert_eq!(
            backups_in(filename.parent().unwrap()),
            vec!["app-2024-08-10 00:00:00.log"]
        );
        assert_eq!(fs::metadata(&filename).unwrap().len(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_rotation_preserves_file_mode() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let filename = temp_dir.path().join("app.log");
        fs::write(&filename, b"old").unwrap();
        fs::set_permissions(&filename, fs::Permissions::from_mode(0o640)).unwrap();

        let clock = manual_clock("2024-08-10T00:00:00Z");
        let writer = RotatingFileBuilder::new(&filename)
            .clock(Clock::ManualClock(clock))
            .build()
            .unwrap();
        writer.rotate().unwrap();

        let backup = temp_dir.path().join("app-2024-08-10 00:00:00.log");
        let backup_mode = fs::metadata(backup).unwrap().permissions().mode() & 0o777;
        assert_eq!(backup_mode, 0o640);
        // the process umask can only clear bits
        let active_mode = fs::metadata(&filename).unwrap().permissions().mode() & 0o777;
        assert_eq!(active_mode & !0o640, 0);
    }

    #[test]
    fn test_concurrent_writes_are_serialized() {
        let temp_dir = TempDir::new().unwrap();
        let filename = temp_dir.path().join("app.log");
        let writer = Arc::new(RotatingFileBuilder::new(&filename).build().unwrap());

        let handles = (0..4)
            .map(|t| {
                let writer = writer.clone();
                thread::spawn(move || {
                    for i in 0..100 {
                        let line = format!("thread-{t} line-{i:03}\n");
                        (&*writer).write_all(line.as_bytes()).unwrap();
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }

        let content = fs::read_to_string(&filename).unwrap();
        let lines = content.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 400);
        for t in 0..4 {
            let prefix = format!("thread-{t} ");
            let mine = lines
                .iter()
                .filter(|line| line.starts_with(&prefix))
                .collect::<Vec<_>>();
            assert_eq!(mine.len(), 100);
            for (i, line) in mine.iter().enumerate() {
                assert_eq!(**line, format!("thread-{t} line-{i:03}"));
            }
        }
    }

    #[test]
    fn test_build_rejects_directory_filename() {
        let temp_dir = TempDir::new().unwrap();
        let err = RotatingFileBuilder::new(temp_dir.path())
            .build()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);

        let err = RotatingFileBuilder::new("").build().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    }
}
