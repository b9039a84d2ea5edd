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

use std::collections::HashMap;
use std::fs;
use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::Receiver;
use crossbeam_channel::Sender;
use crossbeam_channel::TrySendError;
use flate2::Compression;
use flate2::write::GzEncoder;
use jiff::SignedDuration;
use jiff::Timestamp;

use crate::Error;
use crate::ErrorKind;
use crate::RotationConfig;
use crate::Trap;
use crate::clock::Clock;
use crate::mode;
use crate::naming::BackupFile;
use crate::naming::BackupNaming;

const THREAD_NAME: &str = "logforth-rotate-maintenance";

/// The retention policy enforced by every maintenance pass.
///
/// Holds no backup state: each pass lists the log directory again.
#[derive(Debug)]
pub(crate) struct Retention {
    naming: BackupNaming,
    max_backups: usize,
    max_age_days: u32,
    compress: bool,
    clock: Clock,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct Plan {
    pub(crate) remove: Vec<BackupFile>,
    pub(crate) compress: Vec<BackupFile>,
}

impl Retention {
    pub(crate) fn new(config: &RotationConfig, naming: BackupNaming, clock: Clock) -> Retention {
        Retention {
            naming,
            max_backups: config.max_backups(),
            max_age_days: config.max_age_days(),
            compress: config.compress(),
            clock,
        }
    }

    /// Run one maintenance pass, returning the last error encountered.
    ///
    /// A failure on one backup does not stop the pass from handling the rest.
    pub(crate) fn run_once(&self) -> Result<(), Error> {
        if self.max_backups == 0 && self.max_age_days == 0 && !self.compress {
            return Ok(());
        }

        // an unreadable directory means nothing to clean this round
        let Ok(backups) = self.list_backups() else {
            return Ok(());
        };

        let plan = self.plan(backups, self.clock.now());
        let mut result = Ok(());

        for backup in &plan.remove {
            if let Err(err) = fs::remove_file(&backup.path) {
                let err = Error::new(ErrorKind::MaintenanceFailure, "failed to remove backup")
                    .with_context("path", backup.path.display())
                    .with_source(err);
                result = Err(err);
            }
        }

        for backup in &plan.compress {
            if let Err(err) = compress_file(&backup.path, &backup.compressed_path()) {
                result = Err(err);
            }
        }

        result
    }

    /// All backups of the log file, most recent first.
    fn list_backups(&self) -> io::Result<Vec<BackupFile>> {
        let read_dir = fs::read_dir(self.naming.dir())?;

        let mut backups = read_dir
            .filter_map(|entry| {
                let entry = entry.ok()?;
                // rotation only produces regular files
                if !entry.file_type().ok()?.is_file() {
                    return None;
                }
                let filename = entry.file_name();
                // if the filename is not a UTF-8 string, skip it.
                let filename = filename.to_str()?;
                self.naming.parse(filename)
            })
            .collect::<Vec<_>>();

        backups.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(backups)
    }

    /// Classify backups, given most recent first, into those to remove and those to compress.
    pub(crate) fn plan(&self, backups: Vec<BackupFile>, now: Timestamp) -> Plan {
        let mut removed = vec![false; backups.len()];

        if self.max_backups > 0 {
            // a backup and its compressed counterpart are one logical backup
            let mut ranks = HashMap::new();
            for (i, backup) in backups.iter().enumerate() {
                let next = ranks.len();
                let rank = *ranks.entry(backup.logical_name()).or_insert(next);
                if rank >= self.max_backups {
                    removed[i] = true;
                }
            }
        }

        if self.max_age_days > 0 {
            let max_age = SignedDuration::from_hours(24 * i64::from(self.max_age_days));
            let cutoff = now.checked_sub(max_age).unwrap_or(Timestamp::MIN);
            for (i, backup) in backups.iter().enumerate() {
                if backup.timestamp < cutoff {
                    removed[i] = true;
                }
            }
        }

        let mut plan = Plan::default();
        for (backup, removed) in backups.into_iter().zip(removed) {
            if removed {
                plan.remove.push(backup);
            } else if self.compress && !backup.compressed {
                plan.compress.push(backup);
            }
        }
        plan
    }
}

/// Gzip `src` into `dst`, then remove `src`.
///
/// `dst` gets the mode of `src` and is removed again if compression fails.
pub(crate) fn compress_file(src: &Path, dst: &Path) -> Result<(), Error> {
    let failure = |message: &str| {
        Error::new(ErrorKind::MaintenanceFailure, message).with_context("path", src.display())
    };

    let mut reader =
        File::open(src).map_err(|err| failure("failed to open backup").with_source(err))?;
    let metadata = reader
        .metadata()
        .map_err(|err| failure("failed to stat backup").with_source(err))?;
    let writer = mode::create_truncate(dst, mode::file_mode(&metadata))
        .map_err(|err| failure("failed to open compressed backup").with_source(err))?;

    if let Err(err) = gzip(&mut reader, writer) {
        let _ = fs::remove_file(dst);
        return Err(failure("failed to compress backup").with_source(err));
    }
    drop(reader);

    fs::remove_file(src)
        .map_err(|err| failure("failed to remove compressed backup").with_source(err))
}

fn gzip(reader: &mut File, writer: File) -> io::Result<()> {
    let mut encoder = GzEncoder::new(writer, Compression::default());
    io::copy(reader, &mut encoder)?;
    let file = encoder.finish()?;
    file.sync_all()
}

/// Owner of the background maintenance thread.
///
/// Signals go through a channel of capacity one: a signal sent while another is pending is
/// dropped, since the pending pass will see the same directory.
#[derive(Debug)]
pub(crate) struct Maintainer {
    retention: Arc<Retention>,
    trap: Arc<dyn Trap>,
    worker: Option<Worker>,
}

#[derive(Debug)]
struct Worker {
    sender: Sender<()>,
    handle: JoinHandle<()>,
}

impl Maintainer {
    pub(crate) fn new(retention: Retention, trap: Arc<dyn Trap>) -> Maintainer {
        Maintainer {
            retention: Arc::new(retention),
            trap,
            worker: None,
        }
    }

    /// Request a maintenance pass, starting the worker thread on first use. Never blocks.
    pub(crate) fn signal(&mut self) {
        if self.worker.is_none() {
            match self.spawn() {
                Ok(worker) => self.worker = Some(worker),
                Err(err) => {
                    self.trap.trap(&err);
                    return;
                }
            }
        }

        let disconnected = match &self.worker {
            Some(worker) => matches!(
                worker.sender.try_send(()),
                Err(TrySendError::Disconnected(()))
            ),
            None => false,
        };

        if disconnected {
            // the thread died; a new one is spawned on the next signal
            if let Some(worker) = self.worker.take() {
                let _ = worker.handle.join();
            }
            let err = Error::new(ErrorKind::MaintenanceFailure, "maintenance thread has exited");
            self.trap.trap(&err);
        }
    }

    /// Stop the worker after it has drained any pending signal.
    pub(crate) fn shutdown(&mut self) {
        if let Some(Worker { sender, handle }) = self.worker.take() {
            drop(sender);
            if handle.join().is_err() {
                let err = Error::new(ErrorKind::MaintenanceFailure, "maintenance thread panicked");
                self.trap.trap(&err);
            }
        }
    }

    fn spawn(&self) -> Result<Worker, Error> {
        let (sender, receiver) = crossbeam_channel::bounded(1);
        let retention = self.retention.clone();
        let trap = self.trap.clone();

        let handle = std::thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || run(retention, trap, receiver))
            .map_err(|err| {
                Error::new(ErrorKind::MaintenanceFailure, "failed to spawn maintenance thread")
                    .with_source(err)
            })?;

        Ok(Worker { sender, handle })
    }
}

impl Drop for Maintainer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(retention: Arc<Retention>, trap: Arc<dyn Trap>, receiver: Receiver<()>) {
    while receiver.recv().is_ok() {
        if let Err(err) = retention.run_once() {
            trap.trap(&err);
        }
    }
}
