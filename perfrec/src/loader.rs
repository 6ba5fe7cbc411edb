//! Merge of many producer logs into one store.
//!
//! Each log is its own staging scope: the loader replays it into a fresh staging area, resets
//! the flush engine's id maps and flushes it as one transaction. The shared backend is the only
//! thing that carries over between files, which is what merges the producers' independent local
//! id spaces into one global id space.

pub mod fs;


use crate::{
    database::BulkInsertBackend,
    entity::{EntityClass, EntityType, ID},
    error::ReconcileError,
    flush::{FlushEngine, FlushReport},
    protocol::{ConnectInfo, LogLine, LogReader, Vocabulary},
    staging::StagingArea,
};
use std::{
    collections::BTreeMap,
    fs::File,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadOptions {
    /// vocabulary every log has to declare, any if `None`
    pub expected_format: Option<Vocabulary>,
    /// rename merged logs with the done prefix
    pub mark_done: bool,
}

/// Running totals over every file merged so far
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub files: usize,
    pub totals: FlushReport,
    /// lines dropped for an unknown keyword
    pub skipped_lines: usize,
    /// fact types whose highest id went down from one file to the next
    pub regressions: usize,
}

impl LoadSummary {
    fn absorb(&mut self, report: &FlushReport, skipped_lines: usize) {
        for (entity, max) in &report.maxima {
            let previous = self.totals.maxima.get(entity).copied();

            if let Some(previous) = previous.filter(|previous| {
                entity.class() == EntityClass::Fact && *max < *previous
            }) {
                warn!(
                    entity = %entity,
                    previous = previous,
                    current = max,
                    "Highest id went backwards, another writer may be using the store"
                );
                self.regressions += 1;
            }
        }

        self.files += 1;
        self.skipped_lines += skipped_lines;
        self.totals.merge(report);
    }

    pub fn maximum(&self, entity: EntityType) -> Option<ID> {
        self.totals.maxima.get(&entity).copied()
    }

    pub fn rows(&self) -> &BTreeMap<EntityType, usize> {
        &self.totals.rows
    }

    pub fn log(&self) {
        info!(
            files = self.files,
            rows = self.totals.total(),
            skipped_lines = self.skipped_lines,
            "Merge finished"
        );

        for (entity, rows) in &self.totals.rows {
            info!(
                entity = %entity,
                rows = rows,
                max_id = ?self.totals.maxima.get(entity),
                "Merged"
            );
        }
    }
}

/// Replays logs one after another against a single backend
#[derive(Debug)]
pub struct MergeLoader<B> {
    backend: B,
    options: LoadOptions,
    engine: FlushEngine,
    connect: Option<ConnectInfo>,
    summary: LoadSummary,
}

impl<B: BulkInsertBackend> MergeLoader<B> {
    pub fn new(backend: B, options: LoadOptions) -> Self {
        Self {
            backend,
            options,
            engine: FlushEngine::new(),
            connect: None,
            summary: LoadSummary::default(),
        }
    }

    /// Merge files in the given order, stopping at the first failure.
    ///
    /// Files merged before the failing one stay committed; the failing one leaves no trace.
    #[instrument(skip_all, fields(files = paths.len()))]
    pub fn load_all(&mut self, paths: &[PathBuf]) -> Result<&LoadSummary, ReconcileError> {
        for path in paths {
            self.load_file(path)?;
        }

        Ok(&self.summary)
    }

    #[instrument(skip(self))]
    pub fn load_file(&mut self, path: &Path) -> Result<FlushReport, ReconcileError> {
        info!("Merging log");

        let file = File::open(path).map_err(|source| ReconcileError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let report = self
            .load_reader(BufReader::new(file))
            .map_err(|error| error.in_file(path))?;

        if self.options.mark_done {
            fs::mark_done(path).map_err(|source| ReconcileError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        }

        Ok(report)
    }

    /// Replay one log as its own staging scope
    pub fn load_reader<R: BufRead>(&mut self, reader: R) -> Result<FlushReport, ReconcileError> {
        let mut reader = LogReader::new(reader, self.options.expected_format);
        let mut staging = StagingArea::new();
        let mut disconnected = false;

        self.engine.reset();

        for entry in reader.by_ref() {
            let entry = entry?;

            match entry.content {
                LogLine::Commit { record, local_id } => {
                    staging.stage(record, local_id);
                }
                LogLine::Connect(connect) => self.check_connect(connect)?,
                LogLine::Disconnect => disconnected = true,
                LogLine::Version(_) | LogLine::Format(_) | LogLine::Construct(_) => {}
            }
        }

        if !disconnected {
            warn!("Log ends without DISCONNECT, its producer may have stopped early");
        }

        debug!(staged = ?staging.counts(), "Replayed log");

        let report = self.engine.flush(&mut staging, &mut self.backend)?;
        self.summary.absorb(&report, reader.skipped());

        Ok(report)
    }

    /// Every log of one merge has to target the same destination
    fn check_connect(&mut self, connect: ConnectInfo) -> Result<(), ReconcileError> {
        match self.connect {
            Some(ref expected) => Ok(expected.check(&connect)?),
            None => {
                debug!(connect = ?connect, "Merge destination");
                self.connect = Some(connect);

                Ok(())
            }
        }
    }

    pub fn summary(&self) -> &LoadSummary {
        &self.summary
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn into_backend(self) -> B {
        self.backend
    }
}
