//! Producer side: commit typed records, log them and optionally flush them directly.

use crate::{
    config::RecorderConfig,
    database::BulkInsertBackend,
    entity::{EntityClass, EntityType, Field, Identified, Leaf, LocalId, Record, ID},
    error::ReconcileError,
    flush::{FlushEngine, FlushReport},
    protocol::{ConnectInfo, LogWriter, ProtocolError, Vocabulary},
    sequence::{LocalSequence, SequenceOffsets},
    staging::StagingArea,
};
use parking_lot::{lock_api::ArcMutexGuard, FairMutex, RawFairMutex};
use std::{
    collections::{hash_map::Entry, BTreeMap, HashMap},
    fs::File,
    io::{self, BufWriter, Write},
    path::PathBuf,
    sync::Arc,
};
use tracing::{debug, info, trace};

/// Full field set of a dimension record, two commits with equal keys are the same record
type DimensionKey = Vec<String>;

fn dimension_key(record: &Record) -> DimensionKey {
    record
        .fields()
        .into_iter()
        .map(|field| match field {
            Field::Integer(value) => value.to_string(),
            Field::Real(value) => value.to_string(),
            Field::Text(value) => value,
        })
        .collect()
}

/// Staging scope of one producing process.
///
/// Every commit is written to the log right away and staged; `flush` writes the staged records
/// to a backend without going through the log.
#[derive(Debug)]
pub struct Recorder<W: Write> {
    writer: LogWriter<W>,
    staging: StagingArea,
    engine: FlushEngine,
    dimensions: BTreeMap<EntityType, HashMap<DimensionKey, ID>>,
    trials: LocalSequence,
    executions: LocalSequence,
    offsets_path: Option<PathBuf>,
    constructors: bool,
}

impl Recorder<BufWriter<File>> {
    /// Open the log named by `config` and write its header
    pub fn create(config: &RecorderConfig) -> Result<Self, ReconcileError> {
        let path = config.log_path()?;
        let file = File::create(&path).map_err(|source| ReconcileError::Io {
            path: path.clone(),
            source,
        })?;
        let offsets = match config.offsets {
            Some(ref offsets) => SequenceOffsets::load(offsets)?,
            None => SequenceOffsets::default(),
        };

        info!(path = ?path, format = %config.format, "Recording to log");

        let mut recorder =
            Self::with_writer(BufWriter::new(file), config.format, &config.connect, offsets)
                .map_err(|source| ReconcileError::Io {
                    path: path.clone(),
                    source,
                })?;
        recorder.offsets_path = config.offsets.clone();
        recorder.constructors = config.constructors;

        Ok(recorder)
    }
}

impl<W: Write> Recorder<W> {
    pub fn with_writer(
        inner: W,
        vocabulary: Vocabulary,
        connect: &ConnectInfo,
        offsets: SequenceOffsets,
    ) -> io::Result<Self> {
        let mut writer = LogWriter::new(inner, vocabulary);
        writer.header(connect)?;

        Ok(Self {
            writer,
            staging: StagingArea::new(),
            engine: FlushEngine::new(),
            dimensions: BTreeMap::new(),
            trials: LocalSequence::new(offsets.trial),
            executions: LocalSequence::new(offsets.execution),
            offsets_path: None,
            constructors: false,
        })
    }

    /// write a constructor line before every commit line
    pub fn with_constructors(mut self, constructors: bool) -> Self {
        self.constructors = constructors;
        self
    }

    /// Commit a dimension or fact and return its local id.
    ///
    /// Committing a dimension equal to an earlier one returns the earlier id; the line is still
    /// logged so the log mirrors every commit.
    pub fn commit<T: Identified>(&mut self, record: T) -> Result<LocalId<T>, ReconcileError> {
        let record: Record = record.into();

        let (local, fresh) = match T::TYPE.class() {
            EntityClass::Dimension => {
                let known = self.dimensions.entry(T::TYPE).or_default();
                let next = known.len() as ID;

                match known.entry(dimension_key(&record)) {
                    Entry::Occupied(entry) => (*entry.get(), false),
                    Entry::Vacant(entry) => (*entry.insert(next), true),
                }
            }
            _ => {
                let sequence = if T::TYPE == EntityType::Trial {
                    &mut self.trials
                } else {
                    &mut self.executions
                };

                (sequence.next_id(), true)
            }
        };

        self.log(&record, Some(local))?;

        if fresh {
            self.staging.stage(record, Some(local));
        } else {
            trace!(entity = %T::TYPE, local = local, "Dimension committed again");
        }

        Ok(LocalId::from_raw(local))
    }

    /// Commit a metric value
    pub fn commit_value<T: Leaf>(&mut self, record: T) -> Result<(), ReconcileError> {
        let record: Record = record.into();

        if let Some(value) = record.value().filter(|value| !value.is_finite()) {
            return Err(ReconcileError::NonFiniteValue {
                entity: T::TYPE,
                value,
            });
        }

        self.log(&record, None)?;
        self.staging.stage(record, None);

        Ok(())
    }

    fn log(&mut self, record: &Record, local: Option<ID>) -> Result<(), ReconcileError> {
        let entity = record.entity_type();

        if self.constructors {
            self.writer.construct(entity).map_err(ProtocolError::from)?;
        }
        self.writer
            .commit(record, local)
            .map_err(|error| ProtocolError::from(error).into())
    }

    /// Write everything staged so far to `backend`; ids of earlier flushes stay resolvable
    pub fn flush<B: BulkInsertBackend + ?Sized>(
        &mut self,
        backend: &mut B,
    ) -> Result<FlushReport, ReconcileError> {
        self.engine.flush(&mut self.staging, backend)
    }

    /// Global id of a record flushed by this recorder
    pub fn resolve<T: Identified>(&self, id: LocalId<T>) -> Option<ID> {
        self.engine.resolve(T::TYPE, id.get())
    }

    pub fn staged(&self) -> BTreeMap<EntityType, usize> {
        self.staging.counts()
    }

    /// Fact sequence values to persist, the next unused local id per fact type
    pub fn offsets(&self) -> SequenceOffsets {
        SequenceOffsets {
            trial: self.trials.peek(),
            execution: self.executions.peek(),
        }
    }

    /// Close the log and persist the offsets; records still staged are only kept in the log
    pub fn finish(mut self) -> Result<W, ReconcileError> {
        self.writer.disconnect().map_err(ProtocolError::from)?;
        self.writer.flush().map_err(ProtocolError::from)?;

        if let Some(ref path) = self.offsets_path {
            self.offsets().store(path)?;
        }

        debug!(
            trials = self.trials.issued(),
            executions = self.executions.issued(),
            unflushed = ?self.staging.counts(),
            "Recorder finished"
        );

        Ok(self.writer.into_inner())
    }
}

/// Thread safe handle on one recorder, every clone commits into the same log
#[derive(Debug)]
pub struct SharedRecorder<W: Write>(Arc<FairMutex<Recorder<W>>>);

impl<W: Write> Clone for SharedRecorder<W> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<W: Write> SharedRecorder<W> {
    pub fn new(recorder: Recorder<W>) -> Self {
        Self(Arc::new(FairMutex::new(recorder)))
    }

    pub fn lock(&self) -> ArcMutexGuard<RawFairMutex, Recorder<W>> {
        self.0.lock_arc()
    }

    pub fn commit<T: Identified>(&self, record: T) -> Result<LocalId<T>, ReconcileError> {
        self.lock().commit(record)
    }

    pub fn commit_value<T: Leaf>(&self, record: T) -> Result<(), ReconcileError> {
        self.lock().commit_value(record)
    }

    /// Unwrap the recorder once every other handle is gone
    pub fn into_inner(self) -> Result<Recorder<W>, Self> {
        Arc::try_unwrap(self.0)
            .map(|mutex| mutex.into_inner())
            .map_err(Self)
    }
}
