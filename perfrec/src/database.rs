pub mod memory;
pub mod sqlite;

#[cfg(test)]
mod memory_test;

use crate::entity::{EntityClass, EntityType, NaturalKey, Record, ID};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("SQLite error")]
    SQLite(#[from] rusqlite::Error),
    #[error("Row of type {found} handed to the {expected} table")]
    RowMismatch {
        expected: EntityType,
        found: EntityType,
    },
    #[error("{entity} is not a {expected:?} table")]
    WrongPolicy {
        entity: EntityType,
        expected: EntityClass,
    },
    #[error("Batch for {entity} contains the key {key:?} more than once")]
    DuplicateKey { entity: EntityType, key: NaturalKey },
    #[error("Key {key:?} is missing from {entity} after insert")]
    MissingKey { entity: EntityType, key: NaturalKey },
    #[error("Ids for {entity} are not contiguous: {rows} rows inserted, store reports {found} rows in {first}..={last}")]
    NonContiguous {
        entity: EntityType,
        rows: usize,
        found: usize,
        first: ID,
        last: ID,
    },
    #[error("Backend returned {found} ids for {expected} {entity} rows")]
    IdCount {
        entity: EntityType,
        expected: usize,
        found: usize,
    },
    #[error("{entity} row holds the non-finite value {value}")]
    NonFiniteValue { entity: EntityType, value: f64 },
    #[error("Backend rejected {entity} rows")]
    Rejected { entity: EntityType },
    #[error("No transaction is open")]
    NoTransaction,
}

/// Relational store the flush engine writes through; every call covers a whole batch.
pub trait BulkInsertBackend {
    /// open the transaction spanning one flush cycle
    fn begin(&mut self) -> Result<(), ConnectionError>;

    fn commit(&mut self) -> Result<(), ConnectionError>;

    /// drop everything written since `begin`
    fn rollback(&mut self) -> Result<(), ConnectionError>;

    /// Insert rows whose natural key is absent and return the stored id for every row, in input
    /// order. Rows whose key already exists keep the stored non-key fields.
    fn insert_dedup_and_fetch_ids(
        &mut self,
        entity: EntityType,
        rows: &[Record],
    ) -> Result<Vec<ID>, ConnectionError>;

    /// Append rows and return their fresh ids, derived from the first row's id
    fn insert_and_derive_ids(
        &mut self,
        entity: EntityType,
        rows: &[Record],
    ) -> Result<Vec<ID>, ConnectionError>;

    /// Append rows that carry no id of their own
    fn insert_all(&mut self, entity: EntityType, rows: &[Record]) -> Result<usize, ConnectionError>;
}

impl<B: BulkInsertBackend + ?Sized> BulkInsertBackend for Box<B> {
    fn begin(&mut self) -> Result<(), ConnectionError> {
        (**self).begin()
    }

    fn commit(&mut self) -> Result<(), ConnectionError> {
        (**self).commit()
    }

    fn rollback(&mut self) -> Result<(), ConnectionError> {
        (**self).rollback()
    }

    fn insert_dedup_and_fetch_ids(
        &mut self,
        entity: EntityType,
        rows: &[Record],
    ) -> Result<Vec<ID>, ConnectionError> {
        (**self).insert_dedup_and_fetch_ids(entity, rows)
    }

    fn insert_and_derive_ids(
        &mut self,
        entity: EntityType,
        rows: &[Record],
    ) -> Result<Vec<ID>, ConnectionError> {
        (**self).insert_and_derive_ids(entity, rows)
    }

    fn insert_all(&mut self, entity: EntityType, rows: &[Record]) -> Result<usize, ConnectionError> {
        (**self).insert_all(entity, rows)
    }
}

impl<B: BulkInsertBackend + ?Sized> BulkInsertBackend for &mut B {
    fn begin(&mut self) -> Result<(), ConnectionError> {
        (**self).begin()
    }

    fn commit(&mut self) -> Result<(), ConnectionError> {
        (**self).commit()
    }

    fn rollback(&mut self) -> Result<(), ConnectionError> {
        (**self).rollback()
    }

    fn insert_dedup_and_fetch_ids(
        &mut self,
        entity: EntityType,
        rows: &[Record],
    ) -> Result<Vec<ID>, ConnectionError> {
        (**self).insert_dedup_and_fetch_ids(entity, rows)
    }

    fn insert_and_derive_ids(
        &mut self,
        entity: EntityType,
        rows: &[Record],
    ) -> Result<Vec<ID>, ConnectionError> {
        (**self).insert_and_derive_ids(entity, rows)
    }

    fn insert_all(&mut self, entity: EntityType, rows: &[Record]) -> Result<usize, ConnectionError> {
        (**self).insert_all(entity, rows)
    }
}

/// All available storage adapters, selected from the loader configuration
#[derive(Debug)]
pub enum ConnectionAdapter {
    SQLite(sqlite::SqliteBackend),
    Memory(memory::MemoryBackend),
}

impl ConnectionAdapter {
    pub fn close(self) -> Result<(), ConnectionError> {
        match self {
            Self::SQLite(backend) => backend.close(),
            Self::Memory(_) => Ok(()),
        }
    }
}

impl BulkInsertBackend for ConnectionAdapter {
    fn begin(&mut self) -> Result<(), ConnectionError> {
        match self {
            Self::SQLite(backend) => backend.begin(),
            Self::Memory(backend) => backend.begin(),
        }
    }

    fn commit(&mut self) -> Result<(), ConnectionError> {
        match self {
            Self::SQLite(backend) => backend.commit(),
            Self::Memory(backend) => backend.commit(),
        }
    }

    fn rollback(&mut self) -> Result<(), ConnectionError> {
        match self {
            Self::SQLite(backend) => backend.rollback(),
            Self::Memory(backend) => backend.rollback(),
        }
    }

    fn insert_dedup_and_fetch_ids(
        &mut self,
        entity: EntityType,
        rows: &[Record],
    ) -> Result<Vec<ID>, ConnectionError> {
        match self {
            Self::SQLite(backend) => backend.insert_dedup_and_fetch_ids(entity, rows),
            Self::Memory(backend) => backend.insert_dedup_and_fetch_ids(entity, rows),
        }
    }

    fn insert_and_derive_ids(
        &mut self,
        entity: EntityType,
        rows: &[Record],
    ) -> Result<Vec<ID>, ConnectionError> {
        match self {
            Self::SQLite(backend) => backend.insert_and_derive_ids(entity, rows),
            Self::Memory(backend) => backend.insert_and_derive_ids(entity, rows),
        }
    }

    fn insert_all(&mut self, entity: EntityType, rows: &[Record]) -> Result<usize, ConnectionError> {
        match self {
            Self::SQLite(backend) => backend.insert_all(entity, rows),
            Self::Memory(backend) => backend.insert_all(entity, rows),
        }
    }
}

/// Table backing an entity type
pub const fn table(entity: EntityType) -> &'static str {
    match entity {
        EntityType::DataCollection => "datacollections",
        EntityType::Machine => "machines",
        EntityType::Application => "applications",
        EntityType::Metric => "metrics",
        EntityType::Dataset => "datasets",
        EntityType::Trial => "trials",
        EntityType::Execution => "executions",
        EntityType::MachineMetric => "machine_metrics",
        EntityType::DeterministicMetric => "deterministic_metrics",
        EntityType::NondeterministicMetric => "nondeterministic_metrics",
    }
}

/// Insert columns, matching the order of `Record::fields`
pub const fn columns(entity: EntityType) -> &'static [&'static str] {
    match entity {
        EntityType::DataCollection | EntityType::Machine | EntityType::Application => {
            &["name", "description"]
        }
        EntityType::Metric => &["type", "name", "description"],
        EntityType::Dataset => &["applicationID", "name", "description", "url"],
        EntityType::Trial => &["dataCollectionID", "machineID", "applicationID", "datasetID"],
        EntityType::Execution => &["trialID", "machineID"],
        EntityType::MachineMetric => &["machineID", "metricID", "metric"],
        EntityType::DeterministicMetric => &["datasetID", "metricID", "metric"],
        EntityType::NondeterministicMetric => &["executionID", "metricID", "metric"],
    }
}

/// Reject rows that belong to another table or a table used with the wrong primitive.
pub fn check_rows(
    entity: EntityType,
    expected: EntityClass,
    rows: &[Record],
) -> Result<(), ConnectionError> {
    if entity.class() != expected {
        return Err(ConnectionError::WrongPolicy { entity, expected });
    }

    match rows.iter().find(|row| row.entity_type() != entity) {
        Some(row) => Err(ConnectionError::RowMismatch {
            expected: entity,
            found: row.entity_type(),
        }),
        None => Ok(()),
    }
}

/// Metric values must be finite, SQLite would store NaN as NULL
pub fn check_values(entity: EntityType, rows: &[Record]) -> Result<(), ConnectionError> {
    match rows
        .iter()
        .filter_map(Record::value)
        .find(|value| !value.is_finite())
    {
        Some(value) => Err(ConnectionError::NonFiniteValue { entity, value }),
        None => Ok(()),
    }
}

/// Natural keys of a dimension batch, which must hold every key at most once
pub fn batch_keys(entity: EntityType, rows: &[Record]) -> Result<Vec<NaturalKey>, ConnectionError> {
    let mut seen = HashSet::with_capacity(rows.len());
    let mut keys = Vec::with_capacity(rows.len());

    for row in rows {
        let key = row.natural_key().ok_or(ConnectionError::WrongPolicy {
            entity,
            expected: EntityClass::Dimension,
        })?;

        if !seen.insert(key.clone()) {
            return Err(ConnectionError::DuplicateKey { entity, key });
        }

        keys.push(key);
    }

    Ok(keys)
}
