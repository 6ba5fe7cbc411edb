use super::{batch_keys, check_rows, check_values, columns, table, BulkInsertBackend, ConnectionError};
use crate::{
    config::DatabaseConfig,
    entity::{EntityClass, EntityType, Field, NaturalKey, Record, ID},
    sequence::{derive_by_sequence, reorder_by_key, MissingKey},
};
use itertools::Itertools;
use rusqlite::{params, params_from_iter, types::ToSqlOutput, Connection, Row, ToSql};
use std::{iter::repeat, time::Duration};
use tracing::{debug, error, info, trace};

/// Bound parameter limit of a single statement (SQLITE_MAX_VARIABLE_NUMBER since 3.32)
const MAX_BIND_PARAMETERS: usize = 32_766;

impl ToSql for Field {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Field::Integer(value) => ToSqlOutput::from(*value),
            Field::Real(value) => ToSqlOutput::from(*value),
            Field::Text(value) => ToSqlOutput::from(value.as_str()),
        })
    }
}

#[derive(Debug)]
pub struct SqliteBackend {
    connection: Connection,
    in_transaction: bool,
}

impl SqliteBackend {
    pub fn open(config: &DatabaseConfig) -> Result<Self, ConnectionError> {
        info!(path = ?config.path, "Opening SQLite database");

        Self::from_connection(Connection::open(&config.path)?, config.busy_timeout_ms)
    }

    pub fn open_in_memory() -> Result<Self, ConnectionError> {
        Self::from_connection(Connection::open_in_memory()?, 0)
    }

    fn from_connection(connection: Connection, busy_timeout_ms: u64) -> Result<Self, ConnectionError> {
        connection.busy_timeout(Duration::from_millis(busy_timeout_ms))?;
        connection.pragma_update(None, "foreign_keys", true)?;

        let mut backend = Self {
            connection,
            in_transaction: false,
        };
        backend.init()?;

        Ok(backend)
    }

    pub fn init(&mut self) -> Result<(), ConnectionError> {
        let mut counter = 1;

        for table in SQL_SCHEMA {
            match self.connection.execute(table, []) {
                Ok(_) => debug!("Applied SQL schema ({counter}/{SQL_SCHEMA_NUMBER})"),
                Err(error) => {
                    error!(error = ?error, table = table, "Failed to apply SQL schema ({counter}/{SQL_SCHEMA_NUMBER}): {error}");

                    return Err(ConnectionError::SQLite(error));
                }
            };

            counter += 1;
        }

        Ok(())
    }

    pub fn close(mut self) -> Result<(), ConnectionError> {
        let mut counter = 0;
        while let Err((connection, error)) = self.connection.close() {
            counter += 1;
            self.connection = connection;
            error!(error = ?error, "Failed to close SQLite connection: {error}, trying again {counter}/3");

            if counter == 3 {
                error!("Failed to close connection, giving up");

                return Err(ConnectionError::SQLite(error));
            }
        }

        info!("Closed SQLite connection");

        Ok(())
    }

    /// raw connection, for inspecting the stored rows
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn count(&self, entity: EntityType) -> Result<usize, ConnectionError> {
        let count: i64 = self.connection.query_row(
            &format!("select count(*) from {}", table(entity)),
            [],
            |row| row.get(0),
        )?;

        Ok(count as usize)
    }

    /// Insert rows with as few statements as the bind limit allows
    fn insert_rows(
        &self,
        entity: EntityType,
        rows: &[Record],
        verb: &str,
    ) -> Result<usize, ConnectionError> {
        let columns = columns(entity);
        let per_statement = (MAX_BIND_PARAMETERS / columns.len()).max(1);
        let tuple = format!("({})", repeat("?").take(columns.len()).join(", "));
        let mut inserted = 0;

        for chunk in rows.chunks(per_statement) {
            let sql = format!(
                "{verb} into {} ({}) values {}",
                table(entity),
                columns.join(", "),
                repeat(tuple.as_str()).take(chunk.len()).join(", ")
            );
            let values = chunk.iter().flat_map(Record::fields).collect_vec();

            inserted += self
                .connection
                .prepare_cached(&sql)?
                .execute(params_from_iter(values.iter()))?;
        }

        trace!(entity = %entity, rows = rows.len(), inserted = inserted, "Inserted batch");

        Ok(inserted)
    }

    /// Look up ids for a set of natural keys; result order is whatever SQLite returns
    fn fetch_ids(
        &self,
        entity: EntityType,
        keys: &[NaturalKey],
    ) -> Result<Vec<(NaturalKey, ID)>, ConnectionError> {
        let key_columns: &[&str] = match entity {
            EntityType::Dataset => &["applicationID", "name"],
            _ => &["name"],
        };
        let per_statement = MAX_BIND_PARAMETERS / key_columns.len();
        let mut fetched = Vec::with_capacity(keys.len());

        for chunk in keys.chunks(per_statement) {
            let condition = if key_columns.len() == 1 {
                format!(
                    "{} in ({})",
                    key_columns[0],
                    repeat("?").take(chunk.len()).join(", ")
                )
            } else {
                let tuple = format!("({})", repeat("?").take(key_columns.len()).join(", "));

                format!(
                    "({}) in (values {})",
                    key_columns.join(", "),
                    repeat(tuple.as_str()).take(chunk.len()).join(", ")
                )
            };
            let sql = format!(
                "select id, {} from {} where {condition}",
                key_columns.join(", "),
                table(entity)
            );
            let values = chunk.iter().flat_map(key_fields).collect_vec();

            let mut statement = self.connection.prepare_cached(&sql)?;
            let rows = statement.query_map(params_from_iter(values.iter()), |row| {
                Ok((row_key(entity, row)?, row.get::<_, ID>(0)?))
            })?;

            for row in rows {
                fetched.push(row?);
            }
        }

        Ok(fetched)
    }

    fn max_id(&self, entity: EntityType) -> Result<ID, ConnectionError> {
        Ok(self.connection.query_row(
            &format!("select coalesce(max(id), 0) from {}", table(entity)),
            [],
            |row| row.get(0),
        )?)
    }
}

fn key_fields(key: &NaturalKey) -> Vec<Field> {
    match key {
        NaturalKey::Name(name) => vec![Field::Text(name.clone())],
        NaturalKey::Scoped(parent, name) => vec![Field::Integer(*parent), Field::Text(name.clone())],
    }
}

fn row_key(entity: EntityType, row: &Row<'_>) -> rusqlite::Result<NaturalKey> {
    match entity {
        EntityType::Dataset => Ok(NaturalKey::Scoped(row.get(1)?, row.get(2)?)),
        _ => Ok(NaturalKey::Name(row.get(1)?)),
    }
}

impl BulkInsertBackend for SqliteBackend {
    fn begin(&mut self) -> Result<(), ConnectionError> {
        self.connection.execute_batch("begin immediate")?;
        self.in_transaction = true;

        Ok(())
    }

    fn commit(&mut self) -> Result<(), ConnectionError> {
        if !self.in_transaction {
            return Err(ConnectionError::NoTransaction);
        }

        self.connection.execute_batch("commit")?;
        self.in_transaction = false;

        Ok(())
    }

    fn rollback(&mut self) -> Result<(), ConnectionError> {
        if !self.in_transaction {
            return Err(ConnectionError::NoTransaction);
        }

        self.in_transaction = false;
        self.connection.execute_batch("rollback")?;

        Ok(())
    }

    fn insert_dedup_and_fetch_ids(
        &mut self,
        entity: EntityType,
        rows: &[Record],
    ) -> Result<Vec<ID>, ConnectionError> {
        check_rows(entity, EntityClass::Dimension, rows)?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let keys = batch_keys(entity, rows)?;
        let inserted = self.insert_rows(entity, rows, "insert or ignore")?;
        let fetched = self.fetch_ids(entity, &keys)?;

        debug!(
            entity = %entity,
            rows = rows.len(),
            new = inserted,
            "Deduplicating insert"
        );

        reorder_by_key(&keys, fetched)
            .map_err(|MissingKey(key)| ConnectionError::MissingKey { entity, key })
    }

    fn insert_and_derive_ids(
        &mut self,
        entity: EntityType,
        rows: &[Record],
    ) -> Result<Vec<ID>, ConnectionError> {
        check_rows(entity, EntityClass::Fact, rows)?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let prior = self.max_id(entity)?;
        let inserted = self.insert_rows(entity, rows, "insert")?;

        // the derivation below is only valid if this batch got one contiguous id range
        let (found, first, last): (i64, ID, ID) = self.connection.query_row(
            &format!(
                "select count(*), coalesce(min(id), 0), coalesce(max(id), 0) from {} where id > ?",
                table(entity)
            ),
            params![prior],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        if inserted != rows.len() || found as usize != rows.len() || last - first + 1 != rows.len() as ID {
            error!(entity = %entity, rows = rows.len(), found = found, first = first, last = last, "Sequence assumption violated");

            return Err(ConnectionError::NonContiguous {
                entity,
                rows: rows.len(),
                found: found as usize,
                first,
                last,
            });
        }

        debug!(entity = %entity, rows = rows.len(), first = first, "Sequenced insert");

        Ok(derive_by_sequence(first, rows.len()))
    }

    fn insert_all(&mut self, entity: EntityType, rows: &[Record]) -> Result<usize, ConnectionError> {
        check_rows(entity, EntityClass::Value, rows)?;
        check_values(entity, rows)?;
        if rows.is_empty() {
            return Ok(0);
        }

        self.insert_rows(entity, rows, "insert")
    }
}

pub const SQL_SCHEMA: [&str; 10] = [
    "create table if not exists datacollections (
    id integer primary key autoincrement,
    name text not null unique,
    description text not null,
    created text not null default current_timestamp
);",
    "create table if not exists machines (
    id integer primary key autoincrement,
    name text not null unique,
    description text not null
);",
    "create table if not exists applications (
    id integer primary key autoincrement,
    name text not null unique,
    description text not null
);",
    "create table if not exists metrics (
    id integer primary key autoincrement,
    type text not null check (type in ('result', 'deterministic', 'nondeterministic', 'machine', 'other')),
    name text not null unique,
    description text not null
);",
    "create table if not exists datasets (
    id integer primary key autoincrement,
    applicationID integer not null references applications (id),
    name text not null,
    description text not null,
    created text not null default current_timestamp,
    url text not null,
    unique (applicationID, name)
);",
    "create table if not exists trials (
    id integer primary key autoincrement,
    dataCollectionID integer not null references datacollections (id),
    machineID integer not null references machines (id),
    applicationID integer not null references applications (id),
    datasetID integer not null references datasets (id)
);",
    "create table if not exists executions (
    id integer primary key autoincrement,
    trialID integer not null references trials (id),
    machineID integer not null references machines (id)
);",
    "create table if not exists machine_metrics (
    machineID integer not null references machines (id),
    metricID integer not null references metrics (id),
    metric real not null
);",
    "create table if not exists deterministic_metrics (
    datasetID integer not null references datasets (id),
    metricID integer not null references metrics (id),
    metric real not null
);",
    "create table if not exists nondeterministic_metrics (
    executionID integer not null references executions (id),
    metricID integer not null references metrics (id),
    metric real not null
);",
];
pub const SQL_SCHEMA_NUMBER: usize = SQL_SCHEMA.len();
