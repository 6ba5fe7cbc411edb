use serde::{Deserialize, Serialize};
use std::{fmt, marker::PhantomData, str::FromStr};
use thiserror::Error;

/// Identifier type used for both local (producer) and global (store) ids
pub type ID = i64;

/// Every record kind that can be staged, logged and flushed
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityType {
    DataCollection,
    Machine,
    Application,
    Metric,
    Dataset,
    Trial,
    Execution,
    MachineMetric,
    DeterministicMetric,
    NondeterministicMetric,
}

/// How an entity type receives its global id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityClass {
    /// deduplicated by natural key, insertion is idempotent
    Dimension,
    /// fresh id per commit, assigned in commit order
    Fact,
    /// leaf rows without an id of their own
    Value,
}

impl EntityType {
    pub const ALL: [EntityType; 10] = [
        Self::DataCollection,
        Self::Machine,
        Self::Application,
        Self::Metric,
        Self::Dataset,
        Self::Trial,
        Self::Execution,
        Self::MachineMetric,
        Self::DeterministicMetric,
        Self::NondeterministicMetric,
    ];

    pub const fn class(self) -> EntityClass {
        match self {
            Self::DataCollection
            | Self::Machine
            | Self::Application
            | Self::Metric
            | Self::Dataset => EntityClass::Dimension,
            Self::Trial | Self::Execution => EntityClass::Fact,
            Self::MachineMetric | Self::DeterministicMetric | Self::NondeterministicMetric => {
                EntityClass::Value
            }
        }
    }

    /// whether records of this type carry a local id
    pub const fn is_identified(self) -> bool {
        !matches!(self.class(), EntityClass::Value)
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::DataCollection => "DataCollection",
            Self::Machine => "Machine",
            Self::Application => "Application",
            Self::Metric => "Metric",
            Self::Dataset => "Dataset",
            Self::Trial => "Trial",
            Self::Execution => "Execution",
            Self::MachineMetric => "MachineMetric",
            Self::DeterministicMetric => "DeterministicMetric",
            Self::NondeterministicMetric => "NondeterministicMetric",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Error)]
#[error("Unknown metric type '{0}'")]
pub struct UnknownMetricType(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    Result,
    Deterministic,
    Nondeterministic,
    Machine,
    Other,
}

impl MetricType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Result => "result",
            Self::Deterministic => "deterministic",
            Self::Nondeterministic => "nondeterministic",
            Self::Machine => "machine",
            Self::Other => "other",
        }
    }
}

impl FromStr for MetricType {
    type Err = UnknownMetricType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "result" => Ok(Self::Result),
            "deterministic" => Ok(Self::Deterministic),
            "nondeterministic" => Ok(Self::Nondeterministic),
            "machine" => Ok(Self::Machine),
            "other" => Ok(Self::Other),
            other => Err(UnknownMetricType(other.to_owned())),
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a dimension row in the backing store
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NaturalKey {
    Name(String),
    /// name scoped by a parent row, e.g. a dataset within its application
    Scoped(ID, String),
}

/// A single column value as handed to a backend
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    Integer(ID),
    Real(f64),
    Text(String),
}

/// Typed handle for a committed record, only valid inside the scope that produced it
pub struct LocalId<T> {
    id: ID,
    marker: PhantomData<fn() -> T>,
}

impl<T> LocalId<T> {
    pub const fn from_raw(id: ID) -> Self {
        Self {
            id,
            marker: PhantomData,
        }
    }

    pub const fn get(self) -> ID {
        self.id
    }
}

impl<T> Clone for LocalId<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for LocalId<T> {}

impl<T> PartialEq for LocalId<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for LocalId<T> {}

impl<T: Entity> fmt::Debug for LocalId<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LocalId<{}>({})", T::TYPE, self.id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataCollection {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Machine {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Application {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub kind: MetricType,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub application: ID,
    pub name: String,
    pub description: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Trial {
    pub data_collection: ID,
    pub machine: ID,
    pub application: ID,
    pub dataset: ID,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    pub trial: ID,
    pub machine: ID,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MachineMetric {
    pub machine: ID,
    pub metric: ID,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeterministicMetric {
    pub dataset: ID,
    pub metric: ID,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NondeterministicMetric {
    pub execution: ID,
    pub metric: ID,
    pub value: f64,
}

impl DataCollection {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

impl Machine {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

impl Application {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

impl Metric {
    pub fn new(kind: MetricType, name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            description: description.into(),
        }
    }
}

impl Dataset {
    pub fn new(
        application: LocalId<Application>,
        name: impl Into<String>,
        description: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            application: application.get(),
            name: name.into(),
            description: description.into(),
            url: url.into(),
        }
    }
}

impl Trial {
    pub fn new(
        data_collection: LocalId<DataCollection>,
        machine: LocalId<Machine>,
        application: LocalId<Application>,
        dataset: LocalId<Dataset>,
    ) -> Self {
        Self {
            data_collection: data_collection.get(),
            machine: machine.get(),
            application: application.get(),
            dataset: dataset.get(),
        }
    }
}

impl Execution {
    pub fn new(trial: LocalId<Trial>, machine: LocalId<Machine>) -> Self {
        Self {
            trial: trial.get(),
            machine: machine.get(),
        }
    }
}

impl MachineMetric {
    pub fn new(machine: LocalId<Machine>, metric: LocalId<Metric>, value: f64) -> Self {
        Self {
            machine: machine.get(),
            metric: metric.get(),
            value,
        }
    }
}

impl DeterministicMetric {
    pub fn new(dataset: LocalId<Dataset>, metric: LocalId<Metric>, value: f64) -> Self {
        Self {
            dataset: dataset.get(),
            metric: metric.get(),
            value,
        }
    }
}

impl NondeterministicMetric {
    pub fn new(execution: LocalId<Execution>, metric: LocalId<Metric>, value: f64) -> Self {
        Self {
            execution: execution.get(),
            metric: metric.get(),
            value,
        }
    }
}

/// Closed set of everything that can be staged
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    DataCollection(DataCollection),
    Machine(Machine),
    Application(Application),
    Metric(Metric),
    Dataset(Dataset),
    Trial(Trial),
    Execution(Execution),
    MachineMetric(MachineMetric),
    DeterministicMetric(DeterministicMetric),
    NondeterministicMetric(NondeterministicMetric),
}

impl Record {
    pub fn entity_type(&self) -> EntityType {
        match self {
            Self::DataCollection(_) => EntityType::DataCollection,
            Self::Machine(_) => EntityType::Machine,
            Self::Application(_) => EntityType::Application,
            Self::Metric(_) => EntityType::Metric,
            Self::Dataset(_) => EntityType::Dataset,
            Self::Trial(_) => EntityType::Trial,
            Self::Execution(_) => EntityType::Execution,
            Self::MachineMetric(_) => EntityType::MachineMetric,
            Self::DeterministicMetric(_) => EntityType::DeterministicMetric,
            Self::NondeterministicMetric(_) => EntityType::NondeterministicMetric,
        }
    }

    /// Natural key of a dimension record, `None` for facts and values
    pub fn natural_key(&self) -> Option<NaturalKey> {
        match self {
            Self::DataCollection(DataCollection { name, .. })
            | Self::Machine(Machine { name, .. })
            | Self::Application(Application { name, .. })
            | Self::Metric(Metric { name, .. }) => Some(NaturalKey::Name(name.clone())),
            Self::Dataset(dataset) => Some(NaturalKey::Scoped(
                dataset.application,
                dataset.name.clone(),
            )),
            _ => None,
        }
    }

    /// Measured value of a metric value record
    pub fn value(&self) -> Option<f64> {
        match self {
            Self::MachineMetric(MachineMetric { value, .. })
            | Self::DeterministicMetric(DeterministicMetric { value, .. })
            | Self::NondeterministicMetric(NondeterministicMetric { value, .. }) => Some(*value),
            _ => None,
        }
    }

    /// Foreign keys of the record together with the type they point to
    pub fn references(&self) -> Vec<(EntityType, ID)> {
        let mut record = self.clone();

        record
            .references_mut()
            .into_iter()
            .map(|(entity, id)| (entity, *id))
            .collect()
    }

    /// Mutable access to the foreign keys, used to rewrite local into global ids
    pub fn references_mut(&mut self) -> Vec<(EntityType, &mut ID)> {
        match self {
            Self::DataCollection(_) | Self::Machine(_) | Self::Application(_) | Self::Metric(_) => {
                Vec::new()
            }
            Self::Dataset(dataset) => vec![(EntityType::Application, &mut dataset.application)],
            Self::Trial(trial) => vec![
                (EntityType::DataCollection, &mut trial.data_collection),
                (EntityType::Machine, &mut trial.machine),
                (EntityType::Application, &mut trial.application),
                (EntityType::Dataset, &mut trial.dataset),
            ],
            Self::Execution(execution) => vec![
                (EntityType::Trial, &mut execution.trial),
                (EntityType::Machine, &mut execution.machine),
            ],
            Self::MachineMetric(value) => vec![
                (EntityType::Machine, &mut value.machine),
                (EntityType::Metric, &mut value.metric),
            ],
            Self::DeterministicMetric(value) => vec![
                (EntityType::Dataset, &mut value.dataset),
                (EntityType::Metric, &mut value.metric),
            ],
            Self::NondeterministicMetric(value) => vec![
                (EntityType::Execution, &mut value.execution),
                (EntityType::Metric, &mut value.metric),
            ],
        }
    }

    /// Column values in the order of the backing table's insert columns
    pub fn fields(&self) -> Vec<Field> {
        match self {
            Self::DataCollection(DataCollection { name, description })
            | Self::Machine(Machine { name, description })
            | Self::Application(Application { name, description }) => {
                vec![Field::Text(name.clone()), Field::Text(description.clone())]
            }
            Self::Metric(metric) => vec![
                Field::Text(metric.kind.as_str().to_owned()),
                Field::Text(metric.name.clone()),
                Field::Text(metric.description.clone()),
            ],
            Self::Dataset(dataset) => vec![
                Field::Integer(dataset.application),
                Field::Text(dataset.name.clone()),
                Field::Text(dataset.description.clone()),
                Field::Text(dataset.url.clone()),
            ],
            Self::Trial(trial) => vec![
                Field::Integer(trial.data_collection),
                Field::Integer(trial.machine),
                Field::Integer(trial.application),
                Field::Integer(trial.dataset),
            ],
            Self::Execution(execution) => vec![
                Field::Integer(execution.trial),
                Field::Integer(execution.machine),
            ],
            Self::MachineMetric(MachineMetric {
                machine: parent,
                metric,
                value,
            })
            | Self::DeterministicMetric(DeterministicMetric {
                dataset: parent,
                metric,
                value,
            })
            | Self::NondeterministicMetric(NondeterministicMetric {
                execution: parent,
                metric,
                value,
            }) => vec![
                Field::Integer(*parent),
                Field::Integer(*metric),
                Field::Real(*value),
            ],
        }
    }
}

/// Typed record that knows its entity type
pub trait Entity: Into<Record> {
    const TYPE: EntityType;
}

/// Records that receive a local id when committed (dimensions and facts)
pub trait Identified: Entity {}

/// Metric-value records, never referenced by anything
pub trait Leaf: Entity {}

macro_rules! entity {
    ($name:ident, identified) => {
        entity!($name);
        impl Identified for $name {}
    };
    ($name:ident, leaf) => {
        entity!($name);
        impl Leaf for $name {}
    };
    ($name:ident) => {
        impl Entity for $name {
            const TYPE: EntityType = EntityType::$name;
        }

        impl From<$name> for Record {
            fn from(value: $name) -> Self {
                Record::$name(value)
            }
        }
    };
}

entity!(DataCollection, identified);
entity!(Machine, identified);
entity!(Application, identified);
entity!(Metric, identified);
entity!(Dataset, identified);
entity!(Trial, identified);
entity!(Execution, identified);
entity!(MachineMetric, leaf);
entity!(DeterministicMetric, leaf);
entity!(NondeterministicMetric, leaf);
