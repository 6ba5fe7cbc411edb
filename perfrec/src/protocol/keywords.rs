use super::Vocabulary;
use crate::entity::EntityType;
use once_cell::sync::Lazy;
use std::collections::HashMap;

pub const VERSION: &str = "VERSION";
pub const FORMAT: &str = "FORMAT";
pub const CONNECT: &str = "CONNECT";
pub const DISCONNECT: &str = "DISCONNECT";

/// What a record line asks for, once its keyword is looked up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Keyword {
    /// a constructor trace, carries nothing the loader needs
    Construct(EntityType),
    Commit(EntityType),
}

/// (entity, constructor, commit) in the single character vocabulary.
/// Commits are upper case; metric is the exception (`V` constructs, `v` commits).
static COMPACT: [(EntityType, &str, &str); 10] = [
    (EntityType::DataCollection, "c", "C"),
    (EntityType::Application, "a", "A"),
    (EntityType::Dataset, "s", "S"),
    (EntityType::Machine, "h", "H"),
    (EntityType::Trial, "t", "T"),
    (EntityType::Execution, "e", "E"),
    (EntityType::MachineMetric, "r", "R"),
    (EntityType::DeterministicMetric, "d", "D"),
    (EntityType::NondeterministicMetric, "n", "N"),
    (EntityType::Metric, "V", "v"),
];

static VERBOSE: [(EntityType, &str, &str); 10] = [
    (EntityType::DataCollection, "DataCollection", "DataCollection_commit"),
    (EntityType::Application, "Application", "Application_commit"),
    (EntityType::Dataset, "Dataset", "Dataset_commit"),
    (EntityType::Machine, "Machine", "Machine_commit"),
    (EntityType::Trial, "Trial", "Trial_commit"),
    (EntityType::Execution, "Execution", "Execution_commit"),
    (EntityType::MachineMetric, "MachineMetric", "MachineMetric_commit"),
    (EntityType::DeterministicMetric, "DeterministicMetric", "DeterministicMetric_commit"),
    (
        EntityType::NondeterministicMetric,
        "NondeterministicMetric",
        "NondeterministicMetric_commit",
    ),
    (EntityType::Metric, "Metric", "Metric_commit"),
];

fn build(table: &[(EntityType, &'static str, &'static str)]) -> HashMap<&'static str, Keyword> {
    table
        .iter()
        .flat_map(|(entity, construct, commit)| {
            [
                (*construct, Keyword::Construct(*entity)),
                (*commit, Keyword::Commit(*entity)),
            ]
        })
        .collect()
}

static COMPACT_LOOKUP: Lazy<HashMap<&'static str, Keyword>> = Lazy::new(|| build(&COMPACT));
static VERBOSE_LOOKUP: Lazy<HashMap<&'static str, Keyword>> = Lazy::new(|| build(&VERBOSE));

fn table(vocabulary: Vocabulary) -> &'static [(EntityType, &'static str, &'static str); 10] {
    match vocabulary {
        Vocabulary::Compact => &COMPACT,
        Vocabulary::Verbose => &VERBOSE,
    }
}

pub fn lookup(vocabulary: Vocabulary, keyword: &str) -> Option<Keyword> {
    match vocabulary {
        Vocabulary::Compact => COMPACT_LOOKUP.get(keyword).copied(),
        Vocabulary::Verbose => VERBOSE_LOOKUP.get(keyword).copied(),
    }
}

pub fn commit_keyword(vocabulary: Vocabulary, entity: EntityType) -> &'static str {
    table(vocabulary)
        .iter()
        .find(|(candidate, _, _)| *candidate == entity)
        .map_or("", |(_, _, commit)| *commit)
}

pub fn construct_keyword(vocabulary: Vocabulary, entity: EntityType) -> &'static str {
    table(vocabulary)
        .iter()
        .find(|(candidate, _, _)| *candidate == entity)
        .map_or("", |(_, construct, _)| *construct)
}
