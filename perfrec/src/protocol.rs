//! Line-oriented log of staged records.
//!
//! Every line is a keyword followed by `;`-separated fields. A log opens with a `VERSION` and a
//! `FORMAT` line, the latter naming the keyword vocabulary used for record lines, followed by a
//! `CONNECT` line and closed by `DISCONNECT`. Commit lines of dimensions and facts end with the
//! local id the producer assigned, so a replay can rebuild the producer's references.

pub mod keywords;

use crate::{
    entity::{
        Application, DataCollection, Dataset, DeterministicMetric, EntityType, Execution, Machine,
        MachineMetric, Metric, MetricType, NondeterministicMetric, Record, Trial, ID,
    },
    error::ErrorKind,
};
use keywords::Keyword;
use serde::{Deserialize, Serialize};
use std::{
    borrow::Cow,
    fmt,
    io::{self, BufRead, Write},
    str::FromStr,
};
use thiserror::Error;
use tracing::{debug, warn};

/// Version written to and required from every log
pub const PROTOCOL_VERSION: u32 = 3;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Log declares version {found}, expected {expected}")]
    VersionMismatch { found: String, expected: u32 },
    #[error("Log declares format '{found}', expected '{expected}'")]
    FormatMismatch {
        found: Vocabulary,
        expected: Vocabulary,
    },
    #[error("Unknown log format '{0}'")]
    UnknownFormat(String),
    #[error("Line {line}: record '{keyword}' appears before the VERSION and FORMAT header")]
    MissingHeader { line: usize, keyword: String },
    #[error("Log ends after {lines} lines without a VERSION and FORMAT header")]
    NoHeader { lines: usize },
    #[error("CONNECT {field} differs between logs ('{expected}' != '{found}')")]
    ConnectMismatch {
        field: &'static str,
        expected: String,
        found: String,
    },
    #[error("Line {line}: '{keyword}' expects {expected} fields, found {found}")]
    Arity {
        line: usize,
        keyword: String,
        expected: usize,
        found: usize,
    },
    #[error("Line {line}: field {index} ('{value}') of '{keyword}' is not a valid {expected}")]
    MalformedField {
        line: usize,
        keyword: String,
        index: usize,
        value: String,
        expected: &'static str,
    },
    #[error("Failed to read or write log")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::VersionMismatch { .. }
            | Self::FormatMismatch { .. }
            | Self::UnknownFormat(_)
            | Self::MissingHeader { .. }
            | Self::NoHeader { .. }
            | Self::ConnectMismatch { .. } => ErrorKind::ProtocolMismatch,
            Self::Arity { .. } | Self::MalformedField { .. } => ErrorKind::MalformedField,
            Self::Io(_) => ErrorKind::Io,
        }
    }
}

/// Keyword set used for record lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Vocabulary {
    /// single characters, e.g. `H` for a machine commit
    #[default]
    #[serde(rename = "character")]
    Compact,
    /// full names, e.g. `Machine_commit`
    #[serde(rename = "full")]
    Verbose,
}

impl Vocabulary {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Compact => "character",
            Self::Verbose => "full",
        }
    }
}

impl FromStr for Vocabulary {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "character" | "compact" => Ok(Self::Compact),
            "full" | "verbose" => Ok(Self::Verbose),
            other => Err(ProtocolError::UnknownFormat(other.to_owned())),
        }
    }
}

impl fmt::Display for Vocabulary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Destination a producer declared in its `CONNECT` line
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectInfo {
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
}

impl ConnectInfo {
    pub fn new(
        location: impl Into<String>,
        database: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            location: location.into(),
            database: database.into(),
            user: user.into(),
            password: password.into(),
        }
    }

    /// Compare with the CONNECT line of another log of the same merge
    pub fn check(&self, other: &ConnectInfo) -> Result<(), ProtocolError> {
        let fields = [
            ("location", &self.location, &other.location),
            ("database", &self.database, &other.database),
            ("user", &self.user, &other.user),
        ];

        for (field, expected, found) in fields {
            if expected != found {
                return Err(ProtocolError::ConnectMismatch {
                    field,
                    expected: expected.clone(),
                    found: found.clone(),
                });
            }
        }

        if self.password != other.password {
            return Err(ProtocolError::ConnectMismatch {
                field: "password",
                expected: "<redacted>".to_owned(),
                found: "<redacted>".to_owned(),
            });
        }

        Ok(())
    }
}

impl fmt::Debug for ConnectInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectInfo")
            .field("location", &self.location)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// One meaningful line of a log
#[derive(Debug, Clone, PartialEq)]
pub enum LogLine {
    Version(u32),
    Format(Vocabulary),
    Connect(ConnectInfo),
    Disconnect,
    Construct(EntityType),
    Commit {
        record: Record,
        local_id: Option<ID>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    /// 1-based line number in the log
    pub line: usize,
    pub content: LogLine,
}

fn needs_escape(c: char) -> bool {
    matches!(c, '%' | ';' | '\n' | '\r')
}

/// Make a text field safe for the `;`-separated line format
pub fn escape(field: &str) -> Cow<'_, str> {
    if !field.contains(needs_escape) {
        return Cow::Borrowed(field);
    }

    let mut escaped = String::with_capacity(field.len() + 8);
    for c in field.chars() {
        match c {
            '%' => escaped.push_str("%25"),
            ';' => escaped.push_str("%3B"),
            '\n' => escaped.push_str("%0A"),
            '\r' => escaped.push_str("%0D"),
            c => escaped.push(c),
        }
    }

    Cow::Owned(escaped)
}

/// Inverse of `escape`; unknown `%` sequences are kept verbatim
pub fn unescape(field: &str) -> Cow<'_, str> {
    if !field.contains('%') {
        return Cow::Borrowed(field);
    }

    let mut unescaped = String::with_capacity(field.len());
    let mut rest = field;

    while let Some(position) = rest.find('%') {
        unescaped.push_str(&rest[..position]);
        let decoded = match rest.get(position..position + 3) {
            Some("%25") => Some('%'),
            Some("%3B") => Some(';'),
            Some("%0A") => Some('\n'),
            Some("%0D") => Some('\r'),
            _ => None,
        };

        match decoded {
            Some(c) => {
                unescaped.push(c);
                rest = &rest[position + 3..];
            }
            None => {
                unescaped.push('%');
                rest = &rest[position + 1..];
            }
        }
    }
    unescaped.push_str(rest);

    Cow::Owned(unescaped)
}

/// Fields of a commit line between the keyword and the local id
fn record_fields(record: &Record) -> Vec<String> {
    match record {
        Record::DataCollection(DataCollection { name, description })
        | Record::Machine(Machine { name, description })
        | Record::Application(Application { name, description }) => {
            vec![escape(name).into_owned(), escape(description).into_owned()]
        }
        Record::Metric(metric) => vec![
            metric.kind.as_str().to_owned(),
            escape(&metric.name).into_owned(),
            escape(&metric.description).into_owned(),
        ],
        Record::Dataset(dataset) => vec![
            dataset.application.to_string(),
            escape(&dataset.name).into_owned(),
            escape(&dataset.description).into_owned(),
            escape(&dataset.url).into_owned(),
        ],
        Record::Trial(trial) => vec![
            trial.data_collection.to_string(),
            trial.machine.to_string(),
            trial.application.to_string(),
            trial.dataset.to_string(),
        ],
        Record::Execution(execution) => {
            vec![execution.trial.to_string(), execution.machine.to_string()]
        }
        Record::MachineMetric(MachineMetric {
            machine: parent,
            metric,
            value,
        })
        | Record::DeterministicMetric(DeterministicMetric {
            dataset: parent,
            metric,
            value,
        })
        | Record::NondeterministicMetric(NondeterministicMetric {
            execution: parent,
            metric,
            value,
        }) => vec![parent.to_string(), metric.to_string(), value.to_string()],
    }
}

/// Number of fields after the keyword, local id included
const fn expected_fields(entity: EntityType) -> usize {
    match entity {
        EntityType::DataCollection | EntityType::Machine | EntityType::Application => 3,
        EntityType::Metric => 4,
        EntityType::Dataset | EntityType::Trial => 5,
        EntityType::Execution => 3,
        EntityType::MachineMetric
        | EntityType::DeterministicMetric
        | EntityType::NondeterministicMetric => 3,
    }
}

/// Cursor over the fields of one line
struct Fields<'a> {
    line: usize,
    keyword: &'a str,
    values: &'a [&'a str],
    index: usize,
}

impl<'a> Fields<'a> {
    fn new(
        line: usize,
        keyword: &'a str,
        values: &'a [&'a str],
        expected: usize,
    ) -> Result<Self, ProtocolError> {
        if values.len() != expected {
            return Err(ProtocolError::Arity {
                line,
                keyword: keyword.to_owned(),
                expected,
                found: values.len(),
            });
        }

        Ok(Self {
            line,
            keyword,
            values,
            index: 0,
        })
    }

    fn raw(&mut self) -> &'a str {
        let value = self.values.get(self.index).copied().unwrap_or_default();
        self.index += 1;
        value
    }

    /// error for the field returned by the last `raw` call
    fn malformed(&self, value: &str, expected: &'static str) -> ProtocolError {
        ProtocolError::MalformedField {
            line: self.line,
            keyword: self.keyword.to_owned(),
            index: self.index.saturating_sub(1),
            value: value.to_owned(),
            expected,
        }
    }

    fn text(&mut self) -> String {
        unescape(self.raw()).into_owned()
    }

    fn id(&mut self) -> Result<ID, ProtocolError> {
        let value = self.raw();

        value
            .trim()
            .parse()
            .map_err(|_| self.malformed(value, "integer id"))
    }

    fn value(&mut self) -> Result<f64, ProtocolError> {
        let value = self.raw();

        value
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|parsed| parsed.is_finite())
            .ok_or_else(|| self.malformed(value, "finite floating point value"))
    }

    fn metric_type(&mut self) -> Result<MetricType, ProtocolError> {
        let value = self.raw();

        value.parse().map_err(|_| self.malformed(value, "metric type"))
    }
}

fn parse_data_collection(fields: &mut Fields<'_>) -> Result<Record, ProtocolError> {
    Ok(DataCollection::new(fields.text(), fields.text()).into())
}

fn parse_machine(fields: &mut Fields<'_>) -> Result<Record, ProtocolError> {
    Ok(Machine::new(fields.text(), fields.text()).into())
}

fn parse_application(fields: &mut Fields<'_>) -> Result<Record, ProtocolError> {
    Ok(Application::new(fields.text(), fields.text()).into())
}

fn parse_metric(fields: &mut Fields<'_>) -> Result<Record, ProtocolError> {
    let kind = fields.metric_type()?;

    Ok(Metric::new(kind, fields.text(), fields.text()).into())
}

fn parse_dataset(fields: &mut Fields<'_>) -> Result<Record, ProtocolError> {
    Ok(Record::Dataset(Dataset {
        application: fields.id()?,
        name: fields.text(),
        description: fields.text(),
        url: fields.text(),
    }))
}

fn parse_trial(fields: &mut Fields<'_>) -> Result<Record, ProtocolError> {
    Ok(Record::Trial(Trial {
        data_collection: fields.id()?,
        machine: fields.id()?,
        application: fields.id()?,
        dataset: fields.id()?,
    }))
}

fn parse_execution(fields: &mut Fields<'_>) -> Result<Record, ProtocolError> {
    Ok(Record::Execution(Execution {
        trial: fields.id()?,
        machine: fields.id()?,
    }))
}

fn parse_machine_metric(fields: &mut Fields<'_>) -> Result<Record, ProtocolError> {
    Ok(Record::MachineMetric(MachineMetric {
        machine: fields.id()?,
        metric: fields.id()?,
        value: fields.value()?,
    }))
}

fn parse_deterministic_metric(fields: &mut Fields<'_>) -> Result<Record, ProtocolError> {
    Ok(Record::DeterministicMetric(DeterministicMetric {
        dataset: fields.id()?,
        metric: fields.id()?,
        value: fields.value()?,
    }))
}

fn parse_nondeterministic_metric(fields: &mut Fields<'_>) -> Result<Record, ProtocolError> {
    Ok(Record::NondeterministicMetric(NondeterministicMetric {
        execution: fields.id()?,
        metric: fields.id()?,
        value: fields.value()?,
    }))
}

fn parse_record(entity: EntityType, fields: &mut Fields<'_>) -> Result<Record, ProtocolError> {
    match entity {
        EntityType::DataCollection => parse_data_collection(fields),
        EntityType::Machine => parse_machine(fields),
        EntityType::Application => parse_application(fields),
        EntityType::Metric => parse_metric(fields),
        EntityType::Dataset => parse_dataset(fields),
        EntityType::Trial => parse_trial(fields),
        EntityType::Execution => parse_execution(fields),
        EntityType::MachineMetric => parse_machine_metric(fields),
        EntityType::DeterministicMetric => parse_deterministic_metric(fields),
        EntityType::NondeterministicMetric => parse_nondeterministic_metric(fields),
    }
}

/// Serializes staged records, one line per call
#[derive(Debug)]
pub struct LogWriter<W: Write> {
    inner: W,
    vocabulary: Vocabulary,
}

impl<W: Write> LogWriter<W> {
    pub fn new(inner: W, vocabulary: Vocabulary) -> Self {
        Self { inner, vocabulary }
    }

    pub fn vocabulary(&self) -> Vocabulary {
        self.vocabulary
    }

    /// `VERSION`, `FORMAT` and `CONNECT` lines
    pub fn header(&mut self, connect: &ConnectInfo) -> io::Result<()> {
        writeln!(self.inner, "{};{PROTOCOL_VERSION}", keywords::VERSION)?;
        writeln!(self.inner, "{};{}", keywords::FORMAT, self.vocabulary)?;
        writeln!(
            self.inner,
            "{};{};{};{};{}",
            keywords::CONNECT,
            escape(&connect.location),
            escape(&connect.database),
            escape(&connect.user),
            escape(&connect.password)
        )
    }

    pub fn construct(&mut self, entity: EntityType) -> io::Result<()> {
        writeln!(
            self.inner,
            "{}",
            keywords::construct_keyword(self.vocabulary, entity)
        )
    }

    pub fn commit(&mut self, record: &Record, local_id: Option<ID>) -> io::Result<()> {
        let mut fields = record_fields(record);
        if let Some(id) = local_id {
            fields.push(id.to_string());
        }

        writeln!(
            self.inner,
            "{};{}",
            keywords::commit_keyword(self.vocabulary, record.entity_type()),
            fields.join(";")
        )
    }

    pub fn disconnect(&mut self) -> io::Result<()> {
        writeln!(self.inner, "{}", keywords::DISCONNECT)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Parses a log line by line, enforcing its header.
///
/// With an `expected` vocabulary the log must declare exactly that one; without, whatever the
/// log declares is used. Unknown keywords are skipped with a warning.
#[derive(Debug)]
pub struct LogReader<R> {
    lines: io::Lines<R>,
    line: usize,
    expected: Option<Vocabulary>,
    version: Option<u32>,
    vocabulary: Option<Vocabulary>,
    skipped: usize,
    finished: bool,
}

impl<R: BufRead> LogReader<R> {
    pub fn new(reader: R, expected: Option<Vocabulary>) -> Self {
        Self {
            lines: reader.lines(),
            line: 0,
            expected,
            version: None,
            vocabulary: None,
            skipped: 0,
            finished: false,
        }
    }

    pub fn vocabulary(&self) -> Option<Vocabulary> {
        self.vocabulary
    }

    /// number of lines dropped for an unknown keyword
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    fn parse_line(&mut self, raw: &str) -> Result<Option<LogLine>, ProtocolError> {
        let raw = raw.trim_end_matches('\r');
        if raw.trim().is_empty() {
            return Ok(None);
        }

        let parts: Vec<&str> = raw.split(';').collect();
        let (keyword, values) = match parts.split_first() {
            Some((keyword, values)) => (keyword.trim(), values),
            None => return Ok(None),
        };

        match keyword {
            keywords::VERSION => {
                let mut fields = Fields::new(self.line, keyword, values, 1)?;
                let found = fields.raw().trim();
                let version = found
                    .parse::<u32>()
                    .ok()
                    .filter(|version| *version == PROTOCOL_VERSION)
                    .ok_or_else(|| ProtocolError::VersionMismatch {
                        found: found.to_owned(),
                        expected: PROTOCOL_VERSION,
                    })?;
                self.version = Some(version);

                Ok(Some(LogLine::Version(version)))
            }
            keywords::FORMAT => {
                let mut fields = Fields::new(self.line, keyword, values, 1)?;
                let vocabulary: Vocabulary = fields.raw().parse()?;

                if let Some(expected) = self.expected.or(self.vocabulary) {
                    if expected != vocabulary {
                        return Err(ProtocolError::FormatMismatch {
                            found: vocabulary,
                            expected,
                        });
                    }
                }
                self.vocabulary = Some(vocabulary);

                Ok(Some(LogLine::Format(vocabulary)))
            }
            keywords::CONNECT => {
                let mut fields = Fields::new(self.line, keyword, values, 4)?;

                Ok(Some(LogLine::Connect(ConnectInfo {
                    location: fields.text(),
                    database: fields.text(),
                    user: fields.text(),
                    password: fields.text(),
                })))
            }
            keywords::DISCONNECT => Ok(Some(LogLine::Disconnect)),
            keyword => {
                let vocabulary = match (self.version, self.vocabulary) {
                    (Some(_), Some(vocabulary)) => vocabulary,
                    _ => {
                        return Err(ProtocolError::MissingHeader {
                            line: self.line,
                            keyword: keyword.to_owned(),
                        })
                    }
                };

                match keywords::lookup(vocabulary, keyword) {
                    Some(Keyword::Construct(entity)) => {
                        debug!(line = self.line, entity = %entity, "Constructor line");

                        Ok(Some(LogLine::Construct(entity)))
                    }
                    Some(Keyword::Commit(entity)) => {
                        let mut fields =
                            Fields::new(self.line, keyword, values, expected_fields(entity))?;
                        let record = parse_record(entity, &mut fields)?;
                        let local_id = if entity.is_identified() {
                            Some(fields.id()?)
                        } else {
                            None
                        };

                        Ok(Some(LogLine::Commit { record, local_id }))
                    }
                    None => {
                        warn!(
                            line = self.line,
                            keyword = keyword,
                            "Unknown log keyword, skipping line"
                        );
                        self.skipped += 1;

                        Ok(None)
                    }
                }
            }
        }
    }
}

impl<R> LogReader<R> {
    /// a log without its header is rejected even if it holds no record line
    fn finish(&mut self) -> Option<Result<LogEntry, ProtocolError>> {
        if self.finished {
            return None;
        }
        self.finished = true;

        match (self.version, self.vocabulary) {
            (Some(_), Some(_)) => None,
            _ => Some(Err(ProtocolError::NoHeader { lines: self.line })),
        }
    }
}

impl<R: BufRead> Iterator for LogReader<R> {
    type Item = Result<LogEntry, ProtocolError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let raw = match self.lines.next() {
                Some(Ok(raw)) => raw,
                Some(Err(error)) => return Some(Err(ProtocolError::Io(error))),
                None => return self.finish(),
            };
            self.line += 1;

            match self.parse_line(&raw) {
                Ok(Some(content)) => {
                    return Some(Ok(LogEntry {
                        line: self.line,
                        content,
                    }))
                }
                Ok(None) => continue,
                Err(error) => return Some(Err(error)),
            }
        }
    }
}
