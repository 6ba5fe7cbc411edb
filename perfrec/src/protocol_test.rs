use crate::{
    entity::{
        Application, Dataset, EntityType, LocalId, Machine, Metric, MetricType,
        NondeterministicMetric, Record, Trial,
    },
    error::ErrorKind,
    protocol::{
        escape, keywords, unescape, ConnectInfo, LogLine, LogReader, LogWriter, ProtocolError,
        Vocabulary, PROTOCOL_VERSION,
    },
};
use std::io::Cursor;

const HEADER: &str = "VERSION;3\nFORMAT;character\nCONNECT;localhost;perf;bench;secret\n";

fn connect() -> ConnectInfo {
    ConnectInfo::new("localhost", "perf", "bench", "secret")
}

fn read(log: &str, expected: Option<Vocabulary>) -> Result<Vec<LogLine>, ProtocolError> {
    LogReader::new(Cursor::new(log.to_owned()), expected)
        .map(|entry| entry.map(|entry| entry.content))
        .collect()
}

fn commits(log: &str) -> Vec<(Record, Option<i64>)> {
    read(log, None)
        .unwrap()
        .into_iter()
        .filter_map(|line| match line {
            LogLine::Commit { record, local_id } => Some((record, local_id)),
            _ => None,
        })
        .collect()
}

#[test]
fn writer_emits_compact_lines() {
    let mut writer = LogWriter::new(Vec::new(), Vocabulary::Compact);
    writer.header(&connect()).unwrap();
    writer
        .commit(&Machine::new("nodeA", "x86").into(), Some(0))
        .unwrap();
    writer
        .commit(
            &Metric::new(MetricType::Nondeterministic, "wall", "seconds").into(),
            Some(0),
        )
        .unwrap();
    writer
        .commit(
            &NondeterministicMetric {
                execution: 3,
                metric: 0,
                value: 1.25,
            }
            .into(),
            None,
        )
        .unwrap();
    writer.disconnect().unwrap();

    let log = String::from_utf8(writer.into_inner()).unwrap();

    assert_eq!(
        log,
        format!("{HEADER}H;nodeA;x86;0\nv;nondeterministic;wall;seconds;0\nN;3;0;1.25\nDISCONNECT\n")
    );
}

#[test]
fn writer_emits_verbose_lines() {
    let mut writer = LogWriter::new(Vec::new(), Vocabulary::Verbose);
    writer.construct(EntityType::Trial).unwrap();
    writer
        .commit(
            &Trial::new(
                LocalId::from_raw(0),
                LocalId::from_raw(1),
                LocalId::from_raw(2),
                LocalId::from_raw(3),
            )
            .into(),
            Some(9),
        )
        .unwrap();

    let log = String::from_utf8(writer.into_inner()).unwrap();

    assert_eq!(log, "Trial\nTrial_commit;0;1;2;3;9\n");
}

#[test]
fn escaping_survives_separators() {
    let text = "a;b%c\nd\re";

    assert_eq!(escape(text), "a%3Bb%25c%0Ad%0De");
    assert_eq!(unescape(&escape(text)), text);
    assert_eq!(escape("plain"), "plain");
    assert_eq!(unescape("100%"), "100%");
    assert_eq!(unescape("%zz%3B"), "%zz;");
}

#[test]
fn reader_round_trips_writer_output() {
    let records: Vec<(Record, Option<i64>)> = vec![
        (Application::new("solver;v2", "multi\nline").into(), Some(0)),
        (
            Dataset::new(LocalId::from_raw(0), "inputs", "", "http://x/?a=1%").into(),
            Some(0),
        ),
        (
            NondeterministicMetric {
                execution: 0,
                metric: 0,
                value: -0.5,
            }
            .into(),
            None,
        ),
    ];

    for vocabulary in [Vocabulary::Compact, Vocabulary::Verbose] {
        let mut writer = LogWriter::new(Vec::new(), vocabulary);
        writer.header(&connect()).unwrap();
        for (record, local_id) in &records {
            writer.commit(record, *local_id).unwrap();
        }
        writer.disconnect().unwrap();

        let log = String::from_utf8(writer.into_inner()).unwrap();

        assert_eq!(commits(&log), records);
    }
}

#[test]
fn header_lines_are_reported() {
    let lines = read(&format!("{HEADER}DISCONNECT\n"), Some(Vocabulary::Compact)).unwrap();

    assert_eq!(
        lines,
        vec![
            LogLine::Version(PROTOCOL_VERSION),
            LogLine::Format(Vocabulary::Compact),
            LogLine::Connect(connect()),
            LogLine::Disconnect,
        ]
    );
}

#[test]
fn version_mismatch_is_fatal() {
    let error = read("VERSION;2\nFORMAT;character\n", None).unwrap_err();

    assert!(matches!(error, ProtocolError::VersionMismatch { .. }));
    assert_eq!(error.kind(), ErrorKind::ProtocolMismatch);
}

#[test]
fn format_must_match_expectation() {
    let error = read(HEADER, Some(Vocabulary::Verbose)).unwrap_err();

    assert!(matches!(
        error,
        ProtocolError::FormatMismatch {
            found: Vocabulary::Compact,
            expected: Vocabulary::Verbose
        }
    ));
    assert!(matches!(
        read("VERSION;3\nFORMAT;binary\n", None),
        Err(ProtocolError::UnknownFormat(_))
    ));
}

#[test]
fn records_need_a_header() {
    let error = read("H;nodeA;x86;0\n", None).unwrap_err();

    assert!(matches!(error, ProtocolError::MissingHeader { line: 1, .. }));
}

#[test]
fn unknown_keywords_are_skipped() {
    let log = format!("{HEADER}X;what;ever\nH;nodeA;x86;0\n\n");
    let mut reader = LogReader::new(Cursor::new(log), None);
    let lines = reader.by_ref().collect::<Result<Vec<_>, _>>().unwrap();

    assert_eq!(lines.len(), 4);
    assert_eq!(lines[3].line, 5);
    assert_eq!(reader.skipped(), 1);
    assert_eq!(reader.vocabulary(), Some(Vocabulary::Compact));
}

#[test]
fn constructor_lines_are_accepted() {
    let lines = read(&format!("{HEADER}h\nH;nodeA;x86;0\nV\n"), None).unwrap();

    assert_eq!(lines[3], LogLine::Construct(EntityType::Machine));
    assert_eq!(lines[5], LogLine::Construct(EntityType::Metric));
}

#[test]
fn malformed_numbers_are_errors() {
    let error = read(&format!("{HEADER}E;zero;1;0\n"), None).unwrap_err();

    assert!(matches!(
        error,
        ProtocolError::MalformedField {
            line: 4,
            index: 0,
            ..
        }
    ));
    assert_eq!(error.kind(), ErrorKind::MalformedField);

    assert!(matches!(
        read(&format!("{HEADER}R;0;0;fast\n"), None),
        Err(ProtocolError::MalformedField { index: 2, .. })
    ));
    assert!(matches!(
        read(&format!("{HEADER}v;fastest;wall;;0\n"), None),
        Err(ProtocolError::MalformedField { .. })
    ));
}

#[test]
fn non_finite_values_are_malformed() {
    for value in ["NaN", "inf", "-inf"] {
        let error = read(&format!("{HEADER}D;0;0;{value}\n"), None).unwrap_err();

        assert!(
            matches!(error, ProtocolError::MalformedField { index: 2, .. }),
            "{value}"
        );
        assert_eq!(error.kind(), ErrorKind::MalformedField);
    }
}

#[test]
fn logs_without_header_are_rejected() {
    for log in ["", "CONNECT;localhost;perf;bench;secret\nDISCONNECT\n", "VERSION;3\n"] {
        let error = read(log, None).unwrap_err();

        assert!(matches!(error, ProtocolError::NoHeader { .. }), "{log:?}");
        assert_eq!(error.kind(), ErrorKind::ProtocolMismatch);
    }

    let mut reader = LogReader::new(Cursor::new(String::new()), None);
    assert!(reader.next().unwrap().is_err());
    assert!(reader.next().is_none());
}

#[test]
fn field_count_is_checked() {
    let error = read(&format!("{HEADER}H;nodeA;0\n"), None).unwrap_err();

    assert!(matches!(
        error,
        ProtocolError::Arity {
            expected: 3,
            found: 2,
            ..
        }
    ));
}

#[test]
fn keyword_tables_agree() {
    for vocabulary in [Vocabulary::Compact, Vocabulary::Verbose] {
        for entity in EntityType::ALL {
            assert_eq!(
                keywords::lookup(vocabulary, keywords::commit_keyword(vocabulary, entity)),
                Some(keywords::Keyword::Commit(entity))
            );
            assert_eq!(
                keywords::lookup(vocabulary, keywords::construct_keyword(vocabulary, entity)),
                Some(keywords::Keyword::Construct(entity))
            );
        }
    }

    assert_eq!(keywords::commit_keyword(Vocabulary::Compact, EntityType::Metric), "v");
    assert_eq!(
        keywords::commit_keyword(Vocabulary::Verbose, EntityType::Machine),
        "Machine_commit"
    );
}

#[test]
fn connect_password_is_redacted() {
    let debug = format!("{:?}", connect());

    assert!(!debug.contains("secret"));

    let other = ConnectInfo::new("localhost", "perf", "bench", "hunter2");
    let message = connect().check(&other).unwrap_err().to_string();

    assert!(!message.contains("secret") && !message.contains("hunter2"));
    assert!(connect().check(&connect()).is_ok());
}
