use crate::{
    database::memory::MemoryBackend,
    entity::{DeterministicMetric, EntityType, NaturalKey, Record},
    error::{ErrorKind, ReconcileError},
    loader::{fs::DONE_PREFIX, LoadOptions, MergeLoader},
    protocol::Vocabulary,
};
use std::{fs, io::Cursor, path::PathBuf};

const HEADER: &str = "VERSION;3\nFORMAT;character\nCONNECT;localhost;perf;bench;pw\n";

fn log(body: &str) -> Cursor<String> {
    Cursor::new(format!("{HEADER}{body}DISCONNECT\n"))
}

fn loader() -> MergeLoader<MemoryBackend> {
    MergeLoader::new(MemoryBackend::new(), LoadOptions::default())
}

fn name(value: &str) -> NaturalKey {
    NaturalKey::Name(value.to_owned())
}

#[test]
fn same_local_id_in_two_files_does_not_collide() {
    let mut loader = loader();

    loader.load_reader(log("H;nodeA;x86;1\n")).unwrap();
    loader.load_reader(log("H;nodeB;x86;1\n")).unwrap();

    let backend = loader.backend();
    assert_eq!(backend.len(EntityType::Machine), 2);
    assert_eq!(backend.id_for(EntityType::Machine, &name("nodeA")), Some(1));
    assert_eq!(backend.id_for(EntityType::Machine, &name("nodeB")), Some(2));
}

#[test]
fn values_follow_their_own_files_metric() {
    let mut loader = loader();

    loader
        .load_reader(log(
            "v;deterministic;iterations;;0\nA;solver;;0\nS;0;inputs;;;0\nD;0;0;42\n",
        ))
        .unwrap();
    loader
        .load_reader(log(
            "v;deterministic;residual;;0\nA;solver;;0\nS;0;inputs;;;0\nD;0;0;7\n",
        ))
        .unwrap();

    let backend = loader.backend();
    let iterations = backend
        .id_for(EntityType::Metric, &name("iterations"))
        .unwrap();
    let residual = backend.id_for(EntityType::Metric, &name("residual")).unwrap();
    let values = backend
        .rows(EntityType::DeterministicMetric)
        .iter()
        .map(|row| match row.record {
            Record::DeterministicMetric(DeterministicMetric { metric, value, .. }) => {
                (metric, value)
            }
            _ => unreachable!(),
        })
        .collect::<Vec<_>>();

    assert_ne!(iterations, residual);
    assert_eq!(backend.len(EntityType::Dataset), 1);
    assert_eq!(values, vec![(iterations, 42.0), (residual, 7.0)]);
}

#[test]
fn dimension_committed_in_two_files_is_stored_once() {
    let mut loader = loader();

    let first = loader.load_reader(log("H;nodeA;x86;0\n")).unwrap();
    let second = loader.load_reader(log("H;nodeA;x86;3\nH;nodeA;x86;3\n")).unwrap();

    assert_eq!(loader.backend().len(EntityType::Machine), 1);
    assert_eq!(
        first.maxima[&EntityType::Machine],
        second.maxima[&EntityType::Machine]
    );
}

#[test]
fn dangling_reference_aborts_the_file() {
    let mut loader = loader();

    let error = loader
        .load_reader(log("c;nightly;;0\nC;nightly;;0\nH;nodeA;;0\nA;solver;;0\nT;0;0;0;4;0\n"))
        .unwrap_err();

    assert!(matches!(
        error,
        ReconcileError::DanglingReference {
            entity: EntityType::Dataset,
            local: 4,
            ..
        }
    ));
    assert!(loader.backend().is_empty());
    assert_eq!(loader.summary().files, 0);
}

#[test]
fn connect_mismatch_is_fatal() {
    let mut loader = loader();
    loader.load_reader(log("H;nodeA;x86;0\n")).unwrap();

    let error = loader
        .load_reader(Cursor::new(
            "VERSION;3\nFORMAT;character\nCONNECT;elsewhere;perf;bench;pw\nH;nodeB;x86;0\n"
                .to_owned(),
        ))
        .unwrap_err();

    assert_eq!(error.kind(), ErrorKind::ProtocolMismatch);
    assert_eq!(loader.backend().len(EntityType::Machine), 1);
}

#[test]
fn expected_format_is_enforced() {
    let mut loader = MergeLoader::new(
        MemoryBackend::new(),
        LoadOptions {
            expected_format: Some(Vocabulary::Verbose),
            mark_done: false,
        },
    );

    let error = loader.load_reader(log("H;nodeA;x86;0\n")).unwrap_err();

    assert_eq!(error.kind(), ErrorKind::ProtocolMismatch);
}

#[test]
fn summary_tracks_rows_and_skipped_lines() {
    let mut loader = loader();

    loader
        .load_reader(log("H;nodeA;x86;0\nQ;future;line\nh\n"))
        .unwrap();
    loader.load_reader(log("H;nodeB;x86;0\n")).unwrap();

    let summary = loader.summary();
    assert_eq!(summary.files, 2);
    assert_eq!(summary.skipped_lines, 1);
    assert_eq!(summary.rows()[&EntityType::Machine], 2);
    assert_eq!(summary.maximum(EntityType::Machine), Some(2));
    assert_eq!(summary.regressions, 0);
}

#[test]
fn merged_files_are_marked_done() {
    let directory = tempfile::tempdir().unwrap();
    let good = directory.path().join("run.0.log");
    let bad = directory.path().join("run.1.log");
    fs::write(&good, format!("{HEADER}H;nodeA;x86;0\nDISCONNECT\n")).unwrap();
    fs::write(&bad, format!("{HEADER}E;0;0;0\nDISCONNECT\n")).unwrap();

    let mut loader = MergeLoader::new(
        MemoryBackend::new(),
        LoadOptions {
            expected_format: None,
            mark_done: true,
        },
    );
    let error = loader.load_all(&[good.clone(), bad.clone()]).unwrap_err();

    let mut done_name = DONE_PREFIX.clone();
    done_name.push("run.0.log");

    assert!(matches!(error, ReconcileError::File { ref path, .. } if *path == bad));
    assert_eq!(error.kind(), ErrorKind::DanglingReference);
    assert!(!good.exists());
    assert!(directory.path().join(done_name).exists());
    assert!(bad.exists());
    assert_eq!(loader.summary().files, 1);
    assert_eq!(loader.backend().len(EntityType::Machine), 1);
}

#[test]
fn missing_file_is_an_io_error() {
    let error = loader()
        .load_file(&PathBuf::from("/nonexistent/run.0.log"))
        .unwrap_err();

    assert_eq!(error.kind(), ErrorKind::Io);
}

#[test]
fn headerless_log_is_neither_merged_nor_marked_done() {
    let directory = tempfile::tempdir().unwrap();
    let empty = directory.path().join("run.0.log");
    fs::write(&empty, "").unwrap();

    let mut loader = MergeLoader::new(
        MemoryBackend::new(),
        LoadOptions {
            expected_format: None,
            mark_done: true,
        },
    );
    let error = loader.load_file(&empty).unwrap_err();

    assert_eq!(error.kind(), ErrorKind::ProtocolMismatch);
    assert!(empty.exists());
    assert_eq!(loader.summary().files, 0);
}
