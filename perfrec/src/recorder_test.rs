use crate::{
    config::RecorderConfig,
    database::{memory::MemoryBackend, sqlite::SqliteBackend},
    entity::{
        Application, DataCollection, Dataset, EntityType, Execution, Machine, MachineMetric,
        Metric, MetricType, NondeterministicMetric, Trial,
    },
    error::ErrorKind,
    loader::{LoadOptions, MergeLoader},
    protocol::{ConnectInfo, Vocabulary},
    recorder::{Recorder, SharedRecorder},
    sequence::SequenceOffsets,
};
use std::{fs, io::Cursor, thread};

fn recorder() -> Recorder<Vec<u8>> {
    Recorder::with_writer(
        Vec::new(),
        Vocabulary::Compact,
        &ConnectInfo::new("localhost", "perf", "bench", ""),
        SequenceOffsets::default(),
    )
    .unwrap()
}

#[test]
fn equal_dimensions_share_a_local_id() {
    let mut recorder = recorder();

    let first = recorder.commit(Machine::new("nodeA", "x86")).unwrap();
    let second = recorder.commit(Machine::new("nodeA", "x86")).unwrap();
    let other = recorder.commit(Machine::new("nodeB", "x86")).unwrap();

    assert_eq!(first, second);
    assert_ne!(first, other);
    assert_eq!(recorder.staged()[&EntityType::Machine], 2);

    let log = String::from_utf8(recorder.finish().unwrap()).unwrap();
    assert_eq!(log.matches("H;nodeA;x86;0\n").count(), 2);
    assert!(log.ends_with("H;nodeB;x86;1\nDISCONNECT\n"));
}

#[test]
fn fact_ids_start_at_the_offsets() {
    let mut recorder = Recorder::with_writer(
        Vec::new(),
        Vocabulary::Compact,
        &ConnectInfo::default(),
        SequenceOffsets {
            trial: 10,
            execution: 20,
        },
    )
    .unwrap();

    let collection = recorder.commit(DataCollection::new("nightly", "")).unwrap();
    let machine = recorder.commit(Machine::new("nodeA", "")).unwrap();
    let application = recorder.commit(Application::new("solver", "")).unwrap();
    let dataset = recorder
        .commit(Dataset::new(application, "inputs", "", ""))
        .unwrap();
    let trial = recorder
        .commit(Trial::new(collection, machine, application, dataset))
        .unwrap();
    let execution = recorder.commit(Execution::new(trial, machine)).unwrap();

    assert_eq!(trial.get(), 10);
    assert_eq!(execution.get(), 20);
    assert_eq!(
        recorder.offsets(),
        SequenceOffsets {
            trial: 11,
            execution: 21
        }
    );
}

#[test]
fn non_finite_values_are_neither_logged_nor_staged() {
    let mut recorder = recorder();
    let machine = recorder.commit(Machine::new("nodeA", "x86")).unwrap();
    let metric = recorder
        .commit(Metric::new(MetricType::Machine, "load", ""))
        .unwrap();

    let error = recorder
        .commit_value(MachineMetric::new(machine, metric, f64::NAN))
        .unwrap_err();

    assert_eq!(error.kind(), ErrorKind::MalformedField);
    assert_eq!(recorder.staged().get(&EntityType::MachineMetric), None);

    let log = String::from_utf8(recorder.finish().unwrap()).unwrap();
    assert!(!log.contains("\nR;"));
}

#[test]
fn direct_flush_resolves_local_ids() {
    let mut recorder = recorder();
    let mut backend = MemoryBackend::new();

    let machine = recorder.commit(Machine::new("nodeA", "x86")).unwrap();
    let metric = recorder
        .commit(Metric::new(MetricType::Machine, "cores", ""))
        .unwrap();
    recorder
        .commit_value(MachineMetric::new(machine, metric, 64.0))
        .unwrap();

    let report = recorder.flush(&mut backend).unwrap();

    assert_eq!(report.total(), 3);
    assert!(recorder.staged().is_empty());
    assert_eq!(recorder.resolve(machine), Some(1));
    assert_eq!(backend.len(EntityType::MachineMetric), 1);

    let again = recorder.commit(Machine::new("nodeB", "")).unwrap();
    recorder.flush(&mut backend).unwrap();
    assert_eq!(recorder.resolve(again), Some(2));
}

#[test]
fn log_replay_matches_direct_flush() {
    let mut recorder = recorder().with_constructors(true);
    let collection = recorder.commit(DataCollection::new("nightly", "")).unwrap();
    let machine = recorder.commit(Machine::new("nodeA", "x86")).unwrap();
    let application = recorder.commit(Application::new("solver", "v1")).unwrap();
    let dataset = recorder
        .commit(Dataset::new(application, "inputs", "", "file://inputs"))
        .unwrap();
    let metric = recorder
        .commit(Metric::new(MetricType::Nondeterministic, "wall", "s"))
        .unwrap();
    let trial = recorder
        .commit(Trial::new(collection, machine, application, dataset))
        .unwrap();
    for value in [1.5, 1.75] {
        let execution = recorder.commit(Execution::new(trial, machine)).unwrap();
        recorder
            .commit_value(NondeterministicMetric::new(execution, metric, value))
            .unwrap();
    }

    let mut direct = MemoryBackend::new();
    recorder.flush(&mut direct).unwrap();
    let log = recorder.finish().unwrap();

    let mut loader = MergeLoader::new(MemoryBackend::new(), LoadOptions::default());
    loader.load_reader(Cursor::new(log)).unwrap();
    let replayed = loader.into_backend();

    for entity in EntityType::ALL {
        assert_eq!(direct.rows(entity), replayed.rows(entity), "{entity}");
    }
    assert_eq!(replayed.len(EntityType::NondeterministicMetric), 2);
}

#[test]
fn create_writes_log_and_offsets() {
    let directory = tempfile::tempdir().unwrap();
    let config = RecorderConfig {
        path: Some(directory.path().join("run.0.log")),
        offsets: Some(directory.path().join("perfrec.offsets")),
        format: Vocabulary::Verbose,
        ..RecorderConfig::default()
    };

    let mut recorder = Recorder::create(&config).unwrap();
    let collection = recorder.commit(DataCollection::new("nightly", "")).unwrap();
    let machine = recorder.commit(Machine::new("nodeA", "")).unwrap();
    let application = recorder.commit(Application::new("solver", "")).unwrap();
    let dataset = recorder
        .commit(Dataset::new(application, "inputs", "", ""))
        .unwrap();
    recorder
        .commit(Trial::new(collection, machine, application, dataset))
        .unwrap();
    recorder.finish().unwrap();

    let log = fs::read_to_string(directory.path().join("run.0.log")).unwrap();
    assert!(log.starts_with("VERSION;3\nFORMAT;full\n"));
    assert!(log.contains("Trial_commit;0;0;0;0;0\n"));

    let offsets = SequenceOffsets::load(&directory.path().join("perfrec.offsets")).unwrap();
    assert_eq!(offsets.trial, 1);

    let mut database = SqliteBackend::open_in_memory().unwrap();
    MergeLoader::new(&mut database, LoadOptions::default())
        .load_file(&directory.path().join("run.0.log"))
        .unwrap();
    assert_eq!(database.count(EntityType::Trial).unwrap(), 1);
}

#[test]
fn shared_recorder_serializes_commits() {
    let shared = SharedRecorder::new(recorder());

    let handles = (0..4)
        .map(|worker| {
            let shared = shared.clone();
            thread::spawn(move || {
                shared
                    .commit(Machine::new(format!("node{worker}"), ""))
                    .unwrap()
                    .get()
            })
        })
        .collect::<Vec<_>>();
    let mut ids = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect::<Vec<_>>();
    ids.sort();

    assert_eq!(ids, vec![0, 1, 2, 3]);

    let recorder = shared.into_inner().unwrap();
    assert_eq!(recorder.staged()[&EntityType::Machine], 4);
}
