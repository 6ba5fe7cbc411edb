use crate::{
    database::{memory::MemoryBackend, BulkInsertBackend, ConnectionError},
    entity::{
        Application, DataCollection, Dataset, DeterministicMetric, EntityType, Execution, Machine,
        NaturalKey, Record, Trial,
    },
};

fn machines(names: &[&str]) -> Vec<Record> {
    names
        .iter()
        .map(|name| Machine::new(*name, "x86").into())
        .collect()
}

#[test]
fn dedup_insert_is_idempotent() {
    let mut backend = MemoryBackend::new();

    let first = backend
        .insert_dedup_and_fetch_ids(EntityType::Machine, &machines(&["a", "b"]))
        .unwrap();
    let second = backend
        .insert_dedup_and_fetch_ids(EntityType::Machine, &machines(&["c", "a"]))
        .unwrap();

    assert_eq!(first, vec![1, 2]);
    assert_eq!(second, vec![3, 1]);
    assert_eq!(backend.len(EntityType::Machine), 3);
    assert_eq!(
        backend.id_for(EntityType::Machine, &NaturalKey::Name("b".into())),
        Some(2)
    );
}

#[test]
fn existing_row_keeps_its_fields() {
    let mut backend = MemoryBackend::new();

    backend
        .insert_dedup_and_fetch_ids(EntityType::Machine, &[Machine::new("a", "first").into()])
        .unwrap();
    backend
        .insert_dedup_and_fetch_ids(EntityType::Machine, &[Machine::new("a", "second").into()])
        .unwrap();

    assert_eq!(
        backend.get(EntityType::Machine, 1),
        Some(&Record::from(Machine::new("a", "first")))
    );
}

#[test]
fn duplicate_keys_in_one_batch_are_refused() {
    let mut backend = MemoryBackend::new();

    assert!(matches!(
        backend.insert_dedup_and_fetch_ids(EntityType::Machine, &machines(&["a", "a"])),
        Err(ConnectionError::DuplicateKey { .. })
    ));
}

#[test]
fn primitives_match_entity_class() {
    let mut backend = MemoryBackend::new();

    assert!(matches!(
        backend.insert_all(EntityType::Machine, &machines(&["a"])),
        Err(ConnectionError::WrongPolicy { .. })
    ));
    assert!(matches!(
        backend.insert_dedup_and_fetch_ids(EntityType::Application, &machines(&["a"])),
        Err(ConnectionError::RowMismatch { .. })
    ));
}

#[test]
fn fact_ids_follow_the_sequence() {
    let mut backend = MemoryBackend::new();
    backend
        .insert_dedup_and_fetch_ids(EntityType::Machine, &machines(&["a"]))
        .unwrap();
    let execution: Record = Execution {
        trial: 1,
        machine: 1,
    }
    .into();

    assert!(matches!(
        backend.insert_and_derive_ids(EntityType::Execution, &[execution]),
        Err(ConnectionError::Rejected { .. })
    ));

    let trials = vec![
        Record::Trial(Trial {
            data_collection: 1,
            machine: 1,
            application: 1,
            dataset: 1,
        });
        3
    ];
    for (entity, record) in [
        (EntityType::DataCollection, Record::from(DataCollection::new("d", ""))),
        (EntityType::Application, Record::from(Application::new("s", ""))),
    ] {
        backend
            .insert_dedup_and_fetch_ids(entity, &[record])
            .unwrap();
    }
    backend
        .insert_dedup_and_fetch_ids(
            EntityType::Dataset,
            &[Record::Dataset(Dataset {
                application: 1,
                name: "inputs".into(),
                description: String::new(),
                url: String::new(),
            })],
        )
        .unwrap();

    assert_eq!(
        backend
            .insert_and_derive_ids(EntityType::Trial, &trials)
            .unwrap(),
        vec![1, 2, 3]
    );
    assert_eq!(
        backend
            .insert_and_derive_ids(EntityType::Trial, &trials[..1])
            .unwrap(),
        vec![4]
    );
}

#[test]
fn rollback_restores_snapshot() {
    let mut backend = MemoryBackend::new();
    backend
        .insert_dedup_and_fetch_ids(EntityType::Machine, &machines(&["a"]))
        .unwrap();

    backend.begin().unwrap();
    backend
        .insert_dedup_and_fetch_ids(EntityType::Machine, &machines(&["b"]))
        .unwrap();
    backend.rollback().unwrap();

    assert_eq!(backend.len(EntityType::Machine), 1);
    assert!(matches!(
        backend.rollback(),
        Err(ConnectionError::NoTransaction)
    ));

    backend.begin().unwrap();
    let ids = backend
        .insert_dedup_and_fetch_ids(EntityType::Machine, &machines(&["b"]))
        .unwrap();
    backend.commit().unwrap();

    assert_eq!(ids, vec![2]);
    assert!(matches!(backend.commit(), Err(ConnectionError::NoTransaction)));
}

#[test]
fn rejected_type_fails_every_insert() {
    let mut backend = MemoryBackend::new();
    backend.reject(EntityType::Machine);

    assert!(backend
        .insert_dedup_and_fetch_ids(EntityType::Machine, &machines(&["a"]))
        .is_err());

    backend.accept(EntityType::Machine);

    assert!(backend
        .insert_dedup_and_fetch_ids(EntityType::Machine, &machines(&["a"]))
        .is_ok());
}

#[test]
fn non_finite_values_are_refused_like_sqlite() {
    let mut backend = MemoryBackend::new();
    let row: Record = DeterministicMetric {
        dataset: 1,
        metric: 1,
        value: f64::NEG_INFINITY,
    }
    .into();

    assert!(matches!(
        backend.insert_all(EntityType::DeterministicMetric, &[row]),
        Err(ConnectionError::NonFiniteValue { .. })
    ));
    assert!(backend.is_empty());
}
