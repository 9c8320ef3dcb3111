// SPDX-License-Identifier: PMPL-1.0-or-later
//! History tree backend scenarios

use statehist_core::{StateInterval, StateValue};
use statehist_tree::{
    HistoryBackend, HistoryTreeBackend, HtConfig, InMemoryBackend, TreeError,
    ANY_PROVIDER_VERSION,
};
use tempfile::TempDir;

fn build_and_check<B: HistoryBackend>(
    backend: &B,
    start: i64,
    end: i64,
    nb_attr: usize,
    intervals: &[StateInterval],
) {
    for iv in intervals {
        backend
            .insert_past_state(iv.start, iv.end, iv.quark, iv.value.clone())
            .unwrap();
    }
    backend.finished_building(end, &[]).unwrap();
    assert_eq!(backend.start_time(), start);
    assert_eq!(backend.end_time().unwrap(), end);

    for t in start..=end {
        let mut out = vec![None; nb_attr];
        backend.do_query(&mut out, t).unwrap();
        for (attr, slot) in out.iter().enumerate() {
            let iv = slot
                .as_ref()
                .unwrap_or_else(|| panic!("no interval for attribute {attr} at {t}"));
            assert!(iv.contains(t));
            assert_eq!(iv.quark as usize, attr);
        }
    }
}

/// Intervals of length `duration` starting every tick, cascading over ten
/// attributes.
fn cascading(start: i64, end: i64, duration: i64, nb_attr: u32) -> Vec<StateInterval> {
    ((start + 1)..=(end + duration))
        .map(|t| {
            StateInterval::new(
                (t - duration).max(start),
                (t - 1).min(end),
                (t % i64::from(nb_attr)) as u32,
                StateValue::Long(t),
            )
        })
        .collect()
}

fn full(start: i64, end: i64, nb_attr: u32) -> Vec<StateInterval> {
    (0..nb_attr)
        .map(|attr| StateInterval::new(start, end, attr, StateValue::Int(attr as i32)))
        .collect()
}

#[test]
fn test_cascading_intervals_tree() {
    let dir = TempDir::new().unwrap();
    let config = HtConfig::new(dir.path().join("c.ht"), 1, 0)
        .with_block_size(1024)
        .with_max_children(4);
    let backend = HistoryTreeBackend::create(config).unwrap();
    build_and_check(&backend, 0, 1000, 10, &cascading(0, 1000, 10, 10));
    assert!(backend.tree().depth().unwrap() > 1);
}

#[test]
fn test_cascading_intervals_memory() {
    let backend = InMemoryBackend::new(0);
    build_and_check(&backend, 0, 1000, 10, &cascading(0, 1000, 10, 10));
}

#[test]
fn test_full_intervals_tree() {
    let dir = TempDir::new().unwrap();
    let config = HtConfig::new(dir.path().join("f.ht"), 1, 0)
        .with_block_size(2048)
        .with_max_children(8);
    let backend = HistoryTreeBackend::create(config).unwrap();
    build_and_check(&backend, 0, 100, 1000, &full(0, 100, 1000));
}

#[test]
fn test_every_value_type_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let config = HtConfig::new(dir.path().join("v.ht"), 1, 0);
    let values = [
        StateValue::Int(-7),
        StateValue::Long(1 << 40),
        StateValue::Double(2.5),
        StateValue::from("a string"),
        StateValue::Custom(vec![1, 2, 3]),
        StateValue::Null,
    ];
    {
        let backend = HistoryTreeBackend::create(config.clone()).unwrap();
        for (quark, value) in values.iter().enumerate() {
            backend
                .insert_past_state(0, 5, quark as u32, value.clone())
                .unwrap();
        }
        backend.finished_building(5, &[]).unwrap();
    }
    let backend = HistoryTreeBackend::open_existing(&config).unwrap();
    for (quark, value) in values.iter().enumerate() {
        let iv = backend.do_single_query(3, quark as u32).unwrap().unwrap();
        assert_eq!(&iv.value, value);
    }
}

#[test]
fn test_interval_before_start_rejected() {
    let dir = TempDir::new().unwrap();
    let config = HtConfig::new(dir.path().join("s.ht"), 1, 10);
    let backend = HistoryTreeBackend::create(config).unwrap();
    let err = backend
        .insert_past_state(9, 11, 0, StateValue::Int(1))
        .unwrap_err();
    assert!(matches!(err, TreeError::TimeRange { .. }));
}

#[test]
fn test_negative_times_tree() {
    let dir = TempDir::new().unwrap();
    let config = HtConfig::new(dir.path().join("n.ht"), 1, -1001);
    {
        let backend = HistoryTreeBackend::create(config.clone()).unwrap();
        let mut t = -1001;
        while t <= 200 {
            backend
                .insert_past_state(t, t + 10, 0, StateValue::Long(t))
                .unwrap();
            t += 10;
        }
        backend.finished_building(210, &[]).unwrap();
    }
    let backend = HistoryTreeBackend::open_existing(&config).unwrap();
    let iv = backend.do_single_query(-1, 0).unwrap().unwrap();
    assert_eq!(iv.value, StateValue::Long(-11));
}

#[test]
fn test_boundary_at_node_end() {
    let dir = TempDir::new().unwrap();
    let config = HtConfig::new(dir.path().join("b.ht"), 1, 0)
        .with_block_size(512)
        .with_max_children(3);
    let backend = HistoryTreeBackend::create(config).unwrap();
    for t in 0..500i64 {
        backend
            .insert_past_state(t * 2, t * 2 + 1, 0, StateValue::Long(t))
            .unwrap();
    }
    backend.finished_building(999, &[]).unwrap();

    // Every closed leaf ends on an interval end; querying exactly there must
    // return the interval ending at that time, not its successor.
    let tree = backend.tree();
    let mut checked = 0;
    for seq in 0..tree.node_count().unwrap() {
        let node = tree.node(seq).unwrap();
        if !node.is_leaf() {
            continue;
        }
        let end = node.end().unwrap();
        if end < node.start() || end >= 999 {
            continue;
        }
        let iv = backend.do_single_query(end, 0).unwrap().unwrap();
        assert_eq!(iv.end, end);
        let next = backend.do_single_query(end + 1, 0).unwrap().unwrap();
        assert_eq!(next.start, end + 1);
        checked += 1;
    }
    assert!(checked > 3);
}

#[test]
fn test_provider_version_mismatch_then_any_version() {
    let dir = TempDir::new().unwrap();
    let config = HtConfig::new(dir.path().join("p.ht"), 3, 0);
    {
        let backend = HistoryTreeBackend::create(config.clone()).unwrap();
        backend.insert_past_state(0, 10, 0, StateValue::Int(1)).unwrap();
        backend.finished_building(10, &[]).unwrap();
    }
    let mismatched = HtConfig::new(&config.path, 4, 0);
    let err = HistoryTreeBackend::open_existing(&mismatched).err().unwrap();
    assert!(matches!(
        err,
        TreeError::VersionMismatch {
            what: "provider",
            expected: 4,
            found: 3
        }
    ));

    let any = HtConfig::new(&config.path, ANY_PROVIDER_VERSION, 0);
    let backend = HistoryTreeBackend::open_existing(&any).unwrap();
    assert_eq!(backend.tree().config().provider_version, 3);
}

#[test]
fn test_truncated_file_is_corrupt() {
    let dir = TempDir::new().unwrap();
    let config = HtConfig::new(dir.path().join("t.ht"), 1, 0).with_block_size(4096);
    {
        let backend = HistoryTreeBackend::create(config.clone()).unwrap();
        backend.insert_past_state(0, 10, 0, StateValue::Int(1)).unwrap();
        backend.finished_building(10, b"attributes").unwrap();
    }
    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(&config.path)
        .unwrap();
    file.set_len(4096 + 100).unwrap();
    drop(file);
    let err = HistoryTreeBackend::open_existing(&config).err().unwrap();
    assert!(matches!(err, TreeError::CorruptFile { .. }));
}
