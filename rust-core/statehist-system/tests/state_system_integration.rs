// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Integration tests: state systems over the on-disk history tree.

use std::sync::Arc;
use std::thread;

use statehist_core::{Quark, StateInterval, StateValue, Timestamp};
use statehist_system::{StateSystem, StateSystemError};
use statehist_tree::{HistoryTreeBackend, HtConfig};
use tempfile::TempDir;

fn config(dir: &TempDir, provider: u32) -> HtConfig {
    HtConfig::new(dir.path().join("state.ht"), provider, 0)
        .with_block_size(1024)
        .with_max_children(4)
}

fn build(config: &HtConfig) -> StateSystem {
    StateSystem::new(Arc::new(HistoryTreeBackend::create(config.clone()).unwrap()))
}

fn reopen(config: &HtConfig) -> StateSystem {
    StateSystem::open_existing(Arc::new(HistoryTreeBackend::open_existing(config).unwrap()))
        .unwrap()
}

fn bounds(ivs: &[StateInterval]) -> Vec<(Timestamp, Timestamp, StateValue)> {
    ivs.iter().map(|iv| (iv.start, iv.end, iv.value.clone())).collect()
}

#[test]
fn test_running_idle_on_disk() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, 1);
    {
        let ss = build(&config);
        ss.get_quark_absolute_and_add(&["CPUs", "0"]).unwrap();
        ss.get_quark_absolute_and_add(&["CPUs", "1"]).unwrap();
        ss.get_quark_absolute_and_add(&["Threads"]).unwrap();
        let q = ss.get_quark_absolute_and_add(&["Threads", "42"]).unwrap();
        assert_eq!(q, 4);
        ss.modify_attribute(100, "running".into(), q).unwrap();
        ss.modify_attribute(250, "idle".into(), q).unwrap();
        ss.close_history(300).unwrap();
    }

    let ss = reopen(&config);
    assert!(ss.is_built().unwrap());
    let q = ss.get_quark_absolute(&["Threads", "42"]).unwrap();
    let ivs: Vec<_> = ss
        .query_range(q, 0, 300)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(
        bounds(&ivs),
        vec![
            (0, 99, StateValue::Null),
            (100, 249, StateValue::from("running")),
            (250, 300, StateValue::from("idle")),
        ]
    );
    assert_eq!(ss.get_start_time(), 0);
    assert_eq!(ss.get_current_end_time().unwrap(), 300);
    assert_eq!(ss.get_nb_attributes().unwrap(), 5);
    assert_eq!(ss.get_full_attribute_path(q).unwrap(), "Threads/42");
}

#[test]
fn test_live_and_reopened_answers_match() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, 1);
    let ss = build(&config);
    let quarks: Vec<Quark> = (0..6)
        .map(|i| ss.get_quark_absolute_and_add(&["proc", i.to_string().as_str()]).unwrap())
        .collect();
    for t in 1..=600i64 {
        let q = quarks[(t % 6) as usize];
        ss.modify_attribute(t, StateValue::Long(t / 4), q).unwrap();
    }

    let live: Vec<_> = (0..600)
        .map(|t| bounds_and_starts(&ss.query_full_state(t).unwrap()))
        .collect();
    ss.close_history(610).unwrap();
    let sealed = reopen(&config);
    for (t, expected) in live.iter().enumerate() {
        let got = bounds_and_starts(&sealed.query_full_state(t as Timestamp).unwrap());
        assert_eq!(&got, expected, "full state at {t}");
    }
}

fn bounds_and_starts(ivs: &[StateInterval]) -> Vec<(Timestamp, StateValue)> {
    ivs.iter().map(|iv| (iv.start, iv.value.clone())).collect()
}

#[test]
fn test_provider_version_mismatch() {
    let dir = TempDir::new().unwrap();
    let old = config(&dir, 3);
    {
        let ss = build(&old);
        let q = ss.get_quark_absolute_and_add(&["a"]).unwrap();
        ss.modify_attribute(5, StateValue::Int(1), q).unwrap();
        ss.close_history(10).unwrap();
    }

    let new = config(&dir, 4);
    let err = HistoryTreeBackend::open_existing(&new).unwrap_err();
    let err = StateSystemError::from(err);
    assert!(matches!(
        err,
        StateSystemError::VersionMismatch {
            expected: 4,
            found: 3,
            ..
        }
    ));
    assert!(err.requires_rebuild());

    let rebuilt = StateSystem::open_or_build(new.clone()).unwrap();
    assert!(!rebuilt.is_built().unwrap());
    assert_eq!(rebuilt.get_nb_attributes().unwrap(), 0);
    let q = rebuilt.get_quark_absolute_and_add(&["b"]).unwrap();
    rebuilt.modify_attribute(3, StateValue::Int(9), q).unwrap();
    rebuilt.close_history(8).unwrap();
    drop(rebuilt);

    let reopened = StateSystem::open_or_build(new).unwrap();
    assert!(reopened.is_built().unwrap());
    assert_eq!(reopened.get_quark_absolute(&["b"]).unwrap(), 0);
    assert!(reopened.opt_quark_absolute(&["a"]).unwrap().is_none());
    assert_eq!(reopened.query_single_state(4, 0).unwrap().value, StateValue::Int(9));
}

#[test]
fn test_corrupt_file_is_rebuilt() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, 1);
    std::fs::write(&config.path, vec![0xABu8; 9000]).unwrap();

    let ss = StateSystem::open_or_build(config.clone()).unwrap();
    assert!(!ss.is_built().unwrap());
    ss.close_history(0).unwrap();
    drop(ss);
    assert!(StateSystem::open_or_build(config).unwrap().is_built().unwrap());
}

#[test]
fn test_unfinished_file_is_rebuilt() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, 1);
    {
        let ss = build(&config);
        let q = ss.get_quark_absolute_and_add(&["a"]).unwrap();
        ss.modify_attribute(5, StateValue::Int(1), q).unwrap();
    }
    let ss = StateSystem::open_or_build(config).unwrap();
    assert!(!ss.is_built().unwrap());
}

#[test]
fn test_dispose_removes_partial_file() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, 1);
    let ss = build(&config);
    ss.get_quark_absolute_and_add(&["a"]).unwrap();
    assert!(config.path.exists());
    ss.dispose().unwrap();
    assert!(ss.is_cancelled().unwrap());
    assert!(!config.path.exists());
}

#[test]
fn test_query_2d_on_disk_matches_ranges() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, 1);
    let ss = build(&config);
    let quarks: Vec<Quark> = (0..4)
        .map(|i| ss.get_quark_absolute_and_add(&[format!("q{i}").as_str()]).unwrap())
        .collect();
    for t in (1..=2000i64).step_by(3) {
        let q = quarks[(t % 4) as usize];
        ss.modify_attribute(t, StateValue::Int((t % 7) as i32), q).unwrap();
    }
    ss.close_history(2000).unwrap();

    let wanted = [quarks[1], quarks[3]];
    let mut window = ss.query_2d(&wanted, 700, 900).unwrap();
    window.sort_by_key(|iv| (iv.quark, iv.start));

    let mut expected = Vec::new();
    for q in wanted {
        for iv in ss.query_range(q, 700, 900).unwrap() {
            expected.push(iv.unwrap());
        }
    }
    expected.sort_by_key(|iv| (iv.quark, iv.start));
    assert_eq!(window, expected);
}

#[test]
fn test_concurrent_readers_during_build() {
    const QUARKS: usize = 8;
    const LAST: Timestamp = 4000;

    let dir = TempDir::new().unwrap();
    let config = config(&dir, 1);
    let ss = Arc::new(build(&config));
    let quarks: Vec<Quark> = (0..QUARKS)
        .map(|i| ss.get_quark_absolute_and_add(&["cpu", i.to_string().as_str()]).unwrap())
        .collect();

    let readers: Vec<_> = (0..4u64)
        .map(|seed| {
            let ss = Arc::clone(&ss);
            thread::spawn(move || {
                let mut samples = Vec::new();
                let mut x = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
                while !ss.is_built().unwrap() {
                    let end = ss.get_current_end_time().unwrap();
                    if end < 2 {
                        continue;
                    }
                    x = x.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1_442_695_040_888_963_407);
                    let t = ((x >> 33) % end as u64) as Timestamp;
                    let q = ((x >> 17) % QUARKS as u64) as Quark;
                    let iv = ss.query_single_state(t, q).unwrap();
                    assert!(iv.contains(t), "{iv} does not cover {t}");
                    let full = ss.query_full_state(t).unwrap();
                    assert_eq!(full.len(), QUARKS + 1);
                    samples.push((t, q, iv.value));
                }
                samples
            })
        })
        .collect();

    for t in 1..=LAST {
        let q = quarks[(t as usize * 7) % QUARKS];
        ss.modify_attribute(t, StateValue::Long(t % 13), q).unwrap();
    }
    ss.close_history(LAST).unwrap();

    for reader in readers {
        for (t, q, value) in reader.join().unwrap() {
            assert_eq!(ss.query_single_state(t, q).unwrap().value, value, "quark {q} at {t}");
        }
    }
}

#[test]
fn test_value_type_guard_through_system() {
    let dir = TempDir::new().unwrap();
    let ss = build(&config(&dir, 1));
    let q = ss.get_quark_absolute_and_add(&["x"]).unwrap();
    ss.modify_attribute(1, StateValue::Double(0.5), q).unwrap();
    ss.modify_attribute(2, StateValue::Null, q).unwrap();
    let err = ss
        .modify_attribute(3, StateValue::Int(1), q)
        .unwrap_err();
    assert!(matches!(err, StateSystemError::StateValueType { .. }));
    ss.modify_attribute(4, StateValue::Double(f64::NAN), q).unwrap();
    ss.modify_attribute(5, StateValue::Double(f64::NAN), q).unwrap();
    assert_eq!(ss.get_ongoing_start_time(q).unwrap(), 4);
}
