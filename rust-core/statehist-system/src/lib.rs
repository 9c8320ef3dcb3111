// SPDX-License-Identifier: PMPL-1.0-or-later
//
// statehist state system
//
// Builds a state history incrementally from a stream of attribute changes
// and answers "what was the value of attribute A at time T" while the build
// is still running and after it has been sealed.
//
// - `attribute`: path <-> quark mapping, persisted with the history
// - `transient`: the ongoing (not yet closed) value of every quark
// - `system`: `StateSystem`, the builder and query engine
// - `range`: lazy iterator behind `StateSystem::query_range`
//
// # Usage
//
// ```no_run
// use std::sync::Arc;
// use statehist_core::StateValue;
// use statehist_system::StateSystem;
// use statehist_tree::{HistoryTreeBackend, HtConfig};
//
// let config = HtConfig::new("/tmp/trace.ht", 1, 0);
// let ss = StateSystem::new(Arc::new(HistoryTreeBackend::create(config).unwrap()));
// let status = ss.get_quark_absolute_and_add(&["CPUs", "0", "Status"]).unwrap();
// ss.modify_attribute(100, StateValue::from("running"), status).unwrap();
// ss.modify_attribute(250, StateValue::from("idle"), status).unwrap();
// ss.close_history(300).unwrap();
//
// let iv = ss.query_single_state(120, status).unwrap();
// assert_eq!(iv.value, StateValue::from("running"));
// ```

#![forbid(unsafe_code)]

pub mod attribute;
pub mod error;
pub mod range;
pub mod system;
pub mod transient;

pub use attribute::{AttributeEntry, AttributeTree};
pub use error::{StateSystemError, StateSystemResult};
pub use range::RangeIter;
pub use system::{StateSystem, MAX_STACK_DEPTH};
pub use transient::TransientState;
