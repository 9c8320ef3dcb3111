// SPDX-License-Identifier: PMPL-1.0-or-later
//
// statehist history tree
//
// Durable storage for closed state intervals. Intervals are packed into
// fixed-size node blocks organized as a shallow multi-way tree keyed by
// time; a point query descends one root-to-leaf path, checking each node's
// intervals on the way down.
//
// # File layout
//
// ```text
// [HEADER_SIZE bytes: file header]            -- see `format`
// [block_size bytes: node 0]
// [block_size bytes: node 1]
// ...
// [block_size bytes: node N-1]
// [attribute tree snapshot]                   -- offset/length/CRC in header
// ```
//
// # Usage
//
// ```no_run
// use statehist_tree::{HistoryBackend, HistoryTreeBackend, HtConfig};
// use statehist_core::StateValue;
//
// let config = HtConfig::new("/tmp/trace.ht", 1, 0);
// let backend = HistoryTreeBackend::create(config.clone()).unwrap();
// backend.insert_past_state(0, 99, 5, StateValue::Null).unwrap();
// backend.insert_past_state(100, 249, 5, StateValue::from("running")).unwrap();
// backend.finished_building(300, &[]).unwrap();
//
// let reopened = HistoryTreeBackend::open_existing(&config).unwrap();
// let iv = reopened.do_single_query(120, 5).unwrap().unwrap();
// assert_eq!(iv.value, StateValue::from("running"));
// ```

#![forbid(unsafe_code)]

pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod format;
pub mod io;
pub mod memory;
pub mod metrics;
pub mod node;
pub mod tree;

pub use backend::{HistoryBackend, HistoryTreeBackend};
pub use cache::CacheStats;
pub use config::{HtConfig, ANY_PROVIDER_VERSION};
pub use error::{TreeError, TreeResult};
pub use format::TreeHeader;
pub use memory::InMemoryBackend;
pub use metrics::{BackendStats, MetricsBackend};
pub use node::{ChildRef, HtNode, NodeKind};
pub use tree::{HistoryTree, TreeInfo};
