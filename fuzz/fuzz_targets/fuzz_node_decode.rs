// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Fuzz target for the history tree node decoder.
// Run with: cargo +nightly fuzz run fuzz_node_decode
//
// The first byte picks the core-node fan-out; the rest is a node body whose
// CRC trailer is recomputed so the decoder gets past the checksum and parses
// the fields. Decoding must never panic, and any node it accepts must
// survive a re-encode.

#![no_main]

use std::path::Path;

use libfuzzer_sys::fuzz_target;
use statehist_tree::HtNode;

fuzz_target!(|data: &[u8]| {
    let Some((&fanout, body)) = data.split_first() else {
        return;
    };
    if body.len() > 1 << 16 {
        return;
    }
    let max_children = usize::from(fanout % 16) + 2;
    let mut block = body.to_vec();
    block.extend_from_slice(&crc32fast::hash(body).to_le_bytes());

    if let Ok(node) = HtNode::decode(&block, block.len(), max_children, Path::new("fuzz")) {
        if let Ok(again) = node.encode() {
            let reparsed = HtNode::decode(&again, again.len(), max_children, Path::new("fuzz"))
                .expect("re-encoded node must decode");
            assert_eq!(reparsed.intervals(), node.intervals());
        }
    }
});
