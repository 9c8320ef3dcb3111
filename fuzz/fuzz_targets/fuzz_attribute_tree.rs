// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Fuzz target for attribute tree snapshots.
// Run with: cargo +nightly fuzz run fuzz_attribute_tree
//
// Arbitrary bytes must be rejected cleanly; accepted snapshots must encode
// back to exactly the same bytes.

#![no_main]

use libfuzzer_sys::fuzz_target;
use statehist_system::AttributeTree;

fuzz_target!(|data: &[u8]| {
    if let Ok(tree) = AttributeTree::decode(data) {
        assert_eq!(tree.encode(), data);
    }
});
