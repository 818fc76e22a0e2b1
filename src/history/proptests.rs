//! Property-based tests for history diffing
//!
//! These pin the algebra the coalescing pipeline depends on: diffing a
//! transcript against itself yields nothing, and appending a suffix yields
//! exactly that suffix.

use super::*;
use proptest::prelude::*;

fn arb_role_tag() -> impl Strategy<Value = (&'static str, &'static str)> {
    prop_oneof![
        Just(("<USER>", "</USER>")),
        Just(("<BOT>", "</BOT>")),
        Just(("<SALE>", "</SALE>")),
    ]
}

fn arb_block() -> impl Strategy<Value = String> {
    (arb_role_tag(), "[a-zA-Z0-9 ?!.]{1,40}")
        .prop_map(|((open, close), content)| format!("{open}{content}{close}<br>"))
}

fn arb_history() -> impl Strategy<Value = String> {
    prop::collection::vec(arb_block(), 0..8).prop_map(|blocks| blocks.concat())
}

proptest! {
    #[test]
    fn diff_of_identical_histories_is_empty(h in arb_history()) {
        prop_assert_eq!(diff(&h, &h), "");
    }

    #[test]
    fn diff_recovers_appended_suffix(h0 in arb_history(), suffix in arb_block()) {
        let full = format!("{h0}{suffix}");
        prop_assert_eq!(diff(&full, &h0), suffix.as_str());
    }

    #[test]
    fn parse_preserves_block_count(blocks in prop::collection::vec(arb_block(), 0..8)) {
        let history = blocks.concat();
        let parsed = parse(&history);
        if blocks.is_empty() {
            prop_assert!(parsed.is_empty());
        } else {
            prop_assert_eq!(parsed.len(), blocks.len());
        }
    }

    #[test]
    fn parsing_the_diff_never_resurfaces_processed_messages(
        h0 in arb_history(),
        appended in prop::collection::vec(arb_block(), 1..4),
    ) {
        // Messages handed to the AI for the new arrival are exactly the
        // appended blocks, independent of how much history came before.
        let full = format!("{h0}{}", appended.concat());
        let parsed = parse(diff(&full, &h0));
        prop_assert_eq!(parsed.len(), appended.len());
    }
}
