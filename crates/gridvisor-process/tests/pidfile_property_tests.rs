//! Property-based tests for the pidfile store
//!
//! **Property 1: Round trip** - reading back a written pidfile yields the
//! same `(pid, name)` pair.
//! **Property 2: Parser totality** - parsing arbitrary text never panics, and
//! anything it accepts re-serializes to an equivalent record.

use gridvisor_process::pidfile::{self, PidFileRecord};
use proptest::prelude::*;
use tempfile::tempdir;

/// Names as external tooling may see them: printable, possibly with spaces
fn arb_name() -> impl Strategy<Value = String> {
    "[A-Za-z0-9._ -]{0,30}[A-Za-z0-9._-]"
}

proptest! {
    #[test]
    fn prop_write_read_round_trip(pid in 1u32..=u32::MAX, name in arb_name()) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node.pid");

        pidfile::write(&path, pid, &name).unwrap();
        let record = pidfile::read(&path).unwrap();

        prop_assert_eq!(record, PidFileRecord::new(pid, name));
    }

    #[test]
    fn prop_display_parse_round_trip(pid in 1u32..=u32::MAX, name in arb_name()) {
        let record = PidFileRecord::new(pid, name);
        let parsed: PidFileRecord = record.to_string().parse().unwrap();
        prop_assert_eq!(parsed, record);
    }

    #[test]
    fn prop_parse_never_panics(input in "\\PC{0,40}") {
        if let Ok(record) = input.parse::<PidFileRecord>() {
            prop_assert!(record.pid > 0);
            prop_assert!(!record.name.is_empty());
            let reparsed: PidFileRecord = record.to_string().parse().unwrap();
            prop_assert_eq!(reparsed, record);
        }
    }
}
