//! Bolero fuzzer for the service-name rules.
//!
//! The validator must agree with the independently stated rules for any
//! input, and must never panic.

use bolero::check;
use localcall_fuzz::name_model::{name_is_acceptable, verify_verdict};

#[test]
fn verdicts_match_the_rules() {
    check!().with_type::<String>().for_each(|name| {
        if let Err(e) = verify_verdict(name) {
            panic!("invariant violated: {e}");
        }
    });
}

#[cfg(test)]
mod regressions {
    use super::*;

    #[test]
    fn known_good_names() {
        for name in ["a", "camera.frames", "img_resize-v2", "with space"] {
            assert!(name_is_acceptable(name), "{name:?}");
            verify_verdict(name).unwrap();
        }
    }

    #[test]
    fn known_bad_names() {
        for name in ["", "a/b", "/lead", "caf\u{e9}", "nul\0byte", "tab\tbyte"] {
            assert!(!name_is_acceptable(name), "{name:?}");
            verify_verdict(name).unwrap();
        }
    }

    #[test]
    fn boundary_lengths() {
        verify_verdict(&"x".repeat(96)).unwrap();
        verify_verdict(&"x".repeat(97)).unwrap();
    }
}
