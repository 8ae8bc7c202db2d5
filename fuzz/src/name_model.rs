//! Differential model for the service-name rules.
//!
//! The validator's contract: accept exactly the non-empty printable-ASCII
//! names of at most 96 bytes with no path separator. This module re-states
//! that contract independently and compares verdicts.

use localcall::registry::{validate_service_name, MAX_SERVICE_NAME_LEN};

/// What the naming rules say about `name`, stated independently of the
/// validator under test.
pub fn name_is_acceptable(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_SERVICE_NAME_LEN
        && name.bytes().all(|b| (b' '..=b'~').contains(&b))
        && !name.contains('/')
}

/// Compare the validator's verdict against the model's.
pub fn verify_verdict(name: &str) -> Result<(), String> {
    let accepted = validate_service_name(name).is_ok();
    let expected = name_is_acceptable(name);
    if accepted != expected {
        return Err(format!(
            "validator said {accepted} for {:?}, rules say {expected}",
            name.escape_default().to_string()
        ));
    }
    Ok(())
}
