//! Fuzz target for bearer token verification.
//!
//! Arbitrary `Authorization` header values must be rejected or accepted
//! without panicking; anything accepted must carry a non-empty user id.
//!
//! # Running
//!
//! ```bash
//! cargo +nightly fuzz run fuzz_credentials
//! ```

#![no_main]

use libfuzzer_sys::fuzz_target;
use social_pipeline::credentials::CredentialValidator;

fuzz_target!(|data: &[u8]| {
    let Ok(header) = std::str::from_utf8(data) else {
        return;
    };

    let validator = CredentialValidator::new("fuzz-secret");
    if let Ok(identity) = validator.verify(Some(header)) {
        assert!(!identity.user_id.is_empty());
    }
    let _ = validator.verify_token(header);
});
