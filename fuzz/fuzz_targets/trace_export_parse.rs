//! Fuzz target for TraceExport::parse and chain verification
//!
//! # Invariants
//!
//! - Parsing arbitrary text never panics
//! - Every failure is one of the three verifier kinds
//! - Verifying the same export twice gives the same answer

#![no_main]

use libfuzzer_sys::fuzz_target;
use tracechain_verify::{TraceVerifier, VerifyError};

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    let verifier = TraceVerifier::default();
    let candidates = ["c-1", "c-2", ""];
    let first = verifier.verify_export(&candidates, text);
    let second = verifier.verify_export(&candidates, text);
    assert_eq!(first, second);

    if let Err(e) = first {
        assert!(matches!(
            e,
            VerifyError::TraceExportMissing(_)
                | VerifyError::TraceExportMalformed(_)
                | VerifyError::ChainIncomplete { .. }
        ));
    }
});
