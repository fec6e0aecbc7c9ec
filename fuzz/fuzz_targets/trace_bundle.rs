#![no_main]

use libfuzzer_sys::fuzz_target;
use waitcause::config::AnalysisConfig;
use waitcause::replay::{Job, TraceBundle};

fuzz_target!(|data: &[u8]| {
    // Parsing and validation must reject bad bundles without panicking
    if let Ok(input) = std::str::from_utf8(data) {
        if let Ok(bundle) = TraceBundle::from_json(input) {
            let _ = Job::new(bundle, AnalysisConfig::single());
        }
    }
});
