//! Fuzz target for package path parsing.
//!
//! Chart file names and Maven pom paths come straight from node paths in the
//! operation log, so parsing must tolerate anything.

#![no_main]

use artifact_replication::push::helm::{chart_file_name, parse_chart_file_name};
use artifact_replication::push::maven::{parse_pom_path, version_folder};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    if let Some(chart) = parse_chart_file_name(data) {
        let _ = chart_file_name(&chart.name, &chart.version);
    }
    if let Some(pom) = parse_pom_path(data) {
        let _ = version_folder(&pom.name, &pom.version);
    }
});
