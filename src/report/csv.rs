//! CSV output formatter

use serde::Serialize;

use super::{FailureReport, ReportFormatter};
use crate::{EmuTestError, Result};

/// One row per differing range
#[derive(Serialize)]
struct DiffRow<'a> {
    subtest: usize,
    instruction: String,
    encoding: String,
    region: String,
    offset: String,
    len: usize,
    field: &'a str,
    hardware: &'a str,
    emulation: &'a str,
}

impl ReportFormatter for super::CsvFormatter {
    fn format(&self, report: &FailureReport) -> Result<String> {
        let mut writer = ::csv::Writer::from_writer(Vec::new());

        for subtest in &report.failing {
            let instruction = subtest.assembly();
            let encoding = subtest.encoding();
            for diff in &subtest.diffs {
                writer.serialize(DiffRow {
                    subtest: subtest.index,
                    instruction: instruction.clone(),
                    encoding: encoding.clone(),
                    region: diff.region.to_string(),
                    offset: format!("0x{:x}", diff.offset),
                    len: diff.len,
                    field: diff.field.as_deref().unwrap_or(""),
                    hardware: &diff.hardware,
                    emulation: &diff.emulation,
                })?;
            }
        }

        let bytes = writer
            .into_inner()
            .map_err(|e| EmuTestError::Io(e.into_error()))?;
        String::from_utf8(bytes).map_err(|e| EmuTestError::Decoder(e.to_string()))
    }
}
