//! JSON output formatter

use super::{FailureReport, ReportFormatter};
use crate::Result;

impl ReportFormatter for super::JsonFormatter {
    fn format(&self, report: &FailureReport) -> Result<String> {
        Ok(serde_json::to_string_pretty(report)?)
    }
}
