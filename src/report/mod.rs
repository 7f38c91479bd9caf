//! Offline triage of an archived failure: attributes every differing byte to
//! a subtest slot, names the context fields involved and disassembles the
//! instruction under test.

mod csv;
mod json;

use std::fmt;
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use rayon::prelude::*;
use serde::Serialize;

use crate::context::ContextMap;
use crate::decoder::{Decoder, Insn};
use crate::oracle::diff_ranges;
use crate::runner::INIT_MEM;
use crate::snapshot::{subtest_count, SnapshotLayout, PAGE_SIZE, SLOT_STRIDE, TEST_START};
use crate::{EmuTestError, ExecMode, Result};

/// Supported report formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ReportFormat {
    /// Plain text output (default)
    Text,
    /// JSON format (hierarchical)
    Json,
    /// CSV format, one row per differing range
    Csv,
}

impl fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportFormat::Text => write!(f, "text"),
            ReportFormat::Json => write!(f, "json"),
            ReportFormat::Csv => write!(f, "csv"),
        }
    }
}

impl ReportFormat {
    /// Get a formatter for this output format
    pub fn formatter(&self) -> Box<dyn ReportFormatter> {
        match self {
            ReportFormat::Text => Box::new(TextFormatter),
            ReportFormat::Json => Box::new(JsonFormatter),
            ReportFormat::Csv => Box::new(CsvFormatter),
        }
    }
}

/// Formatter trait for failure reports
pub trait ReportFormatter {
    fn format(&self, report: &FailureReport) -> Result<String>;
}

/// Format reports in plain text
pub struct TextFormatter;

/// Format reports in JSON
pub struct JsonFormatter;

/// Format reports in CSV
pub struct CsvFormatter;

/// Page of a subtest slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Region {
    Scratch,
    Data,
    Code,
    Context,
}

impl Region {
    fn of_page(page: usize) -> Self {
        match page {
            0 => Region::Scratch,
            1 => Region::Data,
            2 => Region::Code,
            _ => Region::Context,
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Region::Scratch => write!(f, "scratch"),
            Region::Data => write!(f, "data"),
            Region::Code => write!(f, "code"),
            Region::Context => write!(f, "context"),
        }
    }
}

/// One differing byte range inside a subtest slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotDiff {
    pub region: Region,
    /// Offset within the region's page
    pub offset: usize,
    pub len: usize,
    /// Context field the range starts in
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// Hex bytes left by hardware-assisted execution
    pub hardware: String,
    /// Hex bytes left by software emulation
    pub emulation: String,
}

/// A subtest whose slot differs between the backends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubtestReport {
    pub index: usize,
    /// Decoded code slot, up to the trap fill
    pub instructions: Vec<Insn>,
    pub diffs: Vec<SlotDiff>,
}

impl SubtestReport {
    /// Instructions as one line of assembly
    pub fn assembly(&self) -> String {
        if self.instructions.is_empty() {
            return "(undecodable)".to_string();
        }
        self.instructions
            .iter()
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Encoding of the instructions
    pub fn encoding(&self) -> String {
        self.instructions
            .iter()
            .map(|i| i.hex())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Triage of one archived burst.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureReport {
    pub dir: PathBuf,
    /// Subtests in the burst
    pub subtests: usize,
    /// Only the subtests that differ, in slot order
    pub failing: Vec<SubtestReport>,
    /// Differences past the last subtest slot
    pub unattributed: Vec<Range<usize>>,
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn slot_diffs(base: usize, ranges: &[Range<usize>], hvt: &[u8], emu: &[u8]) -> Vec<SlotDiff> {
    let map = ContextMap::get();
    ranges
        .iter()
        .map(|r| {
            let rel = r.start - base;
            let region = Region::of_page(rel / PAGE_SIZE);
            let offset = rel % PAGE_SIZE;
            let field = match region {
                Region::Context => map.field_at(offset).map(|f| f.name.clone()),
                _ => None,
            };
            SlotDiff {
                region,
                offset,
                len: r.len(),
                field,
                hardware: hex(hvt.get(r.clone()).unwrap_or(&[])),
                emulation: hex(emu.get(r.clone()).unwrap_or(&[])),
            }
        })
        .collect()
}

fn subtest_report<D: Decoder>(
    index: usize,
    init: &[u8],
    hvt: &[u8],
    emu: &[u8],
    decoder: &D,
) -> Result<Option<SubtestReport>> {
    let base = TEST_START + index * SLOT_STRIDE;
    let end = base + SLOT_STRIDE;
    let ranges = diff_ranges(
        &hvt[..end.min(hvt.len())],
        &emu[..end.min(emu.len())],
        base,
    );
    if ranges.is_empty() {
        return Ok(None);
    }

    let code = init
        .get(SnapshotLayout::code_slot(index))
        .ok_or_else(|| EmuTestError::OutOfBounds(format!("no code slot for subtest {} in init.mem", index)))?;
    let instructions = decoder.decode_slot(code)?;

    Ok(Some(SubtestReport {
        index,
        instructions,
        diffs: slot_diffs(base, &ranges, hvt, emu),
    }))
}

/// Analyze an archive directory holding init.mem, hvt.mem and emu.mem.
pub fn analyze<D: Decoder>(dir: &Path, decoder: &D) -> Result<FailureReport> {
    let read = |name: String| -> Result<Vec<u8>> {
        let path = dir.join(&name);
        fs::read(&path).map_err(|e| {
            log::error!("Cannot read {}: {}", path.display(), e);
            e.into()
        })
    };
    let init = read(INIT_MEM.to_string())?;
    let hvt = read(format!("{}.mem", ExecMode::Hardware.stem()))?;
    let emu = read(format!("{}.mem", ExecMode::Emulation.stem()))?;

    let recorded = subtest_count(&init)?;
    let slots = init.len().saturating_sub(TEST_START) / SLOT_STRIDE;
    if recorded > slots {
        log::warn!(
            "{} records {} subtests but init.mem holds only {} slots",
            dir.display(),
            recorded,
            slots
        );
    }
    let subtests = recorded.min(slots);
    log::debug!("{} holds a burst of {} subtests", dir.display(), subtests);

    let failing = (0..subtests)
        .into_par_iter()
        .map(|i| subtest_report(i, &init, &hvt, &emu, decoder))
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .flatten()
        .collect();

    let unattributed = diff_ranges(&hvt, &emu, TEST_START + subtests * SLOT_STRIDE);

    Ok(FailureReport {
        dir: dir.to_path_buf(),
        subtests,
        failing,
        unattributed,
    })
}

impl ReportFormatter for TextFormatter {
    fn format(&self, report: &FailureReport) -> Result<String> {
        let mut output = String::new();
        output.push_str(&format!("Failure report for {}\n", report.dir.display()));
        output.push_str(&format!(
            "{} subtests, {} differ\n",
            report.subtests,
            report.failing.len()
        ));

        for subtest in &report.failing {
            output.push_str(&format!(
                "\nsubtest {}: {:<40} ; {}\n",
                subtest.index,
                subtest.assembly(),
                subtest.encoding()
            ));
            for diff in &subtest.diffs {
                let location = match &diff.field {
                    Some(field) => format!("{}+{:#05x} ({})", diff.region, diff.offset, field),
                    None => format!("{}+{:#05x}", diff.region, diff.offset),
                };
                output.push_str(&format!(
                    "  {:<28} {:>4} bytes  hvt {}  emu {}\n",
                    location, diff.len, diff.hardware, diff.emulation
                ));
            }
        }

        if !report.unattributed.is_empty() {
            output.push_str("\nOutside any subtest slot:\n");
            for range in &report.unattributed {
                output.push_str(&format!("  {:#x}..{:#x}\n", range.start, range.end));
            }
        }
        Ok(output)
    }
}
