//! Oracle: byte comparison of the two backends' memory images and the
//! failure archive mismatching bursts are stored in.

use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};

use rayon::prelude::*;

use crate::runner::{VmDir, INIT_MEM};
use crate::{ExecMode, Result};

/// Bytes compared per rayon task
const CHUNK_SIZE: usize = 64 * 1024;

fn tail(mem: &[u8], skip: usize) -> &[u8] {
    mem.get(skip..).unwrap_or(&[])
}

/// True when both images are equal from byte `skip` on. Images whose
/// lengths differ past `skip` never compare equal.
pub fn compare(a: &[u8], b: &[u8], skip: usize) -> bool {
    let (a, b) = (tail(a, skip), tail(b, skip));
    a.len() == b.len()
        && a.par_chunks(CHUNK_SIZE)
            .zip(b.par_chunks(CHUNK_SIZE))
            .all(|(x, y)| x == y)
}

/// [`compare`] on two image files.
pub fn compare_files(a: &Path, b: &Path, skip: usize) -> Result<bool> {
    let (a, b) = (fs::read(a)?, fs::read(b)?);
    Ok(compare(&a, &b, skip))
}

fn chunk_ranges(x: &[u8], y: &[u8], base: usize) -> Vec<Range<usize>> {
    let mut out: Vec<Range<usize>> = Vec::new();
    for (i, (p, q)) in x.iter().zip(y).enumerate() {
        if p == q {
            continue;
        }
        let at = base + i;
        match out.last_mut() {
            Some(last) if last.end == at => last.end += 1,
            _ => out.push(at..at + 1),
        }
    }
    out
}

/// Differing byte ranges from `skip` on, as absolute offsets, merged and in
/// ascending order. Bytes only one image has form a final range.
pub fn diff_ranges(a: &[u8], b: &[u8], skip: usize) -> Vec<Range<usize>> {
    let (ta, tb) = (tail(a, skip), tail(b, skip));
    let common = ta.len().min(tb.len());

    let per_chunk: Vec<Vec<Range<usize>>> = ta[..common]
        .par_chunks(CHUNK_SIZE)
        .zip(tb[..common].par_chunks(CHUNK_SIZE))
        .enumerate()
        .map(|(i, (x, y))| chunk_ranges(x, y, skip + i * CHUNK_SIZE))
        .collect();

    let mut merged: Vec<Range<usize>> = Vec::new();
    let longer = ta.len().max(tb.len());
    let extra = (common < longer).then(|| skip + common..skip + longer);
    for range in per_chunk.into_iter().flatten().chain(extra) {
        match merged.last_mut() {
            Some(last) if last.end == range.start => last.end = range.end,
            _ => merged.push(range),
        }
    }
    merged
}

/// Total number of bytes covered by `ranges`
pub fn diff_len(ranges: &[Range<usize>]) -> usize {
    ranges.iter().map(|r| r.len()).sum()
}

/// Failing bursts, stored as `<root>/<worker>/<failure index>/`.
#[derive(Debug, Clone)]
pub struct FailureArchive {
    root: PathBuf,
}

impl FailureArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn case_dir(&self, worker: usize, index: usize) -> PathBuf {
        self.root.join(worker.to_string()).join(index.to_string())
    }

    /// Archive a mismatching burst: both memory images, both logs and the
    /// initial image.
    pub fn store_mismatch(
        &self,
        worker: usize,
        index: usize,
        dir: &VmDir,
        init_mem: &[u8],
    ) -> Result<PathBuf> {
        let dest = self.case_dir(worker, index);
        fs::create_dir_all(&dest)?;
        for mode in ExecMode::ORDER {
            move_into(&dir.test_mem(mode), &dest)?;
            move_into(&dir.test_log(mode), &dest)?;
        }
        fs::write(dest.join(INIT_MEM), init_mem)?;
        log::debug!("Archived mismatch of worker {} in {}", worker, dest.display());
        Ok(dest)
    }

    /// Salvage whatever is left after an I/O failure mid-burst: the initial
    /// image and the current VM log, when they exist.
    pub fn store_partial(&self, worker: usize, index: usize, dir: &VmDir) -> Result<PathBuf> {
        let dest = self.case_dir(worker, index);
        fs::create_dir_all(&dest)?;
        for src in [dir.init_mem(), dir.log()] {
            if let Some(name) = src.file_name() {
                if src.is_file() {
                    fs::copy(&src, dest.join(name))?;
                }
            }
        }
        Ok(dest)
    }

    /// Copy a whole VM directory into the archive.
    pub fn store_tree(&self, worker: usize, index: usize, src: &Path) -> Result<PathBuf> {
        let dest = self.case_dir(worker, index);
        copy_tree(src, &dest)?;
        Ok(dest)
    }

    /// Copy a whole directory to `<root>/<name>`.
    pub fn store_named_tree(&self, name: &str, src: &Path) -> Result<PathBuf> {
        let dest = self.root.join(name);
        copy_tree(src, &dest)?;
        Ok(dest)
    }

    /// True when nothing has been archived.
    pub fn is_empty(&self) -> Result<bool> {
        match fs::read_dir(&self.root) {
            Ok(mut entries) => Ok(entries.next().is_none()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
            Err(e) => Err(e.into()),
        }
    }
}

/// Rename, falling back to copy and delete across filesystems.
fn move_into(src: &Path, dest_dir: &Path) -> Result<()> {
    let Some(name) = src.file_name() else {
        return Ok(());
    };
    let dest = dest_dir.join(name);
    if fs::rename(src, &dest).is_err() {
        fs::copy(src, &dest)?;
        fs::remove_file(src)?;
    }
    Ok(())
}

pub(crate) fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
