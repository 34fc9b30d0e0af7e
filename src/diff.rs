use std::collections::BTreeSet;
use std::fs::File;
use std::io::prelude::*;
use std::path::Path;
use walkdir::WalkDir;

use super::quadlet::UnitFile;
use super::staging::STAGING_META;
use super::validate::{self, PortConflict, VolumeConflict};
use super::Result;

/// A modified file plus its unified diff lines
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FileDiff {
    pub path: String,
    pub diff: Vec<String>,
}

/// Counts and derived info for a staged-vs-active comparison
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Summary {
    pub added: usize,
    pub removed: usize,
    pub modified: usize,
    /// Container base names whose units were added or modified
    pub affected_services: Vec<String>,
    pub port_conflicts: Vec<PortConflict>,
    pub volume_conflicts: Vec<VolumeConflict>,
}

/// Full comparison between the active tree and the staged tree
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct DiffResult {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<FileDiff>,
    pub summary: Summary,
}

impl DiffResult {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }

    /// Human oriented dump for the diff subcommand
    pub fn print(&self) -> Result<()> {
        for f in &self.added {
            print!("A {}\n", f);
        }
        for f in &self.removed {
            print!("D {}\n", f);
        }
        for m in &self.modified {
            print!("M {}\n", m.path);
            for l in &m.diff {
                print!("{}\n", l);
            }
        }
        if !self.summary.affected_services.is_empty() {
            print!("affected services: {}\n", self.summary.affected_services.join(", "));
        }
        Ok(())
    }
}

fn relative_files(root: &Path) -> BTreeSet<String> {
    let mut files = BTreeSet::new();
    if !root.is_dir() {
        return files;
    }
    let walker = WalkDir::new(root)
        .min_depth(1)
        .sort_by(|a, b| a.path().cmp(b.path()));
    for entry in walker.into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.file_name().to_str() == Some(STAGING_META) {
            continue;
        }
        if let Ok(rel) = entry.path().strip_prefix(root) {
            files.insert(rel.to_string_lossy().to_string());
        }
    }
    files
}

fn read_bytes(pth: &Path) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    File::open(pth)?.read_to_end(&mut buf)?;
    Ok(buf)
}

/// Compare `active` against `staged`
///
/// Added/Removed/Modified partition every differing file; equality is
/// byte-wise and the staging metadata file is invisible. Affected
/// services come from added or modified `.container` files.
pub fn trees(active: &Path, staged: &Path) -> Result<DiffResult> {
    let before = relative_files(active);
    let after = relative_files(staged);

    let mut res = DiffResult::default();
    for f in after.difference(&before) {
        res.added.push(f.clone());
    }
    for f in before.difference(&after) {
        res.removed.push(f.clone());
    }
    for f in before.intersection(&after) {
        let old = read_bytes(&active.join(f))?;
        let new = read_bytes(&staged.join(f))?;
        if old != new {
            let old_text = String::from_utf8_lossy(&old).to_string();
            let new_text = String::from_utf8_lossy(&new).to_string();
            res.modified.push(FileDiff {
                path: f.clone(),
                diff: unified(&old_text, &new_text, f),
            });
        }
    }

    let mut affected: Vec<String> = res
        .added
        .iter()
        .chain(res.modified.iter().map(|m| &m.path))
        .filter(|p| p.ends_with(".container"))
        .map(|p| p.trim_end_matches(".container").to_string())
        .collect();
    affected.sort();
    affected.dedup();

    // conflicts are computed over what would become active
    let mut staged_units: Vec<UnitFile> = vec![];
    for f in &after {
        if f.ends_with(".container") {
            if let Ok(u) = UnitFile::parse(&staged.join(f)) {
                staged_units.push(u);
            }
        }
    }
    let (ports, volumes) = validate::quick_conflicts(&staged_units);

    res.summary = Summary {
        added: res.added.len(),
        removed: res.removed.len(),
        modified: res.modified.len(),
        affected_services: affected,
        port_conflicts: ports,
        volume_conflicts: volumes,
    };
    Ok(res)
}

#[derive(Clone, Copy, PartialEq)]
enum Op {
    Equal(usize, usize),
    Del(usize),
    Ins(usize),
}

/// Minimal line based unified diff with three lines of context
fn unified(before: &str, after: &str, path: &str) -> Vec<String> {
    let a: Vec<&str> = before.lines().collect();
    let b: Vec<&str> = after.lines().collect();
    let ops = diff_ops(&a, &b);

    let mut out = vec![
        format!("--- active/{}", path),
        format!("+++ staged/{}", path),
    ];

    const CTX: usize = 3;
    // indices of non-equal ops
    let changes: Vec<usize> = ops
        .iter()
        .enumerate()
        .filter(|(_, op)| !matches!(op, Op::Equal(_, _)))
        .map(|(i, _)| i)
        .collect();
    if changes.is_empty() {
        return out;
    }

    // group changes into hunks joined when within 2*CTX of each other
    let mut hunks: Vec<(usize, usize)> = vec![];
    let (mut lo, mut hi) = (changes[0], changes[0]);
    for &c in &changes[1..] {
        if c - hi <= 2 * CTX {
            hi = c;
        } else {
            hunks.push((lo, hi));
            lo = c;
            hi = c;
        }
    }
    hunks.push((lo, hi));

    for (lo, hi) in hunks {
        let start = lo.saturating_sub(CTX);
        let end = if hi + CTX + 1 > ops.len() { ops.len() } else { hi + CTX + 1 };

        // line numbers of the first op in the hunk
        let mut a_start = None;
        let mut b_start = None;
        let mut a_count = 0;
        let mut b_count = 0;
        for op in &ops[start..end] {
            match op {
                Op::Equal(i, j) => {
                    a_start.get_or_insert(*i);
                    b_start.get_or_insert(*j);
                    a_count += 1;
                    b_count += 1;
                }
                Op::Del(i) => {
                    a_start.get_or_insert(*i);
                    a_count += 1;
                }
                Op::Ins(j) => {
                    b_start.get_or_insert(*j);
                    b_count += 1;
                }
            }
        }
        out.push(format!(
            "@@ -{},{} +{},{} @@",
            a_start.unwrap_or(0) + 1,
            a_count,
            b_start.unwrap_or(0) + 1,
            b_count
        ));
        for op in &ops[start..end] {
            match op {
                Op::Equal(i, _) => out.push(format!(" {}", a[*i])),
                Op::Del(i) => out.push(format!("-{}", a[*i])),
                Op::Ins(j) => out.push(format!("+{}", b[*j])),
            }
        }
    }
    out
}

/// Classic LCS backtrack into an edit script
fn diff_ops(a: &[&str], b: &[&str]) -> Vec<Op> {
    let n = a.len();
    let m = b.len();
    let mut table = vec![vec![0usize; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            table[i][j] = if a[i] == b[j] {
                table[i + 1][j + 1] + 1
            } else {
                table[i + 1][j].max(table[i][j + 1])
            };
        }
    }
    let mut ops = vec![];
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if a[i] == b[j] {
            ops.push(Op::Equal(i, j));
            i += 1;
            j += 1;
        } else if table[i + 1][j] >= table[i][j + 1] {
            ops.push(Op::Del(i));
            i += 1;
        } else {
            ops.push(Op::Ins(j));
            j += 1;
        }
    }
    while i < n {
        ops.push(Op::Del(i));
        i += 1;
    }
    while j < m {
        ops.push(Op::Ins(j));
        j += 1;
    }
    ops
}
