//! In-process operations
//!
//! Gradient tables are whitespace-separated text: a bval file is one row, a
//! bvec file is three rows (x, y, z) with one column per volume.

use std::fs;
use std::io::{Error as IoError, ErrorKind};
use std::path::Path;

use tracing::{info, warn};

use crate::error::{DwiprocError, Result};
use crate::index::{bids, EntityIndex};
use crate::plan::{Builtin, GradientSeries};

/// Execute one builtin operation (blocking)
pub fn run(op: &Builtin) -> Result<()> {
    match op {
        Builtin::BuildIndex {
            root,
            index_path,
            overwrite,
        } => build_index(root, index_path, *overwrite),
        Builtin::WriteText { path, contents } => {
            ensure_parent(path)?;
            fs::write(path, contents)?;
            Ok(())
        }
        Builtin::Copy { from, to } => {
            ensure_parent(to)?;
            fs::copy(from, to)?;
            Ok(())
        }
        Builtin::ConcatGradients {
            series,
            out_bval,
            out_bvec,
            out_index,
        } => concat_gradients(series, out_bval, out_bvec, out_index.as_deref()),
        Builtin::RotateBvecs { bvec, matrix, out } => rotate_bvecs(bvec, matrix, out),
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn build_index(root: &Path, index_path: &Path, overwrite: bool) -> Result<()> {
    if index_path.exists() && !overwrite {
        warn!(path = %index_path.display(), "Index already exists - not overwriting");
        return Ok(());
    }
    let index = bids::build_index(root)?;
    info!(records = index.len(), path = %index_path.display(), "Indexed dataset");
    ensure_parent(index_path)?;
    index.save(index_path)
}

fn invalid(path: &Path, reason: impl std::fmt::Display) -> DwiprocError {
    DwiprocError::Io(IoError::new(
        ErrorKind::InvalidData,
        format!("{}: {reason}", path.display()),
    ))
}

/// Rows of numbers; blank lines are ignored
fn read_table(path: &Path) -> Result<Vec<Vec<f64>>> {
    let text = fs::read_to_string(path)?;
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            line.split_whitespace()
                .map(|value| value.parse::<f64>().map_err(|e| invalid(path, e)))
                .collect()
        })
        .collect()
}

fn read_bval(path: &Path) -> Result<Vec<f64>> {
    let mut rows = read_table(path)?;
    match rows.len() {
        1 => Ok(rows.remove(0)),
        n => Err(invalid(path, format!("expected 1 row, found {n}"))),
    }
}

fn read_bvec(path: &Path) -> Result<[Vec<f64>; 3]> {
    let rows = read_table(path)?;
    let [x, y, z]: [Vec<f64>; 3] = rows
        .try_into()
        .map_err(|rows: Vec<Vec<f64>>| invalid(path, format!("expected 3 rows, found {}", rows.len())))?;
    if x.len() != y.len() || y.len() != z.len() {
        return Err(invalid(path, "rows have different lengths"));
    }
    Ok([x, y, z])
}

fn format_row(values: &[f64]) -> String {
    values
        .iter()
        // adding 0.0 turns -0 into 0
        .map(|v| format!("{}", v + 0.0))
        .collect::<Vec<_>>()
        .join(" ")
}

fn concat_gradients(
    series: &[GradientSeries],
    out_bval: &Path,
    out_bvec: &Path,
    out_index: Option<&Path>,
) -> Result<()> {
    let mut bvals = Vec::new();
    let mut bvecs: [Vec<f64>; 3] = Default::default();
    let mut indices = Vec::new();

    for entry in series {
        let bval = read_bval(&entry.bval)?;
        let bvec = read_bvec(&entry.bvec)?;
        if bvec[0].len() != bval.len() {
            return Err(invalid(
                &entry.bvec,
                format!("{} directions for {} b-values", bvec[0].len(), bval.len()),
            ));
        }
        indices.extend(std::iter::repeat(entry.index).take(bval.len()));
        bvals.extend(bval);
        for (row, values) in bvecs.iter_mut().zip(bvec) {
            row.extend(values);
        }
    }

    ensure_parent(out_bval)?;
    ensure_parent(out_bvec)?;
    fs::write(out_bval, format_row(&bvals) + "\n")?;
    let bvec_text: String = bvecs.iter().map(|row| format_row(row) + "\n").collect();
    fs::write(out_bvec, bvec_text)?;
    if let Some(out_index) = out_index {
        ensure_parent(out_index)?;
        let text = indices
            .iter()
            .map(usize::to_string)
            .collect::<Vec<_>>()
            .join(" ");
        fs::write(out_index, text + "\n")?;
    }
    Ok(())
}

/// Rotate every direction by the upper-left 3x3 block of a 4x4 affine
fn rotate_bvecs(bvec: &Path, matrix: &Path, out: &Path) -> Result<()> {
    let affine = read_table(matrix)?;
    if affine.len() < 3 || affine.iter().take(3).any(|row| row.len() < 3) {
        return Err(invalid(matrix, "expected a 4x4 affine matrix"));
    }
    let [x, y, z] = read_bvec(bvec)?;
    let mut rotated: [Vec<f64>; 3] = Default::default();

    for i in 0..x.len() {
        let v = [x[i], y[i], z[i]];
        let mut r = [0.0; 3];
        for (row, out) in r.iter_mut().enumerate() {
            *out = (0..3).map(|col| affine[row][col] * v[col]).sum();
        }
        // b0 volumes keep their zero direction
        let norm = r.iter().map(|c| c * c).sum::<f64>().sqrt();
        if norm > f64::EPSILON {
            r.iter_mut().for_each(|c| *c /= norm);
        }
        for (axis, value) in rotated.iter_mut().zip(r) {
            axis.push(value);
        }
    }

    ensure_parent(out)?;
    let text: String = rotated.iter().map(|row| format_row(row) + "\n").collect();
    fs::write(out, text)?;
    Ok(())
}

/// Load an existing index or build one in memory without persisting it
pub fn load_or_build(root: &Path, index_path: &Path) -> Result<EntityIndex> {
    if index_path.exists() {
        return EntityIndex::load(index_path);
    }
    warn!(
        path = %index_path.display(),
        "Index not found; building in memory (run the index stage to persist it)"
    );
    bids::build_index(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, text: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn concatenates_series_and_writes_indices() {
        let dir = TempDir::new().unwrap();
        let series = vec![
            GradientSeries {
                bval: write(&dir, "a.bval", "0 1000\n"),
                bvec: write(&dir, "a.bvec", "0 1\n0 0\n0 0\n"),
                index: 1,
            },
            GradientSeries {
                bval: write(&dir, "b.bval", "0 1000 2000\n"),
                bvec: write(&dir, "b.bvec", "0 0 0\n0 1 0\n0 0 1\n"),
                index: 2,
            },
        ];
        let op = Builtin::ConcatGradients {
            series,
            out_bval: dir.path().join("out/all.bval"),
            out_bvec: dir.path().join("out/all.bvec"),
            out_index: Some(dir.path().join("out/index.txt")),
        };
        run(&op).unwrap();

        let read = |name: &str| fs::read_to_string(dir.path().join(name)).unwrap();
        assert_eq!(read("out/all.bval"), "0 1000 0 1000 2000\n");
        assert_eq!(read("out/all.bvec"), "0 1 0 0 0\n0 0 0 1 0\n0 0 0 0 1\n");
        assert_eq!(read("out/index.txt"), "1 1 2 2 2\n");
    }

    #[test]
    fn mismatched_tables_are_rejected() {
        let dir = TempDir::new().unwrap();
        let op = Builtin::ConcatGradients {
            series: vec![GradientSeries {
                bval: write(&dir, "a.bval", "0 1000 1000\n"),
                bvec: write(&dir, "a.bvec", "0 1\n0 0\n0 0\n"),
                index: 1,
            }],
            out_bval: dir.path().join("x.bval"),
            out_bvec: dir.path().join("x.bvec"),
            out_index: None,
        };
        let err = run(&op).unwrap_err();
        assert!(matches!(err, DwiprocError::Io(ref e) if e.kind() == ErrorKind::InvalidData));
    }

    #[test]
    fn rotates_directions_with_affine_block() {
        let dir = TempDir::new().unwrap();
        // 90 degrees about z
        let matrix = write(&dir, "xfm.txt", "0 -1 0 5\n1 0 0 3\n0 0 1 0\n0 0 0 1\n");
        let bvec = write(&dir, "in.bvec", "0 1 0\n0 0 1\n0 0 0\n");
        let out = dir.path().join("out.bvec");
        run(&Builtin::RotateBvecs {
            bvec,
            matrix,
            out: out.clone(),
        })
        .unwrap();
        assert_eq!(fs::read_to_string(out).unwrap(), "0 0 -1\n0 1 0\n0 0 0\n");
    }

    #[test]
    fn existing_index_is_not_overwritten() {
        let dir = TempDir::new().unwrap();
        let index_path = write(&dir, ".index.json", "sentinel");
        run(&Builtin::BuildIndex {
            root: dir.path().to_path_buf(),
            index_path: index_path.clone(),
            overwrite: false,
        })
        .unwrap();
        assert_eq!(fs::read_to_string(&index_path).unwrap(), "sentinel");
    }

    #[test]
    fn builds_and_persists_index() {
        let dir = TempDir::new().unwrap();
        let dwi = dir.path().join("sub-01/dwi");
        fs::create_dir_all(&dwi).unwrap();
        fs::write(dwi.join("sub-01_dwi.nii.gz"), "").unwrap();
        let index_path = dir.path().join("derived/.index.json");
        run(&Builtin::BuildIndex {
            root: dir.path().to_path_buf(),
            index_path: index_path.clone(),
            overwrite: true,
        })
        .unwrap();
        let index = EntityIndex::load(&index_path).unwrap();
        assert!(index.records().iter().any(|r| r.subject == "01" && r.suffix == "dwi"));
    }

    #[test]
    fn copy_creates_parent_directories() {
        let dir = TempDir::new().unwrap();
        let from = write(&dir, "a.txt", "x");
        let to = dir.path().join("deep/nested/b.txt");
        run(&Builtin::Copy { from, to: to.clone() }).unwrap();
        assert_eq!(fs::read_to_string(to).unwrap(), "x");
    }
}
