//! Table detection over interpreted page content.
//!
//! Circular PDFs draw tables as grids of ruled cell rectangles. Detection
//! clusters adjacent cell rectangles, keeps clusters that form at least a
//! 2x2 grid, and reads each cell's text from the words inside it. The
//! cluster's union box is what body-text extraction excludes against, so a
//! word is either table content or body text, never both.

use super::layout::{Rect, Word};

/// Minimum cell edge, below which a rectangle is treated as a ruling line.
const MIN_CELL_EDGE: f32 = 5.0;

/// Gap tolerance when clustering cells and when banding rows/columns.
const CLUSTER_TOLERANCE: f32 = 3.0;

/// A detected table region: its bounding box and the cell grid.
#[derive(Debug, Clone)]
pub struct TableRegion {
    pub bbox: Rect,
    /// Rows top-to-bottom, cells left-to-right.
    pub cells: Vec<Vec<String>>,
}

/// Detect table regions on a page and extract their cell grids.
///
/// Returned regions are ordered top-to-bottom so their index is the table
/// ordinal used for id generation.
pub fn detect_tables(words: &[Word], rects: &[Rect]) -> Vec<TableRegion> {
    let cells: Vec<Rect> = rects
        .iter()
        .filter(|r| r.width() >= MIN_CELL_EDGE && r.height() >= MIN_CELL_EDGE)
        .copied()
        .collect();

    let mut regions: Vec<TableRegion> = cluster_cells(&cells)
        .into_iter()
        .filter_map(|cluster| build_region(&cluster, words))
        .collect();

    regions.sort_by(|a, b| {
        b.bbox
            .y1
            .partial_cmp(&a.bbox.y1)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    regions
}

/// Group touching cell rectangles into clusters.
fn cluster_cells(cells: &[Rect]) -> Vec<Vec<Rect>> {
    let mut cluster_of: Vec<Option<usize>> = vec![None; cells.len()];
    let mut clusters: Vec<Vec<usize>> = Vec::new();

    for i in 0..cells.len() {
        if cluster_of[i].is_some() {
            continue;
        }
        // Flood out from this cell.
        let id = clusters.len();
        let mut stack = vec![i];
        let mut members = Vec::new();
        cluster_of[i] = Some(id);
        while let Some(current) = stack.pop() {
            members.push(current);
            for j in 0..cells.len() {
                if cluster_of[j].is_none() && cells[current].touches(&cells[j], CLUSTER_TOLERANCE) {
                    cluster_of[j] = Some(id);
                    stack.push(j);
                }
            }
        }
        clusters.push(members);
    }

    clusters
        .into_iter()
        .map(|members| members.into_iter().map(|i| cells[i]).collect())
        .collect()
}

/// Build a grid from one cluster, or `None` if it is not a plausible table.
fn build_region(cluster: &[Rect], words: &[Word]) -> Option<TableRegion> {
    if cluster.len() < 4 {
        return None;
    }

    // Band distinct top edges into rows (descending: top of page first) and
    // distinct left edges into columns (ascending).
    let mut row_tops = band_values(cluster.iter().map(|c| c.y1));
    row_tops.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    let mut col_lefts = band_values(cluster.iter().map(|c| c.x0));
    col_lefts.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    if row_tops.len() < 2 || col_lefts.len() < 2 {
        return None;
    }

    let mut grid = vec![vec![String::new(); col_lefts.len()]; row_tops.len()];

    for cell in cluster {
        let row = nearest_band(&row_tops, cell.y1)?;
        let col = nearest_band(&col_lefts, cell.x0)?;
        grid[row][col] = cell_text(cell, words);
    }

    let bbox = cluster
        .iter()
        .skip(1)
        .fold(cluster[0], |acc, c| acc.union(c));

    Some(TableRegion { bbox, cells: grid })
}

/// Collapse a stream of coordinates into band representatives, merging values
/// within the tolerance.
fn band_values(values: impl Iterator<Item = f32>) -> Vec<f32> {
    let mut bands: Vec<f32> = Vec::new();
    for v in values {
        if !bands.iter().any(|b| (b - v).abs() < CLUSTER_TOLERANCE) {
            bands.push(v);
        }
    }
    bands
}

fn nearest_band(bands: &[f32], value: f32) -> Option<usize> {
    bands
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| {
            (*a - value)
                .abs()
                .partial_cmp(&(*b - value).abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(i, _)| i)
}

/// Read a cell's text: words whose center lies inside the cell, in reading
/// order. Newlines become spaces and the stray bullet glyph the layout
/// engine leaves behind is stripped.
fn cell_text(cell: &Rect, words: &[Word]) -> String {
    let mut inside: Vec<&Word> = words
        .iter()
        .filter(|w| {
            let cx = (w.x0 + w.x1) / 2.0;
            let cy = (w.y0 + w.y1) / 2.0;
            cx >= cell.x0 && cx <= cell.x1 && cy >= cell.y0 && cy <= cell.y1
        })
        .collect();

    inside.sort_by(|a, b| {
        b.y0.partial_cmp(&a.y0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.x0.partial_cmp(&b.x0).unwrap_or(std::cmp::Ordering::Equal))
    });

    inside
        .iter()
        .map(|w| w.text.replace('\n', " ").replace('·', ""))
        .collect::<Vec<_>>()
        .join(" ")
        .trim()
        .to_string()
}

// ============================================================================
// Tests
// ============================================================================
