use serde::{Deserialize, Serialize};
use std::ops::Range;

use crate::error::FogError;

/// Buffer value of a cell nobody has seen yet.
pub const HIDDEN: u8 = 0;

/// Buffer value of a cell that was seen at some point but is not in view now.
pub const EXPLORED: u8 = 1;

/// Buffer value of a cell currently in view.
pub const VISIBLE: u8 = 2;

/// Visibility state of one fog cell, stored as its `u8` value in the grid buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum CellState {
    #[default]
    Hidden = HIDDEN,
    Explored = EXPLORED,
    Visible = VISIBLE,
}

impl CellState {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for CellState {
    type Error = FogError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            HIDDEN => Ok(CellState::Hidden),
            EXPLORED => Ok(CellState::Explored),
            VISIBLE => Ok(CellState::Visible),
            other => Err(FogError::UnknownCellState(other)),
        }
    }
}

/// The world-space rectangle a map occupies.
///
/// Grids work in map-local coordinates with the origin at `(min_x, min_y)`;
/// `to_local` converts world positions coming from the table into that frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MapBounds {
    pub min_x: f64,
    pub min_y: f64,
    pub width: f64,
    pub height: f64,
}

impl MapBounds {
    pub fn new(min_x: f64, min_y: f64, width: f64, height: f64) -> Self {
        Self {
            min_x,
            min_y,
            width,
            height,
        }
    }

    /// Bounds anchored at the world origin.
    pub fn from_size(width: f64, height: f64) -> Self {
        Self::new(0.0, 0.0, width, height)
    }

    pub fn to_local(&self, x: f64, y: f64) -> (f64, f64) {
        (x - self.min_x, y - self.min_y)
    }

    pub fn to_world(&self, x: f64, y: f64) -> (f64, f64) {
        (x + self.min_x, y + self.min_y)
    }
}

/// Largest number of cells along either axis of a locally created grid.
pub const MAX_GRID_DIM: u32 = 4096;

fn sanitize_cell_size(cell_size: f64) -> f64 {
    if cell_size.is_finite() && cell_size > 0.0 {
        cell_size
    } else {
        tracing::warn!("Invalid cell size {}, using 1.0", cell_size);
        1.0
    }
}

/// Immutable copy of one grid: dimensions plus the raw cell buffer.
///
/// The buffer travels as base64 inside JSON so snapshots stay compact on the
/// wire and in valkey.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FogStateSnapshot {
    pub cols: u32,
    pub rows: u32,
    pub cell_size: f64,
    #[serde(with = "buffer_b64")]
    pub buffer: Vec<u8>,
}

impl FogStateSnapshot {
    /// Check that the buffer matches the dimensions and holds only known cell values.
    pub fn validate(&self) -> Result<(), FogError> {
        let expected = self.cols as usize * self.rows as usize;
        if self.cols == 0 || self.rows == 0 || self.buffer.len() != expected {
            return Err(FogError::InvalidSnapshot {
                cols: self.cols,
                rows: self.rows,
                expected,
                actual: self.buffer.len(),
            });
        }
        if let Some(&bad) = self.buffer.iter().find(|&&v| v > VISIBLE) {
            return Err(FogError::UnknownCellState(bad));
        }
        if !(self.cell_size.is_finite() && self.cell_size > 0.0) {
            return Err(FogError::Wire(format!("cell size {} is not positive", self.cell_size)));
        }
        Ok(())
    }
}

mod buffer_b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(buffer: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(buffer))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Cell counts per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FogStats {
    pub hidden: usize,
    pub explored: usize,
    pub visible: usize,
}

impl FogStats {
    pub fn total(&self) -> usize {
        self.hidden + self.explored + self.visible
    }

    /// Share of cells that have been seen at least once, in percent.
    pub fn explored_percentage(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        (self.explored + self.visible) as f64 * 100.0 / total as f64
    }
}

/// Per-map occlusion grid. Row-major, `cols * rows` cells, one byte each.
#[derive(Debug, Clone, PartialEq)]
pub struct FogGrid {
    cols: u32,
    rows: u32,
    cell_size: f64,
    cells: Vec<u8>,
}

impl FogGrid {
    /// Create an all-hidden grid. Dimensions are clamped to `1..=MAX_GRID_DIM` cells.
    pub fn new(cols: u32, rows: u32, cell_size: f64) -> Self {
        let cols = cols.clamp(1, MAX_GRID_DIM);
        let rows = rows.clamp(1, MAX_GRID_DIM);
        let cell_size = sanitize_cell_size(cell_size);
        Self {
            cols,
            rows,
            cell_size,
            cells: vec![HIDDEN; cols as usize * rows as usize],
        }
    }

    /// Create an all-hidden grid covering `bounds`.
    pub fn for_bounds(bounds: &MapBounds, cell_size: f64) -> Self {
        let cell_size = sanitize_cell_size(cell_size);
        let axis = |len: f64| {
            let cells = (len / cell_size).round();
            if cells.is_nan() {
                1
            } else {
                cells.clamp(1.0, MAX_GRID_DIM as f64) as u32
            }
        };
        Self::new(axis(bounds.width), axis(bounds.height), cell_size)
    }

    pub fn dims(&self) -> (u32, u32) {
        (self.cols, self.rows)
    }

    pub fn cell_size(&self) -> f64 {
        self.cell_size
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Read-only view of the cell buffer.
    pub fn raw(&self) -> &[u8] {
        &self.cells
    }

    pub(crate) fn cells_mut(&mut self) -> &mut [u8] {
        &mut self.cells
    }

    pub fn index(&self, col: u32, row: u32) -> usize {
        row as usize * self.cols as usize + col as usize
    }

    pub fn in_bounds(&self, col: i64, row: i64) -> bool {
        col >= 0 && row >= 0 && col < self.cols as i64 && row < self.rows as i64
    }

    /// State of a cell; out-of-bounds cells read as hidden.
    pub fn get(&self, col: u32, row: u32) -> CellState {
        if !self.in_bounds(col as i64, row as i64) {
            return CellState::Hidden;
        }
        CellState::try_from(self.cells[self.index(col, row)]).unwrap_or_default()
    }

    pub fn set(&mut self, col: u32, row: u32, state: CellState) {
        if !self.in_bounds(col as i64, row as i64) {
            return;
        }
        let i = self.index(col, row);
        self.cells[i] = state.as_u8();
    }

    /// Grid cell containing a map-local position, if inside the grid.
    pub fn world_to_cell(&self, x: f64, y: f64) -> Option<(u32, u32)> {
        let col = (x / self.cell_size).floor();
        let row = (y / self.cell_size).floor();
        if !col.is_finite() || !row.is_finite() || !self.in_bounds(col as i64, row as i64) {
            return None;
        }
        Some((col as u32, row as u32))
    }

    /// Map-local centre of a cell.
    pub fn cell_center(&self, col: u32, row: u32) -> (f64, f64) {
        (
            (col as f64 + 0.5) * self.cell_size,
            (row as f64 + 0.5) * self.cell_size,
        )
    }

    /// Upgrade every cell whose centre lies in `[x, x+w) × [y, y+h)`.
    ///
    /// Hidden cells become visible; explored and visible cells keep their state.
    pub fn reveal_rect(&mut self, x: f64, y: f64, w: f64, h: f64) {
        self.paint_rect(x, y, w, h, reveal_cell);
    }

    /// Demote visible cells whose centre lies in the rectangle to explored.
    /// Explored history is never erased here; use [`FogGrid::reset`] for that.
    pub fn hide_rect(&mut self, x: f64, y: f64, w: f64, h: f64) {
        self.paint_rect(x, y, w, h, hide_cell);
    }

    /// Brush version of [`FogGrid::reveal_rect`]: cells whose centre is within `radius`.
    pub fn reveal_circle(&mut self, cx: f64, cy: f64, radius: f64) {
        self.paint_circle(cx, cy, radius, reveal_cell);
    }

    /// Brush version of [`FogGrid::hide_rect`].
    pub fn hide_circle(&mut self, cx: f64, cy: f64, radius: f64) {
        self.paint_circle(cx, cy, radius, hide_cell);
    }

    pub fn reveal_all(&mut self) {
        self.cells.fill(VISIBLE);
    }

    /// Cover the whole map again, forgetting what was explored.
    pub fn reset(&mut self) {
        self.cells.fill(HIDDEN);
    }

    pub fn demote_visible(&mut self) {
        for cell in self.cells.iter_mut() {
            if *cell == VISIBLE {
                *cell = EXPLORED;
            }
        }
    }

    pub fn stats(&self) -> FogStats {
        let mut stats = FogStats::default();
        for &cell in &self.cells {
            match cell {
                VISIBLE => stats.visible += 1,
                EXPLORED => stats.explored += 1,
                _ => stats.hidden += 1,
            }
        }
        stats
    }

    pub fn snapshot(&self) -> FogStateSnapshot {
        FogStateSnapshot {
            cols: self.cols,
            rows: self.rows,
            cell_size: self.cell_size,
            buffer: self.cells.clone(),
        }
    }

    /// Replace the grid wholesale. On error the grid is left untouched.
    pub fn load(&mut self, snapshot: &FogStateSnapshot) -> Result<(), FogError> {
        snapshot.validate()?;
        self.cols = snapshot.cols;
        self.rows = snapshot.rows;
        self.cell_size = snapshot.cell_size;
        self.cells = snapshot.buffer.clone();
        Ok(())
    }

    fn paint_rect(&mut self, x: f64, y: f64, w: f64, h: f64, paint: fn(u8) -> u8) {
        let cols = center_span(x / self.cell_size, (x + w) / self.cell_size, self.cols);
        let rows = center_span(y / self.cell_size, (y + h) / self.cell_size, self.rows);
        for row in rows {
            for col in cols.clone() {
                let i = self.index(col, row);
                self.cells[i] = paint(self.cells[i]);
            }
        }
    }

    fn paint_circle(&mut self, cx: f64, cy: f64, radius: f64, paint: fn(u8) -> u8) {
        if radius.is_nan() || radius < 0.0 {
            return;
        }
        let cols = clamp_span(
            ((cx - radius) / self.cell_size).floor(),
            ((cx + radius) / self.cell_size).ceil() + 1.0,
            self.cols,
        );
        let rows = clamp_span(
            ((cy - radius) / self.cell_size).floor(),
            ((cy + radius) / self.cell_size).ceil() + 1.0,
            self.rows,
        );
        let r2 = radius * radius;
        for row in rows {
            for col in cols.clone() {
                let (px, py) = self.cell_center(col, row);
                let (dx, dy) = (px - cx, py - cy);
                if dx * dx + dy * dy <= r2 {
                    let i = self.index(col, row);
                    self.cells[i] = paint(self.cells[i]);
                }
            }
        }
    }
}

fn reveal_cell(v: u8) -> u8 {
    if v == HIDDEN {
        VISIBLE
    } else {
        v.max(EXPLORED)
    }
}

fn hide_cell(v: u8) -> u8 {
    if v == VISIBLE {
        EXPLORED
    } else {
        v
    }
}

/// Cell indices whose centre `i + 0.5` lies in `[lo, hi)`, in cell units, clipped to `0..n`.
fn center_span(lo: f64, hi: f64, n: u32) -> Range<u32> {
    clamp_span((lo - 0.5).ceil(), (hi - 0.5).ceil(), n)
}

fn clamp_span(lo: f64, hi: f64, n: u32) -> Range<u32> {
    let lo = lo.max(0.0).min(n as f64) as u32;
    let hi = hi.max(0.0).min(n as f64) as u32;
    lo..hi.max(lo)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count(grid: &FogGrid, state: CellState) -> usize {
        grid.raw().iter().filter(|&&v| v == state.as_u8()).count()
    }

    #[test]
    fn reveal_rect_selects_cells_by_centre() {
        let mut grid = FogGrid::new(10, 10, 1.0);
        grid.reveal_rect(2.0, 2.0, 3.0, 3.0);

        assert_eq!(count(&grid, CellState::Visible), 9);
        for row in 2..5 {
            for col in 2..5 {
                assert_eq!(grid.get(col, row), CellState::Visible);
            }
        }
        assert_eq!(grid.get(5, 5), CellState::Hidden);
        assert_eq!(grid.get(1, 2), CellState::Hidden);
    }

    #[test]
    fn reveal_then_hide_leaves_explored() {
        let mut grid = FogGrid::new(8, 6, 2.0);
        grid.reveal_rect(2.0, 0.0, 8.0, 6.0);
        grid.hide_rect(2.0, 0.0, 8.0, 6.0);

        for row in 0..3 {
            for col in 1..5 {
                assert_eq!(grid.get(col, row), CellState::Explored, "cell {col},{row}");
            }
        }
        assert_eq!(count(&grid, CellState::Hidden), 48 - 12);
    }

    #[test]
    fn reveal_keeps_explored_cells_explored() {
        let mut grid = FogGrid::new(4, 4, 1.0);
        grid.set(1, 1, CellState::Explored);
        grid.set(2, 2, CellState::Visible);
        grid.reveal_rect(0.0, 0.0, 4.0, 4.0);

        assert_eq!(grid.get(1, 1), CellState::Explored);
        assert_eq!(grid.get(2, 2), CellState::Visible);
        assert_eq!(grid.get(0, 0), CellState::Visible);
    }

    #[test]
    fn hide_never_rehides_explored() {
        let mut grid = FogGrid::new(3, 3, 1.0);
        grid.set(0, 0, CellState::Explored);
        grid.hide_rect(0.0, 0.0, 3.0, 3.0);
        assert_eq!(grid.get(0, 0), CellState::Explored);
        assert_eq!(grid.get(1, 1), CellState::Hidden);
    }

    #[test]
    fn rect_outside_grid_is_clipped() {
        let mut grid = FogGrid::new(5, 5, 1.0);
        grid.reveal_rect(-10.0, -10.0, 12.0, 12.0);
        assert_eq!(count(&grid, CellState::Visible), 4);

        grid.reveal_rect(100.0, 100.0, 5.0, 5.0);
        grid.reveal_rect(1.0, 1.0, -3.0, 2.0);
        assert_eq!(count(&grid, CellState::Visible), 4);
    }

    #[test]
    fn circle_brush_uses_cell_centres() {
        let mut grid = FogGrid::new(10, 10, 1.0);
        grid.reveal_circle(5.5, 5.5, 1.0);
        // centre plus its four orthogonal neighbours
        assert_eq!(count(&grid, CellState::Visible), 5);

        grid.hide_circle(5.5, 5.5, 0.0);
        assert_eq!(grid.get(5, 5), CellState::Explored);
        assert_eq!(grid.get(5, 6), CellState::Visible);
    }

    #[test]
    fn reset_erases_history() {
        let mut grid = FogGrid::new(4, 4, 1.0);
        grid.reveal_all();
        grid.demote_visible();
        assert_eq!(grid.stats().explored, 16);
        grid.reset();
        assert_eq!(grid.stats().hidden, 16);
    }

    #[test]
    fn for_bounds_rounds_dimensions() {
        let grid = FogGrid::for_bounds(&MapBounds::from_size(1920.0, 1290.0), 40.0);
        assert_eq!(grid.dims(), (48, 32));
        assert_eq!(grid.len(), 48 * 32);

        let tiny = FogGrid::for_bounds(&MapBounds::new(-12.0, -12.0, 0.1, 0.1), 1.0);
        assert_eq!(tiny.dims(), (1, 1));
    }

    #[test]
    fn bad_cell_size_falls_back_before_sizing() {
        let grid = FogGrid::for_bounds(&MapBounds::from_size(10.0, 10.0), 0.0);
        assert_eq!(grid.dims(), (10, 10));
        assert_eq!(grid.cell_size(), 1.0);

        let grid = FogGrid::for_bounds(&MapBounds::from_size(10.0, 6.0), f64::NAN);
        assert_eq!(grid.dims(), (10, 6));
    }

    #[test]
    fn huge_maps_are_capped() {
        let grid = FogGrid::for_bounds(&MapBounds::from_size(1e12, f64::INFINITY), 1e-6);
        assert_eq!(grid.dims(), (MAX_GRID_DIM, MAX_GRID_DIM));

        let grid = FogGrid::new(u32::MAX, 3, 1.0);
        assert_eq!(grid.dims(), (MAX_GRID_DIM, 3));
    }

    #[test]
    fn snapshot_loads_into_another_grid() {
        let mut source = FogGrid::new(6, 4, 1.5);
        source.reveal_rect(0.0, 0.0, 4.5, 3.0);
        source.hide_rect(0.0, 0.0, 1.5, 1.5);

        let mut target = FogGrid::new(6, 4, 1.5);
        target.load(&source.snapshot()).unwrap();
        assert_eq!(target.raw(), source.raw());
    }

    #[test]
    fn load_rejects_mismatched_buffer() {
        let mut grid = FogGrid::new(3, 3, 1.0);
        grid.reveal_rect(0.0, 0.0, 1.0, 1.0);
        let before = grid.clone();

        let bad = FogStateSnapshot {
            cols: 3,
            rows: 3,
            cell_size: 1.0,
            buffer: vec![0; 8],
        };
        assert!(matches!(
            grid.load(&bad),
            Err(FogError::InvalidSnapshot { expected: 9, actual: 8, .. })
        ));
        assert_eq!(grid, before);

        let unknown = FogStateSnapshot {
            buffer: vec![7; 9],
            ..bad
        };
        assert!(matches!(grid.load(&unknown), Err(FogError::UnknownCellState(7))));
        assert_eq!(grid, before);
    }

    #[test]
    fn snapshot_buffer_serializes_as_base64() {
        let snapshot = FogStateSnapshot {
            cols: 2,
            rows: 1,
            cell_size: 1.0,
            buffer: vec![2, 1],
        };
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["buffer"], "AgE=");
        let back: FogStateSnapshot = serde_json::from_value(json).unwrap();
        assert_eq!(back, snapshot);
    }

    #[test]
    fn stats_report_explored_share() {
        let mut grid = FogGrid::new(4, 1, 1.0);
        grid.set(0, 0, CellState::Visible);
        grid.set(1, 0, CellState::Explored);
        let stats = grid.stats();
        assert_eq!(stats.total(), 4);
        assert_eq!(stats.explored_percentage(), 50.0);
    }

    #[test]
    fn world_to_cell_and_back() {
        let grid = FogGrid::new(4, 4, 2.0);
        assert_eq!(grid.world_to_cell(3.9, 0.1), Some((1, 0)));
        assert_eq!(grid.world_to_cell(-0.1, 0.0), None);
        assert_eq!(grid.world_to_cell(8.0, 0.0), None);
        assert_eq!(grid.cell_center(1, 0), (3.0, 1.0));

        let bounds = MapBounds::new(-12.0, -12.0, 24.0, 24.0);
        assert_eq!(bounds.to_local(-12.0, 0.0), (0.0, 12.0));
        assert_eq!(bounds.to_world(0.0, 12.0), (-12.0, 0.0));
    }
}
