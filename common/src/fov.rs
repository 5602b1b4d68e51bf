//! Field-of-view computation.
//!
//! Visibility is a pure function of grid dimensions, vision sources and LOS
//! blockers. [`compute_visibility`] produces a mask; [`recompute_visibility`]
//! folds that mask into a [`FogGrid`], demoting cells that dropped out of view.

use serde::{Deserialize, Serialize};
use std::f64::consts::{PI, TAU};

use crate::geometry::{LosBlocker, Point, Segment};
use crate::grid::{FogGrid, EXPLORED, VISIBLE};

/// Optional view cone. Angles in radians, measured from +x towards +y.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VisionCone {
    pub facing: f64,
    /// Full opening angle of the cone.
    pub angle: f64,
}

impl VisionCone {
    fn contains(&self, dx: f64, dy: f64) -> bool {
        if self.angle >= TAU {
            return true;
        }
        let mut diff = dy.atan2(dx) - self.facing;
        diff = (diff + PI).rem_euclid(TAU) - PI;
        diff.abs() <= self.angle / 2.0
    }
}

/// Something that sees: a token, a torch. Position and radius in map-local world units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VisionSource {
    pub x: f64,
    pub y: f64,
    pub radius: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cone: Option<VisionCone>,
}

impl VisionSource {
    pub fn new(x: f64, y: f64, radius: f64) -> Self {
        Self {
            x,
            y,
            radius,
            cone: None,
        }
    }

    pub fn with_cone(mut self, facing: f64, angle: f64) -> Self {
        self.cone = Some(VisionCone { facing, angle });
        self
    }

    fn is_valid(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.radius.is_finite() && self.radius >= 0.0
    }
}

/// Flatten blockers into segments, skipping malformed ones.
pub fn blocker_segments(blockers: &[LosBlocker]) -> Vec<Segment> {
    blockers
        .iter()
        .filter_map(|blocker| match blocker.segments() {
            Ok(segments) => Some(segments),
            Err(e) => {
                tracing::debug!("Skipping LOS blocker: {}", e);
                None
            }
        })
        .flatten()
        .collect()
}

/// Cells of a `cols × rows` grid within `r` cells of the origin cell, nearest first.
///
/// Only the part of the disk that overlaps the grid is enumerated, so the cost is
/// bounded by the grid size whatever the radius. Entries are `(col, row, dx, dy)`.
fn disk_cells(origin: (f64, f64), r: f64, cols: u32, rows: u32) -> Vec<(u32, u32, f64, f64)> {
    let span = |o: f64, n: u32| {
        let lo = (o - r).ceil().max(0.0);
        let hi = (o + r).floor().min(n as f64 - 1.0);
        (lo as i64, hi as i64)
    };
    let (col_lo, col_hi) = span(origin.0, cols);
    let (row_lo, row_hi) = span(origin.1, rows);
    let r2 = r * r;

    let mut cells = Vec::new();
    for row in row_lo..=row_hi {
        for col in col_lo..=col_hi {
            let dx = col as f64 - origin.0;
            let dy = row as f64 - origin.1;
            if dx * dx + dy * dy <= r2 {
                cells.push((col as u32, row as u32, dx, dy));
            }
        }
    }
    cells.sort_by(|a, b| {
        let da = a.2 * a.2 + a.3 * a.3;
        let db = b.2 * b.2 + b.3 * b.3;
        da.total_cmp(&db).then(a.1.cmp(&b.1)).then(a.0.cmp(&b.0))
    });
    cells
}

/// Compute which cells of a `cols × rows` grid are seen by at least one source.
///
/// Rays run between cell centres. A segment occludes a target when the ray meets
/// it anywhere before the target's centre, so a wall on a grid line hides the cell
/// right behind it while the cell in front of it stays visible.
pub fn compute_visibility(
    cols: u32,
    rows: u32,
    cell_size: f64,
    sources: &[VisionSource],
    blockers: &[LosBlocker],
) -> Vec<bool> {
    let mut mask = vec![false; cols as usize * rows as usize];
    if !(cell_size.is_finite() && cell_size > 0.0) {
        return mask;
    }
    let segments = blocker_segments(blockers);

    for source in sources {
        if !source.is_valid() {
            tracing::debug!("Skipping vision source {:?}", source);
            continue;
        }

        let origin_cell = ((source.x / cell_size).floor(), (source.y / cell_size).floor());
        let origin = Point::new(
            (origin_cell.0 + 0.5) * cell_size,
            (origin_cell.1 + 0.5) * cell_size,
        );

        let near: Vec<&Segment> = segments
            .iter()
            .filter(|s| s.distance_to(origin) <= source.radius + cell_size)
            .collect();

        for (col, row, dx, dy) in disk_cells(origin_cell, source.radius / cell_size, cols, rows) {
            let i = row as usize * cols as usize + col as usize;
            if mask[i] {
                continue;
            }
            if dx == 0.0 && dy == 0.0 {
                mask[i] = true;
                continue;
            }
            if let Some(cone) = &source.cone {
                if !cone.contains(dx, dy) {
                    continue;
                }
            }

            let target = Point::new(
                (col as f64 + 0.5) * cell_size,
                (row as f64 + 0.5) * cell_size,
            );
            let blocked = near
                .iter()
                .any(|s| s.ray_hit(origin, target).is_some_and(|t| t < 1.0));
            if !blocked {
                mask[i] = true;
            }
        }
    }

    mask
}

/// Rebuild the visible layer of `grid`.
///
/// Cells in view become visible; cells that were visible and no longer are drop to
/// explored. Hidden and explored cells out of view are left alone.
pub fn recompute_visibility(grid: &mut FogGrid, sources: &[VisionSource], blockers: &[LosBlocker]) {
    let (cols, rows) = grid.dims();
    let mask = compute_visibility(cols, rows, grid.cell_size(), sources, blockers);
    for (cell, seen) in grid.cells_mut().iter_mut().zip(mask) {
        if seen {
            *cell = VISIBLE;
        } else if *cell == VISIBLE {
            *cell = EXPLORED;
        }
    }
}
