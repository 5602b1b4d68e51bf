use std::borrow::Cow;
use tokio::sync::watch;

use crate::error::FogError;
use crate::fov::{recompute_visibility, VisionSource};
use crate::geometry::LosBlocker;
use crate::grid::{FogGrid, FogStateSnapshot, FogStats, MapBounds, VISIBLE};
use crate::settings::FogSettings;
use crate::wire::{apply_runs, FogPayload, FogSyncData, Stamp};

/// Authoritative fog state for one open map.
///
/// All mutators are synchronous and bump `version` exactly once, so renderers and
/// the sync service can detect changes by comparing a single integer. Positions
/// passed in are world coordinates; `bounds` maps them onto the grid.
pub struct FogStore {
    map_id: String,
    bounds: MapBounds,
    grid: FogGrid,
    sources: Vec<VisionSource>,
    blockers: Vec<LosBlocker>,
    settings: FogSettings,
    version: u64,
    version_tx: watch::Sender<u64>,
    last_remote: Option<Stamp>,
}

impl FogStore {
    /// Open a map with an all-hidden grid at version 0.
    pub fn new(map_id: impl Into<String>, bounds: MapBounds, cell_size: f64) -> Self {
        let (version_tx, _) = watch::channel(0);
        Self {
            map_id: map_id.into(),
            grid: FogGrid::for_bounds(&bounds, cell_size),
            bounds,
            sources: Vec::new(),
            blockers: Vec::new(),
            settings: FogSettings::default(),
            version: 0,
            version_tx,
            last_remote: None,
        }
    }

    pub fn map_id(&self) -> &str {
        &self.map_id
    }

    pub fn bounds(&self) -> &MapBounds {
        &self.bounds
    }

    pub fn grid(&self) -> &FogGrid {
        &self.grid
    }

    pub fn raw(&self) -> &[u8] {
        self.grid.raw()
    }

    pub fn dims(&self) -> (u32, u32) {
        self.grid.dims()
    }

    pub fn cell_size(&self) -> f64 {
        self.grid.cell_size()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Receiver that observes every version bump.
    pub fn watch_version(&self) -> watch::Receiver<u64> {
        self.version_tx.subscribe()
    }

    pub fn settings(&self) -> &FogSettings {
        &self.settings
    }

    pub fn sources(&self) -> &[VisionSource] {
        &self.sources
    }

    pub fn blockers(&self) -> &[LosBlocker] {
        &self.blockers
    }

    pub fn stats(&self) -> FogStats {
        self.grid.stats()
    }

    /// Stamp of the newest remote update applied so far.
    pub fn last_remote(&self) -> Option<&Stamp> {
        self.last_remote.as_ref()
    }

    /// Buffer renderers should draw: all-visible when fog is off or globally revealed.
    pub fn render_view(&self) -> Cow<'_, [u8]> {
        if self.settings.masks_map() {
            Cow::Borrowed(self.grid.raw())
        } else {
            Cow::Owned(vec![VISIBLE; self.grid.len()])
        }
    }

    fn bump(&mut self) {
        self.version += 1;
        self.version_tx.send_replace(self.version);
    }

    /// Replace the grid with a fresh all-hidden one for new bounds.
    pub fn set_map_size(&mut self, bounds: MapBounds, cell_size: f64) {
        self.bounds = bounds;
        self.grid = FogGrid::for_bounds(&bounds, cell_size);
        let (cols, rows) = self.grid.dims();
        tracing::info!("Fog grid for map {} resized to {}x{}", self.map_id, cols, rows);
        self.bump();
    }

    pub fn set_settings(&mut self, settings: FogSettings) {
        self.settings = settings;
        self.bump();
    }

    /// Replace all vision sources and recompute visibility.
    pub fn set_sources(&mut self, sources: Vec<VisionSource>) {
        self.sources = sources;
        self.refresh_visibility();
        self.bump();
    }

    /// Replace all LOS blockers and recompute visibility.
    pub fn set_blockers(&mut self, blockers: Vec<LosBlocker>) {
        self.blockers = blockers;
        self.refresh_visibility();
        self.bump();
    }

    pub fn recompute(&mut self) {
        self.refresh_visibility();
        self.bump();
    }

    fn refresh_visibility(&mut self) {
        let (dx, dy) = (-self.bounds.min_x, -self.bounds.min_y);
        let sources: Vec<VisionSource> = self
            .sources
            .iter()
            .map(|s| VisionSource {
                x: s.x + dx,
                y: s.y + dy,
                ..*s
            })
            .collect();
        let blockers: Vec<LosBlocker> = self
            .blockers
            .iter()
            .map(|b| b.translated(dx, dy))
            .collect();
        recompute_visibility(&mut self.grid, &sources, &blockers);
    }

    pub fn reveal_rect(&mut self, x: f64, y: f64, w: f64, h: f64) {
        let (x, y) = self.bounds.to_local(x, y);
        self.grid.reveal_rect(x, y, w, h);
        self.bump();
    }

    pub fn hide_rect(&mut self, x: f64, y: f64, w: f64, h: f64) {
        let (x, y) = self.bounds.to_local(x, y);
        self.grid.hide_rect(x, y, w, h);
        self.bump();
    }

    pub fn reveal_circle(&mut self, x: f64, y: f64, radius: f64) {
        let (x, y) = self.bounds.to_local(x, y);
        self.grid.reveal_circle(x, y, radius);
        self.bump();
    }

    pub fn hide_circle(&mut self, x: f64, y: f64, radius: f64) {
        let (x, y) = self.bounds.to_local(x, y);
        self.grid.hide_circle(x, y, radius);
        self.bump();
    }

    pub fn reveal_all(&mut self) {
        self.grid.reveal_all();
        self.bump();
    }

    /// Re-fog the whole map, including explored cells.
    pub fn reset(&mut self) {
        self.grid.reset();
        self.bump();
    }

    pub fn snapshot(&self) -> FogStateSnapshot {
        self.grid.snapshot()
    }

    /// Replace the grid from a snapshot. Invalid snapshots leave the store untouched.
    pub fn load(&mut self, snapshot: &FogStateSnapshot) -> Result<(), FogError> {
        self.grid.load(snapshot)?;
        self.bump();
        Ok(())
    }

    /// Map-open path: load a persisted snapshot, or fall back to all hidden.
    pub fn restore(&mut self, snapshot: &FogStateSnapshot) {
        if let Err(e) = self.grid.load(snapshot) {
            tracing::warn!(
                "Discarding stored fog for map {}: {}; starting fully hidden",
                self.map_id,
                e
            );
            self.grid.reset();
        }
        self.bump();
    }

    /// Apply an update from another peer under last-write-wins.
    ///
    /// Returns `Ok(false)` when the message is for another map or older than what
    /// was already applied. A delta must be based on the last applied update from
    /// the same sender, otherwise it fails with `DeltaBaseMismatch` and the caller
    /// should wait for a snapshot.
    pub fn apply_remote(&mut self, data: &FogSyncData) -> Result<bool, FogError> {
        if data.map_id != self.map_id {
            return Ok(false);
        }
        let stamp = data.stamp();
        if let Some(last) = &self.last_remote {
            if stamp < *last {
                tracing::debug!(
                    "Ignoring stale fog update for map {} from {} at {} (have {})",
                    self.map_id,
                    stamp.by,
                    stamp.at,
                    last.at
                );
                return Ok(false);
            }
        }

        match &data.payload {
            FogPayload::Snapshot { snapshot } => self.grid.load(snapshot)?,
            FogPayload::Delta {
                cols,
                rows,
                base,
                runs,
            } => {
                // A delta only makes sense on top of the update it was diffed against.
                let continues = self.last_remote.as_ref().is_some_and(|last| {
                    *last == stamp || (last.at == *base && last.by == data.updated_by)
                });
                if !continues {
                    return Err(FogError::DeltaBaseMismatch {
                        base: *base,
                        last: self.last_remote.as_ref().map(|last| last.at),
                    });
                }
                if (*cols, *rows) != self.grid.dims() {
                    return Err(FogError::InvalidSnapshot {
                        cols: *cols,
                        rows: *rows,
                        expected: *cols as usize * *rows as usize,
                        actual: self.grid.len(),
                    });
                }
                apply_runs(self.grid.cells_mut(), runs)?;
            }
        }

        self.settings = data.fog_settings.clone();
        self.last_remote = Some(stamp);
        self.bump();
        Ok(true)
    }
}
