//! Fog-of-war core: the cell grid, line-of-sight visibility, the per-map store
//! and realtime sync between a GM and players.

pub mod error;
pub mod fov;
pub mod geometry;
pub mod grid;
pub mod hub;
pub mod settings;
pub mod store;
pub mod sync;
pub mod throttle;
pub mod valkey;
pub mod wire;

pub use error::{FogError, SyncError};
pub use fov::{compute_visibility, recompute_visibility, VisionCone, VisionSource};
pub use geometry::{LosBlocker, Point, Segment};
pub use grid::{
    CellState, FogGrid, FogStateSnapshot, FogStats, MapBounds, EXPLORED, HIDDEN, MAX_GRID_DIM, VISIBLE,
};
pub use hub::{Channel, ChannelEvent, Hub, Presence, Role};
pub use settings::FogSettings;
pub use store::FogStore;
pub use sync::{BroadcastOutcome, FogSyncService, Identity, SubscriberId, SyncEvent, SyncOptions, SyncStatus};
pub use throttle::{PaintThrottle, DEFAULT_PAINT_INTERVAL};
pub use wire::{
    CellRun, FogPayload, FogSyncData, ResyncRequest, Stamp, FOG_RESYNC_EVENT, FOG_UPDATE_EVENT,
    SCHEMA_VERSION,
};
