//! Zoned grid primitives and spatial queries for the wastebots colony.
//!
//! The grid is a pure query surface: zone partitioning, the immutable
//! hazard field sampled at construction, Manhattan distances, 4-connected
//! neighborhoods, and a bidirectional cell-occupancy index. All mutation
//! of simulation state lives upstream in `wastebots-core`.

use ordered_float::OrderedFloat;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::Hash;
use thiserror::Error;

/// Distance reported when either endpoint of a query is undefined.
pub const UNREACHABLE: u32 = u32::MAX;

/// Reserved hazard value of the disposal cell; always greater than the
/// `[0, 1]` range every ordinary cell is sampled from.
pub const DISPOSAL_HAZARD: f32 = 2.0;

/// Errors emitted by grid construction.
#[derive(Debug, Error)]
pub enum GridError {
    /// Indicates layout parameters that cannot describe a grid.
    #[error("invalid layout: {0}")]
    InvalidLayout(&'static str),
}

/// Axis-aligned integer cell coordinate.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub struct Pos {
    pub x: u32,
    pub y: u32,
}

impl Pos {
    /// Construct a new position.
    #[must_use]
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
}

/// Manhattan distance between two cells.
#[must_use]
pub fn manhattan(a: Pos, b: Pos) -> u32 {
    a.x.abs_diff(b.x) + a.y.abs_diff(b.y)
}

/// Manhattan distance that treats a missing endpoint as infinitely far
/// away, so callers can exclude "no path" candidates with a plain `min`.
#[must_use]
pub fn manhattan_or_unreachable(a: Option<Pos>, b: Option<Pos>) -> u32 {
    match (a, b) {
        (Some(a), Some(b)) => manhattan(a, b),
        _ => UNREACHABLE,
    }
}

/// Partition of the grid columns into contiguous zone bands.
///
/// Bands have near-equal width; remainder columns are distributed to the
/// leftmost bands. Zone `i` is associated with the hazard range
/// `[i/N, (i+1)/N)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ZoneLayout {
    width: u32,
    height: u32,
    zones: u32,
}

impl ZoneLayout {
    /// Build a layout, validating the dimensions.
    pub fn new(width: u32, height: u32, zones: u32) -> Result<Self, GridError> {
        if width == 0 || height == 0 {
            return Err(GridError::InvalidLayout("grid dimensions must be non-zero"));
        }
        if zones == 0 {
            return Err(GridError::InvalidLayout("zone count must be non-zero"));
        }
        if zones > width {
            return Err(GridError::InvalidLayout(
                "zone count cannot exceed grid width",
            ));
        }
        Ok(Self {
            width,
            height,
            zones,
        })
    }

    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    #[must_use]
    pub const fn zones(&self) -> u32 {
        self.zones
    }

    /// Inclusive column span `(left, right)` of a zone band.
    #[must_use]
    pub fn span(&self, zone: u32) -> (u32, u32) {
        let base = self.width / self.zones;
        let remainder = self.width % self.zones;
        if zone < remainder {
            let left = zone * (base + 1);
            (left, left + base)
        } else {
            let left = remainder * (base + 1) + (zone - remainder) * base;
            (left, left + base - 1)
        }
    }

    /// Zone band containing column `x`.
    #[must_use]
    pub fn zone_of(&self, x: u32) -> u32 {
        let base = self.width / self.zones;
        let remainder = self.width % self.zones;
        let wide_cols = remainder * (base + 1);
        if x < wide_cols {
            x / (base + 1)
        } else {
            remainder + (x - wide_cols) / base
        }
    }

    /// Half-open hazard range `[lo, hi)` associated with a zone.
    #[must_use]
    pub fn hazard_range(&self, zone: u32) -> (f32, f32) {
        (
            zone as f32 / self.zones as f32,
            (zone + 1) as f32 / self.zones as f32,
        )
    }

    /// The single cell where fully-processed waste is retired: rightmost
    /// column, middle row.
    #[must_use]
    pub const fn disposal_cell(&self) -> Pos {
        Pos::new(self.width - 1, self.height / 2)
    }

    /// Whether a position lies on the grid.
    #[must_use]
    pub const fn contains(&self, pos: Pos) -> bool {
        pos.x < self.width && pos.y < self.height
    }

    /// In-bounds 4-connected neighbors of a cell.
    pub fn neighbors4(&self, pos: Pos) -> impl Iterator<Item = Pos> {
        let candidates = [
            pos.x.checked_sub(1).map(|x| Pos::new(x, pos.y)),
            (pos.x + 1 < self.width).then(|| Pos::new(pos.x + 1, pos.y)),
            pos.y.checked_sub(1).map(|y| Pos::new(pos.x, y)),
            (pos.y + 1 < self.height).then(|| Pos::new(pos.x, pos.y + 1)),
        ];
        candidates.into_iter().flatten()
    }
}

/// Immutable per-cell hazard scalar field, sampled once at construction.
///
/// Stored row-major (`y * width + x`); every cell holds a value drawn
/// uniformly from its zone's hazard range, except the disposal cell which
/// holds [`DISPOSAL_HAZARD`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HazardField {
    width: u32,
    height: u32,
    cells: Vec<f32>,
    disposal: Pos,
}

impl HazardField {
    /// Sample a field from the layout's zone bands.
    #[must_use]
    pub fn sample(layout: &ZoneLayout, rng: &mut dyn RngCore) -> Self {
        let width = layout.width();
        let height = layout.height();
        let mut cells = Vec::with_capacity((width as usize) * (height as usize));
        for _y in 0..height {
            for x in 0..width {
                let (lo, hi) = layout.hazard_range(layout.zone_of(x));
                cells.push(rng.random_range(lo..hi));
            }
        }
        let disposal = layout.disposal_cell();
        cells[(disposal.y as usize) * (width as usize) + (disposal.x as usize)] = DISPOSAL_HAZARD;
        Self {
            width,
            height,
            cells,
            disposal,
        }
    }

    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    #[must_use]
    pub fn cells(&self) -> &[f32] {
        &self.cells
    }

    #[must_use]
    pub const fn disposal_cell(&self) -> Pos {
        self.disposal
    }

    /// Hazard value at a cell, if in bounds.
    #[must_use]
    pub fn get(&self, pos: Pos) -> Option<f32> {
        if pos.x < self.width && pos.y < self.height {
            Some(self.cells[(pos.y as usize) * (self.width as usize) + (pos.x as usize)])
        } else {
            None
        }
    }

    /// Whether a cell's hazard is strictly below the given tolerance.
    #[must_use]
    pub fn tolerated(&self, pos: Pos, tolerance: f32) -> bool {
        self.get(pos).is_some_and(|value| value < tolerance)
    }

    /// Largest hazard value on the field (the disposal sentinel).
    #[must_use]
    pub fn peak(&self) -> f32 {
        self.cells
            .iter()
            .copied()
            .map(OrderedFloat)
            .max()
            .map_or(0.0, OrderedFloat::into_inner)
    }
}

/// Bidirectional cell-occupancy index.
///
/// Maps keys to their cell and cells to the keys they hold. Multiple keys
/// may share a cell; callers that need one-per-cell discipline check
/// [`OccupancyIndex::is_free`] before placing.
#[derive(Debug, Clone)]
pub struct OccupancyIndex<K: Copy + Eq + Hash> {
    cells: HashMap<Pos, Vec<K>>,
    positions: HashMap<K, Pos>,
}

impl<K: Copy + Eq + Hash> Default for OccupancyIndex<K> {
    fn default() -> Self {
        Self {
            cells: HashMap::new(),
            positions: HashMap::new(),
        }
    }
}

impl<K: Copy + Eq + Hash> OccupancyIndex<K> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Place (or relocate) a key at a cell.
    pub fn place(&mut self, key: K, pos: Pos) {
        if let Some(previous) = self.positions.insert(key, pos) {
            Self::remove_from_cell(&mut self.cells, key, previous);
        }
        self.cells.entry(pos).or_default().push(key);
    }

    /// Remove a key from the index, returning its last cell.
    pub fn displace(&mut self, key: K) -> Option<Pos> {
        let pos = self.positions.remove(&key)?;
        Self::remove_from_cell(&mut self.cells, key, pos);
        Some(pos)
    }

    fn remove_from_cell(cells: &mut HashMap<Pos, Vec<K>>, key: K, pos: Pos) {
        if let Some(keys) = cells.get_mut(&pos) {
            keys.retain(|existing| *existing != key);
            if keys.is_empty() {
                cells.remove(&pos);
            }
        }
    }

    /// Keys currently at a cell.
    #[must_use]
    pub fn at(&self, pos: Pos) -> &[K] {
        self.cells.get(&pos).map_or(&[], Vec::as_slice)
    }

    /// Cell a key currently occupies.
    #[must_use]
    pub fn position_of(&self, key: K) -> Option<Pos> {
        self.positions.get(&key).copied()
    }

    /// Whether no key occupies the cell.
    #[must_use]
    pub fn is_free(&self, pos: Pos) -> bool {
        self.at(pos).is_empty()
    }

    /// Number of indexed keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}
