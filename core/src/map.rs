//! Static map of tree trunks and a grid index for gated nearest-tree association.
//!
//! Maps are exported from the survey tooling as a JSON array of objects:
//!
//! ```json
//! [
//!   {"object_number": 12, "class_estimate": 1, "position_estimate": [103.2, 51.9],
//!    "width_estimate": 0.11, "test_tree": false}
//! ]
//! ```
//!
//! Survey coordinates are large, so by default the map is shifted to put its minimum corner at a
//! small positive offset.
use crate::config::MapConfig;
use crate::error::{LocalizationError, Result};

use log::info;
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// One surveyed trunk.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MapTree {
    #[serde(default)]
    pub object_number: Option<u32>,
    pub x: f64,
    pub y: f64,
    /// Trunk class (size bucket) used for optional class-aware association.
    #[serde(default)]
    pub trunk_radius_class: Option<u8>,
    /// Trunk width in metres.
    #[serde(default)]
    pub width: Option<f64>,
    #[serde(default)]
    pub test_tree: bool,
}

impl MapTree {
    pub fn new(x: f64, y: f64) -> Self {
        MapTree {
            object_number: None,
            x,
            y,
            trunk_radius_class: None,
            width: None,
            test_tree: false,
        }
    }

    pub fn position(&self) -> Vector2<f64> {
        Vector2::new(self.x, self.y)
    }
}

#[derive(Deserialize)]
struct SurveyObject {
    #[serde(default)]
    object_number: Option<u32>,
    #[serde(default)]
    class_estimate: Option<u8>,
    position_estimate: [f64; 2],
    #[serde(default)]
    width_estimate: Option<f64>,
    #[serde(default)]
    test_tree: bool,
}

impl From<SurveyObject> for MapTree {
    fn from(obj: SurveyObject) -> Self {
        MapTree {
            object_number: obj.object_number,
            x: obj.position_estimate[0],
            y: obj.position_estimate[1],
            trunk_radius_class: obj.class_estimate,
            width: obj.width_estimate,
            test_tree: obj.test_tree,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MapBounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct OrchardMap {
    trees: Vec<MapTree>,
    origin_shift: Vector2<f64>,
}

impl OrchardMap {
    pub fn new(trees: Vec<MapTree>) -> Result<Self> {
        if trees.is_empty() {
            return Err(LocalizationError::config("map contains no trees"));
        }
        if trees.iter().any(|t| !t.x.is_finite() || !t.y.is_finite()) {
            return Err(LocalizationError::config("map contains a non-finite tree position"));
        }
        Ok(OrchardMap {
            trees,
            origin_shift: Vector2::zeros(),
        })
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let objects: Vec<SurveyObject> = serde_json::from_reader(reader)?;
        Self::new(objects.into_iter().map(MapTree::from).collect())
    }

    /// Load a survey map and apply the configured origin shift.
    pub fn from_json<P: AsRef<Path>>(path: P, config: &MapConfig) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            LocalizationError::config(format!("cannot open map '{}': {e}", path.display()))
        })?;
        let mut map = Self::from_reader(BufReader::new(file))?;
        if config.move_origin {
            map.move_origin(config.origin_offset);
        }
        info!(
            "Loaded {} trees from {} (origin shift {:.2}, {:.2})",
            map.len(),
            path.display(),
            map.origin_shift.x,
            map.origin_shift.y
        );
        Ok(map)
    }

    /// Translate every tree so the minimum x and y both land on `offset`. The applied shift
    /// accumulates in [`OrchardMap::origin_shift`].
    pub fn move_origin(&mut self, offset: f64) {
        let bounds = self.bounds();
        let shift = Vector2::new(offset - bounds.min_x, offset - bounds.min_y);
        for tree in &mut self.trees {
            tree.x += shift.x;
            tree.y += shift.y;
        }
        self.origin_shift += shift;
    }

    /// Total translation applied to the survey coordinates.
    pub fn origin_shift(&self) -> Vector2<f64> {
        self.origin_shift
    }

    pub fn trees(&self) -> &[MapTree] {
        &self.trees
    }

    pub fn len(&self) -> usize {
        self.trees.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trees.is_empty()
    }

    pub fn bounds(&self) -> MapBounds {
        self.trees.iter().fold(
            MapBounds {
                min_x: f64::INFINITY,
                min_y: f64::INFINITY,
                max_x: f64::NEG_INFINITY,
                max_y: f64::NEG_INFINITY,
            },
            |b, t| MapBounds {
                min_x: b.min_x.min(t.x),
                min_y: b.min_y.min(t.y),
                max_x: b.max_x.max(t.x),
                max_y: b.max_y.max(t.y),
            },
        )
    }
}

/// Uniform grid over the map with `bin_size` cells, each holding the indices of its trees.
#[derive(Clone, Debug)]
pub struct TreeIndex {
    bin_size: f64,
    cells: HashMap<(i64, i64), Vec<usize>>,
}

impl TreeIndex {
    pub fn build(map: &OrchardMap, bin_size: f64) -> Self {
        let mut cells: HashMap<(i64, i64), Vec<usize>> = HashMap::new();
        for (i, tree) in map.trees().iter().enumerate() {
            cells
                .entry(cell_of(tree.x, tree.y, bin_size))
                .or_default()
                .push(i);
        }
        TreeIndex { bin_size, cells }
    }

    pub fn bin_size(&self) -> f64 {
        self.bin_size
    }

    /// Nearest tree within `gate` metres of `point`, with its distance. With `class` set, trees
    /// of a different known class are skipped.
    pub fn nearest_within<'m>(
        &self,
        map: &'m OrchardMap,
        point: &Vector2<f64>,
        gate: f64,
        class: Option<u8>,
    ) -> Option<(&'m MapTree, f64)> {
        let (cx, cy) = cell_of(point.x, point.y, self.bin_size);
        let reach = (gate / self.bin_size).ceil() as i64;
        let gate_sq = gate * gate;
        let mut best: Option<(usize, f64)> = None;
        for dx in -reach..=reach {
            for dy in -reach..=reach {
                let Some(indices) = self.cells.get(&(cx + dx, cy + dy)) else {
                    continue;
                };
                for &i in indices {
                    let tree = &map.trees[i];
                    if let (Some(want), Some(have)) = (class, tree.trunk_radius_class)
                        && want != have
                    {
                        continue;
                    }
                    let d_sq = (tree.position() - point).norm_squared();
                    if d_sq <= gate_sq && best.is_none_or(|(_, b)| d_sq < b) {
                        best = Some((i, d_sq));
                    }
                }
            }
        }
        best.map(|(i, d_sq)| (&map.trees[i], d_sq.sqrt()))
    }
}

fn cell_of(x: f64, y: f64, bin_size: f64) -> (i64, i64) {
    ((x / bin_size).floor() as i64, (y / bin_size).floor() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn row_map() -> OrchardMap {
        OrchardMap::new((0..10).map(|i| MapTree::new(i as f64 * 2.0, 0.0)).collect()).unwrap()
    }

    #[test]
    fn empty_map_rejected() {
        assert!(matches!(
            OrchardMap::new(Vec::new()),
            Err(LocalizationError::Configuration(_))
        ));
    }

    #[test]
    fn nearest_within_gate() {
        let map = row_map();
        let index = TreeIndex::build(&map, 1.0);
        let (tree, d) = index
            .nearest_within(&map, &Vector2::new(4.3, 0.4), 1.0, None)
            .unwrap();
        assert_eq!(tree.x, 4.0);
        assert_approx_eq!(d, 0.5, 1e-12);
        assert!(
            index
                .nearest_within(&map, &Vector2::new(5.0, 3.0), 1.0, None)
                .is_none()
        );
    }

    /// A gate wider than the cell size still finds trees several cells away.
    #[test]
    fn gate_larger_than_bins() {
        let map = row_map();
        let index = TreeIndex::build(&map, 0.5);
        let (tree, _) = index
            .nearest_within(&map, &Vector2::new(7.0, 1.2), 2.0, None)
            .unwrap();
        assert!(tree.x == 6.0 || tree.x == 8.0);
    }

    #[test]
    fn class_filter_skips_other_classes() {
        let mut a = MapTree::new(0.0, 0.0);
        a.trunk_radius_class = Some(1);
        let mut b = MapTree::new(0.6, 0.0);
        b.trunk_radius_class = Some(2);
        let map = OrchardMap::new(vec![a, b]).unwrap();
        let index = TreeIndex::build(&map, 1.0);
        let (tree, _) = index
            .nearest_within(&map, &Vector2::new(0.1, 0.0), 1.0, Some(2))
            .unwrap();
        assert_eq!(tree.trunk_radius_class, Some(2));
    }

    #[test]
    fn survey_json_and_origin_shift() {
        let json = r#"[
            {"object_number": 1, "class_estimate": 0, "position_estimate": [100.0, 50.0], "width_estimate": 0.1, "test_tree": true},
            {"object_number": 2, "class_estimate": 2, "position_estimate": [104.0, 53.0]}
        ]"#;
        let mut map = OrchardMap::from_reader(json.as_bytes()).unwrap();
        assert_eq!(map.len(), 2);
        assert!(map.trees()[0].test_tree);
        map.move_origin(5.0);
        let b = map.bounds();
        assert_approx_eq!(b.min_x, 5.0, 1e-12);
        assert_approx_eq!(b.min_y, 5.0, 1e-12);
        assert_approx_eq!(b.max_x, 9.0, 1e-12);
        assert_approx_eq!(map.origin_shift().x, -95.0, 1e-12);
    }
}
