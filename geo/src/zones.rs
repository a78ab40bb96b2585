//! Campus zone layouts
//!
//! A layout is a square footprint centred on a point, split into a 3x3
//! grid. A template names some of the cells; everything else, and
//! everything beyond the footprint, is "outside".

use crate::{GeoError, Position, Result};
use serde::{Deserialize, Serialize};

/// Small integer id for a zone; 0 is reserved for outside
pub type ZoneId = u8;

pub const OUTSIDE_ZONE: &str = "Outside Campus";
pub const OUTSIDE_ZONE_ID: ZoneId = 0;

const GRID: usize = 3;
const METERS_PER_DEGREE: f64 = 111_000.0;

/// One named cell of the layout template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionTemplate {
    pub name: String,
    pub color: String,
    pub row: usize,
    pub col: usize,
}

impl SectionTemplate {
    fn new(name: &str, color: &str, row: usize, col: usize) -> Self {
        Self {
            name: name.to_string(),
            color: color.to_string(),
            row,
            col,
        }
    }
}

/// Layout generation parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayoutConfig {
    /// Side of the square footprint in degrees
    pub footprint_deg: f64,
    /// Display size label for each zone, independent of the generated bounds
    pub nominal_size_m: f64,
    /// Named cells; ids are assigned in this order starting at 1
    pub sections: Vec<SectionTemplate>,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            footprint_deg: 0.000324,
            nominal_size_m: 12.0,
            sections: vec![
                SectionTemplate::new("Main Building", "#e74c3c", 0, 1),
                SectionTemplate::new("Library", "#3498db", 0, 2),
                SectionTemplate::new("New Building", "#2ecc71", 1, 0),
                SectionTemplate::new("Canteen", "#f39c12", 1, 1),
                SectionTemplate::new("Sports Complex", "#9b59b6", 1, 2),
                SectionTemplate::new("Admin Block", "#1abc9c", 2, 1),
            ],
        }
    }
}

/// Axis-aligned rectangle in degrees.
///
/// Half-open on both axes (`min <= v < max`) so cells sharing an edge
/// never both claim a point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl Bounds {
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        self.min_lat <= lat && lat < self.max_lat && self.min_lon <= lon && lon < self.max_lon
    }

    /// True when the interiors of the two rectangles intersect
    pub fn overlaps(&self, other: &Bounds) -> bool {
        self.min_lat < other.max_lat
            && other.min_lat < self.max_lat
            && self.min_lon < other.max_lon
            && other.min_lon < self.max_lon
    }

    pub fn center(&self) -> Position {
        Position::new(
            (self.min_lat + self.max_lat) / 2.0,
            (self.min_lon + self.max_lon) / 2.0,
        )
    }
}

/// A named rectangular zone
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub id: ZoneId,
    pub name: String,
    pub color: String,
    pub bounds: Bounds,
    pub center: Position,
    pub nominal_size_m: f64,
}

/// Generated layout for one user's campus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneLayout {
    pub center: Position,
    pub footprint_deg: f64,
    pub zones: Vec<Zone>,
}

impl ZoneLayout {
    /// Generate a layout centred on `center`
    pub fn generate(center: Position, config: &LayoutConfig) -> Result<Self> {
        if !(config.footprint_deg.is_finite() && config.footprint_deg > 0.0) {
            return Err(GeoError::InvalidLayout(format!(
                "footprint {} must be positive",
                config.footprint_deg
            )));
        }
        if config.sections.len() > usize::from(ZoneId::MAX) {
            return Err(GeoError::InvalidLayout("too many sections".to_string()));
        }

        let mut taken = [[false; GRID]; GRID];
        for section in &config.sections {
            if section.row >= GRID || section.col >= GRID {
                return Err(GeoError::InvalidLayout(format!(
                    "section {} at ({}, {}) is outside the {}x{} grid",
                    section.name, section.row, section.col, GRID, GRID
                )));
            }
            if std::mem::replace(&mut taken[section.row][section.col], true) {
                return Err(GeoError::InvalidLayout(format!(
                    "cell ({}, {}) is assigned twice",
                    section.row, section.col
                )));
            }
            if section.name == OUTSIDE_ZONE {
                return Err(GeoError::InvalidLayout(format!("{} is reserved", OUTSIDE_ZONE)));
            }
        }

        let cell = config.footprint_deg / GRID as f64;
        let start_lat = center.lat + config.footprint_deg / 2.0;
        let start_lon = center.lon - config.footprint_deg / 2.0;

        let zones: Vec<Zone> = config
            .sections
            .iter()
            .enumerate()
            .map(|(i, section)| {
                let bounds = Bounds {
                    min_lat: start_lat - (section.row + 1) as f64 * cell,
                    max_lat: start_lat - section.row as f64 * cell,
                    min_lon: start_lon + section.col as f64 * cell,
                    max_lon: start_lon + (section.col + 1) as f64 * cell,
                };
                Zone {
                    id: (i + 1) as ZoneId,
                    name: section.name.clone(),
                    color: section.color.clone(),
                    bounds,
                    center: bounds.center(),
                    nominal_size_m: config.nominal_size_m,
                }
            })
            .collect();

        tracing::info!(
            "Generated layout with {} zones around ({:.6}, {:.6})",
            zones.len(),
            center.lat,
            center.lon
        );

        Ok(Self {
            center,
            footprint_deg: config.footprint_deg,
            zones,
        })
    }

    /// Zone name for a position, or [`OUTSIDE_ZONE`]
    pub fn classify(&self, lat: f64, lon: f64) -> &str {
        classify(lat, lon, &self.zones)
    }

    /// Zone id for a position, or [`OUTSIDE_ZONE_ID`]
    pub fn classify_id(&self, lat: f64, lon: f64) -> ZoneId {
        self.zones
            .iter()
            .find(|z| z.bounds.contains(lat, lon))
            .map(|z| z.id)
            .unwrap_or(OUTSIDE_ZONE_ID)
    }

    /// Map a zone name to its id; unknown names map to outside
    pub fn zone_id(&self, name: &str) -> ZoneId {
        self.zones
            .iter()
            .find(|z| z.name == name)
            .map(|z| z.id)
            .unwrap_or(OUTSIDE_ZONE_ID)
    }

    pub fn zone_name(&self, id: ZoneId) -> &str {
        self.zones
            .iter()
            .find(|z| z.id == id)
            .map(|z| z.name.as_str())
            .unwrap_or(OUTSIDE_ZONE)
    }

    /// Approximate side of the footprint in meters
    pub fn total_size_m(&self) -> f64 {
        self.footprint_deg * METERS_PER_DEGREE
    }
}

/// Name of the first zone containing the point, or [`OUTSIDE_ZONE`]
pub fn classify(lat: f64, lon: f64, zones: &[Zone]) -> &str {
    zones
        .iter()
        .find(|z| z.bounds.contains(lat, lon))
        .map(|z| z.name.as_str())
        .unwrap_or(OUTSIDE_ZONE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> ZoneLayout {
        ZoneLayout::generate(Position::new(10.0, 10.0), &LayoutConfig::default()).unwrap()
    }

    #[test]
    fn test_generates_template_zones() {
        let layout = layout();
        let names: Vec<&str> = layout.zones.iter().map(|z| z.name.as_str()).collect();
        assert_eq!(
            names,
            ["Main Building", "Library", "New Building", "Canteen", "Sports Complex", "Admin Block"]
        );
        let ids: Vec<ZoneId> = layout.zones.iter().map(|z| z.id).collect();
        assert_eq!(ids, [1, 2, 3, 4, 5, 6]);
        assert!(layout.zones.iter().all(|z| z.nominal_size_m == 12.0));
        assert!((layout.total_size_m() - 35.964).abs() < 1e-9);
    }

    #[test]
    fn test_zones_never_overlap() {
        let layout = layout();
        for (i, a) in layout.zones.iter().enumerate() {
            for b in layout.zones.iter().skip(i + 1) {
                assert!(!a.bounds.overlaps(&b.bounds), "{} overlaps {}", a.name, b.name);
            }
        }
    }

    #[test]
    fn test_center_point_is_canteen() {
        let layout = layout();
        assert_eq!(layout.classify(10.0, 10.0), "Canteen");
        assert_eq!(layout.classify_id(10.0, 10.0), 4);
    }

    #[test]
    fn test_zone_centers_classify_to_themselves() {
        let layout = layout();
        for zone in &layout.zones {
            assert_eq!(layout.classify(zone.center.lat, zone.center.lon), zone.name);
        }
    }

    #[test]
    fn test_classification_is_total() {
        let layout = layout();
        let step = layout.footprint_deg / 20.0;
        let names: Vec<&str> = layout.zones.iter().map(|z| z.name.as_str()).collect();

        for i in -15..=15 {
            for j in -15..=15 {
                let lat = 10.0 + i as f64 * step;
                let lon = 10.0 + j as f64 * step;
                let hits = layout.zones.iter().filter(|z| z.bounds.contains(lat, lon)).count();
                assert!(hits <= 1);

                let name = layout.classify(lat, lon);
                assert!(name == OUTSIDE_ZONE || names.contains(&name));
                assert_eq!(hits == 0, name == OUTSIDE_ZONE);
            }
        }
    }

    #[test]
    fn test_unpopulated_corner_is_outside() {
        let layout = layout();
        let cell = layout.footprint_deg / 3.0;
        // Top-left cell (row 0, col 0) is not in the template
        assert_eq!(layout.classify(10.0 + cell, 10.0 - cell), OUTSIDE_ZONE);
        assert_eq!(layout.classify(11.0, 11.0), OUTSIDE_ZONE);
        assert_eq!(layout.classify_id(11.0, 11.0), OUTSIDE_ZONE_ID);
    }

    #[test]
    fn test_name_id_mapping() {
        let layout = layout();
        assert_eq!(layout.zone_id("Library"), 2);
        assert_eq!(layout.zone_id(OUTSIDE_ZONE), OUTSIDE_ZONE_ID);
        assert_eq!(layout.zone_id("Nowhere"), OUTSIDE_ZONE_ID);
        assert_eq!(layout.zone_name(6), "Admin Block");
        assert_eq!(layout.zone_name(0), OUTSIDE_ZONE);
    }

    #[test]
    fn test_rejects_duplicate_cells() {
        let mut config = LayoutConfig::default();
        config.sections.push(SectionTemplate::new("Annex", "#000000", 1, 1));
        assert!(ZoneLayout::generate(Position::new(0.0, 0.0), &config).is_err());

        let mut config = LayoutConfig::default();
        config.sections[0].row = 3;
        assert!(ZoneLayout::generate(Position::new(0.0, 0.0), &config).is_err());
    }

    #[test]
    fn test_layout_serializes() {
        let layout = layout();
        let json = serde_json::to_string(&layout).unwrap();
        let back: ZoneLayout = serde_json::from_str(&json).unwrap();
        assert_eq!(back.classify(10.0, 10.0), "Canteen");
    }
}
