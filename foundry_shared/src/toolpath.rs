//! Layer geometry shared between the toolpath decoder and the drivers that consume it.

use serde::{Deserialize, Serialize};

/// Default discretization: one unit is one micrometre.
pub const DEFAULT_UNITS_MM: f64 = 0.001;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentType {
    Hatch,
    Loop,
    Polyline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscretePoint {
    pub x: i64,
    pub y: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub segment_type: SegmentType,
    /// Hatches are stored as start/end pairs; loops and polylines as a chain.
    pub points: Vec<DiscretePoint>,
    /// Mark speed in mm/s, if the toolpath declared one.
    pub speed: Option<f64>,
    /// Laser power in watts, if the toolpath declared one.
    pub power: Option<f64>,
}

impl Segment {
    pub fn point_count(&self) -> usize {
        self.points.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerData {
    pub index: usize,
    pub z: i64,
    pub units_mm: f64,
    pub segments: Vec<Segment>,
}

impl LayerData {
    pub fn z_mm(&self) -> f64 {
        self.z as f64 * self.units_mm
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn point_mm(&self, point: &DiscretePoint) -> (f64, f64) {
        (point.x as f64 * self.units_mm, point.y as f64 * self.units_mm)
    }

    /// Total marked length in mm over every segment.
    pub fn mark_length_mm(&self) -> f64 {
        let mut total = 0.0;
        for segment in &self.segments {
            match segment.segment_type {
                SegmentType::Hatch => {
                    for pair in segment.points.chunks_exact(2) {
                        total += self.distance_mm(&pair[0], &pair[1]);
                    }
                }
                SegmentType::Loop | SegmentType::Polyline => {
                    for pair in segment.points.windows(2) {
                        total += self.distance_mm(&pair[0], &pair[1]);
                    }
                }
            }
        }
        total
    }

    fn distance_mm(&self, a: &DiscretePoint, b: &DiscretePoint) -> f64 {
        let dx = (b.x - a.x) as f64;
        let dy = (b.y - a.y) as f64;
        (dx * dx + dy * dy).sqrt() * self.units_mm
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hatch_length_counts_pairs_only() {
        let layer = LayerData {
            index: 0,
            z: 30,
            units_mm: DEFAULT_UNITS_MM,
            segments: vec![Segment {
                segment_type: SegmentType::Hatch,
                points: vec![
                    DiscretePoint { x: 0, y: 0 },
                    DiscretePoint { x: 1000, y: 0 },
                    DiscretePoint { x: 0, y: 100 },
                    DiscretePoint { x: 1000, y: 100 },
                ],
                speed: None,
                power: None,
            }],
        };
        assert!((layer.mark_length_mm() - 2.0).abs() < 1e-9);
        assert!((layer.z_mm() - 0.03).abs() < 1e-12);
    }
}
