//! Synthetic powder-bed build files for the harness and tests

use std::fmt::Write as _;

/// Shape of a generated build: a square part with one contour and hatch lines per layer.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildFileSpec {
    pub name: String,
    pub layers: usize,
    pub layer_height_mm: f64,
    pub size_mm: f64,
    pub hatch_spacing_mm: f64,
    pub mark_speed_mm_s: f64,
    pub power_w: f64,
}

impl Default for BuildFileSpec {
    fn default() -> Self {
        Self {
            name: "cube".to_string(),
            layers: 5,
            layer_height_mm: 0.03,
            size_mm: 10.0,
            hatch_spacing_mm: 1.0,
            mark_speed_mm_s: 800.0,
            power_w: 180.0,
        }
    }
}

impl BuildFileSpec {
    pub fn with_layers(mut self, layers: usize) -> Self {
        self.layers = layers;
        self
    }

    /// Render the build as G-code with `;LAYER:` markers and header metadata.
    pub fn to_gcode(&self) -> String {
        let mut out = String::new();
        let feed = self.mark_speed_mm_s * 60.0;
        let s = self.size_mm;
        let _ = writeln!(out, "; name = {}", self.name);
        let _ = writeln!(out, "; layer_height = {}", self.layer_height_mm);
        let _ = writeln!(out, "; layers = {}", self.layers);
        let _ = writeln!(out, "G21");
        let _ = writeln!(out, "G90");
        for layer in 0..self.layers {
            let z = (layer + 1) as f64 * self.layer_height_mm;
            let _ = writeln!(out, ";LAYER:{}", layer);
            let _ = writeln!(out, "G0 Z{:.4}", z);
            let _ = writeln!(out, ";TYPE:WALL-OUTER");
            let _ = writeln!(out, "G0 X0 Y0");
            let _ = writeln!(out, "G1 X{s:.3} Y0 F{feed:.0} S{:.1}", self.power_w);
            let _ = writeln!(out, "G1 X{s:.3} Y{s:.3}");
            let _ = writeln!(out, "G1 X0 Y{s:.3}");
            let _ = writeln!(out, "G1 X0 Y0");
            let _ = writeln!(out, ";TYPE:FILL");
            let mut y = self.hatch_spacing_mm;
            let mut forward = true;
            while y < s {
                let (from, to) = if forward { (0.0, s) } else { (s, 0.0) };
                let _ = writeln!(out, "G0 X{from:.3} Y{y:.3}");
                let _ = writeln!(out, "G1 X{to:.3} Y{y:.3}");
                forward = !forward;
                y += self.hatch_spacing_mm;
            }
        }
        out
    }
}
