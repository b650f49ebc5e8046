// src/toolpath/decoder.rs - Layer-indexed G-code toolpath decoder

use super::ToolpathError;
use foundry_shared::gcode::{parse_line, parse_metadata_comment};
use foundry_shared::toolpath::DEFAULT_UNITS_MM;
use foundry_shared::{DiscretePoint, LayerData, Segment, SegmentType, StreamReader};
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};

/// Random access to the layers of one toolpath. Implementations keep a read position,
/// so they are not reentrant; callers serialize access.
pub trait ToolpathDecoder: Send {
    fn layer_count(&self) -> usize;
    /// Layer height in discrete units.
    fn layer_z(&self, index: usize) -> Result<i64, ToolpathError>;
    fn read_layer(&mut self, index: usize) -> Result<LayerData, ToolpathError>;
    /// Size of one discrete unit in millimetres.
    fn units_mm(&self) -> f64;
    fn metadata(&self) -> &BTreeMap<String, String>;
}

const INCH_MM: f64 = 25.4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PathKind {
    Contour,
    Hatch,
}

/// Interpreter state that must be restored when decoding starts mid-file.
#[derive(Debug, Clone)]
struct ScanState {
    x: f64,
    y: f64,
    z: f64,
    inches: bool,
    relative: bool,
    speed: Option<f64>,
    power: Option<f64>,
    kind: PathKind,
}

impl Default for ScanState {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            z: 0.0,
            inches: false,
            relative: false,
            speed: None,
            power: None,
            kind: PathKind::Contour,
        }
    }
}

/// Result of applying one line to the state.
enum LineEffect {
    None,
    Jump,
    Mark { from: (f64, f64), to: (f64, f64) },
    TypeChange,
}

impl ScanState {
    fn scale(&self) -> f64 {
        if self.inches { INCH_MM } else { 1.0 }
    }

    fn apply(&mut self, line: &str) -> LineEffect {
        let parsed = parse_line(line);
        if let Some(comment) = parsed.comment {
            if let Some(kind) = comment.strip_prefix("TYPE:") {
                let kind = kind.trim().to_ascii_lowercase();
                self.kind = if kind.contains("fill") || kind.contains("hatch") || kind.contains("solid") {
                    PathKind::Hatch
                } else {
                    PathKind::Contour
                };
                return LineEffect::TypeChange;
            }
        }
        let Some((letter, code)) = parsed.command() else {
            return LineEffect::None;
        };
        match (letter, code) {
            ('G', 20) => self.inches = true,
            ('G', 21) => self.inches = false,
            ('G', 90) => self.relative = false,
            ('G', 91) => self.relative = true,
            ('G', 0) | ('G', 1) => {
                let scale = self.scale();
                let from = (self.x, self.y);
                let axis = |current: f64, word: Option<f64>, relative: bool| match word {
                    Some(v) if relative => current + v * scale,
                    Some(v) => v * scale,
                    None => current,
                };
                self.x = axis(self.x, parsed.word('X'), self.relative);
                self.y = axis(self.y, parsed.word('Y'), self.relative);
                self.z = axis(self.z, parsed.word('Z'), self.relative);
                if let Some(f) = parsed.word('F') {
                    // feed is per minute
                    self.speed = Some(f * scale / 60.0);
                }
                if let Some(s) = parsed.word('S') {
                    self.power = Some(s);
                }
                let to = (self.x, self.y);
                if code == 0 {
                    return LineEffect::Jump;
                }
                if to != from {
                    return LineEffect::Mark { from, to };
                }
            }
            ('M', 3) | ('M', 4) => {
                if let Some(s) = parsed.word('S') {
                    self.power = Some(s);
                }
            }
            _ => {}
        }
        LineEffect::None
    }
}

#[derive(Debug, Clone)]
struct LayerIndex {
    offset: u64,
    z_mm: Option<f64>,
    state: ScanState,
}

/// Decodes plain G-code. Layers start at `;LAYER:` comments when the file has them,
/// otherwise at the first marking move of every new Z height.
pub struct GcodeToolpathDecoder {
    reader: Box<dyn StreamReader>,
    layers: Vec<LayerIndex>,
    end_offset: u64,
    units_mm: f64,
    metadata: BTreeMap<String, String>,
}

impl GcodeToolpathDecoder {
    pub fn new(reader: Box<dyn StreamReader>) -> Result<Self, ToolpathError> {
        Self::with_units(reader, DEFAULT_UNITS_MM)
    }

    pub fn with_units(mut reader: Box<dyn StreamReader>, default_units_mm: f64) -> Result<Self, ToolpathError> {
        reader.seek(SeekFrom::Start(0))?;
        let mut buffered = BufReader::new(&mut reader);
        let mut state = ScanState::default();
        let mut metadata = BTreeMap::new();
        let mut marker_layers: Vec<LayerIndex> = Vec::new();
        let mut z_layers: Vec<LayerIndex> = Vec::new();
        let mut seen_move = false;
        let mut offset = 0u64;
        let mut raw = Vec::new();

        loop {
            raw.clear();
            let n = buffered.read_until(b'\n', &mut raw)?;
            if n == 0 {
                break;
            }
            let line = String::from_utf8_lossy(&raw);
            let trimmed = line.trim();

            if let Some(comment) = trimmed.strip_prefix(';').map(str::trim) {
                if comment.starts_with("LAYER:") {
                    marker_layers.push(LayerIndex {
                        offset,
                        z_mm: None,
                        state: state.clone(),
                    });
                } else if !seen_move && !comment.starts_with("TYPE:") {
                    if let Some((key, value)) = parse_metadata_comment(comment) {
                        metadata.insert(key.to_string(), value.to_string());
                    }
                }
            }

            let before = state.clone();
            match state.apply(trimmed) {
                LineEffect::Mark { .. } => {
                    seen_move = true;
                    let new_height = z_layers.last().and_then(|l| l.z_mm).map_or(true, |z| z != state.z);
                    if new_height {
                        z_layers.push(LayerIndex {
                            offset,
                            z_mm: Some(state.z),
                            state: before,
                        });
                    }
                    if let Some(layer) = marker_layers.last_mut() {
                        if layer.z_mm.is_none() {
                            layer.z_mm = Some(state.z);
                        }
                    }
                }
                LineEffect::Jump => seen_move = true,
                _ => {}
            }
            offset += n as u64;
        }
        drop(buffered);

        if z_layers.is_empty() {
            return Err(ToolpathError::InvalidFile("no toolpath layers found".to_string()));
        }
        let mut layers = if marker_layers.is_empty() { z_layers } else { marker_layers };
        for layer in &mut layers {
            if layer.z_mm.is_none() {
                layer.z_mm = Some(layer.state.z);
            }
        }

        let units_mm = metadata
            .get("units_mm")
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|u| *u > 0.0 && u.is_finite())
            .unwrap_or(default_units_mm);

        tracing::debug!(subsystem = "toolpath", "indexed {} layers over {} bytes", layers.len(), offset);
        Ok(Self {
            reader,
            layers,
            end_offset: offset,
            units_mm,
            metadata,
        })
    }

    fn discretize(&self, (x, y): (f64, f64)) -> DiscretePoint {
        DiscretePoint {
            x: (x / self.units_mm).round() as i64,
            y: (y / self.units_mm).round() as i64,
        }
    }

    fn check_index(&self, index: usize) -> Result<&LayerIndex, ToolpathError> {
        self.layers.get(index).ok_or(ToolpathError::LayerOutOfRange {
            index,
            count: self.layers.len(),
        })
    }
}

/// Accumulates marks into segments.
struct SegmentBuilder {
    segments: Vec<Segment>,
    current: Option<Segment>,
}

impl SegmentBuilder {
    fn new() -> Self {
        Self {
            segments: Vec::new(),
            current: None,
        }
    }

    fn close(&mut self) {
        if let Some(mut segment) = self.current.take() {
            if segment.segment_type != SegmentType::Hatch {
                let closed = segment.points.len() >= 4 && segment.points.first() == segment.points.last();
                segment.segment_type = if closed { SegmentType::Loop } else { SegmentType::Polyline };
            }
            self.segments.push(segment);
        }
    }

    /// Jumps end a contour; hatch lines are separated by jumps anyway.
    fn jump(&mut self) {
        if self.current.as_ref().is_some_and(|s| s.segment_type != SegmentType::Hatch) {
            self.close();
        }
    }

    fn mark(&mut self, kind: PathKind, from: DiscretePoint, to: DiscretePoint, speed: Option<f64>, power: Option<f64>) {
        let wanted = match kind {
            PathKind::Hatch => SegmentType::Hatch,
            PathKind::Contour => SegmentType::Polyline,
        };
        let extend = match &self.current {
            Some(seg) => {
                seg.segment_type == wanted
                    && seg.speed == speed
                    && seg.power == power
                    && (wanted == SegmentType::Hatch || seg.points.last() == Some(&from))
            }
            None => false,
        };
        if !extend {
            self.close();
            self.current = Some(Segment {
                segment_type: wanted,
                points: Vec::new(),
                speed,
                power,
            });
        }
        if let Some(seg) = self.current.as_mut() {
            if wanted == SegmentType::Hatch || seg.points.is_empty() {
                seg.points.push(from);
            }
            seg.points.push(to);
        }
    }

    fn finish(mut self) -> Vec<Segment> {
        self.close();
        self.segments
    }
}

impl ToolpathDecoder for GcodeToolpathDecoder {
    fn layer_count(&self) -> usize {
        self.layers.len()
    }

    fn layer_z(&self, index: usize) -> Result<i64, ToolpathError> {
        let layer = self.check_index(index)?;
        let z = layer.z_mm.unwrap_or(layer.state.z);
        Ok((z / self.units_mm).round() as i64)
    }

    fn read_layer(&mut self, index: usize) -> Result<LayerData, ToolpathError> {
        let layer = self.check_index(index)?.clone();
        let end = self.layers.get(index + 1).map_or(self.end_offset, |l| l.offset);
        let z = self.layer_z(index)?;

        self.reader.seek(SeekFrom::Start(layer.offset))?;
        let mut bytes = Vec::with_capacity((end - layer.offset) as usize);
        (&mut self.reader).take(end - layer.offset).read_to_end(&mut bytes)?;
        let text = String::from_utf8_lossy(&bytes);

        let mut state = layer.state;
        let mut builder = SegmentBuilder::new();
        for line in text.lines() {
            match state.apply(line.trim()) {
                LineEffect::Mark { from, to } => {
                    let from = self.discretize(from);
                    let to = self.discretize(to);
                    builder.mark(state.kind, from, to, state.speed, state.power);
                }
                LineEffect::Jump => builder.jump(),
                LineEffect::TypeChange => builder.close(),
                LineEffect::None => {}
            }
        }

        Ok(LayerData {
            index,
            z,
            units_mm: self.units_mm,
            segments: builder.finish(),
        })
    }

    fn units_mm(&self) -> f64 {
        self.units_mm
    }

    fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn decoder(text: &str) -> Result<GcodeToolpathDecoder, ToolpathError> {
        GcodeToolpathDecoder::new(Box::new(Cursor::new(text.as_bytes().to_vec())))
    }

    const TWO_LAYERS: &str = "\
; job_name = bracket
; layer_height = 0.03
G21
G90
;LAYER:0
G0 X0 Y0 Z0.03
;TYPE:WALL-OUTER
G1 X10 Y0 F6000 S150
G1 X10 Y10
G1 X0 Y10
G1 X0 Y0
;TYPE:FILL
G0 X1 Y1
G1 X9 Y1 S200
G0 X1 Y2
G1 X9 Y2
;LAYER:1
;TYPE:WALL-INNER
G0 Z0.06
G1 X5 Y5
";

    #[test]
    fn indexes_marker_layers_and_metadata() {
        let dec = decoder(TWO_LAYERS).unwrap();
        assert_eq!(dec.layer_count(), 2);
        assert_eq!(dec.metadata().get("job_name").map(String::as_str), Some("bracket"));
        assert_eq!(dec.layer_z(0).unwrap(), 30);
        assert_eq!(dec.layer_z(1).unwrap(), 60);
        assert!(matches!(dec.layer_z(2), Err(ToolpathError::LayerOutOfRange { index: 2, count: 2 })));
    }

    #[test]
    fn classifies_segments() {
        let mut dec = decoder(TWO_LAYERS).unwrap();
        let layer = dec.read_layer(0).unwrap();
        assert_eq!(layer.segments.len(), 2);
        let contour = &layer.segments[0];
        assert_eq!(contour.segment_type, SegmentType::Loop);
        assert_eq!(contour.points.len(), 5);
        assert_eq!(contour.speed, Some(100.0));
        assert_eq!(contour.power, Some(150.0));
        let hatch = &layer.segments[1];
        assert_eq!(hatch.segment_type, SegmentType::Hatch);
        assert_eq!(hatch.points.len(), 4);
        assert_eq!(hatch.points[0], DiscretePoint { x: 1000, y: 1000 });
        assert_eq!(hatch.power, Some(200.0));
    }

    #[test]
    fn later_layers_resume_state() {
        let mut dec = decoder(TWO_LAYERS).unwrap();
        let layer = dec.read_layer(1).unwrap();
        assert_eq!(layer.segments.len(), 1);
        let seg = &layer.segments[0];
        assert_eq!(seg.segment_type, SegmentType::Polyline);
        // starts where layer 0 left the head
        assert_eq!(seg.points[0], DiscretePoint { x: 9000, y: 2000 });
        // reading out of order gives the same result
        let again = dec.read_layer(0).unwrap();
        assert_eq!(again.segments.len(), 2);
    }

    #[test]
    fn splits_on_z_without_markers() {
        let text = "G1 Z0.1\nG1 X1 Y0\nG1 X1 Y1\nG1 Z0.2\nG1 X0 Y1\nG1 Z0.3\nG1 X0 Y0\n";
        let dec = decoder(text).unwrap();
        assert_eq!(dec.layer_count(), 3);
        assert_eq!(dec.layer_z(2).unwrap(), 300);
    }

    #[test]
    fn inches_are_converted() {
        let mut dec = decoder("G20\nG1 X1 Y0\n").unwrap();
        let layer = dec.read_layer(0).unwrap();
        assert_eq!(layer.segments[0].points[1], DiscretePoint { x: 25_400, y: 0 });
    }

    #[test]
    fn no_moves_is_invalid() {
        assert!(matches!(decoder("; just a comment\nM104 S200\n"), Err(ToolpathError::InvalidFile(_))));
        assert!(matches!(decoder(""), Err(ToolpathError::InvalidFile(_))));
    }

    #[test]
    fn declared_units_apply() {
        let dec = decoder("; units_mm = 0.01\nG1 Z0.5\nG1 X1\n").unwrap();
        assert_eq!(dec.units_mm(), 0.01);
        assert_eq!(dec.layer_z(0).unwrap(), 50);
    }
}
