//! Event timeline and virtual clock shared by the simulated drivers

use crossbeam_channel::{Receiver, Sender, unbounded};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SimEventType {
    Connected { driver: String },
    Disconnected { driver: String },
    PowerChanged { driver: String, watts: f64 },
    LayerExposed { driver: String, layer: usize, segments: usize, mark_length_mm: f64 },
    AxisMoved { driver: String, axis: String, position_mm: f64 },
    Homed { driver: String },
    FrameCaptured { driver: String, frame: u64 },
    Fault { driver: String, message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct SimEvent {
    #[serde(with = "duration_secs")]
    pub timestamp: Duration,
    pub event_type: SimEventType,
}

impl SimEvent {
    /// One JSON object per line, for event logs.
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl PartialEq for SimEvent {
    fn eq(&self, other: &Self) -> bool {
        self.timestamp == other.timestamp
    }
}
impl Eq for SimEvent {}
impl PartialOrd for SimEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for SimEvent {
    // Reversed so the heap pops the earliest event first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.timestamp.cmp(&self.timestamp)
    }
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }
}

/// Orders events collected from several drivers by simulated time.
#[derive(Debug, Default)]
pub struct SimEventQueue {
    queue: BinaryHeap<SimEvent>,
}

impl SimEventQueue {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn push(&mut self, event: SimEvent) {
        self.queue.push(event);
    }
    pub fn pop(&mut self) -> Option<SimEvent> {
        self.queue.pop()
    }
    pub fn len(&self) -> usize {
        self.queue.len()
    }
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
    pub fn drain_ordered(&mut self) -> Vec<SimEvent> {
        let mut out = Vec::with_capacity(self.queue.len());
        while let Some(e) = self.queue.pop() {
            out.push(e);
        }
        out
    }
}

/// Per-driver simulated clock.
#[derive(Debug, Clone, Default)]
pub struct SimClock {
    pub current_time: Duration,
}

impl SimClock {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn advance(&mut self, dt: Duration) {
        self.current_time += dt;
    }
    pub fn advance_secs(&mut self, seconds: f64) {
        if seconds.is_finite() && seconds > 0.0 {
            self.current_time += Duration::from_secs_f64(seconds);
        }
    }
}

/// Fan-in channel the drivers publish to. Sending never blocks; a dropped
/// receiver just discards events.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Option<Sender<SimEvent>>,
}

impl EventSink {
    pub fn channel() -> (Self, Receiver<SimEvent>) {
        let (tx, rx) = unbounded();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, clock: &SimClock, event_type: SimEventType) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(SimEvent {
                timestamp: clock.current_time,
                event_type,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_pops_earliest_first() {
        let mut queue = SimEventQueue::new();
        for secs in [3u64, 1, 2] {
            queue.push(SimEvent {
                timestamp: Duration::from_secs(secs),
                event_type: SimEventType::Homed { driver: "z".into() },
            });
        }
        let order: Vec<u64> = queue.drain_ordered().iter().map(|e| e.timestamp.as_secs()).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn sink_forwards_events() {
        let (sink, rx) = EventSink::channel();
        let mut clock = SimClock::new();
        clock.advance_secs(1.5);
        sink.emit(&clock, SimEventType::Homed { driver: "platform".into() });
        let event = rx.try_recv().unwrap();
        assert_eq!(event.timestamp, Duration::from_millis(1500));
        let line = event.to_json_line().unwrap();
        assert!(line.contains("\"type\":\"homed\""));
    }
}
