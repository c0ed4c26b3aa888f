/// Media Composition Backend contract
///
/// The engine drives decoding, compositing and encoding through this trait
/// only; handles are opaque indices, never references into a live media
/// graph. Asynchronous outcomes (readiness, timeline start, threshold
/// probes) come back as `BackendEvent`s over an mpsc channel so every state
/// transition still happens on the engine's single thread.
pub mod sim;

use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub const NS_PER_MS: u64 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubgraphId(pub u64);

impl fmt::Display for SubgraphId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subgraph#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProbeId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaPort {
    Video,
    Audio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputFormat {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

/// Centered source crop, in source pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Centered crop for the given source dimensions and crop fractions.
/// Returns `None` when no cropping is requested.
pub fn centered_crop(width: u32, height: u32, x_percent: f64, y_percent: f64) -> Option<CropRect> {
    if x_percent <= 0.0 && y_percent <= 0.0 {
        return None;
    }
    let crop_w = (width as f64 * x_percent / 2.0).floor() as u32;
    let crop_h = (height as f64 * y_percent / 2.0).floor() as u32;
    Some(CropRect {
        x: crop_w,
        y: crop_h,
        width: width.saturating_sub(crop_w * 2).max(2),
        height: height.saturating_sub(crop_h * 2).max(2),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaInfo {
    pub duration_ms: u64,
    pub width: u32,
    pub height: u32,
    pub has_audio: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubgraphSpec {
    pub path: PathBuf,
    pub seek_ms: u64,
    pub crop: Option<CropRect>,
}

/// One knot of a piecewise-linear mix-weight ramp, anchored to the absolute
/// pipeline clock (or, for audio ports, the sub-graph's segment timebase).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CurvePoint {
    pub at_ns: u64,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    /// Seek applied, output ports exist.
    SubgraphReady { id: SubgraphId },
    /// The audio timeline is actually flowing; carries the true
    /// segment-start pipeline time.
    SubgraphStarted { id: SubgraphId, segment_start_ns: u64 },
    /// A buffer with a timestamp beyond the probe's threshold was observed.
    ThresholdReached { probe: ProbeId },
    SubgraphError { id: SubgraphId, message: String },
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("unknown {0}")]
    UnknownSubgraph(SubgraphId),
    #[error("probe failed for {path}: {message}")]
    Probe { path: PathBuf, message: String },
    #[error("sub-graph creation failed: {0}")]
    Create(String),
    #[error("reconfigure failed: {0}")]
    Reconfigure(String),
}

pub trait CompositionBackend {
    /// Blocking metadata probe (duration, dimensions, audio presence).
    fn probe(&mut self, path: &Path) -> Result<MediaInfo, BackendError>;

    /// Start building a decode/scale/convert sub-graph. Emits
    /// `SubgraphReady` once the seek is applied and ports exist, then
    /// `SubgraphStarted` once its audio timeline flows.
    fn create_subgraph(&mut self, spec: SubgraphSpec) -> Result<SubgraphId, BackendError>;

    /// Insert the sub-graph's ports into the shared compositor/mixer.
    fn attach(&mut self, id: SubgraphId, z_order: u32, initial_weight: f64) -> Result<(), BackendError>;

    /// Release the pad blocks holding back a freshly attached sub-graph.
    fn unblock(&mut self, id: SubgraphId) -> Result<(), BackendError>;

    fn apply_weight_curve(
        &mut self,
        id: SubgraphId,
        port: MediaPort,
        points: &[CurvePoint],
    ) -> Result<(), BackendError>;

    /// One-shot probe: fires `ThresholdReached` when a buffer whose
    /// timestamp exceeds `at_ns` passes the port.
    fn add_threshold_probe(
        &mut self,
        id: SubgraphId,
        port: MediaPort,
        at_ns: u64,
    ) -> Result<ProbeId, BackendError>;

    fn remove_probe(&mut self, probe: ProbeId);

    fn detach(&mut self, id: SubgraphId) -> Result<(), BackendError>;

    fn destroy(&mut self, id: SubgraphId) -> Result<(), BackendError>;

    /// Monotonic nanoseconds since program start; frozen while paused.
    fn pipeline_time_ns(&self) -> u64;

    fn pause(&mut self);

    fn resume(&mut self);

    /// Apply new output dimensions/frame rate in place, without
    /// interrupting in-flight sub-graphs.
    fn reconfigure(&mut self, output: OutputFormat) -> Result<(), BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_crop_requested_yields_none() {
        assert_eq!(centered_crop(1920, 1080, 0.0, 0.0), None);
    }

    #[test]
    fn crop_is_centered_and_symmetric() {
        let crop = centered_crop(1920, 1080, 0.1, 0.0).unwrap();
        assert_eq!(crop.x, 96);
        assert_eq!(crop.y, 0);
        assert_eq!(crop.width, 1920 - 192);
        assert_eq!(crop.height, 1080);
    }

    #[test]
    fn extreme_crop_keeps_a_visible_sliver() {
        let crop = centered_crop(4, 4, 1.0, 1.0).unwrap();
        assert!(crop.width >= 2 && crop.height >= 2);
    }
}
