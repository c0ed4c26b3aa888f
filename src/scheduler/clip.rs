/// Clip data model
///
/// A `ClipPlan` is what the planner produces: a slice of a source file with
/// fade edges but no timing. A `ClipInfo` is a plan the scheduler has
/// committed to: fade instants assigned, lifecycle state tracked, backend
/// handle attached once one exists.
use std::path::PathBuf;

use crate::backend::{ProbeId, SubgraphId, NS_PER_MS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClipId(pub u64);

impl std::fmt::Display for ClipId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "clip#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipState {
    /// Timing assigned, no sub-graph yet.
    Planned,
    /// Sub-graph requested; backend is decoding headers and seeking.
    Building,
    /// Backend signalled readiness; activation timer armed.
    Ready,
    /// Ports attached and unblocked; playing (or about to).
    Active,
    /// A newer clip took over; ramping out, completion probes armed.
    FadingOut,
    /// Both media types finished; teardown timer armed.
    CleaningUp,
}

/// One planned slice of a source file, not yet scheduled.
#[derive(Debug, Clone, PartialEq)]
pub struct ClipPlan {
    pub path: PathBuf,
    pub seek_ms: u64,
    /// Total on-screen duration including both fade edges.
    pub duration_ms: u64,
    pub fadein_ms: u64,
    pub fadeout_ms: u64,
    pub source_width: Option<u32>,
    pub source_height: Option<u32>,
    pub has_audio: bool,
}

/// A live clip inside the composition.
#[derive(Debug)]
pub struct ClipInfo {
    pub id: ClipId,
    pub plan: ClipPlan,
    pub state: ClipState,
    /// Absolute pipeline time the clip starts contributing to the output.
    pub fadein_t: u64,
    /// Absolute pipeline time its fade-out begins. Immutable once a later
    /// clip has been anchored against it.
    pub fadeout_t: u64,
    pub subgraph: Option<SubgraphId>,
    /// True segment-start pipeline time, captured from `SubgraphStarted`.
    pub segment_start_ns: Option<u64>,
    /// Pipeline time at which `SubgraphStarted` was observed.
    pub started_at_ns: Option<u64>,
    pub video_finished: bool,
    pub audio_finished: bool,
    pub cleanup_scheduled: bool,
    pub video_probe: Option<ProbeId>,
    pub audio_probe: Option<ProbeId>,
}

impl ClipInfo {
    pub fn new(id: ClipId, plan: ClipPlan, fadein_t: u64) -> Self {
        // The fade-out instant is where the NEXT clip's fade-in anchors:
        // fade-in plus the on-screen time that precedes the fade-out edge.
        let ms_between_fades = plan.duration_ms.saturating_sub(plan.fadeout_ms);
        let fadeout_t = fadein_t + ms_between_fades * NS_PER_MS;
        Self {
            id,
            plan,
            state: ClipState::Planned,
            fadein_t,
            fadeout_t,
            subgraph: None,
            segment_start_ns: None,
            started_at_ns: None,
            video_finished: false,
            audio_finished: false,
            cleanup_scheduled: false,
            video_probe: None,
            audio_probe: None,
        }
    }

    pub fn both_finished(&self) -> bool {
        self.video_finished && self.audio_finished
    }
}
