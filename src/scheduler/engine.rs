/// Timeline Scheduler & Clip Lifecycle Manager
///
/// One task owns every piece of scheduler state: the active clip set, the
/// plan queue, the selector's fairness counters and the timer queue. All
/// mutations happen between `await` points of a single `tokio::select!`
/// loop, so no locking is needed — only re-validation, because a timer or
/// backend event may arrive for a clip that is already gone.
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use thiserror::Error;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use crate::activity::ActivityTracker;
use crate::backend::{
    centered_crop, BackendError, BackendEvent, CompositionBackend, CurvePoint, MediaPort, ProbeId,
    SubgraphId, SubgraphSpec, NS_PER_MS,
};
use crate::library::{self, ScanError};
use crate::scheduler::clip::{ClipId, ClipInfo, ClipPlan, ClipState};
use crate::scheduler::planner::{plan_clips, PlanError};
use crate::scheduler::selector::{FileSelector, SelectError};
use crate::scheduler::timers::{TimerKind, TimerQueue};
use crate::settings::Settings;

const TICK_MIN_MS: u64 = 5;
const TICK_MAX_MS: u64 = 2_000;
const TICK_SLACK_MS: u64 = 5;
const PAUSED_TICK_MS: u64 = 1_000;
const FALLBACK_TICK_MS: u64 = 2_000;
const SWAP_DISPATCH_MS: u64 = 5;
const IDLE_SLEEP_MS: u64 = 1_000;

// ── Control plane ─────────────────────────────────────────────────────────────

pub enum ControlMessage {
    /// Replace the settings snapshot; applied between ticks.
    UpdateSettings(Box<Settings>),
    Shutdown,
}

/// Cheap cloneable handle the embedding process uses to talk to the engine.
#[derive(Clone)]
pub struct EngineHandle {
    tx: UnboundedSender<ControlMessage>,
}

impl EngineHandle {
    pub fn new(tx: UnboundedSender<ControlMessage>) -> Self {
        Self { tx }
    }

    pub fn update_settings(&self, settings: Settings) {
        let _ = self.tx.send(ControlMessage::UpdateSettings(Box::new(settings)));
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(ControlMessage::Shutdown);
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error(transparent)]
    Select(#[from] SelectError),
    #[error("clip planning failed: {0}")]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// A broadcast with nothing eligible to play cannot continue; everything
    /// else re-arms the tick and tries the next file.
    fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Scan(_) | EngineError::Select(_))
    }
}

// ── Engine ────────────────────────────────────────────────────────────────────

pub struct Engine<B: CompositionBackend> {
    backend: B,
    settings: Arc<Settings>,
    activity: ActivityTracker,
    selector: FileSelector,
    rng: StdRng,
    plan_queue: VecDeque<ClipPlan>,
    clips: HashMap<ClipId, ClipInfo>,
    subgraphs: HashMap<SubgraphId, ClipId>,
    probes: HashMap<ProbeId, (ClipId, MediaPort)>,
    timers: TimerQueue,
    /// Monotonic wall milliseconds since `run()` started.
    clock_ms: u64,
    next_clip: u64,
    z_order: u32,
    paused: bool,
}

impl<B: CompositionBackend> Engine<B> {
    pub fn new(backend: B, settings: Settings, activity: ActivityTracker, rng: StdRng) -> Self {
        Self {
            backend,
            settings: Arc::new(settings),
            activity,
            selector: FileSelector::new(),
            rng,
            plan_queue: VecDeque::new(),
            clips: HashMap::new(),
            subgraphs: HashMap::new(),
            probes: HashMap::new(),
            timers: TimerQueue::new(),
            clock_ms: 0,
            next_clip: 0,
            // z-order 0 belongs to the backend's base layer.
            z_order: 1,
            paused: false,
        }
    }

    fn now_ns(&self) -> u64 {
        self.backend.pipeline_time_ns()
    }

    // ── Timeline Scheduler ────────────────────────────────────────────────

    /// One scheduler tick. Re-arms itself; fatal errors propagate.
    pub fn tick(&mut self) -> Result<(), EngineError> {
        match self.activity.seconds_since_activity() {
            Ok(s) if s > self.settings.auto_pause_s => {
                if !self.paused {
                    log::info!("pausing composition after {s} s of inactivity");
                    self.backend.pause();
                    self.paused = true;
                }
                self.timers.schedule(self.clock_ms, PAUSED_TICK_MS, TimerKind::Tick);
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => log::warn!("activity read failed ({e}); assuming no update"),
        }

        if self.paused {
            log::info!("resuming composition");
            self.backend.resume();
            self.paused = false;
        }

        match self.prepare_next() {
            Ok(lead_ns) => {
                let lead_ms = (lead_ns / NS_PER_MS as i64).clamp(TICK_MIN_MS as i64, TICK_MAX_MS as i64);
                self.timers.schedule(self.clock_ms, lead_ms as u64 + TICK_SLACK_MS, TimerKind::Tick);
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                log::error!("tick failed ({e}); retrying in {FALLBACK_TICK_MS} ms");
                self.timers.schedule(self.clock_ms, FALLBACK_TICK_MS, TimerKind::Tick);
                Ok(())
            }
        }
    }

    /// Prepare the next clip if the lead time before the furthest fade-out
    /// has shrunk below the preparation budget. Returns the remaining lead
    /// time (ns) after subtracting that budget.
    fn prepare_next(&mut self) -> Result<i64, EngineError> {
        let prep_ns = ((self.settings.subgraph_build_ms + self.settings.preroll_ms) * NS_PER_MS) as i64;
        let now = self.now_ns() as i64;

        let furthest = self.clips.values().map(|c| c.fadeout_t).max();
        let anchor = match furthest {
            None => (now + prep_ns) as u64,
            Some(fadeout_t) => {
                let remaining = fadeout_t as i64 - now;
                if remaining > prep_ns {
                    return Ok(remaining - prep_ns);
                }
                fadeout_t
            }
        };

        let fadeout_t = self.create_clip(anchor)?;
        Ok(fadeout_t as i64 - self.now_ns() as i64 - prep_ns)
    }

    /// Pop the next plan, refilling the queue from selector + planner.
    fn next_plan(&mut self) -> Result<ClipPlan, EngineError> {
        if self.plan_queue.is_empty() {
            let listing = library::scan(&self.settings.input_dir, &self.settings.exclude)?;
            let path = self.selector.select(&listing, &self.settings, &mut self.rng)?;
            let media = self.backend.probe(&path)?;
            let plans = plan_clips(&path, &media, &self.settings, &mut self.rng)?;
            log::info!("planned {} clip(s) from {}", plans.len(), path.display());
            self.plan_queue.extend(plans);
        }
        self.plan_queue.pop_front().ok_or(EngineError::Select(SelectError::NoEligibleFiles))
    }

    /// Create the next clip anchored so its fade-in lands at `fadein_t`.
    /// Returns the new clip's fade-out instant.
    fn create_clip(&mut self, fadein_t: u64) -> Result<u64, EngineError> {
        let plan = self.next_plan()?;
        self.next_clip += 1;
        let id = ClipId(self.next_clip);

        let crop = match (plan.source_width, plan.source_height) {
            (Some(w), Some(h)) => {
                centered_crop(w, h, self.settings.crop_x_percent, self.settings.crop_y_percent)
            }
            _ => None,
        };

        let mut clip = ClipInfo::new(id, plan, fadein_t);
        let spec = SubgraphSpec {
            path: clip.plan.path.clone(),
            seek_ms: clip.plan.seek_ms,
            crop,
        };
        let subgraph = self.backend.create_subgraph(spec)?;
        clip.subgraph = Some(subgraph);
        clip.state = ClipState::Building;

        log::info!(
            "{id}: building {} (seek {} ms, {} ms on screen)",
            clip.plan.path.display(),
            clip.plan.seek_ms,
            clip.plan.duration_ms
        );

        let fadeout_t = clip.fadeout_t;
        self.subgraphs.insert(subgraph, id);
        self.clips.insert(id, clip);
        Ok(fadeout_t)
    }

    // ── Backend events ────────────────────────────────────────────────────

    pub fn on_backend_event(&mut self, event: BackendEvent) {
        match event {
            BackendEvent::SubgraphReady { id } => self.on_subgraph_ready(id),
            BackendEvent::SubgraphStarted { id, segment_start_ns } => {
                self.on_subgraph_started(id, segment_start_ns)
            }
            BackendEvent::ThresholdReached { probe } => self.on_threshold(probe),
            BackendEvent::SubgraphError { id, message } => self.on_subgraph_error(id, message),
        }
    }

    fn clip_of(&self, id: SubgraphId) -> Option<ClipId> {
        self.subgraphs.get(&id).copied()
    }

    fn on_subgraph_ready(&mut self, id: SubgraphId) {
        let Some(clip_id) = self.clip_of(id) else {
            log::debug!("ready signal for stale {id}");
            return;
        };
        let now = self.now_ns();
        let preroll_ms = self.settings.preroll_ms;
        let clock_ms = self.clock_ms;

        let Some(clip) = self.clips.get_mut(&clip_id) else { return };
        if clip.state != ClipState::Building {
            log::warn!("{clip_id}: ready signal in state {:?}, ignoring", clip.state);
            return;
        }
        clip.state = ClipState::Ready;

        // Activate one pre-roll before the fade-in instant.
        let ms_till_fadein = clip.fadein_t.saturating_sub(now) / NS_PER_MS;
        let delay = ms_till_fadein.saturating_sub(preroll_ms).max(TICK_MIN_MS);
        self.timers.schedule(clock_ms, delay, TimerKind::Activate(clip_id));
    }

    fn on_subgraph_started(&mut self, id: SubgraphId, segment_start_ns: u64) {
        let Some(clip_id) = self.clip_of(id) else {
            log::debug!("started signal for stale {id}");
            return;
        };
        let now = self.now_ns();
        let clock_ms = self.clock_ms;
        let Some(clip) = self.clips.get_mut(&clip_id) else { return };
        clip.segment_start_ns = Some(segment_start_ns);
        clip.started_at_ns = Some(now);
        self.timers.schedule(clock_ms, SWAP_DISPATCH_MS, TimerKind::BeginFade(clip_id));
    }

    fn on_threshold(&mut self, probe: ProbeId) {
        let Some((clip_id, port)) = self.probes.remove(&probe) else {
            log::debug!("threshold for removed probe {probe:?}");
            return;
        };
        if let Some(clip) = self.clips.get_mut(&clip_id) {
            match port {
                MediaPort::Video => {
                    clip.video_finished = true;
                    clip.video_probe = None;
                }
                MediaPort::Audio => {
                    clip.audio_finished = true;
                    clip.audio_probe = None;
                }
            }
        }
        self.try_schedule_cleanup(clip_id);
    }

    fn on_subgraph_error(&mut self, id: SubgraphId, message: String) {
        let Some(clip_id) = self.clip_of(id) else { return };
        log::error!("{clip_id}: backend error, discarding clip: {message}");
        self.cleanup_clip(clip_id);
    }

    // ── Timers ────────────────────────────────────────────────────────────

    pub fn on_timer(&mut self, kind: TimerKind) -> Result<(), EngineError> {
        match kind {
            TimerKind::Tick => self.tick(),
            TimerKind::Activate(id) => {
                self.activate_clip(id);
                Ok(())
            }
            TimerKind::BeginFade(id) => {
                self.begin_crossfade(id);
                Ok(())
            }
            TimerKind::Cleanup(id) => {
                self.cleanup_clip(id);
                Ok(())
            }
            TimerKind::ForceCleanup(id) => {
                self.force_cleanup(id);
                Ok(())
            }
        }
    }

    // ── Clip lifecycle ────────────────────────────────────────────────────

    /// Attach the clip's ports to the compositor/mixer at zero weight and
    /// release its pad blocks. The backend answers with `SubgraphStarted`.
    fn activate_clip(&mut self, clip_id: ClipId) {
        let (subgraph, state) = match self.clips.get(&clip_id) {
            Some(c) => (c.subgraph, c.state),
            None => {
                log::debug!("activate: {clip_id} is gone");
                return;
            }
        };
        if state != ClipState::Ready {
            log::warn!("{clip_id}: activation in state {state:?}, ignoring");
            return;
        }
        let Some(subgraph) = subgraph else { return };

        let z = self.z_order;
        let result = self
            .backend
            .attach(subgraph, z, 0.0)
            .and_then(|_| self.backend.unblock(subgraph));
        match result {
            Ok(()) => {
                self.z_order += 1;
                if let Some(clip) = self.clips.get_mut(&clip_id) {
                    clip.state = ClipState::Active;
                }
            }
            Err(e) => {
                log::error!("{clip_id}: attach failed, discarding clip: {e}");
                self.cleanup_clip(clip_id);
            }
        }
    }

    /// Ramp the new clip in and, if a previous clip was anchored to this
    /// fade-in instant, ramp it out and arm its completion probes. Both
    /// ramps share their start and end pipeline instants.
    fn begin_crossfade(&mut self, new_id: ClipId) {
        let (new_subgraph, fadein_t, transition_ns, has_audio, segment_start, started_at) =
            match self.clips.get(&new_id) {
                Some(c) if c.state == ClipState::Active => (
                    c.subgraph,
                    c.fadein_t,
                    (c.plan.fadein_ms * NS_PER_MS).max(1),
                    c.plan.has_audio,
                    c.segment_start_ns.unwrap_or(0),
                    c.started_at_ns.unwrap_or(c.fadein_t),
                ),
                Some(c) => {
                    log::warn!("{new_id}: crossfade in state {:?}, ignoring", c.state);
                    return;
                }
                None => {
                    log::debug!("crossfade: {new_id} is gone");
                    return;
                }
            };
        let Some(new_subgraph) = new_subgraph else { return };

        let video_ramp = [
            CurvePoint { at_ns: fadein_t, weight: 0.0 },
            CurvePoint { at_ns: fadein_t + transition_ns, weight: 1.0 },
        ];
        if let Err(e) = self.backend.apply_weight_curve(new_subgraph, MediaPort::Video, &video_ramp) {
            log::error!("{new_id}: video ramp failed: {e}");
        }
        if has_audio {
            // Audio mix-weight controllers run in the clip's segment
            // timebase, not pipeline time.
            let anchor = segment_start + fadein_t.saturating_sub(started_at);
            let audio_ramp = [
                CurvePoint { at_ns: anchor, weight: 0.0 },
                CurvePoint { at_ns: anchor + transition_ns, weight: 1.0 },
            ];
            if let Err(e) = self.backend.apply_weight_curve(new_subgraph, MediaPort::Audio, &audio_ramp) {
                log::error!("{new_id}: audio ramp failed: {e}");
            }
        }

        // Only the clip whose fade-out this fade-in was anchored against
        // fades out; any other survivors are already in teardown.
        let old_id = self
            .clips
            .values()
            .find(|c| c.id != new_id && c.fadeout_t == fadein_t)
            .map(|c| c.id);
        if let Some(old_id) = old_id {
            self.begin_fade_out(old_id, fadein_t, transition_ns);
        }
    }

    fn begin_fade_out(&mut self, old_id: ClipId, swap_t: u64, transition_ns: u64) {
        let (subgraph, has_audio, segment_start, started_at) = match self.clips.get(&old_id) {
            Some(c) => (
                c.subgraph,
                c.plan.has_audio,
                c.segment_start_ns.unwrap_or(0),
                c.started_at_ns.unwrap_or(swap_t),
            ),
            None => return,
        };
        let Some(subgraph) = subgraph else { return };

        let video_ramp = [
            CurvePoint { at_ns: swap_t, weight: 1.0 },
            CurvePoint { at_ns: swap_t + transition_ns, weight: 0.0 },
        ];
        if let Err(e) = self.backend.apply_weight_curve(subgraph, MediaPort::Video, &video_ramp) {
            log::error!("{old_id}: video down-ramp failed: {e}");
        }

        // Segment-timebase anchor; also the pts both completion probes watch
        // past the transition end.
        let anchor = segment_start + swap_t.saturating_sub(started_at);
        if has_audio {
            let audio_ramp = [
                CurvePoint { at_ns: anchor, weight: 1.0 },
                CurvePoint { at_ns: anchor + transition_ns, weight: 0.0 },
            ];
            if let Err(e) = self.backend.apply_weight_curve(subgraph, MediaPort::Audio, &audio_ramp) {
                log::error!("{old_id}: audio down-ramp failed: {e}");
            }
        }

        let last_pts = anchor + transition_ns;
        let video_probe = match self.backend.add_threshold_probe(subgraph, MediaPort::Video, last_pts) {
            Ok(p) => Some(p),
            Err(e) => {
                log::warn!("{old_id}: video completion probe failed: {e}");
                None
            }
        };
        let audio_probe = if has_audio {
            match self.backend.add_threshold_probe(subgraph, MediaPort::Audio, last_pts) {
                Ok(p) => Some(p),
                Err(e) => {
                    log::warn!("{old_id}: audio completion probe failed: {e}");
                    None
                }
            }
        } else {
            None
        };

        if let Some(p) = video_probe {
            self.probes.insert(p, (old_id, MediaPort::Video));
        }
        if let Some(p) = audio_probe {
            self.probes.insert(p, (old_id, MediaPort::Audio));
        }

        if let Some(old) = self.clips.get_mut(&old_id) {
            old.state = ClipState::FadingOut;
            old.video_probe = video_probe;
            old.audio_probe = audio_probe;
            // A missing probe counts as instantly finished.
            old.video_finished = video_probe.is_none();
            old.audio_finished = !has_audio || audio_probe.is_none();
        }

        // Fallback teardown in case completion is never observed (stalled or
        // short source streams).
        let now = self.now_ns();
        let force_delay_ms = (swap_t.saturating_sub(now) + transition_ns) / NS_PER_MS
            + self.settings.postroll_ms
            + self.settings.force_cleanup_ms;
        self.timers.schedule(self.clock_ms, force_delay_ms, TimerKind::ForceCleanup(old_id));

        self.try_schedule_cleanup(old_id);
    }

    fn try_schedule_cleanup(&mut self, clip_id: ClipId) {
        let postroll_ms = self.settings.postroll_ms;
        let clock_ms = self.clock_ms;
        let Some(clip) = self.clips.get_mut(&clip_id) else { return };
        if !clip.both_finished() || clip.cleanup_scheduled {
            return;
        }
        clip.cleanup_scheduled = true;
        clip.state = ClipState::CleaningUp;
        self.timers.schedule(clock_ms, postroll_ms, TimerKind::Cleanup(clip_id));
    }

    fn force_cleanup(&mut self, clip_id: ClipId) {
        let Some(clip) = self.clips.get(&clip_id) else { return };
        if clip.cleanup_scheduled {
            // Normal completion won the race.
            return;
        }
        log::warn!(
            "{clip_id}: completion never observed (video={}, audio={}), forcing teardown",
            clip.video_finished,
            clip.audio_finished
        );
        self.cleanup_clip(clip_id);
    }

    /// Tear a clip down: cancel its timers, drop its probes, detach and
    /// destroy its sub-graph, remove it from the active set. Idempotent —
    /// a second call finds nothing.
    fn cleanup_clip(&mut self, clip_id: ClipId) {
        let Some(clip) = self.clips.remove(&clip_id) else {
            log::debug!("cleanup: {clip_id} already gone");
            return;
        };
        self.timers.cancel_clip(clip_id);
        for probe in [clip.video_probe, clip.audio_probe].into_iter().flatten() {
            self.probes.remove(&probe);
            self.backend.remove_probe(probe);
        }
        if let Some(subgraph) = clip.subgraph {
            self.subgraphs.remove(&subgraph);
            if let Err(e) = self.backend.detach(subgraph) {
                log::warn!("{clip_id}: detach failed: {e}");
            }
            if let Err(e) = self.backend.destroy(subgraph) {
                log::warn!("{clip_id}: destroy failed: {e}");
            }
        }
        log::info!("{clip_id}: torn down, {} clip(s) active", self.clips.len());
    }

    // ── Settings swap ─────────────────────────────────────────────────────

    pub fn apply_settings(&mut self, settings: Settings) {
        let output_changed = settings.output != self.settings.output;
        self.settings = Arc::new(settings);
        log::info!(
            "settings snapshot replaced ({}x{}@{}, clip {} ms)",
            self.settings.output.width,
            self.settings.output.height,
            self.settings.output.frame_rate,
            self.settings.clip_duration_ms
        );
        if output_changed {
            if let Err(e) = self.backend.reconfigure(self.settings.output) {
                log::error!("in-place reconfigure failed: {e}");
            }
        }
    }

    // ── Run loop ──────────────────────────────────────────────────────────

    /// Drive the engine until shutdown or a fatal error. All state changes
    /// happen on this task.
    pub async fn run(
        mut self,
        mut backend_rx: UnboundedReceiver<BackendEvent>,
        mut control_rx: UnboundedReceiver<ControlMessage>,
    ) -> Result<(), EngineError> {
        if let Err(e) = self.activity.seed_startup_grace(self.settings.activity_grace_s) {
            log::warn!("could not seed startup activity grace: {e}");
        }

        let epoch = Instant::now();
        self.timers.schedule(0, 0, TimerKind::Tick);

        loop {
            self.clock_ms = epoch.elapsed().as_millis() as u64;
            while let Some(kind) = self.timers.pop_due(self.clock_ms) {
                self.on_timer(kind)?;
            }

            let sleep_ms = self
                .timers
                .next_due()
                .map(|due| due.saturating_sub(self.clock_ms).max(1))
                .unwrap_or(IDLE_SLEEP_MS);

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(sleep_ms)) => {}
                event = backend_rx.recv() => match event {
                    Some(event) => self.on_backend_event(event),
                    None => {
                        log::error!("backend event channel closed, stopping");
                        return Ok(());
                    }
                },
                message = control_rx.recv() => match message {
                    Some(ControlMessage::UpdateSettings(settings)) => self.apply_settings(*settings),
                    Some(ControlMessage::Shutdown) | None => {
                        log::info!("shutdown requested");
                        return Ok(());
                    }
                },
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
