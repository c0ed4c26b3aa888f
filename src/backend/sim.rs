/// Simulated composition backend
///
/// Implements the backend contract against wall-clock timing so the daemon
/// runs end-to-end without a media stack: builds become short sleeps,
/// thresholds fire when the simulated pts passes the requested instant, and
/// pause freezes the pipeline clock. Probe timers keep running on the wall
/// clock while paused — good enough for a stand-in that never renders.
use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use super::{
    BackendError, BackendEvent, CompositionBackend, CurvePoint, MediaInfo, MediaPort,
    OutputFormat, ProbeId, SubgraphId, SubgraphSpec, NS_PER_MS,
};

struct SimSubgraph {
    spec: SubgraphSpec,
    attached: bool,
    /// Pipeline time at which the timeline started flowing.
    started_at_ns: Option<u64>,
    segment_start_ns: u64,
}

pub struct SimulatedBackend {
    events: UnboundedSender<BackendEvent>,
    epoch: Instant,
    paused_at: Option<Instant>,
    paused_total: Duration,
    build_delay: Duration,
    next_subgraph: u64,
    next_probe: u64,
    subgraphs: HashMap<SubgraphId, SimSubgraph>,
    probes: HashMap<ProbeId, JoinHandle<()>>,
}

impl SimulatedBackend {
    pub fn new(events: UnboundedSender<BackendEvent>, build_delay: Duration) -> Self {
        Self {
            events,
            epoch: Instant::now(),
            paused_at: None,
            paused_total: Duration::ZERO,
            build_delay,
            next_subgraph: 0,
            next_probe: 0,
            subgraphs: HashMap::new(),
            probes: HashMap::new(),
        }
    }

    fn subgraph(&self, id: SubgraphId) -> Result<&SimSubgraph, BackendError> {
        self.subgraphs.get(&id).ok_or(BackendError::UnknownSubgraph(id))
    }
}

impl CompositionBackend for SimulatedBackend {
    fn probe(&mut self, path: &Path) -> Result<MediaInfo, BackendError> {
        let meta = std::fs::metadata(path).map_err(|e| BackendError::Probe {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        // Deterministic pseudo-duration derived from the file size, long
        // enough to exercise multi-clip planning.
        let duration_ms = 30_000 + meta.len() % 180_000;
        Ok(MediaInfo { duration_ms, width: 1920, height: 1080, has_audio: true })
    }

    fn create_subgraph(&mut self, spec: SubgraphSpec) -> Result<SubgraphId, BackendError> {
        self.next_subgraph += 1;
        let id = SubgraphId(self.next_subgraph);
        let segment_start_ns = spec.seek_ms * NS_PER_MS;
        self.subgraphs.insert(
            id,
            SimSubgraph { spec, attached: false, started_at_ns: None, segment_start_ns },
        );

        let events = self.events.clone();
        let delay = self.build_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(BackendEvent::SubgraphReady { id });
        });
        Ok(id)
    }

    fn attach(&mut self, id: SubgraphId, z_order: u32, initial_weight: f64) -> Result<(), BackendError> {
        let sub = self.subgraphs.get_mut(&id).ok_or(BackendError::UnknownSubgraph(id))?;
        sub.attached = true;
        log::debug!(
            "sim: attached {id} ({}) z={z_order} weight={initial_weight}",
            sub.spec.path.display()
        );
        Ok(())
    }

    fn unblock(&mut self, id: SubgraphId) -> Result<(), BackendError> {
        let now_ns = self.pipeline_time_ns();
        let sub = self.subgraphs.get_mut(&id).ok_or(BackendError::UnknownSubgraph(id))?;
        if !sub.attached {
            log::warn!("sim: unblocking {id} before it was attached");
        }
        sub.started_at_ns = Some(now_ns);
        let _ = self
            .events
            .send(BackendEvent::SubgraphStarted { id, segment_start_ns: sub.segment_start_ns });
        Ok(())
    }

    fn apply_weight_curve(
        &mut self,
        id: SubgraphId,
        port: MediaPort,
        points: &[CurvePoint],
    ) -> Result<(), BackendError> {
        self.subgraph(id)?;
        log::debug!("sim: weight curve on {id} {port:?}: {points:?}");
        Ok(())
    }

    fn add_threshold_probe(
        &mut self,
        id: SubgraphId,
        port: MediaPort,
        at_ns: u64,
    ) -> Result<ProbeId, BackendError> {
        let now_ns = self.pipeline_time_ns();
        let sub = self.subgraph(id)?;
        // Current pts in the sub-graph's segment timebase.
        let current_pts = sub.segment_start_ns + now_ns.saturating_sub(sub.started_at_ns.unwrap_or(now_ns));
        let delay_ns = at_ns.saturating_sub(current_pts);

        self.next_probe += 1;
        let probe = ProbeId(self.next_probe);
        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_nanos(delay_ns)).await;
            let _ = events.send(BackendEvent::ThresholdReached { probe });
        });
        self.probes.insert(probe, handle);
        log::debug!("sim: threshold probe {probe:?} on {id} {port:?} at pts {at_ns}");
        Ok(probe)
    }

    fn remove_probe(&mut self, probe: ProbeId) {
        if let Some(handle) = self.probes.remove(&probe) {
            handle.abort();
        }
    }

    fn detach(&mut self, id: SubgraphId) -> Result<(), BackendError> {
        let sub = self.subgraphs.get_mut(&id).ok_or(BackendError::UnknownSubgraph(id))?;
        sub.attached = false;
        Ok(())
    }

    fn destroy(&mut self, id: SubgraphId) -> Result<(), BackendError> {
        self.subgraphs.remove(&id).ok_or(BackendError::UnknownSubgraph(id))?;
        log::debug!("sim: destroyed {id}, {} sub-graph(s) alive", self.subgraphs.len());
        Ok(())
    }

    fn pipeline_time_ns(&self) -> u64 {
        let live = match self.paused_at {
            Some(at) => at.duration_since(self.epoch),
            None => self.epoch.elapsed(),
        };
        live.saturating_sub(self.paused_total).as_nanos() as u64
    }

    fn pause(&mut self) {
        if self.paused_at.is_none() {
            self.paused_at = Some(Instant::now());
        }
    }

    fn resume(&mut self) {
        if let Some(at) = self.paused_at.take() {
            self.paused_total += at.elapsed();
        }
    }

    fn reconfigure(&mut self, output: OutputFormat) -> Result<(), BackendError> {
        log::info!(
            "sim: reconfigured output to {}x{}@{}",
            output.width,
            output.height,
            output.frame_rate
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn ready_then_started_event_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut backend = SimulatedBackend::new(tx, Duration::from_millis(5));
        let id = backend
            .create_subgraph(SubgraphSpec { path: "/dev/null".into(), seek_ms: 1_000, crop: None })
            .unwrap();

        let ev = rx.recv().await.unwrap();
        assert_eq!(ev, BackendEvent::SubgraphReady { id });

        backend.attach(id, 1, 0.0).unwrap();
        backend.unblock(id).unwrap();
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev, BackendEvent::SubgraphStarted { id, segment_start_ns: 1_000 * NS_PER_MS });
    }

    #[tokio::test]
    async fn removed_probe_never_fires() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut backend = SimulatedBackend::new(tx, Duration::from_millis(1));
        let id = backend
            .create_subgraph(SubgraphSpec { path: "/dev/null".into(), seek_ms: 0, crop: None })
            .unwrap();
        let _ = rx.recv().await; // ready
        backend.unblock(id).unwrap();
        let _ = rx.recv().await; // started

        let probe = backend
            .add_threshold_probe(id, MediaPort::Video, backend.pipeline_time_ns() + 20 * NS_PER_MS)
            .unwrap();
        backend.remove_probe(probe);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(rx.try_recv().is_err(), "aborted probe must not deliver an event");
    }

    #[test]
    fn pause_freezes_pipeline_time() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut backend = SimulatedBackend::new(tx, Duration::from_millis(1));
        backend.pause();
        let a = backend.pipeline_time_ns();
        std::thread::sleep(Duration::from_millis(10));
        let b = backend.pipeline_time_ns();
        assert_eq!(a, b, "clock must not advance while paused");
        backend.resume();
        std::thread::sleep(Duration::from_millis(5));
        assert!(backend.pipeline_time_ns() > b);
    }

}
