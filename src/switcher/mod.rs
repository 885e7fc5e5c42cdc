use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config;
use crate::pipeline::{MediaPipeline, NodeConfig, NodeHandle};
use crate::switcher::compose::{ComposeJob, ComposeResources, ComposeSlot};
use crate::switcher::preview::PreviewRegistry;
use crate::switcher::types::{
    AvailableSource, ContextSnapshot, FALLBACK_ID, Overlay, Selection, SourceId, StreamDescriptor,
};

pub mod availability;
pub mod compose;
pub mod preview;
pub mod types;

#[cfg(test)]
#[path = "switcher_test.rs"]
mod switcher_test;

/// Upper bound on the optional fade hint of a switch command.
pub const MAX_FADE_MS: u64 = 1000;

/// User-facing command failures. Everything else degrades internally and is
/// only logged.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SwitchError {
    #[error("source {0} is not available")]
    SourceUnavailable(String),
    #[error("fade of {0}ms exceeds the {MAX_FADE_MS}ms limit")]
    FadeTooLong(u64),
    #[error("switcher is not running")]
    Closed,
}

#[derive(Clone, Debug)]
pub enum SwitcherEvent {
    SourceOnline { pin: String },
    SourceOffline { pin: String },
    ActiveChanged { pin: String },
}

/// Loop-consistent view of the switcher for the HTTP surface.
#[derive(Clone, Debug)]
pub struct StatusSnapshot {
    pub available: Vec<AvailableSource>,
    pub active: Selection,
}

enum SwitcherCommand {
    ContextChange {
        snapshot: ContextSnapshot,
    },
    SelectSource {
        source: SourceId,
        overlays: Vec<Overlay>,
        fade_ms: Option<u64>,
        result: oneshot::Sender<Result<(), SwitchError>>,
    },
    TransitionComplete {
        pin: String,
    },
    ComposeReady {
        job_id: u64,
        resources: ComposeResources,
    },
    ComposeFailed {
        job_id: u64,
    },
    Status {
        result: oneshot::Sender<StatusSnapshot>,
    },
}

/// Cloneable front door to the switcher loop. All three event streams
/// (context changes, external commands, transition acks) go through the same
/// serialized command channel.
#[derive(Clone)]
pub struct SwitcherHandle {
    tx: mpsc::Sender<SwitcherCommand>,
    events: broadcast::Sender<SwitcherEvent>,
}

impl SwitcherHandle {
    pub async fn select_source(
        &self,
        source: SourceId,
        overlays: Vec<Overlay>,
        fade_ms: Option<u64>,
    ) -> Result<(), SwitchError> {
        let (result_tx, result_rx) = oneshot::channel();
        self.tx
            .send(SwitcherCommand::SelectSource {
                source,
                overlays,
                fade_ms,
                result: result_tx,
            })
            .await
            .map_err(|_| SwitchError::Closed)?;
        result_rx.await.map_err(|_| SwitchError::Closed)?
    }

    pub async fn status(&self) -> Result<StatusSnapshot, SwitchError> {
        let (result_tx, result_rx) = oneshot::channel();
        self.tx
            .send(SwitcherCommand::Status { result: result_tx })
            .await
            .map_err(|_| SwitchError::Closed)?;
        result_rx.await.map_err(|_| SwitchError::Closed)
    }

    pub async fn context_change(&self, snapshot: ContextSnapshot) {
        let _ = self
            .tx
            .send(SwitcherCommand::ContextChange { snapshot })
            .await;
    }

    pub async fn transition_complete(&self, pin: String) {
        let _ = self
            .tx
            .send(SwitcherCommand::TransitionComplete { pin })
            .await;
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SwitcherEvent> {
        self.events.subscribe()
    }
}

pub struct Switcher;

impl Switcher {
    /// Spawns the switcher loop over the given engine and returns its handle.
    pub fn start(pipeline: Arc<dyn MediaPipeline>, cancel: CancellationToken) -> SwitcherHandle {
        let (tx, rx) = mpsc::channel(64);
        let (events, _) = broadcast::channel(64);
        let state = SwitcherState::new(pipeline, tx.clone(), events.clone());

        tokio::spawn(async move { Self::inner_loop(state, rx, cancel).await });

        SwitcherHandle { tx, events }
    }

    async fn inner_loop(
        mut state: SwitcherState,
        mut rx: mpsc::Receiver<SwitcherCommand>,
        cancel: CancellationToken,
    ) {
        if let Err(e) = state.bootstrap().await {
            log::error!("switcher: fallback bootstrap failed: {:#}", e);
        }
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break;
                },
                Some(cmd) = rx.recv() => {
                    state.handle_command(cmd).await;
                },
            }
        }
        state.shutdown().await;
    }
}

/// All mutable switcher state. Owned exclusively by the loop task; other
/// components only reach it through the command channel.
struct SwitcherState {
    pipeline: Arc<dyn MediaPipeline>,
    tx: mpsc::Sender<SwitcherCommand>,
    events: broadcast::Sender<SwitcherEvent>,
    desired: Selection,
    active: Selection,
    available: HashMap<String, AvailableSource>,
    streams: ContextSnapshot,
    previews: PreviewRegistry,
    compose: ComposeSlot,
    next_compose_id: u64,
    fade_hint: Option<u64>,
    fallback_nodes: Vec<NodeHandle>,
}

impl SwitcherState {
    fn new(
        pipeline: Arc<dyn MediaPipeline>,
        tx: mpsc::Sender<SwitcherCommand>,
        events: broadcast::Sender<SwitcherEvent>,
    ) -> Self {
        Self {
            pipeline,
            tx,
            events,
            desired: Selection::fallback(),
            active: Selection::fallback(),
            available: HashMap::new(),
            streams: ContextSnapshot::new(),
            previews: PreviewRegistry::default(),
            compose: ComposeSlot::default(),
            next_compose_id: 1,
            fade_hint: None,
            fallback_nodes: Vec::new(),
        }
    }

    /// Starts the silence + test-card generators behind the reserved
    /// `fallback` pin and wires its permanent preview path.
    async fn bootstrap(&mut self) -> anyhow::Result<()> {
        let config = config::config();
        let resolution = config.fallback_resolution();
        let frame_rate = config.fallback_frame_rate();

        let card = self
            .pipeline
            .create_node(NodeConfig::TestCard {
                pin: FALLBACK_ID.to_string(),
                resolution,
                frame_rate,
            })
            .await?;
        self.fallback_nodes.push(card);
        let silence = self
            .pipeline
            .create_node(NodeConfig::Silence {
                pin: FALLBACK_ID.to_string(),
            })
            .await?;
        self.fallback_nodes.push(silence);

        self.available.insert(
            FALLBACK_ID.to_string(),
            AvailableSource {
                source: SourceId::fallback(),
                resolution,
                frame_rate: Some(frame_rate),
                went_live_at: Instant::now(),
            },
        );
        self.streams.insert(
            FALLBACK_ID.to_string(),
            vec![
                StreamDescriptor::Audio,
                StreamDescriptor::Video {
                    resolution,
                    frame_rate: Some(frame_rate),
                },
            ],
        );

        // generators are already cheap, no re-encode in front of the preview
        self.previews
            .ensure(&*self.pipeline, FALLBACK_ID, false, config.preview_bitrate())
            .await?;

        log::info!("switcher: fallback source ready ({})", resolution);
        Ok(())
    }

    async fn handle_command(&mut self, cmd: SwitcherCommand) {
        match cmd {
            SwitcherCommand::ContextChange { snapshot } => {
                self.handle_context_change(snapshot).await;
            }
            SwitcherCommand::SelectSource {
                source,
                overlays,
                fade_ms,
                result,
            } => {
                let outcome = self.handle_select_source(source, overlays, fade_ms).await;
                let _ = result.send(outcome);
            }
            SwitcherCommand::TransitionComplete { pin } => {
                self.handle_transition_complete(pin).await;
            }
            SwitcherCommand::ComposeReady { job_id, resources } => {
                self.handle_compose_ready(job_id, resources).await;
            }
            SwitcherCommand::ComposeFailed { job_id } => {
                self.handle_compose_failed(job_id);
            }
            SwitcherCommand::Status { result } => {
                let _ = result.send(self.status());
            }
        }
    }

    async fn handle_context_change(&mut self, mut snapshot: ContextSnapshot) {
        // the fallback generators are engine-side but their availability is
        // pinned here once bootstrap ran
        if let Some(streams) = self.streams.get(FALLBACK_ID) {
            snapshot
                .entry(FALLBACK_ID.to_string())
                .or_insert_with(|| streams.clone());
        }

        let diff = availability::diff(&self.available, &snapshot, Instant::now());
        self.streams = snapshot;

        for added in diff.added {
            let pin = added.source.pin();
            log::info!("switcher: source online: {} ({})", pin, added.resolution);
            self.available.insert(pin.clone(), added);
            let _ = self.events.send(SwitcherEvent::SourceOnline { pin: pin.clone() });

            // compose backing pins are not independent preview-able sources
            if !self.compose.is_backing(&pin) {
                let bitrate = config::config().preview_bitrate();
                if let Err(e) = self.previews.ensure(&*self.pipeline, &pin, true, bitrate).await {
                    log::warn!("switcher: preview for {} failed: {:#}", pin, e);
                }
            }
        }
        for pin in diff.removed {
            log::info!("switcher: source offline: {}", pin);
            self.available.remove(&pin);
            let _ = self.events.send(SwitcherEvent::SourceOffline { pin: pin.clone() });
            self.previews.remove(&*self.pipeline, &pin).await;
        }

        self.reconcile().await;
    }

    async fn handle_select_source(
        &mut self,
        source: SourceId,
        overlays: Vec<Overlay>,
        fade_ms: Option<u64>,
    ) -> Result<(), SwitchError> {
        if let Some(fade) = fade_ms {
            if fade > MAX_FADE_MS {
                return Err(SwitchError::FadeTooLong(fade));
            }
        }
        let pin = source.pin();
        if !self.available.contains_key(&pin) {
            log::warn!("switcher: select of unavailable source {} ignored", pin);
            return Err(SwitchError::SourceUnavailable(pin));
        }

        // a newer command always wins over one still in flight
        if let Some(job) = self.compose.take_pending() {
            log::info!("switcher: compose job {} superseded", job.id);
            job.close(&*self.pipeline).await;
        }

        self.fade_hint = fade_ms;
        if overlays.is_empty() {
            self.desired = Selection::solo(source);
            self.reconcile().await;
        } else {
            self.begin_compose(source, overlays);
        }
        Ok(())
    }

    /// Kicks off async provisioning of a compose job. The job id is captured
    /// by the task and re-validated on completion, so a superseded job can
    /// never promote itself.
    fn begin_compose(&mut self, background: SourceId, overlays: Vec<Overlay>) {
        let Some(entry) = self.available.get(&background.pin()) else {
            return;
        };
        let resolution = entry.resolution;

        let id = self.next_compose_id;
        self.next_compose_id += 1;

        let job = ComposeJob::new(id, background.clone(), overlays.clone());
        let job_pin = job.pin();
        self.compose.set_pending(job);

        log::info!(
            "switcher: compose job {} provisioning ({} + {} overlays)",
            id,
            background,
            overlays.len()
        );

        let pipeline = Arc::clone(&self.pipeline);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            match compose::provision(&*pipeline, &job_pin, &background, resolution, &overlays)
                .await
            {
                Ok(resources) => {
                    let _ = tx
                        .send(SwitcherCommand::ComposeReady {
                            job_id: id,
                            resources,
                        })
                        .await;
                }
                Err(e) => {
                    log::warn!("switcher: compose job {} provisioning failed: {:#}", id, e);
                    let _ = tx.send(SwitcherCommand::ComposeFailed { job_id: id }).await;
                }
            }
        });
    }

    async fn handle_compose_ready(&mut self, job_id: u64, resources: ComposeResources) {
        // stale completion: job was superseded while provisioning
        if self.compose.pending_id() != Some(job_id) {
            log::debug!("switcher: discarding stale compose job {}", job_id);
            resources.close(&*self.pipeline).await;
            return;
        }
        let Some(job) = self.compose.pending_mut() else {
            resources.close(&*self.pipeline).await;
            return;
        };
        job.resources = Some(resources);
        self.desired = Selection {
            pin: job.pin(),
            primary: job.background.clone(),
            overlays: job.overlays.clone(),
        };
        log::info!("switcher: compose job {} ready on {}", job_id, self.desired.pin);
        self.reconcile().await;
    }

    fn handle_compose_failed(&mut self, job_id: u64) {
        // the provisioning task already closed any partial resources
        if self.compose.pending_id() == Some(job_id) {
            self.compose.take_pending();
        }
    }

    async fn handle_transition_complete(&mut self, pin: String) {
        if self.compose.pending_pin().as_deref() == Some(pin.as_str()) {
            if let Some(previous) = self.compose.promote_pending() {
                log::info!(
                    "switcher: compose job {} replaced by newer active job",
                    previous.id
                );
                previous.close(&*self.pipeline).await;
            }
            log::info!("switcher: compose committed on {}", pin);
        } else if pin == self.active.pin && self.compose.active_pin().is_some_and(|p| p != pin) {
            // the program output moved off the composite; it is no longer used
            if let Some(job) = self.compose.take_active() {
                log::info!("switcher: compose job {} no longer on air, closing", job.id);
                job.close(&*self.pipeline).await;
            }
        }
        let _ = self.events.send(SwitcherEvent::ActiveChanged { pin });
    }

    /// One reconciliation pass. Idempotent: with unchanged availability and
    /// desired selection it issues no pipeline commands.
    async fn reconcile(&mut self) {
        let desired_ready = self.available.contains_key(&self.desired.primary.pin())
            && self.pin_streaming(&self.desired.pin);

        if self.active.pin != self.desired.pin && desired_ready {
            let target = self.desired.clone();
            log::info!("switcher: switching to {}", target.pin);
            if self.switch_to(&target.pin).await {
                self.active = target;
            }
            return;
        }

        if self.active.pin != FALLBACK_ID
            && !desired_ready
            && self.available.contains_key(FALLBACK_ID)
        {
            if self.desired.pin == self.active.pin {
                // do not let an availability flicker resurrect the stale target
                self.desired = Selection::fallback();
            }
            log::info!(
                "switcher: {} unavailable, switching to fallback",
                self.active.pin
            );
            if self.switch_to(FALLBACK_ID).await {
                self.active = Selection::fallback();
            }
        }
        // neither desired nor fallback reachable: hold the last active
        // selection untouched
    }

    fn pin_streaming(&self, pin: &str) -> bool {
        self.streams
            .get(pin)
            .is_some_and(|streams| availability::complete_pair(streams))
    }

    async fn switch_to(&mut self, pin: &str) -> bool {
        let fade = self.fade_hint.take();
        match self.pipeline.switch_source(pin, fade).await {
            Ok(()) => true,
            Err(e) => {
                log::error!("switcher: switch to {} failed: {:#}", pin, e);
                false
            }
        }
    }

    fn status(&self) -> StatusSnapshot {
        let mut available: Vec<AvailableSource> = self
            .available
            .values()
            .filter(|s| !self.compose.is_backing(&s.source.pin()))
            .cloned()
            .collect();
        available.sort_by(|a, b| a.source.pin().cmp(&b.source.pin()));
        StatusSnapshot {
            available,
            active: self.active.clone(),
        }
    }

    async fn shutdown(&mut self) {
        if let Some(job) = self.compose.take_pending() {
            job.close(&*self.pipeline).await;
        }
        if let Some(job) = self.compose.take_active() {
            job.close(&*self.pipeline).await;
        }
        self.previews.close_all(&*self.pipeline).await;
        for node in self.fallback_nodes.drain(..) {
            if let Err(e) = self.pipeline.close(node).await {
                log::warn!("switcher: close of fallback node {:?} failed: {:#}", node, e);
            }
        }
        log::info!("switcher: stopped");
    }
}
