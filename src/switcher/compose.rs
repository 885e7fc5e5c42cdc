use crate::pipeline::{
    ComposeLayer, MediaPipeline, NodeConfig, NodeHandle, StreamSelector, SubscribeInput,
};
use crate::switcher::types::{Overlay, Resolution, SourceId, StreamKind};

/// Pin a compose job publishes under. Reuses the pin codec so compose outputs
/// stay reversible like every other pin.
pub fn compose_pin(id: u64) -> String {
    SourceId::with_key("compose", id.to_string()).pin()
}

/// Nodes backing one compose job: the composite itself plus the stream-key
/// normalizers for its video and audio outputs. Closing consumes the set, so
/// each handle is closed at most once from here; the engine's own `close` is
/// idempotent on top of that.
#[derive(Debug)]
pub struct ComposeResources {
    handles: Vec<NodeHandle>,
}

impl ComposeResources {
    pub fn new(handles: Vec<NodeHandle>) -> Self {
        Self { handles }
    }

    pub async fn close(self, pipeline: &dyn MediaPipeline) {
        for handle in self.handles {
            if let Err(e) = pipeline.close(handle).await {
                log::warn!("compose: close of node {:?} failed: {:#}", handle, e);
            }
        }
    }
}

/// A transient background + overlays composite. `resources` is `None` while
/// provisioning is still in flight.
#[derive(Debug)]
pub struct ComposeJob {
    pub id: u64,
    pub background: SourceId,
    pub overlays: Vec<Overlay>,
    pub resources: Option<ComposeResources>,
}

impl ComposeJob {
    pub fn new(id: u64, background: SourceId, overlays: Vec<Overlay>) -> Self {
        Self {
            id,
            background,
            overlays,
            resources: None,
        }
    }

    pub fn pin(&self) -> String {
        compose_pin(self.id)
    }

    pub async fn close(self, pipeline: &dyn MediaPipeline) {
        if let Some(resources) = self.resources {
            resources.close(pipeline).await;
        }
    }
}

/// At most one pending and one active compose job exist at any time.
#[derive(Debug, Default)]
pub struct ComposeSlot {
    pending: Option<ComposeJob>,
    active: Option<ComposeJob>,
}

impl ComposeSlot {
    pub fn pending_id(&self) -> Option<u64> {
        self.pending.as_ref().map(|job| job.id)
    }

    pub fn pending_pin(&self) -> Option<String> {
        self.pending.as_ref().map(|job| job.pin())
    }

    pub fn pending_mut(&mut self) -> Option<&mut ComposeJob> {
        self.pending.as_mut()
    }

    pub fn active_pin(&self) -> Option<String> {
        self.active.as_ref().map(|job| job.pin())
    }

    /// Installs a new pending job, handing back whatever it displaces so the
    /// caller can tear it down.
    pub fn set_pending(&mut self, job: ComposeJob) -> Option<ComposeJob> {
        self.pending.replace(job)
    }

    pub fn take_pending(&mut self) -> Option<ComposeJob> {
        self.pending.take()
    }

    /// Commits the pending job as active, returning the previously active job
    /// for teardown.
    pub fn promote_pending(&mut self) -> Option<ComposeJob> {
        match self.pending.take() {
            Some(job) => self.active.replace(job),
            None => None,
        }
    }

    pub fn take_active(&mut self) -> Option<ComposeJob> {
        self.active.take()
    }

    /// Whether `pin` is the backing pin of the pending or active job. Backing
    /// pins are not independently preview-able sources.
    pub fn is_backing(&self, pin: &str) -> bool {
        self.pending.as_ref().is_some_and(|job| job.pin() == pin)
            || self.active.as_ref().is_some_and(|job| job.pin() == pin)
    }
}

/// Builds the composite node plus its two stream fixes. On any failure the
/// nodes created so far are closed before the error is returned, so a failed
/// job never leaks partial resources.
pub async fn provision(
    pipeline: &dyn MediaPipeline,
    job_pin: &str,
    background: &SourceId,
    resolution: Resolution,
    overlays: &[Overlay],
) -> anyhow::Result<ComposeResources> {
    let mut created: Vec<NodeHandle> = Vec::new();

    match build(pipeline, &mut created, job_pin, background, resolution, overlays).await {
        Ok(()) => Ok(ComposeResources::new(created)),
        Err(e) => {
            ComposeResources::new(created).close(pipeline).await;
            Err(e)
        }
    }
}

async fn build(
    pipeline: &dyn MediaPipeline,
    created: &mut Vec<NodeHandle>,
    job_pin: &str,
    background: &SourceId,
    resolution: Resolution,
    overlays: &[Overlay],
) -> anyhow::Result<()> {
    // Background at z 0, each overlay stacked above it in command order.
    let mut layers = vec![ComposeLayer {
        z_index: 0,
        opacity: 1.0,
        source_rect: None,
        dest_rect: None,
    }];
    let mut inputs = vec![SubscribeInput::pin(background.pin(), StreamSelector::Both)];
    for (i, overlay) in overlays.iter().enumerate() {
        layers.push(ComposeLayer {
            z_index: i as u32 + 1,
            opacity: 1.0,
            source_rect: overlay.source_rect,
            dest_rect: overlay.dest_rect,
        });
        inputs.push(SubscribeInput::pin(
            overlay.source.pin(),
            StreamSelector::Video,
        ));
    }

    let compose = pipeline
        .create_node(NodeConfig::Compose { resolution, layers })
        .await?;
    created.push(compose);
    pipeline.subscribe(compose, &inputs).await?;

    for kind in [StreamKind::Video, StreamKind::Audio] {
        let selector = match kind {
            StreamKind::Video => StreamSelector::Video,
            StreamKind::Audio => StreamSelector::Audio,
        };
        let fix = pipeline
            .create_node(NodeConfig::StreamFix {
                publish_pin: job_pin.to_string(),
                kind,
            })
            .await?;
        created.push(fix);
        pipeline
            .subscribe(fix, &[SubscribeInput::node(compose, selector)])
            .await?;
    }

    Ok(())
}
