use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::pipeline::{
    InputSource, MediaPipeline, NodeConfig, NodeHandle, PipelineEvent, SubscribeInput,
};
use crate::switcher::types::{ContextSnapshot, Resolution, StreamDescriptor, StreamKind};

/// In-process stand-in for the external engine, used for local runs. Tracks
/// which pins its nodes publish, emits a fresh context snapshot whenever that
/// changes, and acks every switch immediately.
pub struct StubPipeline {
    events: mpsc::Sender<PipelineEvent>,
    next_handle: AtomicU64,
    inner: Mutex<StubInner>,
}

#[derive(Default)]
struct StubInner {
    nodes: HashMap<NodeHandle, NodeConfig>,
    subscriptions: HashMap<NodeHandle, Vec<SubscribeInput>>,
    sources: HashMap<String, (Resolution, f64)>,
}

impl StubPipeline {
    pub fn new(events: mpsc::Sender<PipelineEvent>) -> Self {
        Self {
            events,
            next_handle: AtomicU64::new(1),
            inner: Mutex::new(StubInner::default()),
        }
    }

    /// Registers an upstream source carrying a full audio + video pair, as a
    /// real engine would after an ingest connects.
    pub fn add_source(&self, pin: &str, resolution: Resolution, frame_rate: f64) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner
                .sources
                .insert(pin.to_string(), (resolution, frame_rate));
        }
        self.emit_context_change();
    }

    pub fn remove_source(&self, pin: &str) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.sources.remove(pin);
        }
        self.emit_context_change();
    }

    fn alloc(&self) -> NodeHandle {
        NodeHandle(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    fn emit_context_change(&self) {
        let snapshot = {
            let inner = self.inner.lock().unwrap();
            build_snapshot(&inner)
        };
        if self
            .events
            .try_send(PipelineEvent::ContextChange(snapshot))
            .is_err()
        {
            log::warn!("stub: event channel full, dropping context change");
        }
    }
}

fn build_snapshot(inner: &StubInner) -> ContextSnapshot {
    let mut snapshot = ContextSnapshot::new();

    for (pin, (resolution, frame_rate)) in &inner.sources {
        snapshot.insert(
            pin.clone(),
            vec![
                StreamDescriptor::Audio,
                StreamDescriptor::Video {
                    resolution: *resolution,
                    frame_rate: Some(*frame_rate),
                },
            ],
        );
    }

    for (handle, config) in &inner.nodes {
        match config {
            NodeConfig::TestCard {
                pin,
                resolution,
                frame_rate,
            } => {
                snapshot
                    .entry(pin.clone())
                    .or_default()
                    .push(StreamDescriptor::Video {
                        resolution: *resolution,
                        frame_rate: Some(*frame_rate),
                    });
            }
            NodeConfig::Silence { pin } => {
                snapshot
                    .entry(pin.clone())
                    .or_default()
                    .push(StreamDescriptor::Audio);
            }
            NodeConfig::StreamFix { publish_pin, kind } => {
                // a fix node publishes only once it is wired to its composite
                let Some(inputs) = inner.subscriptions.get(handle) else {
                    continue;
                };
                let descriptor = match kind {
                    StreamKind::Audio => StreamDescriptor::Audio,
                    StreamKind::Video => StreamDescriptor::Video {
                        resolution: upstream_resolution(inner, inputs),
                        frame_rate: None,
                    },
                };
                snapshot
                    .entry(publish_pin.clone())
                    .or_default()
                    .push(descriptor);
            }
            _ => {}
        }
    }

    snapshot
}

fn upstream_resolution(inner: &StubInner, inputs: &[SubscribeInput]) -> Resolution {
    inputs
        .iter()
        .find_map(|input| {
            let InputSource::Node(handle) = &input.source else {
                return None;
            };
            match inner.nodes.get(handle) {
                Some(NodeConfig::Compose { resolution, .. }) => Some(*resolution),
                _ => None,
            }
        })
        .unwrap_or(Resolution {
            width: 1280,
            height: 720,
        })
}

#[async_trait]
impl MediaPipeline for StubPipeline {
    async fn create_node(&self, config: NodeConfig) -> anyhow::Result<NodeHandle> {
        let handle = self.alloc();
        log::debug!("stub: create {:?} -> {:?}", config, handle);
        {
            let mut inner = self.inner.lock().unwrap();
            inner.nodes.insert(handle, config);
        }
        self.emit_context_change();
        Ok(handle)
    }

    async fn subscribe(&self, node: NodeHandle, inputs: &[SubscribeInput]) -> anyhow::Result<()> {
        {
            let mut inner = self.inner.lock().unwrap();
            if !inner.nodes.contains_key(&node) {
                anyhow::bail!("subscribe on unknown node {:?}", node);
            }
            inner.subscriptions.insert(node, inputs.to_vec());
        }
        self.emit_context_change();
        Ok(())
    }

    async fn close(&self, node: NodeHandle) -> anyhow::Result<()> {
        let existed = {
            let mut inner = self.inner.lock().unwrap();
            inner.subscriptions.remove(&node);
            inner.nodes.remove(&node).is_some()
        };
        if existed {
            self.emit_context_change();
        } else {
            log::debug!("stub: close of unknown node {:?} ignored", node);
        }
        Ok(())
    }

    async fn switch_source(&self, pin: &str, fade_ms: Option<u64>) -> anyhow::Result<()> {
        log::info!("stub: switch to {} (fade {:?})", pin, fade_ms);
        let _ = self.events.try_send(PipelineEvent::TransitionComplete {
            pin: pin.to_string(),
        });
        Ok(())
    }
}
