use async_trait::async_trait;

use crate::switcher::types::{ContextSnapshot, Rect, Resolution, StreamKind};

pub mod stub;

/// Opaque handle to a pipeline node, issued by the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeHandle(pub u64);

/// One layer of a composite node. Layer 0 is the background (full opacity,
/// bottom of the stack); missing rectangles mean full-frame.
#[derive(Clone, Debug)]
pub struct ComposeLayer {
    pub z_index: u32,
    pub opacity: f64,
    pub source_rect: Option<Rect>,
    pub dest_rect: Option<Rect>,
}

/// Node creation configs for the node kinds this crate provisions.
#[derive(Clone, Debug)]
pub enum NodeConfig {
    /// Background + overlays composite. Inputs are wired separately via
    /// [`MediaPipeline::subscribe`], one per layer, in layer order.
    Compose {
        resolution: Resolution,
        layers: Vec<ComposeLayer>,
    },
    /// Stream-key normalizer: republishes its input under `publish_pin`.
    StreamFix {
        publish_pin: String,
        kind: StreamKind,
    },
    /// Low-cost preview output for one pin.
    PreviewOutput { pin: String },
    /// Cheap low-bitrate re-encode feeding a preview output.
    PreviewEncoder { pin: String, bitrate: u64 },
    /// Synthetic video generator behind the fallback source.
    TestCard {
        pin: String,
        resolution: Resolution,
        frame_rate: f64,
    },
    /// Synthetic audio generator behind the fallback source.
    Silence { pin: String },
}

/// Which streams of an input a subscription accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamSelector {
    Audio,
    Video,
    Both,
}

/// Where a subscription input comes from: an upstream pin, or another node
/// created by this crate (e.g. a compose node feeding its stream fixes).
#[derive(Clone, Debug)]
pub enum InputSource {
    Pin(String),
    Node(NodeHandle),
}

#[derive(Clone, Debug)]
pub struct SubscribeInput {
    pub source: InputSource,
    pub selector: StreamSelector,
}

impl SubscribeInput {
    pub fn pin(pin: impl Into<String>, selector: StreamSelector) -> Self {
        Self {
            source: InputSource::Pin(pin.into()),
            selector,
        }
    }

    pub fn node(node: NodeHandle, selector: StreamSelector) -> Self {
        Self {
            source: InputSource::Node(node),
            selector,
        }
    }
}

/// Events the engine pushes at this crate. Delivered over a channel rather
/// than registered callbacks; the switcher funnels them into its command loop.
#[derive(Clone, Debug)]
pub enum PipelineEvent {
    /// Upstream composition changed; full snapshot of pin -> streams.
    ContextChange(ContextSnapshot),
    /// A requested switch has taken visible effect on `pin`.
    TransitionComplete { pin: String },
}

/// Surface of the external media-processing engine consumed by the switcher.
/// All calls are asynchronous and may be slow; `close` is idempotent.
#[async_trait]
pub trait MediaPipeline: Send + Sync {
    async fn create_node(&self, config: NodeConfig) -> anyhow::Result<NodeHandle>;

    async fn subscribe(&self, node: NodeHandle, inputs: &[SubscribeInput]) -> anyhow::Result<()>;

    /// Closing an unknown or already-closed node must not fail.
    async fn close(&self, node: NodeHandle) -> anyhow::Result<()>;

    /// Instructs the smooth-switch primitive to transition the program output
    /// to `pin`. Completion is signalled via `PipelineEvent::TransitionComplete`.
    async fn switch_source(&self, pin: &str, fade_ms: Option<u64>) -> anyhow::Result<()>;
}
