// ============================================================================
// Switcher reconciliation tests
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::{Semaphore, broadcast, mpsc};

use super::*;
use crate::pipeline::{MediaPipeline, NodeConfig, NodeHandle, SubscribeInput};
use crate::switcher::types::{Rect, Resolution};

/// Records every pipeline command. Creates can be gated on a semaphore (to
/// keep compose provisioning in flight) or made to fail after N more calls.
struct MockPipeline {
    next_handle: AtomicU64,
    create_seq: AtomicU64,
    fail_after: AtomicU64,
    gate_from: AtomicU64,
    gate: Semaphore,
    created: Mutex<Vec<NodeConfig>>,
    closed: Mutex<Vec<NodeHandle>>,
    switches: Mutex<Vec<String>>,
}

impl MockPipeline {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            next_handle: AtomicU64::new(1),
            create_seq: AtomicU64::new(0),
            fail_after: AtomicU64::new(u64::MAX),
            gate_from: AtomicU64::new(u64::MAX),
            gate: Semaphore::new(0),
            created: Mutex::new(Vec::new()),
            closed: Mutex::new(Vec::new()),
            switches: Mutex::new(Vec::new()),
        })
    }

    /// Allow `n` more creates, then fail subsequent ones.
    fn fail_after_more(&self, n: u64) {
        self.fail_after
            .store(self.create_seq.load(Ordering::SeqCst) + n, Ordering::SeqCst);
    }

    /// All creates from now on wait for a gate permit before proceeding.
    fn gate_creates(&self) {
        self.gate_from
            .store(self.create_seq.load(Ordering::SeqCst), Ordering::SeqCst);
    }

    fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    fn switches(&self) -> Vec<String> {
        self.switches.lock().unwrap().clone()
    }

    fn closed(&self) -> Vec<NodeHandle> {
        self.closed.lock().unwrap().clone()
    }

    fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    fn last_handle(&self) -> u64 {
        self.next_handle.load(Ordering::SeqCst) - 1
    }
}

#[async_trait]
impl MediaPipeline for MockPipeline {
    async fn create_node(&self, config: NodeConfig) -> anyhow::Result<NodeHandle> {
        let seq = self.create_seq.fetch_add(1, Ordering::SeqCst);
        if seq >= self.gate_from.load(Ordering::SeqCst) {
            let permit = self.gate.acquire().await?;
            permit.forget();
        }
        if seq >= self.fail_after.load(Ordering::SeqCst) {
            anyhow::bail!("engine rejected node creation");
        }
        let handle = NodeHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        self.created.lock().unwrap().push(config);
        Ok(handle)
    }

    async fn subscribe(&self, _node: NodeHandle, _inputs: &[SubscribeInput]) -> anyhow::Result<()> {
        Ok(())
    }

    async fn close(&self, node: NodeHandle) -> anyhow::Result<()> {
        self.closed.lock().unwrap().push(node);
        Ok(())
    }

    async fn switch_source(&self, pin: &str, _fade_ms: Option<u64>) -> anyhow::Result<()> {
        self.switches.lock().unwrap().push(pin.to_string());
        Ok(())
    }
}

// ------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------

fn test_state(mock: &Arc<MockPipeline>) -> (SwitcherState, mpsc::Receiver<SwitcherCommand>) {
    let (tx, rx) = mpsc::channel(64);
    let (events, _) = broadcast::channel(64);
    let pipeline: Arc<dyn MediaPipeline> = Arc::clone(mock) as Arc<dyn MediaPipeline>;
    (SwitcherState::new(pipeline, tx, events), rx)
}

fn pair(width: u32, height: u32) -> Vec<StreamDescriptor> {
    vec![
        StreamDescriptor::Audio,
        StreamDescriptor::Video {
            resolution: Resolution { width, height },
            frame_rate: Some(25.0),
        },
    ]
}

fn video_only(width: u32, height: u32) -> Vec<StreamDescriptor> {
    vec![StreamDescriptor::Video {
        resolution: Resolution { width, height },
        frame_rate: Some(25.0),
    }]
}

fn snapshot(pins: &[(&str, Vec<StreamDescriptor>)]) -> ContextSnapshot {
    pins.iter()
        .map(|(pin, streams)| (pin.to_string(), streams.clone()))
        .collect()
}

fn overlay_320x180(source: SourceId) -> Overlay {
    Overlay {
        source,
        source_rect: None,
        dest_rect: Some(Rect {
            x: 0,
            y: 0,
            width: 320,
            height: 180,
        }),
    }
}

async fn select(
    state: &mut SwitcherState,
    source: SourceId,
    overlays: Vec<Overlay>,
) -> Result<(), SwitchError> {
    state.handle_select_source(source, overlays, None).await
}

// ------------------------------------------------------------------------
// Bootstrap and availability
// ------------------------------------------------------------------------

#[tokio::test]
async fn test_bootstrap_fallback_ready() {
    let mock = MockPipeline::new();
    let (mut state, _rx) = test_state(&mock);
    state.bootstrap().await.unwrap();

    assert_eq!(state.active.pin, FALLBACK_ID);
    assert_eq!(state.desired.pin, FALLBACK_ID);
    assert!(state.available.contains_key(FALLBACK_ID));
    assert!(state.previews.contains(FALLBACK_ID));

    // test card + silence + preview output, no re-encode for the generators
    assert_eq!(mock.created_count(), 3);
    assert!(mock.switches().is_empty());
}

#[tokio::test]
async fn test_sources_online_get_previews_once() {
    let mock = MockPipeline::new();
    let (mut state, _rx) = test_state(&mock);
    state.bootstrap().await.unwrap();

    let snap = snapshot(&[("cam1", pair(1920, 1080)), ("cam2", pair(1280, 720))]);
    state.handle_context_change(snap.clone()).await;

    assert_eq!(state.available.len(), 3);
    assert!(state.previews.contains("cam1"));
    assert!(state.previews.contains("cam2"));
    // 3 bootstrap nodes + encoder/output per camera
    assert_eq!(mock.created_count(), 7);

    // repeated passes with the same snapshot create nothing further
    state.handle_context_change(snap.clone()).await;
    state.handle_context_change(snap).await;
    assert_eq!(mock.created_count(), 7);
    assert_eq!(state.previews.len(), 3);
}

#[tokio::test]
async fn test_source_offline_tears_preview_down() {
    let mock = MockPipeline::new();
    let (mut state, _rx) = test_state(&mock);
    state.bootstrap().await.unwrap();

    state
        .handle_context_change(snapshot(&[("cam1", pair(1280, 720))]))
        .await;
    assert!(state.previews.contains("cam1"));

    state.handle_context_change(snapshot(&[])).await;
    assert!(!state.previews.contains("cam1"));
    assert!(!state.available.contains_key("cam1"));
    // cam1's encoder and output were closed
    assert_eq!(mock.closed().len(), 2);

    // fallback never goes offline
    assert!(state.available.contains_key(FALLBACK_ID));
    assert!(state.previews.contains(FALLBACK_ID));
}

#[tokio::test]
async fn test_online_offline_events() {
    let mock = MockPipeline::new();
    let (mut state, _rx) = test_state(&mock);
    state.bootstrap().await.unwrap();
    let mut events = state.events.subscribe();

    state
        .handle_context_change(snapshot(&[("cam1", pair(1280, 720))]))
        .await;
    state.handle_context_change(snapshot(&[])).await;

    assert!(matches!(
        events.try_recv().unwrap(),
        SwitcherEvent::SourceOnline { pin } if pin == "cam1"
    ));
    assert!(matches!(
        events.try_recv().unwrap(),
        SwitcherEvent::SourceOffline { pin } if pin == "cam1"
    ));
}

// ------------------------------------------------------------------------
// Switching and fallback policy
// ------------------------------------------------------------------------

#[tokio::test]
async fn test_select_then_fallback_on_stream_drop() {
    let mock = MockPipeline::new();
    let (mut state, _rx) = test_state(&mock);
    state.bootstrap().await.unwrap();

    state
        .handle_context_change(snapshot(&[("cam1", pair(1920, 1080)), ("cam2", pair(1280, 720))]))
        .await;

    select(&mut state, SourceId::new("cam1"), vec![]).await.unwrap();
    assert_eq!(mock.switches(), vec!["cam1"]);
    assert_eq!(state.active.pin, "cam1");

    // cam1 drops to a single stream: fall back, and reset desired so a later
    // flicker does not resurrect the stale target
    state
        .handle_context_change(snapshot(&[
            ("cam1", video_only(1920, 1080)),
            ("cam2", pair(1280, 720)),
        ]))
        .await;
    assert_eq!(mock.switches(), vec!["cam1", FALLBACK_ID]);
    assert_eq!(state.active.pin, FALLBACK_ID);
    assert_eq!(state.desired.pin, FALLBACK_ID);

    // cam1 coming back does not switch by itself
    state
        .handle_context_change(snapshot(&[("cam1", pair(1920, 1080)), ("cam2", pair(1280, 720))]))
        .await;
    assert_eq!(mock.switches(), vec!["cam1", FALLBACK_ID]);
}

#[tokio::test]
async fn test_reconcile_is_idempotent() {
    let mock = MockPipeline::new();
    let (mut state, _rx) = test_state(&mock);
    state.bootstrap().await.unwrap();

    let snap = snapshot(&[("cam1", pair(1280, 720))]);
    state.handle_context_change(snap.clone()).await;
    select(&mut state, SourceId::new("cam1"), vec![]).await.unwrap();
    assert_eq!(mock.switches().len(), 1);

    state.handle_context_change(snap.clone()).await;
    state.handle_context_change(snap).await;
    state.reconcile().await;
    assert_eq!(mock.switches().len(), 1);
}

#[tokio::test]
async fn test_desired_wins_over_fallback_once_available() {
    let mock = MockPipeline::new();
    let (mut state, _rx) = test_state(&mock);
    state.bootstrap().await.unwrap();

    // on fallback with a desired target that is not yet reachable
    state.desired = Selection::solo(SourceId::new("cam1"));
    state.reconcile().await;
    assert!(mock.switches().is_empty());
    assert_eq!(state.active.pin, FALLBACK_ID);

    // the pass after cam1 appears issues exactly one switch to it
    let snap = snapshot(&[("cam1", pair(1280, 720))]);
    state.handle_context_change(snap.clone()).await;
    assert_eq!(mock.switches(), vec!["cam1"]);
    assert_eq!(state.active.pin, "cam1");

    state.handle_context_change(snap).await;
    assert_eq!(mock.switches().len(), 1);
}

#[tokio::test]
async fn test_select_unavailable_source_is_noop() {
    let mock = MockPipeline::new();
    let (mut state, _rx) = test_state(&mock);
    state.bootstrap().await.unwrap();

    let result = select(&mut state, SourceId::new("cam9"), vec![]).await;
    assert_eq!(
        result,
        Err(SwitchError::SourceUnavailable("cam9".to_string()))
    );
    assert_eq!(state.desired.pin, FALLBACK_ID);
    assert!(mock.switches().is_empty());
}

#[tokio::test]
async fn test_fade_bound() {
    let mock = MockPipeline::new();
    let (mut state, _rx) = test_state(&mock);
    state.bootstrap().await.unwrap();
    state
        .handle_context_change(snapshot(&[("cam1", pair(1280, 720))]))
        .await;

    let result = state
        .handle_select_source(SourceId::new("cam1"), vec![], Some(1500))
        .await;
    assert_eq!(result, Err(SwitchError::FadeTooLong(1500)));
    assert!(mock.switches().is_empty());

    state
        .handle_select_source(SourceId::new("cam1"), vec![], Some(500))
        .await
        .unwrap();
    assert_eq!(mock.switches(), vec!["cam1"]);
}

#[tokio::test]
async fn test_active_frozen_when_nothing_reachable() {
    let mock = MockPipeline::new();
    let (mut state, _rx) = test_state(&mock);
    // no bootstrap: fallback is not available either
    state.desired = Selection::solo(SourceId::new("cam1"));
    state.active = Selection::solo(SourceId::new("cam1"));

    state.handle_context_change(snapshot(&[])).await;
    assert_eq!(state.active.pin, "cam1");
    assert!(mock.switches().is_empty());
    assert!(mock.closed().is_empty());
}

// ------------------------------------------------------------------------
// Compose jobs
// ------------------------------------------------------------------------

#[tokio::test]
async fn test_compose_lifecycle() {
    let mock = MockPipeline::new();
    let (mut state, mut rx) = test_state(&mock);
    state.bootstrap().await.unwrap();
    state
        .handle_context_change(snapshot(&[("cam1", pair(1920, 1080)), ("cam2", pair(1280, 720))]))
        .await;
    let nodes_before = mock.created_count();

    select(
        &mut state,
        SourceId::new("cam1"),
        vec![overlay_320x180(SourceId::new("cam2"))],
    )
    .await
    .unwrap();
    assert_eq!(state.compose.pending_id(), Some(1));
    // desired is untouched until the job exists
    assert_eq!(state.desired.pin, FALLBACK_ID);

    // provisioning completes: compose node + video/audio fixes
    let ready = rx.recv().await.unwrap();
    state.handle_command(ready).await;
    assert_eq!(mock.created_count(), nodes_before + 3);
    assert_eq!(state.desired.pin, "compose__1");
    assert!(mock.switches().is_empty());

    // the composite starts streaming: reconcile switches to it, but the job
    // is not committed active yet
    let snap = snapshot(&[
        ("cam1", pair(1920, 1080)),
        ("cam2", pair(1280, 720)),
        ("compose__1", pair(1920, 1080)),
    ]);
    state.handle_context_change(snap).await;
    assert_eq!(mock.switches(), vec!["compose__1"]);
    assert_eq!(state.active.pin, "compose__1");
    assert_eq!(state.compose.pending_id(), Some(1));
    // the backing pin got no preview of its own
    assert!(!state.previews.contains("compose__1"));
    assert_eq!(mock.created_count(), nodes_before + 3);

    // transition-complete commits the job
    state.handle_transition_complete("compose__1".to_string()).await;
    assert_eq!(state.compose.pending_id(), None);
    assert_eq!(state.compose.active_pin().as_deref(), Some("compose__1"));
    assert!(mock.closed().is_empty());
}

#[tokio::test]
async fn test_new_active_compose_closes_previous() {
    let mock = MockPipeline::new();
    let (mut state, mut rx) = test_state(&mock);
    state.bootstrap().await.unwrap();
    state
        .handle_context_change(snapshot(&[("cam1", pair(1920, 1080)), ("cam2", pair(1280, 720))]))
        .await;

    // first composite on air
    select(
        &mut state,
        SourceId::new("cam1"),
        vec![overlay_320x180(SourceId::new("cam2"))],
    )
    .await
    .unwrap();
    let ready = rx.recv().await.unwrap();
    state.handle_command(ready).await;
    let job1_first_handle = mock.last_handle() - 2;
    state
        .handle_context_change(snapshot(&[
            ("cam1", pair(1920, 1080)),
            ("cam2", pair(1280, 720)),
            ("compose__1", pair(1920, 1080)),
        ]))
        .await;
    state.handle_transition_complete("compose__1".to_string()).await;
    assert!(mock.closed().is_empty());

    // second composite replaces it on commit
    select(
        &mut state,
        SourceId::new("cam2"),
        vec![overlay_320x180(SourceId::new("cam1"))],
    )
    .await
    .unwrap();
    let ready = rx.recv().await.unwrap();
    state.handle_command(ready).await;
    state
        .handle_context_change(snapshot(&[
            ("cam1", pair(1920, 1080)),
            ("cam2", pair(1280, 720)),
            ("compose__1", pair(1920, 1080)),
            ("compose__2", pair(1280, 720)),
        ]))
        .await;
    state.handle_transition_complete("compose__2".to_string()).await;

    assert_eq!(state.compose.active_pin().as_deref(), Some("compose__2"));
    let closed = mock.closed();
    assert_eq!(
        closed,
        vec![
            NodeHandle(job1_first_handle),
            NodeHandle(job1_first_handle + 1),
            NodeHandle(job1_first_handle + 2),
        ]
    );
}

#[tokio::test]
async fn test_switch_away_closes_active_compose() {
    let mock = MockPipeline::new();
    let (mut state, mut rx) = test_state(&mock);
    state.bootstrap().await.unwrap();
    state
        .handle_context_change(snapshot(&[("cam1", pair(1920, 1080)), ("cam2", pair(1280, 720))]))
        .await;

    select(
        &mut state,
        SourceId::new("cam1"),
        vec![overlay_320x180(SourceId::new("cam2"))],
    )
    .await
    .unwrap();
    let ready = rx.recv().await.unwrap();
    state.handle_command(ready).await;
    state
        .handle_context_change(snapshot(&[
            ("cam1", pair(1920, 1080)),
            ("cam2", pair(1280, 720)),
            ("compose__1", pair(1920, 1080)),
        ]))
        .await;
    state.handle_transition_complete("compose__1".to_string()).await;
    assert!(mock.closed().is_empty());

    // back to a plain source: the composite is no longer used once the
    // transition lands
    select(&mut state, SourceId::new("cam1"), vec![]).await.unwrap();
    assert_eq!(state.active.pin, "cam1");
    assert_eq!(state.compose.active_pin().as_deref(), Some("compose__1"));

    state.handle_transition_complete("cam1".to_string()).await;
    assert!(state.compose.active_pin().is_none());
    assert_eq!(mock.closed().len(), 3);
}

#[tokio::test]
async fn test_supersession_closes_first_job_exactly_once() {
    let mock = MockPipeline::new();
    let (mut state, mut rx) = test_state(&mock);
    state.bootstrap().await.unwrap();
    state
        .handle_context_change(snapshot(&[("cam1", pair(1920, 1080)), ("cam2", pair(1280, 720))]))
        .await;

    // keep both provisioning runs in flight
    mock.gate_creates();
    select(
        &mut state,
        SourceId::new("cam1"),
        vec![overlay_320x180(SourceId::new("cam2"))],
    )
    .await
    .unwrap();
    select(
        &mut state,
        SourceId::new("cam2"),
        vec![overlay_320x180(SourceId::new("cam1"))],
    )
    .await
    .unwrap();
    assert_eq!(state.compose.pending_id(), Some(2));

    // let both jobs finish building; the first completion is stale
    mock.release(6);
    for _ in 0..2 {
        let cmd = rx.recv().await.unwrap();
        state.handle_command(cmd).await;
    }

    assert_eq!(state.compose.pending_id(), Some(2));
    assert_eq!(state.desired.pin, "compose__2");

    let closed = mock.closed();
    assert_eq!(closed.len(), 3, "first job's resources closed");
    let mut unique = closed.clone();
    unique.sort_by_key(|h| h.0);
    unique.dedup();
    assert_eq!(unique.len(), 3, "each resource closed exactly once");
}

#[tokio::test]
async fn test_compose_failure_closes_partials() {
    let mock = MockPipeline::new();
    let (mut state, mut rx) = test_state(&mock);
    state.bootstrap().await.unwrap();
    state
        .handle_context_change(snapshot(&[("cam1", pair(1920, 1080)), ("cam2", pair(1280, 720))]))
        .await;

    // compose node succeeds, the first stream fix fails
    mock.fail_after_more(1);
    select(
        &mut state,
        SourceId::new("cam1"),
        vec![overlay_320x180(SourceId::new("cam2"))],
    )
    .await
    .unwrap();

    let cmd = rx.recv().await.unwrap();
    state.handle_command(cmd).await;

    assert_eq!(state.compose.pending_id(), None);
    assert_eq!(state.desired.pin, FALLBACK_ID);
    assert_eq!(mock.closed().len(), 1, "partially-created node closed");
    assert!(mock.switches().is_empty());
}

#[tokio::test]
async fn test_stale_transition_ack_does_not_promote() {
    let mock = MockPipeline::new();
    let (mut state, mut rx) = test_state(&mock);
    state.bootstrap().await.unwrap();
    state
        .handle_context_change(snapshot(&[("cam1", pair(1920, 1080)), ("cam2", pair(1280, 720))]))
        .await;

    select(
        &mut state,
        SourceId::new("cam1"),
        vec![overlay_320x180(SourceId::new("cam2"))],
    )
    .await
    .unwrap();
    let ready = rx.recv().await.unwrap();
    state.handle_command(ready).await;

    let mut events = state.events.subscribe();
    // an ack for some other pin must not promote the pending job, but still
    // notifies observers of the change
    state.handle_transition_complete("cam2".to_string()).await;
    assert_eq!(state.compose.pending_id(), Some(1));
    assert!(state.compose.active_pin().is_none());
    assert!(matches!(
        events.try_recv().unwrap(),
        SwitcherEvent::ActiveChanged { pin } if pin == "cam2"
    ));
}

// ------------------------------------------------------------------------
// Status
// ------------------------------------------------------------------------

#[tokio::test]
async fn test_status_excludes_compose_backing_pins() {
    let mock = MockPipeline::new();
    let (mut state, mut rx) = test_state(&mock);
    state.bootstrap().await.unwrap();
    state
        .handle_context_change(snapshot(&[("cam1", pair(1920, 1080)), ("cam2", pair(1280, 720))]))
        .await;

    select(
        &mut state,
        SourceId::new("cam1"),
        vec![overlay_320x180(SourceId::new("cam2"))],
    )
    .await
    .unwrap();
    let ready = rx.recv().await.unwrap();
    state.handle_command(ready).await;
    state
        .handle_context_change(snapshot(&[
            ("cam1", pair(1920, 1080)),
            ("cam2", pair(1280, 720)),
            ("compose__1", pair(1920, 1080)),
        ]))
        .await;

    let status = state.status();
    let pins: Vec<String> = status
        .available
        .iter()
        .map(|s| s.source.pin())
        .collect();
    assert_eq!(pins, vec!["cam1", "cam2", FALLBACK_ID]);
    assert_eq!(status.active.pin, "compose__1");
    assert_eq!(status.active.overlays.len(), 1);
}
