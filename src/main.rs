use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::pipeline::{PipelineEvent, stub::StubPipeline};
use crate::switcher::{Switcher, SwitcherEvent, SwitcherHandle};
use crate::switcher::types::Resolution;

mod api;
mod config;
mod handler;
mod pipeline;
mod switcher;

fn init_logging() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();
}

#[tokio::main]
async fn main() -> ! {
    init_logging();
    let config = config::config();

    let cancel = CancellationToken::new();

    let (events_tx, events_rx) = mpsc::channel(64);
    let pipeline = Arc::new(StubPipeline::new(events_tx));
    for pin in config.demo_sources() {
        pipeline.add_source(
            pin,
            Resolution {
                width: 1280,
                height: 720,
            },
            25.0,
        );
    }

    let handle = Switcher::start(pipeline, cancel.clone());
    forward_pipeline_events(events_rx, handle.clone());
    log_on_air_changes(&handle);
    api::start_api_server(handle, cancel.clone());

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break;
            },
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
            },
        }
    }

    std::process::exit(0);
}

/// Funnels engine events into the switcher's serialized command channel.
fn forward_pipeline_events(mut events_rx: mpsc::Receiver<PipelineEvent>, handle: SwitcherHandle) {
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                PipelineEvent::ContextChange(snapshot) => {
                    handle.context_change(snapshot).await;
                }
                PipelineEvent::TransitionComplete { pin } => {
                    handle.transition_complete(pin).await;
                }
            }
        }
    });
}

fn log_on_air_changes(handle: &SwitcherHandle) {
    let mut events = handle.subscribe_events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SwitcherEvent::ActiveChanged { pin }) => log::info!("on air: {}", pin),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
