use std::collections::HashMap;

use crate::pipeline::{MediaPipeline, NodeConfig, NodeHandle, StreamSelector, SubscribeInput};

/// Preview resources for one pin: the output itself and, for sources that
/// need a cheap re-encode, the low-bitrate encoder feeding it.
#[derive(Debug)]
struct PreviewEntry {
    output: NodeHandle,
    encoder: Option<NodeHandle>,
}

/// Registry of per-source preview outputs, keyed by pin. Owned by the
/// switcher; entries are created on first need and destroyed when the source
/// goes offline.
#[derive(Debug, Default)]
pub struct PreviewRegistry {
    entries: HashMap<String, PreviewEntry>,
}

impl PreviewRegistry {
    #[allow(dead_code)]
    pub fn contains(&self, pin: &str) -> bool {
        self.entries.contains_key(pin)
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Creates the preview path for `pin` unless one already exists.
    /// `reencode` selects the cheap low-bitrate encoder in front of the
    /// output; the fallback generators are already cheap and skip it.
    pub async fn ensure(
        &mut self,
        pipeline: &dyn MediaPipeline,
        pin: &str,
        reencode: bool,
        bitrate: u64,
    ) -> anyhow::Result<()> {
        if self.entries.contains_key(pin) {
            return Ok(());
        }

        let encoder = if reencode {
            Some(
                pipeline
                    .create_node(NodeConfig::PreviewEncoder {
                        pin: pin.to_string(),
                        bitrate,
                    })
                    .await?,
            )
        } else {
            None
        };

        let output = pipeline
            .create_node(NodeConfig::PreviewOutput {
                pin: pin.to_string(),
            })
            .await;
        let output = match output {
            Ok(output) => output,
            Err(e) => {
                if let Some(encoder) = encoder {
                    let _ = pipeline.close(encoder).await;
                }
                return Err(e);
            }
        };

        let inputs = match encoder {
            Some(encoder) => vec![
                SubscribeInput::node(encoder, StreamSelector::Video),
                SubscribeInput::pin(pin, StreamSelector::Audio),
            ],
            None => vec![SubscribeInput::pin(pin, StreamSelector::Both)],
        };
        pipeline.subscribe(output, &inputs).await?;

        log::debug!("preview: provisioned for {}", pin);
        self.entries.insert(pin.to_string(), PreviewEntry { output, encoder });
        Ok(())
    }

    /// Tears down the preview path for `pin`, if any.
    pub async fn remove(&mut self, pipeline: &dyn MediaPipeline, pin: &str) {
        let Some(entry) = self.entries.remove(pin) else {
            return;
        };
        if let Err(e) = pipeline.close(entry.output).await {
            log::warn!("preview: close of output for {} failed: {:#}", pin, e);
        }
        if let Some(encoder) = entry.encoder {
            if let Err(e) = pipeline.close(encoder).await {
                log::warn!("preview: close of encoder for {} failed: {:#}", pin, e);
            }
        }
        log::debug!("preview: removed for {}", pin);
    }

    pub async fn close_all(&mut self, pipeline: &dyn MediaPipeline) {
        let pins: Vec<String> = self.entries.keys().cloned().collect();
        for pin in pins {
            self.remove(pipeline, &pin).await;
        }
    }
}
