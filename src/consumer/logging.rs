use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use super::{AutoAck, DecoderEvents, FrameConsumer};
use crate::core::Frame;

/// Logs every delivered frame instead of decoding it.
#[derive(Debug, Default)]
pub struct LoggingConsumer {
    ack: AutoAck,
    frames: u64,
}

impl LoggingConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }
}

#[async_trait]
impl FrameConsumer for LoggingConsumer {
    async fn realize(&mut self, events: DecoderEvents, audible: bool) -> Result<()> {
        info!(audible, "decoder realized");
        self.ack.realize(events);
        Ok(())
    }

    async fn start(&mut self) -> Result<()> {
        info!("decoder started");
        self.ack.start();
        Ok(())
    }

    async fn deliver(&mut self, frame: Option<Frame>) -> Result<()> {
        match frame {
            Some(frame) => {
                self.frames += 1;
                self.ack.frame(&frame);
                for payload in &frame.payloads {
                    info!(
                        channel = %payload.channel,
                        start = payload.start,
                        duration = payload.duration,
                        bytes = payload.data.len(),
                        "frame"
                    );
                }
            }
            None => info!(total = self.frames, "end of stream"),
        }
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        info!("decoder stopped");
        self.ack.stop();
        Ok(())
    }
}
