//! Vision inference provider interface
//!
//! The detector itself is external. The engine only drives it through
//! [`VisionProvider`] and pulls frames at the configured sampling interval;
//! any provider error is treated as "no frame this cycle".

use crate::config::VisionConfig;
use crate::error::IntegrityError;
use crate::types::VisionFrame;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// Contract the engine requires from a face/gaze/object detector
#[async_trait]
pub trait VisionProvider: Send + Sync {
    /// Load models; false means inference is unavailable
    async fn initialize(&self, config: &VisionConfig) -> bool;

    /// Load the reference image used for identity scoring
    async fn load_reference_image(&self, url: &str) -> bool;

    /// Begin consuming the given video source
    async fn start(&self, video_source: &str);

    /// Release the video source
    async fn stop(&self);

    /// Latest inference result, if one is ready
    async fn next_frame(&self) -> Result<Option<VisionFrame>, IntegrityError>;

    /// Still image from the camera, used as the camera readiness check
    async fn capture_snapshot(&self) -> Option<Vec<u8>>;
}

/// Spawn the frame pump.
///
/// Polls `provider` every `config.sampling_interval()` and forwards frames
/// to `frames`. Frames captured closer together than the sampling interval
/// are dropped so the downstream rate stays bounded even if the provider
/// buffers. On cancellation the provider is stopped before the task exits.
pub fn spawn_frame_pump(
    provider: Arc<dyn VisionProvider>,
    config: &VisionConfig,
    frames: mpsc::Sender<VisionFrame>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let interval = config.sampling_interval();
    let min_gap = chrono::Duration::milliseconds(config.sampling_interval_ms as i64);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_captured: Option<chrono::DateTime<chrono::Utc>> = None;

        info!("Vision frame pump started");

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                _ = ticker.tick() => {
                    let frame = match provider.next_frame().await {
                        Ok(Some(frame)) => frame,
                        Ok(None) => {
                            trace!("No vision frame this cycle");
                            continue;
                        }
                        Err(e) => {
                            debug!(error = %e, "Vision provider failed; skipping cycle");
                            continue;
                        }
                    };

                    if let Some(last) = last_captured {
                        if frame.captured_at - last < min_gap {
                            trace!("Dropping frame captured inside sampling interval");
                            continue;
                        }
                    }
                    last_captured = Some(frame.captured_at);

                    if frames.try_send(frame).is_err() {
                        // Receiver is full or gone; a stale frame is worthless.
                        trace!("Frame channel unavailable; frame dropped");
                    }
                }
            }
        }

        provider.stop().await;
        info!("Vision frame pump stopped");
    })
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedVision;
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeSet;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn frame(sec: u32) -> VisionFrame {
        VisionFrame {
            face_count: 1,
            identity_score: 0.9,
            gaze_deviation: 0.1,
            detected_objects: BTreeSet::new(),
            captured_at: Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, sec).unwrap(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pump_skips_errors_and_forwards_frames() {
        let provider = Arc::new(ScriptedVision::healthy());
        provider.push(Err(IntegrityError::InferenceUnavailable("model".into())));
        provider.push(Ok(Some(frame(1))));
        provider.push(Ok(None));
        provider.push(Ok(Some(frame(3))));

        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let handle = spawn_frame_pump(provider.clone(), &VisionConfig::default(), tx, cancel.clone());

        assert_eq!(rx.recv().await.unwrap(), frame(1));
        assert_eq!(rx.recv().await.unwrap(), frame(3));

        cancel.cancel();
        handle.await.unwrap();
        assert!(provider.stopped.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pump_drops_frames_inside_sampling_interval() {
        let provider = Arc::new(ScriptedVision::healthy());
        let mut burst = frame(1);
        provider.push(Ok(Some(burst.clone())));
        burst.captured_at += chrono::Duration::milliseconds(200);
        provider.push(Ok(Some(burst)));
        provider.push(Ok(Some(frame(5))));

        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let handle = spawn_frame_pump(provider.clone(), &VisionConfig::default(), tx, cancel.clone());

        assert_eq!(rx.recv().await.unwrap(), frame(1));
        assert_eq!(rx.recv().await.unwrap(), frame(5));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_pump_stops_polling_after_cancel() {
        let provider = Arc::new(ScriptedVision::healthy());
        let (tx, _rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let handle = spawn_frame_pump(provider.clone(), &VisionConfig::default(), tx, cancel.clone());

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        cancel.cancel();
        handle.await.unwrap();

        let polls = provider.polls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(provider.polls.load(Ordering::SeqCst), polls);
    }
}
