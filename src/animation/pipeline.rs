//! # Lip-Sync Pipeline
//!
//! Per-session glue between upstream events and the viseme scheduler.
//!
//! ## Data Flow:
//! ```text
//! response.audio.delta ─base64─▶ AnalyzerWorker ─AnalyzedChunk─▶ set_target_at
//! response.audio_transcript.delta ─phonemes─▶ enqueue
//!                                  VisemeScheduler ─▶ FrameOutbox ─▶ client
//! ```
//!
//! Analysis runs on its own task so a large audio delta never stalls the
//! session. Results come back as a stream; each carries the session liveness
//! flag and an interruption epoch captured at submission, so results that
//! arrive after teardown or after a barge-in are dropped.

use crate::animation::phonemes::TranscriptVisemes;
use crate::animation::scheduler::{AnimationSink, SchedulerStats, VisemeScheduler};
use crate::animation::viseme::{Viseme, VisemeWeightSet};
use crate::audio::analyzer::{AnalyzerConfig, AnalyzerStats, AudioFrameAnalyzer, VisemeFrame};
use crate::config::{AnimationConfig, AnimationMode};
use crate::error::RelayError;
use crate::relay::event::{animation_tap, AnimationTap, RealtimeEvent};
use crate::relay::session::SessionLiveness;
use base64::prelude::{Engine as _, BASE64_STANDARD};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, trace, warn};

/// Relay-originated animation messages sent to the client alongside the
/// forwarded upstream traffic.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum AnimationMessage {
    #[serde(rename = "relay.animation.frame")]
    Frame { weights: VisemeWeightSet },
    #[serde(rename = "relay.animation.reset")]
    Reset,
}

/// Sink that batches weight updates into client messages. Updates between
/// two drains become one frame; a reset splits the batch.
#[derive(Debug, Default)]
pub struct FrameOutbox {
    pending: VisemeWeightSet,
    messages: Vec<AnimationMessage>,
}

impl FrameOutbox {
    pub fn drain(&mut self) -> Vec<AnimationMessage> {
        self.flush();
        std::mem::take(&mut self.messages)
    }

    fn flush(&mut self) {
        if !self.pending.is_empty() {
            let weights = std::mem::take(&mut self.pending);
            self.messages.push(AnimationMessage::Frame { weights });
        }
    }
}

impl AnimationSink for FrameOutbox {
    fn set_weight(&mut self, viseme: Viseme, weight: f32) {
        self.pending.insert(viseme, weight);
    }

    fn reset(&mut self) {
        self.flush();
        self.messages.push(AnimationMessage::Reset);
    }
}

struct AnalysisJob {
    audio: Vec<u8>,
    liveness: SessionLiveness,
    epoch: u64,
}

/// Result of analyzing one audio delta.
#[derive(Debug)]
pub struct AnalyzedChunk {
    pub frames: Vec<VisemeFrame>,
    /// Playback length of the delta
    pub duration: Duration,
    pub stats: AnalyzerStats,
    liveness: SessionLiveness,
    epoch: u64,
}

/// Background task owning one `AudioFrameAnalyzer`.
#[derive(Debug)]
pub struct AnalyzerWorker {
    jobs: mpsc::UnboundedSender<AnalysisJob>,
}

impl AnalyzerWorker {
    /// Spawn the worker. The returned stream yields one chunk per submitted
    /// job and ends once the worker is dropped.
    pub fn spawn(config: AnalyzerConfig) -> (Self, UnboundedReceiverStream<AnalyzedChunk>) {
        let (job_tx, mut job_rx) = mpsc::unbounded_channel::<AnalysisJob>();
        let (result_tx, result_rx) = mpsc::unbounded_channel::<AnalyzedChunk>();

        tokio::spawn(async move {
            let mut analyzer = AudioFrameAnalyzer::new(config);
            let mut epoch = 0;

            while let Some(job) = job_rx.recv().await {
                if !job.liveness.is_alive() {
                    debug!("Skipping analysis for a closed session");
                    continue;
                }

                // Samples carried from an interrupted response must not
                // complete a frame of the next one
                if job.epoch != epoch {
                    trace!(from = epoch, to = job.epoch, "Resetting analyzer after interruption");
                    analyzer.reset();
                    epoch = job.epoch;
                }

                let frames = analyzer.process_bytes(&job.audio);
                let chunk = AnalyzedChunk {
                    frames,
                    duration: analyzer.duration_of(job.audio.len() / 2),
                    stats: analyzer.stats(),
                    liveness: job.liveness,
                    epoch: job.epoch,
                };

                if result_tx.send(chunk).is_err() {
                    break;
                }
            }
        });

        (Self { jobs: job_tx }, UnboundedReceiverStream::new(result_rx))
    }

    fn submit(&self, job: AnalysisJob) -> Result<(), RelayError> {
        self.jobs
            .send(job)
            .map_err(|_| RelayError::InvalidAudio("analyzer worker has stopped".to_string()))
    }
}

/// One session's lip-sync state.
///
/// `now` arguments are elapsed time since the session started; the caller
/// owns the clock.
#[derive(Debug)]
pub struct LipSync {
    mode: AnimationMode,
    scheduler: VisemeScheduler,
    transcript: TranscriptVisemes,
    worker: Option<AnalyzerWorker>,
    liveness: SessionLiveness,
    /// End of the audio already laid out on the timeline
    playhead: Duration,
    epoch: u64,
    neutral: VisemeWeightSet,
    outbox: FrameOutbox,
    analyzer_stats: AnalyzerStats,
}

impl LipSync {
    /// Build the pipeline. Continuous mode also returns the analysis result
    /// stream, which the caller must feed back through [`LipSync::apply_analysis`].
    pub fn new(
        config: &AnimationConfig,
        liveness: SessionLiveness,
    ) -> (Self, Option<UnboundedReceiverStream<AnalyzedChunk>>) {
        let (worker, results) = match config.mode {
            AnimationMode::Continuous => {
                let (worker, results) = AnalyzerWorker::spawn(config.analyzer_config());
                (Some(worker), Some(results))
            }
            AnimationMode::Discrete => (None, None),
        };

        let neutral = VisemeWeightSet::from_pairs(config.bands.iter().map(|band| (band.viseme, 0.0)));

        let lip_sync = Self {
            mode: config.mode,
            scheduler: VisemeScheduler::new(config.scheduler_config()),
            transcript: TranscriptVisemes::new(config.phoneme_duration()),
            worker,
            liveness,
            playhead: Duration::ZERO,
            epoch: 0,
            neutral,
            outbox: FrameOutbox::default(),
            analyzer_stats: AnalyzerStats::default(),
        };

        (lip_sync, results)
    }

    pub fn scheduler_stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    pub fn analyzer_stats(&self) -> AnalyzerStats {
        self.analyzer_stats
    }

    /// Earliest time [`LipSync::drive`] has work to do.
    pub fn next_deadline(&self) -> Option<Duration> {
        self.scheduler.next_deadline()
    }

    /// Feed an upstream event through the dispatch table.
    pub fn handle_event(&mut self, event: &RealtimeEvent, now: Duration) -> Result<(), RelayError> {
        match (animation_tap(event.kind()), self.mode) {
            (AnimationTap::AudioDelta, AnimationMode::Continuous) => {
                let delta = event.str_field("delta").unwrap_or_default();
                let audio = BASE64_STANDARD
                    .decode(delta)
                    .map_err(|e| RelayError::InvalidAudio(e.to_string()))?;
                self.submit_audio(audio)
            }
            (AnimationTap::AudioDone, AnimationMode::Continuous) => {
                // Close the mouth once the scheduled audio has played out
                let at = self.playhead.max(now);
                self.scheduler.set_target_at(self.neutral.clone(), at);
                Ok(())
            }
            (AnimationTap::TranscriptDelta, AnimationMode::Discrete) => {
                let delta = event.str_field("delta").unwrap_or_default();
                for scheduled in self.transcript.push_delta(delta) {
                    self.scheduler.enqueue(scheduled, now);
                }
                Ok(())
            }
            (AnimationTap::TranscriptDone, AnimationMode::Discrete) => {
                for scheduled in self.transcript.finish() {
                    self.scheduler.enqueue(scheduled, now);
                }
                Ok(())
            }
            (AnimationTap::Interrupted, _) => {
                self.interrupt();
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Lay an analyzed chunk onto the timeline after the audio before it.
    pub fn apply_analysis(&mut self, chunk: AnalyzedChunk, now: Duration) {
        if !chunk.liveness.is_alive() {
            debug!(frames = chunk.frames.len(), "Discarding analysis delivered after teardown");
            return;
        }
        if chunk.epoch != self.epoch {
            trace!("Discarding analysis from before an interruption");
            return;
        }

        let start = self.playhead.max(now);
        trace!(
            frames = chunk.frames.len(),
            dominant = ?chunk.frames.first().and_then(|frame| frame.weights.dominant()),
            start_ms = start.as_millis() as u64,
            "Laying out analysis"
        );
        for frame in chunk.frames {
            self.scheduler.set_target_at(frame.weights, start + frame.time_offset);
        }
        self.playhead = start + chunk.duration;
        self.analyzer_stats = chunk.stats;
    }

    /// Run due scheduler work and collect the resulting client messages.
    pub fn drive(&mut self, now: Duration) -> Vec<AnimationMessage> {
        let executed = self.scheduler.advance(now, &mut self.outbox);
        if executed > 0 {
            trace!(
                executed,
                phase = ?self.scheduler.phase(),
                queued = self.scheduler.queued(),
                driving = self.scheduler.is_driving(),
                settled = self.scheduler.state().is_settled(),
                "Animation driven"
            );
        }
        self.outbox.drain()
    }

    /// Drop everything pending and return to neutral.
    pub fn interrupt(&mut self) {
        self.epoch += 1;
        self.playhead = Duration::ZERO;
        self.transcript.clear();
        self.scheduler.clear(&mut self.outbox);
    }

    /// Stop the analysis worker. Pending results will be discarded.
    pub fn shutdown(&mut self) {
        self.worker = None;
    }

    fn submit_audio(&mut self, audio: Vec<u8>) -> Result<(), RelayError> {
        let Some(worker) = self.worker.as_ref() else {
            warn!("Audio delta received without an analyzer");
            return Ok(());
        };

        worker.submit(AnalysisJob {
            audio,
            liveness: self.liveness.clone(),
            epoch: self.epoch,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use futures_util::StreamExt;
    use std::f32::consts::PI;

    fn animation_config(mode: AnimationMode) -> AnimationConfig {
        let mut config = AppConfig::default().animation;
        config.enabled = true;
        config.mode = mode;
        config
    }

    fn event(text: &str) -> RealtimeEvent {
        RealtimeEvent::parse(text).unwrap()
    }

    fn tone_bytes(freq: f32, len: usize) -> Vec<u8> {
        (0..len)
            .map(|n| ((2.0 * PI * freq * n as f32 / 24_000.0).sin() * 0.5 * 32767.0) as i16)
            .flat_map(|s| s.to_le_bytes())
            .collect()
    }

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn test_outbox_batches_and_splits_on_reset() {
        let mut outbox = FrameOutbox::default();
        outbox.set_weight(Viseme::Aa, 0.5);
        outbox.set_weight(Viseme::O, 0.25);
        outbox.reset();
        outbox.set_weight(Viseme::E, 1.0);

        let messages = outbox.drain();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1], AnimationMessage::Reset);
        assert!(outbox.drain().is_empty());
    }

    #[test]
    fn test_animation_message_wire_format() {
        let frame = AnimationMessage::Frame {
            weights: VisemeWeightSet::from_pairs([(Viseme::Aa, 0.5)]),
        };
        assert_eq!(
            serde_json::to_string(&frame).unwrap(),
            r#"{"type":"relay.animation.frame","weights":{"viseme_aa":0.5}}"#
        );
        assert_eq!(
            serde_json::to_string(&AnimationMessage::Reset).unwrap(),
            r#"{"type":"relay.animation.reset"}"#
        );
    }

    #[test]
    fn test_discrete_mode_animates_transcript() {
        let (mut lip_sync, results) = LipSync::new(&animation_config(AnimationMode::Discrete), SessionLiveness::new());
        assert!(results.is_none());

        lip_sync
            .handle_event(&event(r#"{"type":"response.audio_transcript.delta","delta":"hello "}"#), ms(0))
            .unwrap();

        // "hello" starts with HH, which opens the mouth
        let messages = lip_sync.drive(ms(0));
        assert_eq!(
            messages,
            vec![AnimationMessage::Frame {
                weights: VisemeWeightSet::from_pairs([(Viseme::Aa, 0.5)])
            }]
        );
        assert_eq!(lip_sync.next_deadline(), Some(ms(100)));
    }

    #[test]
    fn test_discrete_mode_ignores_audio() {
        let (mut lip_sync, _) = LipSync::new(&animation_config(AnimationMode::Discrete), SessionLiveness::new());
        lip_sync
            .handle_event(&event(r#"{"type":"response.audio.delta","delta":"AAAA"}"#), ms(0))
            .unwrap();
        assert_eq!(lip_sync.next_deadline(), None);
    }

    #[test]
    fn test_barge_in_resets_to_neutral() {
        let (mut lip_sync, _) = LipSync::new(&animation_config(AnimationMode::Discrete), SessionLiveness::new());
        lip_sync
            .handle_event(&event(r#"{"type":"response.audio_transcript.delta","delta":"how are you "}"#), ms(0))
            .unwrap();
        lip_sync.drive(ms(0));

        lip_sync
            .handle_event(&event(r#"{"type":"input_audio_buffer.speech_started"}"#), ms(50))
            .unwrap();
        let messages = lip_sync.drive(ms(50));

        assert_eq!(messages, vec![AnimationMessage::Reset]);
        assert_eq!(lip_sync.next_deadline(), None);
    }

    #[actix_web::test]
    async fn test_continuous_mode_animates_audio() {
        let (mut lip_sync, results) =
            LipSync::new(&animation_config(AnimationMode::Continuous), SessionLiveness::new());
        let mut results = results.expect("continuous mode has an analysis stream");

        let delta = BASE64_STANDARD.encode(tone_bytes(300.0, 1440));
        let text = format!(r#"{{"type":"response.audio.delta","delta":"{}"}}"#, delta);
        lip_sync.handle_event(&event(&text), ms(0)).unwrap();

        let chunk = results.next().await.expect("analysis result");
        assert_eq!(chunk.frames.len(), 2);
        assert_eq!(chunk.duration, ms(60));

        lip_sync.apply_analysis(chunk, ms(0));
        lip_sync
            .handle_event(&event(r#"{"type":"response.audio.done"}"#), ms(0))
            .unwrap();

        let mut frames = 0;
        let mut now = 0;
        while let Some(deadline) = lip_sync.next_deadline() {
            now = now.max(deadline.as_millis() as u64);
            frames += lip_sync.drive(ms(now)).len();
            assert!(now < 10_000, "animation never settled");
        }

        assert!(frames > 0);
        assert!(lip_sync.analyzer_stats().frames_analyzed >= 2);
    }

    #[actix_web::test]
    async fn test_interruption_drops_carried_audio() {
        let (mut lip_sync, results) =
            LipSync::new(&animation_config(AnimationMode::Continuous), SessionLiveness::new());
        let mut results = results.expect("continuous mode has an analysis stream");

        let delta = |len: usize| {
            let audio = BASE64_STANDARD.encode(tone_bytes(300.0, len));
            event(&format!(r#"{{"type":"response.audio.delta","delta":"{}"}}"#, audio))
        };

        // 500 samples stay carried, short of one 720-sample frame
        lip_sync.handle_event(&delta(500), ms(0)).unwrap();
        let chunk = results.next().await.expect("analysis result");
        assert!(chunk.frames.is_empty());
        lip_sync.apply_analysis(chunk, ms(0));

        lip_sync
            .handle_event(&event(r#"{"type":"input_audio_buffer.speech_started"}"#), ms(10))
            .unwrap();

        // Without the carried samples 220 more cannot complete a frame
        lip_sync.handle_event(&delta(220), ms(20)).unwrap();
        let chunk = results.next().await.expect("analysis result");
        assert!(chunk.frames.is_empty());
        assert_eq!(chunk.duration, Duration::from_nanos(220 * 1_000_000_000 / 24_000));
    }

    #[test]
    fn test_invalid_base64_is_reported() {
        let (mut lip_sync, _) = LipSync::new(&animation_config(AnimationMode::Discrete), SessionLiveness::new());
        lip_sync.mode = AnimationMode::Continuous;

        let err = lip_sync
            .handle_event(&event(r#"{"type":"response.audio.delta","delta":"@@not base64@@"}"#), ms(0))
            .unwrap_err();
        assert!(matches!(err, RelayError::InvalidAudio(_)));
    }

    #[test]
    fn test_stale_analysis_is_discarded() {
        let liveness = SessionLiveness::new();
        let (mut lip_sync, _) = LipSync::new(&animation_config(AnimationMode::Discrete), liveness.clone());

        let chunk = AnalyzedChunk {
            frames: vec![VisemeFrame {
                time_offset: Duration::ZERO,
                weights: VisemeWeightSet::single(Viseme::O),
            }],
            duration: ms(30),
            stats: AnalyzerStats::default(),
            liveness,
            epoch: 0,
        };

        lip_sync.interrupt();
        lip_sync.apply_analysis(chunk, ms(0));
        lip_sync.drive(ms(0));
        assert_eq!(lip_sync.next_deadline(), None);
    }
}
