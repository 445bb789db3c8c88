// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! 1x playback with software A/V synchronization.

use crate::error::Result;
use crate::output_path::MediaOutputPath;

use super::playback_task::{ALWAYS_RUN, PlaybackTask, TaskAdmission, TaskKind, TaskList};
use super::{RenderTargets, RendererBase, RendererKind, RendererStrategy, ResetReason, speed_equals};

/// Largest tolerated gap between the audio and video timelines, and the
/// blocking detection threshold. The first image may take over a second and
/// demux interleaving adds close to two more.
const SYNCHRO_MAX_AV_DELTA_US: i64 = 5_000_000;
/// Audio/video display drift corrected on the video clock. Video position is
/// continuous, audio moves in ~20ms steps.
const MAX_AV_DELTA_US: i64 = 30_000;
const SYNCHRO_AUDIO_RENDER_WINDOW_US: i64 = 20_000;
const STATUS_LOG_INTERVAL_MS: i64 = 5_000;
const TICK_BUDGET_MS: i64 = 40;
const TASK_DELAY_US: i64 = 10_000;
/// Tunneled decoders restart on a key frame, replay a little.
const TUNNELED_RESTART_REWIND_US: i64 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SynchroMode {
    #[default]
    None,
    Synchronizable,
    OneTrack,
    FreeRun,
}

/// Pick the clock origin from the decoded ranges of both tracks.
///
/// Returns the origin before margin, the margin of the track it came from,
/// and a description for the log. `None` when the ranges fit no known case.
fn clock_origin(
    audio: (i64, i64),
    video: (i64, i64),
    audio_margin_us: i64,
    video_margin_us: i64,
) -> Option<(i64, i64, &'static str)> {
    let (min_audio, max_audio) = audio;
    let (min_video, max_video) = video;
    if max_audio - min_video <= 0 {
        Some((max_audio, audio_margin_us, "max audio pts, audio before first video"))
    } else if max_video - min_audio <= 0 {
        Some((max_video, video_margin_us, "max video pts, video before first audio"))
    } else if min_audio - max_video <= 0 && min_audio - min_video >= 0 {
        Some((min_audio, audio_margin_us, "min audio pts, audio within video range"))
    } else if min_video - max_audio <= 0 && min_video - min_audio >= 0 {
        Some((min_video, video_margin_us, "min video pts, video within audio range"))
    } else {
        None
    }
}

pub struct PlaybackRenderer {
    base: RendererBase,
    tasks: TaskList,
    synchro_mode: SynchroMode,
    tunneled: bool,
    /// Wall time and value of the last new audio timestamp, tunneled only.
    last_audio_timestamp: Option<(i64, i64)>,
    last_status_log_ms: Option<i64>,
    blocking_notified: bool,
}

impl PlaybackRenderer {
    pub fn new(id: &str) -> Self {
        let mut tasks = TaskList::new(TICK_BUDGET_MS, false);
        tasks.add(PlaybackTask::new(TaskKind::CheckSynchroMode, 0, 5));
        tasks.add(PlaybackTask::new(TaskKind::VideoRenderer, 1, 10));
        tasks.add(PlaybackTask::new(TaskKind::AudioRenderer, 1, 10));
        tasks.add(PlaybackTask::new(TaskKind::AudioInputBuffers, 2, 30));
        tasks.add(PlaybackTask::new(TaskKind::VideoInputBuffers, 2, 30));
        tasks.add(PlaybackTask::new(TaskKind::Feeding, 3, 20));
        tasks.add(PlaybackTask::new(TaskKind::Subtitle, 4, 5));
        tasks.add(PlaybackTask::new(TaskKind::Eit, 4, 5));
        Self {
            base: RendererBase::new(id, RendererKind::Playback),
            tasks,
            synchro_mode: SynchroMode::None,
            tunneled: false,
            last_audio_timestamp: None,
            last_status_log_ms: None,
            blocking_notified: false,
        }
    }

    pub fn synchro_mode(&self) -> SynchroMode {
        self.synchro_mode
    }

    pub fn is_tunneled(&self) -> bool {
        self.tunneled
    }

    pub fn tasks(&self) -> &TaskList {
        &self.tasks
    }

    /// Budget shape of this tick. Input tasks of a track without decoded
    /// output, and feeding when an input ran dry, run unconditionally.
    fn adjust_tasks(&mut self, t: &RenderTargets) {
        let has_audio = t.audio.has_media_format();
        let has_video = t.video.has_media_format();

        let audio_input_ms = if has_audio && t.audio.output_buffer_count() == 0 {
            ALWAYS_RUN
        } else {
            30
        };
        self.tasks
            .set_minimum_execution_time_ms(TaskKind::AudioInputBuffers, audio_input_ms);

        if self.tunneled {
            self.tasks
                .set_minimum_execution_time_ms(TaskKind::VideoInputBuffers, 30);
            self.tasks
                .set_minimum_execution_time_ms(TaskKind::VideoRenderer, 50);
            self.tasks.set_priority(TaskKind::VideoRenderer, 5);
        } else {
            let video_input_ms = if has_video && t.video.output_buffer_count() == 0 {
                ALWAYS_RUN
            } else {
                30
            };
            self.tasks
                .set_minimum_execution_time_ms(TaskKind::VideoInputBuffers, video_input_ms);
            self.tasks
                .set_minimum_execution_time_ms(TaskKind::VideoRenderer, 10);
            self.tasks.set_priority(TaskKind::VideoRenderer, 1);
        }

        let input_dry =
            (has_audio && t.audio.is_input_empty()) || (has_video && t.video.is_input_empty());
        self.tasks.set_minimum_execution_time_ms(
            TaskKind::Feeding,
            if input_dry { ALWAYS_RUN } else { 20 },
        );
    }

    fn run_task(&mut self, t: &mut RenderTargets, kind: TaskKind) -> Result<i64> {
        match kind {
            TaskKind::VideoRenderer => {
                if t.video.is_configured() {
                    t.video.render()
                } else {
                    Ok(TASK_DELAY_US)
                }
            }
            TaskKind::AudioRenderer => {
                if t.audio.is_configured() {
                    t.audio.render()
                } else {
                    Ok(TASK_DELAY_US)
                }
            }
            TaskKind::CheckSynchroMode => {
                self.check_synchro_mode(t)?;
                Ok(TASK_DELAY_US)
            }
            TaskKind::Feeding => {
                self.handle_feeding(t)?;
                Ok(TASK_DELAY_US)
            }
            TaskKind::AudioInputBuffers => {
                if self.base.audio_started {
                    t.audio.check_errors();
                    t.audio.push_input_buffer()?;
                }
                Ok(TASK_DELAY_US)
            }
            TaskKind::VideoInputBuffers => {
                if self.base.video_started {
                    t.video.check_errors();
                    t.video.push_input_buffer()?;
                }
                Ok(TASK_DELAY_US)
            }
            // Placeholders holding their share of the tick budget.
            TaskKind::Subtitle | TaskKind::Eit => Ok(TASK_DELAY_US),
        }
    }

    fn check_synchro_mode(&mut self, t: &mut RenderTargets) -> Result<()> {
        if !t.audio.is_configured() && !t.video.is_configured() {
            self.synchro_mode = SynchroMode::None;
            return Ok(());
        }
        // Paused or trick speed, nothing to synchronize.
        if !speed_equals(self.base.speed, 1.0) {
            return Ok(());
        }
        if self.tunneled {
            self.check_synchro_in_tunneled_mode(t)
        } else {
            self.check_synchro_in_standard_mode(t);
            Ok(())
        }
    }

    /// Hardware keeps A/V in sync; only watch for stalled decoders.
    fn check_synchro_in_tunneled_mode(&mut self, t: &mut RenderTargets) -> Result<()> {
        let max_full_ms = SYNCHRO_MAX_AV_DELTA_US / 1000;
        let mut blocking: Option<String> = None;
        if t.audio.elapsed_since_input_queue_full_ms() > max_full_ms {
            blocking = Some("audio injection blocked".to_string());
        }
        if t.video.elapsed_since_input_queue_full_ms() > max_full_ms {
            blocking = Some(match blocking {
                Some(_) => "audio and video injection blocked".to_string(),
                None => "video injection blocked".to_string(),
            });
        }

        let now_ms = t.now_ms();
        let next_audio_us = t.audio.next_output_timestamp_us();
        match self.last_audio_timestamp {
            None => {
                if next_audio_us != 0 {
                    self.last_audio_timestamp = Some((now_ms, next_audio_us));
                }
            }
            Some((since_ms, timestamp_us)) => {
                let since_ms = if next_audio_us != 0 && next_audio_us != timestamp_us {
                    self.last_audio_timestamp = Some((now_ms, next_audio_us));
                    now_ms
                } else {
                    since_ms
                };
                if now_ms - since_ms > max_full_ms {
                    blocking = Some(format!("no timestamp since {}ms", now_ms - since_ms));
                }
            }
        }

        if let Some(message) = blocking {
            if !self.blocking_notified {
                tracing::warn!("[{}] blocking detected ({}): reset decoders", self.base.tag(), message);
                self.reset(t, ResetReason::DecodersBlocked)?;
                self.blocking_notified = true;
            }
        }

        if t.audio.is_configured() {
            t.audio.check_standalone_synchro();
        }
        Ok(())
    }

    fn check_synchro_in_standard_mode(&mut self, t: &mut RenderTargets) {
        let audio_configured = t.audio.is_configured();
        let video_configured = t.video.is_configured();
        if !audio_configured || !video_configured {
            let video_missing = t.video.has_configuration_error() || !t.video.has_media_format();
            let audio_missing = t.audio.has_configuration_error() || !t.audio.has_media_format();
            if audio_configured && video_missing {
                t.audio.check_standalone_synchro();
                self.synchro_mode = SynchroMode::OneTrack;
            }
            if video_configured && audio_missing {
                t.video.check_standalone_synchro();
                self.synchro_mode = SynchroMode::OneTrack;
            }
            return;
        }

        let max_full_ms = SYNCHRO_MAX_AV_DELTA_US / 1000;
        if t.audio.elapsed_since_input_queue_full_ms() > max_full_ms
            || t.video.elapsed_since_input_queue_full_ms() > max_full_ms
        {
            tracing::warn!(
                "[{}] injection blocked because of audio/video decoders, must restart",
                self.base.tag()
            );
            t.audio.release();
            t.video.release();
            return;
        }

        if !t.audio.has_output_buffers() || !t.video.has_output_buffers() {
            return;
        }

        if t.audio.has_input_discontinuity() || t.video.has_input_discontinuity() {
            self.synchro_mode = SynchroMode::FreeRun;
            t.audio.check_standalone_synchro();
            t.video.check_standalone_synchro();
        } else {
            self.synchronize(t);
        }

        if self.synchro_mode == SynchroMode::Synchronizable {
            self.monitor_synchro(t);
        }
    }

    /// Both tracks have decoded output: put them on a common clock.
    fn synchronize(&mut self, t: &mut RenderTargets) {
        let min_audio = t.audio.next_output_timestamp_us();
        let max_audio = t.audio.last_output_timestamp_us().unwrap_or(min_audio);
        let min_video = t.video.next_output_timestamp_us();
        let max_video = t.video.last_output_timestamp_us().unwrap_or(min_video);

        let min_distance = [
            (min_audio - min_video).abs(),
            (min_audio - max_video).abs(),
            (max_audio - min_video).abs(),
            (max_audio - max_video).abs(),
        ]
        .into_iter()
        .min()
        .unwrap_or(0);
        if min_distance > SYNCHRO_MAX_AV_DELTA_US {
            if self.synchro_mode != SynchroMode::FreeRun {
                tracing::info!(
                    "[{}] audio and video {}ms apart, tracks run standalone",
                    self.base.tag(),
                    min_distance / 1000
                );
            }
            self.synchro_mode = SynchroMode::FreeRun;
            t.audio.check_standalone_synchro();
            t.video.check_standalone_synchro();
            return;
        }

        let reason = if !t.audio.is_clock_started() || !t.video.is_clock_started() {
            Some("clock(s) not started".to_string())
        } else {
            let audio_time_us = t.audio.clock_time_us();
            let video_time_us = t.video.clock_time_us();
            let mut reason = None;
            if min_audio - audio_time_us > SYNCHRO_MAX_AV_DELTA_US {
                reason = Some(format!(
                    "audio delta too high ({}/{})ms",
                    (min_audio - audio_time_us) / 1000,
                    SYNCHRO_MAX_AV_DELTA_US / 1000
                ));
            }
            if max_audio - audio_time_us < -SYNCHRO_AUDIO_RENDER_WINDOW_US {
                reason = Some(format!(
                    "max audio pts too late {}ms",
                    (max_audio - audio_time_us) / 1000
                ));
            }
            if min_video - video_time_us > SYNCHRO_MAX_AV_DELTA_US {
                reason = Some(format!(
                    "video delta too high ({}/{})ms",
                    (min_video - video_time_us) / 1000,
                    SYNCHRO_MAX_AV_DELTA_US / 1000
                ));
            }
            if max_video - video_time_us < 0 {
                reason = Some(format!(
                    "max video pts too late {}ms",
                    (max_video - video_time_us) / 1000
                ));
            }
            reason
        };

        if let Some(reason) = reason {
            match clock_origin(
                (min_audio, max_audio),
                (min_video, max_video),
                t.audio.margin_us(),
                t.video.margin_us(),
            ) {
                Some((timestamp_us, margin_us, description)) => {
                    let origin_us = (timestamp_us - margin_us).max(0);
                    tracing::info!(
                        "[{}] because {}, must set clock origin to {} ({}ms, margin {}ms)",
                        self.base.tag(),
                        reason,
                        description,
                        origin_us / 1000,
                        margin_us / 1000
                    );
                    t.audio.set_synchro_on(origin_us);
                    t.video.set_synchro_on(origin_us);
                }
                None => {
                    debug_assert!(
                        false,
                        "unexpected origin case a[{},{}] v[{},{}]",
                        min_audio,
                        max_audio,
                        min_video,
                        max_video
                    );
                    tracing::error!(
                        "[{}] unexpected origin case a[{},{}] v[{},{}], clocks unchanged",
                        self.base.tag(),
                        min_audio / 1000,
                        max_audio / 1000,
                        min_video / 1000,
                        max_video / 1000
                    );
                }
            }
        }

        if self.synchro_mode != SynchroMode::Synchronizable {
            tracing::info!("[{}] av sync is on", self.base.tag());
        }
        self.synchro_mode = SynchroMode::Synchronizable;
    }

    fn monitor_synchro(&mut self, t: &mut RenderTargets) {
        if !t.audio.is_display_position_valid() || !t.video.is_display_position_valid() {
            return;
        }

        let av_delta_us = t.audio.display_position_us() - t.video.display_position_us();
        if av_delta_us.abs() > SYNCHRO_MAX_AV_DELTA_US {
            tracing::warn!(
                "[{}] monitor synchro: huge av delta {}ms, there is something wrong",
                self.base.tag(),
                av_delta_us / 1000
            );
        } else if av_delta_us.abs() > MAX_AV_DELTA_US {
            let clock = &mut t.video.core_mut().clock;
            let offset_us = clock.offset_us() + av_delta_us;
            clock.set_offset_us(offset_us);
            tracing::info!(
                "[{}] readjust video clock with delta:{}ms, new offset:{}ms",
                self.base.tag(),
                av_delta_us / 1000,
                offset_us / 1000
            );
        }

        let now_ms = t.now_ms();
        if self
            .last_status_log_ms
            .is_none_or(|last| now_ms - last > STATUS_LOG_INTERVAL_MS)
        {
            let outputs = if t.audio.has_output_buffers() && t.video.has_output_buffers() {
                format!(
                    "d_pts_av:{}",
                    t.audio.next_output_timestamp_us() - t.video.next_output_timestamp_us()
                )
            } else {
                format!(
                    "d_pts_av[a:{}, v:{}]",
                    t.audio.has_output_buffers(),
                    t.video.has_output_buffers()
                )
            };
            tracing::info!(
                "[{}] d_av:{}ms, video offset:{}, d_clock[av:{}] {}",
                self.base.tag(),
                av_delta_us / 1000,
                t.video.core().clock.offset_us(),
                t.audio.clock_time_us() - t.video.clock_time_us(),
                outputs
            );
            self.last_status_log_ms = Some(now_ms);
        }
    }
}

impl RendererStrategy for PlaybackRenderer {
    fn base(&self) -> &RendererBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut RendererBase {
        &mut self.base
    }

    fn set_speed(
        &mut self,
        t: &mut RenderTargets,
        previous: Option<RendererKind>,
        speed: f64,
    ) -> Result<()> {
        tracing::info!("[{}] speed:{}", self.base.tag(), speed);
        self.base.speed = speed;
        self.tunneled = t.can_use_tunneled_playback();

        // Coming back to 1x from another strategy, restart video cleanly.
        if speed_equals(speed, 1.0) && previous != Some(self.kind()) {
            tracing::info!("[{}] set speed, reset VideoOutputPath", self.base.tag());
            t.video.reset();
            self.last_status_log_ms = None;
            if self.tunneled {
                let position_us = (t.position.position_us() - TUNNELED_RESTART_REWIND_US).max(0);
                self.set_position_us(t, position_us)?;
            }
        }

        t.video.set_speed(speed);
        t.audio.set_speed(speed);
        t.video.set_trick_mode_speed(speed)?;
        t.set_tunneled(self.tunneled);
        Ok(())
    }

    fn do_some_work(&mut self, t: &mut RenderTargets) -> Result<i64> {
        self.adjust_tasks(t);

        let mut next_delay_us = TICK_BUDGET_MS * 1000;
        self.tasks.begin_tick(t.now_ms());
        for index in 0..self.tasks.len() {
            let started_ms = t.now_ms();
            let delay_us = match self.tasks.admit(index, started_ms) {
                Some(TaskAdmission::Run(kind)) => {
                    let delay_us = self.run_task(t, kind)?;
                    self.tasks.complete(index, delay_us, started_ms, t.now_ms());
                    delay_us
                }
                Some(TaskAdmission::Skipped) => 0,
                Some(TaskAdmission::Waiting(delay_us)) => delay_us,
                None => continue,
            };
            next_delay_us = next_delay_us.min(delay_us);
        }
        Ok(next_delay_us)
    }

    fn reset(&mut self, t: &mut RenderTargets, reason: ResetReason) -> Result<()> {
        tracing::info!("[{}] reset {:?}", self.base.tag(), reason);
        match reason {
            ResetReason::NewPosition
            | ResetReason::NoMedia
            | ResetReason::BadData
            | ResetReason::NoData => {
                t.video.reset();
                t.audio.reset();
            }
            ResetReason::Discontinuity => {
                t.video.reset();
                t.audio.reset();
                if self.tunneled {
                    t.audio.release();
                }
            }
            ResetReason::DecodersBlocked => {
                t.video.release();
                t.audio.release();
            }
            ResetReason::RendererChanged => {}
        }
        self.synchro_mode = SynchroMode::None;
        self.last_status_log_ms = None;
        self.last_audio_timestamp = None;
        self.blocking_notified = false;
        Ok(())
    }

    fn on_capabilities_changed(&mut self, t: &mut RenderTargets) {
        let was_tunneled = self.tunneled;
        self.tunneled = t.can_use_tunneled_playback();
        if was_tunneled != self.tunneled {
            tracing::info!(
                "[{}] tunneled mode must change: {} -> {}",
                self.base.tag(),
                was_tunneled,
                self.tunneled
            );
            t.set_tunneled(self.tunneled);
            t.video.release();
            t.audio.release();
        }
    }
}
