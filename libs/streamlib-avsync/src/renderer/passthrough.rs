// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! 1x playback where the decoders present on their own hardware clock.
//!
//! Only input is moved here. Tasks keep their own cadence inside a one second
//! budget.

use crate::error::Result;
use crate::output_path::MediaOutputPath;

use super::playback_task::{PlaybackTask, TaskAdmission, TaskKind, TaskList};
use super::{RenderTargets, RendererBase, RendererKind, RendererStrategy, ResetReason, speed_equals};

const TICK_BUDGET_MS: i64 = 1_000;
const CHECK_SYNCHRO_DELAY_US: i64 = 1_000_000;
const FEEDING_DELAY_US: i64 = 10_000;
const INPUT_DELAY_US: i64 = 100_000;

pub struct PassthroughRenderer {
    base: RendererBase,
    tasks: TaskList,
    tunneled: bool,
}

impl PassthroughRenderer {
    pub fn new(id: &str) -> Self {
        let mut tasks = TaskList::new(TICK_BUDGET_MS, true);
        tasks.add(PlaybackTask::new(TaskKind::CheckSynchroMode, 0, 100));
        tasks.add(PlaybackTask::new(TaskKind::Feeding, 3, 20));
        Self {
            base: RendererBase::new(id, RendererKind::Passthrough),
            tasks,
            tunneled: false,
        }
    }

    pub fn is_tunneled(&self) -> bool {
        self.tunneled
    }

    pub fn tasks(&self) -> &TaskList {
        &self.tasks
    }

    fn run_task(&mut self, t: &mut RenderTargets, kind: TaskKind) -> Result<i64> {
        match kind {
            TaskKind::CheckSynchroMode => {
                if self.check_synchro_mode(t) {
                    self.tasks.clear_gates();
                }
                Ok(CHECK_SYNCHRO_DELAY_US)
            }
            TaskKind::Feeding => {
                self.handle_feeding(t)?;
                Ok(FEEDING_DELAY_US)
            }
            TaskKind::AudioInputBuffers => {
                t.audio.check_errors();
                t.audio.push_input_buffer()?;
                Ok(INPUT_DELAY_US)
            }
            TaskKind::VideoInputBuffers => {
                t.video.check_errors();
                t.video.push_input_buffer()?;
                Ok(INPUT_DELAY_US)
            }
            other => {
                tracing::debug!("[{}] {:?} has no work in passthrough", self.base.tag(), other);
                Ok(CHECK_SYNCHRO_DELAY_US)
            }
        }
    }

    /// Keep both paths on the hardware path the platform offers right now.
    /// Returns `true` when the paths had to be realigned.
    fn check_synchro_mode(&mut self, t: &mut RenderTargets) -> bool {
        if !t.audio.is_configured() && !t.video.is_configured() {
            return false;
        }
        if !speed_equals(self.base.speed, 1.0) {
            return false;
        }

        let tunneled = t.capabilities.is_tunneled_playback_supported();
        let aligned = tunneled == self.tunneled
            && t.video.is_tunneled() == tunneled
            && t.audio.is_tunneled() == tunneled;
        if aligned {
            return false;
        }

        tracing::info!(
            "[{}] tunneled playback {} -> {}, reconfiguring output paths",
            self.base.tag(),
            self.tunneled,
            tunneled
        );
        // A decoder cannot switch between tunneled and non-tunneled output
        // without being configured again.
        t.video.reset();
        t.audio.reset();
        t.position.unset_origin();
        t.set_tunneled(tunneled);
        self.tunneled = tunneled;
        true
    }
}

impl RendererStrategy for PassthroughRenderer {
    fn base(&self) -> &RendererBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut RendererBase {
        &mut self.base
    }

    fn start_video(&mut self) {
        tracing::debug!("[{}] start video", self.base.tag());
        self.base.video_started = true;
        self.tasks
            .add(PlaybackTask::new(TaskKind::VideoInputBuffers, 2, 30));
    }

    fn stop_video(&mut self) {
        tracing::debug!("[{}] stop video", self.base.tag());
        self.base.video_started = false;
        self.tasks.remove(TaskKind::VideoInputBuffers);
    }

    fn start_audio(&mut self) {
        tracing::debug!("[{}] start audio", self.base.tag());
        self.base.audio_started = true;
        self.tasks
            .add(PlaybackTask::new(TaskKind::AudioInputBuffers, 2, 30));
    }

    fn stop_audio(&mut self) {
        tracing::debug!("[{}] stop audio", self.base.tag());
        self.base.audio_started = false;
        self.tasks.remove(TaskKind::AudioInputBuffers);
    }

    fn set_speed(
        &mut self,
        t: &mut RenderTargets,
        _previous: Option<RendererKind>,
        speed: f64,
    ) -> Result<()> {
        tracing::info!("[{}] speed:{}", self.base.tag(), speed);
        self.base.speed = speed;
        self.tunneled = t.capabilities.is_tunneled_playback_supported();

        t.video.set_speed(speed);
        t.audio.set_speed(speed);
        t.video.set_trick_mode_speed(speed)?;
        t.set_tunneled(self.tunneled);
        Ok(())
    }

    fn do_some_work(&mut self, t: &mut RenderTargets) -> Result<i64> {
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
        tracing::info!("[{}] reset, reason: {:?}", self.base.tag(), reason);
        match reason {
            ResetReason::NewPosition
            | ResetReason::NoMedia
            | ResetReason::BadData
            | ResetReason::NoData => {
                t.video.flush();
                t.audio.reset();
                t.position.unset_origin();
                self.tasks.clear_gates();
            }
            ResetReason::Discontinuity => t.position.unset_origin(),
            ResetReason::DecodersBlocked => {
                tracing::info!("[{}] reset output paths", self.base.tag());
                t.video.reset();
                t.audio.reset();
            }
            ResetReason::RendererChanged => {}
        }
        Ok(())
    }
}
