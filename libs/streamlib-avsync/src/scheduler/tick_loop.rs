// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Dedicated thread driving a [`RendererScheduler`].
//!
//! Commands from other threads are queued on a channel and applied between
//! ticks, so the scheduler itself is only ever touched by the loop thread.

use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};

use crate::error::{AvSyncError, Result};
use crate::io::{Descrambler, MediaFormat, SharedInputQueue};

use super::{RendererScheduler, SchedulerSnapshot};

/// Wait between command checks while no track is started.
const IDLE_INTERVAL: Duration = Duration::from_millis(100);
const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(1);

pub enum SchedulerCommand {
    PrepareStart,
    SetVideoParams {
        format: MediaFormat,
        queue: SharedInputQueue,
        descrambler: Option<Descrambler>,
    },
    SetAudioParams {
        format: MediaFormat,
        queue: SharedInputQueue,
        descrambler: Option<Descrambler>,
    },
    StartVideo,
    StopVideo,
    PauseVideo,
    ResumeVideo,
    StartAudio,
    StopAudio,
    PauseAudio,
    ResumeAudio,
    SetSpeed(f64),
    SetPosition(i64),
    SetBounds {
        start_us: Option<i64>,
        end_us: Option<i64>,
    },
    EndOfData,
    SetAudioVolume(f32),
    SetAudioMuted(bool),
    Flush,
    Stop,
    Release,
    Snapshot(Sender<SchedulerSnapshot>),
    Shutdown,
}

impl std::fmt::Debug for SchedulerCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerCommand::SetVideoParams { format, .. } => {
                f.debug_tuple("SetVideoParams").field(format).finish()
            }
            SchedulerCommand::SetAudioParams { format, .. } => {
                f.debug_tuple("SetAudioParams").field(format).finish()
            }
            SchedulerCommand::SetSpeed(speed) => f.debug_tuple("SetSpeed").field(speed).finish(),
            SchedulerCommand::SetPosition(us) => f.debug_tuple("SetPosition").field(us).finish(),
            SchedulerCommand::SetBounds { start_us, end_us } => f
                .debug_struct("SetBounds")
                .field("start_us", start_us)
                .field("end_us", end_us)
                .finish(),
            SchedulerCommand::SetAudioVolume(v) => f.debug_tuple("SetAudioVolume").field(v).finish(),
            SchedulerCommand::SetAudioMuted(m) => f.debug_tuple("SetAudioMuted").field(m).finish(),
            SchedulerCommand::PrepareStart => f.write_str("PrepareStart"),
            SchedulerCommand::StartVideo => f.write_str("StartVideo"),
            SchedulerCommand::StopVideo => f.write_str("StopVideo"),
            SchedulerCommand::PauseVideo => f.write_str("PauseVideo"),
            SchedulerCommand::ResumeVideo => f.write_str("ResumeVideo"),
            SchedulerCommand::StartAudio => f.write_str("StartAudio"),
            SchedulerCommand::StopAudio => f.write_str("StopAudio"),
            SchedulerCommand::PauseAudio => f.write_str("PauseAudio"),
            SchedulerCommand::ResumeAudio => f.write_str("ResumeAudio"),
            SchedulerCommand::EndOfData => f.write_str("EndOfData"),
            SchedulerCommand::Flush => f.write_str("Flush"),
            SchedulerCommand::Stop => f.write_str("Stop"),
            SchedulerCommand::Release => f.write_str("Release"),
            SchedulerCommand::Snapshot(_) => f.write_str("Snapshot"),
            SchedulerCommand::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// Handle on the loop thread. Dropping it shuts the loop down and releases
/// the scheduler.
pub struct TickLoop {
    id: String,
    commands: Sender<SchedulerCommand>,
    handle: Option<JoinHandle<RendererScheduler>>,
}

impl TickLoop {
    pub fn spawn(scheduler: RendererScheduler) -> Result<Self> {
        let id = scheduler.id().to_string();
        let (commands, command_rx) = crossbeam_channel::unbounded();
        let handle = std::thread::Builder::new()
            .name(format!("avsync-{}", id))
            .spawn(move || run_tick_loop(scheduler, command_rx))?;
        Ok(Self {
            id,
            commands,
            handle: Some(handle),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn send(&self, command: SchedulerCommand) -> Result<()> {
        self.commands.send(command).map_err(|e| {
            AvSyncError::InvalidState(format!("tick loop {} is gone, dropped {:?}", self.id, e.0))
        })
    }

    /// State of the scheduler once every command sent before has been applied.
    pub fn snapshot(&self) -> Result<SchedulerSnapshot> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.send(SchedulerCommand::Snapshot(tx))?;
        rx.recv_timeout(SNAPSHOT_TIMEOUT).map_err(|e| {
            AvSyncError::InvalidState(format!("tick loop {} did not answer: {}", self.id, e))
        })
    }

    /// Stop the loop and hand the scheduler back.
    pub fn shutdown(mut self) -> Result<RendererScheduler> {
        self.join()
    }

    fn join(&mut self) -> Result<RendererScheduler> {
        let Some(handle) = self.handle.take() else {
            return Err(AvSyncError::InvalidState(format!(
                "tick loop {} already joined",
                self.id
            )));
        };
        // The thread may already be gone after a panic, join reports it.
        let _ = self.commands.send(SchedulerCommand::Shutdown);
        handle.join().map_err(|_| {
            AvSyncError::InvalidState(format!("tick loop {} thread panicked", self.id))
        })
    }
}

impl Drop for TickLoop {
    fn drop(&mut self) {
        if self.handle.is_none() {
            return;
        }
        match self.join() {
            Ok(mut scheduler) => scheduler.release(),
            Err(e) => tracing::warn!("[{}] {}", self.id, e),
        }
    }
}

fn run_tick_loop(
    mut scheduler: RendererScheduler,
    commands: Receiver<SchedulerCommand>,
) -> RendererScheduler {
    let id = scheduler.id().to_string();
    tracing::info!("[{}] Tick loop started", id);

    let mut next_tick = Instant::now();
    loop {
        let timeout = if scheduler.is_ticking() {
            next_tick.saturating_duration_since(Instant::now())
        } else {
            IDLE_INTERVAL
        };

        crossbeam_channel::select! {
            recv(commands) -> msg => {
                let command = match msg {
                    Ok(SchedulerCommand::Shutdown) | Err(_) => break,
                    Ok(command) => command,
                };
                let was_ticking = scheduler.is_ticking();
                apply_command(&mut scheduler, command);
                if !was_ticking && scheduler.is_ticking() {
                    next_tick = Instant::now();
                }
            }
            default(timeout) => {
                if scheduler.is_ticking() {
                    let delay_us = scheduler.tick().max(0) as u64;
                    next_tick = Instant::now() + Duration::from_micros(delay_us);
                }
            }
        }
    }

    tracing::info!("[{}] Tick loop stopped", id);
    scheduler
}

fn apply_command(scheduler: &mut RendererScheduler, command: SchedulerCommand) {
    tracing::trace!("[{}] command {:?}", scheduler.id(), command);
    match command {
        SchedulerCommand::PrepareStart => scheduler.prepare_start(),
        SchedulerCommand::SetVideoParams {
            format,
            queue,
            descrambler,
        } => scheduler.set_video_params(format, queue, descrambler),
        SchedulerCommand::SetAudioParams {
            format,
            queue,
            descrambler,
        } => scheduler.set_audio_params(format, queue, descrambler),
        SchedulerCommand::StartVideo => scheduler.start_video(),
        SchedulerCommand::StopVideo => scheduler.stop_video(),
        SchedulerCommand::PauseVideo => scheduler.pause_video(),
        SchedulerCommand::ResumeVideo => scheduler.resume_video(),
        SchedulerCommand::StartAudio => scheduler.start_audio(),
        SchedulerCommand::StopAudio => scheduler.stop_audio(),
        SchedulerCommand::PauseAudio => scheduler.pause_audio(),
        SchedulerCommand::ResumeAudio => scheduler.resume_audio(),
        SchedulerCommand::SetSpeed(speed) => {
            if let Err(e) = scheduler.set_speed(speed) {
                tracing::warn!("[{}] set speed refused: {}", scheduler.id(), e);
            }
        }
        SchedulerCommand::SetPosition(position_us) => scheduler.set_position_us(position_us),
        SchedulerCommand::SetBounds { start_us, end_us } => {
            scheduler.set_start_position_us(start_us);
            scheduler.set_end_position_us(end_us);
        }
        SchedulerCommand::EndOfData => scheduler.set_end_of_data(),
        SchedulerCommand::SetAudioVolume(volume) => scheduler.set_audio_volume(volume),
        SchedulerCommand::SetAudioMuted(muted) => scheduler.set_audio_muted(muted),
        SchedulerCommand::Flush => scheduler.flush(),
        SchedulerCommand::Stop => scheduler.stop(),
        SchedulerCommand::Release => scheduler.release(),
        SchedulerCommand::Snapshot(reply) => {
            if reply.send(scheduler.snapshot()).is_err() {
                tracing::debug!("[{}] snapshot requester gone", scheduler.id());
            }
        }
        SchedulerCommand::Shutdown => {}
    }
}
