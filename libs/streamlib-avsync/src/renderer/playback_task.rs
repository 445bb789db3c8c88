// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Cooperative sub-scheduler of the playback strategies.
//!
//! A tick has a time budget. Tasks run most urgent first; a task whose
//! minimum execution time no longer fits in what is left of the budget is
//! skipped and its skip counter grows. Skips age the task's priority so that
//! it eventually sorts ahead of tasks that keep getting served.

use std::cmp::Reverse;

/// Minimum execution time of a task that runs whatever the budget left.
pub const ALWAYS_RUN: i64 = -1;

/// Above this a task run is reported as a long execution.
const EXECUTION_TIMEOUT_MS: i64 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    CheckSynchroMode,
    VideoRenderer,
    AudioRenderer,
    AudioInputBuffers,
    VideoInputBuffers,
    Feeding,
    Subtitle,
    Eit,
}

#[derive(Debug, Clone)]
pub struct PlaybackTask {
    pub kind: TaskKind,
    /// Lower is more urgent.
    pub priority: u32,
    /// Budget the task needs this tick, [`ALWAYS_RUN`] to ignore the budget.
    pub minimum_execution_time_ms: i64,
    pub nb_skipped: u32,
    next_run_ms: Option<i64>,
    last_delay_us: i64,
}

impl PlaybackTask {
    pub fn new(kind: TaskKind, priority: u32, minimum_execution_time_ms: i64) -> Self {
        Self {
            kind,
            priority,
            minimum_execution_time_ms,
            nb_skipped: 0,
            next_run_ms: None,
            last_delay_us: 0,
        }
    }

    /// Priority after aging by the number of consecutive skips.
    pub fn effective_priority(&self) -> u32 {
        self.priority.saturating_sub(self.nb_skipped)
    }
}

/// Outcome of asking whether a task may run now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskAdmission {
    Run(TaskKind),
    /// Not enough budget left; counts as a skip. The delay is 0.
    Skipped,
    /// Gated by its own cadence; repeats the last reported delay.
    Waiting(i64),
}

#[derive(Debug)]
pub struct TaskList {
    tasks: Vec<PlaybackTask>,
    budget_ms: i64,
    /// Tasks wait for the delay they reported before running again.
    gated: bool,
    tick_started_ms: i64,
}

impl TaskList {
    pub fn new(budget_ms: i64, gated: bool) -> Self {
        Self {
            tasks: Vec::new(),
            budget_ms,
            gated,
            tick_started_ms: 0,
        }
    }

    pub fn budget_ms(&self) -> i64 {
        self.budget_ms
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn add(&mut self, task: PlaybackTask) {
        if !self.contains(task.kind) {
            self.tasks.push(task);
        }
    }

    pub fn remove(&mut self, kind: TaskKind) {
        self.tasks.retain(|t| t.kind != kind);
    }

    pub fn contains(&self, kind: TaskKind) -> bool {
        self.tasks.iter().any(|t| t.kind == kind)
    }

    pub fn get(&self, kind: TaskKind) -> Option<&PlaybackTask> {
        self.tasks.iter().find(|t| t.kind == kind)
    }

    pub fn set_minimum_execution_time_ms(&mut self, kind: TaskKind, ms: i64) {
        if let Some(task) = self.tasks.iter_mut().find(|t| t.kind == kind) {
            task.minimum_execution_time_ms = ms;
        }
    }

    pub fn set_priority(&mut self, kind: TaskKind, priority: u32) {
        if let Some(task) = self.tasks.iter_mut().find(|t| t.kind == kind) {
            task.priority = priority;
        }
    }

    /// Execution order of the current tick.
    pub fn order(&self) -> Vec<TaskKind> {
        self.tasks.iter().map(|t| t.kind).collect()
    }

    /// Start a tick: record the budget origin and sort by aged priority,
    /// most skipped first among equals.
    pub fn begin_tick(&mut self, now_ms: i64) {
        self.tick_started_ms = now_ms;
        self.tasks
            .sort_by_key(|t| (t.effective_priority(), Reverse(t.nb_skipped)));
    }

    pub fn remaining_ms(&self, now_ms: i64) -> i64 {
        self.budget_ms - (now_ms - self.tick_started_ms)
    }

    /// Decide whether the task at `index` runs. A skip is accounted here.
    pub fn admit(&mut self, index: usize, now_ms: i64) -> Option<TaskAdmission> {
        let remaining_ms = self.remaining_ms(now_ms);
        let gated = self.gated;
        let task = self.tasks.get_mut(index)?;
        if gated && task.next_run_ms.is_some_and(|next| next > now_ms) {
            return Some(TaskAdmission::Waiting(task.last_delay_us));
        }
        if task.minimum_execution_time_ms == ALWAYS_RUN
            || remaining_ms >= task.minimum_execution_time_ms
        {
            task.nb_skipped = 0;
            Some(TaskAdmission::Run(task.kind))
        } else {
            task.nb_skipped += 1;
            tracing::trace!(
                "{:?} skipped ({} times), {}ms left",
                task.kind,
                task.nb_skipped,
                remaining_ms
            );
            Some(TaskAdmission::Skipped)
        }
    }

    /// Record the outcome of a task that ran from `started_ms` to `now_ms`.
    pub fn complete(&mut self, index: usize, delay_us: i64, started_ms: i64, now_ms: i64) {
        let gated = self.gated;
        let Some(task) = self.tasks.get_mut(index) else {
            return;
        };
        task.last_delay_us = delay_us;
        if gated {
            task.next_run_ms = Some(now_ms + delay_us / 1000);
        }
        let duration_ms = now_ms - started_ms;
        if duration_ms > EXECUTION_TIMEOUT_MS {
            tracing::warn!("long execution time ({}ms) detected for {:?}", duration_ms, task.kind);
        }
    }

    /// Forget cadence gates, every task is due on the next tick.
    pub fn clear_gates(&mut self) {
        for task in &mut self.tasks {
            task.next_run_ms = None;
        }
    }
}
