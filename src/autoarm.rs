//! Time-of-day arm/disarm schedules.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Datelike, Days, Local, NaiveTime, TimeZone, Weekday};
use crossbeam_channel::Sender;

use crate::clock::Clock;
use crate::notify::{ArmTarget, Command};
use crate::supervisor::{Task, TaskContext};

const TICK: Duration = Duration::from_secs(1);

const ALL_DAYS: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArmAction {
    Arm,
    Disarm,
}

impl ArmAction {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "arm" => Ok(ArmAction::Arm),
            "disarm" => Ok(ArmAction::Disarm),
            other => Err(anyhow!("unknown autoarm action {other:?} (expected arm or disarm)")),
        }
    }

    fn command(self) -> Command {
        match self {
            ArmAction::Arm => Command::Arm(ArmTarget::System),
            ArmAction::Disarm => Command::Disarm(ArmTarget::System),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArmSchedule {
    pub at: NaiveTime,
    pub action: ArmAction,
    pub days: Vec<Weekday>,
}

impl ArmSchedule {
    /// `at` is `HH:MM`; `days` are weekday names, empty meaning every day.
    pub fn parse(at: &str, action: &str, days: &[String]) -> Result<Self> {
        let at = NaiveTime::parse_from_str(at.trim(), "%H:%M")
            .map_err(|_| anyhow!("invalid autoarm time {at:?} (expected HH:MM)"))?;
        let days = if days.is_empty() {
            ALL_DAYS.to_vec()
        } else {
            days.iter()
                .map(|day| {
                    day.trim()
                        .parse::<Weekday>()
                        .map_err(|_| anyhow!("invalid weekday {day:?}"))
                })
                .collect::<Result<Vec<_>>>()?
        };
        Ok(Self {
            at,
            action: ArmAction::parse(action)?,
            days,
        })
    }

    /// First firing strictly after `after`.
    pub fn next_after(&self, after: DateTime<Local>) -> Option<DateTime<Local>> {
        let today = after.date_naive();
        (0..=7u64).find_map(|offset| {
            let date = today.checked_add_days(Days::new(offset))?;
            if !self.days.contains(&date.weekday()) {
                return None;
            }
            // Skipped entirely when the local time does not exist (DST gap).
            let candidate = Local.from_local_datetime(&date.and_time(self.at)).earliest()?;
            (candidate > after).then_some(candidate)
        })
    }
}

impl fmt::Display for ArmSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self.action {
            ArmAction::Arm => "arm",
            ArmAction::Disarm => "disarm",
        };
        write!(f, "{verb} at {} on {:?}", self.at.format("%H:%M"), self.days)
    }
}

/// Emits the scheduled commands. A schedule whose time has already passed
/// at startup waits for its next occurrence.
pub struct AutoArm {
    schedules: Vec<ArmSchedule>,
    next: Vec<Option<DateTime<Local>>>,
    commands: Sender<Command>,
    clock: Arc<dyn Clock>,
}

impl AutoArm {
    pub fn new(schedules: Vec<ArmSchedule>, commands: Sender<Command>, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        let next = schedules.iter().map(|s| s.next_after(now)).collect();
        Self {
            schedules,
            next,
            commands,
            clock,
        }
    }

    /// Send every command that is due. Returns how many were sent.
    pub fn tick(&mut self) -> Result<usize> {
        let now = self.clock.now();
        let mut sent = 0;
        for (schedule, next) in self.schedules.iter().zip(self.next.iter_mut()) {
            let Some(due) = *next else {
                continue;
            };
            if due > now {
                continue;
            }
            log::info!("autoarm: {schedule}");
            self.commands
                .send(schedule.action.command())
                .map_err(|_| anyhow!("command channel closed"))?;
            sent += 1;
            *next = schedule.next_after(now);
        }
        Ok(sent)
    }
}

impl Task for AutoArm {
    fn name(&self) -> &str {
        "autoarm"
    }

    fn run(&mut self, ctx: &TaskContext) -> Result<()> {
        for schedule in &self.schedules {
            log::info!("autoarm: {schedule}");
        }
        loop {
            self.tick()?;
            if !ctx.sleep(TICK) {
                return Ok(());
            }
        }
    }
}
