use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::command::{Command, CommandEvent, Options, Program};
use crate::config::ProgramsConfig;
use crate::error::Error;
use crate::resources::{Fleet, ResourceState};


/// Samples kept to average the progress speed.
pub const MAX_PROGRESS_SAMPLES: usize = 6;


#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Step {
    pub program: Program,
    #[serde(default)]
    pub options: Options,
}


#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepRequest {
    pub program: String,
    #[serde(default)]
    pub options: Options,
}

impl StepRequest {
    pub fn parse(&self) -> Result<Step, Error> {
        Ok(Step {
            program: self.program.parse()?,
            options: self.options.clone(),
        })
    }
}


#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitTask {
    pub resource: String,
    pub steps: Vec<StepRequest>,
    #[serde(default)]
    pub chain: Option<Uuid>,
    #[serde(default)]
    pub chain_pos: Option<usize>,
}

impl SubmitTask {
    pub fn new(resource: impl Into<String>, program: impl Into<String>, options: Options) -> Self {
        Self {
            resource: resource.into(),
            steps: vec![StepRequest { program: program.into(), options }],
            chain: None,
            chain_pos: None,
        }
    }

    pub fn then(mut self, program: impl Into<String>, options: Options) -> Self {
        self.steps.push(StepRequest { program: program.into(), options });
        self
    }

    pub fn in_chain(mut self, chain: Uuid) -> Self {
        self.chain = Some(chain);
        self
    }
}


#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TaskReceipt {
    pub id: Uuid,
}


#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ChainEntry {
    pub id: Uuid,
    pub pos: usize,
}


#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ChainReceipt {
    pub chain: Uuid,
    pub tasks: Vec<ChainEntry>,
}


#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChainView {
    pub chain: Uuid,
    pub tasks: Vec<TaskView>,
}


/// Scheduler queue a task currently belongs to.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum QueueState {
    Ready,
    Running,
    Done,
}


#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskView {
    pub id: Uuid,
    pub resource: String,
    pub program: Program,
    pub steps: Vec<Step>,
    pub step: usize,
    pub total_steps: usize,
    pub progress: f64,
    pub eta: Option<f64>,
    pub completed: bool,
    pub error: Option<String>,
    pub added_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub chain: Uuid,
    pub chain_pos: usize,
    pub status: QueueState,
}


impl TaskView {
    pub fn status_label(&self) -> &'static str {
        match self.status {
            QueueState::Ready => "ready",
            QueueState::Running => "running",
            QueueState::Done if self.completed => "done",
            QueueState::Done => "failed",
        }
    }
}


/// A command event tagged with the task and step that produced it.
#[derive(Clone, Debug)]
pub struct StepEvent {
    pub task: Uuid,
    pub step: usize,
    pub event: CommandEvent,
}

pub type EventSink = mpsc::UnboundedSender<StepEvent>;


/// What a task reports back to the scheduler after handling a command
/// event.
#[derive(Clone, Debug)]
pub enum TaskEvent {
    Started,
    Progress,
    NextStep,
    Done,
    Failed(Error),
}


#[derive(Clone, Copy, Debug)]
struct Sample {
    at: DateTime<Utc>,
    percentage: f64,
}


/// Most recent progress samples of the current step.
#[derive(Clone, Debug, Default)]
pub struct ProgressHistory {
    samples: VecDeque<Sample>,
}

impl ProgressHistory {
    pub fn record(&mut self, at: DateTime<Utc>, percentage: f64) {
        self.samples.push_back(Sample { at, percentage });
        while self.samples.len() > MAX_PROGRESS_SAMPLES {
            self.samples.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Seconds left to reach 100%, from the average speed between adjacent
    /// samples.
    pub fn eta(&self, progress: f64) -> Option<f64> {
        let rates: Vec<f64> = self.samples.iter()
            .zip(self.samples.iter().skip(1))
            .filter_map(|(a, b)| {
                let elapsed = (b.at - a.at).num_milliseconds() as f64 / 1000.0;
                (elapsed > 0.0).then(|| (b.percentage - a.percentage) / elapsed)
            })
            .collect();

        if rates.is_empty() {
            return None;
        }

        let speed = rates.iter().sum::<f64>() / rates.len() as f64;
        (speed > 0.0).then(|| (100.0 - progress) / speed)
    }
}


#[derive(Debug)]
pub struct Task {
    pub id: Uuid,
    pub resource: String,
    pub steps: Vec<Step>,
    pub step: usize,
    pub progress: f64,
    pub eta: Option<f64>,
    pub completed: bool,
    pub error: Option<String>,
    pub added_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub chain: Uuid,
    pub chain_pos: usize,
    history: ProgressHistory,
    command: Option<Command>,
    stopping: bool,
}

impl Task {
    pub fn new(resource: String, steps: Vec<Step>, chain: Uuid, chain_pos: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            resource,
            steps,
            step: 0,
            progress: 0.0,
            eta: None,
            completed: false,
            error: None,
            added_at: Utc::now(),
            started_at: None,
            ended_at: None,
            chain,
            chain_pos,
            history: ProgressHistory::default(),
            command: None,
            stopping: false,
        }
    }

    pub fn program(&self) -> Program {
        self.steps[self.step].program
    }

    pub fn is_finished(&self) -> bool {
        self.ended_at.is_some()
    }

    pub fn history(&self) -> &ProgressHistory {
        &self.history
    }

    /// Reserves the resource and launches the first step.
    pub fn start(
        &mut self,
        fleet: &mut Fleet,
        programs: &ProgramsConfig,
        sink: &EventSink
    ) -> Result<(), Error> {
        fleet.reserve(&self.resource, self.id)?;
        self.started_at = Some(Utc::now());
        info!(task = %self.id, resource = %self.resource, program = %self.program(),
            "starting task");
        self.launch(programs, sink);
        Ok(())
    }

    fn launch(&mut self, programs: &ProgramsConfig, sink: &EventSink) {
        let step = &self.steps[self.step];
        let (task, index) = (self.id, self.step);
        let sink = sink.clone();
        let emit = move |event| {
            let _ = sink.send(StepEvent { task, step: index, event });
        };

        match step.program.invocation(&self.resource, &step.options, programs) {
            Ok(invocation) => {
                let mut command = Command::new(step.program, invocation);
                command.start(emit);
                self.command = Some(command);
            }
            Err(err) => emit(CommandEvent::Error(err)),
        }
    }

    /// Applies one event of the current step's command.
    pub fn handle(
        &mut self,
        step: usize,
        event: CommandEvent,
        fleet: &mut Fleet,
        programs: &ProgramsConfig,
        sink: &EventSink
    ) -> Option<TaskEvent> {
        if step != self.step || self.is_finished() {
            debug!(task = %self.id, step, "ignoring event from a previous step");
            return None;
        }

        match event {
            CommandEvent::Spawned => {
                fleet.occupy(&self.resource, self.id);
                if self.stopping {
                    self.stop();
                }
                (step == 0).then_some(TaskEvent::Started)
            }
            CommandEvent::Update(percentage) => {
                self.update_progress(percentage, Utc::now())
                    .then_some(TaskEvent::Progress)
            }
            CommandEvent::Done => Some(self.advance_step(fleet, programs, sink)),
            CommandEvent::Error(err) => Some(self.fail(err, fleet)),
        }
    }

    /// Records a new progress percentage. Returns false when the value does
    /// not move progress forward.
    pub fn update_progress(&mut self, percentage: f64, at: DateTime<Utc>) -> bool {
        if percentage <= self.progress {
            return false;
        }

        self.progress = percentage.min(100.0);
        self.history.record(at, self.progress);
        self.eta = self.history.eta(self.progress);
        debug!(task = %self.id, progress = self.progress, eta = ?self.eta, "progress");
        true
    }

    fn advance_step(
        &mut self,
        fleet: &mut Fleet,
        programs: &ProgramsConfig,
        sink: &EventSink
    ) -> TaskEvent {
        if self.stopping {
            return self.fail(Error::Cancelled, fleet);
        }

        if self.step + 1 < self.steps.len() {
            self.step += 1;
            self.progress = 0.0;
            self.eta = None;
            self.history.clear();
            info!(task = %self.id, step = self.step, program = %self.program(), "next step");
            self.launch(programs, sink);
            return TaskEvent::NextStep;
        }

        self.command = None;
        self.progress = 100.0;
        self.eta = Some(0.0);
        self.completed = true;
        self.ended_at = Some(Utc::now());
        self.release(fleet);
        info!(task = %self.id, resource = %self.resource, "task completed");
        TaskEvent::Done
    }

    /// Marks the task as failed. The resource stays busy for the scheduler
    /// to release, unless no process ever got hold of it.
    fn fail(&mut self, err: Error, fleet: &mut Fleet) -> TaskEvent {
        let err = if self.stopping { Error::Cancelled } else { err };
        warn!(task = %self.id, resource = %self.resource, "task failed: {}", err);

        let never_spawned = fleet.get(&self.resource)
            .is_some_and(|r| r.state == ResourceState::Reserved(self.id));
        if never_spawned {
            self.release(fleet);
        }

        self.command = None;
        self.completed = false;
        self.error = Some(err.to_string());
        self.ended_at = Some(Utc::now());
        TaskEvent::Failed(err)
    }

    /// Signals the running process to terminate. The terminal event that
    /// follows is recorded as a cancellation.
    pub fn stop(&mut self) {
        self.stopping = true;
        if let Some(command) = &self.command {
            command.stop();
        }
    }

    /// Ends a task that never started.
    pub fn cancel(&mut self) {
        self.stopping = true;
        self.error = Some(Error::Cancelled.to_string());
        self.ended_at = Some(Utc::now());
    }

    pub fn release(&self, fleet: &mut Fleet) -> bool {
        fleet.release(&self.resource, self.id)
    }

    pub fn view(&self, status: QueueState) -> TaskView {
        TaskView {
            id: self.id,
            resource: self.resource.clone(),
            program: self.program(),
            steps: self.steps.clone(),
            step: self.step,
            total_steps: self.steps.len(),
            progress: self.progress,
            eta: self.eta,
            completed: self.completed,
            error: self.error.clone(),
            added_at: self.added_at,
            started_at: self.started_at,
            ended_at: self.ended_at,
            chain: self.chain,
            chain_pos: self.chain_pos,
            status,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn task(programs: &[Program]) -> Task {
        let steps = programs.iter()
            .map(|&program| Step { program, options: Options::new() })
            .collect();
        Task::new("/dev/sda".into(), steps, Uuid::new_v4(), 0)
    }

    fn programs(badblocks: &str) -> ProgramsConfig {
        ProgramsConfig { badblocks: badblocks.into(), ..ProgramsConfig::default() }
    }

    #[test]
    fn eta_defined_after_second_sample_and_decreasing() {
        let mut task = task(&[Program::Badblocks]);
        let t0 = Utc::now();

        assert!(task.update_progress(10.0, t0));
        assert_eq!(task.eta, None);

        assert!(task.update_progress(25.0, t0 + Duration::seconds(10)));
        let first = task.eta.unwrap();
        assert!((first - 50.0).abs() < 1e-9);

        assert!(task.update_progress(40.0, t0 + Duration::seconds(20)));
        let second = task.eta.unwrap();
        assert!((second - 40.0).abs() < 1e-9);
        assert!(second < first);
    }

    #[test]
    fn progress_never_goes_backwards() {
        let mut task = task(&[Program::Badblocks]);
        let t0 = Utc::now();

        assert!(task.update_progress(30.0, t0));
        assert!(!task.update_progress(30.0, t0 + Duration::seconds(1)));
        assert!(!task.update_progress(12.0, t0 + Duration::seconds(2)));
        assert_eq!(task.progress, 30.0);
        assert_eq!(task.history().len(), 1);
    }

    #[test]
    fn progress_is_clamped() {
        let mut task = task(&[Program::Wget]);
        assert!(task.update_progress(140.0, Utc::now()));
        assert_eq!(task.progress, 100.0);
    }

    #[test]
    fn history_keeps_six_most_recent_samples() {
        let mut history = ProgressHistory::default();
        let t0 = Utc::now();

        // slow start, then a steady 2%/s
        history.record(t0, 1.0);
        history.record(t0 + Duration::seconds(100), 2.0);
        for i in 1..=5 {
            history.record(t0 + Duration::seconds(100 + i), 2.0 + 2.0 * i as f64);
        }

        assert_eq!(history.len(), MAX_PROGRESS_SAMPLES);
        let eta = history.eta(12.0).unwrap();
        assert!((eta - 44.0).abs() < 1e-9);
    }

    #[test]
    fn eta_ignores_samples_without_elapsed_time() {
        let mut history = ProgressHistory::default();
        let t0 = Utc::now();
        history.record(t0, 10.0);
        history.record(t0, 20.0);
        assert_eq!(history.eta(20.0), None);
    }

    #[tokio::test]
    async fn steps_reset_progress_and_finish_frees_resource() {
        let mut fleet = Fleet::new(["/dev/sda"]);
        let programs = programs("true");
        let (sink, _events) = mpsc::unbounded_channel();
        let mut task = task(&[Program::Badblocks, Program::Badblocks]);

        task.start(&mut fleet, &programs, &sink).unwrap();
        assert!(fleet.get("/dev/sda").unwrap().state.is_busy());

        assert!(matches!(
            task.handle(0, CommandEvent::Spawned, &mut fleet, &programs, &sink),
            Some(TaskEvent::Started)
        ));
        assert_eq!(fleet.get("/dev/sda").unwrap().state, ResourceState::Busy(task.id));

        task.handle(0, CommandEvent::Update(20.0), &mut fleet, &programs, &sink);
        task.handle(0, CommandEvent::Update(60.0), &mut fleet, &programs, &sink);
        assert_eq!(task.progress, 60.0);

        assert!(matches!(
            task.handle(0, CommandEvent::Done, &mut fleet, &programs, &sink),
            Some(TaskEvent::NextStep)
        ));
        assert_eq!(task.step, 1);
        assert_eq!(task.progress, 0.0);
        assert_eq!(task.eta, None);
        assert!(task.history().is_empty());
        assert!(fleet.get("/dev/sda").unwrap().state.is_busy());

        // late events of the finished step are ignored
        assert!(task.handle(0, CommandEvent::Update(90.0), &mut fleet, &programs, &sink).is_none());

        assert!(matches!(
            task.handle(1, CommandEvent::Done, &mut fleet, &programs, &sink),
            Some(TaskEvent::Done)
        ));
        assert!(task.completed);
        assert_eq!(task.progress, 100.0);
        assert!(fleet.is_free("/dev/sda"));
    }

    #[tokio::test]
    async fn spawn_failure_releases_reservation() {
        let mut fleet = Fleet::new(["/dev/sda"]);
        let programs = programs("/nonexistent/platter-badblocks");
        let (sink, mut events) = mpsc::unbounded_channel();
        let mut task = task(&[Program::Badblocks]);

        task.start(&mut fleet, &programs, &sink).unwrap();
        let StepEvent { step, event, .. } = events.recv().await.unwrap();
        assert!(matches!(event, CommandEvent::Error(Error::SpawnFailed { .. })));

        let outcome = task.handle(step, event, &mut fleet, &programs, &sink);
        assert!(matches!(outcome, Some(TaskEvent::Failed(_))));
        assert!(!task.completed);
        assert!(task.error.is_some());
        assert!(fleet.is_free("/dev/sda"));
    }

    #[tokio::test]
    async fn exit_failure_leaves_resource_to_scheduler() {
        let mut fleet = Fleet::new(["/dev/sda"]);
        let programs = programs("true");
        let (sink, _events) = mpsc::unbounded_channel();
        let mut task = task(&[Program::Badblocks]);

        task.start(&mut fleet, &programs, &sink).unwrap();
        task.handle(0, CommandEvent::Spawned, &mut fleet, &programs, &sink);
        let err = Error::ExitFailure { program: Program::Badblocks, code: 1 };
        task.handle(0, CommandEvent::Error(err), &mut fleet, &programs, &sink);

        assert!(!task.completed);
        assert_eq!(fleet.get("/dev/sda").unwrap().state, ResourceState::Busy(task.id));
        assert!(task.release(&mut fleet));
        assert!(fleet.is_free("/dev/sda"));
    }

    #[test]
    fn view_serializes_camel_case() {
        let task = task(&[Program::Wget]);
        let value = serde_json::to_value(task.view(QueueState::Ready)).unwrap();
        assert_eq!(value["status"], "ready");
        assert_eq!(value["program"], "wget");
        assert_eq!(value["totalSteps"], 1);
        assert_eq!(value["chainPos"], 0);
        assert!(value["eta"].is_null());
    }
}
