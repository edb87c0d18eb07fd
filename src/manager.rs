use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ProgramsConfig;
use crate::error::Error;
use crate::resources::{Fleet, ResourceView};
use crate::sync::{Synchronizer, Update};
use crate::tasks::{
    ChainEntry, ChainReceipt, ChainView, EventSink, QueueState, Step, StepEvent, StepRequest,
    SubmitTask, Task, TaskEvent, TaskView,
};


/// Admission control and bookkeeping for every task. Each task lives in
/// exactly one of the ready, running and done queues, and at most one
/// running task targets any given resource.
#[derive(Debug)]
pub struct TaskManager {
    fleet: Fleet,
    programs: ProgramsConfig,
    sink: EventSink,
    sync: Arc<Synchronizer>,
    ready: Vec<Task>,
    running: Vec<Task>,
    done: Vec<Task>,
    order: Vec<Uuid>,
}

impl TaskManager {
    pub fn new(
        fleet: Fleet,
        programs: ProgramsConfig,
        sink: EventSink,
        sync: Arc<Synchronizer>
    ) -> Self {
        Self {
            fleet,
            programs,
            sink,
            sync,
            ready: vec![],
            running: vec![],
            done: vec![],
            order: vec![],
        }
    }

    pub async fn submit(&mut self, request: SubmitTask) -> Result<Uuid, Error> {
        let (resource, steps) = self.admit(&request)?;
        let (chain, chain_pos) = self.chain_position(request.chain, request.chain_pos)?;
        let id = self.enqueue(Task::new(resource, steps, chain, chain_pos));
        self.publish().await;
        Ok(id)
    }

    /// Submits every request as one chain. Nothing is created unless all of
    /// them are valid.
    pub async fn submit_chain(&mut self, requests: Vec<SubmitTask>) -> Result<ChainReceipt, Error> {
        if requests.is_empty() {
            return Err(Error::EmptyChain);
        }

        let admitted = requests.iter()
            .map(|request| self.admit(request))
            .collect::<Result<Vec<_>, _>>()?;

        let chain = Uuid::new_v4();
        let mut tasks = vec![];
        for (pos, (resource, steps)) in admitted.into_iter().enumerate() {
            let id = self.enqueue(Task::new(resource, steps, chain, pos));
            tasks.push(ChainEntry { id, pos });
        }

        info!(%chain, tasks = tasks.len(), "created task chain");
        self.publish().await;
        Ok(ChainReceipt { chain, tasks })
    }

    /// Routes a command event to its task, then moves finished tasks to
    /// done and promotes the next task waiting for the same resource.
    pub async fn handle(&mut self, event: StepEvent) {
        let Some(index) = self.running.iter().position(|task| task.id == event.task) else {
            debug!(task = %event.task, "event for a task that is not running");
            return;
        };

        let task = &mut self.running[index];
        let outcome = task.handle(
            event.step,
            event.event,
            &mut self.fleet,
            &self.programs,
            &self.sink
        );

        match outcome {
            None => return,
            Some(TaskEvent::Done) | Some(TaskEvent::Failed(_)) => self.finish(index),
            Some(TaskEvent::Started) | Some(TaskEvent::Progress) | Some(TaskEvent::NextStep) => {}
        }

        self.publish().await;
    }

    pub async fn stop(&mut self, id: Uuid) -> Result<(), Error> {
        if let Some(index) = self.ready.iter().position(|task| task.id == id) {
            let mut task = self.ready.remove(index);
            task.cancel();
            info!(task = %id, "cancelled queued task");
            self.done.push(task);
            self.publish().await;
            return Ok(());
        }

        if let Some(task) = self.running.iter_mut().find(|task| task.id == id) {
            info!(task = %id, "stopping task");
            task.stop();
            return Ok(());
        }

        if self.done.iter().any(|task| task.id == id) {
            return Err(Error::TaskFinished(id));
        }

        Err(Error::TaskNotFound(id))
    }

    /// Replaces the known resources. Tasks waiting for a resource that
    /// (re)appeared are promoted.
    pub async fn set_resources(&mut self, names: Vec<String>) {
        let added = self.fleet.replace(names);

        for name in added {
            info!(resource = %name, "resource added");
            let holder = self.running.iter()
                .find(|task| task.resource == name)
                .map(|task| task.id);
            match holder {
                Some(task) => {
                    if self.fleet.reserve(&name, task).is_ok() {
                        self.fleet.occupy(&name, task);
                    }
                }
                None => self.promote(&name),
            }
        }

        self.publish().await;
    }

    /// Every task tagged with its queue: running, then ready, then done.
    pub fn tasks(&self) -> Vec<TaskView> {
        self.queues().map(|(status, task)| task.view(status)).collect()
    }

    pub fn task(&self, id: Uuid) -> Option<TaskView> {
        self.queues()
            .find(|(_, task)| task.id == id)
            .map(|(status, task)| task.view(status))
    }

    pub fn chain(&self, chain: Uuid) -> Vec<TaskView> {
        let mut tasks: Vec<TaskView> = self.queues()
            .filter(|(_, task)| task.chain == chain)
            .map(|(status, task)| task.view(status))
            .collect();
        tasks.sort_by_key(|task| task.chain_pos);
        tasks
    }

    pub fn chains(&self) -> Vec<ChainView> {
        let mut chains: Vec<ChainView> = vec![];
        for task in self.tasks_in_order() {
            match chains.iter_mut().find(|chain| chain.chain == task.chain) {
                Some(chain) => chain.tasks.push(task),
                None => chains.push(ChainView { chain: task.chain, tasks: vec![task] }),
            }
        }
        for chain in chains.iter_mut() {
            chain.tasks.sort_by_key(|task| task.chain_pos);
        }
        chains
    }

    pub fn resources(&self) -> Vec<ResourceView> {
        self.fleet.views()
    }

    pub fn resource(&self, name: &str) -> Option<ResourceView> {
        self.fleet.find(name).map(|resource| resource.view())
    }

    pub fn queue_of(&self, id: Uuid) -> Option<QueueState> {
        self.queues()
            .find(|(_, task)| task.id == id)
            .map(|(status, _)| status)
    }

    pub async fn publish(&self) {
        self.sync.apply_all(vec![
            Update::Resources(self.fleet.views()),
            Update::Tasks(self.tasks_in_order()),
        ]).await;
    }

    fn queues(&self) -> impl Iterator<Item = (QueueState, &Task)> {
        let running = self.running.iter().map(|task| (QueueState::Running, task));
        let ready = self.ready.iter().map(|task| (QueueState::Ready, task));
        let done = self.done.iter().map(|task| (QueueState::Done, task));
        running.chain(ready).chain(done)
    }

    /// Tasks in creation order, which keeps snapshot indices stable.
    fn tasks_in_order(&self) -> Vec<TaskView> {
        let mut views: HashMap<Uuid, TaskView> = self.queues()
            .map(|(status, task)| (task.id, task.view(status)))
            .collect();
        self.order.iter().filter_map(|id| views.remove(id)).collect()
    }

    fn admit(&self, request: &SubmitTask) -> Result<(String, Vec<Step>), Error> {
        let resource = match self.fleet.find(&request.resource) {
            Some(resource) => resource.name.clone(),
            None => {
                warn!(resource = %request.resource, "rejected task for unknown resource");
                return Err(Error::ResourceNotFound(request.resource.clone()));
            }
        };

        if request.steps.is_empty() {
            return Err(Error::NoSteps);
        }

        let steps = request.steps.iter()
            .map(StepRequest::parse)
            .collect::<Result<Vec<_>, _>>()?;

        Ok((resource, steps))
    }

    fn chain_position(
        &self,
        chain: Option<Uuid>,
        pos: Option<usize>
    ) -> Result<(Uuid, usize), Error> {
        let Some(chain) = chain else {
            return Ok((Uuid::new_v4(), 0));
        };

        let expected = self.queues().filter(|(_, task)| task.chain == chain).count();
        match pos {
            None => Ok((chain, expected)),
            Some(pos) if pos == expected => Ok((chain, pos)),
            Some(got) => Err(Error::ChainPosition { chain, expected, got }),
        }
    }

    fn enqueue(&mut self, task: Task) -> Uuid {
        let id = task.id;
        self.order.push(id);

        let waiting = self.running.iter().any(|running| running.resource == task.resource)
            || !self.fleet.is_free(&task.resource);
        if waiting {
            info!(task = %id, resource = %task.resource, "task queued");
            self.ready.push(task);
        } else {
            self.run(task);
        }

        id
    }

    fn run(&mut self, mut task: Task) {
        match task.start(&mut self.fleet, &self.programs, &self.sink) {
            Ok(()) => self.running.push(task),
            Err(err) => {
                warn!(task = %task.id, "could not start task: {}", err);
                self.ready.insert(0, task);
            }
        }
    }

    fn finish(&mut self, index: usize) {
        let task = self.running.remove(index);
        task.release(&mut self.fleet);
        let resource = task.resource.clone();
        self.done.push(task);
        self.promote(&resource);
    }

    /// Starts the longest waiting ready task for `resource`, if the resource
    /// still exists and nothing else holds it.
    fn promote(&mut self, resource: &str) {
        if self.fleet.get(resource).is_none() {
            debug!(resource, "resource is gone, not promoting");
            return;
        }

        if !self.fleet.is_free(resource)
            || self.running.iter().any(|task| task.resource == resource)
        {
            return;
        }

        if let Some(index) = self.ready.iter().position(|task| task.resource == resource) {
            let task = self.ready.remove(index);
            self.run(task);
        }
    }
}
