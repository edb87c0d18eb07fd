use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::info;
use uuid::Uuid;

use crate::config::ProgramsConfig;
use crate::error::Error;
use crate::manager::TaskManager;
use crate::resources::{Fleet, ResourceView};
use crate::sync::Synchronizer;
use crate::tasks::{ChainReceipt, ChainView, StepEvent, SubmitTask, TaskView};


#[derive(Debug)]
enum Request {
    Submit(SubmitTask, oneshot::Sender<Result<Uuid, Error>>),
    SubmitChain(Vec<SubmitTask>, oneshot::Sender<Result<ChainReceipt, Error>>),
    Stop(Uuid, oneshot::Sender<Result<(), Error>>),
    Tasks(oneshot::Sender<Vec<TaskView>>),
    Task(Uuid, oneshot::Sender<Option<TaskView>>),
    Chain(Uuid, oneshot::Sender<Vec<TaskView>>),
    Chains(oneshot::Sender<Vec<ChainView>>),
    Resources(oneshot::Sender<Vec<ResourceView>>),
    Resource(String, oneshot::Sender<Option<ResourceView>>),
    SetResources(Vec<String>, oneshot::Sender<()>),
}


/// Handle to the task manager. All bookkeeping happens on one tokio task,
/// one request or command event at a time.
#[derive(Clone, Debug)]
pub struct Scheduler {
    requests: mpsc::UnboundedSender<Request>,
}

impl Scheduler {
    pub fn spawn(
        fleet: Fleet,
        programs: ProgramsConfig,
        sync: Arc<Synchronizer>
    ) -> Self {
        let (requests, request_rx) = mpsc::unbounded_channel();
        let (sink, events) = mpsc::unbounded_channel();
        let manager = TaskManager::new(fleet, programs, sink, sync);
        tokio::spawn(run(manager, request_rx, events));
        Self { requests }
    }

    pub async fn submit(&self, request: SubmitTask) -> Result<Uuid, Error> {
        self.call(|reply| Request::Submit(request, reply)).await?
    }

    pub async fn submit_chain(&self, requests: Vec<SubmitTask>) -> Result<ChainReceipt, Error> {
        self.call(|reply| Request::SubmitChain(requests, reply)).await?
    }

    pub async fn stop(&self, id: Uuid) -> Result<(), Error> {
        self.call(|reply| Request::Stop(id, reply)).await?
    }

    pub async fn tasks(&self) -> Result<Vec<TaskView>, Error> {
        self.call(Request::Tasks).await
    }

    pub async fn task(&self, id: Uuid) -> Result<TaskView, Error> {
        self.call(|reply| Request::Task(id, reply)).await?
            .ok_or(Error::TaskNotFound(id))
    }

    pub async fn chain(&self, chain: Uuid) -> Result<Vec<TaskView>, Error> {
        let tasks = self.call(|reply| Request::Chain(chain, reply)).await?;
        if tasks.is_empty() {
            return Err(Error::ChainNotFound(chain));
        }
        Ok(tasks)
    }

    pub async fn chains(&self) -> Result<Vec<ChainView>, Error> {
        self.call(Request::Chains).await
    }

    pub async fn resources(&self) -> Result<Vec<ResourceView>, Error> {
        self.call(Request::Resources).await
    }

    pub async fn resource(&self, name: &str) -> Result<ResourceView, Error> {
        let name = name.to_string();
        self.call(|reply| Request::Resource(name.clone(), reply)).await?
            .ok_or(Error::ResourceNotFound(name))
    }

    pub async fn set_resources(&self, names: Vec<String>) -> Result<(), Error> {
        self.call(|reply| Request::SetResources(names, reply)).await
    }

    async fn call<T>(
        &self,
        request: impl FnOnce(oneshot::Sender<T>) -> Request
    ) -> Result<T, Error> {
        let (reply, response) = oneshot::channel();
        self.requests.send(request(reply)).map_err(|_| Error::SchedulerClosed)?;
        response.await.map_err(|_| Error::SchedulerClosed)
    }
}


async fn run(
    mut manager: TaskManager,
    mut requests: mpsc::UnboundedReceiver<Request>,
    mut events: mpsc::UnboundedReceiver<StepEvent>
) {
    info!("scheduler started");
    manager.publish().await;

    loop {
        tokio::select! {
            biased;
            Some(event) = events.recv() => manager.handle(event).await,
            request = requests.recv() => match request {
                Some(request) => serve(&mut manager, request).await,
                None => break,
            },
        }
    }

    info!("scheduler stopped");
}


async fn serve(manager: &mut TaskManager, request: Request) {
    // A dropped reply only means the caller went away.
    match request {
        Request::Submit(task, reply) => {
            let _ = reply.send(manager.submit(task).await);
        }
        Request::SubmitChain(tasks, reply) => {
            let _ = reply.send(manager.submit_chain(tasks).await);
        }
        Request::Stop(id, reply) => {
            let _ = reply.send(manager.stop(id).await);
        }
        Request::Tasks(reply) => {
            let _ = reply.send(manager.tasks());
        }
        Request::Task(id, reply) => {
            let _ = reply.send(manager.task(id));
        }
        Request::Chain(chain, reply) => {
            let _ = reply.send(manager.chain(chain));
        }
        Request::Chains(reply) => {
            let _ = reply.send(manager.chains());
        }
        Request::Resources(reply) => {
            let _ = reply.send(manager.resources());
        }
        Request::Resource(name, reply) => {
            let _ = reply.send(manager.resource(&name));
        }
        Request::SetResources(names, reply) => {
            manager.set_resources(names).await;
            let _ = reply.send(());
        }
    }
}
