pub mod cli;
pub mod client;
pub mod command;
pub mod config;
pub mod discovery;
mod error;
pub mod inventory;
pub mod manager;
pub mod resources;
pub mod scheduler;
pub mod server;
pub mod sync;
pub mod tasks;

pub use client::Client;
pub use command::{Command, CommandEvent, Options, Program};
pub use config::Config;
pub use error::Error;
pub use resources::{Fleet, ResourceView};
pub use scheduler::Scheduler;
pub use server::{serve, Server};
pub use sync::{Patch, PatchOp, Snapshot, StreamMessage, Synchronizer};
pub use tasks::{ChainReceipt, SubmitTask, TaskView};
