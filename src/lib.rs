/*!
 # Gameserver Runner

 A Rust library for installing, updating, starting and stopping dedicated
 game servers on the local machine.

 ## Overview

 Gameserver Runner provides functionality to:
 - Persist one configuration record per managed server
 - Install and update server files through a staged, cancellable pipeline
 - Start, watch and force-stop server processes
 - Stop servers gracefully through their RCON endpoint
 - Answer "is it running?" from a cache that is invalidated on process exit
 - Publish every lifecycle change on a typed event stream

 ## Basic Usage

 ```no_run
 use gameserver_runner::{LifecycleOrchestrator, Result};
 use gameserver_runner::config::RunnerConfig;
 use gameserver_runner::events::EventKind;

 #[tokio::main]
 async fn main() -> Result<()> {
     let config = RunnerConfig::from_file("runner.yaml")?;
     let orchestrator = LifecycleOrchestrator::from_config(&config)?;

     // Follow progress while the server installs and starts
     let mut events = orchestrator.subscribe();
     tokio::spawn(async move {
         while let Ok(event) = events.recv().await {
             if let EventKind::ProgressUpdated { stage, percent } = &event.kind {
                 println!("{stage}: {percent:.1}%");
             }
         }
     });

     let mut record = orchestrator.create_server(true)?;
     record.remote_command_secret = "admin".to_string();
     orchestrator.save_server(&record).await?;

     orchestrator.start(record.id).await?;
     println!("running: {}", orchestrator.status(record.id).await?.is_running);

     // Save the world, then exit
     orchestrator.stop(record.id).await?;

     Ok(())
 }
 ```

 ## Features

 - **Install/Update Pipeline**: verify, fetch-manifest, download-deltas, apply-deltas and finalize stages with monotonic progress
 - **Process Supervision**: exactly one exit notification per started process
 - **Remote Commands**: Source RCON client for `saveworld` / `doexit`
 - **Status Cache**: per-server liveness with a freshness threshold
 - **Per-Server Serialization**: one lifecycle operation per server at a time, servers in parallel
 - **Configuration**: JSON or YAML runner config, JSON server records

 ## License

 This project is licensed under the terms in the LICENSE file.
*/

pub mod config;
pub mod error;
pub mod events;
pub mod install;
pub mod orchestrator;
pub mod remote;
pub mod server;

pub use config::RunnerConfig;
pub use error::{Error, Result};
pub use events::{EventBus, EventKind, LifecycleEvent, Operation};
pub use install::{InstallPipeline, PipelineRun, PipelineState, Stage};
pub use orchestrator::{LifecycleCommand, LifecycleOrchestrator, StartOptions};
pub use server::{ServerId, ServerRecord, ServerStatus};
