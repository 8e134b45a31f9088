use gameserver_runner::config::RunnerConfig;
use gameserver_runner::error::{Error, Result};
use gameserver_runner::events::EventKind;
use gameserver_runner::{LifecycleOrchestrator, ServerId, StartOptions};
use tracing_subscriber::{EnvFilter, fmt};

const USAGE: &str = "usage: manage_server <config> <list|create|install|start|stop|force-stop|status|delete> [id]";

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr through a background writer; keep the guard alive
    // until the end of main so buffered lines are flushed.
    let (writer, _guard) = tracing_appender::non_blocking(std::io::stderr());
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .with_writer(writer)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (config_path, command) = match (args.first(), args.get(1)) {
        (Some(config), Some(command)) => (config.as_str(), command.as_str()),
        _ => {
            eprintln!("{}", USAGE);
            return Ok(());
        }
    };

    let config = RunnerConfig::from_file(config_path)?;
    let orchestrator = LifecycleOrchestrator::from_config(&config)?;
    tracing::info!(servers_dir = %config.servers_dir.display(), "Orchestrator ready");

    // Print what a presentation layer would receive
    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match &event.kind {
                EventKind::ProgressUpdated { stage, percent } => println!("[{}] {:>5.1}%", stage, percent),
                EventKind::OperationFailed { operation, message, .. } => {
                    println!("{:?} failed: {}", operation, message)
                }
                kind => match kind.signal_name() {
                    Some(signal) => println!("{} {:?}", signal, event.server_id),
                    None => println!("{:?}", kind),
                },
            }
        }
    });

    let id = || -> Result<ServerId> {
        args.get(2)
            .and_then(|raw| raw.parse::<u32>().ok())
            .map(ServerId::new)
            .ok_or_else(|| Error::Other(format!("missing or invalid server id\n{}", USAGE)))
    };

    match command {
        "list" => {
            for record in orchestrator.servers()? {
                println!("{:>4}  {:<24} {}", record.id, record.alias, record.install_path.display());
            }
        }
        "create" => {
            let record = orchestrator.create_server(true)?;
            println!("created server {} at {}", record.id, record.install_path.display());
        }
        "install" => {
            let run = orchestrator.install(id()?).await?;
            println!("install finished: {:?}", run.state);
        }
        "start" => {
            // Running from the command line counts as confirmation
            let options = StartOptions {
                confirm_external_config: true,
            };
            orchestrator.start_with(id()?, options).await?;
            println!("server started, press Ctrl-C to detach");
            tokio::signal::ctrl_c()
                .await
                .map_err(|e| Error::Other(format!("Failed to wait for Ctrl-C: {}", e)))?;
        }
        "stop" => orchestrator.stop(id()?).await?,
        "force-stop" => orchestrator.force_stop(id()?).await?,
        "status" => {
            let id = id()?;
            let status = orchestrator.status(id).await?;
            println!(
                "server {}: running={} installed={}",
                id,
                status.is_running,
                orchestrator.is_installed(id)?
            );
        }
        "delete" => orchestrator.delete(id()?).await?,
        other => eprintln!("unknown command '{}'\n{}", other, USAGE),
    }

    Ok(())
}
