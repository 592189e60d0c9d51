//! Entry point for the Centerfire agent supervisor.
//!
//! Parses the command line arguments and either performs a one-shot action
//! or starts the supervisor event loop.

use centerfire_supervisor::cli::{Cli, CliCommand};
use centerfire_supervisor::event::ApplicationEvent;
use centerfire_supervisor::event::channel::{EventPublisher, pub_sub};
use centerfire_supervisor::supervisor::instance_lock::InstanceLock;
use centerfire_supervisor::supervisor::run::SupervisorRunner;
use std::error::Error;
use std::process::ExitCode;
use tracing::{error, info};

fn main() -> ExitCode {
    let command = match Cli::init() {
        Ok(command) => command,
        Err(err) => {
            eprintln!("Error initializing the supervisor: {err}");
            return ExitCode::FAILURE;
        }
    };

    let (config, allow_multiple) = match command {
        CliCommand::Run {
            config,
            allow_multiple,
        } => (config, allow_multiple),
        CliCommand::OneShot(op) => {
            op.run();
            return ExitCode::SUCCESS;
        }
    };

    match run(*config, allow_multiple) {
        Ok(()) => {
            info!("the supervisor exited successfully");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("the supervisor exited with an error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(
    config: centerfire_supervisor::supervisor::config::SupervisorConfig,
    allow_multiple: bool,
) -> Result<(), Box<dyn Error>> {
    if !allow_multiple {
        InstanceLock::default().acquire()?;
    }

    let (application_event_publisher, application_event_consumer) = pub_sub();
    create_shutdown_signal_handler(application_event_publisher)?;

    SupervisorRunner::new(config, application_event_consumer)?.run()?;
    Ok(())
}

/// Routes Ctrl-C / SIGTERM into the supervisor event loop so it can stop
/// agents, HTTP facets and the bus in order.
fn create_shutdown_signal_handler(
    publisher: EventPublisher<ApplicationEvent>,
) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || {
        info!("received termination signal, stopping the supervisor");
        let _ = publisher
            .publish(ApplicationEvent::StopRequested)
            .inspect_err(|err| error!("could not send the stop request: {err}"));
    })
}
