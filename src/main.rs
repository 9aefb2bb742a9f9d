//! quarry-boss - Main entry point
//!
//! Runs the installer message bus, serves the Boss, drives a console
//! installation or splits a kickstart file for inspection.

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use quarry::boss::{publish_boss, Boss, InstallManager};
use quarry::bus::{AddressSource, EventLoop, MessageBus, UnixBrokerServer};
use quarry::cli::{Cli, Commands};
use quarry::config::BossConfig;
use quarry::dispatch::{default_steps, DispatchError, Dispatcher, InstallContext};
use quarry::error::installer_error_mapper;
use quarry::kickstart::{KickstartReport, SplitKickstartParser};
use quarry::presentation::{ConsolePresentation, Presentation};
use quarry::process_guard::{self, register_services, ProcessGuard};
use quarry::tasks::{InstallErrorHandler, Task};

/// Initialize the logger with appropriate settings
fn init_logger() {
    use env_logger::Builder;
    use std::io::Write;

    Builder::from_default_env()
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}:{}] {}",
                record.level(),
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .filter_level(log::LevelFilter::Info)
        .parse_default_env() // Allows RUST_LOG env var to override
        .init();
}

fn installer_bus(config: &BossConfig, event_loop: EventLoop) -> Arc<MessageBus> {
    MessageBus::new(
        AddressSource::Installer {
            address_file: config.address_file.clone(),
        },
        event_loop,
        installer_error_mapper(),
    )
}

fn run_bus(config: &BossConfig, socket: &Path) -> Result<()> {
    let server = UnixBrokerServer::bind(socket)
        .with_context(|| format!("Failed to listen on {}", socket.display()))?;

    if let Some(parent) = config.address_file.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(&config.address_file, format!("{}\n", server.address()))
        .with_context(|| format!("Failed to write {}", config.address_file.display()))?;
    info!(
        "Bus address {} written to {}",
        server.address(),
        config.address_file.display()
    );

    register_services(server.broker(), &config.services);
    let _guard = ProcessGuard::new();

    // The signal handler stops the services and exits.
    loop {
        std::thread::park();
    }
}

fn serve(config: &BossConfig) -> Result<()> {
    let event_loop = EventLoop::new("boss");
    let bus = installer_bus(config, event_loop.clone());
    let modules = Arc::new(quarry::modules::ModuleManager::new(Arc::clone(&bus)));
    let boss = Arc::new(Boss::new(
        modules,
        config.module_start_config(),
        &config.kickstart_sections,
    ));

    publish_boss(&boss).context("Failed to publish the Boss")?;
    info!("The Boss is ready");
    event_loop.run();
    info!("The Boss has quit");
    Ok(())
}

fn print_report(report: &KickstartReport) {
    for message in &report.error_messages {
        eprintln!("error: {}", message);
    }
    for message in &report.warning_messages {
        eprintln!("warning: {}", message);
    }
}

fn run_installation(
    config: &BossConfig,
    kickstart: Option<PathBuf>,
    generate: Option<PathBuf>,
    interactive: bool,
) -> Result<()> {
    let event_loop = EventLoop::spawn("boss").context("Failed to start the event loop")?;
    let bus = installer_bus(config, event_loop.clone());
    let modules = Arc::new(quarry::modules::ModuleManager::new(Arc::clone(&bus)));
    let boss = Boss::new(
        Arc::clone(&modules),
        config.module_start_config(),
        &config.kickstart_sections,
    );

    let start = boss.start_modules_with_task();
    start.start().context("Failed to start the modules")?;
    info!("Running modules: {}", modules.get_service_names().join(", "));

    let presentation: Arc<dyn Presentation> = Arc::new(ConsolePresentation::new(interactive));
    let context = InstallContext {
        kickstart_path: kickstart,
        kickstart: Some(Arc::clone(boss.kickstart())),
        installer: Some(Arc::new(InstallManager::new(Arc::clone(&modules)))),
        error_handler: Some(Arc::new(InstallErrorHandler::new(
            Some(Arc::clone(&presentation)),
            interactive,
        ))),
        kickstart_output: generate,
        interactive,
        ..InstallContext::default()
    };

    let mut dispatcher = Dispatcher::new(default_steps(), context, presentation);
    let result = dispatcher.run();

    if let Some(report) = &dispatcher.context().report {
        print_report(report);
    }
    modules.stop_modules();
    modules.disconnect();
    bus.disconnect();
    event_loop.shutdown();

    match result {
        Err(DispatchError::InvalidKickstart(count)) => {
            anyhow::bail!("The kickstart has {} error(s)", count)
        }
        other => other.context("The installation failed"),
    }
}

fn split(config: &BossConfig, file: &Path, lenient_includes: bool) -> Result<()> {
    let mut parser = SplitKickstartParser::new(&config.kickstart_sections, !lenient_includes);
    let elements = parser
        .split(file)
        .with_context(|| format!("Failed to split {}", file.display()))?;

    for element in elements.all_elements() {
        println!(
            "{}:{} {} {}",
            element.filename(),
            element.lineno(),
            element.kind(),
            element.name()
        );
    }
    for warning in parser.errors() {
        eprintln!("warning: {}", warning);
    }
    Ok(())
}

/// Main application entry point
fn main() -> Result<()> {
    // Initialize logging first
    init_logger();
    info!("quarry-boss starting up");

    // Activated services must not outlive us.
    if let Err(e) = process_guard::init_signal_handlers() {
        warn!("Failed to initialize signal handlers: {}", e);
    }
    debug!("Signal handlers initialized");

    let cli = Cli::parse_args();
    debug!("CLI arguments parsed");

    let config = BossConfig::load(&cli.config)?;

    let result = match cli.command {
        Commands::Bus { socket } => run_bus(&config, &socket),
        Commands::Serve => serve(&config),
        Commands::Run {
            kickstart,
            generate,
            non_interactive,
        } => run_installation(&config, kickstart, generate, !non_interactive),
        Commands::Split {
            file,
            lenient_includes,
        } => split(&config, &file, lenient_includes),
    };

    if let Err(e) = &result {
        error!("{:#}", e);
    }
    result
}
