//! Installation dispatcher tests with real modules on a memory broker

mod common;

use common::{FakeModule, TestInstaller};
use quarry::boss::InstallManager;
use quarry::constants::module_name;
use quarry::dispatch::{default_steps, Direction, DispatchError, Dispatcher, InstallContext};
use quarry::kickstart::KickstartManager;
use quarry::presentation::Presentation;
use quarry::tasks::{FnTask, InstallErrorHandler, Task};
use std::collections::VecDeque;
use std::fs;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const SECTIONS: &[&str] = &["pre", "post", "packages"];

const SCREENS: &[&str] = &[
    "language", "keyboard", "network", "storage", "software", "timezone", "users", "summary",
    "complete",
];

/// Answers `display_step` from a script; forward once it runs out.
#[derive(Default)]
struct ScriptedPresentation {
    answers: Mutex<VecDeque<Direction>>,
    shown: Mutex<Vec<String>>,
    shut_down: AtomicBool,
}

impl ScriptedPresentation {
    fn with_answers(answers: &[Direction]) -> Arc<Self> {
        Arc::new(Self {
            answers: Mutex::new(answers.iter().copied().collect()),
            ..Self::default()
        })
    }

    fn shown(&self) -> Vec<String> {
        self.shown.lock().unwrap().clone()
    }
}

impl Presentation for ScriptedPresentation {
    fn display_step(&self, step: &str) -> Direction {
        self.shown.lock().unwrap().push(step.to_string());
        self.answers
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Direction::Forward)
    }

    fn question(&self, _message: &str) -> bool {
        false
    }

    fn show_error(&self, _message: &str) {}

    fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }
}

fn network_module(errors: Vec<(u32, String)>, installs: &Arc<AtomicUsize>) -> Arc<FakeModule> {
    let installs = Arc::clone(installs);
    let task: Arc<dyn Task> = Arc::new(FnTask::new("Configure the network", move |_| {
        installs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }));
    Arc::new(FakeModule {
        commands: vec!["network".to_string()],
        errors,
        output: "network --device ens3 --activate".to_string(),
        tasks: vec![task],
        ..FakeModule::default()
    })
}

fn context(installer: &TestInstaller, kickstart: &std::path::Path) -> InstallContext {
    InstallContext {
        kickstart_path: Some(kickstart.to_path_buf()),
        kickstart: Some(Arc::new(KickstartManager::new(
            Arc::clone(&installer.modules),
            SECTIONS,
        ))),
        installer: Some(Arc::new(InstallManager::new(Arc::clone(&installer.modules)))),
        error_handler: Some(Arc::new(InstallErrorHandler::new(None, false))),
        ..InstallContext::default()
    }
}

#[test]
fn test_kickstart_installation_end_to_end() {
    let installer = TestInstaller::new("dispatch-end-to-end");
    let installs = Arc::new(AtomicUsize::new(0));
    let network = network_module(Vec::new(), &installs);
    installer.add_module(&module_name("Network"), Arc::clone(&network) as _);
    installer.start(TestInstaller::start_config()).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let kickstart = dir.path().join("ks.cfg");
    fs::write(&kickstart, "network --device ens3\n").unwrap();
    let output = dir.path().join("anaconda-ks.cfg");

    let presentation = ScriptedPresentation::with_answers(&[]);
    let mut context = context(&installer, &kickstart);
    context.kickstart_output = Some(output.clone());
    let mut dispatcher = Dispatcher::new(default_steps(), context, presentation.clone());
    dispatcher.run().unwrap();

    assert_eq!(presentation.shown(), SCREENS);
    assert!(presentation.shut_down.load(Ordering::SeqCst));
    assert!(dispatcher.is_finished());

    assert_eq!(
        network.last_received().as_deref(),
        Some("network --device ens3\n")
    );
    let report = dispatcher.context().report.as_ref().unwrap();
    assert!(report.is_valid());
    assert_eq!(installs.load(Ordering::SeqCst), 1);
    assert_eq!(
        fs::read_to_string(&output).unwrap(),
        "network --device ens3 --activate\n"
    );

    installer.shutdown();
}

#[test]
fn test_invalid_kickstart_stops_before_the_screens() {
    let installer = TestInstaller::new("dispatch-invalid");
    let installs = Arc::new(AtomicUsize::new(0));
    let network = network_module(vec![(1, "--device is required".to_string())], &installs);
    installer.add_module(&module_name("Network"), network);
    installer.start(TestInstaller::start_config()).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let kickstart = dir.path().join("ks.cfg");
    fs::write(&kickstart, "text\nnetwork --bootproto dhcp\n").unwrap();

    let presentation = ScriptedPresentation::with_answers(&[]);
    let mut dispatcher = Dispatcher::new(
        default_steps(),
        context(&installer, &kickstart),
        presentation.clone(),
    );
    let error = dispatcher.run().unwrap_err();
    assert!(matches!(error, DispatchError::InvalidKickstart(1)));
    assert!(presentation.shown().is_empty());
    assert_eq!(installs.load(Ordering::SeqCst), 0);

    let report = dispatcher.context().report.as_ref().unwrap();
    assert_eq!(report.error_messages[0].line_number, 2);
    assert_eq!(report.error_messages[0].message, "--device is required");

    installer.shutdown();
}

#[test]
fn test_screens_can_go_back() {
    let presentation = ScriptedPresentation::with_answers(&[
        Direction::Forward,
        Direction::Back,
        Direction::Forward,
    ]);
    let mut dispatcher = Dispatcher::new(
        default_steps(),
        InstallContext::default(),
        presentation.clone(),
    );
    dispatcher.skip_step("storage", true, true).unwrap();
    dispatcher.run().unwrap();

    let shown = presentation.shown();
    assert_eq!(&shown[..4], &["language", "keyboard", "language", "keyboard"]);
    assert!(!shown.contains(&"storage".to_string()));
    assert_eq!(shown.last().map(String::as_str), Some("complete"));
}

#[test]
fn test_step_list_limits_the_screens() {
    let presentation = ScriptedPresentation::with_answers(&[]);
    let mut dispatcher = Dispatcher::new(
        default_steps(),
        InstallContext::default(),
        presentation.clone(),
    );
    dispatcher.set_step_list(&["kickstart", "users", "install", "complete"]);
    dispatcher.run().unwrap();
    assert_eq!(presentation.shown(), vec!["users", "complete"]);
}
