//! Kickstart splitting and distribution tests

mod common;

use common::{FakeModule, TestInstaller};
use proptest::prelude::*;
use quarry::constants::module_name;
use quarry::kickstart::{
    get_kickstart_from_elements, get_references_from_elements, ElementKind, KickstartManager,
    Selection, SplitKickstartParser,
};
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

const SECTIONS: &[&str] = &["pre", "post", "packages"];

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

/// `ks.cfg` including `sub.cfg`, both in a temporary directory.
fn kickstart_with_include() -> (TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let main = dir.path().join("ks.cfg");
    fs::write(&main, "network --device ens3\n%include sub.cfg\n").unwrap();
    fs::write(
        dir.path().join("sub.cfg"),
        "network --device=ens51 --activate\n%post\necho \"done\"\n%end\n",
    )
    .unwrap();
    (dir, main)
}

#[test]
fn test_round_trip_split() {
    let text = "text\n%pre\necho PRE\n%end\nnetwork --device ens3\n";
    let mut parser = SplitKickstartParser::new(SECTIONS, false);
    let elements = parser.split_from_string(text, "ks.cfg").unwrap();

    let summary: Vec<(&str, ElementKind, u32)> = elements
        .all_elements()
        .iter()
        .map(|e| (e.name(), e.kind(), e.lineno()))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("text", ElementKind::Command, 1),
            ("pre", ElementKind::Section, 2),
            ("network", ElementKind::Command, 5),
        ]
    );
    assert_eq!(get_kickstart_from_elements(elements.all_elements()), text);
    assert!(parser.errors().is_empty());
}

#[test]
fn test_include_elements_are_claimed() {
    let (_dir, main) = kickstart_with_include();
    let mut parser = SplitKickstartParser::new(SECTIONS, true);
    let mut elements = parser.split(&main).unwrap();
    assert_eq!(elements.len(), 3);

    let commands = strings(&["network"]);
    let network = elements.get_and_process_elements(Selection::new(&commands, &[], &[]));
    assert_eq!(
        get_kickstart_from_elements(&network),
        "network --device ens3\nnetwork --device=ens51 --activate\n"
    );

    let sections = strings(&["%post"]);
    let post = elements.get_and_process_elements(Selection::new(&[], &sections, &[]));
    let references = get_references_from_elements(&post);
    assert!(references[2].filename.ends_with("sub.cfg"));
    assert_eq!(references[2].lineno, 3);

    let rest = get_kickstart_from_elements(&elements.unprocessed_elements());
    assert!(!rest.contains("network"));
    assert!(!rest.contains("%post"));
}

#[test]
fn test_dispatch_with_include() {
    let installer = TestInstaller::new("kickstart-include");
    let network = Arc::new(FakeModule::owning(&["network"], &[]));
    let scripts = Arc::new(FakeModule {
        sections: strings(&["post"]),
        errors: vec![(2, "unknown command".to_string())],
        ..FakeModule::default()
    });
    let idle = Arc::new(FakeModule::default());
    installer.add_module(&module_name("Network"), Arc::clone(&network) as _);
    installer.add_module(&module_name("Scripts"), Arc::clone(&scripts) as _);
    installer.add_module(&module_name("Idle"), Arc::clone(&idle) as _);
    installer.start(TestInstaller::start_config()).unwrap();

    let (_dir, main) = kickstart_with_include();
    let manager = KickstartManager::new(Arc::clone(&installer.modules), SECTIONS);
    let report = manager.read_kickstart_file(&main);

    assert_eq!(
        network.last_received().as_deref(),
        Some("network --device ens3\nnetwork --device=ens51 --activate\n")
    );
    assert_eq!(
        scripts.last_received().as_deref(),
        Some("%post\necho \"done\"\n%end\n")
    );
    // Every module hears about the kickstart, even with nothing to read.
    assert_eq!(idle.last_received().as_deref(), Some(""));

    assert!(!report.is_valid());
    assert_eq!(report.error_messages.len(), 1);
    let error = &report.error_messages[0];
    assert_eq!(error.module_name, module_name("Scripts"));
    assert!(error.file_name.ends_with("sub.cfg"), "{}", error.file_name);
    assert_eq!(error.line_number, 3);
    assert_eq!(error.message, "unknown command");

    installer.shutdown();
}

#[test]
fn test_split_failure_stops_distribution() {
    let installer = TestInstaller::new("kickstart-bad-section");
    let network = Arc::new(FakeModule::owning(&["network"], &[]));
    installer.add_module(&module_name("Network"), Arc::clone(&network) as _);
    installer.start(TestInstaller::start_config()).unwrap();

    let manager = KickstartManager::new(Arc::clone(&installer.modules), SECTIONS);
    let report = manager.read_kickstart("network --device ens3\n%bogus\n%end\n", "ks.cfg");

    assert_eq!(report.error_messages.len(), 1);
    let error = &report.error_messages[0];
    assert_eq!(error.module_name, "");
    assert_eq!(error.file_name, "ks.cfg");
    assert_eq!(error.line_number, 2);
    assert!(network.last_received().is_none());

    installer.shutdown();
}

#[test]
fn test_missing_include_is_reported_and_skipped() {
    let installer = TestInstaller::new("kickstart-missing-include");
    let network = Arc::new(FakeModule::owning(&["network"], &[]));
    installer.add_module(&module_name("Network"), Arc::clone(&network) as _);
    installer.start(TestInstaller::start_config()).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let main = dir.path().join("ks.cfg");
    fs::write(&main, "%include nowhere.cfg\nnetwork --device ens3\n").unwrap();

    let manager = KickstartManager::new(Arc::clone(&installer.modules), SECTIONS);
    let report = manager.read_kickstart_file(&main);
    assert_eq!(report.error_messages.len(), 1);
    assert_eq!(report.error_messages[0].line_number, 0);
    assert!(report.error_messages[0].file_name.ends_with("nowhere.cfg"));
    assert_eq!(
        network.last_received().as_deref(),
        Some("network --device ens3\n")
    );

    let strict = KickstartManager::new(Arc::clone(&installer.modules), SECTIONS)
        .with_fatal_includes(true);
    let report = strict.read_kickstart_file(&main);
    assert_eq!(report.error_messages.len(), 1);
    assert_eq!(network.received.lock().unwrap().len(), 1);

    installer.shutdown();
}

#[test]
fn test_generate_kickstart_orders_modules() {
    let installer = TestInstaller::new("kickstart-generate");
    let outputs = [
        ("Scripts", "%post\necho hi\n%end\n"),
        ("Network", "network --device ens3\n"),
        ("Empty", "   \n"),
    ];
    for (short, output) in outputs {
        installer.add_module(
            &module_name(short),
            Arc::new(FakeModule {
                output: output.to_string(),
                ..FakeModule::default()
            }),
        );
    }
    installer.start(TestInstaller::start_config()).unwrap();

    let manager = KickstartManager::new(Arc::clone(&installer.modules), SECTIONS);
    assert_eq!(
        manager.generate_kickstart().unwrap(),
        "network --device ens3\n\n%post\necho hi\n%end"
    );

    installer.shutdown();
}

fn command_line() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9=-]{0,10}( [a-z0-9=-]{1,10}){0,3}"
}

fn section() -> impl Strategy<Value = String> {
    (
        prop::sample::select(SECTIONS.to_vec()),
        prop::collection::vec("[a-zA-Z0-9 ./=-]{0,30}", 0..4),
    )
        .prop_map(|(name, body)| {
            let mut text = format!("%{}\n", name);
            for line in body {
                text.push_str(&line);
                text.push('\n');
            }
            text.push_str("%end\n");
            text
        })
}

fn kickstart() -> impl Strategy<Value = String> {
    prop::collection::vec(
        prop_oneof![
            3 => command_line().prop_map(|line| format!("{}\n", line)),
            1 => section(),
        ],
        0..12,
    )
    .prop_map(|parts| parts.concat())
}

proptest! {
    /// Splitting and rendering back gives the original text.
    #[test]
    fn prop_split_renders_back(text in kickstart()) {
        let mut parser = SplitKickstartParser::new(SECTIONS, false);
        let elements = parser.split_from_string(&text, "ks.cfg").unwrap();
        prop_assert_eq!(get_kickstart_from_elements(elements.all_elements()), text);
    }

    /// Each rendered line points back at the line it came from.
    #[test]
    fn prop_references_point_at_source_lines(text in kickstart()) {
        let mut parser = SplitKickstartParser::new(SECTIONS, false);
        let elements = parser.split_from_string(&text, "ks.cfg").unwrap();
        let references = get_references_from_elements(elements.all_elements());

        prop_assert_eq!(references.len(), text.lines().count() + 1);
        for (index, reference) in references.iter().enumerate().skip(1) {
            prop_assert_eq!(reference.lineno as usize, index);
            prop_assert_eq!(reference.filename.as_str(), "ks.cfg");
        }
    }

    /// Claimed elements never show up again.
    #[test]
    fn prop_claimed_elements_are_processed_once(text in kickstart()) {
        let mut parser = SplitKickstartParser::new(SECTIONS, false);
        let mut elements = parser.split_from_string(&text, "ks.cfg").unwrap();
        let sections: Vec<String> = SECTIONS.iter().map(|s| s.to_string()).collect();

        let first = elements.get_and_process_elements(Selection::new(&[], &sections, &[]));
        let second = elements.get_and_process_elements(Selection::new(&[], &sections, &[]));
        prop_assert!(second.is_empty());
        prop_assert_eq!(first.len() + elements.unprocessed_elements().len(), elements.len());
        prop_assert!(elements
            .unprocessed_elements()
            .iter()
            .all(|e| e.kind() == ElementKind::Command));
    }
}
