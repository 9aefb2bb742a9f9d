//! The Boss seen from a client on the bus

mod common;

use common::{memory_bus, shut_down, wait_until, FakeModule, TestInstaller};
use quarry::boss::{publish_boss, Boss};
use quarry::bus::{DBusObserver, ObjectPath};
use quarry::constants::{addon_name, module_name, BOSS_NAME, BOSS_PATH};
use quarry::error::installer_error_mapper;
use quarry::kickstart::KickstartReport;
use quarry::tasks::{DBusTask, FnTask, Task};
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const SECTIONS: &[&str] = &["pre", "post", "packages"];

#[test]
fn test_boss_drives_an_installation() {
    let installer = TestInstaller::new("boss-installation");
    let installs = Arc::new(AtomicUsize::new(0));
    let task: Arc<dyn Task> = {
        let installs = Arc::clone(&installs);
        Arc::new(FnTask::new("Configure the network", move |_| {
            installs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
    };
    let network = Arc::new(FakeModule {
        commands: vec!["network".to_string()],
        output: "network --device ens3".to_string(),
        tasks: vec![task],
        ..FakeModule::default()
    });
    let example = Arc::new(FakeModule::default());
    installer.add_module(&module_name("Network"), Arc::clone(&network) as _);
    installer.add_module(&addon_name("Example"), Arc::clone(&example) as _);

    let boss = Arc::new(Boss::new(
        Arc::clone(&installer.modules),
        TestInstaller::start_config(),
        SECTIONS,
    ));
    publish_boss(&boss).unwrap();

    let (client_loop, client) =
        memory_bus("boss-installation", "boss-client", installer_error_mapper());
    let observer = DBusObserver::new(&client, BOSS_NAME);
    observer.connect_once_available().unwrap();
    assert!(wait_until(|| observer.is_service_available()));
    let proxy = client.get_proxy(BOSS_NAME, BOSS_PATH).unwrap();

    // Start the modules through the published start task.
    let path: ObjectPath = proxy.call("StartModulesWithTask", Vec::new()).unwrap().get().unwrap();
    DBusTask::new(&client, BOSS_NAME, path.as_str())
        .unwrap()
        .start()
        .unwrap();
    let modules: Vec<String> = proxy.call("GetModules", Vec::new()).unwrap().get().unwrap();
    assert_eq!(modules, vec![module_name("Network"), addon_name("Example")]);

    proxy
        .call("SetLocale", vec!["de_DE.UTF-8".into()])
        .unwrap();
    assert_eq!(network.locale.lock().unwrap().as_deref(), Some("de_DE.UTF-8"));
    assert_eq!(example.locale.lock().unwrap().as_deref(), Some("de_DE.UTF-8"));

    let dir = tempfile::tempdir().unwrap();
    let kickstart = dir.path().join("ks.cfg");
    fs::write(&kickstart, "network --device ens3\n").unwrap();
    let path = kickstart.to_string_lossy().to_string();
    let report: KickstartReport = proxy
        .call("ReadKickstartFile", vec![path.into()])
        .unwrap()
        .get()
        .unwrap();
    assert!(report.is_valid());
    assert_eq!(
        network.last_received().as_deref(),
        Some("network --device ens3\n")
    );

    let generated: String = proxy.call("GenerateKickstart", Vec::new()).unwrap().get().unwrap();
    assert_eq!(generated, "network --device ens3");

    let path: ObjectPath = proxy.call("InstallSystemWithTask", Vec::new()).unwrap().get().unwrap();
    let install = DBusTask::new(&client, BOSS_NAME, path.as_str()).unwrap();
    assert_eq!(install.name(), "Install the system");
    install.start().unwrap();
    assert_eq!(installs.load(Ordering::SeqCst), 1);

    proxy.call("Quit", Vec::new()).unwrap();
    assert!(wait_until(|| !observer.is_service_available()));
    assert!(installer.modules.get_service_names().is_empty());

    drop(install);
    drop(proxy);
    observer.disconnect();
    shut_down(client_loop, client);
    installer.shutdown();
}

#[test]
fn test_boss_name_is_exclusive() {
    let installer = TestInstaller::new("boss-exclusive");
    let first = Arc::new(Boss::new(
        Arc::clone(&installer.modules),
        TestInstaller::start_config(),
        SECTIONS,
    ));
    publish_boss(&first).unwrap();

    let (other_loop, other) =
        memory_bus("boss-exclusive", "boss-other", installer_error_mapper());
    let second = Arc::new(Boss::new(
        Arc::new(quarry::modules::ModuleManager::new(Arc::clone(&other))),
        TestInstaller::start_config(),
        SECTIONS,
    ));
    assert!(publish_boss(&second).is_err());

    shut_down(other_loop, other);
    installer.shutdown();
}
