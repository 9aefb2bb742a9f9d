//! Message bus integration tests
//!
//! Services and clients live in the same process, each with its own
//! connection and event loop, and talk through a memory broker.

mod common;

use common::{memory_bus, shut_down, wait_until};
use quarry::bus::names::errors;
use quarry::bus::names::request_flags::DO_NOT_QUEUE;
use quarry::bus::{
    start_memory_broker, stop_memory_broker, BusError, DBusObserver, ErrorMapper, FromValue,
    Interface, MappedError, MethodError, ObjectTable, Unpacked, Value,
};
use proptest::prelude::*;
use proptest::test_runner::TestRunner;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use thiserror::Error;

const SERVICE: &str = "my.test.Service";
const PATH: &str = "/my/test/Service";
const INTERFACE: &str = "my.test.Interface";

#[derive(Error, Debug)]
#[error("{0}")]
struct ExceptionA(String);

impl MappedError for ExceptionA {
    fn from_message(message: String) -> Self {
        Self(message)
    }
}

fn test_mapper() -> ErrorMapper {
    let mut mapper = ErrorMapper::new("my.test");
    mapper.register::<ExceptionA>("my.test.Error");
    mapper
}

fn test_interface() -> Interface {
    Interface::new(INTERFACE)
        .method("Raise", "s", "", |args| {
            let message: String = quarry::bus::arg(&args, 0)?;
            Err(MethodError::new(ExceptionA(message)))
        })
        .method("Nothing", "", "", |_| Ok(Vec::new()))
        .method("One", "", "i", |_| Ok(vec![Value::from(7i32)]))
        .method("Two", "", "is", |_| {
            Ok(vec![Value::from(7i32), Value::from("seven")])
        })
}

#[test]
fn test_error_name_round_trip() {
    start_memory_broker("bus-errors");
    let (server_loop, server) = memory_bus("bus-errors", "errors-server", test_mapper());
    server
        .publish_object(PATH, ObjectTable::new().interface(test_interface()))
        .unwrap();
    server.register_service(SERVICE, DO_NOT_QUEUE).unwrap();

    let (client_loop, client) = memory_bus("bus-errors", "errors-client", test_mapper());
    let proxy = client.get_proxy(SERVICE, PATH).unwrap();
    let error = proxy
        .call("Raise", vec![Value::from("boom")])
        .unwrap_err();

    let remote = error.as_remote().expect("a remote error");
    assert_eq!(remote.dbus_name, "my.test.Error");
    assert_eq!(remote.dbus_domain, "my.test");
    assert_eq!(
        remote.downcast_ref::<ExceptionA>().map(|e| e.0.as_str()),
        Some("boom")
    );

    drop(proxy);
    shut_down(client_loop, client);
    shut_down(server_loop, server);
    stop_memory_broker("bus-errors");
}

#[test]
fn test_unknown_error_name_on_client() {
    start_memory_broker("bus-unknown-error");
    let (server_loop, server) = memory_bus("bus-unknown-error", "unknown-server", test_mapper());
    server
        .publish_object(PATH, ObjectTable::new().interface(test_interface()))
        .unwrap();
    server.register_service(SERVICE, DO_NOT_QUEUE).unwrap();

    // The client never registered ExceptionA.
    let (client_loop, client) =
        memory_bus("bus-unknown-error", "unknown-client", ErrorMapper::new("other"));
    let proxy = client.get_proxy(SERVICE, PATH).unwrap();
    let error = proxy.call("Raise", vec![Value::from("boom")]).unwrap_err();
    let remote = error.as_remote().expect("a remote error");
    assert_eq!(remote.dbus_name, "my.test.Error");
    assert!(remote.is::<quarry::bus::UnknownRemoteError>());
    assert_eq!(remote.message(), "boom");

    drop(proxy);
    shut_down(client_loop, client);
    shut_down(server_loop, server);
    stop_memory_broker("bus-unknown-error");
}

#[test]
fn test_panicking_method_gets_error_reply() {
    start_memory_broker("bus-panic");
    let (server_loop, server) = memory_bus("bus-panic", "panic-server", test_mapper());
    let interface = test_interface().method("Crash", "", "", |_| -> Result<Vec<Value>, MethodError> {
        panic!("the disk vanished")
    });
    server
        .publish_object(PATH, ObjectTable::new().interface(interface))
        .unwrap();
    server.register_service(SERVICE, DO_NOT_QUEUE).unwrap();

    let (client_loop, client) = memory_bus("bus-panic", "panic-client", test_mapper());
    let proxy = client.get_proxy(SERVICE, PATH).unwrap();
    let error = proxy.call("Crash", Vec::new()).unwrap_err();
    let remote = error.as_remote().expect("a remote error");
    assert_eq!(remote.dbus_name, errors::FAILED);
    assert!(remote.message().contains("the disk vanished"));

    // The loop survives and keeps answering.
    let unpacked = proxy.call("One", Vec::new()).unwrap();
    assert_eq!(unpacked.get::<i32>().unwrap(), 7);

    drop(proxy);
    shut_down(client_loop, client);
    shut_down(server_loop, server);
    stop_memory_broker("bus-panic");
}

#[test]
fn test_return_value_arity() {
    start_memory_broker("bus-arity");
    let (server_loop, server) = memory_bus("bus-arity", "arity-server", test_mapper());
    server
        .publish_object(PATH, ObjectTable::new().interface(test_interface()))
        .unwrap();
    server.register_service(SERVICE, DO_NOT_QUEUE).unwrap();

    let (client_loop, client) = memory_bus("bus-arity", "arity-client", test_mapper());
    let proxy = client.get_proxy(SERVICE, PATH).unwrap();

    assert!(proxy.call("Nothing", Vec::new()).unwrap().is_nothing());
    assert_eq!(proxy.call("One", Vec::new()).unwrap().get::<i32>().unwrap(), 7);
    match proxy.call("Two", Vec::new()).unwrap() {
        Unpacked::Group(values) => {
            assert_eq!(values, vec![Value::from(7i32), Value::from("seven")]);
        }
        other => panic!("Expected a group, got {:?}", other),
    }

    drop(proxy);
    shut_down(client_loop, client);
    shut_down(server_loop, server);
    stop_memory_broker("bus-arity");
}

#[test]
fn test_proxy_caches_members() {
    start_memory_broker("bus-cache");
    let (server_loop, server) = memory_bus("bus-cache", "cache-server", test_mapper());
    server
        .publish_object(PATH, ObjectTable::new().interface(test_interface()))
        .unwrap();
    server.register_service(SERVICE, DO_NOT_QUEUE).unwrap();

    let (client_loop, client) = memory_bus("bus-cache", "cache-client", test_mapper());
    let proxy = client.get_proxy(SERVICE, PATH).unwrap();
    let first = proxy.method("One").unwrap();
    let second = proxy.method("One").unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    assert!(matches!(
        proxy.method("Missing"),
        Err(BusError::MemberLookup { .. })
    ));

    drop(proxy);
    shut_down(client_loop, client);
    shut_down(server_loop, server);
    stop_memory_broker("bus-cache");
}

/// Whatever the lookup order, a member name always resolves to one object.
#[test]
fn test_member_cache_is_unique() {
    start_memory_broker("bus-cache-prop");
    let (server_loop, server) = memory_bus("bus-cache-prop", "cache-prop-server", test_mapper());
    server
        .publish_object(PATH, ObjectTable::new().interface(test_interface()))
        .unwrap();
    server.register_service(SERVICE, DO_NOT_QUEUE).unwrap();
    let (client_loop, client) = memory_bus("bus-cache-prop", "cache-prop-client", test_mapper());

    let mut runner = TestRunner::new(ProptestConfig::with_cases(32));
    let lookups = prop::collection::vec(
        prop::sample::select(vec!["Raise", "Nothing", "One", "Two"]),
        1..20,
    );
    runner
        .run(&lookups, |names| {
            let proxy = client.get_proxy(SERVICE, PATH).unwrap();
            let mut seen = HashMap::new();
            for name in names {
                let method = proxy.method(name).unwrap();
                let first = seen.entry(name).or_insert_with(|| Arc::clone(&method));
                prop_assert!(Arc::ptr_eq(first, &method));
            }
            Ok(())
        })
        .unwrap();

    shut_down(client_loop, client);
    shut_down(server_loop, server);
    stop_memory_broker("bus-cache-prop");
}

#[test]
fn test_concurrent_property_writes() {
    start_memory_broker("bus-property");
    let (server_loop, server) = memory_bus("bus-property", "property-server", test_mapper());

    let value = Arc::new(Mutex::new(0i32));
    let getter_value = Arc::clone(&value);
    let setter_value = Arc::clone(&value);
    let interface = Interface::new(INTERFACE).read_write_property(
        "Value",
        "i",
        move || Ok(Value::from(*getter_value.lock().unwrap())),
        move |new| {
            *setter_value.lock().unwrap() = i32::from_value(new)?;
            Ok(())
        },
    );
    server
        .publish_object(PATH, ObjectTable::new().interface(interface))
        .unwrap();
    server.register_service(SERVICE, DO_NOT_QUEUE).unwrap();

    let (client_loop, client) = memory_bus("bus-property", "property-client", test_mapper());
    let proxy = Arc::new(client.get_proxy(SERVICE, PATH).unwrap());
    assert_eq!(i32::from_value(proxy.get("Value").unwrap()).unwrap(), 0);

    let changes = Arc::new(AtomicUsize::new(0));
    {
        let changes = Arc::clone(&changes);
        proxy
            .connect_signal("PropertiesChanged", move |_| {
                changes.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }

    let writers: Vec<_> = [[1i32, 2], [3, 4]]
        .into_iter()
        .map(|values| {
            let proxy = Arc::clone(&proxy);
            thread::spawn(move || {
                for value in values {
                    proxy.set("Value", Value::from(value)).unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    let last = i32::from_value(proxy.get("Value").unwrap()).unwrap();
    assert!((1..=4).contains(&last), "unexpected final value {}", last);
    assert!(wait_until(|| changes.load(Ordering::SeqCst) == 4));

    drop(proxy);
    shut_down(client_loop, client);
    shut_down(server_loop, server);
    stop_memory_broker("bus-property");
}

#[test]
fn test_self_access_refused_on_loop_thread() {
    start_memory_broker("bus-self");
    let (event_loop, bus) = memory_bus("bus-self", "self-loop", test_mapper());
    bus.publish_object(PATH, ObjectTable::new().interface(test_interface()))
        .unwrap();
    bus.register_service(SERVICE, DO_NOT_QUEUE).unwrap();

    let (sender, receiver) = mpsc::channel();
    {
        let bus = Arc::clone(&bus);
        event_loop.schedule(move || {
            let _ = sender.send(bus.get_proxy(SERVICE, PATH).map(|_| ()));
        });
    }
    let result = receiver.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(matches!(result, Err(BusError::SelfAccessOnMainThread(name)) if name == SERVICE));

    // Any other thread may talk to our own service.
    let proxy = bus.get_proxy(SERVICE, PATH).unwrap();
    assert_eq!(proxy.call("One", Vec::new()).unwrap().get::<i32>().unwrap(), 7);

    drop(proxy);
    shut_down(event_loop, bus);
    stop_memory_broker("bus-self");
}

#[test]
fn test_observer_follows_the_name() {
    start_memory_broker("bus-observer");
    let (client_loop, client) = memory_bus("bus-observer", "observer-client", test_mapper());
    let observer = DBusObserver::new(&client, "my.test.Late");

    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = Arc::clone(&seen);
        observer
            .service_available
            .connect(move |name| seen.lock().unwrap().push(format!("up {}", name)));
    }
    {
        let seen = Arc::clone(&seen);
        observer
            .service_unavailable
            .connect(move |name| seen.lock().unwrap().push(format!("down {}", name)));
    }

    observer.connect_once_available().unwrap();
    observer.connect_once_available().unwrap();
    assert!(!observer.is_service_available());

    let (server_loop, server) = memory_bus("bus-observer", "observer-server", test_mapper());
    server.register_service("my.test.Late", DO_NOT_QUEUE).unwrap();
    assert!(wait_until(|| observer.is_service_available()));

    shut_down(server_loop, server);
    assert!(wait_until(|| !observer.is_service_available()));
    assert_eq!(
        *seen.lock().unwrap(),
        vec!["up my.test.Late".to_string(), "down my.test.Late".to_string()]
    );

    observer.disconnect();
    shut_down(client_loop, client);
    stop_memory_broker("bus-observer");
}

#[test]
fn test_observer_outlives_its_bus() {
    start_memory_broker("bus-gone");
    let (event_loop, bus) = memory_bus("bus-gone", "gone-loop", test_mapper());
    let observer = DBusObserver::new(&bus, "my.test.Gone");

    shut_down(event_loop, bus);
    assert!(matches!(
        observer.bus(),
        Err(BusError::ConnectionUnavailable(_))
    ));
    assert!(observer.connect_once_available().is_err());
    assert!(!observer.is_service_available());
    stop_memory_broker("bus-gone");
}

#[test]
fn test_name_taken_with_do_not_queue() {
    start_memory_broker("bus-taken");
    let (first_loop, first) = memory_bus("bus-taken", "taken-first", test_mapper());
    let (second_loop, second) = memory_bus("bus-taken", "taken-second", test_mapper());

    first.register_service(SERVICE, DO_NOT_QUEUE).unwrap();
    assert!(matches!(
        second.register_service(SERVICE, DO_NOT_QUEUE),
        Err(BusError::NameTaken { name, .. }) if name == SERVICE
    ));

    // Released on disconnect, so it can be claimed again.
    shut_down(first_loop, first);
    assert!(wait_until(|| second.register_service(SERVICE, DO_NOT_QUEUE).is_ok()));

    shut_down(second_loop, second);
    stop_memory_broker("bus-taken");
}
