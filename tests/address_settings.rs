//! Dead-letter routing driven by hierarchical address settings, end to end
//! through a client session.

mod common;

use common::{body_string, TestBroker, RECEIVE_TIMEOUT};
use hornetq_core::client::ClientSession;
use hornetq_core::core::ClientConfig;
use hornetq_core::messaging::{Message, ORIGINAL_ADDRESS_PROPERTY};
use hornetq_core::settings::AddressSettings;

fn dla(address: &str) -> AddressSettings {
    AddressSettings::new()
        .with_dead_letter_address(address)
        .with_max_delivery_attempts(1)
}

fn max_one() -> AddressSettings {
    AddressSettings::new().with_max_delivery_attempts(1)
}

/// Send one message per `(address, body)`, receive each once, roll back and
/// return the body found on each dead-letter queue.
fn run_rollback_round(
    patterns: &[(&str, AddressSettings)],
    traffic: &[(&str, &str)],
    dead_letter: &[(&str, &str)],
) -> Vec<Option<String>> {
    let broker = TestBroker::start(patterns);
    let factory = broker.locator(ClientConfig::default()).create_session_factory().unwrap();
    let session = factory.create_session(true, false).unwrap();
    for (address, _) in traffic {
        session.create_queue(address, address, false).unwrap();
    }
    for (dla_address, queue) in dead_letter {
        session.create_queue(dla_address, queue, false).unwrap();
    }
    for (address, body) in traffic {
        let producer = session.create_producer(address).unwrap();
        producer.send(Message::new(false).with_body(body.to_string())).unwrap();
    }
    session.start();
    let mut consumers = Vec::new();
    for (address, body) in traffic {
        let consumer = session.create_consumer(address).unwrap();
        let message = consumer.receive(RECEIVE_TIMEOUT).unwrap().expect("message delivered");
        assert_eq!(body_string(&message), *body);
        assert_eq!(message.delivery_count(), 1);
        consumers.push(consumer);
    }
    session.rollback().unwrap();

    let results = dead_letter
        .iter()
        .map(|(_, queue)| receive_one(&session, queue))
        .collect();
    session.close().unwrap();
    results
}

fn receive_one(session: &ClientSession, queue: &str) -> Option<String> {
    let consumer = session.create_consumer(queue).unwrap();
    let message = consumer.receive(std::time::Duration::from_millis(200)).unwrap();
    let body = message.map(|m| {
        assert!(m.header().string_property(ORIGINAL_ADDRESS_PROPERTY).is_some());
        m.acknowledge().unwrap();
        body_string(&m)
    });
    session.commit().unwrap();
    consumer.close().unwrap();
    body
}

#[test]
fn simple_hierarchy_routes_to_own_dead_letter_address() {
    let results = run_rollback_round(
        &[("addressA", dla("dlaA")), ("addressB", dla("dlaB"))],
        &[("addressA", "A"), ("addressB", "B")],
        &[("dlaA", "dlqA"), ("dlaB", "dlqB")],
    );
    assert_eq!(results, vec![Some("A".to_string()), Some("B".to_string())]);
}

#[test]
fn catch_all_pattern_covers_unmatched_addresses() {
    let results = run_rollback_round(
        &[("addressA", dla("dlaA")), ("#", dla("dlaB"))],
        &[("addressA", "A"), ("addressB", "B")],
        &[("dlaA", "dlqA"), ("dlaB", "dlqB")],
    );
    assert_eq!(results, vec![Some("A".to_string()), Some("B".to_string())]);
}

#[test]
fn three_level_precedence_picks_most_specific() {
    let results = run_rollback_round(
        &[("add.addressA", dla("dlaA")), ("add.*", dla("dlaB")), ("#", dla("dlaC"))],
        &[("add.addressA", "A"), ("add.addressB", "B"), ("addressC", "C")],
        &[("dlaA", "dlqA"), ("dlaB", "dlqB"), ("dlaC", "dlqC")],
    );
    assert_eq!(
        results,
        vec![Some("A".to_string()), Some("B".to_string()), Some("C".to_string())]
    );
}

#[test]
fn unset_fields_inherit_from_less_specific_patterns() {
    let broker = TestBroker::start(&[(
        "add.addressA",
        max_one(),
    ), ("add.*", max_one()), ("#", dla("dlaC"))]);
    let factory = broker.locator(ClientConfig::default()).create_session_factory().unwrap();
    let session = factory.create_session(true, false).unwrap();
    let traffic = [("add.addressA", "A"), ("add.addressB", "B"), ("addressC", "C")];
    for (address, _) in traffic {
        session.create_queue(address, address, false).unwrap();
    }
    session.create_queue("dlaC", "dlqC", false).unwrap();
    for (address, body) in traffic {
        session
            .create_producer(address)
            .unwrap()
            .send(Message::new(false).with_body(body))
            .unwrap();
    }
    session.start();
    let mut consumers = Vec::new();
    for (address, _) in traffic {
        let consumer = session.create_consumer(address).unwrap();
        assert!(consumer.receive(RECEIVE_TIMEOUT).unwrap().is_some());
        consumers.push(consumer);
    }
    session.rollback().unwrap();

    let consumer = session.create_consumer("dlqC").unwrap();
    let mut bodies = Vec::new();
    while let Some(message) = consumer.receive(std::time::Duration::from_millis(200)).unwrap() {
        bodies.push(body_string(&message));
    }
    bodies.sort();
    assert_eq!(bodies, vec!["A", "B", "C"]);
    assert_eq!(broker.broker.stats().dead_lettered(), 3);
}

#[test]
fn settings_changes_apply_to_next_resolution() {
    let broker = TestBroker::start(&[("#", dla("dlaC"))]);
    let settings = broker.broker.settings();
    assert_eq!(settings.get_match("orders.eu").dead_letter_address.as_deref(), Some("dlaC"));
    settings.add_match("orders.*", dla("dlaOrders")).unwrap();
    assert_eq!(
        settings.get_match("orders.eu").dead_letter_address.as_deref(),
        Some("dlaOrders")
    );
    assert!(settings.remove_match("orders.*"));
    assert_eq!(settings.get_match("orders.eu").dead_letter_address.as_deref(), Some("dlaC"));
}
