use std::time::{Duration, Instant};

use serde_json::{json, Value};

use super::{
    HostOperations, MemoryDocumentStore, NoOperations, OperationOutcome, RequestBroker,
    RequestTicket, DEFAULT_REQUEST_TIMEOUT,
};
use crate::error::{Error, Result};
use crate::instance::InstanceId;

fn resolved(ticket: &mut RequestTicket) -> Result<Value> {
    ticket.try_result().expect("request resolved")
}

#[test]
fn document_roundtrip_through_the_broker() {
    let broker = RequestBroker::new(DEFAULT_REQUEST_TIMEOUT);
    let store = MemoryDocumentStore::new();
    let now = Instant::now();

    let mut create = broker.submit(
        InstanceId(1),
        "document:create",
        json!({"title": "notes", "content": ["a"]}),
        now,
    );
    assert!(create.try_result().is_none(), "nothing runs before dispatch");
    broker.dispatch(&store, now);

    let created = resolved(&mut create).expect("create ok");
    let doc_id = created["document"]["id"].as_str().expect("id").to_string();
    assert_eq!(created["document"]["title"], json!("notes"));

    let mut update = broker.submit(
        InstanceId(1),
        "document:update",
        json!({"id": doc_id, "content": ["a", "b"]}),
        now,
    );
    broker.dispatch(&store, now);
    let updated = resolved(&mut update).expect("update ok");
    assert_eq!(updated["document"]["content"], json!(["a", "b"]));

    let mut get = broker.submit(InstanceId(1), "document:get", json!({"id": doc_id}), now);
    broker.dispatch(&store, now);
    let fetched = resolved(&mut get).expect("get ok");
    assert_eq!(fetched["document"]["content"], json!(["a", "b"]));
    assert_eq!(broker.pending_count(), 0);
}

#[test]
fn get_of_a_missing_document_fails_typed() {
    let broker = RequestBroker::new(DEFAULT_REQUEST_TIMEOUT);
    let store = MemoryDocumentStore::new();
    let now = Instant::now();
    let mut ticket = broker.submit(InstanceId(1), "document:get", json!({"id": "doc-99"}), now);
    broker.dispatch(&store, now);
    assert!(matches!(
        resolved(&mut ticket),
        Err(Error::NotFound { resource: "document", .. })
    ));
}

#[test]
fn unknown_operation_fails_typed() {
    let broker = RequestBroker::new(DEFAULT_REQUEST_TIMEOUT);
    let now = Instant::now();
    let mut ticket = broker.submit(InstanceId(1), "clipboard:read", json!({}), now);
    broker.dispatch(&NoOperations, now);
    assert!(matches!(
        resolved(&mut ticket),
        Err(Error::RequestFailure { .. })
    ));
}

#[test]
fn pending_operation_times_out_at_the_deadline() {
    struct SlowCollaborator;
    impl HostOperations for SlowCollaborator {
        fn handle(&self, _operation: &str, _args: &Value) -> OperationOutcome {
            OperationOutcome::Pending
        }
    }

    let broker = RequestBroker::new(Duration::from_secs(10));
    let now = Instant::now();
    let mut ticket = broker.submit(InstanceId(1), "document:create", json!({}), now);
    broker.dispatch(&SlowCollaborator, now);
    assert!(ticket.try_result().is_none());
    assert_eq!(broker.pending_count(), 1);

    // Still within the deadline.
    broker.dispatch(&SlowCollaborator, now + Duration::from_secs(9));
    assert!(ticket.try_result().is_none());

    broker.dispatch(&SlowCollaborator, now + Duration::from_secs(10));
    assert!(matches!(
        resolved(&mut ticket),
        Err(Error::RequestTimeout { .. })
    ));
    assert_eq!(broker.pending_count(), 0);
}

#[test]
fn pending_operation_resolves_when_the_collaborator_answers() {
    struct Deferring;
    impl HostOperations for Deferring {
        fn handle(&self, _operation: &str, _args: &Value) -> OperationOutcome {
            OperationOutcome::Pending
        }
    }

    let broker = RequestBroker::new(DEFAULT_REQUEST_TIMEOUT);
    let now = Instant::now();
    let mut ticket = broker.submit(InstanceId(1), "document:create", json!({}), now);
    broker.dispatch(&Deferring, now);

    broker.complete(ticket.id(), Ok(json!({"document": {"id": "doc-1"}})));
    assert_eq!(
        resolved(&mut ticket).expect("ok"),
        json!({"document": {"id": "doc-1"}})
    );
}

#[test]
fn abandoning_an_instance_closes_its_tickets() {
    struct Stalled;
    impl HostOperations for Stalled {
        fn handle(&self, _operation: &str, _args: &Value) -> OperationOutcome {
            OperationOutcome::Pending
        }
    }

    let broker = RequestBroker::new(DEFAULT_REQUEST_TIMEOUT);
    let now = Instant::now();
    let mut mine = broker.submit(InstanceId(1), "document:get", json!({"id": "x"}), now);
    let mut other = broker.submit(InstanceId(2), "document:get", json!({"id": "y"}), now);
    broker.dispatch(&Stalled, now);

    assert_eq!(broker.abandon_for_instance(InstanceId(1)), 1);
    assert!(matches!(
        resolved(&mut mine),
        Err(Error::RequestFailure { .. })
    ));
    assert!(other.try_result().is_none(), "other instances unaffected");
    assert_eq!(broker.pending_count(), 1);
}

#[test]
fn late_resolution_after_timeout_is_ignored() {
    struct Stalled;
    impl HostOperations for Stalled {
        fn handle(&self, _operation: &str, _args: &Value) -> OperationOutcome {
            OperationOutcome::Pending
        }
    }

    let broker = RequestBroker::new(Duration::from_millis(100));
    let now = Instant::now();
    let mut ticket = broker.submit(InstanceId(1), "document:get", json!({"id": "x"}), now);
    let id = ticket.id();
    broker.dispatch(&Stalled, now + Duration::from_millis(100));
    assert!(matches!(
        resolved(&mut ticket),
        Err(Error::RequestTimeout { .. })
    ));

    // The collaborator answers after the deadline already rejected the
    // request; nothing to resolve, nothing crashes.
    broker.complete(id, Ok(json!({})));
    assert_eq!(broker.pending_count(), 0);
}

#[test]
fn failed_ticket_resolves_immediately() {
    let mut ticket = RequestTicket::failed(Error::invalid_input("host gone"));
    assert!(matches!(
        resolved(&mut ticket),
        Err(Error::InvalidInput { .. })
    ));
}

#[test]
fn dropped_ticket_does_not_break_completion() {
    let broker = RequestBroker::new(DEFAULT_REQUEST_TIMEOUT);
    let now = Instant::now();
    let ticket = broker.submit(InstanceId(1), "document:create", json!({}), now);
    let id = ticket.id();
    drop(ticket);
    broker.complete(id, Ok(json!({})));
    assert_eq!(broker.pending_count(), 0);
}
