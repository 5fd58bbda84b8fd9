use super::*;
use bytes::Bytes;
use std::time::Duration;

#[test]
fn test_request_constructors() {
    let query = Request::query(&b"SELECT * FROM t"[..]);
    assert_eq!(query.opcode, Opcode::Query);
    assert!(query.returns_rows);

    let write = Request::write(&b"INSERT"[..]);
    assert_eq!(write.opcode, Opcode::Query);
    assert!(!write.returns_rows);

    let batch = Request::batch(Bytes::new());
    assert_eq!(batch.opcode, Opcode::Batch);
    assert!(!batch.returns_rows);

    let execute = Request::execute(&b"\x00\x01"[..]);
    assert_eq!(execute.opcode, Opcode::Execute);
}

#[test]
fn test_execution_options_builder() {
    let options = ExecutionOptions::new()
        .with_timeout(Duration::from_millis(250))
        .with_idempotent(true)
        .with_routing_key(&b"user-42"[..])
        .with_execution_profile("analytics")
        .with_page_size(500);

    assert_eq!(options.timeout, Some(Duration::from_millis(250)));
    assert_eq!(options.idempotent, Some(true));
    assert_eq!(options.routing_key, Some(Bytes::from_static(b"user-42")));
    assert_eq!(options.execution_profile.as_deref(), Some("analytics"));
    assert_eq!(options.page_size, Some(500));
}

#[test]
fn test_execution_options_default_is_unset() {
    let options = ExecutionOptions::default();
    assert!(options.timeout.is_none());
    assert!(options.idempotent.is_none());
    assert!(options.routing_key.is_none());
    assert!(options.execution_profile.is_none());
    assert!(options.page_size.is_none());
}

#[test]
fn test_error_frame_carries_server_error() {
    let error = ServerError::new(ServerErrorKind::Unavailable, "not enough replicas");
    let frame = Frame::response(9, Opcode::Error, error.encode());

    let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
    assert_eq!(decoded.opcode, Opcode::Error);
    assert_eq!(ServerError::decode(&decoded.body).unwrap(), error);
}
