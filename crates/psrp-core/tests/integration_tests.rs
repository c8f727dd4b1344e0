//! End-to-end conversations between a client and a server pool
//!
//! These tests run both state machines back to back over an in-memory
//! byte pipe, covering the opening handshake, the session key exchange,
//! pipeline lifecycles, host calls and the failure paths.

use uuid::Uuid;

use psrp_core::protocol::bodies::{AvailabilityResponse, SessionCapability};
use psrp_core::protocol::fragment::fragment_object;
use psrp_core::protocol::message::{Message, MessageType};
use psrp_core::{
    ClientRunspacePool, Command, Destination, EventKind, HostMethodIdentifier, PipelineHandle,
    PoolConfig, PowerShell, PsInvocationState, PsSecureString, PsValue, PsrpError, PsrpEvent,
    RunspacePoolState, ServerConfig, ServerRunspacePool,
};

// ----------------------------------------------------------------------------
// Test utilities
// ----------------------------------------------------------------------------

/// Shuttle bytes both ways until neither side has anything left, at the
/// given fragment size, collecting the events each side produced.
fn pump(
    client: &mut ClientRunspacePool,
    server: &mut ServerRunspacePool,
    max_fragment_size: Option<usize>,
) -> (Vec<PsrpEvent>, Vec<PsrpEvent>) {
    let mut client_events = Vec::new();
    let mut server_events = Vec::new();

    loop {
        let mut moved = false;
        while let Some(payload) = client.data_to_send(max_fragment_size) {
            server.receive_data(&payload.data);
            moved = true;
        }
        while let Some(event) = server.next_event().expect("server event") {
            server_events.push(event);
        }
        while let Some(payload) = server.data_to_send(max_fragment_size) {
            client.receive_data(&payload.data);
            moved = true;
        }
        while let Some(event) = client.next_event().expect("client event") {
            client_events.push(event);
        }
        if !moved {
            break;
        }
    }

    (client_events, server_events)
}

/// An opened client/server pair.
fn opened_pair() -> (ClientRunspacePool, ServerRunspacePool) {
    let mut client = ClientRunspacePool::new(PoolConfig::with_runspaces(1, 2));
    let mut server = ServerRunspacePool::new(ServerConfig::default());
    client.open().unwrap();
    pump(&mut client, &mut server, None);
    assert_eq!(client.state(), RunspacePoolState::Opened);
    assert_eq!(server.state(), RunspacePoolState::Opened);
    (client, server)
}

/// An opened pair plus a started pipeline on both sides.
fn running_pipeline(
    powershell: PowerShell,
) -> (ClientRunspacePool, ServerRunspacePool, PipelineHandle) {
    let (mut client, mut server) = opened_pair();
    let handle = client.create_pipeline(powershell).unwrap();
    client.pipeline(handle).unwrap().start().unwrap();
    let (_, server_events) = pump(&mut client, &mut server, None);
    assert!(server_events
        .iter()
        .any(|e| matches!(e.kind, EventKind::CreatePipeline(_))));

    server.pipeline(handle.id()).unwrap().start().unwrap();
    let (client_events, _) = pump(&mut client, &mut server, None);
    assert!(client_events.iter().any(|e| matches!(
        e.kind,
        EventKind::PipelineStateChanged {
            state: PsInvocationState::Running,
            ..
        }
    )));
    (client, server, handle)
}

// ----------------------------------------------------------------------------
// Opening handshake
// ----------------------------------------------------------------------------

#[test]
fn open_emits_capability_then_init() {
    let mut client = ClientRunspacePool::new(PoolConfig::default());
    client.open().unwrap();
    assert_eq!(client.state(), RunspacePoolState::NegotiationSent);

    // Everything the client queued, reassembled into messages.
    let payload = client.data_to_send(None).unwrap();
    let mut messages = Vec::new();
    let mut rest = payload.data.as_slice();
    while let Some((fragment, consumed)) =
        psrp_core::protocol::fragment::Fragment::parse(rest)
    {
        assert!(fragment.start && fragment.end);
        messages.push(Message::unpack(&fragment.data).unwrap());
        rest = &rest[consumed..];
    }

    assert_eq!(messages.len(), 2);
    assert_eq!(
        messages[0].known_type(),
        Some(MessageType::SessionCapability)
    );
    assert_eq!(
        messages[1].known_type(),
        Some(MessageType::InitRunspacePool)
    );
    assert!(messages.iter().all(|m| m.pipeline_id.is_none()));
}

#[test]
fn open_completes_on_capability_and_state() {
    let mut client = ClientRunspacePool::new(PoolConfig::default());
    client.open().unwrap();
    client.data_to_send(None).unwrap();

    // Hand-craft the server's half of the handshake.
    let capability = Message::new(
        Destination::Client,
        MessageType::SessionCapability,
        client.id(),
        None,
        psrp_core::serialize_clixml(&SessionCapability::default().to_value())
            .unwrap()
            .into_bytes(),
    );
    let opened = Message::new(
        Destination::Client,
        MessageType::RunspacePoolState,
        client.id(),
        None,
        psrp_core::serialize_clixml(&psrp_core::protocol::bodies::RunspacePoolStateMsg::new(
            RunspacePoolState::Opened,
        )
        .to_value())
        .unwrap()
        .into_bytes(),
    );

    for (object_id, message) in [(1u64, capability), (2u64, opened)] {
        for fragment in fragment_object(object_id, &message.pack(), 4096) {
            client.receive_data(&fragment.to_bytes());
        }
    }

    let first = client.next_event().unwrap().unwrap();
    assert!(matches!(first.kind, EventKind::SessionCapability(_)));
    assert_eq!(client.state(), RunspacePoolState::NegotiationSucceeded);

    let second = client.next_event().unwrap().unwrap();
    assert_eq!(second.kind, EventKind::PoolOpened);
    assert_eq!(client.state(), RunspacePoolState::Opened);
    assert!(client.next_event().unwrap().is_none());
}

#[test]
fn full_handshake_against_real_server() {
    let mut client = ClientRunspacePool::new(PoolConfig::with_runspaces(2, 5));
    let mut server = ServerRunspacePool::new(ServerConfig::default());
    client.open().unwrap();

    let (client_events, server_events) = pump(&mut client, &mut server, Some(333));

    assert_eq!(server.id(), client.id());
    assert_eq!(server.min_runspaces(), 2);
    assert_eq!(server.max_runspaces(), 5);
    assert_eq!(client.state(), RunspacePoolState::Opened);
    assert_eq!(server.state(), RunspacePoolState::Opened);

    assert!(client_events
        .iter()
        .any(|e| e.kind == EventKind::PoolOpened));
    assert!(client_events
        .iter()
        .any(|e| matches!(e.kind, EventKind::ApplicationPrivateData(_))));
    assert!(server_events
        .iter()
        .any(|e| matches!(e.kind, EventKind::InitRunspacePool { max_runspaces: 5, .. })));
}

#[test]
fn open_twice_is_idempotent_but_misuse_errors() {
    let mut client = ClientRunspacePool::new(PoolConfig::default());
    client.open().unwrap();
    let result = client.open();
    assert!(matches!(
        result,
        Err(PsrpError::Protocol(
            psrp_core::ProtocolError::InvalidTransition { .. }
        ))
    ));
}

// ----------------------------------------------------------------------------
// Key exchange and secure strings
// ----------------------------------------------------------------------------

#[test]
fn secure_string_requires_key_exchange() {
    let mut powershell = PowerShell::new().add_command(Command::new("Read-Secret"));
    powershell.no_input = false;
    let (mut client, mut server, handle) = running_pipeline(powershell);

    // Before the exchange the serialization must fail.
    let secret = PsValue::SecureString(PsSecureString::Plaintext("s3cret".to_string()));
    let result = client.pipeline(handle).unwrap().send_input(secret.clone());
    assert!(result.unwrap_err().is_crypto_unavailable());

    client.exchange_key().unwrap();
    let (client_events, server_events) = pump(&mut client, &mut server, None);
    assert!(client_events
        .iter()
        .any(|e| e.kind == EventKind::SessionKeyRegistered));
    assert!(server_events
        .iter()
        .any(|e| e.kind == EventKind::PublicKeyReceived));

    // Now the same value serializes and the server can read it back.
    client.pipeline(handle).unwrap().send_input(secret).unwrap();
    let (_, server_events) = pump(&mut client, &mut server, None);
    let received = server_events
        .iter()
        .find_map(|e| match &e.kind {
            EventKind::PipelineInput(PsValue::SecureString(ss)) => Some(ss.clone()),
            _ => None,
        })
        .expect("secure string input");
    assert!(matches!(received, PsSecureString::Encrypted(_)));
    assert_eq!(server.decrypt_secure_string(&received).unwrap(), "s3cret");
}

#[test]
fn server_key_request_triggers_client_exchange() {
    let (mut client, mut server) = opened_pair();
    server.request_key().unwrap();
    let (client_events, server_events) = pump(&mut client, &mut server, None);

    assert!(client_events
        .iter()
        .any(|e| e.kind == EventKind::PublicKeyRequested));
    assert!(client_events
        .iter()
        .any(|e| e.kind == EventKind::SessionKeyRegistered));
    assert!(server_events
        .iter()
        .any(|e| e.kind == EventKind::PublicKeyReceived));
}

// ----------------------------------------------------------------------------
// Pipeline lifecycle
// ----------------------------------------------------------------------------

#[test]
fn pipeline_output_and_completion() {
    let powershell = PowerShell::new().add_command(Command::new("Get-Process"));
    let (mut client, mut server, handle) = running_pipeline(powershell);

    {
        let mut pipeline = server.pipeline(handle.id()).unwrap();
        pipeline.write_output(PsValue::from("proc-1")).unwrap();
        pipeline.write_output(PsValue::Int32(2)).unwrap();
        pipeline
            .write_verbose(psrp_core::InformationalRecord::new("working"))
            .unwrap();
        pipeline.complete().unwrap();
    }
    let (client_events, _) = pump(&mut client, &mut server, Some(128));

    let outputs: Vec<&PsValue> = client_events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::PipelineOutput(Some(value)) => Some(value),
            _ => None,
        })
        .collect();
    assert_eq!(outputs.len(), 2);
    assert_eq!(outputs[0].as_str().as_deref(), Some("proc-1"));
    assert_eq!(outputs[1], &PsValue::Int32(2));

    assert!(client_events
        .iter()
        .any(|e| matches!(&e.kind, EventKind::VerboseRecord(r) if r.message == "working")));
    assert_eq!(
        client.pipeline_state(handle),
        Some(PsInvocationState::Completed)
    );
    assert!(client_events
        .iter()
        .all(|e| e.runspace_pool_id == client.id()));
}

#[test]
fn pipeline_input_streaming() {
    let mut powershell = PowerShell::new().add_script("$input | Measure-Object");
    powershell.no_input = false;
    let (mut client, mut server, handle) = running_pipeline(powershell);

    {
        let mut pipeline = client.pipeline(handle).unwrap();
        pipeline.send_input(PsValue::Int32(1)).unwrap();
        pipeline.send_input(PsValue::from("two")).unwrap();
        pipeline.close_input().unwrap();
    }
    let (_, server_events) = pump(&mut client, &mut server, None);

    let inputs: Vec<&PsValue> = server_events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::PipelineInput(value) => Some(value),
            _ => None,
        })
        .collect();
    assert_eq!(inputs, [&PsValue::Int32(1), &PsValue::from("two")]);
    assert!(server_events
        .iter()
        .any(|e| e.kind == EventKind::EndOfPipelineInput));
}

#[test]
fn no_input_pipeline_rejects_input() {
    // The default pipeline declares no_input; sending anyway is a local
    // protocol violation.
    let powershell = PowerShell::new().add_command(Command::new("Get-Date"));
    let (mut client, _server, handle) = running_pipeline(powershell);

    let result = client
        .pipeline(handle)
        .unwrap()
        .send_input(PsValue::Int32(1));
    assert!(matches!(
        result,
        Err(PsrpError::Protocol(
            psrp_core::ProtocolError::ProtocolViolation { .. }
        ))
    ));
}

#[test]
fn server_stop_reports_stopped_state_with_error() {
    let powershell = PowerShell::new().add_script("while ($true) {}");
    let (mut client, mut server, handle) = running_pipeline(powershell);

    client.pipeline(handle).unwrap().begin_stop().unwrap();
    server.pipeline(handle.id()).unwrap().stop().unwrap();
    let (client_events, _) = pump(&mut client, &mut server, None);

    let (state, error) = client_events
        .iter()
        .find_map(|e| match &e.kind {
            EventKind::PipelineStateChanged { state, error } => Some((*state, error.clone())),
            _ => None,
        })
        .expect("pipeline state event");
    assert_eq!(state, PsInvocationState::Stopped);
    let error = error.expect("stop carries an error record");
    assert_eq!(
        error.fully_qualified_error_id.as_deref(),
        Some("PipelineStopped")
    );
}

#[test]
fn unknown_pipeline_does_not_break_the_pool() {
    let (mut client, mut server) = opened_pair();

    // The server writes output for a pipeline the client never created.
    let ghost = Uuid::new_v4();
    let message = Message::new(
        Destination::Client,
        MessageType::PipelineOutput,
        client.id(),
        Some(ghost),
        psrp_core::serialize_clixml(&PsValue::from("boo"))
            .unwrap()
            .into_bytes(),
    );
    for fragment in fragment_object(100, &message.pack(), 4096) {
        client.receive_data(&fragment.to_bytes());
    }

    let result = client.next_event();
    assert!(matches!(
        result,
        Err(PsrpError::Protocol(
            psrp_core::ProtocolError::UnknownPipeline { .. }
        ))
    ));

    // The pool survives and keeps working.
    assert_eq!(client.state(), RunspacePoolState::Opened);
    let handle = client
        .create_pipeline(PowerShell::new().add_command(Command::new("Get-Date")))
        .unwrap();
    client.pipeline(handle).unwrap().start().unwrap();
    let (_, server_events) = pump(&mut client, &mut server, None);
    assert!(server_events
        .iter()
        .any(|e| matches!(e.kind, EventKind::CreatePipeline(_))));
}

// ----------------------------------------------------------------------------
// Host calls
// ----------------------------------------------------------------------------

#[test]
fn pipeline_host_call_round_trip() {
    let powershell = PowerShell::new().add_command(Command::new("Read-Host"));
    let (mut client, mut server, handle) = running_pipeline(powershell);

    let ci = server
        .pipeline(handle.id())
        .unwrap()
        .host_call(HostMethodIdentifier::ReadLine, vec![])
        .unwrap();
    let (client_events, _) = pump(&mut client, &mut server, None);

    let call = client_events
        .iter()
        .find(|e| matches!(e.kind, EventKind::HostCall { .. }))
        .expect("host call event");
    assert_eq!(call.pipeline_id, Some(handle.id()));

    client
        .pipeline(handle)
        .unwrap()
        .host_response(ci, Some(PsValue::from("typed text")), None)
        .unwrap();
    let (_, server_events) = pump(&mut client, &mut server, None);

    let answered = server_events
        .iter()
        .find_map(|e| match &e.kind {
            EventKind::HostResponse { ci: got, result, .. } => Some((*got, result.clone())),
            _ => None,
        })
        .expect("host response event");
    assert_eq!(answered.0, ci);
    assert_eq!(
        answered.1.and_then(|v| v.as_str()).as_deref(),
        Some("typed text")
    );
}

#[test]
fn void_host_call_uses_sentinel_ci() {
    let (mut client, mut server) = opened_pair();
    let ci = server
        .host_call(
            HostMethodIdentifier::WriteLine2,
            vec![PsValue::from("hello")],
            None,
        )
        .unwrap();
    assert_eq!(ci, -100);

    let (client_events, _) = pump(&mut client, &mut server, None);
    assert!(client_events
        .iter()
        .any(|e| matches!(e.kind, EventKind::HostCall { ci: -100, .. })));

    // A response to the sentinel must be rejected client-side.
    let result = client.host_response(-100, None, None);
    assert!(matches!(
        result,
        Err(PsrpError::Protocol(
            psrp_core::ProtocolError::UnknownHostCall { call_id: -100 }
        ))
    ));
}

// ----------------------------------------------------------------------------
// Pool management operations
// ----------------------------------------------------------------------------

#[test]
fn set_max_runspaces_round_trip() {
    let (mut client, mut server) = opened_pair();

    let ci = client.set_max_runspaces(8).unwrap().expect("queued call id");
    let (_, server_events) = pump(&mut client, &mut server, None);
    assert!(server_events.iter().any(|e| matches!(
        e.kind,
        EventKind::SetMaxRunspaces { max_runspaces: 8, .. }
    )));

    server
        .runspace_availability_response(ci, AvailabilityResponse::Success(true))
        .unwrap();
    let (client_events, _) = pump(&mut client, &mut server, None);
    assert!(client_events
        .iter()
        .any(|e| matches!(e.kind, EventKind::RunspaceAvailability { .. })));
    assert_eq!(client.max_runspaces(), 8);
}

#[test]
fn get_available_runspaces_expects_count() {
    let (mut client, mut server) = opened_pair();
    let ci = client.get_available_runspaces().unwrap();
    pump(&mut client, &mut server, None);

    // Answering a count request with a bool is a server-side usage error.
    let wrong = server.runspace_availability_response(ci, AvailabilityResponse::Success(true));
    assert!(wrong.is_err());

    server
        .runspace_availability_response(ci, AvailabilityResponse::Available(3))
        .unwrap();
    let (client_events, _) = pump(&mut client, &mut server, None);
    assert!(client_events.iter().any(|e| matches!(
        e.kind,
        EventKind::RunspaceAvailability {
            response: AvailabilityResponse::Available(3),
            ..
        }
    )));
}

#[test]
fn set_runspaces_before_open_is_local() {
    let mut client = ClientRunspacePool::new(PoolConfig::default());
    assert_eq!(client.set_max_runspaces(4).unwrap(), None);
    assert_eq!(client.max_runspaces(), 4);
    assert!(client.data_to_send(None).is_none());
}

// ----------------------------------------------------------------------------
// Closing
// ----------------------------------------------------------------------------

#[test]
fn close_stops_pending_pipelines() {
    let powershell = PowerShell::new().add_command(Command::new("Get-Process"));
    let (mut client, _server, handle) = running_pipeline(powershell);

    client.close().unwrap();
    assert_eq!(client.state(), RunspacePoolState::Closed);
    assert_eq!(
        client.pipeline_state(handle),
        Some(PsInvocationState::Stopped)
    );

    let mut saw_stopped = false;
    let mut saw_closed = false;
    while let Some(event) = client.next_event().unwrap() {
        match event.kind {
            EventKind::PipelineStateChanged {
                state: PsInvocationState::Stopped,
                ..
            } => saw_stopped = true,
            EventKind::PoolStateChanged {
                state: RunspacePoolState::Closed,
                ..
            } => saw_closed = true,
            _ => {}
        }
    }
    assert!(saw_stopped && saw_closed);

    // A closed pool refuses further work.
    assert!(client.exchange_key().is_err());
    assert!(client.close().is_ok());
}

#[test]
fn server_close_notifies_client() {
    let (mut client, mut server) = opened_pair();
    server.close().unwrap();
    let (client_events, _) = pump(&mut client, &mut server, None);

    assert!(client_events.iter().any(|e| matches!(
        e.kind,
        EventKind::PoolStateChanged {
            state: RunspacePoolState::Closing,
            ..
        }
    )));
    assert!(client_events.iter().any(|e| matches!(
        e.kind,
        EventKind::PoolStateChanged {
            state: RunspacePoolState::Closed,
            ..
        }
    )));
    assert_eq!(client.state(), RunspacePoolState::Closed);
}

// ----------------------------------------------------------------------------
// Fragment sizes
// ----------------------------------------------------------------------------

#[test]
fn tiny_fragments_still_converse() {
    let mut client = ClientRunspacePool::new(PoolConfig::default());
    let mut server = ServerRunspacePool::new(ServerConfig::default());
    client.open().unwrap();

    let (client_events, _) = pump(&mut client, &mut server, Some(22));
    assert_eq!(client.state(), RunspacePoolState::Opened);
    assert!(client_events
        .iter()
        .any(|e| e.kind == EventKind::PoolOpened));
}
