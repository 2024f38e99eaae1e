use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use pretty_assertions::assert_eq;

use super::mock::{
    CR_SSL_CONNECTION_ERROR, MockSslProvider, MockState, Readiness, client_with, connected_with,
    eventually, key,
};
use crate::constant::{ClientErrno, Compression, client_errno};
use crate::error::Error;
use crate::handler::Status;
use crate::operation::{OperationKind, OperationResult, OperationState};
use crate::opts::{CertValidation, CertValidationContext, ConnectionKey, ConnectionOptions};

fn pending_forever() -> MockState {
    MockState {
        default_connect: Status::Pending,
        readiness: Readiness::Never,
        ..Default::default()
    }
}

#[tokio::test]
async fn connect_succeeds_on_first_attempt() {
    let (client, state) = client_with(MockState::default());
    let op = client.begin_connect(key());
    assert_eq!(op.state(), OperationState::Unstarted);
    assert_eq!(client.active_connections(), 1);

    op.run().unwrap();
    assert_eq!(op.wait().await, OperationResult::Succeeded);
    assert_eq!(op.state(), OperationState::Completed);
    assert_eq!(op.attempts_made(), 1);
    assert_eq!(op.errno(), 0);
    assert_eq!(client.active_connections(), 0);

    let context = op.connection_context();
    assert_eq!(context.endpoint_version.as_deref(), Some("8.0.mock"));
    assert!(!context.is_ssl_connection);

    let conn = op.take_connection().unwrap();
    assert_eq!(conn.key().host, "db1");
    assert_eq!(conn.server_info().as_deref(), Some("8.0.mock"));
    assert!(matches!(
        op.take_connection(),
        Err(Error::OperationStateError(_))
    ));

    let state = state.lock();
    assert_eq!(state.connect_calls, 1);
    assert_eq!(state.initialize_calls, 1);
    assert_eq!(state.reinitialize_calls, 0);
}

#[tokio::test]
async fn retries_until_an_attempt_succeeds() {
    let (client, state) = client_with(MockState {
        connect_steps: [Status::Error, Status::Error, Status::Done].into(),
        ..Default::default()
    });
    let op = client.begin_connect(key());
    op.set_connect_attempts(3).unwrap();
    op.run().unwrap();

    assert_eq!(op.wait().await, OperationResult::Succeeded);
    assert_eq!(op.attempts_made(), 3);
    let state = state.lock();
    assert_eq!(state.connect_calls, 3);
    assert_eq!(state.initialize_calls, 1);
    assert_eq!(state.reinitialize_calls, 2);
    assert_eq!(state.close_calls, 2);
}

#[tokio::test]
async fn always_failing_backend_stops_after_max_attempts() {
    let (client, state) = client_with(MockState {
        default_connect: Status::Error,
        ..Default::default()
    });
    let op = client.begin_connect(key());
    op.set_connect_attempts(2).unwrap();
    op.run().unwrap();

    assert_eq!(op.wait().await, OperationResult::Failed);
    assert_eq!(op.state(), OperationState::Failed);
    assert_eq!(op.attempts_made(), 2);
    assert_eq!(op.errno(), 1045);
    assert_eq!(op.error_message(), "Access denied for user");
    assert!(matches!(
        op.check(),
        Err(Error::OperationFailed {
            result: OperationResult::Failed,
            errno: 1045,
            ..
        })
    ));
    assert!(op.take_connection().is_err());
    assert_eq!(state.lock().connect_calls, 2);
}

#[tokio::test]
async fn attempt_timeout_reports_stage_and_duration() {
    let (client, _state) = client_with(pending_forever());
    let op = client.begin_connect(key());
    op.set_timeout(Duration::from_millis(50)).unwrap();
    op.set_tcp_timeout(Duration::ZERO).unwrap();
    op.run().unwrap();

    assert_eq!(op.wait().await, OperationResult::TimedOut);
    assert!(op.elapsed() >= Duration::from_millis(50));
    assert_eq!(op.errno(), client_errno::CR_SERVER_LOST);
    let message = op.error_message();
    assert!(
        message.starts_with("[7000](Mysql Client)Connect to db1:3306 timed out at stage sending auth"),
        "{}",
        message
    );
    assert!(message.contains("timeout was 50ms"), "{}", message);
    assert!(message.ends_with("(TcpTimeout:0)"), "{}", message);
}

#[tokio::test]
async fn tcp_timeout_fires_before_handshake_completes() {
    let (client, _state) = client_with(MockState {
        handshake_done: false,
        ..pending_forever()
    });
    let op = client.begin_connect(key());
    op.set_timeout(Duration::from_secs(5)).unwrap();
    op.set_tcp_timeout(Duration::from_millis(30)).unwrap();
    op.run().unwrap();

    assert_eq!(op.wait().await, OperationResult::TimedOut);
    assert!(op.elapsed() < Duration::from_secs(5));
    assert!(op.error_message().ends_with("(TcpTimeout:1)"));
}

#[tokio::test]
async fn tcp_timeout_is_ignored_once_handshake_is_done() {
    let (client, _state) = client_with(pending_forever());
    let op = client.begin_connect(key());
    op.set_timeout(Duration::from_millis(120)).unwrap();
    op.set_tcp_timeout(Duration::from_millis(20)).unwrap();
    op.run().unwrap();

    assert_eq!(op.wait().await, OperationResult::TimedOut);
    assert!(op.elapsed() >= Duration::from_millis(120));
    assert!(op.error_message().ends_with("(TcpTimeout:0)"));
}

#[tokio::test]
async fn total_timeout_bounds_retries() {
    let (client, state) = client_with(pending_forever());
    let op = client.begin_connect(key());
    op.set_timeout(Duration::from_millis(40)).unwrap();
    op.set_tcp_timeout(Duration::ZERO).unwrap();
    op.set_connect_attempts(10).unwrap();
    op.set_total_timeout(Duration::from_millis(100)).unwrap();
    op.run().unwrap();

    assert_eq!(op.wait().await, OperationResult::TimedOut);
    assert!(op.elapsed() < Duration::from_millis(400));
    let attempts = op.attempts_made();
    assert!((2..=4).contains(&attempts), "attempts: {}", attempts);
    assert_eq!(state.lock().connect_calls as u32, attempts);
}

#[tokio::test]
async fn cancel_pending_connect() {
    let (client, _state) = client_with(pending_forever());
    let op = client.begin_connect(key());
    op.set_timeout(Duration::from_secs(5)).unwrap();
    op.run().unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    op.cancel();

    assert_eq!(op.wait().await, OperationResult::Cancelled);
    assert_eq!(op.state(), OperationState::Cancelled);
    assert_eq!(op.errno(), ClientErrno::OperationCancelled.code());
    assert!(op.elapsed() < Duration::from_secs(5));
    assert_eq!(client.active_connections(), 0);
}

#[tokio::test]
async fn cancel_before_run_completes_immediately() {
    let (client, state) = client_with(MockState::default());
    let op = client.begin_connect(key());
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    op.set_callback(move |op| {
        assert!(op.done());
        counter.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();

    op.cancel();
    op.cancel();
    assert_eq!(op.state(), OperationState::Cancelled);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(matches!(op.run(), Err(Error::OperationStateError(_))));
    assert_eq!(state.lock().connect_calls, 0);
}

#[tokio::test]
async fn callback_runs_exactly_once_after_retries() {
    let (client, _state) = client_with(MockState {
        connect_steps: [Status::Error, Status::Done].into(),
        ..Default::default()
    });
    let op = client.begin_connect(key());
    op.set_connect_attempts(2).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    op.set_callback(move |op| {
        assert_eq!(op.result(), OperationResult::Succeeded);
        counter.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();
    op.run().unwrap();

    op.wait().await;
    op.cancel();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(op.result(), OperationResult::Succeeded);
}

#[tokio::test]
async fn configuration_is_rejected_after_run() {
    let (client, _state) = client_with(pending_forever());
    let op = client.begin_connect(key());
    op.run().unwrap();

    assert!(matches!(
        op.set_timeout(Duration::from_secs(1)),
        Err(Error::OperationStateError(_))
    ));
    assert!(matches!(
        op.add_attribute("k", "v"),
        Err(Error::OperationStateError(_))
    ));
    assert!(matches!(op.run(), Err(Error::OperationStateError(_))));
    op.cancel();
    op.wait().await;
}

#[tokio::test]
async fn invalid_settings_are_rejected() {
    let (client, _state) = client_with(MockState::default());
    let op = client.begin_connect(key());
    assert!(matches!(
        op.set_connect_attempts(0),
        Err(Error::BadConfigError(_))
    ));
    assert!(matches!(op.set_dscp(64), Err(Error::BadConfigError(_))));
    assert!(matches!(
        op.set_connection_options(ConnectionOptions {
            connect_attempts: 0,
            ..Default::default()
        }),
        Err(Error::BadConfigError(_))
    ));
}

#[tokio::test]
async fn options_are_applied_to_backend() {
    let (client, state) = client_with(MockState::default());
    let op = client.begin_connect(key());
    op.add_attribute("program_name", "ops-test").unwrap();
    op.set_compression(Some(Compression::Zstd)).unwrap();
    op.set_dscp(46).unwrap();
    op.set_sni_server_name("db1.internal").unwrap();
    op.set_default_query_timeout(Duration::from_millis(700)).unwrap();
    op.set_kill_on_query_timeout(false).unwrap();
    op.run().unwrap();
    assert_eq!(op.wait().await, OperationResult::Succeeded);

    {
        let state = state.lock();
        assert_eq!(
            state.attributes.get("program_name").map(String::as_str),
            Some("ops-test")
        );
        assert_eq!(state.compression, Some(Compression::Zstd));
        assert_eq!(state.dscp, Some(46));
        assert_eq!(state.sni.as_deref(), Some("db1.internal"));
    }

    let conn = op.take_connection().unwrap();
    assert_eq!(conn.options().query_timeout, Some(Duration::from_millis(700)));
    assert!(!conn.kill_on_query_timeout());
}

#[tokio::test]
async fn invalid_socket_descriptor_fails_attempt() {
    let (client, _state) = client_with(MockState {
        has_socket: false,
        ..Default::default()
    });
    let op = client.begin_connect(key());
    op.run().unwrap();

    assert_eq!(op.wait().await, OperationResult::Failed);
    assert_eq!(op.errno(), ClientErrno::InitializationFailed.code());
}

#[tokio::test]
async fn tls_session_is_stored_for_direct_connects_only() {
    let (client, _state) = client_with(MockState::default());
    let provider = Arc::new(MockSslProvider::default());

    let op = client.begin_connect(key());
    op.set_ssl_options_provider(provider.clone()).unwrap();
    op.run().unwrap();
    assert_eq!(op.wait().await, OperationResult::Succeeded);
    let context = op.connection_context();
    assert!(context.is_ssl_connection);
    assert!(context.ssl_session_reused);
    assert_eq!(context.ssl_version.as_deref(), Some("TLSv1.3"));
    assert_eq!(client.reused_ssl_sessions(), 1);

    let pooled = client.begin_pooled_connect(key());
    assert_eq!(pooled.kind(), OperationKind::PooledConnect);
    pooled.set_ssl_options_provider(provider.clone()).unwrap();
    pooled.run().unwrap();
    assert_eq!(pooled.wait().await, OperationResult::Succeeded);
    assert!(!pooled.connection_context().ssl_session_reused);
    assert_eq!(client.reused_ssl_sessions(), 1);
    assert_eq!(provider.stored.lock().len(), 1);
}

#[tokio::test]
async fn pooled_connect_timeout_message() {
    let (client, _state) = client_with(pending_forever());
    let op = client.begin_pooled_connect(key());
    op.set_timeout(Duration::from_millis(30)).unwrap();
    op.set_tcp_timeout(Duration::ZERO).unwrap();
    op.run().unwrap();

    assert_eq!(op.wait().await, OperationResult::TimedOut);
    let message = op.error_message();
    assert!(
        message.starts_with("[7000](Mysql Client)ConnectPool to db1:3306 timed out (took"),
        "{}",
        message
    );
}

fn validation(accept: bool, calls: Arc<AtomicUsize>) -> CertValidation {
    CertValidation {
        callback: Arc::new(move |cert: &[u8], _ctx: CertValidationContext<'_>| {
            calls.fetch_add(1, Ordering::SeqCst);
            if accept && cert == b"good-cert" {
                Ok(())
            } else {
                Err("certificate rejected".to_string())
            }
        }),
        context: None,
        op_as_context: false,
    }
}

#[tokio::test]
async fn rejected_certificate_fails_connect() {
    let (client, _state) = client_with(MockState {
        server_cert: Some(b"bad-cert".to_vec()),
        ..Default::default()
    });
    let calls = Arc::new(AtomicUsize::new(0));
    let op = client.begin_connect(key());
    op.set_cert_validation(validation(true, Arc::clone(&calls)))
        .unwrap();
    op.run().unwrap();

    assert_eq!(op.wait().await, OperationResult::Failed);
    assert_eq!(op.errno(), CR_SSL_CONNECTION_ERROR);
    assert_eq!(op.error_message(), "certificate rejected");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn validator_receives_operation_as_context() {
    let (client, _state) = client_with(MockState {
        server_cert: Some(b"good-cert".to_vec()),
        ..Default::default()
    });
    let op = client.begin_connect(key());
    op.set_cert_validation(CertValidation {
        callback: Arc::new(|_cert: &[u8], ctx: CertValidationContext<'_>| match ctx {
            CertValidationContext::Operation(op) if op.key().host == "db1" => Ok(()),
            _ => Err("unexpected context".to_string()),
        }),
        context: None,
        op_as_context: true,
    })
    .unwrap();
    op.run().unwrap();

    assert_eq!(op.wait().await, OperationResult::Succeeded);
}

#[tokio::test]
async fn validator_receives_user_context() {
    let (client, _state) = client_with(MockState {
        server_cert: Some(b"good-cert".to_vec()),
        ..Default::default()
    });
    let op = client.begin_connect(key());
    op.set_cert_validation(CertValidation {
        callback: Arc::new(|_cert: &[u8], ctx: CertValidationContext<'_>| match ctx {
            CertValidationContext::User(value) if value.downcast_ref::<String>().is_some() => {
                Ok(())
            }
            _ => Err("missing context".to_string()),
        }),
        context: Some(Arc::new(String::from("expected-cn"))),
        op_as_context: false,
    })
    .unwrap();
    op.run().unwrap();

    assert_eq!(op.wait().await, OperationResult::Succeeded);
}

#[tokio::test]
async fn validator_rejects_once_operation_is_gone() {
    let (client, state) = client_with(MockState {
        server_cert: Some(b"good-cert".to_vec()),
        ..Default::default()
    });
    let calls = Arc::new(AtomicUsize::new(0));
    let op = client.begin_connect(key());
    op.set_cert_validation(validation(true, Arc::clone(&calls)))
        .unwrap();
    op.run().unwrap();
    assert_eq!(op.wait().await, OperationResult::Succeeded);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let validator = state.lock().validator.clone().unwrap();
    assert_eq!(validator.validate(b"good-cert"), Ok(()));
    drop(op);
    // the loop thread may still be releasing its handle
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(validator.validate(b"good-cert").is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn dropping_unstarted_operation_releases_client_reference() {
    let (client, _state) = client_with(MockState::default());
    let op = client.begin_connect(key());
    assert_eq!(client.active_connections(), 1);
    drop(op);
    assert_eq!(client.active_connections(), 0);
}

#[tokio::test]
async fn run_fails_fast_when_loop_is_gone() {
    let (client, _state) = client_with(MockState::default());
    client.event_loop().shutdown();
    let op = client.begin_connect(key());

    assert!(matches!(op.run(), Err(Error::DispatchError)));
    assert_eq!(op.state(), OperationState::Failed);
    assert_eq!(op.wait().await, OperationResult::Failed);
}

#[tokio::test]
async fn close_resets_the_session_when_configured() {
    let (_client, state, conn) = connected_with(MockState::default(), |op| {
        op.set_reset_conn_before_close(true).unwrap();
    })
    .await;
    assert!(conn.options().reset_conn_before_close);
    conn.close();

    let state = state.lock();
    assert_eq!(state.reset_calls, 1);
    assert_eq!(state.close_calls, 1);
}

#[tokio::test]
async fn delayed_reset_is_left_to_the_caller() {
    let (_client, state, conn) = connected_with(MockState::default(), |op| {
        op.set_reset_conn_before_close(true).unwrap();
        op.set_delayed_reset_conn(true).unwrap();
        op.set_change_user(true).unwrap();
    })
    .await;
    assert!(conn.options().change_user);
    conn.close();

    let state = state.lock();
    assert_eq!(state.reset_calls, 0);
    assert_eq!(state.close_calls, 1);
}

#[tokio::test]
async fn change_user_switches_the_connection_key() {
    let (_client, state, mut conn) = connected_with(MockState::default(), |op| {
        op.set_change_user(true).unwrap();
    })
    .await;
    conn.change_user(ConnectionKey::new("db1", 3306, "reporting"))
        .unwrap();

    assert_eq!(conn.key().user, "reporting");
    assert_eq!(state.lock().changed_users, vec!["reporting".to_string()]);
}

#[tokio::test]
async fn change_user_is_refused_unless_enabled() {
    let (_client, state, mut conn) = connected_with(MockState::default(), |_| {}).await;
    assert!(!conn.options().change_user);
    let result = conn.change_user(ConnectionKey::new("db1", 3306, "reporting"));

    assert!(matches!(result, Err(Error::BadConfigError(_))));
    assert_eq!(conn.key().user, "app");
    assert!(state.lock().changed_users.is_empty());
}

#[tokio::test]
async fn dropped_connect_handle_still_calls_back() {
    let (client, _state) = client_with(pending_forever());
    let op = client.begin_connect(key());
    op.set_timeout(Duration::from_millis(50)).unwrap();
    op.set_connect_attempts(1).unwrap();
    let callbacks = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&callbacks);
    let (tx, rx) = tokio::sync::oneshot::channel();
    op.set_callback(move |op| {
        counter.fetch_add(1, Ordering::SeqCst);
        let _ = tx.send(op.result());
    })
    .unwrap();
    op.run().unwrap();
    drop(op);

    let result = tokio::time::timeout(Duration::from_secs(2), rx).await;
    assert_eq!(result.unwrap().unwrap(), OperationResult::TimedOut);
    assert_eq!(callbacks.load(Ordering::SeqCst), 1);
    assert!(eventually(|| client.active_connections() == 0).await);
    assert!(eventually(|| client.event_loop().outstanding() == 0).await);
}

#[tokio::test]
async fn loop_shutdown_fails_a_pending_connect() {
    let (client, _state) = client_with(pending_forever());
    let op = client.begin_connect(key());
    op.set_timeout(Duration::from_secs(30)).unwrap();
    op.run().unwrap();
    assert_eq!(client.event_loop().outstanding(), 1);

    client.event_loop().shutdown();
    let result = tokio::time::timeout(Duration::from_secs(2), op.wait()).await;
    assert_eq!(result.unwrap(), OperationResult::Failed);
    assert_eq!(op.state(), OperationState::Failed);
    assert_eq!(op.errno(), client_errno::CR_UNKNOWN_ERROR);
    assert_eq!(op.error_message(), Error::DispatchError.to_string());
    assert_eq!(client.active_connections(), 0);
}
