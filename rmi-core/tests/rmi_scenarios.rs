//! End-to-end scenarios over real loopback TCP connections: one process acts
//! as both listener and dialer for each side, exactly as two independent
//! `rmi-core` processes would.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::TcpListener;

use rmi_core::auth::{GridAuthorizer, StaticAuthenticator};
use rmi_core::error::RmiError;
use rmi_core::facade::{FacadeConfig, RmiRegistryFacade};
use rmi_core::registry::{Registry, RegistryConfig};
use rmi_core::skeleton::{InvocationContext, RemoteObject, RmiArg};
use rmi_core::stub::{InvokeOptions, Stub};
use rmi_core::transport::PeerEndpoint;
use rmi_core::value::RmiValue;

// ── Fixtures ─────────────────────────────────────────────────────

/// `test` in spec §8's literal S1/S2/S3/S4/S5 scenarios.
struct Calculator {
    self_ref: Weak<dyn RemoteObject>,
    infinite_cycles_started: AtomicUsize,
}

#[async_trait]
impl RemoteObject for Calculator {
    fn interfaces(&self) -> Vec<String> {
        vec!["Calculator".into()]
    }

    async fn dispatch(&self, method_name: &str, _param_descriptors: &[String], args: Vec<RmiArg>, ctx: &InvocationContext) -> Result<RmiArg, RmiError> {
        match (method_name, args.first().map(RmiArg::type_descriptor)) {
            ("test", Some("i32")) => {
                let x = args[0].as_value().and_then(RmiValue::as_i32).unwrap();
                Ok(RmiArg::Value(RmiValue::I32(3 * x)))
            }
            ("test", Some("boxed_i32")) => {
                let x = args[0].as_value().and_then(RmiValue::as_i32).unwrap();
                Ok(RmiArg::Value(RmiValue::I32(8 * x)))
            }
            ("add", _) => {
                let a = args[0].as_value().and_then(RmiValue::as_i32).unwrap();
                let b = args[1].as_value().and_then(RmiValue::as_i32).unwrap();
                Ok(RmiArg::Value(RmiValue::I32(a + b)))
            }
            ("testThrow", _) => Err(RmiError::Application(rmi_core::error::RemoteErrorValue::new("IllegalState", "test exception"))),
            ("testObserver", _) => {
                let observer = args.into_iter().next().and_then(|a| a.as_remote().cloned()).ok_or_else(|| RmiError::UnmarshalableArgument("expected a remote observer".into()))?;
                let self_arc = self.self_ref.upgrade().ok_or_else(|| RmiError::RemoteFailure("calculator has been dropped".into()))?;
                observer.dispatch("update", &[], vec![RmiArg::Remote(self_arc)], ctx).await?;
                Ok(RmiArg::Value(RmiValue::Unit))
            }
            ("infiniteCycle", _) => {
                self.infinite_cycles_started.fetch_add(1, Ordering::SeqCst);
                loop {
                    if ctx.is_cancelled() {
                        return Err(RmiError::RemoteFailure("invocation interrupted".into()));
                    }
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            }
            (other, _) => Err(RmiError::NoSuchMethod {
                object_id: "test".into(),
                method: other.into(),
            }),
        }
    }
}

fn new_calculator() -> Arc<Calculator> {
    Arc::new_cyclic(|weak: &Weak<Calculator>| {
        let self_ref: Weak<dyn RemoteObject> = weak.clone();
        Calculator {
            self_ref,
            infinite_cycles_started: AtomicUsize::new(0),
        }
    })
}

struct TestObserver {
    calls: AtomicUsize,
    last_origin: Mutex<Option<(String, PeerEndpoint)>>,
}

#[async_trait]
impl RemoteObject for TestObserver {
    fn interfaces(&self) -> Vec<String> {
        vec!["Observer".into()]
    }

    async fn dispatch(&self, method_name: &str, _param_descriptors: &[String], args: Vec<RmiArg>, _ctx: &InvocationContext) -> Result<RmiArg, RmiError> {
        match method_name {
            "update" => {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if let Some(remote) = args.into_iter().next().and_then(|a| a.as_remote().cloned()) {
                    *self.last_origin.lock() = remote.remote_origin();
                }
                Ok(RmiArg::Value(RmiValue::Unit))
            }
            other => Err(RmiError::NoSuchMethod {
                object_id: "observer".into(),
                method: other.into(),
            }),
        }
    }
}

/// Binds a loopback listener, builds a facade around it, and spawns the
/// accept loop. Returns the facade and the endpoint other peers dial.
async fn spawn_facade(registry_config: RegistryConfig, facade_config_override: impl FnOnce(FacadeConfig) -> FacadeConfig) -> (Arc<RmiRegistryFacade>, PeerEndpoint) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = PeerEndpoint::from(listener.local_addr().unwrap());
    let registry = Registry::new(registry_config);
    let config = facade_config_override(FacadeConfig::new(endpoint.clone()));
    let facade = RmiRegistryFacade::new(registry, config);
    let serve_facade = facade.clone();
    tokio::spawn(async move {
        let _ = serve_facade.serve(listener).await;
    });
    (facade, endpoint)
}

// ── S1: overload resolution ──────────────────────────────────────

#[tokio::test]
async fn s1_overload_resolution_and_plain_add() {
    let (server, server_endpoint) = spawn_facade(RegistryConfig::default(), |c| c).await;
    server.registry().publish("test", new_calculator()).unwrap();

    let (client, _client_endpoint) = spawn_facade(RegistryConfig::default(), |c| c).await;
    let stub = client.get_stub(server_endpoint, "test".into(), vec!["Calculator".into()]).await.unwrap();

    let r1 = stub.call("test", vec!["i32".into()], vec![RmiArg::Value(RmiValue::I32(5))], InvokeOptions::default()).await.unwrap();
    assert_eq!(r1.as_value().and_then(RmiValue::as_i32), Some(15));

    let r2 = stub.call("test", vec!["boxed_i32".into()], vec![RmiArg::Value(RmiValue::BoxedI32(5))], InvokeOptions::default()).await.unwrap();
    assert_eq!(r2.as_value().and_then(RmiValue::as_i32), Some(40));

    let r3 = stub
        .call("add", vec!["i32".into(), "i32".into()], vec![RmiArg::Value(RmiValue::I32(20)), RmiArg::Value(RmiValue::I32(13))], InvokeOptions::default())
        .await
        .unwrap();
    assert_eq!(r3.as_value().and_then(RmiValue::as_i32), Some(33));
}

// ── S2: exception propagation ────────────────────────────────────

#[tokio::test]
async fn s2_application_exception_round_trips() {
    let (server, server_endpoint) = spawn_facade(RegistryConfig::default(), |c| c).await;
    server.registry().publish("test", new_calculator()).unwrap();

    let (client, _) = spawn_facade(RegistryConfig::default(), |c| c).await;
    let stub = client.get_stub(server_endpoint, "test".into(), vec!["Calculator".into()]).await.unwrap();

    let err = stub.call("testThrow", vec![], vec![], InvokeOptions::default()).await.unwrap_err();
    match err {
        RmiError::Application(value) => assert_eq!(value.message, "test exception"),
        other => panic!("expected ApplicationError, got {other:?}"),
    }
}

// ── S3: callback object / pointer routing back to the caller ────

#[tokio::test]
async fn s3_observer_callback_runs_exactly_once_with_the_original_stub() {
    let (server, server_endpoint) = spawn_facade(RegistryConfig::default(), |c| c).await;
    server.registry().publish("test", new_calculator()).unwrap();

    let (client, _client_endpoint) = spawn_facade(RegistryConfig::default(), |c| c).await;
    let stub = client.get_stub(server_endpoint.clone(), "test".into(), vec!["Calculator".into()]).await.unwrap();

    let observer: Arc<TestObserver> = Arc::new(TestObserver {
        calls: AtomicUsize::new(0),
        last_origin: Mutex::new(None),
    });
    let observer_dyn: Arc<dyn RemoteObject> = observer.clone();

    stub.call("testObserver", vec!["remote".into()], vec![RmiArg::Remote(observer_dyn)], InvokeOptions::default()).await.unwrap();

    assert_eq!(observer.calls.load(Ordering::SeqCst), 1);
    let origin = observer.last_origin.lock().clone().expect("observer received a remote argument");
    assert_eq!(origin, (stub.object_id.clone(), stub.origin.clone()));
}

// ── S4: method not found ─────────────────────────────────────────

#[tokio::test]
async fn s4_unknown_method_is_no_such_method_error() {
    let (server, server_endpoint) = spawn_facade(RegistryConfig::default(), |c| c).await;
    server.registry().publish("test", new_calculator()).unwrap();

    let (client, _) = spawn_facade(RegistryConfig::default(), |c| c).await;
    let stub = client.get_stub(server_endpoint, "test".into(), vec!["Calculator".into()]).await.unwrap();

    let err = stub.call("undefined", vec![], vec![], InvokeOptions::default()).await.unwrap_err();
    assert!(matches!(err, RmiError::NoSuchMethod { .. }));
}

// ── S5: cooperative interrupt ─────────────────────────────────────

#[tokio::test]
async fn s5_interrupt_terminates_a_running_invocation() {
    let (server, server_endpoint) = spawn_facade(RegistryConfig::default(), |c| c).await;
    server.registry().publish("test", new_calculator()).unwrap();

    let (client, _) = spawn_facade(RegistryConfig::default(), |c| c).await;
    let stub: Arc<Stub> = client.get_stub(server_endpoint, "test".into(), vec!["Calculator".into()]).await.unwrap();

    let call = stub.call_cancellable("infiniteCycle", vec![], vec![]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    call.interrupt().await;

    let result = tokio::time::timeout(Duration::from_secs(2), call.wait()).await.expect("invocation did not complete after interrupt");
    assert!(result.is_err());
}

// ── S6: failed handshake surfaces as authentication failure ─────

#[tokio::test]
async fn s6_wrong_credential_fails_the_handshake() {
    let authenticator = Arc::new(StaticAuthenticator::new().with_credential("user", b"right-password".to_vec()));
    let (server, server_endpoint) = spawn_facade(RegistryConfig::default(), move |c| c.with_authenticator(authenticator.clone())).await;
    server.registry().publish("test", new_calculator()).unwrap();

    let (client, _) = spawn_facade(RegistryConfig::default(), |c| c.with_credential("user", b"wrong-password".to_vec())).await;
    // The wire has no explicit handshake-reject frame (spec §4.8): a bad
    // credential is observed as the listener closing the connection before
    // any invocation on it ever completes.
    let stub = client.get_stub(server_endpoint, "test".into(), vec!["Calculator".into()]).await.unwrap();
    let result = tokio::time::timeout(
        Duration::from_secs(2),
        stub.call("add", vec!["i32".into(), "i32".into()], vec![RmiArg::Value(RmiValue::I32(1)), RmiArg::Value(RmiValue::I32(2))], InvokeOptions::default()),
    )
    .await
    .expect("call did not resolve after the rejected handshake closed the connection");
    assert!(result.is_err());
}

// ── @Cached keys on argument values, not just method identity ───

#[tokio::test]
async fn cached_call_keys_on_argument_values() {
    let (server, server_endpoint) = spawn_facade(RegistryConfig::default(), |c| c).await;
    server.registry().publish("test", new_calculator()).unwrap();

    let (client, _) = spawn_facade(RegistryConfig::default(), |c| c).await;
    let stub = client.get_stub(server_endpoint, "test".into(), vec!["Calculator".into()]).await.unwrap();

    let options = InvokeOptions {
        cache_ttl: Some(Duration::from_secs(60)),
        ..Default::default()
    };

    let five = stub.call("test", vec!["i32".into()], vec![RmiArg::Value(RmiValue::I32(5))], options.clone()).await.unwrap();
    assert_eq!(five.as_value().and_then(RmiValue::as_i32), Some(15));

    let seven = stub.call("test", vec!["i32".into()], vec![RmiArg::Value(RmiValue::I32(7))], options.clone()).await.unwrap();
    assert_eq!(seven.as_value().and_then(RmiValue::as_i32), Some(21));

    let five_again = stub.call("test", vec!["i32".into()], vec![RmiArg::Value(RmiValue::I32(5))], options).await.unwrap();
    assert_eq!(five_again.as_value().and_then(RmiValue::as_i32), Some(15));
}

// ── Distributed GC: dropping every stub reclaims the skeleton ───

#[tokio::test]
async fn dropping_the_last_stub_finalizes_and_reclaims_the_skeleton() {
    let (server, server_endpoint) = spawn_facade(RegistryConfig::default().with_lease_millis(0), |c| c).await;
    let skeleton = server.registry().publish("test", new_calculator()).unwrap();

    let (client, _) = spawn_facade(RegistryConfig::default(), |c| c).await;
    let stub = client.get_stub(server_endpoint, "test".into(), vec!["Calculator".into()]).await.unwrap();
    stub.call("test", vec!["i32".into()], vec![RmiArg::Value(RmiValue::I32(1))], InvokeOptions::default()).await.unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while !skeleton.has_any_remote_ref() && std::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(skeleton.has_any_remote_ref(), "NewReference should have registered a remote ref");

    drop(stub);

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while skeleton.has_any_remote_ref() && std::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!skeleton.has_any_remote_ref(), "Finalize from the dropped stub should have cleared the remote ref");
    assert!(server.registry().evict_expired().contains(&skeleton.id));
}

// ── Authorization grid wired end to end ──────────────────────────

#[tokio::test]
async fn authorization_denies_a_role_restricted_method_over_the_wire() {
    let authorizer = Arc::new(GridAuthorizer::new(true));
    authorizer.deny_user_method("guest", "add");

    let (server, server_endpoint) = spawn_facade(RegistryConfig::default(), {
        let authorizer = authorizer.clone();
        move |c| {
            c.with_authenticator(Arc::new(StaticAuthenticator::new().with_credential("guest", b"pw".to_vec())))
                .with_authorizer(authorizer)
        }
    })
    .await;
    server.registry().publish("test", new_calculator()).unwrap();

    let (client, _) = spawn_facade(RegistryConfig::default(), |c| c.with_credential("guest", b"pw".to_vec())).await;
    let stub = client.get_stub(server_endpoint, "test".into(), vec!["Calculator".into()]).await.unwrap();

    let denied = stub.call("add", vec!["i32".into(), "i32".into()], vec![RmiArg::Value(RmiValue::I32(1)), RmiArg::Value(RmiValue::I32(2))], InvokeOptions::default()).await;
    assert!(matches!(denied, Err(RmiError::Authorization { .. })));

    let allowed = stub.call("test", vec!["i32".into()], vec![RmiArg::Value(RmiValue::I32(5))], InvokeOptions::default()).await.unwrap();
    assert_eq!(allowed.as_value().and_then(RmiValue::as_i32), Some(15));
}
