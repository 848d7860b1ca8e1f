//! Reference server/client exercising `rmi-core` end to end: a `Calculator`
//! object published on one process, called from another over TCP.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use rmi_core::{
    FacadeConfig, InvocationContext, InvokeOptions, RemoteObject, RmiArg, RmiError,
    RmiRegistryFacade, RmiValue,
};
use rmi_core::auth::StaticAuthenticator;
use rmi_core::error::RemoteErrorValue;
use rmi_core::registry::{Registry, RegistryConfig};
use rmi_core::transport::PeerEndpoint;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rmi-demo", about = "Serve or call the reference Calculator object")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Publish a `Calculator` object and accept connections.
    Serve {
        /// Address to listen on.
        #[arg(long, default_value = "127.0.0.1:7734")]
        listen: String,
        /// Identity required of dialing peers; unset accepts anonymous connections.
        #[arg(long)]
        auth_id: Option<String>,
        /// Passphrase paired with `--auth-id`.
        #[arg(long, default_value = "")]
        auth_pass: String,
        /// Lease duration for published objects, in milliseconds (spec §4.1).
        #[arg(long, default_value_t = 600_000)]
        lease_millis: u64,
        /// Default authorization outcome when no grid rule matches.
        #[arg(long, default_value_t = true)]
        default_authorize: bool,
        /// Keep a distinct handler per dialing connection instead of reusing one per endpoint.
        #[arg(long, default_value_t = false)]
        multi_connection_mode: bool,
        /// Deliver remote-side transport faults to callers as errors.
        #[arg(long, default_value_t = true)]
        remote_exception_enabled: bool,
        /// Default per-call timeout in milliseconds when a call specifies none.
        #[arg(long)]
        latency_timeout_millis: Option<u64>,
        /// Treat every invocation as fault-suppressed regardless of its own option.
        #[arg(long, default_value_t = false)]
        suppress_all_invocation_faults: bool,
    },
    /// Call a method on a remote `Calculator` object.
    Call {
        /// Address of the server to connect to.
        #[arg(long, default_value = "127.0.0.1:7734")]
        server: String,
        /// Method to invoke: `test`, `boxedTest`, or `add`.
        #[arg(long, default_value = "add")]
        method: String,
        /// Integer arguments to pass.
        #[arg(long = "arg")]
        args: Vec<i32>,
        /// Identity to present during the handshake; unset dials anonymously.
        #[arg(long)]
        auth_id: Option<String>,
        /// Passphrase paired with `--auth-id`.
        #[arg(long, default_value = "")]
        auth_pass: String,
    },
}

/// The object named in the overload-resolution walkthrough: `test(int)`
/// triples its argument, `test(Integer)` scales it by eight, and `add`
/// sums two primitives.
struct Calculator;

#[async_trait]
impl RemoteObject for Calculator {
    fn interfaces(&self) -> Vec<String> {
        vec!["Calculator".into()]
    }

    async fn dispatch(
        &self,
        method_name: &str,
        _param_descriptors: &[String],
        args: Vec<RmiArg>,
        _ctx: &InvocationContext,
    ) -> Result<RmiArg, RmiError> {
        match (method_name, args.first().map(RmiArg::type_descriptor)) {
            ("test", Some("i32")) => {
                let x = args[0].as_value().and_then(RmiValue::as_i32).unwrap_or(0);
                Ok(RmiArg::Value(RmiValue::I32(3 * x)))
            }
            ("test", Some("boxed_i32")) => {
                let x = args[0].as_value().and_then(RmiValue::as_i32).unwrap_or(0);
                Ok(RmiArg::Value(RmiValue::I32(8 * x)))
            }
            ("add", _) if args.len() == 2 => {
                let a = args[0].as_value().and_then(RmiValue::as_i32).unwrap_or(0);
                let b = args[1].as_value().and_then(RmiValue::as_i32).unwrap_or(0);
                Ok(RmiArg::Value(RmiValue::I32(a + b)))
            }
            (other, _) => Err(RmiError::NoSuchMethod {
                object_id: "calc".into(),
                method: other.into(),
            }),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("rmi_demo=info".parse()?);
    let json = std::env::var("RMI_LOG_JSON").is_ok_and(|v| v == "1");
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let args = Args::parse();
    match args.command {
        Command::Serve {
            listen,
            auth_id,
            auth_pass,
            lease_millis,
            default_authorize,
            multi_connection_mode,
            remote_exception_enabled,
            latency_timeout_millis,
            suppress_all_invocation_faults,
        } => {
            let registry_config = RegistryConfig::default()
                .with_lease_millis(lease_millis)
                .with_default_authorize(default_authorize)
                .with_multi_connection_mode(multi_connection_mode)
                .with_remote_exception_enabled(remote_exception_enabled)
                .with_latency_timeout_millis(latency_timeout_millis)
                .with_suppress_all_invocation_faults(suppress_all_invocation_faults);
            run_server(&listen, auth_id, auth_pass, registry_config).await
        }
        Command::Call { server, method, args, auth_id, auth_pass } => {
            run_call(&server, &method, args, auth_id, auth_pass).await
        }
    }
}

async fn run_server(listen: &str, auth_id: Option<String>, auth_pass: String, registry_config: RegistryConfig) -> Result<()> {
    let listener = TcpListener::bind(listen).await.with_context(|| format!("binding {listen}"))?;
    let endpoint = PeerEndpoint::from(listener.local_addr()?);
    tracing::info!(%endpoint, "rmi-demo server listening");

    let registry = Registry::new(registry_config);
    registry.publish("calc", Arc::new(Calculator))?;

    let mut facade_config = FacadeConfig::new(endpoint);
    if let Some(auth_id) = auth_id {
        facade_config = facade_config.with_authenticator(Arc::new(
            StaticAuthenticator::new().with_credential(auth_id, auth_pass.into_bytes()),
        ));
    }

    let facade = RmiRegistryFacade::new(registry, facade_config);
    facade.serve(listener).await?;
    Ok(())
}

async fn run_call(server: &str, method: &str, args: Vec<i32>, auth_id: Option<String>, auth_pass: String) -> Result<()> {
    let (host, port) = server.rsplit_once(':').context("server address must be host:port")?;
    let endpoint = PeerEndpoint::new(host, port.parse()?);

    let local = PeerEndpoint::new("127.0.0.1", 0);
    let registry = Registry::new(RegistryConfig::default());
    let mut facade_config = FacadeConfig::new(local);
    if let Some(auth_id) = auth_id {
        facade_config = facade_config.with_credential(auth_id, auth_pass.into_bytes());
    }
    let facade = RmiRegistryFacade::new(registry, facade_config);

    let stub = facade.get_stub(endpoint, "calc".into(), vec!["Calculator".into()]).await?;

    let (param_descriptors, rmi_args) = match (method, args.as_slice()) {
        ("test", [x]) => (vec!["i32".into()], vec![RmiArg::Value(RmiValue::I32(*x))]),
        ("boxedTest", [x]) => (vec!["boxed_i32".into()], vec![RmiArg::Value(RmiValue::BoxedI32(*x))]),
        ("add", [a, b]) => (
            vec!["i32".into(), "i32".into()],
            vec![RmiArg::Value(RmiValue::I32(*a)), RmiArg::Value(RmiValue::I32(*b))],
        ),
        _ => anyhow::bail!("unsupported method/arity: {method}({args:?})"),
    };

    match stub.call(method, param_descriptors, rmi_args, InvokeOptions::default()).await {
        Ok(value) => {
            println!("{:?}", value.as_value().and_then(RmiValue::as_i32));
            Ok(())
        }
        Err(RmiError::Application(RemoteErrorValue { message, .. })) => {
            anyhow::bail!("remote raised an application error: {message}")
        }
        Err(e) => Err(e.into()),
    }
}
