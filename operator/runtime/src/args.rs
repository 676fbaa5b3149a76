use crate::{
    admission::Admission,
    config::OperatorConfig,
    controller::{self, Context},
    credentials::KubeCredentials,
    k8s::{Api, GefyraBridge, GefyraBridgeMount, GefyraClient},
    metrics::ControllerMetrics,
    providers::Providers,
    startup, wireguard,
};
use anyhow::{bail, Result};
use clap::Parser;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tracing::{info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "gefyra-operator", about = "Operates Gefyra clients, bridge mounts and bridges")]
pub struct Args {
    #[clap(
        long,
        default_value = "gefyra=info,warn",
        env = "GEFYRA_OPERATOR_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    server: kubert::ServerArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Disables the admission controller server.
    #[clap(long)]
    admission_controller_disabled: bool,

    #[clap(flatten)]
    config: OperatorConfig,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            server,
            admission_controller_disabled,
            config,
        } = self;

        let server = if admission_controller_disabled {
            None
        } else {
            Some(server)
        };

        let mut prom = <Registry>::default();
        let metrics =
            ControllerMetrics::register(prom.sub_registry_with_prefix("gefyra_operator"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .with_optional_server(server)
            .build()
            .await?;

        let client = runtime.client();
        let namespace = config.namespace.clone();
        let providers = Arc::new(Providers::new(
            client.clone(),
            config.stowaway(),
            config.carrier(),
        ));
        info!(%namespace, "Starting Gefyra operator");

        startup::install_connection_providers(&providers, config.startup_timeout())
            .instrument(info_span!("startup"))
            .await?;

        let ctx = Arc::new(Context {
            client: client.clone(),
            namespace: namespace.clone(),
            providers: providers.clone(),
            credentials: Arc::new(KubeCredentials::new(client.clone(), namespace.clone())),
            reconcile_interval: config.reconcile_interval(),
            metrics,
        });

        tokio::spawn(
            controller::run::<GefyraClient, _, _>(
                ctx.clone(),
                controller::client::reconcile,
                runtime.shutdown_handle(),
            )
            .instrument(info_span!("clients")),
        );
        tokio::spawn(
            controller::run::<GefyraBridgeMount, _, _>(
                ctx.clone(),
                controller::mount::reconcile,
                runtime.shutdown_handle(),
            )
            .instrument(info_span!("bridgemounts")),
        );
        tokio::spawn(
            controller::run::<GefyraBridge, _, _>(
                ctx,
                controller::bridge::reconcile,
                runtime.shutdown_handle(),
            )
            .instrument(info_span!("bridges")),
        );

        tokio::spawn(
            wireguard::run(
                Api::namespaced(client.clone(), &namespace),
                providers.clone(),
                runtime.shutdown_handle(),
            )
            .instrument(info_span!("wireguard")),
        );

        let admission = Admission::new(client, namespace, providers);
        let runtime = runtime.spawn_server(move || admission.clone());

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}
