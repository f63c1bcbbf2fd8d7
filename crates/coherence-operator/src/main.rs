use std::{sync::Arc, time::Duration};

use clap::Parser;
use coherence_operator::{
    builder::DefaultStatefulSetBuilder,
    cli::{Command, RunArguments},
    client::{KubeEventSink, KubeExec, KubeNodeLookup, KubeStore},
    crd::CoherenceCluster,
    logging::{self, controller::report_controller_reconciled},
    probe::{self, Prober},
    reconciler::{self, Capabilities, Reconciler},
    store::ObjectKey,
};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::{
    CustomResourceExt, ResourceExt,
    runtime::{Controller, controller::Action, watcher},
};
use snafu::{ResultExt, Snafu};

const APP_NAME: &str = "coherence-operator";
const CONTROLLER_NAME: &str = "coherencecluster";

/// Delay before a failed pass is retried.
const ERROR_RETRY: Duration = Duration::from_secs(10);

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to serialize CRD"))]
    SerializeCrd { source: serde_yaml::Error },

    #[snafu(display("failed to initialize logging"))]
    InitializeLogging { source: logging::Error },

    #[snafu(display("failed to create Kubernetes client"))]
    CreateClient { source: kube::Error },

    #[snafu(display("failed to create prober"))]
    CreateProber { source: probe::Error },
}

struct Ctx {
    reconciler: Reconciler,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    match Command::parse() {
        Command::Crd => {
            let crd = serde_yaml::to_string(&CoherenceCluster::crd()).context(SerializeCrdSnafu)?;
            print!("{crd}");
        }
        Command::Run(args) => run(args).await?,
    }
    Ok(())
}

async fn run(args: RunArguments) -> Result<(), Error> {
    logging::initialize_logging("COHERENCE_OPERATOR_LOG", APP_NAME)
        .context(InitializeLoggingSnafu)?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        watch_namespace = ?args.watch_namespace,
        "starting {APP_NAME}"
    );

    let client = kube::Client::try_default()
        .await
        .context(CreateClientSnafu)?;
    let config = args.controller_config();
    let prober = Prober::new(Arc::new(KubeExec::new(client.clone()))).context(CreateProberSnafu)?;
    let capabilities = Capabilities {
        store: Arc::new(KubeStore::new(
            client.clone(),
            Some(args.field_manager.clone()),
        )),
        prober: Arc::new(prober),
        events: Arc::new(KubeEventSink::new(client.clone(), CONTROLLER_NAME)),
        nodes: Arc::new(KubeNodeLookup::new(client.clone())),
    };
    let ctx = Arc::new(Ctx {
        reconciler: Reconciler::new(capabilities, Arc::new(DefaultStatefulSetBuilder), config),
    });

    Controller::new(
        args.watch_namespace.get_api::<CoherenceCluster>(&client),
        watcher::Config::default(),
    )
    .owns(
        args.watch_namespace.get_api::<StatefulSet>(&client),
        watcher::Config::default(),
    )
    .shutdown_on_signal()
    .run(reconcile, error_policy, ctx)
    .for_each(|result| {
        report_controller_reconciled(&client, CONTROLLER_NAME, &result);
        futures::future::ready(())
    })
    .await;

    tracing::info!("controller stopped");
    Ok(())
}

async fn reconcile(
    cluster: Arc<CoherenceCluster>,
    ctx: Arc<Ctx>,
) -> Result<Action, reconciler::Error> {
    let key = ObjectKey::new(cluster.namespace().unwrap_or_default(), cluster.name_any());
    ctx.reconciler.reconcile(&key).await.map(Action::from)
}

fn error_policy(
    _cluster: Arc<CoherenceCluster>,
    _error: &reconciler::Error,
    _ctx: Arc<Ctx>,
) -> Action {
    Action::requeue(ERROR_RETRY)
}
