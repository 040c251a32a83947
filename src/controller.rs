use chrono::{DateTime, Utc};
use futures::stream::StreamExt;

use crate::{
    apis::{
        cloudstorage_types::CloudStorage,
        dpa_types::DataProtectionApplication,
        velero_types::{BackupStorageLocation, VolumeSnapshotLocation},
    },
    artifacts, bsl, bucket,
    config::Config,
    node_agent, non_admin, telemetry, validation,
    validation::ClusterView,
    velero_deployment, vsl, Error, Metrics, Result,
};
use k8s_openapi::{
    api::{
        apps::v1::{DaemonSet, Deployment},
        core::v1::ConfigMap,
    },
    apimachinery::pkg::apis::meta::v1::{Condition, Time},
};
use kube::{
    api::{Api, ListParams, Patch, PatchParams, ResourceExt},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        events::{Recorder, Reporter},
        watcher::Config as watcherConfig,
    },
    Resource,
};
use rand::Rng;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio::{sync::RwLock, time::Duration};
use tracing::*;

pub static RECONCILED_CONDITION: &str = "Reconciled";

// Context for our reconciler
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
}

#[instrument(skip(ctx, dpa), fields(trace_id))]
async fn reconcile(dpa: Arc<DataProtectionApplication>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));
    let cfg = Config::default();
    let _timer = ctx.metrics.count_and_measure();
    ctx.diagnostics.write().await.last_event = Utc::now();
    let ns = dpa.namespace().unwrap(); // dpa is namespace scoped
    let name = dpa.name_any();
    let dpas: Api<DataProtectionApplication> = Api::namespaced(ctx.client.clone(), &ns);

    // a watch event may outlive the object
    let Some(stored) = dpas.get_opt(&name).await.map_err(Error::KubeError)? else {
        debug!("DataProtectionApplication {name} in {ns} is gone");
        return Ok(Action::await_change());
    };
    debug!("Reconciling DataProtectionApplication \"{name}\" in {ns}");

    let dpa = stored.with_auto_corrections();
    let generation = dpa.metadata.generation;

    let all: Api<DataProtectionApplication> = Api::all(ctx.client.clone());
    let cluster = ClusterView {
        dpas: all
            .list(&ListParams::default())
            .await
            .map_err(Error::KubeError)?
            .items,
    };
    if let Err(e) = validation::validate(&dpa, &cluster) {
        patch_reconciled_condition(&dpas, &name, false, "Error", &e.to_string(), generation)
            .await?;
        // the condition carries the message; retry on a slow cadence
        return Ok(Action::requeue(Duration::from_secs(5 * 60)));
    }

    let recorder = ctx
        .diagnostics
        .read()
        .await
        .recorder(ctx.client.clone(), &dpa);

    // dependency groups: a failure inside one group aborts only that group
    let mut failures: Vec<Error> = Vec::new();

    let locations_ok = match bsl::reconcile(&dpa, &ctx, &recorder).await {
        Ok(_) => true,
        Err(e) => {
            failures.push(e);
            false
        }
    };
    if let Err(e) = vsl::reconcile(&dpa, &ctx, &recorder).await {
        failures.push(e);
    }

    // workloads consume the resolved location view
    if locations_ok {
        let workloads = async {
            let locations = bsl::resolve_locations(&dpa, &ctx).await?;
            velero_deployment::reconcile(&dpa, &ctx, &locations).await?;
            node_agent::reconcile(&dpa, &ctx, &recorder).await?;
            Ok::<(), Error>(())
        };
        if let Err(e) = workloads.await {
            failures.push(e);
        }
    }

    if let Err(e) = artifacts::reconcile(&dpa, &ctx, &recorder).await {
        failures.push(e);
    }
    if let Err(e) = non_admin::reconcile(&dpa, &ctx, &recorder).await {
        failures.push(e);
    }

    if let Some(first) = failures.into_iter().next() {
        patch_reconciled_condition(&dpas, &name, false, "Error", &first.to_string(), generation)
            .await?;
        if first.is_validation_class() {
            return Ok(Action::requeue(Duration::from_secs(5 * 60)));
        }
        return Err(first);
    }

    patch_reconciled_condition(
        &dpas,
        &name,
        true,
        "Complete",
        "Reconcile complete",
        generation,
    )
    .await?;

    // spread periodic passes so parallel DPAs do not requeue in lockstep
    let jitter = rand::thread_rng().gen_range(0..60);
    Ok(Action::requeue(Duration::from_secs(cfg.reconcile_ttl + jitter)))
}

async fn patch_reconciled_condition(
    dpas: &Api<DataProtectionApplication>,
    name: &str,
    reconciled: bool,
    reason: &str,
    message: &str,
    generation: Option<i64>,
) -> Result<()> {
    let condition = Condition {
        type_: RECONCILED_CONDITION.to_string(),
        status: if reconciled { "True" } else { "False" }.to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        last_transition_time: Time(Utc::now()),
        observed_generation: generation,
    };
    let patch = json!({ "status": { "conditions": [condition] } });
    dpas.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(Error::KubeError)?;
    Ok(())
}

fn error_policy(dpa: Arc<DataProtectionApplication>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile failed: {:?}", error);
    ctx.metrics.reconcile_failure(dpa.as_ref(), error);
    Action::requeue(Duration::from_secs(5 * 60))
}

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}
impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: crate::OPERATOR_NAME.into(),
        }
    }
}
impl Diagnostics {
    pub fn recorder<K>(&self, client: Client, obj: &K) -> Recorder
    where
        K: Resource<DynamicType = ()>,
    {
        Recorder::new(client, self.reporter.clone(), obj.object_ref(&()))
    }
}

/// State shared between the controller and the web server
#[derive(Clone, Default)]
pub struct State {
    /// Diagnostics populated by the reconciler
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    registry: prometheus::Registry,
}

/// State wrapper around the controller outputs for the web server
impl State {
    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    // Create a Controller Context that can update State
    pub fn create_context(&self, client: Client) -> Arc<Context> {
        Arc::new(Context {
            client,
            metrics: Metrics::default().register(&self.registry).unwrap(),
            diagnostics: self.diagnostics.clone(),
        })
    }
}

/// Initialize both controllers and shared state (given the crds are installed)
pub async fn run(state: State) {
    let client = match Client::try_default().await {
        Ok(client) => client,
        Err(_) => panic!("Please configure your Kubernetes Context"),
    };

    let dpas = Api::<DataProtectionApplication>::all(client.clone());
    if let Err(e) = dpas.list(&ListParams::default().limit(1)).await {
        error!("CRD is not queryable; {e:?}. Is the CRD installed?");
        info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
        std::process::exit(1);
    }
    let buckets = Api::<CloudStorage>::all(client.clone());

    let ctx = state.create_context(client.clone());
    let dpa_controller = Controller::new(dpas, watcherConfig::default().any_semantic())
        .owns(
            Api::<Deployment>::all(client.clone()),
            watcherConfig::default().any_semantic(),
        )
        .owns(
            Api::<DaemonSet>::all(client.clone()),
            watcherConfig::default().any_semantic(),
        )
        .owns(
            Api::<ConfigMap>::all(client.clone()),
            watcherConfig::default().any_semantic(),
        )
        .owns(
            Api::<BackupStorageLocation>::all(client.clone()),
            watcherConfig::default().any_semantic(),
        )
        .owns(
            Api::<VolumeSnapshotLocation>::all(client.clone()),
            watcherConfig::default().any_semantic(),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx.clone())
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()));

    let bucket_controller = Controller::new(buckets, watcherConfig::default().any_semantic())
        .shutdown_on_signal()
        .run(
            bucket::controller::reconcile,
            bucket::controller::error_policy,
            ctx,
        )
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()));

    futures::join!(dpa_controller, bucket_controller);
}
