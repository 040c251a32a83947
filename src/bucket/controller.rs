//! CloudStorage reconciler. Runs alongside the DPA controller and owns the
//! bucket lifecycle: lazy creation, retention by default, deletion only behind
//! the opt-in annotation.
use super::{driver_for, BucketDriver};
use crate::{
    apis::cloudstorage_types::{CloudStorage, BUCKET_PROTECTION_FINALIZER},
    controller::Context,
    Error,
};
use chrono::Utc;
use kube::{
    api::{Api, Patch, PatchParams},
    runtime::{
        controller::Action,
        events::{Event, EventType},
    },
    ResourceExt,
};
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tracing::{field, instrument, warn, Span};

const PROBE_RETRY: Duration = Duration::from_secs(30);
const MUTATE_RETRY: Duration = Duration::from_secs(60);

#[instrument(skip(ctx, cloud_storage), fields(trace_id))]
pub async fn reconcile(cloud_storage: Arc<CloudStorage>, ctx: Arc<Context>) -> Result<Action, Error> {
    let trace_id = crate::telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));
    let _timer = ctx.metrics.count_and_measure();
    ctx.diagnostics.write().await.last_event = Utc::now();

    let client = ctx.client.clone();
    let ns = cloud_storage.namespace().unwrap(); // cs is namespace scoped
    let api: Api<CloudStorage> = Api::namespaced(client.clone(), &ns);
    let recorder = ctx
        .diagnostics
        .read()
        .await
        .recorder(client.clone(), cloud_storage.as_ref());

    if cloud_storage.metadata.deletion_timestamp.is_some() {
        return cleanup(&cloud_storage, &api, &ctx, &recorder).await;
    }

    // the finalizer must be in place before any bucket is created
    if !cloud_storage.has_protection_finalizer() {
        let mut finalizers = cloud_storage.finalizers().to_vec();
        finalizers.push(BUCKET_PROTECTION_FINALIZER.to_string());
        let patch = json!({ "metadata": { "finalizers": finalizers } });
        api.patch(
            &cloud_storage.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await
        .map_err(Error::KubeError)?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    let cfg = crate::Config::default();
    let driver = driver_for(client, &cloud_storage).await?;
    let probe = tokio::time::timeout(
        Duration::from_secs(cfg.bucket_probe_timeout),
        driver.exists(),
    );
    let exists = match probe.await {
        Ok(Ok(exists)) => exists,
        Ok(Err(e)) => {
            warn!("bucket probe failed for {}: {e}", cloud_storage.spec.name);
            return Ok(Action::requeue(PROBE_RETRY));
        }
        Err(_) => {
            warn!("bucket probe timed out for {}", cloud_storage.spec.name);
            return Ok(Action::requeue(PROBE_RETRY));
        }
    };

    if !exists {
        match driver.create().await {
            Ok(_) => {
                recorder
                    .publish(Event {
                        type_: EventType::Normal,
                        reason: "BucketCreated".into(),
                        note: Some(format!("Created bucket {}", cloud_storage.spec.name)),
                        action: "Create".into(),
                        secondary: None,
                    })
                    .await
                    .map_err(Error::KubeError)?;
            }
            Err(e) => {
                recorder
                    .publish(Event {
                        type_: EventType::Warning,
                        reason: "BucketNotCreated".into(),
                        note: Some(format!(
                            "Failed to create bucket {}: {e}",
                            cloud_storage.spec.name
                        )),
                        action: "Create".into(),
                        secondary: None,
                    })
                    .await
                    .map_err(Error::KubeError)?;
                return Ok(Action::requeue(MUTATE_RETRY));
            }
        }
    }

    // best effort: a failed status write never fails the reconcile
    let status = json!({
        "status": {
            "name": cloud_storage.spec.name,
            "lastSynced": Utc::now(),
        }
    });
    if let Err(e) = api
        .patch_status(
            &cloud_storage.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&status),
        )
        .await
    {
        warn!("status write failed for {}: {e}", cloud_storage.name_any());
    }

    Ok(Action::requeue(Duration::from_secs(cfg.reconcile_ttl)))
}

async fn cleanup(
    cloud_storage: &CloudStorage,
    api: &Api<CloudStorage>,
    ctx: &Arc<Context>,
    recorder: &kube::runtime::events::Recorder,
) -> Result<Action, Error> {
    let opted_in = match cloud_storage.delete_opt_in() {
        Ok(opted_in) => opted_in,
        Err(msg) => {
            recorder
                .publish(Event {
                    type_: EventType::Warning,
                    reason: "InvalidAnnotation".into(),
                    note: Some(msg),
                    action: "Delete".into(),
                    secondary: None,
                })
                .await
                .map_err(Error::KubeError)?;
            return Ok(Action::requeue(PROBE_RETRY));
        }
    };

    if !opted_in {
        // the finalizer stays: the object store outlives the manifest
        recorder
            .publish(Event {
                type_: EventType::Normal,
                reason: "BucketRetained".into(),
                note: Some(format!(
                    "Bucket {} retained, deletion was not opted in",
                    cloud_storage.spec.name
                )),
                action: "Delete".into(),
                secondary: None,
            })
            .await
            .map_err(Error::KubeError)?;
        return Ok(Action::await_change());
    }

    let driver = driver_for(ctx.client.clone(), cloud_storage).await?;
    delete_and_release(driver.as_ref(), cloud_storage, api, recorder).await
}

/// Delete the bucket and, on success, release the protection finalizer
async fn delete_and_release(
    driver: &dyn BucketDriver,
    cloud_storage: &CloudStorage,
    api: &Api<CloudStorage>,
    recorder: &kube::runtime::events::Recorder,
) -> Result<Action, Error> {
    match driver.delete().await {
        Ok(removed) => {
            let (reason, note) = if removed {
                ("BucketDeleted", format!("Deleted bucket {}", cloud_storage.spec.name))
            } else {
                (
                    "BucketNotFound",
                    format!("Bucket {} was already absent", cloud_storage.spec.name),
                )
            };
            recorder
                .publish(Event {
                    type_: EventType::Normal,
                    reason: reason.into(),
                    note: Some(note),
                    action: "Delete".into(),
                    secondary: None,
                })
                .await
                .map_err(Error::KubeError)?;
        }
        Err(e) => {
            recorder
                .publish(Event {
                    type_: EventType::Warning,
                    reason: "BucketNotDeleted".into(),
                    note: Some(format!(
                        "Failed to delete bucket {}: {e}",
                        cloud_storage.spec.name
                    )),
                    action: "Delete".into(),
                    secondary: None,
                })
                .await
                .map_err(Error::KubeError)?;
            return Ok(Action::requeue(MUTATE_RETRY));
        }
    }

    let remaining: Vec<String> = cloud_storage
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != BUCKET_PROTECTION_FINALIZER)
        .cloned()
        .collect();
    let patch = json!({ "metadata": { "finalizers": remaining } });
    api.patch(
        &cloud_storage.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await
    .map_err(Error::KubeError)?;
    Ok(Action::await_change())
}

pub fn error_policy(cloud_storage: Arc<CloudStorage>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("cloudstorage reconcile failed: {error:?}");
    ctx.metrics.reconcile_failure(cloud_storage.as_ref(), error);
    Action::requeue(Duration::from_secs(60))
}

#[cfg(test)]
mod test {
    use super::{delete_and_release, error_policy, reconcile};
    use crate::{
        apis::cloudstorage_types::CloudStorage,
        bucket::BucketDriver,
        controller::Context,
        fixtures::{timeout_after_1s, Scenario},
        Error,
    };
    use kube::api::Api;
    use std::sync::Arc;

    struct RemovableBucket;

    #[async_trait::async_trait]
    impl BucketDriver for RemovableBucket {
        async fn exists(&self) -> Result<bool, Error> {
            Ok(true)
        }
        async fn create(&self) -> Result<bool, Error> {
            Ok(false)
        }
        async fn delete(&self) -> Result<bool, Error> {
            Ok(true)
        }
        async fn region_of(&self, _bucket: &str) -> Result<String, Error> {
            Ok("us-east-1".to_string())
        }
    }

    #[tokio::test]
    async fn deleting_bucket_without_opt_in_is_retained() {
        let (testctx, fakeserver) = Context::test();
        let cloud_storage = Arc::new(CloudStorage::test().finalized().deleting());
        // one retain event, and crucially no finalizer patch afterwards
        let mocksrv = fakeserver.run(Scenario::BucketRetainedCleanup);
        reconcile(cloud_storage, testctx).await.expect("reconciler");
        timeout_after_1s(mocksrv).await;
    }

    #[tokio::test]
    async fn unparsable_delete_annotation_is_reported() {
        let (testctx, fakeserver) = Context::test();
        let cloud_storage = Arc::new(
            CloudStorage::test()
                .finalized()
                .deleting()
                .with_delete_annotation("maybe"),
        );
        let mocksrv = fakeserver.run(Scenario::InvalidAnnotationCleanup);
        reconcile(cloud_storage, testctx).await.expect("reconciler");
        timeout_after_1s(mocksrv).await;
    }

    #[tokio::test]
    async fn successful_delete_releases_the_finalizer() {
        let (testctx, fakeserver) = Context::test();
        let cloud_storage = CloudStorage::test()
            .finalized()
            .deleting()
            .with_delete_annotation("true");
        let mocksrv = fakeserver.run(Scenario::BucketDeleteFinalize(Arc::new(
            cloud_storage.clone(),
        )));
        let api: Api<CloudStorage> = Api::namespaced(testctx.client.clone(), "testns");
        let recorder = testctx
            .diagnostics
            .read()
            .await
            .recorder(testctx.client.clone(), &cloud_storage);
        delete_and_release(&RemovableBucket, &cloud_storage, &api, &recorder)
            .await
            .expect("cleanup");
        timeout_after_1s(mocksrv).await;
    }

    #[tokio::test]
    async fn error_policy_stays_off_the_apiserver() {
        let (testctx, fakeserver) = Context::test();
        let mocksrv = fakeserver.run(Scenario::RadioSilence);
        let cloud_storage = Arc::new(CloudStorage::test());
        error_policy(
            cloud_storage,
            &Error::BucketError("probe failed".into()),
            testctx,
        );
        timeout_after_1s(mocksrv).await;
    }
}
