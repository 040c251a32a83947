//! Helper methods only available for tests
use crate::{
    apis::{
        cloudstorage_types::{
            CloudStorage, CloudStorageProvider, CloudStorageSpec, BUCKET_PROTECTION_FINALIZER,
            CLOUD_STORAGE_DELETE_ANNOTATION,
        },
        dpa_types::{
            BackupLocation, Configuration, DataProtectionApplication, DpaSpec, VeleroConfig,
        },
        velero_types::BackupStorageLocationSpec,
    },
    Context, Metrics,
};
use assert_json_diff::assert_json_include;
use chrono::Utc;
use http::{Request, Response};
use hyper::{body::to_bytes, Body};
use k8s_openapi::{
    api::core::v1::SecretKeySelector, apimachinery::pkg::apis::meta::v1::Time,
};
use kube::{Client, Resource, ResourceExt};
use std::sync::Arc;

impl DataProtectionApplication {
    /// A minimal valid test DPA: one inline aws location, image backups off
    pub fn test() -> Self {
        let mut dpa = DataProtectionApplication::new(
            "test",
            DpaSpec {
                configuration: Some(Configuration {
                    velero: Some(VeleroConfig {
                        default_plugins: vec!["aws".to_string()],
                        ..VeleroConfig::default()
                    }),
                    ..Configuration::default()
                }),
                backup_locations: vec![BackupLocation {
                    velero: Some(BackupStorageLocationSpec {
                        provider: "aws".to_string(),
                        default: true,
                        ..BackupStorageLocationSpec::default()
                    }),
                    ..BackupLocation::default()
                }],
                backup_images: Some(false),
                ..DpaSpec::default()
            },
        );
        dpa.meta_mut().namespace = Some("testns".into());
        dpa.meta_mut().uid = Some("752d59ef-2671-4890-9feb-0097459b18c8".into());
        dpa
    }
}

/// A DPA that trips plugin validation
pub fn conflicting_plugins_dpa() -> DataProtectionApplication {
    let mut dpa = DataProtectionApplication::test();
    dpa.spec
        .configuration
        .as_mut()
        .unwrap()
        .velero
        .as_mut()
        .unwrap()
        .default_plugins = vec!["aws".to_string(), "legacy-aws".to_string()];
    dpa
}

impl CloudStorage {
    pub fn test() -> Self {
        let mut cs = CloudStorage::new(
            "testing",
            CloudStorageSpec {
                name: "testing-bucket".to_string(),
                provider: CloudStorageProvider::Aws,
                region: Some("us-east-1".to_string()),
                creation_secret: SecretKeySelector {
                    name: Some("cloud-credentials".to_string()),
                    key: "credentials".to_string(),
                    ..SecretKeySelector::default()
                },
                ..CloudStorageSpec::default()
            },
        );
        cs.meta_mut().namespace = Some("testns".into());
        cs.meta_mut().uid = Some("3271b291-ba3e-46c5-8d43-0097459b18c8".into());
        cs
    }

    /// Modify a CloudStorage to carry the protection finalizer
    pub fn finalized(mut self) -> Self {
        self.finalizers_mut().push(BUCKET_PROTECTION_FINALIZER.to_string());
        self
    }

    /// Modify a CloudStorage to look like the apiserver is deleting it
    pub fn deleting(mut self) -> Self {
        self.meta_mut().deletion_timestamp = Some(Time(Utc::now()));
        self
    }

    pub fn with_delete_annotation(mut self, value: &str) -> Self {
        self.annotations_mut()
            .insert(CLOUD_STORAGE_DELETE_ANNOTATION.to_string(), value.to_string());
        self
    }
}

type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;
pub struct ApiServerVerifier(ApiServerHandle);

/// Scenarios we test for in ApiServerVerifier
pub enum Scenario {
    /// an invalid DPA causes a cluster-wide list for the singleton check and
    /// then a Reconciled=False status patch, with no children touched
    ConflictingPluginsValidation(Arc<DataProtectionApplication>),
    /// a deleting CloudStorage without the delete opt-in publishes a retain
    /// event and never touches the finalizer
    BucketRetainedCleanup,
    /// a deleting CloudStorage with an unparsable opt-in annotation publishes
    /// a warning event
    InvalidAnnotationCleanup,
    /// a successful bucket delete publishes an event and then clears the
    /// protection finalizer
    BucketDeleteFinalize(Arc<CloudStorage>),
    /// objects "with errors" will short circuit the reconcile loop
    RadioSilence,
}

pub async fn timeout_after_1s(handle: tokio::task::JoinHandle<()>) {
    tokio::time::timeout(std::time::Duration::from_secs(1), handle)
        .await
        .expect("timeout on mock apiserver")
        .expect("scenario succeeded")
}

/// Create a responder + verifier object that deals with the main reconcile scenarios
///
impl ApiServerVerifier {
    /// Tests only get to run specific scenarios that has matching handlers
    ///
    /// NB: If the controller is making more calls than we are handling in the scenario,
    /// you then typically see a `KubeError(Service(Closed(())))` from the reconciler.
    ///
    /// You should await the `JoinHandle` (with a timeout) from this function to ensure
    /// that the scenario runs to completion (i.e. all expected calls were responded to),
    /// using the timeout to catch missing api calls to Kubernetes.
    pub fn run(self, scenario: Scenario) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            match scenario {
                Scenario::ConflictingPluginsValidation(dpa) => {
                    self.handle_dpa_get(dpa.as_ref().clone())
                        .await
                        .unwrap()
                        .handle_dpa_cluster_list(dpa.as_ref().clone())
                        .await
                        .unwrap()
                        .handle_false_condition_patch(dpa.as_ref().clone())
                        .await
                }
                Scenario::BucketRetainedCleanup => self.handle_event_publish("BucketRetained").await,
                Scenario::InvalidAnnotationCleanup => {
                    self.handle_event_publish("InvalidAnnotation").await
                }
                Scenario::BucketDeleteFinalize(cs) => {
                    self.handle_event_publish("BucketDeleted")
                        .await
                        .unwrap()
                        .handle_bucket_finalizer_removal(cs.as_ref().clone())
                        .await
                }
                Scenario::RadioSilence => Ok(self),
            }
            .expect("scenario completed without errors");
        })
    }

    async fn handle_dpa_get(
        mut self,
        dpa: DataProtectionApplication,
    ) -> Result<Self, kube::Error> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::GET);
        assert_eq!(
            request.uri().path(),
            format!(
                "/apis/dataprotection.io/v1alpha1/namespaces/testns/dataprotectionapplications/{}",
                dpa.name_any()
            )
        );
        let response = serde_json::to_vec(&dpa).unwrap();
        send.send_response(Response::builder().body(Body::from(response)).unwrap());
        Ok(self)
    }

    async fn handle_dpa_cluster_list(
        mut self,
        dpa: DataProtectionApplication,
    ) -> Result<Self, kube::Error> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::GET);
        assert_eq!(
            request.uri().path(),
            "/apis/dataprotection.io/v1alpha1/dataprotectionapplications"
        );
        let list = serde_json::json!({
            "apiVersion": "dataprotection.io/v1alpha1",
            "kind": "DataProtectionApplicationList",
            "metadata": {},
            "items": [dpa],
        });
        let response = serde_json::to_vec(&list).unwrap();
        send.send_response(Response::builder().body(Body::from(response)).unwrap());
        Ok(self)
    }

    async fn handle_false_condition_patch(
        mut self,
        dpa: DataProtectionApplication,
    ) -> Result<Self, kube::Error> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::PATCH);
        assert_eq!(
            request.uri().path(),
            format!(
                "/apis/dataprotection.io/v1alpha1/namespaces/testns/dataprotectionapplications/{}/status",
                dpa.name_any()
            )
        );
        let req_body = to_bytes(request.into_body()).await.unwrap();
        let json: serde_json::Value =
            serde_json::from_slice(&req_body).expect("patch_status object is json");
        assert_json_include!(
            actual: json.clone(),
            expected: serde_json::json!({
                "status": {
                    "conditions": [{
                        "type": "Reconciled",
                        "status": "False",
                        "reason": "Error",
                    }]
                }
            })
        );
        assert!(json["status"]["conditions"][0]["message"]
            .as_str()
            .unwrap()
            .contains("legacy-aws"));

        let response = serde_json::to_vec(&dpa).unwrap();
        send.send_response(Response::builder().body(Body::from(response)).unwrap());
        Ok(self)
    }

    async fn handle_event_publish(mut self, reason: &str) -> Result<Self, kube::Error> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::POST);
        assert_eq!(
            request.uri().path(),
            "/apis/events.k8s.io/v1/namespaces/testns/events"
        );
        let req_body = to_bytes(request.into_body()).await.unwrap();
        let postdata: serde_json::Value =
            serde_json::from_slice(&req_body).expect("valid event from runtime");
        assert_eq!(
            postdata.get("reason").unwrap().as_str().map(String::from),
            Some(reason.to_string())
        );
        // pass through the body as the apiserver would
        send.send_response(Response::builder().body(Body::from(req_body)).unwrap());
        Ok(self)
    }

    async fn handle_bucket_finalizer_removal(
        mut self,
        cs: CloudStorage,
    ) -> Result<Self, kube::Error> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::PATCH);
        assert_eq!(
            request.uri().path(),
            format!(
                "/apis/dataprotection.io/v1alpha1/namespaces/testns/cloudstorages/{}",
                cs.name_any()
            )
        );
        let req_body = to_bytes(request.into_body()).await.unwrap();
        let json: serde_json::Value =
            serde_json::from_slice(&req_body).expect("valid merge patch from runtime");
        assert_eq!(json["metadata"]["finalizers"], serde_json::json!([]));

        let response = serde_json::to_vec(&cs).unwrap();
        send.send_response(Response::builder().body(Body::from(response)).unwrap());
        Ok(self)
    }
}

impl Context {
    // Create a test context with a mocked kube client, locally registered metrics and default diagnostics
    pub fn test() -> (Arc<Self>, ApiServerVerifier) {
        let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let mock_client = Client::new(mock_service, "default");
        let ctx = Self {
            client: mock_client,
            metrics: Metrics::default(),
            diagnostics: Arc::default(),
        };
        (Arc::new(ctx), ApiServerVerifier(handle))
    }
}
