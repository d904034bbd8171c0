//! Integration tests for machine image preparation and snapshots.

use berth::BerthError;
use berth::engine::{BuildSource, ContainerEngine, EngineError};
use berth::images::{ImagePreparer, RegistryClient, RegistryError, Snapshot, SnapshotPipeline};
use berth::metrics::{ProvisionerMetrics, ProvisionerMetricsStorage};
use berth::options::{ProvisionerOptions, SnapshotOptions};
use berth::provision::{BuildSpec, MachineSpec};
use berth_test_utils::{EngineCall, MockEngine, MockRegistry, Op};
use std::collections::BTreeMap;
use std::sync::Arc;

fn preparer(engine: &Arc<MockEngine>, options: ProvisionerOptions) -> ImagePreparer {
    ImagePreparer::new(engine.clone() as Arc<dyn ContainerEngine>, Arc::new(options))
}

fn no_pull_options() -> ProvisionerOptions {
    ProvisionerOptions {
        always_pull_image: false,
        ..Default::default()
    }
}

fn registry_options() -> ProvisionerOptions {
    ProvisionerOptions {
        snapshots: SnapshotOptions {
            use_registry: true,
            registry: Some("localhost:5000".to_string()),
        },
        ..no_pull_options()
    }
}

// ============================================================================
// PULL
// ============================================================================

#[tokio::test]
async fn pulls_absent_image_and_tags_it_for_machine() {
    let engine = Arc::new(MockEngine::new());
    let spec = MachineSpec::from_image("ws1_dev", "codenvy/ubuntu_jdk8");

    let image = preparer(&engine, no_pull_options())
        .prepare("dev", &spec)
        .await
        .unwrap();

    assert_eq!(image, "eclipse-che/ws1_dev");
    assert_eq!(engine.call_names(), vec!["list_images", "pull", "tag"]);
    let calls = engine.calls();
    match &calls[1] {
        EngineCall::Pull(params) => {
            assert_eq!(params.repository, "codenvy/ubuntu_jdk8");
            assert_eq!(params.tag, "latest");
            assert_eq!(params.registry, None);
        }
        other => panic!("unexpected call: {other:?}"),
    }
    match &calls[2] {
        EngineCall::Tag(params) => {
            assert_eq!(params.image, "codenvy/ubuntu_jdk8:latest");
            assert_eq!(params.repository, "eclipse-che/ws1_dev");
        }
        other => panic!("unexpected call: {other:?}"),
    }
}

#[tokio::test]
async fn skips_pull_when_image_is_local() {
    let engine = Arc::new(MockEngine::new());
    engine.add_local_image("codenvy/ubuntu_jdk8:1.0");
    let spec = MachineSpec::from_image("ws1_dev", "codenvy/ubuntu_jdk8:1.0");

    preparer(&engine, no_pull_options())
        .prepare("dev", &spec)
        .await
        .unwrap();

    assert_eq!(engine.call_names(), vec!["list_images", "tag"]);
}

#[tokio::test]
async fn always_pull_ignores_local_copy() {
    let engine = Arc::new(MockEngine::new());
    engine.add_local_image("codenvy/ubuntu_jdk8:latest");
    let spec = MachineSpec::from_image("ws1_dev", "codenvy/ubuntu_jdk8");

    preparer(&engine, ProvisionerOptions::default())
        .prepare("dev", &spec)
        .await
        .unwrap();

    assert_eq!(engine.call_names(), vec!["pull", "tag"]);
}

#[tokio::test]
async fn local_snapshot_is_tagged_without_pull() {
    let engine = Arc::new(MockEngine::new());
    let spec = MachineSpec::from_image("ws1_dev", "machine_snapshot_abcdef0123456789");

    preparer(&engine, ProvisionerOptions::default())
        .prepare("dev", &spec)
        .await
        .unwrap();

    assert_eq!(engine.call_names(), vec!["tag"]);
}

#[tokio::test]
async fn registry_snapshot_is_pulled_tagged_and_untagged() {
    let engine = Arc::new(MockEngine::new());
    let location = "localhost:5000/machine_snapshot_abcdef0123456789:latest";
    let spec = MachineSpec::from_image("ws1_dev", location);

    preparer(&engine, registry_options())
        .prepare("dev", &spec)
        .await
        .unwrap();

    assert_eq!(engine.call_names(), vec!["pull", "tag", "remove_image"]);
    let calls = engine.calls();
    match &calls[0] {
        EngineCall::Pull(params) => {
            assert_eq!(params.registry.as_deref(), Some("localhost:5000"));
            assert_eq!(params.repository, "machine_snapshot_abcdef0123456789");
        }
        other => panic!("unexpected call: {other:?}"),
    }
    match &calls[2] {
        EngineCall::RemoveImage(params) => {
            assert_eq!(params.image, location);
            assert!(!params.force);
        }
        other => panic!("unexpected call: {other:?}"),
    }
}

#[tokio::test]
async fn missing_image_is_source_not_found() {
    let engine = Arc::new(MockEngine::new());
    engine.fail(Op::Pull, EngineError::ImageNotFound("codenvy/nope".to_string()));
    let spec = MachineSpec::from_image("ws1_dev", "codenvy/nope");

    let err = preparer(&engine, ProvisionerOptions::default())
        .prepare("dev", &spec)
        .await
        .unwrap_err();

    assert!(matches!(err, BerthError::SourceNotFound(_)));
}

#[tokio::test]
async fn missing_snapshot_on_tag_is_source_not_found() {
    let engine = Arc::new(MockEngine::new());
    engine.fail(
        Op::Tag,
        EngineError::ImageNotFound("machine_snapshot_gone".to_string()),
    );
    let spec = MachineSpec::from_image("ws1_dev", "machine_snapshot_gone");

    let err = preparer(&engine, ProvisionerOptions::default())
        .prepare("dev", &spec)
        .await
        .unwrap_err();

    assert!(matches!(err, BerthError::SourceNotFound(_)));
}

#[tokio::test]
async fn other_pull_failures_are_provisioning_errors() {
    let engine = Arc::new(MockEngine::new());
    engine.fail(Op::Pull, EngineError::api(500, "registry unavailable"));
    let spec = MachineSpec::from_image("ws1_dev", "codenvy/ubuntu_jdk8");

    let err = preparer(&engine, ProvisionerOptions::default())
        .prepare("dev", &spec)
        .await
        .unwrap_err();

    assert!(matches!(err, BerthError::Provisioning(msg) if msg.contains("registry unavailable")));
}

#[tokio::test]
async fn no_source_fails_before_engine_calls() {
    let engine = Arc::new(MockEngine::new());
    let spec = MachineSpec {
        container_name: "ws1_dev".to_string(),
        build: Some(BuildSpec::default()),
        ..Default::default()
    };

    let err = preparer(&engine, ProvisionerOptions::default())
        .prepare("dev", &spec)
        .await
        .unwrap_err();

    assert!(matches!(err, BerthError::Provisioning(_)));
    assert!(engine.calls().is_empty());
}

// ============================================================================
// BUILD
// ============================================================================

#[tokio::test]
async fn inline_dockerfile_is_built_with_merged_args() {
    let engine = Arc::new(MockEngine::new());
    let mut options = ProvisionerOptions::default();
    options.build_args = BTreeMap::from([
        ("HTTP_PROXY".to_string(), "http://proxy:3128".to_string()),
        ("JDK".to_string(), "8".to_string()),
    ]);
    options.cpu_quota = 50_000;
    let spec = MachineSpec {
        container_name: "ws1_dev".to_string(),
        mem_limit: 2 * 1024 * 1024 * 1024,
        build: Some(BuildSpec {
            dockerfile_content: Some("FROM codenvy/ubuntu_jdk8\n".to_string()),
            args: BTreeMap::from([("JDK".to_string(), "11".to_string())]),
            ..Default::default()
        }),
        ..Default::default()
    };

    let image = preparer(&engine, options).prepare("dev", &spec).await.unwrap();

    assert_eq!(image, "eclipse-che/ws1_dev");
    let calls = engine.calls();
    let EngineCall::BuildImage(params) = &calls[0] else {
        panic!("expected a build, got {:?}", calls[0]);
    };
    assert!(matches!(&params.source, BuildSource::Dockerfile(path) if path.ends_with("Dockerfile")));
    assert_eq!(params.repository, "eclipse-che/ws1_dev");
    assert_eq!(params.build_args["JDK"], "11");
    assert_eq!(params.build_args["HTTP_PROXY"], "http://proxy:3128");
    assert_eq!(params.memory_limit, 2 * 1024 * 1024 * 1024);
    assert_eq!(params.memory_swap_limit, -1);
    assert_eq!(params.cpu_quota, 50_000);
    assert!(params.force_pull);
    assert!(params.remove_intermediate_containers);
}

#[tokio::test]
async fn build_context_is_passed_through() {
    let engine = Arc::new(MockEngine::new());
    let spec = MachineSpec {
        container_name: "ws1_dev".to_string(),
        build: Some(BuildSpec {
            context: Some("https://example.com/recipes/ubuntu.tar.gz".to_string()),
            dockerfile_path: Some("docker/Dockerfile".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    };

    preparer(&engine, no_pull_options())
        .prepare("dev", &spec)
        .await
        .unwrap();

    let calls = engine.calls();
    let EngineCall::BuildImage(params) = &calls[0] else {
        panic!("expected a build, got {:?}", calls[0]);
    };
    assert_eq!(
        params.source,
        BuildSource::Context {
            location: "https://example.com/recipes/ubuntu.tar.gz".to_string(),
            dockerfile: Some("docker/Dockerfile".to_string()),
        }
    );
    assert!(!params.force_pull);
}

#[tokio::test]
async fn build_failure_is_provisioning_error() {
    let engine = Arc::new(MockEngine::new());
    engine.fail(Op::BuildImage, EngineError::api(500, "step 3 failed"));
    let spec = MachineSpec {
        container_name: "ws1_dev".to_string(),
        build: Some(BuildSpec {
            dockerfile_content: Some("FROM scratch\n".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    };

    let err = preparer(&engine, ProvisionerOptions::default())
        .prepare("dev", &spec)
        .await
        .unwrap_err();

    assert!(matches!(err, BerthError::Provisioning(_)));
}

// ============================================================================
// SNAPSHOTS
// ============================================================================

struct SnapshotContext {
    engine: Arc<MockEngine>,
    registry: Arc<MockRegistry>,
    storage: ProvisionerMetricsStorage,
    pipeline: SnapshotPipeline,
}

impl SnapshotContext {
    fn new(options: SnapshotOptions) -> Self {
        let engine = Arc::new(MockEngine::new());
        let registry = Arc::new(MockRegistry::new());
        let storage = ProvisionerMetricsStorage::new();
        let pipeline = SnapshotPipeline::new(
            engine.clone() as Arc<dyn ContainerEngine>,
            options,
            Default::default(),
            storage.clone(),
        )
        .with_registry_client(registry.clone() as Arc<dyn RegistryClient>);
        Self {
            engine,
            registry,
            storage,
            pipeline,
        }
    }

    fn with_registry() -> Self {
        Self::new(SnapshotOptions {
            use_registry: true,
            registry: Some("localhost:5000".to_string()),
        })
    }
}

fn registry_snapshot() -> Snapshot {
    Snapshot {
        registry: Some("localhost:5000".to_string()),
        repository: "machine_snapshot_abcdef0123456789".to_string(),
        tag: Some("latest".to_string()),
        digest: Some("sha256:1234".to_string()),
    }
}

#[tokio::test]
async fn local_save_commits_under_fresh_repository() {
    let ctx = SnapshotContext::new(SnapshotOptions::default());

    let snapshot = ctx.pipeline.save("container-1").await.unwrap();

    assert!(snapshot.repository.starts_with("machine_snapshot_"));
    assert_eq!(snapshot.tag.as_deref(), Some("latest"));
    assert_eq!(snapshot.registry, None);
    assert_eq!(snapshot.digest, None);
    assert_eq!(ctx.engine.call_names(), vec!["commit"]);
    assert_eq!(ProvisionerMetrics::new(ctx.storage.clone()).snapshots_saved_total(), 1);
}

#[tokio::test]
async fn registry_save_commits_pushes_and_drops_local_copy() {
    let ctx = SnapshotContext::with_registry();
    ctx.engine.set_push_digest("sha256:feed");

    let snapshot = ctx.pipeline.save("container-1").await.unwrap();

    assert_eq!(snapshot.registry.as_deref(), Some("localhost:5000"));
    assert_eq!(snapshot.digest.as_deref(), Some("sha256:feed"));
    assert_eq!(ctx.engine.call_names(), vec!["commit", "push", "remove_image"]);

    let calls = ctx.engine.calls();
    let EngineCall::Commit(commit) = &calls[0] else {
        panic!("expected a commit, got {:?}", calls[0]);
    };
    assert_eq!(
        commit.repository,
        format!("localhost:5000/{}", snapshot.repository)
    );
}

#[tokio::test]
async fn commit_failure_is_snapshot_error() {
    let ctx = SnapshotContext::new(SnapshotOptions::default());
    ctx.engine.fail(Op::Commit, EngineError::ContainerNotFound("container-1".to_string()));

    let err = ctx.pipeline.save("container-1").await.unwrap_err();

    assert!(matches!(err, BerthError::Snapshot(_)));
    assert_eq!(ProvisionerMetrics::new(ctx.storage.clone()).snapshots_saved_total(), 0);
}

#[tokio::test]
async fn local_remove_ignores_engine_errors() {
    let ctx = SnapshotContext::new(SnapshotOptions::default());
    ctx.engine.fail(Op::RemoveImage, EngineError::ImageNotFound("gone".to_string()));
    let snapshot = Snapshot::parse("machine_snapshot_abcdef0123456789:latest").unwrap();

    ctx.pipeline.remove(&snapshot).await.unwrap();

    assert_eq!(ctx.engine.count("remove_image"), 1);
    assert!(ctx.registry.deleted().is_empty());
}

#[tokio::test]
async fn registry_remove_deletes_manifest() {
    let ctx = SnapshotContext::with_registry();

    ctx.pipeline.remove(&registry_snapshot()).await.unwrap();

    assert_eq!(
        ctx.registry.deleted(),
        vec![(
            "localhost:5000".to_string(),
            "machine_snapshot_abcdef0123456789".to_string(),
            "sha256:1234".to_string()
        )]
    );
}

#[tokio::test]
async fn registry_remove_requires_digest() {
    let ctx = SnapshotContext::with_registry();
    let mut snapshot = registry_snapshot();
    snapshot.digest = None;

    let err = ctx.pipeline.remove(&snapshot).await.unwrap_err();

    assert!(matches!(err, BerthError::Snapshot(msg) if msg.contains("attributes are not valid")));
    assert!(ctx.registry.deleted().is_empty());
}

#[tokio::test]
async fn registry_status_error_fails_removal() {
    let ctx = SnapshotContext::with_registry();
    ctx.registry.respond_with(RegistryError::Status {
        status: 500,
        body: "boom".to_string(),
    });

    let err = ctx.pipeline.remove(&registry_snapshot()).await.unwrap_err();

    assert!(matches!(err, BerthError::Snapshot(msg) if msg.contains("Can't remove snapshot")));
}

#[tokio::test]
async fn registry_transport_error_is_only_logged() {
    let ctx = SnapshotContext::with_registry();
    ctx.registry
        .respond_with(RegistryError::Transport("connection refused".to_string()));

    ctx.pipeline.remove(&registry_snapshot()).await.unwrap();

    assert_eq!(ctx.registry.deleted().len(), 1);
}
