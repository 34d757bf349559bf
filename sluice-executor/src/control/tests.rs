use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use sluice_core::prelude::*;

use super::*;
use crate::{
    api::test_support::{PASSWORD, USERNAME},
    Config,
};

pub(crate) fn config() -> Config {
    Config::try_new(
        PeerNode::new("test-node".into(), "localhost".into(), "8081".into()),
        USERNAME,
        PASSWORD,
    )
    .unwrap()
    .with_sequence_auto_start(Some(1))
    .with_repositories(["prod=memory://prod"])
    .unwrap()
}

pub(crate) fn context() -> ApiContext {
    ApiContext::new(config())
}

/// Engine counting how many objects it built
struct CountingFactory {
    inner: LocalEngine,
    builds: Arc<AtomicUsize>,
}

impl ExecutionFactory for CountingFactory {
    fn build_pipeline(
        &self,
        configuration: &PipelineConfiguration,
        repository: Option<Arc<dyn RepositoryConnection>>,
    ) -> Result<Arc<dyn PipelineExecution>, EngineError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        self.inner.build_pipeline(configuration, repository)
    }

    fn build_job(
        &self,
        configuration: &JobConfiguration,
        repository: Option<Arc<dyn RepositoryConnection>>,
    ) -> Result<Arc<dyn Execution>, EngineError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        self.inner.build_job(configuration, repository)
    }
}

pub(crate) fn counting_context() -> (ApiContext, Arc<AtomicUsize>) {
    let config = config();
    let builds = Arc::new(AtomicUsize::new(0));
    let log_store = Arc::new(LogStore::new(config.max_log_lines, None));
    let factory = CountingFactory {
        inner: LocalEngine::new(Arc::clone(&log_store)),
        builds: Arc::clone(&builds),
    };
    let repositories = Arc::new(NamedRepositories::new(config.repositories.clone()));

    let context = ApiContext::with_engine(config, Arc::new(factory), repositories, log_store);
    (context, builds)
}

/// One step writing a row every 20ms for a minute
pub(crate) fn slow_pipeline(name: &str) -> PipelineConfiguration {
    PipelineConfiguration::new(
        PipelineDefinition::new(
            name.into(),
            vec![StepDefinition {
                rows: 3_000,
                row_delay_ms: 20,
                ..StepDefinition::new("generate".into())
            }],
        ),
        ExecutionConfiguration::default(),
    )
}

fn job(entries: Vec<EntryDefinition>) -> JobConfiguration {
    JobConfiguration::new(
        JobDefinition::new("nightly".into(), entries),
        ExecutionConfiguration::default(),
    )
}

async fn wait_terminal<F: Family>(context: &ApiContext, run_id: &str) -> LifecycleState {
    let handle = F::registry(context).get(run_id).unwrap();
    let mut completion = handle.object.completion();
    let state = tokio::time::timeout(
        std::time::Duration::from_secs(10),
        completion.wait_for(|state| state.is_terminal()),
    )
    .await
    .expect("execution did not finish in time")
    .expect("execution dropped");
    *state
}

#[tokio::test]
async fn finished_job_restarts_under_same_run_id() {
    let (context, builds) = counting_context();
    let run_id = submit::<Jobs>(&context, job(vec![EntryDefinition::new("noop".into())]))
        .await
        .unwrap()
        .run_id;

    start::<Jobs>(&context, &run_id).await.unwrap();
    assert_eq!(wait_terminal::<Jobs>(&context, &run_id).await, LifecycleState::Finished);

    let restarted = start::<Jobs>(&context, &run_id).await.unwrap();

    assert_eq!(restarted.run_id, run_id);
    assert!(restarted.error.is_none());
    assert_eq!(builds.load(Ordering::SeqCst), 2);
    assert_eq!(context.jobs.get(&run_id).unwrap().generation, 1);
    assert_eq!(wait_terminal::<Jobs>(&context, &run_id).await, LifecycleState::Finished);
    assert_eq!(list::<Jobs>(&context).len(), 1);
}

#[tokio::test]
async fn expired_removal_skips_a_restarted_run() {
    let context = context();
    let run_id = submit::<Jobs>(&context, job(vec![EntryDefinition::new("noop".into())]))
        .await
        .unwrap()
        .run_id;
    start::<Jobs>(&context, &run_id).await.unwrap();
    wait_terminal::<Jobs>(&context, &run_id).await;
    let expired_generation = context.jobs.get(&run_id).unwrap().generation;

    start::<Jobs>(&context, &run_id).await.unwrap();
    wait_terminal::<Jobs>(&context, &run_id).await;

    assert!(remove_expired::<Jobs>(&context, &run_id, expired_generation)
        .await
        .is_none());
    assert!(context.jobs.contains(&run_id));

    let current = context.jobs.get(&run_id).unwrap().generation;
    let removed = remove_expired::<Jobs>(&context, &run_id, current).await;
    assert!(removed.is_some_and(|result| result.is_ok()));
    assert!(!context.jobs.contains(&run_id));
}

#[tokio::test]
async fn expired_removal_skips_an_active_run() {
    let context = context();
    let run_id = submit::<Pipelines>(&context, slow_pipeline("P"))
        .await
        .unwrap()
        .run_id;
    start::<Pipelines>(&context, &run_id).await.unwrap();

    assert!(remove_expired::<Pipelines>(&context, &run_id, 0).await.is_none());
    assert!(context.pipelines.contains(&run_id));

    stop::<Pipelines>(&context, &run_id).await.unwrap();
}

#[tokio::test]
async fn starting_a_running_execution_is_a_no_op() {
    let (context, builds) = counting_context();
    let run_id = submit::<Pipelines>(&context, slow_pipeline("P"))
        .await
        .unwrap()
        .run_id;
    start::<Pipelines>(&context, &run_id).await.unwrap();

    let again = start::<Pipelines>(&context, &run_id).await.unwrap();

    assert_eq!(again.state, LifecycleState::Running);
    assert!(again.error.is_none());
    assert_eq!(builds.load(Ordering::SeqCst), 1);
    assert_eq!(context.pipelines.get(&run_id).unwrap().generation, 0);

    stop::<Pipelines>(&context, &run_id).await.unwrap();
}

#[tokio::test]
async fn failing_job_reports_its_error() {
    let context = context();
    let run_id = submit::<Jobs>(
        &context,
        job(vec![EntryDefinition {
            fail: true,
            ..EntryDefinition::new("broken".into())
        }]),
    )
    .await
    .unwrap()
    .run_id;

    start::<Jobs>(&context, &run_id).await.unwrap();
    wait_terminal::<Jobs>(&context, &run_id).await;
    let status = status::<Jobs>(&context, &run_id, None).unwrap();

    assert_eq!(status.state, LifecycleState::FinishedWithErrors);
    assert!(status.error.is_some());
    assert!(status.steps.is_empty());
    assert!(!status.result.unwrap().success);
}

#[tokio::test]
async fn unknown_repository_is_rejected_before_registration() {
    let context = context();
    let mut configuration = job(vec![EntryDefinition::new("noop".into())]);
    configuration.configuration.repository = Some(RepositoryReference::new("missing".into()));

    let error = submit::<Jobs>(&context, configuration).await.unwrap_err();

    assert!(matches!(error, ApiError::InvalidConfiguration(_)));
    assert!(context.jobs.is_empty());
}

#[tokio::test]
async fn known_repository_is_used() {
    let context = context();
    let mut configuration = job(vec![EntryDefinition::new("noop".into())]);
    configuration.configuration.repository = Some(RepositoryReference::new("prod".into()));
    configuration.configuration.log_level = LogLevel::Detailed;

    let run_id = submit::<Jobs>(&context, configuration).await.unwrap().run_id;
    start::<Jobs>(&context, &run_id).await.unwrap();

    assert_eq!(wait_terminal::<Jobs>(&context, &run_id).await, LifecycleState::Finished);
    assert!(log::<Jobs>(&context, &run_id, 0).unwrap().contains("prod"));
}

#[tokio::test]
async fn remove_stops_active_pipeline_and_releases_ports() {
    let context = context();
    let run_id = submit::<Pipelines>(&context, slow_pipeline("P"))
        .await
        .unwrap()
        .run_id;
    start::<Pipelines>(&context, &run_id).await.unwrap();
    let object = Arc::clone(&context.pipelines.get(&run_id).unwrap().object);
    context
        .broker
        .allocate(&PortAllocationRequest {
            run_id: run_id.clone(),
            range_start: 41_000,
            hostname: "127.0.0.1".into(),
            pipeline_name: "P".into(),
            source_node: "a".into(),
            source_step: "generate".into(),
            source_copy: 0,
            target_node: "b".into(),
            target_step: "write".into(),
            target_copy: 0,
        })
        .unwrap();

    let removed = remove::<Pipelines>(&context, &run_id).await.unwrap();

    assert!(removed.is_ok());
    assert!(context.broker.leases(&run_id).is_empty());
    assert!(matches!(
        object.state(),
        LifecycleState::Halting | LifecycleState::Stopped
    ));
    assert!(matches!(
        remove::<Pipelines>(&context, &run_id).await,
        Err(ApiError::NotFound(_))
    ));
}

#[tokio::test]
async fn detailed_list_and_state_counts() {
    let context = context();
    let first = submit::<Pipelines>(&context, slow_pipeline("a")).await.unwrap();
    submit::<Pipelines>(&context, slow_pipeline("b")).await.unwrap();
    start::<Pipelines>(&context, &first.run_id).await.unwrap();

    let detailed = list_detailed::<Pipelines>(&context);
    let counts = state_counts::<Pipelines>(&context);

    assert_eq!(
        detailed.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
        vec!["a", "b"]
    );
    assert_eq!(
        counts,
        vec![
            StateCount {
                state: LifecycleState::Waiting,
                count: 1
            },
            StateCount {
                state: LifecycleState::Running,
                count: 1
            },
        ]
    );

    stop::<Pipelines>(&context, &first.run_id).await.unwrap();
}
