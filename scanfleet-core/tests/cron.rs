use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use scanfleet_core::cron::{CronDefinition, CronStatus, JobTemplate};
use scanfleet_core::job::JobStatus;
use scanfleet_core::store::MemoryStore;
use scanfleet_core::{Coordinator, CoordinatorConfig};
use serde_json::json;

fn coordinator() -> Coordinator<MemoryStore> {
    let mut config = CoordinatorConfig::default();
    config.cron.tick_interval_ms = 20;
    config.recovery.interval_ms = 50;
    Coordinator::new(Arc::new(MemoryStore::new()), config).expect("valid config")
}

fn template() -> JobTemplate {
    let mut template = JobTemplate::new(
        "ws-1",
        "a.example.com\nb.example.com",
        json!({"modules": ["portscan"]}),
    );
    template.priority = 3;
    template
}

#[tokio::test]
async fn due_definitions_launch_started_jobs() {
    let coordinator = coordinator();
    let definition = coordinator
        .crons()
        .create(CronDefinition::cron("every-minute", "0 * * * * *", template()))
        .await
        .expect("create");
    let slot = definition.next_run_time.expect("scheduled");

    let scheduler = coordinator.cron_scheduler();
    assert_eq!(scheduler.reload_all().await.expect("reload"), 1);

    let launched = scheduler.tick(slot).await.expect("tick");
    assert_eq!(launched.len(), 1);

    let job = coordinator.jobs().job(launched[0]).await.expect("job");
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.priority, 3);
    assert!(job.name.starts_with("every-minute @ "));
    assert_eq!(job.unit_count, 1);

    let stored = coordinator.crons().get(definition.id).await.expect("get");
    assert_eq!(stored.run_count, 1);
    assert_eq!(stored.last_run_time, Some(slot));
    assert!(stored.next_run_time.is_some_and(|next| next > slot));

    assert!(scheduler.tick(slot).await.expect("tick").is_empty());
}

#[tokio::test]
async fn disabled_definitions_are_not_tracked() {
    let coordinator = coordinator();
    coordinator
        .crons()
        .create(CronDefinition::cron("off", "* * * * * *", template()).disabled())
        .await
        .expect("create");

    let scheduler = coordinator.cron_scheduler();
    assert_eq!(scheduler.reload_all().await.expect("reload"), 0);
    let later = Utc::now() + chrono::Duration::minutes(5);
    assert!(scheduler.tick(later).await.expect("tick").is_empty());
}

#[tokio::test]
async fn run_now_launches_without_moving_the_schedule() {
    let coordinator = coordinator();
    let definition = coordinator
        .crons()
        .create(CronDefinition::cron("nightly", "0 0 3 * * *", template()))
        .await
        .expect("create");

    let scheduler = coordinator.cron_scheduler();
    let job_id = scheduler.run_now(definition.id).await.expect("run now");
    assert_eq!(
        coordinator.jobs().job(job_id).await.expect("job").status,
        JobStatus::Pending
    );

    let stored = coordinator.crons().get(definition.id).await.expect("get");
    assert_eq!(stored.run_count, 1);
    assert_eq!(stored.next_run_time, definition.next_run_time);
}

#[tokio::test]
async fn running_coordinator_fires_one_shot_definitions() {
    let coordinator = coordinator();
    coordinator.start().await.expect("start");
    tokio::time::sleep(Duration::from_millis(50)).await;

    let at = Utc::now() + chrono::Duration::milliseconds(300);
    let definition = coordinator
        .crons()
        .create(CronDefinition::once("one-off", at, template()))
        .await
        .expect("create");

    let mut fired = None;
    for _ in 0..100 {
        let current = coordinator.crons().get(definition.id).await.expect("get");
        if current.run_count > 0 {
            fired = Some(current);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    coordinator.shutdown().await;

    let fired = fired.expect("one-shot fired within two seconds");
    assert_eq!(fired.run_count, 1);
    assert_eq!(fired.status, CronStatus::Disable);
    assert_eq!(fired.next_run_time, None);
}

#[tokio::test]
async fn coordinator_refuses_to_start_twice() {
    let coordinator = coordinator();
    coordinator.start().await.expect("start");
    assert!(coordinator.start().await.is_err());
    coordinator.shutdown().await;
    assert!(coordinator.start().await.is_err());
}
