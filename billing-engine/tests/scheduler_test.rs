//! Scheduler tests for billing-engine.

mod common;

use billing_engine::config::SchedulerConfig;
use billing_engine::jobs::Scheduler;
use common::TestApp;
use std::time::Duration;

#[tokio::test]
async fn run_once_drives_the_daily_jobs() {
    let app = TestApp::new();
    app.active_subscription().await;
    let scheduler = Scheduler::new(app.orchestrator.clone(), SchedulerConfig::default());

    let report = scheduler.run_once().await.expect("Run aborted");
    assert_eq!(report.generated_invoices.succeeded, 1);

    let again = scheduler.run_once().await.expect("Run aborted");
    assert_eq!(again.generated_invoices.skipped, 1);
}

#[tokio::test]
async fn startup_run_happens_before_first_interval() {
    let app = TestApp::new();
    app.active_subscription().await;
    let scheduler = Scheduler::new(
        app.orchestrator.clone(),
        SchedulerConfig {
            interval: Duration::from_secs(3600),
            run_on_startup: true,
        },
    );

    let handle = tokio::spawn(scheduler.run());
    for _ in 0..50 {
        if app.orchestrator.invoice_statistics(None).await.unwrap().total > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    handle.abort();

    let stats = app.orchestrator.invoice_statistics(None).await.unwrap();
    assert_eq!(stats.total, 1);
}
