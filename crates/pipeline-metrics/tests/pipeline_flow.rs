use std::time::Duration;

use chrono::Utc;
use tempfile::tempdir;

use pipeline_metrics::{
    attribute_keys, trace_stage, DialogueStage, Granularity, MetricsConfig, MetricsRuntime,
    PipelineContext, PipelineStatus, TokenUsage,
};

async fn answer(ctx: PipelineContext, fail_retrieval: bool) -> Result<String, String> {
    let tracker = ctx.require_tracker().map_err(|e| e.to_string())?;
    tracker
        .set_attribute(attribute_keys::INPUT_TEXT, "what's up")
        .map_err(|e| e.to_string())?;

    trace_stage(&ctx, DialogueStage::Retrieval, async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        if fail_retrieval {
            Err("index offline".to_string())
        } else {
            Ok(())
        }
    })
    .await?;
    tracker
        .record_stage_attribute(
            DialogueStage::Retrieval.as_str(),
            attribute_keys::DOCUMENT_COUNT,
            3,
        )
        .map_err(|e| e.to_string())?;

    let text = trace_stage(&ctx, DialogueStage::LlmCompletion, async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok::<_, String>("the answer".to_string())
    })
    .await?;

    tracker
        .record_token_usage(TokenUsage::new(1_000, 250))
        .map_err(|e| e.to_string())?;
    tracker.mark_response().map_err(|e| e.to_string())?;

    trace_stage(&ctx, DialogueStage::TtsSynthesis, async {
        tracker.record_audio_duration(2_000).map_err(|e| e.to_string())
    })
    .await?;

    Ok(text)
}

#[tokio::test]
async fn pipelines_flow_from_tracker_to_queries() {
    let dir = tempdir().expect("temp dir");
    let config = MetricsConfig {
        db_path: Some(dir.path().join("metrics.db")),
        ..MetricsConfig::default()
    };
    let started = Utc::now();
    let runtime = MetricsRuntime::start(&config).await.expect("start runtime");
    let query = runtime.query();
    let ctx = PipelineContext::new();

    for i in 0..3 {
        let result = runtime
            .monitor()
            .run(&ctx, format!("ok-{i}"), |ctx| answer(ctx, false))
            .await;
        assert_eq!(result.as_deref(), Ok("the answer"));
    }
    let failed = runtime
        .monitor()
        .run(&ctx, "failed-0", |ctx| answer(ctx, true))
        .await;
    assert!(failed.is_err());

    let stats = runtime.shutdown().await.expect("shutdown");
    assert_eq!(stats.pipelines, 4);
    assert_eq!(stats.sink_failures, 0);

    let finished = Utc::now() + chrono::Duration::seconds(1);
    let records = query
        .performance_metrics_by_time_range(started, finished)
        .await
        .expect("range");
    assert_eq!(records.len(), 4);
    assert!(records.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

    let failed = query
        .performance_metrics_by_status(PipelineStatus::Failed, 10)
        .await
        .expect("failed");
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].stages[0].error_kind.as_deref(), Some("index offline"));

    let detail = query
        .pipeline_detail("ok-0")
        .await
        .expect("detail")
        .expect("present");
    let usage = detail.usage.expect("usage");
    assert_eq!(usage.token_usage.total_tokens(), 1_250);
    assert_eq!(usage.audio_duration_ms, Some(2_000));
    // gpt-4o-mini: 1000 * 0.15 + 250 * 0.60 per million = 0.0003 dollars; tts 20 * 0.00015
    assert_eq!(usage.cost.llm_credits(), 3);
    assert_eq!(usage.cost.tts_credits(), 30);
    assert_eq!(usage.request.input_length, 9);
    assert_eq!(usage.retrieval.document_count, 3);
    assert!(!usage.cost_estimated);
    let performance = detail.performance.expect("performance");
    assert_eq!(performance.stages.len(), 3);
    assert!(performance.first_response_latency_ms.is_some());

    assert_eq!(
        query.total_request_count(started, finished).await.expect("count"),
        4
    );
    assert_eq!(
        query.total_token_usage(started, finished).await.expect("tokens"),
        3 * 1_250
    );
    assert_eq!(query.total_request_count_all().await.expect("all"), 4);

    let day = Granularity::Day.bucket_start(started);
    let rollups = query
        .metrics_rollups(Granularity::Day, day, day + chrono::Duration::days(2))
        .await
        .expect("rollups");
    let requests: u64 = rollups.iter().map(|row| row.requests()).sum();
    let failures: u64 = rollups.iter().map(|row| row.failed_requests).sum();
    assert_eq!(requests, 4);
    assert_eq!(failures, 1);

    let stages = query
        .stage_performance_summary(Granularity::Day, day, day + chrono::Duration::days(2))
        .await
        .expect("stages");
    let retrieval = stages
        .iter()
        .find(|s| s.stage == "retrieval")
        .expect("retrieval stage");
    assert_eq!(retrieval.count, 4);
}

#[tokio::test]
async fn logging_only_mode_persists_nothing() {
    let config = MetricsConfig {
        persistent_enabled: false,
        prometheus_enabled: true,
        ..MetricsConfig::default()
    };
    let runtime = MetricsRuntime::start(&config).await.expect("start runtime");
    let query = runtime.query();
    let registry = runtime.prometheus_registry().cloned().expect("registry");

    runtime
        .monitor()
        .run(&PipelineContext::new(), "quiet", |ctx| answer(ctx, false))
        .await
        .expect("pipeline");

    let stats = runtime.shutdown().await.expect("shutdown");
    assert_eq!(stats.pipelines, 1);
    assert!(query.recent_performance_metrics(10).await.expect("recent").is_empty());

    let families = registry.gather();
    let duration = families
        .iter()
        .find(|family| family.name() == "pipeline_duration_seconds")
        .expect("duration family");
    assert_eq!(duration.get_metric()[0].get_histogram().get_sample_count(), 1);
}
