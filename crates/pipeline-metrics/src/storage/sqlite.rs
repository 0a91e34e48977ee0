use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};

use super::{MetricsStorage, RollupKind, RollupStorage};
use crate::error::{MetricsError, MetricsResult};
use crate::rollup::{Granularity, MetricsRollup, RunningStats, StagePerformanceRollup};
use crate::types::{
    Attributes, CostInfo, PerformanceMetrics, PipelineStatus, RangeTotals, RetrievalMetrics,
    StageRecord, TokenUsage, TtsMetrics, UsageAnalytics, UserRequest,
};

const PERFORMANCE_COLUMNS: &str = "pipeline_id, status, partial, started_at, timestamp, \
     total_duration_ms, first_response_latency_ms, last_response_latency_ms, stages, \
     attributes";

const USAGE_COLUMNS: &str = "pipeline_id, status, timestamp, model, prompt_tokens, \
     completion_tokens, llm_credits, tts_credits, audio_duration_ms, total_duration_ms, \
     input_length, input_preview, memory_count, document_count, retrieval_time_ms, \
     sentence_count, audio_chunks, synthesis_time_ms, cost_estimated";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-backed raw and rollup storage.
///
/// Each call opens its own connection on the blocking pool. Rollup merges are
/// `INSERT .. ON CONFLICT DO UPDATE` statements run in one immediate
/// transaction with the pipeline's `rollup_ledger` row, so a bucket update and
/// its once-per-pipeline marker commit or roll back together.
#[derive(Debug, Clone)]
pub struct SqliteMetricsStorage {
    db_path: PathBuf,
}

impl SqliteMetricsStorage {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    async fn with_connection<T, F>(&self, func: F) -> MetricsResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> MetricsResult<T> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let connection = open_connection(&db_path)?;
            func(&connection)
        })
        .await
        .map_err(|error| MetricsError::Task(error.to_string()))?
    }

    async fn query_performance(
        &self,
        filter: &'static str,
        params: Vec<rusqlite::types::Value>,
    ) -> MetricsResult<Vec<PerformanceMetrics>> {
        self.with_connection(move |connection| {
            let sql = format!("SELECT {PERFORMANCE_COLUMNS} FROM performance_metrics {filter}");
            let mut statement = connection.prepare(&sql)?;
            let rows = statement
                .query_map(rusqlite::params_from_iter(params), PerformanceRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(PerformanceRow::into_metrics).collect()
        })
        .await
    }

    async fn query_usage(
        &self,
        filter: &'static str,
        params: Vec<rusqlite::types::Value>,
    ) -> MetricsResult<Vec<UsageAnalytics>> {
        self.with_connection(move |connection| {
            let sql = format!("SELECT {USAGE_COLUMNS} FROM usage_analytics {filter}");
            let mut statement = connection.prepare(&sql)?;
            let rows = statement
                .query_map(rusqlite::params_from_iter(params), UsageRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(UsageRow::into_usage).collect()
        })
        .await
    }

    async fn query_totals(
        &self,
        filter: &'static str,
        params: Vec<rusqlite::types::Value>,
    ) -> MetricsResult<RangeTotals> {
        self.with_connection(move |connection| {
            let sql = format!(
                "SELECT COUNT(*), COALESCE(SUM(prompt_tokens + completion_tokens), 0), \
                 COALESCE(SUM(total_duration_ms), 0) FROM usage_analytics {filter}"
            );
            let totals = connection.query_row(&sql, rusqlite::params_from_iter(params), |row| {
                Ok(RangeTotals {
                    requests: from_sql_int(row.get(0)?),
                    tokens: from_sql_int(row.get(1)?),
                    duration_ms: from_sql_int(row.get(2)?),
                })
            })?;
            Ok(totals)
        })
        .await
    }
}

#[async_trait]
impl MetricsStorage for SqliteMetricsStorage {
    async fn init(&self) -> MetricsResult<()> {
        self.with_connection(|connection| {
            connection.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS performance_metrics (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    pipeline_id TEXT NOT NULL UNIQUE,
                    status TEXT NOT NULL,
                    partial INTEGER NOT NULL DEFAULT 0,
                    started_at TEXT NOT NULL,
                    timestamp TEXT NOT NULL,
                    total_duration_ms INTEGER NOT NULL,
                    first_response_latency_ms INTEGER,
                    last_response_latency_ms INTEGER,
                    stages TEXT NOT NULL,
                    attributes TEXT NOT NULL DEFAULT '{}'
                );

                CREATE INDEX IF NOT EXISTS idx_performance_timestamp
                    ON performance_metrics(timestamp, seq);
                CREATE INDEX IF NOT EXISTS idx_performance_duration
                    ON performance_metrics(total_duration_ms);

                CREATE TABLE IF NOT EXISTS usage_analytics (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    pipeline_id TEXT NOT NULL UNIQUE,
                    status TEXT NOT NULL,
                    timestamp TEXT NOT NULL,
                    model TEXT NOT NULL,
                    prompt_tokens INTEGER NOT NULL,
                    completion_tokens INTEGER NOT NULL,
                    llm_credits INTEGER NOT NULL,
                    tts_credits INTEGER NOT NULL,
                    audio_duration_ms INTEGER,
                    total_duration_ms INTEGER NOT NULL,
                    input_length INTEGER NOT NULL DEFAULT 0,
                    input_preview TEXT,
                    memory_count INTEGER NOT NULL DEFAULT 0,
                    document_count INTEGER NOT NULL DEFAULT 0,
                    retrieval_time_ms INTEGER NOT NULL DEFAULT 0,
                    sentence_count INTEGER NOT NULL DEFAULT 0,
                    audio_chunks INTEGER NOT NULL DEFAULT 0,
                    synthesis_time_ms INTEGER NOT NULL DEFAULT 0,
                    cost_estimated INTEGER NOT NULL DEFAULT 0
                );

                CREATE INDEX IF NOT EXISTS idx_usage_timestamp
                    ON usage_analytics(timestamp, seq);

                CREATE TABLE IF NOT EXISTS metrics_rollups (
                    granularity TEXT NOT NULL,
                    bucket_start TEXT NOT NULL,
                    failed_requests INTEGER NOT NULL,
                    partial_requests INTEGER NOT NULL,
                    credits INTEGER NOT NULL,
                    duration_count INTEGER NOT NULL,
                    duration_sum INTEGER NOT NULL,
                    duration_min INTEGER NOT NULL,
                    duration_max INTEGER NOT NULL,
                    tokens_count INTEGER NOT NULL,
                    tokens_sum INTEGER NOT NULL,
                    tokens_min INTEGER NOT NULL,
                    tokens_max INTEGER NOT NULL,
                    PRIMARY KEY (granularity, bucket_start)
                );

                CREATE TABLE IF NOT EXISTS stage_rollups (
                    granularity TEXT NOT NULL,
                    bucket_start TEXT NOT NULL,
                    stage TEXT NOT NULL,
                    sample_count INTEGER NOT NULL,
                    duration_sum INTEGER NOT NULL,
                    duration_min INTEGER NOT NULL,
                    duration_max INTEGER NOT NULL,
                    PRIMARY KEY (granularity, bucket_start, stage)
                );

                CREATE TABLE IF NOT EXISTS rollup_ledger (
                    pipeline_id TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    granularity TEXT NOT NULL,
                    PRIMARY KEY (pipeline_id, kind, granularity)
                );
                "#,
            )?;
            Ok(())
        })
        .await
    }

    async fn save_performance(&self, metrics: &PerformanceMetrics) -> MetricsResult<bool> {
        let metrics = metrics.clone();
        self.with_connection(move |connection| {
            let stages = serde_json::to_string(&metrics.stages)?;
            let attributes = serde_json::to_string(&metrics.attributes)?;
            let changed = connection.execute(
                r#"
                INSERT INTO performance_metrics (
                    pipeline_id, status, partial, started_at, timestamp, total_duration_ms,
                    first_response_latency_ms, last_response_latency_ms, stages, attributes
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                ON CONFLICT(pipeline_id) DO NOTHING
                "#,
                params![
                    metrics.pipeline_id,
                    metrics.status.as_str(),
                    metrics.partial,
                    format_timestamp(metrics.started_at),
                    format_timestamp(metrics.timestamp),
                    to_sql_int(metrics.total_duration_ms),
                    metrics.first_response_latency_ms.map(to_sql_int),
                    metrics.last_response_latency_ms.map(to_sql_int),
                    stages,
                    attributes,
                ],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn save_usage(&self, usage: &UsageAnalytics) -> MetricsResult<bool> {
        let usage = usage.clone();
        self.with_connection(move |connection| {
            let changed = connection.execute(
                r#"
                INSERT INTO usage_analytics (
                    pipeline_id, status, timestamp, model, prompt_tokens, completion_tokens,
                    llm_credits, tts_credits, audio_duration_ms, total_duration_ms,
                    input_length, input_preview, memory_count, document_count,
                    retrieval_time_ms, sentence_count, audio_chunks, synthesis_time_ms,
                    cost_estimated
                ) VALUES (
                    ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                    ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19
                )
                ON CONFLICT(pipeline_id) DO NOTHING
                "#,
                params![
                    usage.pipeline_id,
                    usage.status.as_str(),
                    format_timestamp(usage.timestamp),
                    usage.model,
                    to_sql_int(usage.token_usage.prompt_tokens()),
                    to_sql_int(usage.token_usage.completion_tokens()),
                    to_sql_int(usage.cost.llm_credits()),
                    to_sql_int(usage.cost.tts_credits()),
                    usage.audio_duration_ms.map(to_sql_int),
                    to_sql_int(usage.total_duration_ms),
                    to_sql_int(usage.request.input_length),
                    usage.request.input_preview,
                    to_sql_int(usage.retrieval.memory_count),
                    to_sql_int(usage.retrieval.document_count),
                    to_sql_int(usage.retrieval.retrieval_time_ms),
                    to_sql_int(usage.tts.sentence_count),
                    to_sql_int(usage.tts.audio_chunks),
                    to_sql_int(usage.tts.synthesis_time_ms),
                    usage.cost_estimated,
                ],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn performance_by_id(
        &self,
        pipeline_id: &str,
    ) -> MetricsResult<Option<PerformanceMetrics>> {
        let pipeline_id = pipeline_id.to_string();
        self.with_connection(move |connection| {
            let sql = format!(
                "SELECT {PERFORMANCE_COLUMNS} FROM performance_metrics WHERE pipeline_id = ?1"
            );
            connection
                .query_row(&sql, params![pipeline_id], PerformanceRow::from_row)
                .optional()?
                .map(PerformanceRow::into_metrics)
                .transpose()
        })
        .await
    }

    async fn usage_by_id(&self, pipeline_id: &str) -> MetricsResult<Option<UsageAnalytics>> {
        let pipeline_id = pipeline_id.to_string();
        self.with_connection(move |connection| {
            let sql = format!("SELECT {USAGE_COLUMNS} FROM usage_analytics WHERE pipeline_id = ?1");
            connection
                .query_row(&sql, params![pipeline_id], UsageRow::from_row)
                .optional()?
                .map(UsageRow::into_usage)
                .transpose()
        })
        .await
    }

    async fn performance_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> MetricsResult<Vec<PerformanceMetrics>> {
        self.query_performance(
            "WHERE timestamp >= ?1 AND timestamp < ?2 ORDER BY timestamp ASC, seq ASC",
            vec![format_timestamp(start).into(), format_timestamp(end).into()],
        )
        .await
    }

    async fn usage_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> MetricsResult<Vec<UsageAnalytics>> {
        self.query_usage(
            "WHERE timestamp >= ?1 AND timestamp < ?2 ORDER BY timestamp ASC, seq ASC",
            vec![format_timestamp(start).into(), format_timestamp(end).into()],
        )
        .await
    }

    async fn slow_pipelines(
        &self,
        threshold_ms: u64,
        limit: usize,
    ) -> MetricsResult<Vec<PerformanceMetrics>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.query_performance(
            "WHERE total_duration_ms >= ?1 ORDER BY timestamp DESC, seq DESC LIMIT ?2",
            vec![to_sql_int(threshold_ms).into(), limit_param(limit).into()],
        )
        .await
    }

    async fn performance_by_status(
        &self,
        status: PipelineStatus,
        limit: usize,
    ) -> MetricsResult<Vec<PerformanceMetrics>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.query_performance(
            "WHERE status = ?1 ORDER BY timestamp DESC, seq DESC LIMIT ?2",
            vec![status.as_str().to_string().into(), limit_param(limit).into()],
        )
        .await
    }

    async fn high_token_usage(
        &self,
        threshold: u64,
        limit: usize,
    ) -> MetricsResult<Vec<UsageAnalytics>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.query_usage(
            "WHERE prompt_tokens + completion_tokens >= ?1 \
             ORDER BY timestamp DESC, seq DESC LIMIT ?2",
            vec![to_sql_int(threshold).into(), limit_param(limit).into()],
        )
        .await
    }

    async fn recent_performance(&self, limit: usize) -> MetricsResult<Vec<PerformanceMetrics>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.query_performance(
            "ORDER BY timestamp DESC, seq DESC LIMIT ?1",
            vec![limit_param(limit).into()],
        )
        .await
    }

    async fn recent_usage(&self, limit: usize) -> MetricsResult<Vec<UsageAnalytics>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.query_usage(
            "ORDER BY timestamp DESC, seq DESC LIMIT ?1",
            vec![limit_param(limit).into()],
        )
        .await
    }

    async fn usage_totals_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> MetricsResult<RangeTotals> {
        self.query_totals(
            "WHERE timestamp >= ?1 AND timestamp < ?2",
            vec![format_timestamp(start).into(), format_timestamp(end).into()],
        )
        .await
    }

    async fn usage_totals(&self) -> MetricsResult<RangeTotals> {
        self.query_totals("", Vec::new()).await
    }
}

#[async_trait]
impl RollupStorage for SqliteMetricsStorage {
    async fn merge_metrics_rollup(
        &self,
        pipeline_id: &str,
        delta: MetricsRollup,
    ) -> MetricsResult<bool> {
        let pipeline_id = pipeline_id.to_string();
        self.with_connection(move |connection| {
            merge_once(connection, &pipeline_id, RollupKind::Metrics, delta.granularity, |tx| {
                upsert_metrics_rollup(tx, &delta)
            })
        })
        .await
    }

    async fn merge_stage_rollup(
        &self,
        pipeline_id: &str,
        delta: StagePerformanceRollup,
    ) -> MetricsResult<bool> {
        let pipeline_id = pipeline_id.to_string();
        self.with_connection(move |connection| {
            merge_once(connection, &pipeline_id, RollupKind::Stages, delta.granularity, |tx| {
                upsert_stage_rollup(tx, &delta)
            })
        })
        .await
    }

    async fn metrics_rollups_between(
        &self,
        granularity: Granularity,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> MetricsResult<Vec<MetricsRollup>> {
        self.with_connection(move |connection| {
            let mut statement = connection.prepare(
                r#"
                SELECT bucket_start, failed_requests, partial_requests, credits,
                       duration_count, duration_sum, duration_min, duration_max,
                       tokens_count, tokens_sum, tokens_min, tokens_max
                FROM metrics_rollups
                WHERE granularity = ?1 AND bucket_start >= ?2 AND bucket_start < ?3
                ORDER BY bucket_start ASC
                "#,
            )?;
            let rows = statement
                .query_map(
                    params![
                        granularity.as_str(),
                        format_timestamp(start),
                        format_timestamp(end)
                    ],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            from_sql_int(row.get(1)?),
                            from_sql_int(row.get(2)?),
                            from_sql_int(row.get(3)?),
                            stats_at(row, 4)?,
                            stats_at(row, 8)?,
                        ))
                    },
                )?
                .collect::<Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(|(bucket_start, failed, partial, credits, duration_ms, tokens)| {
                    Ok(MetricsRollup {
                        granularity,
                        bucket_start: parse_timestamp(bucket_start)?,
                        failed_requests: failed,
                        partial_requests: partial,
                        credits,
                        duration_ms,
                        tokens,
                    })
                })
                .collect()
        })
        .await
    }

    async fn stage_rollups_between(
        &self,
        granularity: Granularity,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> MetricsResult<Vec<StagePerformanceRollup>> {
        self.with_connection(move |connection| {
            let mut statement = connection.prepare(
                r#"
                SELECT bucket_start, stage, sample_count, duration_sum, duration_min, duration_max
                FROM stage_rollups
                WHERE granularity = ?1 AND bucket_start >= ?2 AND bucket_start < ?3
                ORDER BY bucket_start ASC, stage ASC
                "#,
            )?;
            let rows = statement
                .query_map(
                    params![
                        granularity.as_str(),
                        format_timestamp(start),
                        format_timestamp(end)
                    ],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            stats_at(row, 2)?,
                        ))
                    },
                )?
                .collect::<Result<Vec<_>, _>>()?;

            let mut rollups: Vec<StagePerformanceRollup> = Vec::new();
            for (bucket_start, stage, stats) in rows {
                let bucket_start = parse_timestamp(bucket_start)?;
                match rollups.last_mut() {
                    Some(last) if last.bucket_start == bucket_start => {
                        last.stages.insert(stage, stats);
                    }
                    _ => {
                        let mut row = StagePerformanceRollup {
                            granularity,
                            bucket_start,
                            stages: Default::default(),
                        };
                        row.stages.insert(stage, stats);
                        rollups.push(row);
                    }
                }
            }
            Ok(rollups)
        })
        .await
    }
}

struct PerformanceRow {
    pipeline_id: String,
    status: String,
    partial: bool,
    started_at: String,
    timestamp: String,
    total_duration_ms: i64,
    first_response_latency_ms: Option<i64>,
    last_response_latency_ms: Option<i64>,
    stages: String,
    attributes: String,
}

impl PerformanceRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            pipeline_id: row.get(0)?,
            status: row.get(1)?,
            partial: row.get(2)?,
            started_at: row.get(3)?,
            timestamp: row.get(4)?,
            total_duration_ms: row.get(5)?,
            first_response_latency_ms: row.get(6)?,
            last_response_latency_ms: row.get(7)?,
            stages: row.get(8)?,
            attributes: row.get(9)?,
        })
    }

    fn into_metrics(self) -> MetricsResult<PerformanceMetrics> {
        let stages: Vec<StageRecord> = serde_json::from_str(&self.stages)?;
        let attributes: Attributes = serde_json::from_str(&self.attributes)?;
        Ok(PerformanceMetrics {
            status: parse_status(&self.status)?,
            pipeline_id: self.pipeline_id,
            partial: self.partial,
            started_at: parse_timestamp(self.started_at)?,
            timestamp: parse_timestamp(self.timestamp)?,
            total_duration_ms: from_sql_int(self.total_duration_ms),
            first_response_latency_ms: self.first_response_latency_ms.map(from_sql_int),
            last_response_latency_ms: self.last_response_latency_ms.map(from_sql_int),
            stages,
            attributes,
        })
    }
}

struct UsageRow {
    pipeline_id: String,
    status: String,
    timestamp: String,
    model: String,
    prompt_tokens: i64,
    completion_tokens: i64,
    llm_credits: i64,
    tts_credits: i64,
    audio_duration_ms: Option<i64>,
    total_duration_ms: i64,
    input_length: i64,
    input_preview: Option<String>,
    memory_count: i64,
    document_count: i64,
    retrieval_time_ms: i64,
    sentence_count: i64,
    audio_chunks: i64,
    synthesis_time_ms: i64,
    cost_estimated: bool,
}

impl UsageRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            pipeline_id: row.get(0)?,
            status: row.get(1)?,
            timestamp: row.get(2)?,
            model: row.get(3)?,
            prompt_tokens: row.get(4)?,
            completion_tokens: row.get(5)?,
            llm_credits: row.get(6)?,
            tts_credits: row.get(7)?,
            audio_duration_ms: row.get(8)?,
            total_duration_ms: row.get(9)?,
            input_length: row.get(10)?,
            input_preview: row.get(11)?,
            memory_count: row.get(12)?,
            document_count: row.get(13)?,
            retrieval_time_ms: row.get(14)?,
            sentence_count: row.get(15)?,
            audio_chunks: row.get(16)?,
            synthesis_time_ms: row.get(17)?,
            cost_estimated: row.get(18)?,
        })
    }

    fn into_usage(self) -> MetricsResult<UsageAnalytics> {
        Ok(UsageAnalytics {
            status: parse_status(&self.status)?,
            pipeline_id: self.pipeline_id,
            timestamp: parse_timestamp(self.timestamp)?,
            model: self.model,
            token_usage: TokenUsage::new(
                from_sql_int(self.prompt_tokens),
                from_sql_int(self.completion_tokens),
            ),
            cost: CostInfo::new(from_sql_int(self.llm_credits), from_sql_int(self.tts_credits)),
            audio_duration_ms: self.audio_duration_ms.map(from_sql_int),
            total_duration_ms: from_sql_int(self.total_duration_ms),
            request: UserRequest {
                input_length: from_sql_int(self.input_length),
                input_preview: self.input_preview,
            },
            retrieval: RetrievalMetrics {
                memory_count: from_sql_int(self.memory_count),
                document_count: from_sql_int(self.document_count),
                retrieval_time_ms: from_sql_int(self.retrieval_time_ms),
            },
            tts: TtsMetrics {
                sentence_count: from_sql_int(self.sentence_count),
                audio_chunks: from_sql_int(self.audio_chunks),
                synthesis_time_ms: from_sql_int(self.synthesis_time_ms),
            },
            cost_estimated: self.cost_estimated,
        })
    }
}

/// Claims the `(pipeline, kind, granularity)` ledger row and runs `merge` in
/// the same immediate transaction. Returns `false` without merging when the
/// row already exists.
fn merge_once<F>(
    connection: &Connection,
    pipeline_id: &str,
    kind: RollupKind,
    granularity: Granularity,
    merge: F,
) -> MetricsResult<bool>
where
    F: FnOnce(&Connection) -> MetricsResult<()>,
{
    let transaction = Transaction::new_unchecked(connection, TransactionBehavior::Immediate)?;
    let claimed = transaction.execute(
        "INSERT INTO rollup_ledger (pipeline_id, kind, granularity) VALUES (?1, ?2, ?3) \
         ON CONFLICT DO NOTHING",
        params![pipeline_id, kind.as_str(), granularity.as_str()],
    )?;
    if claimed == 0 {
        return Ok(false);
    }
    merge(&*transaction)?;
    transaction.commit()?;
    Ok(true)
}

fn upsert_metrics_rollup(connection: &Connection, delta: &MetricsRollup) -> MetricsResult<()> {
    connection.execute(
        r#"
        INSERT INTO metrics_rollups (
            granularity, bucket_start, failed_requests, partial_requests, credits,
            duration_count, duration_sum, duration_min, duration_max,
            tokens_count, tokens_sum, tokens_min, tokens_max
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
        ON CONFLICT(granularity, bucket_start) DO UPDATE SET
            failed_requests = failed_requests + excluded.failed_requests,
            partial_requests = partial_requests + excluded.partial_requests,
            credits = credits + excluded.credits,
            duration_count = duration_count + excluded.duration_count,
            duration_sum = duration_sum + excluded.duration_sum,
            duration_min = MIN(duration_min, excluded.duration_min),
            duration_max = MAX(duration_max, excluded.duration_max),
            tokens_count = tokens_count + excluded.tokens_count,
            tokens_sum = tokens_sum + excluded.tokens_sum,
            tokens_min = MIN(tokens_min, excluded.tokens_min),
            tokens_max = MAX(tokens_max, excluded.tokens_max)
        "#,
        params![
            delta.granularity.as_str(),
            format_timestamp(delta.bucket_start),
            to_sql_int(delta.failed_requests),
            to_sql_int(delta.partial_requests),
            to_sql_int(delta.credits),
            to_sql_int(delta.duration_ms.count),
            to_sql_int(delta.duration_ms.sum),
            to_sql_int(delta.duration_ms.min),
            to_sql_int(delta.duration_ms.max),
            to_sql_int(delta.tokens.count),
            to_sql_int(delta.tokens.sum),
            to_sql_int(delta.tokens.min),
            to_sql_int(delta.tokens.max),
        ],
    )?;
    Ok(())
}

fn upsert_stage_rollup(
    connection: &Connection,
    delta: &StagePerformanceRollup,
) -> MetricsResult<()> {
    let mut statement = connection.prepare(
        r#"
        INSERT INTO stage_rollups (
            granularity, bucket_start, stage,
            sample_count, duration_sum, duration_min, duration_max
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(granularity, bucket_start, stage) DO UPDATE SET
            sample_count = sample_count + excluded.sample_count,
            duration_sum = duration_sum + excluded.duration_sum,
            duration_min = MIN(duration_min, excluded.duration_min),
            duration_max = MAX(duration_max, excluded.duration_max)
        "#,
    )?;
    let bucket_start = format_timestamp(delta.bucket_start);
    for (stage, stats) in &delta.stages {
        statement.execute(params![
            delta.granularity.as_str(),
            bucket_start,
            stage,
            to_sql_int(stats.count),
            to_sql_int(stats.sum),
            to_sql_int(stats.min),
            to_sql_int(stats.max),
        ])?;
    }
    Ok(())
}

fn stats_at(row: &Row<'_>, first: usize) -> rusqlite::Result<RunningStats> {
    Ok(RunningStats {
        count: from_sql_int(row.get(first)?),
        sum: from_sql_int(row.get(first + 1)?),
        min: from_sql_int(row.get(first + 2)?),
        max: from_sql_int(row.get(first + 3)?),
    })
}

fn open_connection(path: &Path) -> MetricsResult<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let connection = Connection::open(path)?;
    connection.busy_timeout(BUSY_TIMEOUT)?;
    connection.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        "#,
    )?;
    Ok(connection)
}

/// Fixed-width UTC text so lexical order in SQLite matches time order.
fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(raw: String) -> MetricsResult<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(&raw)?.with_timezone(&Utc))
}

fn parse_status(raw: &str) -> MetricsResult<PipelineStatus> {
    PipelineStatus::from_db(raw)
        .ok_or_else(|| MetricsError::InvalidData(format!("unknown pipeline status: {raw}")))
}

fn to_sql_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_sql_int(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}
