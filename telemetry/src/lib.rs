//! Tracing setup and the regional log shipper.
//!
//! Events always go to stdout through a non-blocking writer. When shipping
//! is enabled they are additionally serialized to JSON, redacted, buffered
//! in a local SQLite database and drained to the log endpoint in batches;
//! the buffer is the only state the agent keeps across restarts. Shipping
//! failures leave rows in the buffer for the next drain.

use std::fmt;

use sqlx::sqlite::SqliteConnectOptions;
use sqlx::SqlitePool;
use tracing::level_filters::LevelFilter;
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use settings::Settings;

const MASK: &str = "****************";
const DRAIN_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);
const DRAIN_BATCH: i64 = 100;

#[derive(Debug)]
pub enum TelemetryError {
    Buffer(sqlx::Error),
    Subscriber(String),
}

impl fmt::Display for TelemetryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TelemetryError::Buffer(err) => write!(f, "log buffer error: {err}"),
            TelemetryError::Subscriber(msg) => write!(f, "subscriber setup failed: {msg}"),
        }
    }
}

impl std::error::Error for TelemetryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TelemetryError::Buffer(err) => Some(err),
            TelemetryError::Subscriber(_) => None,
        }
    }
}

impl From<sqlx::Error> for TelemetryError {
    fn from(err: sqlx::Error) -> Self {
        TelemetryError::Buffer(err)
    }
}

/// Mask every occurrence of the network password before a log line leaves
/// the process.
pub fn redact(line: &str, secret: &str) -> String {
    if secret.is_empty() {
        return line.to_string();
    }
    line.replace(secret, MASK)
}

// ─── Shipping layer ────────────────────────────────────────────────────────

struct ShipperLayer {
    tx: tokio::sync::mpsc::UnboundedSender<String>,
    secret: String,
    application: String,
    region: String,
}

struct FieldVisitor {
    fields: serde_json::Map<String, serde_json::Value>,
}

impl tracing::field::Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::from(format!("{value:?}")));
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.fields.insert(field.name().to_string(), serde_json::Value::from(value));
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.fields.insert(field.name().to_string(), serde_json::Value::from(value));
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.fields.insert(field.name().to_string(), serde_json::Value::from(value));
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.fields.insert(field.name().to_string(), serde_json::Value::from(value));
    }
}

impl<S> Layer<S> for ShipperLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor { fields: serde_json::Map::new() };
        event.record(&mut visitor);

        let mut record = serde_json::Map::new();
        record.insert("application".to_string(), serde_json::Value::from(self.application.as_str()));
        record.insert("region".to_string(), serde_json::Value::from(self.region.as_str()));
        record.insert(
            "timestamp".to_string(),
            serde_json::Value::from(chrono::Utc::now().to_rfc3339()),
        );
        record.insert(
            "level".to_string(),
            serde_json::Value::from(event.metadata().level().to_string()),
        );
        record.insert("target".to_string(), serde_json::Value::from(event.metadata().target()));
        record.insert("fields".to_string(), serde_json::Value::Object(visitor.fields));

        let line = redact(&serde_json::Value::Object(record).to_string(), &self.secret);
        // A full channel or a dead shipper must never block logging
        let _ = self.tx.send(line);
    }
}

// ─── Buffered drain task ───────────────────────────────────────────────────

async fn open_buffer(path: &str) -> Result<SqlitePool, sqlx::Error> {
    let options: SqliteConnectOptions = path.parse::<SqliteConnectOptions>()?.create_if_missing(true);
    let pool = SqlitePool::connect_lazy_with(options);
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS shipped_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(&pool)
    .await?;
    Ok(pool)
}

async fn shipper_task(
    pool: SqlitePool,
    endpoint: String,
    mut rx: tokio::sync::mpsc::UnboundedReceiver<String>,
) {
    let http = reqwest::Client::new();
    let mut ticker = tokio::time::interval(DRAIN_INTERVAL);
    loop {
        tokio::select! {
            line = rx.recv() => {
                match line {
                    Some(line) => {
                        let _ = sqlx::query("INSERT INTO shipped_logs (payload) VALUES (?)")
                            .bind(&line)
                            .execute(&pool)
                            .await;
                    }
                    // Sender gone: drain what is left, then stop
                    None => {
                        drain(&pool, &http, &endpoint).await;
                        return;
                    }
                }
            }
            _ = ticker.tick() => {
                drain(&pool, &http, &endpoint).await;
            }
        }
    }
}

/// Ship one batch of buffered rows; delete them only after the endpoint
/// accepted the batch.
async fn drain(pool: &SqlitePool, http: &reqwest::Client, endpoint: &str) {
    #[derive(sqlx::FromRow)]
    struct Row {
        id: i64,
        payload: String,
    }
    let rows: Vec<Row> = match sqlx::query_as(
        "SELECT id, payload FROM shipped_logs ORDER BY id LIMIT ?",
    )
    .bind(DRAIN_BATCH)
    .fetch_all(pool)
    .await
    {
        Ok(rows) => rows,
        Err(_) => return,
    };
    if rows.is_empty() {
        return;
    }

    let body = rows.iter().map(|r| r.payload.as_str()).collect::<Vec<_>>().join("\n");
    let sent = http
        .post(endpoint)
        .header("Content-Type", "application/x-ndjson")
        .body(body)
        .send()
        .await
        .map(|response| response.status().is_success())
        .unwrap_or(false);
    if !sent {
        return;
    }

    let max_id = rows.last().map(|r| r.id).unwrap_or(0);
    let _ = sqlx::query("DELETE FROM shipped_logs WHERE id <= ?")
        .bind(max_id)
        .execute(pool)
        .await;
}

/// Install the subscriber. The returned guard must live for the whole
/// process so the non-blocking writer flushes on shutdown.
pub async fn init(settings: &Settings) -> Result<WorkerGuard, TelemetryError> {
    let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(writer);

    if settings.log_enabled && !settings.log_endpoint.is_empty() {
        let pool = open_buffer(&settings.log_buffer_path).await?;
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(shipper_task(pool, settings.log_endpoint.clone(), rx));
        let shipper = ShipperLayer {
            tx,
            secret: settings.network_password.clone(),
            application: "custodian".to_string(),
            region: settings.region_name.clone(),
        };
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .with(shipper)
            .try_init()
            .map_err(|err| TelemetryError::Subscriber(err.to_string()))?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init()
            .map_err(|err| TelemetryError::Subscriber(err.to_string()))?;
    }
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redaction_masks_every_occurrence() {
        let line = "login with secret123 then again secret123";
        assert_eq!(
            redact(line, "secret123"),
            "login with **************** then again ****************"
        );
    }

    #[test]
    fn empty_secret_redacts_nothing() {
        assert_eq!(redact("hello", ""), "hello");
    }

    #[tokio::test]
    async fn buffer_table_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.db");
        let pool = open_buffer(path.to_str().unwrap()).await.unwrap();

        sqlx::query("INSERT INTO shipped_logs (payload) VALUES (?)")
            .bind("{\"level\":\"INFO\"}")
            .execute(&pool)
            .await
            .unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM shipped_logs")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
