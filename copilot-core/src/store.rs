use crate::error::{IncidentError, Result};
use crate::record::{
    EventKind, IncidentRecord, IncidentStatus, IncidentSummary, Message, Role, Severity,
    TimelineEvent,
};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Waiting,
    Completed,
    Failed,
}

impl RunStatus {
    fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Waiting => "waiting",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(RunStatus::Running),
            "waiting" => Some(RunStatus::Waiting),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

/// Persisted cursor of one incident's analysis pipeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub incident_id: String,
    pub status: RunStatus,
    pub completed_steps: Vec<String>,
    pub wake_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RunUpdate {
    pub status: RunStatus,
    pub wake_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Everything one logical operation writes to a record. Applied in a single
/// transaction so a step output never lands without its side effects.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RecordUpdate {
    pub status: Option<IncidentStatus>,
    /// Only written when the stored value is still unset.
    pub end_time: Option<DateTime<Utc>>,
    pub root_cause: Option<String>,
    pub remediation_steps: Option<Vec<String>>,
    pub messages: Vec<Message>,
    pub events: Vec<TimelineEvent>,
    pub step: Option<(String, serde_json::Value)>,
    pub run: Option<RunUpdate>,
}

impl RecordUpdate {
    pub fn message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    pub fn event(mut self, event: TimelineEvent) -> Self {
        self.events.push(event);
        self
    }

    pub fn step_output(mut self, step: impl Into<String>, output: serde_json::Value) -> Self {
        self.step = Some((step.into(), output));
        self
    }

    pub fn run(mut self, status: RunStatus) -> Self {
        self.run = Some(RunUpdate {
            status,
            wake_at: None,
            error: None,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == RecordUpdate::default()
    }
}

/// Durable per-incident state backed by SQLite.
#[derive(Clone, Debug)]
pub struct IncidentStore {
    db_path: Arc<PathBuf>,
}

impl IncidentStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| IncidentError::InvalidState(format!("create {parent:?}: {e}")))?;
            }
        }

        let store = Self {
            db_path: Arc::new(path.to_path_buf()),
        };
        let conn = store.connect()?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            CREATE TABLE IF NOT EXISTS incidents (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                description TEXT NOT NULL,
                status TEXT NOT NULL,
                severity TEXT NOT NULL,
                affected_systems TEXT NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT,
                root_cause TEXT,
                remediation_steps TEXT,
                logs TEXT,
                metrics TEXT
            );
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                incident_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS timeline (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                incident_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                description TEXT NOT NULL,
                payload TEXT,
                timestamp TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS pipeline_steps (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                incident_id TEXT NOT NULL,
                step TEXT NOT NULL,
                output TEXT NOT NULL,
                completed_at TEXT NOT NULL,
                UNIQUE (incident_id, step)
            );
            CREATE TABLE IF NOT EXISTS pipeline_runs (
                incident_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                wake_at TEXT,
                error TEXT,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_incident ON messages(incident_id);
            CREATE INDEX IF NOT EXISTS idx_timeline_incident ON timeline(incident_id);
            ",
        )?;

        Ok(store)
    }

    /// Runs store work on the blocking pool. A write can sit in SQLite's busy
    /// timeout, which must not stall a runtime worker while a lane is held.
    pub async fn blocking<T, F>(&self, work: F) -> Result<T>
    where
        F: FnOnce(&IncidentStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || work(&store))
            .await
            .map_err(|e| IncidentError::InvalidState(format!("store task failed: {e}")))?
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&*self.db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }

    pub fn insert(&self, record: &IncidentRecord) -> Result<()> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if exists(&tx, &record.id)? {
            return Err(IncidentError::InvalidState(format!(
                "incident {} already exists",
                record.id
            )));
        }

        tx.execute(
            "INSERT INTO incidents (id, title, description, status, severity, affected_systems,
                                    start_time, end_time, root_cause, remediation_steps, logs, metrics)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                record.id,
                record.title,
                record.description,
                record.status.as_str(),
                record.severity.as_str(),
                serde_json::to_string(&record.affected_systems)?,
                fmt_ts(record.start_time),
                record.end_time.map(fmt_ts),
                record.root_cause,
                record
                    .remediation_steps
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                record.logs,
                record.metrics,
            ],
        )?;
        for message in &record.history {
            insert_message(&tx, &record.id, message)?;
        }
        for event in &record.timeline {
            insert_event(&tx, &record.id, event)?;
        }

        tx.commit()?;
        Ok(())
    }

    pub fn get(&self, incident_id: &str) -> Result<IncidentRecord> {
        self.find(incident_id)?
            .ok_or_else(|| IncidentError::not_found(incident_id))
    }

    /// Reads the record, history and timeline inside one transaction so the
    /// three views are a consistent snapshot.
    pub fn find(&self, incident_id: &str) -> Result<Option<IncidentRecord>> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        let record = read_record(&tx, incident_id)?;
        tx.commit()?;
        Ok(record)
    }

    /// The record together with one step's recorded output, read in a single
    /// transaction.
    pub fn get_with_step(
        &self,
        incident_id: &str,
        step: &str,
    ) -> Result<(IncidentRecord, Option<serde_json::Value>)> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        let record =
            read_record(&tx, incident_id)?.ok_or_else(|| IncidentError::not_found(incident_id))?;
        let output = read_step_output(&tx, incident_id, step)?;
        tx.commit()?;
        Ok((record, output))
    }

    pub fn exists(&self, incident_id: &str) -> Result<bool> {
        let conn = self.connect()?;
        exists(&conn, incident_id)
    }

    pub fn list(&self) -> Result<Vec<IncidentSummary>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT id, title, status, severity, start_time
             FROM incidents
             ORDER BY start_time DESC, rowid DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(IncidentSummary {
                id: row.get(0)?,
                title: row.get(1)?,
                status: parse_col(2, &row.get::<_, String>(2)?)?,
                severity: parse_col(3, &row.get::<_, String>(3)?)?,
                start_time: parse_ts(4, &row.get::<_, String>(4)?)?,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn apply(&self, incident_id: &str, update: &RecordUpdate) -> Result<()> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if !exists(&tx, incident_id)? {
            return Err(IncidentError::not_found(incident_id));
        }

        if let Some(status) = update.status {
            tx.execute(
                "UPDATE incidents SET status = ?2 WHERE id = ?1",
                params![incident_id, status.as_str()],
            )?;
        }
        if let Some(end_time) = update.end_time {
            tx.execute(
                "UPDATE incidents SET end_time = COALESCE(end_time, ?2) WHERE id = ?1",
                params![incident_id, fmt_ts(end_time)],
            )?;
        }
        if let Some(root_cause) = update.root_cause.as_ref() {
            tx.execute(
                "UPDATE incidents SET root_cause = ?2 WHERE id = ?1",
                params![incident_id, root_cause],
            )?;
        }
        if let Some(steps) = update.remediation_steps.as_ref() {
            tx.execute(
                "UPDATE incidents SET remediation_steps = ?2 WHERE id = ?1",
                params![incident_id, serde_json::to_string(steps)?],
            )?;
        }
        for message in &update.messages {
            insert_message(&tx, incident_id, message)?;
        }
        for event in &update.events {
            insert_event(&tx, incident_id, event)?;
        }

        let now = fmt_ts(Utc::now());
        if let Some((step, output)) = update.step.as_ref() {
            tx.execute(
                "INSERT INTO pipeline_steps (incident_id, step, output, completed_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![incident_id, step, serde_json::to_string(output)?, now],
            )?;
        }
        if let Some(run) = update.run.as_ref() {
            tx.execute(
                "INSERT INTO pipeline_runs (incident_id, status, wake_at, error, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(incident_id) DO UPDATE SET
                    status = excluded.status,
                    wake_at = COALESCE(excluded.wake_at, pipeline_runs.wake_at),
                    error = excluded.error,
                    updated_at = excluded.updated_at",
                params![
                    incident_id,
                    run.status.as_str(),
                    run.wake_at.map(fmt_ts),
                    run.error,
                    now,
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Recorded step outputs in completion order.
    pub fn step_outputs(&self, incident_id: &str) -> Result<Vec<(String, serde_json::Value)>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT step, output FROM pipeline_steps
             WHERE incident_id = ?1
             ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![incident_id], |row| {
            Ok((row.get::<_, String>(0)?, parse_json(1, &row.get::<_, String>(1)?)?))
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn step_output(&self, incident_id: &str, step: &str) -> Result<Option<serde_json::Value>> {
        let conn = self.connect()?;
        read_step_output(&conn, incident_id, step)
    }

    pub fn run(&self, incident_id: &str) -> Result<Option<PipelineRun>> {
        let conn = self.connect()?;
        let row = conn
            .query_row(
                "SELECT status, wake_at, error, updated_at FROM pipeline_runs WHERE incident_id = ?1",
                params![incident_id],
                |row| {
                    let status: String = row.get(0)?;
                    let wake_at: Option<String> = row.get(1)?;
                    let updated_at: String = row.get(3)?;
                    Ok((
                        RunStatus::parse(&status).ok_or_else(|| {
                            conversion_error(0, format!("unknown run status '{status}'"))
                        })?,
                        wake_at.map(|s| parse_ts(1, &s)).transpose()?,
                        row.get::<_, Option<String>>(2)?,
                        parse_ts(3, &updated_at)?,
                    ))
                },
            )
            .optional()?;

        let Some((status, wake_at, error, updated_at)) = row else {
            return Ok(None);
        };
        let completed_steps = self
            .step_outputs(incident_id)?
            .into_iter()
            .map(|(step, _)| step)
            .collect();

        Ok(Some(PipelineRun {
            incident_id: incident_id.to_string(),
            status,
            completed_steps,
            wake_at,
            error,
            updated_at,
        }))
    }

    /// Incidents whose pipeline has not reached a terminal state.
    pub fn unfinished_runs(&self) -> Result<Vec<String>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT incident_id FROM pipeline_runs
             WHERE status IN ('running', 'waiting')
             ORDER BY updated_at ASC",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

fn read_step_output(
    conn: &Connection,
    incident_id: &str,
    step: &str,
) -> Result<Option<serde_json::Value>> {
    let raw = conn
        .query_row(
            "SELECT output FROM pipeline_steps WHERE incident_id = ?1 AND step = ?2",
            params![incident_id, step],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(raw.map(|s| serde_json::from_str(&s)).transpose()?)
}

fn exists(conn: &Connection, incident_id: &str) -> Result<bool> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM incidents WHERE id = ?1",
            params![incident_id],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

fn insert_message(conn: &Connection, incident_id: &str, message: &Message) -> Result<()> {
    conn.execute(
        "INSERT INTO messages (incident_id, role, content, timestamp) VALUES (?1, ?2, ?3, ?4)",
        params![
            incident_id,
            message.role.as_str(),
            message.content,
            fmt_ts(message.timestamp)
        ],
    )?;
    Ok(())
}

fn insert_event(conn: &Connection, incident_id: &str, event: &TimelineEvent) -> Result<()> {
    conn.execute(
        "INSERT INTO timeline (incident_id, kind, description, payload, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            incident_id,
            event.kind.as_str(),
            event.description,
            event.payload.as_ref().map(serde_json::to_string).transpose()?,
            fmt_ts(event.timestamp),
        ],
    )?;
    Ok(())
}

fn read_record(conn: &Connection, incident_id: &str) -> Result<Option<IncidentRecord>> {
    let record = conn
        .query_row(
            "SELECT id, title, description, status, severity, affected_systems, start_time,
                    end_time, root_cause, remediation_steps, logs, metrics
             FROM incidents WHERE id = ?1",
            params![incident_id],
            map_incident,
        )
        .optional()?;
    let Some(mut record) = record else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT role, content, timestamp FROM messages
         WHERE incident_id = ?1
         ORDER BY id ASC",
    )?;
    let rows = stmt.query_map(params![incident_id], |row| {
        Ok(Message {
            role: parse_col::<Role>(0, &row.get::<_, String>(0)?)?,
            content: row.get(1)?,
            timestamp: parse_ts(2, &row.get::<_, String>(2)?)?,
        })
    })?;
    for row in rows {
        record.history.push(row?);
    }

    let mut stmt = conn.prepare(
        "SELECT kind, description, payload, timestamp FROM timeline
         WHERE incident_id = ?1
         ORDER BY id ASC",
    )?;
    let rows = stmt.query_map(params![incident_id], |row| {
        let payload: Option<String> = row.get(2)?;
        Ok(TimelineEvent {
            kind: parse_col::<EventKind>(0, &row.get::<_, String>(0)?)?,
            description: row.get(1)?,
            payload: payload.map(|s| parse_json(2, &s)).transpose()?,
            timestamp: parse_ts(3, &row.get::<_, String>(3)?)?,
        })
    })?;
    for row in rows {
        record.timeline.push(row?);
    }

    Ok(Some(record))
}

fn map_incident(row: &rusqlite::Row<'_>) -> rusqlite::Result<IncidentRecord> {
    let affected: String = row.get(5)?;
    let end_time: Option<String> = row.get(7)?;
    let remediation: Option<String> = row.get(9)?;

    let affected_systems: Vec<String> = serde_json::from_str(&affected)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(err)))?;
    let remediation_steps = remediation
        .map(|s| {
            serde_json::from_str::<Vec<String>>(&s).map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(9, Type::Text, Box::new(err))
            })
        })
        .transpose()?;

    Ok(IncidentRecord {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        status: parse_col::<IncidentStatus>(3, &row.get::<_, String>(3)?)?,
        severity: parse_col::<Severity>(4, &row.get::<_, String>(4)?)?,
        affected_systems,
        start_time: parse_ts(6, &row.get::<_, String>(6)?)?,
        end_time: end_time.map(|s| parse_ts(7, &s)).transpose()?,
        root_cause: row.get(8)?,
        remediation_steps,
        logs: row.get(10)?,
        metrics: row.get(11)?,
        timeline: Vec::new(),
        history: Vec::new(),
    })
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

fn parse_json(idx: usize, raw: &str) -> rusqlite::Result<serde_json::Value> {
    serde_json::from_str(raw)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

fn parse_col<T>(idx: usize, raw: &str) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = IncidentError>,
{
    raw.parse::<T>()
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        Box::new(IncidentError::InvalidState(message)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn store(dir: &tempfile::TempDir) -> IncidentStore {
        IncidentStore::open(dir.path().join("incidents.db")).expect("open")
    }

    fn record(id: &str) -> IncidentRecord {
        IncidentRecord {
            id: id.into(),
            title: "API latency".into(),
            description: "Users reporting 504 errors".into(),
            status: IncidentStatus::Investigating,
            severity: Severity::High,
            affected_systems: vec!["api-gateway".into(), "checkout".into()],
            start_time: Utc::now(),
            end_time: None,
            root_cause: None,
            remediation_steps: None,
            logs: Some("upstream timed out".into()),
            metrics: None,
            timeline: vec![TimelineEvent::new(
                EventKind::Detection,
                "incident opened",
                Utc::now(),
            )],
            history: Vec::new(),
        }
    }

    #[test]
    fn insert_and_get_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir);
        let original = record("inc-a");
        store.insert(&original).expect("insert");

        let loaded = store.get("inc-a").expect("get");
        assert_eq!(loaded, original);
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir);
        store.insert(&record("inc-dup")).expect("insert");
        assert!(matches!(
            store.insert(&record("inc-dup")),
            Err(IncidentError::InvalidState(_))
        ));
    }

    #[test]
    fn apply_to_missing_incident_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir);
        let update = RecordUpdate::default().message(Message::user("hello", Utc::now()));

        assert!(matches!(
            store.apply("inc-missing", &update),
            Err(IncidentError::NotFound { .. })
        ));
        assert!(store.list().expect("list").is_empty());
    }

    #[test]
    fn end_time_is_only_written_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir);
        store.insert(&record("inc-end")).expect("insert");

        let first = Utc::now();
        let later = first + chrono::Duration::minutes(10);
        store
            .apply("inc-end", &RecordUpdate { end_time: Some(first), ..Default::default() })
            .expect("first");
        store
            .apply("inc-end", &RecordUpdate { end_time: Some(later), ..Default::default() })
            .expect("second");

        assert_eq!(store.get("inc-end").expect("get").end_time, Some(first));
    }

    #[test]
    fn apply_appends_history_and_timeline_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir);
        store.insert(&record("inc-log")).expect("insert");

        let now = Utc::now();
        let update = RecordUpdate::default()
            .message(Message::user("what broke?", now))
            .message(Message::assistant("the database", now))
            .event(TimelineEvent::new(EventKind::Update, "chat turn", now));
        store.apply("inc-log", &update).expect("apply");

        let loaded = store.get("inc-log").expect("get");
        assert_eq!(loaded.history.len(), 2);
        assert_eq!(loaded.history[0].role, Role::User);
        assert_eq!(loaded.history[1].content, "the database");
        assert_eq!(loaded.timeline.len(), 2);
        assert_eq!(loaded.timeline[1].kind, EventKind::Update);
    }

    #[test]
    fn step_log_tracks_outputs_and_run_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir);
        store.insert(&record("inc-run")).expect("insert");

        store
            .apply(
                "inc-run",
                &RecordUpdate::default()
                    .step_output("initial_analysis", serde_json::json!("disk full"))
                    .run(RunStatus::Running),
            )
            .expect("apply");

        assert_eq!(
            store.step_output("inc-run", "initial_analysis").expect("output"),
            Some(serde_json::json!("disk full"))
        );
        assert_eq!(store.unfinished_runs().expect("unfinished"), vec!["inc-run".to_string()]);

        let wake_at = Utc::now();
        store
            .apply(
                "inc-run",
                &RecordUpdate {
                    run: Some(RunUpdate {
                        status: RunStatus::Waiting,
                        wake_at: Some(wake_at),
                        error: None,
                    }),
                    ..Default::default()
                },
            )
            .expect("waiting");
        store
            .apply("inc-run", &RecordUpdate::default().run(RunStatus::Completed))
            .expect("completed");

        let run = store.run("inc-run").expect("run").expect("present");
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.wake_at, Some(wake_at));
        assert_eq!(run.completed_steps, vec!["initial_analysis".to_string()]);
        assert!(store.unfinished_runs().expect("unfinished").is_empty());
    }

    #[test]
    fn recording_a_step_twice_fails_and_rolls_back_side_effects() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir);
        store.insert(&record("inc-twice")).expect("insert");

        let update = RecordUpdate::default()
            .message(Message::assistant("initial analysis", Utc::now()))
            .step_output("post_initial_analysis", serde_json::json!({"posted": true}));
        store.apply("inc-twice", &update).expect("first");
        assert!(store.apply("inc-twice", &update).is_err());

        assert_eq!(store.get("inc-twice").expect("get").history.len(), 1);
    }

    #[test]
    fn list_orders_newest_first() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir);
        let mut older = record("inc-old");
        older.start_time = Utc::now() - chrono::Duration::hours(2);
        store.insert(&older).expect("insert old");
        store.insert(&record("inc-new")).expect("insert new");

        let ids: Vec<String> = store.list().expect("list").into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["inc-new".to_string(), "inc-old".to_string()]);
    }

    #[test]
    fn record_and_step_output_share_one_read() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir);
        store.insert(&record("inc-snap")).expect("insert");

        let (loaded, output) = store.get_with_step("inc-snap", "summary").expect("read");
        assert_eq!(loaded.id, "inc-snap");
        assert_eq!(output, None);

        let update = RecordUpdate::default()
            .message(Message::assistant("summary posted", Utc::now()))
            .step_output("summary", serde_json::json!({ "done": true }));
        store.apply("inc-snap", &update).expect("apply");

        let (loaded, output) = store.get_with_step("inc-snap", "summary").expect("read");
        assert_eq!(loaded.history.len(), 1);
        assert_eq!(output, Some(serde_json::json!({ "done": true })));
        assert!(matches!(
            store.get_with_step("inc-nope", "summary"),
            Err(IncidentError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn blocking_runs_store_work_off_the_runtime() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir);
        store.insert(&record("inc-blk")).expect("insert");

        let title = store
            .blocking(|store| store.get("inc-blk").map(|r| r.title))
            .await
            .expect("blocking read");
        assert_eq!(title, "API latency");
        assert!(matches!(
            store.blocking(|store| store.get("inc-nope")).await,
            Err(IncidentError::NotFound { .. })
        ));
    }
}
