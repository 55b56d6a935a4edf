//! Persistent cron/one-shot task engine.
//!
//! Schedules live in SQLite and are executed by a single loop that wakes at
//! every top-of-minute mark. Repeating schedules use standard 5-field cron
//! expressions evaluated in local time.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Local};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::storage::{Database, StorageError};
use shared::rpc::ExposedCall;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("{0}")]
    Storage(#[from] StorageError),

    #[error("invalid schedule: {0}")]
    Validation(String),

    #[error("schedule execution failed: {0}")]
    Execution(String),
}

fn validation(message: impl Into<String>) -> SchedulerError {
    SchedulerError::Validation(message.into())
}

/// The actions a schedule can trigger. Implemented by the system wiring so
/// the scheduler stays decoupled from the gateway and plugin host.
pub trait ScheduleExecutor: Send + Sync + 'static {
    fn do_group_action(
        &self,
        group_action_id: u8,
    ) -> impl Future<Output = Result<(), SchedulerError>> + Send;

    fn do_basic_action(
        &self,
        action_type: u8,
        action_number: u8,
    ) -> impl Future<Output = Result<(), SchedulerError>> + Send;

    fn do_local_api_call(
        &self,
        name: &str,
        parameters: &serde_json::Map<String, Value>,
    ) -> impl Future<Output = Result<(), SchedulerError>> + Send;

    /// Look up a plugin-exposed call for LOCAL_API validation.
    fn local_api_call(&self, name: &str) -> Option<ExposedCall>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleType {
    GroupAction,
    BasicAction,
    LocalApi,
}

impl ScheduleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleType::GroupAction => "GROUP_ACTION",
            ScheduleType::BasicAction => "BASIC_ACTION",
            ScheduleType::LocalApi => "LOCAL_API",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "GROUP_ACTION" => Some(ScheduleType::GroupAction),
            "BASIC_ACTION" => Some(ScheduleType::BasicAction),
            "LOCAL_API" => Some(ScheduleType::LocalApi),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleStatus {
    Active,
    Completed,
}

impl ScheduleStatus {
    fn as_str(&self) -> &'static str {
        match self {
            ScheduleStatus::Active => "ACTIVE",
            ScheduleStatus::Completed => "COMPLETED",
        }
    }

    fn parse(value: &str) -> Self {
        if value == "COMPLETED" {
            ScheduleStatus::Completed
        } else {
            ScheduleStatus::Active
        }
    }
}

#[derive(Debug, Clone)]
pub struct Schedule {
    pub id: i64,
    pub name: String,
    /// Epoch seconds of the first (or only) execution.
    pub start: i64,
    /// Standard 5-field cron expression, None for one-shot schedules.
    pub repeat: Option<String>,
    pub duration: Option<i64>,
    /// Offset in seconds after `start` when a repeating schedule retires.
    pub end: Option<i64>,
    pub schedule_type: ScheduleType,
    pub arguments: Option<Value>,
    pub status: ScheduleStatus,
    pub last_executed: Option<i64>,
    pub next_execution: Option<i64>,
}

/// The `cron` crate wants a seconds field; schedules store standard 5-field
/// expressions.
fn parse_cron(repeat: &str) -> Option<cron::Schedule> {
    cron::Schedule::from_str(&format!("0 {repeat}")).ok()
}

fn next_cron_timestamp(repeat: &str, after: DateTime<Local>) -> Option<i64> {
    parse_cron(repeat)?.after(&after).next().map(|at| at.timestamp())
}

impl Schedule {
    /// Whether this schedule should fire now. For repeating schedules the
    /// first call only records the upcoming execution time; later calls
    /// fire once that recorded time has passed and advance it.
    pub fn is_due(&mut self, now: DateTime<Local>) -> bool {
        if self.status != ScheduleStatus::Active {
            return false;
        }

        let Some(repeat) = self.repeat.clone() else {
            // Single-run schedules fire on the first tick at or after start.
            return self.last_executed.is_none() && self.start <= now.timestamp();
        };

        let Some(upcoming) = next_cron_timestamp(&repeat, now) else {
            warn!("schedule {} has an unparsable repeat {repeat:?}", self.name);
            return false;
        };
        match self.next_execution {
            None => {
                self.next_execution = Some(upcoming);
                false
            }
            Some(previous) if previous < now.timestamp() => {
                self.next_execution = Some(upcoming);
                true
            }
            Some(_) => false,
        }
    }

    pub fn has_ended(&self, now: i64) -> bool {
        match (&self.repeat, self.end) {
            (None, _) => self.last_executed.is_some(),
            (Some(_), Some(end)) => self.start + end < now,
            (Some(_), None) => false,
        }
    }
}

struct Shared<E> {
    db: Database,
    executor: Arc<E>,
    schedules: std::sync::Mutex<HashMap<i64, Schedule>>,
}

pub struct SchedulingController<E: ScheduleExecutor> {
    shared: Arc<Shared<E>>,
    stopped: Arc<AtomicBool>,
}

impl<E: ScheduleExecutor> Clone for SchedulingController<E> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            stopped: self.stopped.clone(),
        }
    }
}

impl<E: ScheduleExecutor> SchedulingController<E> {
    pub async fn new(db: Database, executor: Arc<E>) -> Result<Self, SchedulerError> {
        db.with(|conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS schedules
                 (id INTEGER PRIMARY KEY, name TEXT, start INTEGER, repeat TEXT,
                  duration INTEGER, end INTEGER, type TEXT, arguments TEXT, status TEXT);",
            )
        })
        .await?;

        let controller = Self {
            shared: Arc::new(Shared {
                db,
                executor,
                schedules: std::sync::Mutex::new(HashMap::new()),
            }),
            stopped: Arc::new(AtomicBool::new(false)),
        };
        controller.reload().await?;
        Ok(controller)
    }

    async fn reload(&self) -> Result<(), SchedulerError> {
        let rows = self
            .shared
            .db
            .with(|conn| {
                let mut statement = conn.prepare(
                    "SELECT id, name, start, repeat, duration, end, type, arguments, status
                     FROM schedules;",
                )?;
                let rows = statement
                    .query_map([], |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, Option<String>>(3)?,
                            row.get::<_, Option<i64>>(4)?,
                            row.get::<_, Option<i64>>(5)?,
                            row.get::<_, String>(6)?,
                            row.get::<_, Option<String>>(7)?,
                            row.get::<_, String>(8)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let mut schedules = self.shared.schedules.lock().unwrap();
        for (id, name, start, repeat, duration, end, schedule_type, arguments, status) in rows {
            let Some(schedule_type) = ScheduleType::parse(&schedule_type) else {
                warn!("schedule {name} has unknown type {schedule_type:?}, skipping");
                continue;
            };
            // Keep the runtime bookkeeping of already loaded schedules.
            let (last_executed, next_execution) = schedules
                .get(&id)
                .map(|existing: &Schedule| (existing.last_executed, existing.next_execution))
                .unwrap_or((None, None));
            schedules.insert(
                id,
                Schedule {
                    id,
                    name,
                    start,
                    repeat,
                    duration,
                    end,
                    schedule_type,
                    arguments: arguments.and_then(|raw| serde_json::from_str(&raw).ok()),
                    status: ScheduleStatus::parse(&status),
                    last_executed,
                    next_execution,
                },
            );
        }
        Ok(())
    }

    pub fn schedules(&self) -> Vec<Schedule> {
        self.shared.schedules.lock().unwrap().values().cloned().collect()
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn add_schedule(
        &self,
        name: &str,
        start: i64,
        schedule_type: ScheduleType,
        arguments: Option<Value>,
        repeat: Option<String>,
        duration: Option<i64>,
        end: Option<i64>,
    ) -> Result<(), SchedulerError> {
        self.validate(name, schedule_type, &arguments, &repeat, duration, end)?;

        let name = name.to_string();
        let encoded_arguments = match &arguments {
            Some(arguments) => Some(
                serde_json::to_string(arguments)
                    .map_err(|e| validation(format!("arguments are not serializable: {e}")))?,
            ),
            None => None,
        };
        self.shared
            .db
            .with(move |conn| {
                conn.execute(
                    "INSERT INTO schedules (name, start, repeat, duration, end, type, arguments, status)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8);",
                    rusqlite::params![
                        name,
                        start,
                        repeat,
                        duration,
                        end,
                        schedule_type.as_str(),
                        encoded_arguments,
                        ScheduleStatus::Active.as_str()
                    ],
                )
            })
            .await?;
        self.reload().await
    }

    pub async fn remove_schedule(&self, schedule_id: i64) -> Result<(), SchedulerError> {
        self.shared
            .db
            .with(move |conn| conn.execute("DELETE FROM schedules WHERE id = ?1;", [schedule_id]))
            .await?;
        self.shared.schedules.lock().unwrap().remove(&schedule_id);
        Ok(())
    }

    fn validate(
        &self,
        name: &str,
        schedule_type: ScheduleType,
        arguments: &Option<Value>,
        repeat: &Option<String>,
        duration: Option<i64>,
        end: Option<i64>,
    ) -> Result<(), SchedulerError> {
        if name.trim().is_empty() {
            return Err(validation("a schedule must have a name"));
        }

        match repeat {
            None => {
                if end.is_some() {
                    return Err(validation("no end is allowed for a non-repeated schedule"));
                }
            }
            Some(repeat) => {
                if parse_cron(repeat).is_none() {
                    return Err(validation("repeat should be a cron-style string"));
                }
            }
        }
        if let Some(duration) = duration
            && duration <= 60
        {
            return Err(validation("a duration should be longer than 60 seconds"));
        }

        match schedule_type {
            ScheduleType::GroupAction => {
                if duration.is_some() {
                    return Err(validation("a GROUP_ACTION schedule is a one-time trigger without duration"));
                }
                match arguments {
                    Some(Value::Number(number)) => match number.as_i64() {
                        Some(id) if (1..=254).contains(&id) => {}
                        _ => return Err(validation("GROUP_ACTION arguments must be an id in [1, 254]")),
                    },
                    _ => return Err(validation("GROUP_ACTION arguments must be an integer")),
                }
            }
            ScheduleType::BasicAction => {
                if duration.is_some() {
                    return Err(validation("a BASIC_ACTION schedule is a one-time trigger without duration"));
                }
                let valid = arguments
                    .as_ref()
                    .and_then(Value::as_object)
                    .map(|object| {
                        object.len() == 2
                            && object.get("action_type").is_some_and(Value::is_i64)
                            && object.get("action_number").is_some_and(Value::is_i64)
                    })
                    .unwrap_or(false);
                if !valid {
                    return Err(validation(
                        "BASIC_ACTION arguments must be {action_type, action_number}",
                    ));
                }
            }
            ScheduleType::LocalApi => {
                if duration.is_some() {
                    return Err(validation("a LOCAL_API schedule is a one-time trigger without duration"));
                }
                let Some(object) = arguments.as_ref().and_then(Value::as_object) else {
                    return Err(validation("LOCAL_API arguments must be {name, parameters}"));
                };
                let (Some(call_name), Some(parameters)) = (
                    object.get("name").and_then(Value::as_str),
                    object.get("parameters").and_then(Value::as_object),
                ) else {
                    return Err(validation("LOCAL_API arguments must be {name, parameters}"));
                };

                let Some(call) = self.shared.executor.local_api_call(call_name) else {
                    return Err(validation(format!("{call_name} is not an exposed call")));
                };
                if let Some(check) = &call.check {
                    for (parameter, expected) in check {
                        match parameters.get(parameter) {
                            Some(value) if expected.matches(value) => {}
                            Some(_) => {
                                return Err(validation(format!(
                                    "parameter {parameter} has the wrong type"
                                )));
                            }
                            None => {
                                return Err(validation(format!("parameter {parameter} is missing")));
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Run one scheduler round: fire everything that is due.
    pub async fn tick(&self) {
        let due: Vec<Schedule> = {
            let now = Local::now();
            let mut schedules = self.shared.schedules.lock().unwrap();
            let mut due = Vec::new();
            for schedule in schedules.values_mut() {
                if schedule.is_due(now) {
                    due.push(schedule.clone());
                }
            }
            due
        };

        for schedule in due {
            let shared = self.shared.clone();
            tokio::spawn(async move {
                execute_schedule(&shared, schedule).await;
            });
        }
    }

    pub fn start(&self) {
        let controller = self.clone();
        tokio::spawn(async move {
            while !controller.stopped.load(Ordering::SeqCst) {
                controller.tick().await;
                tokio::time::sleep(sleep_to_next_minute()).await;
            }
        });
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

async fn execute_schedule<E: ScheduleExecutor>(shared: &Shared<E>, schedule: Schedule) {
    info!(
        "executing schedule '{}' ({}) with arguments {:?}",
        schedule.name,
        schedule.schedule_type.as_str(),
        schedule.arguments
    );

    let result = match schedule.schedule_type {
        ScheduleType::GroupAction => {
            let id = schedule
                .arguments
                .as_ref()
                .and_then(Value::as_i64)
                .unwrap_or_default() as u8;
            shared.executor.do_group_action(id).await
        }
        ScheduleType::BasicAction => {
            let arguments = schedule.arguments.as_ref().and_then(Value::as_object);
            let action_type = arguments
                .and_then(|o| o.get("action_type"))
                .and_then(Value::as_i64)
                .unwrap_or_default() as u8;
            let action_number = arguments
                .and_then(|o| o.get("action_number"))
                .and_then(Value::as_i64)
                .unwrap_or_default() as u8;
            shared.executor.do_basic_action(action_type, action_number).await
        }
        ScheduleType::LocalApi => {
            let arguments = schedule.arguments.as_ref().and_then(Value::as_object);
            let name = arguments
                .and_then(|o| o.get("name"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let parameters = arguments
                .and_then(|o| o.get("parameters"))
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            shared.executor.do_local_api_call(&name, &parameters).await
        }
    };
    if let Err(error) = &result {
        error!("schedule '{}' failed: {error}", schedule.name);
    }

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    let completed = {
        let mut schedules = shared.schedules.lock().unwrap();
        match schedules.get_mut(&schedule.id) {
            Some(stored) => {
                stored.last_executed = Some(now);
                if stored.has_ended(now) {
                    stored.status = ScheduleStatus::Completed;
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    };

    if completed {
        let result = shared
            .db
            .with(move |conn| {
                conn.execute(
                    "UPDATE schedules SET status = ?1 WHERE id = ?2;",
                    rusqlite::params![ScheduleStatus::Completed.as_str(), schedule.id],
                )
            })
            .await;
        if let Err(error) = result {
            error!("could not mark schedule {} as completed: {error}", schedule.id);
        }
    }
}

/// Time until the next top-of-minute mark. By construction never negative,
/// even right at the boundary.
pub fn sleep_to_next_minute() -> Duration {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    let into_minute = Duration::new(now.as_secs() % 60, now.subsec_nanos());
    Duration::from_secs(60).saturating_sub(into_minute)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap as StdHashMap;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Group(u8),
        Basic(u8, u8),
        LocalApi(String, serde_json::Map<String, Value>),
    }

    struct TestExecutor {
        calls: std::sync::Mutex<Vec<Call>>,
        exposed: StdHashMap<String, ExposedCall>,
    }

    impl TestExecutor {
        fn new() -> Self {
            let mut exposed = StdHashMap::new();
            exposed.insert(
                "set_output".to_string(),
                ExposedCall {
                    name: "set_output".to_string(),
                    auth: true,
                    content_type: "application/json".to_string(),
                    check: Some(StdHashMap::from([
                        ("output_nr".to_string(), shared::rpc::ParamType::Int),
                        ("on".to_string(), shared::rpc::ParamType::Bool),
                    ])),
                },
            );
            Self {
                calls: std::sync::Mutex::new(Vec::new()),
                exposed,
            }
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ScheduleExecutor for TestExecutor {
        async fn do_group_action(&self, group_action_id: u8) -> Result<(), SchedulerError> {
            self.calls.lock().unwrap().push(Call::Group(group_action_id));
            Ok(())
        }

        async fn do_basic_action(
            &self,
            action_type: u8,
            action_number: u8,
        ) -> Result<(), SchedulerError> {
            self.calls.lock().unwrap().push(Call::Basic(action_type, action_number));
            Ok(())
        }

        async fn do_local_api_call(
            &self,
            name: &str,
            parameters: &serde_json::Map<String, Value>,
        ) -> Result<(), SchedulerError> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::LocalApi(name.to_string(), parameters.clone()));
            Ok(())
        }

        fn local_api_call(&self, name: &str) -> Option<ExposedCall> {
            self.exposed.get(name).cloned()
        }
    }

    async fn controller() -> (Arc<TestExecutor>, SchedulingController<TestExecutor>) {
        let executor = Arc::new(TestExecutor::new());
        let controller = SchedulingController::new(Database::open_in_memory().unwrap(), executor.clone())
            .await
            .unwrap();
        (executor, controller)
    }

    fn now_epoch() -> i64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64
    }

    #[tokio::test]
    async fn validation_rejects_bad_schedules() {
        let (_executor, controller) = controller().await;

        let cases: Vec<(&str, ScheduleType, Option<Value>, Option<String>, Option<i64>, Option<i64>)> = vec![
            ("", ScheduleType::GroupAction, Some(json!(1)), None, None, None),
            ("end without repeat", ScheduleType::GroupAction, Some(json!(1)), None, None, Some(100)),
            ("bad cron", ScheduleType::GroupAction, Some(json!(1)), Some("not cron".into()), None, None),
            ("short duration", ScheduleType::LocalApi, None, None, Some(30), None),
            ("group action range", ScheduleType::GroupAction, Some(json!(255)), None, None, None),
            ("group action type", ScheduleType::GroupAction, Some(json!("one")), None, None, None),
            ("basic action keys", ScheduleType::BasicAction, Some(json!({"action_type": 3})), None, None, None),
            ("basic action extras", ScheduleType::BasicAction,
             Some(json!({"action_type": 3, "action_number": 4, "more": 5})), None, None, None),
            ("unknown call", ScheduleType::LocalApi,
             Some(json!({"name": "bogus", "parameters": {}})), None, None, None),
            ("missing parameter", ScheduleType::LocalApi,
             Some(json!({"name": "set_output", "parameters": {"output_nr": 3}})), None, None, None),
            ("wrong parameter type", ScheduleType::LocalApi,
             Some(json!({"name": "set_output", "parameters": {"output_nr": 3, "on": "yes"}})), None, None, None),
        ];

        for (name, schedule_type, arguments, repeat, duration, end) in cases {
            let result = controller
                .add_schedule(name, now_epoch(), schedule_type, arguments, repeat, duration, end)
                .await;
            assert!(result.is_err(), "case {name:?} should be rejected");
        }
        assert!(controller.schedules().is_empty());
    }

    #[tokio::test]
    async fn valid_schedules_are_accepted_and_persisted() {
        let (executor, controller) = controller().await;

        controller
            .add_schedule("nightly", now_epoch(), ScheduleType::GroupAction, Some(json!(4)),
                          Some("0 2 * * *".into()), None, Some(86400 * 30))
            .await
            .unwrap();
        controller
            .add_schedule(
                "api call",
                now_epoch(),
                ScheduleType::LocalApi,
                Some(json!({"name": "set_output", "parameters": {"output_nr": 3, "on": true}})),
                None,
                None,
                None,
            )
            .await
            .unwrap();

        assert_eq!(controller.schedules().len(), 2);

        // A fresh controller sees the same rows.
        let reloaded = SchedulingController::new(
            {
                // Same database file semantics need a shared handle; reuse
                // the existing one through the controller's shared state.
                controller.shared.db.clone()
            },
            executor.clone(),
        )
        .await
        .unwrap();
        assert_eq!(reloaded.schedules().len(), 2);
    }

    #[tokio::test]
    async fn one_shot_group_action_fires_once_then_completes() {
        let (executor, controller) = controller().await;
        controller
            .add_schedule("fire once", now_epoch() - 1, ScheduleType::GroupAction,
                          Some(json!(4)), None, None, None)
            .await
            .unwrap();

        controller.tick().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(executor.calls(), vec![Call::Group(4)]);

        let schedule = &controller.schedules()[0];
        assert_eq!(schedule.status, ScheduleStatus::Completed);
        assert!(schedule.last_executed.is_some());

        // A second round must not fire again.
        controller.tick().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(executor.calls(), vec![Call::Group(4)]);
    }

    #[tokio::test]
    async fn future_one_shots_wait_for_their_start() {
        let (executor, controller) = controller().await;
        controller
            .add_schedule("later", now_epoch() + 3600, ScheduleType::BasicAction,
                          Some(json!({"action_type": 3, "action_number": 4})), None, None, None)
            .await
            .unwrap();

        controller.tick().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(executor.calls().is_empty());
        assert_eq!(controller.schedules()[0].status, ScheduleStatus::Active);
    }

    #[tokio::test]
    async fn local_api_schedules_reach_the_executor() {
        let (executor, controller) = controller().await;
        controller
            .add_schedule(
                "api call",
                now_epoch() - 1,
                ScheduleType::LocalApi,
                Some(json!({"name": "set_output", "parameters": {"output_nr": 3, "on": true}})),
                None,
                None,
                None,
            )
            .await
            .unwrap();

        controller.tick().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let calls = executor.calls();
        assert_eq!(calls.len(), 1);
        match &calls[0] {
            Call::LocalApi(name, parameters) => {
                assert_eq!(name, "set_output");
                assert_eq!(parameters.get("output_nr"), Some(&json!(3)));
            }
            other => panic!("unexpected call {other:?}"),
        }
    }

    #[test]
    fn repeating_schedules_record_then_fire() {
        let mut schedule = Schedule {
            id: 1,
            name: "every minute".to_string(),
            start: 0,
            repeat: Some("*/1 * * * *".to_string()),
            duration: None,
            end: None,
            schedule_type: ScheduleType::BasicAction,
            arguments: None,
            status: ScheduleStatus::Active,
            last_executed: None,
            next_execution: None,
        };

        let now = Local::now();
        // First evaluation records the upcoming minute mark.
        assert!(!schedule.is_due(now));
        let first = schedule.next_execution.unwrap();
        assert!(first > now.timestamp());

        // Two minutes later that recorded mark has passed.
        let later = now + chrono::Duration::seconds(120);
        assert!(schedule.is_due(later));
        assert!(schedule.next_execution.unwrap() > first);
    }

    #[test]
    fn completed_schedules_are_never_due() {
        let mut schedule = Schedule {
            id: 1,
            name: "done".to_string(),
            start: 0,
            repeat: None,
            duration: None,
            end: None,
            schedule_type: ScheduleType::GroupAction,
            arguments: Some(json!(1)),
            status: ScheduleStatus::Completed,
            last_executed: None,
            next_execution: None,
        };
        assert!(!schedule.is_due(Local::now()));
    }

    #[test]
    fn repeating_schedules_end_after_their_window() {
        let schedule = Schedule {
            id: 1,
            name: "windowed".to_string(),
            start: 1000,
            repeat: Some("*/1 * * * *".to_string()),
            duration: None,
            end: Some(600),
            schedule_type: ScheduleType::GroupAction,
            arguments: Some(json!(1)),
            status: ScheduleStatus::Active,
            last_executed: None,
            next_execution: None,
        };
        assert!(!schedule.has_ended(1500));
        assert!(schedule.has_ended(1601));
    }

    #[test]
    fn sleep_to_next_minute_is_bounded() {
        let delay = sleep_to_next_minute();
        assert!(delay <= Duration::from_secs(60));
        assert!(delay > Duration::ZERO);
    }
}
