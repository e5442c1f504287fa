//! The parameter bundle handed to every unit through its environment.

use std::{str::FromStr, time::Duration};

use thiserror::Error;

use crate::{
    models::{
        ConnectionDescriptor, DatabaseFamily, JobType, RetentionPolicy, is_valid_identifier,
        validate_windows,
    },
    retention::TableJob,
};

pub const JOB_TYPE: &str = "JOB_TYPE";
pub const JOB_EXECUTION_ID: &str = "JOB_EXECUTION_ID";
pub const CONFIG_ID: &str = "CONFIG_ID";
pub const TABLE_NAME: &str = "TABLE_NAME";
pub const DATE_COLUMN: &str = "DATE_COLUMN";
pub const ARCHIVAL_DAYS: &str = "ARCHIVAL_DAYS";
pub const DELETION_DAYS: &str = "DELETION_DAYS";
pub const BATCH_SIZE: &str = "BATCH_SIZE";
pub const CONNECT_TIMEOUT_SECS: &str = "CONNECT_TIMEOUT_SECS";

pub const PRIMARY_DB: &str = "PRIMARY_DB";
pub const ARCHIVAL_DB: &str = "ARCHIVAL_DB";
pub const ORCHESTRATOR_DB: &str = "ORCHESTRATOR_DB";

const DESCRIPTOR_FIELDS: [&str; 6] = ["TYPE", "HOST", "PORT", "NAME", "USER", "PASSWORD"];

const DEFAULT_BATCH_SIZE: u32 = 1000;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParamsError {
    #[error("Missing required parameter {0}")]
    Missing(String),

    #[error("Invalid value for {key}: {message}")]
    Invalid { key: String, message: String },
}

impl ParamsError {
    fn invalid(key: &str, message: impl Into<String>) -> Self {
        ParamsError::Invalid {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

/// Settings every unit receives regardless of its policy.
#[derive(Debug, Clone)]
pub struct UnitContext {
    /// Where units report their outcome. `None` leaves records for
    /// stale-execution reconciliation.
    pub orchestrator: Option<ConnectionDescriptor>,
    pub batch_size: u32,
    pub connect_timeout_secs: u64,
}

/// Everything one unit needs to run, and nothing else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerParams {
    pub job_type: JobType,
    /// Execution record to report into; `None` runs without a status write.
    pub execution_id: Option<i64>,
    /// Policy id, for labeling only.
    pub config_id: i64,
    /// Source database. Only archival units receive it.
    pub source: Option<ConnectionDescriptor>,
    pub destination: ConnectionDescriptor,
    pub job: TableJob,
    pub connect_timeout_secs: u64,
    pub orchestrator: Option<ConnectionDescriptor>,
}

impl WorkerParams {
    pub fn for_policy(
        policy: &RetentionPolicy,
        job_type: JobType,
        execution_id: Option<i64>,
        context: &UnitContext,
    ) -> Self {
        // A purge unit never touches the primary database, so it does not get
        // its credentials.
        let source = match job_type {
            JobType::Archival => Some(policy.source.clone()),
            JobType::Purge => None,
        };

        Self {
            job_type,
            execution_id,
            config_id: policy.id,
            source,
            destination: policy.destination.clone(),
            job: TableJob {
                table_name: policy.table_name.clone(),
                date_column: policy.date_column.clone(),
                archival_days: policy.archival_days,
                deletion_days: policy.deletion_days,
                batch_size: context.batch_size,
            },
            connect_timeout_secs: context.connect_timeout_secs,
            orchestrator: context.orchestrator.clone(),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Every variable name a bundle may set, so launchers can clear values
    /// inherited from their own environment.
    pub fn all_keys() -> Vec<String> {
        let mut keys: Vec<String> = [
            JOB_TYPE,
            JOB_EXECUTION_ID,
            CONFIG_ID,
            TABLE_NAME,
            DATE_COLUMN,
            ARCHIVAL_DAYS,
            DELETION_DAYS,
            BATCH_SIZE,
            CONNECT_TIMEOUT_SECS,
        ]
        .iter()
        .map(|k| k.to_string())
        .collect();
        for prefix in [PRIMARY_DB, ARCHIVAL_DB, ORCHESTRATOR_DB] {
            keys.extend(DESCRIPTOR_FIELDS.iter().map(|f| format!("{prefix}_{f}")));
        }
        keys
    }

    /// Render the bundle as environment variables.
    pub fn to_env(&self) -> Vec<(String, String)> {
        let mut env = vec![
            (JOB_TYPE.to_string(), self.job_type.to_string()),
            (CONFIG_ID.to_string(), self.config_id.to_string()),
            (TABLE_NAME.to_string(), self.job.table_name.clone()),
            (DATE_COLUMN.to_string(), self.job.date_column.clone()),
            (ARCHIVAL_DAYS.to_string(), self.job.archival_days.to_string()),
            (DELETION_DAYS.to_string(), self.job.deletion_days.to_string()),
            (BATCH_SIZE.to_string(), self.job.batch_size.to_string()),
            (
                CONNECT_TIMEOUT_SECS.to_string(),
                self.connect_timeout_secs.to_string(),
            ),
        ];
        if let Some(id) = self.execution_id {
            env.push((JOB_EXECUTION_ID.to_string(), id.to_string()));
        }
        if let Some(source) = &self.source {
            push_descriptor(&mut env, PRIMARY_DB, source);
        }
        push_descriptor(&mut env, ARCHIVAL_DB, &self.destination);
        if let Some(orchestrator) = &self.orchestrator {
            push_descriptor(&mut env, ORCHESTRATOR_DB, orchestrator);
        }
        env
    }

    /// Parse and validate a bundle. Identifiers are checked here, before any
    /// SQL is built from them.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ParamsError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let job_type: JobType = parse_required(&get, JOB_TYPE)?;
        let execution_id = execution_id(&get)?;
        let config_id: i64 = parse_optional(&get, CONFIG_ID)?.unwrap_or(0);

        let table_name = get(TABLE_NAME).ok_or_else(|| ParamsError::Missing(TABLE_NAME.into()))?;
        let date_column = get(DATE_COLUMN).unwrap_or_else(|| "created_at".to_string());
        for (key, value) in [(TABLE_NAME, &table_name), (DATE_COLUMN, &date_column)] {
            if !is_valid_identifier(value) {
                return Err(ParamsError::invalid(key, "not a valid SQL identifier"));
            }
        }

        let archival_days: u32 = parse_required(&get, ARCHIVAL_DAYS)?;
        let deletion_days: u32 = parse_required(&get, DELETION_DAYS)?;
        validate_windows(archival_days, deletion_days).map_err(|e| {
            ParamsError::invalid(
                DELETION_DAYS,
                e.message
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| e.code.to_string()),
            )
        })?;

        let batch_size = parse_optional(&get, BATCH_SIZE)?.unwrap_or(DEFAULT_BATCH_SIZE);
        if batch_size == 0 {
            return Err(ParamsError::invalid(BATCH_SIZE, "must be at least 1"));
        }
        let connect_timeout_secs = parse_optional(&get, CONNECT_TIMEOUT_SECS)?
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS);

        let source = descriptor(&get, PRIMARY_DB)?;
        if job_type == JobType::Archival && source.is_none() {
            return Err(ParamsError::Missing(format!("{PRIMARY_DB}_NAME")));
        }
        let destination = descriptor(&get, ARCHIVAL_DB)?
            .ok_or_else(|| ParamsError::Missing(format!("{ARCHIVAL_DB}_NAME")))?;
        let orchestrator = descriptor(&get, ORCHESTRATOR_DB)?;

        Ok(Self {
            job_type,
            execution_id,
            config_id,
            source,
            destination,
            job: TableJob {
                table_name,
                date_column,
                archival_days,
                deletion_days,
                batch_size,
            },
            connect_timeout_secs,
            orchestrator,
        })
    }

    /// Where to report, if the bundle says so. Works on bundles that fail full
    /// validation, so a malformed unit can still record its failure.
    pub fn report_target(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Option<(i64, ConnectionDescriptor)> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let id = execution_id(&get).ok().flatten()?;
        let orchestrator = descriptor(&get, ORCHESTRATOR_DB).ok().flatten()?;
        Some((id, orchestrator))
    }
}

fn push_descriptor(env: &mut Vec<(String, String)>, prefix: &str, d: &ConnectionDescriptor) {
    env.push((format!("{prefix}_TYPE"), d.family.to_string()));
    env.push((format!("{prefix}_HOST"), d.host.clone()));
    env.push((format!("{prefix}_PORT"), d.port.to_string()));
    env.push((format!("{prefix}_NAME"), d.database.clone()));
    env.push((format!("{prefix}_USER"), d.user.clone()));
    env.push((format!("{prefix}_PASSWORD"), d.password.clone()));
}

/// A descriptor is present when its `_NAME` variable is set.
fn descriptor(
    get: &impl Fn(&str) -> Option<String>,
    prefix: &str,
) -> Result<Option<ConnectionDescriptor>, ParamsError> {
    let Some(database) = get(&format!("{prefix}_NAME")) else {
        return Ok(None);
    };

    let family: DatabaseFamily =
        parse_optional(get, &format!("{prefix}_TYPE"))?.unwrap_or_default();
    let port: u16 = parse_optional(get, &format!("{prefix}_PORT"))?
        .unwrap_or_else(|| family.default_port());

    Ok(Some(ConnectionDescriptor {
        family,
        host: get(&format!("{prefix}_HOST")).unwrap_or_default(),
        port,
        database,
        user: get(&format!("{prefix}_USER")).unwrap_or_default(),
        password: get(&format!("{prefix}_PASSWORD")).unwrap_or_default(),
    }))
}

/// `0` means "no record", matching launchers that always set the variable.
fn execution_id(get: &impl Fn(&str) -> Option<String>) -> Result<Option<i64>, ParamsError> {
    Ok(parse_optional::<i64>(get, JOB_EXECUTION_ID)?.filter(|id| *id > 0))
}

fn parse_optional<T>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ParamsError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| ParamsError::invalid(key, e.to_string()))
        })
        .transpose()
}

fn parse_required<T>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<T, ParamsError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    parse_optional(get, key)?.ok_or_else(|| ParamsError::Missing(key.to_string()))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::Utc;

    use super::*;

    fn mysql(database: &str, password: &str) -> ConnectionDescriptor {
        ConnectionDescriptor {
            family: DatabaseFamily::Mysql,
            host: "db".into(),
            port: 3306,
            database: database.into(),
            user: "das".into(),
            password: password.into(),
        }
    }

    fn policy() -> RetentionPolicy {
        RetentionPolicy {
            id: 7,
            source: mysql("shop", "primary-secret"),
            destination: mysql("shop_archive", "archive-secret"),
            table_name: "orders".into(),
            date_column: "placed_at".into(),
            archival_days: 90,
            deletion_days: 365,
            enabled: true,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    fn context() -> UnitContext {
        UnitContext {
            orchestrator: Some(ConnectionDescriptor::sqlite("/var/lib/das/das.db")),
            batch_size: 500,
            connect_timeout_secs: 15,
        }
    }

    fn as_map(params: &WorkerParams) -> HashMap<String, String> {
        params.to_env().into_iter().collect()
    }

    fn parse(env: &HashMap<String, String>) -> Result<WorkerParams, ParamsError> {
        WorkerParams::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn test_archival_bundle() {
        let params = WorkerParams::for_policy(&policy(), JobType::Archival, Some(42), &context());
        let env = as_map(&params);

        assert_eq!(env[JOB_TYPE], "archival");
        assert_eq!(env[JOB_EXECUTION_ID], "42");
        assert_eq!(env[CONFIG_ID], "7");
        assert_eq!(env["PRIMARY_DB_PASSWORD"], "primary-secret");
        assert_eq!(env["ARCHIVAL_DB_NAME"], "shop_archive");
        assert_eq!(env["ORCHESTRATOR_DB_TYPE"], "sqlite");
        assert_eq!(env[BATCH_SIZE], "500");

        assert_eq!(parse(&env).unwrap(), params);
    }

    #[test]
    fn test_purge_bundle_omits_primary_credentials() {
        let params = WorkerParams::for_policy(&policy(), JobType::Purge, Some(1), &context());
        let env = as_map(&params);

        assert!(env.keys().all(|k| !k.starts_with(PRIMARY_DB)));
        assert!(!env.values().any(|v| v == "primary-secret"));

        let parsed = parse(&env).unwrap();
        assert_eq!(parsed.source, None);
        assert_eq!(parsed.job_type, JobType::Purge);
    }

    #[test]
    fn test_bundle_keys_are_known() {
        let known = WorkerParams::all_keys();
        let params = WorkerParams::for_policy(&policy(), JobType::Archival, Some(1), &context());
        for (key, _) in params.to_env() {
            assert!(known.contains(&key), "{key} missing from all_keys");
        }
    }

    #[test]
    fn test_defaults_and_missing_execution_id() {
        let env: HashMap<String, String> = [
            (JOB_TYPE, "purge"),
            (JOB_EXECUTION_ID, "0"),
            (TABLE_NAME, "events"),
            (ARCHIVAL_DAYS, "30"),
            (DELETION_DAYS, "60"),
            ("ARCHIVAL_DB_NAME", "archive"),
            ("ARCHIVAL_DB_TYPE", "postgres"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let params = parse(&env).unwrap();
        assert_eq!(params.execution_id, None);
        assert_eq!(params.job.date_column, "created_at");
        assert_eq!(params.job.batch_size, 1000);
        assert_eq!(params.connect_timeout_secs, 10);
        assert_eq!(params.destination.port, 5432);
        assert_eq!(params.orchestrator, None);
    }

    #[test]
    fn test_rejects_malformed_bundles() {
        let base = as_map(&WorkerParams::for_policy(
            &policy(),
            JobType::Archival,
            Some(3),
            &context(),
        ));

        let with = |key: &str, value: &str| {
            let mut env = base.clone();
            env.insert(key.to_string(), value.to_string());
            parse(&env)
        };

        assert!(matches!(
            with(JOB_TYPE, "vacuum"),
            Err(ParamsError::Invalid { .. })
        ));
        assert!(matches!(
            with(TABLE_NAME, "orders; DROP TABLE users"),
            Err(ParamsError::Invalid { .. })
        ));
        assert!(matches!(
            with(DELETION_DAYS, "30"),
            Err(ParamsError::Invalid { .. })
        ));
        assert!(matches!(
            with(BATCH_SIZE, "0"),
            Err(ParamsError::Invalid { .. })
        ));
        assert!(matches!(
            with("PRIMARY_DB_PORT", "not-a-port"),
            Err(ParamsError::Invalid { .. })
        ));

        let mut env = base.clone();
        env.remove("PRIMARY_DB_NAME");
        assert_eq!(
            parse(&env),
            Err(ParamsError::Missing("PRIMARY_DB_NAME".into()))
        );
    }

    #[test]
    fn test_report_target_survives_invalid_bundle() {
        let mut env = as_map(&WorkerParams::for_policy(
            &policy(),
            JobType::Archival,
            Some(9),
            &context(),
        ));
        env.insert(JOB_TYPE.to_string(), "bogus".to_string());

        assert!(parse(&env).is_err());
        let (id, orchestrator) = WorkerParams::report_target(|k| env.get(k).cloned()).unwrap();
        assert_eq!(id, 9);
        assert_eq!(orchestrator.database, "/var/lib/das/das.db");
    }

    #[test]
    fn test_from_process_environment() {
        let vars: Vec<(String, String)> = WorkerParams::for_policy(
            &policy(),
            JobType::Purge,
            Some(5),
            &context(),
        )
        .to_env();
        let vars: Vec<(String, Option<String>)> =
            vars.into_iter().map(|(k, v)| (k, Some(v))).collect();

        temp_env::with_vars(vars, || {
            let params = WorkerParams::from_lookup(|key| std::env::var(key).ok()).unwrap();
            assert_eq!(params.execution_id, Some(5));
            assert_eq!(params.job.table_name, "orders");
        });
    }
}
