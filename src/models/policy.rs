use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use super::validators::{IDENTIFIER_REGEX, validate_windows};

/// Prefix of every archive table created in a destination database.
pub const ARCHIVE_TABLE_PREFIX: &str = "archive_";

/// Actor tag written to the `archived_by` bookkeeping column.
pub const ARCHIVED_BY_TAG: &str = "DAS";

/// Name of the archive table that mirrors `table` in the destination database.
pub fn archive_table_name(table: &str) -> String {
    format!("{ARCHIVE_TABLE_PREFIX}{table}")
}

/// Database engine family a connection descriptor points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseFamily {
    #[default]
    Mysql,
    Postgres,
    Sqlite,
}

impl DatabaseFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseFamily::Mysql => "mysql",
            DatabaseFamily::Postgres => "postgres",
            DatabaseFamily::Sqlite => "sqlite",
        }
    }

    /// Conventional server port; SQLite has none.
    pub fn default_port(&self) -> u16 {
        match self {
            DatabaseFamily::Mysql => 3306,
            DatabaseFamily::Postgres => 5432,
            DatabaseFamily::Sqlite => 0,
        }
    }

    /// Cargo feature that compiles support for this family in.
    pub fn feature(&self) -> &'static str {
        match self {
            DatabaseFamily::Mysql => "database-mysql",
            DatabaseFamily::Postgres => "database-postgres",
            DatabaseFamily::Sqlite => "database-sqlite",
        }
    }

    /// Whether support for this family was compiled into this build.
    pub fn is_compiled(&self) -> bool {
        match self {
            DatabaseFamily::Mysql => cfg!(feature = "database-mysql"),
            DatabaseFamily::Postgres => cfg!(feature = "database-postgres"),
            DatabaseFamily::Sqlite => cfg!(feature = "database-sqlite"),
        }
    }
}

impl std::fmt::Display for DatabaseFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DatabaseFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mysql" | "mariadb" => Ok(DatabaseFamily::Mysql),
            "postgres" | "postgresql" => Ok(DatabaseFamily::Postgres),
            "sqlite" => Ok(DatabaseFamily::Sqlite),
            _ => Err(format!("Invalid database type: {}", s)),
        }
    }
}

/// Where a database lives and how to log into it.
///
/// Credentials arrive already decrypted; encryption at rest is handled by the
/// configuration service that owns the policy table. For SQLite, `database`
/// is the file path and the network fields are ignored.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionDescriptor {
    #[serde(rename = "type", default)]
    pub family: DatabaseFamily,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    pub database: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
}

impl ConnectionDescriptor {
    /// Descriptor for a SQLite database file.
    pub fn sqlite(path: impl Into<String>) -> Self {
        Self {
            family: DatabaseFamily::Sqlite,
            host: String::new(),
            port: 0,
            database: path.into(),
            user: String::new(),
            password: String::new(),
        }
    }

    /// Human-readable location without credentials, for logs.
    pub fn location(&self) -> String {
        match self.family {
            DatabaseFamily::Sqlite => format!("sqlite:{}", self.database),
            family => format!("{}://{}:{}/{}", family, self.host, self.port, self.database),
        }
    }
}

// Manual impl so passwords never reach logs.
impl std::fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("family", &self.family)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Per-table retention policy.
///
/// Rows of `table_name` in the source database whose `date_column` is older
/// than `archival_days` are moved to `archive_<table_name>` in the destination
/// database; archived rows older than `deletion_days` are purged from there.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub id: i64,
    pub source: ConnectionDescriptor,
    pub destination: ConnectionDescriptor,
    pub table_name: String,
    pub date_column: String,
    pub archival_days: u32,
    pub deletion_days: u32,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl RetentionPolicy {
    pub fn archive_table(&self) -> String {
        archive_table_name(&self.table_name)
    }

    pub fn archival_age(&self) -> Duration {
        Duration::days(i64::from(self.archival_days))
    }

    pub fn deletion_age(&self) -> Duration {
        Duration::days(i64::from(self.deletion_days))
    }
}

/// Input for creating a retention policy.
#[derive(Debug, Clone, Deserialize, Validate)]
#[validate(schema(function = "validate_create_windows"))]
pub struct CreateRetentionPolicy {
    pub source: ConnectionDescriptor,
    pub destination: ConnectionDescriptor,
    #[validate(length(min = 1, max = 55), regex(path = *IDENTIFIER_REGEX))]
    pub table_name: String,
    #[validate(length(min = 1, max = 55), regex(path = *IDENTIFIER_REGEX))]
    #[serde(default = "default_date_column")]
    pub date_column: String,
    #[serde(default = "default_archival_days")]
    pub archival_days: u32,
    #[serde(default = "default_deletion_days")]
    pub deletion_days: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn validate_create_windows(input: &CreateRetentionPolicy) -> Result<(), ValidationError> {
    validate_windows(input.archival_days, input.deletion_days)
}

fn default_date_column() -> String {
    "created_at".to_string()
}

fn default_archival_days() -> u32 {
    180
}

fn default_deletion_days() -> u32 {
    730 // 2 years
}

fn default_enabled() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mysql(database: &str) -> ConnectionDescriptor {
        ConnectionDescriptor {
            family: DatabaseFamily::Mysql,
            host: "db.internal".to_string(),
            port: 3306,
            database: database.to_string(),
            user: "archiver".to_string(),
            password: "hunter2".to_string(),
        }
    }

    fn create_input(table: &str, archival_days: u32, deletion_days: u32) -> CreateRetentionPolicy {
        CreateRetentionPolicy {
            source: mysql("shop"),
            destination: mysql("shop_archive"),
            table_name: table.to_string(),
            date_column: "created_at".to_string(),
            archival_days,
            deletion_days,
            enabled: true,
        }
    }

    #[test]
    fn test_archive_table_name() {
        assert_eq!(archive_table_name("orders"), "archive_orders");
    }

    #[test]
    fn test_debug_redacts_password() {
        let rendered = format!("{:?}", mysql("shop"));
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_location_omits_credentials() {
        assert_eq!(mysql("shop").location(), "mysql://db.internal:3306/shop");
        assert_eq!(
            ConnectionDescriptor::sqlite("/var/lib/das/archive.db").location(),
            "sqlite:/var/lib/das/archive.db"
        );
    }

    #[test]
    fn test_family_round_trip() {
        for family in [
            DatabaseFamily::Mysql,
            DatabaseFamily::Postgres,
            DatabaseFamily::Sqlite,
        ] {
            assert_eq!(family.as_str().parse::<DatabaseFamily>().unwrap(), family);
        }
        assert_eq!(
            "mariadb".parse::<DatabaseFamily>().unwrap(),
            DatabaseFamily::Mysql
        );
        assert!("oracle".parse::<DatabaseFamily>().is_err());
    }

    #[test]
    fn test_create_validation() {
        assert!(create_input("orders", 180, 730).validate().is_ok());
        assert!(create_input("orders", 730, 180).validate().is_err());
        assert!(create_input("orders; --", 180, 730).validate().is_err());
        assert!(create_input("", 180, 730).validate().is_err());
    }

    #[test]
    fn test_identifier_length_limit() {
        use crate::models::MAX_IDENTIFIER_LENGTH;

        let longest = "t".repeat(MAX_IDENTIFIER_LENGTH);
        assert!(create_input(&longest, 180, 730).validate().is_ok());
        let too_long = "t".repeat(MAX_IDENTIFIER_LENGTH + 1);
        assert!(create_input(&too_long, 180, 730).validate().is_err());
    }

    #[test]
    fn test_descriptor_from_toml() {
        let descriptor: ConnectionDescriptor = toml::from_str(
            r#"
            type = "postgres"
            host = "orchestrator"
            port = 5432
            database = "das"
            user = "das"
            password = "secret"
        "#,
        )
        .unwrap();
        assert_eq!(descriptor.family, DatabaseFamily::Postgres);
        assert_eq!(descriptor.database, "das");
    }
}
