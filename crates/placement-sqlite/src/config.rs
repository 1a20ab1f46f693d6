//! Store configuration parsed from the generic property bag.

use std::collections::HashMap;
use std::time::Duration;

use placement::{StoreError, StoreResult};

pub(crate) const DEFAULT_METADATA_TABLE: &str = "dapr_metadata";
pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);
pub(crate) const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(30);

/// Logical tables owned by the store. Physical names are prefix-resolved
/// so multiple stores can share one database file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Table {
    Hosts,
    HostsActorTypes,
    Actors,
    Reminders,
}

impl Table {
    fn suffix(self) -> &'static str {
        match self {
            Table::Hosts => "hosts",
            Table::HostsActorTypes => "hosts_actor_types",
            Table::Actors => "actors",
            Table::Reminders => "reminders",
        }
    }
}

#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Path to the database file.
    pub connection_string: String,
    pub table_prefix: String,
    pub metadata_table: String,
    /// Deadline applied to every store operation.
    pub timeout: Duration,
    /// SQLite busy handler timeout, applied per connection.
    pub busy_timeout: Duration,
    /// Reminder leases older than this are considered lost and become
    /// claimable again.
    pub reminders_lease_duration: Duration,
}

impl StoreConfig {
    pub fn from_properties(properties: &HashMap<String, String>) -> StoreResult<Self> {
        let connection_string = properties
            .get("connectionString")
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        if connection_string.is_empty() {
            return Err(StoreError::InvalidRequest("missing 'connectionString'"));
        }
        // Every operation opens its own connection, so a private in-memory
        // database would give each of them a different empty store.
        if connection_string == ":memory:" {
            return Err(StoreError::InvalidRequest(
                "in-memory databases are not supported, use a file path",
            ));
        }

        let table_prefix = properties.get("tablePrefix").cloned().unwrap_or_default();
        if !table_prefix.is_empty() && !valid_identifier(&table_prefix) {
            return Err(StoreError::InvalidRequest(
                "invalid value for 'tablePrefix': must contain only letters, digits and underscores, and not start with a digit",
            ));
        }

        let metadata_table = properties
            .get("metadataTableName")
            .cloned()
            .unwrap_or_else(|| DEFAULT_METADATA_TABLE.to_string());
        if !valid_identifier(&metadata_table) {
            return Err(StoreError::InvalidRequest(
                "invalid value for 'metadataTableName': not a valid identifier",
            ));
        }

        let timeout = parse_duration_property(properties, "timeout", DEFAULT_TIMEOUT)?;
        if timeout < Duration::from_secs(1) {
            return Err(StoreError::InvalidRequest(
                "invalid value for 'timeout': must be at least 1s",
            ));
        }

        let busy_timeout = parse_duration_property(properties, "busyTimeout", DEFAULT_BUSY_TIMEOUT)?;

        let reminders_lease_duration =
            parse_duration_property(properties, "remindersLeaseDuration", DEFAULT_LEASE_DURATION)?;
        if reminders_lease_duration < Duration::from_secs(1) {
            return Err(StoreError::InvalidRequest(
                "invalid value for 'remindersLeaseDuration': must be at least 1s",
            ));
        }

        Ok(Self {
            connection_string,
            table_prefix,
            metadata_table,
            timeout,
            busy_timeout,
            reminders_lease_duration,
        })
    }

    pub(crate) fn table(&self, table: Table) -> String {
        format!("{}{}", self.table_prefix, table.suffix())
    }
}

fn parse_duration_property(
    properties: &HashMap<String, String>,
    key: &str,
    default: Duration,
) -> StoreResult<Duration> {
    let Some(raw) = properties.get(key) else {
        return Ok(default);
    };
    parse_duration(raw.trim()).ok_or(StoreError::InvalidRequest(
        "invalid duration: expected seconds or a value with a ms/s/m/h suffix",
    ))
}

/// Accepts plain seconds ("30") or a ms/s/m/h suffixed value ("500ms", "2m").
fn parse_duration(s: &str) -> Option<Duration> {
    if s.is_empty() {
        return None;
    }
    let (num, unit): (&str, &str) = match s {
        _ if s.ends_with("ms") => (&s[..s.len() - 2], "ms"),
        _ if s.ends_with('s') => (&s[..s.len() - 1], "s"),
        _ if s.ends_with('m') => (&s[..s.len() - 1], "m"),
        _ if s.ends_with('h') => (&s[..s.len() - 1], "h"),
        _ => (s, "s"),
    };
    let n: u64 = num.parse().ok()?;
    Some(match unit {
        "ms" => Duration::from_millis(n),
        "m" => Duration::from_secs(n * 60),
        "h" => Duration::from_secs(n * 3600),
        _ => Duration::from_secs(n),
    })
}

/// Identifier safety for names interpolated into SQL. Checked once at
/// init, never per query.
fn valid_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults() {
        let cfg = StoreConfig::from_properties(&props(&[("connectionString", "/tmp/actors.db")]))
            .unwrap();
        assert_eq!(cfg.table_prefix, "");
        assert_eq!(cfg.metadata_table, DEFAULT_METADATA_TABLE);
        assert_eq!(cfg.timeout, DEFAULT_TIMEOUT);
        assert_eq!(cfg.busy_timeout, DEFAULT_BUSY_TIMEOUT);
        assert_eq!(cfg.reminders_lease_duration, DEFAULT_LEASE_DURATION);
        assert_eq!(cfg.table(Table::Hosts), "hosts");
        assert_eq!(cfg.table(Table::HostsActorTypes), "hosts_actor_types");
    }

    #[test]
    fn prefix_applied_to_table_names() {
        let cfg = StoreConfig::from_properties(&props(&[
            ("connectionString", "/tmp/actors.db"),
            ("tablePrefix", "app1_"),
        ]))
        .unwrap();
        assert_eq!(cfg.table(Table::Actors), "app1_actors");
        assert_eq!(cfg.table(Table::Reminders), "app1_reminders");
    }

    #[test]
    fn missing_connection_string_rejected() {
        let err = StoreConfig::from_properties(&props(&[])).unwrap_err();
        assert!(matches!(err, StoreError::InvalidRequest(_)));
    }

    #[test]
    fn in_memory_rejected() {
        let err = StoreConfig::from_properties(&props(&[("connectionString", ":memory:")]))
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidRequest(_)));
    }

    #[test]
    fn timeout_below_one_second_rejected() {
        for bad in ["0", "500ms", "0s"] {
            let err = StoreConfig::from_properties(&props(&[
                ("connectionString", "/tmp/actors.db"),
                ("timeout", bad),
            ]))
            .unwrap_err();
            assert!(matches!(err, StoreError::InvalidRequest(_)), "{bad}");
        }
    }

    #[test]
    fn duration_formats() {
        assert_eq!(parse_duration("30"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("45s"), Some(Duration::from_secs(45)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("abc"), None);
        assert_eq!(parse_duration("-5"), None);
    }

    #[test]
    fn unsafe_identifiers_rejected() {
        for bad in ["1abc", "bad-prefix", "a.b", "x;drop table hosts", "a b"] {
            let err = StoreConfig::from_properties(&props(&[
                ("connectionString", "/tmp/actors.db"),
                ("tablePrefix", bad),
            ]))
            .unwrap_err();
            assert!(matches!(err, StoreError::InvalidRequest(_)), "{bad}");
        }
    }
}
