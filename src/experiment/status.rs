//! Trial status: built-in state machine values plus custom statuses

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Status of a trial.
///
/// Built-in statuses follow `CreatedGroup -> Running -> {Completed | Exception
/// | Interrupted | Broken | Suspended}`. External schedulers may attach their
/// own `(name, value)` pairs with [`Status::custom`] (e.g. `reserved`).
///
/// Two statuses are equal when both their name and value match, so a custom
/// status never compares equal to a built-in one that merely shares a value.
#[derive(Debug, Clone)]
pub enum Status {
    /// Created, nothing planned yet (`new`, 0)
    CreatedGroup,
    /// Running (`running`, 101)
    Running,
    /// Stopped by SIGTERM / SIGINT (`interrupted`, 201)
    Interrupted,
    /// An exception was raised (`exception`, 202)
    Exception,
    /// Failed repeatedly, will not be retried (`broken`, 203)
    Broken,
    /// Suspended by the user (`suspended`, 301)
    Suspended,
    /// Finished running (`completed`, 302)
    Completed,
    /// Scheduler-defined status
    Custom {
        /// Status name
        name: String,
        /// Numeric value
        value: i64,
    },
}

/// Status family markers (`value / 100 * 100`)
pub const RUNNING_GROUP: i64 = 100;
/// Not running because of an error
pub const ERROR_GROUP: i64 = 200;
/// Not running because it finished or was suspended
pub const FINISHED_GROUP: i64 = 300;

const BUILTINS: [Status; 7] = [
    Status::CreatedGroup,
    Status::Running,
    Status::Interrupted,
    Status::Exception,
    Status::Broken,
    Status::Suspended,
    Status::Completed,
];

impl Status {
    /// Create a custom status
    #[must_use]
    pub fn custom(name: impl Into<String>, value: i64) -> Self {
        Self::Custom {
            name: name.into(),
            value,
        }
    }

    /// Rebuild a status from its persisted parts.
    ///
    /// A pair is a built-in only when both name and value match one;
    /// anything else is preserved as a custom status.
    #[must_use]
    pub fn from_parts(name: &str, value: i64) -> Self {
        BUILTINS
            .iter()
            .find(|s| s.value() == value && s.name_matches(name))
            .cloned()
            .unwrap_or_else(|| Self::custom(name, value))
    }

    /// Look up a built-in status by name (case-insensitive)
    #[must_use]
    pub fn builtin(name: &str) -> Option<Self> {
        BUILTINS.iter().find(|s| s.name_matches(name)).cloned()
    }

    /// Status name
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::CreatedGroup => "new",
            Self::Running => "running",
            Self::Interrupted => "interrupted",
            Self::Exception => "exception",
            Self::Broken => "broken",
            Self::Suspended => "suspended",
            Self::Completed => "completed",
            Self::Custom { name, .. } => name,
        }
    }

    /// Numeric value
    #[must_use]
    pub const fn value(&self) -> i64 {
        match self {
            Self::CreatedGroup => 0,
            Self::Running => 101,
            Self::Interrupted => 201,
            Self::Exception => 202,
            Self::Broken => 203,
            Self::Suspended => 301,
            Self::Completed => 302,
            Self::Custom { value, .. } => *value,
        }
    }

    /// Family marker of this status (0, 100, 200 or 300 for built-ins)
    #[must_use]
    pub const fn group_value(&self) -> i64 {
        self.value() / 100 * 100
    }

    /// True for custom statuses
    #[must_use]
    pub const fn is_custom(&self) -> bool {
        matches!(self, Self::Custom { .. })
    }

    /// True once the trial stopped running (error or finished families)
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !self.is_custom() && self.group_value() >= ERROR_GROUP
    }

    /// Case-insensitive name comparison, also accepting the legacy
    /// `CreatedGroup` spelling for `new`.
    #[must_use]
    pub fn name_matches(&self, name: &str) -> bool {
        self.name().eq_ignore_ascii_case(name)
            || (matches!(self, Self::CreatedGroup) && name.eq_ignore_ascii_case("CreatedGroup"))
    }

    /// Transport-neutral representation: `{"name": .., "value": ..}`
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({ "name": self.name(), "value": self.value() })
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::CreatedGroup
    }
}

impl PartialEq for Status {
    fn eq(&self, other: &Self) -> bool {
        self.value() == other.value() && self.name() == other.name()
    }
}

impl Eq for Status {}

impl std::hash::Hash for Status {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name().hash(state);
        self.value().hash(state);
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_custom() {
            write!(f, "CStatus<{}>", self.name())
        } else {
            f.write_str(self.name())
        }
    }
}

#[derive(Serialize, Deserialize)]
struct StatusParts {
    name: String,
    value: i64,
}

impl Serialize for Status {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        StatusParts {
            name: self.name().to_string(),
            value: self.value(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Status {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let parts = StatusParts::deserialize(deserializer)?;
        Ok(Self::from_parts(&parts.name, parts.value))
    }
}
