use std::{borrow::Cow, fmt, sync::Arc, time::Duration};

/// Structured logging sink: a `log` target plus a list of key/value fields
/// attached to every record emitted through it.
///
/// Deriving a sink with [`with`](Logger::with) or
/// [`with_fields`](Logger::with_fields) keeps the fields already attached and
/// appends the new ones. Cloning is cheap, the fields live behind an `Arc`.
///
/// # Examples
/// ```rust
/// use actix_web_middleware_reqlog::Logger;
///
/// let logger = Logger::new("my_app::http").with("service", "billing");
/// let per_call = logger.with("attempt", 2);
///
/// assert_eq!(per_call.fields().len(), 2);
/// assert_eq!(logger.fields().len(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct Logger {
    target: Cow<'static, str>,
    fields: Arc<[Field]>,
}

impl Logger {
    /// Create a sink that emits records with the given `log` target and no
    /// attached fields.
    pub fn new(target: impl Into<Cow<'static, str>>) -> Logger {
        Logger {
            target: target.into(),
            fields: Arc::from(Vec::new()),
        }
    }

    /// Derive a new sink with one more field attached.
    pub fn with(&self, key: impl Into<Cow<'static, str>>, value: impl Into<Value>) -> Logger {
        self.with_fields([Field::new(key, value)])
    }

    /// Derive a new sink with `fields` appended to the ones already attached.
    pub fn with_fields(&self, fields: impl IntoIterator<Item = Field>) -> Logger {
        let fields: Vec<Field> = self.fields.iter().cloned().chain(fields).collect();
        Logger {
            target: self.target.clone(),
            fields: fields.into(),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Value of the last attached field named `key`.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields
            .iter()
            .rev()
            .find(|field| field.key == key)
            .map(|field| &field.value)
    }

    /// Emit a record at `level`. `fields` are logged after the attached ones.
    #[track_caller]
    pub fn log(
        &self,
        level: log::Level,
        message: impl fmt::Display,
        fields: impl IntoIterator<Item = Field>,
    ) {
        if level > log::max_level() {
            return;
        }

        let extra: Vec<Field> = fields.into_iter().collect();
        crate::wrapper::rust_log::log(
            level,
            &self.target,
            None,
            std::panic::Location::caller(),
            &message,
            self.fields.iter().chain(extra.iter()),
        );
    }

    #[track_caller]
    pub fn error(&self, message: impl fmt::Display, fields: impl IntoIterator<Item = Field>) {
        self.log(log::Level::Error, message, fields)
    }

    #[track_caller]
    pub fn warn(&self, message: impl fmt::Display, fields: impl IntoIterator<Item = Field>) {
        self.log(log::Level::Warn, message, fields)
    }

    #[track_caller]
    pub fn info(&self, message: impl fmt::Display, fields: impl IntoIterator<Item = Field>) {
        self.log(log::Level::Info, message, fields)
    }

    #[track_caller]
    pub fn debug(&self, message: impl fmt::Display, fields: impl IntoIterator<Item = Field>) {
        self.log(log::Level::Debug, message, fields)
    }

    #[track_caller]
    pub fn trace(&self, message: impl fmt::Display, fields: impl IntoIterator<Item = Field>) {
        self.log(log::Level::Trace, message, fields)
    }
}

impl Default for Logger {
    /// Sink with the `actix_web_middleware_reqlog` target.
    fn default() -> Self {
        Logger::new("actix_web_middleware_reqlog")
    }
}

/// Named value attached to a [`Logger`] or passed to a single record.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub key: Cow<'static, str>,
    pub value: Value,
}

impl Field {
    pub fn new(key: impl Into<Cow<'static, str>>, value: impl Into<Value>) -> Self {
        Field {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Example: GET
    Str(Cow<'static, str>),
    /// Example: 201
    Int(i64),
    /// Example: 1.2ms
    Duration(Duration),
    /// Arbitrary value, rendered ahead of time. Example: a panic payload
    Any(String),
    Null,
}

impl Value {
    /// Wrap anything `Debug` as an untyped value.
    pub fn any(value: &impl fmt::Debug) -> Self {
        Value::Any(format!("{value:?}"))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            Value::Any(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => f.write_str(s),
            Value::Int(i) => write!(f, "{i}"),
            Value::Duration(d) => write!(f, "{d:?}"),
            Value::Any(s) => f.write_str(s),
            Value::Null => f.write_str("null"),
        }
    }
}

impl From<&'static str> for Value {
    fn from(value: &'static str) -> Self {
        Value::Str(Cow::Borrowed(value))
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(Cow::Owned(value))
    }
}

impl From<Cow<'static, str>> for Value {
    fn from(value: Cow<'static, str>) -> Self {
        Value::Str(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value.into())
    }
}

impl From<u16> for Value {
    fn from(value: u16) -> Self {
        Value::Int(value.into())
    }
}

impl From<usize> for Value {
    fn from(value: usize) -> Self {
        Value::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<Duration> for Value {
    fn from(value: Duration) -> Self {
        Value::Duration(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn test_with_preserves_fields() {
        let base = Logger::new("sink_with").with("service", "billing");
        let derived = base.with("attempt", 2).with("service", "override");

        assert_eq!(base.fields().len(), 1);
        assert_eq!(derived.fields().len(), 3);
        assert_eq!(derived.target(), "sink_with");
        assert_eq!(derived.field("attempt"), Some(&Value::Int(2)));
        // last attached wins
        assert_eq!(derived.field("service"), Some(&Value::from("override")));
        assert_eq!(derived.field("missing"), None);
    }

    #[test]
    fn test_value_conversions() {
        assert_eq!(Value::from(201u16), Value::Int(201));
        assert_eq!(Value::from(42usize), Value::Int(42));
        assert_eq!(Value::from(None::<String>), Value::Null);
        assert_eq!(Value::from(Some("x")), Value::from("x"));
        assert_eq!(Value::any(&vec![1, 2]).as_str(), Some("[1, 2]"));
        assert_eq!(
            Value::from(Duration::from_millis(3)).to_string(),
            "3ms".to_string()
        );
    }

    #[test]
    fn test_emit_record() {
        testing::init();
        let logger = Logger::new("sink_emit").with("request_id", "abc");

        let line = line!() + 1;
        logger.error("something broke", [Field::new("code", 7)]);

        let records = testing::records("sink_emit");
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.level, log::Level::Error);
        assert_eq!(record.message, "something broke");
        assert_eq!(record.field("request_id"), Some("abc"));
        assert_eq!(record.field("code"), Some("7"));
        assert_eq!(record.keys(), vec!["request_id", "code"]);
        // location is the call site, there is no module to go with it
        assert_eq!(record.file.as_deref(), Some(file!()));
        assert_eq!(record.line, Some(line));
        assert_eq!(record.module_path, None);
    }
}
