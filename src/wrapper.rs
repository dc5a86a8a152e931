pub mod rust_log {
    use crate::sink::{Field, Value};
    use std::{fmt, panic::Location};

    fn to_kv(value: &Value) -> log::kv::Value<'_> {
        match value {
            Value::Str(s) => log::kv::Value::from(&**s),
            Value::Int(i) => log::kv::Value::from(*i),
            Value::Duration(d) => log::kv::Value::from_debug(d),
            Value::Any(s) => log::kv::Value::from(s.as_str()),
            Value::Null => log::kv::Value::null(),
        }
    }

    pub fn log<'a>(
        level: log::Level,
        target: &str,
        module_path: Option<&'static str>,
        loc: &'static Location,
        message: &dyn fmt::Display,
        kv_fields: impl Iterator<Item = &'a Field>,
    ) {
        let kvs: Vec<(&str, log::kv::Value)> = kv_fields
            .map(|field| (&*field.key, to_kv(&field.value)))
            .collect();
        let kvs = kvs.as_slice();

        log::logger().log(
            &log::Record::builder()
                .args(format_args!("{message}"))
                .level(level)
                .target(target)
                .module_path_static(module_path)
                .file_static(Some(loc.file()))
                .line(Some(loc.line()))
                .key_values(&kvs)
                .build(),
        );
    }
}
