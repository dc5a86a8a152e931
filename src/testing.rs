//! Capturing `log` backend shared by the unit tests.
//!
//! The logger is process global, so every test emits under its own target and
//! reads back only the records for that target.

use std::sync::{Mutex, Once};

use log::kv::{Error, Key, Value, VisitSource};

#[derive(Debug, Clone)]
pub(crate) struct Captured {
    pub level: log::Level,
    pub target: String,
    pub message: String,
    pub module_path: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub fields: Vec<(String, String)>,
}

impl Captured {
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn keys(&self) -> Vec<&str> {
        self.fields.iter().map(|(k, _)| k.as_str()).collect()
    }
}

struct Capture {
    records: Mutex<Vec<Captured>>,
}

struct Collect<'a>(&'a mut Vec<(String, String)>);

impl<'kvs> VisitSource<'kvs> for Collect<'_> {
    fn visit_pair(&mut self, key: Key<'kvs>, value: Value<'kvs>) -> Result<(), Error> {
        self.0.push((key.to_string(), value.to_string()));
        Ok(())
    }
}

impl log::Log for Capture {
    fn enabled(&self, _: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        let mut fields = Vec::new();
        let _ = record.key_values().visit(&mut Collect(&mut fields));

        self.records.lock().unwrap().push(Captured {
            level: record.level(),
            target: record.target().to_string(),
            message: record.args().to_string(),
            module_path: record.module_path().map(str::to_string),
            file: record.file().map(str::to_string),
            line: record.line(),
            fields,
        });
    }

    fn flush(&self) {}
}

static CAPTURE: Capture = Capture {
    records: Mutex::new(Vec::new()),
};

pub(crate) fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        log::set_logger(&CAPTURE).unwrap();
        log::set_max_level(log::LevelFilter::Trace);
    });
}

pub(crate) fn records(target: &str) -> Vec<Captured> {
    CAPTURE
        .records
        .lock()
        .unwrap()
        .iter()
        .filter(|record| record.target == target)
        .cloned()
        .collect()
}
