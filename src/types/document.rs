use serde::ser::Serialize;
use serde_json::ser::PrettyFormatter;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::types::tree::validate_path;

/// an ordered list of JSON records committed as one file at a fixed path
#[derive(Clone, Debug, PartialEq)]
pub struct Document {
    path: String,
    records: Vec<Value>,
}

impl Document {
    /// create a document, checking every record is a JSON object
    pub fn new(path: impl Into<String>, records: Vec<Value>) -> Result<Self> {
        let path = path.into();
        validate_path(&path)?;

        if let Some(pos) = records.iter().position(|r| !r.is_object()) {
            return Err(Error::InvalidDocument(format!(
                "record {} in {} is not an object",
                pos, path
            )));
        }

        Ok(Self { path, records })
    }

    /// parse a document from JSON text; the top level must be an array
    pub fn from_json(path: impl Into<String>, text: &str) -> Result<Self> {
        let path = path.into();
        match serde_json::from_str(text)? {
            Value::Array(records) => Self::new(path, records),
            _ => Err(Error::InvalidDocument(format!(
                "{}: top level is not an array",
                path
            ))),
        }
    }

    /// repository path the document is committed at
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn records(&self) -> &[Value] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// set `reference_field` to `target` on every record whose `match_field`
    /// equals `key`. returns the number of records changed.
    pub fn rewrite_reference(
        &mut self,
        match_field: &str,
        key: &str,
        reference_field: &str,
        target: &str,
    ) -> usize {
        let mut rewritten = 0;
        for record in &mut self.records {
            let Some(obj) = record.as_object_mut() else {
                continue;
            };
            if obj.get(match_field).and_then(Value::as_str) != Some(key) {
                continue;
            }
            obj.insert(reference_field.to_string(), Value::String(target.to_string()));
            rewritten += 1;
        }
        rewritten
    }

    /// canonical text form: tab-indented JSON, keys in record order
    pub fn to_canonical_string(&self) -> Result<String> {
        let mut out = Vec::new();
        let formatter = PrettyFormatter::with_indent(b"\t");
        let mut ser = serde_json::Serializer::with_formatter(&mut out, formatter);
        self.records.serialize(&mut ser)?;
        // serde_json only ever emits valid UTF-8
        Ok(String::from_utf8_lossy(&out).into_owned())
    }
}
