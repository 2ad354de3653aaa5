use serde_json::Value;

use crate::db::error::{Error, Result};

/// A structured dotted field path, e.g. `frame_roles.AGENT.description`.
///
/// The root segment names a top-level entity field; further segments address
/// keys inside nested JSON objects. Treating the path as segments (rather
/// than string-splitting at each use site) is what lets the engine propose
/// and apply changes to sub-fields of nested collections.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    pub fn parse(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(Error::Validation("empty field path".to_string()));
        }
        let segments: Vec<String> = s.split('.').map(|s| s.to_string()).collect();
        if segments.iter().any(|seg| seg.is_empty()) {
            return Err(Error::Validation(format!("malformed field path '{s}'")));
        }
        Ok(FieldPath { segments })
    }

    /// The top-level entity field this path starts at.
    pub fn root(&self) -> &str {
        &self.segments[0]
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// The value at this path in `doc`, if every intermediate step is an
    /// object containing the next segment.
    pub fn value_at<'a>(&self, doc: &'a Value) -> Option<&'a Value> {
        let mut current = doc;
        for segment in &self.segments {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    /// Sets `new_value` at this path in `doc`, creating intermediate objects
    /// as needed. Fails if an intermediate step exists but is not an object.
    pub fn set_value(&self, doc: &mut Value, new_value: Value) -> Result<()> {
        let Some((last, intermediate)) = self.segments.split_last() else {
            return Err(Error::Validation("empty field path".to_string()));
        };
        let mut current = doc;
        for segment in intermediate {
            let obj = current.as_object_mut().ok_or_else(|| {
                Error::Validation(format!("cannot set '{self}': '{segment}' is not an object"))
            })?;
            current = obj
                .entry(segment.clone())
                .or_insert_with(|| Value::Object(serde_json::Map::new()));
        }
        let obj = current.as_object_mut().ok_or_else(|| {
            Error::Validation(format!("cannot set '{self}': target is not an object"))
        })?;
        obj.insert(last.clone(), new_value);
        Ok(())
    }
}

impl std::fmt::Display for FieldPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.segments.join("."))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parse_and_display() -> anyhow::Result<()> {
        let path = FieldPath::parse("frame_roles.AGENT.description")?;
        assert_eq!(path.root(), "frame_roles");
        assert_eq!(path.segments().len(), 3);
        assert_eq!(path.to_string(), "frame_roles.AGENT.description");

        assert!(FieldPath::parse("").is_err());
        assert!(FieldPath::parse("a..b").is_err());
        assert!(FieldPath::parse(".a").is_err());
        Ok(())
    }

    #[test]
    fn value_at_navigates_nested_objects() -> anyhow::Result<()> {
        let doc = json!({
            "name": "Motion",
            "frame_roles": {
                "AGENT": { "description": "the mover" }
            }
        });

        let path = FieldPath::parse("frame_roles.AGENT.description")?;
        assert_eq!(path.value_at(&doc), Some(&json!("the mover")));

        let missing = FieldPath::parse("frame_roles.THEME.description")?;
        assert_eq!(missing.value_at(&doc), None);

        // Path descending into a non-object is absent, not an error
        let through_scalar = FieldPath::parse("name.x")?;
        assert_eq!(through_scalar.value_at(&doc), None);
        Ok(())
    }

    #[test]
    fn set_value_creates_intermediate_objects() -> anyhow::Result<()> {
        let mut doc = json!({ "name": "Motion" });

        FieldPath::parse("frame_roles.AGENT.description")?
            .set_value(&mut doc, json!("the mover"))?;
        assert_eq!(
            doc,
            json!({
                "name": "Motion",
                "frame_roles": { "AGENT": { "description": "the mover" } }
            })
        );

        FieldPath::parse("name")?.set_value(&mut doc, json!("Self_motion"))?;
        assert_eq!(doc["name"], json!("Self_motion"));
        Ok(())
    }

    #[test]
    fn set_value_refuses_to_traverse_scalars() -> anyhow::Result<()> {
        let mut doc = json!({ "name": "Motion" });
        let result = FieldPath::parse("name.sub")?.set_value(&mut doc, json!(1));
        assert!(result.is_err());
        // Document unchanged on failure
        assert_eq!(doc, json!({ "name": "Motion" }));
        Ok(())
    }
}
