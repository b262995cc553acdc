//! Embedded `Civitai resources` / `Civitai metadata` JSON values.

use serde_json::{Map, Value};

use crate::error::MetadataError;
use crate::types::ModelKind;

/// One entry of a `Civitai resources` array that names a model version.
#[derive(Debug, Clone, PartialEq)]
pub struct CivitaiResource {
    pub kind: ModelKind,
    pub version_id: i64,
    pub name: Option<String>,
    pub weight: Option<f64>,
}

/// Fields of a resource entry consumed into [`CivitaiResource`].
const RESOURCE_FIELDS: &[&str] = &["type", "modelVersionId", "modelName", "modelVersionName", "weight"];

/// Parse a `Civitai resources` array.
///
/// Returns the resources plus leftover fields tagged with their entry index,
/// to be namespaced by the caller.
pub fn parse_resources(
    value: &str,
) -> Result<(Vec<CivitaiResource>, Vec<(usize, String, String)>), MetadataError> {
    let parsed: Value = serde_json::from_str(value)
        .map_err(|e| MetadataError::format(format!("civitai resources: {}", e)))?;
    let items = parsed
        .as_array()
        .ok_or_else(|| MetadataError::format("civitai resources: expected a JSON array"))?;

    let mut resources = Vec::new();
    let mut leftovers = Vec::new();

    for (index, item) in items.iter().enumerate() {
        let object = item
            .as_object()
            .ok_or_else(|| MetadataError::format("civitai resources: expected an object entry"))?;

        let kind = object
            .get("type")
            .and_then(Value::as_str)
            .map(ModelKind::from_resource_type)
            .unwrap_or(ModelKind::Unknown);

        let version_id = match object.get("modelVersionId") {
            Some(id) => Some(id.as_i64().ok_or_else(|| {
                MetadataError::format(format!("civitai resources: modelVersionId {} is not an integer", id))
            })?),
            None => None,
        };

        match version_id {
            Some(version_id) if kind != ModelKind::Unknown => resources.push(CivitaiResource {
                kind,
                version_id,
                name: object.get("modelName").and_then(Value::as_str).map(str::to_string),
                weight: object.get("weight").and_then(Value::as_f64),
            }),
            _ => log::debug!("civitai resource without usable type/version id: {}", item),
        }

        leftovers.extend(
            object
                .iter()
                .filter(|(key, _)| !RESOURCE_FIELDS.contains(&key.as_str()))
                .map(|(key, value)| (index, key.clone(), json_text(value))),
        );
    }

    Ok((resources, leftovers))
}

/// Parse a `Civitai metadata` object into its `remixOfId` and remaining fields.
pub fn parse_metadata(value: &str) -> Result<(Option<i64>, Vec<(String, String)>), MetadataError> {
    let parsed: Map<String, Value> = serde_json::from_str(value)
        .map_err(|e| MetadataError::format(format!("civitai metadata: {}", e)))?;

    let mut remix_of = None;
    let mut rest = Vec::new();
    for (key, value) in parsed {
        if key == "remixOfId" {
            remix_of = Some(value.as_i64().ok_or_else(|| {
                MetadataError::format(format!("civitai metadata: remixOfId {} is not an integer", value))
            })?);
        } else {
            rest.push((key, json_text(&value)));
        }
    }
    Ok((remix_of, rest))
}

fn json_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_resources() {
        let (resources, leftovers) = parse_resources(
            r#"[{"type":"checkpoint","modelVersionId":130072,"modelName":"Realistic","modelVersionName":"v5"},
                {"type":"lora","weight":0.65,"modelVersionId":87153,"air":"urn:x"},
                {"type":"upscaler","modelVersionId":1}]"#,
        )
        .unwrap();

        assert_eq!(resources.len(), 2);
        assert_eq!(resources[0].kind, ModelKind::Checkpoint);
        assert_eq!(resources[0].version_id, 130072);
        assert_eq!(resources[0].name.as_deref(), Some("Realistic"));
        assert_eq!(resources[1].weight, Some(0.65));
        assert_eq!(leftovers, vec![(1, "air".to_string(), "urn:x".to_string())]);
    }

    #[test]
    fn test_parse_resources_rejects_non_array() {
        assert!(parse_resources(r#"{"type":"lora"}"#).is_err());
        assert!(parse_resources("[1, 2]").is_err());
        assert!(parse_resources(r#"[{"type":"lora","modelVersionId":"abc"}]"#).is_err());
    }

    #[test]
    fn test_parse_metadata() {
        let (remix, rest) = parse_metadata(r#"{"remixOfId": 4242, "workflow": "txt2img"}"#).unwrap();
        assert_eq!(remix, Some(4242));
        assert_eq!(rest, vec![("workflow".to_string(), "txt2img".to_string())]);
    }
}
