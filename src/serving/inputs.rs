//! Request shaping: body paths and named-input reordering.

use serde_json::{Map, Value};

use super::error::ServingError;

/// Select the request from `body` by a dotted path such as `data.b`.
pub fn extract_input(path: Option<&str>, body: &Value) -> Result<Value, ServingError> {
    let Some(path) = path.filter(|p| !p.is_empty()) else {
        return Ok(body.clone());
    };
    let mut current = body;
    for key in path.split('.') {
        current = current.get(key).ok_or_else(|| {
            ServingError::invalid_argument(format!("input path {path} not found in event body"))
        })?;
    }
    Ok(current.clone())
}

/// Place `response` into the original body under a dotted `path`.
///
/// Without a path the response replaces the body.
pub fn update_result(path: Option<&str>, original: Value, response: Value) -> Result<Value, ServingError> {
    let Some(path) = path.filter(|p| !p.is_empty()) else {
        return Ok(response);
    };
    let mut body = match original {
        Value::Object(map) => Value::Object(map),
        Value::Null => Value::Object(Map::new()),
        other => {
            return Err(ServingError::invalid_argument(format!(
                "result path {path} requires an object body, got {}",
                type_name(&other)
            )))
        }
    };

    let keys: Vec<&str> = path.split('.').collect();
    let (last, parents) = keys.split_last().unwrap_or((&path, &[]));
    let mut cursor = &mut body;
    for key in parents {
        let map = cursor
            .as_object_mut()
            .ok_or_else(|| ServingError::invalid_argument(format!("result path {path} crosses a non-object")))?;
        cursor = map.entry(key.to_string()).or_insert_with(|| Value::Object(Map::new()));
    }
    let map = cursor
        .as_object_mut()
        .ok_or_else(|| ServingError::invalid_argument(format!("result path {path} crosses a non-object")))?;
    map.insert(last.to_string(), response);
    Ok(body)
}

/// Rewrite named inputs into positional lists following `order`.
///
/// Accepts `inputs` as one object (becomes one list) or a list of objects
/// (becomes a list of lists).
pub fn inputs_to_list(mut request: Value, order: &[String]) -> Result<Value, ServingError> {
    let missing = || {
        ServingError::invalid_argument(format!(
            "Input dictionary don't contain all the necessary input keys : {order:?}"
        ))
    };
    let reorder = |named: &Map<String, Value>| -> Result<Value, ServingError> {
        order
            .iter()
            .map(|key| named.get(key).cloned().ok_or_else(missing))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array)
    };

    let inputs = match request.get("inputs") {
        Some(Value::Object(named)) => reorder(named)?,
        Some(Value::Array(items)) if items.iter().all(Value::is_object) => items
            .iter()
            .filter_map(Value::as_object)
            .map(reorder)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array)?,
        _ => {
            return Err(ServingError::invalid_argument(
                "When using predict_dict or infer_dict operation the inputs must be of type `list[dict]` or `dict`",
            ))
        }
    };
    if let Some(map) = request.as_object_mut() {
        map.insert("inputs".into(), inputs);
    }
    Ok(request)
}

/// v2 protocol: `inputs` must be present and be a list.
pub fn validate_v2(request: &Value) -> Result<(), ServingError> {
    match request.get("inputs") {
        None => Err(ServingError::validation(r#"Expected key "inputs" in request body"#)),
        Some(Value::Array(_)) => Ok(()),
        Some(_) => Err(ServingError::validation(r#"Expected "inputs" to be a list"#)),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn order() -> Vec<String> {
        vec!["f0".into(), "f1".into(), "f2".into()]
    }

    #[test]
    fn reorders_list_of_named_inputs() {
        let request = json!({"inputs": [{"f2": 3, "f0": 1, "f1": 2}, {"f1": 5, "f2": 6, "f0": 4}]});
        let out = inputs_to_list(request, &order()).unwrap();
        assert_eq!(out["inputs"], json!([[1, 2, 3], [4, 5, 6]]));
    }

    #[test]
    fn reorders_single_named_input() {
        let out = inputs_to_list(json!({"inputs": {"f1": "b", "f0": "a", "f2": "c"}}), &order()).unwrap();
        assert_eq!(out["inputs"], json!(["a", "b", "c"]));
    }

    #[test]
    fn missing_key_is_invalid() {
        let err = inputs_to_list(json!({"inputs": {"f0": 1}}), &order()).unwrap_err();
        assert!(matches!(err, ServingError::InvalidArgument(_)));
    }

    #[test]
    fn positional_inputs_are_rejected() {
        let err = inputs_to_list(json!({"inputs": [[1, 2, 3]]}), &order()).unwrap_err();
        assert!(err.to_string().contains("list[dict]"));
    }

    #[test]
    fn input_path_selects_nested_value() {
        let body = json!({"data": {"a": 5, "b": 7}});
        assert_eq!(extract_input(Some("data.b"), &body).unwrap(), json!(7));
        assert_eq!(extract_input(None, &body).unwrap(), body);
        assert!(extract_input(Some("data.c"), &body).is_err());
    }

    #[test]
    fn result_path_keeps_original_body() {
        let out = update_result(Some("resp"), json!({"x": 5}), json!({"outputs": [1]})).unwrap();
        assert_eq!(out, json!({"x": 5, "resp": {"outputs": [1]}}));

        let nested = update_result(Some("a.b"), json!({}), json!(1)).unwrap();
        assert_eq!(nested, json!({"a": {"b": 1}}));

        assert_eq!(update_result(None, json!({"x": 5}), json!(2)).unwrap(), json!(2));
    }

    #[test]
    fn v2_validation() {
        assert!(validate_v2(&json!({"inputs": [1]})).is_ok());
        assert!(matches!(validate_v2(&json!({})), Err(ServingError::Validation(_))));
        assert!(matches!(validate_v2(&json!({"inputs": 3})), Err(ServingError::Validation(_))));
    }
}
