//! Filter operators over item values.
//!
//! Filters are JSON objects mapping dotted paths to either a plain value
//! (equality) or an operator object: `$eq`, `$ne`, `$gt`, `$gte`, `$lt`,
//! `$lte`, `$in`, `$nin`, `$exists`.

use serde_json::Value;

fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

fn numeric(value: &Value) -> Option<f64> {
    value.as_f64()
}

fn compare(op: &str, actual: Option<&Value>, expected: &Value) -> bool {
    match op {
        "$eq" => actual == Some(expected),
        "$ne" => actual != Some(expected),
        "$exists" => {
            let want = expected.as_bool().unwrap_or(true);
            actual.is_some() == want
        }
        "$in" => expected
            .as_array()
            .is_some_and(|options| actual.is_some_and(|a| options.contains(a))),
        "$nin" => expected
            .as_array()
            .is_some_and(|options| actual.is_none_or(|a| !options.contains(a))),
        "$gt" | "$gte" | "$lt" | "$lte" => {
            let (Some(a), Some(b)) = (actual.and_then(numeric), numeric(expected)) else {
                // Fall back to string comparison for non-numeric operands.
                let (Some(a), Some(b)) = (
                    actual.and_then(Value::as_str),
                    expected.as_str(),
                ) else {
                    return false;
                };
                return match op {
                    "$gt" => a > b,
                    "$gte" => a >= b,
                    "$lt" => a < b,
                    _ => a <= b,
                };
            };
            match op {
                "$gt" => a > b,
                "$gte" => a >= b,
                "$lt" => a < b,
                _ => a <= b,
            }
        }
        _ => false,
    }
}

/// Whether `value` satisfies `filter`.
#[must_use]
pub fn filter_matches(filter: &Value, value: &Value) -> bool {
    let Value::Object(conditions) = filter else {
        return filter == value;
    };
    conditions.iter().all(|(path, condition)| {
        let actual = lookup(value, path);
        match condition {
            Value::Object(ops) if ops.keys().any(|k| k.starts_with('$')) => ops
                .iter()
                .all(|(op, expected)| compare(op, actual, expected)),
            expected => actual == Some(expected),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn equality_and_dotted_paths() {
        let value = json!({"user": {"name": "ada", "age": 36}});
        assert!(filter_matches(&json!({"user.name": "ada"}), &value));
        assert!(!filter_matches(&json!({"user.name": "bob"}), &value));
    }

    #[test]
    fn comparison_operators() {
        let value = json!({"age": 36, "name": "ada"});
        assert!(filter_matches(&json!({"age": {"$gt": 30}}), &value));
        assert!(filter_matches(&json!({"age": {"$lte": 36}}), &value));
        assert!(!filter_matches(&json!({"age": {"$lt": 36}}), &value));
        assert!(filter_matches(&json!({"name": {"$gte": "a"}}), &value));
    }

    #[test]
    fn membership_and_existence() {
        let value = json!({"tag": "beta"});
        assert!(filter_matches(&json!({"tag": {"$in": ["alpha", "beta"]}}), &value));
        assert!(filter_matches(&json!({"tag": {"$nin": ["gamma"]}}), &value));
        assert!(filter_matches(&json!({"tag": {"$exists": true}}), &value));
        assert!(filter_matches(&json!({"missing": {"$exists": false}}), &value));
        assert!(filter_matches(&json!({"missing": {"$nin": ["x"]}}), &value));
    }

    #[test]
    fn ne_on_missing_path_matches() {
        let value = json!({"a": 1});
        assert!(filter_matches(&json!({"b": {"$ne": 2}}), &value));
    }
}
