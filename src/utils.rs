use regex::Regex;
use serde_json::{Map, Value};

/// Look up a dotted path (`usage.completion_tokens`) in a parsed JSON object.
pub fn get_path<'a>(map: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut keys = path.split('.').filter(|s| !s.is_empty());
    let first = keys.next()?;
    let mut current = map.get(first)?;
    for key in keys {
        current = current.as_object()?.get(key)?;
    }
    Some(current)
}

pub fn get_str_path<'a>(map: &'a Map<String, Value>, path: &str) -> Option<&'a str> {
    get_path(map, path).and_then(|v| v.as_str())
}

pub fn get_u64_path(map: &Map<String, Value>, path: &str) -> Option<u64> {
    get_path(map, path).and_then(|v| v.as_u64())
}

pub fn get_f64_path(map: &Map<String, Value>, path: &str) -> Option<f64> {
    get_path(map, path).and_then(|v| v.as_f64())
}

pub fn get_i64_path(map: &Map<String, Value>, path: &str) -> Option<i64> {
    get_path(map, path).and_then(|v| v.as_i64())
}

pub fn get_bool_path(map: &Map<String, Value>, path: &str) -> Option<bool> {
    get_path(map, path).and_then(|v| v.as_bool())
}

/// Set a dotted path, creating intermediate objects. Non-object intermediates
/// are replaced.
pub fn set_path(map: &mut Map<String, Value>, path: &str, value: Value) {
    let keys: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
    if keys.is_empty() {
        return;
    }
    if keys.len() == 1 {
        map.insert(keys[0].to_string(), value);
        return;
    }

    let first = keys[0].to_string();
    if !map.get(&first).map(Value::is_object).unwrap_or(false) {
        map.insert(first.clone(), Value::Object(Map::new()));
    }
    let mut cursor = map.get_mut(&first).expect("intermediate object exists");
    for key in keys.iter().skip(1).take(keys.len().saturating_sub(2)) {
        if !cursor.is_object() {
            *cursor = Value::Object(Map::new());
        }
        let obj = cursor.as_object_mut().expect("object value");
        cursor = obj
            .entry((*key).to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !cursor.is_object() {
        *cursor = Value::Object(Map::new());
    }
    if let (Some(obj), Some(last)) = (cursor.as_object_mut(), keys.last()) {
        obj.insert((*last).to_string(), value);
    }
}

/// Remove a dotted path. Missing segments are a no-op.
pub fn remove_path(map: &mut Map<String, Value>, path: &str) {
    let keys: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
    if keys.is_empty() {
        return;
    }
    if keys.len() == 1 {
        map.remove(keys[0]);
        return;
    }
    let Some(mut current) = map.get_mut(keys[0]) else {
        return;
    };
    for key in keys.iter().skip(1).take(keys.len().saturating_sub(2)) {
        let Some(obj) = current.as_object_mut() else {
            return;
        };
        let Some(next) = obj.get_mut(*key) else {
            return;
        };
        current = next;
    }
    if let (Some(obj), Some(last)) = (current.as_object_mut(), keys.last()) {
        obj.remove(*last);
    }
}

/// Compile a model-access glob into an anchored regex.
///
/// `**` matches any number of segments, `*` matches within a single segment
/// (no `/`), `?` matches one non-separator character.
pub fn compile_model_glob(pattern: &str) -> Option<Regex> {
    let mut regex = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    regex.push_str(".*");
                } else {
                    regex.push_str("[^/]*");
                }
            }
            '?' => regex.push_str("[^/]"),
            other => regex.push_str(&regex::escape(&other.to_string())),
        }
    }
    regex.push('$');
    Regex::new(&regex).ok()
}

pub fn model_glob_match(pattern: &str, model: &str) -> bool {
    compile_model_glob(pattern)
        .map(|re| re.is_match(model))
        .unwrap_or(false)
}
