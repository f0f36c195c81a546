//! Local state reads for writers.
//!
//! Conditional edges and `Command`-returning nodes observe the state *as if
//! their own writes had committed*. `local_read` applies a task's buffered
//! writes to a copy of the affected channels and reads the result, leaving
//! the real channels untouched.

use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::channels::{Channel, ChannelError};
use crate::types::is_reserved;

/// Read `select` channel values, optionally overlaying `writes` first.
///
/// With `fresh == false` this is a plain read of the current values. With
/// `fresh == true` the task's writes are applied to clones of the affected
/// channels so the reader observes its own updates.
pub fn local_read(
    channels: &FxHashMap<String, Channel>,
    select: &[String],
    writes: &[(String, Value)],
    fresh: bool,
) -> Result<FxHashMap<String, Value>, ChannelError> {
    let mut overlay: FxHashMap<String, Channel> = FxHashMap::default();
    if fresh {
        let mut grouped: Vec<(&String, Vec<Value>)> = Vec::new();
        for (channel, value) in writes {
            if is_reserved(channel) || !channels.contains_key(channel) {
                continue;
            }
            match grouped.iter_mut().find(|(name, _)| *name == channel) {
                Some((_, values)) => values.push(value.clone()),
                None => grouped.push((channel, vec![value.clone()])),
            }
        }
        for (name, values) in grouped {
            let mut copy = channels[name].clone();
            copy.update(name, values)?;
            overlay.insert(name.clone(), copy);
        }
    }

    let mut out = FxHashMap::default();
    for name in select {
        let channel = overlay.get(name).or_else(|| channels.get(name));
        if let Some(channel) = channel {
            if let Ok(value) = channel.get(name) {
                out.insert(name.clone(), value);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn channels() -> FxHashMap<String, Channel> {
        let mut map: FxHashMap<String, Channel> = FxHashMap::default();
        map.insert("a".into(), Channel::last_value());
        map.insert("b".into(), Channel::last_value());
        map.get_mut("a")
            .unwrap()
            .update("a", vec![json!("committed")])
            .unwrap();
        map
    }

    #[test]
    fn stale_read_ignores_writes() {
        let channels = channels();
        let writes = vec![("a".to_string(), json!("mine"))];
        let out = local_read(
            &channels,
            &["a".to_string(), "b".to_string()],
            &writes,
            false,
        )
        .unwrap();
        assert_eq!(out["a"], json!("committed"));
        assert!(!out.contains_key("b"));
    }

    #[test]
    fn fresh_read_observes_own_writes() {
        let channels = channels();
        let writes = vec![
            ("a".to_string(), json!("mine")),
            ("b".to_string(), json!("new")),
        ];
        let out = local_read(
            &channels,
            &["a".to_string(), "b".to_string()],
            &writes,
            true,
        )
        .unwrap();
        assert_eq!(out["a"], json!("mine"));
        assert_eq!(out["b"], json!("new"));
        // the real channels are untouched
        assert_eq!(channels["a"].get("a").unwrap(), json!("committed"));
        assert!(!channels["b"].is_available());
    }
}
