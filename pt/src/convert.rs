//! Lossless PRD conversion between the JSON and YAML backends.
//!
//! Conversion preserves task IDs, titles, acceptance lists, dependency
//! lists, completion and blocked state, and (where present) the parallel
//! group. Formatting and unknown keys are not preserved.

use serde_json::{Value as Json, json};
use serde_yaml::Value as Yaml;

use crate::TrackerError;
use crate::json::{story_acceptance, story_blocked, story_depends, story_done, story_id};

/// Convert a JSON PRD document (`stories` array) to a version-1 YAML task
/// file.
pub fn json_prd_to_yaml(json_text: &str) -> Result<String, TrackerError> {
    let prd: Json =
        serde_json::from_str(json_text).map_err(|e| TrackerError::InvalidPrd(e.to_string()))?;
    let stories = prd
        .get("stories")
        .and_then(Json::as_array)
        .ok_or_else(|| TrackerError::InvalidPrd("JSON PRD must have a 'stories' array".to_string()))?;

    let mut tasks: Vec<Json> = Vec::new();
    for story in stories {
        let Some(id) = story_id(story) else {
            continue;
        };
        let title = story
            .get("title")
            .and_then(Json::as_str)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| format!("Story {id}"));
        let mut task = json!({
            "id": id,
            "title": title,
            "acceptance": story_acceptance(story),
            "depends_on": story_depends(story),
            "completed": story_done(story),
            "blocked": story_blocked(story),
        });
        if let Some(group) = story.get("group").and_then(Json::as_str) {
            task["group"] = json!(group);
        }
        tasks.push(task);
    }

    let doc = json!({ "version": 1, "tasks": tasks });
    // serde_yaml renders a serde_json::Value directly.
    serde_yaml::to_string(&doc).map_err(|e| TrackerError::InvalidPrd(e.to_string()))
}

/// Convert a version-1 YAML task file to a JSON PRD document.
pub fn yaml_prd_to_json(yaml_text: &str) -> Result<String, TrackerError> {
    let doc: Yaml =
        serde_yaml::from_str(yaml_text).map_err(|e| TrackerError::InvalidPrd(e.to_string()))?;
    let tasks = doc
        .get("tasks")
        .and_then(|t| t.as_sequence())
        .ok_or_else(|| TrackerError::InvalidPrd("YAML must have a 'tasks' list".to_string()))?;

    let mut stories: Vec<Json> = Vec::new();
    for task in tasks {
        let id = match task.get("id") {
            Some(Yaml::String(s)) => s.clone(),
            Some(Yaml::Number(n)) => n.to_string(),
            _ => continue,
        };
        let title = match task.get("title") {
            Some(Yaml::String(s)) => s.clone(),
            _ => format!("Story {id}"),
        };
        let str_list = |key: &str| -> Vec<String> {
            match task.get(key) {
                Some(Yaml::Sequence(items)) => items
                    .iter()
                    .filter_map(|v| match v {
                        Yaml::String(s) => Some(s.clone()),
                        Yaml::Number(n) => Some(n.to_string()),
                        _ => None,
                    })
                    .collect(),
                _ => Vec::new(),
            }
        };
        let flag = |key: &str| -> bool {
            task.get(key).and_then(Yaml::as_bool).unwrap_or(false)
        };

        let status = if flag("blocked") {
            "blocked"
        } else if flag("completed") {
            "done"
        } else {
            "open"
        };
        let mut story = json!({
            "id": id,
            "title": title,
            "acceptance": str_list("acceptance"),
            "depends_on": str_list("depends_on"),
            "status": status,
        });
        if let Some(Yaml::String(group)) = task.get("group") {
            story["group"] = json!(group);
        }
        stories.push(story);
    }

    let mut text = serde_json::to_string_pretty(&json!({ "stories": stories }))
        .map_err(|e| TrackerError::InvalidPrd(e.to_string()))?;
    text.push('\n');
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    const JSON_PRD: &str = r#"{
  "stories": [
    {"id": "a", "title": "Alpha", "status": "done", "acceptance": ["works"]},
    {"id": "b", "title": "Beta", "depends_on": ["a"], "group": "core"},
    {"id": "c", "title": "Gamma", "blocked": true}
  ]
}"#;

    #[test]
    fn test_json_to_yaml_preserves_fields() {
        let yaml = json_prd_to_yaml(JSON_PRD).unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(doc.get("version").and_then(serde_yaml::Value::as_i64), Some(1));
        let tasks = doc.get("tasks").unwrap().as_sequence().unwrap();
        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[0].get("completed").unwrap().as_bool(), Some(true));
        assert_eq!(tasks[1].get("group").unwrap().as_str(), Some("core"));
        assert_eq!(tasks[2].get("blocked").unwrap().as_bool(), Some(true));
    }

    #[test]
    fn test_round_trip_preserves_semantics() {
        let yaml = json_prd_to_yaml(JSON_PRD).unwrap();
        let json_text = yaml_prd_to_json(&yaml).unwrap();
        let prd: serde_json::Value = serde_json::from_str(&json_text).unwrap();
        let stories = prd["stories"].as_array().unwrap();

        assert_eq!(stories.len(), 3);
        assert_eq!(stories[0]["id"], "a");
        assert_eq!(stories[0]["status"], "done");
        assert_eq!(stories[0]["acceptance"][0], "works");
        assert_eq!(stories[1]["depends_on"][0], "a");
        assert_eq!(stories[1]["status"], "open");
        assert_eq!(stories[2]["status"], "blocked");
    }

    #[test]
    fn test_yaml_to_json_to_yaml_round_trip() {
        let yaml_in = "\
version: 1
tasks:
  - id: t1
    title: First
    acceptance:
      - one
      - two
    completed: true
  - id: t2
    title: Second
    depends_on: [t1]
";
        let json_text = yaml_prd_to_json(yaml_in).unwrap();
        let yaml_out = json_prd_to_yaml(&json_text).unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&yaml_out).unwrap();
        let tasks = doc.get("tasks").unwrap().as_sequence().unwrap();
        assert_eq!(tasks[0].get("id").unwrap().as_str(), Some("t1"));
        assert_eq!(tasks[0].get("completed").unwrap().as_bool(), Some(true));
        assert_eq!(
            tasks[0].get("acceptance").unwrap().as_sequence().unwrap().len(),
            2
        );
        assert_eq!(tasks[1].get("depends_on").unwrap().as_sequence().unwrap().len(), 1);
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(json_prd_to_yaml("{}").is_err());
        assert!(yaml_prd_to_json("version: 1\n").is_err());
    }
}
