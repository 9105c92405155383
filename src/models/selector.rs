//! Model selection for the runner fan-out.

use crate::event::Event;

/// Chooses which registered models receive an event.
///
/// `None` means every registered model. An empty list means no model matched.
pub trait ModelSelector: Send + Sync {
    fn select(&self, event: &Event, available: &[&str]) -> Option<Vec<String>>;
}

impl<F> ModelSelector for F
where
    F: Fn(&Event) -> Option<Vec<String>> + Send + Sync,
{
    fn select(&self, event: &Event, _available: &[&str]) -> Option<Vec<String>> {
        self(event)
    }
}

/// Selects the models named in a list-valued body field.
///
/// Events without the field (or with a non-list value) go to every model.
#[derive(Debug, Clone)]
pub struct FieldSelector {
    field: String,
}

impl FieldSelector {
    pub fn new(field: impl Into<String>) -> Self {
        Self { field: field.into() }
    }
}

impl Default for FieldSelector {
    fn default() -> Self {
        Self::new("models")
    }
}

impl ModelSelector for FieldSelector {
    fn select(&self, event: &Event, _available: &[&str]) -> Option<Vec<String>> {
        let names = event.body.get(&self.field)?.as_array()?;
        Some(
            names
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn field_selector_reads_list() {
        let selector = FieldSelector::default();
        let event = Event::new(json!({"n": 1, "models": ["m2"]}));
        assert_eq!(selector.select(&event, &["m1", "m2"]), Some(vec!["m2".to_string()]));
    }

    #[test]
    fn field_selector_missing_field_selects_all() {
        let selector = FieldSelector::default();
        let event = Event::new(json!({"n": 1}));
        assert_eq!(selector.select(&event, &["m1"]), None);
    }

    #[test]
    fn field_selector_empty_list_matches_nothing() {
        let selector = FieldSelector::new("targets");
        let event = Event::new(json!({"targets": []}));
        assert_eq!(selector.select(&event, &["m1"]), Some(vec![]));
    }

    #[test]
    fn closures_are_selectors() {
        let selector = |_: &Event| Some(vec!["a".to_string()]);
        let event = Event::new(json!({}));
        assert_eq!(selector.select(&event, &[]), Some(vec!["a".to_string()]));
    }
}
