use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PopupPayload {
    pub id: String,
    pub area: String,
    pub days_since_last_visit: i64,
    pub emotion: String,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PopupState {
    pub payload: Option<PopupPayload>,
    pub visible: bool,
}

/// Holds at most one popup. A newer `show` replaces the current payload.
#[derive(Clone)]
pub struct PopupStore {
    state: Arc<watch::Sender<PopupState>>,
}

impl Default for PopupStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PopupStore {
    pub fn new() -> Self {
        let (state, _) = watch::channel(PopupState::default());
        Self {
            state: Arc::new(state),
        }
    }

    pub fn show(&self, payload: PopupPayload) {
        self.state.send_replace(PopupState {
            payload: Some(payload),
            visible: true,
        });
    }

    pub fn hide(&self) {
        self.state.send_replace(PopupState::default());
    }

    pub fn current(&self) -> Option<PopupPayload> {
        self.state.borrow().payload.clone()
    }

    pub fn is_visible(&self) -> bool {
        self.state.borrow().visible
    }

    pub fn snapshot(&self) -> PopupState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PopupState> {
        self.state.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(id: &str) -> PopupPayload {
        PopupPayload {
            id: id.into(),
            area: "연남동".into(),
            days_since_last_visit: 3,
            emotion: "happy".into(),
            timestamp_ms: 1,
        }
    }

    #[test]
    fn last_show_wins() {
        let store = PopupStore::new();
        store.show(payload("first"));
        store.show(payload("second"));
        assert!(store.is_visible());
        assert_eq!(store.current().unwrap().id, "second");
    }

    #[test]
    fn hide_clears_payload() {
        let store = PopupStore::new();
        store.show(payload("only"));
        store.hide();
        assert!(!store.is_visible());
        assert!(store.current().is_none());
    }

    #[tokio::test]
    async fn subscribers_observe_changes() {
        let store = PopupStore::new();
        let mut rx = store.subscribe();
        store.show(payload("watched"));
        rx.changed().await.unwrap();
        assert_eq!(
            rx.borrow().payload.as_ref().map(|p| p.id.as_str()),
            Some("watched")
        );
    }
}
