use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use payflux_core::event::{EngineEvent, EventBus};
use payflux_core::flow::{FlowFilter, FlowStatus};
use payflux_engine::{ControlPlane, ListPage};

use crate::protocol::{ClientFrame, ServerEvent, ServerResponse};

/// Which flows a connection wants events for.
#[derive(Default)]
struct Subscriptions {
    all: bool,
    flows: HashSet<String>,
}

impl Subscriptions {
    fn wants(&self, event: &EngineEvent) -> bool {
        if self.all {
            return true;
        }
        event
            .flow_id()
            .is_some_and(|flow_id| self.flows.contains(flow_id))
    }
}

/// Handle a single WebSocket connection (axum WebSocket).
pub async fn handle_connection(ws: WebSocket, control: Arc<ControlPlane>, event_bus: Arc<EventBus>) {
    let (ws_tx, mut ws_rx) = ws.split();
    let ws_tx = Arc::new(Mutex::new(ws_tx));

    let subscriptions = Arc::new(Mutex::new(Subscriptions::default()));

    // Subscribe to event bus and forward events this connection joined
    let mut event_rx = event_bus.subscribe();
    let event_ws_tx = ws_tx.clone();
    let event_subs = subscriptions.clone();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            {
                let subs = event_subs.lock().await;
                if !subs.wants(&event) {
                    continue;
                }
            }
            let flow_id = event.flow_id().map(String::from);
            let payload = match serde_json::to_value(&event) {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "Failed to serialize engine event");
                    continue;
                }
            };
            let frame = ServerEvent::new(flow_id, payload);
            if let Ok(json) = serde_json::to_string(&frame) {
                let mut tx = event_ws_tx.lock().await;
                if tx.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
        }
    });

    // Read incoming frames
    while let Some(msg) = ws_rx.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                debug!(error = %e, "WebSocket read error");
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                let frame: ClientFrame = match serde_json::from_str(&text) {
                    Ok(f) => f,
                    Err(e) => {
                        let resp = ServerResponse::err(
                            "0".to_string(),
                            -32700,
                            format!("Parse error: {}", e),
                        );
                        send_json(&ws_tx, &resp).await;
                        continue;
                    }
                };

                let result =
                    process_request(&frame.method, &frame.params, &control, &subscriptions).await;
                let resp = match result {
                    Ok(value) => ServerResponse::ok(frame.id, value),
                    Err(message) => ServerResponse::err(frame.id, -32602, message),
                };
                send_json(&ws_tx, &resp).await;
            }
            Message::Close(_) => break,
            Message::Ping(data) => {
                let mut tx = ws_tx.lock().await;
                let _ = tx.send(Message::Pong(data)).await;
            }
            _ => {}
        }
    }

    event_task.abort();
    debug!("Connection closed");
}

async fn send_json(
    ws_tx: &Arc<Mutex<futures::stream::SplitSink<WebSocket, Message>>>,
    frame: &ServerResponse,
) {
    if let Ok(json) = serde_json::to_string(frame) {
        let mut tx = ws_tx.lock().await;
        let _ = tx.send(Message::Text(json.into())).await;
    }
}

async fn process_request(
    method: &str,
    params: &serde_json::Value,
    control: &ControlPlane,
    subscriptions: &Mutex<Subscriptions>,
) -> Result<serde_json::Value, String> {
    match method {
        "flow.subscribe" => {
            let flow_id = params["flow_id"]
                .as_str()
                .filter(|s| !s.is_empty())
                .ok_or("flow_id is required")?;
            let mut subs = subscriptions.lock().await;
            subs.flows.insert(flow_id.to_string());
            Ok(serde_json::json!({ "subscribed": flow_id }))
        }
        "flow.subscribe_all" => {
            let mut subs = subscriptions.lock().await;
            subs.all = true;
            Ok(serde_json::json!({ "subscribed": "all" }))
        }
        "flow.unsubscribe" => {
            let mut subs = subscriptions.lock().await;
            match params["flow_id"].as_str().filter(|s| !s.is_empty()) {
                Some(flow_id) => {
                    subs.flows.remove(flow_id);
                    Ok(serde_json::json!({ "unsubscribed": flow_id }))
                }
                None => {
                    subs.all = false;
                    subs.flows.clear();
                    Ok(serde_json::json!({ "unsubscribed": "all" }))
                }
            }
        }
        "flow.list" => {
            let status = match params["status"].as_str() {
                Some(s) => Some(s.parse::<FlowStatus>().map_err(|e| e.to_string())?),
                None => None,
            };
            let filter = FlowFilter {
                status,
                user_id: params["user_id"].as_str().map(String::from),
                flow_type: params["flow_type"].as_str().map(String::from),
                ..Default::default()
            };
            let page = ListPage {
                limit: params["limit"].as_u64().unwrap_or(50) as usize,
                offset: params["offset"].as_u64().unwrap_or(0) as usize,
            };
            let listing = control
                .list(&filter, page)
                .await
                .map_err(|e| e.to_string())?;
            serde_json::to_value(listing).map_err(|e| e.to_string())
        }
        _ => {
            warn!(method, "Unknown method");
            Err(format!("Unknown method: {}", method))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use payflux_core::event::BatchReport;

    fn flow_event(flow_id: &str) -> EngineEvent {
        EngineEvent::FlowError {
            flow_id: flow_id.to_string(),
            error: "boom".into(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_subscriptions_filter_by_flow() {
        let mut subs = Subscriptions::default();
        assert!(!subs.wants(&flow_event("f1")));

        subs.flows.insert("f1".into());
        assert!(subs.wants(&flow_event("f1")));
        assert!(!subs.wants(&flow_event("f2")));
    }

    #[test]
    fn test_subscribe_all_receives_batch_events() {
        let batch = EngineEvent::BatchCompleted {
            report: BatchReport::new("pause", vec![]),
            timestamp: Utc::now(),
        };

        let mut subs = Subscriptions::default();
        subs.flows.insert("f1".into());
        // Batch events carry no flow id; only all-subscribers see them
        assert!(!subs.wants(&batch));

        subs.all = true;
        assert!(subs.wants(&batch));
        assert!(subs.wants(&flow_event("f2")));
    }
}
