//! A counter app driven through the session runtime.
//!
//! Run with: cargo run -p counter-demo [-- path/to/config.toml]
//!
//! Simulates a client that loads the app and clicks the button twice,
//! logging every message the server sends back.

use std::{
    path::PathBuf,
    sync::{Arc, PoisonError},
};

use reflow_core::{
    BackMsg, BackMsgKind, ClientState, FileWatcherType, ForwardMsg, RuntimeConfig,
    protocol::{ForwardMsgKind, SessionStatus, WidgetState, WidgetStates, WidgetValue},
};
use reflow_runner::{ScriptLoader, ScriptRegistry};
use reflow_session::{Runtime, SessionServices};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const INCREMENT: &str = "increment";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut config = match std::env::args().nth(1) {
        Some(path) => RuntimeConfig::load(path)?,
        None => RuntimeConfig::default(),
    };
    // The script lives in the registry, not on disk.
    config.server.file_watcher_type = FileWatcherType::None;

    let script_path = std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("counter.py");
    let registry = Arc::new(ScriptRegistry::new());
    registry.register_fn(&script_path, |ctx| {
        let clicked = ctx.is_triggered(INCREMENT);
        let count = {
            let mut state = ctx
                .session_state()
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let count = state.get("count").and_then(Value::as_u64).unwrap_or(0) + u64::from(clicked);
            state.set("count", json!(count));
            count
        };
        ctx.new_element(json!({ "markdown": format!("Count: {count}") }))?;
        ctx.new_element(json!({ "button": { "id": INCREMENT, "label": "+1" } }))?;
        Ok(())
    });

    let runtime = Runtime::new(SessionServices::new(config, registry as Arc<dyn ScriptLoader>));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let session_id = runtime
        .connect_session(&script_path, serde_json::Map::new(), tx, None)
        .await?;

    let clicks = [false, true, true];
    for clicked in clicks {
        runtime
            .handle_backmsg(&session_id, BackMsg::new(BackMsgKind::RerunScript(client_state(clicked))))
            .await?;
        while let Some(msg) = rx.recv().await {
            log_message(&msg);
            if matches!(
                msg.kind,
                ForwardMsgKind::SessionStatusChanged(SessionStatus {
                    script_is_running: false,
                    ..
                })
            ) {
                break;
            }
        }
    }

    runtime.close_session(&session_id).await?;
    runtime.stop().await;
    Ok(())
}

fn client_state(clicked: bool) -> ClientState {
    let widgets = if clicked {
        vec![WidgetState::new(INCREMENT, WidgetValue::Trigger(true))]
    } else {
        Vec::new()
    };
    ClientState {
        widget_states: Some(WidgetStates { widgets }),
        ..ClientState::default()
    }
}

fn log_message(msg: &ForwardMsg) {
    match &msg.kind {
        ForwardMsgKind::Delta(delta) => {
            tracing::info!(path = ?msg.metadata.delta_path, element = ?delta.kind, "delta");
        }
        kind => tracing::info!(kind = msg.type_name(), "{kind:?}"),
    }
}
