//! vuic CLI: one voice interaction per Enter key press.
//!
//! Usage:
//!   cargo run -p vuic-cli -- [--text-mode] [--once] [--debug]
//!
//! Needs `VUIC__API_KEY` (or `api_key` in `config/vuic.toml`). With `--text-mode` each typed
//! line is sent as the command instead of recording the microphone.

use anyhow::Context;
use async_trait::async_trait;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use vuic_voice::logging::init_tracing;
use vuic_voice::{
    CapturedInput, CycleOutcome, EngineConfig, InputCapture, InteractionEngine, VoiceError,
    VoiceFunction, VoiceResult, INPUT_TRANSCRIPT_EVENT, STATE_CHANGE_EVENT, TEXT_REPLY_EVENT,
};

/// Hands the engine the line typed before the cycle started.
#[derive(Default)]
struct TypedInput {
    pending: Mutex<Option<String>>,
}

impl TypedInput {
    fn set(&self, line: String) {
        *self.pending.lock().unwrap_or_else(|e| e.into_inner()) = Some(line);
    }
}

#[async_trait]
impl InputCapture for TypedInput {
    fn name(&self) -> &str {
        "typed_input"
    }

    async fn capture(&self) -> VoiceResult<CapturedInput> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .map(CapturedInput::Transcript)
            .ok_or_else(|| VoiceError::Recognition("nothing typed".to_string()))
    }
}

struct Options {
    text_mode: bool,
    once: bool,
    debug: bool,
}

fn parse_args() -> Option<Options> {
    let mut options = Options {
        text_mode: false,
        once: false,
        debug: false,
    };
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--text-mode" => options.text_mode = true,
            "--once" => options.once = true,
            "--debug" => options.debug = true,
            "--help" | "-h" => return None,
            other => eprintln!("[vuic-cli] ignoring unknown argument {}", other),
        }
    }
    Some(options)
}

fn demo_functions() -> Vec<VoiceFunction> {
    vec![
        VoiceFunction::new("set_theme", "Switch the interface between light and dark", |args| {
            let theme = args.get_str("theme").context("missing theme")?;
            println!("  [function] theme -> {}", theme);
            Ok(())
        })
        .with_parameters(serde_json::json!({
            "type": "object",
            "properties": {"theme": {"type": "string", "enum": ["light", "dark"]}},
            "required": ["theme"]
        })),
        VoiceFunction::new("open_page", "Navigate to a named page", |args| {
            let page = args.get_str("page").context("missing page")?;
            println!("  [function] open page {}", page);
            Ok(())
        })
        .with_parameters(serde_json::json!({
            "type": "object",
            "properties": {"page": {"type": "string"}},
            "required": ["page"]
        })),
    ]
}

/// Run one interaction unless `shutdown` fires first. `None` means shut down.
async fn interact(
    engine: &InteractionEngine,
    shutdown: impl Future<Output = ()>,
) -> Option<VoiceResult<CycleOutcome>> {
    tokio::select! {
        outcome = engine.start_processing() => Some(outcome),
        _ = shutdown => {
            info!("CTRL-C received during an interaction; shutting down");
            engine.stop_recording();
            engine.stop_speaking();
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[vuic-cli] .env not loaded: {} (using system environment)", e);
    }

    let Some(options) = parse_args() else {
        eprintln!("vuic - voice interaction from the terminal");
        eprintln!("  --text-mode   Type commands instead of speaking them");
        eprintln!("  --once        Run a single interaction and exit");
        eprintln!("  --debug       Verbose logging (RUST_LOG still wins)");
        eprintln!();
        eprintln!("Requires VUIC__API_KEY. Optional: VUIC__API_URL, VUIC_CONFIG, STT_API_KEY.");
        return Ok(());
    };

    let mut config = EngineConfig::load().context("loading vuic configuration")?;
    config.debug |= options.debug;
    init_tracing(config.debug);

    let typed = Arc::new(TypedInput::default());
    let mut builder = InteractionEngine::builder(config);
    if options.text_mode {
        builder = builder.capture(Arc::clone(&typed) as Arc<dyn InputCapture>);
    }
    let engine = builder.build().context("starting the voice engine")?;
    engine.register_functions(demo_functions());

    engine.on(STATE_CHANGE_EVENT, |state| println!("  [{}]", state));
    engine.on_text(INPUT_TRANSCRIPT_EVENT, |text| println!("you: {}", text));
    engine.on_text(TEXT_REPLY_EVENT, |text| println!("ai:  {}", text));

    let prompt = if options.text_mode {
        "Type a command and press Enter (Ctrl+C to quit)"
    } else {
        "Press Enter and speak (Ctrl+C to quit)"
    };
    info!("vuic ready");
    println!("{}", prompt);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                info!("CTRL-C received; shutting down");
                engine.stop_recording();
                engine.stop_speaking();
                break;
            }
        };
        let Some(line) = line else { break };

        if options.text_mode {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            typed.set(line.to_string());
        }

        let ctrl_c = async {
            let _ = tokio::signal::ctrl_c().await;
        };
        let Some(outcome) = interact(&engine, ctrl_c).await else { break };
        match outcome {
            Ok(CycleOutcome::Frozen) => {
                warn!("the processor refused this key; check VUIC__API_KEY and your quota");
            }
            Ok(outcome) => info!(?outcome, "interaction finished"),
            Err(e) => warn!("interaction failed: {}", e),
        }

        if options.once {
            break;
        }
        println!("{}", prompt);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use vuic_voice::{AudioSession, InteractionState, MemoryIdentityStore};

    /// Waits forever for a command that never comes.
    struct NeverSpoken;

    #[async_trait]
    impl InputCapture for NeverSpoken {
        fn name(&self) -> &str {
            "never_spoken"
        }

        async fn capture(&self) -> VoiceResult<CapturedInput> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn shutdown_mid_interaction_leaves_engine_idle() {
        let engine = InteractionEngine::builder(EngineConfig::new("test-key").unwrap())
            .capture(Arc::new(NeverSpoken))
            .audio_session(AudioSession::new(|| Err(VoiceError::Playback("no device".into()))))
            .identity_store(Arc::new(MemoryIdentityStore::new()))
            .build()
            .unwrap();

        let shutdown = tokio::time::sleep(Duration::from_millis(50));
        assert!(interact(&engine, shutdown).await.is_none());
        assert!(!engine.is_busy());
        assert_eq!(engine.last_state(), InteractionState::Idle);

        let typed = Arc::new(TypedInput::default());
        typed.set("hello".to_string());
        assert!(matches!(
            typed.capture().await,
            Ok(CapturedInput::Transcript(ref text)) if text == "hello"
        ));
    }
}
