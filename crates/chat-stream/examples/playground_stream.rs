use std::sync::Arc;

use chat_stream::prelude::*;
use parking_lot::Mutex;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), ConfigError> {
    init_observability();
    let processor = ChatStreamProcessor::from_config(GatewayConfig::from_env()?)?;
    let model = std::env::var("CHAT_STREAM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
    let prompt = std::env::args()
        .skip(1)
        .collect::<Vec<_>>()
        .join(" ");
    let prompt = if prompt.is_empty() {
        "Say hello and describe what you can do.".to_string()
    } else {
        prompt
    };

    let last_turn: Arc<Mutex<Option<Turn>>> = Arc::default();
    processor.on(EventKind::Delta, |event| {
        if let StreamEvent::Delta(delta) = event {
            if delta.is_reasoning_content {
                eprint!("{}", delta.text());
            } else {
                print!("{}", delta.text());
            }
            for media in &delta.resolved_media {
                eprintln!("\n[inline {} resolved]", media.mime_type);
            }
        }
    });
    let finished = last_turn.clone();
    processor.on(EventKind::Finish, move |event| {
        if let StreamEvent::Finish(finish) = event {
            println!();
            *finished.lock() = Some(finish.turn.clone());
        }
    });
    processor.on(EventKind::Error, |event| {
        if let StreamEvent::Error(error) = event {
            eprintln!("stream error: {}", error.message);
        }
    });

    let mut history = vec![ChatMessage::user(prompt)];
    processor
        .send(StreamRequest::new(model.clone()).messages(history.clone()))
        .finished()
        .await;

    let Some(turn) = last_turn.lock().take() else {
        return Ok(());
    };
    // Follow-up turn: history carries the sanitized assistant text only.
    history.push(turn.message());
    history.push(ChatMessage::user("Summarize that in one sentence."));
    processor
        .send(StreamRequest::new(model).messages(history))
        .finished()
        .await;
    Ok(())
}
