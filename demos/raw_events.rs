use std::error::Error;
use std::time::Duration;

use chat_stream_sdk::event_source::{Event, EventSource, EventSourceOptions};
use reqwest::header::{HeaderValue, CACHE_CONTROL};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,chat_stream_sdk=debug")),
        )
        .with_target(false)
        .init();

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "http://localhost:8800/events".to_string());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let options = EventSourceOptions::default()
            .with_header(CACHE_CONTROL, HeaderValue::from_static("no-cache"))
            .with_reconnect_delay(Duration::from_secs(2));

        let open_tx = tx.clone();
        let message_tx = tx.clone();
        let source = EventSource::builder(url)
            .options(options)
            .on_open(move |_| {
                let _ = open_tx.send("open".to_string());
            })
            .on_message(move |event| {
                if let Some(message) = event.as_message() {
                    let _ = message_tx.send(format!(
                        "message id={} data={}",
                        message.last_event_id.as_deref().unwrap_or("-"),
                        message.data
                    ));
                }
            })
            .on_error(move |event| {
                if let Event::Error(error) = event {
                    let _ = tx.send(format!("error {}", error.error()));
                }
            })
            .open();

        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        loop {
            tokio::select! {
                line = rx.recv() => match line {
                    Some(line) => println!("{line}"),
                    None => break,
                },
                _ = &mut ctrl_c => break,
            }
        }

        source.close();
        Ok::<(), Box<dyn Error>>(())
    })
}
