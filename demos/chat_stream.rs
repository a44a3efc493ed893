use std::error::Error;
use std::io::{self, BufRead, Write};

use chat_stream_sdk::chat::client::{ChatClient, ChatClientOptions, DEFAULT_BASE_URL};
use chat_stream_sdk::chat::session::{ChatSession, ChatSessionOptions, ReplyOutcome};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let base_url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = ChatClient::with_options(ChatClientOptions::default().with_base_url(base_url))?;
        let session = ChatSession::with_options(
            client,
            ChatSessionOptions {
                greeting: Some("Ask me anything. An empty line quits.".to_string()),
                ..ChatSessionOptions::default()
            },
        );
        if let Some(greeting) = session.transcript().entries().first() {
            println!("{}", greeting.text);
        }

        let stdin = io::stdin();
        loop {
            print!("> ");
            io::stdout().flush()?;

            let mut line = String::new();
            if stdin.lock().read_line(&mut line)? == 0 || line.trim().is_empty() {
                break;
            }

            match session.ask(&line).await? {
                ReplyOutcome::Finished { response } => println!("{response}"),
                _ => {
                    if let Some(entry) = session.transcript().entries().last() {
                        println!("{}", entry.text);
                    }
                }
            }
        }

        println!("turns={}", session.history().len());
        Ok::<(), Box<dyn Error>>(())
    })
}
