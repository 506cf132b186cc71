use std::sync::Arc;

use mail_dispatcher::{
    Dispatcher, DispatcherConfig, InMemoryStorage, MailRequest, MailTransport, TransportError,
};

/// Stand-in transport; a real deployment plugs in its SMTP client here.
struct PrintTransport;

#[async_trait::async_trait]
impl MailTransport for PrintTransport {
    async fn send(&self, request: &MailRequest) -> Result<(), TransportError> {
        println!("sending '{}' to {}", request.subject, request.receiver);
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    let config = DispatcherConfig {
        delay_table: Some("PROMO,NEWSLETTER:3000;OTP:60000".to_string()),
        ..Default::default()
    };
    let dispatcher = Dispatcher::new(
        config,
        Arc::new(InMemoryStorage::new()),
        Arc::new(PrintTransport),
    );

    let request = MailRequest::new(
        "PROMO",
        "noreply@example.com",
        "user@example.com",
        "Spring sale",
    )
    .with_dedup_key("order-42");

    // First dispatch proceeds; the replay is deduplicated.
    for _ in 0..2 {
        match dispatcher.dispatch(request.clone()).await {
            Ok(outcome) => println!("{outcome:?}"),
            Err(err) => eprintln!("dispatch failed: {err}"),
        }
    }
}
