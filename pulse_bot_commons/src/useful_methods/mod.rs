use std::time::Duration;

use futures::Future;
use teloxide::{
    payloads::SendMessageSetters,
    requests::Requester,
    types::{Message, Recipient},
    Bot, RequestError,
};

pub trait BotPulseSendMsg {
    /// Opinionated method to send a message with HTML markup, retrying a
    /// couple of times when Telegram asks us to flood-wait.
    fn pulse_send_html<'a>(
        &'a self,
        to_where: impl Into<Recipient> + Send,
        text: impl Into<&'a str> + Send,
    ) -> impl Future<Output = Result<Message, RequestError>> + Send;
}

impl BotPulseSendMsg for Bot {
    async fn pulse_send_html<'a>(
        &'a self,
        to_where: impl Into<Recipient> + Send,
        text: impl Into<&'a str> + Send,
    ) -> Result<Message, RequestError> {
        let to_where: Recipient = to_where.into();
        let text = text.into();

        // Try up to 3 times.
        let mut attempt: u8 = 0;
        loop {
            attempt += 1;
            let result = self
                .send_message(to_where.clone(), text)
                .parse_mode(teloxide::types::ParseMode::Html)
                .await;

            match result {
                Err(RequestError::RetryAfter(duration)) if attempt < 3 => {
                    tokio::time::sleep(duration.duration()).await;
                }
                Err(e) if attempt < 3 => {
                    log::warn!("Retrying a failed send: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                other => break other,
            }
        }
    }
}
