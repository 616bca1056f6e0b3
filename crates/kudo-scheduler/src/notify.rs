//! Error-notification dispatch — best-effort delivery of run-failure
//! messages to the configured target.
//!
//! Contract: fire-and-forget. Failures are logged by the caller, never
//! thrown back into run finalization, and every request is
//! timeout-bounded so a slow endpoint cannot hold up an executor task.

use kudo_core::config::NotifyTargetConfig;
use kudo_core::error::{KudoError, Result};

const SEND_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Send a notification to the configured target.
pub async fn send(target: &NotifyTargetConfig, title: &str, body: &str) -> Result<()> {
    match target {
        NotifyTargetConfig::Telegram { bot_token, chat_id } => {
            send_telegram(bot_token, chat_id, title, body).await
        }
        NotifyTargetConfig::Webhook { url } => send_webhook(url, title, body).await,
    }
}

/// Send via the Telegram Bot API `sendMessage`.
async fn send_telegram(bot_token: &str, chat_id: &str, title: &str, body: &str) -> Result<()> {
    let url = format!("https://api.telegram.org/bot{bot_token}/sendMessage");
    let text = format!("🚨 *{}*\n\n{}", escape_markdown(title), escape_markdown(body));

    let client = reqwest::Client::new();
    let resp = client
        .post(&url)
        .json(&serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "Markdown"
        }))
        .timeout(SEND_TIMEOUT)
        .send()
        .await
        .map_err(|e| KudoError::Notify(format!("Telegram send failed: {e}")))?;

    if resp.status().is_success() {
        tracing::info!("✅ Telegram notification sent: {title}");
        Ok(())
    } else {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Err(KudoError::Notify(format!("Telegram API error {status}: {body}")))
    }
}

/// Send via a generic HTTP webhook — POST with JSON body.
async fn send_webhook(url: &str, title: &str, body: &str) -> Result<()> {
    let client = reqwest::Client::new();
    let resp = client
        .post(url)
        .json(&serde_json::json!({
            "title": title,
            "body": body,
            "source": "kudo-scheduler",
        }))
        .timeout(SEND_TIMEOUT)
        .send()
        .await
        .map_err(|e| KudoError::Notify(format!("Webhook send failed: {e}")))?;

    if resp.status().is_success() {
        tracing::info!("✅ Webhook notification sent to {url}: {title}");
        Ok(())
    } else {
        Err(KudoError::Notify(format!("Webhook error {}", resp.status())))
    }
}

/// Escape Telegram MarkdownV1 special characters.
fn escape_markdown(s: &str) -> String {
    s.replace('_', "\\_")
        .replace('*', "\\*")
        .replace('[', "\\[")
        .replace('`', "\\`")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_markdown_specials() {
        assert_eq!(
            escape_markdown("run_7 *failed* [3 errors]"),
            "run\\_7 \\*failed\\* \\[3 errors]"
        );
        assert_eq!(escape_markdown("plain"), "plain");
    }
}
