//! HTML page returned to the OAuth popup.
//!
//! The page reports the outcome to `window.opener` via `postMessage` and
//! closes itself.

use crate::integrations::models::ConnectionResponse;
use serde_json::{json, Value};

pub enum CallbackOutcome {
    Connected(ConnectionResponse),
    Failed { code: &'static str, message: String },
}

impl CallbackOutcome {
    pub fn failed(code: &'static str, message: impl Into<String>) -> Self {
        CallbackOutcome::Failed {
            code,
            message: message.into(),
        }
    }

    fn payload(&self) -> Value {
        match self {
            CallbackOutcome::Connected(connection) => json!({
                "type": "INSTAGRAM_CONNECTED",
                "success": true,
                "connection": connection,
            }),
            CallbackOutcome::Failed { code, message } => json!({
                "type": "INSTAGRAM_ERROR",
                "success": false,
                "errorCode": code,
                "message": message,
            }),
        }
    }
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

/// JSON that is safe inside a `<script>` element
fn script_json(value: &Value) -> String {
    value
        .to_string()
        .replace("</", "<\\/")
        .replace('\u{2028}', "\\u2028")
        .replace('\u{2029}', "\\u2029")
}

pub fn render(outcome: &CallbackOutcome) -> String {
    let (title, heading, body, close_ms) = match outcome {
        CallbackOutcome::Connected(c) => (
            "Instagram connected",
            "<h2 class=\"success\">Instagram account connected</h2>".to_string(),
            format!(
                "<p><strong>Account:</strong> @{}</p><p><strong>Type:</strong> {}</p>",
                escape_html(&c.connection.username),
                escape_html(&c.connection.account_type)
            ),
            1500,
        ),
        CallbackOutcome::Failed { code, message } => (
            "Instagram connection failed",
            format!("<h2 class=\"error\">Connection failed ({code})</h2>"),
            format!("<p>{}</p>", escape_html(message)),
            2000,
        ),
    };

    format!(
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="UTF-8">
<title>{title}</title>
<style>
body {{ font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', sans-serif; padding: 40px; text-align: center; }}
.success {{ color: #28a745; }}
.error {{ color: #dc3545; }}
</style>
</head>
<body>
{heading}
{body}
<p>This window will close automatically...</p>
<script>
if (window.opener) {{
    window.opener.postMessage({payload}, '*');
    setTimeout(function () {{ window.close(); }}, {close_ms});
}}
</script>
</body>
</html>"#,
        payload = script_json(&outcome.payload()),
    )
}
