use async_trait::async_trait;
use chatloom_common::{Error, Result};
use serde_json::json;

use crate::tools::{Tool, ToolContext, ToolOutput};

/// Reports the current wall-clock time, optionally in an IANA timezone.
pub struct CurrentTime;

#[async_trait]
impl Tool for CurrentTime {
    fn name(&self) -> &'static str {
        "current_time"
    }

    fn description(&self) -> &'static str {
        "Get the current date and time. Pass an IANA timezone name such as \
         'Europe/London' to get local time there; defaults to UTC."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "timezone": {
                    "type": "string",
                    "description": "IANA timezone name (e.g. 'America/New_York'). Defaults to 'UTC'."
                }
            }
        })
    }

    async fn execute(&self, _context: &ToolContext, args: serde_json::Value) -> Result<ToolOutput> {
        let tz_name = args["timezone"].as_str().unwrap_or("UTC").trim();
        let tz: chrono_tz::Tz = tz_name
            .parse()
            .map_err(|_| Error::Tool(format!("unknown timezone: '{tz_name}'")))?;

        let now = chrono::Utc::now().with_timezone(&tz);
        let body = json!({
            "timezone": tz_name,
            "iso8601": now.to_rfc3339(),
            "weekday": now.format("%A").to_string(),
        });
        Ok(ToolOutput::success(body.to_string()))
    }
}
