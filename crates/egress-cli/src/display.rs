//! Terminal output for requests and outcomes.

use colored::Colorize;
use egress_client::{ExecutionOutcome, Payload, PreparedRequest};

/// Prints an assembled request: request line, headers, blank line, body.
pub fn display_request(request: &PreparedRequest) {
    println!("{}", "Request".bright_cyan().bold());
    println!("{request}");
}

/// Prints status and duration, then the payload on success or the
/// classified error on failure.
pub fn display_outcome(outcome: &ExecutionOutcome) {
    let status = if outcome.status_code == 0 {
        "-".to_string()
    } else {
        outcome.status_code.to_string()
    };
    let duration = format!("{}ms", outcome.duration.as_millis());

    match &outcome.result {
        Ok(payload) => {
            println!("{} {} {}", "●".bright_green(), status.green(), duration.dimmed());
            println!("{}", render_payload(payload));
        }
        Err(e) => {
            eprintln!("{} {} {}", "●".bright_red(), status.red(), duration.dimmed());
            eprintln!("{} {e}", "Error:".bright_red());
        }
    }
}

fn render_payload(payload: &Payload) -> String {
    match payload {
        Payload::Json(value) => {
            serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
        }
        Payload::Text(text) => text.clone(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_render_payload() {
        assert_eq!(
            render_payload(&Payload::Json(json!({ "a": 1 }))),
            "{\n  \"a\": 1\n}"
        );
        assert_eq!(render_payload(&Payload::Text("a,b\n1,2".to_string())), "a,b\n1,2");
    }
}
