//! Branded HTML error pages
//!
//! Rendering is a boundary concern: these functions produce the final
//! markup and the routers decide the status code that carries it.

/// Render the shared page shell.
fn render(title: &str, heading: &str, detail: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>{title}</title>
<style>
  body {{ margin: 0; font-family: -apple-system, "Segoe UI", Roboto, sans-serif;
         background: #f6f7f9; color: #1f2430; display: flex; align-items: center;
         justify-content: center; min-height: 100vh; }}
  .card {{ background: #fff; border-radius: 12px; padding: 48px 56px;
           box-shadow: 0 4px 24px rgba(31, 36, 48, 0.08); max-width: 520px;
           text-align: center; }}
  h1 {{ font-size: 22px; margin: 0 0 12px; }}
  p {{ margin: 0; color: #5b6372; line-height: 1.6; }}
  .badge {{ display: inline-block; margin-bottom: 24px; padding: 4px 12px;
            border-radius: 999px; background: #eef1f5; color: #5b6372;
            font-size: 12px; letter-spacing: 0.08em; text-transform: uppercase; }}
</style>
</head>
<body>
<div class="card">
  <div class="badge">burrow</div>
  <h1>{heading}</h1>
  <p>{detail}</p>
</div>
</body>
</html>
"#
    )
}

/// Page shown when no live tunnel matches a public request.
pub fn tunnel_offline(name: &str) -> String {
    render(
        "Tunnel offline",
        "This tunnel is offline",
        &format!(
            "No agent is currently serving <strong>{}</strong>. \
             Start the agent and refresh this page.",
            name
        ),
    )
}

/// Page shown when the agent reported an error before any response bytes.
pub fn bad_gateway(name: &str) -> String {
    render(
        "Bad gateway",
        "The upstream service failed",
        &format!(
            "The agent serving <strong>{}</strong> could not complete this \
             request. Check that the local service is running.",
            name
        ),
    )
}

/// Page shown when the agent produced no response within the deadline.
pub fn gateway_timeout(name: &str) -> String {
    render(
        "Gateway timeout",
        "The upstream service timed out",
        &format!(
            "The agent serving <strong>{}</strong> did not respond in time. \
             The request was abandoned.",
            name
        ),
    )
}
