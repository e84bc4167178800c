//! Read-only browser view of a session
//!
//! Served at `/` and `/<name>`. The page opens the relay route with the
//! viewer query and appends every payload it receives. Only the
//! percent-encoded relay path is spliced into the page; the script decodes
//! the session name from it and shows it as text.

use crate::error::Result;
use crate::session::SessionName;

use super::socket::{relay_path, VIEWER_QUERY};

const PAGE_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>xcp</title>
<style>
  body { font-family: monospace; margin: 0; background: #111; color: #ddd; }
  header { padding: 8px 12px; background: #222; border-bottom: 1px solid #333; }
  #status { float: right; color: #888; }
  #log { margin: 0; padding: 12px; white-space: pre-wrap; word-break: break-all; }
</style>
</head>
<body>
<header>xcp session <b id="session"></b><span id="status">connecting</span></header>
<pre id="log"></pre>
<script>
(function () {
  var relay = "{{relay}}";
  var name = decodeURIComponent(relay.split("?")[0].split("/").pop());
  document.getElementById("session").textContent = name;
  document.title = "xcp: " + name;

  var log = document.getElementById("log");
  var status = document.getElementById("status");
  var scheme = location.protocol === "https:" ? "wss://" : "ws://";
  var ws = new WebSocket(scheme + location.host + relay);
  ws.onopen = function () { status.textContent = "connected"; };
  ws.onclose = function () { status.textContent = "closed"; };
  ws.onmessage = function (event) {
    log.appendChild(document.createTextNode(event.data));
    window.scrollTo(0, document.body.scrollHeight);
  };
})();
</script>
</body>
</html>
"#;

/// Render the viewer page for a session
pub fn render_page(session: &SessionName) -> Result<String> {
    let relay = format!("{}?{}", relay_path(session)?, VIEWER_QUERY);
    Ok(PAGE_TEMPLATE.replace("{{relay}}", &relay))
}
