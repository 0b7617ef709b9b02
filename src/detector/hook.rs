//! Script injected into every board document
//!
//! It subscribes to the site's own request event list and wraps its data-fetch
//! helper, forwarding what it sees to the host through the bridge binding. The
//! script only reports; claiming happens in the host.

use std::time::Duration;

/// Name of the binding the page calls with serialized bridge messages
pub const BRIDGE_BINDING: &str = "__docrunner_bridge";

/// Expression that evaluates to `true` while the hook is installed
pub const HOOK_ALIVE_PROBE: &str = "window.__observerAlive === true";

/// Build the hook script for the given listing endpoint names
pub fn hook_script(listing_endpoints: &[String], heartbeat: Duration) -> String {
    let names: Vec<String> = listing_endpoints
        .iter()
        .map(|e| e.trim_matches('/').to_string())
        .filter(|e| !e.is_empty())
        .collect();
    let names_json = serde_json::to_string(&names).unwrap_or_else(|_| "[]".to_string());
    let heartbeat_ms = heartbeat.as_millis().max(1_000);

    format!(
        r#"(() => {{
  if (window.__docrunnerHookInstalled) return;
  window.__docrunnerHookInstalled = true;
  const LISTINGS = {names_json};
  const send = (msg) => {{
    try {{ window.{BRIDGE_BINDING}(JSON.stringify(msg)); }} catch (e) {{}}
  }};

  try {{
    window.events ||= {{}};
    window.events.request ||= [];
    const push = window.events.request.push.bind(window.events.request);
    push((doc) => send({{ kind: 'request_doc', doc }}));
  }} catch (e) {{}}

  const wrap = () => {{
    const original = window.arequest;
    if (typeof original !== 'function') return false;
    if (original.__docrunnerWrapped) return true;
    const wrapped = function (endpoint, cb, params) {{
      return original.call(window, endpoint, function (resp) {{
        try {{
          if (LISTINGS.includes(endpoint) && resp && Array.isArray(resp.docs)) {{
            send({{ kind: 'listing', docs: resp.docs }});
          }}
        }} catch (e) {{}}
        return cb && cb(resp);
      }}, params);
    }};
    wrapped.__docrunnerWrapped = true;
    window.arequest = wrapped;
    return true;
  }};
  if (!wrap()) {{
    const timer = setInterval(() => {{ if (wrap()) clearInterval(timer); }}, 500);
    setTimeout(() => clearInterval(timer), 30000);
  }}

  window.__observerAlive = true;
  setInterval(() => send({{ kind: 'heartbeat' }}), {heartbeat_ms});
}})();"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_references_binding_and_endpoints() {
        let script = hook_script(&["/requests".to_string()], Duration::from_secs(60));

        assert!(script.contains(&format!("window.{BRIDGE_BINDING}(")));
        assert!(script.contains(r#"const LISTINGS = ["requests"];"#));
        assert!(script.contains("window.events.request"));
        assert!(script.contains("window.arequest = wrapped"));
        assert!(script.contains("60000"));
    }

    #[test]
    fn test_script_never_claims() {
        let script = hook_script(&["/requests".to_string()], Duration::from_secs(60));
        assert!(!script.contains("/take/"));
        assert!(!script.contains("fetch("));
    }

    #[test]
    fn test_heartbeat_has_floor() {
        let script = hook_script(&[], Duration::from_millis(10));
        assert!(script.contains("1000);"));
        assert!(script.contains("const LISTINGS = [];"));
    }
}
