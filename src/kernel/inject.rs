//! Source templates injected into the kernel namespace.
//!
//! The host does not depend on the kernel's language beyond this module: it
//! generates source strings the kernel can execute, and everything round-trips
//! as JSON. Stubs use only stdlib imports inside the kernel, so no packages
//! are required there, and credentials never cross the boundary.

/// Cell that wipes the kernel namespace.
pub const RESET_SOURCE: &str = "get_ipython().reset(new_session=True)";

/// Sandbox-callable tool stub: function name and its parameter list.
#[derive(Debug, Clone, Copy)]
pub struct ToolStub {
    pub name: &'static str,
    pub params: &'static str,
}

/// The whitelist of tools reachable from inside the kernel, with the
/// signatures their stubs expose. Only read-only, idempotent operations.
pub const SANDBOX_TOOLS: &[ToolStub] = &[
    ToolStub { name: "search_knowledge", params: "query, top_k=10" },
    ToolStub { name: "ask_knowledge", params: "question" },
    ToolStub { name: "fetch_url", params: "url" },
    ToolStub { name: "load_file", params: "path, var_name" },
    ToolStub { name: "apple_search", params: "query, framework=None" },
];

/// Source for `llm_query` / `llm_query_batch`, POSTing to the callback server.
///
/// The batch variant fans out over at most 8 workers, preserves input order,
/// and encodes per-slot failures as `[error] ...` strings instead of raising.
pub fn llm_stub_source(callback_base_url: &str) -> String {
    let url = format!("{callback_base_url}/llm_query");
    format!(
        "import urllib.request as _llm_urllib\n\
         import json as _llm_json\n\
         import concurrent.futures as _llm_futures\n\
         def llm_query(prompt):\n\
         \x20   _data = _llm_json.dumps({{'prompt': prompt}}).encode()\n\
         \x20   _req = _llm_urllib.Request(\n\
         \x20       \"{url}\",\n\
         \x20       data=_data,\n\
         \x20       headers={{'Content-Type': 'application/json'}},\n\
         \x20       method='POST',\n\
         \x20   )\n\
         \x20   with _llm_urllib.urlopen(_req, timeout=120) as _resp:\n\
         \x20       return _llm_json.loads(_resp.read())['response']\n\
         def llm_query_batch(prompts):\n\
         \x20   def _safe_query(p):\n\
         \x20       try:\n\
         \x20           return llm_query(p)\n\
         \x20       except Exception as _e:\n\
         \x20           return '[error] ' + str(_e)\n\
         \x20   _workers = min(len(prompts), 8)\n\
         \x20   if _workers == 0:\n\
         \x20       return []\n\
         \x20   with _llm_futures.ThreadPoolExecutor(max_workers=_workers) as _pool:\n\
         \x20       return list(_pool.map(_safe_query, prompts))\n"
    )
}

/// Source defining one wrapper function per sandbox-callable tool, each
/// POSTing to `{callback_base_url}/tool_call`.
pub fn tool_stub_source(callback_base_url: &str, tools: &[ToolStub]) -> String {
    let url = format!("{callback_base_url}/tool_call");
    let mut lines = vec![
        "import urllib.request as _tc_urllib".to_string(),
        "import json as _tc_json".to_string(),
        String::new(),
        "def _tool_call(tool, **kwargs):".to_string(),
        "    _data = _tc_json.dumps({'tool': tool, 'input': kwargs}).encode()".to_string(),
        "    _req = _tc_urllib.Request(".to_string(),
        format!("        \"{url}\","),
        "        data=_data,".to_string(),
        "        headers={'Content-Type': 'application/json'},".to_string(),
        "        method='POST',".to_string(),
        "    )".to_string(),
        "    with _tc_urllib.urlopen(_req, timeout=60) as _resp:".to_string(),
        "        return _tc_json.loads(_resp.read())['result']".to_string(),
        String::new(),
    ];

    for stub in tools {
        let call_args = stub
            .params
            .split(',')
            .map(|p| p.split('=').next().unwrap_or("").trim())
            .filter(|p| !p.is_empty())
            .map(|p| format!("{p}={p}"))
            .collect::<Vec<_>>()
            .join(", ");
        lines.push(format!("def {}({}):", stub.name, stub.params));
        lines.push(format!("    return _tool_call('{}', {})", stub.name, call_args));
        lines.push(String::new());
    }

    lines.join("\n")
}

/// Cell assigning a host file's content to a kernel variable.
///
/// The content is embedded as a JSON string literal, which the kernel's
/// language accepts verbatim.
pub fn assign_text_source(var_name: &str, content: &str) -> String {
    let literal = serde_json::to_string(content).unwrap_or_else(|_| "\"\"".into());
    format!("{var_name} = {literal}")
}

/// Cell storing a finished sub-agent run's outputs as `_sub_agent_result`.
pub fn store_result_source(outputs: &serde_json::Value) -> String {
    let literal = serde_json::to_string(&outputs.to_string()).unwrap_or_else(|_| "\"{}\"".into());
    format!("import json as _sr_json\n_sub_agent_result = _sr_json.loads({literal})")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn llm_stub_targets_callback_url() {
        let src = llm_stub_source("http://127.0.0.1:8081");
        assert!(src.contains("http://127.0.0.1:8081/llm_query"));
        assert!(src.contains("def llm_query(prompt):"));
        assert!(src.contains("def llm_query_batch(prompts):"));
        assert!(src.contains("max_workers=_workers"));
        assert!(src.contains("min(len(prompts), 8)"));
    }

    #[test]
    fn tool_stubs_define_every_whitelisted_tool() {
        let src = tool_stub_source("http://host.docker.internal:8081", SANDBOX_TOOLS);
        assert!(src.contains("http://host.docker.internal:8081/tool_call"));
        for stub in SANDBOX_TOOLS {
            assert!(src.contains(&format!("def {}(", stub.name)), "{} missing", stub.name);
        }
        // Defaults are stripped from the forwarding call.
        assert!(src.contains("_tool_call('search_knowledge', query=query, top_k=top_k)"));
        assert!(src.contains("_tool_call('apple_search', query=query, framework=framework)"));
    }

    #[test]
    fn assign_text_escapes_content() {
        let src = assign_text_source("doc", "line one\n\"quoted\"");
        assert!(src.starts_with("doc = \""));
        assert!(src.contains("\\n"));
        assert!(src.contains("\\\"quoted\\\""));
    }

    #[test]
    fn store_result_embeds_json() {
        let src = store_result_source(&json!({"sentiment": "positive"}));
        assert!(src.contains("_sub_agent_result = _sr_json.loads("));
        assert!(src.contains("sentiment"));
    }

    #[test]
    fn whitelist_is_read_only() {
        let names: Vec<&str> = SANDBOX_TOOLS.iter().map(|t| t.name).collect();
        for forbidden in ["execute", "exec", "reset", "sub_agent", "ingest"] {
            assert!(!names.contains(&forbidden));
        }
    }
}
