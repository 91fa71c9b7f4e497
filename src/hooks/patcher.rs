//! Document patching.
//!
//! Takes an intercepted HTML body and splices in one loader script plus
//! a `<link>` tag per matching stylesheet hook, right after the opening
//! `<head>`. The loader adds script modules through the DOM and checks
//! for an existing element first, so a document that is patched twice
//! ends up with each asset exactly once.

use regex::Regex;
use serde_json::Value;

use crate::config::ConfigStore;
use crate::encoding;
use crate::hooks::assets;
use crate::hooks::registry::{compile_url_pattern, HookDescriptor, HookKind};

const HEAD_TAG: &str = "<head>";

/// Element id of the injected loader block; doubles as its own
/// existence guard when a document is re-evaluated.
pub const LOADER_ELEMENT_ID: &str = "millennium-injected";

/// Pages that may carry theme CSS but never third-party script.
const JAVASCRIPT_BLACKLIST: [&str; 1] = [r"https://checkout\.steampowered\.com/.*"];

/// Origins released untouched, with neither styles nor script.
const PASSTHROUGH_URLS: [&str; 5] = [
    r#"https?://(?:[\w-]+\.)*paypal\.com/[^\s"']*"#,
    r#"https?://(?:[\w-]+\.)*paypalobjects\.com/[^\s"']*"#,
    r#"https?://(?:[\w-]+\.)*recaptcha\.net/[^\s"']*"#,
    r#"https?://(?:[\w-]+\.)*(?:youtube(?:-nocookie)?|youtu|ytimg|googlevideo|googleusercontent|studioyoutube)\.com/[^\s"']*"#,
    r#"https?://(?:[\w-]+\.)*youtu\.be/[^\s"']*"#,
];

/// What the active configuration lets the patcher inject.
#[derive(Debug, Clone, Copy)]
pub struct InjectionPolicy {
    pub allow_styles: bool,
    pub allow_scripts: bool,
}

impl InjectionPolicy {
    /// Everything on. Hook matching decides alone.
    #[must_use]
    pub const fn permit_all() -> Self {
        Self {
            allow_styles: true,
            allow_scripts: true,
        }
    }

    /// Read the gates for the active theme from the settings store.
    /// Both default to allowed; a policy failure must leave the page
    /// usable, just unthemed.
    #[must_use]
    pub fn from_store(store: &ConfigStore) -> Self {
        Self {
            allow_styles: store.get_bool("themes.allowedStyles", true),
            allow_scripts: store.get_bool("themes.allowedScripts", true),
        }
    }
}

/// Splices loaders and stylesheet links into intercepted documents.
pub struct DocumentPatcher {
    blacklist: Vec<Regex>,
    passthrough: Vec<Regex>,
    ipc_port: u16,
}

impl DocumentPatcher {
    #[must_use]
    pub fn new(ipc_port: u16) -> Self {
        let blacklist = JAVASCRIPT_BLACKLIST
            .iter()
            .filter_map(|pattern| compile_url_pattern(pattern).ok())
            .collect();
        let passthrough = PASSTHROUGH_URLS
            .iter()
            .filter_map(|pattern| compile_url_pattern(pattern).ok())
            .collect();
        Self {
            blacklist,
            passthrough,
            ipc_port,
        }
    }

    /// Whether `url` is barred from receiving script hooks.
    #[must_use]
    pub fn is_blacklisted(&self, url: &str) -> bool {
        self.blacklist.iter().any(|pattern| pattern.is_match(url))
    }

    /// Whether `url` must keep its stock response entirely.
    #[must_use]
    pub fn is_passthrough(&self, url: &str) -> bool {
        self.passthrough.iter().any(|pattern| pattern.is_match(url))
    }

    /// Patch `original` for `request_url`.
    ///
    /// Every enabled hook whose pattern matches contributes either a
    /// `<link>` tag or a module url handed to the loader script, in
    /// registration order. Documents without a `<head>` come back
    /// untouched. Blacklisted urls keep their stylesheets but get no
    /// loader at all.
    #[must_use]
    pub fn patch_document(
        &self,
        request_url: &str,
        original: &str,
        hooks: &[HookDescriptor],
        policy: &InjectionPolicy,
    ) -> String {
        let Some(head) = original.find(HEAD_TAG) else {
            return original.to_string();
        };
        let splice_at = head + HEAD_TAG.len();

        let mut css_links = String::new();
        let mut module_urls = Vec::new();
        for hook in hooks {
            if !hook.pattern.is_match(request_url) {
                continue;
            }
            match hook.kind {
                HookKind::Stylesheet if policy.allow_styles => {
                    let href = encoding::url_from_path(assets::STYLESHEET_HOST, &hook.path);
                    css_links.push_str(&format!("<link rel=\"stylesheet\" href=\"{href}\">\n"));
                }
                HookKind::Javascript if policy.allow_scripts => {
                    module_urls.push(encoding::url_from_path(assets::JAVASCRIPT_HOST, &hook.path));
                }
                _ => {}
            }
        }

        let mut shim = String::new();
        if !self.is_blacklisted(request_url) {
            shim.push_str(&self.loader_script(&module_urls));
        }
        shim.push_str(&css_links);

        let mut patched = String::with_capacity(original.len() + shim.len());
        patched.push_str(&original[..splice_at]);
        patched.push_str(&shim);
        patched.push_str(&original[splice_at..]);
        patched
    }

    /// The loader block spliced into documents.
    #[must_use]
    pub fn loader_script(&self, module_urls: &[String]) -> String {
        format!(
            "<script type=\"module\" id=\"{LOADER_ELEMENT_ID}\" defer>\n{}\n</script>\n",
            self.loader_source(module_urls)
        )
    }

    /// Raw loader source, also usable with
    /// `Page.addScriptToEvaluateOnNewDocument`. Each module is added
    /// through the DOM behind a `querySelector` existence check.
    #[must_use]
    pub fn loader_source(&self, module_urls: &[String]) -> String {
        let urls = module_urls
            .iter()
            .map(|url| format!("\"{url}\""))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            concat!(
                "const MILLENNIUM_IPC_PORT = {port};\n",
                "const MILLENNIUM_FRONTEND_MODULES = [{urls}];\n",
                "for (const src of MILLENNIUM_FRONTEND_MODULES) {{\n",
                "    if (document.querySelector(`script[src=\"${{src}}\"]`)) continue;\n",
                "    const node = document.createElement('script');\n",
                "    node.type = 'module';\n",
                "    node.src = src;\n",
                "    document.head.appendChild(node);\n",
                "}}"
            ),
            port = self.ipc_port,
            urls = urls
        )
    }

    /// Build the `Fetch.fulfillRequest` params for a patched document,
    /// carrying over status and headers from the paused response.
    #[must_use]
    pub fn fulfill_params(paused_params: &Value, request_id: &str, patched: &str) -> Value {
        let code = paused_params
            .get("responseStatusCode")
            .and_then(Value::as_i64)
            .unwrap_or(200);
        let phrase = match paused_params.get("responseStatusText").and_then(Value::as_str) {
            Some(text) if !text.is_empty() => text.to_string(),
            _ => "OK".to_string(),
        };
        let headers = paused_params
            .get("responseHeaders")
            .cloned()
            .unwrap_or_else(|| Value::Array(Vec::new()));
        serde_json::json!({
            "requestId": request_id,
            "responseCode": code,
            "responsePhrase": phrase,
            "responseHeaders": headers,
            "body": encoding::encode_body(patched.as_bytes()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::registry::HookRegistry;
    use pretty_assertions::assert_eq;

    const DOC: &str = "<html><head><title>store</title></head><body></body></html>";

    fn hooks() -> Vec<HookDescriptor> {
        let registry = HookRegistry::new();
        registry
            .add("/skins/dark/skin.css", ".*", HookKind::Stylesheet)
            .unwrap();
        registry
            .add("/plugins/mod/index.js", ".*", HookKind::Javascript)
            .unwrap();
        registry
            .add(
                "/skins/dark/store.css",
                r"https://store\.steampowered\.com/.*",
                HookKind::Stylesheet,
            )
            .unwrap();
        registry.snapshot()
    }

    #[test]
    fn matching_hooks_are_spliced_after_head_in_order() {
        let patcher = DocumentPatcher::new(12906);
        let out = patcher.patch_document(
            "https://store.steampowered.com/",
            DOC,
            &hooks(),
            &InjectionPolicy::permit_all(),
        );

        let skin = out.find("skin.css").unwrap();
        let store = out.find("store.css").unwrap();
        let head = out.find("<head>").unwrap();
        assert!(head < skin && skin < store);
        assert!(out.contains("css.millennium.app"));
        assert!(out.contains("js.millennium.app"));
        assert!(out.ends_with("</html>"));
    }

    #[test]
    fn loader_guards_against_double_insertion() {
        let patcher = DocumentPatcher::new(12906);
        let out = patcher.patch_document(
            "https://store.steampowered.com/",
            DOC,
            &hooks(),
            &InjectionPolicy::permit_all(),
        );
        assert!(out.contains("document.querySelector"));
        assert!(out.contains(LOADER_ELEMENT_ID));
    }

    #[test]
    fn non_matching_patterns_contribute_nothing() {
        let patcher = DocumentPatcher::new(12906);
        let out = patcher.patch_document(
            "https://help.steampowered.com/",
            DOC,
            &hooks(),
            &InjectionPolicy::permit_all(),
        );
        // the per-url stylesheet stays out, the catch-alls go in
        assert!(!out.contains("store.css"));
        assert!(out.contains("skin.css"));
    }

    #[test]
    fn pattern_fragments_do_not_hook_urls_containing_them() {
        let registry = HookRegistry::new();
        registry
            .add("/skins/dark/store.css", "store", HookKind::Stylesheet)
            .unwrap();
        let patcher = DocumentPatcher::new(12906);
        let out = patcher.patch_document(
            "https://store.steampowered.com/",
            DOC,
            &registry.snapshot(),
            &InjectionPolicy::permit_all(),
        );
        assert!(!out.contains("store.css"));
    }

    #[test]
    fn blacklisting_requires_the_whole_url_to_match() {
        let patcher = DocumentPatcher::new(12906);
        assert!(patcher.is_blacklisted("https://checkout.steampowered.com/pay"));
        assert!(!patcher
            .is_blacklisted("https://evil.example/?next=https://checkout.steampowered.com/pay"));
    }

    #[test]
    fn payment_and_video_origins_are_passthrough() {
        let patcher = DocumentPatcher::new(12906);
        assert!(patcher.is_passthrough("https://www.paypal.com/signin"));
        assert!(patcher.is_passthrough("https://www.recaptcha.net/recaptcha/api2/anchor"));
        assert!(patcher.is_passthrough("https://www.youtube-nocookie.com/embed/xyz"));
        assert!(!patcher.is_passthrough("https://store.steampowered.com/"));
        assert!(!patcher.is_passthrough("https://notpaypal.example/paypal.com/x"));
    }

    #[test]
    fn document_without_head_passes_through_unchanged() {
        let patcher = DocumentPatcher::new(12906);
        let body = "{\"not\": \"html\"}";
        let out = patcher.patch_document(
            "https://store.steampowered.com/data",
            body,
            &hooks(),
            &InjectionPolicy::permit_all(),
        );
        assert_eq!(out, body);
    }

    #[test]
    fn checkout_keeps_styles_but_loses_the_loader() {
        let patcher = DocumentPatcher::new(12906);
        let out = patcher.patch_document(
            "https://checkout.steampowered.com/purchase",
            DOC,
            &hooks(),
            &InjectionPolicy::permit_all(),
        );
        assert!(out.contains("skin.css"));
        assert!(!out.contains("<script"));
        assert!(!out.contains("js.millennium.app"));
    }

    #[test]
    fn policy_gates_suppress_each_kind_independently() {
        let patcher = DocumentPatcher::new(12906);
        let no_css = InjectionPolicy {
            allow_styles: false,
            allow_scripts: true,
        };
        let out = patcher.patch_document(
            "https://store.steampowered.com/",
            DOC,
            &hooks(),
            &no_css,
        );
        assert!(!out.contains("skin.css"));
        assert!(out.contains("js.millennium.app"));

        let no_js = InjectionPolicy {
            allow_styles: true,
            allow_scripts: false,
        };
        let out = patcher.patch_document(
            "https://store.steampowered.com/",
            DOC,
            &hooks(),
            &no_js,
        );
        assert!(out.contains("skin.css"));
        assert!(!out.contains("js.millennium.app"));
    }

    #[test]
    fn fulfill_params_carry_over_status_and_headers() {
        let paused = serde_json::json!({
            "responseStatusCode": 206,
            "responseStatusText": "Partial Content",
            "responseHeaders": [{ "name": "Server", "value": "valve" }],
        });
        let params = DocumentPatcher::fulfill_params(&paused, "req-9", "<html/>");
        assert_eq!(params["responseCode"], 206);
        assert_eq!(params["responsePhrase"], "Partial Content");
        assert_eq!(params["responseHeaders"][0]["name"], "Server");
    }

    #[test]
    fn fulfill_params_default_to_200_ok() {
        let params =
            DocumentPatcher::fulfill_params(&serde_json::json!({}), "req-10", "<html/>");
        assert_eq!(params["responseCode"], 200);
        assert_eq!(params["responsePhrase"], "OK");
        assert_eq!(params["responseHeaders"], serde_json::json!([]));
    }
}
