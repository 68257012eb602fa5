//! Conservative capability inference (§4.2, SPEC_FULL.md §D.1/§E.1).
//!
//! When a `HandlerDefinition` does not declare capabilities, the source text
//! is scanned for host-call patterns. A literal string key/name/component id
//! following the call is attributed a scoped token; anything else (a
//! computed key, a template literal, a variable) falls back to the wildcard
//! token for that domain/action, since the scanner cannot prove a tighter
//! bound. This is explicitly the "broad fallback, flagged unsafe" path
//! spec.md §9 calls out — it trades precision for never under-granting.

use panelrt_common::CapabilityToken;
use regex::Regex;
use std::sync::OnceLock;

fn literal_key(pattern: &'static str) -> &'static Regex {
    static CACHE: OnceLock<std::collections::HashMap<&'static str, Regex>> = OnceLock::new();
    CACHE
        .get_or_init(|| {
            let mut m = std::collections::HashMap::new();
            for p in PATTERNS {
                m.insert(*p, Regex::new(p).unwrap());
            }
            m
        })
        .get(pattern)
        .expect("pattern not registered in PATTERNS")
}

const STATE_READ: &str = r#"\$state\.(?:get|has)\(\s*['"]([A-Za-z0-9_.\-]+)['"]"#;
const STATE_READ_DYNAMIC: &str = r"\$state\.(?:get|has)\(\s*[^'\x22]";
const STATE_READ_KEYS: &str = r"\$state\.keys\(\s*\)";
const STATE_WRITE: &str = r#"\$state\.(?:set|delete)\(\s*['"]([A-Za-z0-9_.\-]+)['"]"#;
const STATE_WRITE_DYNAMIC: &str = r"\$state\.(?:set|delete)\(\s*[^'\x22]";
const EMIT_NAMED: &str = r#"\$emit\(\s*['"]([A-Za-z0-9_.\-]+)['"]"#;
const EMIT_DYNAMIC: &str = r"\$emit\(\s*[^'\x22]";
// `$emit.toast(kind, message)` always emits an event literally named
// "toast" (SPEC_FULL.md §C; enforced in bindings.rs) — the first argument is
// the toast's `kind`, not the event name, so it must never feed the
// name-capturing/wildcard logic above.
const EMIT_TOAST: &str = r"\$emit\.toast\(";
const VIEW_NAMED: &str = r"\$view\.([A-Za-z0-9_\-]+)\.\w+\(";
const VIEW_DYNAMIC: &str = r"\$view\[";
const EXT_NAMED: &str = r"\$ext\.([A-Za-z0-9_\-]+)\.\w+\(";
const EXT_DYNAMIC: &str = r"\$ext\[";

const PATTERNS: &[&str] = &[
    STATE_READ,
    STATE_READ_DYNAMIC,
    STATE_READ_KEYS,
    STATE_WRITE,
    STATE_WRITE_DYNAMIC,
    EMIT_NAMED,
    EMIT_DYNAMIC,
    EMIT_TOAST,
    VIEW_NAMED,
    VIEW_DYNAMIC,
    EXT_NAMED,
    EXT_DYNAMIC,
];

/// Scans `source` and returns the minimal capability set the scanner can
/// attribute, falling back to the `*All` variant for a domain/action as soon
/// as it observes one dynamic (non-literal) access in that family.
pub fn infer(source: &str) -> Vec<CapabilityToken> {
    let mut tokens: Vec<CapabilityToken> = Vec::new();
    let mut push_unique = |t: CapabilityToken, tokens: &mut Vec<CapabilityToken>| {
        if !tokens.contains(&t) {
            tokens.push(t);
        }
    };

    let state_read_all = literal_key(STATE_READ_DYNAMIC).is_match(source)
        || literal_key(STATE_READ_KEYS).is_match(source);
    for cap in literal_key(STATE_READ).captures_iter(source) {
        push_unique(CapabilityToken::StateRead(cap[1].to_string()), &mut tokens);
    }
    if state_read_all {
        tokens.retain(|t| !matches!(t, CapabilityToken::StateRead(_)));
        push_unique(CapabilityToken::StateReadAll, &mut tokens);
    }

    let state_write_all = literal_key(STATE_WRITE_DYNAMIC).is_match(source);
    for cap in literal_key(STATE_WRITE).captures_iter(source) {
        push_unique(CapabilityToken::StateWrite(cap[1].to_string()), &mut tokens);
    }
    if state_write_all {
        tokens.retain(|t| !matches!(t, CapabilityToken::StateWrite(_)));
        push_unique(CapabilityToken::StateWriteAll, &mut tokens);
    }

    let emit_all = literal_key(EMIT_DYNAMIC).is_match(source);
    for cap in literal_key(EMIT_NAMED).captures_iter(source) {
        push_unique(CapabilityToken::EventsEmit(cap[1].to_string()), &mut tokens);
    }
    if emit_all {
        tokens.retain(|t| !matches!(t, CapabilityToken::EventsEmit(_)));
        push_unique(CapabilityToken::EventsEmitAll, &mut tokens);
    }
    if literal_key(EMIT_TOAST).is_match(source) && !tokens.contains(&CapabilityToken::EventsEmitAll) {
        push_unique(CapabilityToken::EventsEmit("toast".to_string()), &mut tokens);
    }

    let view_all = literal_key(VIEW_DYNAMIC).is_match(source);
    for cap in literal_key(VIEW_NAMED).captures_iter(source) {
        push_unique(CapabilityToken::ViewUpdate(cap[1].to_string()), &mut tokens);
    }
    if view_all {
        tokens.retain(|t| !matches!(t, CapabilityToken::ViewUpdate(_)));
        push_unique(CapabilityToken::ViewUpdateAll, &mut tokens);
    }

    let ext_all = literal_key(EXT_DYNAMIC).is_match(source);
    for cap in literal_key(EXT_NAMED).captures_iter(source) {
        push_unique(CapabilityToken::Extension(cap[1].to_string()), &mut tokens);
    }
    if ext_all {
        tokens.retain(|t| !matches!(t, CapabilityToken::Extension(_)));
        push_unique(CapabilityToken::ExtensionAll, &mut tokens);
    }

    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_literal_state_and_extension_access() {
        let source = r#"
            $state.set("pending", true);
            const r = await $ext.http.get(url);
            $state.set("body", r.data);
        "#;
        let tokens = infer(source);
        assert!(tokens.contains(&CapabilityToken::StateWrite("pending".into())));
        assert!(tokens.contains(&CapabilityToken::StateWrite("body".into())));
        assert!(tokens.contains(&CapabilityToken::Extension("http".into())));
    }

    #[test]
    fn dynamic_key_widens_to_wildcard() {
        let source = r#"
            const key = computeKey();
            $state.set(key, 1);
        "#;
        let tokens = infer(source);
        assert!(tokens.contains(&CapabilityToken::StateWriteAll));
        assert!(!tokens.iter().any(|t| matches!(t, CapabilityToken::StateWrite(_))));
    }

    #[test]
    fn emit_toast_shorthand_infers_the_fixed_toast_event_name() {
        // The first argument is the toast's `kind`, not the event name — the
        // event the host boundary actually checks is always "toast".
        let tokens = infer(r#"$emit.toast("info", "done")"#);
        assert!(tokens.contains(&CapabilityToken::EventsEmit("toast".into())));
        assert!(!tokens.iter().any(|t| matches!(t, CapabilityToken::EventsEmit(name) if name == "info")));
    }

    #[test]
    fn state_keys_requires_wildcard() {
        let tokens = infer("$state.keys()");
        assert!(tokens.contains(&CapabilityToken::StateReadAll));
    }

    #[test]
    fn bracket_access_on_view_and_ext_widens_to_wildcard() {
        let source = r#"
            const id = pickComponent();
            $view[id].update({ visible: true });
            $ext[extensionName()].call();
        "#;
        let tokens = infer(source);
        assert!(tokens.contains(&CapabilityToken::ViewUpdateAll));
        assert!(tokens.contains(&CapabilityToken::ExtensionAll));
        assert!(!tokens.iter().any(|t| matches!(t, CapabilityToken::ViewUpdate(_))));
        assert!(!tokens.iter().any(|t| matches!(t, CapabilityToken::Extension(_))));
    }
}
