//! Formatter interface (§4.2) — the caller's contract with the batching
//! producer. The core invokes `common`/`item`/`parse_element`; it never
//! defines domain formatting itself.

/// Produces formatted lines for a scoring call and (in audit mode) maps
/// opaque engine tokens to display labels.
///
/// Default methods mirror `core_events::EventHooks`/`core_plugin::PluginHost`:
/// a minimal trait surface with a trivial no-op implementor
/// ([`PassthroughFormatter`]) so most callers only implement what they need.
pub trait Formatter<C, I> {
    /// Produces the shared prefix of every line for this call. Invoked once
    /// per `predict`/`train` call.
    fn common(&self, ctx: &C) -> anyhow::Result<String>;

    /// Produces the per-item suffix. Invoked at most once per item; the
    /// core may stop invoking it the moment the deadline elapses.
    fn item(&self, ctx: &C, item: &I) -> anyhow::Result<String>;

    /// Maps an opaque audit-mode token (e.g. a hashed feature identifier) to
    /// a human-readable label. Only called in audit mode. Default:
    /// passthrough of the token itself.
    fn parse_element(&self, token: &str) -> String {
        token.to_string()
    }
}

/// A formatter for callers who pre-format their own lines. `common` returns
/// the empty string; `item` expects `I: AsRef<str>` and passes it through
/// unchanged save for stripping a trailing newline the caller may have
/// already included.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughFormatter;

impl<C, I: AsRef<str>> Formatter<C, I> for PassthroughFormatter {
    fn common(&self, _ctx: &C) -> anyhow::Result<String> {
        Ok(String::new())
    }

    fn item(&self, _ctx: &C, item: &I) -> anyhow::Result<String> {
        Ok(item.as_ref().trim_end_matches('\n').to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_strips_trailing_newline() {
        let f = PassthroughFormatter;
        let line = Formatter::<(), String>::item(&f, &(), &"already formatted\n".to_string())
            .unwrap();
        assert_eq!(line, "already formatted");
    }

    #[test]
    fn passthrough_common_is_empty() {
        let f = PassthroughFormatter;
        let prefix = Formatter::<(), String>::common(&f, &()).unwrap();
        assert!(prefix.is_empty());
    }
}
