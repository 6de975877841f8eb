//! The dangerous-pattern catalog (spec.md §4.5 step 2), kept as data so it
//! is extensible without code changes (spec.md §9).

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Injection,
    PrototypePollution,
    Execution,
    Filesystem,
    Network,
    Storage,
    Dom,
    Process,
    InfiniteLoop,
}

pub struct PatternRule {
    pub id: &'static str,
    pub regex: Lazy<Regex>,
    pub severity: Severity,
    pub category: Category,
    pub message: &'static str,
    /// `Some(cap)` means a source path granting `cap` makes the match not
    /// a violation; `None` means the rule is skipped entirely for
    /// privileged (substrate) paths and otherwise always checked.
    pub requires_cap: Option<Capability>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    CanEval,
    CanNetwork,
    CanFs,
    CanProcess,
}

macro_rules! rule {
    ($id:literal, $re:literal, $severity:expr, $category:expr, $message:literal, $cap:expr) => {
        PatternRule {
            id: $id,
            regex: Lazy::new(|| Regex::new($re).unwrap()),
            severity: $severity,
            category: $category,
            message: $message,
            requires_cap: $cap,
        }
    };
}

pub static CATALOG: Lazy<Vec<PatternRule>> = Lazy::new(|| {
    vec![
        rule!("eval-call", r"\beval\s*\(", Severity::Error, Category::Injection, "eval() is forbidden", Some(Capability::CanEval)),
        rule!("new-function", r"new\s+Function\s*\(", Severity::Error, Category::Injection, "new Function() is forbidden", Some(Capability::CanEval)),
        rule!("settimeout-string", r#"setTimeout\s*\(\s*["']"#, Severity::Error, Category::Injection, "setTimeout with a string body is forbidden", Some(Capability::CanEval)),
        rule!("indirect-eval", r"\(\s*0\s*,\s*eval\s*\)", Severity::Error, Category::Injection, "indirect eval is forbidden", Some(Capability::CanEval)),
        rule!("dynamic-script-tag", r#"createElement\s*\(\s*["']script["']"#, Severity::Error, Category::Injection, "dynamic <script> creation is forbidden", Some(Capability::CanEval)),
        rule!("dynamic-import", r"import\s*\(", Severity::Warning, Category::Injection, "dynamic import() is discouraged", Some(Capability::CanEval)),

        rule!("proto-assign", r"__proto__", Severity::Error, Category::PrototypePollution, "__proto__ access is forbidden", None),
        rule!("set-prototype-of", r"setPrototypeOf\s*\(", Severity::Error, Category::PrototypePollution, "setPrototypeOf is forbidden", None),
        rule!("constructor-prototype", r"constructor\.prototype", Severity::Error, Category::PrototypePollution, "constructor.prototype access is forbidden", None),
        rule!("prototype-write", r"(Object|Array)\.prototype\s*\.", Severity::Error, Category::PrototypePollution, "direct prototype writes are forbidden", None),

        rule!("with-statement", r"\bwith\s*\(", Severity::Error, Category::Execution, "the with statement is forbidden", None),

        rule!("fs-api", r"\brequire\s*\(\s*['\"]fs['\"]\s*\)|readFileSync|writeFileSync", Severity::Error, Category::Filesystem, "raw filesystem APIs are forbidden", Some(Capability::CanFs)),

        rule!("fetch", r"\bfetch\s*\(", Severity::Warning, Category::Network, "fetch() requires network capability", Some(Capability::CanNetwork)),
        rule!("xhr", r"XMLHttpRequest", Severity::Warning, Category::Network, "XMLHttpRequest requires network capability", Some(Capability::CanNetwork)),
        rule!("websocket", r"\bWebSocket\s*\(", Severity::Warning, Category::Network, "WebSocket requires network capability", Some(Capability::CanNetwork)),
        rule!("eventsource", r"EventSource\s*\(", Severity::Warning, Category::Network, "EventSource requires network capability", Some(Capability::CanNetwork)),
        rule!("sendbeacon", r"sendBeacon\s*\(", Severity::Warning, Category::Network, "sendBeacon requires network capability", Some(Capability::CanNetwork)),

        rule!("localstorage", r"\blocalStorage\b", Severity::Warning, Category::Storage, "localStorage access flagged", None),
        rule!("sessionstorage", r"\bsessionStorage\b", Severity::Warning, Category::Storage, "sessionStorage access flagged", None),
        rule!("indexeddb", r"\bindexedDB\b", Severity::Warning, Category::Storage, "indexedDB access flagged", None),
        rule!("document-cookie", r"document\.cookie", Severity::Warning, Category::Storage, "document.cookie access flagged", None),

        rule!("document-write", r"document\.write\s*\(", Severity::Error, Category::Dom, "document.write is forbidden", None),
        rule!("inner-html", r"\.innerHTML\s*=", Severity::Error, Category::Dom, "innerHTML assignment is forbidden", None),
        rule!("outer-html", r"\.outerHTML\s*=", Severity::Error, Category::Dom, "outerHTML assignment is forbidden", None),
        rule!("insert-adjacent-html", r"insertAdjacentHTML\s*\(", Severity::Error, Category::Dom, "insertAdjacentHTML is forbidden", None),

        rule!("process-env", r"process\.env", Severity::Warning, Category::Process, "process.env access flagged", Some(Capability::CanProcess)),
        rule!("child-process", r"child_process", Severity::Error, Category::Process, "child process spawning is forbidden", Some(Capability::CanProcess)),
        rule!("process-exit", r"process\.exit\s*\(", Severity::Error, Category::Process, "process.exit is forbidden", Some(Capability::CanProcess)),

        rule!("while-true", r"while\s*\(\s*true\s*\)", Severity::Warning, Category::InfiniteLoop, "unconditional while(true) loop", None),
        rule!("for-ever", r"for\s*\(\s*;\s*;\s*\)", Severity::Warning, Category::InfiniteLoop, "unconditional for(;;) loop", None),
        rule!("while-one", r"while\s*\(\s*1\s*\)", Severity::Warning, Category::InfiniteLoop, "unconditional while(1) loop", None),
    ]
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_has_entries_in_every_category() {
        use Category::*;
        let categories = [
            Injection,
            PrototypePollution,
            Execution,
            Filesystem,
            Network,
            Storage,
            Dom,
            Process,
            InfiniteLoop,
        ];
        for cat in categories {
            assert!(CATALOG.iter().any(|r| r.category == cat), "missing category {cat:?}");
        }
    }

    #[test]
    fn eval_pattern_matches() {
        let rule = CATALOG.iter().find(|r| r.id == "eval-call").unwrap();
        assert!(rule.regex.is_match("eval('2+2')"));
        assert!(!rule.regex.is_match("const evaluate = 1;"));
    }
}
