//! Turns raw core output into something a person can act on: a one-line
//! summary, hints for known failure signatures, and a bounded excerpt.

use corewarden_core::{Diagnostic, LogLevel, LogLine, RuntimeDiagnosticKind, strip_ansi};
use regex::Regex;
use std::sync::LazyLock;

/// Outputs longer than this are cut down to head + tail
const WINDOW_LIMIT: usize = 60;
const WINDOW_HEAD: usize = 20;
const WINDOW_TAIL: usize = 40;

struct Signature {
    pattern: Regex,
    hint: &'static str,
}

fn signature(pattern: &str, hint: &'static str) -> Signature {
    Signature {
        pattern: Regex::new(pattern).expect("signature pattern is valid"),
        hint,
    }
}

static SIGNATURES: LazyLock<Vec<Signature>> = LazyLock::new(|| {
    vec![
        signature(
            r"permission denied|operation not permitted|access is denied|requires? (root|administrator)|elevat",
            "insufficient privilege: the core needs to run as administrator (Windows) or root / CAP_NET_ADMIN (Linux, macOS)",
        ),
        signature(
            r"wintun|/dev/net/tun|tun device|configure tun|open tun|start tun|no such device|driver",
            "tunnel support is missing: make sure the TUN driver is installed and not blocked by security software",
        ),
        signature(
            r"unknown field|json: cannot unmarshal|decode config|parse config|invalid character|unexpected end of json|unknown (outbound|inbound|rule|dns)",
            "the configuration contains a malformed or unknown field: it may have been written for a different core version",
        ),
        signature(
            r"enable_deprecated|deprecated|legacy .* (is|are) removed",
            "the configuration relies on deprecated features: the compatibility flags must be enabled for this core version",
        ),
        signature(
            r"\bmtu\b|message too long|fragmentation|packet too big",
            "packets exceed the path MTU: lower the tunnel MTU (for example to 1400)",
        ),
        signature(
            r"\bquic\b|\budp\b",
            "UDP traffic is failing: the network or a firewall may block UDP/QUIC",
        ),
        signature(
            r"address already in use|only one usage of each socket address|bind: ",
            "a listening port is already in use by another program",
        ),
    ]
});

static SEVERE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(panic|fatal|error)\b").expect("severity pattern is valid")
});

static STACK_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\s|goroutine \d+|created by |\S+\.go:\d+|exit status \d+$)")
        .expect("stack pattern is valid")
});

static RULE_SET_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)rule-set|rule_set|ruleset|geosite|geoip").expect("rule-set pattern is valid")
});

static DOWNLOAD_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)download|fetch|http get|update (rule|provider)").expect("download pattern is valid")
});

/// Strip ANSI sequences and drop trailing whitespace from each captured line
pub fn clean_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    lines
        .into_iter()
        .map(|line| strip_ansi(line).trim_end().to_string())
        .collect()
}

/// Keep head and tail of long output with a marker for what was dropped
pub fn window(lines: &[String]) -> Vec<String> {
    if lines.len() <= WINDOW_LIMIT {
        return lines.to_vec();
    }
    let omitted = lines.len() - WINDOW_HEAD - WINDOW_TAIL;
    let mut kept = Vec::with_capacity(WINDOW_HEAD + WINDOW_TAIL + 1);
    kept.extend_from_slice(&lines[..WINDOW_HEAD]);
    kept.push(format!("... {omitted} lines omitted ..."));
    kept.extend_from_slice(&lines[lines.len() - WINDOW_TAIL..]);
    kept
}

/// Pick the most telling line: the first panic/fatal/error line, else the
/// first line outside a stack trace, else the last line
pub fn summarize(lines: &[String]) -> Option<String> {
    let non_empty = || lines.iter().filter(|line| !line.trim().is_empty());

    non_empty()
        .find(|line| SEVERE_LINE.is_match(line))
        .or_else(|| non_empty().find(|line| !STACK_LINE.is_match(line)))
        .or_else(|| non_empty().last())
        .map(|line| line.trim().to_string())
}

/// One hint per matched failure signature, in signature order
pub fn hints(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase();
    SIGNATURES
        .iter()
        .filter(|signature| signature.pattern.is_match(&lowered))
        .map(|signature| signature.hint.to_string())
        .collect()
}

/// Build a diagnostic from captured output. Hints scan every line; the excerpt
/// is the bounded window.
pub fn diagnose(exit_code: Option<i32>, lines: &[String], fallback: &str) -> Diagnostic {
    let summary = summarize(lines).unwrap_or_else(|| fallback.to_string());
    Diagnostic::new(summary)
        .with_exit_code(exit_code)
        .with_hints(hints(&lines.join("\n")))
        .with_recent_logs(window(lines))
}

/// Flag runtime lines about rule-set loading or remote downloads
pub fn classify_runtime(line: &LogLine) -> Option<RuntimeDiagnosticKind> {
    let lowered = line.text.to_lowercase();
    let troubled = line.level >= LogLevel::Warn
        || lowered.contains("fail")
        || lowered.contains("timeout");
    if !troubled {
        return None;
    }
    if RULE_SET_LINE.is_match(&line.text) {
        Some(RuntimeDiagnosticKind::RuleSet)
    } else if DOWNLOAD_LINE.is_match(&line.text) {
        Some(RuntimeDiagnosticKind::Download)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|l| l.to_string()).collect()
    }

    #[test]
    fn test_window_keeps_short_output() {
        let output: Vec<String> = (0..60).map(|i| format!("line {i}")).collect();
        assert_eq!(window(&output), output);
    }

    #[test]
    fn test_window_cuts_long_output() {
        let output: Vec<String> = (0..100).map(|i| format!("line {i}")).collect();
        let kept = window(&output);
        assert_eq!(kept.len(), 61);
        assert_eq!(kept[0], "line 0");
        assert_eq!(kept[19], "line 19");
        assert_eq!(kept[20], "... 40 lines omitted ...");
        assert_eq!(kept[21], "line 60");
        assert_eq!(kept[60], "line 99");
    }

    #[test]
    fn test_summary_prefers_severe_line() {
        let output = lines(&[
            "INFO[0000] loading config",
            "FATAL[0000] start service: initialize inbound/tun[0]: configure tun interface: operation not permitted",
            "ERROR later",
        ]);
        assert!(summarize(&output).unwrap().starts_with("FATAL[0000] start service"));
    }

    #[test]
    fn test_summary_skips_stack_trace() {
        let output = lines(&[
            "goroutine 1 [running]:",
            "\tmain.main()",
            "runtime/proc.go:250",
            "something odd happened",
        ]);
        assert_eq!(summarize(&output).unwrap(), "something odd happened");
    }

    #[test]
    fn test_summary_falls_back_to_last_line() {
        let output = lines(&["goroutine 1 [running]:", "\tmain.main()", ""]);
        assert_eq!(summarize(&output).unwrap(), "main.main()");
        assert_eq!(summarize(&[]), None);
    }

    #[test]
    fn test_hints_match_signatures_once() {
        let text = "FATAL listen tcp 127.0.0.1:2080: bind: address already in use\n\
                    ERROR listen udp: bind: address already in use\n\
                    open /dev/net/tun: Operation not permitted";
        let found = hints(text);
        assert_eq!(found.len(), 4);
        assert!(found.iter().any(|h| h.contains("insufficient privilege")));
        assert!(found.iter().any(|h| h.contains("tunnel support")));
        assert!(found.iter().any(|h| h.contains("UDP")));
        assert!(found.iter().any(|h| h.contains("port is already in use")));
    }

    #[test]
    fn test_hints_for_config_and_compat() {
        let found = hints(
            "decode config at ./config.json: outbounds[0].unknown field \"foo\"\n\
             legacy DNS servers is deprecated, set ENABLE_DEPRECATED_LEGACY_DNS_SERVERS=true",
        );
        assert_eq!(found.len(), 2);
        assert!(found[0].contains("malformed"));
        assert!(found[1].contains("compatibility flags"));
    }

    #[test]
    fn test_diagnose_combines_parts() {
        let output = clean_lines(["\x1b[31mFATAL\x1b[0m[0000] mtu too large"]);
        let diagnostic = diagnose(Some(1), &output, "check failed");
        assert_eq!(diagnostic.exit_code, Some(1));
        assert_eq!(diagnostic.summary, "FATAL[0000] mtu too large");
        assert_eq!(diagnostic.hints.len(), 1);
        assert_eq!(diagnostic.recent_logs, output);

        let empty = diagnose(Some(2), &[], "check failed");
        assert_eq!(empty.summary, "check failed");
    }

    #[test]
    fn test_runtime_classifier() {
        let rule_set = LogLine::parse(
            "ERROR[0012] router: initialize rule-set[geosite-cn]: download failed",
        );
        assert_eq!(classify_runtime(&rule_set), Some(RuntimeDiagnosticKind::RuleSet));

        let download = LogLine::parse("WARN[0003] fetch remote provider: timeout");
        assert_eq!(classify_runtime(&download), Some(RuntimeDiagnosticKind::Download));

        let quiet = LogLine::parse("INFO[0001] rule-set geosite-cn loaded");
        assert_eq!(classify_runtime(&quiet), None);
    }
}
