//! Patterns the session automaton waits for.

use regex::bytes::Regex;

use crate::error::SessionError;

/// Host-key confirmation, e.g. `Are you sure you want to continue connecting (yes/no)?`.
pub fn identity_confirmation() -> Regex {
    Regex::new(r"(?i)yes/no").expect("static identity pattern is valid")
}

/// Password / passphrase prompt.
pub fn credential_prompt() -> Regex {
    Regex::new(r"(?i)pass(word|phrase)[^:\r\n]*:").expect("static credential pattern is valid")
}

/// Messages a device prints when it rejects the credential.
pub fn credential_rejected() -> Regex {
    Regex::new(r"(?i)(permission denied|access denied|authentication failed|login incorrect)")
        .expect("static rejection pattern is valid")
}

/// Network-level failures the `ssh` client reports before any login exchange.
pub fn connect_failure() -> Regex {
    Regex::new(
        r"(?i)(ssh: connect to host|could not resolve hostname|no route to host|connection refused|connection timed out|network is unreachable)",
    )
    .expect("static connect failure pattern is valid")
}

/// Compile a caller-supplied prompt pattern.
pub fn compile_prompt(pattern: &str) -> Result<Regex, SessionError> {
    if pattern.is_empty() {
        return Err(SessionError::InvalidPattern("prompt pattern is empty".into()));
    }
    Regex::new(pattern).map_err(|e| SessionError::InvalidPattern(e.to_string()))
}

/// Literal prompt pattern for a device, `R1` + `#` -> `R1#`.
pub fn prompt_for_hostname(hostname: &str, suffix: &str) -> String {
    format!("{}{}", regex::escape(hostname), regex::escape(suffix))
}
