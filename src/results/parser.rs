use crate::results::grammars::{cargo, generic, go, jest, pytest};
use crate::results::{Framework, ParsedTestResult};

/// Parse raw test-runner output.
///
/// With no `hint`, the framework is detected from structural markers (JSON
/// envelope shape, summary lines). A grammar that cannot make sense of the
/// text falls back to the generic line heuristic, and output nothing
/// recognises becomes a single synthetic failure carrying a raw excerpt.
/// Never panics.
pub fn parse(raw: &str, hint: Option<Framework>) -> ParsedTestResult {
    let framework = hint.unwrap_or_else(|| detect(raw));

    let parsed = match framework {
        Framework::Jest => jest::parse(raw),
        Framework::Pytest => pytest::parse(raw),
        Framework::Cargo => cargo::parse(raw),
        Framework::Go => go::parse(raw),
        Framework::Generic => None,
    };

    match parsed {
        Some(result) => result,
        None => {
            if framework != Framework::Generic {
                tracing::debug!(
                    framework = %framework,
                    "Grammar did not match, falling back to line heuristic"
                );
            }
            generic::parse(raw).unwrap_or_else(|| {
                tracing::warn!(bytes = raw.len(), "Test output not recognised by any grammar");
                ParsedTestResult::unparseable(Framework::Generic, raw)
            })
        }
    }
}

/// Pick a grammar from the shape of the output.
pub fn detect(raw: &str) -> Framework {
    if jest::detect(raw) {
        Framework::Jest
    } else if cargo::detect(raw) {
        Framework::Cargo
    } else if go::detect(raw) {
        Framework::Go
    } else if pytest::detect(raw) {
        Framework::Pytest
    } else {
        Framework::Generic
    }
}
