//! leak-diff: compare two saved leak-engine sessions
//!
//! Usage:
//!   leak-diff <before.json> <after.json>      # print new/resolved leaks and deltas
//!   leak-diff <before.json> <after.json> -q   # quiet: exit code only
//!
//! Inputs are sessions as printed by `leak-engine` (full session, not `--rows`).
//! Exit codes: 0 no regression, 1 regression under the strict policy, 2 bad input.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::process;

use leak_engine::trend::compare;
use leak_engine::types::{ScoredLeak, Signature};
use leak_engine::{AnalysisSession, RegressionPolicy};

const NOISE_THRESHOLD_PCT: f64 = 5.0;

fn load_session(path: &str) -> AnalysisSession {
    let contents = fs::read_to_string(path).unwrap_or_else(|e| {
        eprintln!("leak-diff: cannot read {}: {}", path, e);
        process::exit(2);
    });
    serde_json::from_str(&contents).unwrap_or_else(|e| {
        eprintln!("leak-diff: invalid session JSON in {}: {}", path, e);
        process::exit(2);
    })
}

fn by_signature(session: &AnalysisSession) -> BTreeMap<&Signature, &ScoredLeak> {
    session.leaks.iter().map(|s| (&s.leak.signature, s)).collect()
}

fn describe(scored: &ScoredLeak) -> String {
    let leak = &scored.leak;
    format!(
        "{} {} {} B x{} at {} ({:.2})",
        leak.signature,
        leak.kind.label(),
        leak.size_bytes,
        leak.occurrence_count,
        leak.primary_location_label(),
        scored.impact.score
    )
}

fn main() {
    let args: Vec<String> = env::args().collect();
    let quiet = args.iter().any(|a| a == "-q" || a == "--quiet");
    let files: Vec<_> = args.iter().skip(1).filter(|a| !a.starts_with('-')).collect();

    if files.len() != 2 {
        eprintln!("Usage: leak-diff <before.json> <after.json> [-q|--quiet]");
        eprintln!("  -q  Quiet: only exit code (0=ok, 1=regressed)");
        process::exit(2);
    }

    let before = load_session(files[0]);
    let after = load_session(files[1]);
    let verdict = compare(&after.trend_entry(), &before.trend_entry(), NOISE_THRESHOLD_PCT);
    let check = RegressionPolicy::strict().evaluate(&verdict);

    if quiet {
        process::exit(if check.regressed { 1 } else { 0 });
    }

    let old = by_signature(&before);
    let new = by_signature(&after);
    for sig in &verdict.resolved_signatures {
        if let Some(scored) = old.get(sig) {
            println!("- {}", describe(scored));
        }
    }
    for sig in &verdict.new_signatures {
        if let Some(scored) = new.get(sig) {
            println!("+ {}", describe(scored));
        }
    }
    for (sig, scored) in &new {
        if let Some(prev) = old.get(sig) {
            let (a, b) = (&prev.leak, &scored.leak);
            if a.size_bytes != b.size_bytes || a.occurrence_count != b.occurrence_count {
                println!(
                    "~ {}: {} B x{} -> {} B x{}",
                    sig, a.size_bytes, a.occurrence_count, b.size_bytes, b.occurrence_count
                );
            }
        }
    }

    println!(
        "{:?}: {:+} leaks, {:+} bytes ({:+.1}%), regression score {:.3}",
        verdict.direction,
        verdict.delta_count,
        verdict.delta_bytes,
        verdict.delta_pct,
        verdict.regression_score
    );
    for reason in &check.reasons {
        println!("! {}", reason);
    }

    process::exit(if check.regressed { 1 } else { 0 });
}
