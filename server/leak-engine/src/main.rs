//! Binary entrypoint: analyze leak logs, write the session as JSON to stdout.
//!
//! Exit codes: 0 ok, 1 regression, 2 usage/config/input error.
//! Logs go to stderr; filter with RUST_LOG.

use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use leak_engine::{
  AnalysisInput, BaselineSelector, CancelToken, Config, Engine, FormatHint, JsonlTrendStore,
  RegressionPolicy, RunOptions,
};

#[derive(Debug, Parser)]
#[command(name = "leak-engine", version, about = "Analyze Valgrind and sanitizer leak logs")]
struct Args {
  /// Input format: valgrind-xml, asan-log or auto-detect.
  #[arg(long, default_value = "auto-detect", value_parser = parse_format)]
  format: FormatHint,
  /// TOML config file.
  #[arg(long, value_name = "PATH")]
  config: Option<PathBuf>,
  /// JSON-lines trend store; enables trend verdicts.
  #[arg(long, value_name = "PATH")]
  store: Option<PathBuf>,
  /// Version label recorded with the session.
  #[arg(long, value_name = "L")]
  version_label: Option<String>,
  /// Explicit session id (default: random UUID).
  #[arg(long, value_name = "ID")]
  session_id: Option<String>,
  /// latest | session:ID | version:LABEL
  #[arg(long, value_name = "SEL", value_parser = parse_baseline)]
  baseline: Option<BaselineSelector>,
  /// Print report rows instead of the full session.
  #[arg(long)]
  rows: bool,
  /// Exit 1 when the verdict regresses.
  #[arg(long)]
  fail_on_regression: bool,
  /// Log files; none (or `-`) reads stdin.
  #[arg(value_name = "FILE")]
  files: Vec<PathBuf>,
}

impl Args {
  fn run_options(&self) -> RunOptions {
    RunOptions {
      session_id: self.session_id.clone(),
      version_label: self.version_label.clone(),
      baseline: self.baseline.clone(),
      ..RunOptions::default()
    }
  }

  fn reads_stdin(&self) -> bool {
    self.files.is_empty() || (self.files.len() == 1 && self.files[0].as_os_str() == "-")
  }
}

fn fail(message: impl std::fmt::Display) -> ! {
  let _ = writeln!(io::stderr(), "leak-engine: error: {}", message);
  process::exit(2);
}

fn parse_format(raw: &str) -> Result<FormatHint, String> {
  raw.parse().map_err(|e: leak_engine::EngineError| e.to_string())
}

fn parse_baseline(raw: &str) -> Result<BaselineSelector, String> {
  match raw.split_once(':') {
    None if raw == "latest" => Ok(BaselineSelector::Latest),
    Some(("session", id)) if !id.is_empty() => Ok(BaselineSelector::Session(id.to_string())),
    Some(("version", label)) if !label.is_empty() => {
      Ok(BaselineSelector::Version(label.to_string()))
    }
    _ => Err(format!("`{}` is not latest, session:ID or version:LABEL", raw)),
  }
}

fn init_tracing() {
  tracing_subscriber::fmt()
    .with_env_filter(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "leak_engine=warn".into()),
    )
    .with_writer(io::stderr)
    .init();
}

fn main() {
  init_tracing();
  let args = Args::parse();

  let config = match &args.config {
    Some(path) => Config::load(path).unwrap_or_else(|e| fail(e)),
    None => Config::default(),
  };
  let lock_timeout = config.store_lock_timeout_ms;
  let mut engine = Engine::new(config).unwrap_or_else(|e| fail(e));
  if let Some(path) = &args.store {
    engine = engine.with_store(Arc::new(JsonlTrendStore::new(path, lock_timeout)));
  }

  let inputs: Vec<AnalysisInput> = if args.reads_stdin() {
    let mut data = Vec::new();
    if let Err(e) = io::stdin().lock().read_to_end(&mut data) {
      fail(format!("read stdin: {}", e));
    }
    vec![AnalysisInput::bytes("<stdin>", data, args.format)]
  } else {
    args
      .files
      .iter()
      .map(|f| AnalysisInput::path(f, args.format))
      .collect()
  };

  let outcome = engine.analyze_batch(&inputs, &args.run_options(), &CancelToken::new());
  for failure in &outcome.failures {
    let _ = writeln!(io::stderr(), "leak-engine: error: {}", failure.error);
  }
  if outcome.failures.len() == inputs.len() {
    process::exit(2);
  }

  let session = outcome.session;
  let stdout = io::stdout();
  let mut out = io::BufWriter::new(stdout.lock());
  let written = if args.rows {
    serde_json::to_writer_pretty(&mut out, &session.rows())
  } else {
    serde_json::to_writer_pretty(&mut out, &session)
  };
  if let Err(e) = written {
    fail(format!("write output: {}", e));
  }
  let _ = writeln!(out);
  let _ = out.flush();

  if args.fail_on_regression {
    let check = session.check_regression(&RegressionPolicy::strict());
    if check.regressed {
      for reason in &check.reasons {
        let _ = writeln!(io::stderr(), "leak-engine: regression: {}", reason);
      }
      process::exit(1);
    }
  }
}
