use clap::{Parser, Subcommand};
use eyre::{Result, WrapErr};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use pe_defender::evaluate::{collect_samples, evaluate_local, evaluate_remote, EvaluationReport};
use pe_defender::scan::{FailurePolicy, Label, Scanner, DEFAULT_THRESHOLD};
use pe_defender::server::{ServerConfig, DEFAULT_MAX_BODY_BYTES, DEFAULT_MODEL_PATH};
use pe_defender::{EmberExtractor, FeatureExtractor, GbdtModel};

#[derive(Parser)]
#[command(
    name = "pe-defender",
    about = "Malware classifier for Windows PE files (EMBER features, gradient-boosted trees)."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Options shared by every command that loads the model.
#[derive(clap::Args)]
struct ModelArgs {
    /// XGBoost JSON model file
    #[arg(long, env = "DEFENDER_MODEL", default_value = DEFAULT_MODEL_PATH)]
    model: PathBuf,

    /// Probability at or above which a sample is labelled malicious
    #[arg(long, env = "DEFENDER_THRESHOLD", default_value_t = DEFAULT_THRESHOLD)]
    threshold: f64,

    /// What to report when a sample cannot be scanned: benign, malicious or error
    #[arg(long, env = "DEFENDER_ON_ERROR", default_value = "benign")]
    on_error: FailurePolicy,
}

impl ModelArgs {
    fn scanner(&self) -> Result<(Scanner, String)> {
        let model = GbdtModel::load(&self.model)
            .wrap_err_with(|| format!("failed to load model {}", self.model.display()))?;
        let model_hash = model.hash().to_string();
        let scanner = Scanner::new(
            Box::new(EmberExtractor::new()),
            Box::new(model),
            self.threshold,
            self.on_error,
        )?;
        Ok((scanner, model_hash))
    }

    /// Flags set away from their defaults. A remote service scores with its
    /// own model, threshold and failure policy, so these have no effect there.
    fn overridden_flags(&self) -> Vec<&'static str> {
        let mut flags = Vec::new();
        if self.model != Path::new(DEFAULT_MODEL_PATH) {
            flags.push("--model");
        }
        if self.threshold != DEFAULT_THRESHOLD {
            flags.push("--threshold");
        }
        if self.on_error != FailurePolicy::default() {
            flags.push("--on-error");
        }
        flags
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP classifier service
    Serve {
        #[command(flatten)]
        model: ModelArgs,

        /// Address to bind to
        #[arg(long, default_value = "0.0.0.0:8080")]
        bind: String,

        /// Port override for the bind address
        #[arg(long, env = "PORT")]
        port: Option<u16>,

        /// Rate limit in requests per minute per IP (0 = no limit)
        #[arg(long, default_value_t = 0)]
        rate_limit: u32,

        /// Path for JSONL access log
        #[arg(long, default_value = "defender-access.jsonl")]
        access_log: String,

        /// Rotate the access log past this many bytes (0 = never)
        #[arg(long, default_value_t = 50 * 1024 * 1024)]
        max_access_log_bytes: u64,

        /// Largest accepted request body in bytes
        #[arg(long, default_value_t = DEFAULT_MAX_BODY_BYTES)]
        max_body_bytes: usize,

        /// Bearer token required on /api/v1/* (disabled when unset)
        #[arg(long, env = "DEFENDER_API_KEY", hide_env_values = true)]
        api_key: Option<String>,

        /// Persist usage counters to this JSON file
        #[arg(long)]
        metrics_path: Option<PathBuf>,
    },

    /// Score a single file locally
    Scan {
        #[command(flatten)]
        model: ModelArgs,

        /// Sample to score
        file: PathBuf,
    },

    /// Print the EMBER feature vector of a file as JSON
    Features {
        /// Sample to extract
        file: PathBuf,
    },

    /// Measure accuracy over labelled sample directories
    Evaluate {
        #[command(flatten)]
        model: ModelArgs,

        /// Directory of malicious samples (expected label 1)
        #[arg(long)]
        malware: PathBuf,

        /// Directory of benign samples (expected label 0)
        #[arg(long)]
        benign: PathBuf,

        /// Score against a running service instead of in-process
        #[arg(long)]
        server: Option<String>,

        /// Parallel workers (threads locally, in-flight requests remotely)
        #[arg(long, default_value_t = 4)]
        jobs: usize,
    },
}

struct ServeArgs {
    model: ModelArgs,
    bind: String,
    port: Option<u16>,
    rate_limit: u32,
    access_log: String,
    max_access_log_bytes: u64,
    max_body_bytes: usize,
    api_key: Option<String>,
    metrics_path: Option<PathBuf>,
}

fn cmd_serve(args: ServeArgs) -> Result<()> {
    use pe_defender::server::run_server;

    let mut bind_addr: SocketAddr = args
        .bind
        .parse()
        .wrap_err_with(|| format!("Invalid bind address: {}", args.bind))?;
    if let Some(port) = args.port {
        bind_addr.set_port(port);
    }

    let config = ServerConfig {
        bind_addr,
        model_path: args.model.model,
        threshold: args.model.threshold,
        failure_policy: args.model.on_error,
        rate_limit_rpm: args.rate_limit,
        access_log_path: args.access_log,
        max_access_log_bytes: args.max_access_log_bytes,
        max_body_bytes: args.max_body_bytes,
        api_key: args.api_key.filter(|k| !k.is_empty()),
        metrics_path: args.metrics_path,
    };

    tracing::info!(?config, "starting PE defender service");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_server(config))?;

    Ok(())
}

fn cmd_scan(model: ModelArgs, file: &Path) -> Result<i32> {
    let (scanner, model_hash) = model.scanner()?;
    let bytes =
        std::fs::read(file).wrap_err_with(|| format!("failed to read {}", file.display()))?;

    let verdict = match scanner.scan(&bytes) {
        Ok(verdict) => verdict,
        Err(e) => eyre::bail!("scan failed: {e}"),
    };

    let result = match &verdict.fallback {
        None => serde_json::json!({
            "prob_malware": verdict.probability,
            "label": verdict.label,
            "threshold": scanner.threshold(),
            "num_features": verdict.num_features,
            "model_hash": model_hash,
        }),
        Some(reason) => serde_json::json!({
            "label": verdict.label,
            "error": reason,
        }),
    };
    println!("{}", serde_json::to_string_pretty(&result)?);

    Ok(match verdict.label {
        Label::Malicious => 1,
        Label::Benign => 0,
    })
}

fn cmd_features(file: &Path) -> Result<()> {
    let bytes =
        std::fs::read(file).wrap_err_with(|| format!("failed to read {}", file.display()))?;
    let features = EmberExtractor::new()
        .extract(&bytes)
        .wrap_err_with(|| format!("failed to extract features from {}", file.display()))?;
    println!("{}", serde_json::to_string(&features)?);
    Ok(())
}

fn cmd_evaluate(
    model: ModelArgs,
    malware: &Path,
    benign: &Path,
    server: Option<String>,
    jobs: usize,
) -> Result<()> {
    let mut samples = collect_samples(malware, Label::Malicious)?;
    samples.extend(collect_samples(benign, Label::Benign)?);
    if samples.is_empty() {
        eyre::bail!(
            "no samples found under {} or {}",
            malware.display(),
            benign.display()
        );
    }

    let report = match server {
        Some(url) => {
            let ignored = model.overridden_flags();
            if !ignored.is_empty() {
                tracing::warn!(
                    flags = ignored.join(", "),
                    server = %url,
                    "ignored with --server: the service applies its own model settings"
                );
            }
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(evaluate_remote(&url, samples, jobs))?
        }
        None => {
            let (scanner, _) = model.scanner()?;
            evaluate_local(&scanner, &samples, jobs)?
        }
    };

    print_report(&report);
    Ok(())
}

fn print_report(report: &EvaluationReport) {
    let m = &report.matrix;
    println!("Evaluation Results");
    println!("==================");
    println!("Samples:   {} ({} errors)", report.total, report.errors);
    println!("Elapsed:   {} ms", report.elapsed_ms);
    println!();
    println!(
        "TP: {}  FP: {}  TN: {}  FN: {}",
        m.true_positives, m.false_positives, m.true_negatives, m.false_negatives
    );
    println!();
    println!("Accuracy:  {:.2}%", report.accuracy * 100.0);
    println!("Precision: {:.2}%", report.precision * 100.0);
    println!("Recall:    {:.2}%", report.recall * 100.0);
    println!("F1:        {:.4}", report.f1);
    println!("FPR:       {:.2}%", report.fpr * 100.0);
    println!("TPR:       {:.2}%", report.tpr * 100.0);
    if !report.failures.is_empty() {
        println!();
        println!("Failures:");
        for failure in &report.failures {
            println!("  {failure}");
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Serve {
            model,
            bind,
            port,
            rate_limit,
            access_log,
            max_access_log_bytes,
            max_body_bytes,
            api_key,
            metrics_path,
        } => cmd_serve(ServeArgs {
            model,
            bind,
            port,
            rate_limit,
            access_log,
            max_access_log_bytes,
            max_body_bytes,
            api_key,
            metrics_path,
        }),
        Commands::Scan { model, file } => match cmd_scan(model, &file) {
            Ok(code) => {
                if code != 0 {
                    std::process::exit(code);
                }
                Ok(())
            }
            Err(e) => Err(e),
        },
        Commands::Features { file } => cmd_features(&file),
        Commands::Evaluate {
            model,
            malware,
            benign,
            server,
            jobs,
        } => cmd_evaluate(model, &malware, &benign, server, jobs),
    };

    if let Err(e) = result {
        eprintln!("Error: {e:?}");
        std::process::exit(1);
    }
}
