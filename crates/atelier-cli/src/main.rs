use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use atelier_contracts::rules::FeedbackRuleTable;
use atelier_contracts::verdict::InconclusivePolicy;
use atelier_engine::{
    augment_with, BatchConfig, BatchDriver, CorrectionConfig, CorrectionLoop, CorrectionOutcome,
    CorrectionTask, DryrunGenerator, DryrunVerifier, GeminiClient, GeminiConfig,
    GenerationCapability, ImagePart, TaskStatus, VerificationCapability, DEFAULT_RETRY_SUFFIX,
};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_VERIFY_PROMPT: &str = "Compare the first image (the corrected result) with the \
other images (the original subject and the references). Reply with 'PASS:' followed by a short \
note if the result meets every requirement, otherwise 'FAIL:' followed by the specific problems.";

#[derive(Debug, Parser)]
#[command(name = "atelier", version, about = "Verify-and-retry image correction")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Correct every image in a directory.
    Batch(BatchArgs),
    /// Correct a single image.
    Correct(CorrectArgs),
    /// Print the feedback rule table, or the prompt a failure reason would produce.
    Rules(RulesArgs),
}

#[derive(Debug, Args)]
struct LoopArgs {
    #[arg(long)]
    prompt_file: PathBuf,
    #[arg(long)]
    verify_prompt_file: Option<PathBuf>,
    /// Reference image sent with every generation request; repeatable.
    #[arg(long = "reference")]
    references: Vec<PathBuf>,
    #[arg(long, default_value_t = 7)]
    max_attempts: u32,
    #[arg(long, default_value = "infer-pass")]
    inconclusive: InconclusivePolicy,
    #[arg(long)]
    rules: Option<PathBuf>,
    #[arg(long)]
    fallback_prompt_file: Option<PathBuf>,
    #[arg(long, default_value_t = 500)]
    attempt_delay_ms: u64,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    verify_model: Option<String>,
    /// Requested aspect ratio for generated images, e.g. `2:3`.
    #[arg(long)]
    aspect_ratio: Option<String>,
    /// Resample every generated image to WIDTHxHEIGHT before verification.
    #[arg(long, value_parser = parse_dimensions)]
    upscale: Option<(u32, u32)>,
    /// Use the offline renderer and an always-pass verifier.
    #[arg(long)]
    dryrun: bool,
    /// Accept the first generated image without verification.
    #[arg(long)]
    no_verify: bool,
    #[arg(long)]
    no_verify_subject: bool,
}

#[derive(Debug, Parser)]
struct BatchArgs {
    #[arg(long)]
    input: PathBuf,
    #[arg(long)]
    out: PathBuf,
    #[command(flatten)]
    correction: LoopArgs,
    #[arg(long)]
    skip_existing: bool,
    #[arg(long)]
    max_images: Option<usize>,
    #[arg(long, default_value_t = 1000)]
    task_delay_ms: u64,
    #[arg(long)]
    batch_id: Option<String>,
}

#[derive(Debug, Parser)]
struct CorrectArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    output: PathBuf,
    #[command(flatten)]
    correction: LoopArgs,
}

#[derive(Debug, Parser)]
struct RulesArgs {
    #[arg(long)]
    rules: Option<PathBuf>,
    /// Show which rules fire for this failure reason and the resulting prompt.
    #[arg(long)]
    reason: Option<String>,
    #[arg(long)]
    prompt_file: Option<PathBuf>,
}

fn main() {
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("atelier error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Batch(args) => run_batch(args),
        Command::Correct(args) => run_correct(args),
        Command::Rules(args) => run_rules(args),
    }
}

fn run_batch(args: BatchArgs) -> Result<i32> {
    let base_prompt = read_prompt(&args.correction.prompt_file)?;
    let correction_loop = build_loop(&args.correction)?;
    let mut config = BatchConfig::for_base_dir(&args.out, &args.input);
    config.skip_existing = args.skip_existing;
    config.max_images = args.max_images;
    config.task_delay = Duration::from_millis(args.task_delay_ms);
    config.batch_id = args.batch_id.clone();

    let driver = BatchDriver::new(
        correction_loop,
        base_prompt,
        args.correction.references.clone(),
        args.correction.max_attempts,
        config,
    );
    let report = driver.run()?;

    for task in &report.tasks {
        let name = task.image.display();
        match &task.status {
            TaskStatus::Succeeded {
                output,
                attempts_used,
            } => println!("ok      {name} -> {} ({attempts_used} attempts)", output.display()),
            TaskStatus::Failed {
                reason,
                attempts_used,
            } => println!("failed  {name} ({attempts_used} attempts): {reason}"),
            TaskStatus::Skipped { output } => {
                println!("skipped {name} ({} exists)", output.display())
            }
        }
    }
    let summary = &report.summary;
    println!(
        "Batch {}: {} total, {} succeeded, {} failed, {} skipped, success rate {:.1}%",
        report.batch_id,
        summary.total,
        summary.succeeded,
        summary.failed,
        summary.skipped,
        summary.success_rate() * 100.0
    );
    println!("Summary written to {}", driver.config().summary_path.display());
    Ok(if report.has_failures() { 2 } else { 0 })
}

fn run_correct(args: CorrectArgs) -> Result<i32> {
    let base_prompt = read_prompt(&args.correction.prompt_file)?;
    let correction_loop = build_loop(&args.correction)?;
    let references = atelier_engine::load_reference_assets(&args.correction.references)?;
    let subject = ImagePart::from_path(&args.image)?;
    let label = args
        .image
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "subject".to_string());
    let task = CorrectionTask::new(
        label,
        subject,
        references,
        base_prompt,
        args.correction.max_attempts,
    );

    let result = correction_loop.run(&task);
    let report = json!({
        "image": args.image.to_string_lossy(),
        "success": result.is_success(),
        "attempts_used": result.attempts_used(),
        "generation_calls": result.generation_calls,
        "verification_calls": result.verification_calls,
        "reason": result.failure_reason(),
    });
    match result.outcome {
        CorrectionOutcome::Success { image, .. } => {
            if let Some(parent) = args.output.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&args.output, &image.bytes)
                .with_context(|| format!("failed writing {}", args.output.display()))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(0)
        }
        CorrectionOutcome::Failure { .. } => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(2)
        }
    }
}

fn run_rules(args: RulesArgs) -> Result<i32> {
    let rules = load_rules(args.rules.as_deref())?;
    let Some(reason) = args.reason.as_deref() else {
        println!("{}", serde_json::to_string_pretty(&rules)?);
        return Ok(0);
    };
    let fired = rules
        .matching(reason)
        .into_iter()
        .map(|rule| rule.name.as_str())
        .collect::<Vec<&str>>();
    println!("Fired rules: {}", render_rule_names(&fired));
    if let Some(prompt_file) = args.prompt_file.as_deref() {
        let base_prompt = read_prompt(prompt_file)?;
        println!();
        println!(
            "{}",
            augment_with(&rules, &base_prompt, reason, DEFAULT_RETRY_SUFFIX)
        );
    }
    Ok(0)
}

fn build_loop(args: &LoopArgs) -> Result<CorrectionLoop> {
    if args.max_attempts == 0 {
        bail!("--max-attempts must be at least 1");
    }
    let config = CorrectionConfig {
        inconclusive_policy: args.inconclusive,
        attempt_delay: Duration::from_millis(args.attempt_delay_ms),
        fallback_prompt: args
            .fallback_prompt_file
            .as_deref()
            .map(read_prompt)
            .transpose()?,
        verify_against_subject: !args.no_verify_subject,
        rules: load_rules(args.rules.as_deref())?,
        upscale: args.upscale,
        ..CorrectionConfig::default()
    };

    let (generator, verifier): (
        Box<dyn GenerationCapability>,
        Box<dyn VerificationCapability>,
    ) = if args.dryrun {
        (
            Box::new(DryrunGenerator::default()),
            Box::new(DryrunVerifier::default()),
        )
    } else {
        let gemini = GeminiConfig::from_env()?;
        let mut generation = match args.model.as_deref() {
            Some(model) => gemini.clone().with_model(model),
            None => gemini.clone(),
        };
        // Verification answers in text, so only generation carries the aspect ratio.
        let verification = match args.verify_model.as_deref() {
            Some(model) => gemini.with_model(model),
            None => generation.clone(),
        };
        generation.aspect_ratio = args.aspect_ratio.clone();
        (
            Box::new(GeminiClient::new(generation)),
            Box::new(GeminiClient::new(verification)),
        )
    };

    info!(
        generator = generator.name(),
        verifier = if args.no_verify { "none" } else { verifier.name() },
        max_attempts = args.max_attempts,
        policy = args.inconclusive.as_str(),
        "correction loop configured"
    );
    let correction_loop = CorrectionLoop::new(generator, config);
    if args.no_verify {
        return Ok(correction_loop);
    }
    let verify_prompt = match args.verify_prompt_file.as_deref() {
        Some(path) => read_prompt(path)?,
        None => DEFAULT_VERIFY_PROMPT.to_string(),
    };
    Ok(correction_loop.with_verifier(verifier, verify_prompt))
}

fn load_rules(path: Option<&Path>) -> Result<FeedbackRuleTable> {
    match path {
        Some(path) => FeedbackRuleTable::load(path),
        None => Ok(FeedbackRuleTable::default()),
    }
}

fn read_prompt(path: &Path) -> Result<String> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed reading prompt {}", path.display()))?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        bail!("prompt file is empty: {}", path.display());
    }
    Ok(trimmed.to_string())
}

fn parse_dimensions(raw: &str) -> Result<(u32, u32), String> {
    let (width, height) = raw
        .trim()
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got {raw:?}"))?;
    let side = |value: &str| match value.trim().parse::<u32>() {
        Ok(0) | Err(_) => Err(format!("invalid dimension {value:?} in {raw:?}")),
        Ok(value) => Ok(value),
    };
    Ok((side(width)?, side(height)?))
}

fn render_rule_names(names: &[&str]) -> String {
    if names.is_empty() {
        return "(none)".to_string();
    }
    names.join(", ")
}

#[cfg(test)]
mod tests {
    use std::fs;

    use atelier_contracts::verdict::InconclusivePolicy;
    use clap::Parser;

    use super::{parse_dimensions, read_prompt, render_rule_names, Cli, Command};

    #[test]
    fn batch_args_parse_with_shared_loop_flags() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from([
            "atelier",
            "batch",
            "--input",
            "in",
            "--out",
            "out",
            "--prompt-file",
            "prompt.txt",
            "--reference",
            "ideal.jpg",
            "--reference",
            "mannequin.jpg",
            "--inconclusive",
            "strict",
            "--dryrun",
        ])?;
        let Command::Batch(args) = cli.command else {
            anyhow::bail!("expected batch command");
        };
        assert_eq!(args.correction.references.len(), 2);
        assert_eq!(args.correction.max_attempts, 7);
        assert_eq!(args.correction.inconclusive, InconclusivePolicy::Reject);
        assert!(args.correction.dryrun);
        assert_eq!(args.task_delay_ms, 1000);
        Ok(())
    }

    #[test]
    fn output_shape_flags_parse() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from([
            "atelier",
            "correct",
            "--image",
            "a.png",
            "--output",
            "b.png",
            "--prompt-file",
            "prompt.txt",
            "--aspect-ratio",
            "2:3",
            "--upscale",
            "1664x2496",
        ])?;
        let Command::Correct(args) = cli.command else {
            anyhow::bail!("expected correct command");
        };
        assert_eq!(args.correction.aspect_ratio.as_deref(), Some("2:3"));
        assert_eq!(args.correction.upscale, Some((1664, 2496)));

        assert_eq!(parse_dimensions(" 12X18 "), Ok((12, 18)));
        assert!(parse_dimensions("1664").is_err());
        assert!(parse_dimensions("0x10").is_err());
        assert!(parse_dimensions("wide x tall").is_err());
        Ok(())
    }

    #[test]
    fn unknown_inconclusive_policy_is_rejected() {
        let parsed = Cli::try_parse_from([
            "atelier",
            "correct",
            "--image",
            "a.png",
            "--output",
            "b.png",
            "--prompt-file",
            "prompt.txt",
            "--inconclusive",
            "maybe",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn empty_prompt_files_are_rejected() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let empty = temp.path().join("empty.txt");
        fs::write(&empty, "  \n")?;
        assert!(read_prompt(&empty).is_err());
        let prompt = temp.path().join("prompt.txt");
        fs::write(&prompt, "Dress the model.\n")?;
        assert_eq!(read_prompt(&prompt)?, "Dress the model.");
        Ok(())
    }

    #[test]
    fn rule_names_render_placeholder_when_none_fired() {
        assert_eq!(render_rule_names(&[]), "(none)");
        assert_eq!(render_rule_names(&["jewelry", "collar"]), "jewelry, collar");
    }
}
