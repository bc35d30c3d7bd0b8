//! Closed-loop generate → verify → retry cycle for one subject image.
//!
//! ```text
//! Ready ─▶ Generating ─▶ Verifying ─▶ Accepted
//!              ▲   │          │
//!              │   │ error    │ fail
//!              │   ▼          ▼
//!              └── RetryPending ─▶ Exhausted
//! ```
//!
//! Setup problems short-circuit to `Aborted` before the first attempt.

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use atelier_contracts::rules::FeedbackRuleTable;
use atelier_contracts::verdict::{parse_verdict, InconclusivePolicy, Verdict};
use tracing::{debug, info, warn};

use crate::capability::{CapabilityRequest, GenerationCapability, ImagePart, VerificationCapability};
use crate::error::{CorrectionError, TransientPatterns};
use crate::error_chain_text;
use crate::prompt::{FeedbackLedger, DEFAULT_RETRY_SUFFIX};

pub const NO_IMAGE_GENERATED: &str = "no image generated";
pub const NO_IMAGE_AFTER_MAX_ATTEMPTS: &str = "no image generated after max attempts";
pub const TRANSIENT_VERIFICATION_ERROR: &str = "transient verification error";

const REASON_MAX_CHARS: usize = 600;

/// One unit of work. Immutable once built.
#[derive(Debug, Clone)]
pub struct CorrectionTask {
    label: String,
    subject_image: ImagePart,
    reference_assets: Vec<ImagePart>,
    base_prompt: String,
    max_attempts: u32,
}

impl CorrectionTask {
    pub fn new(
        label: impl Into<String>,
        subject_image: ImagePart,
        reference_assets: Vec<ImagePart>,
        base_prompt: impl Into<String>,
        max_attempts: u32,
    ) -> Self {
        Self {
            label: label.into(),
            subject_image,
            reference_assets,
            base_prompt: base_prompt.into(),
            max_attempts,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn subject_image(&self) -> &ImagePart {
        &self.subject_image
    }

    pub fn reference_assets(&self) -> &[ImagePart] {
        &self.reference_assets
    }

    pub fn base_prompt(&self) -> &str {
        &self.base_prompt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn validate(&self) -> Result<(), CorrectionError> {
        if self.max_attempts == 0 {
            return Err(CorrectionError::ZeroAttempts);
        }
        if self.base_prompt.trim().is_empty() {
            return Err(CorrectionError::EmptyPrompt);
        }
        if self.subject_image.bytes.is_empty() {
            return Err(CorrectionError::UndecodableSubject(
                "subject image is empty".to_string(),
            ));
        }
        self.subject_image
            .dimensions()
            .map_err(|err| CorrectionError::UndecodableSubject(error_chain_text(&err, 200)))?;
        Ok(())
    }

    fn generation_request(&self, prompt: &str) -> CapabilityRequest {
        let mut images = self.reference_assets.clone();
        images.push(self.subject_image.clone());
        CapabilityRequest::new(prompt, images)
    }
}

/// Loads reference images in order; any missing file is a setup error.
pub fn load_reference_assets(paths: &[PathBuf]) -> Result<Vec<ImagePart>, CorrectionError> {
    paths
        .iter()
        .map(|path| {
            if !path.is_file() {
                return Err(CorrectionError::MissingReferenceAsset { path: path.clone() });
            }
            ImagePart::from_path(path).map_err(|_| CorrectionError::MissingReferenceAsset {
                path: path.clone(),
            })
        })
        .collect()
}

/// Ephemeral record of one iteration, handed to the observer then dropped.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub attempt_number: u32,
    pub effective_prompt: String,
    pub generated_image: Option<ImagePart>,
    /// As the verifier answered; may be `Inconclusive`.
    pub verdict: Verdict,
    /// After the inconclusive policy; this is what the loop acts on.
    pub resolved: Verdict,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorrectionOutcome {
    Success {
        image: ImagePart,
        attempts_used: u32,
    },
    Failure {
        last_reason: String,
        attempts_used: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrectionResult {
    pub outcome: CorrectionOutcome,
    pub generation_calls: u32,
    pub verification_calls: u32,
}

impl CorrectionResult {
    fn aborted(reason: String) -> Self {
        Self {
            outcome: CorrectionOutcome::Failure {
                last_reason: reason,
                attempts_used: 0,
            },
            generation_calls: 0,
            verification_calls: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, CorrectionOutcome::Success { .. })
    }

    pub fn attempts_used(&self) -> u32 {
        match &self.outcome {
            CorrectionOutcome::Success { attempts_used, .. }
            | CorrectionOutcome::Failure { attempts_used, .. } => *attempts_used,
        }
    }

    pub fn failure_reason(&self) -> Option<&str> {
        match &self.outcome {
            CorrectionOutcome::Success { .. } => None,
            CorrectionOutcome::Failure { last_reason, .. } => Some(last_reason.as_str()),
        }
    }
}

pub trait AttemptObserver {
    fn on_attempt(&mut self, task: &CorrectionTask, record: &AttemptRecord);
}

impl<F> AttemptObserver for F
where
    F: FnMut(&CorrectionTask, &AttemptRecord),
{
    fn on_attempt(&mut self, task: &CorrectionTask, record: &AttemptRecord) {
        self(task, record)
    }
}

#[derive(Debug, Clone)]
pub struct CorrectionConfig {
    pub inconclusive_policy: InconclusivePolicy,
    /// Slept between attempts of one task; constant, no backoff growth.
    pub attempt_delay: Duration,
    pub retry_suffix: String,
    /// Simplified prompt used for the attempt after a transient generation error.
    pub fallback_prompt: Option<String>,
    pub verify_against_subject: bool,
    pub verify_against_references: bool,
    /// Resample every generated image to this size (Lanczos) before verification.
    pub upscale: Option<(u32, u32)>,
    pub transient_patterns: TransientPatterns,
    pub rules: FeedbackRuleTable,
}

impl Default for CorrectionConfig {
    fn default() -> Self {
        Self {
            inconclusive_policy: InconclusivePolicy::default(),
            attempt_delay: Duration::from_millis(500),
            retry_suffix: DEFAULT_RETRY_SUFFIX.to_string(),
            fallback_prompt: None,
            verify_against_subject: true,
            verify_against_references: true,
            upscale: None,
            transient_patterns: TransientPatterns::default(),
            rules: FeedbackRuleTable::default(),
        }
    }
}

struct Verifier {
    capability: Box<dyn VerificationCapability>,
    prompt: String,
}

pub struct CorrectionLoop {
    generator: Box<dyn GenerationCapability>,
    verifier: Option<Verifier>,
    config: CorrectionConfig,
}

impl CorrectionLoop {
    pub fn new(generator: Box<dyn GenerationCapability>, config: CorrectionConfig) -> Self {
        Self {
            generator,
            verifier: None,
            config,
        }
    }

    /// Without a verifier the first generated image is accepted as-is.
    pub fn with_verifier(
        mut self,
        verifier: Box<dyn VerificationCapability>,
        verification_prompt: impl Into<String>,
    ) -> Self {
        self.verifier = Some(Verifier {
            capability: verifier,
            prompt: verification_prompt.into(),
        });
        self
    }

    pub fn config(&self) -> &CorrectionConfig {
        &self.config
    }

    pub fn generator_name(&self) -> &str {
        self.generator.name()
    }

    pub fn has_verifier(&self) -> bool {
        self.verifier.is_some()
    }

    pub fn run(&self, task: &CorrectionTask) -> CorrectionResult {
        self.run_observed(task, &mut |_: &CorrectionTask, _: &AttemptRecord| {})
    }

    pub fn run_observed(
        &self,
        task: &CorrectionTask,
        observer: &mut dyn AttemptObserver,
    ) -> CorrectionResult {
        if let Err(err) = task.validate() {
            warn!(task = task.label(), error = %err, "correction aborted before first attempt");
            return CorrectionResult::aborted(err.to_string());
        }

        let max_attempts = task.max_attempts();
        let mut ledger = FeedbackLedger::new(&self.config.rules);
        let mut use_fallback_prompt = false;
        let mut generation_calls = 0;
        let mut verification_calls = 0;
        let mut last_reason = String::new();

        for attempt in 1..=max_attempts {
            if attempt > 1 && !self.config.attempt_delay.is_zero() {
                thread::sleep(self.config.attempt_delay);
            }

            let effective_prompt = match self.config.fallback_prompt.as_deref() {
                Some(fallback) if use_fallback_prompt => fallback.to_string(),
                _ => ledger.render(task.base_prompt(), &self.config.retry_suffix),
            };
            use_fallback_prompt = false;
            info!(
                task = task.label(),
                attempt,
                max_attempts,
                generator = self.generator.name(),
                "generation attempt"
            );

            generation_calls += 1;
            let generated = self
                .generator
                .generate(&task.generation_request(&effective_prompt))
                .and_then(|response| response.first_image())
                .and_then(|image| image.map(|image| self.prepare(image)).transpose());

            let (generated_image, verdict) = match generated {
                Err(err) => {
                    if self.config.transient_patterns.matches(&err) {
                        use_fallback_prompt = true;
                    }
                    let cause = error_chain_text(&err, REASON_MAX_CHARS);
                    warn!(task = task.label(), attempt, error = %cause, "generation failed");
                    (None, Verdict::Error(cause))
                }
                Ok(None) => {
                    warn!(task = task.label(), attempt, "no image generated");
                    (None, Verdict::Fail(CorrectionError::NoImageReturned.to_string()))
                }
                Ok(Some(image)) => match &self.verifier {
                    None => (Some(image), Verdict::Pass),
                    Some(verifier) => {
                        verification_calls += 1;
                        let verdict = self.verify(verifier, task, &image);
                        (Some(image), verdict)
                    }
                },
            };

            let resolved = self.config.inconclusive_policy.settle(&verdict);
            let record = AttemptRecord {
                attempt_number: attempt,
                effective_prompt,
                generated_image,
                verdict,
                resolved,
            };
            match &record.resolved {
                Verdict::Pass => info!(task = task.label(), attempt, "verdict pass"),
                other => info!(
                    task = task.label(),
                    attempt,
                    verdict = other.label(),
                    answered = record.verdict.label(),
                    reason = other.reason().unwrap_or_default(),
                    "verdict"
                ),
            }
            observer.on_attempt(task, &record);

            let AttemptRecord {
                generated_image,
                resolved,
                ..
            } = record;
            let exhausted = attempt == max_attempts;
            match resolved {
                Verdict::Pass => {
                    if let Some(image) = generated_image {
                        return CorrectionResult {
                            outcome: CorrectionOutcome::Success {
                                image,
                                attempts_used: attempt,
                            },
                            generation_calls,
                            verification_calls,
                        };
                    }
                    last_reason = NO_IMAGE_GENERATED.to_string();
                }
                Verdict::Error(cause) => {
                    // Wasted attempt: the prompt for the next one stays as it was.
                    last_reason = format!("generation error: {cause}");
                }
                Verdict::Fail(reason) | Verdict::Inconclusive(reason) => {
                    last_reason = if exhausted && generated_image.is_none() {
                        NO_IMAGE_AFTER_MAX_ATTEMPTS.to_string()
                    } else {
                        reason.clone()
                    };
                    if !exhausted {
                        let fresh = ledger.absorb(&reason);
                        debug!(task = task.label(), attempt, rules = ?fresh, "feedback rules fired");
                    }
                }
            }
        }

        warn!(
            task = task.label(),
            attempts = max_attempts,
            reason = %last_reason,
            "attempt budget exhausted"
        );
        CorrectionResult {
            outcome: CorrectionOutcome::Failure {
                last_reason,
                attempts_used: max_attempts,
            },
            generation_calls,
            verification_calls,
        }
    }

    fn prepare(&self, image: ImagePart) -> anyhow::Result<ImagePart> {
        match self.config.upscale {
            Some((width, height)) => image.resized(width, height),
            None => Ok(image),
        }
    }

    fn verify(&self, verifier: &Verifier, task: &CorrectionTask, generated: &ImagePart) -> Verdict {
        let mut images = vec![generated.clone()];
        if self.config.verify_against_subject {
            images.push(task.subject_image().clone());
        }
        if self.config.verify_against_references {
            images.extend(task.reference_assets().iter().cloned());
        }
        let request = CapabilityRequest::new(verifier.prompt.clone(), images);
        match verifier.capability.verify(&request) {
            Ok(text) => {
                debug!(task = task.label(), response = %text, "verifier response");
                parse_verdict(&text)
            }
            Err(err) if self.config.transient_patterns.matches(&err) => {
                warn!(
                    task = task.label(),
                    error = %error_chain_text(&err, REASON_MAX_CHARS),
                    "transient verification error"
                );
                Verdict::Fail(TRANSIENT_VERIFICATION_ERROR.to_string())
            }
            Err(err) => Verdict::Fail(format!(
                "verification error: {}",
                error_chain_text(&err, REASON_MAX_CHARS)
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use atelier_contracts::verdict::{InconclusivePolicy, Verdict};

    use super::{
        AttemptRecord, CorrectionConfig, CorrectionLoop, CorrectionOutcome, CorrectionTask,
        NO_IMAGE_AFTER_MAX_ATTEMPTS, TRANSIENT_VERIFICATION_ERROR,
    };
    use crate::capability::ImagePart;
    use crate::test_support::{png_bytes, GenStep, ScriptedGenerator, ScriptedVerifier};

    const BASE: &str = "Place the garment on the reference mannequin.";
    const VERIFY: &str = "Answer PASS: or FAIL: <reason>.";

    fn config() -> CorrectionConfig {
        CorrectionConfig {
            attempt_delay: Duration::ZERO,
            ..CorrectionConfig::default()
        }
    }

    fn task(max_attempts: u32) -> CorrectionTask {
        CorrectionTask::new(
            "look-01.png",
            ImagePart::from_bytes(png_bytes(4, 6)),
            vec![ImagePart::from_bytes(png_bytes(2, 3))],
            BASE,
            max_attempts,
        )
    }

    fn run_collecting(
        correction: &CorrectionLoop,
        task: &CorrectionTask,
    ) -> (super::CorrectionResult, Vec<AttemptRecord>) {
        let mut records = Vec::new();
        let result = correction.run_observed(task, &mut |_: &CorrectionTask, record: &AttemptRecord| {
            records.push(record.clone())
        });
        (result, records)
    }

    #[test]
    fn first_pass_is_accepted_without_further_calls() {
        let generator = ScriptedGenerator::new(vec![GenStep::Image, GenStep::Image]);
        let verifier = ScriptedVerifier::new(vec![Ok("PASS: all good".to_string())]);
        let correction = CorrectionLoop::new(Box::new(generator.clone()), config())
            .with_verifier(Box::new(verifier.clone()), VERIFY);

        let result = correction.run(&task(5));
        assert!(result.is_success());
        assert_eq!(result.attempts_used(), 1);
        assert_eq!(generator.calls(), 1);
        assert_eq!(verifier.calls(), 1);
        assert_eq!(generator.prompts(), vec![BASE.to_string()]);
    }

    #[test]
    fn generation_request_orders_references_before_subject() {
        let generator = ScriptedGenerator::new(vec![GenStep::Image]);
        let correction = CorrectionLoop::new(Box::new(generator.clone()), config());
        let task = task(1);
        let _ = correction.run(&task);

        let images = generator.last_images();
        assert_eq!(images.len(), 2);
        assert_eq!(images[0], task.reference_assets()[0]);
        assert_eq!(images[1], *task.subject_image());
    }

    #[test]
    fn verification_request_carries_generated_subject_and_references() {
        let generator = ScriptedGenerator::new(vec![GenStep::Image]);
        let verifier = ScriptedVerifier::new(vec![Ok("PASS".to_string())]);
        let correction = CorrectionLoop::new(Box::new(generator.clone()), config())
            .with_verifier(Box::new(verifier.clone()), VERIFY);
        let task = task(1);
        let result = correction.run(&task);

        let CorrectionOutcome::Success { image, .. } = result.outcome else {
            panic!("expected success");
        };
        let images = verifier.last_images();
        assert_eq!(verifier.last_prompt().as_deref(), Some(VERIFY));
        assert_eq!(images.len(), 3);
        assert_eq!(images[0], image);
        assert_eq!(images[1], *task.subject_image());
        assert_eq!(images[2], task.reference_assets()[0]);
    }

    #[test]
    fn without_verifier_the_first_image_wins() {
        let generator = ScriptedGenerator::new(vec![GenStep::NoImage, GenStep::Base64Image]);
        let correction = CorrectionLoop::new(Box::new(generator.clone()), config());
        let result = correction.run(&task(3));

        assert!(result.is_success());
        assert_eq!(result.attempts_used(), 2);
        assert_eq!(result.verification_calls, 0);
        let CorrectionOutcome::Success { image, .. } = result.outcome else {
            panic!("expected success");
        };
        assert_eq!(image.bytes, png_bytes(8, 8));
    }

    #[test]
    fn repeated_failures_accumulate_feedback_clauses() {
        let generator = ScriptedGenerator::new(vec![GenStep::Image; 3]);
        let verifier = ScriptedVerifier::new(vec![
            Ok("FAIL: jewelry visible around the neck".to_string()),
            Ok("FAIL: collar was changed to a mandarin style".to_string()),
            Ok("FAIL: sleeves too short".to_string()),
        ]);
        let correction = CorrectionLoop::new(Box::new(generator.clone()), config())
            .with_verifier(Box::new(verifier.clone()), VERIFY);

        let (result, records) = run_collecting(&correction, &task(3));
        assert_eq!(
            result.outcome,
            CorrectionOutcome::Failure {
                last_reason: "sleeves too short".to_string(),
                attempts_used: 3,
            }
        );
        assert_eq!(records.len(), 3);

        let prompts = generator.prompts();
        assert_eq!(prompts[0], BASE);
        assert!(prompts[1].starts_with(BASE));
        assert!(prompts[1].contains("Remove ALL jewelry"));
        assert!(!prompts[1].contains("COLLAR PRESERVATION"));
        assert!(prompts[2].starts_with(BASE));
        assert!(prompts[2].contains("Remove ALL jewelry"));
        assert!(prompts[2].contains("COLLAR PRESERVATION"));
        assert!(prompts[2].contains("collar was changed to a mandarin style"));
        assert_eq!(records[2].effective_prompt, prompts[2]);
    }

    #[test]
    fn no_image_every_time_never_reaches_the_verifier() {
        let generator = ScriptedGenerator::new(vec![GenStep::NoImage; 5]);
        let verifier = ScriptedVerifier::new(Vec::new());
        let correction = CorrectionLoop::new(Box::new(generator.clone()), config())
            .with_verifier(Box::new(verifier.clone()), VERIFY);

        let (result, records) = run_collecting(&correction, &task(5));
        assert_eq!(
            result.outcome,
            CorrectionOutcome::Failure {
                last_reason: NO_IMAGE_AFTER_MAX_ATTEMPTS.to_string(),
                attempts_used: 5,
            }
        );
        assert_eq!(generator.calls(), 5);
        assert_eq!(verifier.calls(), 0);
        assert!(records
            .iter()
            .all(|record| record.verdict == Verdict::Fail("no image generated".to_string())));
        assert!(records.iter().all(|record| record.generated_image.is_none()));
    }

    #[test]
    fn calls_are_bounded_by_the_attempt_budget() {
        for max_attempts in 1..=4 {
            let generator = ScriptedGenerator::new(vec![GenStep::Image; 10]);
            let verifier = ScriptedVerifier::repeating(Ok("FAIL: wrong colors".to_string()));
            let correction = CorrectionLoop::new(Box::new(generator.clone()), config())
                .with_verifier(Box::new(verifier.clone()), VERIFY);
            let result = correction.run(&task(max_attempts));

            assert_eq!(result.attempts_used(), max_attempts);
            assert_eq!(generator.calls(), max_attempts);
            assert_eq!(verifier.calls(), max_attempts);
            assert_eq!(result.failure_reason(), Some("wrong colors"));
        }
    }

    #[test]
    fn generation_errors_waste_an_attempt_without_changing_the_prompt() {
        let generator = ScriptedGenerator::new(vec![
            GenStep::Error("upstream 503".to_string()),
            GenStep::Image,
        ]);
        let verifier = ScriptedVerifier::new(vec![Ok("PASS: ok".to_string())]);
        let correction = CorrectionLoop::new(Box::new(generator.clone()), config())
            .with_verifier(Box::new(verifier.clone()), VERIFY);

        let (result, records) = run_collecting(&correction, &task(3));
        assert!(result.is_success());
        assert_eq!(result.attempts_used(), 2);
        assert_eq!(verifier.calls(), 1);
        assert!(matches!(records[0].verdict, Verdict::Error(ref cause) if cause.contains("upstream 503")));
        assert_eq!(generator.prompts(), vec![BASE.to_string(), BASE.to_string()]);
    }

    #[test]
    fn final_generation_error_is_reported() {
        let generator = ScriptedGenerator::new(vec![GenStep::Error("quota exceeded".to_string()); 2]);
        let correction = CorrectionLoop::new(Box::new(generator), config());
        let result = correction.run(&task(2));
        assert_eq!(result.attempts_used(), 2);
        assert!(result
            .failure_reason()
            .unwrap_or_default()
            .starts_with("generation error: "));
        assert!(result.failure_reason().unwrap_or_default().contains("quota exceeded"));
    }

    #[test]
    fn transient_generation_error_switches_to_fallback_prompt_once() {
        let generator = ScriptedGenerator::new(vec![
            GenStep::Error("Could not convert inline_data to PIL image".to_string()),
            GenStep::NoImage,
            GenStep::Image,
        ]);
        let correction = CorrectionLoop::new(
            Box::new(generator.clone()),
            CorrectionConfig {
                fallback_prompt: Some("Put this garment on a black mannequin.".to_string()),
                ..config()
            },
        );
        let result = correction.run(&task(3));
        assert!(result.is_success());

        let prompts = generator.prompts();
        assert_eq!(prompts[0], BASE);
        assert_eq!(prompts[1], "Put this garment on a black mannequin.");
        assert!(prompts[2].starts_with(BASE));
        assert!(prompts[2].contains("PREVIOUS ATTEMPT FAILED because: no image generated"));
    }

    #[test]
    fn transient_verification_error_is_retried_as_failure() {
        let generator = ScriptedGenerator::new(vec![GenStep::Image; 2]);
        let verifier = ScriptedVerifier::new(vec![
            Err("Could not convert `inline_data` part to text".to_string()),
            Ok("pass: fine now".to_string()),
        ]);
        let correction = CorrectionLoop::new(Box::new(generator.clone()), config())
            .with_verifier(Box::new(verifier.clone()), VERIFY);

        let (result, records) = run_collecting(&correction, &task(4));
        assert!(result.is_success());
        assert_eq!(
            records[0].verdict,
            Verdict::Fail(TRANSIENT_VERIFICATION_ERROR.to_string())
        );
        assert!(generator.prompts()[1].contains(TRANSIENT_VERIFICATION_ERROR));
    }

    #[test]
    fn other_verification_errors_fail_the_attempt() {
        let generator = ScriptedGenerator::new(vec![GenStep::Image]);
        let verifier = ScriptedVerifier::new(vec![Err("403 permission denied".to_string())]);
        let correction = CorrectionLoop::new(Box::new(generator), config())
            .with_verifier(Box::new(verifier), VERIFY);
        let result = correction.run(&task(1));
        assert_eq!(result.attempts_used(), 1);
        assert!(result
            .failure_reason()
            .unwrap_or_default()
            .starts_with("verification error: 403 permission denied"));
    }

    #[test]
    fn inconclusive_verdicts_follow_the_configured_policy() {
        for (policy, expect_success) in [
            (InconclusivePolicy::InferPass, false),
            (InconclusivePolicy::Reject, false),
            (InconclusivePolicy::AssumePass, true),
        ] {
            let generator = ScriptedGenerator::new(vec![GenStep::Image]);
            let verifier = ScriptedVerifier::new(vec![Ok("looks mostly fine".to_string())]);
            let correction = CorrectionLoop::new(
                Box::new(generator),
                CorrectionConfig {
                    inconclusive_policy: policy,
                    ..config()
                },
            )
            .with_verifier(Box::new(verifier), VERIFY);
            let result = correction.run(&task(1));
            assert_eq!(result.is_success(), expect_success, "policy {policy}");
        }
    }

    #[test]
    fn records_keep_the_answer_and_the_settled_verdict() {
        let generator = ScriptedGenerator::new(vec![GenStep::Image]);
        let verifier = ScriptedVerifier::new(vec![Ok("looks mostly fine".to_string())]);
        let correction = CorrectionLoop::new(Box::new(generator), config())
            .with_verifier(Box::new(verifier), VERIFY);

        let (_, records) = run_collecting(&correction, &task(1));
        assert_eq!(
            records[0].verdict,
            Verdict::Inconclusive("looks mostly fine".to_string())
        );
        assert_eq!(
            records[0].resolved,
            Verdict::Fail("looks mostly fine".to_string())
        );
    }

    #[test]
    fn upscaled_images_reach_the_verifier_at_the_target_size() -> anyhow::Result<()> {
        let generator = ScriptedGenerator::new(vec![GenStep::Image]);
        let verifier = ScriptedVerifier::repeating(Ok("PASS".to_string()));
        let correction = CorrectionLoop::new(
            Box::new(generator),
            CorrectionConfig {
                upscale: Some((12, 18)),
                ..config()
            },
        )
        .with_verifier(Box::new(verifier.clone()), VERIFY);

        let result = correction.run(&task(1));
        assert_eq!(verifier.last_images()[0].dimensions()?, (12, 18));
        match result.outcome {
            CorrectionOutcome::Success { image, .. } => {
                assert_eq!(image.mime_type, "image/png");
                assert_eq!(image.dimensions()?, (12, 18));
            }
            other => anyhow::bail!("unexpected outcome {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn setup_errors_abort_with_zero_attempts() {
        let generator = ScriptedGenerator::new(vec![GenStep::Image]);
        let correction = CorrectionLoop::new(Box::new(generator.clone()), config());

        let undecodable = CorrectionTask::new(
            "broken.jpg",
            ImagePart::new("image/jpeg", b"definitely not a jpeg".to_vec()),
            Vec::new(),
            BASE,
            3,
        );
        let empty_prompt = CorrectionTask::new(
            "look.png",
            ImagePart::from_bytes(png_bytes(2, 2)),
            Vec::new(),
            "   ",
            3,
        );
        let zero_attempts = CorrectionTask::new(
            "look.png",
            ImagePart::from_bytes(png_bytes(2, 2)),
            Vec::new(),
            BASE,
            0,
        );

        for task in [undecodable, empty_prompt, zero_attempts] {
            let result = correction.run(&task);
            assert_eq!(result.attempts_used(), 0, "{}", task.label());
            assert!(!result.is_success());
        }
        assert_eq!(generator.calls(), 0);
    }

    #[test]
    fn missing_reference_files_are_setup_errors() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let present = temp.path().join("ideal.png");
        std::fs::write(&present, png_bytes(2, 2))?;
        let missing = temp.path().join("missing.png");

        let loaded = super::load_reference_assets(&[present.clone()])?;
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].mime_type, "image/png");

        let err = super::load_reference_assets(&[present, missing.clone()]).err();
        assert!(matches!(
            err,
            Some(crate::error::CorrectionError::MissingReferenceAsset { ref path }) if *path == missing
        ));
        Ok(())
    }
}
