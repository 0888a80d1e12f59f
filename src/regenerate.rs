use crate::api::{SpeechSynthesizer, SynthesisError, SynthesisRequest};
use crate::pipeline::Attempt;
use crate::{logi, logok, logw};

pub const DEFAULT_ROUNDS: u32 = 2;
const SEED_STEP: i64 = 100;

/// Seed used by retry round `round` (0-based).
pub fn retry_seed(base: i64, round: u32) -> i64 {
    base + (i64::from(round) + 1) * SEED_STEP
}

#[derive(Debug, Clone)]
pub struct RegenerationOutcome {
    /// Attempt to persist. Earlier attempts were dropped as soon as a later one arrived.
    pub attempt: Attempt,
    /// Synthesis calls made, including a failed retry.
    pub calls: u32,
    /// Stopped before the rounds ran out because the caller asked to.
    pub interrupted: bool,
}

impl RegenerationOutcome {
    pub fn still_truncated(&self) -> bool {
        self.attempt.is_truncated()
    }
}

/// Re-synthesizes a scene with fresh seeds while its audio looks truncated.
#[derive(Debug, Clone, Copy)]
pub struct RegenerationController {
    pub max_rounds: u32,
}

impl Default for RegenerationController {
    fn default() -> Self {
        Self {
            max_rounds: DEFAULT_ROUNDS,
        }
    }
}

impl RegenerationController {
    pub fn new(max_rounds: u32) -> Self {
        Self { max_rounds }
    }

    /// First synthesis plus up to `max_rounds` retries.
    ///
    /// `before_round` runs ahead of every retry and may return `false` to stop. A failure of
    /// the first call is returned; a failed retry keeps the previous attempt.
    pub async fn run<S, F>(
        &self,
        synth: &S,
        request: &SynthesisRequest,
        narration: &str,
        mut before_round: F,
    ) -> Result<RegenerationOutcome, SynthesisError>
    where
        S: SpeechSynthesizer + ?Sized,
        F: FnMut(u32) -> bool,
    {
        let base_seed = request.voice.seed;
        let output = synth.synthesize(request).await?;
        let mut attempt = Attempt::assess(output, base_seed, narration);
        let mut calls = 1;
        let mut interrupted = false;

        for round in 0..self.max_rounds {
            if !attempt.is_truncated() {
                break;
            }
            if !before_round(round) {
                interrupted = true;
                break;
            }

            let seed = retry_seed(base_seed, round);
            logi(format!(
                "regenerating truncated audio, round {}/{} (seed={})",
                round + 1,
                self.max_rounds,
                seed
            ));
            calls += 1;
            match synth.synthesize(&request.reseeded(seed)).await {
                Ok(output) => {
                    attempt = Attempt::assess(output, seed, narration);
                    if !attempt.is_truncated() {
                        logok(format!("truncation resolved with seed {}", seed));
                    }
                }
                Err(e) => {
                    logw(format!("regeneration round {} failed: {}", round + 1, e));
                    break;
                }
            }
        }

        if attempt.is_truncated() && !interrupted {
            logw(format!(
                "audio still truncated after {} synthesis calls: {}",
                calls, attempt.verdict.detail
            ));
        }

        Ok(RegenerationOutcome {
            attempt,
            calls,
            interrupted,
        })
    }
}
