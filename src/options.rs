//! Configuration structures for the built-in comparisons and calculation variants.

use std::time::Duration;

/// Controls the numeric guards used by the built-in criteria.
#[derive(Clone, Debug)]
pub struct ComparisonOptions {
    /// Lower bound on the prior magnitude when forming relative differences.
    pub relative_floor: f64,
    /// Whether targets are compared on the rayon thread pool.
    pub parallel: bool,
}

impl Default for ComparisonOptions {
    fn default() -> Self {
        Self {
            relative_floor: 1e-12,
            parallel: true,
        }
    }
}

impl ComparisonOptions {
    /// Override the floor applied to the denominator of relative differences.
    pub fn with_relative_floor(mut self, floor: f64) -> Self {
        self.relative_floor = floor.abs();
        self
    }

    /// Evaluate targets sequentially on the calling thread.
    pub fn sequential(mut self) -> Self {
        self.parallel = false;
        self
    }
}

/// Controls how a queued calculation waits for its job.
#[derive(Clone, Debug)]
pub struct QueueOptions {
    /// Time between two state queries.
    pub poll_interval: Duration,
    /// Total time to wait for a terminal state before reporting a timeout.
    /// `None` waits indefinitely.
    pub max_wait: Option<Duration>,
    /// Name of the submission script written into the working directory.
    pub script_name: String,
    /// File, relative to the working directory, holding the job's JSON output.
    pub output_file: String,
    /// Scheduler log captured as the run's diagnostic output. `{job}` is replaced by the job id.
    pub log_file: Option<String>,
    /// Terminal output of the job captured as the run's standard output, same pattern rules.
    pub stdout_file: Option<String>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            max_wait: None,
            script_name: "submit_run.sh".to_string(),
            output_file: "output.json".to_string(),
            log_file: Some("slurm-{job}.out".to_string()),
            stdout_file: Some("terminal.out".to_string()),
        }
    }
}

impl QueueOptions {
    /// Override the interval between scheduler queries. Zero is clamped to one second.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = if interval.is_zero() {
            Duration::from_secs(1)
        } else {
            interval
        };
        self
    }

    /// Give up waiting after `max_wait` and report the run as timed out.
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }

    pub fn with_script_name(mut self, name: impl Into<String>) -> Self {
        self.script_name = name.into();
        self
    }

    pub fn with_output_file(mut self, name: impl Into<String>) -> Self {
        self.output_file = name.into();
        self
    }

    /// Pattern of the scheduler log to capture; `None` disables capture.
    pub fn with_log_file(mut self, pattern: Option<String>) -> Self {
        self.log_file = pattern;
        self
    }

    /// Pattern of the job's terminal output to capture; `None` disables capture.
    pub fn with_stdout_file(mut self, pattern: Option<String>) -> Self {
        self.stdout_file = pattern;
        self
    }
}

/// Configuration of the synthetic decaying-exponential calculation.
#[derive(Clone, Debug)]
pub struct SyntheticOptions {
    /// Target key under which the result is reported.
    pub target: String,
    /// Asymptote approached as the input grows.
    pub offset: f64,
    /// Standard deviation of the Gaussian noise added to each result.
    pub noise: f64,
    /// Seed for the noise generator.
    pub seed: u64,
    /// One-based run index that reports failure, for exercising early exit.
    pub fail_on_run: Option<usize>,
}

impl Default for SyntheticOptions {
    fn default() -> Self {
        Self {
            target: "value".to_string(),
            offset: 1.5,
            noise: 0.0,
            seed: 0,
            fail_on_run: None,
        }
    }
}

impl SyntheticOptions {
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    /// Add zero-mean Gaussian noise with standard deviation `noise`, drawn from a seeded generator.
    pub fn with_noise(mut self, noise: f64, seed: u64) -> Self {
        self.noise = noise.abs();
        self.seed = seed;
        self
    }

    /// Make the `run`-th call to `run` (one-based) report failure.
    pub fn failing_on_run(mut self, run: usize) -> Self {
        self.fail_on_run = Some(run);
        self
    }
}
