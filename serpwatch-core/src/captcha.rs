//! Optional captcha-solving capability scoped to one run.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum CaptchaError {
    #[error("no captcha solver available")]
    Unavailable,
    #[error("captcha solver {solver} failed: {reason}")]
    Failed { solver: String, reason: String },
}

/// Challenge met on a result page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptchaChallenge {
    pub page_url: String,
    pub site_key: Option<String>,
    pub image: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptchaSolution {
    pub answer: String,
}

/// Backend able to answer captcha challenges.
///
/// `close` may be called more than once and must tolerate it.
#[async_trait]
pub trait CaptchaSolver: Send + Sync {
    fn friendly_name(&self) -> &str;
    fn init(&self) -> bool;
    async fn solve(&self, challenge: &CaptchaChallenge) -> Result<CaptchaSolution, CaptchaError>;
    fn close(&self);
}

#[derive(Clone)]
pub enum CaptchaGate {
    Absent,
    Present(Arc<dyn CaptchaSolver>),
}

impl CaptchaGate {
    /// Initializes `solver` once; a failed init leaves the run without captcha support.
    pub fn initialize(solver: Option<Arc<dyn CaptchaSolver>>) -> Self {
        let Some(solver) = solver else {
            return CaptchaGate::Absent;
        };
        if solver.init() {
            info!(solver = solver.friendly_name(), "captcha solver initialized");
            CaptchaGate::Present(solver)
        } else {
            warn!(
                solver = solver.friendly_name(),
                "failed to initialize captcha solver, continuing without it"
            );
            CaptchaGate::Absent
        }
    }

    pub fn is_present(&self) -> bool {
        matches!(self, CaptchaGate::Present(_))
    }

    pub async fn solve(
        &self,
        challenge: &CaptchaChallenge,
    ) -> Result<CaptchaSolution, CaptchaError> {
        match self {
            CaptchaGate::Absent => Err(CaptchaError::Unavailable),
            CaptchaGate::Present(solver) => solver.solve(challenge).await,
        }
    }
}

impl fmt::Debug for CaptchaGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptchaGate::Absent => f.write_str("Absent"),
            CaptchaGate::Present(solver) => f
                .debug_tuple("Present")
                .field(&solver.friendly_name())
                .finish(),
        }
    }
}

/// Closes the solver when dropped, whichever way the run ends.
#[derive(Debug)]
pub struct CaptchaGuard {
    gate: CaptchaGate,
    released: bool,
}

impl CaptchaGuard {
    pub fn new(gate: CaptchaGate) -> Self {
        Self {
            gate,
            released: false,
        }
    }

    pub fn gate(&self) -> &CaptchaGate {
        &self.gate
    }

    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let CaptchaGate::Present(solver) = &self.gate {
            solver.close();
            info!(solver = solver.friendly_name(), "captcha solver released");
        }
    }
}

impl Drop for CaptchaGuard {
    fn drop(&mut self) {
        self.release();
    }
}
