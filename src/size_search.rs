//! Shrink an image to a requested byte count.
//!
//! A bounded binary search over the encoder quality. Each step encodes the
//! whole image once, so the number of round trips is what matters: the loop
//! makes at most `max_iterations + 1` encode calls and then returns whatever
//! it has. The result is a best-effort size, not an exact one; callers get
//! [`SearchOutcome::within_tolerance`] to tell the two apart.

use std::fmt;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::encoder::{EncodeError, Encoder};
use crate::formats::ValidationError;

pub const MIN_QUALITY: u8 = 1;
pub const MAX_QUALITY: u8 = 100;
pub const START_QUALITY: u8 = 50;

/// Knobs of the search. The defaults are the historical 10% band, 8 attempts
/// and a minimum useful bound width of 3 quality steps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchPolicy {
    pub tolerance: f64,
    pub max_iterations: u32,
    pub min_bound_width: u8,
}

impl Default for SearchPolicy {
    fn default() -> Self {
        Self {
            tolerance: 0.1,
            max_iterations: 8,
            min_bound_width: 3,
        }
    }
}

impl SearchPolicy {
    pub fn within_tolerance(&self, size: u64, target: u64) -> bool {
        let ratio = size as f64 / target as f64;
        ratio >= 1.0 - self.tolerance && ratio <= 1.0 + self.tolerance
    }

    // Upper bound on encoder calls for one search
    pub fn max_encodes(&self) -> u32 {
        self.max_iterations + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeUnit {
    Kb,
    Mb,
}

impl SizeUnit {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "KB" => Some(Self::Kb),
            "MB" => Some(Self::Mb),
            _ => None,
        }
    }

    pub fn bytes(self) -> f64 {
        match self {
            Self::Kb => 1024.0,
            Self::Mb => 1024.0 * 1024.0,
        }
    }
}

impl fmt::Display for SizeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Kb => "KB",
            Self::Mb => "MB",
        })
    }
}

/// User-entered target such as `500 KB`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetSize {
    pub value: f64,
    pub unit: SizeUnit,
}

impl TargetSize {
    /// `unit` defaults to MB when absent.
    pub fn parse(value: &str, unit: Option<&str>) -> Result<Self, ValidationError> {
        let value: f64 = value
            .trim()
            .parse()
            .map_err(|_| ValidationError::InvalidTarget)?;
        if !value.is_finite() || value <= 0.0 {
            return Err(ValidationError::InvalidTarget);
        }
        let unit = match unit.map(str::trim).filter(|u| !u.is_empty()) {
            Some(raw) => SizeUnit::parse(raw).ok_or(ValidationError::InvalidTarget)?,
            None => SizeUnit::Mb,
        };
        Ok(Self { value, unit })
    }

    pub fn bytes(&self) -> u64 {
        (self.value * self.unit.bytes()) as u64
    }
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("Target size must be greater than zero")]
    EmptyTarget,
    #[error("Target of {target} bytes is not smaller than the original {original} bytes")]
    TargetNotSmaller { target: u64, original: u64 },
    #[error("Size search cancelled")]
    Cancelled,
    #[error("Encode attempt {attempt} failed: {source}")]
    Encode {
        attempt: u32,
        #[source]
        source: EncodeError,
    },
}

/// What the search settled on.
#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub data: Vec<u8>,
    /// `None` when the format has no quality axis.
    pub quality: Option<u8>,
    pub attempts: u32,
    pub within_tolerance: bool,
}

// Bounds of the search; min <= current <= max at every step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SizeSearchState {
    min_quality: u8,
    max_quality: u8,
    current_quality: u8,
    target_bytes: u64,
}

impl SizeSearchState {
    fn new(target_bytes: u64) -> Self {
        Self {
            min_quality: MIN_QUALITY,
            max_quality: MAX_QUALITY,
            current_quality: START_QUALITY,
            target_bytes,
        }
    }

    fn narrow(&mut self, size: u64) {
        let current = self.current_quality as u16;
        if size > self.target_bytes {
            // too large, lower the quality
            self.max_quality = self.current_quality;
            self.current_quality = ((self.min_quality as u16 + current) / 2) as u8;
        } else {
            // too small, raise it
            self.min_quality = self.current_quality;
            self.current_quality = ((current + self.max_quality as u16) / 2) as u8;
        }
        debug_assert!(self.min_quality <= self.current_quality);
        debug_assert!(self.current_quality <= self.max_quality);
    }

    fn converged(&self, min_width: u8) -> bool {
        self.max_quality - self.min_quality < min_width
    }
}

/// Search for a quality whose output lands within `policy.tolerance` of
/// `target_bytes`.
///
/// Rejects `target_bytes >= original_bytes` before touching the encoder. Any
/// encode failure aborts the search and discards earlier attempts.
/// `cancel` is checked before every encode.
pub async fn reduce_to_target<E: Encoder>(
    encoder: &E,
    original_bytes: u64,
    target_bytes: u64,
    policy: &SearchPolicy,
    cancel: &CancellationToken,
) -> Result<SearchOutcome, SearchError> {
    if target_bytes == 0 {
        return Err(SearchError::EmptyTarget);
    }
    if target_bytes >= original_bytes {
        return Err(SearchError::TargetNotSmaller {
            target: target_bytes,
            original: original_bytes,
        });
    }

    let mut attempts = 0;

    if !encoder.has_quality_axis() {
        let data = attempt(encoder, None, &mut attempts, cancel).await?;
        let within_tolerance = policy.within_tolerance(data.len() as u64, target_bytes);
        return Ok(SearchOutcome {
            data,
            quality: None,
            attempts,
            within_tolerance,
        });
    }

    let mut state = SizeSearchState::new(target_bytes);

    for _ in 0..policy.max_iterations {
        let quality = state.current_quality;
        let data = attempt(encoder, Some(quality), &mut attempts, cancel).await?;
        let size = data.len() as u64;

        debug!(attempt = attempts, quality, size, target = target_bytes, "Size search step");

        if policy.within_tolerance(size, target_bytes) {
            return Ok(SearchOutcome {
                data,
                quality: Some(quality),
                attempts,
                within_tolerance: true,
            });
        }

        state.narrow(size);

        if state.converged(policy.min_bound_width) {
            return Ok(SearchOutcome {
                data,
                quality: Some(quality),
                attempts,
                within_tolerance: false,
            });
        }
    }

    // out of iterations - take whatever the last computed quality gives
    let quality = state.current_quality;
    let data = attempt(encoder, Some(quality), &mut attempts, cancel).await?;
    let within_tolerance = policy.within_tolerance(data.len() as u64, target_bytes);
    Ok(SearchOutcome {
        data,
        quality: Some(quality),
        attempts,
        within_tolerance,
    })
}

async fn attempt<E: Encoder>(
    encoder: &E,
    quality: Option<u8>,
    attempts: &mut u32,
    cancel: &CancellationToken,
) -> Result<Vec<u8>, SearchError> {
    if cancel.is_cancelled() {
        return Err(SearchError::Cancelled);
    }
    *attempts += 1;
    encoder
        .encode(quality)
        .await
        .map_err(|source| SearchError::Encode {
            attempt: *attempts,
            source,
        })
}
