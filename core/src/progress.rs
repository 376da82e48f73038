use std::fmt;

/// Fraction of a transfer that has been written.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Progress {
    /// Bytes written over declared length, two decimal places, in `[0, 1]`.
    Ratio(f32),
    /// The server did not declare a length; only the running byte count is known.
    Indeterminate { bytes: u64 },
}

impl Progress {
    pub const COMPLETE: Progress = Progress::Ratio(1.0);

    pub fn from_bytes(written: u64, declared_len: i64) -> Self {
        if declared_len <= 0 {
            return Progress::Indeterminate { bytes: written };
        }
        let ratio = written as f64 / declared_len as f64;
        Progress::Ratio(round_ratio(ratio))
    }

    pub fn ratio(&self) -> Option<f32> {
        match self {
            Progress::Ratio(value) => Some(*value),
            Progress::Indeterminate { .. } => None,
        }
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Progress::Ratio(value) => write!(f, "{:.2}%", value * 100.0),
            Progress::Indeterminate { bytes } => write!(f, "{} bytes", bytes),
        }
    }
}

fn round_ratio(ratio: f64) -> f32 {
    let clamped = ratio.clamp(0.0, 1.0);
    ((clamped * 100.0).round() / 100.0) as f32
}
