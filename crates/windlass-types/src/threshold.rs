use serde::{Deserialize, Serialize};

/// Context-wind thresholds, as fractions of the context window.
///
/// Ordering is semantic: `Prepare < Commit < Reset`, matching the raw
/// values 0.60 < 0.70 < 0.80. The memory layer prepares at 0.60,
/// summarises-and-rehydrates at 0.70, and treats 0.80 as the hard line.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ContextThreshold {
    Prepare,
    Commit,
    Reset,
}

impl ContextThreshold {
    /// All thresholds in ascending order.
    pub const ALL: [ContextThreshold; 3] = [
        ContextThreshold::Prepare,
        ContextThreshold::Commit,
        ContextThreshold::Reset,
    ];

    /// The fraction of the context window at which this threshold sits.
    pub fn fraction(self) -> f64 {
        match self {
            ContextThreshold::Prepare => 0.60,
            ContextThreshold::Commit => 0.70,
            ContextThreshold::Reset => 0.80,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thresholds_are_ordered_and_have_expected_fractions() {
        assert!(ContextThreshold::Prepare < ContextThreshold::Commit);
        assert!(ContextThreshold::Commit < ContextThreshold::Reset);
        assert_eq!(ContextThreshold::Prepare.fraction(), 0.60);
        assert_eq!(ContextThreshold::Commit.fraction(), 0.70);
        assert_eq!(ContextThreshold::Reset.fraction(), 0.80);
    }
}
