//! The closed set of job kinds.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::InvalidId;

/// Which workflow definition a job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    /// A gardener's work report: media upload, then attestation.
    SubmitWork,
    /// Certificate mint: metadata, allow-list, transaction, confirmation.
    MintCertificate,
}

impl JobKind {
    pub const ALL: [JobKind; 2] = [JobKind::SubmitWork, JobKind::MintCertificate];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::SubmitWork => "submit-work",
            JobKind::MintCertificate => "mint-certificate",
        }
    }
}

impl core::fmt::Display for JobKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = InvalidId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| InvalidId(format!("JobKind: unknown kind '{s}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_round_trip_through_their_tags() {
        for kind in JobKind::ALL {
            assert_eq!(kind.as_str().parse::<JobKind>().unwrap(), kind);
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }

    #[test]
    fn unknown_tags_are_rejected() {
        assert!("plant-tree".parse::<JobKind>().is_err());
    }
}
