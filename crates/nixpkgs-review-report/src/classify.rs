//! Outcome classification
//!
//! Every record lands in exactly one [`Bucket`]. Precedence is fixed:
//! broken, blacklisted, skipped, timed out, non-existent, tests, failed,
//! built. "Built" requires the output path to have been verified against the
//! store beforehand (see [`crate::verify_outputs`]); unverified records are
//! failed.

use nixpkgs_review_nix::Attr;
use serde::{Deserialize, Serialize};

/// Outcome of one record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Bucket {
    Broken,
    Blacklisted,
    Skipped,
    TimedOut,
    NonExistent,
    Tests,
    Failed,
    Built,
}

impl Bucket {
    /// All buckets in precedence order
    pub const ALL: [Bucket; 8] = [
        Bucket::Broken,
        Bucket::Blacklisted,
        Bucket::Skipped,
        Bucket::TimedOut,
        Bucket::NonExistent,
        Bucket::Tests,
        Bucket::Failed,
        Bucket::Built,
    ];

    /// Key in the structured report document
    pub fn key(self) -> &'static str {
        match self {
            Bucket::Broken => "broken",
            Bucket::Blacklisted => "blacklisted",
            Bucket::Skipped => "skipped",
            Bucket::TimedOut => "timed-out",
            Bucket::NonExistent => "non-existent",
            Bucket::Tests => "tests",
            Bucket::Failed => "failed",
            Bucket::Built => "built",
        }
    }
}

/// Pick the bucket of a single record
pub fn classify(attr: &Attr) -> Bucket {
    if attr.broken {
        Bucket::Broken
    } else if attr.blacklisted {
        Bucket::Blacklisted
    } else if attr.skipped {
        Bucket::Skipped
    } else if attr.timed_out {
        Bucket::TimedOut
    } else if !attr.exists {
        Bucket::NonExistent
    } else if attr.is_test() {
        Bucket::Tests
    } else if !attr.was_built() {
        Bucket::Failed
    } else {
        Bucket::Built
    }
}

/// Records of one system, split by outcome
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SystemReport {
    pub broken: Vec<Attr>,
    pub blacklisted: Vec<Attr>,
    pub skipped: Vec<Attr>,
    pub timed_out: Vec<Attr>,
    pub non_existent: Vec<Attr>,
    pub tests: Vec<Attr>,
    pub failed: Vec<Attr>,
    pub built: Vec<Attr>,
}

impl SystemReport {
    /// Classify `attrs`, keeping their relative order within each bucket
    pub fn new(attrs: impl IntoIterator<Item = Attr>) -> Self {
        let mut report = SystemReport::default();
        for attr in attrs {
            report.bucket_mut(classify(&attr)).push(attr);
        }
        report
    }

    /// Records in `bucket`
    pub fn bucket(&self, bucket: Bucket) -> &[Attr] {
        match bucket {
            Bucket::Broken => &self.broken,
            Bucket::Blacklisted => &self.blacklisted,
            Bucket::Skipped => &self.skipped,
            Bucket::TimedOut => &self.timed_out,
            Bucket::NonExistent => &self.non_existent,
            Bucket::Tests => &self.tests,
            Bucket::Failed => &self.failed,
            Bucket::Built => &self.built,
        }
    }

    fn bucket_mut(&mut self, bucket: Bucket) -> &mut Vec<Attr> {
        match bucket {
            Bucket::Broken => &mut self.broken,
            Bucket::Blacklisted => &mut self.blacklisted,
            Bucket::Skipped => &mut self.skipped,
            Bucket::TimedOut => &mut self.timed_out,
            Bucket::NonExistent => &mut self.non_existent,
            Bucket::Tests => &mut self.tests,
            Bucket::Failed => &mut self.failed,
            Bucket::Built => &mut self.built,
        }
    }

    /// Bucket name lists for the structured report
    pub fn serialize(&self) -> SystemReportDocument {
        let names = |bucket| {
            self.bucket(bucket)
                .iter()
                .map(|a| a.name.clone())
                .collect::<Vec<_>>()
        };
        SystemReportDocument {
            blacklisted: names(Bucket::Blacklisted),
            broken: names(Bucket::Broken),
            built: names(Bucket::Built),
            failed: names(Bucket::Failed),
            non_existent: names(Bucket::NonExistent),
            skipped: names(Bucket::Skipped),
            tests: names(Bucket::Tests),
            timed_out: names(Bucket::TimedOut),
        }
    }
}

/// Serialized form of a [`SystemReport`]. Fields are declared in key order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemReportDocument {
    pub blacklisted: Vec<String>,
    pub broken: Vec<String>,
    pub built: Vec<String>,
    pub failed: Vec<String>,
    #[serde(rename = "non-existent")]
    pub non_existent: Vec<String>,
    pub skipped: Vec<String>,
    pub tests: Vec<String>,
    #[serde(rename = "timed-out")]
    pub timed_out: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn built(name: &str) -> Attr {
        let mut attr = Attr::new(name, true, false).with_paths(
            format!("/nix/store/out-{name}"),
            format!("/nix/store/drv-{name}.drv"),
        );
        attr.path_verified = Some(true);
        attr
    }

    #[test]
    fn test_precedence() {
        let mut attr = built("hello");
        assert_eq!(classify(&attr), Bucket::Built);

        attr.path_verified = Some(false);
        assert_eq!(classify(&attr), Bucket::Failed);

        attr.name = "nixosTests.hello".to_string();
        assert_eq!(classify(&attr), Bucket::Tests);

        attr.exists = false;
        assert_eq!(classify(&attr), Bucket::NonExistent);

        attr.timed_out = true;
        assert_eq!(classify(&attr), Bucket::TimedOut);

        attr.skipped = true;
        assert_eq!(classify(&attr), Bucket::Skipped);

        attr.blacklisted = true;
        assert_eq!(classify(&attr), Bucket::Blacklisted);

        attr.broken = true;
        assert_eq!(classify(&attr), Bucket::Broken);
    }

    #[test]
    fn test_unverified_is_failed() {
        let mut attr = built("hello");
        attr.path_verified = None;
        assert_eq!(classify(&attr), Bucket::Failed);
    }

    #[test]
    fn test_every_record_lands_in_one_bucket() {
        let mut attrs = Vec::new();
        for bits in 0u8..64 {
            let mut attr = built(&format!("p{bits}"));
            attr.broken = bits & 1 != 0;
            attr.blacklisted = bits & 2 != 0;
            attr.skipped = bits & 4 != 0;
            attr.timed_out = bits & 8 != 0;
            attr.exists = bits & 16 == 0;
            attr.path_verified = Some(bits & 32 == 0);
            attrs.push(attr);
        }

        let report = SystemReport::new(attrs.clone());
        let total: usize = Bucket::ALL.iter().map(|b| report.bucket(*b).len()).sum();
        assert_eq!(total, attrs.len());
        for attr in &attrs {
            let holding: Vec<_> = Bucket::ALL
                .iter()
                .filter(|b| report.bucket(**b).iter().any(|a| a.name == attr.name))
                .collect();
            assert_eq!(holding, vec![&classify(attr)]);
        }
    }

    #[test]
    fn test_serialize_keeps_order_and_keys() {
        let report =
            SystemReport::new(vec![built("b"), built("a"), Attr::new("gone", false, false)]);
        let doc = report.serialize();
        assert_eq!(doc.built, vec!["b", "a"]);
        assert_eq!(doc.non_existent, vec!["gone"]);

        let json = serde_json::to_value(&doc).unwrap();
        let keys: Vec<_> = json.as_object().unwrap().keys().cloned().collect();
        let expected: Vec<_> = {
            let mut keys: Vec<_> = Bucket::ALL.iter().map(|b| b.key().to_string()).collect();
            keys.sort();
            keys
        };
        assert_eq!(keys, expected);
    }
}
