use std::fmt;

use serde::{Deserialize, Serialize};

/// Terminal classification of one file's processing attempt.
///
/// The display form doubles as the destination directory name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingOutcome {
    Processed,
    Error,
}

impl ProcessingOutcome {
    pub fn dir_name(self) -> &'static str {
        match self {
            ProcessingOutcome::Processed => "processed",
            ProcessingOutcome::Error => "error",
        }
    }
}

impl fmt::Display for ProcessingOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}
