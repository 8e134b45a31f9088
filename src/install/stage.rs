use serde::Serialize;
use std::fmt;

/// One unit of the install/update pipeline, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Stage {
    /// Check the install directory and tooling
    VerifyLocalState,
    /// Learn what the latest version looks like
    FetchManifest,
    /// Download changed files
    DownloadDeltas,
    /// Put the downloaded files in place
    ApplyDeltas,
    /// Record the completed install
    Finalize,
}

impl Stage {
    /// Every stage, in execution order
    pub const ALL: [Stage; 5] = [
        Stage::VerifyLocalState,
        Stage::FetchManifest,
        Stage::DownloadDeltas,
        Stage::ApplyDeltas,
        Stage::Finalize,
    ];

    /// Name published on the event stream
    pub fn name(self) -> &'static str {
        match self {
            Stage::VerifyLocalState => "verify",
            Stage::FetchManifest => "fetch-manifest",
            Stage::DownloadDeltas => "download-deltas",
            Stage::ApplyDeltas => "apply-deltas",
            Stage::Finalize => "finalize",
        }
    }

    /// Overall progress when the stage begins
    pub fn start_percent(self) -> f64 {
        match self {
            Stage::VerifyLocalState => 0.0,
            Stage::FetchManifest => 10.0,
            Stage::DownloadDeltas => 60.0,
            Stage::ApplyDeltas => 90.0,
            Stage::Finalize => 100.0,
        }
    }

    /// Highest overall progress the stage may report while running
    pub fn end_percent(self) -> f64 {
        match self {
            Stage::VerifyLocalState => Stage::FetchManifest.start_percent(),
            Stage::FetchManifest => Stage::DownloadDeltas.start_percent(),
            Stage::DownloadDeltas => Stage::ApplyDeltas.start_percent(),
            // 100 is reserved for completion
            Stage::ApplyDeltas => 99.0,
            Stage::Finalize => 100.0,
        }
    }

    /// Map a fraction of this stage's work onto overall progress
    pub fn percent_at(self, fraction: f64) -> f64 {
        let fraction = fraction.clamp(0.0, 1.0);
        self.start_percent() + fraction * (self.end_percent() - self.start_percent())
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
