pub mod fleet;
pub mod judge;
pub mod recovery;
pub mod scanner;

pub use fleet::{FleetScanner, ScannerHandle};
pub use judge::{Action, FailureJudge, Verdict};
pub use recovery::{apply_verdict, AppliedVerdict, JobDisposition};
pub use scanner::{ScanReport, ScannerState, ScannerSummary, WorkerScanner};
